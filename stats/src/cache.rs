use serde::{Deserialize, Serialize};

/// Counters of one set-associative cache level.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub read_access: u64,
    pub write_access: u64,
    pub total_access: u64,

    pub read_miss: u64,
    pub write_miss: u64,
    pub total_miss: u64,
    pub evictions: u64,

    pub mshr_hit: u64,
    pub mshr_unavailable: u64,
    pub set_unavailable: u64,
}

impl Cache {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.total_access == 0 {
            return 0.0;
        }
        let hits = self.total_access - self.total_miss;
        hits as f64 / self.total_access as f64
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        self.read_access += other.read_access;
        self.write_access += other.write_access;
        self.total_access += other.total_access;
        self.read_miss += other.read_miss;
        self.write_miss += other.write_miss;
        self.total_miss += other.total_miss;
        self.evictions += other.evictions;
        self.mshr_hit += other.mshr_hit;
        self.mshr_unavailable += other.mshr_unavailable;
        self.set_unavailable += other.set_unavailable;
    }
}
