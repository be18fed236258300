#![allow(clippy::missing_panics_doc)]

pub mod cache;
pub mod coherence;

pub use cache::Cache;
pub use coherence::{Bus, CoherentCache};

use serde::{Deserialize, Serialize};

/// All counters collected over one simulation.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    /// cycles simulated
    pub cycles: u64,
    /// per-core coherent cache counters
    pub caches: Vec<CoherentCache>,
    /// shared bus counters
    pub bus: Bus,
    /// per-level counters of the memory-side cache chain, if one was simulated
    pub levels: Vec<Cache>,
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        for (mine, theirs) in self.caches.iter_mut().zip(other.caches) {
            *mine += theirs;
        }
        self.bus += other.bus;
        for (mine, theirs) in self.levels.iter_mut().zip(other.levels) {
            *mine += theirs;
        }
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "cycles: {}", self.cycles)?;
        for (id, cache) in self.caches.iter().enumerate() {
            writeln!(
                f,
                "cache[{id}]: {} hits / {} misses ({} reads, {} writes)",
                cache.hits, cache.misses, cache.read_access, cache.write_access
            )?;
        }
        writeln!(
            f,
            "bus: {} transactions ({} bytes, {} flushed by peers)",
            self.bus.transactions, self.bus.data_bytes, self.bus.bytes_read_by_peers
        )
    }
}
