use serde::{Deserialize, Serialize};

/// Counters of one coherent (snooping) cache.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoherentCache {
    pub hits: u64,
    pub misses: u64,
    pub read_access: u64,
    pub write_access: u64,
}

impl std::ops::AddAssign for CoherentCache {
    fn add_assign(&mut self, other: Self) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.read_access += other.read_access;
        self.write_access += other.write_access;
    }
}

/// Counters of the serializing bus.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    /// coherence transactions issued by grantees
    pub transactions: u64,

    pub bus_rd: u64,
    pub bus_rd_x: u64,
    pub bus_upd: u64,
    pub bus_rd_upd: u64,

    /// payload bytes carried by bus operations
    pub data_bytes: u64,
    /// block bytes flushed by snooping peers
    pub bytes_read_by_peers: u64,
    /// block bytes written back around the bus on eviction or flush
    pub writeback_bytes: u64,
}

impl std::ops::AddAssign for Bus {
    fn add_assign(&mut self, other: Self) {
        self.transactions += other.transactions;
        self.bus_rd += other.bus_rd;
        self.bus_rd_x += other.bus_rd_x;
        self.bus_upd += other.bus_upd;
        self.bus_rd_upd += other.bus_rd_upd;
        self.data_bytes += other.data_bytes;
        self.bytes_read_by_peers += other.bytes_read_by_peers;
        self.writeback_bytes += other.writeback_bytes;
    }
}
