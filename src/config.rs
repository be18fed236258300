use super::address;
use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{what} must be a power of two (got {got})")]
    NotPowerOfTwo { what: &'static str, got: u64 },

    #[error("block size {block} exceeds cache size {cache}")]
    BlockExceedsCache { block: u64, cache: u64 },

    #[error("geometry leaves no ways: {cache} bytes / ({sets} sets x {block} bytes)")]
    NoWays { cache: u64, sets: u64, block: u64 },

    #[error("cacheable window [{lo:#x}, {hi:#x}) is empty")]
    EmptyWindow { lo: address, hi: address },

    #[error("cacheable window [{lo:#x}, {hi:#x}) is not aligned to the {block} byte block size")]
    UnalignedWindow { lo: address, hi: address, block: u64 },

    #[error("at least one MSHR entry is required")]
    NoMshrEntries,

    #[error("at least one core is required")]
    NoCores,
}

/// Coherence controller flavour, fixed at construction.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::EnumIter,
    strum::Display,
    clap::ValueEnum,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// five-state write-invalidate
    Mesi,
    /// five-state write-update
    Dragon,
    /// write-update with a fixed per-cache invalidate threshold
    Hybrid,
    /// write-update with a learned per-block invalidate threshold
    Adapt,
}

impl Protocol {
    /// Does this controller carry the invalidate-counter machinery?
    #[must_use]
    pub fn is_hybrid(self) -> bool {
        matches!(self, Protocol::Hybrid | Protocol::Adapt)
    }
}

/// Quality-of-service policy of the last-level cache, fixed at construction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    Basic,
    WayPartitioning,
    Custom,
}

/// Geometry and tunables of the per-core coherent caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coherence {
    pub protocol: Protocol,

    /// log2 of the block size in bytes
    pub block_offset_bits: u32,
    /// log2 of the number of sets
    pub set_bits: u32,
    /// log2 of the total capacity in bytes
    pub cache_size_bits: u32,

    /// `[lo, hi)` window the protocol applies to; everything else bypasses
    pub cacheable_lo: address,
    pub cacheable_hi: address,

    /// initial invalidate counter T (Hybrid and Adapt)
    pub invalidate_threshold: i32,
    /// write-run length below which Adapt raises T rather than lowering it
    pub invalidation_ratio: i32,
    /// saturation ceiling for learned thresholds
    pub threshold_max: i32,
}

impl Default for Coherence {
    fn default() -> Self {
        Self {
            protocol: Protocol::Mesi,
            block_offset_bits: 5,
            set_bits: 4,
            cache_size_bits: 15,
            cacheable_lo: 0x8000,
            cacheable_hi: 0xa000,
            invalidate_threshold: 4,
            invalidation_ratio: 3,
            threshold_max: 16,
        }
    }
}

impl Coherence {
    #[must_use]
    pub fn block_size(&self) -> u32 {
        1 << self.block_offset_bits
    }

    #[must_use]
    pub fn cacheable(&self) -> std::ops::Range<address> {
        self.cacheable_lo..self.cacheable_hi
    }

    pub fn validate(&self) -> Result<(), Error> {
        let block = u64::from(self.block_size());
        let sets = 1u64 << self.set_bits;
        let cache = 1u64 << self.cache_size_bits;
        if cache < block {
            return Err(Error::BlockExceedsCache { block, cache });
        }
        if cache / (sets * block) == 0 {
            return Err(Error::NoWays { cache, sets, block });
        }
        if self.cacheable_lo >= self.cacheable_hi {
            return Err(Error::EmptyWindow {
                lo: self.cacheable_lo,
                hi: self.cacheable_hi,
            });
        }
        if self.cacheable_lo % block != 0 || self.cacheable_hi % block != 0 {
            return Err(Error::UnalignedWindow {
                lo: self.cacheable_lo,
                hi: self.cacheable_hi,
                block,
            });
        }
        Ok(())
    }
}

/// Geometry and tunables of one memory-side cache level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Llc {
    /// total capacity in bytes
    pub size: u64,
    pub associativity: u64,
    pub block_size: u64,
    /// MSHR depth
    pub mshr_entries: usize,
    pub qos: Qos,
    /// way partitions (requestors) under the way-partitioning policy
    pub partitions: usize,
}

impl Default for Llc {
    fn default() -> Self {
        Self {
            size: 1 << 22,
            associativity: 8,
            block_size: 64,
            mshr_entries: 16,
            qos: Qos::Basic,
            partitions: 2,
        }
    }
}

impl Llc {
    pub fn validate(&self) -> Result<(), Error> {
        for (what, got) in [
            ("cache size", self.size),
            ("block size", self.block_size),
            ("associativity", self.associativity),
        ] {
            if got == 0 || got & (got - 1) != 0 {
                return Err(Error::NotPowerOfTwo { what, got });
            }
        }
        if self.size < self.block_size {
            return Err(Error::BlockExceedsCache {
                block: self.block_size,
                cache: self.size,
            });
        }
        if self.mshr_entries == 0 {
            return Err(Error::NoMshrEntries);
        }
        Ok(())
    }
}

/// Per-level access latencies of the L1/L2/L3 chain, in cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latencies(pub [u64; 3]);

impl Default for Latencies {
    fn default() -> Self {
        Self([4, 12, 31])
    }
}

impl Latencies {
    /// Accumulated latency from the core down to and including `level`.
    #[must_use]
    pub fn accumulated(&self, level: usize) -> u64 {
        self.0[..=level].iter().sum()
    }
}

/// Full simulator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub num_cores: usize,
    pub coherence: Coherence,
    pub llc: Llc,
    pub latencies: Latencies,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_cores: 2,
            coherence: Coherence::default(),
            llc: Llc::default(),
            latencies: Latencies::default(),
        }
    }
}

impl Config {
    #[must_use]
    pub fn with_cores(num_cores: usize, protocol: Protocol) -> Self {
        Self {
            num_cores,
            coherence: Coherence {
                protocol,
                ..Coherence::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.num_cores == 0 {
            return Err(Error::NoCores);
        }
        self.coherence.validate()?;
        self.llc.validate()
    }
}
