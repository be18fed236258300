pub mod custom;
pub mod simple;
pub mod waypart;

pub use custom::CustomLlc;
pub use simple::SimpleLlc;
pub use waypart::WaypartLlc;

use crate::config;
use crate::packet::Packet;

/// Outcome of one `send`, reported back to the level wrapper.
///
/// Contention (`mshr_unavailable`, `set_unavailable`) is a normal status the
/// caller retries on, never an error.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub hit: bool,
    pub read_miss: bool,
    pub write_miss: bool,
    pub mshr_hit: bool,
    pub mshr_unavailable: bool,
    pub set_unavailable: bool,
    pub mshr_allocated: bool,
    pub evictions: u64,
    /// memory traffic this access induced (dirty victims)
    pub requests: Vec<Packet>,
}

impl StatusReport {
    pub fn update_send_stats(&self, stats: &mut stats::Cache) {
        if self.write_miss || self.read_miss {
            stats.total_miss += 1;
            if self.write_miss {
                stats.write_miss += 1;
            } else {
                stats.read_miss += 1;
            }
        }
        if self.mshr_hit {
            stats.mshr_hit += 1;
        }
        if self.mshr_unavailable {
            stats.mshr_unavailable += 1;
        }
        if self.set_unavailable {
            stats.set_unavailable += 1;
        }
        stats.evictions += self.evictions;
    }
}

/// A set-associative, MSHR-backed cache level.
pub trait LastLevelCache: std::fmt::Debug {
    /// Process one request.
    ///
    /// Returns `false` on transient contention, leaving `req` untouched for
    /// the caller to retry. A write miss that allocates is coerced to a
    /// read-for-fill in place, keeping the write intent on the allocated
    /// line.
    fn send(&mut self, req: &mut Packet, report: &mut StatusReport) -> bool;

    /// Memory finished the fill covering `req`'s block: unlock the line and
    /// retire the MSHR entry.
    fn callback(&mut self, req: &Packet);

    /// MSHR/locked-line consistency; run in debug builds and tests.
    fn check_invariants(&self) {}
}

/// Construct the level implementation selected by the QoS policy.
#[must_use]
pub fn build(config: &config::Llc) -> Box<dyn LastLevelCache> {
    match config.qos {
        config::Qos::Basic => Box::new(SimpleLlc::new(config)),
        config::Qos::WayPartitioning => Box::new(WaypartLlc::new(config)),
        config::Qos::Custom => Box::new(CustomLlc::new(config)),
    }
}
