use super::simple::{Eviction, SimpleLlc};
use super::{LastLevelCache, StatusReport};
use crate::config;
use crate::packet::Packet;

/// Baseline level with clean-preferred victim selection: the oldest clean
/// unlocked line goes first, so evictions avoid writeback traffic until the
/// set holds nothing but dirty lines.
#[derive(Debug)]
pub struct CustomLlc {
    inner: SimpleLlc,
}

impl CustomLlc {
    #[must_use]
    pub fn new(config: &config::Llc) -> Self {
        Self {
            inner: SimpleLlc::with_eviction(config, Eviction::CleanFirst),
        }
    }
}

impl LastLevelCache for CustomLlc {
    fn send(&mut self, req: &mut Packet, report: &mut StatusReport) -> bool {
        self.inner.send(req, report)
    }

    fn callback(&mut self, req: &Packet) {
        self.inner.callback(req);
    }

    fn check_invariants(&self) {
        self.inner.check_invariants();
    }
}
