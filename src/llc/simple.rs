use super::{LastLevelCache, StatusReport};
use crate::address;
use crate::config;
use crate::packet::{Kind, Packet};
use std::collections::HashMap;

/// One line of the level. A locked line is reserved for an in-flight fill
/// and immune to eviction until the memory response arrives.
#[derive(Debug, Clone)]
pub(crate) struct Line {
    pub(crate) addr: address,
    pub(crate) tag: u64,
    pub(crate) lock: bool,
    pub(crate) dirty: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Eviction {
    /// oldest unlocked line
    Lru,
    /// oldest clean unlocked line, dirty ones only as a last resort
    CleanFirst,
}

/// Baseline set-associative cache level with associative MSHRs.
///
/// Sets keep their lines in LRU order (front is oldest; hits move to the
/// back). Misses allocate a locked placeholder immediately and register an
/// MSHR entry; duplicate misses to the same block coalesce onto it.
#[derive(Debug)]
pub struct SimpleLlc {
    assoc: usize,
    block_size: u64,
    mshr_limit: usize,

    index_mask: u64,
    index_offset: u32,
    tag_offset: u32,

    sets: HashMap<u64, Vec<Line>>,
    /// aligned block addresses with an outstanding fill
    mshrs: Vec<address>,

    eviction: Eviction,
}

impl SimpleLlc {
    #[must_use]
    pub fn new(config: &config::Llc) -> Self {
        Self::with_eviction(config, Eviction::Lru)
    }

    pub(crate) fn with_eviction(config: &config::Llc, eviction: Eviction) -> Self {
        config.validate().expect("invalid cache configuration");
        let num_sets = config.size / (config.block_size * config.associativity);
        assert!(num_sets > 0, "no sets left after dividing up the capacity");
        Self {
            assoc: config.associativity as usize,
            block_size: config.block_size,
            mshr_limit: config.mshr_entries,
            index_mask: num_sets - 1,
            index_offset: config.block_size.trailing_zeros(),
            tag_offset: num_sets.trailing_zeros() + config.block_size.trailing_zeros(),
            sets: HashMap::new(),
            mshrs: Vec::new(),
            eviction,
        }
    }

    fn get_index(&self, addr: address) -> u64 {
        (addr >> self.index_offset) & self.index_mask
    }

    fn get_tag(&self, addr: address) -> u64 {
        addr >> self.tag_offset
    }

    fn align(&self, addr: address) -> address {
        addr & !(self.block_size - 1)
    }

    fn hit_mshr(&self, addr: address) -> Option<usize> {
        let aligned = self.align(addr);
        self.mshrs.iter().position(|&entry| entry == aligned)
    }
}

impl LastLevelCache for SimpleLlc {
    fn send(&mut self, req: &mut Packet, report: &mut StatusReport) -> bool {
        let index = self.get_index(req.addr);
        let tag = self.get_tag(req.addr);
        let aligned = self.align(req.addr);
        let eviction = self.eviction;

        self.sets.entry(index).or_default();

        // hit: tag present and already filled
        {
            let set = self.sets.get_mut(&index).unwrap();
            if let Some(pos) = set.iter().position(|line| line.tag == tag && !line.lock) {
                let mut line = set.remove(pos);
                line.dirty |= req.is_write();
                set.push(line);
                report.hit = true;
                return true;
            }
            // a locked line with this tag is an outstanding fill; the MSHR
            // probe below coalesces onto it
        }

        if req.is_write() {
            report.write_miss = true;
        } else {
            report.read_miss = true;
        }

        let dirty = req.is_write();

        if self.hit_mshr(req.addr).is_some() {
            report.mshr_hit = true;
            if dirty {
                let set = self.sets.get_mut(&index).unwrap();
                if let Some(line) = set.iter_mut().find(|line| line.tag == tag) {
                    line.dirty = true;
                }
            }
            return true;
        }

        if self.mshrs.len() == self.mshr_limit {
            report.mshr_unavailable = true;
            return false;
        }

        let assoc = self.assoc;
        let set = self.sets.get_mut(&index).unwrap();
        if set.len() >= assoc && set.iter().all(|line| line.lock) {
            // nowhere for the fill to land
            report.set_unavailable = true;
            return false;
        }

        if set.len() >= assoc {
            let victim_pos = match eviction {
                Eviction::Lru => set.iter().position(|line| !line.lock),
                Eviction::CleanFirst => set
                    .iter()
                    .position(|line| !line.lock && !line.dirty)
                    .or_else(|| set.iter().position(|line| !line.lock)),
            };
            let Some(pos) = victim_pos else {
                return false;
            };
            let victim = set.remove(pos);
            report.evictions += 1;
            if victim.dirty {
                report
                    .requests
                    .push(Packet::write(victim.addr, vec![0; self.block_size as usize]));
            }
        }

        // the fill itself is a read; the write intent survives on the line.
        // A stalled request stays untouched so the caller can retry it as a
        // write.
        if dirty {
            req.kind = Kind::ReadReq;
        }
        set.push(Line {
            addr: aligned,
            tag,
            lock: true,
            dirty,
        });
        self.mshrs.push(aligned);
        report.mshr_allocated = true;
        true
    }

    fn callback(&mut self, req: &Packet) {
        let aligned = self.align(req.addr);
        let Some(pos) = self.mshrs.iter().position(|&entry| entry == aligned) else {
            return;
        };
        self.mshrs.remove(pos);

        let index = self.get_index(req.addr);
        let tag = self.get_tag(req.addr);
        if let Some(set) = self.sets.get_mut(&index) {
            if let Some(line) = set.iter_mut().find(|line| line.tag == tag) {
                line.lock = false;
            }
        }
    }

    fn check_invariants(&self) {
        for (index, set) in &self.sets {
            let mut seen = std::collections::HashSet::new();
            for line in set {
                assert!(seen.insert(line.tag), "duplicate tag in set {index}");
                if line.lock {
                    assert!(
                        self.mshrs.contains(&line.addr),
                        "locked line {:#x} without an MSHR entry",
                        line.addr
                    );
                }
            }
        }
        for &entry in &self.mshrs {
            let set = self
                .sets
                .get(&self.get_index(entry))
                .expect("MSHR entry for an empty set");
            let line = set
                .iter()
                .find(|line| line.tag == self.get_tag(entry))
                .expect("MSHR entry without a line");
            assert!(line.lock, "MSHR entry references an unlocked line");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SimpleLlc;
    use crate::config;
    use crate::llc::{LastLevelCache, StatusReport};
    use crate::packet::Packet;

    /// 2 sets x 4 ways x 64 byte blocks.
    fn config(mshr_entries: usize) -> config::Llc {
        config::Llc {
            size: 512,
            associativity: 4,
            block_size: 64,
            mshr_entries,
            qos: config::Qos::Basic,
            partitions: 2,
        }
    }

    fn send(llc: &mut SimpleLlc, mut pkt: Packet) -> (bool, StatusReport) {
        let mut report = StatusReport::default();
        let handled = llc.send(&mut pkt, &mut report);
        llc.check_invariants();
        (handled, report)
    }

    #[test]
    fn miss_then_fill_then_hit() {
        let mut llc = SimpleLlc::new(&config(4));
        let (handled, report) = send(&mut llc, Packet::read(0x1000, 8));
        assert!(handled && report.read_miss && report.mshr_allocated);

        // still locked: a second access coalesces instead of hitting
        let (handled, report) = send(&mut llc, Packet::read(0x1008, 8));
        assert!(handled && report.mshr_hit && !report.hit);

        llc.callback(&Packet::read(0x1000, 64));
        let (handled, report) = send(&mut llc, Packet::read(0x1010, 8));
        assert!(handled && report.hit);
    }

    #[test]
    fn mshr_coalesces_concurrent_misses() {
        let mut llc = SimpleLlc::new(&config(2));
        let (_, first) = send(&mut llc, Packet::read(0x2000, 8));
        assert!(first.mshr_allocated);

        // back-to-back misses to the same block do not allocate again
        let (handled, second) = send(&mut llc, Packet::read(0x2008, 8));
        assert!(handled && second.mshr_hit && !second.mshr_allocated);
        let (handled, third) = send(&mut llc, Packet::read(0x2030, 8));
        assert!(handled && third.mshr_hit && !third.mshr_allocated);

        llc.callback(&Packet::read(0x2000, 64));
        let (_, after) = send(&mut llc, Packet::read(0x2000, 8));
        assert!(after.hit);
    }

    #[test]
    fn write_intent_survives_the_coalesced_fill() {
        let mut llc = SimpleLlc::new(&config(4));
        send(&mut llc, Packet::read(0x3000, 8));
        // a write joining the outstanding fill marks the line dirty
        let (_, report) = send(&mut llc, Packet::write(0x3008, vec![1; 8]));
        assert!(report.mshr_hit && report.write_miss);
        llc.callback(&Packet::read(0x3000, 64));

        // pushing the line out must now write it back
        let stride = 512; // same set, next tag
        for i in 1..4 {
            let (_, r) = send(&mut llc, Packet::read(0x3000 + i * stride, 8));
            llc.callback(&Packet::read(0x3000 + i * stride, 64));
            assert!(r.mshr_allocated);
        }
        let (_, report) = send(&mut llc, Packet::read(0x3000 + 4 * stride, 8));
        assert_eq!(report.evictions, 1);
        assert_eq!(report.requests.len(), 1);
        assert!(report.requests[0].is_write());
        assert_eq!(report.requests[0].addr, 0x3000);
    }

    #[test]
    fn stalled_writes_keep_their_intent() {
        let mut llc = SimpleLlc::new(&config(1));
        send(&mut llc, Packet::read(0x1000, 8));

        // the stall must hand the packet back unmodified
        let mut pkt = Packet::write(0x5000, vec![1; 8]);
        let mut report = StatusReport::default();
        assert!(!llc.send(&mut pkt, &mut report));
        assert!(report.mshr_unavailable);
        assert!(pkt.is_write());

        // retried verbatim after the fill, the write intent reaches the line
        llc.callback(&Packet::read(0x1000, 64));
        let mut report = StatusReport::default();
        assert!(llc.send(&mut pkt, &mut report));
        llc.check_invariants();
        assert!(report.mshr_allocated && report.write_miss);
        assert!(pkt.is_read());
        llc.callback(&Packet::read(0x5000, 64));

        // the dirty bit proves it: pushing the line out writes it back
        let stride = 512;
        for i in 1..4u64 {
            send(&mut llc, Packet::read(0x5000 + i * stride, 8));
            llc.callback(&Packet::read(0x5000 + i * stride, 64));
        }
        let (_, report) = send(&mut llc, Packet::read(0x5000 + 4 * stride, 8));
        assert_eq!(report.requests.len(), 1);
        assert_eq!(report.requests[0].addr, 0x5000);
    }

    #[test]
    fn mshr_exhaustion_stalls() {
        let mut llc = SimpleLlc::new(&config(2));
        send(&mut llc, Packet::read(0x1000, 8));
        send(&mut llc, Packet::read(0x5000, 8));
        let (handled, report) = send(&mut llc, Packet::read(0x9000, 8));
        assert!(!handled && report.mshr_unavailable);

        // a fill frees the entry and the stalled miss goes through
        llc.callback(&Packet::read(0x1000, 64));
        let (handled, report) = send(&mut llc, Packet::read(0x9000, 8));
        assert!(handled && report.mshr_allocated);
    }

    #[test]
    fn set_full_of_locked_lines_stalls() {
        let mut llc = SimpleLlc::new(&config(8));
        let stride = 512;
        // four outstanding fills occupy every way of set 0
        for i in 0..4u64 {
            let (handled, report) = send(&mut llc, Packet::read(0x1000 + i * stride, 8));
            assert!(handled && report.mshr_allocated);
        }
        let (handled, report) = send(&mut llc, Packet::read(0x1000 + 4 * stride, 8));
        assert!(!handled && report.set_unavailable);

        // one completed fill is enough
        llc.callback(&Packet::read(0x1000, 64));
        let (handled, report) = send(&mut llc, Packet::read(0x1000 + 4 * stride, 8));
        assert!(handled && report.mshr_allocated);
        assert_eq!(report.evictions, 1);
    }

    #[test]
    fn clean_evictions_cost_no_memory_traffic() {
        let mut llc = SimpleLlc::new(&config(8));
        let stride = 512;
        for i in 0..4u64 {
            send(&mut llc, Packet::read(0x1000 + i * stride, 8));
            llc.callback(&Packet::read(0x1000 + i * stride, 64));
        }
        let (_, report) = send(&mut llc, Packet::read(0x1000 + 4 * stride, 8));
        assert_eq!(report.evictions, 1);
        assert!(report.requests.is_empty());
    }

    #[test]
    fn lru_evicts_the_oldest_line() {
        let mut llc = SimpleLlc::new(&config(8));
        let stride = 512;
        for i in 0..4u64 {
            send(&mut llc, Packet::read(0x1000 + i * stride, 8));
            llc.callback(&Packet::read(0x1000 + i * stride, 64));
        }
        // touch the oldest line so the second-oldest becomes the victim
        let (_, report) = send(&mut llc, Packet::read(0x1000, 8));
        assert!(report.hit);

        send(&mut llc, Packet::read(0x1000 + 4 * stride, 8));
        let (_, report) = send(&mut llc, Packet::read(0x1000, 8));
        assert!(report.hit, "recently used line was evicted");
        let (_, report) = send(&mut llc, Packet::read(0x1000 + stride, 8));
        assert!(report.read_miss, "oldest line should have been the victim");
    }
}
