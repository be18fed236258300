use super::{LastLevelCache, StatusReport};
use crate::address;
use crate::config;
use crate::packet::{Kind, Packet};
use bitvec::BitArr;
use std::collections::HashMap;

/// Ways owned by one requestor.
pub type WayMask = BitArr!(for 64);

#[derive(Debug, Clone)]
struct Line {
    addr: address,
    tag: u64,
    lock: bool,
    dirty: bool,
    way: usize,
}

/// Way-partitioned cache level.
///
/// Every requestor owns a fixed subset of the ways. Lookups are global (any
/// requestor may hit a line another one installed), but allocation and
/// victim selection stay inside the requestor's partition, so one noisy
/// core cannot evict another core's working set.
#[derive(Debug)]
pub struct WaypartLlc {
    assoc: usize,
    block_size: u64,
    mshr_limit: usize,

    index_mask: u64,
    index_offset: u32,
    tag_offset: u32,

    sets: HashMap<u64, Vec<Line>>,
    /// ways in use per set
    occupied: HashMap<u64, WayMask>,
    partitions: Vec<WayMask>,
    mshrs: Vec<address>,
}

impl WaypartLlc {
    #[must_use]
    pub fn new(config: &config::Llc) -> Self {
        config.validate().expect("invalid cache configuration");
        let assoc = config.associativity as usize;
        assert!(assoc <= 64, "way masks cover at most 64 ways");
        assert!(config.partitions >= 1, "at least one partition is required");
        assert!(
            config.partitions <= assoc,
            "more partitions than ways to hand out"
        );

        // deal the ways round robin so every partition gets a fair share
        let mut partitions = vec![WayMask::ZERO; config.partitions];
        for way in 0..assoc {
            partitions[way % config.partitions].set(way, true);
        }

        let num_sets = config.size / (config.block_size * config.associativity);
        assert!(num_sets > 0, "no sets left after dividing up the capacity");
        Self {
            assoc,
            block_size: config.block_size,
            mshr_limit: config.mshr_entries,
            index_mask: num_sets - 1,
            index_offset: config.block_size.trailing_zeros(),
            tag_offset: num_sets.trailing_zeros() + config.block_size.trailing_zeros(),
            sets: HashMap::new(),
            occupied: HashMap::new(),
            partitions,
            mshrs: Vec::new(),
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

impl LastLevelCache for WaypartLlc {
    fn send(&mut self, req: &mut Packet, report: &mut StatusReport) -> bool {
        let index = self.get_index(req.addr);
        let tag = self.get_tag(req.addr);
        let aligned = self.align(req.addr);
        let mask = self.partitions[req.requestor % self.partitions.len()];

        self.sets.entry(index).or_default();
        self.occupied.entry(index).or_default();

        {
            let set = self.sets.get_mut(&index).unwrap();
            if let Some(pos) = set.iter().position(|line| line.tag == tag && !line.lock) {
                let mut line = set.remove(pos);
                line.dirty |= req.is_write();
                set.push(line);
                report.hit = true;
                return true;
            }
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

        let occupied = *self.occupied.get(&index).unwrap();
        let free_way = (0..self.assoc).find(|&way| mask[way] && !occupied[way]);
        let way = match free_way {
            Some(way) => way,
            None => {
                // partition full: evict its oldest unlocked line
                let set = self.sets.get_mut(&index).unwrap();
                let Some(pos) = set
                    .iter()
                    .position(|line| !line.lock && mask[line.way])
                else {
                    report.set_unavailable = true;
                    return false;
                };
                let victim = set.remove(pos);
                report.evictions += 1;
                if victim.dirty {
                    report
                        .requests
                        .push(Packet::write(victim.addr, vec![0; self.block_size as usize]));
                }
                victim.way
            }
        };

        // coerce to a read-for-fill only once the allocation is certain; a
        // stalled request stays untouched so the caller can retry it as a
        // write
        if dirty {
            req.kind = Kind::ReadReq;
        }
        let set = self.sets.get_mut(&index).unwrap();
        set.push(Line {
            addr: aligned,
            tag,
            lock: true,
            dirty,
            way,
        });
        self.occupied.get_mut(&index).unwrap().set(way, true);
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
            assert!(set.len() <= self.assoc);
            let occupied = self.occupied.get(index).copied().unwrap_or_default();
            let mut seen = std::collections::HashSet::new();
            for line in set {
                assert!(seen.insert(line.tag), "duplicate tag in set {index}");
                assert!(occupied[line.way], "line on a way not marked occupied");
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
    use super::WaypartLlc;
    use crate::config;
    use crate::llc::{LastLevelCache, StatusReport};
    use crate::packet::Packet;

    /// 2 sets x 4 ways x 64 byte blocks, two partitions of two ways each.
    fn llc() -> WaypartLlc {
        WaypartLlc::new(&config::Llc {
            size: 512,
            associativity: 4,
            block_size: 64,
            mshr_entries: 8,
            qos: config::Qos::WayPartitioning,
            partitions: 2,
        })
    }

    fn send(llc: &mut WaypartLlc, mut pkt: Packet) -> (bool, StatusReport) {
        let mut report = StatusReport::default();
        let handled = llc.send(&mut pkt, &mut report);
        llc.check_invariants();
        (handled, report)
    }

    fn fill(llc: &mut WaypartLlc, requestor: usize, addr: u64) -> StatusReport {
        let (handled, report) = send(llc, Packet::read(addr, 8).with_requestor(requestor));
        assert!(handled);
        llc.callback(&Packet::read(addr, 64));
        report
    }

    #[test]
    fn partitions_evict_only_their_own_lines() {
        let mut llc = llc();
        let stride = 512;

        // requestor 0 fills its two ways of set 0, requestor 1 one of its own
        fill(&mut llc, 0, 0x1000);
        fill(&mut llc, 0, 0x1000 + stride);
        fill(&mut llc, 1, 0x1000 + 2 * stride);

        // requestor 0 overflows its partition: one of its own lines goes,
        // requestor 1's line survives
        let report = fill(&mut llc, 0, 0x1000 + 3 * stride);
        assert_eq!(report.evictions, 1);
        let (_, peer) = send(&mut llc, Packet::read(0x1000 + 2 * stride, 8).with_requestor(1));
        assert!(peer.hit);
    }

    #[test]
    fn hits_cross_partition_boundaries() {
        let mut llc = llc();
        fill(&mut llc, 0, 0x1000);
        let (_, report) = send(&mut llc, Packet::read(0x1000, 8).with_requestor(1));
        assert!(report.hit);
    }

    #[test]
    fn partition_full_of_locked_lines_stalls() {
        let mut llc = llc();
        let stride = 512;
        // two outstanding fills exhaust requestor 0's ways in set 0
        send(&mut llc, Packet::read(0x1000, 8).with_requestor(0));
        send(&mut llc, Packet::read(0x1000 + stride, 8).with_requestor(0));

        let (handled, report) = send(&mut llc, Packet::read(0x1000 + 2 * stride, 8).with_requestor(0));
        assert!(!handled && report.set_unavailable);

        // the other partition is unaffected
        let (handled, report) = send(&mut llc, Packet::read(0x1000 + 3 * stride, 8).with_requestor(1));
        assert!(handled && report.mshr_allocated);

        // and a completed fill unblocks the stalled one
        llc.callback(&Packet::read(0x1000, 64));
        let (handled, report) = send(&mut llc, Packet::read(0x1000 + 2 * stride, 8).with_requestor(0));
        assert!(handled && report.mshr_allocated);
    }
}
