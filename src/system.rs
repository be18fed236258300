use super::address;
use crate::bus::Bus;
use crate::cache::CoherentCache;
use crate::config::{self, Config};
use crate::dram::Memory;
use crate::events::{Event, EventQueue};
use crate::invariants;
use crate::packet::Packet;
use std::collections::VecDeque;
use std::ops::Range;

/// A small multi-core system: one snooping cache per core, the serializing
/// bus, and a functional memory behind it.
///
/// The bus owns no cache references and the caches own no bus reference;
/// this registry routes between them by index, which also makes the
/// self-snoop exclusion a property of one loop instead of every controller.
#[derive(Debug)]
pub struct System {
    pub clock: u64,
    pub bus: Bus,
    pub caches: Vec<CoherentCache>,
    pub mem: Memory,
    events: EventQueue,
    responses: Vec<VecDeque<Packet>>,
    window: Range<address>,
    block_size: u32,
}

impl System {
    pub fn new(config: &Config) -> Result<Self, config::Error> {
        config.validate()?;
        let coherence = &config.coherence;
        let caches = (0..config.num_cores)
            .map(|id| CoherentCache::new(id, coherence))
            .collect();
        let bus = Bus::new(
            coherence.block_size(),
            coherence.cacheable(),
            coherence.invalidate_threshold,
            coherence.threshold_max,
        );
        Ok(Self {
            clock: 0,
            bus,
            caches,
            mem: Memory::new(),
            events: EventQueue::new(),
            responses: vec![VecDeque::new(); config.num_cores],
            window: coherence.cacheable(),
            block_size: coherence.block_size(),
        })
    }

    /// CPU-side timing port of `core`. A `false` return means the cache is
    /// busy and the caller retries later.
    pub fn recv_timing_req(&mut self, core: usize, pkt: Packet) -> bool {
        let now = self.clock;
        self.caches[core].recv_timing_req(pkt, &mut self.bus, &mut self.events, now)
    }

    /// Responses delivered to `core`, in completion order.
    pub fn pop_response(&mut self, core: usize) -> Option<Packet> {
        self.responses[core].pop_front()
    }

    /// Functional (atomic) access for inspection: acts on backing memory
    /// directly, without timing, arbitration or protocol participation.
    pub fn recv_functional(&mut self, pkt: &mut Packet) {
        if pkt.is_write() {
            self.mem.write(pkt.addr, &pkt.data);
        } else {
            pkt.data = self.mem.read(pkt.addr, pkt.size);
        }
        pkt.make_response();
    }

    /// Debug window into backing memory, bypassing all caches.
    #[must_use]
    pub fn functional_read(&self, addr: address, size: u32) -> Vec<u8> {
        self.mem.read(addr, size)
    }

    /// Advance one cycle and drain everything due.
    pub fn tick(&mut self) {
        self.clock += 1;
        while let Some(event) = self.events.pop_due(self.clock) {
            self.process(event);
            if cfg!(debug_assertions) {
                invariants::check_coherence(&self.caches, &self.bus);
            }
        }
    }

    /// Is any transaction or response still in flight?
    #[must_use]
    pub fn busy(&self) -> bool {
        !self.events.is_empty() || self.caches.iter().any(|cache| cache.blocked)
    }

    /// Run until quiescent; panics after `limit` cycles without finishing.
    pub fn run_until_idle(&mut self, limit: u64) -> u64 {
        let start = self.clock;
        while self.busy() {
            assert!(
                self.clock - start < limit,
                "system still busy after {limit} cycles"
            );
            self.tick();
        }
        self.clock - start
    }

    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        stats::Stats {
            cycles: self.clock,
            caches: self.caches.iter().map(|cache| cache.stats.clone()).collect(),
            bus: self.bus.stats.clone(),
            levels: Vec::new(),
        }
    }

    fn process(&mut self, event: Event) {
        match event {
            Event::BusGrant => {
                if let Some(id) = self.bus.take_grant() {
                    self.caches[id].handle_bus_grant(&mut self.bus, &mut self.events, self.clock);
                }
            }
            Event::MemDispatch => self.dispatch_mem_requests(),
            Event::CpuResp { cache_id } => {
                while let Some(pkt) = self.caches[cache_id].pop_cpu_resp() {
                    log::trace!("core[{cache_id}] <- {pkt}");
                    self.responses[cache_id].push_back(pkt);
                }
            }
            Event::MemResponse { packet } => {
                let id = self
                    .bus
                    .current_granted
                    .expect("memory response without a transaction in progress");
                self.caches[id].handle_mem_response(
                    packet,
                    &mut self.bus,
                    &mut self.events,
                    self.clock,
                );
                self.drain_writebacks();
            }
        }
    }

    /// One bus transaction: snoop every peer except the originator, then
    /// run the memory leg (or synthesize the write acknowledgement).
    fn dispatch_mem_requests(&mut self) {
        while let Some(req) = self.bus.pop_mem_req() {
            self.bus.clear_wires();

            for id in 0..self.caches.len() {
                if id == req.originator {
                    // a cache never snoops its own request
                    continue;
                }
                self.caches[id].snoop(&req.packet, req.op, &mut self.bus);
            }
            // snoop flushes land in memory before the memory leg reads it
            self.drain_writebacks();

            if req.to_memory {
                let resp = self.memory_access(req.packet);
                self.events
                    .schedule(self.clock + 1, Event::MemResponse { packet: resp });
            } else {
                let mut pkt = req.packet;
                assert!(pkt.is_write(), "synthesized response for a read");
                pkt.make_response();
                self.caches[req.originator].handle_mem_response(
                    pkt,
                    &mut self.bus,
                    &mut self.events,
                    self.clock,
                );
                self.drain_writebacks();
            }
        }
    }

    fn drain_writebacks(&mut self) {
        for (addr, data) in self.bus.drain_writebacks() {
            self.mem.write(addr, &data);
        }
    }

    /// The functional memory leg of a dispatched transaction.
    fn memory_access(&mut self, pkt: Packet) -> Packet {
        if pkt.is_write() {
            self.mem.write(pkt.addr, &pkt.data);
            if self.window.contains(&pkt.addr) {
                // a partial write miss also needs the rest of its block
                let block_addr = pkt.block_addr(self.block_size);
                let mut resp =
                    Packet::read(block_addr, self.block_size).with_requestor(pkt.requestor);
                resp.data = self.mem.read(block_addr, self.block_size);
                resp.make_response();
                resp
            } else {
                let mut resp = pkt;
                resp.make_response();
                resp
            }
        } else {
            let mut resp = pkt;
            resp.data = self.mem.read(resp.addr, resp.size);
            resp.make_response();
            resp
        }
    }
}

#[cfg(test)]
mod tests {
    use super::System;
    use crate::cache::State;
    use crate::config::{Config, Protocol};
    use crate::packet::Packet;

    const LIMIT: u64 = 1_000;

    fn system(protocol: Protocol) -> System {
        System::new(&Config::with_cores(2, protocol)).unwrap()
    }

    /// Drive one access to completion, retrying while the port is busy.
    fn access(sys: &mut System, core: usize, pkt: Packet) -> Packet {
        let start = sys.clock;
        loop {
            if sys.recv_timing_req(core, pkt.clone()) {
                break;
            }
            sys.tick();
            assert!(sys.clock - start < LIMIT, "port never accepted the request");
        }
        loop {
            if let Some(resp) = sys.pop_response(core) {
                return resp;
            }
            sys.tick();
            assert!(sys.clock - start < LIMIT, "access never completed");
        }
    }

    fn read(sys: &mut System, core: usize, addr: u64, size: u32) -> Vec<u8> {
        let resp = access(sys, core, Packet::read(addr, size).with_requestor(core));
        assert!(resp.is_response() && resp.is_read());
        resp.data
    }

    fn read_byte(sys: &mut System, core: usize, addr: u64) -> u8 {
        read(sys, core, addr, 1)[0]
    }

    fn write(sys: &mut System, core: usize, addr: u64, data: &[u8]) {
        let resp = access(
            sys,
            core,
            Packet::write(addr, data.to_vec()).with_requestor(core),
        );
        assert!(resp.is_response() && resp.is_write());
    }

    fn state_of(sys: &System, core: usize, addr: u64) -> State {
        sys.caches[core]
            .store
            .find(addr)
            .map_or(State::Invalid, |line| line.state)
    }

    #[test]
    fn mesi_read_miss_installs_exclusive() {
        let mut sys = system(Protocol::Mesi);
        read_byte(&mut sys, 0, 0x8000);
        assert_eq!(state_of(&sys, 0, 0x8000), State::Exclusive);
        assert_eq!(state_of(&sys, 1, 0x8000), State::Invalid);
    }

    #[test]
    fn mesi_modified_line_is_flushed_for_a_reader() {
        // core 0 installs exclusively, dirties the line, then core 1 reads:
        // the dirty data travels through memory and both end up shared-clean
        let mut sys = system(Protocol::Mesi);
        read_byte(&mut sys, 0, 0x8000);
        write(&mut sys, 0, 0x8000, &[42]);
        assert_eq!(state_of(&sys, 0, 0x8000), State::Modified);

        assert_eq!(read_byte(&mut sys, 1, 0x8000), 42);
        assert_eq!(state_of(&sys, 0, 0x8000), State::SharedClean);
        assert_eq!(state_of(&sys, 1, 0x8000), State::SharedClean);
        assert_eq!(sys.functional_read(0x8000, 1), vec![42]);
    }

    #[test]
    fn mesi_write_to_shared_line_invalidates_peers() {
        let mut sys = system(Protocol::Mesi);
        read_byte(&mut sys, 0, 0x8000);
        read_byte(&mut sys, 1, 0x8000);
        assert_eq!(state_of(&sys, 0, 0x8000), State::SharedClean);

        write(&mut sys, 1, 0x8000, &[7]);
        assert_eq!(state_of(&sys, 1, 0x8000), State::Modified);
        assert_eq!(state_of(&sys, 0, 0x8000), State::Invalid);
        assert_eq!(sys.bus.stats.bus_rd_x, 1);

        // the upgraded owner now writes silently
        let before = sys.bus.stats.transactions;
        write(&mut sys, 1, 0x8000, &[8]);
        assert_eq!(sys.bus.stats.transactions, before);
        assert_eq!(read_byte(&mut sys, 0, 0x8000), 8);
    }

    #[test]
    fn writer_does_not_snoop_its_own_invalidation() {
        // the most tempting bug: a BusRdX must not knock out the line the
        // writer itself is installing
        let mut sys = system(Protocol::Mesi);
        write(&mut sys, 0, 0x8000, &[1]);
        assert_eq!(state_of(&sys, 0, 0x8000), State::Modified);
        assert_eq!(read_byte(&mut sys, 0, 0x8000), 1);
    }

    #[test]
    fn write_then_read_returns_written_value_under_all_protocols() {
        for protocol in [
            Protocol::Mesi,
            Protocol::Dragon,
            Protocol::Hybrid,
            Protocol::Adapt,
        ] {
            let mut sys = system(protocol);
            write(&mut sys, 0, 0x8010, &[0xcd]);
            read_byte(&mut sys, 1, 0x8010);
            assert_eq!(read_byte(&mut sys, 0, 0x8010), 0xcd, "{protocol:?}");
        }
    }

    #[test]
    fn dragon_write_miss_updates_rather_than_invalidates() {
        let mut sys = system(Protocol::Dragon);
        read_byte(&mut sys, 0, 0x8000);
        write(&mut sys, 0, 0x8000, &[42]);
        assert_eq!(state_of(&sys, 0, 0x8000), State::Modified);

        assert_eq!(read_byte(&mut sys, 1, 0x8000), 42);
        assert_eq!(state_of(&sys, 0, 0x8000), State::SharedModified);
        assert_eq!(state_of(&sys, 1, 0x8000), State::SharedClean);
    }

    #[test]
    fn dragon_update_propagation() {
        let mut sys = system(Protocol::Dragon);
        read_byte(&mut sys, 0, 0x8040);
        read_byte(&mut sys, 1, 0x8040);
        assert_eq!(state_of(&sys, 0, 0x8040), State::SharedClean);
        assert_eq!(state_of(&sys, 1, 0x8040), State::SharedClean);

        write(&mut sys, 0, 0x8040, &[7]);
        assert_eq!(state_of(&sys, 0, 0x8040), State::SharedModified);
        write(&mut sys, 0, 0x8040, &[8]);
        assert_eq!(state_of(&sys, 0, 0x8040), State::SharedModified);

        // updates arrived without any ownership transfer
        assert_eq!(sys.bus.stats.bus_upd, 2);
        assert_eq!(sys.bus.stats.bus_rd_x, 0);
        assert_eq!(read_byte(&mut sys, 1, 0x8040), 8);
        assert_eq!(state_of(&sys, 1, 0x8040), State::SharedClean);
    }

    #[test]
    fn hybrid_escapes_to_invalidate_after_threshold() {
        let mut config = Config::with_cores(2, Protocol::Hybrid);
        config.coherence.invalidate_threshold = 2;
        let mut sys = System::new(&config).unwrap();

        read_byte(&mut sys, 0, 0x8000);
        read_byte(&mut sys, 1, 0x8000);

        // two writes fit the update budget
        write(&mut sys, 0, 0x8000, &[1]);
        write(&mut sys, 0, 0x8000, &[2]);
        assert_eq!(sys.bus.stats.bus_upd, 2);
        assert_eq!(state_of(&sys, 0, 0x8000), State::SharedModified);
        assert_eq!(state_of(&sys, 1, 0x8000), State::SharedClean);

        // the third one escapes
        write(&mut sys, 0, 0x8000, &[3]);
        assert_eq!(sys.bus.stats.bus_rd_x, 1);
        assert_eq!(state_of(&sys, 0, 0x8000), State::Modified);
        assert_eq!(state_of(&sys, 1, 0x8000), State::Invalid);

        // and the fourth is silent
        let before = sys.bus.stats.transactions;
        write(&mut sys, 0, 0x8000, &[4]);
        assert_eq!(sys.bus.stats.transactions, before);
        assert_eq!(read_byte(&mut sys, 1, 0x8000), 4);
    }

    #[test]
    fn ghost_reacquisition_starts_with_a_fresh_budget() {
        let mut config = Config::with_cores(2, Protocol::Hybrid);
        config.coherence.invalidate_threshold = 2;
        let mut sys = System::new(&config).unwrap();

        read_byte(&mut sys, 0, 0x8000);
        read_byte(&mut sys, 1, 0x8000);
        // core 0 escapes after two updates, leaving core 1 a ghost slot
        for value in 1..=3u8 {
            write(&mut sys, 0, 0x8000, &[value]);
        }
        assert_eq!(state_of(&sys, 1, 0x8000), State::Invalid);
        {
            // poison the ghost's tracking state; none of it may survive
            // the next install
            let ghost = sys.caches[1].store.find_mut(0x8000).unwrap();
            ghost.invalidate_counter = 0;
            ghost.accessed_since_update = true;
        }

        assert_eq!(read_byte(&mut sys, 1, 0x8000), 3);
        let line = sys.caches[1].store.find(0x8000).unwrap();
        assert_eq!(line.invalidate_counter, 2);
        assert!(!line.accessed_since_update);

        // with the budget restored, core 1 broadcasts instead of escaping
        write(&mut sys, 1, 0x8000, &[4]);
        assert_eq!(sys.bus.stats.bus_upd, 3);
        assert_eq!(sys.bus.stats.bus_rd_x, 1);
        assert_eq!(state_of(&sys, 1, 0x8000), State::SharedModified);
        assert_eq!(read_byte(&mut sys, 0, 0x8000), 4);
    }

    #[test]
    fn hybrid_remote_reads_keep_updates_flowing() {
        let mut config = Config::with_cores(2, Protocol::Hybrid);
        config.coherence.invalidate_threshold = 2;
        let mut sys = System::new(&config).unwrap();

        read_byte(&mut sys, 0, 0x8000);
        read_byte(&mut sys, 1, 0x8000);

        // interleaved reads raise the remote-access wire, restoring the
        // budget before each decrement, so updates never degrade
        for value in 1..=6u8 {
            write(&mut sys, 0, 0x8000, &[value]);
            assert_eq!(read_byte(&mut sys, 1, 0x8000), value);
        }
        assert_eq!(sys.bus.stats.bus_rd_x, 0);
        assert_eq!(state_of(&sys, 0, 0x8000), State::SharedModified);
    }

    #[test]
    fn adapt_raises_threshold_after_short_write_run() {
        let mut config = Config::with_cores(2, Protocol::Adapt);
        config.coherence.invalidate_threshold = 4;
        config.coherence.invalidation_ratio = 3;
        let mut sys = System::new(&config).unwrap();

        read_byte(&mut sys, 0, 0x8000);
        read_byte(&mut sys, 1, 0x8000);

        write(&mut sys, 0, 0x8000, &[1]);
        write(&mut sys, 0, 0x8000, &[2]);
        // core 1 takes over: core 0's run ends at 2 < 3, so the block's
        // threshold rises
        write(&mut sys, 1, 0x8000, &[3]);
        assert_eq!(sys.bus.threshold(0x8000), 5);
    }

    #[test]
    fn adapt_lowers_threshold_after_long_write_run() {
        let mut config = Config::with_cores(2, Protocol::Adapt);
        config.coherence.invalidate_threshold = 4;
        config.coherence.invalidation_ratio = 3;
        let mut sys = System::new(&config).unwrap();

        read_byte(&mut sys, 0, 0x8000);
        read_byte(&mut sys, 1, 0x8000);

        for value in 1..=4u8 {
            write(&mut sys, 0, 0x8000, &[value]);
        }
        // core 1's copy kept absorbing updates, so its reads hit locally;
        // only its own write rings the bus and ends core 0's run at 4 >= 3
        write(&mut sys, 1, 0x8000, &[5]);
        assert_eq!(sys.bus.threshold(0x8000), 3);
        assert_eq!(read_byte(&mut sys, 0, 0x8000), 5);
    }

    #[test]
    fn eviction_writes_dirty_blocks_back() {
        // 32 byte blocks, 2 sets, 128 bytes total: two ways per set
        let mut config = Config::with_cores(2, Protocol::Dragon);
        config.coherence.set_bits = 1;
        config.coherence.cache_size_bits = 7;
        let mut sys = System::new(&config).unwrap();

        let set_stride = 0x40;
        write(&mut sys, 0, 0x8000, &[0xaa]);
        write(&mut sys, 0, 0x8000 + set_stride, &[0xbb]);
        // third block in the same set pushes out the oldest dirty line
        write(&mut sys, 0, 0x8000 + 2 * set_stride, &[0xcc]);

        assert_eq!(state_of(&sys, 0, 0x8000), State::Invalid);
        assert_eq!(sys.functional_read(0x8000, 1), vec![0xaa]);
        // and it can be fetched again
        assert_eq!(read_byte(&mut sys, 0, 0x8000), 0xaa);
    }

    #[test]
    fn functional_accesses_touch_memory_without_timing() {
        let mut sys = system(Protocol::Mesi);
        let mut poke = Packet::write(0x8000, vec![0x5a]);
        sys.recv_functional(&mut poke);
        assert!(poke.is_response());
        assert_eq!(sys.clock, 0);

        let mut peek = Packet::read(0x8000, 1);
        sys.recv_functional(&mut peek);
        assert_eq!(peek.data, vec![0x5a]);
        // nothing was installed anywhere
        assert!(sys.caches[0].store.find(0x8000).is_none());
    }

    #[test]
    fn out_of_window_accesses_bypass_the_protocol() {
        let mut sys = system(Protocol::Mesi);
        write(&mut sys, 0, 0x100, &[9]);
        assert_eq!(read_byte(&mut sys, 1, 0x100), 9);
        assert!(sys.caches[0].store.find(0x100).is_none());
        assert!(sys.caches[1].store.find(0x100).is_none());
        // bypass traffic is not a coherence transaction
        assert_eq!(sys.bus.stats.transactions, 0);
    }

    #[test]
    fn blocking_front_end_refuses_second_request() {
        let mut sys = system(Protocol::Mesi);
        assert!(sys.recv_timing_req(0, Packet::read(0x8000, 1)));
        // the first request is still in flight
        assert!(!sys.recv_timing_req(0, Packet::read(0x8020, 1)));
        sys.run_until_idle(LIMIT);
        assert!(sys.pop_response(0).is_some());
        // unblocked again
        assert!(sys.recv_timing_req(0, Packet::read(0x8020, 1)));
        sys.run_until_idle(LIMIT);
    }

    #[test]
    fn contended_bus_serializes_fifo() {
        let mut sys = system(Protocol::Mesi);
        assert!(sys.recv_timing_req(0, Packet::read(0x8000, 1).with_requestor(0)));
        assert!(sys.recv_timing_req(1, Packet::read(0x8100, 1).with_requestor(1)));
        sys.run_until_idle(LIMIT);
        assert!(sys.pop_response(0).is_some());
        assert!(sys.pop_response(1).is_some());
        assert_eq!(sys.bus.stats.transactions, 2);
    }

    #[test]
    fn four_cores_converge_on_latest_value() {
        let mut sys = System::new(&Config::with_cores(4, Protocol::Dragon)).unwrap();
        for core in 0..4 {
            read_byte(&mut sys, core, 0x8080);
        }
        for (round, core) in [(1u8, 1usize), (2, 2), (3, 3), (4, 0)] {
            write(&mut sys, core, 0x8080, &[round]);
            for reader in 0..4 {
                assert_eq!(read_byte(&mut sys, reader, 0x8080), round);
            }
        }
    }
}
