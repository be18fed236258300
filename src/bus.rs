use super::address;
use crate::events::{Event, EventQueue};
use crate::fifo::Fifo;
use crate::packet::{BusOp, Packet};
use std::ops::Range;

/// A queued bus transaction, waiting for its one-tick dispatch delay.
#[derive(Debug)]
pub struct MemRequest {
    pub packet: Packet,
    /// forward to memory after snooping, or synthesize a write response
    pub to_memory: bool,
    pub originator: usize,
    pub op: BusOp,
}

/// The shared, serialized bus.
///
/// Exactly one cache is granted at any instant. The grantee issues one bus
/// operation; all peers snoop it before memory sees it; then the grantee
/// releases. Grants and dispatches are delayed one tick so that snoops never
/// run inside the call stack that requested them.
#[derive(Debug)]
pub struct Bus {
    request_queue: Fifo<usize>,
    pub current_granted: Option<usize>,
    grant_pending: bool,

    mem_req_queue: Fifo<MemRequest>,

    /// raised by any snooper holding the block in a non-Invalid state
    pub shared_wire: bool,
    /// raised by a snooper that accessed its copy since the last update
    pub remote_access_wire: bool,

    /// block writes staged by snoop flushes and evictions, drained to memory
    /// right after the handler that produced them
    writebacks: Vec<(address, Box<[u8]>)>,

    /// learned invalidate thresholds, one per block of the cacheable window
    update_thresholds: Vec<i32>,
    threshold_max: i32,

    window: Range<address>,
    pub block_size: u32,

    pub stats: stats::Bus,
}

impl Bus {
    #[must_use]
    pub fn new(
        block_size: u32,
        window: Range<address>,
        initial_threshold: i32,
        threshold_max: i32,
    ) -> Self {
        let blocks = ((window.end - window.start) / u64::from(block_size)) as usize;
        Self {
            request_queue: Fifo::new(None),
            current_granted: None,
            grant_pending: false,
            mem_req_queue: Fifo::new(None),
            shared_wire: false,
            remote_access_wire: false,
            writebacks: Vec::new(),
            update_thresholds: vec![initial_threshold; blocks],
            threshold_max,
            window,
            block_size,
            stats: stats::Bus::default(),
        }
    }

    #[must_use]
    pub fn in_window(&self, addr: address) -> bool {
        self.window.contains(&addr)
    }

    /// Queue for bus access. The grant fires one tick later if the bus is
    /// idle; otherwise it waits for the current grantee's release.
    pub fn request(&mut self, cache_id: usize, events: &mut EventQueue, now: u64) {
        log::debug!("bus: access request from {cache_id}");
        self.request_queue.enqueue(cache_id);
        if self.current_granted.is_none() && !self.grant_pending {
            self.grant_pending = true;
            events.schedule(now + 1, Event::BusGrant);
        }
    }

    /// Promote the next queued requestor, if any.
    pub fn take_grant(&mut self) -> Option<usize> {
        self.grant_pending = false;
        assert!(
            self.current_granted.is_none(),
            "grant while a transaction is in progress"
        );
        let cache_id = self.request_queue.dequeue()?;
        log::debug!("bus: granting {cache_id}");
        self.current_granted = Some(cache_id);
        Some(cache_id)
    }

    pub fn release(&mut self, cache_id: usize, events: &mut EventQueue, now: u64) {
        log::debug!("bus: release from {cache_id}");
        assert_eq!(
            self.current_granted,
            Some(cache_id),
            "release by a cache that was not granted"
        );
        self.current_granted = None;
        if !self.request_queue.is_empty() && !self.grant_pending {
            self.grant_pending = true;
            events.schedule(now + 1, Event::BusGrant);
        }
    }

    /// Issue the grantee's bus operation. Snoops and the memory leg run at
    /// the dispatch event one tick later.
    pub fn send_mem_req(
        &mut self,
        packet: Packet,
        to_memory: bool,
        op: BusOp,
        events: &mut EventQueue,
        now: u64,
    ) {
        let originator = self
            .current_granted
            .expect("bus operation without a grant");
        if self.in_window(packet.addr) {
            self.stats.transactions += 1;
            self.stats.data_bytes += u64::from(packet.size);
            match op {
                BusOp::BusRd => self.stats.bus_rd += 1,
                BusOp::BusRdX => self.stats.bus_rd_x += 1,
                BusOp::BusUpd => self.stats.bus_upd += 1,
                BusOp::BusRdUpd => self.stats.bus_rd_upd += 1,
            }
        }
        log::debug!("bus: {op:?} {packet} from {originator} (to_memory={to_memory})");
        self.mem_req_queue.enqueue(MemRequest {
            packet,
            to_memory,
            originator,
            op,
        });
        events.schedule(now + 1, Event::MemDispatch);
    }

    pub fn pop_mem_req(&mut self) -> Option<MemRequest> {
        self.mem_req_queue.dequeue()
    }

    /// Both hint wires drop before each transaction's snoop round.
    pub fn clear_wires(&mut self) {
        self.shared_wire = false;
        self.remote_access_wire = false;
    }

    /// Stage a block write for a capacity eviction. Writebacks bypass
    /// arbitration and are never snooped.
    pub fn push_writeback(&mut self, block_addr: address, data: &[u8]) {
        log::debug!("bus: writeback of {:#x}", block_addr);
        self.stats.writeback_bytes += data.len() as u64;
        self.writebacks.push((block_addr, data.into()));
    }

    /// Stage a block write for a snoop-induced flush; the requesting peer
    /// reads these bytes off the bus.
    pub fn push_flush(&mut self, block_addr: address, data: &[u8]) {
        log::debug!("bus: snoop flush of {:#x}", block_addr);
        self.stats.bytes_read_by_peers += data.len() as u64;
        self.stats.writeback_bytes += data.len() as u64;
        self.writebacks.push((block_addr, data.into()));
    }

    pub fn drain_writebacks(&mut self) -> Vec<(address, Box<[u8]>)> {
        std::mem::take(&mut self.writebacks)
    }

    fn block_number(&self, addr: address) -> usize {
        assert!(self.in_window(addr), "{addr:#x} outside the shared window");
        ((addr >> self.block_offset()) - (self.window.start >> self.block_offset())) as usize
    }

    fn block_offset(&self) -> u32 {
        self.block_size.trailing_zeros()
    }

    /// Current invalidate threshold for the block of `addr`.
    #[must_use]
    pub fn threshold(&self, addr: address) -> i32 {
        self.update_thresholds[self.block_number(addr)]
    }

    /// A short write run ended: updates were being consumed, favor them.
    pub fn raise_threshold(&mut self, addr: address) {
        let max = self.threshold_max;
        let block = self.block_number(addr);
        let t = &mut self.update_thresholds[block];
        *t = (*t + 1).min(max);
    }

    /// A long write run ended: updates went unread, favor invalidation.
    pub fn lower_threshold(&mut self, addr: address) {
        let block = self.block_number(addr);
        let t = &mut self.update_thresholds[block];
        *t = (*t - 1).max(0);
    }
}

#[cfg(test)]
mod tests {
    use super::Bus;
    use crate::events::{Event, EventQueue};

    fn bus() -> Bus {
        Bus::new(32, 0x8000..0xa000, 4, 16)
    }

    #[test]
    fn grants_in_fifo_order() {
        let mut bus = bus();
        let mut events = EventQueue::new();
        bus.request(2, &mut events, 0);
        bus.request(0, &mut events, 0);
        bus.request(1, &mut events, 0);
        // a single grant event is pending, no matter how many requests queued
        assert_eq!(events.len(), 1);
        assert_eq!(events.pop_due(1), Some(Event::BusGrant));

        assert_eq!(bus.take_grant(), Some(2));
        bus.release(2, &mut events, 1);
        assert_eq!(events.pop_due(2), Some(Event::BusGrant));
        assert_eq!(bus.take_grant(), Some(0));
        bus.release(0, &mut events, 2);
        assert_eq!(events.pop_due(3), Some(Event::BusGrant));
        assert_eq!(bus.take_grant(), Some(1));
    }

    #[test]
    #[should_panic(expected = "grant while a transaction is in progress")]
    fn refuses_double_grant() {
        let mut bus = bus();
        let mut events = EventQueue::new();
        bus.request(0, &mut events, 0);
        bus.request(1, &mut events, 0);
        bus.take_grant();
        bus.take_grant();
    }

    #[test]
    #[should_panic(expected = "release by a cache that was not granted")]
    fn refuses_foreign_release() {
        let mut bus = bus();
        let mut events = EventQueue::new();
        bus.request(0, &mut events, 0);
        bus.take_grant();
        bus.release(1, &mut events, 1);
    }

    #[test]
    fn thresholds_saturate() {
        let mut bus = bus();
        let addr = 0x8040;
        for _ in 0..40 {
            bus.raise_threshold(addr);
        }
        assert_eq!(bus.threshold(addr), 16);
        for _ in 0..40 {
            bus.lower_threshold(addr);
        }
        assert_eq!(bus.threshold(addr), 0);
        // neighbouring blocks are independent
        assert_eq!(bus.threshold(0x8060), 4);
    }

    #[test]
    fn writebacks_are_staged_and_drained() {
        let mut bus = bus();
        bus.push_writeback(0x8000, &[1; 32]);
        bus.push_flush(0x8020, &[2; 32]);
        let drained = bus.drain_writebacks();
        assert_eq!(drained.len(), 2);
        assert!(bus.drain_writebacks().is_empty());
        assert_eq!(bus.stats.writeback_bytes, 64);
        assert_eq!(bus.stats.bytes_read_by_peers, 32);
    }
}
