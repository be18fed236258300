use super::storage::{Geometry, TagStore};
use super::State;
use crate::address;
use crate::bus::Bus;
use crate::config::{self, Protocol};
use crate::events::{Event, EventQueue};
use crate::packet::{BusOp, Packet};
use std::collections::VecDeque;
use std::ops::Range;

/// One per-core snooping cache.
///
/// The front-end is strictly blocking: a single CPU request is in flight at
/// a time, and a refused request is the caller's to retry. The protocol
/// flavour only changes how the four coherent handlers react; everything
/// else (tag store, response queue, bus handshake) is shared.
#[derive(Debug)]
pub struct CoherentCache {
    pub id: usize,
    pub protocol: Protocol,
    pub store: TagStore,
    cacheable: Range<address>,

    pub(crate) invalidate_threshold: i32,
    pub(crate) invalidation_ratio: i32,

    pub blocked: bool,
    /// the CPU request currently waiting on the bus
    pub(crate) request: Option<Packet>,
    resp_queue: VecDeque<Packet>,

    pub stats: stats::CoherentCache,
}

impl CoherentCache {
    #[must_use]
    pub fn new(id: usize, config: &config::Coherence) -> Self {
        let geometry = Geometry::new(
            config.block_offset_bits,
            config.set_bits,
            config.cache_size_bits,
        );
        log::debug!(
            "cache[{id}] ({:?}): {} sets x {} ways x {} byte blocks",
            config.protocol,
            geometry.num_sets,
            geometry.ways,
            geometry.block_size,
        );
        Self {
            id,
            protocol: config.protocol,
            store: TagStore::new(geometry),
            cacheable: config.cacheable(),
            invalidate_threshold: config.invalidate_threshold,
            invalidation_ratio: config.invalidation_ratio,
            blocked: false,
            request: None,
            resp_queue: VecDeque::new(),
            stats: stats::CoherentCache::default(),
        }
    }

    #[must_use]
    pub fn is_cacheable(&self, addr: address) -> bool {
        self.cacheable.contains(&addr)
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.store.geometry.block_size
    }

    /// CPU-side timing port. Returns `false` while a prior request is in
    /// flight; the caller re-drives when it sees a response.
    pub fn recv_timing_req(
        &mut self,
        pkt: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) -> bool {
        if self.blocked {
            log::debug!("cache[{}] request {pkt} blocked", self.id);
            return false;
        }

        if self.is_cacheable(pkt.addr) {
            if pkt.is_write() {
                self.stats.write_access += 1;
            } else {
                self.stats.read_access += 1;
            }
            match self.protocol {
                Protocol::Mesi => self.mesi_cpu_request(pkt, bus, events, now),
                Protocol::Dragon => self.dragon_cpu_request(pkt, bus, events, now),
                Protocol::Hybrid | Protocol::Adapt => {
                    self.hybrid_cpu_request(pkt, bus, events, now);
                }
            }
        } else {
            // outside the coherent window: pass through the bus unchanged
            self.blocked = true;
            self.request = Some(pkt);
            bus.request(self.id, events, now);
        }
        true
    }

    /// The bus chose this cache; issue exactly one bus operation.
    pub fn handle_bus_grant(&mut self, bus: &mut Bus, events: &mut EventQueue, now: u64) {
        assert_eq!(bus.current_granted, Some(self.id));
        let pending = self
            .request
            .as_ref()
            .expect("bus granted with no pending request");

        if self.is_cacheable(pending.addr) {
            match self.protocol {
                Protocol::Mesi => self.mesi_bus_grant(bus, events, now),
                Protocol::Dragon => self.dragon_bus_grant(bus, events, now),
                Protocol::Hybrid | Protocol::Adapt => self.hybrid_bus_grant(bus, events, now),
            }
        } else {
            let pkt = self.request.take().unwrap();
            let op = if pkt.is_write() {
                BusOp::BusRdX
            } else {
                BusOp::BusRd
            };
            bus.send_mem_req(pkt, true, op, events, now);
        }
    }

    /// Response for the in-flight transaction, either from memory or
    /// synthesized by the bus.
    pub fn handle_mem_response(
        &mut self,
        pkt: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) {
        assert!(self.blocked, "memory response while idle");
        if self.is_cacheable(pkt.addr) {
            match self.protocol {
                Protocol::Mesi => self.mesi_mem_response(pkt, bus, events, now),
                Protocol::Dragon => self.dragon_mem_response(pkt, bus, events, now),
                Protocol::Hybrid | Protocol::Adapt => self.hybrid_mem_response(pkt, bus, events, now),
            }
        } else {
            self.blocked = false;
            bus.release(self.id, events, now);
            self.send_cpu_resp(pkt, events, now);
        }
    }

    /// Observe a peer's bus operation. Never called for this cache's own
    /// transactions; the dispatch loop skips the originator.
    pub fn snoop(&mut self, pkt: &Packet, op: BusOp, bus: &mut Bus) {
        if !self.is_cacheable(pkt.addr) {
            return;
        }
        log::trace!("cache[{}] snoop {op:?} {pkt}", self.id);
        match self.protocol {
            Protocol::Mesi => self.mesi_snoop(pkt, op, bus),
            Protocol::Dragon => self.dragon_snoop(pkt, op, bus),
            Protocol::Hybrid | Protocol::Adapt => self.hybrid_snoop(pkt, op, bus),
        }
    }

    /// Queue a response toward the CPU; delivery happens next tick so that
    /// it never re-enters the handler that produced it.
    pub(crate) fn send_cpu_resp(&mut self, pkt: Packet, events: &mut EventQueue, now: u64) {
        debug_assert!(pkt.is_response());
        self.resp_queue.push_back(pkt);
        events.schedule(now + 1, Event::CpuResp { cache_id: self.id });
    }

    pub fn pop_cpu_resp(&mut self) -> Option<Packet> {
        self.resp_queue.pop_front()
    }

    /// Full-block read used to fill a missing line.
    pub(crate) fn aligned_fetch(&self, addr: address) -> Packet {
        let block_size = self.block_size();
        let block_addr = self.store.geometry.block_addr(addr);
        Packet::read(block_addr, block_size).with_requestor(self.id)
    }

    /// Make a slot available for `addr` unless it is already resident
    /// (possibly as a ghost left behind by an invalidation).
    ///
    /// Returns the victim's block address and write run when a line had to
    /// be pushed out.
    pub(crate) fn allocate_for_miss(
        &mut self,
        addr: address,
        invalidate_counter: i32,
        bus: &mut Bus,
    ) -> Option<(address, i32)> {
        let mut evicted = None;
        if self.store.find(addr).is_none() {
            if let Some(victim) = self.store.make_room(addr) {
                if victim.dirty {
                    bus.push_writeback(victim.block_addr, &victim.data);
                }
                evicted = Some((victim.block_addr, victim.write_run));
            }
            self.store.allocate(addr, invalidate_counter);
        } else {
            // reusing a ghost slot is an install too: stale update budgets
            // and access tracking must not survive it
            self.store
                .find_mut(addr)
                .unwrap()
                .reinit(invalidate_counter);
        }
        debug_assert_eq!(self.store.find(addr).unwrap().state, State::Invalid);
        evicted
    }

    pub(crate) fn finish_transaction(&mut self, bus: &mut Bus, events: &mut EventQueue, now: u64) {
        bus.release(self.id, events, now);
        self.blocked = false;
    }
}
