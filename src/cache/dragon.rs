//! Write-update controller.
//!
//! Writes on shared lines broadcast the new data instead of invalidating;
//! a line only ever leaves a cache through capacity eviction.

use super::base::CoherentCache;
use super::State;
use crate::bus::Bus;
use crate::events::EventQueue;
use crate::packet::{BusOp, Packet};

impl CoherentCache {
    pub(crate) fn dragon_cpu_request(
        &mut self,
        pkt: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) {
        log::debug!("dragon[{}] cpu req: {pkt}", self.id);
        self.blocked = true;
        let addr = pkt.addr;

        if !self.store.is_hit(addr) {
            self.stats.misses += 1;
            self.request = Some(pkt);
            bus.request(self.id, events, now);
            return;
        }

        self.stats.hits += 1;
        let line = self.store.find_mut(addr).unwrap();
        debug_assert!(line.state.is_valid());

        if pkt.is_read() {
            line.referenced = true;
            let mut resp = pkt;
            resp.set_data_from_block(&line.data);
            resp.make_response();
            self.send_cpu_resp(resp, events, now);
            self.blocked = false;
            return;
        }

        match line.state {
            State::Exclusive | State::Modified => {
                line.state = State::Modified;
                pkt.write_data_to_block(&mut line.data);
                line.dirty = true;
                line.referenced = true;
                let mut resp = pkt;
                resp.make_response();
                self.send_cpu_resp(resp, events, now);
                self.blocked = false;
            }
            State::SharedClean | State::SharedModified => {
                // sharers may exist; the write has to be broadcast
                log::debug!(
                    "dragon[{}] write to shared line {addr:#x} needs the bus",
                    self.id
                );
                self.request = Some(pkt);
                bus.request(self.id, events, now);
            }
            State::Invalid => unreachable!("hit on an invalid line"),
        }
    }

    pub(crate) fn dragon_bus_grant(&mut self, bus: &mut Bus, events: &mut EventQueue, now: u64) {
        let request = self.request.as_ref().expect("granted without a request");
        let addr = request.addr;
        let block_size = self.block_size();

        if self.store.is_hit(addr) {
            let state = self.store.find(addr).unwrap().state;
            debug_assert!(request.is_write());
            debug_assert!(matches!(
                state,
                State::SharedClean | State::SharedModified
            ));
            log::debug!("dragon[{}] BusUpd for {addr:#x}", self.id);
            bus.send_mem_req(request.clone(), false, BusOp::BusUpd, events, now);
        } else if request.is_read() {
            log::debug!("dragon[{}] read miss: BusRd for {addr:#x}", self.id);
            let fetch = self.aligned_fetch(addr);
            bus.send_mem_req(fetch, true, BusOp::BusRd, events, now);
        } else {
            let to_memory = !request.covers_block(block_size);
            log::debug!("dragon[{}] write miss: BusRdUpd for {addr:#x}", self.id);
            bus.send_mem_req(request.clone(), to_memory, BusOp::BusRdUpd, events, now);
        }
    }

    pub(crate) fn dragon_mem_response(
        &mut self,
        resp: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) {
        log::debug!("dragon[{}] mem resp: {resp}", self.id);
        let request = self.request.take().expect("response without a request");
        let addr = request.addr;

        if self.store.is_hit(addr) {
            // broadcast write to a shared line finished; the wire tells us
            // whether anyone still shares it
            debug_assert!(!resp.is_read());
            let shared = bus.shared_wire;
            let line = self.store.find_mut(addr).unwrap();
            debug_assert!(matches!(
                line.state,
                State::SharedClean | State::SharedModified
            ));
            line.state = if shared {
                State::SharedModified
            } else {
                State::Modified
            };
            line.dirty = true;
            line.referenced = true;
            request.write_data_to_block(&mut line.data);
            self.send_cpu_resp(resp, events, now);
            self.finish_transaction(bus, events, now);
            return;
        }

        let memory_fetch = resp.is_read();
        // update snoops never invalidate, so a miss means the tag is gone
        debug_assert!(self.store.find(addr).is_none());
        self.allocate_for_miss(addr, 0, bus);
        let shared = bus.shared_wire;
        let line = self.store.find_mut(addr).unwrap();
        line.referenced = true;

        if request.is_read() {
            debug_assert!(memory_fetch);
            line.state = if shared {
                State::SharedClean
            } else {
                State::Exclusive
            };
            resp.write_data_to_block(&mut line.data);
            let mut cpu_resp = request;
            cpu_resp.set_data_from_block(&line.data);
            cpu_resp.make_response();
            self.send_cpu_resp(cpu_resp, events, now);
        } else {
            line.state = if shared {
                State::SharedModified
            } else {
                State::Modified
            };
            line.dirty = true;
            if memory_fetch {
                resp.write_data_to_block(&mut line.data);
            }
            request.write_data_to_block(&mut line.data);
            let mut cpu_resp = request;
            cpu_resp.make_response();
            self.send_cpu_resp(cpu_resp, events, now);
        }
        self.finish_transaction(bus, events, now);
    }

    pub(crate) fn dragon_snoop(&mut self, pkt: &Packet, op: BusOp, bus: &mut Bus) {
        assert!(
            !op.invalidates(),
            "invalidate operation under a write-update protocol"
        );
        let addr = pkt.addr;
        let block_addr = self.store.geometry.block_addr(addr);
        let Some(line) = self.store.find_mut(addr) else {
            return;
        };
        if !line.state.is_valid() {
            return;
        }
        bus.shared_wire = true;

        match line.state {
            State::Modified => {
                debug_assert!(line.dirty);
                bus.push_flush(block_addr, &line.data);
                line.dirty = false;
                if op.has_upd() {
                    // the writer publishes right over our copy
                    pkt.write_data_to_block(&mut line.data);
                    line.state = State::SharedClean;
                } else {
                    line.state = State::SharedModified;
                }
            }
            State::SharedModified => {
                if op.has_rd() && line.dirty {
                    bus.push_flush(block_addr, &line.data);
                    line.dirty = false;
                }
                if op.has_upd() {
                    debug_assert!(pkt.is_write());
                    pkt.write_data_to_block(&mut line.data);
                    line.state = State::SharedClean;
                    line.dirty = false;
                }
            }
            State::Exclusive => {
                debug_assert!(!line.dirty);
                debug_assert!(op.has_rd());
                line.state = State::SharedClean;
                if op.has_upd() {
                    pkt.write_data_to_block(&mut line.data);
                }
            }
            State::SharedClean => {
                if op.has_upd() {
                    debug_assert!(pkt.is_write());
                    pkt.write_data_to_block(&mut line.data);
                }
            }
            State::Invalid => unreachable!(),
        }
    }
}
