//! Write-invalidate controller.
//!
//! A write to a shared line buys the bus and invalidates every peer copy;
//! after the upgrade all further writes are silent.

use super::base::CoherentCache;
use super::State;
use crate::bus::Bus;
use crate::events::EventQueue;
use crate::packet::{BusOp, Packet};

impl CoherentCache {
    pub(crate) fn mesi_cpu_request(
        &mut self,
        pkt: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) {
        log::debug!("mesi[{}] cpu req: {pkt}", self.id);
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
                // silent upgrade: this is the only copy
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
                // peers must drop their copies before the write lands
                self.request = Some(pkt);
                bus.request(self.id, events, now);
            }
            State::Invalid => unreachable!("hit on an invalid line"),
        }
    }

    pub(crate) fn mesi_bus_grant(&mut self, bus: &mut Bus, events: &mut EventQueue, now: u64) {
        let request = self.request.as_ref().expect("granted without a request");
        let addr = request.addr;
        let block_size = self.block_size();

        if self.store.is_hit(addr) {
            // write upgrade on a shared line
            debug_assert!(request.is_write());
            log::debug!("mesi[{}] upgrade: BusRdX for {addr:#x}", self.id);
            bus.send_mem_req(request.clone(), false, BusOp::BusRdX, events, now);
        } else if request.is_read() {
            log::debug!("mesi[{}] read miss: BusRd for {addr:#x}", self.id);
            let fetch = self.aligned_fetch(addr);
            bus.send_mem_req(fetch, true, BusOp::BusRd, events, now);
        } else {
            // a write covering the whole block needs no fill from memory
            let to_memory = !request.covers_block(block_size);
            log::debug!("mesi[{}] write miss: BusRdX for {addr:#x}", self.id);
            bus.send_mem_req(request.clone(), to_memory, BusOp::BusRdX, events, now);
        }
    }

    pub(crate) fn mesi_mem_response(
        &mut self,
        resp: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) {
        log::debug!("mesi[{}] mem resp: {resp}", self.id);
        let request = self.request.take().expect("response without a request");
        let addr = request.addr;

        if self.store.is_hit(addr) {
            // upgrade finished: peers dropped their copies during snoop
            debug_assert!(request.is_write() && !resp.is_read());
            let line = self.store.find_mut(addr).unwrap();
            debug_assert!(matches!(
                line.state,
                State::SharedClean | State::SharedModified
            ));
            line.state = State::Modified;
            request.write_data_to_block(&mut line.data);
            line.dirty = true;
            line.referenced = true;
            self.send_cpu_resp(resp, events, now);
            self.finish_transaction(bus, events, now);
            return;
        }

        let memory_fetch = resp.is_read();
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
            // write miss always takes ownership
            line.state = State::Modified;
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

    pub(crate) fn mesi_snoop(&mut self, pkt: &Packet, op: BusOp, bus: &mut Bus) {
        let addr = pkt.addr;
        let block_addr = self.store.geometry.block_addr(addr);
        let Some(line) = self.store.find_mut(addr) else {
            return;
        };
        if !line.state.is_valid() {
            return;
        }

        match op {
            BusOp::BusRd => {
                bus.shared_wire = true;
                match line.state {
                    State::Exclusive => line.state = State::SharedClean,
                    State::Modified | State::SharedModified => {
                        if line.dirty {
                            bus.push_flush(block_addr, &line.data);
                            line.dirty = false;
                        }
                        line.state = State::SharedClean;
                    }
                    State::SharedClean => {}
                    State::Invalid => unreachable!(),
                }
            }
            BusOp::BusRdX => {
                // the wire stays low so the writer installs exclusively
                if line.dirty {
                    bus.push_flush(block_addr, &line.data);
                    line.dirty = false;
                }
                line.state = State::Invalid;
            }
            BusOp::BusUpd | BusOp::BusRdUpd => {
                unreachable!("update operation under a write-invalidate protocol")
            }
        }
    }
}
