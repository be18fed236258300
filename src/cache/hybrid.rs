//! Update/invalidate hybrid controllers.
//!
//! Dragon semantics carrying a per-line budget of consecutive updates
//! (`invalidate_counter`). While the budget lasts, writes to shared lines
//! broadcast updates; once it runs out the writer escapes with a `BusRdX`,
//! peers drop their copies, and further writes are silent.
//!
//! The Hybrid flavour uses one fixed threshold per cache. Adapt keeps a
//! learned threshold per block in the bus-resident table and tunes it from
//! observed write runs: a run cut short by a remote access means the
//! updates were read (raise the threshold), a long uninterrupted run means
//! they were wasted (lower it).

use super::base::CoherentCache;
use super::State;
use crate::address;
use crate::bus::Bus;
use crate::config::Protocol;
use crate::events::EventQueue;
use crate::packet::{BusOp, Packet};

/// Close a write run and tune the block's threshold from its length.
fn end_write_run(bus: &mut Bus, ratio: i32, block_addr: address, run: &mut i32) {
    if *run < ratio {
        log::debug!("write run of {run} on {block_addr:#x}: raising threshold");
        bus.raise_threshold(block_addr);
    } else {
        log::debug!("write run of {run} on {block_addr:#x}: lowering threshold");
        bus.lower_threshold(block_addr);
    }
    *run = 0;
}

impl CoherentCache {
    fn adaptive(&self) -> bool {
        self.protocol == Protocol::Adapt
    }

    /// Threshold a fresh counter starts from for `addr`.
    fn reset_threshold(&self, bus: &Bus, addr: address) -> i32 {
        if self.adaptive() {
            bus.threshold(addr)
        } else {
            self.invalidate_threshold
        }
    }

    pub(crate) fn hybrid_cpu_request(
        &mut self,
        pkt: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) {
        log::debug!("hybrid[{}] cpu req: {pkt}", self.id);
        self.blocked = true;
        let addr = pkt.addr;
        let adaptive = self.adaptive();

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
            // peers learn through the remote-access wire that this copy
            // was actually consumed
            line.accessed_since_update = true;
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
                if adaptive {
                    line.write_run += 1;
                }
                let mut resp = pkt;
                resp.make_response();
                self.send_cpu_resp(resp, events, now);
                self.blocked = false;
            }
            State::SharedClean | State::SharedModified => {
                self.request = Some(pkt);
                bus.request(self.id, events, now);
            }
            State::Invalid => unreachable!("hit on an invalid line"),
        }
    }

    pub(crate) fn hybrid_bus_grant(&mut self, bus: &mut Bus, events: &mut EventQueue, now: u64) {
        let request = self.request.as_ref().expect("granted without a request");
        let addr = request.addr;
        let block_size = self.block_size();

        if self.store.is_hit(addr) {
            let line = self.store.find(addr).unwrap();
            debug_assert!(request.is_write());
            debug_assert!(matches!(
                line.state,
                State::SharedClean | State::SharedModified
            ));
            // budget left: keep updating; exhausted: invalidate the sharers
            let op = if line.invalidate_counter > 0 {
                BusOp::BusUpd
            } else {
                BusOp::BusRdX
            };
            log::debug!("hybrid[{}] {op:?} on shared write for {addr:#x}", self.id);
            bus.send_mem_req(request.clone(), false, op, events, now);
        } else if request.is_read() {
            log::debug!("hybrid[{}] read miss: BusRd for {addr:#x}", self.id);
            let fetch = self.aligned_fetch(addr);
            bus.send_mem_req(fetch, true, BusOp::BusRd, events, now);
        } else {
            let op = if self.reset_threshold(bus, addr) > 0 {
                BusOp::BusRdUpd
            } else {
                BusOp::BusRdX
            };
            let to_memory = !request.covers_block(block_size);
            log::debug!("hybrid[{}] write miss: {op:?} for {addr:#x}", self.id);
            bus.send_mem_req(request.clone(), to_memory, op, events, now);
        }
    }

    pub(crate) fn hybrid_mem_response(
        &mut self,
        resp: Packet,
        bus: &mut Bus,
        events: &mut EventQueue,
        now: u64,
    ) {
        log::debug!("hybrid[{}] mem resp: {resp}", self.id);
        let request = self.request.take().expect("response without a request");
        let addr = request.addr;
        let block_addr = self.store.geometry.block_addr(addr);
        let adaptive = self.adaptive();
        let fixed_threshold = self.invalidate_threshold;
        let ratio = self.invalidation_ratio;

        if self.store.is_hit(addr) {
            // write to a shared line went out (BusUpd while the budget
            // lasted, BusRdX once it ran out)
            debug_assert!(!resp.is_read());
            let shared = bus.shared_wire;
            let remote = bus.remote_access_wire;
            let line = self.store.find_mut(addr).unwrap();

            match line.state {
                State::SharedClean => {
                    if adaptive {
                        debug_assert_eq!(line.write_run, 0);
                        line.write_run = 1;
                    }
                    if shared {
                        // first update of this run
                        line.invalidate_counter = (line.invalidate_counter - 1).max(0);
                    }
                }
                State::SharedModified => {
                    if shared {
                        if remote {
                            // a reader consumed the previous updates; the
                            // run restarts with a fresh budget
                            if adaptive {
                                end_write_run(bus, ratio, block_addr, &mut line.write_run);
                                line.invalidate_counter = bus.threshold(addr);
                            } else {
                                line.invalidate_counter = fixed_threshold;
                            }
                        }
                        line.invalidate_counter = (line.invalidate_counter - 1).max(0);
                        if adaptive {
                            line.write_run += 1;
                        }
                    } else {
                        // every sharer has dropped out; updates stop
                        line.invalidate_counter = if adaptive {
                            bus.threshold(addr)
                        } else {
                            fixed_threshold
                        };
                        if adaptive {
                            line.write_run += 1;
                        }
                    }
                }
                other => unreachable!("shared write completed in state {other:?}"),
            }

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
        let initial = self.reset_threshold(bus, addr);
        // ghost slots left behind by BusRdX are reused in place
        if let Some((victim_addr, mut victim_run)) = self.allocate_for_miss(addr, initial, bus) {
            if adaptive && victim_run > 0 {
                end_write_run(bus, ratio, victim_addr, &mut victim_run);
            }
        }

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
            if adaptive {
                debug_assert_eq!(line.write_run, 0);
                line.write_run = 1;
            }
            if shared {
                // the miss carried an update broadcast
                line.invalidate_counter = (line.invalidate_counter - 1).max(0);
            }
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

    pub(crate) fn hybrid_snoop(&mut self, pkt: &Packet, op: BusOp, bus: &mut Bus) {
        let addr = pkt.addr;
        let block_addr = self.store.geometry.block_addr(addr);
        let adaptive = self.adaptive();
        let fixed_threshold = self.invalidate_threshold;
        let ratio = self.invalidation_ratio;

        let Some(line) = self.store.find_mut(addr) else {
            return;
        };
        if !line.state.is_valid() {
            return;
        }

        // the wire stays low on an invalidation so the writer learns it is
        // about to be the only holder
        if !op.invalidates() {
            bus.shared_wire = true;
        }
        bus.remote_access_wire |= line.accessed_since_update;

        match line.state {
            State::Modified => {
                debug_assert!(line.dirty);
                bus.push_flush(block_addr, &line.data);
                line.dirty = false;
                if adaptive {
                    end_write_run(bus, ratio, block_addr, &mut line.write_run);
                }
                if op.invalidates() {
                    line.state = State::Invalid;
                } else if op.has_upd() {
                    // read-with-update: install the writer's data, become a
                    // reader with a fresh budget
                    pkt.write_data_to_block(&mut line.data);
                    line.state = State::SharedClean;
                    line.accessed_since_update = false;
                    line.invalidate_counter = if adaptive {
                        bus.threshold(addr)
                    } else {
                        fixed_threshold
                    };
                } else {
                    line.state = State::SharedModified;
                }
            }
            State::SharedModified => {
                if op.invalidates() {
                    if line.dirty {
                        bus.push_flush(block_addr, &line.data);
                        line.dirty = false;
                    }
                    line.state = State::Invalid;
                } else {
                    if op.has_rd() && line.dirty {
                        bus.push_flush(block_addr, &line.data);
                        line.dirty = false;
                    }
                    if op.has_upd() {
                        debug_assert!(pkt.is_write());
                        pkt.write_data_to_block(&mut line.data);
                        line.state = State::SharedClean;
                        line.dirty = false;
                        line.accessed_since_update = false;
                    }
                }
                // any bus interruption restores the owner's budget
                if adaptive && line.write_run > 0 {
                    end_write_run(bus, ratio, block_addr, &mut line.write_run);
                }
                line.invalidate_counter = if adaptive {
                    bus.threshold(addr)
                } else {
                    fixed_threshold
                };
            }
            State::Exclusive => {
                debug_assert!(!line.dirty);
                if adaptive {
                    debug_assert_eq!(line.write_run, 0);
                }
                if op.invalidates() {
                    line.state = State::Invalid;
                } else {
                    line.state = State::SharedClean;
                    if op.has_upd() {
                        pkt.write_data_to_block(&mut line.data);
                        line.accessed_since_update = false;
                    }
                }
            }
            State::SharedClean => {
                if op.invalidates() {
                    line.state = State::Invalid;
                } else if op.has_upd() {
                    debug_assert!(pkt.is_write());
                    pkt.write_data_to_block(&mut line.data);
                    line.accessed_since_update = false;
                }
            }
            State::Invalid => unreachable!(),
        }
    }
}
