//! The memory-side cache chain: up to three levels in front of memory,
//! timed by hit and wait lists instead of per-cycle pipeline modeling.

use crate::config::{self, Latencies};
use crate::llc::{self, LastLevelCache, StatusReport};
use crate::packet::Packet;
use std::collections::VecDeque;

const LEVEL_NAMES: [&str; 3] = ["L1", "L2", "L3"];

/// One level of the chain, wrapping the QoS-selected cache engine.
#[derive(Debug)]
pub struct CacheLevel {
    pub name: &'static str,
    llc: Box<dyn LastLevelCache>,
    /// misses the next level refused; re-driven every tick
    retry_list: VecDeque<Packet>,
    pub stats: stats::Cache,
}

/// Chain of cache levels.
///
/// Hits park on the `hit_list` until their accumulated latency elapses and
/// then surface in `finished`. Misses allocated at the last level park on
/// the `wait_list` and then go out through `send_memory`; a refused send
/// stays queued. Levels link by position, higher levels forward to lower
/// ones, fills propagate back up through `callback`.
pub struct CacheSystem {
    levels: Vec<CacheLevel>,
    pub hit_list: VecDeque<(u64, Packet)>,
    pub wait_list: VecDeque<(u64, Packet)>,
    /// completed hits, ready for the caller
    pub finished: VecDeque<Packet>,
    pub clk: u64,
    latencies: Latencies,
    send_memory: Box<dyn FnMut(&Packet) -> bool>,
}

impl std::fmt::Debug for CacheSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CacheSystem")
            .field("levels", &self.levels)
            .field("clk", &self.clk)
            .field("hit_list", &self.hit_list.len())
            .field("wait_list", &self.wait_list.len())
            .finish()
    }
}

impl CacheSystem {
    pub fn new(
        configs: &[config::Llc],
        latencies: Latencies,
        send_memory: Box<dyn FnMut(&Packet) -> bool>,
    ) -> Result<Self, config::Error> {
        assert!(
            (1..=LEVEL_NAMES.len()).contains(&configs.len()),
            "between one and three cache levels"
        );
        for level in configs {
            level.validate()?;
        }
        let levels = configs
            .iter()
            .enumerate()
            .map(|(index, level)| CacheLevel {
                name: LEVEL_NAMES[index],
                llc: llc::build(level),
                retry_list: VecDeque::new(),
                stats: stats::Cache::default(),
            })
            .collect();
        Ok(Self {
            levels,
            hit_list: VecDeque::new(),
            wait_list: VecDeque::new(),
            finished: VecDeque::new(),
            clk: 0,
            latencies,
            send_memory,
        })
    }

    /// Feed one request into the top of the chain.
    pub fn send(&mut self, pkt: Packet) -> bool {
        self.send_at(0, pkt)
    }

    fn send_at(&mut self, index: usize, mut pkt: Packet) -> bool {
        let is_last = index + 1 == self.levels.len();
        let latency = self.latencies.accumulated(index);

        {
            let level = &mut self.levels[index];
            level.stats.total_access += 1;
            if pkt.is_write() {
                level.stats.write_access += 1;
            } else {
                level.stats.read_access += 1;
            }
        }

        let mut report = StatusReport::default();
        let handled = self.levels[index].llc.send(&mut pkt, &mut report);
        report.update_send_stats(&mut self.levels[index].stats);
        if cfg!(debug_assertions) {
            self.levels[index].llc.check_invariants();
        }
        log::trace!(
            "{}: {pkt} hit={} mshr_hit={} allocated={}",
            self.levels[index].name,
            report.hit,
            report.mshr_hit,
            report.mshr_allocated
        );

        if report.hit {
            self.hit_list.push_back((self.clk + latency, pkt.clone()));
        }

        if report.mshr_allocated {
            if is_last {
                self.wait_list.push_back((self.clk + latency, pkt.clone()));
            } else if !self.send_at(index + 1, pkt.clone()) {
                self.levels[index].retry_list.push_back(pkt.clone());
            }
        }

        // dirty victims head straight for memory
        for writeback in report.requests {
            self.wait_list.push_back((self.clk + latency, writeback));
        }

        handled
    }

    /// Memory finished a fill: unlock the block at every level that waits
    /// for it, bottom up.
    pub fn callback(&mut self, pkt: &Packet) {
        for level in self.levels.iter_mut().rev() {
            level.llc.callback(pkt);
        }
    }

    pub fn tick(&mut self) {
        self.clk += 1;

        // due misses go out to memory; refused sends stay queued
        let mut waiting = VecDeque::new();
        while let Some((ready, pkt)) = self.wait_list.pop_front() {
            if self.clk >= ready {
                if (self.send_memory)(&pkt) {
                    log::trace!("memory accepted {pkt}");
                } else {
                    waiting.push_back((ready, pkt));
                }
            } else {
                waiting.push_back((ready, pkt));
            }
        }
        self.wait_list = waiting;

        // due hits complete
        let mut pending = VecDeque::new();
        while let Some((ready, pkt)) = self.hit_list.pop_front() {
            if self.clk >= ready {
                self.finished.push_back(pkt);
            } else {
                pending.push_back((ready, pkt));
            }
        }
        self.hit_list = pending;

        // parked misses re-drive into the next level
        for index in 0..self.levels.len().saturating_sub(1) {
            let retries: Vec<Packet> = self.levels[index].retry_list.drain(..).collect();
            for pkt in retries {
                if !self.send_at(index + 1, pkt.clone()) {
                    self.levels[index].retry_list.push_back(pkt);
                }
            }
        }
    }

    #[must_use]
    pub fn level_stats(&self) -> Vec<stats::Cache> {
        self.levels.iter().map(|level| level.stats.clone()).collect()
    }
}
