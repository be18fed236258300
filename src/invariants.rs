//! Whole-system coherence checks, run after every drained event in debug
//! builds and from tests.
//!
//! A violation is a simulator bug, never a recoverable condition, so every
//! check asserts.

use super::address;
use crate::bus::Bus;
use crate::cache::{CoherentCache, State};
use itertools::Itertools;
use std::collections::HashMap;

/// Assert the cross-cache single-writer and dirty-ownership rules.
pub fn check_coherence(caches: &[CoherentCache], bus: &Bus) {
    let mut holders: HashMap<address, Vec<(usize, State, bool)>> = HashMap::new();
    for cache in caches {
        cache.store.assert_unique_tags();
        for (block_addr, line) in cache.store.occupied() {
            if line.state.is_valid() {
                holders
                    .entry(block_addr)
                    .or_default()
                    .push((cache.id, line.state, line.dirty));
            }
            assert!(
                !line.dirty || line.state.may_be_dirty(),
                "cache[{}]: dirty line {block_addr:#x} in state {:?}",
                cache.id,
                line.state
            );
        }
    }

    for (block, entry) in holders.iter().sorted_by_key(|(addr, _)| *addr) {
        let exclusive: Vec<_> = entry
            .iter()
            .filter(|(_, state, _)| state.is_exclusive())
            .collect();
        assert!(
            exclusive.len() <= 1,
            "block {block:#x} owned exclusively by several caches: {exclusive:?}"
        );

        let shared_modified = entry
            .iter()
            .filter(|(_, state, _)| *state == State::SharedModified)
            .count();
        if shared_modified > 0 {
            assert!(
                exclusive.is_empty(),
                "block {block:#x} is both shared-modified and exclusively owned: {entry:?}"
            );
            assert!(
                shared_modified == 1,
                "block {block:#x} has several shared-modified owners: {entry:?}"
            );
        }
    }

    if let Some(grantee) = bus.current_granted {
        assert!(
            caches[grantee].blocked,
            "granted cache {grantee} is not working on a request"
        );
    }
}
