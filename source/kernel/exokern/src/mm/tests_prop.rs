// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for user grant validation and page-table accounting
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - perm words: accepted iff present|user set and nothing outside the syscall mask
//!   - page tables: frame pool is whole again after teardown
//!
//! TEST_SCENARIOS:
//!   - perm_acceptance_matches_mask(): arbitrary words classify like the reference predicate
//!   - accepted_perm_round_trips(): accepted flags keep every bit of the raw word
//!   - teardown_restores_pool(): random map/unmap sequences leak no frames

use super::{FrameAllocator, PageFlags, PageTable, PAGE_SIZE, UTOP};
use proptest::prelude::*;

fn acceptable(raw: usize) -> bool {
    let required = PageFlags::REQUIRED.bits() as usize;
    raw & required == required && raw & !(PageFlags::SYSCALL.bits() as usize) == 0
}

proptest! {
    #[test]
    fn perm_acceptance_matches_mask(raw in any::<usize>()) {
        prop_assert_eq!(PageFlags::from_syscall(raw).is_ok(), acceptable(raw));
    }

    #[test]
    fn accepted_perm_round_trips(extra in 0usize..0x1000) {
        let raw = (extra & PageFlags::SYSCALL.bits() as usize) | PageFlags::REQUIRED.bits() as usize;
        let flags = PageFlags::from_syscall(raw).unwrap();
        prop_assert_eq!(flags.bits() as usize, raw);
    }

    #[test]
    fn teardown_restores_pool(ops in prop::collection::vec((0usize..64, any::<bool>()), 1..40)) {
        let mut frames = FrameAllocator::new(128);
        let mut pt = PageTable::new(&mut frames).unwrap();
        for (slot, map) in ops {
            // spread across a few page-table pages
            let va = (slot * 0x40_0000 / 16 + slot * PAGE_SIZE) % UTOP & !(PAGE_SIZE - 1);
            if map {
                let page = frames.alloc_zeroed().unwrap();
                pt.insert(&mut frames, va, page, PageFlags::REQUIRED).unwrap();
            } else {
                pt.remove(&mut frames, va);
            }
        }
        pt.teardown(&mut frames);
        prop_assert_eq!(frames.free_count(), 128);
    }
}
