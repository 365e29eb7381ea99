// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for environment id reuse
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - ids minted for a slot never repeat while the generation counter has room
//!   - destroyed ids never resolve again
//!
//! TEST_SCENARIOS:
//!   - ids_are_unique_across_reuse(): random alloc/destroy churn over a tiny table
//!   - destroyed_ids_stay_dead(): every id destroyed during churn resolves BadEnv afterwards

use alloc::{collections::BTreeSet, vec::Vec};

use super::{EnvError, EnvTable};
use crate::{mm::AddressSpaceManager, types::EnvId};
use proptest::prelude::*;

proptest! {
    #[test]
    fn ids_are_unique_across_reuse(ops in prop::collection::vec(any::<bool>(), 1..200)) {
        let mut table = EnvTable::new(3);
        let mut spaces = AddressSpaceManager::new(16);
        let mut live: Vec<EnvId> = Vec::new();
        let mut seen = BTreeSet::new();
        for alloc in ops {
            if alloc {
                if let Ok(id) = table.alloc(&mut spaces, EnvId::CURRENT) {
                    prop_assert!(seen.insert(id));
                    live.push(id);
                }
            } else if let Some(id) = live.pop() {
                table.destroy(&mut spaces, id, None).unwrap();
            }
        }
    }

    #[test]
    fn destroyed_ids_stay_dead(ops in prop::collection::vec(any::<bool>(), 1..120)) {
        let mut table = EnvTable::new(2);
        let mut spaces = AddressSpaceManager::new(8);
        let mut live: Vec<EnvId> = Vec::new();
        let mut dead: Vec<EnvId> = Vec::new();
        for alloc in ops {
            if alloc {
                if let Ok(id) = table.alloc(&mut spaces, EnvId::CURRENT) {
                    live.push(id);
                }
            } else if let Some(id) = live.pop() {
                table.destroy(&mut spaces, id, None).unwrap();
                dead.push(id);
            }
        }
        for id in dead {
            prop_assert_eq!(table.resolve(id, id, false), Err(EnvError::BadEnv));
        }
    }
}
