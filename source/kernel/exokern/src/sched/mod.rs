// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Round-robin scheduler gate over the environment registry
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Scheduler (current/switch_to/yield_now)
//! DEPENDS_ON: env::EnvTable
//! INVARIANTS: At most one current environment; a DYING current record is reaped once the
//!             scheduler has switched away from it; selection is deterministic

use crate::{
    env::{EnvStatus, EnvTable},
    types::EnvId,
};

/// Picks the next `Runnable` environment, scanning slots after the current one.
#[derive(Debug, Default)]
pub struct Scheduler {
    current: Option<EnvId>,
    switches: u64,
}

impl Scheduler {
    pub const fn new() -> Self {
        Self { current: None, switches: 0 }
    }

    /// Environment executing on this processor, if any.
    #[inline]
    pub fn current(&self) -> Option<EnvId> {
        self.current
    }

    /// Number of context switches performed.
    pub fn switches(&self) -> u64 {
        self.switches
    }

    /// Makes `id` the current environment without a selection pass.
    pub fn switch_to(&mut self, id: EnvId) {
        if self.current != Some(id) {
            self.switches += 1;
        }
        self.current = Some(id);
    }

    /// Gives up the processor. The previous environment is considered last, so it keeps
    /// running only when nothing else is runnable. Returns `None` when the processor idles.
    pub fn yield_now(&mut self, envs: &mut EnvTable) -> Option<EnvId> {
        let prev = self.current;
        let capacity = envs.capacity();
        let start = prev.map_or(0, |id| id.index() + 1);
        let next = (0..capacity)
            .map(|offset| (start + offset) % capacity)
            .filter_map(|index| envs.slot(index))
            .find(|(_, status)| *status == EnvStatus::Runnable)
            .map(|(id, _)| id);

        if let Some(prev) = prev {
            if envs.get(prev).map(|env| env.status()) == Some(EnvStatus::Dying) {
                envs.reap(prev);
                log_debug!(target: "sched", "reaped {}", prev);
            }
        }
        match next {
            Some(id) => self.switch_to(id),
            None => {
                self.current = None;
                log_trace!(target: "sched", "idle");
            }
        }
        next
    }
}
