// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Simulated Power Domain
//!
//! Host stand-in for the clock/power driver, with knobs for refusing enable,
//! never settling, and settling after a number of polls. When attached to a
//! [`SimRegisters`] block, gating the domain off wipes the registers the way
//! a real power collapse does.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::gate::PowerDomain;
use crate::reg::SimRegisters;

/// Simulated clock/power substrate
#[derive(Debug, Default)]
pub struct SimPowerDomain {
    powered: AtomicBool,
    fail: AtomicBool,
    hang: AtomicBool,
    settle_polls: u32,
    polls: AtomicU32,
    enables: AtomicU64,
    lose_state: Option<Arc<SimRegisters>>,
}

impl SimPowerDomain {
    /// A domain that powers up immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Become ready only after `polls` readiness checks
    pub fn with_settle_polls(mut self, polls: u32) -> Self {
        self.settle_polls = polls;
        self
    }

    /// Wipe `regs` whenever the domain is gated off
    pub fn losing_state_of(mut self, regs: Arc<SimRegisters>) -> Self {
        self.lose_state = Some(regs);
        self
    }

    /// Make `enable()` fail
    pub fn fail_enable(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    /// Make the domain never report ready
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::Release);
    }

    /// Whether the domain is currently ungated
    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    /// Number of successful `enable()` calls
    pub fn enable_calls(&self) -> u64 {
        self.enables.load(Ordering::Acquire)
    }
}

impl PowerDomain for SimPowerDomain {
    fn enable(&self) -> core::result::Result<(), i32> {
        if self.fail.load(Ordering::Acquire) {
            return Err(-19);
        }
        self.polls.store(0, Ordering::Release);
        self.powered.store(true, Ordering::Release);
        self.enables.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn disable(&self) {
        self.powered.store(false, Ordering::Release);
        if let Some(regs) = &self.lose_state {
            regs.power_loss();
        }
    }

    fn is_ready(&self) -> bool {
        if self.hang.load(Ordering::Acquire) || !self.is_powered() {
            return false;
        }
        self.polls.fetch_add(1, Ordering::AcqRel) + 1 >= self.settle_polls
    }
}
