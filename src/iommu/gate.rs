// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Device Gate / Power Sequencer
//!
//! The MMU control registers (and, on some instances, the page-table SRAM)
//! sit in a clock domain that can be gated off. Every register-touching
//! operation runs inside a [`GateGuard`]: the first guard enables the domain
//! and waits for it to settle, the last guard to drop disables it again.
//!
//! # Design
//!
//! - **Scoped acquisition**: release happens in `Drop`, so early returns and
//!   `?` paths cannot leak a clock reference.
//! - **Polled settle**: after `enable()` the gate polls
//!   [`PowerDomain::is_ready`] up to the configured budget and fails with
//!   `PowerGateTimeout` instead of sleeping a fixed delay.
//! - **Leaf lock**: the gate's reference count has its own lock, and it is
//!   never held across a call into the [`PowerDomain`]. A transition in
//!   progress is marked `Switching`; other callers spin until it settles.
//!   Device map and page-table locks are always taken after the guard is
//!   held and released before it drops.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

use crate::err::{IommuError, Result};

/// Clock/power substrate of one IOMMU instance
pub trait PowerDomain: Send + Sync {
    /// Ungate clocks and power; `Err` carries the substrate's own code
    fn enable(&self) -> core::result::Result<(), i32>;

    /// Gate clocks and power
    fn disable(&self);

    /// Whether the domain has settled after `enable()`
    fn is_ready(&self) -> bool {
        true
    }
}

/// Power phase of the domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Off,
    /// A caller is inside `PowerDomain::enable` or `disable`
    Switching,
    On,
}

#[derive(Debug)]
struct GateState {
    users: u32,
    phase: Phase,
}

/// Reference-counted power sequencer
pub struct DeviceGate {
    /// Substrate
    domain: Arc<dyn PowerDomain>,
    /// Outstanding references and phase
    state: Mutex<GateState>,
    /// Polls before a settle wait gives up
    poll_limit: u32,
    /// Completed off -> on transitions
    power_ups: AtomicU64,
}

impl fmt::Debug for DeviceGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceGate")
            .field("state", &*self.state.lock())
            .field("poll_limit", &self.poll_limit)
            .field("power_ups", &self.power_ups.load(Ordering::Relaxed))
            .finish()
    }
}

impl DeviceGate {
    /// Create a gate over `domain`
    pub fn new(domain: Arc<dyn PowerDomain>, poll_limit: u32) -> Self {
        Self {
            domain,
            state: Mutex::new(GateState {
                users: 0,
                phase: Phase::Off,
            }),
            poll_limit: poll_limit.max(1),
            power_ups: AtomicU64::new(0),
        }
    }

    /// Take a reference, powering the domain up if it was off
    pub fn acquire(&self) -> Result<GateGuard<'_>> {
        self.get()?;
        Ok(GateGuard { gate: self })
    }

    /// Run `f` with the domain powered
    ///
    /// The reference is released whether `f` succeeds or fails.
    pub fn with_enabled<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.acquire()?;
        f()
    }

    /// Outstanding references
    pub fn users(&self) -> u32 {
        self.state.lock().users
    }

    /// Number of completed power-ups
    pub fn power_ups(&self) -> u64 {
        self.power_ups.load(Ordering::Acquire)
    }

    /// Take an unscoped reference; pair with [`DeviceGate::put`]
    pub(crate) fn get(&self) -> Result {
        loop {
            let mut state = self.state.lock();
            match state.phase {
                Phase::On => {
                    state.users += 1;
                    return Ok(());
                }
                Phase::Switching => {
                    drop(state);
                    core::hint::spin_loop();
                }
                Phase::Off => {
                    state.phase = Phase::Switching;
                    drop(state);
                    let res = self.power_up();
                    let mut state = self.state.lock();
                    match res {
                        Ok(()) => {
                            state.phase = Phase::On;
                            state.users = 1;
                        }
                        Err(_) => state.phase = Phase::Off,
                    }
                    return res;
                }
            }
        }
    }

    /// Drop an unscoped reference
    pub(crate) fn put(&self) {
        let mut state = self.state.lock();
        match (state.phase, state.users) {
            (Phase::On, 1) => {
                state.users = 0;
                state.phase = Phase::Switching;
                drop(state);
                self.domain.disable();
                self.state.lock().phase = Phase::Off;
            }
            (Phase::On, _) => state.users -= 1,
            _ => log_warn!("gate: unbalanced release"),
        }
    }

    /// Ungate the domain and wait for it to settle
    fn power_up(&self) -> Result {
        if let Err(code) = self.domain.enable() {
            log_error!("gate: power domain refused enable ({})", code);
            return Err(IommuError::PowerGateUnavailable);
        }
        if !self.wait_ready() {
            log_error!("gate: power domain not ready after {} polls", self.poll_limit);
            self.domain.disable();
            return Err(IommuError::PowerGateTimeout);
        }
        self.power_ups.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn wait_ready(&self) -> bool {
        for _ in 0..self.poll_limit {
            if self.domain.is_ready() {
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }
}

/// Scoped power reference
#[must_use = "the domain powers down when the guard drops"]
pub struct GateGuard<'a> {
    gate: &'a DeviceGate,
}

impl fmt::Debug for GateGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateGuard").finish_non_exhaustive()
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.put();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iommu::sim::SimPowerDomain;
    use alloc::vec;
    use alloc::vec::Vec;

    fn gate(domain: &Arc<SimPowerDomain>) -> DeviceGate {
        DeviceGate::new(domain.clone(), 16)
    }

    #[test]
    fn test_scoped_enable_disable() {
        let domain = Arc::new(SimPowerDomain::new());
        let gate = gate(&domain);
        {
            let _g = gate.acquire().unwrap();
            assert!(domain.is_powered());
            assert_eq!(gate.users(), 1);
        }
        assert!(!domain.is_powered());
        assert_eq!(gate.users(), 0);
        assert_eq!(domain.enable_calls(), 1);
    }

    #[test]
    fn test_nested_guards_enable_once() {
        let domain = Arc::new(SimPowerDomain::new());
        let gate = gate(&domain);
        let outer = gate.acquire().unwrap();
        let inner = gate.acquire().unwrap();
        drop(inner);
        assert!(domain.is_powered());
        drop(outer);
        assert!(!domain.is_powered());
        assert_eq!(domain.enable_calls(), 1);
        assert_eq!(gate.power_ups(), 1);
    }

    #[test]
    fn test_release_on_error_path() {
        let domain = Arc::new(SimPowerDomain::new());
        let gate = gate(&domain);
        let res: Result<()> = gate.with_enabled(|| Err(IommuError::HardwareFault));
        assert_eq!(res, Err(IommuError::HardwareFault));
        assert!(!domain.is_powered());
        assert_eq!(gate.users(), 0);
    }

    #[test]
    fn test_enable_failure() {
        let domain = Arc::new(SimPowerDomain::new());
        domain.fail_enable(true);
        let gate = gate(&domain);
        let mut ran = false;
        let res = gate.with_enabled(|| {
            ran = true;
            Ok(())
        });
        assert_eq!(res, Err(IommuError::PowerGateUnavailable));
        assert!(!ran);
        assert_eq!(gate.users(), 0);
    }

    #[test]
    fn test_settle_timeout() {
        let domain = Arc::new(SimPowerDomain::new());
        domain.hang(true);
        let gate = gate(&domain);
        assert_eq!(gate.acquire().err(), Some(IommuError::PowerGateTimeout));
        assert!(!domain.is_powered());
        assert_eq!(gate.users(), 0);

        domain.hang(false);
        assert!(gate.acquire().is_ok());
    }

    /// Domain that inspects its own gate from inside the substrate calls
    struct Reentrant {
        gate: Mutex<Option<Arc<DeviceGate>>>,
        seen: Mutex<Vec<u32>>,
    }

    impl Reentrant {
        fn observe(&self) {
            if let Some(gate) = self.gate.lock().as_ref() {
                self.seen.lock().push(gate.users());
            }
        }
    }

    impl PowerDomain for Reentrant {
        fn enable(&self) -> core::result::Result<(), i32> {
            self.observe();
            Ok(())
        }

        fn disable(&self) {
            self.observe();
        }
    }

    #[test]
    fn test_substrate_calls_run_unlocked() {
        let domain = Arc::new(Reentrant {
            gate: Mutex::new(None),
            seen: Mutex::new(Vec::new()),
        });
        let gate = Arc::new(DeviceGate::new(domain.clone(), 16));
        *domain.gate.lock() = Some(gate.clone());

        let guard = gate.acquire().unwrap();
        assert_eq!(gate.users(), 1);
        drop(guard);
        assert_eq!(gate.users(), 0);
        assert_eq!(*domain.seen.lock(), vec![0, 0]);

        // the cycle gate -> domain -> gate is broken by hand
        domain.gate.lock().take();
    }

    #[test]
    fn test_unbalanced_release_ignored() {
        let domain = Arc::new(SimPowerDomain::new());
        let gate = gate(&domain);
        gate.put();
        assert_eq!(gate.users(), 0);
        let _g = gate.acquire().unwrap();
        assert!(domain.is_powered());
        assert_eq!(gate.users(), 1);
    }

    #[test]
    fn test_settle_after_polls() {
        let domain = Arc::new(SimPowerDomain::new().with_settle_polls(5));
        let gate = gate(&domain);
        assert!(gate.acquire().is_ok());
    }
}
