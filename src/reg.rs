// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Register Access
//!
//! The IOMMU control block is reached through a [`RegisterBus`]: an opaque
//! handle on the device's I/O base. Offsets are byte offsets from that base.
//!
//! - [`MmioRegisters`] performs volatile 32-bit accesses on a mapped window.
//! - [`SimRegisters`] backs the block with atomics, for hosts without the
//!   hardware and for tests.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// 32-bit register access on a device I/O block
pub trait RegisterBus: Send + Sync {
    /// Size of the addressable block in bytes
    fn span(&self) -> usize;

    /// Read a 32-bit register
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register
    fn write32(&self, offset: usize, value: u32);

    /// Read-modify-write: clear `clear`, then set `set`
    fn modify32(&self, offset: usize, clear: u32, set: u32) {
        let value = self.read32(offset);
        self.write32(offset, (value & !clear) | set);
    }
}

/// ============================================================================
/// MMIO Registers
/// ============================================================================

/// Memory-mapped register window
#[derive(Debug)]
pub struct MmioRegisters {
    base: usize,
    len: usize,
}

impl MmioRegisters {
    /// Wrap a mapped register window
    ///
    /// # Safety
    ///
    /// `base..base + len` must be a live, device-memory mapping of the IOMMU
    /// register block for as long as this value exists, and must be 4-byte
    /// aligned.
    pub const unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Size of the window in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn addr(&self, offset: usize) -> usize {
        let in_window = matches!(offset.checked_add(4), Some(end) if end <= self.len);
        assert!(
            offset % 4 == 0 && in_window,
            "register offset {:#x} outside window of {:#x} bytes",
            offset,
            self.len
        );
        self.base + offset
    }
}

impl RegisterBus for MmioRegisters {
    fn span(&self) -> usize {
        self.len
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        let addr = self.addr(offset);
        // SAFETY: `new` guarantees the window is mapped and aligned.
        unsafe { core::ptr::read_volatile(addr as *const u32) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        let addr = self.addr(offset);
        // SAFETY: `new` guarantees the window is mapped and aligned.
        unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
    }
}

/// ============================================================================
/// Simulated Registers
/// ============================================================================

/// Register block backed by atomics
///
/// Bits registered with [`SimRegisters::self_clearing`] read back as zero
/// after any write, modelling command bits the hardware acknowledges by
/// clearing. [`SimRegisters::set_stuck`] freezes those bits instead, so a
/// poll on them never completes.
#[derive(Debug)]
pub struct SimRegisters {
    regs: Box<[AtomicU32]>,
    self_clearing: Vec<(usize, u32)>,
    stuck: AtomicBool,
    accesses: AtomicU64,
}

impl SimRegisters {
    /// Create a zeroed block of `len` bytes
    pub fn new(len: usize) -> Self {
        let words = (len + 3) / 4;
        Self {
            regs: (0..words).map(|_| AtomicU32::new(0)).collect(),
            self_clearing: Vec::new(),
            stuck: AtomicBool::new(false),
            accesses: AtomicU64::new(0),
        }
    }

    /// Mark `mask` at `offset` as self-clearing command bits
    pub fn self_clearing(mut self, offset: usize, mask: u32) -> Self {
        self.self_clearing.push((offset, mask));
        self
    }

    /// Freeze self-clearing bits so they never acknowledge
    pub fn set_stuck(&self, stuck: bool) {
        self.stuck.store(stuck, Ordering::Release);
    }

    /// Number of reads and writes performed so far
    pub fn access_count(&self) -> u64 {
        self.accesses.load(Ordering::Acquire)
    }

    /// Zero every register, as a power-domain collapse does
    pub fn power_loss(&self) {
        for reg in self.regs.iter() {
            reg.store(0, Ordering::Release);
        }
    }

    /// Peek at a register without counting the access
    pub fn peek(&self, offset: usize) -> u32 {
        self.slot(offset).load(Ordering::Acquire)
    }

    fn slot(&self, offset: usize) -> &AtomicU32 {
        assert!(offset % 4 == 0, "unaligned register offset {:#x}", offset);
        &self.regs[offset / 4]
    }

    fn clearing_mask(&self, offset: usize) -> u32 {
        self.self_clearing
            .iter()
            .filter(|(off, _)| *off == offset)
            .fold(0, |acc, (_, mask)| acc | mask)
    }
}

impl RegisterBus for SimRegisters {
    fn span(&self) -> usize {
        self.regs.len() * 4
    }

    fn read32(&self, offset: usize) -> u32 {
        self.accesses.fetch_add(1, Ordering::AcqRel);
        self.slot(offset).load(Ordering::Acquire)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.accesses.fetch_add(1, Ordering::AcqRel);
        let value = if self.stuck.load(Ordering::Acquire) {
            value
        } else {
            value & !self.clearing_mask(offset)
        };
        self.slot(offset).store(value, Ordering::Release);
    }
}
