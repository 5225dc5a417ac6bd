// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Hardware Variants
//!
//! The generic device logic is shared by every MMU instance; what differs is
//! the control-register layout and a handful of quirks. Each family supplies
//! a [`HwVariant`].
//!
//! | Variant | Registers (from `ctrl_reg`) | Table | TLB flush |
//! |---------|-----------------------------|-------|-----------|
//! | [`GspMmu`] | `CTRL` | MMU SRAM, window start in `CTRL[31:28]` | toggle `TLB_EN` |
//! | [`MmMmu`] | `CTRL`, `IOVA_BASE`, `PGT_LO`, `PGT_HI`, `TLB_INV` | DRAM | `TLB_INV` poll |
//! | [`DispMmu`] | `CTRL`, `PGT_BASE`, `IOVA_BASE`, `TLB_INV` | DRAM (32-bit) | `TLB_INV` poll (rev >= 2), else toggle |

use alloc::vec;
use alloc::vec::Vec;

use super::config::{IommuConfig, IommuFlags};
use crate::err::{IommuError, Result};
use crate::reg::RegisterBus;

/// Translation enable
pub const MMU_EN: u32 = 1 << 0;

/// TLB enable
pub const MMU_TLB_EN: u32 = 1 << 1;

/// Half-rate page-table RAM clock
pub const MMU_RAMCLK_DIV2_EN: u32 = 1 << 2;

/// Window start field of the GSP control register
pub const MMU_START_MB_ADDR_MASK: u32 = 0xf000_0000;

/// TLB invalidate command bit (self-clearing)
pub const MMU_TLB_INV: u32 = 1 << 0;

/// Per-family register layout and quirks
pub trait HwVariant: Send + Sync {
    /// Family name
    fn kind(&self) -> &'static str;

    /// Reject geometry this family cannot express
    fn check_config(&self, _config: &IommuConfig) -> Result {
        Ok(())
    }

    /// Program the table location and turn translation on
    fn enable(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result;

    /// Turn translation off
    fn disable(&self, regs: &dyn RegisterBus, config: &IommuConfig) {
        regs.modify32(config.ctrl_reg, MMU_EN | MMU_TLB_EN, 0);
    }

    /// Drop cached translations
    fn flush_tlb(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result;

    /// Registers lost on power-down, in restore order
    fn saved_registers(&self, config: &IommuConfig) -> Vec<usize>;

    /// One past the last byte of the register block, from offset 0
    fn register_span(&self, config: &IommuConfig) -> Option<usize>;

    /// Value to write back for a saved register
    ///
    /// The enable bits of the control register follow `enabled`, whatever
    /// they were when the register was saved.
    fn replay_value(&self, config: &IommuConfig, offset: usize, value: u32, enabled: bool) -> u32 {
        if offset != config.ctrl_reg {
            return value;
        }
        if enabled {
            value | MMU_EN | MMU_TLB_EN
        } else {
            value & !(MMU_EN | MMU_TLB_EN)
        }
    }

    /// Whether translation is on
    fn is_enabled(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> bool {
        regs.read32(config.ctrl_reg) & MMU_EN != 0
    }
}

fn ctrl_value(config: &IommuConfig) -> u32 {
    let mut ctrl = MMU_EN | MMU_TLB_EN;
    if config.flags.contains(IommuFlags::RAMCLK_DIV2) {
        ctrl |= MMU_RAMCLK_DIV2_EN;
    }
    ctrl
}

fn toggle_tlb(regs: &dyn RegisterBus, config: &IommuConfig) {
    regs.modify32(config.ctrl_reg, MMU_TLB_EN, 0);
    regs.modify32(config.ctrl_reg, 0, MMU_TLB_EN);
}

fn invalidate_tlb(regs: &dyn RegisterBus, config: &IommuConfig, offset: usize) -> Result {
    regs.write32(offset, MMU_TLB_INV);
    for _ in 0..config.power_poll_limit {
        if regs.read32(offset) & MMU_TLB_INV == 0 {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    log_error!(target: config.name, "tlb invalidate not acknowledged");
    Err(IommuError::HardwareFault)
}

/// ============================================================================
/// GSP (graphics) MMU
/// ============================================================================

/// Graphics MMU: one control register, table in MMU-local SRAM
#[derive(Debug, Default, Clone, Copy)]
pub struct GspMmu;

impl HwVariant for GspMmu {
    fn kind(&self) -> &'static str {
        "gsp-mmu"
    }

    fn check_config(&self, config: &IommuConfig) -> Result {
        // The window start is encoded in 4 bits: 256MB aligned below 4GB.
        let aligned = config.iova_base & !(MMU_START_MB_ADDR_MASK as u64) == 0;
        if !aligned || config.iova_end() > 1 << 32 {
            return Err(IommuError::InvalidArgument);
        }
        Ok(())
    }

    fn enable(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result {
        let start = (config.iova_base as u32) & MMU_START_MB_ADDR_MASK;
        regs.write32(config.ctrl_reg, start | ctrl_value(config));
        Ok(())
    }

    fn flush_tlb(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result {
        toggle_tlb(regs, config);
        Ok(())
    }

    fn saved_registers(&self, config: &IommuConfig) -> Vec<usize> {
        vec![config.ctrl_reg]
    }

    fn register_span(&self, config: &IommuConfig) -> Option<usize> {
        config.ctrl_reg.checked_add(4)
    }
}

/// ============================================================================
/// MM (multimedia) MMU
/// ============================================================================

/// Multimedia MMU register offsets from `ctrl_reg`
pub mod mm_regs {
    /// Control
    pub const CTRL: usize = 0x00;
    /// Window start
    pub const IOVA_BASE: usize = 0x04;
    /// Page-table base, low word
    pub const PGT_LO: usize = 0x08;
    /// Page-table base, high word
    pub const PGT_HI: usize = 0x0c;
    /// TLB invalidate
    pub const TLB_INV: usize = 0x10;
}

/// Multimedia MMU: table in DRAM, 64-bit table base
#[derive(Debug, Default, Clone, Copy)]
pub struct MmMmu;

impl HwVariant for MmMmu {
    fn kind(&self) -> &'static str {
        "mm-mmu"
    }

    fn check_config(&self, config: &IommuConfig) -> Result {
        if config.iova_end() > 1 << 32 {
            return Err(IommuError::InvalidArgument);
        }
        Ok(())
    }

    fn enable(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result {
        let base = config.ctrl_reg;
        regs.write32(base + mm_regs::IOVA_BASE, config.iova_base as u32);
        regs.write32(base + mm_regs::PGT_LO, config.pgt_base as u32);
        regs.write32(base + mm_regs::PGT_HI, (config.pgt_base >> 32) as u32);
        regs.write32(base + mm_regs::CTRL, ctrl_value(config));
        invalidate_tlb(regs, config, base + mm_regs::TLB_INV)
    }

    fn flush_tlb(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result {
        invalidate_tlb(regs, config, config.ctrl_reg + mm_regs::TLB_INV)
    }

    fn saved_registers(&self, config: &IommuConfig) -> Vec<usize> {
        let base = config.ctrl_reg;
        vec![
            base + mm_regs::IOVA_BASE,
            base + mm_regs::PGT_LO,
            base + mm_regs::PGT_HI,
            base + mm_regs::CTRL,
        ]
    }

    fn register_span(&self, config: &IommuConfig) -> Option<usize> {
        config.ctrl_reg.checked_add(mm_regs::TLB_INV + 4)
    }
}

/// ============================================================================
/// DISP (display) MMU
/// ============================================================================

/// Display MMU register offsets from `ctrl_reg`
pub mod disp_regs {
    /// Control
    pub const CTRL: usize = 0x00;
    /// Page-table base (32-bit)
    pub const PGT_BASE: usize = 0x04;
    /// Window start
    pub const IOVA_BASE: usize = 0x08;
    /// TLB invalidate (revision 2 and later)
    pub const TLB_INV: usize = 0x0c;
}

/// First display MMU revision with a TLB invalidate register
pub const DISP_TLB_INV_REVISION: u32 = 2;

/// Display MMU: 32-bit table base, TLB invalidate from revision 2
#[derive(Debug, Default, Clone, Copy)]
pub struct DispMmu;

impl HwVariant for DispMmu {
    fn kind(&self) -> &'static str {
        "disp-mmu"
    }

    fn check_config(&self, config: &IommuConfig) -> Result {
        if config.pgt_base > u32::MAX as u64 || config.iova_end() > 1 << 32 {
            return Err(IommuError::InvalidArgument);
        }
        Ok(())
    }

    fn enable(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result {
        let base = config.ctrl_reg;
        regs.write32(base + disp_regs::PGT_BASE, config.pgt_base as u32);
        regs.write32(base + disp_regs::IOVA_BASE, config.iova_base as u32);
        regs.write32(base + disp_regs::CTRL, ctrl_value(config));
        self.flush_tlb(regs, config)
    }

    fn flush_tlb(&self, regs: &dyn RegisterBus, config: &IommuConfig) -> Result {
        if config.revision >= DISP_TLB_INV_REVISION {
            invalidate_tlb(regs, config, config.ctrl_reg + disp_regs::TLB_INV)
        } else {
            toggle_tlb(regs, config);
            Ok(())
        }
    }

    fn saved_registers(&self, config: &IommuConfig) -> Vec<usize> {
        let base = config.ctrl_reg;
        vec![
            base + disp_regs::PGT_BASE,
            base + disp_regs::IOVA_BASE,
            base + disp_regs::CTRL,
        ]
    }

    fn register_span(&self, config: &IommuConfig) -> Option<usize> {
        config.ctrl_reg.checked_add(disp_regs::TLB_INV + 4)
    }
}
