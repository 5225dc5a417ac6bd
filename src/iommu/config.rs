// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IOMMU Init Data
//!
//! Geometry handed to a device at probe time: IOVA window, page-table
//! placement, control-register offset and quirk flags. The core never parses
//! device trees; the platform glue fills in an [`IommuConfig`] and the device
//! treats it as immutable for its whole lifetime.

use crate::err::{IommuError, Result};

/// Default IOMMU page size (4KB)
pub const PAGE_SIZE: u64 = 4096;

/// Default IOMMU page shift
pub const PAGE_SHIFT: u32 = 12;

/// Width of one hardware page-table entry in bytes
pub const PTE_SIZE: u64 = 4;

/// Default number of polls before a power or TLB wait gives up
pub const DEFAULT_POWER_POLL_LIMIT: u32 = 1000;

/// Hardware IOMMU instance identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IommuId {
    /// Graphics (GSP blender) MMU
    Gsp,

    /// Multimedia (codec/ISP) MMU
    Mm,

    /// Display controller MMU
    Disp,
}

impl IommuId {
    /// All known instances
    pub const ALL: [IommuId; 3] = [IommuId::Gsp, IommuId::Mm, IommuId::Disp];

    /// Short instance name, used as the log target
    pub const fn name(self) -> &'static str {
        match self {
            IommuId::Gsp => "gsp",
            IommuId::Mm => "mm",
            IommuId::Disp => "disp",
        }
    }
}

bitflags::bitflags! {
    /// Per-instance hardware quirks
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IommuFlags: u32 {
        /// Page table lives in MMU-local SRAM and is lost on power-down
        ///
        /// `disable` saves the device state and the next `enable` replays it.
        const BACKUP_ON_SUSPEND = 1 << 0;

        /// Page-table RAM must be clocked at half rate
        const RAMCLK_DIV2 = 1 << 1;
    }
}

/// Immutable IOMMU configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IommuConfig {
    /// Instance identifier
    pub id: IommuId,

    /// Instance name (log target)
    pub name: &'static str,

    /// First IOVA of the window
    pub iova_base: u64,

    /// Window size in bytes
    pub iova_size: u64,

    /// Physical address of the page table as programmed into the MMU
    pub pgt_base: u64,

    /// Page-table size in bytes
    pub pgt_size: u64,

    /// Offset of the control register inside the I/O block
    pub ctrl_reg: usize,

    /// Hardware revision
    pub revision: u32,

    /// Quirk flags
    pub flags: IommuFlags,

    /// Translation granule in bytes
    pub page_size: u64,

    /// Poll budget for power and TLB waits
    pub power_poll_limit: u32,
}

impl IommuConfig {
    /// Create a configuration with a page table sized to cover the window
    ///
    /// # Arguments
    ///
    /// * `id` - Instance identifier
    /// * `iova_base` - First IOVA of the window
    /// * `iova_size` - Window size in bytes
    /// * `pgt_base` - Physical address of the page table
    /// * `ctrl_reg` - Control register offset
    pub fn new(id: IommuId, iova_base: u64, iova_size: u64, pgt_base: u64, ctrl_reg: usize) -> Self {
        Self {
            id,
            name: id.name(),
            iova_base,
            iova_size,
            pgt_base,
            pgt_size: (iova_size / PAGE_SIZE) * PTE_SIZE,
            ctrl_reg,
            revision: 0,
            flags: IommuFlags::empty(),
            page_size: PAGE_SIZE,
            power_poll_limit: DEFAULT_POWER_POLL_LIMIT,
        }
    }

    /// Override the instance name
    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Set quirk flags
    pub fn with_flags(mut self, flags: IommuFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the hardware revision
    pub fn with_revision(mut self, revision: u32) -> Self {
        self.revision = revision;
        self
    }

    /// Set the translation granule; the page table is resized to match
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        if page_size != 0 {
            self.pgt_size = (self.iova_size / page_size) * PTE_SIZE;
        }
        self
    }

    /// Set an explicit page-table size in bytes
    pub fn with_pgt_size(mut self, pgt_size: u64) -> Self {
        self.pgt_size = pgt_size;
        self
    }

    /// Set the poll budget for power and TLB waits
    pub fn with_power_poll_limit(mut self, limit: u32) -> Self {
        self.power_poll_limit = limit;
        self
    }

    /// Number of translation pages in the window
    pub fn page_count(&self) -> u64 {
        self.iova_size / self.page_size
    }

    /// log2 of the page size
    pub fn page_shift(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// One past the last IOVA of the window
    pub fn iova_end(&self) -> u64 {
        self.iova_base + self.iova_size
    }

    /// Number of entries the page table can hold
    pub fn pgt_entries(&self) -> u64 {
        self.pgt_size / PTE_SIZE
    }

    /// Check the geometry for consistency
    pub fn validate(&self) -> Result {
        if self.page_size < PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(IommuError::InvalidArgument);
        }
        let mask = self.page_size - 1;
        if self.iova_size == 0 || self.iova_size & mask != 0 || self.iova_base & mask != 0 {
            return Err(IommuError::InvalidArgument);
        }
        if self.iova_base.checked_add(self.iova_size).is_none() {
            return Err(IommuError::InvalidArgument);
        }
        if self.pgt_base & (PTE_SIZE - 1) != 0 || self.pgt_size % PTE_SIZE != 0 {
            return Err(IommuError::InvalidArgument);
        }
        if self.pgt_entries() < self.page_count() {
            return Err(IommuError::InvalidArgument);
        }
        if self.ctrl_reg % 4 != 0 || self.power_poll_limit == 0 {
            return Err(IommuError::InvalidArgument);
        }
        Ok(())
    }
}
