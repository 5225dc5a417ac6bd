// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! SPRD/Exynos IOMMU Manager
//!
//! This crate manages the translation state of the multimedia IOMMUs found on
//! SPRD and Exynos phone SoCs (graphics, multimedia and display MMUs). Each
//! hardware instance owns a flat IOVA window, a single-level page table walked
//! by the MMU, and a control-register block that lives inside a power-gateable
//! clock domain.
//!
//! # Organization
//!
//! - [`err`] - Error taxonomy and result type
//! - [`debug`] - Logging macros
//! - [`reg`] - Register bus abstraction (MMIO and simulated)
//! - [`iommu`] - Allocator, page table, registry, power gate, variants, dispatch
//!
//! # Usage
//!
//! ```rust,ignore
//! let mut registry = IommuRegistry::new();
//! registry.register(Box::new(device))?;
//!
//! let gsp = registry.get(IommuId::Gsp)?;
//! gsp.init()?;
//! let range = gsp.iova_alloc(2 * PAGE_SIZE)?;
//! gsp.iova_map(range, &sg, Prot::READ | Prot::WRITE)?;
//! // ... DMA ...
//! let mapping = gsp.iova_unmap(range)?;
//! gsp.iova_free(range)?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod debug;

pub mod err;
pub mod iommu;
pub mod reg;

pub use err::{IommuError, Result};
pub use iommu::{
    DeviceGate, DispMmu, GspMmu, HwVariant, IommuConfig, IommuDevice, IommuDeviceOps, IommuFlags,
    IommuId, IommuRegistry, IommuStats, IovaAllocator, IovaRange, Mapping, MmMmu, PageTable,
    PowerDomain, Prot, SgEntry, PAGE_SIZE,
};
pub use reg::{MmioRegisters, RegisterBus, SimRegisters};
