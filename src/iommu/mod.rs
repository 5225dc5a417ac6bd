// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IOMMU Manager
//!
//! Leaves first:
//!
//! - [`iova`] - first-fit allocator over the IOVA window
//! - [`pgtable`] - hardware page-table entries and their owner
//! - [`registry`] - live mappings and their backing buffers
//! - [`gate`] - power sequencing around register access
//! - [`snapshot`] - suspend/resume state blob
//! - [`hw`] - per-family register layouts
//! - [`device`] - generic device logic
//! - [`ops`] - uniform ops table and device registry
//!
//! A client allocates a range, maps a scatter-gather list onto it, runs DMA,
//! unmaps, and only then returns the physical pages to their allocator and
//! frees the range.

pub mod config;
pub mod device;
pub mod gate;
pub mod hw;
pub mod iova;
pub mod ops;
pub mod pgtable;
pub mod registry;
pub mod sim;
pub mod snapshot;

#[cfg(test)]
mod tests;

pub use config::{IommuConfig, IommuFlags, IommuId, PAGE_SIZE};
pub use device::{IommuDevice, IommuStats};
pub use gate::{DeviceGate, GateGuard, PowerDomain};
pub use hw::{DispMmu, GspMmu, HwVariant, MmMmu};
pub use iova::{IovaAllocator, IovaRange};
pub use ops::{IommuDeviceOps, IommuRegistry};
pub use pgtable::{PageTable, PageTableEntry, Prot, TableMemory, TableSource};
pub use registry::{Mapping, MappingRegistry, SgEntry};
pub use sim::SimPowerDomain;
pub use snapshot::Snapshot;
