// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IOMMU Ops Table and Registry
//!
//! Clients see every MMU instance through [`IommuDeviceOps`], whatever its
//! register layout. The [`IommuRegistry`] is built once by the platform and
//! handed to clients explicitly; there is no global instance.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::fmt;

use super::config::IommuId;
use super::device::{IommuDevice, IommuStats};
use super::iova::IovaRange;
use super::pgtable::Prot;
use super::registry::{Mapping, SgEntry};
use crate::err::{IommuError, Result};

/// Uniform per-instance interface
pub trait IommuDeviceOps: Send + Sync {
    /// Instance identifier
    fn id(&self) -> IommuId;

    // Init / teardown

    /// Allocate the IOVA pool and page table
    fn init(&self) -> Result;

    /// Tear down mappings and release the pool and table
    fn exit(&self) -> Result;

    // IOVA operations

    /// Reserve a range of at least `len` bytes
    fn iova_alloc(&self, len: u64) -> Result<IovaRange>;

    /// Return an unmapped range
    fn iova_free(&self, range: IovaRange) -> Result;

    /// Map `range` onto the pages of `sg`
    fn iova_map(&self, range: IovaRange, sg: &[SgEntry], prot: Prot) -> Result;

    /// Unmap `range`, returning its mapping
    fn iova_unmap(&self, range: IovaRange) -> Result<Mapping>;

    // Power operations

    /// Save state lost on power-down
    fn backup(&self) -> Result;

    /// Replay saved state
    fn restore(&self) -> Result;

    /// Switch translation on
    fn enable(&self) -> Result;

    /// Switch translation off
    fn disable(&self) -> Result;

    // Diagnostics

    /// Print state and the entries covering `[iova, iova + len)`
    fn dump(&self, iova: u64, len: u64, out: &mut dyn fmt::Write) -> Result;

    /// Counters
    fn stats(&self) -> IommuStats;
}

impl IommuDeviceOps for IommuDevice {
    fn id(&self) -> IommuId {
        IommuDevice::id(self)
    }

    fn init(&self) -> Result {
        IommuDevice::init(self)
    }

    fn exit(&self) -> Result {
        IommuDevice::exit(self)
    }

    fn iova_alloc(&self, len: u64) -> Result<IovaRange> {
        IommuDevice::iova_alloc(self, len)
    }

    fn iova_free(&self, range: IovaRange) -> Result {
        IommuDevice::iova_free(self, range)
    }

    fn iova_map(&self, range: IovaRange, sg: &[SgEntry], prot: Prot) -> Result {
        IommuDevice::iova_map(self, range, sg, prot)
    }

    fn iova_unmap(&self, range: IovaRange) -> Result<Mapping> {
        IommuDevice::iova_unmap(self, range)
    }

    fn backup(&self) -> Result {
        IommuDevice::backup(self)
    }

    fn restore(&self) -> Result {
        IommuDevice::restore(self)
    }

    fn enable(&self) -> Result {
        IommuDevice::enable(self)
    }

    fn disable(&self) -> Result {
        IommuDevice::disable(self)
    }

    fn dump(&self, iova: u64, len: u64, out: &mut dyn fmt::Write) -> Result {
        IommuDevice::dump(self, iova, len, out)
    }

    fn stats(&self) -> IommuStats {
        IommuDevice::stats(self)
    }
}

/// Devices keyed by instance
#[derive(Default)]
pub struct IommuRegistry {
    devices: BTreeMap<IommuId, Box<dyn IommuDeviceOps>>,
}

impl fmt::Debug for IommuRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.devices.keys()).finish()
    }
}

impl IommuRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            devices: BTreeMap::new(),
        }
    }

    /// Add a device; one per instance
    pub fn register(&mut self, device: Box<dyn IommuDeviceOps>) -> Result {
        let id = device.id();
        if self.devices.contains_key(&id) {
            return Err(IommuError::AlreadyInitialized);
        }
        log_debug!(target: id.name(), "registered");
        self.devices.insert(id, device);
        Ok(())
    }

    /// Device for `id`
    pub fn get(&self, id: IommuId) -> Result<&dyn IommuDeviceOps> {
        self.devices
            .get(&id)
            .map(|d| d.as_ref())
            .ok_or(IommuError::NotInitialized)
    }

    /// Remove the device for `id`
    pub fn remove(&mut self, id: IommuId) -> Option<Box<dyn IommuDeviceOps>> {
        self.devices.remove(&id)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is registered
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Iterate devices in id order
    pub fn iter(&self) -> impl Iterator<Item = &dyn IommuDeviceOps> + '_ {
        self.devices.values().map(|d| d.as_ref())
    }

    /// Tear down every initialized device; the first failure is returned
    pub fn exit_all(&self) -> Result {
        let mut res = Ok(());
        for dev in self.iter() {
            match dev.exit() {
                Ok(()) | Err(IommuError::NotInitialized) => {}
                Err(err) => res = res.and(Err(err)),
            }
        }
        res
    }
}
