// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Mapping Registry
//!
//! Records which IOVA ranges currently carry a live mapping and which buffer
//! description backs each one. The registry does not lock; the device holds
//! its map lock around every call.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use super::iova::IovaRange;
use super::pgtable::Prot;
use crate::err::{IommuError, Result};

/// One physically contiguous extent of a scatter-gather list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Physical base address
    pub phys: u64,
    /// Length in bytes
    pub len: u64,
}

impl SgEntry {
    /// Create an extent
    pub const fn new(phys: u64, len: u64) -> Self {
        Self { phys, len }
    }

    /// Whether the extent contains physical address `phys`
    pub const fn contains(&self, phys: u64) -> bool {
        phys >= self.phys && phys - self.phys < self.len
    }
}

/// A live association between an IOVA range and its backing buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    /// Mapped range
    pub range: IovaRange,
    /// Backing extents, in IOVA order
    pub sg: Vec<SgEntry>,
    /// Access permissions
    pub prot: Prot,
}

impl Mapping {
    /// Build a mapping record
    pub fn new(range: IovaRange, sg: &[SgEntry], prot: Prot) -> Self {
        Self {
            range,
            sg: sg.to_vec(),
            prot,
        }
    }

    /// Total bytes described by the scatter-gather list
    pub fn sg_len(&self) -> u64 {
        self.sg.iter().map(|e| e.len).sum()
    }

    /// Whether any backing extent contains physical address `phys`
    pub fn backs(&self, phys: u64) -> bool {
        self.sg.iter().any(|e| e.contains(phys))
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} ({} extents)", self.range, self.prot, self.sg.len())
    }
}

/// Live mappings of one device, keyed by range start
#[derive(Debug, Default)]
pub struct MappingRegistry {
    live: BTreeMap<u64, Mapping>,
}

impl MappingRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            live: BTreeMap::new(),
        }
    }

    /// Record a mapping
    ///
    /// Fails with `AlreadyMapped` if any live mapping overlaps its range.
    pub fn register(&mut self, mapping: Mapping) -> Result {
        if self.overlapping(mapping.range).is_some() {
            return Err(IommuError::AlreadyMapped);
        }
        self.live.insert(mapping.range.start, mapping);
        Ok(())
    }

    /// Remove and return the mapping of exactly `range`
    pub fn unregister(&mut self, range: IovaRange) -> Result<Mapping> {
        match self.live.get(&range.start) {
            Some(m) if m.range == range => {}
            _ => return Err(IommuError::NotMapped),
        }
        self.live.remove(&range.start).ok_or(IommuError::NotMapped)
    }

    /// Mapping of exactly `range`
    pub fn get(&self, range: IovaRange) -> Option<&Mapping> {
        self.live.get(&range.start).filter(|m| m.range == range)
    }

    /// Whether `range` carries a live mapping
    pub fn is_mapped(&self, range: IovaRange) -> bool {
        self.get(range).is_some()
    }

    /// Live mapping containing `iova`
    pub fn lookup(&self, iova: u64) -> Option<&Mapping> {
        self.live
            .range(..=iova)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.range.contains(iova))
    }

    /// Number of live mappings
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// Whether no mapping is live
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Iterate live mappings in IOVA order
    pub fn iter(&self) -> impl Iterator<Item = &Mapping> + '_ {
        self.live.values()
    }

    /// Remove every mapping
    pub fn drain(&mut self) -> Vec<Mapping> {
        core::mem::take(&mut self.live).into_values().collect()
    }

    fn overlapping(&self, range: IovaRange) -> Option<&Mapping> {
        self.live
            .range(..range.end())
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.range.overlaps(&range))
    }
}
