// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IOVA Allocator
//!
//! Manages a device's flat IOVA window as a set of page-aligned extents.
//!
//! # Design
//!
//! - **Free extents** are kept coalesced, keyed by start address, so the
//!   lowest adequate extent is found by an in-order walk (first fit).
//! - **Outstanding ranges** are tracked exactly, so freeing a range that was
//!   never handed out (or was already returned) is rejected instead of
//!   corrupting the free set.
//!
//! The allocator does no hardware I/O and no locking of its own; the owning
//! device serializes access.

use alloc::collections::BTreeMap;
use core::fmt;

use crate::err::{IommuError, Result};

/// An allocated IOVA sub-range `[start, start + len)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IovaRange {
    /// First IOVA
    pub start: u64,
    /// Length in bytes
    pub len: u64,
}

impl IovaRange {
    /// Create a range
    pub const fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// One past the last IOVA
    pub const fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Whether `iova` falls inside the range
    pub const fn contains(&self, iova: u64) -> bool {
        iova >= self.start && iova < self.end()
    }

    /// Whether two ranges share at least one byte
    pub const fn overlaps(&self, other: &IovaRange) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Number of pages of `page_size` the range covers
    pub const fn pages(&self, page_size: u64) -> u64 {
        self.len / page_size
    }
}

impl fmt::Display for IovaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// First-fit extent allocator over one IOVA window
#[derive(Debug)]
pub struct IovaAllocator {
    /// Window start
    base: u64,
    /// Window size in bytes
    size: u64,
    /// Allocation granule
    page_size: u64,
    /// Free extents: start -> length, never adjacent
    free: BTreeMap<u64, u64>,
    /// Outstanding ranges: start -> length
    allocated: BTreeMap<u64, u64>,
    /// Total free bytes
    free_bytes: u64,
}

impl IovaAllocator {
    /// Create an allocator covering `[base, base + size)`
    ///
    /// # Arguments
    ///
    /// * `base` - Window start (page aligned)
    /// * `size` - Window size in bytes (page multiple)
    /// * `page_size` - Allocation granule (power of two)
    pub fn new(base: u64, size: u64, page_size: u64) -> Result<Self> {
        if page_size == 0 || !page_size.is_power_of_two() {
            return Err(IommuError::InvalidArgument);
        }
        let mask = page_size - 1;
        if size == 0 || base & mask != 0 || size & mask != 0 || base.checked_add(size).is_none() {
            return Err(IommuError::InvalidArgument);
        }

        let mut free = BTreeMap::new();
        free.insert(base, size);

        Ok(Self {
            base,
            size,
            page_size,
            free,
            allocated: BTreeMap::new(),
            free_bytes: size,
        })
    }

    /// Allocate `len` bytes, rounded up to the page size
    pub fn alloc(&mut self, len: u64) -> Result<IovaRange> {
        self.alloc_aligned(len, self.page_size)
    }

    /// Allocate `len` bytes starting on an `align` boundary
    ///
    /// Returns the lowest adequate extent. `align` below the page size is
    /// raised to the page size.
    pub fn alloc_aligned(&mut self, len: u64, align: u64) -> Result<IovaRange> {
        if len == 0 || align == 0 || !align.is_power_of_two() {
            return Err(IommuError::InvalidArgument);
        }
        let align = align.max(self.page_size);
        let len = align_up(len, self.page_size).ok_or(IommuError::OutOfSpace)?;
        if len > self.free_bytes {
            return Err(IommuError::OutOfSpace);
        }

        let found = self.free.iter().find_map(|(&start, &ext_len)| {
            let aligned = align_up(start, align)?;
            let end = aligned.checked_add(len)?;
            (end <= start + ext_len).then_some((start, ext_len, aligned))
        });
        let (ext_start, ext_len, start) = found.ok_or(IommuError::OutOfSpace)?;

        self.free.remove(&ext_start);
        if start > ext_start {
            self.free.insert(ext_start, start - ext_start);
        }
        let tail = start + len;
        let ext_end = ext_start + ext_len;
        if tail < ext_end {
            self.free.insert(tail, ext_end - tail);
        }

        self.allocated.insert(start, len);
        self.free_bytes -= len;
        Ok(IovaRange::new(start, len))
    }

    /// Return a range to the free pool, coalescing with its neighbours
    ///
    /// Fails with `InvalidRange` unless `range` is exactly an outstanding
    /// allocation.
    pub fn free(&mut self, range: IovaRange) -> Result {
        if !self.is_allocated(range) {
            return Err(IommuError::InvalidRange);
        }
        self.allocated.remove(&range.start);
        self.free_bytes += range.len;

        let mut start = range.start;
        let mut len = range.len;

        let prev = self
            .free
            .range(..start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.free.remove(&(start + len)) {
            len += next_len;
        }

        self.free.insert(start, len);
        Ok(())
    }

    /// Whether `range` is exactly an outstanding allocation
    pub fn is_allocated(&self, range: IovaRange) -> bool {
        self.allocated.get(&range.start) == Some(&range.len)
    }

    /// Outstanding allocation containing `iova`
    pub fn lookup(&self, iova: u64) -> Option<IovaRange> {
        self.allocated
            .range(..=iova)
            .next_back()
            .map(|(&start, &len)| IovaRange::new(start, len))
            .filter(|r| r.contains(iova))
    }

    /// Iterate outstanding allocations in address order
    pub fn outstanding(&self) -> impl Iterator<Item = IovaRange> + '_ {
        self.allocated
            .iter()
            .map(|(&start, &len)| IovaRange::new(start, len))
    }

    /// Number of outstanding allocations
    pub fn outstanding_count(&self) -> usize {
        self.allocated.len()
    }

    /// Total free bytes
    pub fn free_bytes(&self) -> u64 {
        self.free_bytes
    }

    /// Largest single free extent
    pub fn largest_free(&self) -> u64 {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Drop every allocation and restore the empty window
    pub fn reset(&mut self) {
        self.allocated.clear();
        self.free.clear();
        self.free.insert(self.base, self.size);
        self.free_bytes = self.size;
    }

    /// Dump allocator state for debugging
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        writeln!(
            out,
            "iova window [{:#x}, {:#x}) free {:#x}/{:#x}",
            self.base,
            self.base + self.size,
            self.free_bytes,
            self.size
        )?;
        for range in self.outstanding() {
            writeln!(out, "  used {}", range)?;
        }
        for (&start, &len) in &self.free {
            writeln!(out, "  free {}", IovaRange::new(start, len))?;
        }
        Ok(())
    }
}

/// Round `value` up to a power-of-two `align`
fn align_up(value: u64, align: u64) -> Option<u64> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}
