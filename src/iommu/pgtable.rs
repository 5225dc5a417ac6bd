// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IOMMU Page Table
//!
//! SPRD/Exynos multimedia MMUs walk a single-level table: one 32-bit entry
//! per IOVA page of the window, indexed by `(iova - iova_base) >> page_shift`.
//!
//! # Entry Format
//!
//! | Bits | Field |
//! |------|-------|
//! | 31:8 | Physical page number (`phys >> 12`) |
//! | 7:3  | Reserved, zero |
//! | 2    | Write permitted |
//! | 1    | Read permitted |
//! | 0    | Valid |
//!
//! An all-zero entry is invalid.
//!
//! # Ordering
//!
//! Map writes every entry and reads it back before the mapping is reported;
//! a failed read-back rolls the whole range back to invalid. Unmap zeroes the
//! entries before the caller gets its buffer description back, so a physical
//! page is never returned to its allocator while an entry still targets it.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{fence, Ordering};

use super::config::IommuConfig;
use super::iova::IovaRange;
use super::registry::SgEntry;
use crate::err::{IommuError, Result};

/// Shift of the physical page number inside an entry
const PTE_PFN_SHIFT: u32 = 8;

/// Hardware page granule the PFN is expressed in
const PTE_PFN_PAGE_SHIFT: u32 = 12;

/// Highest physical address an entry can encode (36 bits)
pub const PTE_MAX_PHYS: u64 = 1 << (32 - PTE_PFN_SHIFT + PTE_PFN_PAGE_SHIFT);

bitflags::bitflags! {
    /// Access permissions of a mapping
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        /// Device may read
        const READ = 1 << 1;
        /// Device may write
        const WRITE = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Low bits of a page-table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Entry is valid
        const VALID = 1 << 0;
        /// Read permitted
        const READ = 1 << 1;
        /// Write permitted
        const WRITE = 1 << 2;
    }
}

/// One hardware page-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// The invalid entry
    pub const INVALID: Self = Self(0);

    /// Encode a valid entry for `phys`
    pub fn new(phys: u64, prot: Prot) -> Result<Self> {
        if phys & ((1 << PTE_PFN_PAGE_SHIFT) - 1) != 0 || phys >= PTE_MAX_PHYS {
            return Err(IommuError::InvalidArgument);
        }
        let pfn = (phys >> PTE_PFN_PAGE_SHIFT) as u32;
        let flags = PteFlags::VALID | PteFlags::from_bits_truncate(prot.bits());
        Ok(Self((pfn << PTE_PFN_SHIFT) | flags.bits()))
    }

    /// Build from a raw table word
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw table word
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether the hardware will translate through this entry
    pub const fn is_valid(self) -> bool {
        self.0 & PteFlags::VALID.bits() != 0
    }

    /// Target physical page
    pub const fn phys(self) -> u64 {
        ((self.0 >> PTE_PFN_SHIFT) as u64) << PTE_PFN_PAGE_SHIFT
    }

    /// Permissions recorded in the entry
    pub fn prot(self) -> Prot {
        Prot::from_bits_truncate(self.0)
    }
}

/// ============================================================================
/// Table Memory
/// ============================================================================

/// Backing store of the hardware-walked table
///
/// Implementations decide where the words live: CPU-visible DRAM, MMU-local
/// SRAM behind an I/O mapping, or plain heap for hosts.
pub trait TableMemory: Send {
    /// Number of 32-bit entries
    fn entries(&self) -> usize;

    /// Read one entry word
    fn read(&self, index: usize) -> u32;

    /// Write one entry word
    fn write(&mut self, index: usize, value: u32);

    /// Make prior writes visible to the table walker
    fn sync(&mut self) {
        fence(Ordering::SeqCst);
    }
}

/// Allocator of page-table memory, consulted once at device init
pub trait TableSource: Send + Sync {
    /// Allocate a zeroed table for `config`
    fn allocate(&self, config: &IommuConfig) -> Result<Box<dyn TableMemory>>;
}

/// Heap-backed table memory
#[derive(Debug, Clone)]
pub struct HeapTable {
    words: Vec<u32>,
}

impl HeapTable {
    /// Create a zeroed table of `entries` words
    pub fn new(entries: usize) -> Self {
        Self { words: vec![0; entries] }
    }
}

impl TableMemory for HeapTable {
    fn entries(&self) -> usize {
        self.words.len()
    }

    fn read(&self, index: usize) -> u32 {
        self.words[index]
    }

    fn write(&mut self, index: usize, value: u32) {
        self.words[index] = value;
    }
}

/// [`TableSource`] handing out [`HeapTable`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapTableSource;

impl TableSource for HeapTableSource {
    fn allocate(&self, config: &IommuConfig) -> Result<Box<dyn TableMemory>> {
        Ok(Box::new(HeapTable::new(config.pgt_entries() as usize)))
    }
}

/// ============================================================================
/// Page Table Manager
/// ============================================================================

/// Software owner of one device's translation table
pub struct PageTable {
    /// Backing words
    mem: Box<dyn TableMemory>,
    /// IOVA translated by entry 0
    iova_base: u64,
    /// Number of entries covering the window
    window_pages: usize,
    /// Translation granule
    page_size: u64,
    /// log2 of `page_size`
    page_shift: u32,
    /// Number of valid entries
    valid: usize,
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("iova_base", &self.iova_base)
            .field("window_pages", &self.window_pages)
            .field("page_size", &self.page_size)
            .field("valid", &self.valid)
            .finish()
    }
}

impl PageTable {
    /// Take ownership of `mem` and invalidate every entry
    pub fn new(config: &IommuConfig, mem: Box<dyn TableMemory>) -> Result<Self> {
        let window_pages = config.page_count() as usize;
        if mem.entries() < window_pages {
            return Err(IommuError::InvalidArgument);
        }

        let mut table = Self {
            mem,
            iova_base: config.iova_base,
            window_pages,
            page_size: config.page_size,
            page_shift: config.page_shift(),
            valid: 0,
        };
        table.clear_all()?;
        Ok(table)
    }

    /// Number of entries covering the window
    pub fn len(&self) -> usize {
        self.window_pages
    }

    /// Whether the table covers no pages
    pub fn is_empty(&self) -> bool {
        self.window_pages == 0
    }

    /// Number of valid entries
    pub fn valid_count(&self) -> usize {
        self.valid
    }

    /// Entry at `index`
    pub fn entry(&self, index: usize) -> PageTableEntry {
        PageTableEntry::from_raw(self.mem.read(index))
    }

    /// Entry translating `iova`
    pub fn entry_for(&self, iova: u64) -> Result<PageTableEntry> {
        Ok(self.entry(self.index_of(iova)?))
    }

    /// IOVA translated by entry `index`
    pub fn iova_of(&self, index: usize) -> u64 {
        self.iova_base + ((index as u64) << self.page_shift)
    }

    /// Translate `iova` to a physical address
    pub fn translate(&self, iova: u64) -> Option<u64> {
        let entry = self.entry_for(iova).ok()?;
        if !entry.is_valid() {
            return None;
        }
        let offset = iova & (self.page_size - 1);
        Some(entry.phys() + offset)
    }

    /// Write entries mapping `range` onto the pages of `sg`, in order
    ///
    /// Nothing is written unless `sg` covers `range` page for page and every
    /// target entry is currently invalid. A read-back mismatch rolls every
    /// entry of `range` back to invalid and fails with `HardwareFault`.
    pub fn map(&mut self, range: IovaRange, sg: &[SgEntry], prot: Prot) -> Result {
        let first = self.range_indices(range)?;
        let pages = range.pages(self.page_size) as usize;

        let mut total: u64 = 0;
        for seg in sg {
            if seg.len == 0 || !self.is_aligned(seg.phys) || !self.is_aligned(seg.len) {
                return Err(IommuError::InvalidArgument);
            }
            let end = seg.phys.checked_add(seg.len).ok_or(IommuError::InvalidArgument)?;
            if end > PTE_MAX_PHYS {
                return Err(IommuError::InvalidArgument);
            }
            total = total.checked_add(seg.len).ok_or(IommuError::SizeMismatch)?;
        }
        if total != range.len {
            return Err(IommuError::SizeMismatch);
        }
        if (first..first + pages).any(|i| self.entry(i).is_valid()) {
            return Err(IommuError::AlreadyMapped);
        }

        let page_size = self.page_size;
        let phys_pages = sg
            .iter()
            .flat_map(|seg| (0..seg.len / page_size).map(move |i| seg.phys + i * page_size));

        for (offset, phys) in phys_pages.enumerate() {
            let index = first + offset;
            let entry = PageTableEntry::new(phys, prot)?;
            self.mem.write(index, entry.raw());
            if self.mem.read(index) != entry.raw() {
                log_warn!(
                    "pgt: entry {} for iova {:#x} did not stick, rolling back {}",
                    index,
                    self.iova_of(index),
                    range
                );
                self.invalidate(first, pages);
                self.mem.sync();
                return Err(IommuError::HardwareFault);
            }
            self.valid += 1;
        }

        self.mem.sync();
        Ok(())
    }

    /// Invalidate every entry covering `range`
    ///
    /// Unmapping entries that are already invalid is a no-op. Returns the
    /// number of entries that were valid.
    pub fn unmap(&mut self, range: IovaRange) -> Result<usize> {
        let first = self.range_indices(range)?;
        let pages = range.pages(self.page_size) as usize;

        let was_valid = (first..first + pages)
            .filter(|&i| self.entry(i).is_valid())
            .count();
        let stuck = self.invalidate(first, pages);
        self.mem.sync();

        if stuck != 0 {
            return Err(IommuError::HardwareFault);
        }
        Ok(was_valid)
    }

    /// Invalidate the whole table
    pub fn clear_all(&mut self) -> Result {
        let stuck = self.invalidate(0, self.mem.entries());
        self.valid = (0..self.window_pages)
            .filter(|&i| self.entry(i).is_valid())
            .count();
        self.mem.sync();
        if stuck != 0 {
            return Err(IommuError::HardwareFault);
        }
        Ok(())
    }

    /// Copy of every window entry
    pub fn save(&self) -> Vec<u32> {
        (0..self.window_pages).map(|i| self.mem.read(i)).collect()
    }

    /// Rewrite the window from `words`, verifying each entry
    pub fn load(&mut self, words: &[u32]) -> Result {
        if words.len() != self.window_pages {
            return Err(IommuError::InvalidArgument);
        }
        self.valid = 0;
        for (index, &word) in words.iter().enumerate() {
            self.mem.write(index, word);
            if self.mem.read(index) != word {
                self.invalidate(0, self.window_pages);
                self.mem.sync();
                return Err(IommuError::HardwareFault);
            }
            if PageTableEntry::from_raw(word).is_valid() {
                self.valid += 1;
            }
        }
        self.mem.sync();
        Ok(())
    }

    /// Print the entries covering `range`
    pub fn dump(&self, range: IovaRange, out: &mut dyn fmt::Write) -> Result {
        let first = self.range_indices(range)?;
        let pages = range.pages(self.page_size) as usize;
        for index in first..first + pages {
            let entry = self.entry(index);
            let line = if entry.is_valid() {
                writeln!(
                    out,
                    "  {:#010x} -> {:#011x} {:?}",
                    self.iova_of(index),
                    entry.phys(),
                    entry.prot()
                )
            } else {
                writeln!(out, "  {:#010x} -> invalid", self.iova_of(index))
            };
            line.map_err(|_| IommuError::InvalidArgument)?;
        }
        Ok(())
    }

    /// Zero `count` entries from `first`; returns how many refused to clear
    fn invalidate(&mut self, first: usize, count: usize) -> usize {
        let mut stuck = 0;
        for index in first..first + count {
            let was_valid = self.entry(index).is_valid();
            self.mem.write(index, PageTableEntry::INVALID.raw());
            let now_valid = self.entry(index).is_valid();
            if now_valid {
                stuck += 1;
                log_error!("pgt: entry {} refused invalidation", index);
            }
            if was_valid && !now_valid && index < self.window_pages {
                self.valid = self.valid.saturating_sub(1);
            }
        }
        stuck
    }

    /// First entry index of a page-aligned range inside the window
    fn range_indices(&self, range: IovaRange) -> Result<usize> {
        if range.len == 0 || !self.is_aligned(range.start) || !self.is_aligned(range.len) {
            return Err(IommuError::InvalidArgument);
        }
        let first = self.index_of(range.start)?;
        let pages = range.pages(self.page_size) as usize;
        if first + pages > self.window_pages {
            return Err(IommuError::InvalidRange);
        }
        Ok(first)
    }

    fn index_of(&self, iova: u64) -> Result<usize> {
        let offset = iova.checked_sub(self.iova_base).ok_or(IommuError::InvalidRange)?;
        let index = (offset >> self.page_shift) as usize;
        if index >= self.window_pages {
            return Err(IommuError::InvalidRange);
        }
        Ok(index)
    }

    fn is_aligned(&self, value: u64) -> bool {
        value & (self.page_size - 1) == 0
    }
}
