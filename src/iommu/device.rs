// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! IOMMU Device
//!
//! Generic logic shared by every MMU instance. A device owns its IOVA
//! allocator, mapping registry and page table, and reaches hardware only
//! through its [`RegisterBus`], [`DeviceGate`] and [`HwVariant`].
//!
//! # Locking
//!
//! - `map` (the map lock) guards the allocator, the registry, statistics,
//!   the saved snapshot and the hardware-enabled flag.
//! - `pgt` guards the page table itself, including its allocation and
//!   release. It is only ever taken while holding `map`, or alone from
//!   `Drop`.
//! - The gate is acquired before either lock and released after both are
//!   dropped, so no lock is held across a call into the power substrate.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::Mutex;

use super::config::{IommuConfig, IommuFlags, IommuId};
use super::gate::{DeviceGate, PowerDomain};
use super::hw::HwVariant;
use super::iova::{IovaAllocator, IovaRange};
use super::pgtable::{HeapTableSource, PageTable, PageTableEntry, Prot, TableSource};
use super::registry::{Mapping, MappingRegistry, SgEntry};
use super::snapshot::Snapshot;
use crate::err::{IommuError, Result};
use crate::reg::RegisterBus;

/// Per-device counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IommuStats {
    /// Successful maps
    pub maps: u64,
    /// Successful unmaps
    pub unmaps: u64,
    /// Pages covered by live mappings
    pub mapped_pages: u64,
    /// Failed table writes and TLB flushes
    pub hw_faults: u64,
    /// Allocations refused with `OutOfSpace`
    pub alloc_failures: u64,
    /// Snapshots taken
    pub backups: u64,
    /// Snapshots replayed
    pub restores: u64,
}

/// State behind the map lock
struct MapState {
    iova: Option<IovaAllocator>,
    registry: MappingRegistry,
    stats: IommuStats,
    backup: Option<Snapshot>,
    hw_on: bool,
}

/// One hardware IOMMU instance
pub struct IommuDevice {
    config: IommuConfig,
    regs: Arc<dyn RegisterBus>,
    gate: DeviceGate,
    variant: Box<dyn HwVariant>,
    tables: Box<dyn TableSource>,
    map: Mutex<MapState>,
    pgt: Mutex<Option<PageTable>>,
}

impl fmt::Debug for IommuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IommuDevice")
            .field("name", &self.config.name)
            .field("variant", &self.variant.kind())
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl IommuDevice {
    /// Create a device from its init data
    ///
    /// The page table is not allocated until [`IommuDevice::init`].
    pub fn new(
        config: IommuConfig,
        regs: Arc<dyn RegisterBus>,
        domain: Arc<dyn PowerDomain>,
        variant: Box<dyn HwVariant>,
    ) -> Result<Self> {
        config.validate()?;
        variant.check_config(&config)?;
        match variant.register_span(&config) {
            Some(span) if span <= regs.span() => {}
            _ => return Err(IommuError::InvalidArgument),
        }
        let gate = DeviceGate::new(domain, config.power_poll_limit);
        Ok(Self {
            config,
            regs,
            gate,
            variant,
            tables: Box::new(HeapTableSource),
            map: Mutex::new(MapState {
                iova: None,
                registry: MappingRegistry::new(),
                stats: IommuStats::default(),
                backup: None,
                hw_on: false,
            }),
            pgt: Mutex::new(None),
        })
    }

    /// Use `tables` to allocate page-table memory
    pub fn with_table_source(mut self, tables: Box<dyn TableSource>) -> Self {
        self.tables = tables;
        self
    }

    /// Instance identifier
    pub fn id(&self) -> IommuId {
        self.config.id
    }

    /// Instance name
    pub fn name(&self) -> &'static str {
        self.config.name
    }

    /// Init data
    pub fn config(&self) -> &IommuConfig {
        &self.config
    }

    /// Power sequencer
    pub fn gate(&self) -> &DeviceGate {
        &self.gate
    }

    /// Whether `init` has run and `exit` has not
    pub fn is_initialized(&self) -> bool {
        self.map.lock().iova.is_some()
    }

    /// Whether translation has been switched on by `enable`
    pub fn is_enabled(&self) -> bool {
        self.map.lock().hw_on
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> IommuStats {
        self.map.lock().stats
    }

    /// ========================================================================
    /// Lifecycle
    /// ========================================================================

    /// Allocate the IOVA pool and the page table
    pub fn init(&self) -> Result {
        self.gate.with_enabled(|| {
            let mut st = self.map.lock();
            if st.iova.is_some() {
                return Err(IommuError::AlreadyInitialized);
            }
            let allocator =
                IovaAllocator::new(self.config.iova_base, self.config.iova_size, self.config.page_size)?;

            let mut pgt = self.pgt.lock();
            let mem = self.tables.allocate(&self.config)?;
            *pgt = Some(PageTable::new(&self.config, mem)?);

            st.iova = Some(allocator);
            st.registry = MappingRegistry::new();
            st.stats = IommuStats::default();
            st.backup = None;
            log_info!(
                target: self.config.name,
                "{}: window [{:#x}, {:#x}) pgt {:#x}+{:#x}",
                self.variant.kind(),
                self.config.iova_base,
                self.config.iova_end(),
                self.config.pgt_base,
                self.config.pgt_size
            );
            Ok(())
        })
    }

    /// Tear down every mapping, switch translation off and release the table
    ///
    /// Leaked mappings are invalidated and logged. The pool and table are
    /// released even if an entry refuses to clear; that failure is returned.
    pub fn exit(&self) -> Result {
        let release = self.gate.with_enabled(|| {
            let mut st = self.map.lock();
            if st.iova.is_none() {
                return Err(IommuError::NotInitialized);
            }

            let mut pgt = self.pgt.lock();
            let mut res = Ok(());
            let leaked = st.registry.drain();
            if let Some(table) = pgt.as_mut() {
                for mapping in &leaked {
                    log_warn!(target: self.config.name, "exit: tearing down leaked mapping {}", mapping);
                    if let Err(err) = table.unmap(mapping.range) {
                        st.stats.hw_faults += 1;
                        res = Err(err);
                    }
                }
            }
            if !leaked.is_empty() {
                if let Err(err) = self.flush_tlb(&mut st) {
                    res = res.and(Err(err));
                }
            }

            let was_on = core::mem::replace(&mut st.hw_on, false);
            if was_on {
                self.variant.disable(&*self.regs, &self.config);
            }
            *pgt = None;
            st.iova = None;
            st.backup = None;
            st.stats.mapped_pages = 0;
            log_info!(target: self.config.name, "exit: {} leaked mappings", leaked.len());
            Ok((was_on, res))
        })?;

        let (was_on, res) = release;
        if was_on {
            self.gate.put();
        }
        res
    }

    /// ========================================================================
    /// IOVA Operations
    /// ========================================================================

    /// Reserve `len` bytes of the window, rounded up to whole pages
    pub fn iova_alloc(&self, len: u64) -> Result<IovaRange> {
        self.iova_alloc_aligned(len, self.config.page_size)
    }

    /// Reserve `len` bytes starting on an `align` boundary
    pub fn iova_alloc_aligned(&self, len: u64, align: u64) -> Result<IovaRange> {
        let mut st = self.map.lock();
        let pool = st.iova.as_mut().ok_or(IommuError::NotInitialized)?;
        match pool.alloc_aligned(len, align) {
            Ok(range) => {
                log_trace!(target: self.config.name, "alloc {}", range);
                Ok(range)
            }
            Err(err) => {
                if err == IommuError::OutOfSpace {
                    st.stats.alloc_failures += 1;
                }
                Err(err)
            }
        }
    }

    /// Return an unmapped range to the pool
    pub fn iova_free(&self, range: IovaRange) -> Result {
        let mut st = self.map.lock();
        let st = &mut *st;
        let pool = st.iova.as_mut().ok_or(IommuError::NotInitialized)?;
        if st.registry.is_mapped(range) {
            return Err(IommuError::AlreadyMapped);
        }
        pool.free(range)?;
        log_trace!(target: self.config.name, "free {}", range);
        Ok(())
    }

    /// Map an allocated range onto the pages of `sg`
    ///
    /// The range must be exactly one outstanding allocation. Entries are
    /// committed before the TLB is flushed; any failure leaves every entry
    /// of the range invalid.
    pub fn iova_map(&self, range: IovaRange, sg: &[SgEntry], prot: Prot) -> Result {
        self.gate.with_enabled(|| {
            let mut st = self.map.lock();
            let pool = st.iova.as_ref().ok_or(IommuError::NotInitialized)?;
            if !pool.is_allocated(range) {
                return Err(IommuError::InvalidRange);
            }
            if st.registry.is_mapped(range) {
                return Err(IommuError::AlreadyMapped);
            }

            let mut pgt = self.pgt.lock();
            let table = pgt.as_mut().ok_or(IommuError::NotInitialized)?;
            if let Err(err) = table.map(range, sg, prot) {
                if err == IommuError::HardwareFault {
                    st.stats.hw_faults += 1;
                }
                return Err(err);
            }
            if let Err(err) = self.flush_tlb(&mut st) {
                self.roll_back(&mut st, table, range);
                return Err(err);
            }
            if let Err(err) = st.registry.register(Mapping::new(range, sg, prot)) {
                self.roll_back(&mut st, table, range);
                return Err(err);
            }

            st.stats.maps += 1;
            st.stats.mapped_pages += range.pages(self.config.page_size);
            self.refresh_backup(&mut st, table, range);
            log_debug!(target: self.config.name, "map {} ({} extents)", range, sg.len());
            Ok(())
        })
    }

    /// Invalidate the entries of a mapped range and return its mapping
    ///
    /// A range without a live mapping fails with `NotMapped` and touches
    /// nothing. If the entries or the TLB cannot be cleared, the mapping
    /// stays registered so the caller keeps its physical pages.
    pub fn iova_unmap(&self, range: IovaRange) -> Result<Mapping> {
        self.gate.with_enabled(|| {
            let mut st = self.map.lock();
            if st.iova.is_none() {
                return Err(IommuError::NotInitialized);
            }
            if !st.registry.is_mapped(range) {
                return Err(IommuError::NotMapped);
            }

            let mut pgt = self.pgt.lock();
            let table = pgt.as_mut().ok_or(IommuError::NotInitialized)?;
            if let Err(err) = table.unmap(range) {
                st.stats.hw_faults += 1;
                return Err(err);
            }
            self.flush_tlb(&mut st)?;

            let mapping = st.registry.unregister(range)?;
            st.stats.unmaps += 1;
            st.stats.mapped_pages -= range.pages(self.config.page_size);
            self.refresh_backup(&mut st, table, range);
            log_debug!(target: self.config.name, "unmap {}", range);
            Ok(mapping)
        })
    }

    /// Physical address `iova` translates to
    pub fn iova_to_phys(&self, iova: u64) -> Result<u64> {
        if iova < self.config.iova_base || iova >= self.config.iova_end() {
            return Err(IommuError::InvalidRange);
        }
        self.gate.with_enabled(|| {
            let _st = self.map.lock();
            let pgt = self.pgt.lock();
            let table = pgt.as_ref().ok_or(IommuError::NotInitialized)?;
            table.translate(iova).ok_or(IommuError::NotMapped)
        })
    }

    /// Live mapping of exactly `range`
    pub fn mapping(&self, range: IovaRange) -> Option<Mapping> {
        self.map.lock().registry.get(range).cloned()
    }

    /// Every live mapping, in IOVA order
    pub fn mappings(&self) -> Vec<Mapping> {
        self.map.lock().registry.iter().cloned().collect()
    }

    /// Raw words of the whole window
    pub fn table_words(&self) -> Result<Vec<u32>> {
        self.gate.with_enabled(|| {
            let _st = self.map.lock();
            let pgt = self.pgt.lock();
            let table = pgt.as_ref().ok_or(IommuError::NotInitialized)?;
            Ok(table.save())
        })
    }

    /// ========================================================================
    /// Power Operations
    /// ========================================================================

    /// Capture the registers and table lost on power-down
    pub fn backup(&self) -> Result {
        self.gate.with_enabled(|| {
            let mut st = self.map.lock();
            if st.iova.is_none() {
                return Err(IommuError::NotInitialized);
            }
            let pgt = self.pgt.lock();
            let table = pgt.as_ref().ok_or(IommuError::NotInitialized)?;
            st.backup = Some(self.capture(table));
            st.stats.backups += 1;
            Ok(())
        })
    }

    /// Replay the last snapshot
    ///
    /// The snapshot must agree with the live mappings: an entry is valid in
    /// it exactly where a live mapping covers the page. Otherwise nothing is
    /// written and `InvalidArgument` is returned. The enable bits of the
    /// control register are replayed as the current `enable` state, not as
    /// saved.
    pub fn restore(&self) -> Result {
        self.gate.with_enabled(|| {
            let mut st = self.map.lock();
            let st = &mut *st;
            if st.iova.is_none() {
                return Err(IommuError::NotInitialized);
            }
            let snapshot = st.backup.take().ok_or(IommuError::InvalidArgument)?;

            let mut pgt = self.pgt.lock();
            let res = match pgt.as_mut() {
                Some(table) => self.replay(st, table, &snapshot),
                None => Err(IommuError::NotInitialized),
            };
            st.backup = Some(snapshot);
            res
        })
    }

    /// Serialize the last snapshot to the blob format
    pub fn export_backup(&self) -> Result<Vec<u8>> {
        let st = self.map.lock();
        st.backup.as_ref().ok_or(IommuError::InvalidArgument)?.to_bytes()
    }

    /// Replace the saved snapshot with a blob from [`IommuDevice::export_backup`]
    pub fn import_backup(&self, bytes: &[u8]) -> Result {
        let snapshot = Snapshot::from_bytes(bytes)?;
        if snapshot.id() != self.config.id || snapshot.table().len() as u64 != self.config.page_count() {
            return Err(IommuError::InvalidArgument);
        }
        let mut st = self.map.lock();
        if st.iova.is_none() {
            return Err(IommuError::NotInitialized);
        }
        st.backup = Some(snapshot);
        Ok(())
    }

    /// Program the table location and switch translation on
    ///
    /// Holds a power reference until [`IommuDevice::disable`]. With
    /// [`IommuFlags::BACKUP_ON_SUSPEND`], the snapshot left by `disable` is
    /// replayed and consumed; if it cannot be, translation is switched back
    /// off and the error returned.
    pub fn enable(&self) -> Result {
        let _guard = self.gate.acquire()?;
        {
            let mut st = self.map.lock();
            let st = &mut *st;
            if st.iova.is_none() {
                return Err(IommuError::NotInitialized);
            }
            if st.hw_on {
                return Ok(());
            }
            if let Err(err) = self.variant.enable(&*self.regs, &self.config) {
                st.stats.hw_faults += 1;
                self.variant.disable(&*self.regs, &self.config);
                return Err(err);
            }
            st.hw_on = true;

            let resume = if self.config.flags.contains(IommuFlags::BACKUP_ON_SUSPEND) {
                st.backup.take()
            } else {
                None
            };
            if let Some(snapshot) = resume {
                let mut pgt = self.pgt.lock();
                let res = match pgt.as_mut() {
                    Some(table) => self.replay(st, table, &snapshot),
                    None => Err(IommuError::NotInitialized),
                };
                if let Err(err) = res {
                    log_error!(target: self.config.name, "enable: resume failed ({})", err);
                    st.hw_on = false;
                    self.variant.disable(&*self.regs, &self.config);
                    return Err(err);
                }
            }
        }
        self.gate.get()?;
        log_info!(target: self.config.name, "translation enabled");
        Ok(())
    }

    /// Switch translation off and drop the power reference taken by `enable`
    ///
    /// With [`IommuFlags::BACKUP_ON_SUSPEND`], the registers and table are
    /// captured first, as by [`IommuDevice::backup`].
    pub fn disable(&self) -> Result {
        let _guard = self.gate.acquire()?;
        {
            let mut st = self.map.lock();
            let st = &mut *st;
            if !st.hw_on {
                return Ok(());
            }
            if self.config.flags.contains(IommuFlags::BACKUP_ON_SUSPEND) {
                if let Some(table) = self.pgt.lock().as_ref() {
                    st.backup = Some(self.capture(table));
                    st.stats.backups += 1;
                }
            }
            st.hw_on = false;
            self.variant.disable(&*self.regs, &self.config);
        }
        self.gate.put();
        log_info!(target: self.config.name, "translation disabled");
        Ok(())
    }

    /// ========================================================================
    /// Diagnostics
    /// ========================================================================

    /// Print device state and the entries covering `[iova, iova + len)`
    pub fn dump(&self, iova: u64, len: u64, out: &mut dyn fmt::Write) -> Result {
        self.gate.with_enabled(|| {
            let st = self.map.lock();
            let pool = st.iova.as_ref().ok_or(IommuError::NotInitialized)?;
            let pgt = self.pgt.lock();
            let table = pgt.as_ref().ok_or(IommuError::NotInitialized)?;

            let head = (|| -> fmt::Result {
                writeln!(
                    out,
                    "{} ({}) hw {} [{:#x}, {:#x}) valid {}/{}",
                    self.config.name,
                    self.variant.kind(),
                    if st.hw_on { "on" } else { "off" },
                    self.config.iova_base,
                    self.config.iova_end(),
                    table.valid_count(),
                    table.len()
                )?;
                writeln!(out, "{:?}", st.stats)?;
                pool.dump(&mut *out)?;
                for mapping in st.registry.iter() {
                    writeln!(out, "  {}", mapping)?;
                }
                Ok(())
            })();
            head.map_err(|_| IommuError::InvalidArgument)?;
            table.dump(IovaRange::new(iova, len), out)
        })
    }

    /// Flush the TLB if translation is on
    fn flush_tlb(&self, st: &mut MapState) -> Result {
        if !st.hw_on {
            return Ok(());
        }
        self.variant.flush_tlb(&*self.regs, &self.config).map_err(|err| {
            st.stats.hw_faults += 1;
            err
        })
    }

    /// Undo the entries of a map that cannot complete
    ///
    /// The caller returns its own error; a rollback failure is only counted.
    fn roll_back(&self, st: &mut MapState, table: &mut PageTable, range: IovaRange) {
        if table.unmap(range).is_err() {
            st.stats.hw_faults += 1;
            log_error!(target: self.config.name, "map: entries of {} survived rollback", range);
        }
    }

    /// Read the saved registers and the table words
    fn capture(&self, table: &PageTable) -> Snapshot {
        let registers = self
            .variant
            .saved_registers(&self.config)
            .into_iter()
            .map(|offset| (offset, self.regs.read32(offset)))
            .collect();
        let snapshot = Snapshot::new(self.config.id, registers, table.save());
        log_debug!(
            target: self.config.name,
            "backup: {} registers, {} valid entries",
            snapshot.registers().len(),
            snapshot.valid_entries()
        );
        snapshot
    }

    /// Write `snapshot` back to the registers and the table
    fn replay(&self, st: &mut MapState, table: &mut PageTable, snapshot: &Snapshot) -> Result {
        if snapshot.table().len() != table.len() || !self.agrees(&st.registry, snapshot) {
            log_warn!(target: self.config.name, "restore: snapshot does not match live mappings");
            return Err(IommuError::InvalidArgument);
        }

        for &(offset, value) in snapshot.registers() {
            let value = self.variant.replay_value(&self.config, offset, value, st.hw_on);
            self.regs.write32(offset, value);
        }
        if self.variant.is_enabled(&*self.regs, &self.config) != st.hw_on {
            st.stats.hw_faults += 1;
            log_error!(target: self.config.name, "restore: control register did not take");
            return Err(IommuError::HardwareFault);
        }
        if let Err(err) = table.load(snapshot.table()) {
            st.stats.hw_faults += 1;
            // a failed load leaves the table empty
            st.registry.drain();
            st.stats.mapped_pages = 0;
            return Err(err);
        }
        self.flush_tlb(st)?;
        st.stats.restores += 1;
        log_debug!(target: self.config.name, "restore: {} valid entries", table.valid_count());
        Ok(())
    }

    /// Carry a table change made while translation is off into the snapshot
    /// `enable` will replay
    fn refresh_backup(&self, st: &mut MapState, table: &PageTable, range: IovaRange) {
        if st.hw_on || !self.config.flags.contains(IommuFlags::BACKUP_ON_SUSPEND) {
            return;
        }
        if let Some(snapshot) = st.backup.as_mut() {
            let first = ((range.start - self.config.iova_base) / self.config.page_size) as usize;
            let pages = range.pages(self.config.page_size) as usize;
            for (index, word) in snapshot.table_mut().iter_mut().enumerate().skip(first).take(pages) {
                *word = table.entry(index).raw();
            }
        }
    }

    /// Whether `snapshot` marks exactly the live mappings' pages valid
    fn agrees(&self, registry: &MappingRegistry, snapshot: &Snapshot) -> bool {
        let page_size = self.config.page_size;
        snapshot.table().iter().enumerate().all(|(index, &word)| {
            let iova = self.config.iova_base + index as u64 * page_size;
            PageTableEntry::from_raw(word).is_valid() == registry.lookup(iova).is_some()
        })
    }
}

impl Drop for IommuDevice {
    fn drop(&mut self) {
        let st = self.map.get_mut();
        if st.hw_on {
            st.hw_on = false;
            self.variant.disable(&*self.regs, &self.config);
            self.gate.put();
        }
    }
}
