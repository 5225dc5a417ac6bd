// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Cross-module scenarios: a whole device over simulated registers, power
//! and table memory.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

use super::config::{IommuConfig, IommuFlags, IommuId, PAGE_SIZE};
use super::device::IommuDevice;
use super::hw::{mm_regs, GspMmu, HwVariant, MmMmu, MMU_EN, MMU_TLB_INV};
use super::iova::IovaRange;
use super::pgtable::{PageTableEntry, Prot, TableMemory, TableSource};
use super::registry::SgEntry;
use super::sim::SimPowerDomain;
use crate::err::{IommuError, Result};
use crate::reg::SimRegisters;

const PG: u64 = PAGE_SIZE;

/// Deterministic xorshift64 generator
struct XorShift(u64);

impl XorShift {
    fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}

/// Table memory shared with the test, with a budget of valid-entry writes
///
/// Once the budget runs out, non-zero writes are silently dropped.
/// Invalidations always land.
struct TestTable {
    words: Arc<Mutex<Vec<u32>>>,
    budget: Arc<AtomicUsize>,
}

impl TableMemory for TestTable {
    fn entries(&self) -> usize {
        self.words.lock().len()
    }

    fn read(&self, index: usize) -> u32 {
        self.words.lock()[index]
    }

    fn write(&mut self, index: usize, value: u32) {
        if value != 0 {
            let left = self.budget.load(Ordering::Acquire);
            if left == 0 {
                return;
            }
            self.budget.store(left - 1, Ordering::Release);
        }
        self.words.lock()[index] = value;
    }
}

#[derive(Clone)]
struct TestSource {
    words: Arc<Mutex<Vec<u32>>>,
    budget: Arc<AtomicUsize>,
}

impl TestSource {
    fn new() -> Self {
        Self {
            words: Arc::new(Mutex::new(Vec::new())),
            budget: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }

    fn limit_writes(&self, writes: usize) {
        self.budget.store(writes, Ordering::Release);
    }

    /// Lose the table contents, as MMU SRAM does on power collapse
    fn wipe(&self) {
        self.words.lock().iter_mut().for_each(|w| *w = 0);
    }
}

impl TableSource for TestSource {
    fn allocate(&self, config: &IommuConfig) -> Result<Box<dyn TableMemory>> {
        *self.words.lock() = vec![0xdead_beef; config.pgt_entries() as usize];
        Ok(Box::new(TestTable {
            words: self.words.clone(),
            budget: self.budget.clone(),
        }))
    }
}

struct Rig {
    dev: IommuDevice,
    regs: Arc<SimRegisters>,
    domain: Arc<SimPowerDomain>,
    source: TestSource,
}

fn gsp_rig(pages: u64) -> Rig {
    let cfg = IommuConfig::new(IommuId::Gsp, 0, pages * PG, 0x5000_0000, 0);
    rig(cfg, Box::new(GspMmu), SimRegisters::new(0x10))
}

fn mm_rig(pages: u64) -> Rig {
    let cfg = IommuConfig::new(IommuId::Mm, 0x4000_0000, pages * PG, 0x9000_0000, 0)
        .with_flags(IommuFlags::BACKUP_ON_SUSPEND);
    let regs = SimRegisters::new(0x20).self_clearing(mm_regs::TLB_INV, MMU_TLB_INV);
    rig(cfg, Box::new(MmMmu), regs)
}

fn rig(cfg: IommuConfig, variant: Box<dyn HwVariant>, regs: SimRegisters) -> Rig {
    let regs = Arc::new(regs);
    let domain = Arc::new(SimPowerDomain::new().losing_state_of(regs.clone()));
    let source = TestSource::new();
    let dev = IommuDevice::new(cfg, regs.clone(), domain.clone(), variant)
        .unwrap()
        .with_table_source(Box::new(source.clone()));
    dev.init().unwrap();
    Rig {
        dev,
        regs,
        domain,
        source,
    }
}

/// Every window entry is valid iff a live mapping covers it, and points
/// at the page the mapping's scatter-gather list puts there
fn check_table(dev: &IommuDevice) {
    let words = dev.table_words().unwrap();
    let base = dev.config().iova_base;
    let mut expected = vec![0u64; words.len()];
    let mut covered = vec![false; words.len()];
    for mapping in dev.mappings() {
        let mut index = ((mapping.range.start - base) / PG) as usize;
        for seg in &mapping.sg {
            for page in 0..seg.len / PG {
                expected[index] = seg.phys + page * PG;
                covered[index] = true;
                index += 1;
            }
        }
    }
    for (index, &word) in words.iter().enumerate() {
        let entry = PageTableEntry::from_raw(word);
        assert_eq!(entry.is_valid(), covered[index], "entry {}", index);
        if covered[index] {
            assert_eq!(entry.phys(), expected[index], "entry {}", index);
        }
    }
}

#[test]
fn test_scenario_a_alloc_coalesce() {
    let r = gsp_rig(8);
    let first = r.dev.iova_alloc(3 * PG).unwrap();
    assert_eq!(first, IovaRange::new(0, 3 * PG));
    assert_eq!(r.dev.iova_alloc(6 * PG), Err(IommuError::OutOfSpace));
    r.dev.iova_free(first).unwrap();
    assert_eq!(r.dev.iova_alloc(6 * PG), Ok(IovaRange::new(0, 6 * PG)));
}

#[test]
fn test_scenario_b_map_unmap() {
    let r = gsp_rig(8);
    let range = r.dev.iova_alloc(2 * PG).unwrap();
    assert_eq!(range, IovaRange::new(0, 2 * PG));
    r.dev
        .iova_map(range, &[SgEntry::new(0x1000, 2 * PG)], Prot::READ | Prot::WRITE)
        .unwrap();

    let words = r.dev.table_words().unwrap();
    assert_eq!(PageTableEntry::from_raw(words[0]).phys(), 0x1000);
    assert_eq!(PageTableEntry::from_raw(words[1]).phys(), 0x1000 + PG);
    assert!(PageTableEntry::from_raw(words[1]).is_valid());
    assert!(!PageTableEntry::from_raw(words[2]).is_valid());

    let mapping = r.dev.iova_unmap(range).unwrap();
    assert_eq!(mapping.sg, vec![SgEntry::new(0x1000, 2 * PG)]);
    assert!(r.dev.table_words().unwrap().iter().all(|&w| w == 0));
    r.dev.iova_free(range).unwrap();
}

#[test]
fn test_scenario_c_size_mismatch() {
    let r = gsp_rig(8);
    let other = r.dev.iova_alloc(PG).unwrap();
    r.dev.iova_map(other, &[SgEntry::new(0x8000, PG)], Prot::READ).unwrap();

    let range = r.dev.iova_alloc(2 * PG).unwrap();
    let before = r.dev.table_words().unwrap();
    assert_eq!(
        r.dev.iova_map(range, &[SgEntry::new(0x1000, 3 * PG)], Prot::READ),
        Err(IommuError::SizeMismatch)
    );
    assert_eq!(r.dev.table_words().unwrap(), before);
    assert!(r.dev.mapping(range).is_none());
}

#[test]
fn test_scenario_d_concurrent_map_unmap() {
    const ROUNDS: u64 = 10_000;

    let r = gsp_rig(16);
    let dev = Arc::new(r.dev);
    let ranges = [dev.iova_alloc(2 * PG).unwrap(), dev.iova_alloc(3 * PG).unwrap()];

    let workers: Vec<_> = ranges
        .iter()
        .enumerate()
        .map(|(t, &range)| {
            let dev = dev.clone();
            std::thread::spawn(move || {
                let phys = 0x10_0000 * (t as u64 + 1);
                let sg = [SgEntry::new(phys, range.len)];
                for _ in 0..ROUNDS {
                    dev.iova_map(range, &sg, Prot::READ).unwrap();
                    assert_eq!(dev.iova_to_phys(range.start + PG), Ok(phys + PG));
                    let mapping = dev.iova_unmap(range).unwrap();
                    assert_eq!(mapping.range, range);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = dev.stats();
    assert_eq!(stats.maps, 2 * ROUNDS);
    assert_eq!(stats.unmaps, 2 * ROUNDS);
    assert_eq!(stats.mapped_pages, 0);
    assert!(dev.table_words().unwrap().iter().all(|&w| w == 0));
    assert_eq!(dev.gate().users(), 0);
}

#[test]
fn test_no_overlapping_ranges() {
    let r = gsp_rig(64);
    let mut rng = XorShift::new(0x5eed);
    let mut live: Vec<IovaRange> = Vec::new();

    for _ in 0..2000 {
        if live.is_empty() || rng.below(3) != 0 {
            let len = (rng.below(8) + 1) * PG - rng.below(PG);
            match r.dev.iova_alloc(len) {
                Ok(range) => {
                    assert!(range.len >= len && range.len % PG == 0);
                    live.push(range);
                }
                Err(err) => assert_eq!(err, IommuError::OutOfSpace),
            }
        } else {
            let victim = live.swap_remove(rng.below(live.len() as u64) as usize);
            r.dev.iova_free(victim).unwrap();
        }

        let mut sorted = live.clone();
        sorted.sort();
        for pair in sorted.windows(2) {
            assert!(!pair[0].overlaps(&pair[1]), "{} overlaps {}", pair[0], pair[1]);
        }
        assert!(sorted.iter().all(|r| r.end() <= 64 * PG));
    }
}

#[test]
fn test_double_map_leaves_table_untouched() {
    let r = gsp_rig(8);
    let range = r.dev.iova_alloc(2 * PG).unwrap();
    r.dev.iova_map(range, &[SgEntry::new(0x1000, 2 * PG)], Prot::READ).unwrap();
    let before = r.dev.table_words().unwrap();

    assert_eq!(
        r.dev.iova_map(range, &[SgEntry::new(0xa000, 2 * PG)], Prot::WRITE),
        Err(IommuError::AlreadyMapped)
    );
    assert_eq!(r.dev.table_words().unwrap(), before);
    assert_eq!(r.dev.mappings().len(), 1);
    assert_eq!(r.dev.mapping(range).unwrap().sg[0].phys, 0x1000);
}

#[test]
fn test_table_matches_live_mappings() {
    let r = gsp_rig(32);
    let mut rng = XorShift::new(42);
    let mut unmapped: Vec<IovaRange> = Vec::new();
    let mut mapped: Vec<IovaRange> = Vec::new();
    while let Ok(range) = r.dev.iova_alloc((rng.below(4) + 1) * PG) {
        unmapped.push(range);
    }

    for step in 0..1500u64 {
        let do_map = mapped.is_empty() || (!unmapped.is_empty() && rng.below(2) == 0);
        if do_map {
            let range = unmapped.swap_remove(rng.below(unmapped.len() as u64) as usize);
            // split the buffer into scattered single pages
            let sg: Vec<SgEntry> = (0..range.len / PG)
                .map(|i| SgEntry::new((rng.below(1 << 20) + step + i) * PG, PG))
                .collect();
            r.dev.iova_map(range, &sg, Prot::READ).unwrap();
            mapped.push(range);
        } else {
            let range = mapped.swap_remove(rng.below(mapped.len() as u64) as usize);
            r.dev.iova_unmap(range).unwrap();
            unmapped.push(range);
        }
        if step % 100 == 0 {
            check_table(&r.dev);
        }
    }
    check_table(&r.dev);
    assert_eq!(r.dev.mappings().len(), mapped.len());
}

#[test]
fn test_fault_rolls_back_partial_map() {
    let r = gsp_rig(16);
    let range = r.dev.iova_alloc(8 * PG).unwrap();
    r.source.limit_writes(3);

    assert_eq!(
        r.dev.iova_map(range, &[SgEntry::new(0x20_0000, 8 * PG)], Prot::READ),
        Err(IommuError::HardwareFault)
    );
    let words = r.dev.table_words().unwrap();
    assert!(words[..8].iter().all(|&w| !PageTableEntry::from_raw(w).is_valid()));
    assert!(r.dev.mapping(range).is_none());
    assert_eq!(r.dev.stats().hw_faults, 1);

    // the device is not poisoned
    r.source.limit_writes(usize::MAX);
    r.dev.iova_map(range, &[SgEntry::new(0x20_0000, 8 * PG)], Prot::READ).unwrap();
    check_table(&r.dev);
}

#[test]
fn test_second_unmap_not_mapped() {
    let r = gsp_rig(8);
    let range = r.dev.iova_alloc(2 * PG).unwrap();
    r.dev.iova_map(range, &[SgEntry::new(0x1000, 2 * PG)], Prot::READ).unwrap();
    r.dev.iova_unmap(range).unwrap();

    let words = r.dev.table_words().unwrap();
    let stats = r.dev.stats();
    assert_eq!(r.dev.iova_unmap(range), Err(IommuError::NotMapped));
    assert_eq!(r.dev.table_words().unwrap(), words);
    assert_eq!(r.dev.stats(), stats);
    r.dev.iova_free(range).unwrap();
}

#[test]
fn test_backup_restore_identical() {
    let r = gsp_rig(16);
    let a = r.dev.iova_alloc(2 * PG).unwrap();
    let b = r.dev.iova_alloc(3 * PG).unwrap();
    r.dev.iova_map(a, &[SgEntry::new(0x1000, 2 * PG)], Prot::READ).unwrap();
    r.dev
        .iova_map(b, &[SgEntry::new(0x9000, PG), SgEntry::new(0x4_0000, 2 * PG)], Prot::WRITE)
        .unwrap();
    let before = r.dev.table_words().unwrap();

    r.dev.backup().unwrap();
    r.dev.restore().unwrap();
    assert_eq!(r.dev.table_words().unwrap(), before);
    assert_eq!(r.dev.iova_to_phys(b.start + 2 * PG), Ok(0x4_1000));
    check_table(&r.dev);

    // mapping still behaves after the round trip
    r.dev.iova_unmap(a).unwrap();
    check_table(&r.dev);
}

#[test]
fn test_restore_after_power_loss() {
    let r = mm_rig(16);
    r.dev.enable().unwrap();
    let range = r.dev.iova_alloc(4 * PG).unwrap();
    r.dev.iova_map(range, &[SgEntry::new(0x200_0000, 4 * PG)], Prot::READ).unwrap();

    let saved = [mm_regs::IOVA_BASE, mm_regs::PGT_LO, mm_regs::PGT_HI, mm_regs::CTRL];
    let regs_before: Vec<u32> = saved.iter().map(|&o| r.regs.peek(o)).collect();
    let words_before = r.dev.table_words().unwrap();

    // suspend: the device saves itself, then the domain collapses and the
    // registers and SRAM table are lost
    r.dev.disable().unwrap();
    assert_eq!(r.dev.stats().backups, 1);
    assert!(!r.domain.is_powered());
    r.source.wipe();
    assert!(saved.iter().all(|&o| r.regs.peek(o) == 0));
    assert_eq!(r.dev.iova_to_phys(range.start), Err(IommuError::NotMapped));

    // resume replays the snapshot and consumes it
    r.dev.enable().unwrap();
    assert_eq!(r.dev.table_words().unwrap(), words_before);
    let regs_after: Vec<u32> = saved.iter().map(|&o| r.regs.peek(o)).collect();
    assert_eq!(regs_after, regs_before);
    assert_ne!(r.regs.peek(mm_regs::CTRL) & MMU_EN, 0);
    assert_eq!(r.dev.iova_to_phys(range.start + PG), Ok(0x200_0000 + PG));
    assert_eq!(r.dev.stats().restores, 1);
    assert_eq!(r.dev.export_backup(), Err(IommuError::InvalidArgument));

    r.dev.iova_unmap(range).unwrap();
    check_table(&r.dev);
}

#[test]
fn test_changes_while_suspended_survive_resume() {
    let r = mm_rig(16);
    r.dev.enable().unwrap();
    let a = r.dev.iova_alloc(2 * PG).unwrap();
    let b = r.dev.iova_alloc(3 * PG).unwrap();
    r.dev.iova_map(a, &[SgEntry::new(0x10_0000, 2 * PG)], Prot::READ).unwrap();

    r.dev.disable().unwrap();
    r.source.wipe();
    r.dev.iova_map(b, &[SgEntry::new(0x40_0000, 3 * PG)], Prot::WRITE).unwrap();
    r.dev.iova_unmap(a).unwrap();

    r.dev.enable().unwrap();
    assert_eq!(r.dev.stats().restores, 1);
    assert_eq!(r.dev.iova_to_phys(a.start), Err(IommuError::NotMapped));
    assert_eq!(r.dev.iova_to_phys(b.start + 2 * PG), Ok(0x40_2000));
    check_table(&r.dev);
}

#[test]
fn test_failed_resume_leaves_translation_off() {
    let r = mm_rig(8);
    r.dev.enable().unwrap();
    let range = r.dev.iova_alloc(PG).unwrap();
    r.dev.iova_map(range, &[SgEntry::new(0x1000, PG)], Prot::READ).unwrap();
    r.dev.disable().unwrap();

    r.source.wipe();
    r.source.limit_writes(0);
    assert_eq!(r.dev.enable(), Err(IommuError::HardwareFault));
    assert!(!r.dev.is_enabled());
    assert_eq!(r.dev.gate().users(), 0);
    assert!(!r.domain.is_powered());
    assert!(r.dev.mappings().is_empty());

    r.source.limit_writes(usize::MAX);
    r.dev.enable().unwrap();
    assert_eq!(r.dev.stats().restores, 0);
}

#[test]
fn test_unavailable_power_does_no_io() {
    let r = gsp_rig(8);
    let range = r.dev.iova_alloc(PG).unwrap();
    r.dev.iova_map(range, &[SgEntry::new(0x1000, PG)], Prot::READ).unwrap();
    r.dev.backup().unwrap();

    r.domain.fail_enable(true);
    let accesses = r.regs.access_count();
    let unavailable = Err(IommuError::PowerGateUnavailable);
    let other = IovaRange::new(4 * PG, PG);
    assert_eq!(r.dev.iova_map(other, &[SgEntry::new(0x2000, PG)], Prot::READ), unavailable);
    assert_eq!(r.dev.iova_unmap(range).err(), Some(IommuError::PowerGateUnavailable));
    assert_eq!(r.dev.backup(), unavailable);
    assert_eq!(r.dev.restore(), unavailable);
    assert_eq!(r.dev.enable(), unavailable);
    assert_eq!(r.dev.exit(), unavailable);
    let mut out = alloc::string::String::new();
    assert_eq!(r.dev.dump(0, PG, &mut out), unavailable);
    assert!(out.is_empty());
    assert_eq!(r.regs.access_count(), accesses);
    assert_eq!(r.dev.gate().users(), 0);

    r.domain.fail_enable(false);
    assert!(r.dev.mapping(range).is_some());
    assert_eq!(r.dev.iova_to_phys(0), Ok(0x1000));
}

#[test]
fn test_hung_power_times_out() {
    let r = gsp_rig(8);
    let range = r.dev.iova_alloc(PG).unwrap();
    r.domain.hang(true);
    assert_eq!(
        r.dev.iova_map(range, &[SgEntry::new(0x1000, PG)], Prot::READ),
        Err(IommuError::PowerGateTimeout)
    );
    assert!(!r.domain.is_powered());
    assert_eq!(r.dev.gate().users(), 0);

    r.domain.hang(false);
    r.dev.iova_map(range, &[SgEntry::new(0x1000, PG)], Prot::READ).unwrap();
}

#[test]
fn test_no_entry_targets_freed_pages() {
    let r = gsp_rig(32);
    let mut rng = XorShift::new(7);
    let mut free_phys: Vec<u64> = (0..64).map(|i| 0x100_0000 + i * PG).collect();
    let mut released: Vec<u64> = Vec::new();
    let mut live: Vec<IovaRange> = Vec::new();

    for _ in 0..400 {
        let pages = rng.below(3) + 1;
        let grow = live.is_empty() || rng.below(2) == 0;
        if grow && free_phys.len() as u64 >= pages {
            let range = match r.dev.iova_alloc(pages * PG) {
                Ok(range) => range,
                Err(_) => continue,
            };
            let sg: Vec<SgEntry> = (0..pages)
                .map(|_| {
                    let phys = free_phys.swap_remove(rng.below(free_phys.len() as u64) as usize);
                    released.retain(|&p| p != phys);
                    SgEntry::new(phys, PG)
                })
                .collect();
            r.dev.iova_map(range, &sg, Prot::READ | Prot::WRITE).unwrap();
            live.push(range);
        } else if !live.is_empty() {
            let range = live.swap_remove(rng.below(live.len() as u64) as usize);
            let mapping = r.dev.iova_unmap(range).unwrap();
            r.dev.iova_free(range).unwrap();
            // hand the physical pages back only after unmap returned
            for seg in mapping.sg {
                free_phys.push(seg.phys);
                released.push(seg.phys);
            }
        }

        for word in r.dev.table_words().unwrap() {
            let entry = PageTableEntry::from_raw(word);
            if entry.is_valid() {
                assert!(!released.contains(&entry.phys()), "stale entry for {:#x}", entry.phys());
            }
        }
    }
}

#[test]
fn test_exit_with_live_mappings() {
    let r = mm_rig(8);
    r.dev.enable().unwrap();
    let range = r.dev.iova_alloc(2 * PG).unwrap();
    r.dev.iova_map(range, &[SgEntry::new(0x1000, 2 * PG)], Prot::READ).unwrap();

    r.dev.exit().unwrap();
    assert!(r.source.words.lock().iter().all(|&w| w == 0));
    assert!(!r.domain.is_powered());
    assert_eq!(r.dev.iova_alloc(PG), Err(IommuError::NotInitialized));
}
