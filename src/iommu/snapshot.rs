// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Suspend Snapshot
//!
//! State captured by `backup` and replayed by `restore`: the control
//! registers the variant says are lost on power-down, and every page-table
//! word of the window. The blob form is little-endian:
//!
//! ```text
//! +0x00 magic      "IOMS"
//! +0x04 version    u16
//! +0x06 id         u16
//! +0x08 reg_count  u32
//! +0x0c pgt_words  u32
//! +0x10 checksum   u32 (FNV-1a over the payload)
//! +0x14 reserved   u32
//! +0x18 payload    reg_count * (offset u32, value u32), pgt_words * u32
//! ```

use alloc::vec::Vec;
use memoffset::offset_of;

use super::config::IommuId;
use super::pgtable::PageTableEntry;
use crate::err::{IommuError, Result};

/// Blob magic ("IOMS")
pub const SNAPSHOT_MAGIC: u32 = 0x534d_4f49;

/// Current blob version
pub const SNAPSHOT_VERSION: u16 = 1;

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

// Layout only; fields are addressed through `offset_of!`.
#[allow(dead_code)]
#[repr(C)]
struct SnapshotHeader {
    magic: u32,
    version: u16,
    id: u16,
    reg_count: u32,
    pgt_words: u32,
    checksum: u32,
    reserved: u32,
}

const HEADER_SIZE: usize = core::mem::size_of::<SnapshotHeader>();

/// Saved device state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    id: IommuId,
    registers: Vec<(usize, u32)>,
    table: Vec<u32>,
}

impl Snapshot {
    /// Build a snapshot from captured registers and table words
    pub fn new(id: IommuId, registers: Vec<(usize, u32)>, table: Vec<u32>) -> Self {
        Self {
            id,
            registers,
            table,
        }
    }

    /// Instance the snapshot was taken from
    pub fn id(&self) -> IommuId {
        self.id
    }

    /// Saved (offset, value) register pairs, in restore order
    pub fn registers(&self) -> &[(usize, u32)] {
        &self.registers
    }

    /// Saved page-table words
    pub fn table(&self) -> &[u32] {
        &self.table
    }

    /// Saved page-table words, for patching before replay
    pub(crate) fn table_mut(&mut self) -> &mut [u32] {
        &mut self.table
    }

    /// Number of valid entries in the saved table
    pub fn valid_entries(&self) -> usize {
        self.table
            .iter()
            .filter(|&&w| PageTableEntry::from_raw(w).is_valid())
            .count()
    }

    /// Serialize to the blob format
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let reg_count = u32::try_from(self.registers.len()).map_err(|_| IommuError::InvalidArgument)?;
        let pgt_words = u32::try_from(self.table.len()).map_err(|_| IommuError::InvalidArgument)?;

        let mut payload = Vec::with_capacity(self.registers.len() * 8 + self.table.len() * 4);
        for &(offset, value) in &self.registers {
            let offset = u32::try_from(offset).map_err(|_| IommuError::InvalidArgument)?;
            payload.extend_from_slice(&offset.to_le_bytes());
            payload.extend_from_slice(&value.to_le_bytes());
        }
        for word in &self.table {
            payload.extend_from_slice(&word.to_le_bytes());
        }

        let mut out = alloc::vec![0u8; HEADER_SIZE];
        put_u32(&mut out, offset_of!(SnapshotHeader, magic), SNAPSHOT_MAGIC);
        put_u16(&mut out, offset_of!(SnapshotHeader, version), SNAPSHOT_VERSION);
        put_u16(&mut out, offset_of!(SnapshotHeader, id), id_code(self.id));
        put_u32(&mut out, offset_of!(SnapshotHeader, reg_count), reg_count);
        put_u32(&mut out, offset_of!(SnapshotHeader, pgt_words), pgt_words);
        put_u32(&mut out, offset_of!(SnapshotHeader, checksum), checksum(&payload));
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Parse a blob, rejecting anything truncated, foreign or corrupt
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(IommuError::InvalidArgument);
        }
        if get_u32(bytes, offset_of!(SnapshotHeader, magic)) != SNAPSHOT_MAGIC
            || get_u16(bytes, offset_of!(SnapshotHeader, version)) != SNAPSHOT_VERSION
        {
            return Err(IommuError::InvalidArgument);
        }
        let id = id_from_code(get_u16(bytes, offset_of!(SnapshotHeader, id)))
            .ok_or(IommuError::InvalidArgument)?;
        let reg_count = get_u32(bytes, offset_of!(SnapshotHeader, reg_count)) as usize;
        let pgt_words = get_u32(bytes, offset_of!(SnapshotHeader, pgt_words)) as usize;

        let payload = &bytes[HEADER_SIZE..];
        let expected = reg_count
            .checked_mul(8)
            .and_then(|r| pgt_words.checked_mul(4).and_then(|t| r.checked_add(t)))
            .ok_or(IommuError::InvalidArgument)?;
        if payload.len() != expected {
            return Err(IommuError::InvalidArgument);
        }
        if checksum(payload) != get_u32(bytes, offset_of!(SnapshotHeader, checksum)) {
            return Err(IommuError::InvalidArgument);
        }

        let (reg_bytes, table_bytes) = payload.split_at(reg_count * 8);
        let registers = reg_bytes
            .chunks_exact(8)
            .map(|c| (get_u32(c, 0) as usize, get_u32(c, 4)))
            .collect();
        let table = table_bytes.chunks_exact(4).map(|c| get_u32(c, 0)).collect();
        Ok(Self::new(id, registers, table))
    }
}

fn id_code(id: IommuId) -> u16 {
    match id {
        IommuId::Gsp => 0,
        IommuId::Mm => 1,
        IommuId::Disp => 2,
    }
}

fn id_from_code(code: u16) -> Option<IommuId> {
    IommuId::ALL.iter().copied().find(|&id| id_code(id) == code)
}

fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(FNV_OFFSET, |h, &b| (h ^ b as u32).wrapping_mul(FNV_PRIME))
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn get_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
