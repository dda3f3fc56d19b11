#![forbid(unsafe_code)]
//! On-disk format of the ContigFS File Table.
//!
//! Pure parsing crate: no I/O, no side effects. The table lives at the
//! start of filesystem block 0 and is laid out little-endian:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | magic `"XPFS"` |
//! | 4 | `ceil(total_blocks / 32) * 4` | allocation bitmap (`u32` words) |
//! | .. | `max_files * 44` | entries |
//! | .. | 2 | table CRC |
//! | .. | 2 | in-use entry count |
//!
//! Each entry:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00 | 32 | name, NUL padded |
//! | 0x20 | 4 | size in bytes |
//! | 0x24 | 2 | first block |
//! | 0x26 | 2 | block count |
//! | 0x28 | 2 | in-use flag |
//! | 0x2A | 2 | entry checksum |
//!
//! Both checksums are CRC32C folded to 16 bits (`hi ^ lo`). The entry
//! checksum covers bytes `0x00..0x2A` of the entry; the table CRC covers
//! everything before it.

use cfs_types::{
    BITMAP_WORD_BITS, NAME_SLOT_LEN, ParseError, TABLE_MAGIC, ensure_slice, read_fixed,
    read_le_u16, read_le_u32, trim_nul_padded, write_fixed, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

pub const MAGIC_SIZE: usize = 4;
pub const ENTRY_SIZE: usize = 44;
const ENTRY_CHECKED_LEN: usize = 0x2A;
const TRAILER_SIZE: usize = 4;

/// Fold a CRC32C into the 16-bit form stored on disk.
#[must_use]
pub fn fold_crc(crc: u32) -> u16 {
    // Both halves fit u16 after the shift and mask.
    #[expect(clippy::cast_possible_truncation)]
    let folded = ((crc >> 16) ^ (crc & 0xFFFF)) as u16;
    folded
}

#[must_use]
pub fn bitmap_bytes(total_blocks: u16) -> usize {
    usize::from(total_blocks).div_ceil(BITMAP_WORD_BITS as usize) * 4
}

/// Encoded size of a table for the given geometry.
#[must_use]
pub fn table_len(total_blocks: u16, max_files: u16) -> usize {
    MAGIC_SIZE + bitmap_bytes(total_blocks) + usize::from(max_files) * ENTRY_SIZE + TRAILER_SIZE
}

/// Read only the magic number, to tell a formatted region from a blank one.
pub fn peek_magic(bytes: &[u8]) -> Result<u32, ParseError> {
    read_le_u32(bytes, 0)
}

// ── Entries ─────────────────────────────────────────────────────────────────

/// One File Table slot as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEntry {
    pub name: [u8; NAME_SLOT_LEN],
    pub size: u32,
    pub first_block: u16,
    pub block_count: u16,
    pub in_use: bool,
    pub checksum: u16,
}

impl RawEntry {
    pub const EMPTY: Self = Self {
        name: [0; NAME_SLOT_LEN],
        size: 0,
        first_block: 0,
        block_count: 0,
        in_use: false,
        checksum: 0,
    };

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, ENTRY_SIZE)?;
        Ok(Self {
            name: read_fixed::<NAME_SLOT_LEN>(bytes, 0x00)?,
            size: read_le_u32(bytes, 0x20)?,
            first_block: read_le_u16(bytes, 0x24)?,
            block_count: read_le_u16(bytes, 0x26)?,
            in_use: read_le_u16(bytes, 0x28)? != 0,
            checksum: read_le_u16(bytes, 0x2A)?,
        })
    }

    fn write_fields(&self, out: &mut [u8]) -> Result<(), ParseError> {
        write_fixed(out, 0x00, &self.name)?;
        write_le_u32(out, 0x20, self.size)?;
        write_le_u16(out, 0x24, self.first_block)?;
        write_le_u16(out, 0x26, self.block_count)?;
        write_le_u16(out, 0x28, u16::from(self.in_use))
    }

    /// Serialize into `out[..ENTRY_SIZE]` with the stored checksum.
    pub fn write_to(&self, out: &mut [u8]) -> Result<(), ParseError> {
        self.write_fields(out)?;
        write_le_u16(out, 0x2A, self.checksum)
    }

    /// Checksum of the current field values.
    #[must_use]
    pub fn compute_checksum(&self) -> u16 {
        let mut raw = [0_u8; ENTRY_SIZE];
        // The buffer is exactly ENTRY_SIZE, so the writes cannot fail.
        if self.write_fields(&mut raw).is_err() {
            return 0;
        }
        fold_crc(crc32c::crc32c(&raw[..ENTRY_CHECKED_LEN]))
    }

    /// Copy with the checksum field refreshed.
    #[must_use]
    pub fn sealed(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }

    #[must_use]
    pub fn checksum_ok(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// One past the last block of the entry's run.
    #[must_use]
    pub fn end_block(&self) -> u32 {
        u32::from(self.first_block) + u32::from(self.block_count)
    }
}

// ── Table ───────────────────────────────────────────────────────────────────

/// Decoded File Table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTable {
    pub bitmap: Vec<u32>,
    pub entries: Vec<RawEntry>,
    /// CRC read from disk (or computed by `encode`).
    pub table_crc: u16,
    pub file_count: u16,
}

impl FileTable {
    /// Empty table for the given geometry, with block 0 allocated.
    #[must_use]
    pub fn empty(total_blocks: u16, max_files: u16) -> Self {
        let mut bitmap = vec![0_u32; bitmap_bytes(total_blocks) / 4];
        if let Some(first) = bitmap.first_mut() {
            *first = 1;
        }
        Self {
            bitmap,
            entries: vec![RawEntry::EMPTY; usize::from(max_files)],
            table_crc: 0,
            file_count: 0,
        }
    }

    /// Parse a table of the given geometry from the start of `bytes`.
    ///
    /// Fails with `InvalidMagic` when the region was never formatted.
    pub fn parse(bytes: &[u8], total_blocks: u16, max_files: u16) -> Result<Self, ParseError> {
        let len = table_len(total_blocks, max_files);
        ensure_slice(bytes, 0, len)?;

        let magic = peek_magic(bytes)?;
        if magic != TABLE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(TABLE_MAGIC),
                actual: u64::from(magic),
            });
        }

        let bitmap_len = bitmap_bytes(total_blocks);
        let bitmap = (0..bitmap_len / 4)
            .map(|word| read_le_u32(bytes, MAGIC_SIZE + word * 4))
            .collect::<Result<Vec<_>, _>>()?;

        let entries_at = MAGIC_SIZE + bitmap_len;
        let entries = (0..usize::from(max_files))
            .map(|slot| {
                let at = entries_at + slot * ENTRY_SIZE;
                RawEntry::parse_from_bytes(ensure_slice(bytes, at, ENTRY_SIZE)?)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let trailer_at = len - TRAILER_SIZE;
        Ok(Self {
            bitmap,
            entries,
            table_crc: read_le_u16(bytes, trailer_at)?,
            file_count: read_le_u16(bytes, trailer_at + 2)?,
        })
    }

    /// Serialize to exactly `table_len` bytes, computing the table CRC and
    /// the file count.
    pub fn encode(&self) -> Result<Vec<u8>, ParseError> {
        let bitmap_len = self.bitmap.len() * 4;
        let len = MAGIC_SIZE + bitmap_len + self.entries.len() * ENTRY_SIZE + TRAILER_SIZE;
        let mut out = vec![0_u8; len];

        write_le_u32(&mut out, 0, TABLE_MAGIC)?;
        for (word_idx, word) in self.bitmap.iter().enumerate() {
            write_le_u32(&mut out, MAGIC_SIZE + word_idx * 4, *word)?;
        }
        let entries_at = MAGIC_SIZE + bitmap_len;
        for (slot, entry) in self.entries.iter().enumerate() {
            let at = entries_at + slot * ENTRY_SIZE;
            entry.write_to(&mut out[at..at + ENTRY_SIZE])?;
        }

        let trailer_at = len - TRAILER_SIZE;
        let crc = fold_crc(crc32c::crc32c(&out[..trailer_at]));
        let count = u16::try_from(self.entries.iter().filter(|e| e.in_use).count())
            .map_err(|_| ParseError::IntegerConversion { field: "file_count" })?;
        write_le_u16(&mut out, trailer_at, crc)?;
        write_le_u16(&mut out, trailer_at + 2, count)?;
        Ok(out)
    }

    /// Whether the stored table CRC matches `bytes` (the encoded table).
    #[must_use]
    pub fn crc_matches(&self, bytes: &[u8]) -> bool {
        let len = MAGIC_SIZE + self.bitmap.len() * 4 + self.entries.len() * ENTRY_SIZE;
        bytes.len() >= len && fold_crc(crc32c::crc32c(&bytes[..len])) == self.table_crc
    }
}
