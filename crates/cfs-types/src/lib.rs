#![forbid(unsafe_code)]
//! Shared vocabulary types for ContigFS.
//!
//! Unit-carrying newtypes keep device blocks, filesystem blocks and byte
//! offsets apart at compile time. The little-endian helpers are the only
//! way on-disk structures are read or written: layouts are expressed as
//! explicit offsets and widths, never as reinterpreted memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Magic number at the start of a persisted File Table (`"XPFS"` on disk).
pub const TABLE_MAGIC: u32 = u32::from_le_bytes(*b"XPFS");

/// Fixed width of a file name slot, including the terminating NUL.
pub const NAME_SLOT_LEN: usize = 32;

/// Longest file name that fits in a name slot.
pub const MAX_NAME_LEN: usize = NAME_SLOT_LEN - 1;

/// Bits per allocation bitmap word.
pub const BITMAP_WORD_BITS: u32 = 32;

/// Block number on a flash device, in units of the device erase block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Block index inside a filesystem region, in units of the filesystem block.
///
/// Index 0 always holds the File Table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FsBlock(pub u16);

/// Byte offset on a flash device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Identifier of a device registered with a block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Validated block size (power of two in 256..=1 MiB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const MIN: u32 = 256;
    pub const MAX: u32 = 1 << 20;

    /// Create a `BlockSize` if `value` is a power of two in range.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(Self::MIN..=Self::MAX).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 256..=1048576",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        u64::from(self.0)
    }

    /// Mask selecting the offset inside a block.
    #[must_use]
    pub fn mask(self) -> u64 {
        u64::from(self.0) - 1
    }

    /// Number of whole blocks needed to hold `bytes` bytes.
    #[must_use]
    pub fn blocks_for(self, bytes: u64) -> u64 {
        bytes.div_ceil(u64::from(self.0))
    }
}

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

impl FsBlock {
    pub const TABLE: Self = Self(0);

    /// Advance by `count` blocks, returning `None` past `u16::MAX`.
    #[must_use]
    pub fn checked_add(self, count: u16) -> Option<Self> {
        self.0.checked_add(count).map(Self)
    }
}

/// Translate a logical file offset into a device byte offset.
///
/// A file is stored as one contiguous run starting at `first_block`, so the
/// Nth byte of the file lives `logical` bytes past the start of that block.
/// Returns `None` on overflow.
#[must_use]
pub fn file_block_offset(
    region_start: ByteOffset,
    first_block: FsBlock,
    block_size: BlockSize,
    logical: u64,
) -> Option<ByteOffset> {
    let run_start = u64::from(first_block.0).checked_mul(block_size.as_u64())?;
    region_start
        .0
        .checked_add(run_start)?
        .checked_add(logical)
        .map(ByteOffset)
}

/// Device byte offset of filesystem block `block` inside a region.
#[must_use]
pub fn fs_block_offset(
    region_start: ByteOffset,
    block: FsBlock,
    block_size: BlockSize,
) -> Option<ByteOffset> {
    file_block_offset(region_start, block, block_size, 0)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    let actual = data.len().saturating_sub(offset);
    data.get_mut(offset..end)
        .ok_or(ParseError::InsufficientData {
            needed: len,
            offset,
            actual,
        })
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_fixed(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Copy `name` into a NUL-padded name slot.
///
/// Returns `None` if the name is empty, too long, or contains a NUL byte.
#[must_use]
pub fn encode_name(name: &str) -> Option<[u8; NAME_SLOT_LEN]> {
    let raw = name.as_bytes();
    if raw.is_empty() || raw.len() > MAX_NAME_LEN || raw.contains(&0) {
        return None;
    }
    let mut slot = [0_u8; NAME_SLOT_LEN];
    slot[..raw.len()].copy_from_slice(raw);
    Some(slot)
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FsBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u32(&bytes, 4).expect("u32"), 0x90AB_CDEF);
        assert!(matches!(
            read_le_u32(&bytes, 6),
            Err(ParseError::InsufficientData {
                needed: 4,
                offset: 6,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_write_helpers() {
        let mut bytes = [0_u8; 6];
        write_le_u16(&mut bytes, 0, 0xBEEF).expect("u16");
        write_le_u32(&mut bytes, 2, 0x0102_0304).expect("u32");
        assert_eq!(bytes, [0xEF, 0xBE, 0x04, 0x03, 0x02, 0x01]);
        assert!(write_le_u32(&mut bytes, 4, 1).is_err());
    }

    #[test]
    fn test_magic_is_ascii_on_disk() {
        assert_eq!(TABLE_MAGIC.to_le_bytes(), *b"XPFS");
    }

    #[test]
    fn test_name_slot_round_trip() {
        let slot = encode_name("boot.bin").expect("fits");
        assert_eq!(trim_nul_padded(&slot), "boot.bin");
        assert!(encode_name("").is_none());
        assert!(encode_name(&"x".repeat(MAX_NAME_LEN)).is_some());
        assert!(encode_name(&"x".repeat(NAME_SLOT_LEN)).is_none());
        assert!(encode_name("a\0b").is_none());
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(32 * 1024).is_ok());
        assert_eq!(BlockSize::new(4096).unwrap().mask(), 4095);

        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(128).is_err());
        assert!(BlockSize::new(2 << 20).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn test_blocks_for_rounds_up() {
        let bs = BlockSize::new(4096).unwrap();
        assert_eq!(bs.blocks_for(0), 0);
        assert_eq!(bs.blocks_for(1), 1);
        assert_eq!(bs.blocks_for(4096), 1);
        assert_eq!(bs.blocks_for(4097), 2);
    }

    #[test]
    fn test_file_block_offset() {
        let bs = BlockSize::new(4096).unwrap();
        let region = ByteOffset(0x10_0000);
        assert_eq!(
            file_block_offset(region, FsBlock(3), bs, 0),
            Some(ByteOffset(0x10_0000 + 3 * 4096))
        );
        // The tenth byte of the second block of the file.
        assert_eq!(
            file_block_offset(region, FsBlock(3), bs, 4096 + 10),
            Some(ByteOffset(0x10_0000 + 4 * 4096 + 10))
        );
        assert_eq!(fs_block_offset(region, FsBlock::TABLE, bs), Some(region));
        assert_eq!(
            file_block_offset(ByteOffset(u64::MAX), FsBlock(1), bs, 0),
            None
        );
    }
}
