//! Filesystem configuration and derived geometry.

use cfs_block::FlashDevice;
use cfs_error::{CfsError, Result};
use cfs_ondisk::table_len;
use cfs_types::{BlockSize, ByteOffset, FsBlock, file_block_offset, fs_block_offset};
use serde::{Deserialize, Serialize};

/// Filesystem construction parameters.
///
/// `total_size == 0` means "from `region_offset` to the end of the device",
/// rounded down to a whole number of blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    pub region_offset: u64,
    pub total_size: u64,
    pub block_size: u32,
    pub max_files: u16,
    pub max_open_files: u16,
    /// Delay between the last table mutation and the debounced persist.
    pub persist_delay_ms: u64,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            region_offset: 0,
            total_size: 0,
            block_size: 32 * 1024,
            max_files: 15,
            max_open_files: 15,
            persist_delay_ms: 10_000,
        }
    }
}

impl FsConfig {
    /// Check the configuration against `device` and derive the geometry.
    pub fn geometry(&self, device: &dyn FlashDevice) -> Result<FsGeometry> {
        let block_size = BlockSize::new(self.block_size).map_err(|err| {
            CfsError::InvalidArgument(format!("block_size={}: {err}", self.block_size))
        })?;
        let erase = u64::from(device.erase_block_size());
        if block_size.as_u64() % erase != 0 {
            return Err(CfsError::InvalidArgument(format!(
                "block_size={} is not a multiple of the erase block size {erase}",
                self.block_size
            )));
        }
        if self.region_offset % erase != 0 {
            return Err(CfsError::InvalidArgument(format!(
                "region_offset={} is not erase-block aligned",
                self.region_offset
            )));
        }
        let capacity = device.capacity();
        if self.region_offset >= capacity {
            return Err(CfsError::InvalidArgument(format!(
                "region_offset={} is past the device end {capacity}",
                self.region_offset
            )));
        }

        let total_size = if self.total_size == 0 {
            (capacity - self.region_offset) & !block_size.mask()
        } else {
            self.total_size
        };
        if total_size % block_size.as_u64() != 0 {
            return Err(CfsError::InvalidArgument(format!(
                "total_size={total_size} is not a multiple of block_size={block_size}"
            )));
        }
        if self.region_offset + total_size > capacity {
            return Err(CfsError::InvalidArgument(format!(
                "region {}+{total_size} exceeds device capacity {capacity}",
                self.region_offset
            )));
        }
        let blocks = total_size / block_size.as_u64();
        let total_blocks = u16::try_from(blocks).map_err(|_| {
            CfsError::InvalidArgument(format!("{blocks} blocks exceed the 65535 block limit"))
        })?;
        if total_blocks < 2 {
            return Err(CfsError::InvalidArgument(format!(
                "region holds {total_blocks} blocks, need at least 2"
            )));
        }
        if self.max_files == 0 || self.max_open_files == 0 {
            return Err(CfsError::InvalidArgument(
                "max_files and max_open_files must be non-zero".to_owned(),
            ));
        }
        let table = table_len(total_blocks, self.max_files);
        if table as u64 > block_size.as_u64() {
            return Err(CfsError::InvalidArgument(format!(
                "file table ({table} bytes) does not fit in one {block_size} byte block"
            )));
        }

        Ok(FsGeometry {
            region_offset: ByteOffset(self.region_offset),
            block_size,
            total_blocks,
            max_files: self.max_files,
            max_open_files: self.max_open_files,
        })
    }
}

/// Validated layout of a mounted filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsGeometry {
    pub region_offset: ByteOffset,
    pub block_size: BlockSize,
    pub total_blocks: u16,
    pub max_files: u16,
    pub max_open_files: u16,
}

impl FsGeometry {
    /// Blocks available to files (everything except the table block).
    #[must_use]
    pub fn data_blocks(&self) -> u16 {
        self.total_blocks - 1
    }

    #[must_use]
    pub fn table_len(&self) -> usize {
        table_len(self.total_blocks, self.max_files)
    }

    pub fn block_offset(&self, block: FsBlock) -> Result<ByteOffset> {
        fs_block_offset(self.region_offset, block, self.block_size)
            .ok_or_else(|| CfsError::OutOfRange(format!("block {block} offset overflows")))
    }

    /// Device offset of byte `logical` of a file starting at `first`.
    pub fn file_offset(&self, first: FsBlock, logical: u64) -> Result<ByteOffset> {
        file_block_offset(self.region_offset, first, self.block_size, logical).ok_or_else(|| {
            CfsError::OutOfRange(format!("file offset {logical} from block {first} overflows"))
        })
    }

    /// Bytes held by `blocks` blocks.
    #[must_use]
    pub fn bytes_of(&self, blocks: u16) -> u64 {
        u64::from(blocks) * self.block_size.as_u64()
    }
}
