#![forbid(unsafe_code)]
//! Flash I/O layer.
//!
//! Provides the [`FlashDevice`] trait (read / program / erase on raw
//! flash), two devices ([`MemoryFlash`] for tests and simulation,
//! [`FileFlash`] for image files) and the write-back [`BlockCache`] that
//! every filesystem access goes through.

mod cache;

pub use cache::{BlockCache, CacheConfig, CacheStats, EntryState};

use cfs_error::{CfsError, Result};
use cfs_types::ByteOffset;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Value of an erased flash cell.
pub const ERASED_BYTE: u8 = 0xFF;

/// Raw erase/program flash device.
///
/// Offsets are absolute byte addresses on the device. `erase` works on
/// whole erase blocks only; `write` programs already-erased cells.
pub trait FlashDevice: Send + Sync {
    /// Total addressable size in bytes.
    fn capacity(&self) -> u64;

    /// Minimum erasable region in bytes (a power of two).
    fn erase_block_size(&self) -> u32;

    /// Read `buf.len()` bytes at `offset`, returning the byte count.
    fn read(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize>;

    /// Program `buf` at `offset`, returning the byte count.
    fn write(&self, offset: ByteOffset, buf: &[u8]) -> Result<usize>;

    /// Erase `len` bytes at `offset`. Both must be erase-block multiples.
    fn erase(&self, offset: ByteOffset, len: u64) -> Result<()>;

    /// Push completed programs to stable storage.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

impl<D: FlashDevice + ?Sized> FlashDevice for Arc<D> {
    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn erase_block_size(&self) -> u32 {
        (**self).erase_block_size()
    }

    fn read(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        (**self).read(offset, buf)
    }

    fn write(&self, offset: ByteOffset, buf: &[u8]) -> Result<usize> {
        (**self).write(offset, buf)
    }

    fn erase(&self, offset: ByteOffset, len: u64) -> Result<()> {
        (**self).erase(offset, len)
    }

    fn flush(&self) -> Result<()> {
        (**self).flush()
    }
}

fn check_geometry(capacity: u64, erase_block_size: u32) -> Result<()> {
    if erase_block_size == 0 || !erase_block_size.is_power_of_two() {
        return Err(CfsError::InvalidArgument(format!(
            "invalid erase_block_size={erase_block_size} (must be power of two)"
        )));
    }
    let remainder = capacity % u64::from(erase_block_size);
    if capacity == 0 || remainder != 0 {
        return Err(CfsError::InvalidArgument(format!(
            "capacity is not erase-block aligned: capacity={capacity} erase_block_size={erase_block_size}"
        )));
    }
    Ok(())
}

fn check_range(capacity: u64, offset: ByteOffset, len: u64) -> Result<u64> {
    let end = offset
        .0
        .checked_add(len)
        .ok_or_else(|| CfsError::OutOfRange("device range overflows u64".to_owned()))?;
    if end > capacity {
        return Err(CfsError::OutOfRange(format!(
            "device access out of bounds: offset={offset} len={len} capacity={capacity}"
        )));
    }
    Ok(end)
}

fn check_erase(capacity: u64, erase_block_size: u32, offset: ByteOffset, len: u64) -> Result<()> {
    let mask = u64::from(erase_block_size) - 1;
    if offset.0 & mask != 0 || len & mask != 0 {
        return Err(CfsError::InvalidArgument(format!(
            "erase not block aligned: offset={offset} len={len} erase_block_size={erase_block_size}"
        )));
    }
    check_range(capacity, offset, len).map(|_| ())
}

fn len_u64(len: usize) -> Result<u64> {
    u64::try_from(len).map_err(|_| CfsError::OutOfRange("length overflows u64".to_owned()))
}

fn offset_usize(offset: ByteOffset) -> Result<usize> {
    offset
        .to_usize()
        .map_err(|_| CfsError::OutOfRange(format!("offset {offset} does not fit usize")))
}

/// Operation counters kept by [`MemoryFlash`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashCounters {
    pub reads: u64,
    pub programs: u64,
    pub erases: u64,
}

/// RAM-backed NOR flash emulation.
///
/// Erase sets cells to `0xFF`. Programming can only clear bits (the new
/// cell value is `old & data`), so data written without a prior erase is
/// corrupted the same way real NOR flash corrupts it.
#[derive(Debug)]
pub struct MemoryFlash {
    cells: Mutex<Vec<u8>>,
    erase_block_size: u32,
    reads: AtomicU64,
    programs: AtomicU64,
    erases: AtomicU64,
}

impl MemoryFlash {
    /// Create an erased device of `capacity` bytes.
    pub fn new(capacity: usize, erase_block_size: u32) -> Result<Self> {
        check_geometry(len_u64(capacity)?, erase_block_size)?;
        Ok(Self {
            cells: Mutex::new(vec![ERASED_BYTE; capacity]),
            erase_block_size,
            reads: AtomicU64::new(0),
            programs: AtomicU64::new(0),
            erases: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn counters(&self) -> FlashCounters {
        FlashCounters {
            reads: self.reads.load(Ordering::Relaxed),
            programs: self.programs.load(Ordering::Relaxed),
            erases: self.erases.load(Ordering::Relaxed),
        }
    }

    /// Copy of the raw cell contents, bypassing every cache.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.cells.lock().clone()
    }
}

impl FlashDevice for MemoryFlash {
    fn capacity(&self) -> u64 {
        u64::try_from(self.cells.lock().len()).unwrap_or(0)
    }

    fn erase_block_size(&self) -> u32 {
        self.erase_block_size
    }

    fn read(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        let cells = self.cells.lock();
        let end = check_range(len_u64(cells.len())?, offset, len_u64(buf.len())?)?;
        let start = offset_usize(offset)?;
        buf.copy_from_slice(&cells[start..offset_usize(ByteOffset(end))?]);
        drop(cells);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn write(&self, offset: ByteOffset, buf: &[u8]) -> Result<usize> {
        let mut cells = self.cells.lock();
        check_range(len_u64(cells.len())?, offset, len_u64(buf.len())?)?;
        let start = offset_usize(offset)?;
        for (cell, byte) in cells[start..start + buf.len()].iter_mut().zip(buf) {
            *cell &= *byte;
        }
        drop(cells);
        self.programs.fetch_add(1, Ordering::Relaxed);
        Ok(buf.len())
    }

    fn erase(&self, offset: ByteOffset, len: u64) -> Result<()> {
        let mut cells = self.cells.lock();
        check_erase(len_u64(cells.len())?, self.erase_block_size, offset, len)?;
        let start = offset_usize(offset)?;
        let end = offset_usize(ByteOffset(offset.0 + len))?;
        cells[start..end].fill(ERASED_BYTE);
        drop(cells);
        self.erases.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Flash image stored in a regular file (`pread`/`pwrite` style I/O).
///
/// Programs overwrite bytes directly; erase fills with `0xFF`.
#[derive(Debug, Clone)]
pub struct FileFlash {
    file: Arc<File>,
    len: u64,
    erase_block_size: u32,
    writable: bool,
}

impl FileFlash {
    /// Create (or truncate) an image of `capacity` erased bytes.
    pub fn create(path: impl AsRef<Path>, capacity: u64, erase_block_size: u32) -> Result<Self> {
        check_geometry(capacity, erase_block_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        let erased = vec![ERASED_BYTE; erase_block_size as usize];
        let mut offset = 0_u64;
        while offset < capacity {
            file.write_all_at(&erased, offset)?;
            offset += u64::from(erase_block_size);
        }
        file.sync_all()?;
        Ok(Self {
            file: Arc::new(file),
            len: capacity,
            erase_block_size,
            writable: true,
        })
    }

    /// Open an existing image, read-write if possible, read-only otherwise.
    pub fn open(path: impl AsRef<Path>, erase_block_size: u32) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        check_geometry(len, erase_block_size)?;
        Ok(Self {
            file: Arc::new(file),
            len,
            erase_block_size,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl FlashDevice for FileFlash {
    fn capacity(&self) -> u64 {
        self.len
    }

    fn erase_block_size(&self) -> u32 {
        self.erase_block_size
    }

    fn read(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        check_range(self.len, offset, len_u64(buf.len())?)?;
        self.file.read_exact_at(buf, offset.0)?;
        Ok(buf.len())
    }

    fn write(&self, offset: ByteOffset, buf: &[u8]) -> Result<usize> {
        if !self.writable {
            return Err(CfsError::AccessDenied);
        }
        check_range(self.len, offset, len_u64(buf.len())?)?;
        self.file.write_all_at(buf, offset.0)?;
        Ok(buf.len())
    }

    fn erase(&self, offset: ByteOffset, len: u64) -> Result<()> {
        if !self.writable {
            return Err(CfsError::AccessDenied);
        }
        check_erase(self.len, self.erase_block_size, offset, len)?;
        let erased = vec![ERASED_BYTE; self.erase_block_size as usize];
        let mut at = offset.0;
        while at < offset.0 + len {
            self.file.write_all_at(&erased, at)?;
            at += u64::from(self.erase_block_size);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if self.writable {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_flash_starts_erased() {
        let dev = MemoryFlash::new(4096 * 2, 4096).expect("device");
        let mut buf = [0_u8; 16];
        dev.read(ByteOffset(4090), &mut buf).expect("read");
        assert_eq!(buf, [ERASED_BYTE; 16]);
    }

    #[test]
    fn memory_flash_program_only_clears_bits() {
        let dev = MemoryFlash::new(4096, 4096).expect("device");
        dev.write(ByteOffset(0), &[0x0F]).expect("first program");
        dev.write(ByteOffset(0), &[0xF1]).expect("second program");
        let mut out = [0_u8; 1];
        dev.read(ByteOffset(0), &mut out).expect("read");
        assert_eq!(out[0], 0x01);

        dev.erase(ByteOffset(0), 4096).expect("erase");
        dev.write(ByteOffset(0), &[0xF1]).expect("program after erase");
        dev.read(ByteOffset(0), &mut out).expect("read");
        assert_eq!(out[0], 0xF1);

        let counters = dev.counters();
        assert_eq!(counters.programs, 3);
        assert_eq!(counters.erases, 1);
    }

    #[test]
    fn memory_flash_rejects_misaligned_erase() {
        let dev = MemoryFlash::new(4096 * 4, 4096).expect("device");
        assert!(matches!(
            dev.erase(ByteOffset(100), 4096),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            dev.erase(ByteOffset(0), 100),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            dev.erase(ByteOffset(4096 * 4), 4096),
            Err(CfsError::OutOfRange(_))
        ));
    }

    #[test]
    fn memory_flash_rejects_out_of_bounds_io() {
        let dev = MemoryFlash::new(4096, 4096).expect("device");
        let mut buf = [0_u8; 8];
        assert!(matches!(
            dev.read(ByteOffset(4092), &mut buf),
            Err(CfsError::OutOfRange(_))
        ));
        assert!(matches!(
            dev.write(ByteOffset(4095), &buf),
            Err(CfsError::OutOfRange(_))
        ));
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        assert!(MemoryFlash::new(4096, 3000).is_err());
        assert!(MemoryFlash::new(5000, 4096).is_err());
        assert!(MemoryFlash::new(0, 4096).is_err());
    }

    #[test]
    fn file_flash_round_trips_and_persists() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("flash.img");
        {
            let dev = FileFlash::create(&path, 4096 * 4, 4096).expect("create");
            dev.erase(ByteOffset(4096), 4096).expect("erase");
            dev.write(ByteOffset(4096), b"contig").expect("write");
            dev.flush().expect("flush");
        }

        let dev = FileFlash::open(&path, 4096).expect("open");
        assert!(dev.is_writable());
        assert_eq!(dev.capacity(), 4096 * 4);
        let mut buf = [0_u8; 8];
        dev.read(ByteOffset(4096), &mut buf).expect("read");
        assert_eq!(&buf[..6], b"contig");
        assert_eq!(&buf[6..], &[ERASED_BYTE; 2]);
    }

    #[test]
    fn file_flash_open_rejects_unaligned_image() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.img");
        std::fs::write(&path, vec![0_u8; 1000]).expect("write image");
        assert!(matches!(
            FileFlash::open(&path, 4096),
            Err(CfsError::InvalidArgument(_))
        ));
    }
}
