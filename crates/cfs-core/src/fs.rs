//! The contiguous-file filesystem.

use crate::compact;
use crate::config::{FsConfig, FsGeometry};
use crate::table::{Entry, FsTable, parse_error_to_cfs};
use crate::volume::Volume;
use cfs_block::BlockCache;
use cfs_error::{CfsError, Result};
use cfs_ondisk::{FileTable, peek_magic};
use cfs_types::{ByteOffset, DeviceId, FsBlock, ParseError, TABLE_MAGIC, encode_name};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

/// Largest file size the table can record.
const MAX_FILE_SIZE: u64 = u32::MAX as u64;

// ── Public types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    #[must_use]
    pub fn can_read(self) -> bool {
        matches!(self, Self::ReadOnly | Self::ReadWrite)
    }

    #[must_use]
    pub fn can_write(self) -> bool {
        matches!(self, Self::WriteOnly | Self::ReadWrite)
    }
}

/// Token for an open file. Stale tokens (closed, or slot reused) are
/// rejected with `InvalidArgument`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle {
    slot: u16,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileStat {
    pub size: u64,
    pub blocks: u16,
    pub block_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub first_block: u16,
    pub block_count: u16,
    /// Blocks held by a pending reservation.
    pub reserved_blocks: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FsUsage {
    pub total_blocks: u16,
    pub free_blocks: u16,
    pub largest_free_run: u16,
    pub files: usize,
}

// ── State ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct OpenFile {
    /// `None` once the file was unlinked or the filesystem reformatted.
    entry: Option<usize>,
    cursor: u64,
    mode: OpenMode,
    wrote: bool,
    owns_reservation: bool,
}

#[derive(Debug, Default)]
struct HandleSlot {
    generation: u32,
    open: Option<OpenFile>,
}

#[derive(Debug)]
struct FsState {
    table: FsTable,
    handles: Vec<HandleSlot>,
    table_dirty: bool,
    /// Remaining time before the debounced table persist.
    persist_in_ms: Option<u64>,
}

fn stale(handle: FileHandle) -> CfsError {
    CfsError::InvalidArgument(format!("stale file handle {}", handle.slot))
}

fn unlinked() -> CfsError {
    CfsError::NotFound("file was removed while open".to_owned())
}

impl FsState {
    fn open_file(&self, handle: FileHandle) -> Result<&OpenFile> {
        self.handles
            .get(usize::from(handle.slot))
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.open.as_ref())
            .ok_or_else(|| stale(handle))
    }

    fn open_file_mut(&mut self, handle: FileHandle) -> Result<&mut OpenFile> {
        self.handles
            .get_mut(usize::from(handle.slot))
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.open.as_mut())
            .ok_or_else(|| stale(handle))
    }

    /// Entry slot behind `handle`.
    fn attached(&self, handle: FileHandle) -> Result<usize> {
        self.open_file(handle)?.entry.ok_or_else(unlinked)
    }

    fn handles_on(&mut self, idx: usize) -> impl Iterator<Item = &mut OpenFile> {
        self.handles
            .iter_mut()
            .filter_map(|slot| slot.open.as_mut())
            .filter(move |open| open.entry == Some(idx))
    }

    fn detach(&mut self, idx: usize) {
        for open in self.handles_on(idx) {
            open.entry = None;
            open.owns_reservation = false;
        }
    }

    fn schedule_persist(&mut self, delay_ms: u64) {
        if self.table_dirty {
            self.persist_in_ms = Some(delay_ms);
        }
    }

    /// Give back the unconsumed part of a reservation.
    fn drop_reservation(&mut self, idx: usize) -> Result<()> {
        let entry = self.table.entry(idx)?;
        if entry.reserved == 0 {
            return Ok(());
        }
        let (tail, reserved) = (FsBlock(entry.first + entry.count), entry.reserved);
        self.table.bitmap.free(tail, reserved)?;
        let entry = self.table.entry_mut(idx)?;
        entry.reserved = 0;
        if entry.count == 0 {
            entry.first = 0;
        }
        debug!(target: "cfs::fs", slot = idx, blocks = reserved, "reservation_released");
        Ok(())
    }
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// A mounted filesystem: one region of one cached flash device.
///
/// Every file is a single run of consecutive blocks, so its bytes can be
/// addressed in place on the device (see [`ContigFs::map`]). All methods
/// serialize on an internal lock and may be called from several threads.
#[derive(Debug)]
pub struct ContigFs {
    volume: Volume,
    persist_delay_ms: u64,
    state: Mutex<FsState>,
}

impl ContigFs {
    /// Mount the filesystem described by `config` on `device`.
    ///
    /// A region without a table is formatted in memory; the new table is
    /// persisted after the configured delay or on [`ContigFs::sync`].
    pub fn mount(cache: Arc<BlockCache>, device: DeviceId, config: &FsConfig) -> Result<Self> {
        let flash = cache.device(device)?;
        let geometry = config.geometry(flash.as_ref())?;
        let volume = Volume {
            cache,
            device,
            geometry,
        };

        let raw = volume.read_table()?;
        let (table, dirty) =
            match FileTable::parse(&raw, geometry.total_blocks, geometry.max_files) {
                Ok(disk) => {
                    if !disk.crc_matches(&raw) {
                        warn!(target: "cfs::fs", stored = disk.table_crc, "table_crc_mismatch");
                    }
                    FsTable::from_disk(&disk, &geometry)?
                }
                Err(ParseError::InvalidMagic { actual, .. }) => {
                    warn!(target: "cfs::fs", magic = actual, "uninitialized_table_formatting");
                    (FsTable::empty(&geometry)?, true)
                }
                Err(err) => return Err(parse_error_to_cfs(&err)),
            };

        info!(
            target: "cfs::fs",
            device = device.0,
            region_offset = geometry.region_offset.0,
            total_blocks = geometry.total_blocks,
            block_size = geometry.block_size.get(),
            files = table.file_count(),
            "mount"
        );

        let state = FsState {
            table,
            handles: (0..geometry.max_open_files)
                .map(|_| HandleSlot::default())
                .collect(),
            table_dirty: dirty,
            persist_in_ms: dirty.then_some(config.persist_delay_ms),
        };
        Ok(Self {
            volume,
            persist_delay_ms: config.persist_delay_ms,
            state: Mutex::new(state),
        })
    }

    /// Whether the region described by `config` holds a File Table.
    pub fn probe(cache: &BlockCache, device: DeviceId, config: &FsConfig) -> Result<bool> {
        let flash = cache.device(device)?;
        let geometry = config.geometry(flash.as_ref())?;
        let mut magic = [0_u8; 4];
        cache.read(device, geometry.region_offset, &mut magic)?;
        Ok(peek_magic(&magic).map_err(|err| parse_error_to_cfs(&err))? == TABLE_MAGIC)
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.volume.geometry
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.volume.cache
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.volume.device
    }

    /// Drop every file. Open handles are detached.
    pub fn format(&self) -> Result<()> {
        let mut st = self.state.lock();
        st.table = FsTable::empty(&self.volume.geometry)?;
        for open in st.handles.iter_mut().filter_map(|slot| slot.open.as_mut()) {
            open.entry = None;
            open.owns_reservation = false;
        }
        st.table_dirty = true;
        st.schedule_persist(self.persist_delay_ms);
        info!(target: "cfs::fs", total_blocks = self.volume.geometry.total_blocks, "format");
        Ok(())
    }

    /// Open `name`, creating an empty file if it does not exist and
    /// `create` is set.
    pub fn open(&self, name: &str, mode: OpenMode, create: bool) -> Result<FileHandle> {
        if encode_name(name).is_none() {
            return Err(CfsError::InvalidArgument(format!(
                "invalid file name {name:?} (1..=31 bytes, no NUL)"
            )));
        }
        let mut st = self.state.lock();
        let slot = st
            .handles
            .iter()
            .position(|slot| slot.open.is_none())
            .ok_or(CfsError::TooManyFiles)?;

        let idx = match st.table.find(name) {
            Some(idx) => idx,
            None if create => {
                let idx = st.table.free_slot().ok_or(CfsError::TooManyFiles)?;
                st.table.entries[idx] = Some(Entry::new(name));
                st.table_dirty = true;
                debug!(target: "cfs::fs", name, slot = idx, "create");
                idx
            }
            None => return Err(CfsError::NotFound(name.to_owned())),
        };

        let slot_id = u16::try_from(slot).map_err(|_| CfsError::TooManyFiles)?;
        let handle_slot = &mut st.handles[slot];
        handle_slot.open = Some(OpenFile {
            entry: Some(idx),
            cursor: 0,
            mode,
            wrote: false,
            owns_reservation: false,
        });
        let handle = FileHandle {
            slot: slot_id,
            generation: handle_slot.generation,
        };
        trace!(target: "cfs::fs", name, handle = slot, ?mode, "open");
        Ok(handle)
    }

    /// Pre-allocate a contiguous run for `bytes` bytes on an empty file.
    ///
    /// Files that already own blocks are left unchanged. The run is
    /// consumed block by block as the file grows; whatever is left when the
    /// reserving handle closes is released.
    pub fn reserve(&self, handle: FileHandle, bytes: u64) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        if !st.open_file(handle)?.mode.can_write() {
            return Err(CfsError::AccessDenied);
        }
        let idx = st.attached(handle)?;
        let geometry = &self.volume.geometry;

        let wanted = geometry.block_size.blocks_for(bytes);
        if wanted > u64::from(geometry.data_blocks()) {
            return Err(CfsError::OutOfRange(format!(
                "{bytes} bytes need {wanted} blocks, the filesystem has {}",
                geometry.data_blocks()
            )));
        }
        // Bounded by data_blocks above.
        #[expect(clippy::cast_possible_truncation)]
        let wanted = wanted as u16;
        if wanted == 0 || st.table.entry(idx)?.span() > 0 {
            return Ok(());
        }

        let start = compact::find_run(&self.volume, &mut st.table, wanted)?;
        st.table.bitmap.allocate(start, wanted)?;
        let entry = st.table.entry_mut(idx)?;
        entry.first = start.0;
        entry.reserved = wanted;
        st.open_file_mut(handle)?.owns_reservation = true;
        debug!(target: "cfs::fs", slot = idx, first = start.0, blocks = wanted, "reserve");
        Ok(())
    }

    /// Write `data` at the handle's cursor, growing the file as needed.
    ///
    /// Returns the number of bytes written, which is short only when the
    /// filesystem ran out of space part-way. A device failure resets the
    /// file to empty before the error is returned.
    pub fn write(&self, handle: FileHandle, data: &[u8]) -> Result<usize> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let file = st.open_file(handle)?;
        if !file.mode.can_write() {
            return Err(CfsError::AccessDenied);
        }
        let idx = file.entry.ok_or_else(unlinked)?;
        if data.is_empty() {
            return Ok(0);
        }
        let mut cursor = file.cursor;
        let geometry = self.volume.geometry;

        let mut written = 0_usize;
        while written < data.len() {
            if cursor >= MAX_FILE_SIZE {
                if written > 0 {
                    break;
                }
                return Err(CfsError::OutOfRange("file size limit reached".to_owned()));
            }
            let entry = st.table.entry(idx)?;
            let (first, count) = (FsBlock(entry.first), entry.count);
            let capacity = geometry.bytes_of(count);
            if cursor >= capacity {
                match self.grow(st, idx) {
                    Ok(()) => continue,
                    Err(CfsError::OutOfSpace) if written > 0 => break,
                    Err(CfsError::OutOfSpace) => return Err(CfsError::OutOfSpace),
                    Err(err) => {
                        self.roll_back(st, idx, &err);
                        return Err(err);
                    }
                }
            }

            let room = capacity.min(MAX_FILE_SIZE) - cursor;
            let chunk = usize::try_from(room)
                .unwrap_or(usize::MAX)
                .min(data.len() - written);
            let result = geometry.file_offset(first, cursor).and_then(|offset| {
                self.volume
                    .cache
                    .write(self.volume.device, offset, &data[written..written + chunk])
            });
            if let Err(err) = result {
                self.roll_back(st, idx, &err);
                return Err(err);
            }
            written += chunk;
            cursor += chunk as u64;

            let entry = st.table.entry_mut(idx)?;
            if cursor > u64::from(entry.size) {
                // cursor <= MAX_FILE_SIZE.
                #[expect(clippy::cast_possible_truncation)]
                let size = cursor as u32;
                entry.size = size;
                st.table_dirty = true;
            }
        }

        let file = st.open_file_mut(handle)?;
        file.cursor = cursor;
        file.wrote = true;
        trace!(target: "cfs::fs", slot = idx, bytes = written, cursor, "write");
        Ok(written)
    }

    /// Add exactly one block to the end of file `idx`.
    fn grow(&self, st: &mut FsState, idx: usize) -> Result<()> {
        let table = &mut st.table;
        let entry = table.entry(idx)?;
        let (first, count, reserved) = (entry.first, entry.count, entry.reserved);

        if reserved > 0 {
            let entry = table.entry_mut(idx)?;
            entry.count += 1;
            entry.reserved -= 1;
            st.table_dirty = true;
            trace!(target: "cfs::fs", slot = idx, left = reserved - 1, "reservation_consumed");
            return Ok(());
        }

        if count == 0 {
            let start = compact::find_run(&self.volume, table, 1)?;
            table.bitmap.allocate(start, 1)?;
            let entry = table.entry_mut(idx)?;
            entry.first = start.0;
            entry.count = 1;
            st.table_dirty = true;
            debug!(target: "cfs::fs", slot = idx, first = start.0, "first_block");
            return Ok(());
        }

        if !table.bitmap.next_is_free(FsBlock(first), count) {
            let wanted = count.checked_add(1).ok_or(CfsError::OutOfSpace)?;
            let start = compact::find_run(&self.volume, table, wanted)?;
            // Compaction may have moved this file next to free space.
            let entry = table.entry(idx)?;
            if !table.bitmap.next_is_free(FsBlock(entry.first), entry.count) {
                compact::move_file(&self.volume, table, idx, start)?;
                debug!(target: "cfs::fs", slot = idx, from = first, to = start.0, "relocated_to_grow");
            }
        }

        let entry = table.entry(idx)?;
        let next = FsBlock(entry.first + entry.count);
        table.bitmap.allocate(next, 1)?;
        table.entry_mut(idx)?.count += 1;
        st.table_dirty = true;
        trace!(target: "cfs::fs", slot = idx, block = next.0, "extend");
        Ok(())
    }

    /// Reset file `idx` to empty after a failed write.
    fn roll_back(&self, st: &mut FsState, idx: usize, cause: &CfsError) {
        error!(target: "cfs::fs", slot = idx, error = %cause, "write_failed_rolling_back");
        if let Err(err) = st.table.release_blocks(idx) {
            error!(target: "cfs::fs", slot = idx, error = %err, "rollback_release_failed");
        }
        for open in st.handles_on(idx) {
            open.cursor = 0;
            open.owns_reservation = false;
        }
        st.table_dirty = true;
        st.schedule_persist(self.persist_delay_ms);
    }

    /// Read from the handle's cursor, up to the end of the file.
    pub fn read(&self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let file = st.open_file(handle)?;
        if !file.mode.can_read() {
            return Err(CfsError::AccessDenied);
        }
        let idx = file.entry.ok_or_else(unlinked)?;
        let cursor = file.cursor;
        let entry = st.table.entry(idx)?;

        let remaining = u64::from(entry.size).saturating_sub(cursor);
        let len = usize::try_from(remaining).unwrap_or(usize::MAX).min(buf.len());
        if len == 0 {
            return Ok(0);
        }
        let offset = self.volume.geometry.file_offset(FsBlock(entry.first), cursor)?;
        self.volume
            .cache
            .read(self.volume.device, offset, &mut buf[..len])?;
        st.open_file_mut(handle)?.cursor = cursor + len as u64;
        trace!(target: "cfs::fs", slot = idx, bytes = len, "read");
        Ok(len)
    }

    /// Move the cursor. Positions before 0 or past end-of-file are rejected.
    pub fn seek(&self, handle: FileHandle, pos: SeekFrom) -> Result<u64> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let idx = st.attached(handle)?;
        let size = i128::from(st.table.entry(idx)?.size);
        let cursor = i128::from(st.open_file(handle)?.cursor);

        let target = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => cursor + i128::from(delta),
            SeekFrom::End(delta) => size + i128::from(delta),
        };
        if target < 0 || target > size {
            return Err(CfsError::OutOfRange(format!(
                "seek to {target} outside 0..={size}"
            )));
        }
        let target = u64::try_from(target)
            .map_err(|_| CfsError::OutOfRange(format!("seek to {target}")))?;
        st.open_file_mut(handle)?.cursor = target;
        Ok(target)
    }

    /// Remove `name`, freeing its blocks. Open handles on it are detached.
    pub fn unlink(&self, name: &str) -> Result<()> {
        let mut st = self.state.lock();
        let idx = st
            .table
            .find(name)
            .ok_or_else(|| CfsError::NotFound(name.to_owned()))?;
        st.table.release_blocks(idx)?;
        st.table.entries[idx] = None;
        st.detach(idx);
        st.table_dirty = true;
        st.schedule_persist(self.persist_delay_ms);
        debug!(target: "cfs::fs", name, slot = idx, "unlink");
        Ok(())
    }

    /// Rename `from` to `to`, replacing any file already called `to`.
    ///
    /// Handles on `from` stay attached; handles on a replaced file are
    /// detached as by [`ContigFs::unlink`].
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        if encode_name(to).is_none() {
            return Err(CfsError::InvalidArgument(format!(
                "invalid file name {to:?} (1..=31 bytes, no NUL)"
            )));
        }
        let mut st = self.state.lock();
        let idx = st
            .table
            .find(from)
            .ok_or_else(|| CfsError::NotFound(from.to_owned()))?;
        if from == to {
            return Ok(());
        }
        if let Some(replaced) = st.table.find(to) {
            st.table.release_blocks(replaced)?;
            st.table.entries[replaced] = None;
            st.detach(replaced);
            debug!(target: "cfs::fs", name = to, slot = replaced, "rename_replaced");
        }
        st.table.entry_mut(idx)?.name = to.to_owned();
        st.table_dirty = true;
        st.schedule_persist(self.persist_delay_ms);
        debug!(target: "cfs::fs", from, to, slot = idx, "rename");
        Ok(())
    }

    pub fn stat(&self, name: &str) -> Result<FileStat> {
        let st = self.state.lock();
        let idx = st
            .table
            .find(name)
            .ok_or_else(|| CfsError::NotFound(name.to_owned()))?;
        let entry = st.table.entry(idx)?;
        Ok(FileStat {
            size: u64::from(entry.size),
            blocks: entry.count,
            block_size: self.volume.geometry.block_size.get(),
        })
    }

    /// In-use files in table slot order.
    #[must_use]
    pub fn list(&self) -> Vec<FileInfo> {
        let st = self.state.lock();
        st.table
            .entries
            .iter()
            .flatten()
            .map(|entry| FileInfo {
                name: entry.name.clone(),
                size: u64::from(entry.size),
                first_block: entry.first,
                block_count: entry.count,
                reserved_blocks: entry.reserved,
            })
            .collect()
    }

    #[must_use]
    pub fn usage(&self) -> FsUsage {
        let st = self.state.lock();
        FsUsage {
            total_blocks: self.volume.geometry.total_blocks,
            free_blocks: st.table.bitmap.count_free(),
            largest_free_run: st.table.bitmap.largest_free_run(),
            files: st.table.file_count(),
        }
    }

    /// Device byte offset and size of the file behind `handle`.
    ///
    /// The cache is flushed first so the device holds the file's bytes and
    /// they can be accessed in place.
    pub fn map(&self, handle: FileHandle) -> Result<(ByteOffset, u64)> {
        let st = self.state.lock();
        let idx = st.attached(handle)?;
        let entry = st.table.entry(idx)?;
        if entry.count == 0 {
            return Err(CfsError::InvalidArgument(format!(
                "{} has no blocks to map",
                entry.name
            )));
        }
        self.volume.cache.sync(false)?;
        let offset = self.volume.geometry.block_offset(FsBlock(entry.first))?;
        Ok((offset, u64::from(entry.size)))
    }

    /// Release `handle`. If it wrote, the cache is flushed.
    pub fn close(&self, handle: FileHandle) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        st.open_file(handle)?;
        let slot = &mut st.handles[usize::from(handle.slot)];
        let Some(open) = slot.open.take() else {
            return Err(stale(handle));
        };
        slot.generation = slot.generation.wrapping_add(1);

        if let (true, Some(idx)) = (open.owns_reservation, open.entry) {
            st.drop_reservation(idx)?;
        }
        if open.wrote {
            self.volume.cache.sync(false)?;
        }
        st.schedule_persist(self.persist_delay_ms);
        trace!(target: "cfs::fs", handle = handle.slot, wrote = open.wrote, "close");
        Ok(())
    }

    /// Persist the table now and flush the cache.
    pub fn sync(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.persist_now(&mut st)?;
        self.volume.cache.sync(false)
    }

    /// Close every handle, persist the table and flush the cache.
    pub fn shutdown(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let mut reservations = Vec::new();
        for slot in &mut st.handles {
            if let Some(open) = slot.open.take() {
                slot.generation = slot.generation.wrapping_add(1);
                if let (true, Some(idx)) = (open.owns_reservation, open.entry) {
                    reservations.push(idx);
                }
            }
        }
        for idx in reservations {
            st.drop_reservation(idx)?;
        }
        self.persist_now(st)?;
        self.volume.cache.sync(false)?;
        info!(target: "cfs::fs", "shutdown");
        Ok(())
    }

    fn persist_now(&self, st: &mut FsState) -> Result<()> {
        if st.table_dirty {
            self.volume.write_table(&st.table)?;
            st.table_dirty = false;
        }
        st.persist_in_ms = None;
        Ok(())
    }

    /// Advance the debounced persist by `elapsed_ms`. Returns whether the
    /// table was written.
    pub fn tick(&self, elapsed_ms: u64) -> Result<bool> {
        let mut st = self.state.lock();
        let Some(left) = st.persist_in_ms else {
            return Ok(false);
        };
        let left = left.saturating_sub(elapsed_ms);
        if left > 0 {
            st.persist_in_ms = Some(left);
            return Ok(false);
        }
        if let Err(err) = self.persist_now(&mut st) {
            // Retry on the next tick.
            st.persist_in_ms = Some(0);
            return Err(err);
        }
        Ok(true)
    }

    /// Gather all free blocks into one run. Returns whether files moved.
    pub fn defragment(&self) -> Result<bool> {
        let mut st = self.state.lock();
        compact::defragment(&self.volume, &mut st.table)
    }

    /// Verify the allocation invariants of the in-memory table.
    pub fn check_consistency(&self) -> Result<()> {
        self.state.lock().table.check(&self.volume.geometry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfs_block::{CacheConfig, MemoryFlash};

    const BS: u32 = 4096;

    fn mount(blocks: u64) -> (ContigFs, Arc<MemoryFlash>) {
        let cache = Arc::new(
            BlockCache::new(CacheConfig {
                buffers: 4,
                buffer_size: BS as usize,
                ..CacheConfig::default()
            })
            .expect("cache"),
        );
        let flash = Arc::new(MemoryFlash::new((blocks * u64::from(BS)) as usize, BS).expect("flash"));
        let device = cache.register(flash.clone()).expect("register");
        let config = FsConfig {
            block_size: BS,
            max_files: 8,
            max_open_files: 4,
            ..FsConfig::default()
        };
        (ContigFs::mount(cache, device, &config).expect("mount"), flash)
    }

    #[test]
    fn blank_device_mounts_empty() {
        let (fs, _flash) = mount(8);
        let usage = fs.usage();
        assert_eq!(usage.total_blocks, 8);
        assert_eq!(usage.free_blocks, 7);
        assert_eq!(usage.largest_free_run, 7);
        assert_eq!(usage.files, 0);
        fs.check_consistency().expect("consistent");
    }

    #[test]
    fn open_validates_names_and_existence() {
        let (fs, _flash) = mount(8);
        assert!(matches!(
            fs.open("", OpenMode::ReadWrite, true),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.open(&"n".repeat(32), OpenMode::ReadWrite, true),
            Err(CfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.open("missing", OpenMode::ReadOnly, false),
            Err(CfsError::NotFound(_))
        ));
        assert!(fs.list().is_empty());
    }

    #[test]
    fn handle_arena_is_bounded() {
        let (fs, _flash) = mount(8);
        let handles: Vec<_> = (0..4)
            .map(|i| fs.open(&format!("f{i}"), OpenMode::ReadWrite, true).expect("open"))
            .collect();
        assert!(matches!(
            fs.open("f9", OpenMode::ReadWrite, true),
            Err(CfsError::TooManyFiles)
        ));
        // The failed open did not create an entry.
        assert!(matches!(fs.stat("f9"), Err(CfsError::NotFound(_))));
        fs.close(handles[0]).expect("close");
        fs.open("f9", OpenMode::ReadWrite, true).expect("open after close");
    }

    #[test]
    fn stale_handle_is_rejected() {
        let (fs, _flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        fs.close(h).expect("close");
        let h2 = fs.open("b", OpenMode::ReadWrite, true).expect("open");
        assert!(matches!(fs.write(h, b"x"), Err(CfsError::InvalidArgument(_))));
        assert!(matches!(fs.close(h), Err(CfsError::InvalidArgument(_))));
        fs.write(h2, b"x").expect("fresh handle works");
    }

    #[test]
    fn mode_is_enforced() {
        let (fs, _flash) = mount(8);
        let w = fs.open("a", OpenMode::WriteOnly, true).expect("open");
        fs.write(w, b"data").expect("write");
        let mut buf = [0_u8; 4];
        assert!(matches!(fs.read(w, &mut buf), Err(CfsError::AccessDenied)));
        let r = fs.open("a", OpenMode::ReadOnly, false).expect("open");
        assert!(matches!(fs.write(r, b"x"), Err(CfsError::AccessDenied)));
        assert!(matches!(fs.reserve(r, 10), Err(CfsError::AccessDenied)));
        assert_eq!(fs.read(r, &mut buf).expect("read"), 4);
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn seek_bounds() {
        let (fs, _flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        fs.write(h, &[7_u8; 100]).expect("write");
        assert_eq!(fs.seek(h, SeekFrom::Start(10)).expect("seek"), 10);
        assert_eq!(fs.seek(h, SeekFrom::Current(5)).expect("seek"), 15);
        assert_eq!(fs.seek(h, SeekFrom::End(-1)).expect("seek"), 99);
        assert_eq!(fs.seek(h, SeekFrom::End(0)).expect("seek"), 100);
        assert!(matches!(fs.seek(h, SeekFrom::Start(101)), Err(CfsError::OutOfRange(_))));
        assert!(matches!(fs.seek(h, SeekFrom::Current(-200)), Err(CfsError::OutOfRange(_))));
        assert_eq!(fs.seek(h, SeekFrom::Current(0)).expect("cursor unchanged"), 100);
    }

    #[test]
    fn read_stops_at_end_of_file() {
        let (fs, _flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        fs.write(h, b"hello").expect("write");
        fs.seek(h, SeekFrom::Start(3)).expect("seek");
        let mut buf = [0_u8; 16];
        assert_eq!(fs.read(h, &mut buf).expect("read"), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(fs.read(h, &mut buf).expect("read at eof"), 0);
    }

    #[test]
    fn reserve_rejects_oversize_and_ignores_nonempty() {
        let (fs, _flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        assert!(matches!(
            fs.reserve(h, u64::from(BS) * 8),
            Err(CfsError::OutOfRange(_))
        ));
        fs.write(h, b"x").expect("write");
        fs.reserve(h, u64::from(BS) * 4).expect("no-op");
        let info = &fs.list()[0];
        assert_eq!((info.block_count, info.reserved_blocks), (1, 0));
    }

    #[test]
    fn close_releases_unused_reservation() {
        let (fs, _flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        fs.reserve(h, u64::from(BS) * 4).expect("reserve");
        assert_eq!(fs.usage().free_blocks, 3);
        fs.write(h, &vec![1_u8; BS as usize + 1]).expect("write");
        let info = &fs.list()[0];
        assert_eq!((info.first_block, info.block_count, info.reserved_blocks), (1, 2, 2));
        fs.close(h).expect("close");
        assert_eq!(fs.usage().free_blocks, 5);
        assert_eq!(fs.list()[0].reserved_blocks, 0);
        fs.check_consistency().expect("consistent");
    }

    #[test]
    fn unlink_detaches_open_handles() {
        let (fs, _flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        fs.write(h, b"abc").expect("write");
        fs.unlink("a").expect("unlink");
        assert!(matches!(fs.write(h, b"x"), Err(CfsError::NotFound(_))));
        assert!(matches!(fs.seek(h, SeekFrom::Start(0)), Err(CfsError::NotFound(_))));
        fs.close(h).expect("close detached handle");
        assert!(matches!(fs.unlink("a"), Err(CfsError::NotFound(_))));
        assert_eq!(fs.usage().free_blocks, 7);
    }

    #[test]
    fn rename_moves_the_entry_and_keeps_handles() {
        let (fs, _flash) = mount(8);
        let h = fs.open("draft", OpenMode::ReadWrite, true).expect("open");
        fs.write(h, b"body").expect("write");
        fs.rename("draft", "final").expect("rename");
        assert!(matches!(fs.stat("draft"), Err(CfsError::NotFound(_))));
        assert_eq!(fs.stat("final").expect("stat").size, 4);
        fs.write(h, b"!").expect("handle follows the entry");
        fs.close(h).expect("close");
        assert_eq!(fs.stat("final").expect("stat").size, 5);

        assert!(matches!(fs.rename("draft", "x"), Err(CfsError::NotFound(_))));
        assert!(matches!(
            fs.rename("final", ""),
            Err(CfsError::InvalidArgument(_))
        ));
        fs.rename("final", "final").expect("same name");
        fs.check_consistency().expect("consistent");
    }

    #[test]
    fn rename_replaces_an_existing_file() {
        let (fs, _flash) = mount(8);
        let old = fs.open("old", OpenMode::ReadWrite, true).expect("open old");
        fs.write(old, &vec![1_u8; 2 * BS as usize]).expect("write old");
        let new = fs.open("new", OpenMode::ReadWrite, true).expect("open new");
        fs.write(new, b"fresh").expect("write new");
        assert_eq!(fs.usage().free_blocks, 4);

        fs.rename("new", "old").expect("replace");
        assert!(matches!(fs.write(old, b"x"), Err(CfsError::NotFound(_))));
        assert_eq!(fs.usage().free_blocks, 6);
        assert_eq!(fs.usage().files, 1);
        assert_eq!(fs.stat("old").expect("stat").size, 5);
        fs.close(old).expect("close detached");
        fs.close(new).expect("close");
        fs.check_consistency().expect("consistent");
    }

    #[test]
    fn map_requires_blocks_and_flushes() {
        let (fs, flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        assert!(matches!(fs.map(h), Err(CfsError::InvalidArgument(_))));
        fs.write(h, b"in-place").expect("write");
        let (offset, size) = fs.map(h).expect("map");
        assert_eq!(size, 8);
        let start = offset.0 as usize;
        assert_eq!(&flash.snapshot()[start..start + 8], b"in-place");
    }

    #[test]
    fn debounced_persist_fires_after_delay() {
        let (fs, _flash) = mount(8);
        // The blank device was formatted in memory and scheduled.
        assert!(!fs.tick(9_999).expect("tick"));
        assert!(fs.tick(1).expect("tick"));
        assert!(!fs.tick(10_000).expect("idle tick"));

        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        fs.write(h, b"x").expect("write");
        fs.close(h).expect("close");
        assert!(!fs.tick(5_000).expect("tick"));
        assert!(fs.tick(5_000).expect("tick"));
    }

    #[test]
    fn format_clears_files_and_detaches() {
        let (fs, _flash) = mount(8);
        let h = fs.open("a", OpenMode::ReadWrite, true).expect("open");
        fs.write(h, &[1_u8; 5000]).expect("write");
        fs.format().expect("format");
        assert!(fs.list().is_empty());
        assert_eq!(fs.usage().free_blocks, 7);
        assert!(matches!(fs.write(h, b"x"), Err(CfsError::NotFound(_))));
        fs.check_consistency().expect("consistent");
    }

    #[test]
    fn probe_sees_table_only_after_persist() {
        let (fs, _flash) = mount(8);
        let config = FsConfig {
            block_size: BS,
            max_files: 8,
            max_open_files: 4,
            ..FsConfig::default()
        };
        assert!(!ContigFs::probe(fs.cache(), fs.device_id(), &config).expect("probe"));
        fs.sync().expect("sync");
        assert!(ContigFs::probe(fs.cache(), fs.device_id(), &config).expect("probe"));
    }
}
