//! Write-back erase-block cache.
//!
//! A fixed pool of erase-block-sized buffers shared by every registered
//! device. Each buffer is in one of three states:
//!
//! | State | Queue | Meaning |
//! |-------|-------|---------|
//! | `Invalid` | clean | no device block bound, free for reuse |
//! | `Clean` | clean | identical to the device contents |
//! | `Dirty` | dirty | modified, flushed by `tick`, `sync` or eviction |
//!
//! The clean queue is kept in reuse order: the front is taken when a
//! buffer is needed, read hits move a clean buffer to the back. The dirty
//! queue is kept in modification order, so forced eviction always writes
//! the oldest dirty buffer.
//!
//! Flushing a buffer erases its whole erase block and programs the buffer
//! back. A failed flush leaves the buffer dirty; a failed load returns the
//! slot to the front of the clean queue as `Invalid`.

use crate::FlashDevice;
use cfs_error::{CfsError, Result};
use cfs_types::{BlockNumber, ByteOffset, DeviceId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, trace};

// ── Configuration ──────────────────────────────────────────────────────────

/// Cache tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of buffers in the pool.
    pub buffers: usize,
    /// Buffer size in bytes; must be at least the device erase block size.
    pub buffer_size: usize,
    /// How long a dirty buffer is held before `tick` writes it back.
    pub hold_ms: u64,
    /// Period at which the flush daemon calls `tick`.
    pub flush_period_ms: u64,
    /// Upper bound on write-backs performed by one `tick`.
    pub max_flushes_per_tick: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffers: 4,
            buffer_size: 4096,
            hold_ms: 10_000,
            flush_period_ms: 2_000,
            max_flushes_per_tick: 3,
        }
    }
}

impl CacheConfig {
    pub fn validate(&self) -> Result<()> {
        if self.buffers == 0 {
            return Err(CfsError::InvalidArgument(
                "cache needs at least one buffer".to_owned(),
            ));
        }
        if self.buffer_size == 0 || !self.buffer_size.is_power_of_two() {
            return Err(CfsError::InvalidArgument(format!(
                "cache buffer_size={} must be a non-zero power of two",
                self.buffer_size
            )));
        }
        if self.flush_period_ms == 0 {
            return Err(CfsError::InvalidArgument(
                "flush_period_ms must be non-zero".to_owned(),
            ));
        }
        if self.max_flushes_per_tick == 0 {
            return Err(CfsError::InvalidArgument(
                "max_flushes_per_tick must be non-zero".to_owned(),
            ));
        }
        Ok(())
    }
}

// ── Entries ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryState {
    Invalid,
    Clean,
    Dirty,
}

struct CacheEntry {
    device: Option<DeviceId>,
    block: BlockNumber,
    state: EntryState,
    /// Remaining hold time for a dirty buffer.
    countdown_ms: u64,
    buf: Box<[u8]>,
}

impl CacheEntry {
    fn new(buffer_size: usize) -> Self {
        Self {
            device: None,
            block: BlockNumber(0),
            state: EntryState::Invalid,
            countdown_ms: 0,
            buf: vec![0_u8; buffer_size].into_boxed_slice(),
        }
    }

    fn holds(&self, device: DeviceId, block: BlockNumber) -> bool {
        self.state != EntryState::Invalid && self.device == Some(device) && self.block == block
    }

    fn invalidate(&mut self) {
        self.device = None;
        self.state = EntryState::Invalid;
        self.countdown_ms = 0;
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Successful write-backs of dirty buffers (any cause).
    pub flushes: u64,
    /// Write-backs forced because no clean buffer was available.
    pub forced_flushes: u64,
    pub dirty: usize,
    pub resident: usize,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.hits as f64 / total as f64;
        rate
    }
}

// ── Pool ───────────────────────────────────────────────────────────────────

struct Pool {
    entries: Vec<CacheEntry>,
    clean: VecDeque<usize>,
    dirty: VecDeque<usize>,
    devices: Vec<Arc<dyn FlashDevice>>,
    hold_ms: u64,
    hits: u64,
    misses: u64,
    flushes: u64,
    forced_flushes: u64,
}

fn remove_from(queue: &mut VecDeque<usize>, idx: usize) {
    if let Some(pos) = queue.iter().position(|&slot| slot == idx) {
        queue.remove(pos);
    }
}

impl Pool {
    fn device(&self, id: DeviceId) -> Result<Arc<dyn FlashDevice>> {
        usize::try_from(id.0)
            .ok()
            .and_then(|index| self.devices.get(index))
            .cloned()
            .ok_or_else(|| CfsError::InvalidArgument(format!("unknown device {id}")))
    }

    fn lookup(&self, device: DeviceId, block: BlockNumber) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.holds(device, block))
    }

    /// Erase and program one dirty buffer back to its device.
    fn flush_entry(&mut self, idx: usize, invalidate: bool) -> Result<()> {
        let entry = &self.entries[idx];
        let Some(device_id) = entry.device else {
            return Err(CfsError::InvalidArgument(format!(
                "dirty buffer {idx} has no device"
            )));
        };
        let block = entry.block;
        let device = self.device(device_id)?;
        let erase_size = u64::from(device.erase_block_size());
        let offset = block
            .0
            .checked_mul(erase_size)
            .map(ByteOffset)
            .ok_or_else(|| CfsError::OutOfRange(format!("block {block} overflows")))?;
        let len = entry.buf.len().min(device.erase_block_size() as usize);

        let programmed = device
            .erase(offset, erase_size)
            .and_then(|()| device.write(offset, &entry.buf[..len]))
            .inspect_err(|err| {
                error!(
                    target: "cfs::cache",
                    device = device_id.0,
                    block = block.0,
                    error = %err,
                    "flush_failed"
                );
            })?;
        if programmed != len {
            return Err(CfsError::DeviceIo(format!(
                "short program on device {device_id} block {block}: {programmed}/{len} bytes"
            )));
        }

        remove_from(&mut self.dirty, idx);
        let entry = &mut self.entries[idx];
        if invalidate {
            entry.invalidate();
        } else {
            entry.state = EntryState::Clean;
            entry.countdown_ms = 0;
        }
        self.clean.push_back(idx);
        self.flushes += 1;
        trace!(
            target: "cfs::cache",
            device = device_id.0,
            block = block.0,
            invalidate,
            "flush"
        );
        Ok(())
    }

    /// Take a buffer from the front of the clean queue, evicting the oldest
    /// dirty buffer first when the clean queue is empty.
    ///
    /// The returned slot is in no queue; the caller must re-queue it.
    fn take_slot(&mut self) -> Result<usize> {
        if self.clean.is_empty() {
            let oldest = *self.dirty.front().ok_or_else(|| {
                CfsError::InvalidArgument("cache pool has no buffers".to_owned())
            })?;
            debug!(
                target: "cfs::cache",
                slot = oldest,
                block = self.entries[oldest].block.0,
                "forced_flush"
            );
            self.flush_entry(oldest, false)?;
            self.forced_flushes += 1;
        }
        let idx = self
            .clean
            .pop_front()
            .ok_or_else(|| CfsError::InvalidArgument("cache pool has no buffers".to_owned()))?;
        self.entries[idx].invalidate();
        Ok(idx)
    }

    /// Return the slot holding `block`, binding (and optionally loading) a
    /// buffer on a miss.
    fn acquire(&mut self, device_id: DeviceId, block: BlockNumber, load: bool) -> Result<usize> {
        if let Some(idx) = self.lookup(device_id, block) {
            self.hits += 1;
            if self.entries[idx].state == EntryState::Clean {
                remove_from(&mut self.clean, idx);
                self.clean.push_back(idx);
            }
            return Ok(idx);
        }

        self.misses += 1;
        let device = self.device(device_id)?;
        let idx = self.take_slot()?;
        let erase_size = device.erase_block_size() as usize;
        if load {
            let offset = ByteOffset(block.0 * u64::from(device.erase_block_size()));
            let entry = &mut self.entries[idx];
            if let Err(err) = device.read(offset, &mut entry.buf[..erase_size]) {
                error!(
                    target: "cfs::cache",
                    device = device_id.0,
                    block = block.0,
                    error = %err,
                    "load_failed"
                );
                self.clean.push_front(idx);
                return Err(err);
            }
        }
        let entry = &mut self.entries[idx];
        entry.device = Some(device_id);
        entry.block = block;
        entry.state = EntryState::Clean;
        self.clean.push_back(idx);
        trace!(
            target: "cfs::cache",
            device = device_id.0,
            block = block.0,
            slot = idx,
            load,
            "bind"
        );
        Ok(idx)
    }

    fn mark_dirty(&mut self, idx: usize) {
        let was_dirty = self.entries[idx].state == EntryState::Dirty;
        if was_dirty {
            remove_from(&mut self.dirty, idx);
        } else {
            remove_from(&mut self.clean, idx);
        }
        let entry = &mut self.entries[idx];
        entry.state = EntryState::Dirty;
        entry.countdown_ms = self.hold_ms;
        self.dirty.push_back(idx);
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            flushes: self.flushes,
            forced_flushes: self.forced_flushes,
            dirty: self.dirty.len(),
            resident: self
                .entries
                .iter()
                .filter(|entry| entry.state != EntryState::Invalid)
                .count(),
        }
    }
}

// ── Public cache ───────────────────────────────────────────────────────────

/// Write-back cache of erase blocks shared by several flash devices.
///
/// All operations serialize on one internal lock. Device I/O happens under
/// that lock, so a slow flush delays concurrent readers rather than letting
/// them observe a half-written block.
pub struct BlockCache {
    config: CacheConfig,
    pool: Mutex<Pool>,
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let entries = (0..config.buffers)
            .map(|_| CacheEntry::new(config.buffer_size))
            .collect();
        let pool = Pool {
            entries,
            clean: (0..config.buffers).collect(),
            dirty: VecDeque::with_capacity(config.buffers),
            devices: Vec::new(),
            hold_ms: config.hold_ms,
            hits: 0,
            misses: 0,
            flushes: 0,
            forced_flushes: 0,
        };
        Ok(Self {
            config,
            pool: Mutex::new(pool),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Attach a device. Its erase block must fit in one cache buffer.
    pub fn register(&self, device: Arc<dyn FlashDevice>) -> Result<DeviceId> {
        let erase_size = device.erase_block_size() as usize;
        if erase_size > self.config.buffer_size {
            return Err(CfsError::InvalidArgument(format!(
                "erase block size {erase_size} exceeds cache buffer size {}",
                self.config.buffer_size
            )));
        }
        let mut pool = self.pool.lock();
        let id = u32::try_from(pool.devices.len())
            .map(DeviceId)
            .map_err(|_| CfsError::InvalidArgument("too many devices".to_owned()))?;
        pool.devices.push(device);
        debug!(target: "cfs::cache", device = id.0, erase_size, "register");
        Ok(id)
    }

    /// The device registered under `id`.
    pub fn device(&self, id: DeviceId) -> Result<Arc<dyn FlashDevice>> {
        self.pool.lock().device(id)
    }

    /// Read `buf.len()` bytes at `offset` through the cache.
    pub fn read(&self, device_id: DeviceId, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        let mut pool = self.pool.lock();
        let device = pool.device(device_id)?;
        check_span(device.as_ref(), offset, buf.len())?;
        let erase_size = u64::from(device.erase_block_size());

        let mut done = 0_usize;
        while done < buf.len() {
            let at = offset.0 + done as u64;
            let block = BlockNumber(at / erase_size);
            let within = (at % erase_size) as usize;
            let chunk = (erase_size as usize - within).min(buf.len() - done);
            let idx = pool.acquire(device_id, block, true)?;
            buf[done..done + chunk].copy_from_slice(&pool.entries[idx].buf[within..within + chunk]);
            done += chunk;
        }
        Ok(done)
    }

    /// Write `data` at `offset` through the cache.
    ///
    /// Data lands in dirty buffers; nothing reaches the device until the
    /// buffer is flushed. A chunk covering a whole erase block skips the
    /// load from the device.
    pub fn write(&self, device_id: DeviceId, offset: ByteOffset, data: &[u8]) -> Result<usize> {
        let mut pool = self.pool.lock();
        let device = pool.device(device_id)?;
        check_span(device.as_ref(), offset, data.len())?;
        let erase_size = u64::from(device.erase_block_size());

        let mut done = 0_usize;
        while done < data.len() {
            let at = offset.0 + done as u64;
            let block = BlockNumber(at / erase_size);
            let within = (at % erase_size) as usize;
            let chunk = (erase_size as usize - within).min(data.len() - done);
            let whole_block = within == 0 && chunk as u64 == erase_size;
            let idx = pool.acquire(device_id, block, !whole_block)?;
            pool.entries[idx].buf[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
            pool.mark_dirty(idx);
            done += chunk;
        }
        Ok(done)
    }

    /// Write back every dirty buffer, then flush every device.
    ///
    /// With `invalidate`, every buffer (clean ones included) is unbound
    /// afterwards so the next access reloads from the device.
    pub fn sync(&self, invalidate: bool) -> Result<()> {
        let mut pool = self.pool.lock();
        let pending: Vec<usize> = pool.dirty.iter().copied().collect();
        for idx in pending {
            pool.flush_entry(idx, invalidate)?;
        }
        if invalidate {
            for entry in &mut pool.entries {
                entry.invalidate();
            }
        }
        let devices = pool.devices.clone();
        drop(pool);
        for device in devices {
            device.flush()?;
        }
        debug!(target: "cfs::cache", invalidate, "sync");
        Ok(())
    }

    /// Age dirty buffers by `elapsed_ms` and write back up to `max_flushes`
    /// whose hold time has expired, oldest first. Returns the count written.
    ///
    /// Every dirty buffer is aged before any is written, so a failed flush
    /// returns its error without holding back the others' countdowns.
    pub fn tick(&self, elapsed_ms: u64, max_flushes: usize) -> Result<usize> {
        let mut pool = self.pool.lock();
        let order: Vec<usize> = pool.dirty.iter().copied().collect();
        for &idx in &order {
            let entry = &mut pool.entries[idx];
            entry.countdown_ms = entry.countdown_ms.saturating_sub(elapsed_ms);
        }
        let mut flushed = 0_usize;
        for idx in order {
            if flushed >= max_flushes {
                break;
            }
            if pool.entries[idx].countdown_ms > 0 {
                continue;
            }
            pool.flush_entry(idx, false)?;
            flushed += 1;
        }
        if flushed > 0 {
            trace!(target: "cfs::cache", flushed, elapsed_ms, "tick");
        }
        Ok(flushed)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.pool.lock().stats()
    }

    /// State of the buffer holding `block`, if one is bound.
    #[must_use]
    pub fn entry_state(&self, device_id: DeviceId, block: BlockNumber) -> Option<EntryState> {
        let pool = self.pool.lock();
        pool.lookup(device_id, block)
            .map(|idx| pool.entries[idx].state)
    }
}

fn check_span(device: &dyn FlashDevice, offset: ByteOffset, len: usize) -> Result<()> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end.0 <= device.capacity() => Ok(()),
        _ => Err(CfsError::OutOfRange(format!(
            "cache access out of bounds: offset={offset} len={len} capacity={}",
            device.capacity()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryFlash;

    const EB: u32 = 512;

    fn setup(buffers: usize) -> (BlockCache, Arc<MemoryFlash>, DeviceId) {
        let cache = BlockCache::new(CacheConfig {
            buffers,
            buffer_size: EB as usize,
            hold_ms: 100,
            ..CacheConfig::default()
        })
        .expect("cache");
        let flash = Arc::new(MemoryFlash::new(EB as usize * 16, EB).expect("flash"));
        let id = cache.register(flash.clone()).expect("register");
        (cache, flash, id)
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = CacheConfig::default();
        assert_eq!(config.buffers, 4);
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.hold_ms, 10_000);
        assert_eq!(config.flush_period_ms, 2_000);
        assert_eq!(config.max_flushes_per_tick, 3);
        config.validate().expect("default config is valid");
    }

    #[test]
    fn invalid_config_is_rejected() {
        for bad in [
            CacheConfig { buffers: 0, ..CacheConfig::default() },
            CacheConfig { buffer_size: 1000, ..CacheConfig::default() },
            CacheConfig { flush_period_ms: 0, ..CacheConfig::default() },
            CacheConfig { max_flushes_per_tick: 0, ..CacheConfig::default() },
        ] {
            assert!(BlockCache::new(bad).is_err());
        }
    }

    #[test]
    fn register_rejects_oversized_erase_block() {
        let cache = BlockCache::new(CacheConfig {
            buffer_size: 512,
            ..CacheConfig::default()
        })
        .expect("cache");
        let flash = Arc::new(MemoryFlash::new(4096, 1024).expect("flash"));
        assert!(matches!(
            cache.register(flash),
            Err(CfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn writes_stay_in_cache_until_sync() {
        let (cache, flash, id) = setup(4);
        cache.write(id, ByteOffset(10), b"hello").expect("write");
        assert_eq!(&flash.snapshot()[10..15], &[0xFF; 5]);
        assert_eq!(cache.entry_state(id, BlockNumber(0)), Some(EntryState::Dirty));

        let mut out = [0_u8; 5];
        cache.read(id, ByteOffset(10), &mut out).expect("read");
        assert_eq!(&out, b"hello");

        cache.sync(false).expect("sync");
        assert_eq!(&flash.snapshot()[10..15], b"hello");
        assert_eq!(cache.entry_state(id, BlockNumber(0)), Some(EntryState::Clean));
    }

    #[test]
    fn sync_invalidate_unbinds_all_buffers() {
        let (cache, _flash, id) = setup(4);
        let mut buf = [0_u8; 4];
        cache.read(id, ByteOffset(0), &mut buf).expect("read");
        cache.write(id, ByteOffset(EB as u64), b"abcd").expect("write");
        cache.sync(true).expect("sync");
        assert_eq!(cache.entry_state(id, BlockNumber(0)), None);
        assert_eq!(cache.entry_state(id, BlockNumber(1)), None);
        assert_eq!(cache.stats().resident, 0);
    }

    #[test]
    fn write_spanning_blocks_is_split() {
        let (cache, flash, id) = setup(4);
        let data: Vec<u8> = (0..EB as usize + 100).map(|i| (i % 251) as u8).collect();
        let written = cache.write(id, ByteOffset(EB as u64 - 50), &data).expect("write");
        assert_eq!(written, data.len());
        cache.sync(false).expect("sync");
        let start = EB as usize - 50;
        assert_eq!(&flash.snapshot()[start..start + data.len()], &data[..]);
    }

    #[test]
    fn whole_block_write_skips_device_load() {
        let (cache, flash, id) = setup(2);
        let block = vec![0xAB_u8; EB as usize];
        cache.write(id, ByteOffset(EB as u64 * 3), &block).expect("write");
        assert_eq!(flash.counters().reads, 0);
        cache.write(id, ByteOffset(1), b"x").expect("partial write");
        assert_eq!(flash.counters().reads, 1);
    }

    #[test]
    fn full_pool_forces_oldest_dirty_flush() {
        let (cache, flash, id) = setup(2);
        cache.write(id, ByteOffset(0), b"first").expect("w0");
        cache.write(id, ByteOffset(EB as u64), b"second").expect("w1");
        assert_eq!(cache.stats().forced_flushes, 0);

        cache.write(id, ByteOffset(EB as u64 * 2), b"third").expect("w2");
        let stats = cache.stats();
        assert_eq!(stats.forced_flushes, 1);
        assert_eq!(&flash.snapshot()[..5], b"first");
        assert_eq!(&flash.snapshot()[EB as usize..EB as usize + 6], &[0xFF; 6]);
        assert_eq!(cache.entry_state(id, BlockNumber(0)), None);
    }

    #[test]
    fn tick_flushes_only_expired_buffers_up_to_limit() {
        let (cache, flash, id) = setup(4);
        for block in 0..3_u64 {
            cache.write(id, ByteOffset(block * EB as u64), &[block as u8]).expect("write");
        }
        assert_eq!(cache.tick(50, 3).expect("tick"), 0);
        assert_eq!(flash.counters().programs, 0);

        assert_eq!(cache.tick(50, 2).expect("tick"), 2);
        assert_eq!(cache.stats().dirty, 1);
        assert_eq!(cache.tick(0, 2).expect("tick"), 1);
        assert_eq!(cache.stats().dirty, 0);
        assert_eq!(flash.snapshot()[EB as usize * 2], 2);
    }

    #[test]
    fn rewrite_restarts_hold_time() {
        let (cache, _flash, id) = setup(4);
        cache.write(id, ByteOffset(0), b"a").expect("write");
        assert_eq!(cache.tick(60, 3).expect("tick"), 0);
        cache.write(id, ByteOffset(1), b"b").expect("rewrite");
        assert_eq!(cache.tick(60, 3).expect("tick"), 0);
        assert_eq!(cache.tick(40, 3).expect("tick"), 1);
    }

    #[test]
    fn read_hits_and_misses_are_counted() {
        let (cache, _flash, id) = setup(4);
        let mut buf = [0_u8; 8];
        cache.read(id, ByteOffset(0), &mut buf).expect("miss");
        cache.read(id, ByteOffset(8), &mut buf).expect("hit");
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let (cache, _flash, id) = setup(2);
        let mut buf = [0_u8; 4];
        assert!(matches!(
            cache.read(id, ByteOffset(EB as u64 * 16 - 2), &mut buf),
            Err(CfsError::OutOfRange(_))
        ));
        assert!(matches!(
            cache.write(DeviceId(9), ByteOffset(0), b"x"),
            Err(CfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn devices_share_the_pool_without_aliasing() {
        let (cache, flash_a, a) = setup(2);
        let flash_b = Arc::new(MemoryFlash::new(EB as usize * 4, EB).expect("flash"));
        let b = cache.register(flash_b.clone()).expect("register");
        cache.write(a, ByteOffset(0), b"AAAA").expect("write a");
        cache.write(b, ByteOffset(0), b"BBBB").expect("write b");

        let mut out = [0_u8; 4];
        cache.read(a, ByteOffset(0), &mut out).expect("read a");
        assert_eq!(&out, b"AAAA");
        cache.read(b, ByteOffset(0), &mut out).expect("read b");
        assert_eq!(&out, b"BBBB");

        cache.sync(false).expect("sync");
        assert_eq!(&flash_a.snapshot()[..4], b"AAAA");
        assert_eq!(&flash_b.snapshot()[..4], b"BBBB");
    }
}
