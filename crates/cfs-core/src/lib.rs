#![forbid(unsafe_code)]
//! ContigFS engine: a flat filesystem whose files are single runs of
//! consecutive blocks, on top of the write-back [`BlockCache`].
//!
//! ## Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | `config` | [`FsConfig`] and the validated [`FsGeometry`] |
//! | `table` | in-memory File Table (bitmap, entries, pending reservations) |
//! | `compact` | best-fit run selection and online compaction |
//! | `fs` | [`ContigFs`] file operations |
//! | `daemon` | [`FlushDaemon`] background flusher |
//!
//! ## Locking
//!
//! `ContigFs` and `BlockCache` each own one mutex. Filesystem operations
//! take the filesystem lock first and call into the cache while holding
//! it; the cache never calls back into the filesystem.

mod compact;
mod config;
mod daemon;
mod fs;
mod table;
mod volume;

pub use cfs_block::{
    BlockCache, CacheConfig, CacheStats, EntryState, FileFlash, FlashCounters, FlashDevice,
    MemoryFlash,
};
pub use cfs_error::{CfsError, Result};
pub use cfs_types::{ByteOffset, DeviceId, FsBlock};
pub use config::{FsConfig, FsGeometry};
pub use daemon::{FlushDaemon, FlushDaemonConfig};
pub use fs::{ContigFs, FileHandle, FileInfo, FileStat, FsUsage, OpenMode};
pub use std::io::SeekFrom;
