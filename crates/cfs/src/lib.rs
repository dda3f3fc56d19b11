#![forbid(unsafe_code)]
//! ContigFS public API facade.
//!
//! Re-exports the filesystem engine, the block cache and the flash device
//! types from `cfs-core`. Hosts and the CLI depend on this crate rather
//! than on the individual layers.

pub use cfs_core::*;
