#![forbid(unsafe_code)]
//! Error types for ContigFS.
//!
//! # Error Taxonomy
//!
//! ContigFS uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `cfs-types` | File Table byte-level format violations |
//! | Runtime | `CfsError` | `cfs-error` (this crate) | Errors returned by the cache, the filesystem and the CLI |
//!
//! `cfs-error` does not depend on `cfs-types`. The conversion from
//! `ParseError` to `CfsError::Corruption` lives in `cfs-core`, which knows
//! the block the bytes came from.
//!
//! ## errno Mapping
//!
//! Every `CfsError` variant maps to exactly one POSIX errno via
//! [`CfsError::to_errno`], so a path-dispatch layer can hand results back
//! to C-style callers unchanged.
//!
//! | Variant | errno | Constant |
//! |---------|-------|----------|
//! | `InvalidArgument` | `EINVAL` | 22 |
//! | `NotFound` | `ENOENT` | 2 |
//! | `TooManyFiles` | `ENFILE` | 23 |
//! | `OutOfSpace` | `ENOSPC` | 28 |
//! | `AccessDenied` | `EACCES` | 13 |
//! | `DeviceIo` | `EIO` | 5 |
//! | `Io` | raw OS error, else `EIO` | 5 |
//! | `OutOfRange` | `EFBIG` | 27 |
//! | `Corruption` | `EIO` | 5 |
//!
//! ## Policy
//!
//! - Device failures are never swallowed: the cache and the filesystem
//!   return them unchanged after restoring their own bookkeeping.
//! - All string payloads are owned so errors can cross thread boundaries
//!   (the flush daemon logs errors raised on its own thread).

use thiserror::Error;

/// Unified error type for all ContigFS operations.
#[derive(Debug, Error)]
pub enum CfsError {
    /// A caller-supplied argument or configuration value is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Named file does not exist (or an open handle's file was unlinked).
    #[error("not found: {0}")]
    NotFound(String),

    /// No free File Table slot or open-handle slot.
    #[error("too many files")]
    TooManyFiles,

    /// Not enough free blocks, even after compaction.
    #[error("no space left on device")]
    OutOfSpace,

    /// Read through a write-only handle or write through a read-only handle.
    #[error("access denied")]
    AccessDenied,

    /// The flash device reported a failure.
    #[error("device I/O error: {0}")]
    DeviceIo(String),

    /// Operating system I/O error from a file-backed device.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Seek past end-of-file, or a size beyond the filesystem's capacity.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The persisted File Table describes an impossible layout.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },
}

impl CfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The mapping is exhaustive; adding a variant without an errno is a
    /// compile error.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::NotFound(_) => libc::ENOENT,
            Self::TooManyFiles => libc::ENFILE,
            Self::OutOfSpace => libc::ENOSPC,
            Self::AccessDenied => libc::EACCES,
            Self::DeviceIo(_) | Self::Corruption { .. } => libc::EIO,
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::OutOfRange(_) => libc::EFBIG,
        }
    }

    /// Whether this error came from the storage device rather than from
    /// the caller or the filesystem state.
    #[must_use]
    pub fn is_device_error(&self) -> bool {
        matches!(self, Self::DeviceIo(_) | Self::Io(_))
    }
}

/// Result alias using `CfsError`.
pub type Result<T> = std::result::Result<T, CfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_covers_all_variants() {
        let cases: Vec<(CfsError, libc::c_int)> = vec![
            (CfsError::InvalidArgument("x".into()), libc::EINVAL),
            (CfsError::NotFound("a.bin".into()), libc::ENOENT),
            (CfsError::TooManyFiles, libc::ENFILE),
            (CfsError::OutOfSpace, libc::ENOSPC),
            (CfsError::AccessDenied, libc::EACCES),
            (CfsError::DeviceIo("erase".into()), libc::EIO),
            (CfsError::Io(std::io::Error::other("test")), libc::EIO),
            (CfsError::OutOfRange("seek".into()), libc::EFBIG),
            (
                CfsError::Corruption {
                    block: 0,
                    detail: "overlap".into(),
                },
                libc::EIO,
            ),
        ];

        for (error, expected_errno) in &cases {
            assert_eq!(
                error.to_errno(),
                *expected_errno,
                "wrong errno for {error:?}",
            );
        }
    }

    #[test]
    fn io_error_preserves_raw_os_error() {
        let raw = std::io::Error::from_raw_os_error(libc::EROFS);
        assert_eq!(CfsError::Io(raw).to_errno(), libc::EROFS);
    }

    #[test]
    fn device_errors_are_classified() {
        assert!(CfsError::DeviceIo("program".into()).is_device_error());
        assert!(CfsError::Io(std::io::Error::other("eio")).is_device_error());
        assert!(!CfsError::OutOfSpace.is_device_error());
        assert!(!CfsError::AccessDenied.is_device_error());
    }

    #[test]
    fn display_formatting() {
        let err = CfsError::Corruption {
            block: 0,
            detail: "entry 3 overlaps entry 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "corrupt metadata at block 0: entry 3 overlaps entry 1"
        );
        assert_eq!(CfsError::OutOfSpace.to_string(), "no space left on device");
        assert_eq!(
            CfsError::NotFound("fw.bin".into()).to_string(),
            "not found: fw.bin"
        );
    }
}
