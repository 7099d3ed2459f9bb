//! FTL error types.
//!
//! Mirrors `storage::StorageError`'s plain-enum style rather than reaching
//! for `thiserror`: this crate is `no_std` outside of `cfg(test)`, and
//! nothing else `no_std` in this workspace pulls in `thiserror`.

use core::fmt;

/// Errors returned by the FTL's host-facing operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtlError {
    /// Out-of-range LPN, or a write that overflows a page.
    InvalidArgument,
    /// Scratch buffer or mapping-table allocation failed.
    OutOfMemory,
    /// The allocator had no free page left even after a GC attempt.
    DeviceExhausted,
    /// The underlying device's read/write/erase call failed.
    DeviceIoError,
    /// Requested ioctl is not recognized.
    InvalidIoctl,
}

impl fmt::Display for FtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            FtlError::InvalidArgument => "invalid argument",
            FtlError::OutOfMemory => "out of memory",
            FtlError::DeviceExhausted => "device exhausted (no free page after gc)",
            FtlError::DeviceIoError => "device i/o error",
            FtlError::InvalidIoctl => "unrecognized ioctl",
        };
        f.write_str(msg)
    }
}

/// Negative-errno surface for hosts that want a POSIX-style `ssize_t`
/// return convention (`-EINVAL`, `-ENOMEM`, `-EFAULT`, `-EIO`).
impl From<FtlError> for i64 {
    fn from(err: FtlError) -> i64 {
        let errno = match err {
            FtlError::InvalidArgument => 22,  // EINVAL
            FtlError::OutOfMemory => 12,      // ENOMEM
            FtlError::DeviceExhausted => 14,  // EFAULT
            FtlError::DeviceIoError => 5,     // EIO
            FtlError::InvalidIoctl => 25,     // ENOTTY
        };
        -(errno as i64)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, FtlError>;
