//! The error taxonomy every core operation returns through.
//!
//! Everything in this module maps onto the abstract error kinds of the
//! spec this engine implements: `NotFound`, `AlreadyExists`, `Invalid`,
//! `NoMemory`, `NoSpace`, `TooManyLinks`, `NotEmpty`, `Corrupt`, `LogFull`,
//! `Busy`. The `BackingStore` trait (below the block allocator and the
//! WAL) is I/O-shaped and returns `anyhow::Result`; the one place that
//! boundary crosses into `FsError` is `From<anyhow::Error>`.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    AlreadyExists,
    Invalid,
    NoMemory,
    NoSpace,
    TooManyLinks,
    NotEmpty,
    Corrupt,
    LogFull,
    Busy,
}

pub type FsResult<T> = Result<T, FsError>;

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsError::NotFound => "no such file or directory",
            FsError::AlreadyExists => "file exists",
            FsError::Invalid => "invalid argument",
            FsError::NoMemory => "out of memory",
            FsError::NoSpace => "no space left on device",
            FsError::TooManyLinks => "too many links",
            FsError::NotEmpty => "directory not empty",
            FsError::Corrupt => "structure needs cleaning",
            FsError::LogFull => "write-ahead log is full",
            FsError::Busy => "resource busy",
        };
        f.write_str(s)
    }
}

impl std::error::Error for FsError {}

impl From<anyhow::Error> for FsError {
    fn from(_: anyhow::Error) -> Self {
        FsError::NoMemory
    }
}

impl FsError {
    /// Maps onto POSIX errno constants for an eventual mount-shim
    /// collaborator; this crate does not call into `errno` itself.
    pub fn as_errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::Invalid => libc::EINVAL,
            FsError::NoMemory => libc::ENOMEM,
            FsError::NoSpace => libc::ENOSPC,
            FsError::TooManyLinks => libc::EMLINK,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Corrupt => libc::EIO,
            FsError::LogFull => libc::ENOSPC,
            FsError::Busy => libc::EBUSY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping_is_stable() {
        assert_eq!(FsError::NotFound.as_errno(), libc::ENOENT);
        assert_eq!(FsError::NotEmpty.as_errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::Corrupt.as_errno(), libc::EIO);
    }

    #[test]
    fn anyhow_errors_become_no_memory() {
        let e: FsError = anyhow::anyhow!("boom").into();
        assert_eq!(e, FsError::NoMemory);
    }
}
