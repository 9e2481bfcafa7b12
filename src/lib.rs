//! An in-memory-backed POSIX-style filesystem engine: a cache-aligned
//! directory tree, an inode table with hardlink accounting, an
//! extent-mapped block allocator, and a write-ahead log with crash
//! recovery.

pub mod alloc;
pub mod error;
pub mod extent;
pub mod fs;
pub mod inode;
pub mod recovery;
pub mod strtab;
pub mod tree;
pub mod wal;

pub use error::{FsError, FsResult};
pub use fs::{Config, FileSystem, FsStats};
