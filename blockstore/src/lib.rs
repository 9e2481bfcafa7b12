//! Byte-addressable backing store abstraction.
//!
//! This is the "allocator hook" the core filesystem engine sits on: the
//! block allocator and the write-ahead log both address a flat byte pool
//! through this trait rather than a `Vec<u8>` directly, so the pool can be
//! swapped for a NUMA-aware or otherwise specialized implementation without
//! touching either caller. The only implementation shipped here is a plain
//! in-memory one; anything fancier is a caller's decision.

use anyhow::{bail, Result};

pub mod memory;

pub use memory::MemoryBackingStore;

/// A flat, fixed-size, byte-addressable pool.
///
/// Implementations are not required to be thread-safe on their own;
/// callers (the block allocator, the WAL) are responsible for
/// synchronizing access per the lock ordering they document.
pub trait BackingStore: Send {
    /// Total size of the pool in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` starting at `offset`.
    fn write(&mut self, offset: usize, buf: &[u8]) -> Result<()>;

    /// Durability boundary: the msync-equivalent. Implementations that are
    /// purely in-memory for the lifetime of the process may treat this as
    /// a no-op, but must still provide it so callers have one stable place
    /// to require "this is now durable" without caring which backing
    /// implementation is in use.
    fn flush(&mut self) -> Result<()>;

    /// Zero every byte in the pool.
    fn reset(&mut self) -> Result<()>;
}

/// Bounds-checks an `(offset, len)` pair against a pool of size `total`.
pub fn check_bounds(total: usize, offset: usize, len: usize) -> Result<()> {
    match offset.checked_add(len) {
        Some(end) if end <= total => Ok(()),
        _ => bail!("backing store access out of bounds: offset={offset} len={len} total={total}"),
    }
}
