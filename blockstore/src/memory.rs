use crate::{check_bounds, BackingStore};
use anyhow::Result;
use log::debug;

/// A `Vec<u8>`-backed pool. `flush` is a no-op: the pool never leaves
/// process memory, so there is nothing to synchronize.
pub struct MemoryBackingStore {
    mem: Vec<u8>,
}

impl MemoryBackingStore {
    pub fn new(size: usize) -> Self {
        debug!("allocating memory backing store of {} bytes", size);
        Self {
            mem: vec![0u8; size],
        }
    }
}

impl BackingStore for MemoryBackingStore {
    fn len(&self) -> usize {
        self.mem.len()
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        check_bounds(self.mem.len(), offset, buf.len())?;
        buf.copy_from_slice(&self.mem[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&mut self, offset: usize, buf: &[u8]) -> Result<()> {
        check_bounds(self.mem.len(), offset, buf.len())?;
        self.mem[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.mem.iter_mut().for_each(|b| *b = 0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_after_write_round_trips() {
        let mut store = MemoryBackingStore::new(4096);
        store.write(10, b"hello").unwrap();
        let mut buf = [0u8; 5];
        store.read(10, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn out_of_bounds_access_fails() {
        let store = MemoryBackingStore::new(16);
        let mut buf = [0u8; 4];
        assert!(store.read(14, &mut buf).is_err());
    }

    #[test]
    fn reset_zeroes_pool() {
        let mut store = MemoryBackingStore::new(8);
        store.write(0, b"abcdefgh").unwrap();
        store.reset().unwrap();
        let mut buf = [0u8; 8];
        store.read(0, &mut buf).unwrap();
        assert_eq!(&buf, &[0u8; 8]);
    }
}
