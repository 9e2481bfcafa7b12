//! Grow-only interned name table.
//!
//! Names are stored once as null-terminated byte runs and never moved or
//! rewritten in place; callers address them by a stable `u32` offset into
//! the backing buffer for the lifetime of the table. Interning the same
//! bytes twice returns the same offset (linear scan dedup), so callers
//! may fast-path name comparison to `offset_a == offset_b`. Growth
//! doubles the buffer, capped at 16 MiB.

use crate::error::{FsError, FsResult};

const MAX_NAME_LEN: usize = 255;
const INITIAL_CAPACITY: usize = 4096;
const MAX_CAPACITY: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct StringTableStats {
    pub bytes_used: usize,
    pub capacity: usize,
    pub entry_count: usize,
}

/// Offset of an interned name within the table's buffer.
pub type StrRef = u32;

pub struct StringTable {
    buf: Vec<u8>,
    offsets: Vec<u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(INITIAL_CAPACITY),
            offsets: Vec::new(),
        }
    }

    fn find(&self, name: &[u8]) -> Option<StrRef> {
        self.offsets.iter().copied().find(|&off| self.get(off) == name)
    }

    /// Interns `name`, returning a stable reference. Idempotent: a prior
    /// offset is returned on a repeat of the same bytes, even across
    /// resizes, so the table never stores the same name twice.
    pub fn intern(&mut self, name: &[u8]) -> FsResult<StrRef> {
        if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(&0) {
            return Err(FsError::Invalid);
        }
        if let Some(existing) = self.find(name) {
            return Ok(existing);
        }
        let needed = self.buf.len() + name.len() + 1;
        if needed > MAX_CAPACITY {
            return Err(FsError::NoSpace);
        }
        if needed > self.buf.capacity() {
            let mut new_cap = self.buf.capacity().max(INITIAL_CAPACITY);
            while new_cap < needed {
                new_cap = (new_cap * 2).min(MAX_CAPACITY);
            }
            self.buf.reserve(new_cap - self.buf.len());
        }
        let offset = self.buf.len() as u32;
        self.buf.extend_from_slice(name);
        self.buf.push(0);
        self.offsets.push(offset);
        Ok(offset)
    }

    /// Looks up the bytes stored at `r`. Panics only on a reference never
    /// produced by this table, which indicates caller misuse.
    pub fn get(&self, r: StrRef) -> &[u8] {
        let offset = r as usize;
        let len = self.buf[offset..]
            .iter()
            .position(|&b| b == 0)
            .expect("interned name is always null-terminated");
        &self.buf[offset..offset + len]
    }

    pub fn stats(&self) -> StringTableStats {
        StringTableStats {
            bytes_used: self.buf.len(),
            capacity: self.buf.capacity(),
            entry_count: self.offsets.len(),
        }
    }
}

impl Default for StringTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_then_get_round_trips() {
        let mut tab = StringTable::new();
        let r = tab.intern(b"readme.txt").unwrap();
        assert_eq!(tab.get(r), b"readme.txt");
    }

    #[test]
    fn interning_the_same_name_twice_returns_the_same_offset() {
        let mut tab = StringTable::new();
        let a = tab.intern(b"readme.txt").unwrap();
        let b = tab.intern(b"readme.txt").unwrap();
        assert_eq!(a, b);
        assert_eq!(tab.stats().entry_count, 1);
    }

    #[test]
    fn dedup_survives_a_growth_resize() {
        let mut tab = StringTable::new();
        let first = tab.intern(b"a").unwrap();
        for i in 0..10_000 {
            tab.intern(format!("filler-{i}").as_bytes()).unwrap();
        }
        let again = tab.intern(b"a").unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn empty_name_is_rejected() {
        let mut tab = StringTable::new();
        assert_eq!(tab.intern(b""), Err(FsError::Invalid));
    }

    #[test]
    fn oversized_name_is_rejected() {
        let mut tab = StringTable::new();
        let name = vec![b'a'; MAX_NAME_LEN + 1];
        assert_eq!(tab.intern(&name), Err(FsError::Invalid));
    }

    #[test]
    fn many_distinct_names_grow_the_table() {
        let mut tab = StringTable::new();
        for i in 0..10_000 {
            let name = format!("file-{i}");
            tab.intern(name.as_bytes()).unwrap();
        }
        assert_eq!(tab.stats().entry_count, 10_000);
    }
}
