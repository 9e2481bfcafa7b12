//! Fixed-size inode records plus an O(1)-lookup inode table.

use crate::error::{FsError, FsResult};
use zerocopy::{AsBytes, FromBytes};

pub const INODE_SIZE: usize = 64;
const INLINE_DATA_LEN: usize = 32;
const HASH_MULTIPLIER: u32 = 2_654_435_761;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
pub struct Inode {
    pub size: u64,
    pub inode_num: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    pub xattr_head: u32,
    pub nlink: u16,
    pub mode: u16,
    pub data: [u8; INLINE_DATA_LEN],
}

const _: () = assert!(std::mem::size_of::<Inode>() == INODE_SIZE);

impl Inode {
    fn new(inode_num: u32, mode: u16, now: u32) -> Self {
        Self {
            inode_num,
            nlink: 1,
            mode,
            atime: now,
            mtime: now,
            ctime: now,
            size: 0,
            xattr_head: 0,
            data: [0u8; INLINE_DATA_LEN],
        }
    }

    pub fn is_live(&self) -> bool {
        self.inode_num > 0 && self.nlink > 0
    }
}

struct Slot {
    inode: Inode,
    occupied: bool,
}

/// Fixed-capacity slab of inodes with a chained hash index keyed by
/// `inode_num`. `next_inode` never reuses a number within a single run.
pub struct InodeTable {
    slots: Vec<Slot>,
    buckets: Vec<Vec<usize>>,
    hash_capacity: usize,
    next_inode: u32,
}

impl InodeTable {
    pub fn new(capacity: usize, hash_capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot {
            inode: Inode::new_zeroed(),
            occupied: false,
        });
        Self {
            slots,
            buckets: vec![Vec::new(); hash_capacity.max(1)],
            hash_capacity: hash_capacity.max(1),
            next_inode: 1,
        }
    }

    fn bucket_for(&self, inode_num: u32) -> usize {
        (inode_num.wrapping_mul(HASH_MULTIPLIER) as usize) % self.hash_capacity
    }

    pub fn alloc(&mut self, mode: u16, now: u32) -> FsResult<u32> {
        let free_slot = self.slots.iter().position(|s| !s.occupied);
        let slot_idx = free_slot.ok_or(FsError::NoSpace)?;
        let inode_num = self.next_inode;
        self.next_inode = self.next_inode.checked_add(1).ok_or(FsError::NoSpace)?;
        self.slots[slot_idx] = Slot {
            inode: Inode::new(inode_num, mode, now),
            occupied: true,
        };
        let bucket = self.bucket_for(inode_num);
        self.buckets[bucket].push(slot_idx);
        Ok(inode_num)
    }

    fn find_slot(&self, inode_num: u32) -> Option<usize> {
        let bucket = self.bucket_for(inode_num);
        self.buckets[bucket]
            .iter()
            .copied()
            .find(|&idx| self.slots[idx].occupied && self.slots[idx].inode.inode_num == inode_num)
    }

    pub fn lookup(&self, inode_num: u32) -> FsResult<&Inode> {
        self.find_slot(inode_num)
            .map(|idx| &self.slots[idx].inode)
            .ok_or(FsError::NotFound)
    }

    pub fn link(&mut self, inode_num: u32, now: u32) -> FsResult<()> {
        let idx = self.find_slot(inode_num).ok_or(FsError::NotFound)?;
        let inode = &mut self.slots[idx].inode;
        if inode.nlink == u16::MAX {
            return Err(FsError::TooManyLinks);
        }
        inode.nlink += 1;
        inode.ctime = now;
        Ok(())
    }

    /// Decrements `nlink`; when it reaches zero the slot and hash entry
    /// are reclaimed. Returns the resulting link count.
    pub fn unlink(&mut self, inode_num: u32, now: u32) -> FsResult<u16> {
        let idx = self.find_slot(inode_num).ok_or(FsError::NotFound)?;
        let remaining = {
            let inode = &mut self.slots[idx].inode;
            inode.nlink = inode.nlink.saturating_sub(1);
            inode.ctime = now;
            inode.nlink
        };
        if remaining == 0 {
            let bucket = self.bucket_for(inode_num);
            self.buckets[bucket].retain(|&i| i != idx);
            self.slots[idx] = Slot {
                inode: Inode::new_zeroed(),
                occupied: false,
            };
        }
        Ok(remaining)
    }

    pub fn update(&mut self, inode_num: u32, size: u64, mtime: u32, now: u32) -> FsResult<()> {
        let idx = self.find_slot(inode_num).ok_or(FsError::NotFound)?;
        let inode = &mut self.slots[idx].inode;
        inode.size = size;
        inode.mtime = mtime;
        inode.ctime = now;
        Ok(())
    }

    pub fn lookup_mut(&mut self, inode_num: u32) -> FsResult<&mut Inode> {
        let idx = self.find_slot(inode_num).ok_or(FsError::NotFound)?;
        Ok(&mut self.slots[idx].inode)
    }

    pub fn contains(&self, inode_num: u32) -> bool {
        self.find_slot(inode_num).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_lookup_round_trips() {
        let mut table = InodeTable::new(16, 8);
        let n = table.alloc(0o755, 1000).unwrap();
        let inode = table.lookup(n).unwrap();
        assert_eq!(inode.nlink, 1);
        assert_eq!(inode.mode, 0o755);
    }

    #[test]
    fn inode_numbers_never_reused_within_a_run() {
        let mut table = InodeTable::new(4, 4);
        let a = table.alloc(0, 0).unwrap();
        table.unlink(a, 0).unwrap();
        let b = table.alloc(0, 0).unwrap();
        assert!(b > a);
    }

    #[test]
    fn link_increments_and_unlink_frees_at_zero() {
        let mut table = InodeTable::new(4, 4);
        let n = table.alloc(0, 0).unwrap();
        table.link(n, 1).unwrap();
        assert_eq!(table.lookup(n).unwrap().nlink, 2);
        assert_eq!(table.unlink(n, 1).unwrap(), 1);
        assert_eq!(table.unlink(n, 1).unwrap(), 0);
        assert!(table.lookup(n).is_err());
    }

    #[test]
    fn alloc_fails_when_slab_is_full() {
        let mut table = InodeTable::new(1, 1);
        table.alloc(0, 0).unwrap();
        assert_eq!(table.alloc(0, 0), Err(FsError::NoSpace));
    }
}
