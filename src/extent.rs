//! Extent-based sparse file storage: maps logical byte ranges onto
//! physical block runs, inline on the inode or spilled to an extent
//! tree block.

use crate::alloc::{BlockAllocator, BLOCK_SIZE};
use crate::error::{FsError, FsResult};
use crate::inode::Inode;
use zerocopy::{AsBytes, FromBytes};

pub const HOLE: u32 = u32::MAX;
const MAX_INLINE_EXTENTS: usize = 2;
const EXTENTS_PER_SPILL_BLOCK: usize = 254;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes)]
pub struct ExtentDescriptor {
    pub logical_offset: u64,
    pub block_num: u32,
    pub num_blocks: u32,
}

const _: () = assert!(std::mem::size_of::<ExtentDescriptor>() == 16);

impl ExtentDescriptor {
    pub fn is_hole(&self) -> bool {
        self.block_num == HOLE
    }

    fn end_offset(&self) -> u64 {
        self.logical_offset + self.num_blocks as u64 * BLOCK_SIZE as u64
    }
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct SpillBlock {
    num_extents: u32,
    _pad: u32,
    extents: [ExtentDescriptor; EXTENTS_PER_SPILL_BLOCK],
    reserved: [u8; 24],
}

const _: () = assert!(std::mem::size_of::<SpillBlock>() == BLOCK_SIZE);

/// Reads/writes an inode's inline extent slots, which live in its
/// 32-byte `data` area (two 16-byte descriptors).
fn inline_extents(inode: &Inode) -> [ExtentDescriptor; MAX_INLINE_EXTENTS] {
    let mut out = [ExtentDescriptor::new_zeroed(); MAX_INLINE_EXTENTS];
    for (i, slot) in out.iter_mut().enumerate() {
        let bytes = &inode.data[i * 16..(i + 1) * 16];
        *slot = ExtentDescriptor::read_from(bytes).expect("inline extent slot is 16 bytes");
    }
    out
}

fn write_inline_extents(inode: &mut Inode, extents: &[ExtentDescriptor]) {
    for i in 0..MAX_INLINE_EXTENTS {
        let slot = extents.get(i).copied().unwrap_or(ExtentDescriptor {
            logical_offset: 0,
            block_num: HOLE,
            num_blocks: 0,
        });
        inode.data[i * 16..(i + 1) * 16].copy_from_slice(slot.as_bytes());
    }
}

/// Spill-block pointer lives in the first 4 bytes following the inline
/// extent slots (bytes 32 is out of range of the 32-byte area, so the
/// pointer is carried by a dedicated sentinel: the second inline slot's
/// `logical_offset` field doubles as the spill block number once a file
/// exceeds two extents, marked by `num_blocks == u32::MAX`).
const SPILL_MARKER: u32 = u32::MAX;

fn spill_block_num(inode: &Inode) -> Option<u32> {
    let inline = inline_extents(inode);
    if inline[1].num_blocks == SPILL_MARKER {
        Some(inline[1].logical_offset as u32)
    } else {
        None
    }
}

fn set_spill_block_num(inode: &mut Inode, block: u32) {
    let marker = ExtentDescriptor {
        logical_offset: block as u64,
        block_num: 0,
        num_blocks: SPILL_MARKER,
    };
    inode.data[16..32].copy_from_slice(marker.as_bytes());
}

/// All extent operations take the inode they act on plus the allocator
/// their blocks live in.
pub struct ExtentMap<'a> {
    pub alloc: &'a BlockAllocator,
}

impl<'a> ExtentMap<'a> {
    pub fn new(alloc: &'a BlockAllocator) -> Self {
        Self { alloc }
    }

    fn load(&self, inode: &Inode) -> FsResult<Vec<ExtentDescriptor>> {
        if let Some(block) = spill_block_num(inode) {
            let mut buf = [0u8; BLOCK_SIZE];
            self.alloc.read(block, 0, &mut buf)?;
            let spill = SpillBlock::read_from(&buf[..]).ok_or(FsError::Corrupt)?;
            let n = spill.num_extents as usize;
            Ok(spill.extents[..n.min(EXTENTS_PER_SPILL_BLOCK)].to_vec())
        } else {
            let inline = inline_extents(inode);
            Ok(inline
                .into_iter()
                .filter(|e| e.num_blocks > 0)
                .collect())
        }
    }

    fn store(&self, inode: &mut Inode, extents: &[ExtentDescriptor]) -> FsResult<()> {
        if extents.len() <= MAX_INLINE_EXTENTS && spill_block_num(inode).is_none() {
            write_inline_extents(inode, extents);
            return Ok(());
        }
        if extents.len() > EXTENTS_PER_SPILL_BLOCK {
            return Err(FsError::NoSpace);
        }
        let block = match spill_block_num(inode) {
            Some(b) => b,
            None => {
                let b = self.alloc.alloc(1)?;
                set_spill_block_num(inode, b);
                b
            }
        };
        let mut spill = SpillBlock::new_zeroed();
        spill.num_extents = extents.len() as u32;
        spill.extents[..extents.len()].copy_from_slice(extents);
        self.alloc.write(block, 0, spill.as_bytes())?;
        Ok(())
    }

    /// Inserts an extent, merging with its immediate predecessor when the
    /// runs are physically and logically contiguous (holes merge with
    /// holes the same way).
    pub fn add(&self, inode: &mut Inode, logical_offset: u64, block_num: u32, num_blocks: u32) -> FsResult<()> {
        let mut extents = self.load(inode)?;
        let new = ExtentDescriptor {
            logical_offset,
            block_num,
            num_blocks,
        };
        let insert_at = extents
            .iter()
            .position(|e| e.logical_offset > logical_offset)
            .unwrap_or(extents.len());
        extents.insert(insert_at, new);
        self.merge_adjacent(&mut extents);
        self.store(inode, &extents)
    }

    fn merge_adjacent(&self, extents: &mut Vec<ExtentDescriptor>) {
        let mut i = 0;
        while i + 1 < extents.len() {
            let (a, b) = (extents[i], extents[i + 1]);
            let contiguous_offsets = a.end_offset() == b.logical_offset;
            let mergeable = if a.is_hole() && b.is_hole() {
                contiguous_offsets
            } else if !a.is_hole() && !b.is_hole() {
                contiguous_offsets && a.block_num + a.num_blocks == b.block_num
            } else {
                false
            };
            if mergeable {
                extents[i].num_blocks += b.num_blocks;
                extents.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Binary search by logical offset; returns `(block_num,
    /// within_block_offset)`, with `block_num == HOLE` for sparse ranges.
    pub fn map(&self, inode: &Inode, logical_offset: u64) -> FsResult<(u32, usize)> {
        let extents = self.load(inode)?;
        let idx = extents.partition_point(|e| e.end_offset() <= logical_offset);
        let e = extents.get(idx).ok_or(FsError::NotFound)?;
        if logical_offset < e.logical_offset {
            return Err(FsError::NotFound);
        }
        let block_offset_bytes = logical_offset - e.logical_offset;
        if e.is_hole() {
            return Ok((HOLE, (block_offset_bytes % BLOCK_SIZE as u64) as usize));
        }
        let block = e.block_num + (block_offset_bytes / BLOCK_SIZE as u64) as u32;
        Ok((block, (block_offset_bytes % BLOCK_SIZE as u64) as usize))
    }

    pub fn write(&self, inode: &mut Inode, buf: &[u8], offset: u64) -> FsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut written = 0usize;
        while written < buf.len() {
            let abs_offset = offset + written as usize as u64;
            let block_idx = abs_offset / BLOCK_SIZE as u64;
            let within = (abs_offset % BLOCK_SIZE as u64) as usize;
            let chunk_len = (BLOCK_SIZE - within).min(buf.len() - written);

            let block = match self.map(inode, abs_offset) {
                Ok((b, _)) if b != HOLE => b,
                _ => {
                    let new_block = self.alloc.alloc(1)?;
                    self.add(inode, block_idx * BLOCK_SIZE as u64, new_block, 1)?;
                    new_block
                }
            };
            self.alloc.write(block, within, &buf[written..written + chunk_len])?;
            written += chunk_len;
        }
        let new_size = offset + buf.len() as u64;
        if new_size > inode.size {
            inode.size = new_size;
        }
        Ok(())
    }

    pub fn read(&self, inode: &Inode, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if offset >= inode.size {
            return Ok(0);
        }
        let readable = (inode.size - offset).min(buf.len() as u64) as usize;
        let mut read = 0usize;
        while read < readable {
            let abs_offset = offset + read as u64;
            let within = (abs_offset % BLOCK_SIZE as u64) as usize;
            let chunk_len = (BLOCK_SIZE - within).min(readable - read);
            match self.map(inode, abs_offset) {
                Ok((b, _)) if b != HOLE => {
                    self.alloc.read(b, within, &mut buf[read..read + chunk_len])?;
                }
                _ => {
                    buf[read..read + chunk_len].fill(0);
                }
            }
            read += chunk_len;
        }
        Ok(readable)
    }

    pub fn truncate(&self, inode: &mut Inode, new_size: u64) -> FsResult<()> {
        if new_size >= inode.size {
            inode.size = new_size;
            return Ok(());
        }
        let mut extents = self.load(inode)?;
        let mut kept = Vec::new();
        for e in extents.drain(..) {
            if e.end_offset() <= new_size {
                kept.push(e);
                continue;
            }
            if e.logical_offset >= new_size {
                if !e.is_hole() {
                    self.alloc.free(e.block_num, e.num_blocks as usize)?;
                }
                continue;
            }
            // straddles new_size: keep the head, free the tail blocks
            let keep_blocks = ((new_size - e.logical_offset) as usize).div_ceil(BLOCK_SIZE) as u32;
            if !e.is_hole() {
                let freed_start = e.block_num + keep_blocks;
                let freed_count = e.num_blocks - keep_blocks;
                if freed_count > 0 {
                    self.alloc.free(freed_start, freed_count as usize)?;
                }
            }
            if keep_blocks > 0 {
                kept.push(ExtentDescriptor {
                    logical_offset: e.logical_offset,
                    block_num: e.block_num,
                    num_blocks: keep_blocks,
                });
            }
        }
        self.store(inode, &kept)?;
        inode.size = new_size;
        Ok(())
    }

    pub fn punch_hole(&self, inode: &mut Inode, offset: u64, length: u64) -> FsResult<()> {
        if length == 0 {
            return Ok(());
        }
        let end = offset + length;
        let mut extents = self.load(inode)?;
        let mut out = Vec::new();
        for e in extents.drain(..) {
            let e_end = e.end_offset();
            if e_end <= offset || e.logical_offset >= end {
                out.push(e);
                continue;
            }
            // split off head
            if e.logical_offset < offset {
                let head_blocks = ((offset - e.logical_offset) / BLOCK_SIZE as u64) as u32;
                if head_blocks > 0 {
                    out.push(ExtentDescriptor {
                        logical_offset: e.logical_offset,
                        block_num: e.block_num,
                        num_blocks: head_blocks,
                    });
                }
            }
            // free interior blocks that fall strictly within the hole
            if !e.is_hole() {
                let interior_start = e.block_num + ((offset.max(e.logical_offset) - e.logical_offset) / BLOCK_SIZE as u64) as u32;
                let interior_end = e.block_num + ((end.min(e_end) - e.logical_offset) / BLOCK_SIZE as u64) as u32;
                if interior_end > interior_start {
                    self.alloc.free(interior_start, (interior_end - interior_start) as usize)?;
                }
            }
            out.push(ExtentDescriptor {
                logical_offset: offset.max(e.logical_offset),
                block_num: HOLE,
                num_blocks: (((end.min(e_end) - offset.max(e.logical_offset)) as usize).div_ceil(BLOCK_SIZE)) as u32,
            });
            // split off tail
            if e_end > end {
                let tail_blocks = ((e_end - end) / BLOCK_SIZE as u64) as u32;
                if tail_blocks > 0 {
                    let tail_block_num = if e.is_hole() { HOLE } else { e.block_num + e.num_blocks - tail_blocks };
                    out.push(ExtentDescriptor {
                        logical_offset: end,
                        block_num: tail_block_num,
                        num_blocks: tail_blocks,
                    });
                }
            }
        }
        out.sort_by_key(|e| e.logical_offset);
        self.merge_adjacent(&mut out);
        self.store(inode, &out)
    }

    pub fn free_all(&self, inode: &mut Inode) -> FsResult<()> {
        let extents = self.load(inode)?;
        for e in extents {
            if !e.is_hole() {
                self.alloc.free(e.block_num, e.num_blocks as usize)?;
            }
        }
        if let Some(block) = spill_block_num(inode) {
            self.alloc.free(block, 1)?;
        }
        write_inline_extents(inode, &[]);
        inode.size = 0;
        Ok(())
    }

    pub fn iter(&self, inode: &Inode) -> FsResult<std::vec::IntoIter<ExtentDescriptor>> {
        Ok(self.load(inode)?.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockstore::MemoryBackingStore;

    fn setup(total_blocks: usize) -> (BlockAllocator, Inode) {
        let alloc = BlockAllocator::new(Box::new(MemoryBackingStore::new(total_blocks * BLOCK_SIZE)), total_blocks);
        (alloc, Inode::new_zeroed())
    }

    #[test]
    fn write_then_read_round_trips() {
        let (alloc, mut inode) = setup(8);
        let map = ExtentMap::new(&alloc);
        map.write(&mut inode, b"hello world", 0).unwrap();
        let mut buf = [0u8; 11];
        let n = map.read(&inode, &mut buf, 0).unwrap();
        assert_eq!(n, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn sparse_gap_reads_as_zero() {
        let (alloc, mut inode) = setup(8);
        let map = ExtentMap::new(&alloc);
        map.write(&mut inode, &[1u8; BLOCK_SIZE], 0).unwrap();
        map.write(&mut inode, &[2u8; BLOCK_SIZE], 2 * BLOCK_SIZE as u64).unwrap();
        let mut buf = [0xffu8; BLOCK_SIZE];
        let n = map.read(&inode, &mut buf, BLOCK_SIZE as u64).unwrap();
        assert_eq!(n, BLOCK_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn truncate_frees_tail_blocks() {
        let (alloc, mut inode) = setup(8);
        let map = ExtentMap::new(&alloc);
        map.write(&mut inode, &[1u8; 2 * BLOCK_SIZE], 0).unwrap();
        let free_before = alloc.free_count();
        map.truncate(&mut inode, BLOCK_SIZE as u64).unwrap();
        assert!(alloc.free_count() > free_before);
        assert_eq!(inode.size, BLOCK_SIZE as u64);
    }

    #[test]
    fn punch_hole_zeroes_region() {
        let (alloc, mut inode) = setup(8);
        let map = ExtentMap::new(&alloc);
        map.write(&mut inode, &[9u8; 2 * BLOCK_SIZE], 0).unwrap();
        map.punch_hole(&mut inode, 0, BLOCK_SIZE as u64).unwrap();
        let mut buf = [0xffu8; BLOCK_SIZE];
        map.read(&inode, &mut buf, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }
}
