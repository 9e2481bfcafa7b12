//! Wires string table, block allocator, inode table, extent map,
//! directory tree, WAL and recovery behind the public operations
//! surface.

use crate::alloc::BlockAllocator;
use crate::error::{FsError, FsResult};
use crate::extent::ExtentMap;
use crate::inode::InodeTable;
use crate::recovery::{self, DeletePayload, InsertPayload, UpdatePayload};
use crate::tree::{DirectoryTree, ROOT_INDEX};
use crate::wal::WriteAheadLog;
use blockstore::{BackingStore, MemoryBackingStore};
use log::{debug, info};
use parking_lot::RwLock;
use zerocopy::AsBytes;

/// Sizes every subsystem at construction time. No subsystem reads from
/// global or `lazy_static` state; everything is threaded through here.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub block_size: usize,
    pub total_blocks: usize,
    pub inode_capacity: usize,
    pub inode_hash_capacity: usize,
    pub wal_bytes: usize,
    pub tree_node_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: crate::alloc::BLOCK_SIZE,
            total_blocks: 4096,
            inode_capacity: 1024,
            inode_hash_capacity: 2048,
            wal_bytes: 1024 * 1024,
            tree_node_capacity: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub free_blocks: usize,
    pub total_blocks: usize,
    pub fragmentation: f64,
    pub tree: crate::tree::TreeStats,
}

pub struct FileSystem {
    alloc: BlockAllocator,
    inodes: RwLock<InodeTable>,
    tree: DirectoryTree,
    wal: WriteAheadLog,
    now: RwLock<u32>,
}

impl FileSystem {
    /// Builds a fresh filesystem over two in-memory pools: one for data
    /// blocks, one for the WAL.
    pub fn new(config: Config) -> FsResult<Self> {
        Self::open(
            config,
            Box::new(MemoryBackingStore::new(config.total_blocks * config.block_size)),
            Box::new(MemoryBackingStore::new(config.wal_bytes)),
        )
    }

    /// Opens over caller-supplied backing stores, running recovery before
    /// returning a usable handle: mount-time analysis/redo/undo runs up
    /// front, the same way a real filesystem loads or rebuilds its
    /// superblock before serving its first request.
    pub fn open(config: Config, data_store: Box<dyn BackingStore>, wal_store: Box<dyn BackingStore>) -> FsResult<Self> {
        let alloc = BlockAllocator::new(data_store, config.total_blocks);
        let inodes = RwLock::new(InodeTable::new(config.inode_capacity, config.inode_hash_capacity));
        let tree = DirectoryTree::new(config.tree_node_capacity)?;
        let wal = WriteAheadLog::new(wal_store)?;
        let fs = Self {
            alloc,
            inodes,
            tree,
            wal,
            now: RwLock::new(1),
        };
        fs.recover_if_needed()?;
        Ok(fs)
    }

    fn recover_if_needed(&self) -> FsResult<()> {
        if !self.wal.needs_recovery() {
            return Ok(());
        }
        info!("wal has uncheckpointed records, running recovery");
        let mut inodes = self.inodes.write();
        let report = recovery::recover(&self.wal, &self.tree, &mut inodes)?;
        info!(
            "recovery complete: {} records scanned, {} committed tx, {} ops replayed",
            report.records_scanned, report.transactions_committed, report.operations_replayed
        );
        Ok(())
    }

    fn tick(&self) -> u32 {
        let mut now = self.now.write();
        *now += 1;
        *now
    }

    fn resolve_parent<'a>(&self, path: &'a str) -> FsResult<(u32, &'a str)> {
        let (parent_path, name) = path.rsplit_once('/').ok_or(FsError::Invalid)?;
        let parent = if parent_path.is_empty() {
            ROOT_INDEX
        } else {
            self.tree.path_lookup(parent_path)?
        };
        if name.is_empty() {
            return Err(FsError::Invalid);
        }
        Ok((parent, name))
    }

    pub fn create_file(&self, path: &str, mode: u16) -> FsResult<u32> {
        self.create(path, mode & !0o040000 | 0o100000)
    }

    pub fn create_dir(&self, path: &str, mode: u16) -> FsResult<u32> {
        self.create(path, mode | 0o040000)
    }

    fn create(&self, path: &str, mode: u16) -> FsResult<u32> {
        let (parent, name) = self.resolve_parent(path)?;
        if self.tree.find_child(parent, name.as_bytes()).is_ok() {
            return Err(FsError::AlreadyExists);
        }
        let now = self.tick();
        let tx = self.wal.begin_tx()?;
        let inode_num = self.inodes.write().alloc(mode, now)?;

        let mut payload = Vec::with_capacity(std::mem::size_of::<InsertPayload>() + name.len());
        let header = InsertPayload {
            inode: inode_num as u64,
            parent,
            timestamp: now,
            mode,
            name_len: name.len() as u8,
            _pad: 0,
            _pad2: 0,
        };
        payload.extend_from_slice(header.as_bytes());
        payload.extend_from_slice(name.as_bytes());
        self.wal.log_insert(tx, &payload)?;

        match self.tree.insert(parent, name.as_bytes(), mode, inode_num as u64, now) {
            Ok(node_idx) => {
                self.wal.commit_tx(tx)?;
                debug!("created {path} as inode {inode_num} (node {node_idx})");
                Ok(inode_num)
            }
            Err(e) => {
                self.wal.abort_tx(tx)?;
                self.inodes.write().unlink(inode_num, now)?;
                Err(e)
            }
        }
    }

    pub fn unlink(&self, path: &str) -> FsResult<()> {
        let node_idx = self.tree.path_lookup(path)?;
        let inode_num = self.tree.node_inode(node_idx)? as u32;
        let now = self.tick();
        let tx = self.wal.begin_tx()?;
        self.wal.log_delete(tx, DeletePayload { node_idx }.as_bytes())?;
        self.tree.delete(node_idx)?;
        let remaining = self.inodes.write().unlink(inode_num, now)?;
        if remaining == 0 {
            let mut inodes = self.inodes.write();
            if let Ok(inode) = inodes.lookup_mut(inode_num) {
                ExtentMap::new(&self.alloc).free_all(inode)?;
            }
        }
        self.wal.commit_tx(tx)?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> FsResult<()> {
        self.unlink(path)
    }

    pub fn read(&self, path: &str, off: u64, buf: &mut [u8]) -> FsResult<usize> {
        let inode_num = self.stat_inode_num(path)?;
        let inodes = self.inodes.read();
        let inode = inodes.lookup(inode_num)?;
        ExtentMap::new(&self.alloc).read(inode, buf, off)
    }

    pub fn write(&self, path: &str, off: u64, buf: &[u8]) -> FsResult<()> {
        let inode_num = self.stat_inode_num(path)?;
        let now = self.tick();
        let tx = self.wal.begin_tx()?;
        self.wal.log_write(tx, buf)?;
        {
            let mut inodes = self.inodes.write();
            let inode = inodes.lookup_mut(inode_num)?;
            ExtentMap::new(&self.alloc).write(inode, buf, off)?;
            inode.mtime = now;
            inode.ctime = now;
            let payload = UpdatePayload {
                inode: inode_num,
                size: inode.size,
                mtime: now,
            };
            self.wal.log_update(tx, payload.as_bytes())?;
        }
        self.wal.commit_tx(tx)?;
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let inode_num = self.stat_inode_num(path)?;
        let now = self.tick();
        let tx = self.wal.begin_tx()?;
        let mut inodes = self.inodes.write();
        let inode = inodes.lookup_mut(inode_num)?;
        ExtentMap::new(&self.alloc).truncate(inode, size)?;
        let payload = UpdatePayload {
            inode: inode_num,
            size,
            mtime: now,
        };
        self.wal.log_update(tx, payload.as_bytes())?;
        self.wal.commit_tx(tx)?;
        Ok(())
    }

    pub fn punch_hole(&self, path: &str, off: u64, len: u64) -> FsResult<()> {
        let inode_num = self.stat_inode_num(path)?;
        let tx = self.wal.begin_tx()?;
        let mut inodes = self.inodes.write();
        let inode = inodes.lookup_mut(inode_num)?;
        ExtentMap::new(&self.alloc).punch_hole(inode, off, len)?;
        self.wal.commit_tx(tx)?;
        Ok(())
    }

    pub fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        let node_idx = self.tree.path_lookup(src)?;
        let (new_parent, new_name) = self.resolve_parent(dst)?;
        let tx = self.wal.begin_tx()?;
        self.tree.move_subtree(node_idx, new_parent, new_name.as_bytes())?;
        self.wal.commit_tx(tx)?;
        Ok(())
    }

    fn stat_inode_num(&self, path: &str) -> FsResult<u32> {
        let node_idx = self.tree.path_lookup(path)?;
        Ok(self.tree.node_inode(node_idx)? as u32)
    }

    pub fn stat(&self, path: &str) -> FsResult<crate::inode::Inode> {
        let inode_num = self.stat_inode_num(path)?;
        let inodes = self.inodes.read();
        Ok(*inodes.lookup(inode_num)?)
    }

    pub fn link(&self, src: &str, dst: &str) -> FsResult<()> {
        let inode_num = self.stat_inode_num(src)?;
        let (parent, name) = self.resolve_parent(dst)?;
        let now = self.tick();
        let tx = self.wal.begin_tx()?;
        self.inodes.write().link(inode_num, now)?;
        let mode = self.inodes.read().lookup(inode_num)?.mode;
        match self.tree.insert(parent, name.as_bytes(), mode, inode_num as u64, now) {
            Ok(_) => {
                self.wal.commit_tx(tx)?;
                Ok(())
            }
            Err(e) => {
                self.wal.abort_tx(tx)?;
                self.inodes.write().unlink(inode_num, now)?;
                Err(e)
            }
        }
    }

    pub fn checkpoint(&self) -> FsResult<()> {
        self.wal.checkpoint()
    }

    /// If the most recent mutation failed with `LogFull`, checkpoints and
    /// retries the same closure once.
    pub fn checkpoint_and_retry<T>(&self, op: impl Fn() -> FsResult<T>) -> FsResult<T> {
        match op() {
            Err(FsError::LogFull) => {
                self.checkpoint()?;
                op()
            }
            other => other,
        }
    }

    pub fn stats(&self) -> FsStats {
        FsStats {
            free_blocks: self.alloc.free_count(),
            total_blocks: self.alloc.total(),
            fragmentation: self.alloc.fragmentation(),
            tree: self.tree.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs() -> FileSystem {
        FileSystem::new(Config {
            total_blocks: 64,
            inode_capacity: 64,
            inode_hash_capacity: 64,
            wal_bytes: 64 * 1024,
            tree_node_capacity: 64,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn create_write_read_round_trips() {
        let fs = fs();
        fs.create_file("/a.txt", 0o644).unwrap();
        fs.write("/a.txt", 0, b"hello").unwrap();
        let mut buf = [0u8; 5];
        let n = fs.read("/a.txt", 0, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn unlink_then_create_again_gets_a_larger_inode_number() {
        let fs = fs();
        let first = fs.create_file("/a.txt", 0o644).unwrap();
        fs.unlink("/a.txt").unwrap();
        let second = fs.create_file("/a.txt", 0o644).unwrap();
        assert!(second > first);
    }

    #[test]
    fn duplicate_create_fails_with_already_exists() {
        let fs = fs();
        fs.create_file("/a.txt", 0o644).unwrap();
        assert_eq!(fs.create_file("/a.txt", 0o644), Err(FsError::AlreadyExists));
    }

    #[test]
    fn hardlink_keeps_bytes_reachable_after_original_unlinked() {
        let fs = fs();
        fs.create_file("/a", 0o644).unwrap();
        fs.write("/a", 0, b"data").unwrap();
        fs.link("/a", "/b").unwrap();
        fs.unlink("/a").unwrap();
        let mut buf = [0u8; 4];
        fs.read("/b", 0, &mut buf).unwrap();
        assert_eq!(&buf, b"data");
    }

    #[test]
    fn directories_refuse_removal_while_nonempty() {
        let fs = fs();
        fs.create_dir("/d", 0o755).unwrap();
        fs.create_file("/d/f", 0o644).unwrap();
        assert_eq!(fs.rmdir("/d"), Err(FsError::NotEmpty));
    }
}
