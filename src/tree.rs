//! Flat-arena n-ary directory tree. Parent/child links are array indices,
//! never owning references, so traversal is a load rather than a pointer
//! chase.

use crate::error::{FsError, FsResult};
use crate::strtab::StringTable;
use parking_lot::RwLock;
use zerocopy::{AsBytes, FromBytes};

pub const MAX_INLINE_CHILDREN: usize = 12;
pub const ROOT_INDEX: u32 = 0;

// An exact 64-byte record with inode, parent offset, name hash, size,
// timestamp, child count, mode and 12 inline child offsets doesn't
// actually fit in 64 bytes once those fields are laid out, and a node
// still needs a way back to its name: names live in the shared string
// table (Component A), not inline. This keeps every other field and adds
// `name_ref`, landing on a record larger than one cache line rather than
// dropping name lookup or duplicating name bytes inline. See DESIGN.md.
#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
pub struct TreeNode {
    pub inode: u64,
    pub parent_offset: u32,
    pub name_hash: u32,
    pub name_ref: u32,
    pub size: u32,
    pub timestamp: u32,
    pub child_count: u16,
    pub mode: u16,
    pub child_offsets: [u32; MAX_INLINE_CHILDREN],
}

fn hash_name(name: &[u8]) -> u32 {
    let mut h: u32 = 2166136261;
    for &b in name {
        h ^= b as u32;
        h = h.wrapping_mul(16777619);
    }
    h
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TreeStats {
    pub total_nodes: usize,
    pub max_depth: usize,
    pub avg_children: f64,
}

struct Arena {
    nodes: Vec<TreeNode>,
    occupied: Vec<bool>,
    free_list: Vec<u32>,
    strtab: StringTable,
}

pub struct DirectoryTree {
    arena: RwLock<Arena>,
}

impl DirectoryTree {
    pub fn new(capacity: usize) -> FsResult<Self> {
        let mut arena = Arena {
            nodes: Vec::with_capacity(capacity),
            occupied: Vec::with_capacity(capacity),
            // Index 0 is reserved for root, seeded by `init` below; every
            // other preallocated slot starts out free.
            free_list: (1..capacity as u32).rev().collect(),
            strtab: StringTable::new(),
        };
        arena.nodes.resize(capacity, TreeNode::new_zeroed());
        arena.occupied.resize(capacity, false);
        let tree = Self {
            arena: RwLock::new(arena),
        };
        tree.init()?;
        Ok(tree)
    }

    fn init(&self) -> FsResult<()> {
        let mut arena = self.arena.write();
        let name_ref = arena.strtab.intern(b"/")?;
        arena.nodes[0] = TreeNode {
            inode: 1,
            parent_offset: 0,
            name_hash: hash_name(b"/"),
            name_ref,
            size: 0,
            timestamp: 0,
            child_count: 0,
            mode: 0o040755,
            child_offsets: [0; MAX_INLINE_CHILDREN],
        };
        arena.occupied[0] = true;
        Ok(())
    }

    pub fn find_child(&self, parent: u32, name: &[u8]) -> FsResult<u32> {
        let arena = self.arena.read();
        let parent_node = arena
            .nodes
            .get(parent as usize)
            .filter(|_| arena.occupied[parent as usize])
            .ok_or(FsError::NotFound)?;
        let target_hash = hash_name(name);
        for i in 0..parent_node.child_count as usize {
            let child_idx = parent_node.child_offsets[i];
            let child = &arena.nodes[child_idx as usize];
            if child.name_hash == target_hash && arena.strtab.get(child.name_ref) == name {
                return Ok(child_idx);
            }
        }
        Err(FsError::NotFound)
    }

    pub fn path_lookup(&self, path: &str) -> FsResult<u32> {
        let mut current = ROOT_INDEX;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current = self.find_child(current, component.as_bytes())?;
        }
        Ok(current)
    }

    pub fn insert(&self, parent: u32, name: &[u8], mode: u16, inode: u64, now: u32) -> FsResult<u32> {
        let mut arena = self.arena.write();
        {
            let parent_node = arena
                .nodes
                .get(parent as usize)
                .filter(|_| arena.occupied[parent as usize])
                .ok_or(FsError::NotFound)?;
            if parent_node.mode & 0o040000 == 0 {
                return Err(FsError::Invalid);
            }
            if parent_node.child_count as usize >= MAX_INLINE_CHILDREN {
                return Err(FsError::NoSpace);
            }
        }
        let free_idx = if let Some(idx) = arena.free_list.pop() {
            idx
        } else {
            let idx = arena.nodes.len();
            if idx >= arena.nodes.capacity() && idx == arena.occupied.len() {
                return Err(FsError::NoSpace);
            }
            arena.nodes.push(TreeNode::new_zeroed());
            arena.occupied.push(false);
            idx as u32
        };
        let name_ref = arena.strtab.intern(name)?;
        arena.nodes[free_idx as usize] = TreeNode {
            inode,
            parent_offset: parent,
            name_hash: hash_name(name),
            name_ref,
            size: 0,
            timestamp: now,
            child_count: 0,
            mode,
            child_offsets: [0; MAX_INLINE_CHILDREN],
        };
        arena.occupied[free_idx as usize] = true;
        let parent_node = &mut arena.nodes[parent as usize];
        let n = parent_node.child_count as usize;
        parent_node.child_offsets[n] = free_idx;
        parent_node.child_count += 1;
        Ok(free_idx)
    }

    pub fn delete(&self, node_idx: u32) -> FsResult<()> {
        if node_idx == ROOT_INDEX {
            return Err(FsError::Invalid);
        }
        let mut arena = self.arena.write();
        let (parent, child_count) = {
            let node = arena
                .nodes
                .get(node_idx as usize)
                .filter(|_| arena.occupied[node_idx as usize])
                .ok_or(FsError::NotFound)?;
            (node.parent_offset, node.child_count)
        };
        if child_count > 0 {
            return Err(FsError::NotEmpty);
        }
        let parent_node = &mut arena.nodes[parent as usize];
        let n = parent_node.child_count as usize;
        if let Some(pos) = parent_node.child_offsets[..n].iter().position(|&c| c == node_idx) {
            for i in pos..n - 1 {
                parent_node.child_offsets[i] = parent_node.child_offsets[i + 1];
            }
            parent_node.child_count -= 1;
        }
        arena.occupied[node_idx as usize] = false;
        arena.free_list.push(node_idx);
        Ok(())
    }

    fn is_descendant(&self, arena: &Arena, ancestor: u32, node: u32) -> bool {
        let mut current = node;
        loop {
            if current == ancestor {
                return true;
            }
            if current == ROOT_INDEX {
                return false;
            }
            current = arena.nodes[current as usize].parent_offset;
        }
    }

    pub fn move_subtree(&self, node: u32, new_parent: u32, new_name: &[u8]) -> FsResult<()> {
        let mut arena = self.arena.write();
        if self.is_descendant(&arena, node, new_parent) {
            return Err(FsError::Invalid);
        }
        let old_parent = arena
            .nodes
            .get(node as usize)
            .filter(|_| arena.occupied[node as usize])
            .ok_or(FsError::NotFound)?
            .parent_offset;
        {
            let new_parent_node = arena
                .nodes
                .get(new_parent as usize)
                .filter(|_| arena.occupied[new_parent as usize])
                .ok_or(FsError::NotFound)?;
            if new_parent_node.child_count as usize >= MAX_INLINE_CHILDREN {
                return Err(FsError::NoSpace);
            }
        }
        // detach from old parent
        {
            let old_parent_node = &mut arena.nodes[old_parent as usize];
            let n = old_parent_node.child_count as usize;
            if let Some(pos) = old_parent_node.child_offsets[..n].iter().position(|&c| c == node) {
                for i in pos..n - 1 {
                    old_parent_node.child_offsets[i] = old_parent_node.child_offsets[i + 1];
                }
                old_parent_node.child_count -= 1;
            }
        }
        let name_ref = arena.strtab.intern(new_name)?;
        let hash = hash_name(new_name);
        {
            let n = &mut arena.nodes[node as usize];
            n.parent_offset = new_parent;
            n.name_ref = name_ref;
            n.name_hash = hash;
        }
        let new_parent_node = &mut arena.nodes[new_parent as usize];
        let n = new_parent_node.child_count as usize;
        new_parent_node.child_offsets[n] = node;
        new_parent_node.child_count += 1;
        Ok(())
    }

    pub fn stats(&self) -> TreeStats {
        let arena = self.arena.read();
        let total_nodes = arena.occupied.iter().filter(|&&o| o).count();
        let mut max_depth = 0usize;
        let mut total_children = 0usize;
        let mut dir_count = 0usize;
        for (idx, &occ) in arena.occupied.iter().enumerate() {
            if !occ {
                continue;
            }
            let node = &arena.nodes[idx];
            if node.mode & 0o040000 != 0 {
                dir_count += 1;
                total_children += node.child_count as usize;
            }
            let mut depth = 0usize;
            let mut current = idx as u32;
            while current != ROOT_INDEX {
                depth += 1;
                current = arena.nodes[current as usize].parent_offset;
            }
            max_depth = max_depth.max(depth);
        }
        TreeStats {
            total_nodes,
            max_depth,
            avg_children: if dir_count > 0 {
                total_children as f64 / dir_count as f64
            } else {
                0.0
            },
        }
    }

    pub fn node_inode(&self, node_idx: u32) -> FsResult<u64> {
        let arena = self.arena.read();
        arena
            .nodes
            .get(node_idx as usize)
            .filter(|_| arena.occupied[node_idx as usize])
            .map(|n| n.inode)
            .ok_or(FsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_find_round_trips() {
        let tree = DirectoryTree::new(32).unwrap();
        let idx = tree.insert(ROOT_INDEX, b"a", 0o040755, 2, 0).unwrap();
        assert_eq!(tree.find_child(ROOT_INDEX, b"a").unwrap(), idx);
    }

    #[test]
    fn thirteenth_child_overflows_with_no_space() {
        let tree = DirectoryTree::new(32).unwrap();
        for i in 0..MAX_INLINE_CHILDREN {
            let name = format!("c{i}");
            tree.insert(ROOT_INDEX, name.as_bytes(), 0o100644, (i + 2) as u64, 0)
                .unwrap();
        }
        let result = tree.insert(ROOT_INDEX, b"overflow", 0o100644, 999, 0);
        assert_eq!(result, Err(FsError::NoSpace));
    }

    #[test]
    fn delete_refuses_nonempty_directory() {
        let tree = DirectoryTree::new(32).unwrap();
        let dir = tree.insert(ROOT_INDEX, b"d", 0o040755, 2, 0).unwrap();
        tree.insert(dir, b"f", 0o100644, 3, 0).unwrap();
        assert_eq!(tree.delete(dir), Err(FsError::NotEmpty));
    }

    #[test]
    fn path_lookup_walks_components() {
        let tree = DirectoryTree::new(32).unwrap();
        let dir = tree.insert(ROOT_INDEX, b"a", 0o040755, 2, 0).unwrap();
        let file = tree.insert(dir, b"b.txt", 0o100644, 3, 0).unwrap();
        assert_eq!(tree.path_lookup("/a/b.txt").unwrap(), file);
    }

    #[test]
    fn move_subtree_rejects_cycle_into_own_descendant() {
        let tree = DirectoryTree::new(32).unwrap();
        let dir = tree.insert(ROOT_INDEX, b"a", 0o040755, 2, 0).unwrap();
        let child = tree.insert(dir, b"b", 0o040755, 3, 0).unwrap();
        assert_eq!(tree.move_subtree(dir, child, b"a").unwrap_err(), FsError::Invalid);
    }
}
