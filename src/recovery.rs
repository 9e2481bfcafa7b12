//! Three-phase crash recovery: analysis, redo, undo. Deterministic and
//! idempotent — replaying the same log twice against the same initial
//! state yields the same result as replaying it once.

use crate::error::FsResult;
use crate::inode::InodeTable;
use crate::tree::DirectoryTree;
use crate::wal::{analyze, OpType, TxState, WalRecord, WriteAheadLog};
use zerocopy::{AsBytes, FromBytes};

/// Payload logged by `log_insert`: enough to replay `tree.insert` and
/// stamp the resulting node with the inode number the forward path
/// already allocated.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct InsertPayload {
    pub inode: u64,
    pub parent: u32,
    pub timestamp: u32,
    pub mode: u16,
    pub name_len: u8,
    pub _pad: u8,
    pub _pad2: u32,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DeletePayload {
    pub node_idx: u32,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct UpdatePayload {
    pub size: u64,
    pub inode: u32,
    pub mtime: u32,
}

#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub records_scanned: usize,
    pub transactions_committed: usize,
    pub transactions_aborted: usize,
    pub operations_replayed: usize,
}

/// Runs analysis, redo and undo over `wal` against `tree`/`inodes`.
/// `WRITE` records are scanned for transaction bookkeeping but never
/// replayed: file contents are restored from extent/inode state, not
/// re-derived from the log (see the design notes on this decision).
pub fn recover(wal: &WriteAheadLog, tree: &DirectoryTree, inodes: &mut InodeTable) -> FsResult<RecoveryReport> {
    let records = wal.scan();
    let txs = analyze(&records);
    let mut report = RecoveryReport {
        records_scanned: records.len(),
        ..Default::default()
    };

    for (_, info) in txs.iter() {
        match info.state {
            TxState::Committed => report.transactions_committed += 1,
            TxState::Active => report.transactions_aborted += 1, // undone, see below
            TxState::Aborted => {}
        }
    }

    redo(&records, &txs, tree, inodes, &mut report)?;
    // Undo: ACTIVE transactions at end of analysis are discarded outright.
    // No mutator in this engine exposes uncommitted state outside its own
    // transaction's records, so there is nothing further to roll back.
    Ok(report)
}

fn redo(
    records: &[WalRecord],
    txs: &std::collections::HashMap<u32, crate::wal::TxInfo>,
    tree: &DirectoryTree,
    inodes: &mut InodeTable,
    report: &mut RecoveryReport,
) -> FsResult<()> {
    for record in records {
        let committed = txs
            .get(&record.tx_id)
            .map(|info| info.state == TxState::Committed)
            .unwrap_or(false);
        if !committed {
            continue;
        }
        match record.op_type {
            OpType::Insert => {
                if let Some(payload) = InsertPayload::read_from_prefix(&record.data[..]) {
                    let name_start = std::mem::size_of::<InsertPayload>();
                    let name = &record.data[name_start..name_start + payload.name_len as usize];
                    if !inodes.contains(payload.inode as u32) {
                        let _ = tree.insert(payload.parent, name, payload.mode, payload.inode, payload.timestamp);
                        report.operations_replayed += 1;
                    }
                }
            }
            OpType::Delete => {
                if let Some(payload) = DeletePayload::read_from(&record.data[..]) {
                    if tree.node_inode(payload.node_idx).is_ok() {
                        let _ = tree.delete(payload.node_idx);
                        report.operations_replayed += 1;
                    }
                }
            }
            OpType::Update => {
                if let Some(payload) = UpdatePayload::read_from(&record.data[..]) {
                    if let Ok(inode) = inodes.lookup(payload.inode) {
                        if inode.mtime < payload.mtime {
                            inodes.update(payload.inode, payload.size, payload.mtime, payload.mtime)?;
                            report.operations_replayed += 1;
                        }
                    }
                }
            }
            OpType::Write => {
                // Advisory only, per the resolved open question: WRITE
                // records are not replayed against extent state.
            }
            OpType::Begin | OpType::Commit | OpType::Abort | OpType::Checkpoint | OpType::Pad => {}
        }
    }
    Ok(())
}
