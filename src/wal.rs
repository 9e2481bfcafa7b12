//! Fixed circular write-ahead log: a 64-byte header followed by a ring
//! of typed, checksummed records.

use crate::error::{FsError, FsResult};
use blockstore::BackingStore;
use num_enum::TryFromPrimitive;
use parking_lot::Mutex;
use std::collections::HashMap;
use zerocopy::{AsBytes, FromBytes};

pub const WAL_MAGIC: u32 = 0x574C_4F47;
pub const WAL_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;
const ENTRY_HEADER_SIZE: usize = 32;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum OpType {
    /// Internal filler record written when a record would otherwise
    /// straddle the end of the ring buffer; never produced by a caller
    /// and never replayed as a transaction operation.
    Pad = 0,
    Begin = 1,
    Insert = 2,
    Delete = 3,
    Update = 4,
    Write = 5,
    Commit = 6,
    Abort = 7,
    Checkpoint = 8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
struct WalHeader {
    magic: u32,
    version: u32,
    next_tx_id: u32,
    next_lsn: u32,
    head_offset: u32,
    tail_offset: u32,
    checkpoint_lsn: u32,
    entry_count: u32,
    checksum: u32,
    reserved: [u8; 28],
}

const _: () = assert!(std::mem::size_of::<WalHeader>() == HEADER_SIZE);

#[repr(C)]
#[derive(Debug, Clone, Copy, AsBytes, FromBytes)]
struct EntryHeader {
    tx_id: u32,
    lsn: u32,
    op_type: u8,
    reserved1: [u8; 3],
    data_len: u32,
    timestamp: u32,
    checksum: u32,
    reserved2: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<EntryHeader>() == ENTRY_HEADER_SIZE);

/// A fully parsed log record, as handed to recovery's analysis pass.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub tx_id: u32,
    pub lsn: u32,
    pub op_type: OpType,
    pub data: Vec<u8>,
}

struct RingState {
    header: WalHeader,
}

/// Guards the header and ring buffer (`log_lock` in the documented lock
/// ordering). Transaction id assignment is a separate `tx_lock`,
/// acquired first.
pub struct WriteAheadLog {
    store: Mutex<Box<dyn BackingStore>>,
    ring: Mutex<RingState>,
    tx_lock: Mutex<()>,
    capacity: usize,
}

impl WriteAheadLog {
    pub fn new(mut store: Box<dyn BackingStore>) -> FsResult<Self> {
        let total = store.len();
        if total <= HEADER_SIZE {
            return Err(FsError::Invalid);
        }
        let capacity = total - HEADER_SIZE;
        let header = WalHeader {
            magic: WAL_MAGIC,
            version: WAL_VERSION,
            next_tx_id: 1,
            next_lsn: 1,
            head_offset: 0,
            tail_offset: 0,
            checkpoint_lsn: 0,
            entry_count: 0,
            checksum: 0,
            reserved: [0u8; 28],
        };
        store.write(0, header.as_bytes()).map_err(FsError::from)?;
        Ok(Self {
            store: Mutex::new(store),
            ring: Mutex::new(RingState { header }),
            tx_lock: Mutex::new(()),
            capacity,
        })
    }

    /// Reopens an existing WAL image, trusting the on-disk header.
    pub fn open(store: Box<dyn BackingStore>) -> FsResult<Self> {
        let total = store.len();
        let capacity = total.saturating_sub(HEADER_SIZE);
        let mut buf = [0u8; HEADER_SIZE];
        store.read(0, &mut buf).map_err(FsError::from)?;
        let header = WalHeader::read_from(&buf[..]).ok_or(FsError::Corrupt)?;
        if header.magic != WAL_MAGIC {
            return Err(FsError::Corrupt);
        }
        Ok(Self {
            store: Mutex::new(store),
            ring: Mutex::new(RingState { header }),
            tx_lock: Mutex::new(()),
            capacity,
        })
    }

    fn persist_header(&self, ring: &RingState) -> FsResult<()> {
        let mut header = ring.header;
        header.checksum = 0;
        header.checksum = crc32c::crc32c(header.as_bytes());
        self.store
            .lock()
            .write(0, header.as_bytes())
            .map_err(FsError::from)
    }

    /// Appends one record, padding and wrapping first if it would
    /// straddle the end of the ring. Returns the record's LSN.
    fn append(&self, tx_id: u32, op_type: OpType, data: &[u8]) -> FsResult<u32> {
        let mut ring = self.ring.lock();
        let needed = ENTRY_HEADER_SIZE + data.len();

        let remaining_to_end = self.capacity - (ring.header.head_offset as usize);
        if remaining_to_end < needed {
            if remaining_to_end >= ENTRY_HEADER_SIZE {
                let pad = EntryHeader {
                    tx_id: 0,
                    lsn: 0,
                    op_type: OpType::Pad as u8,
                    reserved1: [0; 3],
                    data_len: (remaining_to_end - ENTRY_HEADER_SIZE) as u32,
                    timestamp: 0,
                    checksum: 0,
                    reserved2: [0; 8],
                };
                self.write_at(ring.header.head_offset as usize, pad.as_bytes())?;
            }
            ring.header.head_offset = 0;
        }

        let used = self.used_bytes(&ring.header);
        if used + needed > self.capacity {
            return Err(FsError::LogFull);
        }

        let lsn = ring.header.next_lsn;
        ring.header.next_lsn += 1;
        let data_checksum = crc32c::crc32c(data);
        let mut entry = EntryHeader {
            tx_id,
            lsn,
            op_type: op_type as u8,
            reserved1: [0; 3],
            data_len: data.len() as u32,
            timestamp: 0,
            checksum: 0,
            reserved2: [0; 8],
        };
        entry.checksum = crc32c::crc32c(entry.as_bytes()) ^ data_checksum;

        let offset = ring.header.head_offset as usize;
        self.write_at(offset, entry.as_bytes())?;
        self.write_at(offset + ENTRY_HEADER_SIZE, data)?;

        ring.header.head_offset = (offset + needed) as u32;
        ring.header.entry_count += 1;
        self.persist_header(&ring)?;
        Ok(lsn)
    }

    fn used_bytes(&self, header: &WalHeader) -> usize {
        let (head, tail) = (header.head_offset as usize, header.tail_offset as usize);
        if head >= tail {
            head - tail
        } else {
            self.capacity - tail + head
        }
    }

    fn write_at(&self, ring_offset: usize, buf: &[u8]) -> FsResult<()> {
        self.store
            .lock()
            .write(HEADER_SIZE + ring_offset, buf)
            .map_err(FsError::from)
    }

    fn read_at(&self, ring_offset: usize, buf: &mut [u8]) -> FsResult<()> {
        self.store
            .lock()
            .read(HEADER_SIZE + ring_offset, buf)
            .map_err(FsError::from)
    }

    pub fn begin_tx(&self) -> FsResult<u32> {
        let _guard = self.tx_lock.lock();
        let tx_id = {
            let mut ring = self.ring.lock();
            let id = ring.header.next_tx_id;
            ring.header.next_tx_id += 1;
            id
        };
        self.append(tx_id, OpType::Begin, &[])?;
        Ok(tx_id)
    }

    pub fn log_insert(&self, tx_id: u32, data: &[u8]) -> FsResult<u32> {
        self.append(tx_id, OpType::Insert, data)
    }

    pub fn log_delete(&self, tx_id: u32, data: &[u8]) -> FsResult<u32> {
        self.append(tx_id, OpType::Delete, data)
    }

    pub fn log_update(&self, tx_id: u32, data: &[u8]) -> FsResult<u32> {
        self.append(tx_id, OpType::Update, data)
    }

    pub fn log_write(&self, tx_id: u32, data: &[u8]) -> FsResult<u32> {
        self.append(tx_id, OpType::Write, data)
    }

    /// Appends COMMIT then flushes: a successful return guarantees every
    /// record of `tx_id` is durable.
    pub fn commit_tx(&self, tx_id: u32) -> FsResult<()> {
        self.append(tx_id, OpType::Commit, &[])?;
        self.store.lock().flush().map_err(FsError::from)
    }

    pub fn abort_tx(&self, tx_id: u32) -> FsResult<()> {
        self.append(tx_id, OpType::Abort, &[]).map(|_| ())
    }

    /// Advances `tail_offset` to `head_offset`, reclaiming all space
    /// consumed by records preceding this call.
    pub fn checkpoint(&self) -> FsResult<()> {
        self.append(0, OpType::Checkpoint, &[])?;
        let mut ring = self.ring.lock();
        ring.header.checkpoint_lsn = ring.header.next_lsn - 1;
        ring.header.tail_offset = ring.header.head_offset;
        ring.header.entry_count = 0;
        self.persist_header(&ring)
    }

    pub fn needs_recovery(&self) -> bool {
        let ring = self.ring.lock();
        ring.header.entry_count > 0
    }

    /// Scans from `tail_offset` toward `head_offset`, stopping on a
    /// checksum failure or a CHECKPOINT record. Internal PAD records are
    /// consumed silently.
    pub fn scan(&self) -> Vec<WalRecord> {
        let ring = self.ring.lock();
        let (mut pos, head) = (ring.header.tail_offset as usize, ring.header.head_offset as usize);
        let mut records = Vec::new();

        loop {
            if pos == head && !records.is_empty() {
                break;
            }
            if pos == head && records.is_empty() && ring.header.entry_count == 0 {
                break;
            }
            let mut hdr_buf = [0u8; ENTRY_HEADER_SIZE];
            if self.read_at(pos, &mut hdr_buf).is_err() {
                break;
            }
            let entry = match EntryHeader::read_from(&hdr_buf[..]) {
                Some(e) => e,
                None => break,
            };
            let op = match OpType::try_from_primitive(entry.op_type) {
                Ok(op) => op,
                Err(_) => break,
            };

            if op == OpType::Pad {
                pos = 0;
                continue;
            }

            let mut data = vec![0u8; entry.data_len as usize];
            if !data.is_empty() && self.read_at(pos + ENTRY_HEADER_SIZE, &mut data).is_err() {
                break;
            }
            let mut check_hdr = entry;
            check_hdr.checksum = 0;
            let expected = crc32c::crc32c(check_hdr.as_bytes()) ^ crc32c::crc32c(&data);
            if expected != entry.checksum {
                break;
            }

            pos += ENTRY_HEADER_SIZE + entry.data_len as usize;
            let is_checkpoint = op == OpType::Checkpoint;
            records.push(WalRecord {
                tx_id: entry.tx_id,
                lsn: entry.lsn,
                op_type: op,
                data,
            });
            if is_checkpoint {
                break;
            }
            if pos >= self.capacity {
                pos = 0;
            }
        }
        records
    }
}

/// Per-transaction bookkeeping built by recovery's analysis pass; kept
/// here because both `wal.rs` and `recovery.rs` need the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct TxInfo {
    pub state: TxState,
    pub first_lsn: u32,
    pub last_lsn: u32,
    pub op_count: u32,
}

pub fn analyze(records: &[WalRecord]) -> HashMap<u32, TxInfo> {
    let mut txs: HashMap<u32, TxInfo> = HashMap::new();
    for r in records {
        match r.op_type {
            OpType::Begin => {
                txs.insert(
                    r.tx_id,
                    TxInfo {
                        state: TxState::Active,
                        first_lsn: r.lsn,
                        last_lsn: r.lsn,
                        op_count: 0,
                    },
                );
            }
            OpType::Commit => {
                if let Some(info) = txs.get_mut(&r.tx_id) {
                    info.state = TxState::Committed;
                    info.last_lsn = r.lsn;
                }
            }
            OpType::Abort => {
                if let Some(info) = txs.get_mut(&r.tx_id) {
                    info.state = TxState::Aborted;
                    info.last_lsn = r.lsn;
                }
            }
            OpType::Insert | OpType::Delete | OpType::Update | OpType::Write => {
                if let Some(info) = txs.get_mut(&r.tx_id) {
                    info.op_count += 1;
                    info.last_lsn = r.lsn;
                }
            }
            OpType::Pad | OpType::Checkpoint => {}
        }
    }
    txs
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockstore::MemoryBackingStore;

    fn wal(size: usize) -> WriteAheadLog {
        WriteAheadLog::new(Box::new(MemoryBackingStore::new(size))).unwrap()
    }

    #[test]
    fn commit_produces_a_scannable_begin_and_commit() {
        let log = wal(4096);
        let tx = log.begin_tx().unwrap();
        log.log_insert(tx, b"payload").unwrap();
        log.commit_tx(tx).unwrap();

        let records = log.scan();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].op_type, OpType::Begin);
        assert_eq!(records[1].data, b"payload");
        assert_eq!(records[2].op_type, OpType::Commit);
    }

    #[test]
    fn analysis_tracks_committed_vs_active() {
        let log = wal(4096);
        let t1 = log.begin_tx().unwrap();
        let t2 = log.begin_tx().unwrap();
        log.commit_tx(t2).unwrap();
        let records = log.scan();
        let txs = analyze(&records);
        assert_eq!(txs[&t2].state, TxState::Committed);
        assert_eq!(txs[&t1].state, TxState::Active);
    }

    #[test]
    fn checkpoint_reclaims_space_and_clears_recovery_flag() {
        let log = wal(4096);
        let tx = log.begin_tx().unwrap();
        log.commit_tx(tx).unwrap();
        assert!(log.needs_recovery());
        log.checkpoint().unwrap();
        assert!(!log.needs_recovery());
    }

    #[test]
    fn full_log_rejects_further_appends() {
        let log = wal(HEADER_SIZE + ENTRY_HEADER_SIZE * 2);
        let tx = log.begin_tx().unwrap();
        let result = log.log_insert(tx, &[0u8; 256]);
        assert_eq!(result, Err(FsError::LogFull));
    }
}
