//! Write-ahead log implementation
//!
//! The WAL is the single source of truth for recovery. Every operation is
//! appended as a `Staged` record before it can ever reach storage; the
//! transaction coordinator then appends `Prepared`, `Commit`, `Abort` and
//! `Applied` markers as the transaction moves through two-phase commit.
//!
//! File format:
//! ```text
//! +--------+---------+----------+-----------+--------+
//! | Magic  | Version | Base LSN | Txn floor | CRC32C |   file header (28B)
//! | 4B     | 4B      | 8B       | 8B        | 4B     |
//! +--------+---------+----------+-----------+--------+
//! +--------+-----+------+-------+--------+---------+--------+
//! | Magic  | LSN | Kind | TxnID | Length | Payload | CRC32C |   per record
//! | 4B     | 8B  | 1B   | 8B    | 4B     | var     | 4B     |
//! +--------+-----+------+-------+--------+---------+--------+
//! ```
//!
//! Appends are serialized through a single writer lock, so records from one
//! transaction are never reordered. Truncation rewrites the retained suffix
//! into a new file and renames it into place; the header keeps the LSN and
//! transaction id floors so numbering stays monotonic across truncations.
//!
//! When an fsync fails, the records written since the last good sync may or
//! may not be on disk. Their first LSN is noted in a small marker file next
//! to the log. The next open drops those records and reports the
//! transactions they belonged to through [`WriteAheadLog::unconfirmed_txns`],
//! so recovery can abort them instead of guessing.

use afs_common::config::WalSyncMode;
use afs_common::{Error, Operation, Result, TxnId, TxnMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

/// Position of a record in the log
pub type Lsn = u64;

/// WAL file name inside the log root
pub const WAL_FILE_NAME: &str = "afs.wal";

/// Marker naming records whose fsync failed
pub const UNSYNCED_FILE_NAME: &str = "afs.wal.unsynced";

/// WAL header magic number
const WAL_HEADER_MAGIC: u32 = 0x4146_5357; // "AFSW"

/// WAL record magic number
const WAL_RECORD_MAGIC: u32 = 0x4146_5352; // "AFSR"

/// WAL format version
const WAL_VERSION: u32 = 1;

/// File header size
const HEADER_SIZE: usize = 28;

/// Record header size (magic + lsn + kind + txn + length)
const RECORD_HEADER_SIZE: usize = 25;

/// Record trailer size (CRC32C)
const RECORD_TRAILER_SIZE: usize = 4;

/// Record kind (the transaction phase marker)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// An operation staged into a transaction
    Staged = 1,
    /// Commit-mark-pending: the staged set is complete and durable
    Prepared = 2,
    /// Commit decision
    Commit = 3,
    /// Abort decision
    Abort = 4,
    /// The leading operations of a committed transaction reached storage
    Applied = 5,
}

impl RecordKind {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Staged),
            2 => Some(Self::Prepared),
            3 => Some(Self::Commit),
            4 => Some(Self::Abort),
            5 => Some(Self::Applied),
            _ => None,
        }
    }

    /// Markers that must be durable before the caller proceeds
    #[must_use]
    pub const fn is_decision(self) -> bool {
        matches!(self, Self::Prepared | Self::Commit | Self::Abort)
    }
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

/// Summary written with the `Prepared` marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareSummary {
    pub mode: TxnMode,
    pub op_count: u32,
}

/// Encode an operation as a `Staged` payload
pub fn encode_operation(op: &Operation) -> Result<Vec<u8>> {
    bincode::serialize(op).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a `Staged` payload
pub fn decode_operation(data: &[u8]) -> Result<Operation> {
    bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode a prepare summary as a `Prepared` payload
pub fn encode_summary(summary: &PrepareSummary) -> Result<Vec<u8>> {
    bincode::serialize(summary).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a `Prepared` payload
pub fn decode_summary(data: &[u8]) -> Result<PrepareSummary> {
    bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// Encode an `Applied` payload: how many leading operations are applied
pub fn encode_progress(applied: u32) -> Result<Vec<u8>> {
    bincode::serialize(&applied).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode an `Applied` payload
pub fn decode_progress(data: &[u8]) -> Result<u32> {
    bincode::deserialize(data).map_err(|e| Error::Serialization(e.to_string()))
}

/// WAL file header
#[derive(Debug, Clone, Copy)]
struct WalHeader {
    /// Lowest LSN the next record may carry
    base_lsn: Lsn,
    /// Highest transaction id ever logged before the retained records
    txn_floor: u64,
}

impl WalHeader {
    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&WAL_HEADER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&WAL_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.base_lsn.to_le_bytes());
        buf[16..24].copy_from_slice(&self.txn_floor.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::wal("WAL header too small"));
        }
        if le_u32(data, 0) != WAL_HEADER_MAGIC {
            return Err(Error::wal("invalid WAL header magic"));
        }
        let version = le_u32(data, 4);
        if version != WAL_VERSION {
            return Err(Error::wal(format!("unsupported WAL version: {version}")));
        }
        if crc32c::crc32c(&data[..24]) != le_u32(data, 24) {
            return Err(Error::wal("WAL header checksum mismatch"));
        }
        Ok(Self {
            base_lsn: le_u64(data, 8),
            txn_floor: le_u64(data, 16),
        })
    }
}

/// A WAL record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub kind: RecordKind,
    pub txn: TxnId,
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Serialize a record to bytes
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(RECORD_HEADER_SIZE + self.payload.len() + RECORD_TRAILER_SIZE);
        buf.extend_from_slice(&WAL_RECORD_MAGIC.to_le_bytes());
        buf.extend_from_slice(&self.lsn.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.txn.as_u64().to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.payload);

        // CRC over everything except the CRC itself
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Parse a record, returning it with its encoded size
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE {
            return Err(Error::wal("WAL record too small"));
        }
        if le_u32(data, 0) != WAL_RECORD_MAGIC {
            return Err(Error::wal("invalid WAL record magic"));
        }

        let lsn = le_u64(data, 4);
        let kind =
            RecordKind::from_u8(data[12]).ok_or_else(|| Error::wal("invalid WAL record kind"))?;
        let txn = TxnId::new(le_u64(data, 13));
        let len = le_u32(data, 21) as usize;

        let total = RECORD_HEADER_SIZE + len + RECORD_TRAILER_SIZE;
        if data.len() < total {
            return Err(Error::wal("WAL record truncated"));
        }
        let body_end = RECORD_HEADER_SIZE + len;
        if crc32c::crc32c(&data[..body_end]) != le_u32(data, body_end) {
            return Err(Error::wal("WAL record CRC mismatch"));
        }

        Ok((
            Self {
                lsn,
                kind,
                txn,
                payload: data[RECORD_HEADER_SIZE..body_end].to_vec(),
            },
            total,
        ))
    }
}

/// Everything the log knows about one transaction
#[derive(Debug, Clone)]
pub struct TxnLog {
    pub txn: TxnId,
    /// LSN of the first record of this transaction
    pub first_lsn: Lsn,
    /// Staged operations in stage order
    pub ops: Vec<Operation>,
    pub prepared: Option<PrepareSummary>,
    pub commit_lsn: Option<Lsn>,
    pub aborted: bool,
    /// Number of leading operations known to have reached storage
    pub applied: usize,
}

impl TxnLog {
    fn new(txn: TxnId, first_lsn: Lsn) -> Self {
        Self {
            txn,
            first_lsn,
            ops: Vec::new(),
            prepared: None,
            commit_lsn: None,
            aborted: false,
            applied: 0,
        }
    }

    /// Every staged operation reached storage
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.applied >= self.ops.len()
    }
}

/// Group records by transaction, ordered by first appearance
pub fn group_transactions(records: &[WalRecord]) -> Result<Vec<TxnLog>> {
    let mut index: HashMap<TxnId, usize> = HashMap::new();
    let mut txns: Vec<TxnLog> = Vec::new();

    for record in records {
        let slot = *index.entry(record.txn).or_insert_with(|| {
            txns.push(TxnLog::new(record.txn, record.lsn));
            txns.len() - 1
        });
        let txn = &mut txns[slot];
        match record.kind {
            RecordKind::Staged => txn.ops.push(decode_operation(&record.payload)?),
            RecordKind::Prepared => txn.prepared = Some(decode_summary(&record.payload)?),
            RecordKind::Commit => txn.commit_lsn = Some(record.lsn),
            RecordKind::Abort => txn.aborted = true,
            RecordKind::Applied => {
                let applied = decode_progress(&record.payload)? as usize;
                txn.applied = txn.applied.max(applied);
            }
        }
    }

    Ok(txns)
}

/// Contents of the unsynced-records marker
#[derive(Debug, Default, Serialize, Deserialize)]
struct UnsyncedMarker {
    /// First record not known to be durable; cleared once the log is cut
    from_lsn: Option<Lsn>,
    /// Transactions that lost records at the cut
    txns: Vec<TxnId>,
}

impl UnsyncedMarker {
    fn load(path: &Path) -> Result<Option<Self>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::wal(format!("failed to read {}: {e}", path.display()))),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| Error::wal(format!("corrupt marker {}: {e}", path.display())))
    }

    fn store(&self, path: &Path) -> std::io::Result<()> {
        let data = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("unsynced.new");
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)?;
        sync_dir(path);
        Ok(())
    }
}

fn sync_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Err(e) = File::open(parent).and_then(|dir| dir.sync_all())
    {
        warn!("Directory sync of {} failed: {e}", parent.display());
    }
}

/// Writer state guarded by the single-writer lock
struct WalWriter {
    file: File,
    next_lsn: Lsn,
    /// Highest transaction id seen in this log, including the header floor
    max_txn: u64,
    /// Current file size in bytes
    size: u64,
    /// First record written since the last successful sync
    unsynced_from: Option<Lsn>,
}

/// Write-ahead log for durability
pub struct WriteAheadLog {
    /// Log file path
    path: PathBuf,
    /// Single writer
    inner: Mutex<WalWriter>,
    /// Set after an fsync failure; the log refuses all further writes
    poisoned: AtomicBool,
    /// Transactions whose unsynced records were dropped at open
    unconfirmed: Vec<TxnId>,
    #[cfg(any(test, feature = "fault-injection"))]
    fail_next_sync: AtomicBool,
    /// Sync mode
    sync_mode: WalSyncMode,
}

impl WriteAheadLog {
    /// Open the log in `root`, creating it if needed
    ///
    /// A torn or corrupt tail (a crash mid-append) is cut off so that new
    /// records follow the last intact one.
    pub fn open(root: impl AsRef<Path>, sync_mode: WalSyncMode) -> Result<Self> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)
            .map_err(|e| Error::wal(format!("failed to create WAL dir {}: {e}", root.display())))?;
        let path = root.join(WAL_FILE_NAME);

        // A zero-length file is a crash during creation.
        let fresh = std::fs::metadata(&path).map_or(true, |m| m.len() == 0);
        if fresh {
            Self::write_fresh(&path, WalHeader { base_lsn: 1, txn_floor: 0 }, &[])?;
            info!("Created write-ahead log at {}", path.display());
        }

        let data = std::fs::read(&path)
            .map_err(|e| Error::wal(format!("failed to read WAL {}: {e}", path.display())))?;
        let header = WalHeader::from_bytes(&data)?;
        let (mut records, mut valid_len) = Self::scan(&data);

        if valid_len < data.len() {
            warn!(
                "Truncating {} bytes of torn WAL tail at offset {}",
                data.len() - valid_len,
                valid_len
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| Error::wal(format!("failed to open WAL: {e}")))?;
            file.set_len(valid_len as u64)
                .and_then(|()| file.sync_all())
                .map_err(|e| Error::wal(format!("failed to truncate torn WAL tail: {e}")))?;
        }

        let next_lsn = records
            .last()
            .map_or(header.base_lsn, |r| (r.lsn + 1).max(header.base_lsn));
        let max_txn = records
            .iter()
            .map(|r| r.txn.as_u64())
            .max()
            .unwrap_or(0)
            .max(header.txn_floor);

        let marker_path = root.join(UNSYNCED_FILE_NAME);
        let mut unconfirmed = Vec::new();
        if let Some(mut marker) = UnsyncedMarker::load(&marker_path)? {
            if let Some(from) = marker.from_lsn.take() {
                let (lost, kept): (Vec<WalRecord>, Vec<WalRecord>) =
                    records.into_iter().partition(|r| r.lsn >= from);
                for record in &lost {
                    if !marker.txns.contains(&record.txn) {
                        marker.txns.push(record.txn);
                    }
                }
                // The new base keeps dropped LSNs from being handed out again.
                let header = WalHeader {
                    base_lsn: next_lsn,
                    txn_floor: max_txn,
                };
                valid_len = usize::try_from(Self::replace_file(&path, header, &kept)?)
                    .map_err(|_| Error::wal("WAL size out of range"))?;
                records = kept;
                marker
                    .store(&marker_path)
                    .map_err(|e| Error::wal(format!("failed to update unsynced marker: {e}")))?;
                warn!(
                    "Dropped {} WAL records from lsn {from} whose fsync failed",
                    lost.len()
                );
            }
            unconfirmed = marker.txns;
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| Error::wal(format!("failed to open WAL: {e}")))?;

        info!(
            "Opened WAL at {}: records={}, next_lsn={}, size={}",
            path.display(),
            records.len(),
            next_lsn,
            valid_len
        );

        Ok(Self {
            path,
            inner: Mutex::new(WalWriter {
                file,
                next_lsn,
                max_txn,
                size: valid_len as u64,
                unsynced_from: None,
            }),
            poisoned: AtomicBool::new(false),
            unconfirmed,
            #[cfg(any(test, feature = "fault-injection"))]
            fail_next_sync: AtomicBool::new(false),
            sync_mode,
        })
    }

    /// Write a complete log file (header + records) and fsync it
    fn write_fresh(path: &Path, header: WalHeader, records: &[WalRecord]) -> Result<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::wal(format!("failed to create WAL {}: {e}", path.display())))?;
        let mut buf = header.to_bytes().to_vec();
        for record in records {
            buf.extend_from_slice(&record.to_bytes());
        }
        file.write_all(&buf)
            .map_err(|e| Error::wal(format!("failed to write WAL {}: {e}", path.display())))?;
        file.sync_all().map_err(|e| Error::WalSync(e.to_string()))?;
        Ok(buf.len() as u64)
    }

    /// Write a complete log file beside `path` and rename it into place
    fn replace_file(path: &Path, header: WalHeader, records: &[WalRecord]) -> Result<u64> {
        let new_path = path.with_extension("wal.new");
        let size = Self::write_fresh(&new_path, header, records)?;
        std::fs::rename(&new_path, path)
            .map_err(|e| Error::wal(format!("WAL rename failed: {e}")))?;
        sync_dir(path);
        Ok(size)
    }

    /// Parse records after the header, stopping at the first bad one
    fn scan(data: &[u8]) -> (Vec<WalRecord>, usize) {
        let mut records = Vec::new();
        let mut offset = HEADER_SIZE.min(data.len());
        while offset < data.len() {
            match WalRecord::from_bytes(&data[offset..]) {
                Ok((record, size)) => {
                    records.push(record);
                    offset += size;
                }
                Err(e) => {
                    debug!("WAL scan stopped at offset {offset}: {e}");
                    break;
                }
            }
        }
        (records, offset)
    }

    fn check_poisoned(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(Error::WalPoisoned);
        }
        Ok(())
    }

    fn poison(&self, cause: &std::io::Error) -> Error {
        error!("WAL fsync failed, refusing further writes: {cause}");
        self.poisoned.store(true, Ordering::Release);
        Error::WalSync(cause.to_string())
    }

    fn sync_locked(&self, inner: &mut WalWriter) -> Result<()> {
        #[cfg(any(test, feature = "fault-injection"))]
        let injected = self.fail_next_sync.swap(false, Ordering::AcqRel);
        #[cfg(not(any(test, feature = "fault-injection")))]
        let injected = false;

        let result = if injected {
            Err(std::io::Error::other("injected fsync failure"))
        } else {
            inner.file.sync_data()
        };
        match result {
            Ok(()) => {
                inner.unsynced_from = None;
                Ok(())
            }
            Err(e) => {
                let err = self.poison(&e);
                if let Some(from) = inner.unsynced_from {
                    self.mark_unsynced(from);
                }
                Err(err)
            }
        }
    }

    /// Note that records from `from` on may not be durable
    fn mark_unsynced(&self, from: Lsn) {
        let path = self.path.with_file_name(UNSYNCED_FILE_NAME);
        let mut marker = match UnsyncedMarker::load(&path) {
            Ok(marker) => marker.unwrap_or_default(),
            Err(e) => {
                warn!("Replacing unreadable unsynced marker: {e}");
                UnsyncedMarker::default()
            }
        };
        marker.from_lsn = Some(marker.from_lsn.map_or(from, |lsn| lsn.min(from)));
        match marker.store(&path) {
            Ok(()) => warn!("Records from lsn {from} will be dropped at the next open"),
            Err(e) => error!("Could not record unsynced WAL records from lsn {from}: {e}"),
        }
    }

    /// Make the next fsync fail after its record has been written
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn fail_next_sync(&self) {
        self.fail_next_sync.store(true, Ordering::Release);
    }

    /// Append a record, returning its position
    ///
    /// Decision markers are always fsynced before this returns; `Staged`
    /// and `Applied` records follow the configured sync mode.
    pub fn append(&self, kind: RecordKind, txn: TxnId, payload: Vec<u8>) -> Result<Lsn> {
        let sync = kind.is_decision() || self.sync_mode == WalSyncMode::Always;
        self.write_record(kind, txn, payload, sync)
    }

    /// Record that the first `applied` operations of `txn` reached storage
    ///
    /// A `durable` record is fsynced whatever the sync mode. Redo resumes
    /// after the last progress record, so progress must be durable before
    /// any later operation of the same transaction touches storage.
    pub fn append_progress(&self, txn: TxnId, applied: usize, durable: bool) -> Result<Lsn> {
        let applied = u32::try_from(applied)
            .map_err(|_| Error::wal(format!("{txn} applied count {applied} out of range")))?;
        let sync = durable || self.sync_mode == WalSyncMode::Always;
        self.write_record(RecordKind::Applied, txn, encode_progress(applied)?, sync)
    }

    fn write_record(
        &self,
        kind: RecordKind,
        txn: TxnId,
        payload: Vec<u8>,
        sync: bool,
    ) -> Result<Lsn> {
        self.check_poisoned()?;
        let mut inner = self.inner.lock();

        let record = WalRecord {
            lsn: inner.next_lsn,
            kind,
            txn,
            payload,
        };
        let bytes = record.to_bytes();

        if let Err(e) = inner.file.write_all(&bytes) {
            // Roll the file back so later records do not land behind garbage.
            if let Err(trunc) = inner.file.set_len(inner.size) {
                return Err(self.poison(&trunc));
            }
            return Err(Error::wal(format!("WAL append failed: {e}")));
        }

        inner.next_lsn += 1;
        inner.size += bytes.len() as u64;
        inner.max_txn = inner.max_txn.max(txn.as_u64());
        inner.unsynced_from.get_or_insert(record.lsn);

        if sync {
            self.sync_locked(&mut inner)?;
        }

        Ok(record.lsn)
    }

    /// Append a staged operation
    pub fn append_operation(&self, txn: TxnId, op: &Operation) -> Result<Lsn> {
        self.append(RecordKind::Staged, txn, encode_operation(op)?)
    }

    /// Sync the log to disk
    pub fn fsync(&self) -> Result<()> {
        self.check_poisoned()?;
        let mut inner = self.inner.lock();
        self.sync_locked(&mut inner)
    }

    /// Read every record since the last truncation point, in log order
    pub fn records(&self) -> Result<Vec<WalRecord>> {
        // Hold the writer lock so the snapshot ends on a record boundary.
        let inner = self.inner.lock();
        let data = std::fs::read(&self.path)
            .map_err(|e| Error::wal(format!("failed to read WAL for replay: {e}")))?;
        drop(inner);
        WalHeader::from_bytes(&data)?;
        Ok(Self::scan(&data).0)
    }

    /// Replay the log into per-transaction reconstructions
    pub fn replay(&self) -> Result<Vec<TxnLog>> {
        group_transactions(&self.records()?)
    }

    /// Discard every record with an LSN below `lsn`
    ///
    /// Callers must only pass a position before which every transaction is
    /// terminal and durably applied.
    pub fn truncate_before(&self, lsn: Lsn) -> Result<()> {
        self.check_poisoned()?;
        let mut inner = self.inner.lock();
        let data = std::fs::read(&self.path)
            .map_err(|e| Error::wal(format!("failed to read WAL for truncation: {e}")))?;
        let (records, _) = Self::scan(&data);
        let (dropped, kept): (Vec<WalRecord>, Vec<WalRecord>) =
            records.into_iter().partition(|r| r.lsn < lsn);
        if dropped.is_empty() {
            return Ok(());
        }

        let header = WalHeader {
            base_lsn: inner.next_lsn,
            txn_floor: inner.max_txn,
        };
        let size = Self::replace_file(&self.path, header, &kept)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::wal(format!("failed to reopen WAL: {e}")))?;
        inner.file = file;
        inner.size = size;

        info!(
            "Truncated WAL before lsn {}: dropped {} records, kept {}",
            lsn,
            dropped.len(),
            kept.len()
        );
        Ok(())
    }

    /// Position the next record will receive
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Highest transaction id ever written to this log
    pub fn max_txn_id(&self) -> u64 {
        self.inner.lock().max_txn
    }

    /// Current log size in bytes
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Transactions that lost unsynced records when the log was opened
    pub fn unconfirmed_txns(&self) -> &[TxnId] {
        &self.unconfirmed
    }

    /// Forget the unsynced marker once its transactions are resolved
    pub fn clear_unconfirmed(&self) -> Result<()> {
        let path = self.path.with_file_name(UNSYNCED_FILE_NAME);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                sync_dir(&path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::wal(format!("failed to remove {}: {e}", path.display()))),
        }
    }

    /// Check whether an fsync failure has disabled the log
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
