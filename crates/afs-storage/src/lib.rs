//! AFS Storage - on-disk store and write-ahead log
//!
//! This crate implements the durable half of the AFS engine:
//! - The write-ahead log, the single source of truth for recovery
//! - The storage layout manager mapping objects onto sharded share directories
//! - Idempotent application of staged operations to storage

pub mod layout;
pub mod wal;

// Re-exports
pub use layout::{HashShard, INSTANCE_MARKER, LAYOUT_VERSION, ShardFunction, StorageLayout};
pub use wal::{
    Lsn, PrepareSummary, RecordKind, TxnLog, UNSYNCED_FILE_NAME, WAL_FILE_NAME, WalRecord,
    WriteAheadLog,
};
