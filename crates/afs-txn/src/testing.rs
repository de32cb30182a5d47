//! Shared fixtures for the transaction tests

use crate::TransactionCoordinator;
use afs_common::config::{StorageConfig, WalSyncMode};
use afs_common::{ObjectPath, ObjectRef, Operation, OwnerId};
use afs_storage::{StorageLayout, WriteAheadLog};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

pub(crate) struct Harness {
    pub(crate) dir: TempDir,
    pub(crate) wal: Arc<WriteAheadLog>,
    pub(crate) layout: Arc<StorageLayout>,
    pub(crate) coordinator: Arc<TransactionCoordinator>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::open(tempdir().unwrap())
    }

    fn open(dir: TempDir) -> Self {
        let wal = Arc::new(
            WriteAheadLog::open(dir.path().join("wal"), WalSyncMode::Always).unwrap(),
        );
        let layout = Arc::new(
            StorageLayout::open(&StorageConfig {
                root: dir.path().join("store"),
                ..StorageConfig::default()
            })
            .unwrap(),
        );
        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::clone(&wal),
            Arc::clone(&layout),
        ));
        Self {
            dir,
            wal,
            layout,
            coordinator,
        }
    }

    /// Drop every handle and reopen over the same directories
    pub(crate) fn restart(self) -> Self {
        let Self { dir, .. } = self;
        Self::open(dir)
    }
}

pub(crate) fn obj(owner: &str, path: &str) -> ObjectRef {
    ObjectRef::new(OwnerId::new(owner).unwrap(), ObjectPath::new(path).unwrap())
}

pub(crate) fn write(object: ObjectRef, offset: u64, data: &[u8]) -> Operation {
    Operation::Write {
        object,
        offset,
        data: data.to_vec(),
    }
}
