//! Transactional connection
//!
//! A connection is bound to one transaction for its whole life. It keeps a
//! session-local staged view (object -> staged size, or removed) used to
//! validate each operation before it is logged, and to answer `list` and
//! `read` with this transaction's own uncommitted changes layered over the
//! committed state. Other sessions never see the view.

use crate::coordinator::TransactionCoordinator;
use afs_common::{
    Error, ObjectInfo, ObjectPath, ObjectRef, Operation, OwnerId, Result, TxnId, TxnMode, TxnState,
};
use afs_storage::StorageLayout;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;

/// Largest object size storage can represent (file offsets are signed)
const MAX_OBJECT_SIZE: u64 = i64::MAX as u64;

#[derive(Default)]
struct StagedView {
    /// Staged size per touched object; `None` marks an object removed by this transaction
    objects: HashMap<ObjectRef, Option<u64>>,
    /// Staged operations in stage order
    ops: Vec<Operation>,
}

/// Handle bound to a single transaction
pub struct TransactionalConnection {
    coordinator: Arc<TransactionCoordinator>,
    txn: TxnId,
    mode: TxnMode,
    view: Mutex<StagedView>,
}

impl TransactionalConnection {
    /// Begin a new transaction
    pub fn begin(
        coordinator: Arc<TransactionCoordinator>,
        mode: TxnMode,
        explicit: Option<TxnId>,
    ) -> Result<Self> {
        let txn = coordinator.begin(mode, explicit)?;
        Ok(Self {
            coordinator,
            txn,
            mode,
            view: Mutex::new(StagedView::default()),
        })
    }

    pub const fn txn_id(&self) -> TxnId {
        self.txn
    }

    pub const fn mode(&self) -> TxnMode {
        self.mode
    }

    pub fn state(&self) -> Option<TxnState> {
        self.coordinator.state(self.txn)
    }

    /// Number of operations staged through this connection
    pub fn operation_count(&self) -> usize {
        self.view.lock().ops.len()
    }

    fn layout(&self) -> &StorageLayout {
        self.coordinator.layout()
    }

    /// Size of an object as this transaction sees it
    fn staged_size(&self, view: &StagedView, object: &ObjectRef) -> Result<Option<u64>> {
        match view.objects.get(object) {
            Some(size) => Ok(*size),
            None => match self.layout().size_of(object) {
                // Below a committed file; placement checks decide the rest.
                Err(Error::PathConflict { .. }) => Ok(None),
                other => other,
            },
        }
    }

    fn missing(view: &StagedView, object: &ObjectRef) -> Error {
        if matches!(view.objects.get(object), Some(None)) {
            Error::ObjectDeleted(object.clone())
        } else {
            Error::ObjectNotFound(object.clone())
        }
    }

    /// Refuse a new object where storage needs a directory, or below a file
    fn check_placement(&self, view: &StagedView, target: &ObjectRef) -> Result<()> {
        for ancestor in target.path.ancestors() {
            let parent = ObjectRef::new(target.owner.clone(), ancestor);
            if self.staged_size(view, &parent)?.is_some() {
                return Err(Error::PathConflict {
                    object: target.clone(),
                    reason: "a parent directory is a file",
                });
            }
        }

        let staged_below = view.objects.iter().any(|(object, size)| {
            size.is_some()
                && object.owner == target.owner
                && target.path.is_ancestor_of(&object.path)
        });
        let committed_below = || -> Result<bool> {
            Ok(self
                .layout()
                .descendants(target)?
                .iter()
                .any(|object| !matches!(view.objects.get(object), Some(None))))
        };
        if staged_below || committed_below()? {
            return Err(Error::PathConflict {
                object: target.clone(),
                reason: "the path is a directory",
            });
        }
        Ok(())
    }

    /// Validate an operation and compute its effect on the staged view
    fn plan(&self, view: &StagedView, op: &Operation) -> Result<Vec<(ObjectRef, Option<u64>)>> {
        match op {
            Operation::Create { object } => {
                if self.staged_size(view, object)?.is_some() {
                    return Err(Error::ObjectAlreadyExists(object.clone()));
                }
                self.check_placement(view, object)?;
                Ok(vec![(object.clone(), Some(0))])
            }
            Operation::Write {
                object,
                offset,
                data,
            } => {
                if matches!(view.objects.get(object), Some(None)) {
                    return Err(Error::ObjectDeleted(object.clone()));
                }
                let end = offset
                    .checked_add(data.len() as u64)
                    .filter(|end| *end <= MAX_OBJECT_SIZE)
                    .ok_or_else(|| Error::OffsetTooLarge(object.clone()))?;
                let size = match self.staged_size(view, object)? {
                    Some(size) => size.max(end),
                    None => {
                        self.check_placement(view, object)?;
                        end
                    }
                };
                Ok(vec![(object.clone(), Some(size))])
            }
            Operation::Copy { source, target } | Operation::Move { source, target } => {
                if source == target {
                    return Err(Error::invalid_operation(format!(
                        "{} source and target are both {source}",
                        op.kind()
                    )));
                }
                let size = self
                    .staged_size(view, source)?
                    .ok_or_else(|| Self::missing(view, source))?;
                if self.staged_size(view, target)?.is_some() {
                    return Err(Error::ObjectAlreadyExists(target.clone()));
                }
                self.check_placement(view, target)?;
                let mut effect = vec![(target.clone(), Some(size))];
                if matches!(op, Operation::Move { .. }) {
                    effect.push((source.clone(), None));
                }
                Ok(effect)
            }
            Operation::Delete { object } => {
                if self.staged_size(view, object)?.is_none() {
                    return Err(Self::missing(view, object));
                }
                Ok(vec![(object.clone(), None)])
            }
        }
    }

    /// Validate and log an operation
    ///
    /// A rejected operation leaves the transaction ACTIVE and unchanged; a
    /// log failure aborts it.
    pub fn stage(&self, op: Operation) -> Result<()> {
        let mut view = self.view.lock();
        let effect = self.plan(&view, &op)?;
        self.coordinator.stage(self.txn, op.clone())?;
        for (object, size) in effect {
            view.objects.insert(object, size);
        }
        view.ops.push(op);
        Ok(())
    }

    pub fn create(&self, object: ObjectRef) -> Result<()> {
        self.stage(Operation::Create { object })
    }

    pub fn write(&self, object: ObjectRef, offset: u64, data: Vec<u8>) -> Result<()> {
        self.stage(Operation::Write {
            object,
            offset,
            data,
        })
    }

    pub fn copy(&self, source: ObjectRef, target: ObjectRef) -> Result<()> {
        self.stage(Operation::Copy { source, target })
    }

    pub fn move_object(&self, source: ObjectRef, target: ObjectRef) -> Result<()> {
        self.stage(Operation::Move { source, target })
    }

    pub fn delete(&self, object: ObjectRef) -> Result<()> {
        self.stage(Operation::Delete { object })
    }

    /// Vote on the staged set (first phase)
    pub fn prepare(&self) -> Result<()> {
        self.coordinator.prepare(self.txn)
    }

    /// Commit the transaction
    ///
    /// In one-phase mode an ACTIVE transaction is prepared first; a
    /// coordinated transaction must have been prepared explicitly.
    pub fn commit(&self) -> Result<()> {
        if self.mode == TxnMode::OnePhase && self.state() == Some(TxnState::Active) {
            self.coordinator.prepare(self.txn)?;
        }
        self.coordinator.commit(self.txn)?;
        *self.view.lock() = StagedView::default();
        Ok(())
    }

    /// Roll the transaction back
    pub fn rollback(&self) -> Result<()> {
        self.coordinator.rollback(self.txn)?;
        *self.view.lock() = StagedView::default();
        Ok(())
    }

    /// Check whether an object exists as this transaction sees it
    pub fn exists(&self, object: &ObjectRef) -> Result<bool> {
        let view = self.view.lock();
        Ok(self.staged_size(&view, object)?.is_some())
    }

    /// Objects of `owner`: committed state plus this transaction's changes
    pub fn list(&self, owner: &OwnerId) -> Result<Vec<ObjectInfo>> {
        let view = self.view.lock();
        let mut listing: BTreeMap<ObjectPath, u64> = self
            .layout()
            .list(owner)?
            .into_iter()
            .map(|info| (info.path, info.size))
            .collect();

        for (object, size) in view.objects.iter().filter(|(o, _)| &o.owner == owner) {
            match size {
                Some(size) => listing.insert(object.path.clone(), *size),
                None => listing.remove(&object.path),
            };
        }

        Ok(listing
            .into_iter()
            .map(|(path, size)| ObjectInfo { path, size })
            .collect())
    }

    /// Read up to `len` bytes at `offset`, seeing this transaction's writes
    pub fn read(&self, object: &ObjectRef, offset: u64, len: u64) -> Result<Vec<u8>> {
        let view = self.view.lock();
        match view.objects.get(object) {
            None => self.layout().read(object, offset, len),
            Some(None) => Err(Error::ObjectDeleted(object.clone())),
            Some(Some(_)) => self
                .materialize(&view, object, offset..offset.saturating_add(len))?
                .ok_or_else(|| Error::ObjectNotFound(object.clone())),
        }
    }

    /// Replay the staged operations in memory over committed contents
    ///
    /// Only the bytes inside `range` are ever held, for every object the
    /// staged operations touch.
    fn materialize(
        &self,
        view: &StagedView,
        object: &ObjectRef,
        range: Range<u64>,
    ) -> Result<Option<Vec<u8>>> {
        let layout = self.layout();
        let mut windows: HashMap<&ObjectRef, Option<Window>> = HashMap::new();

        for op in &view.ops {
            for touched in op.objects() {
                if let Entry::Vacant(slot) = windows.entry(touched) {
                    slot.insert(Window::committed(layout, touched, &range)?);
                }
            }
            match op {
                Operation::Create { object } => {
                    if let Some(slot) = windows.get_mut(object) {
                        slot.get_or_insert_with(Window::default);
                    }
                }
                Operation::Write {
                    object,
                    offset,
                    data,
                } => {
                    if let Some(slot) = windows.get_mut(object) {
                        slot.get_or_insert_with(Window::default)
                            .write(&range, *offset, data);
                    }
                }
                Operation::Copy { source, target } => {
                    let copied = windows.get(source).cloned().flatten();
                    windows.insert(target, copied);
                }
                Operation::Move { source, target } => {
                    let moved = windows.get_mut(source).and_then(Option::take);
                    windows.insert(target, moved);
                }
                Operation::Delete { object } => {
                    windows.insert(object, None);
                }
            }
        }

        debug!("Materialized {object} from {} staged operations", view.ops.len());
        match windows.remove(object) {
            Some(window) => Ok(window.map(|w| w.bytes)),
            None => Ok(Window::committed(layout, object, &range)?.map(|w| w.bytes)),
        }
    }
}

/// Bytes of one object that fall inside a read window
#[derive(Clone, Default)]
struct Window {
    /// Full object size
    size: u64,
    /// Contents of `range.start..min(size, range.end)`
    bytes: Vec<u8>,
}

impl Window {
    fn committed(
        layout: &StorageLayout,
        object: &ObjectRef,
        range: &Range<u64>,
    ) -> Result<Option<Self>> {
        let Some(size) = layout.size_of(object)? else {
            return Ok(None);
        };
        let bytes = layout.read(object, range.start, range.end - range.start)?;
        Ok(Some(Self { size, bytes }))
    }

    fn write(&mut self, range: &Range<u64>, offset: u64, data: &[u8]) {
        let end = offset.saturating_add(data.len() as u64);
        self.size = self.size.max(end);
        let visible = self.size.min(range.end).saturating_sub(range.start);
        self.bytes.resize(index(visible), 0);

        let lo = offset.max(range.start);
        let hi = end.min(range.end);
        if lo < hi {
            let src = index(lo - offset)..index(hi - offset);
            let dst = index(lo - range.start)..index(hi - range.start);
            self.bytes[dst].copy_from_slice(&data[src]);
        }
    }
}

/// Positions inside a window are bounded by the window length
fn index(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Harness, obj};

    fn begin(h: &Harness, mode: TxnMode) -> TransactionalConnection {
        TransactionalConnection::begin(Arc::clone(&h.coordinator), mode, None).unwrap()
    }

    fn paths(listing: &[ObjectInfo]) -> Vec<&str> {
        listing.iter().map(|o| o.path.as_str()).collect()
    }

    #[test]
    fn test_helloworld() {
        let h = Harness::new();
        let conn = begin(&h, TxnMode::OnePhase);
        let a = obj("ownerA", "greeting");
        conn.write(a.clone(), 0, b"hello".to_vec()).unwrap();
        conn.write(a.clone(), 5, b"world".to_vec()).unwrap();
        conn.commit().unwrap();

        assert_eq!(conn.state(), Some(TxnState::Committed));
        let listing = h.layout.list(&a.owner).unwrap();
        assert_eq!(paths(&listing), vec!["greeting"]);
        assert_eq!(listing[0].size, 10);
        assert_eq!(h.layout.read(&a, 0, 100).unwrap(), b"helloworld");
    }

    #[test]
    fn test_create_then_delete_commits_cleanly() {
        let h = Harness::new();
        let conn = begin(&h, TxnMode::OnePhase);
        let b = obj("ownerB", "file");
        conn.create(b.clone()).unwrap();
        conn.delete(b.clone()).unwrap();
        conn.commit().unwrap();

        assert_eq!(conn.state(), Some(TxnState::Committed));
        assert!(!h.layout.exists(&b).unwrap());
        assert!(h.layout.share_of(&b.owner).unwrap().is_none());
    }

    #[test]
    fn test_validation_errors_leave_transaction_active() {
        let h = Harness::new();
        let conn = begin(&h, TxnMode::OnePhase);
        let a = obj("A", "x");

        assert!(matches!(
            conn.delete(a.clone()),
            Err(Error::ObjectNotFound(_))
        ));
        conn.create(a.clone()).unwrap();
        assert!(matches!(
            conn.create(a.clone()),
            Err(Error::ObjectAlreadyExists(_))
        ));
        conn.delete(a.clone()).unwrap();

        // Writing to an object this transaction deleted is rejected.
        let err = conn.write(a.clone(), 0, b"late".to_vec()).unwrap_err();
        assert!(matches!(err, Error::ObjectDeleted(_)));
        assert!(err.is_user());

        assert!(matches!(
            conn.copy(obj("A", "y"), obj("A", "y")),
            Err(Error::InvalidOperation(_))
        ));

        assert_eq!(conn.state(), Some(TxnState::Active));
        assert_eq!(conn.operation_count(), 2);
        conn.rollback().unwrap();
    }

    #[test]
    fn test_copy_and_move_rules() {
        let h = Harness::new();
        h.layout
            .apply(&Operation::Write {
                object: obj("A", "src"),
                offset: 0,
                data: b"payload".to_vec(),
            })
            .unwrap();
        h.layout
            .apply(&Operation::Create {
                object: obj("A", "taken"),
            })
            .unwrap();

        let conn = begin(&h, TxnMode::OnePhase);
        assert!(matches!(
            conn.copy(obj("A", "src"), obj("A", "taken")),
            Err(Error::ObjectAlreadyExists(_))
        ));
        assert!(matches!(
            conn.move_object(obj("A", "nothing"), obj("A", "dst")),
            Err(Error::ObjectNotFound(_))
        ));

        conn.move_object(obj("A", "src"), obj("B", "dst")).unwrap();
        // The source is gone for this transaction only.
        assert!(!conn.exists(&obj("A", "src")).unwrap());
        assert!(h.layout.exists(&obj("A", "src")).unwrap());
        assert!(matches!(
            conn.copy(obj("A", "src"), obj("A", "again")),
            Err(Error::ObjectDeleted(_))
        ));
        conn.copy(obj("B", "dst"), obj("B", "dup")).unwrap();
        conn.commit().unwrap();

        assert!(!h.layout.exists(&obj("A", "src")).unwrap());
        assert_eq!(h.layout.read_all(&obj("B", "dst")).unwrap().unwrap(), b"payload");
        assert_eq!(h.layout.read_all(&obj("B", "dup")).unwrap().unwrap(), b"payload");
    }

    #[test]
    fn test_read_your_writes_is_session_local() {
        let h = Harness::new();
        h.layout
            .apply(&Operation::Write {
                object: obj("A", "base"),
                offset: 0,
                data: b"0123456789".to_vec(),
            })
            .unwrap();

        let mine = begin(&h, TxnMode::OnePhase);
        let other = begin(&h, TxnMode::OnePhase);

        mine.write(obj("A", "base"), 2, b"XY".to_vec()).unwrap();
        mine.write(obj("A", "new"), 0, b"fresh".to_vec()).unwrap();
        mine.copy(obj("A", "new"), obj("A", "copy")).unwrap();
        let owner = obj("A", "base").owner;

        assert_eq!(paths(&mine.list(&owner).unwrap()), vec!["base", "copy", "new"]);
        assert_eq!(mine.read(&obj("A", "base"), 0, 4).unwrap(), b"01XY");
        assert_eq!(mine.read(&obj("A", "copy"), 1, 100).unwrap(), b"resh");
        assert_eq!(mine.read(&obj("A", "new"), 50, 10).unwrap(), b"");

        // The other session sees committed state only.
        assert_eq!(paths(&other.list(&owner).unwrap()), vec!["base"]);
        assert_eq!(other.read(&obj("A", "base"), 0, 4).unwrap(), b"0123");
        assert!(matches!(
            other.read(&obj("A", "new"), 0, 4),
            Err(Error::ObjectNotFound(_))
        ));

        mine.rollback().unwrap();
        other.rollback().unwrap();
        assert_eq!(h.layout.read_all(&obj("A", "base")).unwrap().unwrap(), b"0123456789");
        assert!(!h.layout.exists(&obj("A", "new")).unwrap());
    }

    #[test]
    fn test_listing_hides_deleted_and_moved() {
        let h = Harness::new();
        for name in ["a", "b", "c"] {
            h.layout
                .apply(&Operation::Create {
                    object: obj("O", name),
                })
                .unwrap();
        }
        let conn = begin(&h, TxnMode::OnePhase);
        conn.delete(obj("O", "a")).unwrap();
        conn.move_object(obj("O", "b"), obj("O", "sub/b")).unwrap();
        assert!(matches!(
            conn.read(&obj("O", "a"), 0, 1),
            Err(Error::ObjectDeleted(_))
        ));

        let owner = obj("O", "a").owner;
        assert_eq!(paths(&conn.list(&owner).unwrap()), vec!["c", "sub/b"]);
        conn.commit().unwrap();
        assert_eq!(paths(&h.layout.list(&owner).unwrap()), vec!["c", "sub/b"]);
    }

    #[test]
    fn test_path_conflicts_are_rejected_at_staging() {
        let h = Harness::new();
        h.layout
            .apply(&Operation::Write {
                object: obj("A", "d/f"),
                offset: 0,
                data: b"nested".to_vec(),
            })
            .unwrap();
        h.layout
            .apply(&Operation::Create {
                object: obj("A", "f"),
            })
            .unwrap();

        let conn = begin(&h, TxnMode::OnePhase);
        for err in [
            conn.create(obj("A", "d")).unwrap_err(),
            conn.write(obj("A", "d"), 0, b"x".to_vec()).unwrap_err(),
            conn.create(obj("A", "f/g")).unwrap_err(),
            conn.copy(obj("A", "f"), obj("A", "d")).unwrap_err(),
        ] {
            assert!(matches!(err, Error::PathConflict { .. }), "{err:?}");
            assert!(err.is_user());
        }

        // Conflicts between two staged objects of the same transaction.
        conn.create(obj("A", "a")).unwrap();
        assert!(matches!(
            conn.create(obj("A", "a/b")),
            Err(Error::PathConflict { .. })
        ));
        conn.create(obj("A", "c/d")).unwrap();
        assert!(matches!(
            conn.create(obj("A", "c")),
            Err(Error::PathConflict { .. })
        ));

        // Removing what was in the way frees the path.
        conn.delete(obj("A", "d/f")).unwrap();
        conn.create(obj("A", "d")).unwrap();
        conn.delete(obj("A", "f")).unwrap();
        conn.create(obj("A", "f/g")).unwrap();

        assert_eq!(conn.state(), Some(TxnState::Active));
        assert_eq!(conn.operation_count(), 6);
        conn.commit().unwrap();
        assert_eq!(conn.state(), Some(TxnState::Committed));

        let owner = obj("A", "x").owner;
        assert_eq!(
            paths(&h.layout.list(&owner).unwrap()),
            vec!["a", "c/d", "d", "f/g"]
        );
    }

    #[test]
    fn test_write_offset_limit() {
        let h = Harness::new();
        let conn = begin(&h, TxnMode::OnePhase);
        for offset in [1u64 << 63, u64::MAX, i64::MAX as u64] {
            let err = conn.write(obj("A", "x"), offset, b"z".to_vec()).unwrap_err();
            assert!(matches!(err, Error::OffsetTooLarge(_)), "{err:?}");
            assert!(err.is_user());
        }
        assert_eq!(conn.state(), Some(TxnState::Active));
        assert_eq!(conn.operation_count(), 0);
    }

    #[test]
    fn test_read_window_after_far_write() {
        let h = Harness::new();
        let conn = begin(&h, TxnMode::OnePhase);
        let far = 1u64 << 40;
        conn.write(obj("A", "sparse"), far, b"tail".to_vec()).unwrap();
        conn.copy(obj("A", "sparse"), obj("A", "twin")).unwrap();

        assert_eq!(conn.read(&obj("A", "sparse"), 0, 4).unwrap(), vec![0; 4]);
        assert_eq!(
            conn.read(&obj("A", "sparse"), far - 2, 8).unwrap(),
            b"\0\0tail"
        );
        assert_eq!(conn.read(&obj("A", "twin"), far + 1, 100).unwrap(), b"ail");
        assert_eq!(conn.read(&obj("A", "twin"), far + 10, 100).unwrap(), b"");
        conn.rollback().unwrap();
    }

    #[test]
    fn test_two_phase_commit_needs_prepare() {
        let h = Harness::new();
        let conn = begin(&h, TxnMode::TwoPhase);
        conn.create(obj("A", "x")).unwrap();
        assert!(matches!(conn.commit(), Err(Error::IllegalState { .. })));
        conn.prepare().unwrap();
        assert!(matches!(
            conn.create(obj("A", "y")),
            Err(Error::IllegalState { .. })
        ));
        conn.commit().unwrap();
        assert!(h.layout.exists(&obj("A", "x")).unwrap());
    }

    #[test]
    fn test_atomicity_over_many_operations() {
        let h = Harness::new();
        let committed = begin(&h, TxnMode::OnePhase);
        let aborted = begin(&h, TxnMode::OnePhase);
        for i in 0..20 {
            committed
                .write(obj("C", &format!("f{i}")), 0, vec![1; 8])
                .unwrap();
            aborted
                .write(obj("D", &format!("f{i}")), 0, vec![2; 8])
                .unwrap();
        }
        committed.commit().unwrap();
        aborted.rollback().unwrap();

        assert_eq!(h.layout.list(&obj("C", "x").owner).unwrap().len(), 20);
        assert!(h.layout.list(&obj("D", "x").owner).unwrap().is_empty());
    }
}
