//! Transaction coordinator (two-phase commit participant)
//!
//! ```text
//! Active --prepare--> Preparing --> Prepared --commit--> Committing --> Committed
//!   |                     |             |
//!   +------rollback-------+-------------+--> Aborting --> Aborted
//! ```
//!
//! Every state change that must survive a crash is a WAL marker:
//! - `prepare` writes and fsyncs a `Prepared` summary of the staged set
//! - `commit` fsyncs a `Commit` mark *before* touching storage, then applies
//!   the staged operations in stage order under per-owner locks, appending
//!   an `Applied` progress record after each one
//! - `rollback` fsyncs an `Abort` mark; staged operations never reach storage
//!
//! A `Commit` mark whose fsync failed is never trusted. The transaction stays
//! PREPARED with its outcome unconfirmed until restart: it can be neither
//! rolled back nor expired here, and the next recovery aborts it.
//!
//! A coordinated (two-phase) transaction is never committed without an
//! explicit `commit` call. Prepared transactions whose coordinator stays
//! silent are rolled back by `expire_in_doubt`.

use crate::hooks::PostCommitHook;
use crate::locks::OwnerLocks;
use afs_common::{Error, Operation, Result, TxnId, TxnMode, TxnState};
use afs_storage::wal::{PrepareSummary, RecordKind, encode_summary};
use afs_storage::{Lsn, StorageLayout, WriteAheadLog};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Number of resolved transaction outcomes remembered after a checkpoint
const RESOLVED_HISTORY: usize = 65_536;

/// In-memory view of one live transaction
pub(crate) struct TxnEntry {
    pub(crate) mode: TxnMode,
    pub(crate) state: TxnState,
    /// Staged operations in stage order
    pub(crate) ops: Vec<Operation>,
    /// LSN of the first record this transaction wrote
    pub(crate) first_lsn: Option<Lsn>,
    /// When the transaction became PREPARED (or was recovered as such)
    pub(crate) prepared_at: Option<Instant>,
    /// LSN of the durable commit mark
    pub(crate) commit_lsn: Option<Lsn>,
    /// Leading operations already applied to storage
    pub(crate) applied: usize,
    /// The commit mark was written but its fsync failed
    pub(crate) commit_unconfirmed: bool,
}

impl TxnEntry {
    pub(crate) const fn new(mode: TxnMode) -> Self {
        Self {
            mode,
            state: TxnState::Active,
            ops: Vec::new(),
            first_lsn: None,
            prepared_at: None,
            commit_lsn: None,
            applied: 0,
            commit_unconfirmed: false,
        }
    }
}

/// Outcomes of transactions dropped from the live table by a checkpoint
#[derive(Default)]
struct ResolvedLog {
    order: VecDeque<TxnId>,
    states: HashMap<TxnId, TxnState>,
}

impl ResolvedLog {
    fn insert(&mut self, txn: TxnId, state: TxnState) {
        if self.states.insert(txn, state).is_none() {
            self.order.push_back(txn);
        }
        while self.order.len() > RESOLVED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }
}

/// Summary of a transaction awaiting its coordinator's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InDoubtTxn {
    pub txn: TxnId,
    pub mode: TxnMode,
    pub op_count: usize,
    /// Time spent PREPARED so far
    pub prepared_for: Duration,
    /// A commit mark may be in the log; only a restart settles the outcome
    pub commit_unconfirmed: bool,
}

/// Two-phase commit participant shared by every session worker
pub struct TransactionCoordinator {
    wal: Arc<WriteAheadLog>,
    layout: Arc<StorageLayout>,
    pub(crate) txns: Mutex<HashMap<TxnId, Arc<Mutex<TxnEntry>>>>,
    resolved: Mutex<ResolvedLog>,
    pub(crate) next_txn: AtomicU64,
    locks: OwnerLocks,
    hooks: RwLock<Vec<Arc<dyn PostCommitHook>>>,
}

impl TransactionCoordinator {
    /// Create a coordinator over an opened log and storage layout
    ///
    /// Call [`recover`](Self::recover) before admitting any transaction.
    pub fn new(wal: Arc<WriteAheadLog>, layout: Arc<StorageLayout>) -> Self {
        let next_txn = wal.max_txn_id() + 1;
        Self {
            wal,
            layout,
            txns: Mutex::new(HashMap::new()),
            resolved: Mutex::new(ResolvedLog::default()),
            next_txn: AtomicU64::new(next_txn),
            locks: OwnerLocks::new(),
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn layout(&self) -> &Arc<StorageLayout> {
        &self.layout
    }

    /// Register a hook to run after every commit
    pub fn add_hook(&self, hook: Arc<dyn PostCommitHook>) {
        info!("Registered post-commit hook {}", hook.name());
        self.hooks.write().push(hook);
    }

    fn entry(&self, txn: TxnId) -> Option<Arc<Mutex<TxnEntry>>> {
        self.txns.lock().get(&txn).cloned()
    }

    /// Answer a lifecycle call for a transaction no longer in the live table
    fn resolved_outcome(&self, txn: TxnId, wanted: TxnState, action: &'static str) -> Result<()> {
        match self.resolved.lock().states.get(&txn) {
            Some(&state) if state == wanted => Ok(()),
            Some(&state) => Err(Error::IllegalState { txn, state, action }),
            None => Err(Error::TransactionNotFound(txn)),
        }
    }

    /// Start a transaction
    ///
    /// Coordinated callers may supply their own id; an id the coordinator
    /// still knows about is rejected.
    pub fn begin(&self, mode: TxnMode, explicit: Option<TxnId>) -> Result<TxnId> {
        let mut txns = self.txns.lock();
        let txn = match explicit {
            Some(txn) => {
                if txn.as_u64() == 0 {
                    return Err(Error::invalid_operation("transaction id 0 is reserved"));
                }
                if txns.contains_key(&txn) || self.resolved.lock().states.contains_key(&txn) {
                    return Err(Error::TransactionExists(txn));
                }
                self.next_txn.fetch_max(txn.as_u64() + 1, Ordering::SeqCst);
                txn
            }
            None => TxnId::new(self.next_txn.fetch_add(1, Ordering::SeqCst)),
        };
        txns.insert(txn, Arc::new(Mutex::new(TxnEntry::new(mode))));
        debug!("Began {txn} ({mode})");
        Ok(txn)
    }

    /// Current state of a transaction, if known
    pub fn state(&self, txn: TxnId) -> Option<TxnState> {
        match self.entry(txn) {
            Some(entry) => Some(entry.lock().state),
            None => self.resolved.lock().states.get(&txn).copied(),
        }
    }

    /// Mode of a live transaction
    pub fn mode(&self, txn: TxnId) -> Option<TxnMode> {
        self.entry(txn).map(|entry| entry.lock().mode)
    }

    /// Staged operations of a live transaction
    pub fn operations(&self, txn: TxnId) -> Option<Vec<Operation>> {
        self.entry(txn).map(|entry| entry.lock().ops.clone())
    }

    /// Number of transactions in the live table
    pub fn live_count(&self) -> usize {
        self.txns.lock().len()
    }

    /// Log an operation into an ACTIVE transaction
    ///
    /// The operation must already be validated against the caller's staged
    /// view. A log failure aborts the transaction.
    pub fn stage(&self, txn: TxnId, op: Operation) -> Result<Lsn> {
        let handle = self.entry(txn).ok_or(Error::TransactionNotFound(txn))?;
        let mut entry = handle.lock();
        if entry.state != TxnState::Active {
            return Err(Error::IllegalState {
                txn,
                state: entry.state,
                action: "stage",
            });
        }

        match self.wal.append_operation(txn, &op) {
            Ok(lsn) => {
                entry.first_lsn.get_or_insert(lsn);
                debug!("Staged {} into {txn} at lsn {lsn}", op.kind());
                entry.ops.push(op);
                Ok(lsn)
            }
            Err(e) => {
                warn!("Staging into {txn} failed, aborting: {e}");
                if let Err(abort) = self.abort_locked(txn, &mut entry) {
                    error!("Abort of {txn} after failed staging: {abort}");
                }
                Err(e)
            }
        }
    }

    /// Make the staged set durable and vote yes
    ///
    /// Preparing an already PREPARED transaction succeeds again so that a
    /// coordinator may retry.
    pub fn prepare(&self, txn: TxnId) -> Result<()> {
        let Some(handle) = self.entry(txn) else {
            return self.resolved_outcome(txn, TxnState::Prepared, "prepare");
        };
        let mut entry = handle.lock();
        match entry.state {
            TxnState::Prepared => return Ok(()),
            TxnState::Active => {}
            state => {
                return Err(Error::IllegalState {
                    txn,
                    state,
                    action: "prepare",
                });
            }
        }

        entry.state = TxnState::Preparing;
        let summary = PrepareSummary {
            mode: entry.mode,
            op_count: u32::try_from(entry.ops.len()).unwrap_or(u32::MAX),
        };
        let result = encode_summary(&summary)
            .and_then(|payload| self.wal.append(RecordKind::Prepared, txn, payload));

        match result {
            Ok(lsn) => {
                entry.first_lsn.get_or_insert(lsn);
                entry.state = TxnState::Prepared;
                entry.prepared_at = Some(Instant::now());
                info!("Prepared {txn}: {} operations", entry.ops.len());
                Ok(())
            }
            Err(e) => {
                warn!("Prepare of {txn} failed, aborting: {e}");
                if let Err(abort) = self.abort_locked(txn, &mut entry) {
                    error!("Abort of {txn} after failed prepare: {abort}");
                }
                Err(e)
            }
        }
    }

    /// Commit a PREPARED transaction
    ///
    /// Once the commit mark is durable the transaction can only move
    /// forward: an apply failure leaves it COMMITTING and a retried commit
    /// re-applies. Committing an already COMMITTED transaction succeeds.
    pub fn commit(&self, txn: TxnId) -> Result<()> {
        let Some(handle) = self.entry(txn) else {
            return self.resolved_outcome(txn, TxnState::Committed, "commit");
        };
        let mut entry = handle.lock();
        match entry.state {
            TxnState::Committed => return Ok(()),
            TxnState::Prepared => {
                entry.state = TxnState::Committing;
                match self.wal.append(RecordKind::Commit, txn, Vec::new()) {
                    Ok(lsn) => entry.commit_lsn = Some(lsn),
                    Err(e) => {
                        entry.state = TxnState::Prepared;
                        if e.is_fatal() {
                            error!("Commit mark for {txn} may not be durable: {e}");
                            entry.commit_unconfirmed = true;
                        } else {
                            warn!("Commit mark for {txn} failed, still prepared: {e}");
                        }
                        return Err(e);
                    }
                }
            }
            TxnState::Committing => info!("Retrying apply of {txn}"),
            state => {
                return Err(Error::IllegalState {
                    txn,
                    state,
                    action: "commit",
                });
            }
        }

        {
            let TxnEntry { ops, applied, .. } = &mut *entry;
            self.apply_committed(txn, ops, applied)?;
        }

        entry.state = TxnState::Committed;
        entry.prepared_at = None;
        let ops = std::mem::take(&mut entry.ops);
        drop(entry);

        info!("Committed {txn}: {} operations", ops.len());
        self.run_hooks(txn, &ops);
        Ok(())
    }

    /// Roll back a transaction that has not started committing
    ///
    /// Never waits on anything external. Rolling back an already ABORTED
    /// transaction succeeds; a COMMITTING or COMMITTED one is refused. A
    /// PREPARED transaction is only reported ABORTED once its abort mark is
    /// durable.
    pub fn rollback(&self, txn: TxnId) -> Result<()> {
        let Some(handle) = self.entry(txn) else {
            return self.resolved_outcome(txn, TxnState::Aborted, "rollback");
        };
        let mut entry = handle.lock();
        match entry.state {
            TxnState::Aborted => Ok(()),
            _ if entry.commit_unconfirmed => {
                error!("Refusing to roll back {txn}: its commit mark may be in the log");
                Err(Error::WalPoisoned)
            }
            TxnState::Active | TxnState::Preparing | TxnState::Prepared | TxnState::Aborting => {
                self.abort_locked(txn, &mut entry)?;
                info!("Rolled back {txn}");
                Ok(())
            }
            state => Err(Error::IllegalState {
                txn,
                state,
                action: "rollback",
            }),
        }
    }

    /// Drive an entry to ABORTED, logging the decision if it ever touched the log
    ///
    /// A PREPARED entry whose abort mark cannot be logged stays PREPARED.
    fn abort_locked(&self, txn: TxnId, entry: &mut TxnEntry) -> Result<()> {
        let logged = entry.first_lsn.is_some() || entry.state != TxnState::Active;
        let prepared = entry.state == TxnState::Prepared;
        entry.state = TxnState::Aborting;
        if logged && let Err(e) = self.wal.append(RecordKind::Abort, txn, Vec::new()) {
            if prepared {
                error!("Failed to log abort of prepared {txn}, still prepared: {e}");
                entry.state = TxnState::Prepared;
                return Err(e);
            }
            // Never prepared: recovery discards it either way.
            error!("Failed to log abort of {txn}: {e}");
        }
        entry.state = TxnState::Aborted;
        entry.ops.clear();
        entry.prepared_at = None;
        Ok(())
    }

    /// Apply committed operations from position `applied` on
    ///
    /// Each applied operation is followed by a progress record, and the next
    /// operation only starts once that record is durable. Redo therefore
    /// never replays an operation over the effects of a later one.
    pub(crate) fn apply_committed(
        &self,
        txn: TxnId,
        ops: &[Operation],
        applied: &mut usize,
    ) -> Result<()> {
        let owners = ops.iter().flat_map(|op| op.owners().into_iter().cloned());
        let _guard = self.locks.acquire(owners);

        for (index, op) in ops.iter().enumerate().skip(*applied) {
            if let Err(e) = self.layout.apply(op) {
                error!("Applying {} of {txn} failed: {e}", op.kind());
                return Err(e);
            }
            let done = index + 1;
            let more = done < ops.len();
            match self.wal.append_progress(txn, done, more) {
                Ok(_) => *applied = done,
                Err(e) if more => {
                    error!("Failed to log apply progress of {txn}: {e}");
                    return Err(e);
                }
                Err(e) => {
                    // Redo of the last operation alone is harmless.
                    warn!("Failed to log apply completion of {txn}: {e}");
                    *applied = done;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn run_hooks(&self, txn: TxnId, ops: &[Operation]) {
        let hooks = self.hooks.read().clone();
        for hook in hooks {
            if let Err(e) = hook.after_commit(txn, ops) {
                warn!("Post-commit hook {} failed for {txn}: {e}", hook.name());
            }
        }
    }

    /// PREPARED transactions awaiting a decision, oldest id first
    pub fn in_doubt(&self) -> Vec<InDoubtTxn> {
        let handles: Vec<(TxnId, Arc<Mutex<TxnEntry>>)> = self
            .txns
            .lock()
            .iter()
            .map(|(txn, entry)| (*txn, Arc::clone(entry)))
            .collect();

        let mut in_doubt: Vec<InDoubtTxn> = handles
            .into_iter()
            .filter_map(|(txn, handle)| {
                let entry = handle.lock();
                (entry.state == TxnState::Prepared).then(|| InDoubtTxn {
                    txn,
                    mode: entry.mode,
                    op_count: entry.ops.len(),
                    prepared_for: entry.prepared_at.map_or(Duration::ZERO, |at| at.elapsed()),
                    commit_unconfirmed: entry.commit_unconfirmed,
                })
            })
            .collect();
        in_doubt.sort_by_key(|t| t.txn);
        in_doubt
    }

    /// Roll back coordinated transactions left PREPARED longer than `timeout`
    pub fn expire_in_doubt(&self, timeout: Duration) -> Vec<TxnId> {
        let expired: Vec<TxnId> = self
            .in_doubt()
            .into_iter()
            .filter(|t| {
                t.mode == TxnMode::TwoPhase && !t.commit_unconfirmed && t.prepared_for >= timeout
            })
            .map(|t| t.txn)
            .collect();

        let mut rolled_back = Vec::with_capacity(expired.len());
        for txn in expired {
            warn!("Coordinator silent for {txn} beyond {timeout:?}, rolling back");
            match self.rollback(txn) {
                Ok(()) => rolled_back.push(txn),
                Err(e) => debug!("Expiry of {txn} skipped: {e}"),
            }
        }
        rolled_back
    }

    /// Transactions whose commit decision is durable but not yet applied,
    /// in commit order
    pub fn stalled_commits(&self) -> Vec<TxnId> {
        let handles: Vec<(TxnId, Arc<Mutex<TxnEntry>>)> = self
            .txns
            .lock()
            .iter()
            .map(|(txn, entry)| (*txn, Arc::clone(entry)))
            .collect();

        let mut stalled: Vec<(Option<Lsn>, TxnId)> = handles
            .into_iter()
            .filter_map(|(txn, handle)| {
                let entry = handle.lock();
                (entry.state == TxnState::Committing).then_some((entry.commit_lsn, txn))
            })
            .collect();
        stalled.sort();
        stalled.into_iter().map(|(_, txn)| txn).collect()
    }

    /// Truncate the log below every record a live transaction still needs
    ///
    /// Terminal transactions leave the live table; their outcome stays
    /// queryable for a bounded number of later transactions.
    pub fn checkpoint(&self) -> Result<Lsn> {
        // Taken first: records appended while we scan land at or above it.
        let mut low = self.wal.next_lsn();

        let handles: Vec<(TxnId, Arc<Mutex<TxnEntry>>)> = self
            .txns
            .lock()
            .iter()
            .map(|(txn, entry)| (*txn, Arc::clone(entry)))
            .collect();

        let mut finished = Vec::new();
        for (txn, handle) in &handles {
            let entry = handle.lock();
            if entry.state.is_terminal() {
                finished.push((*txn, entry.state));
            } else if let Some(lsn) = entry.first_lsn {
                low = low.min(lsn);
            }
        }

        self.wal.truncate_before(low)?;

        let mut txns = self.txns.lock();
        let mut resolved = self.resolved.lock();
        for (txn, state) in finished {
            txns.remove(&txn);
            resolved.insert(txn, state);
        }
        debug!("Checkpoint at lsn {low}: {} live transactions", txns.len());
        Ok(low)
    }
}
