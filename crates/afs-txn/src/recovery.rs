//! Crash recovery
//!
//! Rebuilds the transaction table from the write-ahead log at startup:
//!
//! | log contents                 | outcome                                  |
//! |------------------------------|------------------------------------------|
//! | `Commit`, every op `Applied` | COMMITTED, nothing to do                 |
//! | `Commit`, ops left to apply  | redone in commit order, COMMITTED        |
//! | records lost to failed sync  | ABORTED, an `Abort` mark is logged       |
//! | `Prepared`, no decision      | restored as PREPARED (in doubt)          |
//! | `Abort`                      | ABORTED                                  |
//! | `Staged` only                | ABORTED, an `Abort` mark is logged       |
//!
//! Redo resumes after the last `Applied` progress record. Only the operation
//! in flight at the crash is applied twice, and a single operation repeated
//! over its own effect changes nothing. A redo that fails leaves its
//! transaction COMMITTING for maintenance to retry; later commits touching
//! the same owners wait behind it so commit order is kept.

use crate::coordinator::{TransactionCoordinator, TxnEntry};
use afs_common::{Error, OwnerId, Result, TxnId, TxnMode, TxnState};
use afs_storage::TxnLog;
use afs_storage::wal::RecordKind;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{error, info, warn};

/// What recovery found and did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Committed and fully applied before the restart
    pub committed: Vec<TxnId>,
    /// Committed but not fully applied; re-applied during recovery
    pub reapplied: Vec<TxnId>,
    /// Aborted, explicitly or by crashing before prepare
    pub aborted: Vec<TxnId>,
    /// Prepared without a decision; waiting for the coordinator
    pub in_doubt: Vec<TxnId>,
    /// Committed, but redo failed or waits behind a failed redo
    pub stalled: Vec<TxnId>,
}

impl RecoveryReport {
    /// Nothing needed redo and nothing waits for a coordinator
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.reapplied.is_empty() && self.in_doubt.is_empty() && self.stalled.is_empty()
    }
}

fn recovered_entry(log: &TxnLog, state: TxnState) -> TxnEntry {
    let mut entry = TxnEntry::new(log.prepared.map_or(TxnMode::OnePhase, |s| s.mode));
    entry.state = state;
    entry.first_lsn = Some(log.first_lsn);
    entry
}

impl TransactionCoordinator {
    /// Replay the log and bring storage and the transaction table up to date
    ///
    /// Must run before any transaction is admitted. Ends with a checkpoint.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let logs = self.wal().replay()?;
        info!("Recovering {} logged transactions", logs.len());

        let mut report = RecoveryReport::default();
        let mut restored: Vec<(TxnId, TxnEntry)> = Vec::with_capacity(logs.len());
        let mut redo: Vec<TxnLog> = Vec::new();
        let unconfirmed: HashSet<TxnId> = self.wal().unconfirmed_txns().iter().copied().collect();

        for log in logs {
            let txn = log.txn;

            if log.commit_lsn.is_some() {
                if log.is_applied() {
                    report.committed.push(txn);
                    restored.push((txn, recovered_entry(&log, TxnState::Committed)));
                } else {
                    redo.push(log);
                }
                continue;
            }

            if !log.aborted && unconfirmed.contains(&txn) {
                warn!("Aborting {txn}: its last log records were never confirmed on disk");
                self.wal().append(RecordKind::Abort, txn, Vec::new())?;
                report.aborted.push(txn);
                restored.push((txn, recovered_entry(&log, TxnState::Aborted)));
                continue;
            }

            if log.aborted {
                report.aborted.push(txn);
                restored.push((txn, recovered_entry(&log, TxnState::Aborted)));
                continue;
            }

            if let Some(summary) = log.prepared {
                if summary.op_count as usize != log.ops.len() {
                    return Err(Error::wal(format!(
                        "{txn} prepared {} operations but the log holds {}",
                        summary.op_count,
                        log.ops.len()
                    )));
                }
                warn!(
                    "{txn} is in doubt: prepared with {} operations, awaiting coordinator",
                    log.ops.len()
                );
                let mut entry = TxnEntry::new(summary.mode);
                entry.state = TxnState::Prepared;
                entry.first_lsn = Some(log.first_lsn);
                entry.prepared_at = Some(Instant::now());
                entry.ops = log.ops;
                report.in_doubt.push(txn);
                restored.push((txn, entry));
                continue;
            }

            // Crashed before prepare: the client never got a commit.
            warn!(
                "Discarding {txn}: {} staged operations never prepared",
                log.ops.len()
            );
            self.wal().append(RecordKind::Abort, txn, Vec::new())?;
            report.aborted.push(txn);
            restored.push((txn, recovered_entry(&log, TxnState::Aborted)));
        }

        redo.sort_by_key(|log| log.commit_lsn);
        let mut blocked: HashSet<OwnerId> = HashSet::new();
        for log in redo {
            let txn = log.txn;
            let owners: HashSet<OwnerId> = log
                .ops
                .iter()
                .flat_map(|op| op.owners().into_iter().cloned())
                .collect();

            let mut applied = log.applied;
            let result = if owners.is_disjoint(&blocked) {
                info!(
                    "Re-applying {} of {} operations of committed {txn}",
                    log.ops.len() - applied.min(log.ops.len()),
                    log.ops.len()
                );
                self.apply_committed(txn, &log.ops, &mut applied)
            } else {
                Err(Error::internal("an earlier commit on the same owners is stalled"))
            };

            match result {
                Ok(()) => {
                    self.run_hooks(txn, &log.ops);
                    report.reapplied.push(txn);
                    restored.push((txn, recovered_entry(&log, TxnState::Committed)));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("Redo of committed {txn} failed, left for retry: {e}");
                    blocked.extend(owners);
                    let mut entry = recovered_entry(&log, TxnState::Committing);
                    entry.commit_lsn = log.commit_lsn;
                    entry.applied = applied;
                    entry.ops = log.ops;
                    report.stalled.push(txn);
                    restored.push((txn, entry));
                }
            }
        }

        {
            let mut txns = self.txns.lock();
            for (txn, entry) in restored {
                txns.insert(txn, Arc::new(Mutex::new(entry)));
            }
        }
        self.next_txn
            .fetch_max(self.wal().max_txn_id() + 1, Ordering::SeqCst);
        self.wal().clear_unconfirmed()?;

        self.checkpoint()?;

        info!(
            "Recovery complete: committed={}, reapplied={}, aborted={}, in_doubt={}, stalled={}",
            report.committed.len(),
            report.reapplied.len(),
            report.aborted.len(),
            report.in_doubt.len(),
            report.stalled.len()
        );
        Ok(report)
    }
}
