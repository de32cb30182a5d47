//! Background maintenance
//!
//! Runs on a fixed interval until shutdown:
//! 1. Roll back two-phase transactions whose coordinator stayed silent
//! 2. Retry commits whose apply failed
//! 3. Checkpoint the log once it grows past the configured size

use crate::context::ServerContext;
use crate::session::blocking;
use afs_common::{Result, TxnId};
use afs_storage::Lsn;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// In-doubt transactions rolled back after the coordinator timeout
    pub expired: Vec<TxnId>,
    /// Stalled commits that completed on retry
    pub completed: Vec<TxnId>,
    /// Truncation point when a checkpoint ran
    pub checkpoint: Option<Lsn>,
}

/// Run one maintenance pass
pub fn maintenance_pass(ctx: &ServerContext) -> Result<MaintenanceReport> {
    let coordinator = &ctx.coordinator;
    let expired = coordinator.expire_in_doubt(ctx.config.server.coordinator_timeout());

    let mut completed = Vec::new();
    for txn in coordinator.stalled_commits() {
        match coordinator.commit(txn) {
            Ok(()) => {
                info!("Completed stalled commit of {txn}");
                completed.push(txn);
            }
            Err(e) => warn!("Commit of {txn} still failing: {e}"),
        }
    }

    let checkpoint = if coordinator.wal().size() > ctx.config.wal.checkpoint_bytes {
        Some(coordinator.checkpoint()?)
    } else {
        None
    };

    Ok(MaintenanceReport {
        expired,
        completed,
        checkpoint,
    })
}

/// Run maintenance passes until `shutdown` flips to true
pub async fn run_maintenance(ctx: ServerContext, mut shutdown: watch::Receiver<bool>) {
    let period = ctx.config.server.maintenance_interval();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Maintenance loop started (interval: {period:?})");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let pass_ctx = ctx.clone();
        match blocking(move || maintenance_pass(&pass_ctx)).await {
            Ok(report) => debug!("Maintenance pass: {report:?}"),
            Err(e) => error!("Maintenance pass failed: {e}"),
        }
    }

    info!("Maintenance loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use afs_common::{AfsConfig, ObjectPath, ObjectRef, Operation, OwnerId, TxnMode, TxnState};
    use std::time::Duration;
    use tempfile::TempDir;

    fn context(dir: &TempDir, tweak: impl FnOnce(&mut AfsConfig)) -> ServerContext {
        let mut config = AfsConfig::default();
        config.storage.root = dir.path().join("store");
        config.wal.root = dir.path().join("wal");
        tweak(&mut config);
        ServerContext::open(config).unwrap().0
    }

    fn write_op(owner: &str, path: &str) -> Operation {
        Operation::Write {
            object: ObjectRef::new(
                OwnerId::new(owner).unwrap(),
                ObjectPath::new(path).unwrap(),
            ),
            offset: 0,
            data: b"payload".to_vec(),
        }
    }

    #[test]
    fn test_pass_expires_silent_coordinators() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, |c| c.server.coordinator_timeout_ms = 1);
        let c = &ctx.coordinator;

        let txn = c.begin(TxnMode::TwoPhase, None).unwrap();
        c.stage(txn, write_op("alice", "f")).unwrap();
        c.prepare(txn).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let report = maintenance_pass(&ctx).unwrap();
        assert_eq!(report.expired, vec![txn]);
        assert_eq!(c.state(txn), Some(TxnState::Aborted));
    }

    #[test]
    fn test_pass_checkpoints_large_log() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, |c| c.wal.checkpoint_bytes = 1);
        let c = &ctx.coordinator;

        let txn = c.begin(TxnMode::OnePhase, None).unwrap();
        c.stage(txn, write_op("alice", "f")).unwrap();
        c.prepare(txn).unwrap();
        c.commit(txn).unwrap();

        let report = maintenance_pass(&ctx).unwrap();
        assert!(report.checkpoint.is_some());
        assert_eq!(c.live_count(), 0);
        assert_eq!(c.state(txn), Some(TxnState::Committed));
    }

    #[tokio::test]
    async fn test_loop_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir, |c| c.server.maintenance_interval_ms = 10);
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(run_maintenance(ctx, rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
