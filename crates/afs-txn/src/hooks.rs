//! Post-commit hooks
//!
//! Hooks run in registration order once a transaction is COMMITTED. They see
//! the finalized operation list and cannot change the outcome: a failing
//! hook is logged and skipped.

use afs_common::{Operation, Result, TxnId};

/// Side effect triggered after a transaction commits
pub trait PostCommitHook: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Called once per committed transaction with its operations in stage order
    fn after_commit(&self, txn: TxnId, ops: &[Operation]) -> Result<()>;
}
