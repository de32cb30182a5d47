//! AFS Transactions - two-phase commit participant
//!
//! This crate implements the transactional half of the AFS engine:
//! - The transaction coordinator (2PC participant state machine)
//! - Crash recovery, checkpointing and in-doubt handling
//! - Transactional connections with a session-local staged view
//! - Per-owner apply locks and post-commit hooks

pub mod connection;
pub mod coordinator;
pub mod hooks;
pub mod locks;
pub mod recovery;

// Re-exports
pub use connection::TransactionalConnection;
pub use coordinator::{InDoubtTxn, TransactionCoordinator};
pub use hooks::PostCommitHook;
pub use locks::{OwnerGuard, OwnerLocks};
pub use recovery::RecoveryReport;

#[cfg(test)]
mod testing;
