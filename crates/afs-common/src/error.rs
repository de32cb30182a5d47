//! Error types for AFS
//!
//! Every error belongs to one of three classes. USER errors reject a single
//! call and leave the transaction untouched. SYSTEM errors (log or storage
//! I/O) push the enclosing transaction toward ABORTED. COORDINATION errors
//! leave a prepared transaction in doubt for the external coordinator to
//! resolve.

use crate::types::{ObjectPathError, ObjectRef, OwnerIdError, TxnId, TxnState};
use thiserror::Error;

/// Common result type for AFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error classification used for propagation decisions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Invalid operation against the current staged or committed state
    User,
    /// Log or storage failure
    System,
    /// External coordinator unreachable or undecided
    Coordination,
}

/// Common error type for AFS
#[derive(Debug, Error)]
pub enum Error {
    // Operation errors
    #[error("object not found: {0}")]
    ObjectNotFound(ObjectRef),

    #[error("object already exists: {0}")]
    ObjectAlreadyExists(ObjectRef),

    #[error("object was deleted in this transaction: {0}")]
    ObjectDeleted(ObjectRef),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("invalid owner id: {0}")]
    InvalidOwnerId(#[from] OwnerIdError),

    #[error("invalid object path: {0}")]
    InvalidObjectPath(#[from] ObjectPathError),

    #[error("path conflict at {object}: {reason}")]
    PathConflict {
        object: ObjectRef,
        reason: &'static str,
    },

    #[error("write beyond the largest representable offset: {0}")]
    OffsetTooLarge(ObjectRef),

    #[error("read of {requested} bytes exceeds maximum of {max} bytes")]
    ReadTooLarge { requested: u64, max: u64 },

    // Transaction errors
    #[error("transaction not found: {0}")]
    TransactionNotFound(TxnId),

    #[error("transaction already exists: {0}")]
    TransactionExists(TxnId),

    #[error("cannot {action} transaction {txn} in state {state}")]
    IllegalState {
        txn: TxnId,
        state: TxnState,
        action: &'static str,
    },

    #[error("no transaction is bound to this session")]
    NoActiveTransaction,

    #[error("session already has an active transaction: {0}")]
    TransactionInProgress(TxnId),

    #[error("access denied: {0}")]
    AccessDenied(String),

    // Log errors
    #[error("write-ahead log error: {0}")]
    Wal(String),

    #[error("write-ahead log fsync failed: {0}")]
    WalSync(String),

    #[error("write-ahead log is poisoned by an earlier fsync failure")]
    WalPoisoned,

    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    // Worker / server errors
    #[error("request timeout")]
    Timeout,

    #[error("session worker pool exhausted")]
    PoolExhausted,

    #[error("session worker evicted")]
    SessionEvicted,

    // Coordination errors
    #[error("coordination error: {0}")]
    Coordination(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid operation error
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a write-ahead log error
    pub fn wal(msg: impl Into<String>) -> Self {
        Self::Wal(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify the error
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::ObjectNotFound(_)
            | Self::ObjectAlreadyExists(_)
            | Self::ObjectDeleted(_)
            | Self::InvalidOperation(_)
            | Self::InvalidOwnerId(_)
            | Self::InvalidObjectPath(_)
            | Self::PathConflict { .. }
            | Self::OffsetTooLarge(_)
            | Self::ReadTooLarge { .. }
            | Self::TransactionNotFound(_)
            | Self::TransactionExists(_)
            | Self::IllegalState { .. }
            | Self::NoActiveTransaction
            | Self::TransactionInProgress(_)
            | Self::AccessDenied(_) => ErrorClass::User,

            Self::Coordination(_) => ErrorClass::Coordination,

            Self::Wal(_)
            | Self::WalSync(_)
            | Self::WalPoisoned
            | Self::DiskIo(_)
            | Self::Storage(_)
            | Self::Timeout
            | Self::PoolExhausted
            | Self::SessionEvicted
            | Self::Configuration(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorClass::System,
        }
    }

    /// Check if this is a user error
    #[must_use]
    pub const fn is_user(&self) -> bool {
        matches!(self.class(), ErrorClass::User)
    }

    /// Fatal errors mean the log can no longer promise durability
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::WalSync(_) | Self::WalPoisoned)
    }

    /// Check if the caller may retry the same call
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::PoolExhausted | Self::SessionEvicted | Self::Coordination(_)
        )
    }

    /// Check if this is a not found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ObjectNotFound(_) | Self::TransactionNotFound(_)
        )
    }
}
