//! Core type definitions for AFS
//!
//! This module defines the identifiers used to address stored objects and
//! transactions, the operation model staged through the write-ahead log, and
//! the transaction state machine.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Maximum length of an owner identifier in bytes
pub const MAX_OWNER_ID_LEN: usize = 255;

/// Maximum length of an object path in bytes
pub const MAX_OBJECT_PATH_LEN: usize = 4096;

/// Prefix reserved for engine-internal files (temporaries, markers)
pub const RESERVED_PREFIX: &str = ".afs";

/// Transaction identifier
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct TxnId(u64);

impl TxnId {
    /// Create from a raw value
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnId({})", self.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Unique identifier for a session worker
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
pub struct WorkerId(Uuid);

impl WorkerId {
    /// Generate a new random worker ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client session token
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct SessionToken(String);

impl SessionToken {
    /// Create a session token
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the token as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are credentials; only show a short prefix.
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "SessionToken({prefix}…)")
    }
}

/// Logical owner identifier (e.g. a data set code)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct OwnerId(String);

impl OwnerId {
    /// Create a new owner ID (validates it can be used as a path segment)
    pub fn new(id: impl Into<String>) -> Result<Self, OwnerIdError> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the owner ID as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> Result<(), OwnerIdError> {
        if id.is_empty() {
            return Err(OwnerIdError::Empty);
        }
        if id.len() > MAX_OWNER_ID_LEN {
            return Err(OwnerIdError::TooLong);
        }
        if id.starts_with('.') {
            return Err(OwnerIdError::LeadingDot);
        }
        if let Some(c) = id.chars().find(|c| matches!(c, '/' | '\\' | '\0')) {
            return Err(OwnerIdError::InvalidChar(c));
        }
        Ok(())
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({:?})", self.0)
    }
}

/// Errors that can occur when creating an owner ID
#[derive(Debug, Clone, thiserror::Error)]
pub enum OwnerIdError {
    #[error("owner id cannot be empty")]
    Empty,
    #[error("owner id must be at most {MAX_OWNER_ID_LEN} bytes")]
    TooLong,
    #[error("owner id cannot start with '.'")]
    LeadingDot,
    #[error("owner id contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// Path of an object relative to its owner directory
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Create a new object path
    pub fn new(path: impl Into<String>) -> Result<Self, ObjectPathError> {
        let path = path.into();
        Self::validate(&path)?;
        Ok(Self(path))
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    /// Get the path as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Parent directories of this path, outermost first
    pub fn ancestors(&self) -> impl Iterator<Item = ObjectPath> + '_ {
        self.0
            .match_indices('/')
            .map(|(at, _)| Self(self.0[..at].to_string()))
    }

    /// Check whether `other` lies below this path
    #[must_use]
    pub fn is_ancestor_of(&self, other: &ObjectPath) -> bool {
        other.0.len() > self.0.len()
            && other.0.starts_with(&self.0)
            && other.0.as_bytes()[self.0.len()] == b'/'
    }

    fn validate(path: &str) -> Result<(), ObjectPathError> {
        if path.is_empty() {
            return Err(ObjectPathError::Empty);
        }
        if path.len() > MAX_OBJECT_PATH_LEN {
            return Err(ObjectPathError::TooLong);
        }
        if path.starts_with('/') {
            return Err(ObjectPathError::Absolute);
        }
        if path.contains('\0') || path.contains('\\') {
            return Err(ObjectPathError::InvalidChar);
        }
        for segment in path.split('/') {
            match segment {
                "" => return Err(ObjectPathError::EmptySegment),
                "." | ".." => return Err(ObjectPathError::Traversal),
                s if s.starts_with(RESERVED_PREFIX) => {
                    return Err(ObjectPathError::Reserved(s.to_string()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPath({:?})", self.0)
    }
}

/// Errors that can occur when creating an object path
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectPathError {
    #[error("object path cannot be empty")]
    Empty,
    #[error("object path must be at most {MAX_OBJECT_PATH_LEN} bytes")]
    TooLong,
    #[error("object path must be relative")]
    Absolute,
    #[error("object path contains an invalid character")]
    InvalidChar,
    #[error("object path contains an empty segment")]
    EmptySegment,
    #[error("object path cannot contain '.' or '..' segments")]
    Traversal,
    #[error("object path segment is reserved: {0}")]
    Reserved(String),
}

/// Address of a stored object: (owner, relative path)
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{owner}/{path}")]
pub struct ObjectRef {
    pub owner: OwnerId,
    pub path: ObjectPath,
}

impl ObjectRef {
    /// Create an object reference
    #[must_use]
    pub const fn new(owner: OwnerId, path: ObjectPath) -> Self {
        Self { owner, path }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({}/{})", self.owner, self.path)
    }
}

/// A single storage mutation
///
/// Operations are immutable once appended to the write-ahead log. They are
/// applied to storage in stage order when their transaction commits.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Create an empty object
    Create { object: ObjectRef },
    /// Write bytes at an offset, creating the object if needed
    Write {
        object: ObjectRef,
        offset: u64,
        data: Vec<u8>,
    },
    /// Copy an object to a new location
    Copy { source: ObjectRef, target: ObjectRef },
    /// Move an object to a new location
    Move { source: ObjectRef, target: ObjectRef },
    /// Delete an object
    Delete { object: ObjectRef },
}

impl Operation {
    /// Short name of the operation kind (for logging)
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Write { .. } => "write",
            Self::Copy { .. } => "copy",
            Self::Move { .. } => "move",
            Self::Delete { .. } => "delete",
        }
    }

    /// Objects touched by this operation
    #[must_use]
    pub fn objects(&self) -> Vec<&ObjectRef> {
        match self {
            Self::Create { object } | Self::Write { object, .. } | Self::Delete { object } => {
                vec![object]
            }
            Self::Copy { source, target } | Self::Move { source, target } => {
                vec![source, target]
            }
        }
    }

    /// Owners touched by this operation
    #[must_use]
    pub fn owners(&self) -> Vec<&OwnerId> {
        let mut owners: Vec<&OwnerId> = self.objects().into_iter().map(|o| &o.owner).collect();
        owners.dedup();
        owners
    }
}

/// Transaction state
///
/// ```text
/// Active --prepare--> Preparing --> Prepared --commit--> Committing --> Committed
///   |                     |             |
///   +------abort----------+----rollback-+--> Aborting --> Aborted
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum TxnState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TxnState {
    /// Terminal states are irreversible
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }

    /// Check whether moving to `next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Preparing | Self::Aborting | Self::Aborted)
                | (Self::Preparing, Self::Prepared | Self::Aborting | Self::Aborted)
                | (Self::Prepared, Self::Committing | Self::Aborting)
                | (Self::Committing, Self::Committed | Self::Prepared)
                | (Self::Aborting, Self::Aborted)
        )
    }
}

/// How a transaction is driven to completion
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum TxnMode {
    /// Prepare and commit invoked back-to-back by AFS itself
    OnePhase,
    /// Prepare and commit driven by an external coordinator
    TwoPhase,
}

/// Listing entry for a stored object
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub path: ObjectPath,
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(owner: &str, path: &str) -> ObjectRef {
        ObjectRef::new(OwnerId::new(owner).unwrap(), ObjectPath::new(path).unwrap())
    }

    #[test]
    fn test_owner_id_validation() {
        assert!(OwnerId::new("20240101120000000-42").is_ok());
        assert!(matches!(OwnerId::new(""), Err(OwnerIdError::Empty)));
        assert!(matches!(OwnerId::new(".."), Err(OwnerIdError::LeadingDot)));
        assert!(matches!(
            OwnerId::new("a/b"),
            Err(OwnerIdError::InvalidChar('/'))
        ));
        assert!(matches!(
            OwnerId::new("x".repeat(256)),
            Err(OwnerIdError::TooLong)
        ));
    }

    #[test]
    fn test_object_path_validation() {
        assert!(ObjectPath::new("original/data.csv").is_ok());
        assert!(matches!(ObjectPath::new("/etc"), Err(ObjectPathError::Absolute)));
        assert!(matches!(
            ObjectPath::new("a/../b"),
            Err(ObjectPathError::Traversal)
        ));
        assert!(matches!(
            ObjectPath::new("a//b"),
            Err(ObjectPathError::EmptySegment)
        ));
        assert!(matches!(
            ObjectPath::new("a/.afs-tmp"),
            Err(ObjectPathError::Reserved(_))
        ));
    }

    #[test]
    fn test_object_path_ancestors() {
        let path = ObjectPath::new("a/b/c").unwrap();
        let ancestors: Vec<ObjectPath> = path.ancestors().collect();
        assert_eq!(
            ancestors,
            vec![ObjectPath::new("a").unwrap(), ObjectPath::new("a/b").unwrap()]
        );
        assert_eq!(ObjectPath::new("top").unwrap().ancestors().count(), 0);

        let a = ObjectPath::new("a").unwrap();
        assert!(a.is_ancestor_of(&path));
        assert!(!a.is_ancestor_of(&a));
        assert!(!a.is_ancestor_of(&ObjectPath::new("ab/c").unwrap()));
        assert!(!path.is_ancestor_of(&a));
    }

    #[test]
    fn test_state_transitions() {
        use TxnState::*;
        assert!(Active.can_transition_to(Preparing));
        assert!(Active.can_transition_to(Aborted));
        assert!(Prepared.can_transition_to(Committing));
        assert!(Prepared.can_transition_to(Aborting));
        assert!(!Active.can_transition_to(Committing));
        assert!(!Committing.can_transition_to(Aborting));
        assert!(!Committed.can_transition_to(Aborting));
        assert!(!Aborted.can_transition_to(Active));
        assert!(Committed.is_terminal() && Aborted.is_terminal());
    }

    #[test]
    fn test_operation_owners() {
        let op = Operation::Copy {
            source: obj("a", "x"),
            target: obj("b", "y"),
        };
        assert_eq!(op.kind(), "copy");
        assert_eq!(op.owners().len(), 2);

        let op = Operation::Move {
            source: obj("a", "x"),
            target: obj("a", "y"),
        };
        assert_eq!(op.owners().len(), 1);
    }

    #[test]
    fn test_session_token_debug_is_redacted() {
        let token = SessionToken::new("secret-session-token");
        assert!(!format!("{token:?}").contains("token"));
    }
}
