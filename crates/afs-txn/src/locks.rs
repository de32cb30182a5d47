//! Per-owner apply locks
//!
//! Commits touching the same owner apply one after another; commits on
//! disjoint owners never wait for each other. A guard takes all of its
//! owners at once, so two commits can never hold one owner each while
//! waiting for the other.

use afs_common::OwnerId;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;

/// Set of owners currently being applied to
#[derive(Default)]
pub struct OwnerLocks {
    held: Mutex<HashSet<OwnerId>>,
    released: Condvar,
}

impl OwnerLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every owner is free, then take them all
    pub fn acquire(&self, owners: impl IntoIterator<Item = OwnerId>) -> OwnerGuard<'_> {
        let mut owners: Vec<OwnerId> = owners.into_iter().collect();
        owners.sort();
        owners.dedup();

        let mut held = self.held.lock();
        while owners.iter().any(|o| held.contains(o)) {
            self.released.wait(&mut held);
        }
        held.extend(owners.iter().cloned());

        OwnerGuard {
            locks: self,
            owners,
        }
    }

    /// Number of owners currently held
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Releases its owners on drop
pub struct OwnerGuard<'a> {
    locks: &'a OwnerLocks,
    owners: Vec<OwnerId>,
}

impl OwnerGuard<'_> {
    pub fn owners(&self) -> &[OwnerId] {
        &self.owners
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for owner in &self.owners {
            held.remove(owner);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
