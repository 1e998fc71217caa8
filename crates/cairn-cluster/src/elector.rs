//! Coordinator election.
//!
//! The coordinator is the active member with the smallest id. Every member
//! applies the same rule to its own view, so once views converge they agree
//! on the coordinator without exchanging any votes.

use std::sync::{Arc, Mutex};

use crate::directory::MemberDirectory;
use crate::member::{Member, MemberId};

/// The coordinator as of a directory epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorView {
    pub coordinator_id: Option<MemberId>,
    /// Directory epoch this view was computed at. Coordinator-only work can
    /// use it to tell a stale leadership decision from a current one.
    pub epoch: u64,
}

/// Applies the election rule to a group ordered or not.
pub fn elect(group: &[Member]) -> Option<&Member> {
    group.iter().min_by(|a, b| a.id().cmp(b.id()))
}

/// Caches the coordinator and recomputes it when the directory changes.
#[derive(Debug)]
pub struct CoordinatorElector {
    directory: Arc<MemberDirectory>,
    cached: Mutex<CoordinatorView>,
}

impl CoordinatorElector {
    pub fn new(directory: Arc<MemberDirectory>) -> Self {
        Self {
            directory,
            cached: Mutex::new(CoordinatorView {
                coordinator_id: None,
                epoch: 0,
            }),
        }
    }

    /// Current view. O(1) unless the directory changed since the last call.
    pub fn view(&self) -> CoordinatorView {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        // read the epoch before the group so a concurrent change leaves the
        // cache stale rather than wrong
        let epoch = self.directory.epoch();
        if cached.epoch != epoch {
            let group = self.directory.group();
            cached.coordinator_id = elect(&group).map(|m| m.id().clone());
            cached.epoch = epoch;
        }
        cached.clone()
    }

    pub fn coordinator(&self) -> Option<Member> {
        let id = self.view().coordinator_id?;
        self.directory.get(&id).map(|record| record.member)
    }

    pub fn is_coordinator(&self, id: &MemberId) -> bool {
        self.view().coordinator_id.as_ref() == Some(id)
    }
}
