//! The local view of cluster membership.
//!
//! `MemberDirectory` holds every known member with its liveness state. All
//! mutations go through a single writer lock, so they are linearizable;
//! readers receive copies. Every change that affects who is in the group
//! bumps an epoch counter, which the coordinator elector uses to know when
//! its cached answer went stale.
//!
//! Departed members are not forgotten immediately. They stay behind as
//! tombstones carrying their last incarnation, which lets the directory
//! reject a delayed announcement from an incarnation that already left.

use std::collections::BTreeMap;
use std::sync::RwLock;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ClusterError;
use crate::member::{Member, MemberId, MemberState};

/// Snapshot of a single directory entry.
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub member: Member,
    pub state: MemberState,
    pub last_heartbeat_at: Instant,
    /// When `state` last changed. For suspects this is the suspect-since time.
    pub state_changed_at: Instant,
}

/// Result of recording a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// No live entry for this id.
    Unknown,
    /// Liveness refreshed, state unchanged.
    Refreshed,
    /// The member became active. `first_arrival` is false when it was
    /// recovering from suspicion after having already arrived.
    Promoted {
        from: MemberState,
        first_arrival: bool,
    },
}

/// A member that was just moved to `Left`.
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub member: Member,
    /// Whether an arrival was ever reported for this member. Departures are
    /// only announced for members that arrived.
    pub arrived: bool,
}

/// Counts from a `merge`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: Vec<MemberId>,
    pub updated: usize,
    pub stale: usize,
}

#[derive(Debug)]
struct Entry {
    record: MemberRecord,
    arrived: bool,
}

#[derive(Debug)]
struct Inner {
    local_id: MemberId,
    entries: BTreeMap<MemberId, Entry>,
    epoch: u64,
}

impl Inner {
    fn bump_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }
}

/// Authoritative local membership view.
#[derive(Debug)]
pub struct MemberDirectory {
    inner: RwLock<Inner>,
    epoch_tx: watch::Sender<u64>,
}

impl MemberDirectory {
    /// Creates a directory containing only the local member, already active.
    pub fn new(local: Member, now: Instant) -> Self {
        let local_id = local.id().clone();
        let mut entries = BTreeMap::new();
        entries.insert(
            local_id.clone(),
            Entry {
                record: MemberRecord {
                    member: local,
                    state: MemberState::Active,
                    last_heartbeat_at: now,
                    state_changed_at: now,
                },
                arrived: true,
            },
        );
        let (epoch_tx, _) = watch::channel(1);
        Self {
            inner: RwLock::new(Inner {
                local_id,
                entries,
                epoch: 1,
            }),
            epoch_tx,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, epoch: u64) {
        self.epoch_tx.send_replace(epoch);
    }

    pub fn local_id(&self) -> MemberId {
        self.read().local_id.clone()
    }

    /// Returns the local member with its current incarnation.
    pub fn local(&self) -> Member {
        let inner = self.read();
        inner.entries[&inner.local_id].record.member.clone()
    }

    /// Raises the local incarnation to at least `at_least`, and always by
    /// one or more. Used to refute a suspicion or a removal.
    pub fn bump_local_incarnation(&self, at_least: u64) -> Member {
        let mut inner = self.write();
        let local_id = inner.local_id.clone();
        let entry = inner
            .entries
            .get_mut(&local_id)
            .expect("local member is always present");
        let next = entry
            .record
            .member
            .incarnation()
            .saturating_add(1)
            .max(at_least);
        entry.record.member.set_incarnation(next);
        entry.record.member.clone()
    }

    /// Inserts a member or updates the stored copy.
    ///
    /// Returns the previous state, or `None` for a member never seen before.
    /// An incarnation lower than the stored one is rejected, as is the same
    /// incarnation of a departed member. A higher incarnation clears a
    /// suspicion and revives a tombstone as `Joining`.
    pub fn upsert(&self, member: Member, now: Instant) -> Result<Option<MemberState>, ClusterError> {
        let mut inner = self.write();
        if *member.id() == inner.local_id {
            // our own announcement looped back
            return Ok(Some(MemberState::Active));
        }

        let id = member.id().clone();
        let Some(entry) = inner.entries.get_mut(&id) else {
            inner.entries.insert(
                id.clone(),
                Entry {
                    record: MemberRecord {
                        member,
                        state: MemberState::Joining,
                        last_heartbeat_at: now,
                        state_changed_at: now,
                    },
                    arrived: false,
                },
            );
            let epoch = inner.bump_epoch();
            drop(inner);
            self.publish(epoch);
            debug!("directory: discovered {}", id);
            return Ok(None);
        };

        let stored = entry.record.member.incarnation();
        let offered = member.incarnation();
        let previous = entry.record.state;
        let stale = offered < stored || (offered == stored && previous == MemberState::Left);
        if stale {
            return Err(ClusterError::StaleIncarnation {
                id,
                offered,
                stored,
            });
        }

        entry.record.member = member;
        if offered == stored {
            return Ok(Some(previous));
        }

        let changed = match previous {
            MemberState::Suspect => {
                entry.record.state = MemberState::Active;
                entry.record.state_changed_at = now;
                entry.record.last_heartbeat_at = now;
                true
            }
            MemberState::Left => {
                entry.record.state = MemberState::Joining;
                entry.record.state_changed_at = now;
                entry.record.last_heartbeat_at = now;
                entry.arrived = false;
                true
            }
            MemberState::Joining | MemberState::Active => false,
        };
        if changed {
            let epoch = inner.bump_epoch();
            drop(inner);
            self.publish(epoch);
            debug!("directory: {} moved from {} at incarnation {}", id, previous, offered);
        }
        Ok(Some(previous))
    }

    /// Records a heartbeat from `id`.
    pub fn mark_heartbeat(&self, id: &MemberId, now: Instant) -> HeartbeatOutcome {
        let mut inner = self.write();
        let Some(entry) = inner.entries.get_mut(id) else {
            return HeartbeatOutcome::Unknown;
        };
        match entry.record.state {
            MemberState::Left => HeartbeatOutcome::Unknown,
            MemberState::Active => {
                entry.record.last_heartbeat_at = now;
                HeartbeatOutcome::Refreshed
            }
            from @ (MemberState::Joining | MemberState::Suspect) => {
                entry.record.last_heartbeat_at = now;
                entry.record.state = MemberState::Active;
                entry.record.state_changed_at = now;
                let first_arrival = !entry.arrived;
                entry.arrived = true;
                let epoch = inner.bump_epoch();
                drop(inner);
                self.publish(epoch);
                HeartbeatOutcome::Promoted {
                    from,
                    first_arrival,
                }
            }
        }
    }

    /// Moves a joining or active peer to `Suspect`. Returns true if the
    /// state changed. The local member is never suspected.
    pub fn mark_suspect(&self, id: &MemberId, now: Instant) -> bool {
        let mut inner = self.write();
        if *id == inner.local_id {
            return false;
        }
        let Some(entry) = inner.entries.get_mut(id) else {
            return false;
        };
        if !matches!(entry.record.state, MemberState::Joining | MemberState::Active) {
            return false;
        }
        let demoted = entry.record.state == MemberState::Active;
        entry.record.state = MemberState::Suspect;
        entry.record.state_changed_at = now;
        if demoted {
            let epoch = inner.bump_epoch();
            drop(inner);
            self.publish(epoch);
        }
        true
    }

    /// Moves a peer to `Left`, keeping a tombstone. Returns the departure,
    /// or `None` if the member was unknown, already gone, or local.
    pub fn remove(&self, id: &MemberId, now: Instant) -> Option<Departure> {
        let mut inner = self.write();
        if *id == inner.local_id {
            return None;
        }
        let entry = inner.entries.get_mut(id)?;
        if entry.record.state == MemberState::Left {
            return None;
        }
        entry.record.state = MemberState::Left;
        entry.record.state_changed_at = now;
        let departure = Departure {
            member: entry.record.member.clone(),
            arrived: entry.arrived,
        };
        let epoch = inner.bump_epoch();
        drop(inner);
        self.publish(epoch);
        Some(departure)
    }

    /// Upserts every member, keeping the higher incarnation per id.
    pub fn merge(&self, members: impl IntoIterator<Item = Member>, now: Instant) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();
        for member in members {
            let id = member.id().clone();
            match self.upsert(member, now) {
                Ok(None) => outcome.inserted.push(id),
                Ok(Some(_)) => outcome.updated += 1,
                Err(_) => outcome.stale += 1,
            }
        }
        outcome
    }

    /// Drops tombstones that departed before `before`. Returns how many.
    pub fn purge_tombstones(&self, before: Instant) -> usize {
        let mut inner = self.write();
        let len = inner.entries.len();
        inner.entries.retain(|_, entry| {
            entry.record.state != MemberState::Left || entry.record.state_changed_at >= before
        });
        len - inner.entries.len()
    }

    /// All live entries (everything except tombstones), ordered by id.
    pub fn snapshot(&self) -> Vec<MemberRecord> {
        self.read()
            .entries
            .values()
            .filter(|e| e.record.state != MemberState::Left)
            .map(|e| e.record.clone())
            .collect()
    }

    /// The active members, ordered by id. Contains the local member.
    pub fn group(&self) -> Vec<Member> {
        self.read()
            .entries
            .values()
            .filter(|e| e.record.state == MemberState::Active)
            .map(|e| e.record.member.clone())
            .collect()
    }

    /// Returns the entry for `id`, tombstones included.
    pub fn get(&self, id: &MemberId) -> Option<MemberRecord> {
        self.read().entries.get(id).map(|e| e.record.clone())
    }

    /// True if `id` has a live entry.
    pub fn contains(&self, id: &MemberId) -> bool {
        self.read()
            .entries
            .get(id)
            .is_some_and(|e| e.record.state != MemberState::Left)
    }

    /// Number of live entries, local member included.
    pub fn len(&self) -> usize {
        self.read()
            .entries
            .values()
            .filter(|e| e.record.state != MemberState::Left)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutation counter. Increments on join, leave, promotion and demotion.
    pub fn epoch(&self) -> u64 {
        self.read().epoch
    }

    /// Subscribes to epoch changes.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }
}
