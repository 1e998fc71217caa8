//! Heartbeat-based failure detection.
//!
//! The detector does not own a timer. The event loop calls [`check`] once
//! per heartbeat interval and sends heartbeats to [`heartbeat_targets`];
//! passing the clock in keeps the timing rules testable.
//!
//! [`check`]: FailureDetector::check
//! [`heartbeat_targets`]: FailureDetector::heartbeat_targets

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::directory::{Departure, MemberDirectory};
use crate::member::{MemberId, MemberState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectorConfig {
    pub heartbeat_interval: Duration,
    pub suspect_timeout: Duration,
    pub removal_timeout: Duration,
    pub tombstone_ttl: Duration,
}

impl From<&ClusterConfig> for DetectorConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            suspect_timeout: config.suspect_timeout(),
            removal_timeout: config.removal_timeout(),
            tombstone_ttl: config.tombstone_ttl(),
        }
    }
}

/// Changes made by one [`FailureDetector::check`].
#[derive(Debug, Default)]
pub struct DetectionReport {
    pub suspected: Vec<MemberId>,
    pub removed: Vec<Departure>,
    pub purged: usize,
}

impl DetectionReport {
    pub fn is_empty(&self) -> bool {
        self.suspected.is_empty() && self.removed.is_empty() && self.purged == 0
    }
}

#[derive(Debug)]
pub struct FailureDetector {
    directory: Arc<MemberDirectory>,
    config: DetectorConfig,
}

impl FailureDetector {
    pub fn new(directory: Arc<MemberDirectory>, config: DetectorConfig) -> Self {
        Self { directory, config }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    /// Addresses of every live peer, joining and suspect members included.
    pub fn heartbeat_targets(&self) -> Vec<SocketAddr> {
        let local = self.directory.local_id();
        self.directory
            .snapshot()
            .into_iter()
            .filter(|r| *r.member.id() != local)
            .map(|r| r.member.addr())
            .collect()
    }

    /// Applies the timeout rules as of `now`.
    ///
    /// - joining or active peers silent for longer than the suspect timeout
    ///   become suspect
    /// - peers suspect for at least the removal timeout are removed
    /// - tombstones older than the tombstone TTL are purged
    pub fn check(&self, now: Instant) -> DetectionReport {
        let local = self.directory.local_id();
        let mut report = DetectionReport::default();

        for record in self.directory.snapshot() {
            let id = record.member.id();
            if *id == local {
                continue;
            }
            match record.state {
                MemberState::Joining | MemberState::Active => {
                    let silent = now.duration_since(record.last_heartbeat_at);
                    if silent > self.config.suspect_timeout && self.directory.mark_suspect(id, now) {
                        warn!("member {} is suspect after {:?} without heartbeat", id, silent);
                        report.suspected.push(id.clone());
                    }
                }
                MemberState::Suspect => {
                    let suspect_for = now.duration_since(record.state_changed_at);
                    if suspect_for >= self.config.removal_timeout {
                        if let Some(departure) = self.directory.remove(id, now) {
                            warn!("member {} removed after {:?} as suspect", id, suspect_for);
                            report.removed.push(departure);
                        }
                    }
                }
                MemberState::Left => {}
            }
        }

        if let Some(cutoff) = now.checked_sub(self.config.tombstone_ttl) {
            report.purged = self.directory.purge_tombstones(cutoff);
            if report.purged > 0 {
                debug!("purged {} tombstones", report.purged);
            }
        }
        report
    }
}
