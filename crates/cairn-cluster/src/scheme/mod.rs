//! Pluggable member discovery.
//!
//! A [`MembershipScheme`] finds the initial group and keeps announcing this
//! node so late joiners and healed partitions find it. Two schemes ship:
//! [`MulticastScheme`] for networks with multicast, and [`WkaScheme`] for a
//! fixed list of well-known addresses.

mod multicast;
mod wka;

pub use multicast::MulticastScheme;
pub use wka::WkaScheme;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::backoff::Backoff;
use crate::config::{ClusterConfig, MembershipSchemeConfig};
use crate::directory::{MemberDirectory, MergeOutcome};
use crate::error::ClusterError;
use crate::event_loop::{Handshakes, LoopEvent};
use crate::member::{Member, MemberId};
use crate::transport::WireChannel;

/// Discovery strategy.
///
/// `init` runs once before `join_group`. `join_group` returns once the node
/// is part of a group, possibly as its only member, and fails with
/// `MembershipFailed` when discovery cannot even send, or with
/// `MembershipInitialization` when the group is smaller than required.
/// `leave_group` is best effort.
#[async_trait]
pub trait MembershipScheme: Send + Sync {
    fn name(&self) -> &'static str;

    async fn init(&mut self, ctx: SchemeContext) -> Result<(), ClusterError>;

    async fn join_group(&mut self) -> Result<(), ClusterError>;

    async fn leave_group(&mut self) -> Result<(), ClusterError>;
}

pub type DynScheme = Box<dyn MembershipScheme>;

/// Builds the scheme named by the configuration.
pub fn build_scheme(config: &ClusterConfig) -> Result<DynScheme, ClusterError> {
    let scheme: DynScheme = match &config.membership_scheme {
        MembershipSchemeConfig::Multicast {
            group,
            discovery_interval_ms,
            ..
        } => Box::new(MulticastScheme::new(
            *group,
            Duration::from_millis(*discovery_interval_ms),
        )),
        MembershipSchemeConfig::Wka {
            members,
            wka_retry_interval_ms,
        } => Box::new(WkaScheme::new(
            members.clone(),
            Duration::from_millis(*wka_retry_interval_ms),
        )),
    };
    Ok(scheme)
}

/// Discovery limits shared by both schemes.
#[derive(Debug, Clone, Copy)]
pub struct JoinSettings {
    pub max_attempts: u32,
    /// How long one discovery round waits for answers.
    pub round_timeout: Duration,
    pub backoff: Backoff,
    pub minimum_members: usize,
}

impl From<&ClusterConfig> for JoinSettings {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            max_attempts: config.max_join_attempts,
            round_timeout: config.join_timeout(),
            backoff: Backoff::new(
                Duration::from_millis(config.join_backoff_base_ms),
                Duration::from_millis(config.join_backoff_max_ms),
            ),
            minimum_members: config.minimum_members_required,
        }
    }
}

/// What a scheme may touch: the directory (read), the wire, and the event
/// loop (for merging what it learns).
#[derive(Clone)]
pub struct SchemeContext {
    directory: Arc<MemberDirectory>,
    channel: WireChannel,
    queue: mpsc::Sender<LoopEvent>,
    handshakes: Arc<Handshakes>,
    shutdown: watch::Receiver<bool>,
    settings: JoinSettings,
}

impl SchemeContext {
    pub(crate) fn new(
        directory: Arc<MemberDirectory>,
        channel: WireChannel,
        queue: mpsc::Sender<LoopEvent>,
        handshakes: Arc<Handshakes>,
        shutdown: watch::Receiver<bool>,
        settings: JoinSettings,
    ) -> Self {
        Self {
            directory,
            channel,
            queue,
            handshakes,
            shutdown,
            settings,
        }
    }

    pub fn directory(&self) -> &Arc<MemberDirectory> {
        &self.directory
    }

    pub fn channel(&self) -> &WireChannel {
        &self.channel
    }

    pub fn settings(&self) -> &JoinSettings {
        &self.settings
    }

    /// The local member as currently known, incarnation included.
    pub fn local(&self) -> Member {
        self.directory.local()
    }

    /// Has the event loop merge `members` into the directory, keeping the
    /// higher incarnation per id. `responder` counts as heard from.
    pub async fn merge(
        &self,
        members: Vec<Member>,
        responder: Option<MemberId>,
    ) -> Result<MergeOutcome, ClusterError> {
        let (done, outcome) = oneshot::channel();
        let stopped = || ClusterError::Network("event loop is not running".into());
        self.queue
            .send(LoopEvent::Merge {
                members,
                responder,
                done,
            })
            .await
            .map_err(|_| stopped())?;
        outcome.await.map_err(|_| stopped())
    }

    /// Registers for the `JoinResponse` carrying `nonce`.
    pub fn expect_join_response(&self, nonce: u64) -> oneshot::Receiver<(MemberId, Vec<Member>)> {
        self.handshakes.register(nonce)
    }

    pub fn abandon_join_response(&self, nonce: u64) {
        self.handshakes.cancel(&nonce);
    }

    /// Members confirmed active, this node included. Members only heard
    /// about from a peer do not count until they speak to us.
    pub fn active_members(&self) -> usize {
        self.directory.group().len()
    }

    /// Waits up to one round timeout for at least `wanted` active members.
    /// Returns the active count at the end.
    pub async fn await_active_members(&self, wanted: usize) -> usize {
        let mut epochs = self.directory.subscribe();
        let _ = timeout(self.settings.round_timeout, async {
            while self.active_members() < wanted {
                if epochs.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        self.active_members()
    }

    /// Fails with `MembershipInitialization` if fewer members than required
    /// are active, counting this node.
    pub fn ensure_minimum_members(&self) -> Result<(), ClusterError> {
        let active = self.active_members();
        let required = self.settings.minimum_members;
        if active < required {
            return Err(ClusterError::MembershipInitialization(format!(
                "{required} members required, only {active} active"
            )));
        }
        Ok(())
    }

    /// Fires when the agent shuts down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }
}

/// A background task run every `period` until stopped or the agent shuts
/// down. Used for multicast announcements and WKA retries.
pub(crate) struct Periodic {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Periodic {
    pub fn spawn<F, Fut>(period: Duration, mut shutdown: watch::Receiver<bool>, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick fires immediately; the caller just did the work
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
        });
        Self { stop, task }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.task.await;
    }
}
