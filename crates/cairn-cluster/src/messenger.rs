//! Reliable group messaging.
//!
//! Sending: the event loop calls [`GroupMessenger::dispatch`], which assigns
//! the next sequence number and queues the message on one delivery lane per
//! target. A lane is a task that sends one message at a time, waits for the
//! receiver's ack and retries with backoff, so each target sees a sender's
//! messages in sequence order. The caller awaits the per-target outcomes
//! through the returned [`Dispatch`].
//!
//! Receiving: every data frame is acked, then checked against the
//! [`SeenCache`] so retried copies are delivered to listeners only once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::agent::AgentState;
use crate::backoff::Backoff;
use crate::config::ClusterConfig;
use crate::correlate::Correlator;
use crate::dedup::{Acceptance, SeenCache};
use crate::directory::MemberDirectory;
use crate::error::ClusterError;
use crate::event_loop::LoopEvent;
use crate::member::{MemberId, MemberState};
use crate::message::{ClusterMessage, WireMessage, MAX_PAYLOAD_LEN};
use crate::transport::WireChannel;

type DeliveryResult = Result<(), ClusterError>;
type ResponseKey = (MemberId, u64);

#[derive(Debug, Clone, Copy)]
pub struct MessengerConfig {
    pub max_delivery_attempts: u32,
    pub ack_timeout: Duration,
    pub retry_backoff: Backoff,
    pub request_timeout: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
}

impl From<&ClusterConfig> for MessengerConfig {
    fn from(config: &ClusterConfig) -> Self {
        let m = &config.messaging;
        let base = Duration::from_millis(m.retry_backoff_ms);
        Self {
            max_delivery_attempts: m.max_delivery_attempts,
            ack_timeout: Duration::from_millis(m.ack_timeout_ms),
            retry_backoff: Backoff::new(base, base.saturating_mul(16)),
            request_timeout: Duration::from_millis(m.request_timeout_ms),
            dedup_capacity: m.dedup_capacity,
            dedup_ttl: Duration::from_millis(m.dedup_ttl_ms),
        }
    }
}

/// Per-target outcome of a send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub sequence_number: u64,
    pub delivered: Vec<MemberId>,
    pub failed: Vec<MemberId>,
}

impl DeliveryReport {
    /// True when no target failed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A message handed to the delivery lanes.
pub struct Dispatch {
    message: Arc<ClusterMessage>,
    pending: Vec<(MemberId, oneshot::Receiver<DeliveryResult>)>,
    replies: HashMap<MemberId, oneshot::Receiver<Bytes>>,
}

impl Dispatch {
    pub fn message(&self) -> &Arc<ClusterMessage> {
        &self.message
    }

    pub fn targets(&self) -> impl Iterator<Item = &MemberId> {
        self.pending.iter().map(|(id, _)| id)
    }

    /// Takes the reply receiver for `target`, if the message expects one.
    pub fn take_reply(&mut self, target: &MemberId) -> Option<oneshot::Receiver<Bytes>> {
        self.replies.remove(target)
    }

    /// Waits for every lane to finish with this message.
    ///
    /// Fails with `MessageFailed` only when every target failed; partial
    /// failures are listed in the report. No targets is an empty success.
    pub async fn report(self) -> Result<DeliveryReport, ClusterError> {
        let sequence = self.message.sequence_number;
        let mut report = DeliveryReport {
            sequence_number: sequence,
            ..Default::default()
        };
        for (target, outcome) in self.pending {
            match outcome.await {
                Ok(Ok(())) => report.delivered.push(target),
                Ok(Err(e)) => {
                    debug!("message {} to {} failed: {}", sequence, target, e);
                    report.failed.push(target);
                }
                Err(_) => report.failed.push(target),
            }
        }
        if report.delivered.is_empty() && !report.failed.is_empty() {
            return Err(ClusterError::MessageFailed {
                sequence,
                failed: report.failed,
            });
        }
        Ok(report)
    }
}

struct LaneJob {
    message: Arc<ClusterMessage>,
    frame: Bytes,
    done: oneshot::Sender<DeliveryResult>,
}

struct Lane {
    tx: mpsc::UnboundedSender<LaneJob>,
    task: JoinHandle<()>,
}

/// Counts queued or running deliveries so shutdown can wait for them.
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn start(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn get(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.get() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// What a lane task needs. Kept separate from the messenger so lanes do not
/// keep it alive.
#[derive(Clone)]
struct LaneContext {
    target: MemberId,
    directory: Arc<MemberDirectory>,
    channel: WireChannel,
    acks: Arc<Correlator<ResponseKey, ()>>,
    in_flight: Arc<InFlight>,
    failures: mpsc::Sender<LoopEvent>,
    config: MessengerConfig,
}

impl LaneContext {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<LaneJob>) {
        while let Some(job) = jobs.recv().await {
            let result = self.deliver(&job).await;
            if result.is_err() {
                let event = LoopEvent::DeliveryFailed {
                    target: self.target.clone(),
                    message: job.message.clone(),
                };
                // waits for room; fails only once the loop has stopped
                if self.failures.send(event).await.is_err() {
                    debug!(
                        "event loop gone, delivery failure of message {} to {} not reported",
                        job.message.sequence_number, self.target
                    );
                }
            }
            let _ = job.done.send(result);
            self.in_flight.finish();
        }
        trace!("delivery lane to {} closed", self.target);
    }

    async fn deliver(&self, job: &LaneJob) -> DeliveryResult {
        let seq = job.message.sequence_number;
        let key = (self.target.clone(), seq);
        let attempts = self.config.max_delivery_attempts;

        for attempt in 1..=attempts {
            let addr = match self.directory.get(&self.target) {
                Some(record) if record.state != MemberState::Left => record.member.addr(),
                _ => {
                    return Err(ClusterError::Network(format!(
                        "{} left before message {} was acknowledged",
                        self.target, seq
                    )))
                }
            };

            let ack = self.acks.register(key.clone());
            match self.channel.send_frame(addr, job.frame.clone()).await {
                Ok(()) => {
                    if let Ok(Ok(())) = timeout(self.config.ack_timeout, ack).await {
                        return Ok(());
                    }
                    trace!("no ack from {} for message {} (attempt {})", self.target, seq, attempt);
                }
                Err(e @ ClusterError::MessageTooLarge { .. }) => {
                    // retrying cannot make the frame fit
                    self.acks.cancel(&key);
                    warn!("message {} to {} not sent: {}", seq, self.target, e);
                    return Err(e);
                }
                Err(e) => debug!("sending message {} to {} failed: {}", seq, self.target, e),
            }
            self.acks.cancel(&key);

            if attempt < attempts {
                sleep(self.config.retry_backoff.delay(attempt)).await;
            }
        }

        warn!("giving up on message {} to {} after {} attempts", seq, self.target, attempts);
        Err(ClusterError::Network(format!(
            "no ack from {} after {} attempts",
            self.target, attempts
        )))
    }
}

pub struct GroupMessenger {
    directory: Arc<MemberDirectory>,
    channel: WireChannel,
    config: MessengerConfig,
    next_seq: AtomicU64,
    acks: Arc<Correlator<ResponseKey, ()>>,
    replies: Correlator<ResponseKey, Bytes>,
    lanes: Mutex<HashMap<MemberId, Lane>>,
    seen: Mutex<SeenCache>,
    in_flight: Arc<InFlight>,
    failures: mpsc::Sender<LoopEvent>,
    closed: AtomicBool,
}

impl GroupMessenger {
    pub(crate) fn new(
        directory: Arc<MemberDirectory>,
        channel: WireChannel,
        config: MessengerConfig,
        failures: mpsc::Sender<LoopEvent>,
    ) -> Self {
        Self {
            directory,
            channel,
            config,
            next_seq: AtomicU64::new(0),
            acks: Arc::new(Correlator::new()),
            replies: Correlator::new(),
            lanes: Mutex::new(HashMap::new()),
            seen: Mutex::new(SeenCache::new(config.dedup_capacity, config.dedup_ttl)),
            in_flight: Arc::new(InFlight::default()),
            failures,
            closed: AtomicBool::new(false),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout
    }

    /// Deliveries queued or in progress.
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    /// Assigns a sequence number and queues the message for its targets.
    ///
    /// `targets` of `None` means every active member except this one.
    /// Explicit targets must all be in the directory. The local member is
    /// never a target.
    pub fn dispatch(
        &self,
        payload: Bytes,
        targets: Option<&[MemberId]>,
        expects_reply: bool,
    ) -> Result<Dispatch, ClusterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClusterError::illegal_state("send", AgentState::ShuttingDown));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ClusterError::MessageTooLarge {
                size: payload.len(),
                limit: MAX_PAYLOAD_LEN,
            });
        }

        let local = self.directory.local();
        let (recipients, target_ids) = match targets {
            None => {
                let recipients: Vec<MemberId> = self
                    .directory
                    .group()
                    .into_iter()
                    .map(|m| m.id().clone())
                    .filter(|id| id != local.id())
                    .collect();
                (recipients, Vec::new())
            }
            Some(ids) => {
                if let Some(unknown) = ids.iter().find(|id| !self.directory.contains(id)) {
                    return Err(ClusterError::InvalidTarget(unknown.clone()));
                }
                let mut recipients: Vec<MemberId> =
                    ids.iter().filter(|id| *id != local.id()).cloned().collect();
                recipients.sort();
                recipients.dedup();
                (recipients, ids.to_vec())
            }
        };

        let sequence_number = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let message = Arc::new(ClusterMessage {
            sender_id: local.id().clone(),
            sender_incarnation: local.incarnation(),
            sequence_number,
            payload,
            target_ids,
            expects_reply,
        });
        // a rejected message leaves a gap in the sequence; receivers only
        // rely on it increasing
        let frame = self.channel.encode_checked(WireMessage::Data((*message).clone()))?;

        let mut pending = Vec::with_capacity(recipients.len());
        let mut replies = HashMap::new();
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        for target in recipients {
            if expects_reply {
                let rx = self.replies.register((target.clone(), sequence_number));
                replies.insert(target.clone(), rx);
            }
            let (done, outcome) = oneshot::channel();
            let job = LaneJob {
                message: message.clone(),
                frame: frame.clone(),
                done,
            };
            self.in_flight.start();
            let lane = lanes
                .entry(target.clone())
                .or_insert_with(|| self.spawn_lane(target.clone()));
            if let Err(mpsc::error::SendError(job)) = lane.tx.send(job) {
                self.in_flight.finish();
                let _ = job
                    .done
                    .send(Err(ClusterError::Network(format!("lane to {target} is closed"))));
            }
            pending.push((target, outcome));
        }

        trace!(
            "dispatched message {} to {} targets",
            sequence_number,
            pending.len()
        );
        Ok(Dispatch {
            message,
            pending,
            replies,
        })
    }

    fn spawn_lane(&self, target: MemberId) -> Lane {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = LaneContext {
            target,
            directory: self.directory.clone(),
            channel: self.channel.clone(),
            acks: self.acks.clone(),
            in_flight: self.in_flight.clone(),
            failures: self.failures.clone(),
            config: self.config,
        };
        let task = tokio::spawn(ctx.run(rx));
        Lane { tx, task }
    }

    /// Resolves a pending ack. Returns false for late or unknown acks.
    pub fn complete_ack(&self, acker: &MemberId, sequence: u64) -> bool {
        self.acks.complete(&(acker.clone(), sequence), ())
    }

    pub fn complete_reply(&self, responder: &MemberId, sequence: u64, payload: Bytes) -> bool {
        self.replies.complete(&(responder.clone(), sequence), payload)
    }

    pub fn cancel_reply(&self, responder: &MemberId, sequence: u64) {
        self.replies.cancel(&(responder.clone(), sequence));
    }

    /// Decides whether an incoming message is new.
    pub fn accept(&self, message: &ClusterMessage, now: Instant) -> Acceptance {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).accept(
            &message.sender_id,
            message.sender_incarnation,
            message.sequence_number,
            now,
        )
    }

    /// Ages out the duplicate cache.
    pub fn expire(&self, now: Instant) {
        let expired = self.seen.lock().unwrap_or_else(|e| e.into_inner()).expire(now);
        if expired > 0 {
            trace!("expired {} dedup entries", expired);
        }
    }

    /// Drops the lane and dedup state for a departed member. Messages still
    /// queued on the lane fail once the lane sees the member is gone.
    pub fn forget(&self, member: &MemberId) {
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(member);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .forget(member);
    }

    /// Refuses further dispatches.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Waits up to `grace` for in-flight deliveries, then stops every lane.
    /// Returns true if everything finished in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = timeout(grace, self.in_flight.wait_idle()).await.is_ok();
        let lanes: Vec<Lane> = self
            .lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, lane)| lane)
            .collect();
        for lane in lanes {
            lane.task.abort();
        }
        self.acks.clear();
        self.replies.clear();
        drained
    }
}
