//! The agent's event loop and frame receiver.
//!
//! One loop task owns every steady-state directory mutation and every
//! listener callback, so membership changes and application messages reach
//! listeners in a single order. It never waits on the network: outgoing
//! frames are handed to short-lived send tasks.
//!
//! The receiver task decodes frames off the transport. Acks, replies and
//! handshake responses go straight to whoever is waiting for them; the rest
//! is queued for the loop with `try_send`, and dropped when the queue is
//! full.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::dedup::Acceptance;
use crate::detector::FailureDetector;
use crate::directory::{Departure, HeartbeatOutcome, MemberDirectory, MergeOutcome};
use crate::elector::CoordinatorElector;
use crate::error::ClusterError;
use crate::listener::{GroupEvent, ListenerRegistry};
use crate::member::{Member, MemberId, MemberState};
use crate::message::{fit_members, ClusterMessage, Envelope, WireMessage};
use crate::messenger::{Dispatch, GroupMessenger};
use crate::transport::{DynTransport, WireChannel};

/// Pending WKA handshakes, keyed by nonce.
pub(crate) type Handshakes = crate::correlate::Correlator<u64, (MemberId, Vec<Member>)>;

pub(crate) enum LoopEvent {
    /// A decoded frame from a peer.
    Inbound { message: WireMessage, from: SocketAddr },
    /// Members learned by a membership scheme. `responder` is confirmed
    /// alive by the exchange itself.
    Merge {
        members: Vec<Member>,
        responder: Option<MemberId>,
        done: oneshot::Sender<MergeOutcome>,
    },
    /// Application send.
    Send {
        payload: Bytes,
        targets: Option<Vec<MemberId>>,
        expects_reply: bool,
        reply: oneshot::Sender<Result<Dispatch, ClusterError>>,
    },
    DeliveryFailed {
        target: MemberId,
        message: Arc<ClusterMessage>,
    },
    /// Joining finished: start failure detection and leader tracking.
    Start { done: oneshot::Sender<()> },
    /// Shutting down: stop failure detection.
    Stop { done: oneshot::Sender<()> },
}

pub(crate) struct EventLoop {
    local_id: MemberId,
    directory: Arc<MemberDirectory>,
    detector: FailureDetector,
    elector: Arc<CoordinatorElector>,
    messenger: Arc<GroupMessenger>,
    listeners: Arc<ListenerRegistry>,
    channel: WireChannel,
    running: bool,
    announced_leader: Option<MemberId>,
}

impl EventLoop {
    pub fn new(
        directory: Arc<MemberDirectory>,
        detector: FailureDetector,
        elector: Arc<CoordinatorElector>,
        messenger: Arc<GroupMessenger>,
        listeners: Arc<ListenerRegistry>,
        channel: WireChannel,
    ) -> Self {
        Self {
            local_id: directory.local_id(),
            directory,
            detector,
            elector,
            messenger,
            listeners,
            channel,
            running: false,
            announced_leader: None,
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<LoopEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(self.detector.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event);
                    // drain whatever else is ready before re-evaluating
                    while let Ok(event) = events.try_recv() {
                        self.handle(event);
                    }
                    self.refresh_leader();
                }
                _ = ticker.tick(), if self.running => {
                    self.on_tick(Instant::now());
                    self.refresh_leader();
                }
            }
        }
        debug!("event loop for {} stopped", self.local_id);
    }

    fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Inbound { message, from } => self.on_frame(message, from),
            LoopEvent::Merge {
                members,
                responder,
                done,
            } => {
                let now = Instant::now();
                let outcome = self.directory.merge(members, now);
                if let Some(id) = responder {
                    self.on_heartbeat(&id, now);
                }
                let _ = done.send(outcome);
            }
            LoopEvent::Send {
                payload,
                targets,
                expects_reply,
                reply,
            } => {
                let result = self
                    .messenger
                    .dispatch(payload, targets.as_deref(), expects_reply);
                let _ = reply.send(result);
            }
            LoopEvent::DeliveryFailed { target, message } => {
                self.listeners
                    .dispatch(&GroupEvent::DeliveryFailed { target, message });
            }
            LoopEvent::Start { done } => {
                self.running = true;
                self.refresh_leader();
                let _ = done.send(());
            }
            LoopEvent::Stop { done } => {
                self.running = false;
                let _ = done.send(());
            }
        }
    }

    fn on_frame(&mut self, message: WireMessage, from: SocketAddr) {
        trace!("{} from {}", message.kind(), from);
        match message {
            WireMessage::Announce {
                member,
                reply_requested,
            } => {
                let addr = member.addr();
                if self.admit(member) && reply_requested {
                    self.send(
                        addr,
                        WireMessage::Announce {
                            member: self.directory.local(),
                            reply_requested: false,
                        },
                    );
                }
            }
            WireMessage::JoinRequest { nonce, member } => {
                let addr = member.addr();
                if self.admit(member) {
                    let response = self.join_response(nonce, addr);
                    self.send(addr, response);
                }
            }
            WireMessage::JoinResponse {
                responder, members, ..
            } => {
                // a response that arrived after its handshake gave up
                let now = Instant::now();
                self.directory.merge(members, now);
                self.on_heartbeat(&responder, now);
            }
            WireMessage::Heartbeat { member } => {
                self.admit(member);
            }
            WireMessage::Leave { id, incarnation } => {
                let current = self
                    .directory
                    .get(&id)
                    .filter(|r| r.state != MemberState::Left && r.member.incarnation() <= incarnation);
                if current.is_some() {
                    if let Some(departure) = self.directory.remove(&id, Instant::now()) {
                        info!("member {} left the group", id);
                        self.on_departure(departure);
                    }
                }
            }
            WireMessage::Departed { id, incarnation } => {
                if id == self.local_id && incarnation >= self.directory.local().incarnation() {
                    self.refute(incarnation, from);
                }
            }
            WireMessage::Data(message) => self.on_data(message, from),
            WireMessage::DataAck { acker, sequence } => {
                self.messenger.complete_ack(&acker, sequence);
            }
            WireMessage::Reply {
                responder,
                sequence,
                payload,
            } => {
                self.messenger.complete_reply(&responder, sequence, payload);
            }
        }
    }

    /// Upserts a member that just spoke to us and counts it as a heartbeat.
    /// Returns false if the member was not accepted.
    fn admit(&mut self, member: Member) -> bool {
        if *member.id() == self.local_id {
            return false;
        }
        let now = Instant::now();
        let id = member.id().clone();
        let addr = member.addr();
        match self.directory.upsert(member, now) {
            Ok(_) => {
                self.on_heartbeat(&id, now);
                true
            }
            Err(ClusterError::StaleIncarnation {
                offered, stored, ..
            }) => {
                let departed = self
                    .directory
                    .get(&id)
                    .is_some_and(|r| r.state == MemberState::Left);
                if departed {
                    debug!(
                        "{} is still talking at departed incarnation {}; telling it to rejoin",
                        id, offered
                    );
                    self.send(
                        addr,
                        WireMessage::Departed {
                            id,
                            incarnation: stored,
                        },
                    );
                } else {
                    trace!("ignoring stale incarnation {} of {}", offered, id);
                }
                false
            }
            Err(e) => {
                warn!("rejected update for {}: {}", id, e);
                false
            }
        }
    }

    /// This node's view for a joining member: itself first, then active
    /// members, then the rest, cut to what one frame can carry.
    fn join_response(&self, nonce: u64, to: SocketAddr) -> WireMessage {
        let mut records: Vec<_> = self
            .directory
            .snapshot()
            .into_iter()
            .filter(|r| r.member.id() != &self.local_id)
            .collect();
        records.sort_by_key(|r| r.state != MemberState::Active);
        let mut members = vec![self.directory.local()];
        members.extend(records.into_iter().map(|r| r.member));

        let header = self
            .channel
            .encode(WireMessage::JoinResponse {
                nonce,
                responder: self.local_id.clone(),
                members: Vec::new(),
            })
            .len();
        let budget = self.channel.max_frame_len().saturating_sub(header);
        let total = members.len();
        let cut = fit_members(&mut members, budget);
        if cut > 0 {
            warn!(
                "join response to {} lists {} of {} members to fit one frame",
                to,
                total - cut,
                total
            );
        }
        WireMessage::JoinResponse {
            nonce,
            responder: self.local_id.clone(),
            members,
        }
    }

    fn on_heartbeat(&mut self, id: &MemberId, now: Instant) {
        match self.directory.mark_heartbeat(id, now) {
            HeartbeatOutcome::Promoted {
                first_arrival: true,
                ..
            } => {
                info!("member {} joined the group", id);
                self.listeners
                    .dispatch(&GroupEvent::MemberArrived(id.clone()));
            }
            HeartbeatOutcome::Promoted { from, .. } => {
                info!("member {} is {} again (was {})", id, MemberState::Active, from);
            }
            HeartbeatOutcome::Refreshed | HeartbeatOutcome::Unknown => {}
        }
    }

    fn on_departure(&mut self, departure: Departure) {
        let id = departure.member.id().clone();
        self.messenger.forget(&id);
        if departure.arrived {
            self.listeners.dispatch(&GroupEvent::MemberDeparted(id));
        }
    }

    /// Some peer declared this incarnation departed: come back with a
    /// higher one and tell everyone.
    fn refute(&mut self, departed: u64, from: SocketAddr) {
        let local = self.directory.bump_local_incarnation(departed.saturating_add(1));
        info!(
            "{} was declared departed at incarnation {}; rejoining as {}",
            self.local_id,
            departed,
            local.incarnation()
        );
        let mut targets = self.detector.heartbeat_targets();
        if !targets.contains(&from) {
            targets.push(from);
        }
        let channel = self.channel.clone();
        let message = WireMessage::Announce {
            member: local,
            reply_requested: true,
        };
        tokio::spawn(async move {
            channel.send_all(targets, message).await;
        });
    }

    fn on_data(&mut self, message: ClusterMessage, from: SocketAddr) {
        let sequence = message.sequence_number;
        self.send(
            from,
            WireMessage::DataAck {
                acker: self.local_id.clone(),
                sequence,
            },
        );

        match self.messenger.accept(&message, Instant::now()) {
            Acceptance::Fresh => {}
            verdict => {
                trace!(
                    "dropping {:?} message {} from {}",
                    verdict,
                    sequence,
                    message.sender_id
                );
                return;
            }
        }

        if message.expects_reply {
            let reply = self
                .listeners
                .dispatch_peer(&message.sender_id, &message.payload)
                .unwrap_or_default();
            self.send(
                from,
                WireMessage::Reply {
                    responder: self.local_id.clone(),
                    sequence,
                    payload: reply,
                },
            );
        } else {
            self.listeners.dispatch(&GroupEvent::GroupMessage {
                sender: message.sender_id,
                payload: message.payload,
            });
        }
    }

    fn on_tick(&mut self, now: Instant) {
        let report = self.detector.check(now);
        for departure in report.removed {
            self.on_departure(departure);
        }
        self.messenger.expire(now);

        let targets = self.detector.heartbeat_targets();
        if !targets.is_empty() {
            let channel = self.channel.clone();
            let message = WireMessage::Heartbeat {
                member: self.directory.local(),
            };
            tokio::spawn(async move {
                channel.send_all(targets, message).await;
            });
        }
    }

    /// Fires `LeaderChanged` when the elected coordinator differs from the
    /// last one announced.
    fn refresh_leader(&mut self) {
        if !self.running {
            return;
        }
        let view = self.elector.view();
        if view.coordinator_id == self.announced_leader {
            return;
        }
        self.announced_leader = view.coordinator_id.clone();
        if let Some(leader) = view.coordinator_id {
            info!("coordinator is now {} (epoch {})", leader, view.epoch);
            self.listeners.dispatch(&GroupEvent::LeaderChanged(leader));
        }
    }

    fn send(&self, to: SocketAddr, message: WireMessage) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let kind = message.kind();
            if let Err(e) = channel.send(to, message).await {
                debug!("{} to {} failed: {}", kind, to, e);
            }
        });
    }
}

/// Shared with the receiver task.
pub(crate) struct ReceiverContext {
    pub transport: DynTransport,
    pub domain: Arc<str>,
    pub queue: mpsc::Sender<LoopEvent>,
    pub messenger: Arc<GroupMessenger>,
    pub handshakes: Arc<Handshakes>,
    pub dropped: Arc<AtomicU64>,
}

pub(crate) async fn run_receiver(ctx: ReceiverContext, mut shutdown: watch::Receiver<bool>) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = ctx.transport.recv() => received,
        };
        let (frame, from) = match received {
            Ok(datagram) => datagram,
            Err(ClusterError::TransportClosed) => {
                debug!("transport closed, receiver stopping");
                break;
            }
            Err(e) => {
                warn!("receive failed: {}", e);
                continue;
            }
        };
        let envelope = match Envelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("dropping malformed frame from {}: {}", from, e);
                continue;
            }
        };
        if envelope.domain != *ctx.domain {
            trace!("ignoring frame for domain '{}' from {}", envelope.domain, from);
            continue;
        }
        route(&ctx, envelope.message, from);
    }
}

fn route(ctx: &ReceiverContext, message: WireMessage, from: SocketAddr) {
    let message = match message {
        WireMessage::DataAck { acker, sequence } => {
            ctx.messenger.complete_ack(&acker, sequence);
            return;
        }
        WireMessage::Reply {
            responder,
            sequence,
            payload,
        } => {
            ctx.messenger.complete_reply(&responder, sequence, payload);
            return;
        }
        WireMessage::JoinResponse {
            nonce,
            responder,
            members,
        } => {
            // try the waiting handshake first; if it already gave up, the
            // loop merges the response anyway
            match ctx.handshakes.take(&nonce) {
                Some(waiter) => {
                    let _ = waiter.send((responder, members));
                    return;
                }
                None => WireMessage::JoinResponse {
                    nonce,
                    responder,
                    members,
                },
            }
        }
        other => other,
    };
    if ctx
        .queue
        .try_send(LoopEvent::Inbound { message, from })
        .is_err()
    {
        let dropped = ctx.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("event queue full, dropped frame from {} ({} so far)", from, dropped);
    }
}
