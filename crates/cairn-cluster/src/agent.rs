//! The clustering agent: lifecycle and public API.
//!
//! An agent owns every component of one cluster member. `init()` spawns the
//! event loop and the frame receiver, runs the membership scheme's join and
//! then starts failure detection. `shutdown()` reverses that. Everything in
//! between goes through the event loop's queue.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::activity::{CoordinatedActivity, CoordinatedActivityRunner};
use crate::config::{BackpressurePolicy, ClusterConfig};
use crate::detector::{DetectorConfig, FailureDetector};
use crate::directory::{MemberDirectory, MemberRecord};
use crate::elector::{CoordinatorElector, CoordinatorView};
use crate::error::ClusterError;
use crate::event_loop::{run_receiver, EventLoop, Handshakes, LoopEvent, ReceiverContext};
use crate::listener::{GroupEventListener, ListenerId, ListenerRegistry};
use crate::member::{initial_incarnation, Member, MemberId};
use crate::messenger::{DeliveryReport, Dispatch, GroupMessenger, MessengerConfig};
use crate::scheme::{build_scheme, DynScheme, JoinSettings, SchemeContext};
use crate::transport::{DynTransport, WireChannel};

/// How long a background task gets to notice the shutdown signal before it
/// is aborted.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a [`ClusteringAgent`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Active,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Uninitialized => "uninitialized",
            AgentState::Initializing => "initializing",
            AgentState::Active => "active",
            AgentState::ShuttingDown => "shutting down",
            AgentState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// One member of a cluster.
///
/// Construct with [`ClusteringAgent::new`], register listeners, then call
/// [`init`](ClusteringAgent::init). All methods take `&self`, so the agent
/// can be shared behind an `Arc`.
pub struct ClusteringAgent {
    config: ClusterConfig,
    state: Mutex<AgentState>,
    directory: Arc<MemberDirectory>,
    elector: Arc<CoordinatorElector>,
    messenger: Arc<GroupMessenger>,
    listeners: Arc<ListenerRegistry>,
    runner: Arc<CoordinatedActivityRunner>,
    runner_id: ListenerId,
    channel: WireChannel,
    handshakes: Arc<Handshakes>,
    queue: mpsc::Sender<LoopEvent>,
    events: Mutex<Option<mpsc::Receiver<LoopEvent>>>,
    scheme: tokio::sync::Mutex<DynScheme>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    dropped: Arc<AtomicU64>,
}

impl ClusteringAgent {
    /// Creates an agent using the membership scheme named in `config`.
    pub fn new(config: ClusterConfig, transport: DynTransport) -> Result<Self, ClusterError> {
        let scheme = build_scheme(&config)?;
        Self::with_scheme(config, transport, scheme)
    }

    /// Creates an agent with a caller-supplied membership scheme.
    pub fn with_scheme(
        config: ClusterConfig,
        transport: DynTransport,
        scheme: DynScheme,
    ) -> Result<Self, ClusterError> {
        config.validate()?;

        let id = if config.node_id.is_empty() {
            MemberId::generate()
        } else {
            MemberId::new(config.node_id.clone())
        };
        let addr = config
            .advertise_addr
            .unwrap_or_else(|| transport.local_addr());
        if addr.ip().is_unspecified() {
            warn!(
                "{} advertises unspecified address {}; set advertise_addr so peers can reach it",
                id, addr
            );
        }
        let local = Member::new(id.clone(), addr)
            .with_incarnation(config.initial_incarnation.unwrap_or_else(initial_incarnation))
            .with_properties(config.properties.clone());

        let directory = Arc::new(MemberDirectory::new(local, Instant::now()));
        let channel = WireChannel::new(transport, config.domain.as_str());
        let (queue, events) = mpsc::channel(config.event_queue_capacity);
        let messenger = Arc::new(GroupMessenger::new(
            directory.clone(),
            channel.clone(),
            MessengerConfig::from(&config),
            queue.clone(),
        ));
        let listeners = Arc::new(ListenerRegistry::new());
        let runner = Arc::new(CoordinatedActivityRunner::new(id));
        let runner_id = listeners.add(runner.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            elector: Arc::new(CoordinatorElector::new(directory.clone())),
            config,
            state: Mutex::new(AgentState::Uninitialized),
            directory,
            messenger,
            listeners,
            runner,
            runner_id,
            channel,
            handshakes: Arc::new(Handshakes::new()),
            queue,
            events: Mutex::new(Some(events)),
            scheme: tokio::sync::Mutex::new(scheme),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    // -- lifecycle --

    /// Joins the group.
    ///
    /// Returns once the membership scheme has found the group (or started a
    /// new one) and failure detection is running. Any failure leaves the
    /// agent `Terminated` and is returned wrapped in `Initialization`.
    pub async fn init(&self) -> Result<(), ClusterError> {
        self.transition("init", AgentState::Uninitialized, AgentState::Initializing)?;
        let local = self.directory.local();
        info!(
            "initializing {} in domain '{}' on {}",
            local,
            self.config.domain,
            self.channel.local_addr()
        );

        match self.start().await {
            Ok(()) => {
                self.set_state(AgentState::Active);
                info!(
                    "{} is active: {} members, coordinator {}",
                    local.id(),
                    self.directory.group().len(),
                    self.elector
                        .view()
                        .coordinator_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "none".into())
                );
                Ok(())
            }
            Err(e) => {
                error!("{} failed to initialize: {}", local.id(), e);
                self.stop_tasks().await;
                self.set_state(AgentState::Terminated);
                Err(ClusterError::Initialization(Box::new(e)))
            }
        }
    }

    async fn start(&self) -> Result<(), ClusterError> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| ClusterError::illegal_state("init", AgentState::Initializing))?;

        let detector = FailureDetector::new(
            self.directory.clone(),
            DetectorConfig::from(&self.config),
        );
        let event_loop = EventLoop::new(
            self.directory.clone(),
            detector,
            self.elector.clone(),
            self.messenger.clone(),
            self.listeners.clone(),
            self.channel.clone(),
        );
        let receiver = ReceiverContext {
            transport: self.channel.transport().clone(),
            domain: Arc::from(self.channel.domain()),
            queue: self.queue.clone(),
            messenger: self.messenger.clone(),
            handshakes: self.handshakes.clone(),
            dropped: self.dropped.clone(),
        };
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(tokio::spawn(
                event_loop.run(events, self.shutdown_tx.subscribe()),
            ));
            tasks.push(tokio::spawn(run_receiver(
                receiver,
                self.shutdown_tx.subscribe(),
            )));
        }

        let ctx = SchemeContext::new(
            self.directory.clone(),
            self.channel.clone(),
            self.queue.clone(),
            self.handshakes.clone(),
            self.shutdown_tx.subscribe(),
            JoinSettings::from(&self.config),
        );
        {
            let mut scheme = self.scheme.lock().await;
            debug!("joining with the {} scheme", scheme.name());
            scheme.init(ctx).await?;
            scheme.join_group().await?;
        }

        let (done, started) = oneshot::channel();
        self.queue
            .send(LoopEvent::Start { done })
            .await
            .map_err(|_| loop_stopped())?;
        started.await.map_err(|_| loop_stopped())
    }

    /// Leaves the group and stops every background task.
    ///
    /// In-flight deliveries get `shutdown_grace_ms` to finish. A failed
    /// leave notice is logged, not returned; peers then notice the absence
    /// through missed heartbeats.
    pub async fn shutdown(&self) -> Result<(), ClusterError> {
        self.transition("shutdown", AgentState::Active, AgentState::ShuttingDown)?;
        let id = self.directory.local_id();
        let grace = self.config.shutdown_grace();
        info!("{} shutting down", id);

        let (done, stopped) = oneshot::channel();
        let queue = self.queue.clone();
        let halted = timeout(grace, async move {
            queue.send(LoopEvent::Stop { done }).await.ok()?;
            stopped.await.ok()
        })
        .await;
        if !matches!(halted, Ok(Some(()))) {
            warn!("event loop did not acknowledge stop");
        }

        if let Err(e) = self.scheme.lock().await.leave_group().await {
            warn!("{} could not announce its departure: {}", id, e);
        }

        self.messenger.close();
        if !self.messenger.drain(grace).await {
            warn!(
                "abandoning in-flight deliveries after {}ms",
                self.config.shutdown_grace_ms
            );
        }

        self.stop_tasks().await;
        self.set_state(AgentState::Terminated);
        info!("{} terminated", id);
        Ok(())
    }

    async fn stop_tasks(&self) {
        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for mut task in tasks {
            if timeout(TASK_STOP_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    fn transition(
        &self,
        operation: &'static str,
        from: AgentState,
        to: AgentState,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            return Err(ClusterError::illegal_state(operation, *state));
        }
        *state = to;
        Ok(())
    }

    fn set_state(&self, to: AgentState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    fn ensure_active(&self, operation: &'static str) -> Result<(), ClusterError> {
        match self.state() {
            AgentState::Active => Ok(()),
            state => Err(ClusterError::illegal_state(operation, state)),
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- messaging --

    /// Sends `payload` to every other active member.
    ///
    /// Resolves once each target acked or ran out of attempts. Fails with
    /// `MessageFailed` only when no target received the message.
    pub async fn send_message(
        &self,
        payload: impl Into<Bytes>,
    ) -> Result<DeliveryReport, ClusterError> {
        let dispatch = self
            .dispatch("send_message", payload.into(), None, false)
            .await?;
        dispatch.report().await
    }

    /// Sends `payload` to the listed members. Every id must be known.
    pub async fn send_message_to(
        &self,
        payload: impl Into<Bytes>,
        targets: &[MemberId],
    ) -> Result<DeliveryReport, ClusterError> {
        let dispatch = self
            .dispatch("send_message_to", payload.into(), Some(targets.to_vec()), false)
            .await?;
        dispatch.report().await
    }

    /// Sends `payload` to `target` and waits for its reply.
    ///
    /// The reply is whatever the target's first answering listener returned,
    /// or empty if none answered.
    pub async fn request(
        &self,
        target: &MemberId,
        payload: impl Into<Bytes>,
    ) -> Result<Bytes, ClusterError> {
        self.ensure_active("request")?;
        if *target == self.directory.local_id() {
            return Err(ClusterError::InvalidTarget(target.clone()));
        }
        let mut dispatch = self
            .dispatch("request", payload.into(), Some(vec![target.clone()]), true)
            .await?;
        let sequence = dispatch.message().sequence_number;
        let reply = dispatch
            .take_reply(target)
            .ok_or_else(|| ClusterError::InvalidTarget(target.clone()))?;

        if let Err(e) = dispatch.report().await {
            self.messenger.cancel_reply(target, sequence);
            return Err(e);
        }
        match timeout(self.messenger.request_timeout(), reply).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ClusterError::Network(format!(
                "reply from {target} abandoned"
            ))),
            Err(_) => {
                self.messenger.cancel_reply(target, sequence);
                Err(ClusterError::Timeout)
            }
        }
    }

    async fn dispatch(
        &self,
        operation: &'static str,
        payload: Bytes,
        targets: Option<Vec<MemberId>>,
        expects_reply: bool,
    ) -> Result<Dispatch, ClusterError> {
        self.ensure_active(operation)?;
        let (reply, dispatched) = oneshot::channel();
        self.enqueue(LoopEvent::Send {
            payload,
            targets,
            expects_reply,
            reply,
        })
        .await?;
        dispatched.await.map_err(|_| loop_stopped())?
    }

    /// Queues an application event, honoring the backpressure policy.
    async fn enqueue(&self, event: LoopEvent) -> Result<(), ClusterError> {
        match self.config.backpressure {
            BackpressurePolicy::FailFast => self.queue.try_send(event).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ClusterError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => loop_stopped(),
            }),
            BackpressurePolicy::Block { max_wait_ms } => {
                match timeout(Duration::from_millis(max_wait_ms), self.queue.send(event)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(loop_stopped()),
                    Err(_) => Err(ClusterError::Backpressure),
                }
            }
        }
    }

    // -- membership queries --

    /// Active members ordered by id, this node included.
    pub fn members(&self) -> Vec<Member> {
        self.directory.group()
    }

    pub fn coordinator(&self) -> Option<Member> {
        self.elector.coordinator()
    }

    pub fn is_coordinator(&self) -> bool {
        self.elector.is_coordinator(&self.directory.local_id())
    }

    pub fn coordinator_view(&self) -> CoordinatorView {
        self.elector.view()
    }

    pub fn local_member(&self) -> Member {
        self.directory.local()
    }

    /// Every known member that has not left, with its liveness state.
    pub fn directory_snapshot(&self) -> Vec<MemberRecord> {
        self.directory.snapshot()
    }

    /// Frames dropped because the event queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // -- registration --

    pub fn add_membership_listener(&self, listener: Arc<dyn GroupEventListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Unregisters a listener. Returns false if it was not registered.
    pub fn remove_membership_listener(&self, id: ListenerId) -> bool {
        if id == self.runner_id {
            return false;
        }
        self.listeners.remove(id)
    }

    /// Registers work to run whenever this node becomes coordinator. Runs
    /// immediately if it already is.
    pub fn register_coordinated_activity(&self, activity: Arc<dyn CoordinatedActivity>) {
        self.runner.register(activity);
    }
}

impl Drop for ClusteringAgent {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.get_mut().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

fn loop_stopped() -> ClusterError {
    ClusterError::Network("event loop is not running".into())
}
