//! Application callbacks for group events.
//!
//! Listeners run on the agent's event loop, one event at a time, in
//! registration order. A panicking listener is logged and skipped; the rest
//! still see the event.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use tracing::error;

use crate::member::MemberId;
use crate::message::ClusterMessage;

/// Receives membership changes and messages. Every method defaults to
/// doing nothing, so implementors only override what they need.
#[allow(unused_variables)]
pub trait GroupEventListener: Send + Sync {
    /// The coordinator changed to `new_leader`.
    fn on_leader_change(&self, new_leader: &MemberId) {}

    fn on_member_arrival(&self, member: &MemberId) {}

    fn on_member_departure(&self, member: &MemberId) {}

    /// A broadcast or targeted message that does not expect a reply.
    fn on_group_message(&self, sender: &MemberId, payload: &Bytes) {}

    /// A message that expects a reply. The first listener returning `Some`
    /// provides it; later listeners are not asked.
    fn on_peer_message(&self, sender: &MemberId, payload: &Bytes) -> Option<Bytes> {
        None
    }

    /// `message` could not be delivered to `target` within the configured
    /// attempts.
    fn on_delivery_failure(&self, target: &MemberId, message: &ClusterMessage) {}
}

/// Handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Events fanned out to listeners by the event loop.
#[derive(Debug, Clone)]
pub enum GroupEvent {
    LeaderChanged(MemberId),
    MemberArrived(MemberId),
    MemberDeparted(MemberId),
    GroupMessage { sender: MemberId, payload: Bytes },
    DeliveryFailed { target: MemberId, message: Arc<ClusterMessage> },
}

type Entry = (ListenerId, Arc<dyn GroupEventListener>);

/// Ordered set of registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: RwLock<Vec<Entry>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn GroupEventListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Listeners may register or remove listeners from inside a callback, so
    // dispatch works on a copy.
    fn current(&self) -> Vec<Entry> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Delivers `event` to every listener.
    pub fn dispatch(&self, event: &GroupEvent) {
        for (id, listener) in self.current() {
            guarded(id, || match event {
                GroupEvent::LeaderChanged(leader) => listener.on_leader_change(leader),
                GroupEvent::MemberArrived(member) => listener.on_member_arrival(member),
                GroupEvent::MemberDeparted(member) => listener.on_member_departure(member),
                GroupEvent::GroupMessage { sender, payload } => {
                    listener.on_group_message(sender, payload)
                }
                GroupEvent::DeliveryFailed { target, message } => {
                    listener.on_delivery_failure(target, message)
                }
            });
        }
    }

    /// Offers a reply-expecting message to listeners until one answers.
    pub fn dispatch_peer(&self, sender: &MemberId, payload: &Bytes) -> Option<Bytes> {
        for (id, listener) in self.current() {
            if let Some(Some(reply)) = guarded(id, || listener.on_peer_message(sender, payload)) {
                return Some(reply);
            }
        }
        None
    }
}

fn guarded<T>(id: ListenerId, f: impl FnOnce() -> T) -> Option<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            error!("{} panicked: {}", id, panic_message(&*panic));
            None
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
