//! Work that only the coordinator should do.
//!
//! Activities registered with the runner execute once each time this node
//! becomes coordinator. The runner is itself a [`GroupEventListener`],
//! registered ahead of application listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{error, info};

use crate::listener::{panic_message, GroupEventListener};
use crate::member::MemberId;

pub type ActivityError = Box<dyn std::error::Error + Send + Sync>;

/// A task to run when this node takes over as coordinator.
pub trait CoordinatedActivity: Send + Sync {
    fn name(&self) -> &str {
        "activity"
    }

    fn execute(&self) -> Result<(), ActivityError>;
}

impl<F> CoordinatedActivity for F
where
    F: Fn() -> Result<(), ActivityError> + Send + Sync,
{
    fn execute(&self) -> Result<(), ActivityError> {
        self()
    }
}

pub struct CoordinatedActivityRunner {
    local_id: MemberId,
    activities: RwLock<Vec<Arc<dyn CoordinatedActivity>>>,
    coordinating: AtomicBool,
}

impl CoordinatedActivityRunner {
    pub fn new(local_id: MemberId) -> Self {
        Self {
            local_id,
            activities: RwLock::new(Vec::new()),
            coordinating: AtomicBool::new(false),
        }
    }

    /// Adds an activity. If this node is already coordinator it runs now,
    /// on the caller's thread; otherwise it waits for the next takeover.
    pub fn register(&self, activity: Arc<dyn CoordinatedActivity>) {
        let run_now = {
            let mut activities = self.activities.write().unwrap_or_else(|e| e.into_inner());
            activities.push(activity.clone());
            self.coordinating.load(Ordering::SeqCst)
        };
        if run_now {
            run(activity.as_ref());
        }
    }

    pub fn is_coordinating(&self) -> bool {
        self.coordinating.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.activities.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl GroupEventListener for CoordinatedActivityRunner {
    fn on_leader_change(&self, new_leader: &MemberId) {
        let now = *new_leader == self.local_id;
        // flip the flag and copy the list under one lock so a concurrent
        // register() runs its activity exactly once
        let (was, pending) = {
            let activities = self.activities.read().unwrap_or_else(|e| e.into_inner());
            let was = self.coordinating.swap(now, Ordering::SeqCst);
            (was, activities.clone())
        };
        match (was, now) {
            (false, true) => {
                info!(
                    "{} became coordinator, running {} activities",
                    self.local_id,
                    pending.len()
                );
                for activity in &pending {
                    run(activity.as_ref());
                }
            }
            (true, false) => info!("{} is no longer coordinator ({} took over)", self.local_id, new_leader),
            _ => {}
        }
    }
}

fn run(activity: &dyn CoordinatedActivity) {
    match catch_unwind(AssertUnwindSafe(|| activity.execute())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("coordinated activity '{}' failed: {}", activity.name(), e),
        Err(panic) => error!(
            "coordinated activity '{}' panicked: {}",
            activity.name(),
            panic_message(&*panic)
        ),
    }
}
