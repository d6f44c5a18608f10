//! Worker lifecycle state machine.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Result, ServiceWorkerError, ServiceWorkerEvent};

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Created, install not started.
    #[default]
    Parsed,
    /// Install event running.
    Installing,
    /// Installed, waiting for activation.
    Waiting,
    /// Activate event running.
    Activating,
    /// Active and controlling pages.
    Active,
    /// Replaced, or install/activate failed. Terminal.
    Redundant,
}

impl ServiceWorkerState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Waiting)
                | (Waiting, Activating)
                | (Activating, Active)
                | (Installing | Waiting | Activating | Active, Redundant)
        )
    }
}

/// Lifecycle of one worker instance.
#[derive(Debug)]
pub struct Lifecycle {
    id: ServiceWorkerId,
    state: ServiceWorkerState,
    skip_waiting: bool,
    events: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl Lifecycle {
    /// Create a lifecycle in the `Parsed` state.
    pub fn new(events: mpsc::UnboundedSender<ServiceWorkerEvent>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            state: ServiceWorkerState::Parsed,
            skip_waiting: false,
            events,
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    /// Move to `next`, notifying the host.
    pub fn transition(&mut self, next: ServiceWorkerState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            warn!(worker = self.id.0, from = ?self.state, to = ?next, "Illegal state transition");
            return Err(ServiceWorkerError::StateError(format!(
                "cannot move from {:?} to {:?}",
                self.state, next
            )));
        }

        debug!(worker = self.id.0, from = ?self.state, to = ?next, "State change");
        self.state = next;
        let _ = self.events.send(ServiceWorkerEvent::StateChange {
            worker_id: self.id,
            new_state: next,
        });
        Ok(())
    }

    /// Mark redundant unless already there.
    pub fn make_redundant(&mut self) {
        if self.state != ServiceWorkerState::Redundant {
            // Parsed workers never ran, so go straight to the terminal state.
            if self.state == ServiceWorkerState::Parsed {
                self.state = ServiceWorkerState::Redundant;
            } else {
                let _ = self.transition(ServiceWorkerState::Redundant);
            }
        }
    }

    /// Ask to activate as soon as install completes.
    pub fn request_skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting
    }
}
