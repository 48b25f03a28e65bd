use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Caller-visible effects of the orchestrator's state transitions.
///
/// Rendering (toasts, panels, spoken feedback) lives outside this crate;
/// subscribers decide what any of these look like.
#[derive(Debug, Clone)]
pub enum DoorEvent {
    StreamStarted { device_id: u32, label: String },
    StreamStopped,
    Unlocked { name: String, at: DateTime<Utc> },
    Relocked,
    AttemptFailed { attempt: u32, max_attempts: u32 },
    CooldownArmed { duration: Duration },
    EnrollmentCaptured { variation: String, index: usize, total: usize },
    EnrollmentCompleted { name: String, captured: Vec<String> },
    EnrollmentCancelled { name: String, captured: usize },
}

/// Broadcast hub decoupling state transitions from any rendering concern.
#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<DoorEvent>,
}

impl EventBus {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        Self { events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DoorEvent> {
        self.events.subscribe()
    }

    pub fn publish(&self, event: DoorEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.events.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A pending unlock produced by a successful recognition.
#[derive(Debug, Clone)]
pub struct PendingUnlock {
    pub name: String,
    pub issued_at: DateTime<Utc>,
    expires_at: Instant,
}

/// One-shot command signal for the door actuator.
///
/// The actuator polls `take`; a command is handed out at most once and never
/// after its TTL has passed. Re-arming replaces any unconsumed command.
#[derive(Clone)]
pub struct UnlockLatch {
    pending: Arc<Mutex<Option<PendingUnlock>>>,
    ttl: Duration,
}

impl UnlockLatch {
    pub fn new(ttl: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(None)),
            ttl,
        }
    }

    pub fn arm(&self, name: &str) {
        let command = PendingUnlock {
            name: name.to_string(),
            issued_at: Utc::now(),
            expires_at: Instant::now() + self.ttl,
        };
        *self.pending.lock().unwrap() = Some(command);
    }

    /// Consume the pending command, if one exists and has not expired.
    pub fn take(&self) -> Option<PendingUnlock> {
        let mut guard = self.pending.lock().unwrap();
        let command = guard.take()?;
        if Instant::now() >= command.expires_at {
            return None;
        }
        Some(command)
    }

    pub fn is_pending(&self) -> bool {
        let guard = self.pending.lock().unwrap();
        guard
            .as_ref()
            .map(|c| Instant::now() < c.expires_at)
            .unwrap_or(false)
    }

    pub fn clear(&self) {
        self.pending.lock().unwrap().take();
    }
}
