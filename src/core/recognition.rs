use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::camera::FrameSource;
use crate::common::config::RecognitionConfig;
use crate::core::detector::DetectedFace;
use crate::events::{DoorEvent, EventBus, UnlockLatch};
use crate::service::{AttemptOutcome, RecognitionBackend};

/// Controller phase. The cooldown is not a phase of its own; it gates the
/// Idle -> Scanning transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Scanning,
    Recognized,
    Unknown,
}

/// Handle for one issued attempt. Responses carry it back so results from a
/// superseded run can be told apart and discarded.
#[derive(Debug, Clone, Copy)]
pub struct AttemptTicket {
    generation: u64,
}

/// State change produced by a response, for the driver to act on.
#[derive(Debug)]
pub enum Transition {
    Unlocked {
        name: String,
        confidence: Option<f32>,
        best_variation: Option<String>,
    },
    Rejected {
        attempt: u32,
        cooldown_armed: bool,
    },
}

/// The sole mutable control block of the attempt controller: phase,
/// activity flag, attempt accounting, cooldown gate.
///
/// Pure state machine; the async driver feeds it instants so every timing
/// rule is testable without a clock.
#[derive(Debug)]
pub struct AutoRecognition {
    phase: Phase,
    is_active: bool,
    attempt_count: u32,
    max_attempts: u32,
    min_spacing: Duration,
    cooldown: Duration,
    unknown_hold: Duration,
    cooldown_until: Option<Instant>,
    last_attempt_at: Option<Instant>,
    hold_until: Option<Instant>,
    generation: u64,
}

impl AutoRecognition {
    pub fn new(config: &RecognitionConfig) -> Self {
        Self {
            phase: Phase::Idle,
            is_active: false,
            attempt_count: 0,
            max_attempts: config.max_attempts,
            min_spacing: config.min_spacing(),
            cooldown: config.cooldown(),
            unknown_hold: config.unknown_hold(),
            cooldown_until: None,
            last_attempt_at: None,
            hold_until: None,
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    pub fn cooldown_until(&self) -> Option<Instant> {
        self.cooldown_until
    }

    /// Activate the loop: attempt accounting restarts and any armed
    /// cooldown is cleared.
    pub fn start(&mut self) {
        self.is_active = true;
        self.attempt_count = 0;
        self.cooldown_until = None;
    }

    /// Deactivate and force Idle. Outstanding responses are fenced off by
    /// the generation bump and will be discarded on arrival.
    pub fn stop(&mut self) {
        self.is_active = false;
        self.phase = Phase::Idle;
        self.hold_until = None;
        self.generation += 1;
    }

    /// One scheduling tick. Returns a ticket when the controller enters
    /// Scanning and an attempt must be issued now.
    pub fn on_tick(&mut self, now: Instant, face_present: bool) -> Option<AttemptTicket> {
        match self.phase {
            // Single-flight: a tick during Scanning is a no-op.
            Phase::Scanning | Phase::Recognized => return None,
            Phase::Unknown => {
                match self.hold_until {
                    Some(until) if now < until => return None,
                    _ => {
                        self.phase = Phase::Idle;
                        self.hold_until = None;
                    }
                }
            }
            Phase::Idle => {}
        }

        if !self.is_active || !face_present {
            return None;
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                return None;
            }
            // Cooldown has passed; attempts resume without external help.
            self.cooldown_until = None;
        }
        if self.attempt_count >= self.max_attempts {
            return None;
        }
        if let Some(last) = self.last_attempt_at {
            if now.duration_since(last) < self.min_spacing {
                return None;
            }
        }

        // Entering Scanning. Accounting happens at request time, so a stuck
        // response can never wedge the schedule.
        self.phase = Phase::Scanning;
        self.attempt_count += 1;
        self.last_attempt_at = Some(now);
        Some(AttemptTicket {
            generation: self.generation,
        })
    }

    /// Apply the response for an issued attempt. Returns `None` when the
    /// response is stale (controller stopped or restarted since the
    /// request) and must not mutate anything further.
    pub fn on_response(
        &mut self,
        now: Instant,
        ticket: AttemptTicket,
        outcome: &AttemptOutcome,
    ) -> Option<Transition> {
        if ticket.generation != self.generation || self.phase != Phase::Scanning {
            return None;
        }

        match outcome {
            AttemptOutcome::Recognized {
                name,
                confidence,
                best_variation,
                ..
            } => {
                self.phase = Phase::Recognized;
                // Stops the loop entirely; a restart is an explicit call.
                self.is_active = false;
                Some(Transition::Unlocked {
                    name: name.clone(),
                    confidence: *confidence,
                    best_variation: best_variation.clone(),
                })
            }
            AttemptOutcome::Unknown { .. } => {
                self.phase = Phase::Unknown;
                self.hold_until = Some(now + self.unknown_hold);
                let attempt = self.attempt_count;
                let cooldown_armed = self.attempt_count >= self.max_attempts;
                if cooldown_armed {
                    self.cooldown_until = Some(now + self.cooldown);
                    self.attempt_count = 0;
                }
                Some(Transition::Rejected {
                    attempt,
                    cooldown_armed,
                })
            }
        }
    }

    /// Scheduled return to Idle/locked after the settle period. Applies
    /// only if this unlock is still the current one.
    pub fn relock(&mut self, ticket: AttemptTicket) -> bool {
        if ticket.generation != self.generation || self.phase != Phase::Recognized {
            return false;
        }
        self.phase = Phase::Idle;
        true
    }
}

/// Everything the controller needs from the rest of the system.
pub struct ControllerHandles {
    pub frames: Arc<dyn FrameSource>,
    pub backend: Arc<dyn RecognitionBackend>,
    pub faces: watch::Receiver<Vec<DetectedFace>>,
    pub streaming: watch::Receiver<bool>,
    pub events: EventBus,
    pub latch: UnlockLatch,
}

struct ControllerInner {
    state: Mutex<AutoRecognition>,
    frames: Arc<dyn FrameSource>,
    backend: Arc<dyn RecognitionBackend>,
    faces: watch::Receiver<Vec<DetectedFace>>,
    streaming: watch::Receiver<bool>,
    events: EventBus,
    latch: UnlockLatch,
    settle: Duration,
    max_attempts: u32,
    cooldown: Duration,
}

/// Drives [`AutoRecognition`] on its own cadence, independent of the
/// detection poller. One instance lives for the process lifetime.
pub struct RecognitionController {
    inner: Arc<ControllerInner>,
    interval: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl RecognitionController {
    pub fn new(config: &RecognitionConfig, handles: ControllerHandles) -> Self {
        let inner = ControllerInner {
            state: Mutex::new(AutoRecognition::new(config)),
            frames: handles.frames,
            backend: handles.backend,
            faces: handles.faces,
            streaming: handles.streaming,
            events: handles.events,
            latch: handles.latch,
            settle: config.settle(),
            max_attempts: config.max_attempts,
            cooldown: config.cooldown(),
        };
        Self {
            inner: Arc::new(inner),
            interval: config.interval(),
            handle: Mutex::new(None),
        }
    }

    /// Activate auto recognition and ensure the scheduling loop is running.
    /// Idempotent: a second call while running only resets the accounting.
    pub fn start_auto_recognition(&self) {
        self.inner.state.lock().unwrap().start();

        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }
        let inner = self.inner.clone();
        let interval = self.interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                inner.tick();
            }
        }));
    }

    /// Deactivate and cancel the scheduling timer. Responses still in
    /// flight are discarded on arrival.
    pub fn stop_auto_recognition(&self) {
        self.deactivate();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Force Idle/inactive without tearing the loop down; used when the
    /// stream stops underneath the controller.
    pub fn deactivate(&self) {
        self.inner.state.lock().unwrap().stop();
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().is_active()
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().unwrap().phase()
    }
}

impl Drop for RecognitionController {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl ControllerInner {
    fn tick(self: &Arc<Self>) {
        let now = Instant::now();

        if !*self.streaming.borrow() {
            let mut state = self.state.lock().unwrap();
            if state.is_active() {
                state.stop();
            }
            return;
        }

        let face_present = !self.faces.borrow().is_empty();
        let ticket = self.state.lock().unwrap().on_tick(now, face_present);
        let Some(ticket) = ticket else {
            return;
        };

        tracing::debug!("recognition attempt issued");
        match self.frames.capture_frame() {
            Some(frame) => match frame.to_base64_jpeg() {
                Ok(image) => {
                    let inner = self.clone();
                    tokio::spawn(async move {
                        let outcome = inner.backend.recognize(&image).await;
                        inner.apply_response(ticket, outcome);
                    });
                }
                Err(e) => {
                    tracing::warn!("frame encoding failed: {e}");
                    self.apply_response(ticket, AttemptOutcome::Unknown { message: None });
                }
            },
            None => {
                // No frame to send; the attempt resolves as a failure.
                self.apply_response(ticket, AttemptOutcome::Unknown { message: None });
            }
        }
    }

    fn apply_response(self: &Arc<Self>, ticket: AttemptTicket, outcome: AttemptOutcome) {
        let now = Instant::now();
        let transition = self
            .state
            .lock()
            .unwrap()
            .on_response(now, ticket, &outcome);

        match transition {
            Some(Transition::Unlocked { name, .. }) => {
                tracing::info!("recognized {name}; unlocking");
                self.latch.arm(&name);
                self.events.publish(DoorEvent::Unlocked {
                    name,
                    at: Utc::now(),
                });
                self.schedule_relock(ticket);
            }
            Some(Transition::Rejected {
                attempt,
                cooldown_armed,
            }) => {
                tracing::debug!("attempt {attempt}/{} unknown", self.max_attempts);
                self.events.publish(DoorEvent::AttemptFailed {
                    attempt,
                    max_attempts: self.max_attempts,
                });
                if cooldown_armed {
                    tracing::info!("max attempts reached; cooling down");
                    self.events.publish(DoorEvent::CooldownArmed {
                        duration: self.cooldown,
                    });
                }
            }
            None => {
                tracing::debug!("discarding stale recognition response");
            }
        }
    }

    fn schedule_relock(self: &Arc<Self>, ticket: AttemptTicket) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.settle).await;
            if inner.state.lock().unwrap().relock(ticket) {
                inner.events.publish(DoorEvent::Relocked);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    fn config() -> RecognitionConfig {
        RecognitionConfig::default()
    }

    fn unknown() -> AttemptOutcome {
        AttemptOutcome::Unknown { message: None }
    }

    fn recognized(name: &str) -> AttemptOutcome {
        AttemptOutcome::Recognized {
            name: name.into(),
            confidence: Some(0.9),
            distance: None,
            threshold: None,
            best_variation: None,
        }
    }

    #[test]
    fn idle_until_started() {
        let mut state = AutoRecognition::new(&config());
        let t0 = Instant::now();
        assert!(state.on_tick(t0, true).is_none());

        state.start();
        assert!(state.on_tick(t0, true).is_some());
    }

    #[test]
    fn no_attempt_without_a_face() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        assert!(state.on_tick(Instant::now(), false).is_none());
    }

    #[test]
    fn tick_during_scanning_is_a_no_op() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        let ticket = state.on_tick(t0, true).unwrap();
        assert_eq!(state.phase(), Phase::Scanning);

        // Ticks keep arriving while the request is outstanding.
        for i in 1..10u32 {
            assert!(state.on_tick(t0 + i * 1000 * MS, true).is_none());
        }
        assert_eq!(state.attempt_count(), 1);

        // Response resolves the attempt; the next spaced tick may issue.
        state.on_response(t0 + 10_000 * MS, ticket, &unknown());
        assert_eq!(state.phase(), Phase::Unknown);
    }

    #[test]
    fn attempts_respect_min_spacing() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        let ticket = state.on_tick(t0, true).unwrap();
        state.on_response(t0 + 100 * MS, ticket, &unknown());

        // Unknown hold has passed by +1600 ms, but spacing has not.
        assert!(state.on_tick(t0 + 1600 * MS, true).is_none());
        assert!(state.on_tick(t0 + 2000 * MS, true).is_some());
    }

    #[test]
    fn ten_unknowns_arm_cooldown_and_suppress_next_attempt() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        // Ten consecutive failures spaced 2 s apart.
        let mut last_response_at = t0;
        for i in 0..10u32 {
            let at = t0 + i * 2000 * MS;
            let ticket = state.on_tick(at, true).unwrap();
            assert_eq!(state.attempt_count(), i + 1);
            last_response_at = at + 100 * MS;
            let transition = state.on_response(last_response_at, ticket, &unknown());
            match transition {
                Some(Transition::Rejected {
                    attempt,
                    cooldown_armed,
                }) => {
                    assert_eq!(attempt, i + 1);
                    assert_eq!(cooldown_armed, i == 9);
                }
                other => panic!("unexpected transition {other:?}"),
            }
        }

        // Cooldown armed: count reset, activity unchanged.
        assert_eq!(state.attempt_count(), 0);
        assert!(state.is_active());
        let cooldown_until = state.cooldown_until().unwrap();
        assert_eq!(cooldown_until, last_response_at + 30_000 * MS);

        // The eleventh attempt before expiry is suppressed.
        assert!(state.on_tick(cooldown_until - 1000 * MS, true).is_none());

        // After expiry attempts resume with no external call.
        assert!(state.on_tick(cooldown_until + 1000 * MS, true).is_some());
        assert_eq!(state.attempt_count(), 1);
    }

    #[test]
    fn success_deactivates_and_blocks_further_attempts() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        let ticket = state.on_tick(t0, true).unwrap();
        let transition = state.on_response(t0 + 200 * MS, ticket, &recognized("alice"));
        match transition {
            Some(Transition::Unlocked { name, .. }) => assert_eq!(name, "alice"),
            other => panic!("unexpected transition {other:?}"),
        }
        assert_eq!(state.phase(), Phase::Recognized);
        assert!(!state.is_active());

        // No attempts while unlocked, and none after the relock either,
        // until an explicit restart.
        assert!(state.on_tick(t0 + 5000 * MS, true).is_none());
        assert!(state.relock(ticket));
        assert_eq!(state.phase(), Phase::Idle);
        assert!(state.on_tick(t0 + 10_000 * MS, true).is_none());

        state.start();
        assert_eq!(state.attempt_count(), 0);
        assert!(state.on_tick(t0 + 12_000 * MS, true).is_some());
    }

    #[test]
    fn stop_discards_in_flight_response() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        let ticket = state.on_tick(t0, true).unwrap();
        state.stop();
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.is_active());

        // The late response must not mutate anything.
        assert!(state
            .on_response(t0 + 500 * MS, ticket, &recognized("alice"))
            .is_none());
        assert_eq!(state.phase(), Phase::Idle);
        assert!(!state.is_active());
    }

    #[test]
    fn response_from_previous_run_is_discarded_after_restart() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        let stale = state.on_tick(t0, true).unwrap();
        state.stop();
        state.start();

        assert!(state.on_response(t0 + 300 * MS, stale, &recognized("mallory")).is_none());
        assert!(state.is_active());
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn relock_does_not_apply_after_restart() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        let ticket = state.on_tick(t0, true).unwrap();
        state.on_response(t0 + 100 * MS, ticket, &recognized("alice"));

        // Stop and restart before the settle timer fires.
        state.stop();
        state.start();
        assert!(!state.relock(ticket));
    }

    #[test]
    fn start_clears_cooldown() {
        let mut state = AutoRecognition::new(&config());
        state.start();
        let t0 = Instant::now();

        let mut at = t0;
        for i in 0..10u32 {
            at = t0 + i * 2000 * MS;
            let ticket = state.on_tick(at, true).unwrap();
            state.on_response(at + 100 * MS, ticket, &unknown());
        }
        assert!(state.cooldown_until().is_some());

        state.start();
        assert!(state.cooldown_until().is_none());
        assert_eq!(state.attempt_count(), 0);
        // hold from the last Unknown has passed well before this tick
        assert!(state.on_tick(at + 5000 * MS, true).is_some());
    }

    #[test]
    fn unknown_hold_delays_return_to_idle() {
        let mut config = config();
        config.min_spacing_ms = 0;
        let mut state = AutoRecognition::new(&config);
        state.start();
        let t0 = Instant::now();

        let ticket = state.on_tick(t0, true).unwrap();
        state.on_response(t0, ticket, &unknown());
        assert_eq!(state.phase(), Phase::Unknown);

        // Held: even with zero spacing no attempt starts yet.
        assert!(state.on_tick(t0 + 1000 * MS, true).is_none());
        assert_eq!(state.phase(), Phase::Unknown);

        // Hold expired: back to Idle and straight into the next attempt.
        assert!(state.on_tick(t0 + 1500 * MS, true).is_some());
    }
}
