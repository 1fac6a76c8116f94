//! Double-trigger confirmation latch for destructive actions.
//!
//! The first `trigger` arms the gate and schedules a timeout; a second `trigger`
//! before the timeout confirms. The timeout is a deadline rather than a spawned
//! timer: it is checked on every trigger and by `poll_expired`, and cancelling it
//! is just dropping the deadline, so it can never fire after a confirm or disarm.

use std::time::Duration;

use tokio::time::Instant;

/// Default confirmation window.
pub const DEFAULT_CONFIRM_WINDOW: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Armed { deadline: Instant },
}

/// Result of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The gate was armed; the guarded action has not run.
    AwaitingConfirmation,
    /// The gate was confirmed; the guarded action should run now.
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct ConfirmGate {
    window: Duration,
    state: GateState,
}

impl Default for ConfirmGate {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRM_WINDOW)
    }
}

impl ConfirmGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: GateState::Idle,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// Whether the gate is waiting for a confirming trigger right now.
    pub fn is_armed(&self) -> bool {
        match self.state {
            GateState::Idle => false,
            GateState::Armed { deadline } => Instant::now() < deadline,
        }
    }

    /// Pending timeout, if armed.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            GateState::Idle => None,
            GateState::Armed { deadline } => Some(deadline),
        }
    }

    pub fn trigger(&mut self) -> Trigger {
        let now = Instant::now();
        match self.state {
            GateState::Armed { deadline } if now < deadline => {
                self.state = GateState::Idle;
                Trigger::Confirmed
            }
            _ => {
                self.state = GateState::Armed {
                    deadline: now + self.window,
                };
                Trigger::AwaitingConfirmation
            }
        }
    }

    /// Triggers the gate and runs `action` only when the trigger confirms.
    pub fn run<T>(&mut self, action: impl FnOnce() -> T) -> Option<T> {
        match self.trigger() {
            Trigger::Confirmed => Some(action()),
            Trigger::AwaitingConfirmation => None,
        }
    }

    /// Returns to `Idle` without running anything.
    pub fn disarm(&mut self) {
        self.state = GateState::Idle;
    }

    /// Applies the timeout. Returns `true` exactly once per expired arming, so the
    /// caller can drop its "confirm?" cue.
    pub fn poll_expired(&mut self) -> bool {
        match self.state {
            GateState::Armed { deadline } if Instant::now() >= deadline => {
                self.state = GateState::Idle;
                true
            }
            _ => false,
        }
    }
}
