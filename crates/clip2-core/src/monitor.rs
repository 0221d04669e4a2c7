//! Connection monitor state machine.
//!
//! Pure state: the session's check task reports the outcome of each
//! connection check and gets back the delay until the next one. All
//! retry budgets and backoff curves live here, with no timers attached,
//! so every schedule is testable as a plain sequence of transitions.

use std::time::Duration;

/// Number of pairing attempts before falling back to the heartbeat
/// interval. 600 tries at 500ms gives the user five minutes to press
/// the link button at the fast cadence.
const PAIRING_ATTEMPTS: u32 = 600;

/// Interval between pairing attempts while the budget lasts.
const PAIRING_INTERVAL: Duration = Duration::from_millis(500);

/// Number of fast reconnect attempts after the session degrades.
const RECONNECT_ATTEMPTS: u32 = 5;

/// Base delay of the reconnect backoff curve.
const RECONNECT_BASE: Duration = Duration::from_secs(60);

/// Outcome of one connection check, reported by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Bridge reachable, event stream alive.
    Online,
    /// Bridge reachable but the event stream is down.
    StreamDown,
    /// Bridge unreachable.
    Unreachable,
    /// The bridge rejected the application key.
    Unauthorized,
    /// A pairing attempt failed (link button not pressed yet).
    PairingFailed,
    /// A pairing attempt produced a fresh application key.
    Paired,
}

/// Observable state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No valid application key; not yet pairing.
    Unpaired,
    /// Pairing attempts in progress.
    Pairing { remaining: u32 },
    /// Connected, event stream alive.
    Connected,
    /// Connected before, now reconnecting.
    Degraded { remaining: u32 },
    /// Disposed; no further checks.
    Closed,
}

/// Pure retry/backoff state machine driving the connection check task.
#[derive(Debug)]
pub struct ConnectionMonitor {
    state: SessionState,
    heartbeat: Duration,
}

impl ConnectionMonitor {
    pub fn new(heartbeat: Duration) -> Self {
        Self {
            state: SessionState::Unpaired,
            heartbeat,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Stop scheduling checks. Terminal.
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Apply a check outcome, returning the delay until the next check.
    ///
    /// Budgets never give up for good: once a pairing or reconnect
    /// budget is exhausted the delay caps at the heartbeat interval and
    /// retries continue forever.
    pub fn on_outcome(&mut self, outcome: CheckOutcome) -> Duration {
        if self.state == SessionState::Closed {
            return self.heartbeat;
        }

        match outcome {
            CheckOutcome::Online => {
                self.state = SessionState::Connected;
                self.heartbeat
            }
            CheckOutcome::Paired => {
                self.state = SessionState::Connected;
                // Run the next check right away so the session comes up
                // without waiting out a heartbeat.
                Duration::ZERO
            }
            CheckOutcome::Unauthorized => {
                self.state = SessionState::Pairing {
                    remaining: PAIRING_ATTEMPTS,
                };
                PAIRING_INTERVAL
            }
            CheckOutcome::PairingFailed => {
                let remaining = match self.state {
                    SessionState::Pairing { remaining } => remaining.saturating_sub(1),
                    _ => PAIRING_ATTEMPTS,
                };
                self.state = SessionState::Pairing { remaining };
                if remaining == 0 {
                    self.heartbeat
                } else {
                    PAIRING_INTERVAL
                }
            }
            CheckOutcome::StreamDown | CheckOutcome::Unreachable => {
                let remaining = match self.state {
                    SessionState::Degraded { remaining } => remaining.saturating_sub(1),
                    // First failure after Connected (or from cold) starts
                    // a fresh reconnect budget.
                    _ => RECONNECT_ATTEMPTS,
                };
                self.state = SessionState::Degraded { remaining };
                self.reconnect_delay(remaining)
            }
        }
    }

    /// `min(heartbeat, base * 2^(attempts - remaining))`, so the curve
    /// doubles with each spent attempt and never exceeds the heartbeat.
    fn reconnect_delay(&self, remaining: u32) -> Duration {
        if remaining == 0 {
            return self.heartbeat;
        }
        let exponent = RECONNECT_ATTEMPTS.saturating_sub(remaining);
        let backoff = RECONNECT_BASE.saturating_mul(2_u32.saturating_pow(exponent));
        backoff.min(self.heartbeat)
    }
}
