//! Reconnection policy
//!
//! An abnormal close during an active call earns one reconnection attempt,
//! up to a per-call budget. Everything else ends the call.

use log::warn;
use std::time::Duration;

/// Outcome of an abnormal close
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again after `delay`
    Retry { attempt: u32, delay: Duration },
    GiveUp,
}

/// Tracks reconnection attempts for one call
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    delay: Duration,
    max_attempts: u32,
    attempts: u32,
    /// An attempt is running; a second close while it runs is not retried
    in_flight: bool,
}

impl ReconnectPolicy {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts,
            attempts: 0,
            in_flight: false,
        }
    }

    /// Decide what to do about an abnormal close
    pub fn on_abnormal_close(&mut self) -> ReconnectDecision {
        if self.in_flight {
            warn!("Connection lost again while reconnecting");
            return ReconnectDecision::GiveUp;
        }
        if self.attempts >= self.max_attempts {
            warn!(
                "Reconnect budget exhausted ({} of {})",
                self.attempts, self.max_attempts
            );
            return ReconnectDecision::GiveUp;
        }
        self.attempts += 1;
        self.in_flight = true;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.delay,
        }
    }

    /// The service acknowledged `Setup` on the new connection
    pub fn on_reconnected(&mut self) {
        self.in_flight = false;
    }

    /// Forget everything; called when a new call starts
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.in_flight = false;
    }
}
