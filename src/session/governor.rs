//! Call timeout governor
//!
//! A call may last at most `max_duration`. One warning is sent
//! `warning_lead` before the cutoff.

use std::time::Duration;

/// Maximum call duration with an advance warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeoutPolicy {
    pub max_duration: Duration,
    pub warning_lead: Duration,
}

/// Delays from now until each timer should fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GovernorDeadlines {
    /// `None` when the warning point has already passed
    pub warning_in: Option<Duration>,
    pub hard_in: Duration,
}

impl Default for CallTimeoutPolicy {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(300),
            warning_lead: Duration::from_secs(30),
        }
    }
}

impl CallTimeoutPolicy {
    pub fn new(max_duration: Duration, warning_lead: Duration) -> Self {
        Self {
            max_duration,
            warning_lead,
        }
    }

    /// Offset from the call start at which the warning fires
    pub fn warning_at(&self) -> Duration {
        self.max_duration.saturating_sub(self.warning_lead)
    }

    /// Whether the warning can fire strictly before the hard cutoff
    pub fn has_warning(&self) -> bool {
        !self.warning_lead.is_zero() && self.warning_lead < self.max_duration
    }

    /// Time left in a call that has been active for `elapsed`
    pub fn remaining(&self, elapsed: Duration) -> Duration {
        self.max_duration.saturating_sub(elapsed)
    }

    /// Timer delays for a call that has been active for `elapsed`
    pub fn deadlines(&self, elapsed: Duration) -> GovernorDeadlines {
        let warning_in = if self.has_warning() && elapsed < self.warning_at() {
            Some(self.warning_at() - elapsed)
        } else {
            None
        };
        GovernorDeadlines {
            warning_in,
            hard_in: self.remaining(elapsed),
        }
    }

    /// Status shown to the caller when the warning fires
    pub fn warning_status(&self) -> String {
        format!("Call ending in {} seconds…", self.warning_lead.as_secs())
    }

    /// Turn sent to the service when the warning fires
    pub fn wrap_up_turn(&self) -> String {
        format!(
            "The call will end automatically in {} seconds. Start wrapping up the \
             conversation now.",
            self.warning_lead.as_secs()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_precedes_hard_cutoff() {
        for (max, lead) in [(300_000u64, 30_000u64), (2, 1), (1000, 999), (60_000, 59_999)] {
            let policy =
                CallTimeoutPolicy::new(Duration::from_millis(max), Duration::from_millis(lead));
            let deadlines = policy.deadlines(Duration::ZERO);
            let warning = deadlines.warning_in.unwrap();
            assert!(warning > Duration::ZERO);
            assert!(warning < deadlines.hard_in);
        }
    }

    #[test]
    fn test_deadlines_relative_to_start() {
        let policy = CallTimeoutPolicy::default();
        let deadlines = policy.deadlines(Duration::from_secs(100));
        assert_eq!(deadlines.warning_in, Some(Duration::from_secs(170)));
        assert_eq!(deadlines.hard_in, Duration::from_secs(200));

        // Past the warning point only the hard timer remains
        let late = policy.deadlines(Duration::from_secs(280));
        assert_eq!(late.warning_in, None);
        assert_eq!(late.hard_in, Duration::from_secs(20));
    }

    #[test]
    fn test_no_warning_without_lead() {
        let policy = CallTimeoutPolicy::new(Duration::from_secs(10), Duration::ZERO);
        assert!(!policy.has_warning());
        assert_eq!(policy.deadlines(Duration::ZERO).warning_in, None);
    }

    #[test]
    fn test_warning_text() {
        assert_eq!(
            CallTimeoutPolicy::default().warning_status(),
            "Call ending in 30 seconds…"
        );
    }
}
