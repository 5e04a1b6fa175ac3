//! Voice session state and retry policy

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::VoiceTimings;
use crate::events::LoopState;

/// One continuous wake-to-idle interaction
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: Uuid,
    /// Created lazily by the bridge on the first turn
    pub conversation_id: Option<String>,
    pub state: LoopState,
    pub consecutive_failures: u32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            conversation_id: None,
            state: LoopState::Idle,
            consecutive_failures: 0,
            started_at: now,
            last_activity_at: now,
        }
    }

    /// Note that the user was heard or a turn completed
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Record a missed utterance and decide how long to wait
    pub fn record_failure(&mut self, timings: &VoiceTimings) -> RetryDecision {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let decision = retry_decision(self.consecutive_failures, timings);
        if matches!(decision, RetryDecision::Escalate { .. }) {
            self.consecutive_failures = 0;
        }
        decision
    }

    pub const fn reset_failures(&mut self) {
        self.consecutive_failures = 0;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// What to do after a missed utterance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait briefly, then listen again
    Retry { delay: Duration },
    /// Wait longer, tell the user we're still listening, then listen again
    Escalate { delay: Duration },
}

impl RetryDecision {
    #[must_use]
    pub const fn delay(self) -> Duration {
        match self {
            Self::Retry { delay } | Self::Escalate { delay } => delay,
        }
    }
}

/// Retry policy for `failures` consecutive misses (counted after this one)
///
/// Neither branch ends the session.
#[must_use]
pub const fn retry_decision(failures: u32, timings: &VoiceTimings) -> RetryDecision {
    if failures >= timings.max_consecutive_failures {
        RetryDecision::Escalate {
            delay: timings.escalation_delay,
        }
    } else {
        RetryDecision::Retry {
            delay: timings.retry_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_thresholds() {
        let timings = VoiceTimings::default();
        assert_eq!(
            retry_decision(1, &timings),
            RetryDecision::Retry {
                delay: Duration::from_millis(1500)
            }
        );
        assert_eq!(
            retry_decision(3, &timings),
            RetryDecision::Escalate {
                delay: Duration::from_millis(3000)
            }
        );
    }

    #[test]
    fn test_failures_cycle_without_ending() {
        let timings = VoiceTimings::default();
        let mut session = Session::new();

        let decisions: Vec<_> = (0..6).map(|_| session.record_failure(&timings)).collect();
        let escalations: Vec<bool> = decisions
            .iter()
            .map(|d| matches!(d, RetryDecision::Escalate { .. }))
            .collect();

        assert_eq!(escalations, vec![false, false, true, false, false, true]);
        assert_eq!(session.consecutive_failures, 0);
    }

    #[test]
    fn test_success_resets_count() {
        let timings = VoiceTimings::default();
        let mut session = Session::new();

        session.record_failure(&timings);
        session.record_failure(&timings);
        session.reset_failures();

        assert!(matches!(
            session.record_failure(&timings),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(session.consecutive_failures, 1);
    }
}
