//! Reconnect policy shared by the duplex and stream managers.
//!
//! [`BackoffPolicy`] is pure: given an attempt index and the reason the last
//! connection ended it answers "how long to wait" and "should we stop".
//! [`Reconnect`] is the small bit of per-connection bookkeeping (the attempt
//! counter) both managers drive from their connection loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::failure::FailureClass;

/// WebSocket close code for a policy violation.
const POLICY_VIOLATION: u16 = 1008;

/// Fixed delay table with a hard retry ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Delay before reconnect `n` is `delays[n]`; the last entry is the cap.
    #[serde(with = "crate::millis::list")]
    pub delays: Vec<Duration>,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_millis(400),
                Duration::from_millis(1200),
                Duration::from_millis(3000),
            ],
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn new(delays: Vec<Duration>, max_retries: u32) -> Self {
        Self {
            delays,
            max_retries,
        }
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let index = usize::try_from(attempt).unwrap_or(usize::MAX);
        self.delays
            .get(index)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or_default()
    }

    pub fn should_give_up(&self, attempt: u32, reason: &CloseReason) -> bool {
        reason.is_policy_violation() || attempt >= self.max_retries
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The manager closed the channel itself (disconnect or terminal event).
    Intentional,
    Transient(String),
    /// Closed deliberately by the server; reconnecting would not help.
    PolicyViolation {
        description: String,
        class: FailureClass,
    },
}

impl CloseReason {
    /// Classify a WebSocket close frame.
    pub fn from_close_frame(code: u16, reason: &str) -> Self {
        let description = if reason.is_empty() {
            format!("channel closed with code {code}")
        } else {
            format!("{reason} (code {code})")
        };
        // the reason is server prose, never a URL or an id we built
        let class = FailureClass::from_close_code(code).worse(FailureClass::classify(reason));
        if code == POLICY_VIOLATION || (4400..=4499).contains(&code) || class.is_session_fatal() {
            Self::PolicyViolation { description, class }
        } else {
            Self::Transient(description)
        }
    }

    /// Classify an HTTP rejection of the connection request.
    pub fn from_http_status(status: u16, canonical: Option<&str>) -> Self {
        let description = match canonical {
            Some(text) => format!("handshake rejected: HTTP {status} {text}"),
            None => format!("handshake rejected: HTTP {status}"),
        };
        let class = FailureClass::from_http_status(status);
        if class.is_session_fatal() {
            Self::PolicyViolation { description, class }
        } else {
            Self::Transient(description)
        }
    }

    pub fn is_intentional(&self) -> bool {
        matches!(self, Self::Intentional)
    }

    pub fn is_policy_violation(&self) -> bool {
        matches!(self, Self::PolicyViolation { .. })
    }

    pub fn class(&self) -> FailureClass {
        match self {
            Self::PolicyViolation { class, .. } => *class,
            Self::Intentional | Self::Transient(_) => FailureClass::Transient,
        }
    }

    pub fn description(&self) -> &str {
        match self {
            Self::Intentional => "closed by client",
            Self::Transient(text) | Self::PolicyViolation { description: text, .. } => text,
        }
    }
}

/// How one connection attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// Whether the channel reached `Open` before closing.
    pub opened: bool,
    pub reason: CloseReason,
}

impl Attempt {
    pub fn never_opened(reason: CloseReason) -> Self {
        Self {
            opened: false,
            reason,
        }
    }

    pub fn after_open(reason: CloseReason) -> Self {
        Self {
            opened: true,
            reason,
        }
    }
}

/// Decision after a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Next {
    /// Wait `delay`, then open attempt number `attempt`.
    Retry { attempt: u32, delay: Duration },
    /// Stop for good; `message` is the error to report.
    GiveUp { message: String, class: FailureClass },
    /// Closed on purpose, nothing to report.
    Done,
}

/// Attempt counter for one logical connection.
#[derive(Debug, Clone)]
pub struct Reconnect {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Reconnect {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The counter resets on every successful open and advances on every
    /// close-then-retry.
    pub fn after(&mut self, outcome: &Attempt) -> Next {
        if outcome.reason.is_intentional() {
            return Next::Done;
        }
        if outcome.opened {
            self.attempt = 0;
        }
        if self.policy.should_give_up(self.attempt, &outcome.reason) {
            let message = if outcome.reason.is_policy_violation() || self.attempt == 0 {
                outcome.reason.description().to_owned()
            } else {
                format!(
                    "gave up after {} reconnect attempts: {}",
                    self.attempt,
                    outcome.reason.description()
                )
            };
            return Next::GiveUp {
                message,
                class: outcome.reason.class(),
            };
        }
        let delay = self.policy.next_delay(self.attempt);
        self.attempt += 1;
        Next::Retry {
            attempt: self.attempt,
            delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> CloseReason {
        CloseReason::Transient("connection reset".into())
    }

    #[test]
    fn delays_follow_table_and_clamp_to_last() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next_delay(0), Duration::from_millis(400));
        assert_eq!(policy.next_delay(1), Duration::from_millis(1200));
        assert_eq!(policy.next_delay(2), Duration::from_millis(3000));
        assert_eq!(policy.next_delay(9), Duration::from_millis(3000));
        assert_eq!(BackoffPolicy::new(Vec::new(), 1).next_delay(3), Duration::ZERO);
    }

    #[test]
    fn gives_up_at_or_beyond_retry_ceiling() {
        let policy = BackoffPolicy::default();
        assert!(!policy.should_give_up(4, &transient()));
        for attempt in 5..12 {
            assert!(policy.should_give_up(attempt, &transient()));
            let violation = CloseReason::PolicyViolation {
                description: "x".into(),
                class: FailureClass::Transient,
            };
            assert!(policy.should_give_up(attempt, &violation));
        }
    }

    #[test]
    fn policy_violation_short_circuits_at_first_attempt() {
        let policy = BackoffPolicy::default();
        let reason = CloseReason::from_close_frame(1008, "bad run id");
        assert!(policy.should_give_up(0, &reason));
    }

    #[test]
    fn close_frames_are_classified() {
        assert!(CloseReason::from_close_frame(4401, "").is_policy_violation());
        assert!(CloseReason::from_close_frame(1000, "thread not found").is_policy_violation());
        assert!(!CloseReason::from_close_frame(1011, "server restarting").is_policy_violation());
        assert!(!CloseReason::from_close_frame(4500, "").is_policy_violation());
        assert!(CloseReason::from_http_status(401, Some("Unauthorized")).is_policy_violation());
        assert!(!CloseReason::from_http_status(503, None).is_policy_violation());
    }

    #[test]
    fn close_class_comes_from_codes_and_server_reason() {
        let missing = CloseReason::from_close_frame(4404, "");
        assert_eq!(missing.class(), FailureClass::SessionFatal);
        // rate limited: stop reconnecting, but the run itself is still there
        let limited = CloseReason::from_close_frame(4429, "slow down");
        assert!(limited.is_policy_violation());
        assert_eq!(limited.class(), FailureClass::Transient);
        let policy = CloseReason::from_close_frame(1008, "thread not found");
        assert_eq!(policy.class(), FailureClass::SessionFatal);
        assert_eq!(transient().class(), FailureClass::Transient);
        assert_eq!(
            CloseReason::from_http_status(403, Some("Forbidden")).class(),
            FailureClass::SessionFatal
        );
    }

    #[test]
    fn reconnect_counts_retries_and_resets_on_open() {
        let policy =
            BackoffPolicy::new(vec![Duration::from_millis(10), Duration::from_millis(20)], 3);
        let mut reconnect = Reconnect::new(policy);
        let failed = Attempt::never_opened(transient());

        assert_eq!(
            reconnect.after(&failed),
            Next::Retry { attempt: 1, delay: Duration::from_millis(10) }
        );
        assert_eq!(
            reconnect.after(&failed),
            Next::Retry { attempt: 2, delay: Duration::from_millis(20) }
        );
        // an open in between starts the table over
        assert_eq!(
            reconnect.after(&Attempt::after_open(transient())),
            Next::Retry { attempt: 1, delay: Duration::from_millis(10) }
        );
        assert_eq!(
            reconnect.after(&failed),
            Next::Retry { attempt: 2, delay: Duration::from_millis(20) }
        );
        assert_eq!(
            reconnect.after(&failed),
            Next::Retry { attempt: 3, delay: Duration::from_millis(20) }
        );
        assert!(matches!(
            reconnect.after(&failed),
            Next::GiveUp { message, class: FailureClass::Transient }
                if message.starts_with("gave up after 3")
        ));
    }

    #[test]
    fn exhausted_retries_stay_transient_whatever_the_text() {
        let mut reconnect = Reconnect::new(BackoffPolicy::new(Vec::new(), 0));
        let refused = Attempt::never_opened(CloseReason::Transient(
            "error sending request for url (http://127.0.0.1:1/threads/t1/runs/404/stream)".into(),
        ));
        assert!(matches!(
            reconnect.after(&refused),
            Next::GiveUp { class: FailureClass::Transient, .. }
        ));
    }

    #[test]
    fn intentional_close_is_done() {
        let mut reconnect = Reconnect::new(BackoffPolicy::default());
        assert_eq!(
            reconnect.after(&Attempt::after_open(CloseReason::Intentional)),
            Next::Done
        );
    }

    #[test]
    fn policy_deserializes_from_milliseconds() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"delays":[5,10],"max_retries":2}"#).unwrap();
        assert_eq!(policy.delays, vec![Duration::from_millis(5), Duration::from_millis(10)]);
        assert_eq!(policy.max_retries, 2);
        let partial: BackoffPolicy = serde_json::from_str(r#"{"max_retries":1}"#).unwrap();
        assert_eq!(partial.delays.len(), 3);
    }
}
