//! Failure classification.
//!
//! A transport that stops for good reports a [`FailureClass`] alongside its
//! message, decided from structured data: an HTTP status, a close code, or
//! the server's own close reason. [`FailureClass::classify`] reads prose and
//! is only applied to text the server wrote (close reasons and `error`
//! frames), never to messages that embed a URL or a run id.

/// Status codes that identify an authentication failure or a missing run/thread.
/// Matched as whole tokens so `14010ms` does not read as a 401.
const SESSION_FATAL_CODES: &[&str] = &["401", "403", "404"];

const SESSION_FATAL_PHRASES: &[&str] =
    &["unauthorized", "forbidden", "authentication", "not found"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Network blips, server restarts, exhausted retries: recoverable by
    /// reconnecting or polling.
    Transient,
    /// Authentication rejected, or the run/thread no longer exists.
    SessionFatal,
}

impl FailureClass {
    pub fn classify(message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        let has_code = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|token| SESSION_FATAL_CODES.contains(&token));
        if has_code
            || SESSION_FATAL_PHRASES
                .iter()
                .any(|phrase| lowered.contains(phrase))
        {
            Self::SessionFatal
        } else {
            Self::Transient
        }
    }

    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 | 404 => Self::SessionFatal,
            _ => Self::Transient,
        }
    }

    /// Application close codes `4000 + status` mirror an HTTP status.
    pub fn from_close_code(code: u16) -> Self {
        match code {
            4400..=4499 => Self::from_http_status(code - 4000),
            _ => Self::Transient,
        }
    }

    /// The more severe of the two.
    pub fn worse(self, other: Self) -> Self {
        if self.is_session_fatal() { self } else { other }
    }

    pub fn is_session_fatal(self) -> bool {
        matches!(self, Self::SessionFatal)
    }
}
