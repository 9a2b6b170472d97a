//! Session configuration.

use std::time::Duration;

use runlink_protocol::{DEFAULT_STREAM_MODE, LinkError, LinkResult};
use runlink_transport::{BackoffPolicy, PollingConfig, TransportConfig, TransportKind, millis};
use serde::{Deserialize, Serialize};

/// Everything a [`RunSessionController`](crate::RunSessionController) needs
/// besides the run itself. Missing keys fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub base_url: String,
    /// Transport used when a start request does not name one.
    pub preferred_transport: TransportKind,
    /// When false, duplex requests are served by the event stream instead.
    pub duplex_enabled: bool,
    pub stream_mode: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub polling: PollingConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".to_owned(),
            preferred_transport: TransportKind::Stream,
            duplex_enabled: true,
            stream_mode: DEFAULT_STREAM_MODE.to_owned(),
            connect_timeout: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_json(text: &str) -> LinkResult<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|error| LinkError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that parse but cannot drive the transports.
    pub fn validate(&self) -> LinkResult<()> {
        self.polling.validate()
    }

    pub fn with_preferred_transport(mut self, kind: TransportKind) -> Self {
        self.preferred_transport = kind;
        self
    }

    pub fn with_duplex_enabled(mut self, enabled: bool) -> Self {
        self.duplex_enabled = enabled;
        self
    }

    pub fn with_stream_mode(mut self, stream_mode: impl Into<String>) -> Self {
        self.stream_mode = stream_mode.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_polling(mut self, polling: PollingConfig) -> Self {
        self.polling = polling;
        self
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: self.connect_timeout,
            backoff: self.backoff.clone(),
        }
    }

    /// The transport a run actually starts on.
    pub fn resolve_transport(&self, requested: Option<TransportKind>) -> TransportKind {
        match requested.unwrap_or(self.preferred_transport) {
            TransportKind::Duplex if !self.duplex_enabled => TransportKind::Stream,
            kind => kind,
        }
    }
}
