//! Data models for feed identity, connection states, and client options

use crate::error::ClientError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A feed identity: name plus string-valued arguments
///
/// Two `FeedNameArgs` with equal name and equal arguments have equal
/// [serials](FeedNameArgs::serial). Arguments are kept sorted so the serial
/// is deterministic regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedNameArgs {
    name: String,
    args: BTreeMap<String, String>,
}

impl FeedNameArgs {
    /// Create a feed identity
    ///
    /// Fails with `InvalidArgument` if the name is empty.
    pub fn new(
        name: impl Into<String>,
        args: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ClientError> {
        let name = name.into();
        if name.is_empty() {
            return Err(ClientError::InvalidArgument(
                "feed name must be a non-empty string".into(),
            ));
        }
        Ok(Self {
            name,
            args: args.into_iter().collect(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &BTreeMap<String, String> {
        &self.args
    }

    /// Deterministic fingerprint of this feed identity
    ///
    /// Canonical JSON of `(name, args)`; the sorted argument map guarantees
    /// equal inputs produce byte-equal serials.
    pub fn serial(&self) -> FeedSerial {
        let encoded = serde_json::to_string(&(&self.name, &self.args))
            .unwrap_or_else(|_| self.name.clone());
        FeedSerial(encoded)
    }
}

impl fmt::Display for FeedNameArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.args.is_empty() {
            let rendered: Vec<String> = self
                .args
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, "({})", rendered.join(", "))?;
        }
        Ok(())
    }
}

/// Serialized feed fingerprint used as the registry key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedSerial(String);

impl FeedSerial {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeedSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
}

impl TransportState {
    pub(crate) fn label(self) -> &'static str {
        match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Connection state reported by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
        };
        write!(f, "{label}")
    }
}

/// Per-feed state reported by a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl fmt::Display for FeedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FeedState::Closed => "closed",
            FeedState::Opening => "opening",
            FeedState::Open => "open",
            FeedState::Closing => "closing",
        };
        write!(f, "{label}")
    }
}

/// Client connection state exposed to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
        };
        write!(f, "{label}")
    }
}

/// A feed handle's declarative wish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesiredState {
    Open,
    Closed,
}

/// A feed handle's view of its current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Closed,
    Opening,
    Open,
}

impl fmt::Display for HandleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            HandleState::Closed => "closed",
            HandleState::Opening => "opening",
            HandleState::Open => "open",
        };
        write!(f, "{label}")
    }
}

/// Cap on connection retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    /// Keep retrying until a connect succeeds or the application intervenes.
    Unlimited,
    /// Give up after this many failed attempts.
    Limited(u32),
}

impl RetryLimit {
    pub fn allows(&self, attempt: u32) -> bool {
        match self {
            RetryLimit::Unlimited => true,
            RetryLimit::Limited(max) => attempt < *max,
        }
    }
}

/// Cap on automatic feed reopens after bad-feed-action closures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReopenLimit {
    /// Always reopen.
    Unlimited,
    /// Never reopen automatically.
    Disabled,
    /// Reopen while the trailing-window count stays at or below this value.
    Limited(u32),
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Per-attempt wall-clock budget for the connecting phase. `None` disables.
    pub connect_timeout: Option<Duration>,
    /// Base delay before a connection retry. `None` disables retries.
    pub connect_retry: Option<Duration>,
    /// Additional delay added per prior failed attempt.
    pub connect_retry_backoff: Duration,
    /// Ceiling on the computed retry delay.
    pub connect_retry_max: Duration,
    /// Cap on consecutive failed attempts before retries stop.
    pub connect_retry_max_attempts: RetryLimit,
    /// Whether a transport failure while connected triggers an immediate reconnect.
    pub reconnect: bool,
    /// Deadline for action callbacks. `None` disables.
    pub action_timeout: Option<Duration>,
    /// Deadline for an individual feed-open response. `None` disables.
    pub feed_timeout: Option<Duration>,
    /// Trailing-window cap on automatic reopens after bad feed actions.
    pub reopen_max_attempts: ReopenLimit,
    /// Width of the reopen-counting trailing window.
    pub reopen_trailing: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            connect_retry: Some(Duration::from_secs(5)),
            connect_retry_backoff: Duration::from_secs(5),
            connect_retry_max: Duration::from_secs(30),
            connect_retry_max_attempts: RetryLimit::Unlimited,
            reconnect: true,
            action_timeout: Some(Duration::from_secs(10)),
            feed_timeout: Some(Duration::from_secs(10)),
            reopen_max_attempts: ReopenLimit::Limited(3),
            reopen_trailing: Duration::from_secs(60),
        }
    }
}

impl ClientOptions {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.connect_timeout == Some(Duration::ZERO) {
            return Err(ClientError::InvalidArgument(
                "connect_timeout must be positive; use None to disable".into(),
            ));
        }
        if self.connect_retry == Some(Duration::ZERO) {
            return Err(ClientError::InvalidArgument(
                "connect_retry must be positive; use None to disable retries".into(),
            ));
        }
        if let Some(retry) = self.connect_retry {
            if self.connect_retry_max < retry {
                return Err(ClientError::InvalidArgument(
                    "connect_retry_max must be at least connect_retry".into(),
                ));
            }
        }
        if self.action_timeout == Some(Duration::ZERO) {
            return Err(ClientError::InvalidArgument(
                "action_timeout must be positive; use None to disable".into(),
            ));
        }
        if self.feed_timeout == Some(Duration::ZERO) {
            return Err(ClientError::InvalidArgument(
                "feed_timeout must be positive; use None to disable".into(),
            ));
        }
        if self.reopen_trailing.is_zero()
            && matches!(self.reopen_max_attempts, ReopenLimit::Limited(_))
        {
            return Err(ClientError::InvalidArgument(
                "reopen_trailing must be positive when reopens are limited".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry attempt `attempt` (1-based), capped at the maximum
    ///
    /// Returns `None` when retries are disabled or the attempt cap is passed.
    pub fn retry_delay(&self, attempt: u32) -> Option<Duration> {
        let base = self.connect_retry?;
        if !self.connect_retry_max_attempts.allows(attempt) {
            return None;
        }
        let step = self
            .connect_retry_backoff
            .checked_mul(attempt.saturating_sub(1))
            .unwrap_or(self.connect_retry_max);
        let delay = base.checked_add(step).unwrap_or(self.connect_retry_max);
        Some(delay.min(self.connect_retry_max))
    }
}
