//! Abstract session interface consumed by the client
//!
//! A session speaks the Feedme wire protocol over some transport: it owns the
//! handshake, message framing, and per-feed delta application, and exposes
//! per-feed state plus request/response operations. The client treats it as a
//! black box behind this trait.

use crate::data::{FeedNameArgs, FeedState, SessionState};
use crate::error::ClientError;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// One-shot reply to an `action` request
pub type ActionReply = Box<dyn FnOnce(Result<Value, ClientError>) + Send + 'static>;

/// One-shot reply to a `feed_open` or `feed_close` request
pub type FeedReply = Box<dyn FnOnce(Result<(), ClientError>) + Send + 'static>;

/// Events a session pushes up to its subscriber
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connecting,
    Connect,
    Disconnect(Option<ClientError>),
    /// The server mutated an open feed; the session has already applied the
    /// delta and reports both sides of it.
    FeedAction {
        name_args: FeedNameArgs,
        action_name: String,
        action_args: Map<String, Value>,
        new_data: Value,
        old_data: Value,
    },
    /// The server is closing a feed the client did not ask to close.
    UnexpectedFeedClosing {
        name_args: FeedNameArgs,
        error: ClientError,
    },
    /// Second half of the two-phase server-initiated closure.
    UnexpectedFeedClosed {
        name_args: FeedNameArgs,
        error: ClientError,
    },
    /// The server sent something the session could not interpret.
    BadServerMessage(ClientError),
    /// The server flagged a client message as invalid; diagnostic payload.
    BadClientMessage(Value),
    /// The transport beneath the session violated its contract.
    TransportError(ClientError),
}

impl SessionEvent {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            SessionEvent::Connecting => "connecting",
            SessionEvent::Connect => "connect",
            SessionEvent::Disconnect(_) => "disconnect",
            SessionEvent::FeedAction { .. } => "feed_action",
            SessionEvent::UnexpectedFeedClosing { .. } => "unexpected_feed_closing",
            SessionEvent::UnexpectedFeedClosed { .. } => "unexpected_feed_closed",
            SessionEvent::BadServerMessage(_) => "bad_server_message",
            SessionEvent::BadClientMessage(_) => "bad_client_message",
            SessionEvent::TransportError(_) => "transport_error",
        }
    }
}

/// Synchronous event intake handed to a session via [`Session::subscribe`]
#[derive(Clone)]
pub struct SessionEventSink {
    inner: Arc<dyn Fn(SessionEvent) + Send + Sync>,
}

impl SessionEventSink {
    pub fn new(f: impl Fn(SessionEvent) + Send + Sync + 'static) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn emit(&self, event: SessionEvent) {
        (self.inner)(event)
    }
}

impl fmt::Debug for SessionEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEventSink").finish_non_exhaustive()
    }
}

/// The Feedme conversation layer the client drives
///
/// Request replies may be invoked synchronously inside the requesting call or
/// on any later turn; the client wraps every session in a
/// [`SessionGuard`](crate::session_guard::SessionGuard) that absorbs either.
/// On disconnect the session is expected to reply to every outstanding
/// request (with `NotConnected`) before emitting the `Disconnect` event.
pub trait Session: Send + 'static {
    /// Current conversation state.
    fn state(&self) -> SessionState;

    /// Begin the handshake. Called only while `Disconnected`.
    fn connect(&mut self) -> Result<(), ClientError>;

    /// Drop the conversation; the optional error is reported on the
    /// resulting `Disconnect` event.
    fn disconnect(&mut self, err: Option<ClientError>) -> Result<(), ClientError>;

    /// Invoke a server action. Exactly one reply per request.
    fn action(&mut self, name: &str, args: &Map<String, Value>, reply: ActionReply);

    /// Ask the server to open a feed. Exactly one reply per request.
    fn feed_open(&mut self, feed: &FeedNameArgs, reply: FeedReply);

    /// Ask the server to close a feed. Exactly one reply per request.
    fn feed_close(&mut self, feed: &FeedNameArgs, reply: FeedReply);

    /// Per-feed protocol state.
    fn feed_state(&self, feed: &FeedNameArgs) -> FeedState;

    /// Snapshot of an open feed's data; `None` unless the feed is open.
    fn feed_data(&self, feed: &FeedNameArgs) -> Option<Value>;

    /// Release all resources. Terminal.
    fn destroy(&mut self);

    fn destroyed(&self) -> bool;

    /// Register the event intake. Called once, before any other method.
    fn subscribe(&mut self, sink: SessionEventSink);
}
