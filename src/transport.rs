//! Abstract transport interface consumed by the client
//!
//! A transport is any ordered, frame-oriented byte carrier (raw socket,
//! websocket, in-memory pipe). The client never touches one directly; it is
//! wrapped in a [`TransportGuard`](crate::transport_guard::TransportGuard)
//! that polices the contract below.

use crate::data::TransportState;
use crate::error::ClientError;
use std::fmt;
use std::sync::Arc;

/// Events a transport pushes up to its subscriber
///
/// Contract: `disconnect → connecting → {connect | disconnect}`; after
/// `connect`, zero or more `message`s and then `disconnect`. `Connecting` may
/// only follow a `connect()` call; an argument-less `Disconnect` may only
/// follow a `disconnect()` call.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connecting,
    Connect,
    Message(String),
    Disconnect(Option<ClientError>),
}

impl TransportEvent {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            TransportEvent::Connecting => "connecting",
            TransportEvent::Connect => "connect",
            TransportEvent::Message(_) => "message",
            TransportEvent::Disconnect(_) => "disconnect",
        }
    }
}

/// Synchronous event intake handed to a transport via [`Transport::subscribe`]
///
/// `emit` validates the event at receipt time; a contract violation is
/// returned to the emitting transport as a
/// [`TransportViolation`](ClientError::TransportViolation).
#[derive(Clone)]
pub struct TransportEventSink {
    inner: Arc<dyn Fn(TransportEvent) -> Result<(), ClientError> + Send + Sync>,
}

impl TransportEventSink {
    pub fn new(
        f: impl Fn(TransportEvent) -> Result<(), ClientError> + Send + Sync + 'static,
    ) -> Self {
        Self { inner: Arc::new(f) }
    }

    pub fn emit(&self, event: TransportEvent) -> Result<(), ClientError> {
        (self.inner)(event)
    }
}

impl fmt::Debug for TransportEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSink").finish_non_exhaustive()
    }
}

/// The transport state machine the client consumes
///
/// Implementations report `Disconnected` at construction and move through
/// `Connecting`/`Connected` as frames flow. Operations that fail return an
/// error rather than panicking; misbehavior beyond that is caught by the
/// guard.
pub trait Transport: Send + 'static {
    /// Current state. `Disconnected` at construction.
    fn state(&self) -> TransportState;

    /// Begin connecting. Called only while `Disconnected`.
    fn connect(&mut self) -> Result<(), ClientError>;

    /// Send one frame. Called only while `Connected`.
    fn send(&mut self, frame: &str) -> Result<(), ClientError>;

    /// Drop the connection. Called only while `Connecting` or `Connected`;
    /// the optional error is expected back on the resulting `Disconnect`
    /// event.
    fn disconnect(&mut self, err: Option<ClientError>) -> Result<(), ClientError>;

    /// Register the event intake. Called once, before any other method.
    fn subscribe(&mut self, sink: TransportEventSink);
}
