//! Error types for the Feedme client runtime

use thiserror::Error;
use std::fmt;

/// Main error type for the client
///
/// Every failure mode carries an explicit variant tag; callers classify by
/// matching on the variant, never by inspecting message text.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// Caller-supplied arguments violate the contract. Returned synchronously.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not permitted in the current connection phase.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Operation not permitted in the current feed state.
    #[error("invalid feed state: {0}")]
    InvalidFeedState(String),

    /// Operation on a destroyed client or feed handle.
    #[error("destroyed: {0}")]
    Destroyed(String),

    /// The client is not connected.
    #[error("not connected")]
    NotConnected,

    /// A connect-phase, action, or feed-open deadline was exceeded.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The server declined a feed open.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The server declined the connection handshake. Disables automatic retry.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The underlying connection dropped. Triggers reconnect if configured.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// Server-side feed termination that is not considered a client bug.
    #[error("terminated: {0}")]
    Terminated(String),

    /// The server sent a feed delta the session could not apply.
    #[error("bad feed action: {0}")]
    BadFeedAction(String),

    /// The transport violated its state machine or event contract.
    ///
    /// The root cause observed at the transport boundary rides along as
    /// [`TransportFault`].
    #[error("transport violation: {message}")]
    TransportViolation {
        message: String,
        fault: TransportFault,
    },
}

impl ClientError {
    /// Whether a disconnect carrying this error should schedule a retry
    /// when it interrupted a connection attempt.
    pub fn is_retryable_connect_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout(_) | ClientError::TransportFailure(_)
        )
    }

    /// Whether this error reports a server-declined handshake.
    pub fn is_handshake_rejection(&self) -> bool {
        matches!(self, ClientError::HandshakeRejected(_))
    }

    /// Whether this error is a transport-level failure.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ClientError::TransportFailure(_))
    }

    pub(crate) fn transport_violation(
        message: impl Into<String>,
        fault: TransportFault,
    ) -> Self {
        ClientError::TransportViolation {
            message: message.into(),
            fault,
        }
    }
}

/// Root cause of a transport contract violation
///
/// Captures what the guard observed at the transport boundary so the
/// violation can be reported with its evidence attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// The transport reported a state outside the permitted set.
    UnexpectedState {
        observed: &'static str,
        permitted: String,
    },
    /// A transport operation returned an error.
    OperationFailed(String),
    /// An event arrived in a sequence position the contract forbids.
    InvalidEmission(String),
    /// An event was emitted synchronously inside a guard method call.
    EmissionDuringCall(String),
}

impl fmt::Display for TransportFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportFault::UnexpectedState {
                observed,
                permitted,
            } => {
                write!(f, "unexpected state {observed}, permitted {permitted}")
            }
            TransportFault::OperationFailed(msg) => write!(f, "operation failed: {msg}"),
            TransportFault::InvalidEmission(msg) => write!(f, "invalid emission: {msg}"),
            TransportFault::EmissionDuringCall(msg) => {
                write!(f, "emission during method call: {msg}")
            }
        }
    }
}
