//! # Feedme Client
//!
//! Client runtime for the Feedme RPC-and-subscription protocol: connection
//! lifecycle management with timeouts and bounded retry, action dispatch
//! with deadlines, and declarative feed subscriptions reconciled against the
//! server.
//!
//! ## Layers
//!
//! | Layer | Responsibility |
//! |-------|----------------|
//! | [`TransportGuard`](transport_guard::TransportGuard) | Polices a raw transport's state machine and event contract |
//! | [`SessionGuard`](session_guard::SessionGuard) | Defers session replies and events; orders callbacks before `disconnect` |
//! | [`Client`](client::Client) | Connection lifecycle, retry schedule, action deadlines |
//! | [`Feed`](feed::Feed) | Per-handle subscription state reconciled via the feed registry |
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use feedme_client::prelude::*;
//! use std::sync::Arc;
//!
//! # fn example(session: Box<dyn feedme_client::session::Session>) -> Result<(), ClientError> {
//! let options = ClientOptionsBuilder::new()
//!     .connect_timeout(std::time::Duration::from_secs(5))
//!     .build();
//! let client = Client::new(session, options)?;
//! client.connect()?;
//!
//! let prices = client.feed("prices", [("market".to_string(), "btc".to_string())])?;
//! prices.desire_open()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Scheduling model
//!
//! The client is single-threaded in spirit: every callback and event runs on
//! a per-client FIFO queue drained by one worker task, never inside the
//! application call that armed it. On a session disconnect, all pending
//! request callbacks are delivered before the `disconnect` event, actions
//! before feed operations, FIFO within each class.
//!
//! ## MSRV
//!
//! Minimum Supported Rust Version: **1.70**

pub mod client;
pub mod coordinator;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod feed;
pub mod feed_registry;
pub mod session;
pub mod session_guard;
pub mod transport;
pub mod transport_guard;

// Client surface
pub use client::{ActionCallback, Client, ClientOptionsBuilder};
pub use error::{ClientError, TransportFault};
pub use events::ClientListener;
pub use feed::{Feed, FeedListener};

// Data model
pub use data::{
    ClientOptions, ClientState, DesiredState, FeedNameArgs, FeedSerial, FeedState, HandleState,
    ReopenLimit, RetryLimit, SessionState, TransportState,
};

// Consumed interfaces
pub use session::{Session, SessionEvent, SessionEventSink};
pub use transport::{Transport, TransportEvent, TransportEventSink};

// Guards
pub use dispatch::Dispatcher;
pub use session_guard::SessionGuard;
pub use transport_guard::TransportGuard;

/// Prelude - minimal public API surface
///
/// Import with: `use feedme_client::prelude::*;`
pub mod prelude {
    /// Main entry point
    pub use crate::client::{ActionCallback, Client, ClientOptionsBuilder};

    /// Configuration
    pub use crate::data::{ClientOptions, ReopenLimit, RetryLimit};

    /// Feed subscriptions
    pub use crate::data::FeedNameArgs;
    pub use crate::feed::{Feed, FeedListener};

    /// Events
    pub use crate::events::ClientListener;

    /// Errors
    pub use crate::error::ClientError;

    /// Connection state
    pub use crate::data::{ClientState, DesiredState, HandleState};
}

use tracing_subscriber;

/// Initialize logging for the client
pub fn init_logging() {
    tracing_subscriber::fmt::init();
}
