//! Public feed handles and feed event dispatch
//!
//! A [`Feed`] is a lightweight application-scoped reference into the
//! registry: an id plus a pointer to the shared client state. All state lives
//! registry-side, so destroying a handle is purely a registry operation and
//! no reference cycles exist.

use crate::client::ClientShared;
use crate::data::{DesiredState, FeedNameArgs, HandleState};
use crate::error::ClientError;
use crate::feed_registry::HandleId;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Callbacks for per-feed lifecycle and data events
///
/// All methods default to no-ops. Invocations always happen on a
/// dispatch-queue turn.
pub trait FeedListener: Send + Sync {
    /// The feed is being opened on the server.
    fn on_opening(&self) {}
    /// The feed is open; `data` is the current snapshot.
    fn on_open(&self, _data: &Value) {}
    /// The feed closed; the error describes why, `None` for a requested close.
    fn on_close(&self, _err: Option<&ClientError>) {}
    /// The server mutated the open feed.
    fn on_action(
        &self,
        _name: &str,
        _args: &Map<String, Value>,
        _new_data: &Value,
        _old_data: &Value,
    ) {
    }
}

/// A feed-level event ready for fan-out to one handle's listeners
#[derive(Debug, Clone)]
pub(crate) enum FeedEmission {
    Opening,
    Open(Value),
    Close(Option<ClientError>),
    Action {
        name: String,
        args: Map<String, Value>,
        new_data: Value,
        old_data: Value,
    },
}

/// Per-handle listener registry
pub(crate) struct FeedListenerMap {
    listeners: HashMap<HandleId, Vec<(u64, Arc<dyn FeedListener>)>>,
    next_id: u64,
}

impl FeedListenerMap {
    pub(crate) fn new() -> Self {
        Self {
            listeners: HashMap::new(),
            next_id: 0,
        }
    }

    pub(crate) fn register(&mut self, handle: HandleId, listener: Arc<dyn FeedListener>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.listeners.entry(handle).or_default().push((id, listener));
        id
    }

    pub(crate) fn unregister(&mut self, handle: HandleId, id: u64) -> bool {
        if let Some(entries) = self.listeners.get_mut(&handle) {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            let removed = entries.len() < before;
            if entries.is_empty() {
                self.listeners.remove(&handle);
            }
            removed
        } else {
            false
        }
    }

    pub(crate) fn remove_handle(&mut self, handle: HandleId) {
        self.listeners.remove(&handle);
    }

    pub(crate) fn clear(&mut self) {
        self.listeners.clear();
    }

    pub(crate) fn snapshot(&self, handle: HandleId) -> Vec<Arc<dyn FeedListener>> {
        self.listeners
            .get(&handle)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }
}

/// Fan a feed emission out to one handle's listener snapshot
pub(crate) fn dispatch_feed_emission(
    listeners: &[Arc<dyn FeedListener>],
    emission: &FeedEmission,
) {
    for listener in listeners {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            match emission {
                FeedEmission::Opening => listener.on_opening(),
                FeedEmission::Open(data) => listener.on_open(data),
                FeedEmission::Close(err) => listener.on_close(err.as_ref()),
                FeedEmission::Action {
                    name,
                    args,
                    new_data,
                    old_data,
                } => listener.on_action(name, args, new_data, old_data),
            }
        }));
        if outcome.is_err() {
            tracing::error!("feed listener panicked while handling an event");
        }
    }
}

/// An application subscription to one feed
///
/// Multiple handles may reference the same feed name and arguments; each
/// tracks its own desired state and receives its own event stream. Created
/// with [`Client::feed`](crate::client::Client::feed).
pub struct Feed {
    id: HandleId,
    shared: Arc<ClientShared>,
}

impl Feed {
    pub(crate) fn new(id: HandleId, shared: Arc<ClientShared>) -> Self {
        Self { id, shared }
    }

    /// Declare that this handle wants the feed open
    ///
    /// Fails with `InvalidFeedState` when already desired open. The client
    /// opens the underlying feed when connected; listeners observe
    /// `opening`/`open`/`close` as reconciliation proceeds.
    pub fn desire_open(&self) -> Result<(), ClientError> {
        self.shared.feed_desire_open(self.id)
    }

    /// Declare that this handle no longer wants the feed open
    ///
    /// Fails with `InvalidFeedState` when already desired closed. Listeners
    /// observe `close` with no error.
    pub fn desire_closed(&self) -> Result<(), ClientError> {
        self.shared.feed_desire_closed(self.id)
    }

    /// Release this handle
    ///
    /// Permitted only while desired closed. After destruction every
    /// operation reports `Destroyed`.
    pub fn destroy(&self) -> Result<(), ClientError> {
        self.shared.feed_destroy(self.id)
    }

    /// This handle's declarative wish
    pub fn desired_state(&self) -> Result<DesiredState, ClientError> {
        self.shared.feed_desired_state(self.id)
    }

    /// This handle's view of the feed state
    ///
    /// `Closed` whenever the client is not connected or the handle is
    /// desired closed; otherwise derived from the session's feed state.
    pub fn state(&self) -> Result<HandleState, ClientError> {
        self.shared.feed_state(self.id)
    }

    /// Snapshot of the feed data
    ///
    /// Fails with `InvalidFeedState` unless [`state`](Feed::state) is `Open`.
    pub fn data(&self) -> Result<Value, ClientError> {
        self.shared.feed_data(self.id)
    }

    pub fn destroyed(&self) -> bool {
        self.shared.feed_destroyed(self.id)
    }

    /// The feed identity this handle subscribes to
    pub fn name_args(&self) -> Result<FeedNameArgs, ClientError> {
        self.shared.feed_name_args(self.id)
    }

    /// Register a listener for this handle's events
    pub fn subscribe(&self, listener: Arc<dyn FeedListener>) -> Result<u64, ClientError> {
        self.shared.feed_subscribe(self.id, listener)
    }

    /// Remove a previously registered listener
    pub fn unsubscribe(&self, listener_id: u64) -> bool {
        self.shared.feed_unsubscribe(self.id, listener_id)
    }
}
