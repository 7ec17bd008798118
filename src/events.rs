//! Client event dispatch and listener management

use crate::error::ClientError;
use serde_json::Value;
use std::sync::Arc;

/// Callbacks for client-level lifecycle events
///
/// All methods default to no-ops so listeners implement only what they need.
/// Every method is invoked on a dispatch-queue turn, never inside the
/// application call that triggered the event.
pub trait ClientListener: Send + Sync {
    fn on_connecting(&self) {}
    fn on_connect(&self) {}
    fn on_disconnect(&self, _err: Option<&ClientError>) {}
    fn on_bad_server_message(&self, _err: &ClientError) {}
    fn on_bad_client_message(&self, _diagnostic: &Value) {}
    fn on_transport_error(&self, _err: &ClientError) {}
}

/// A client-level event ready for fan-out
#[derive(Debug, Clone)]
pub(crate) enum ClientEmission {
    Connecting,
    Connect,
    Disconnect(Option<ClientError>),
    BadServerMessage(ClientError),
    BadClientMessage(Value),
    TransportError(ClientError),
}

struct ListenerEntry {
    id: u64,
    listener: Arc<dyn ClientListener>,
}

/// Registry of client listeners with unique ids
pub(crate) struct ClientListeners {
    entries: Vec<ListenerEntry>,
    next_id: u64,
}

impl ClientListeners {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn register(&mut self, listener: Arc<dyn ClientListener>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.push(ListenerEntry { id, listener });
        tracing::debug!("registered client listener {id}");
        id
    }

    pub(crate) fn unregister(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        let removed = self.entries.len() < before;
        if removed {
            tracing::debug!("unregistered client listener {id}");
        }
        removed
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn ClientListener>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Fan an emission out to a listener snapshot
///
/// A panicking listener is isolated so the remaining listeners still hear the
/// event.
pub(crate) fn dispatch_client_emission(
    listeners: &[Arc<dyn ClientListener>],
    emission: &ClientEmission,
) {
    for listener in listeners {
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            match emission {
                ClientEmission::Connecting => listener.on_connecting(),
                ClientEmission::Connect => listener.on_connect(),
                ClientEmission::Disconnect(err) => listener.on_disconnect(err.as_ref()),
                ClientEmission::BadServerMessage(err) => listener.on_bad_server_message(err),
                ClientEmission::BadClientMessage(diag) => listener.on_bad_client_message(diag),
                ClientEmission::TransportError(err) => listener.on_transport_error(err),
            }
        }));
        if outcome.is_err() {
            tracing::error!("client listener panicked while handling an event");
        }
    }
}
