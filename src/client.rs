//! Main client interface for the Feedme runtime

use crate::coordinator::{Core, Effect, Effects};
use crate::data::{
    ClientOptions, ClientState, DesiredState, FeedNameArgs, FeedSerial, HandleState, ReopenLimit,
    RetryLimit,
};
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::events::{dispatch_client_emission, ClientListener, ClientListeners};
use crate::feed::{dispatch_feed_emission, Feed, FeedListener, FeedListenerMap};
use crate::feed_registry::HandleId;
use crate::session::{Session, SessionEventSink};
use crate::session_guard::SessionGuard;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// One-shot result callback for [`Client::action`]
pub type ActionCallback = Box<dyn FnOnce(Result<Value, ClientError>) + Send + 'static>;

/// State shared between the client, its feed handles, and queued jobs
pub(crate) struct ClientShared {
    self_ref: Weak<ClientShared>,
    core: Mutex<Core>,
    dispatcher: Dispatcher,
    listeners: Mutex<ClientListeners>,
    feed_listeners: Mutex<FeedListenerMap>,
}

impl ClientShared {
    /// Run a core operation from a queue job; effects execute inline since
    /// the job itself is the deferred turn
    fn with_core<R>(&self, f: impl FnOnce(&mut Core, &mut Effects) -> R) -> R {
        let mut fx = Effects::new();
        let result = {
            let mut core = self.core.lock().unwrap();
            f(&mut core, &mut fx)
        };
        self.run_effects(fx);
        result
    }

    /// Run a core operation from an application call; effects are deferred
    /// as one job so nothing fires in the caller's stack
    fn with_core_deferred<R>(&self, f: impl FnOnce(&mut Core, &mut Effects) -> R) -> R {
        let mut fx = Effects::new();
        let result = {
            let mut core = self.core.lock().unwrap();
            f(&mut core, &mut fx)
        };
        if !fx.is_empty() {
            if let Some(shared) = self.self_ref.upgrade() {
                self.dispatcher.defer(move || shared.run_effects(fx));
            }
        }
        result
    }

    fn read_core<R>(&self, f: impl FnOnce(&Core) -> R) -> R {
        f(&self.core.lock().unwrap())
    }

    /// Execute accumulated effects in order, without holding any lock across
    /// an application callback
    fn run_effects(&self, fx: Effects) {
        for effect in fx.into_items() {
            match effect {
                Effect::Client(emission) => {
                    let snapshot = self.listeners.lock().unwrap().snapshot();
                    dispatch_client_emission(&snapshot, &emission);
                }
                Effect::Feed(id, emission) => {
                    let snapshot = self.feed_listeners.lock().unwrap().snapshot(id);
                    dispatch_feed_emission(&snapshot, &emission);
                }
                Effect::Reply(callback, result) => callback(result),
            }
        }
    }

    // ─── Queue job entry points ──────────────────────────────────────

    pub(crate) fn handle_session_event(&self, event: crate::session::SessionEvent) {
        self.with_core(|core, fx| core.handle_session_event(event, fx));
    }

    pub(crate) fn on_connect_timeout(&self) {
        self.with_core(|core, _fx| core.on_connect_timeout());
    }

    pub(crate) fn on_connect_retry(&self) {
        self.with_core(|core, _fx| core.on_connect_retry());
    }

    pub(crate) fn on_action_response(&self, id: u64, result: Result<Value, ClientError>) {
        self.with_core(|core, fx| core.on_action_response(id, result, fx));
    }

    pub(crate) fn on_action_timeout(&self, id: u64) {
        self.with_core(|core, fx| core.on_action_timeout(id, fx));
    }

    pub(crate) fn on_feed_open_response(
        &self,
        name_args: FeedNameArgs,
        result: Result<(), ClientError>,
    ) {
        self.with_core(|core, fx| core.on_feed_open_response(name_args, result, fx));
    }

    pub(crate) fn on_feed_close_response(
        &self,
        name_args: FeedNameArgs,
        result: Result<(), ClientError>,
    ) {
        self.with_core(|core, fx| core.on_feed_close_response(name_args, result, fx));
    }

    pub(crate) fn on_feed_open_timeout(&self, serial: FeedSerial, token: u64) {
        self.with_core(|core, fx| core.on_feed_open_timeout(&serial, token, fx));
    }

    pub(crate) fn on_reopen_decrement(&self, serial: FeedSerial, token: u64) {
        self.with_core(|core, fx| core.on_reopen_decrement(&serial, token, fx));
    }

    // ─── Feed handle surface ─────────────────────────────────────────

    pub(crate) fn feed_desire_open(&self, id: HandleId) -> Result<(), ClientError> {
        self.with_core_deferred(|core, fx| core.feed_desire_open(id, fx))
    }

    pub(crate) fn feed_desire_closed(&self, id: HandleId) -> Result<(), ClientError> {
        self.with_core_deferred(|core, fx| core.feed_desire_closed(id, fx))
    }

    pub(crate) fn feed_destroy(&self, id: HandleId) -> Result<(), ClientError> {
        let result = self.with_core_deferred(|core, _fx| core.feed_destroy(id));
        if result.is_ok() {
            self.feed_listeners.lock().unwrap().remove_handle(id);
        }
        result
    }

    pub(crate) fn feed_desired_state(&self, id: HandleId) -> Result<DesiredState, ClientError> {
        self.read_core(|core| core.feed_desired_state(id))
    }

    pub(crate) fn feed_state(&self, id: HandleId) -> Result<HandleState, ClientError> {
        self.read_core(|core| core.feed_state(id))
    }

    pub(crate) fn feed_data(&self, id: HandleId) -> Result<Value, ClientError> {
        self.read_core(|core| core.feed_data(id))
    }

    pub(crate) fn feed_destroyed(&self, id: HandleId) -> bool {
        self.read_core(|core| core.feed_destroyed(id))
    }

    pub(crate) fn feed_name_args(&self, id: HandleId) -> Result<FeedNameArgs, ClientError> {
        self.read_core(|core| core.feed_name_args(id))
    }

    pub(crate) fn feed_subscribe(
        &self,
        id: HandleId,
        listener: Arc<dyn FeedListener>,
    ) -> Result<u64, ClientError> {
        if self.feed_destroyed(id) {
            return Err(ClientError::Destroyed("feed handle is destroyed".into()));
        }
        Ok(self.feed_listeners.lock().unwrap().register(id, listener))
    }

    pub(crate) fn feed_unsubscribe(&self, id: HandleId, listener_id: u64) -> bool {
        self.feed_listeners.lock().unwrap().unregister(id, listener_id)
    }
}

/// A Feedme client
///
/// Maintains a logical connection to a Feedme server through an abstract
/// [`Session`], dispatches actions with deadlines, and reconciles feed
/// subscriptions. Construction requires a running tokio runtime; all public
/// methods are synchronous and every callback or event fires on a later
/// event-loop turn.
pub struct Client {
    shared: Arc<ClientShared>,
}

impl Client {
    /// Create a client over a session
    ///
    /// Validates the options and wires the session's deferred event stream.
    pub fn new(session: Box<dyn Session>, options: ClientOptions) -> Result<Self, ClientError> {
        options.validate()?;
        let shared = Arc::new_cyclic(|weak: &Weak<ClientShared>| {
            let dispatcher = Dispatcher::new();
            let mut session_guard = SessionGuard::new(session, dispatcher.clone());
            let event_weak = weak.clone();
            session_guard.subscribe(SessionEventSink::new(move |event| {
                if let Some(shared) = event_weak.upgrade() {
                    shared.handle_session_event(event);
                }
            }));
            ClientShared {
                self_ref: weak.clone(),
                core: Mutex::new(Core::new(
                    session_guard,
                    options,
                    dispatcher.clone(),
                    weak.clone(),
                )),
                dispatcher,
                listeners: Mutex::new(ClientListeners::new()),
                feed_listeners: Mutex::new(FeedListenerMap::new()),
            }
        });
        Ok(Self { shared })
    }

    /// Begin a connection attempt
    ///
    /// Clears any scheduled retry. Fails with `InvalidState` unless
    /// disconnected.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.shared.with_core_deferred(|core, _fx| core.connect())
    }

    /// Drop the connection
    ///
    /// In-flight action callbacks complete with `NotConnected` before the
    /// `disconnect` event reaches listeners.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.shared.with_core_deferred(|core, _fx| core.disconnect())
    }

    /// Invoke a server action
    ///
    /// The callback fires exactly once: with the server's result, with
    /// `Timeout` if the deadline elapses first, or with `NotConnected` when
    /// invoked while not connected or when a disconnect overtakes the reply.
    pub fn action(
        &self,
        name: &str,
        args: Map<String, Value>,
        callback: ActionCallback,
    ) -> Result<(), ClientError> {
        self.shared
            .with_core_deferred(|core, fx| core.action(name, args, callback, fx))
    }

    /// Create a subscription handle for a feed
    ///
    /// The handle starts desired closed; call [`Feed::desire_open`] to
    /// subscribe.
    pub fn feed(
        &self,
        name: impl Into<String>,
        args: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Feed, ClientError> {
        let name_args = FeedNameArgs::new(name, args)?;
        let id = self
            .shared
            .with_core_deferred(|core, _fx| core.create_feed(name_args))?;
        Ok(Feed::new(id, Arc::clone(&self.shared)))
    }

    /// Destroy the client
    ///
    /// Permitted only while disconnected; terminal. Every feed handle
    /// becomes destroyed.
    pub fn destroy(&self) -> Result<(), ClientError> {
        let result = self.shared.with_core_deferred(|core, _fx| core.destroy());
        if result.is_ok() {
            self.shared.listeners.lock().unwrap().clear();
            self.shared.feed_listeners.lock().unwrap().clear();
        }
        result
    }

    pub fn state(&self) -> ClientState {
        self.shared.read_core(|core| core.state())
    }

    pub fn destroyed(&self) -> bool {
        self.shared.read_core(|core| core.is_destroyed())
    }

    /// Register a listener for client lifecycle events
    pub fn subscribe(&self, listener: Arc<dyn ClientListener>) -> u64 {
        self.shared.listeners.lock().unwrap().register(listener)
    }

    /// Remove a previously registered listener
    pub fn unsubscribe(&self, listener_id: u64) -> bool {
        self.shared.listeners.lock().unwrap().unregister(listener_id)
    }
}

/// Builder pattern for client options
pub struct ClientOptionsBuilder {
    options: ClientOptions,
}

impl ClientOptionsBuilder {
    pub fn new() -> Self {
        Self {
            options: ClientOptions::default(),
        }
    }

    pub fn connect_timeout(mut self, budget: Duration) -> Self {
        self.options.connect_timeout = Some(budget);
        self
    }

    pub fn no_connect_timeout(mut self) -> Self {
        self.options.connect_timeout = None;
        self
    }

    pub fn connect_retry(mut self, base: Duration) -> Self {
        self.options.connect_retry = Some(base);
        self
    }

    pub fn no_connect_retry(mut self) -> Self {
        self.options.connect_retry = None;
        self
    }

    pub fn connect_retry_backoff(mut self, step: Duration) -> Self {
        self.options.connect_retry_backoff = step;
        self
    }

    pub fn connect_retry_max(mut self, ceiling: Duration) -> Self {
        self.options.connect_retry_max = ceiling;
        self
    }

    pub fn connect_retry_max_attempts(mut self, limit: RetryLimit) -> Self {
        self.options.connect_retry_max_attempts = limit;
        self
    }

    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.options.reconnect = enabled;
        self
    }

    pub fn action_timeout(mut self, budget: Duration) -> Self {
        self.options.action_timeout = Some(budget);
        self
    }

    pub fn no_action_timeout(mut self) -> Self {
        self.options.action_timeout = None;
        self
    }

    pub fn feed_timeout(mut self, budget: Duration) -> Self {
        self.options.feed_timeout = Some(budget);
        self
    }

    pub fn no_feed_timeout(mut self) -> Self {
        self.options.feed_timeout = None;
        self
    }

    pub fn reopen_max_attempts(mut self, limit: ReopenLimit) -> Self {
        self.options.reopen_max_attempts = limit;
        self
    }

    pub fn reopen_trailing(mut self, window: Duration) -> Self {
        self.options.reopen_trailing = window;
        self
    }

    pub fn build(self) -> ClientOptions {
        self.options
    }
}

impl Default for ClientOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}
