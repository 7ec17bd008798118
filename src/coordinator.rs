//! Connection lifecycle coordination and action dispatch
//!
//! `Core` is the single locked state block behind a client: the connection
//! phase machine, the in-flight action table, the retry schedule, and the
//! feed registry. Handlers never invoke application code directly; they
//! accumulate [`Effects`] which the caller runs after the lock is released.

use crate::client::{ActionCallback, ClientShared};
use crate::data::{
    ClientOptions, ClientState, DesiredState, FeedNameArgs, FeedSerial, FeedState, HandleState,
};
use crate::dispatch::{Dispatcher, TimerHandle};
use crate::error::ClientError;
use crate::events::ClientEmission;
use crate::feed::FeedEmission;
use crate::feed_registry::{FeedRegistry, HandleId};
use crate::session::SessionEvent;
use crate::session_guard::SessionGuard;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Weak;

/// One queued outbound invocation
pub(crate) enum Effect {
    Client(ClientEmission),
    Feed(HandleId, FeedEmission),
    Reply(ActionCallback, Result<Value, ClientError>),
}

/// Ordered outbound invocations accumulated under the core lock
pub(crate) struct Effects {
    items: Vec<Effect>,
}

impl Effects {
    pub(crate) fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub(crate) fn client(&mut self, emission: ClientEmission) {
        self.items.push(Effect::Client(emission));
    }

    pub(crate) fn feed(&mut self, id: HandleId, emission: FeedEmission) {
        self.items.push(Effect::Feed(id, emission));
    }

    pub(crate) fn reply(&mut self, callback: ActionCallback, result: Result<Value, ClientError>) {
        self.items.push(Effect::Reply(callback, result));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_items(self) -> Vec<Effect> {
        self.items
    }
}

struct ActionEntry {
    callback: ActionCallback,
    /// Dropping the entry cancels the deadline.
    _timer: Option<TimerHandle>,
}

/// Session emissions tracked for ordering diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEmissionKind {
    Connecting,
    Connect,
    Disconnect,
}

/// The client's locked state block
pub(crate) struct Core {
    phase: ClientState,
    destroyed: bool,
    opts: ClientOptions,
    session: SessionGuard,
    /// Failed attempts since the last successful connect or app `connect()`.
    connect_attempt: u32,
    connect_timeout_timer: Option<TimerHandle>,
    connect_retry_timer: Option<TimerHandle>,
    next_action_id: u64,
    /// Keyed by ascending id, so disconnect sweeps reply in FIFO order.
    actions: BTreeMap<u64, ActionEntry>,
    registry: FeedRegistry,
    dispatcher: Dispatcher,
    shared: Weak<ClientShared>,
    last_session_emission: SessionEmissionKind,
}

impl Core {
    pub(crate) fn new(
        session: SessionGuard,
        opts: ClientOptions,
        dispatcher: Dispatcher,
        shared: Weak<ClientShared>,
    ) -> Self {
        Self {
            phase: ClientState::Disconnected,
            destroyed: false,
            opts,
            session,
            connect_attempt: 0,
            connect_timeout_timer: None,
            connect_retry_timer: None,
            next_action_id: 0,
            actions: BTreeMap::new(),
            registry: FeedRegistry::new(dispatcher.clone(), shared.clone()),
            dispatcher,
            shared,
            last_session_emission: SessionEmissionKind::Disconnect,
        }
    }

    pub(crate) fn state(&self) -> ClientState {
        if self.destroyed {
            ClientState::Disconnected
        } else {
            self.phase
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    fn ensure_live(&self) -> Result<(), ClientError> {
        if self.destroyed {
            Err(ClientError::Destroyed("client is destroyed".into()))
        } else {
            Ok(())
        }
    }

    /// Application `connect()`: fresh attempt, retry schedule cleared
    pub(crate) fn connect(&mut self) -> Result<(), ClientError> {
        self.ensure_live()?;
        if self.phase != ClientState::Disconnected {
            return Err(ClientError::InvalidState(format!(
                "connect() requires a disconnected client, state is {}",
                self.phase
            )));
        }
        self.connect_retry_timer = None;
        self.connect_attempt = 0;
        self.begin_connect()
    }

    /// Application `disconnect()`
    pub(crate) fn disconnect(&mut self) -> Result<(), ClientError> {
        self.ensure_live()?;
        if self.phase == ClientState::Disconnected {
            return Err(ClientError::InvalidState(
                "disconnect() requires an active connection attempt".into(),
            ));
        }
        self.connect_timeout_timer = None;
        self.session.disconnect(None)
    }

    /// Application `destroy()`: terminal, permitted only while disconnected
    pub(crate) fn destroy(&mut self) -> Result<(), ClientError> {
        self.ensure_live()?;
        if self.phase != ClientState::Disconnected {
            return Err(ClientError::InvalidState(
                "destroy() requires a disconnected client".into(),
            ));
        }
        self.destroyed = true;
        self.connect_timeout_timer = None;
        self.connect_retry_timer = None;
        self.actions.clear();
        self.registry.destroy_all();
        self.session.destroy();
        tracing::info!("client destroyed");
        Ok(())
    }

    /// Invoke a server action
    ///
    /// Validation failures return synchronously; everything else reaches the
    /// callback exactly once, on a later queue turn.
    pub(crate) fn action(
        &mut self,
        name: &str,
        args: Map<String, Value>,
        callback: ActionCallback,
        fx: &mut Effects,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        if name.is_empty() {
            return Err(ClientError::InvalidArgument(
                "action name must be a non-empty string".into(),
            ));
        }
        if self.phase != ClientState::Connected {
            fx.reply(callback, Err(ClientError::NotConnected));
            return Ok(());
        }
        self.next_action_id += 1;
        let id = self.next_action_id;
        let timer = self.opts.action_timeout.map(|budget| {
            let shared = self.shared.clone();
            self.dispatcher.schedule(budget, move || {
                if let Some(shared) = shared.upgrade() {
                    shared.on_action_timeout(id);
                }
            })
        });
        self.actions.insert(
            id,
            ActionEntry {
                callback,
                _timer: timer,
            },
        );
        let shared = self.shared.clone();
        self.session.action(
            name,
            &args,
            Box::new(move |result| {
                if let Some(shared) = shared.upgrade() {
                    shared.on_action_response(id, result);
                }
            }),
        );
        tracing::debug!(action = name, id, "action dispatched");
        Ok(())
    }

    /// Session replied to an action; the deadline may have claimed it first
    pub(crate) fn on_action_response(
        &mut self,
        id: u64,
        result: Result<Value, ClientError>,
        fx: &mut Effects,
    ) {
        match self.actions.remove(&id) {
            Some(entry) => fx.reply(entry.callback, result),
            None => tracing::debug!(id, "late action reply dropped"),
        }
    }

    /// Action deadline fired; the session's reply, if any, will be dropped
    pub(crate) fn on_action_timeout(&mut self, id: u64, fx: &mut Effects) {
        if let Some(entry) = self.actions.remove(&id) {
            tracing::warn!(id, "action deadline exceeded");
            fx.reply(
                entry.callback,
                Err(ClientError::Timeout("action deadline exceeded".into())),
            );
        }
    }

    /// Connect deadline fired: tear the attempt down with a timeout error.
    /// Retry is driven by the resulting disconnect event.
    pub(crate) fn on_connect_timeout(&mut self) {
        self.connect_timeout_timer = None;
        if self.destroyed || self.phase != ClientState::Connecting {
            return;
        }
        tracing::warn!("connect deadline exceeded, disconnecting");
        if let Err(err) = self
            .session
            .disconnect(Some(ClientError::Timeout("connect deadline exceeded".into())))
        {
            tracing::error!("session disconnect failed after connect timeout: {err}");
        }
    }

    /// Retry timer fired: start the next attempt
    pub(crate) fn on_connect_retry(&mut self) {
        self.connect_retry_timer = None;
        if self.destroyed || self.phase != ClientState::Disconnected {
            return;
        }
        tracing::info!(failures = self.connect_attempt, "connection retry");
        if let Err(err) = self.begin_connect() {
            tracing::error!("connection retry failed to start: {err}");
        }
    }

    /// Route one deferred session event
    pub(crate) fn handle_session_event(&mut self, event: SessionEvent, fx: &mut Effects) {
        if self.destroyed {
            tracing::debug!("session event {} after destroy, ignored", event.label());
            return;
        }
        match event {
            SessionEvent::Connecting => {
                self.note_emission(SessionEmissionKind::Connecting);
                if self.phase != ClientState::Connecting {
                    tracing::warn!(phase = %self.phase, "connecting event outside a connection attempt");
                }
                fx.client(ClientEmission::Connecting);
            }
            SessionEvent::Connect => {
                self.note_emission(SessionEmissionKind::Connect);
                self.connect_timeout_timer = None;
                self.connect_attempt = 0;
                self.phase = ClientState::Connected;
                tracing::info!("connected");
                fx.client(ClientEmission::Connect);
                let phase = self.phase;
                let Core {
                    ref mut session,
                    ref mut registry,
                    ref opts,
                    ..
                } = *self;
                registry.reconcile_all(session, phase, opts, fx);
            }
            SessionEvent::Disconnect(err) => self.process_disconnect(err, fx),
            SessionEvent::FeedAction {
                name_args,
                action_name,
                action_args,
                new_data,
                old_data,
            } => {
                self.registry.handle_feed_action(
                    &name_args,
                    &action_name,
                    &action_args,
                    &new_data,
                    &old_data,
                    fx,
                );
            }
            SessionEvent::UnexpectedFeedClosing { name_args, error } => {
                tracing::warn!(feed = %name_args, "server is closing feed: {error}");
                self.registry.handle_unexpected_closing(&name_args, &error, fx);
            }
            SessionEvent::UnexpectedFeedClosed { name_args, error } => {
                let phase = self.phase;
                let Core {
                    ref mut session,
                    ref mut registry,
                    ref opts,
                    ..
                } = *self;
                registry.handle_unexpected_closed(session, phase, opts, &name_args, &error, fx);
            }
            SessionEvent::BadServerMessage(err) => {
                tracing::warn!("bad server message: {err}");
                fx.client(ClientEmission::BadServerMessage(err));
            }
            SessionEvent::BadClientMessage(diagnostic) => {
                tracing::warn!("server flagged a client message");
                fx.client(ClientEmission::BadClientMessage(diagnostic));
            }
            SessionEvent::TransportError(err) => {
                fx.client(ClientEmission::TransportError(err));
            }
        }
    }

    fn process_disconnect(&mut self, err: Option<ClientError>, fx: &mut Effects) {
        self.note_emission(SessionEmissionKind::Disconnect);
        let was = self.phase;
        self.connect_timeout_timer = None;
        self.phase = ClientState::Disconnected;
        match &err {
            Some(e) => tracing::info!(error = %e, "disconnected"),
            None => tracing::info!("disconnected"),
        }

        // Outstanding actions complete before the disconnect event goes out,
        // FIFO by dispatch order.
        let pending = std::mem::take(&mut self.actions);
        for (_, entry) in pending {
            fx.reply(entry.callback, Err(ClientError::NotConnected));
        }

        let mut reconnect_now = false;
        match &err {
            None => {}
            Some(e) if e.is_handshake_rejection() => {
                tracing::warn!("handshake rejected, automatic retry disabled");
            }
            Some(e) if was == ClientState::Connecting && e.is_retryable_connect_failure() => {
                self.connect_attempt = self.connect_attempt.saturating_add(1);
                match self.opts.retry_delay(self.connect_attempt) {
                    Some(delay) => {
                        tracing::info!(
                            failures = self.connect_attempt,
                            ?delay,
                            "connection attempt failed, retry scheduled"
                        );
                        let shared = self.shared.clone();
                        self.connect_retry_timer =
                            Some(self.dispatcher.schedule(delay, move || {
                                if let Some(shared) = shared.upgrade() {
                                    shared.on_connect_retry();
                                }
                            }));
                    }
                    None => {
                        tracing::warn!(
                            failures = self.connect_attempt,
                            "connection retries exhausted"
                        );
                    }
                }
            }
            Some(e)
                if was == ClientState::Connected
                    && e.is_transport_failure()
                    && self.opts.reconnect =>
            {
                reconnect_now = true;
            }
            Some(_) => {}
        }

        fx.client(ClientEmission::Disconnect(err));
        self.registry.handle_disconnect(fx);

        if reconnect_now {
            tracing::info!("transport failure while connected, reconnecting");
            if let Err(err) = self.begin_connect() {
                tracing::error!("automatic reconnect failed to start: {err}");
            }
        }
    }

    fn begin_connect(&mut self) -> Result<(), ClientError> {
        self.session.connect()?;
        self.phase = ClientState::Connecting;
        tracing::info!("connection attempt started");
        self.connect_timeout_timer = self.opts.connect_timeout.map(|budget| {
            let shared = self.shared.clone();
            self.dispatcher.schedule(budget, move || {
                if let Some(shared) = shared.upgrade() {
                    shared.on_connect_timeout();
                }
            })
        });
        Ok(())
    }

    fn note_emission(&mut self, kind: SessionEmissionKind) {
        use SessionEmissionKind::*;
        let valid = matches!(
            (self.last_session_emission, kind),
            (Disconnect, Connecting) | (Connecting, Connect) | (Connecting, Disconnect)
                | (Connect, Disconnect)
        );
        if !valid {
            tracing::warn!(
                from = ?self.last_session_emission,
                to = ?kind,
                "session emission out of order"
            );
        }
        self.last_session_emission = kind;
    }

    // ─── Feed surface ────────────────────────────────────────────────

    pub(crate) fn create_feed(&mut self, name_args: FeedNameArgs) -> Result<HandleId, ClientError> {
        self.ensure_live()?;
        Ok(self.registry.add_handle(name_args))
    }

    pub(crate) fn feed_desire_open(
        &mut self,
        id: HandleId,
        fx: &mut Effects,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        let phase = self.phase;
        let Core {
            ref mut session,
            ref mut registry,
            ref opts,
            ..
        } = *self;
        registry.desire_open(session, phase, opts, id, fx)
    }

    pub(crate) fn feed_desire_closed(
        &mut self,
        id: HandleId,
        fx: &mut Effects,
    ) -> Result<(), ClientError> {
        self.ensure_live()?;
        let phase = self.phase;
        let Core {
            ref mut session,
            ref mut registry,
            ref opts,
            ..
        } = *self;
        registry.desire_closed(session, phase, opts, id, fx)
    }

    pub(crate) fn feed_destroy(&mut self, id: HandleId) -> Result<(), ClientError> {
        self.ensure_live()?;
        self.registry.destroy_handle(id)
    }

    pub(crate) fn feed_desired_state(&self, id: HandleId) -> Result<DesiredState, ClientError> {
        self.ensure_live()?;
        Ok(self.registry.record(id)?.desired)
    }

    pub(crate) fn feed_destroyed(&self, id: HandleId) -> bool {
        self.destroyed || self.registry.is_destroyed(id)
    }

    /// Handle state derived from the phase and the session feed state
    pub(crate) fn feed_state(&self, id: HandleId) -> Result<HandleState, ClientError> {
        self.ensure_live()?;
        let record = self.registry.record(id)?;
        if self.phase != ClientState::Connected || record.desired == DesiredState::Closed {
            return Ok(HandleState::Closed);
        }
        Ok(match self.session.feed_state(&record.name_args) {
            FeedState::Closed => HandleState::Closed,
            FeedState::Opening => HandleState::Opening,
            FeedState::Open => HandleState::Open,
            // The close completes and the feed reopens; opening from the
            // handle's point of view.
            FeedState::Closing => HandleState::Opening,
        })
    }

    pub(crate) fn feed_data(&self, id: HandleId) -> Result<Value, ClientError> {
        match self.feed_state(id)? {
            HandleState::Open => {
                let record = self.registry.record(id)?;
                self.session.feed_data(&record.name_args).ok_or_else(|| {
                    ClientError::InvalidFeedState("feed data is unavailable".into())
                })
            }
            other => Err(ClientError::InvalidFeedState(format!(
                "feed data requires an open feed, state is {other}"
            ))),
        }
    }

    pub(crate) fn feed_name_args(&self, id: HandleId) -> Result<FeedNameArgs, ClientError> {
        Ok(self.registry.record(id)?.name_args.clone())
    }

    // ─── Feed registry job routing ───────────────────────────────────

    pub(crate) fn on_feed_open_response(
        &mut self,
        name_args: FeedNameArgs,
        result: Result<(), ClientError>,
        fx: &mut Effects,
    ) {
        if self.destroyed {
            return;
        }
        let phase = self.phase;
        let Core {
            ref mut session,
            ref mut registry,
            ref opts,
            ..
        } = *self;
        registry.handle_open_response(session, phase, opts, &name_args, result, fx);
    }

    pub(crate) fn on_feed_close_response(
        &mut self,
        name_args: FeedNameArgs,
        result: Result<(), ClientError>,
        fx: &mut Effects,
    ) {
        if self.destroyed {
            return;
        }
        let phase = self.phase;
        let Core {
            ref mut session,
            ref mut registry,
            ref opts,
            ..
        } = *self;
        registry.handle_close_response(session, phase, opts, &name_args, result, fx);
    }

    pub(crate) fn on_feed_open_timeout(
        &mut self,
        serial: &FeedSerial,
        token: u64,
        fx: &mut Effects,
    ) {
        if self.destroyed {
            return;
        }
        self.registry.handle_open_timeout(serial, token, fx);
    }

    pub(crate) fn on_reopen_decrement(
        &mut self,
        serial: &FeedSerial,
        token: u64,
        fx: &mut Effects,
    ) {
        if self.destroyed {
            return;
        }
        let phase = self.phase;
        let Core {
            ref mut session,
            ref mut registry,
            ref opts,
            ..
        } = *self;
        registry.handle_reopen_decrement(session, phase, opts, serial, token, fx);
    }
}
