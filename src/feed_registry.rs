//! Feed subscription reconciliation
//!
//! The registry owns every subscription handle record and reconciles the
//! application's declarative intent (which handles want which feeds open)
//! against the session's authoritative per-feed state. Reconciliation runs
//! through the `consider` procedure: given the handles, the connection
//! phase, and the session feed state, take at most one session action and
//! bring each handle's last-emitted state in line.

use crate::client::ClientShared;
use crate::coordinator::Effects;
use crate::data::{
    ClientOptions, ClientState, DesiredState, FeedNameArgs, FeedSerial, FeedState, HandleState,
    ReopenLimit,
};
use crate::dispatch::{Dispatcher, TimerHandle};
use crate::error::ClientError;
use crate::feed::FeedEmission;
use crate::session_guard::SessionGuard;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Weak;

/// Stable identifier of one subscription handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

/// Registry-side state of one subscription handle
pub(crate) struct HandleRecord {
    pub(crate) name_args: FeedNameArgs,
    pub(crate) serial: FeedSerial,
    pub(crate) desired: DesiredState,
    /// Last state emitted to this handle's listeners.
    pub(crate) last_emitted: HandleState,
}

/// Per-feed bookkeeping shared by every handle with the same serial
struct FeedEntry {
    name_args: FeedNameArgs,
    /// Insertion-ordered for deterministic iteration.
    handle_ids: Vec<HandleId>,
    /// A `feed_close` request is outstanding.
    close_requested: bool,
    /// A `feed_open` request is outstanding.
    open_pending: bool,
    /// The outstanding open already hit its deadline.
    open_timed_out: bool,
    /// Identifies the outstanding open, so stale timeout jobs are ignored.
    open_token: u64,
    open_timer: Option<TimerHandle>,
    /// Bad-feed-action closures within the trailing window.
    reopen_count: u32,
    reopen_timers: Vec<(u64, TimerHandle)>,
}

impl FeedEntry {
    fn new(name_args: FeedNameArgs) -> Self {
        Self {
            name_args,
            handle_ids: Vec::new(),
            close_requested: false,
            open_pending: false,
            open_timed_out: false,
            open_token: 0,
            open_timer: None,
            reopen_count: 0,
            reopen_timers: Vec::new(),
        }
    }
}

/// The per-feed subscription reconciler
pub(crate) struct FeedRegistry {
    handles: HashMap<HandleId, HandleRecord>,
    entries: BTreeMap<FeedSerial, FeedEntry>,
    next_handle_id: u64,
    next_token: u64,
    dispatcher: Dispatcher,
    shared: Weak<ClientShared>,
}

impl FeedRegistry {
    pub(crate) fn new(dispatcher: Dispatcher, shared: Weak<ClientShared>) -> Self {
        Self {
            handles: HashMap::new(),
            entries: BTreeMap::new(),
            next_handle_id: 0,
            next_token: 0,
            dispatcher,
            shared,
        }
    }

    /// Create a handle record, desired closed
    pub(crate) fn add_handle(&mut self, name_args: FeedNameArgs) -> HandleId {
        self.next_handle_id += 1;
        let id = HandleId(self.next_handle_id);
        let serial = name_args.serial();
        self.entries
            .entry(serial.clone())
            .or_insert_with(|| FeedEntry::new(name_args.clone()))
            .handle_ids
            .push(id);
        self.handles.insert(
            id,
            HandleRecord {
                name_args,
                serial,
                desired: DesiredState::Closed,
                last_emitted: HandleState::Closed,
            },
        );
        id
    }

    pub(crate) fn record(&self, id: HandleId) -> Result<&HandleRecord, ClientError> {
        self.handles
            .get(&id)
            .ok_or_else(|| ClientError::Destroyed("feed handle is destroyed".into()))
    }

    pub(crate) fn is_destroyed(&self, id: HandleId) -> bool {
        !self.handles.contains_key(&id)
    }

    pub(crate) fn desire_open(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        id: HandleId,
        fx: &mut Effects,
    ) -> Result<(), ClientError> {
        let record = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| ClientError::Destroyed("feed handle is destroyed".into()))?;
        if record.desired == DesiredState::Open {
            return Err(ClientError::InvalidFeedState(
                "feed is already desired open".into(),
            ));
        }
        record.desired = DesiredState::Open;
        let serial = record.serial.clone();
        self.consider(session, phase, opts, &serial, fx);
        Ok(())
    }

    pub(crate) fn desire_closed(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        id: HandleId,
        fx: &mut Effects,
    ) -> Result<(), ClientError> {
        let record = self
            .handles
            .get_mut(&id)
            .ok_or_else(|| ClientError::Destroyed("feed handle is destroyed".into()))?;
        if record.desired == DesiredState::Closed {
            return Err(ClientError::InvalidFeedState(
                "feed is already desired closed".into(),
            ));
        }
        record.desired = DesiredState::Closed;
        if record.last_emitted != HandleState::Closed {
            record.last_emitted = HandleState::Closed;
            fx.feed(id, FeedEmission::Close(None));
        }
        let serial = record.serial.clone();
        self.consider(session, phase, opts, &serial, fx);
        Ok(())
    }

    /// Remove a handle; the entry goes with it when it was the last one
    pub(crate) fn destroy_handle(&mut self, id: HandleId) -> Result<(), ClientError> {
        let record = self
            .handles
            .get(&id)
            .ok_or_else(|| ClientError::Destroyed("feed handle is destroyed".into()))?;
        if record.desired == DesiredState::Open {
            return Err(ClientError::InvalidFeedState(
                "destroy requires the feed to be desired closed".into(),
            ));
        }
        let serial = record.serial.clone();
        self.handles.remove(&id);
        let now_empty = match self.entries.get_mut(&serial) {
            Some(entry) => {
                entry.handle_ids.retain(|h| *h != id);
                entry.handle_ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.entries.remove(&serial);
        }
        Ok(())
    }

    /// The consider procedure: reconcile one feed against the session
    ///
    /// Takes at most one session action and updates per-handle last-emitted
    /// states. No-op unless connected; the disconnected case is handled by
    /// [`handle_disconnect`](FeedRegistry::handle_disconnect).
    pub(crate) fn consider(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        serial: &FeedSerial,
        fx: &mut Effects,
    ) {
        if phase != ClientState::Connected {
            return;
        }
        let Some((name_args, handle_ids, close_requested, open_pending)) =
            self.entries.get(serial).map(|e| {
                (
                    e.name_args.clone(),
                    e.handle_ids.clone(),
                    e.close_requested,
                    e.open_pending,
                )
            })
        else {
            return;
        };
        let any_open = handle_ids
            .iter()
            .any(|id| matches!(self.handles.get(id), Some(r) if r.desired == DesiredState::Open));
        let feed_state = session.feed_state(&name_args);

        if any_open {
            if feed_state == FeedState::Closed && !close_requested && !open_pending {
                self.issue_feed_open(session, opts, serial, &name_args);
            }
            match feed_state {
                FeedState::Open => {
                    let data = session.feed_data(&name_args).unwrap_or(Value::Null);
                    self.emit_open(&handle_ids, &data, fx);
                }
                FeedState::Closed | FeedState::Opening | FeedState::Closing => {
                    self.emit_opening(&handle_ids, fx);
                }
            }
        } else if feed_state == FeedState::Open && !close_requested {
            self.issue_feed_close(session, serial, &name_args);
        }
    }

    /// Re-run consider for every tracked feed (post-connect reconciliation)
    pub(crate) fn reconcile_all(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        fx: &mut Effects,
    ) {
        let serials: Vec<FeedSerial> = self.entries.keys().cloned().collect();
        for serial in serials {
            self.consider(session, phase, opts, &serial, fx);
        }
    }

    /// A feed-open request came back
    pub(crate) fn handle_open_response(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        name_args: &FeedNameArgs,
        result: Result<(), ClientError>,
        fx: &mut Effects,
    ) {
        let serial = name_args.serial();
        let entry_state = match self.entries.get_mut(&serial) {
            Some(entry) => {
                let timed_out = entry.open_timed_out;
                entry.open_pending = false;
                entry.open_timed_out = false;
                entry.open_timer = None;
                Some((timed_out, entry.handle_ids.clone()))
            }
            None => None,
        };
        let Some((timed_out, handle_ids)) = entry_state else {
            // Every handle was destroyed while the open was in flight; a
            // successful open leaves the session holding a feed nobody
            // wants.
            if result.is_ok() && phase == ClientState::Connected {
                self.issue_feed_close(session, &serial, name_args);
            }
            return;
        };

        if phase != ClientState::Connected {
            return;
        }
        let any_open = handle_ids
            .iter()
            .any(|id| matches!(self.handles.get(id), Some(r) if r.desired == DesiredState::Open));

        match result {
            Ok(()) => {
                if !any_open {
                    self.issue_feed_close(session, &serial, name_args);
                } else {
                    // After a timeout the affected handles were closed; the
                    // late success walks them through opening again.
                    let data = session.feed_data(name_args).unwrap_or(Value::Null);
                    self.emit_open(&handle_ids, &data, fx);
                }
            }
            Err(err) => {
                if timed_out {
                    tracing::debug!(feed = %name_args, "feed open failed after its deadline, already closed");
                } else {
                    for id in &handle_ids {
                        if let Some(record) = self.handles.get_mut(id) {
                            if record.desired == DesiredState::Open
                                && record.last_emitted == HandleState::Opening
                            {
                                record.last_emitted = HandleState::Closed;
                                fx.feed(*id, FeedEmission::Close(Some(err.clone())));
                            }
                        }
                    }
                }
            }
        }
    }

    /// A feed-close request came back
    pub(crate) fn handle_close_response(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        name_args: &FeedNameArgs,
        result: Result<(), ClientError>,
        fx: &mut Effects,
    ) {
        if let Err(err) = result {
            tracing::debug!(feed = %name_args, "feed close reported {err}");
        }
        let serial = name_args.serial();
        if let Some(entry) = self.entries.get_mut(&serial) {
            entry.close_requested = false;
        }
        // A handle may have flipped back to desired open while the close was
        // in flight; consider reopens in that case.
        self.consider(session, phase, opts, &serial, fx);
    }

    /// A feed-open deadline fired
    pub(crate) fn handle_open_timeout(
        &mut self,
        serial: &FeedSerial,
        token: u64,
        fx: &mut Effects,
    ) {
        let Some(entry) = self.entries.get_mut(serial) else {
            return;
        };
        if !entry.open_pending || entry.open_token != token || entry.open_timed_out {
            return;
        }
        entry.open_timed_out = true;
        entry.open_timer = None;
        let handle_ids = entry.handle_ids.clone();
        tracing::warn!(feed = %entry.name_args, "feed open deadline exceeded");
        for id in &handle_ids {
            if let Some(record) = self.handles.get_mut(id) {
                if record.desired == DesiredState::Open
                    && record.last_emitted == HandleState::Opening
                {
                    record.last_emitted = HandleState::Closed;
                    fx.feed(
                        *id,
                        FeedEmission::Close(Some(ClientError::Timeout(
                            "feed open deadline exceeded".into(),
                        ))),
                    );
                }
            }
        }
    }

    /// First half of a server-initiated closure
    pub(crate) fn handle_unexpected_closing(
        &mut self,
        name_args: &FeedNameArgs,
        error: &ClientError,
        fx: &mut Effects,
    ) {
        let serial = name_args.serial();
        let Some(entry) = self.entries.get(&serial) else {
            return;
        };
        let handle_ids = entry.handle_ids.clone();
        self.emit_unexpected_close(&handle_ids, error, fx);
    }

    /// Second half of a server-initiated closure; drives reopen throttling
    pub(crate) fn handle_unexpected_closed(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        name_args: &FeedNameArgs,
        error: &ClientError,
        fx: &mut Effects,
    ) {
        let serial = name_args.serial();
        let Some(entry) = self.entries.get(&serial) else {
            return;
        };
        // Normally a no-op: the closing notification already emitted.
        let handle_ids = entry.handle_ids.clone();
        self.emit_unexpected_close(&handle_ids, error, fx);

        if !matches!(error, ClientError::BadFeedAction(_)) {
            return;
        }
        match opts.reopen_max_attempts {
            ReopenLimit::Unlimited => {
                self.consider(session, phase, opts, &serial, fx);
            }
            ReopenLimit::Disabled => {
                tracing::debug!(feed = %name_args, "automatic reopen disabled");
            }
            ReopenLimit::Limited(max) => {
                self.next_token += 1;
                let token = self.next_token;
                let timer = {
                    let shared = self.shared.clone();
                    let serial = serial.clone();
                    self.dispatcher.schedule(opts.reopen_trailing, move || {
                        if let Some(shared) = shared.upgrade() {
                            shared.on_reopen_decrement(serial, token);
                        }
                    })
                };
                let count = match self.entries.get_mut(&serial) {
                    Some(entry) => {
                        entry.reopen_count += 1;
                        entry.reopen_timers.push((token, timer));
                        entry.reopen_count
                    }
                    None => return,
                };
                if count <= max {
                    self.consider(session, phase, opts, &serial, fx);
                } else {
                    tracing::warn!(
                        feed = %name_args,
                        count,
                        "feed reopen throttled after repeated bad feed actions"
                    );
                }
            }
        }
    }

    /// A trailing-window decrement fired
    pub(crate) fn handle_reopen_decrement(
        &mut self,
        session: &mut SessionGuard,
        phase: ClientState,
        opts: &ClientOptions,
        serial: &FeedSerial,
        token: u64,
        fx: &mut Effects,
    ) {
        let Some(entry) = self.entries.get_mut(serial) else {
            return;
        };
        entry.reopen_timers.retain(|(t, _)| *t != token);
        entry.reopen_count = entry.reopen_count.saturating_sub(1);
        self.consider(session, phase, opts, serial, fx);
    }

    /// A server action mutated an open feed
    pub(crate) fn handle_feed_action(
        &mut self,
        name_args: &FeedNameArgs,
        action_name: &str,
        action_args: &Map<String, Value>,
        new_data: &Value,
        old_data: &Value,
        fx: &mut Effects,
    ) {
        let serial = name_args.serial();
        let Some(entry) = self.entries.get(&serial) else {
            return;
        };
        for id in &entry.handle_ids {
            if let Some(record) = self.handles.get(id) {
                if record.desired == DesiredState::Open
                    && record.last_emitted == HandleState::Open
                {
                    fx.feed(
                        *id,
                        FeedEmission::Action {
                            name: action_name.to_string(),
                            args: action_args.clone(),
                            new_data: new_data.clone(),
                            old_data: old_data.clone(),
                        },
                    );
                }
            }
        }
    }

    /// The session disconnected: reset feed bookkeeping, close out handles
    pub(crate) fn handle_disconnect(&mut self, fx: &mut Effects) {
        let mut ordered_handles: Vec<HandleId> = Vec::new();
        for entry in self.entries.values_mut() {
            entry.open_pending = false;
            entry.open_timed_out = false;
            entry.open_timer = None;
            entry.close_requested = false;
            entry.reopen_count = 0;
            entry.reopen_timers.clear();
            ordered_handles.extend(entry.handle_ids.iter().copied());
        }
        for id in ordered_handles {
            if let Some(record) = self.handles.get_mut(&id) {
                if record.desired == DesiredState::Open
                    && record.last_emitted != HandleState::Closed
                {
                    record.last_emitted = HandleState::Closed;
                    fx.feed(id, FeedEmission::Close(Some(ClientError::NotConnected)));
                }
            }
        }
    }

    /// Drop every record and entry; part of client destruction
    pub(crate) fn destroy_all(&mut self) {
        self.entries.clear();
        self.handles.clear();
    }

    fn issue_feed_open(
        &mut self,
        session: &mut SessionGuard,
        opts: &ClientOptions,
        serial: &FeedSerial,
        name_args: &FeedNameArgs,
    ) {
        self.next_token += 1;
        let token = self.next_token;
        let reply_shared = self.shared.clone();
        let reply_args = name_args.clone();
        session.feed_open(
            name_args,
            Box::new(move |result| {
                if let Some(shared) = reply_shared.upgrade() {
                    shared.on_feed_open_response(reply_args, result);
                }
            }),
        );
        let timer = opts.feed_timeout.map(|budget| {
            let shared = self.shared.clone();
            let serial = serial.clone();
            self.dispatcher.schedule(budget, move || {
                if let Some(shared) = shared.upgrade() {
                    shared.on_feed_open_timeout(serial, token);
                }
            })
        });
        if let Some(entry) = self.entries.get_mut(serial) {
            entry.open_pending = true;
            entry.open_timed_out = false;
            entry.open_token = token;
            entry.open_timer = timer;
        }
        tracing::debug!(feed = %name_args, "feed open issued");
    }

    fn issue_feed_close(
        &mut self,
        session: &mut SessionGuard,
        serial: &FeedSerial,
        name_args: &FeedNameArgs,
    ) {
        let reply_shared = self.shared.clone();
        let reply_args = name_args.clone();
        session.feed_close(
            name_args,
            Box::new(move |result| {
                if let Some(shared) = reply_shared.upgrade() {
                    shared.on_feed_close_response(reply_args, result);
                }
            }),
        );
        if let Some(entry) = self.entries.get_mut(serial) {
            entry.close_requested = true;
        }
        tracing::debug!(feed = %name_args, "feed close issued");
    }

    /// Emit `opening` to desired-open handles that have not seen it
    fn emit_opening(&mut self, handle_ids: &[HandleId], fx: &mut Effects) {
        for id in handle_ids {
            if let Some(record) = self.handles.get_mut(id) {
                if record.desired == DesiredState::Open
                    && record.last_emitted != HandleState::Opening
                {
                    record.last_emitted = HandleState::Opening;
                    fx.feed(*id, FeedEmission::Opening);
                }
            }
        }
    }

    /// Walk desired-open handles up to `open`, via `opening` where needed
    fn emit_open(&mut self, handle_ids: &[HandleId], data: &Value, fx: &mut Effects) {
        for id in handle_ids {
            if let Some(record) = self.handles.get_mut(id) {
                if record.desired == DesiredState::Open
                    && record.last_emitted != HandleState::Open
                {
                    if record.last_emitted != HandleState::Opening {
                        fx.feed(*id, FeedEmission::Opening);
                    }
                    record.last_emitted = HandleState::Open;
                    fx.feed(*id, FeedEmission::Open(data.clone()));
                }
            }
        }
    }

    fn emit_unexpected_close(
        &mut self,
        handle_ids: &[HandleId],
        error: &ClientError,
        fx: &mut Effects,
    ) {
        for id in handle_ids {
            if let Some(record) = self.handles.get_mut(id) {
                if record.desired == DesiredState::Open
                    && record.last_emitted != HandleState::Closed
                {
                    record.last_emitted = HandleState::Closed;
                    fx.feed(*id, FeedEmission::Close(Some(error.clone())));
                }
            }
        }
    }
}
