//! Shared test harness: a scriptable session and recording listeners
#![allow(dead_code)]

use feedme_client::data::{FeedNameArgs, FeedSerial, FeedState, SessionState};
use feedme_client::error::ClientError;
use feedme_client::events::ClientListener;
use feedme_client::feed::FeedListener;
use feedme_client::session::{ActionReply, FeedReply, Session, SessionEvent, SessionEventSink};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Let queued jobs drain without advancing virtual time
pub async fn settle() {
    for _ in 0..12 {
        tokio::task::yield_now().await;
    }
}

/// Stable tag for an error, for compact test assertions
pub fn err_tag(err: &ClientError) -> &'static str {
    match err {
        ClientError::InvalidArgument(_) => "INVALID_ARGUMENT",
        ClientError::InvalidState(_) => "INVALID_STATE",
        ClientError::InvalidFeedState(_) => "INVALID_FEED_STATE",
        ClientError::Destroyed(_) => "DESTROYED",
        ClientError::NotConnected => "NOT_CONNECTED",
        ClientError::Timeout(_) => "TIMEOUT",
        ClientError::Rejected(_) => "REJECTED",
        ClientError::HandshakeRejected(_) => "HANDSHAKE_REJECTED",
        ClientError::TransportFailure(_) => "TRANSPORT_FAILURE",
        ClientError::Terminated(_) => "TERMINATED",
        ClientError::BadFeedAction(_) => "BAD_FEED_ACTION",
        ClientError::TransportViolation { .. } => "TRANSPORT_ERROR",
    }
}

pub fn fna(name: &str, args: &[(&str, &str)]) -> FeedNameArgs {
    FeedNameArgs::new(
        name,
        args.iter().map(|(k, v)| (k.to_string(), v.to_string())),
    )
    .unwrap()
}

struct PendingAction {
    name: String,
    reply: ActionReply,
}

struct PendingFeed {
    name_args: FeedNameArgs,
    reply: FeedReply,
}

#[derive(Default)]
struct MockSessionState {
    state: Option<SessionState>,
    sink: Option<SessionEventSink>,
    destroyed: bool,
    connect_calls: u32,
    disconnect_errors: Vec<Option<ClientError>>,
    pending_actions: Vec<PendingAction>,
    pending_opens: Vec<PendingFeed>,
    pending_closes: Vec<PendingFeed>,
    feed_states: HashMap<FeedSerial, FeedState>,
    feed_data: HashMap<FeedSerial, Value>,
}

/// Scriptable session: the test drives replies and events by hand
#[derive(Clone)]
pub struct MockSession {
    shared: Arc<Mutex<MockSessionState>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockSessionState {
                state: Some(SessionState::Disconnected),
                ..Default::default()
            })),
        }
    }

    fn sink(&self) -> SessionEventSink {
        self.shared
            .lock()
            .unwrap()
            .sink
            .clone()
            .expect("session not subscribed")
    }

    pub fn connect_calls(&self) -> u32 {
        self.shared.lock().unwrap().connect_calls
    }

    pub fn disconnect_errors(&self) -> Vec<Option<ClientError>> {
        self.shared.lock().unwrap().disconnect_errors.clone()
    }

    pub fn pending_action_count(&self) -> usize {
        self.shared.lock().unwrap().pending_actions.len()
    }

    pub fn pending_open_count(&self) -> usize {
        self.shared.lock().unwrap().pending_opens.len()
    }

    pub fn pending_close_count(&self) -> usize {
        self.shared.lock().unwrap().pending_closes.len()
    }

    pub fn emit_connecting(&self) {
        self.shared.lock().unwrap().state = Some(SessionState::Connecting);
        self.sink().emit(SessionEvent::Connecting);
    }

    pub fn emit_connect(&self) {
        self.shared.lock().unwrap().state = Some(SessionState::Connected);
        self.sink().emit(SessionEvent::Connect);
    }

    /// Session-contract disconnect: outstanding requests are replied to
    /// (actions first, then feed operations), feed state resets, then the
    /// event goes out.
    pub fn emit_disconnect(&self, err: Option<ClientError>) {
        let (actions, opens, closes) = {
            let mut state = self.shared.lock().unwrap();
            state.state = Some(SessionState::Disconnected);
            state.feed_states.clear();
            state.feed_data.clear();
            (
                std::mem::take(&mut state.pending_actions),
                std::mem::take(&mut state.pending_opens),
                std::mem::take(&mut state.pending_closes),
            )
        };
        for action in actions {
            (action.reply)(Err(ClientError::NotConnected));
        }
        for open in opens {
            (open.reply)(Err(ClientError::NotConnected));
        }
        for close in closes {
            (close.reply)(Err(ClientError::NotConnected));
        }
        self.sink().emit(SessionEvent::Disconnect(err));
    }

    /// Reply to the oldest outstanding action
    pub fn reply_action(&self, result: Result<Value, ClientError>) {
        let action = {
            let mut state = self.shared.lock().unwrap();
            assert!(!state.pending_actions.is_empty(), "no pending action");
            state.pending_actions.remove(0)
        };
        (action.reply)(result);
    }

    /// Complete the oldest outstanding feed open successfully with `data`
    pub fn complete_feed_open(&self, data: Value) {
        let open = {
            let mut state = self.shared.lock().unwrap();
            assert!(!state.pending_opens.is_empty(), "no pending feed open");
            let open = state.pending_opens.remove(0);
            let serial = open.name_args.serial();
            state.feed_states.insert(serial.clone(), FeedState::Open);
            state.feed_data.insert(serial, data);
            open
        };
        (open.reply)(Ok(()));
    }

    /// Fail the oldest outstanding feed open
    pub fn reject_feed_open(&self, err: ClientError) {
        let open = {
            let mut state = self.shared.lock().unwrap();
            assert!(!state.pending_opens.is_empty(), "no pending feed open");
            let open = state.pending_opens.remove(0);
            state
                .feed_states
                .insert(open.name_args.serial(), FeedState::Closed);
            open
        };
        (open.reply)(Err(err));
    }

    /// Complete the oldest outstanding feed close
    pub fn complete_feed_close(&self) {
        let close = {
            let mut state = self.shared.lock().unwrap();
            assert!(!state.pending_closes.is_empty(), "no pending feed close");
            let close = state.pending_closes.remove(0);
            let serial = close.name_args.serial();
            state.feed_states.insert(serial.clone(), FeedState::Closed);
            state.feed_data.remove(&serial);
            close
        };
        (close.reply)(Ok(()));
    }

    /// Two-phase server-initiated closure, first half
    pub fn emit_unexpected_closing(&self, feed: &FeedNameArgs, err: ClientError) {
        self.shared
            .lock()
            .unwrap()
            .feed_states
            .insert(feed.serial(), FeedState::Closing);
        self.sink().emit(SessionEvent::UnexpectedFeedClosing {
            name_args: feed.clone(),
            error: err,
        });
    }

    /// Two-phase server-initiated closure, second half
    pub fn emit_unexpected_closed(&self, feed: &FeedNameArgs, err: ClientError) {
        {
            let mut state = self.shared.lock().unwrap();
            let serial = feed.serial();
            state.feed_states.insert(serial.clone(), FeedState::Closed);
            state.feed_data.remove(&serial);
        }
        self.sink().emit(SessionEvent::UnexpectedFeedClosed {
            name_args: feed.clone(),
            error: err,
        });
    }

    /// Apply and report a server-side feed action
    pub fn emit_feed_action(
        &self,
        feed: &FeedNameArgs,
        action_name: &str,
        action_args: Map<String, Value>,
        new_data: Value,
    ) {
        let old_data = {
            let mut state = self.shared.lock().unwrap();
            let serial = feed.serial();
            let old = state.feed_data.get(&serial).cloned().unwrap_or(Value::Null);
            state.feed_data.insert(serial, new_data.clone());
            old
        };
        self.sink().emit(SessionEvent::FeedAction {
            name_args: feed.clone(),
            action_name: action_name.to_string(),
            action_args,
            new_data,
            old_data,
        });
    }

    pub fn emit_bad_server_message(&self, err: ClientError) {
        self.sink().emit(SessionEvent::BadServerMessage(err));
    }
}

impl Session for MockSession {
    fn state(&self) -> SessionState {
        self.shared
            .lock()
            .unwrap()
            .state
            .unwrap_or(SessionState::Disconnected)
    }

    fn connect(&mut self) -> Result<(), ClientError> {
        let mut state = self.shared.lock().unwrap();
        state.connect_calls += 1;
        state.state = Some(SessionState::Connecting);
        Ok(())
    }

    fn disconnect(&mut self, err: Option<ClientError>) -> Result<(), ClientError> {
        self.shared
            .lock()
            .unwrap()
            .disconnect_errors
            .push(err.clone());
        // The session tears down and reports the disconnect itself.
        self.emit_disconnect(err);
        Ok(())
    }

    fn action(&mut self, name: &str, _args: &Map<String, Value>, reply: ActionReply) {
        self.shared.lock().unwrap().pending_actions.push(PendingAction {
            name: name.to_string(),
            reply,
        });
    }

    fn feed_open(&mut self, feed: &FeedNameArgs, reply: FeedReply) {
        let mut state = self.shared.lock().unwrap();
        state
            .feed_states
            .insert(feed.serial(), FeedState::Opening);
        state.pending_opens.push(PendingFeed {
            name_args: feed.clone(),
            reply,
        });
    }

    fn feed_close(&mut self, feed: &FeedNameArgs, reply: FeedReply) {
        let mut state = self.shared.lock().unwrap();
        state
            .feed_states
            .insert(feed.serial(), FeedState::Closing);
        state.pending_closes.push(PendingFeed {
            name_args: feed.clone(),
            reply,
        });
    }

    fn feed_state(&self, feed: &FeedNameArgs) -> FeedState {
        self.shared
            .lock()
            .unwrap()
            .feed_states
            .get(&feed.serial())
            .copied()
            .unwrap_or(FeedState::Closed)
    }

    fn feed_data(&self, feed: &FeedNameArgs) -> Option<Value> {
        self.shared
            .lock()
            .unwrap()
            .feed_data
            .get(&feed.serial())
            .cloned()
    }

    fn destroy(&mut self) {
        self.shared.lock().unwrap().destroyed = true;
    }

    fn destroyed(&self) -> bool {
        self.shared.lock().unwrap().destroyed
    }

    fn subscribe(&mut self, sink: SessionEventSink) {
        self.shared.lock().unwrap().sink = Some(sink);
    }
}

/// Client listener that appends event tags to a shared log
pub struct RecordingClientListener {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingClientListener {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Arc::new(Self { log: log.clone() }), log)
    }

    /// Share an existing log, so callbacks and events interleave in it
    pub fn with_log(log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { log })
    }
}

impl ClientListener for RecordingClientListener {
    fn on_connecting(&self) {
        self.log.lock().unwrap().push("connecting".into());
    }

    fn on_connect(&self) {
        self.log.lock().unwrap().push("connect".into());
    }

    fn on_disconnect(&self, err: Option<&ClientError>) {
        let entry = match err {
            Some(e) => format!("disconnect {}", err_tag(e)),
            None => "disconnect".into(),
        };
        self.log.lock().unwrap().push(entry);
    }

    fn on_bad_server_message(&self, err: &ClientError) {
        self.log
            .lock()
            .unwrap()
            .push(format!("bad_server_message {}", err_tag(err)));
    }

    fn on_transport_error(&self, err: &ClientError) {
        self.log
            .lock()
            .unwrap()
            .push(format!("transport_error {}", err_tag(err)));
    }
}

/// Feed listener that appends event tags to a shared log
pub struct RecordingFeedListener {
    log: Arc<Mutex<Vec<String>>>,
}

impl RecordingFeedListener {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        (Arc::new(Self { log: log.clone() }), log)
    }

    pub fn with_log(log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
        Arc::new(Self { log })
    }
}

impl FeedListener for RecordingFeedListener {
    fn on_opening(&self) {
        self.log.lock().unwrap().push("opening".into());
    }

    fn on_open(&self, data: &Value) {
        self.log.lock().unwrap().push(format!("open {data}"));
    }

    fn on_close(&self, err: Option<&ClientError>) {
        let entry = match err {
            Some(e) => format!("close {}", err_tag(e)),
            None => "close".into(),
        };
        self.log.lock().unwrap().push(entry);
    }

    fn on_action(&self, name: &str, _args: &Map<String, Value>, new_data: &Value, _old: &Value) {
        self.log
            .lock()
            .unwrap()
            .push(format!("action {name} {new_data}"));
    }
}
