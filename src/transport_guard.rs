//! Transport contract enforcement
//!
//! Wraps an application-supplied [`Transport`] and polices its state machine
//! and event discipline, exposing a narrower, panic-free surface to the
//! session layer. Violations surface synchronously as
//! [`ClientError::TransportViolation`] on the offending call and are
//! additionally reported asynchronously to error subscribers.

use crate::data::TransportState;
use crate::dispatch::Dispatcher;
use crate::error::{ClientError, TransportFault};
use crate::transport::{Transport, TransportEvent, TransportEventSink};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Set of transport states the guard currently accepts from `state()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StateSet(u8);

impl StateSet {
    const DISCONNECTED: StateSet = StateSet(0b001);
    const CONNECTING: StateSet = StateSet(0b010);
    const CONNECTED: StateSet = StateSet(0b100);
    const ALL: StateSet = StateSet(0b111);

    fn union(self, other: StateSet) -> StateSet {
        StateSet(self.0 | other.0)
    }

    fn contains(self, state: TransportState) -> bool {
        let bit = match state {
            TransportState::Disconnected => StateSet::DISCONNECTED.0,
            TransportState::Connecting => StateSet::CONNECTING.0,
            TransportState::Connected => StateSet::CONNECTED.0,
        };
        self.0 & bit != 0
    }

    fn describe(self) -> String {
        let mut parts = Vec::new();
        if self.contains(TransportState::Disconnected) {
            parts.push("disconnected");
        }
        if self.contains(TransportState::Connecting) {
            parts.push("connecting");
        }
        if self.contains(TransportState::Connected) {
            parts.push("connected");
        }
        format!("{{{}}}", parts.join(", "))
    }
}

/// Where the guard stands in the transport's emission sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmissionPhase {
    /// Before `connecting`, or after a `disconnect` event.
    Idle,
    /// `connecting` observed, awaiting `connect` or `disconnect`.
    Connecting,
    /// `connect` observed, messages may flow until `disconnect`.
    Connected,
}

struct GuardState {
    /// States `state()` may legitimately return right now.
    permitted: StateSet,
    /// Generation stamp for the pending deferred-set replacement.
    observation_generation: u64,
    /// `connect()` calls whose matching `connecting` event is still owed.
    connect_debt: u32,
    /// Errors queued by `disconnect(err)` calls, front = oldest request.
    expected_disconnects: VecDeque<Option<ClientError>>,
    phase: EmissionPhase,
    in_method: bool,
    downstream: Option<TransportEventSink>,
    error_subscribers: Vec<Arc<dyn Fn(ClientError) + Send + Sync>>,
}

/// Disciplined wrapper around a raw [`Transport`]
pub struct TransportGuard<T: Transport> {
    inner: T,
    shared: Arc<Mutex<GuardState>>,
    dispatcher: Dispatcher,
}

impl<T: Transport> std::fmt::Debug for TransportGuard<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportGuard").finish_non_exhaustive()
    }
}

impl<T: Transport> TransportGuard<T> {
    /// Wrap a transport, verifying it starts `Disconnected`
    pub fn new(mut inner: T, dispatcher: Dispatcher) -> Result<Self, ClientError> {
        let initial = inner.state();
        if initial != TransportState::Disconnected {
            return Err(ClientError::transport_violation(
                "transport must report disconnected at construction",
                TransportFault::UnexpectedState {
                    observed: initial.label(),
                    permitted: StateSet::DISCONNECTED.describe(),
                },
            ));
        }
        let shared = Arc::new(Mutex::new(GuardState {
            permitted: StateSet::DISCONNECTED,
            observation_generation: 0,
            connect_debt: 0,
            expected_disconnects: VecDeque::new(),
            phase: EmissionPhase::Idle,
            in_method: false,
            downstream: None,
            error_subscribers: Vec::new(),
        }));
        let sink_shared = Arc::clone(&shared);
        let sink_dispatcher = dispatcher.clone();
        inner.subscribe(TransportEventSink::new(move |event| {
            intake(&sink_shared, &sink_dispatcher, event)
        }));
        Ok(Self {
            inner,
            shared,
            dispatcher,
        })
    }

    /// Register the downstream consumer of validated, deferred events
    pub fn subscribe(&mut self, sink: TransportEventSink) {
        self.shared.lock().unwrap().downstream = Some(sink);
    }

    /// Register a subscriber for asynchronous violation reports
    pub fn subscribe_errors(&mut self, f: impl Fn(ClientError) + Send + Sync + 'static) {
        self.shared
            .lock()
            .unwrap()
            .error_subscribers
            .push(Arc::new(f));
    }

    /// Observed transport state, validated against the permitted set
    pub fn state(&mut self) -> Result<TransportState, ClientError> {
        self.observe(None)
    }

    /// Begin connecting. Permitted only while observed `Disconnected`.
    pub fn connect(&mut self) -> Result<(), ClientError> {
        let observed = self.observe(None)?;
        if observed != TransportState::Disconnected {
            return Err(ClientError::InvalidState(format!(
                "connect() requires a disconnected transport, observed {observed}"
            )));
        }
        self.run_inner("connect", |t| t.connect())?;
        self.shared.lock().unwrap().connect_debt += 1;
        self.observe(Some(StateSet::ALL))?;
        Ok(())
    }

    /// Send one frame. Permitted only while observed `Connected`.
    pub fn send(&mut self, frame: &str) -> Result<(), ClientError> {
        let observed = self.observe(None)?;
        if observed != TransportState::Connected {
            return Err(ClientError::InvalidState(format!(
                "send() requires a connected transport, observed {observed}"
            )));
        }
        self.run_inner("send", |t| t.send(frame))?;
        // A send may drop the connection but may not un-establish it.
        self.observe(Some(StateSet::DISCONNECTED.union(StateSet::CONNECTED)))?;
        Ok(())
    }

    /// Drop the connection. Permitted while observed `Connecting` or
    /// `Connected`; the optional error is replayed on the resulting
    /// `Disconnect` event if the transport emits it argument-less.
    pub fn disconnect(&mut self, err: Option<ClientError>) -> Result<(), ClientError> {
        let observed = self.observe(None)?;
        if observed == TransportState::Disconnected {
            return Err(ClientError::InvalidState(
                "disconnect() requires a connecting or connected transport".into(),
            ));
        }
        self.run_inner("disconnect", |t| t.disconnect(err.clone()))?;
        self.shared
            .lock()
            .unwrap()
            .expected_disconnects
            .push_back(err);
        self.observe(Some(StateSet::DISCONNECTED))?;
        Ok(())
    }

    /// Read and validate `inner.state()`, then update the permitted sets
    fn observe(
        &mut self,
        widened: Option<StateSet>,
    ) -> Result<TransportState, ClientError> {
        let observed = self.inner.state();
        let mut st = self.shared.lock().unwrap();
        let permitted = widened.unwrap_or(st.permitted);
        if !permitted.contains(observed) {
            drop(st);
            return Err(self.raise(
                "transport state() returned a value outside the permitted set",
                TransportFault::UnexpectedState {
                    observed: observed.label(),
                    permitted: permitted.describe(),
                },
            ));
        }
        apply_observation(&mut st, observed, &self.shared, &self.dispatcher);
        Ok(observed)
    }

    fn run_inner(
        &mut self,
        op: &str,
        f: impl FnOnce(&mut T) -> Result<(), ClientError>,
    ) -> Result<(), ClientError> {
        self.shared.lock().unwrap().in_method = true;
        let result = f(&mut self.inner);
        self.shared.lock().unwrap().in_method = false;
        result.map_err(|e| {
            self.raise(
                format!("transport {op}() failed"),
                TransportFault::OperationFailed(e.to_string()),
            )
        })
    }

    fn raise(&self, message: impl Into<String>, fault: TransportFault) -> ClientError {
        raise_violation(&self.shared, &self.dispatcher, message, fault)
    }
}

/// Record an observation and arm the one-turn-deferred set replacement
fn apply_observation(
    st: &mut GuardState,
    observed: TransportState,
    shared: &Arc<Mutex<GuardState>>,
    dispatcher: &Dispatcher,
) {
    let (immediate, deferred) = match observed {
        TransportState::Disconnected => (StateSet::DISCONNECTED, StateSet::DISCONNECTED),
        TransportState::Connecting => (StateSet::CONNECTING, StateSet::ALL),
        TransportState::Connected => (
            StateSet::CONNECTED,
            StateSet::DISCONNECTED.union(StateSet::CONNECTED),
        ),
    };
    st.permitted = immediate;
    st.observation_generation += 1;
    let generation = st.observation_generation;
    let shared = Arc::clone(shared);
    dispatcher.defer(move || {
        let mut st = shared.lock().unwrap();
        if st.observation_generation == generation {
            st.permitted = deferred;
        }
    });
}

/// Build a violation error, log it, and fan it out asynchronously
fn raise_violation(
    shared: &Arc<Mutex<GuardState>>,
    dispatcher: &Dispatcher,
    message: impl Into<String>,
    fault: TransportFault,
) -> ClientError {
    let err = ClientError::transport_violation(message, fault);
    tracing::error!("transport contract violation: {err}");
    let subscribers = shared.lock().unwrap().error_subscribers.clone();
    if !subscribers.is_empty() {
        let notify = err.clone();
        dispatcher.defer(move || {
            for subscriber in &subscribers {
                subscriber(notify.clone());
            }
        });
    }
    err
}

/// Validate an inbound transport event and schedule its re-emission
fn intake(
    shared: &Arc<Mutex<GuardState>>,
    dispatcher: &Dispatcher,
    event: TransportEvent,
) -> Result<(), ClientError> {
    let mut st = shared.lock().unwrap();
    if st.in_method {
        let label = event.label();
        drop(st);
        return Err(raise_violation(
            shared,
            dispatcher,
            format!("transport emitted {label} inside a method call"),
            TransportFault::EmissionDuringCall(label.into()),
        ));
    }

    let validated = match event {
        TransportEvent::Connecting => {
            if st.phase != EmissionPhase::Idle {
                drop(st);
                return Err(raise_violation(
                    shared,
                    dispatcher,
                    "connecting emitted out of sequence",
                    TransportFault::InvalidEmission("connecting".into()),
                ));
            }
            if st.connect_debt == 0 {
                drop(st);
                return Err(raise_violation(
                    shared,
                    dispatcher,
                    "connecting emitted with no matching connect() call",
                    TransportFault::InvalidEmission("connecting".into()),
                ));
            }
            st.connect_debt -= 1;
            st.phase = EmissionPhase::Connecting;
            TransportEvent::Connecting
        }
        TransportEvent::Connect => {
            if st.phase != EmissionPhase::Connecting {
                drop(st);
                return Err(raise_violation(
                    shared,
                    dispatcher,
                    "connect emitted out of sequence",
                    TransportFault::InvalidEmission("connect".into()),
                ));
            }
            st.phase = EmissionPhase::Connected;
            TransportEvent::Connect
        }
        TransportEvent::Message(frame) => {
            if st.phase != EmissionPhase::Connected {
                drop(st);
                return Err(raise_violation(
                    shared,
                    dispatcher,
                    "message emitted outside a connected stretch",
                    TransportFault::InvalidEmission("message".into()),
                ));
            }
            TransportEvent::Message(frame)
        }
        TransportEvent::Disconnect(err) => {
            if st.phase == EmissionPhase::Idle {
                drop(st);
                return Err(raise_violation(
                    shared,
                    dispatcher,
                    "disconnect emitted out of sequence",
                    TransportFault::InvalidEmission("disconnect".into()),
                ));
            }
            let queued = st.expected_disconnects.pop_front();
            let effective = match err {
                Some(e) => Some(e),
                None => match queued {
                    Some(stored) => stored,
                    None => {
                        drop(st);
                        return Err(raise_violation(
                            shared,
                            dispatcher,
                            "argument-less disconnect emitted with no matching disconnect() call",
                            TransportFault::InvalidEmission("disconnect".into()),
                        ));
                    }
                },
            };
            st.phase = EmissionPhase::Idle;
            TransportEvent::Disconnect(effective)
        }
    };

    if let Some(sink) = st.downstream.clone() {
        drop(st);
        dispatcher.defer(move || {
            if let Err(e) = sink.emit(validated) {
                tracing::warn!("downstream transport subscriber rejected event: {e}");
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockInner {
        state: TransportState,
        sink: Option<TransportEventSink>,
        connect_calls: u32,
        sent: Vec<String>,
        emit_inside_connect: bool,
        fail_connect: bool,
    }

    #[derive(Clone)]
    struct MockTransport {
        shared: Arc<Mutex<MockInner>>,
    }

    impl MockTransport {
        fn new() -> Self {
            Self {
                shared: Arc::new(Mutex::new(MockInner {
                    state: TransportState::Disconnected,
                    sink: None,
                    connect_calls: 0,
                    sent: Vec::new(),
                    emit_inside_connect: false,
                    fail_connect: false,
                })),
            }
        }

        fn set_state(&self, state: TransportState) {
            self.shared.lock().unwrap().state = state;
        }

        fn emit(&self, event: TransportEvent) -> Result<(), ClientError> {
            let sink = self.shared.lock().unwrap().sink.clone().unwrap();
            sink.emit(event)
        }
    }

    impl Transport for MockTransport {
        fn state(&self) -> TransportState {
            self.shared.lock().unwrap().state
        }

        fn connect(&mut self) -> Result<(), ClientError> {
            let (fail, emit_inside, sink) = {
                let mut inner = self.shared.lock().unwrap();
                inner.connect_calls += 1;
                if !inner.fail_connect {
                    inner.state = TransportState::Connecting;
                }
                (
                    inner.fail_connect,
                    inner.emit_inside_connect,
                    inner.sink.clone(),
                )
            };
            if fail {
                return Err(ClientError::TransportFailure("dial failed".into()));
            }
            if emit_inside {
                if let Some(sink) = sink {
                    return sink.emit(TransportEvent::Connecting);
                }
            }
            Ok(())
        }

        fn send(&mut self, frame: &str) -> Result<(), ClientError> {
            self.shared.lock().unwrap().sent.push(frame.to_string());
            Ok(())
        }

        fn disconnect(&mut self, _err: Option<ClientError>) -> Result<(), ClientError> {
            self.shared.lock().unwrap().state = TransportState::Disconnected;
            Ok(())
        }

        fn subscribe(&mut self, sink: TransportEventSink) {
            self.shared.lock().unwrap().sink = Some(sink);
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn guard_pair() -> (MockTransport, TransportGuard<MockTransport>) {
        let mock = MockTransport::new();
        let guard = TransportGuard::new(mock.clone(), Dispatcher::new()).unwrap();
        (mock, guard)
    }

    #[tokio::test]
    async fn construction_requires_disconnected() {
        let mock = MockTransport::new();
        mock.set_state(TransportState::Connected);
        let err = TransportGuard::new(mock, Dispatcher::new()).unwrap_err();
        assert!(matches!(err, ClientError::TransportViolation { .. }));
    }

    #[tokio::test]
    async fn connect_only_from_disconnected() {
        let (mock, mut guard) = guard_pair();
        guard.connect().unwrap();
        assert_eq!(mock.shared.lock().unwrap().connect_calls, 1);

        // Still connecting: a second connect is a caller error, not a
        // transport violation.
        settle().await;
        let err = guard.connect().unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));
    }

    #[tokio::test]
    async fn connect_failure_is_a_violation() {
        let (mock, mut guard) = guard_pair();
        mock.shared.lock().unwrap().fail_connect = true;
        let err = guard.connect().unwrap_err();
        assert!(matches!(err, ClientError::TransportViolation { .. }));
    }

    #[tokio::test]
    async fn connecting_without_debt_is_rejected() {
        let (mock, _guard) = guard_pair();
        let err = mock.emit(TransportEvent::Connecting).unwrap_err();
        assert!(matches!(err, ClientError::TransportViolation { .. }));
    }

    #[tokio::test]
    async fn unrequested_argless_disconnect_is_rejected() {
        let (mock, mut guard) = guard_pair();
        guard.connect().unwrap();
        mock.emit(TransportEvent::Connecting).unwrap();
        mock.emit(TransportEvent::Connect).unwrap();
        let err = mock.emit(TransportEvent::Disconnect(None)).unwrap_err();
        assert!(matches!(err, ClientError::TransportViolation { .. }));
    }

    #[tokio::test]
    async fn queued_disconnect_error_is_replayed() {
        let (mock, mut guard) = guard_pair();
        let received: Arc<Mutex<Vec<TransportEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&received);
        guard.subscribe(TransportEventSink::new(move |ev| {
            sink_events.lock().unwrap().push(ev);
            Ok(())
        }));

        guard.connect().unwrap();
        mock.emit(TransportEvent::Connecting).unwrap();
        mock.emit(TransportEvent::Connect).unwrap();
        settle().await;
        mock.set_state(TransportState::Connected);
        settle().await;

        guard
            .disconnect(Some(ClientError::Timeout("handshake budget".into())))
            .unwrap();
        mock.emit(TransportEvent::Disconnect(None)).unwrap();
        settle().await;

        let events = received.lock().unwrap();
        match events.last() {
            Some(TransportEvent::Disconnect(Some(ClientError::Timeout(_)))) => {}
            other => panic!("expected disconnect with queued timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_are_deferred_and_ordered() {
        let (mock, mut guard) = guard_pair();
        let received: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&received);
        guard.subscribe(TransportEventSink::new(move |ev| {
            sink_events.lock().unwrap().push(match ev {
                TransportEvent::Connecting => "connecting",
                TransportEvent::Connect => "connect",
                TransportEvent::Message(_) => "message",
                TransportEvent::Disconnect(_) => "disconnect",
            });
            Ok(())
        }));

        guard.connect().unwrap();
        mock.emit(TransportEvent::Connecting).unwrap();
        mock.emit(TransportEvent::Connect).unwrap();
        mock.emit(TransportEvent::Message("hello".into())).unwrap();
        // Nothing delivered yet: re-emission is deferred.
        assert!(received.lock().unwrap().is_empty());
        settle().await;
        assert_eq!(
            *received.lock().unwrap(),
            vec!["connecting", "connect", "message"]
        );
    }

    #[tokio::test]
    async fn emission_inside_method_call_is_rejected() {
        let (mock, mut guard) = guard_pair();
        mock.shared.lock().unwrap().emit_inside_connect = true;
        let err = guard.connect().unwrap_err();
        assert!(matches!(err, ClientError::TransportViolation { .. }));
    }

    #[tokio::test]
    async fn violations_notify_error_subscribers_asynchronously() {
        let (mock, mut guard) = guard_pair();
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&reports);
        guard.subscribe_errors(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _ = mock.emit(TransportEvent::Connecting);
        assert_eq!(reports.load(Ordering::SeqCst), 0);
        settle().await;
        assert_eq!(reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn synchronous_state_flip_outside_permitted_set_is_rejected() {
        let (mock, mut guard) = guard_pair();
        guard.connect().unwrap();
        // Guard observed connecting at the end of connect(); a same-turn
        // report of connected is out of the immediate set.
        mock.set_state(TransportState::Connected);
        let err = guard.state().unwrap_err();
        assert!(matches!(err, ClientError::TransportViolation { .. }));
    }

    #[tokio::test]
    async fn deferred_set_admits_transition_after_a_turn() {
        let (mock, mut guard) = guard_pair();
        guard.connect().unwrap();
        settle().await;
        mock.set_state(TransportState::Connected);
        assert_eq!(guard.state().unwrap(), TransportState::Connected);
    }

    #[tokio::test]
    async fn send_requires_connected() {
        let (mock, mut guard) = guard_pair();
        let err = guard.send("frame").unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(_)));

        guard.connect().unwrap();
        mock.emit(TransportEvent::Connecting).unwrap();
        mock.emit(TransportEvent::Connect).unwrap();
        settle().await;
        mock.set_state(TransportState::Connected);
        settle().await;
        guard.send("frame").unwrap();
        assert_eq!(mock.shared.lock().unwrap().sent, vec!["frame"]);
    }
}
