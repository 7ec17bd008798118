//! Session adaptation: deferral and burst ordering
//!
//! Wraps a [`Session`] so that no reply or event it produces ever reaches the
//! client synchronously inside the call that armed it. Inbound deliveries are
//! buffered at receipt and flushed one burst at a time on the dispatch queue,
//! in class order: action replies first, then feed-open/close replies, then
//! events, FIFO within each class. That class order is what guarantees every
//! pending request reply lands before a `Disconnect` event from the same
//! burst.

use crate::data::{FeedNameArgs, FeedState, SessionState};
use crate::dispatch::Dispatcher;
use crate::error::ClientError;
use crate::session::{ActionReply, FeedReply, Session, SessionEvent, SessionEventSink};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Delivery = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Intake {
    actions: VecDeque<Delivery>,
    feeds: VecDeque<Delivery>,
    events: VecDeque<SessionEvent>,
    downstream: Option<SessionEventSink>,
    flush_scheduled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryClass {
    Action,
    Feed,
}

/// Deferring wrapper around a [`Session`]
pub struct SessionGuard {
    inner: Box<dyn Session>,
    intake: Arc<Mutex<Intake>>,
    dispatcher: Dispatcher,
}

impl SessionGuard {
    pub fn new(mut inner: Box<dyn Session>, dispatcher: Dispatcher) -> Self {
        let intake: Arc<Mutex<Intake>> = Arc::new(Mutex::new(Intake::default()));
        let sink_intake = Arc::clone(&intake);
        let sink_dispatcher = dispatcher.clone();
        inner.subscribe(SessionEventSink::new(move |event| {
            let mut buffer = sink_intake.lock().unwrap();
            buffer.events.push_back(event);
            schedule_flush(&mut buffer, &sink_intake, &sink_dispatcher);
        }));
        Self {
            inner,
            intake,
            dispatcher,
        }
    }

    /// Register the consumer of deferred events
    pub fn subscribe(&mut self, sink: SessionEventSink) {
        self.intake.lock().unwrap().downstream = Some(sink);
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn connect(&mut self) -> Result<(), ClientError> {
        self.inner.connect()
    }

    pub fn disconnect(&mut self, err: Option<ClientError>) -> Result<(), ClientError> {
        self.inner.disconnect(err)
    }

    /// Forward an action request, deferring its reply
    pub fn action(&mut self, name: &str, args: &Map<String, Value>, reply: ActionReply) {
        let wrapped = self.wrap(DeliveryClass::Action, reply);
        self.inner.action(name, args, wrapped);
    }

    /// Forward a feed-open request, deferring its reply
    pub fn feed_open(&mut self, feed: &FeedNameArgs, reply: FeedReply) {
        let wrapped = self.wrap(DeliveryClass::Feed, reply);
        self.inner.feed_open(feed, wrapped);
    }

    /// Forward a feed-close request, deferring its reply
    pub fn feed_close(&mut self, feed: &FeedNameArgs, reply: FeedReply) {
        let wrapped = self.wrap(DeliveryClass::Feed, reply);
        self.inner.feed_close(feed, wrapped);
    }

    pub fn feed_state(&self, feed: &FeedNameArgs) -> FeedState {
        self.inner.feed_state(feed)
    }

    pub fn feed_data(&self, feed: &FeedNameArgs) -> Option<Value> {
        self.inner.feed_data(feed)
    }

    pub fn destroy(&mut self) {
        self.inner.destroy()
    }

    pub fn destroyed(&self) -> bool {
        self.inner.destroyed()
    }

    /// Wrap a one-shot reply so its invocation is buffered and flushed in
    /// class order
    fn wrap<V: Send + 'static>(
        &self,
        class: DeliveryClass,
        reply: Box<dyn FnOnce(V) + Send + 'static>,
    ) -> Box<dyn FnOnce(V) + Send + 'static> {
        let intake = Arc::clone(&self.intake);
        let dispatcher = self.dispatcher.clone();
        Box::new(move |value: V| {
            let delivery: Delivery = Box::new(move || reply(value));
            let mut buffer = intake.lock().unwrap();
            match class {
                DeliveryClass::Action => buffer.actions.push_back(delivery),
                DeliveryClass::Feed => buffer.feeds.push_back(delivery),
            }
            schedule_flush(&mut buffer, &intake, &dispatcher);
        })
    }
}

fn schedule_flush(
    buffer: &mut Intake,
    intake: &Arc<Mutex<Intake>>,
    dispatcher: &Dispatcher,
) {
    if buffer.flush_scheduled {
        return;
    }
    buffer.flush_scheduled = true;
    let intake = Arc::clone(intake);
    dispatcher.defer(move || flush(&intake));
}

/// Deliver one buffered burst: action replies, feed replies, then events
fn flush(intake: &Arc<Mutex<Intake>>) {
    let (actions, feeds, events, downstream) = {
        let mut buffer = intake.lock().unwrap();
        buffer.flush_scheduled = false;
        (
            std::mem::take(&mut buffer.actions),
            std::mem::take(&mut buffer.feeds),
            std::mem::take(&mut buffer.events),
            buffer.downstream.clone(),
        )
    };
    for delivery in actions {
        delivery();
    }
    for delivery in feeds {
        delivery();
    }
    for event in events {
        match &downstream {
            Some(sink) => sink.emit(event),
            None => tracing::debug!("no session subscriber, dropping {}", event.label()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Session stub that replies and emits synchronously inside the
    /// requesting call, in whatever order the test scripts.
    struct ReentrantSession {
        sink: Option<SessionEventSink>,
        pending_feed: Option<FeedReply>,
    }

    impl ReentrantSession {
        fn new() -> Self {
            Self {
                sink: None,
                pending_feed: None,
            }
        }
    }

    impl Session for ReentrantSession {
        fn state(&self) -> SessionState {
            SessionState::Connected
        }

        fn connect(&mut self) -> Result<(), ClientError> {
            Ok(())
        }

        fn disconnect(&mut self, err: Option<ClientError>) -> Result<(), ClientError> {
            self.sink.as_ref().unwrap().emit(SessionEvent::Disconnect(err));
            Ok(())
        }

        fn action(&mut self, _name: &str, _args: &Map<String, Value>, reply: ActionReply) {
            // Scrambled burst: feed reply, then the disconnect event, then
            // the action reply, all inside this call.
            if let Some(feed_reply) = self.pending_feed.take() {
                feed_reply(Err(ClientError::NotConnected));
            }
            self.sink.as_ref().unwrap().emit(SessionEvent::Disconnect(Some(
                ClientError::TransportFailure("link dropped".into()),
            )));
            reply(Ok(Value::Null));
        }

        fn feed_open(&mut self, _feed: &FeedNameArgs, reply: FeedReply) {
            self.pending_feed = Some(reply);
        }

        fn feed_close(&mut self, _feed: &FeedNameArgs, reply: FeedReply) {
            reply(Ok(()));
        }

        fn feed_state(&self, _feed: &FeedNameArgs) -> FeedState {
            FeedState::Closed
        }

        fn feed_data(&self, _feed: &FeedNameArgs) -> Option<Value> {
            None
        }

        fn destroy(&mut self) {}

        fn destroyed(&self) -> bool {
            false
        }

        fn subscribe(&mut self, sink: SessionEventSink) {
            self.sink = Some(sink);
        }
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn feed(name: &str) -> FeedNameArgs {
        FeedNameArgs::new(name, std::iter::empty()).unwrap()
    }

    #[tokio::test]
    async fn replies_never_run_synchronously() {
        let mut guard = SessionGuard::new(Box::new(ReentrantSession::new()), Dispatcher::new());
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        guard.feed_close(
            &feed("prices"),
            Box::new(move |_| log.lock().unwrap().push("feed_close")),
        );
        assert!(seen.lock().unwrap().is_empty());
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec!["feed_close"]);
    }

    #[tokio::test]
    async fn burst_is_delivered_in_class_order() {
        let mut guard = SessionGuard::new(Box::new(ReentrantSession::new()), Dispatcher::new());
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let events = Arc::clone(&seen);
        guard.subscribe(SessionEventSink::new(move |ev| {
            if matches!(ev, SessionEvent::Disconnect(_)) {
                events.lock().unwrap().push("disconnect");
            }
        }));

        let log = Arc::clone(&seen);
        guard.feed_open(
            &feed("prices"),
            Box::new(move |_| log.lock().unwrap().push("feed_reply")),
        );
        let log = Arc::clone(&seen);
        guard.action(
            "ping",
            &Map::new(),
            Box::new(move |_| log.lock().unwrap().push("action_reply")),
        );
        settle().await;

        // The session delivered feed reply, disconnect, action reply in that
        // raw order; the guard reorders the burst by class.
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["action_reply", "feed_reply", "disconnect"]
        );
    }

    #[tokio::test]
    async fn separate_bursts_preserve_arrival_order() {
        let mut guard = SessionGuard::new(Box::new(ReentrantSession::new()), Dispatcher::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = Arc::clone(&seen);
            guard.feed_close(
                &feed("prices"),
                Box::new(move |_| log.lock().unwrap().push(format!("close{i}"))),
            );
            settle().await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["close0", "close1", "close2"]);
    }
}
