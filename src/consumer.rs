// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumer
//!
//! This module provides the consuming side of a chain: it asserts topology,
//! pins the queue name, applies prefetch and runs the delivery loop.
//! Deliveries are processed concurrently up to the prefetch window, each one
//! through the backoff gate, the middleware chain and the user handler,
//! with auto-ack and auto-nack policies applied afterwards. Closing drains
//! in-flight deliveries; a transport loss parks the consumer until the
//! connection manager restores it on its pinned queue.

use crate::backoff::Backoff;
use crate::connection::ConnectionManager;
use crate::errors::AmqpError;
use crate::message::{ChannelResponder, HandledState, Message, Payload, Responder};
use crate::middleware::{self, Layers, Terminal};
use crate::setup;
use crate::state::ChainState;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::{AMQPValue, FieldTable, LongInt, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::{
    global::{self, BoxedSpan},
    trace::{Span, SpanKind, Status, Tracer},
};
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, warn};

/// Consumer argument carrying the consume priority
const CONSUMER_PRIORITY_ARG: &str = "x-priority";
/// Reply code sent on orderly channel close
const CLOSE_REPLY_SUCCESS: u16 = 200;

/// Processes one decoded delivery.
///
/// The returned payload is sent back as the RPC reply when the chain has
/// `auto_reply` enabled and the delivery carries a reply route.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        payload: Payload,
        message: Arc<Message>,
    ) -> Result<Option<Payload>, AmqpError>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Payload, Arc<Message>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<Payload>, AmqpError>> + Send,
{
    async fn handle(
        &self,
        payload: Payload,
        message: Arc<Message>,
    ) -> Result<Option<Payload>, AmqpError> {
        self(payload, message).await
    }
}

/// Lifecycle of one consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConsumerState {
    #[default]
    Created,
    Running,
    Paused,
    Draining,
    Closed,
}

#[derive(Clone, Default)]
struct ConsumerStatus(Arc<RwLock<ConsumerState>>);

impl ConsumerStatus {
    fn state(&self) -> ConsumerState {
        *self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set(&self, state: ConsumerState) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn is_closed(&self) -> bool {
        self.state() == ConsumerState::Closed
    }

    fn is_closing(&self) -> bool {
        matches!(self.state(), ConsumerState::Draining | ConsumerState::Closed)
    }
}

/// Handle over a running subscription.
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    /// Stops new deliveries, waits for every in-flight delivery to settle,
    /// then closes the channel.
    pub async fn close(&self) {
        self.inner.shutdown(false).await;
    }

    /// Closes without draining; unsettled deliveries return to the queue.
    pub async fn force_close(&self) {
        self.inner.shutdown(true).await;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.status.is_closed()
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.status.state()
    }

    /// The queue this consumer is pinned to, server-assigned for anonymous
    /// queues.
    pub fn queue(&self) -> Option<String> {
        self.inner.pinned_queue.lock().clone()
    }
}

pub(crate) struct ConsumerInner {
    manager: ConnectionManager,
    state: ChainState,
    handler: Arc<dyn Handler>,
    layers: Layers,
    backoff: Arc<dyn Backoff>,
    status: ConsumerStatus,
    pinned_queue: parking_lot::Mutex<Option<String>>,
    consumer_tag: parking_lot::Mutex<Option<String>>,
    channel: parking_lot::Mutex<Option<Arc<Channel>>>,
    in_flight: AtomicUsize,
    drained: Notify,
    close_tx: watch::Sender<bool>,
    streams_tx: mpsc::Sender<lapin::Consumer>,
}

/// Runs setup, applies prefetch and starts the delivery loop.
pub(crate) async fn subscribe(
    manager: ConnectionManager,
    state: ChainState,
    handler: Arc<dyn Handler>,
) -> Result<Consumer, AmqpError> {
    if state.queue.is_none() {
        return Err(AmqpError::Config("subscribe without a queue".to_owned()));
    }

    let channel = manager.consumer_channel().await?;
    let resolved = setup::assert_topology(&channel, &state).await?;
    let queue = match resolved.queue {
        Some(queue) if !queue.is_empty() => queue,
        _ => {
            return Err(AmqpError::Config(
                "anonymous queues cannot be consumed with setup skipped".to_owned(),
            ))
        }
    };

    let stream = start_consume(&channel, &state, &queue).await?;
    let tag = stream.tag().to_string();
    debug!(
        queue = queue.as_str(),
        consumer_tag = tag.as_str(),
        prefetch = state.prefetch,
        "consumer subscribed"
    );

    let (close_tx, _) = watch::channel(false);
    let (streams_tx, streams_rx) = mpsc::channel(4);
    let backoff = state.consumer_backoff();
    let layers: Layers = Arc::new(state.middleware.clone());

    let inner = Arc::new(ConsumerInner {
        manager: manager.clone(),
        state,
        handler,
        layers,
        backoff,
        status: ConsumerStatus::default(),
        pinned_queue: parking_lot::Mutex::new(Some(queue)),
        consumer_tag: parking_lot::Mutex::new(Some(tag)),
        channel: parking_lot::Mutex::new(Some(channel)),
        in_flight: AtomicUsize::new(0),
        drained: Notify::new(),
        close_tx,
        streams_tx,
    });

    manager.register_consumer(Arc::downgrade(&inner));
    inner.status.set(ConsumerState::Running);
    tokio::spawn(run_loop(inner.clone(), stream, streams_rx));

    Ok(Consumer { inner })
}

/// Applies prefetch and issues basic.consume with the state's options.
async fn start_consume(
    channel: &Channel,
    state: &ChainState,
    queue: &str,
) -> Result<lapin::Consumer, AmqpError> {
    channel
        .basic_qos(state.prefetch, BasicQosOptions::default())
        .await
        .map_err(|err| AmqpError::transient(&err))?;

    let mut args = FieldTable::default();
    if let Some(priority) = state.priority {
        args.insert(
            ShortString::from(CONSUMER_PRIORITY_ARG),
            AMQPValue::LongInt(LongInt::from(priority as i32)),
        );
    }

    channel
        .basic_consume(
            queue,
            "",
            BasicConsumeOptions {
                no_local: false,
                no_ack: state.no_ack,
                exclusive: state.exclusive,
                nowait: false,
            },
            args,
        )
        .await
        .map_err(|err| AmqpError::transient(&err))
}

async fn run_loop(
    inner: Arc<ConsumerInner>,
    mut stream: lapin::Consumer,
    mut streams_rx: mpsc::Receiver<lapin::Consumer>,
) {
    let mut close_rx = inner.close_tx.subscribe();
    'outer: loop {
        loop {
            let delivery = tokio::select! {
                maybe = stream.next() => maybe,
                _ = close_rx.wait_for(|closed| *closed) => break 'outer,
            };
            match delivery {
                Some(Ok(delivery)) => inner.dispatch(delivery),
                Some(Err(err)) => {
                    warn!(error = err.to_string(), "consumer stream failed");
                    break;
                }
                None => break,
            }
        }

        if inner.status.is_closing() {
            break;
        }
        if !inner.state.reestablish || inner.manager.is_closed() {
            debug!("consumer stream ended without reestablish");
            break;
        }

        // Park until the connection manager restores the subscription.
        inner.status.set(ConsumerState::Paused);
        debug!("consumer paused awaiting reconnect");
        let next = tokio::select! {
            maybe = streams_rx.recv() => maybe,
            _ = close_rx.wait_for(|closed| *closed) => None,
        };
        match next {
            Some(next) => {
                stream = next;
                inner.status.set(ConsumerState::Running);
                debug!("consumer resumed");
            }
            None => break,
        }
    }

    if !inner.status.is_closed() && !inner.status.is_closing() {
        inner.status.set(ConsumerState::Closed);
    }
}

impl ConsumerInner {
    fn dispatch(self: &Arc<Self>, delivery: Delivery) {
        let inner = self.clone();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            inner.process(delivery).await;
            if inner.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.drained.notify_waiters();
            }
        });
    }

    async fn process(&self, delivery: Delivery) {
        let mut close_rx = self.close_tx.subscribe();
        let admitted = tokio::select! {
            _ = self.backoff.take() => true,
            _ = close_rx.wait_for(|closed| *closed) => false,
        };
        if !admitted {
            // Cancelled while gated: hand the delivery back.
            if !self.state.no_ack {
                let _ = delivery
                    .nack(BasicNackOptions {
                        multiple: false,
                        requeue: true,
                    })
                    .await;
            }
            return;
        }

        let channel = match self.channel.lock().clone() {
            Some(channel) => channel,
            None => return,
        };
        let queue = self.pinned_queue.lock().clone().unwrap_or_default();
        let responder: Arc<ChannelResponder> =
            Arc::new(ChannelResponder::new(delivery.acker.clone(), channel));

        let consumer_tag = self.consumer_tag.lock().clone().unwrap_or_default();
        let message = match Message::new(
            delivery.exchange.as_str().to_owned(),
            delivery.routing_key.as_str().to_owned(),
            delivery.redelivered,
            delivery.delivery_tag,
            consumer_tag,
            queue.clone(),
            delivery.properties,
            delivery.data,
            self.state.json,
            self.state.no_ack,
            responder.clone(),
        ) {
            Ok(message) => Arc::new(message),
            Err(err) => {
                // Undecodable payloads are fatal for this delivery.
                error!(error = err.to_string(), "dropping undecodable delivery");
                if !self.state.no_ack {
                    let _ = responder.nack(false).await;
                }
                self.backoff.fail();
                return;
            }
        };

        let mut span = delivery_span(message.properties(), &queue);

        let terminal: Arc<dyn Terminal> = Arc::new(HandlerTerminal {
            handler: self.handler.clone(),
            auto_reply: self.state.auto_reply,
        });
        let result =
            middleware::run_from(self.layers.clone(), terminal, message.clone(), 0).await;

        match settle(&message, result, self.state.auto_ack, self.backoff.as_ref()).await {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
    }

    pub(crate) fn wants_restore(&self) -> bool {
        self.state.reestablish
            && matches!(
                self.status.state(),
                ConsumerState::Running | ConsumerState::Paused
            )
    }

    /// Re-asserts topology under the pinned queue name and resumes the
    /// delivery loop on a fresh channel.
    pub(crate) async fn restore(&self, channel: Arc<Channel>) -> Result<(), AmqpError> {
        let pinned = self.pinned_queue.lock().clone();
        let resolved =
            setup::assert_topology_pinned(&channel, &self.state, pinned.as_deref()).await?;
        let queue = resolved
            .queue
            .ok_or_else(|| AmqpError::Config("restore without a queue".to_owned()))?;

        let stream = start_consume(&channel, &self.state, &queue).await?;
        *self.pinned_queue.lock() = Some(queue.clone());
        *self.consumer_tag.lock() = Some(stream.tag().to_string());
        *self.channel.lock() = Some(channel);

        if self.streams_tx.send(stream).await.is_err() {
            return Err(AmqpError::Closed);
        }
        debug!(queue = queue.as_str(), "consumer restored");
        Ok(())
    }

    pub(crate) async fn shutdown(&self, force: bool) {
        if self.status.is_closing() {
            return;
        }
        self.status.set(ConsumerState::Draining);
        let _ = self.close_tx.send(true);

        // Stop new deliveries before draining.
        let channel = self.channel.lock().clone();
        let tag = self.consumer_tag.lock().clone();
        if let (Some(channel), Some(tag)) = (channel.as_ref(), tag) {
            if channel.status().connected() {
                if let Err(err) = channel
                    .basic_cancel(&tag, BasicCancelOptions::default())
                    .await
                {
                    debug!(error = err.to_string(), "basic.cancel on close failed");
                }
            }
        }

        if !force {
            self.wait_drained().await;
        }

        // Closing the channel returns whatever is still unacked to the
        // queue, which is the force-close contract.
        if let Some(channel) = self.channel.lock().take() {
            if channel.status().connected() {
                if let Err(err) = channel.close(CLOSE_REPLY_SUCCESS, "consumer closed").await {
                    debug!(error = err.to_string(), "channel close reported an error");
                }
            }
        }

        self.status.set(ConsumerState::Closed);
        debug!("consumer closed");
    }

    async fn wait_drained(&self) {
        loop {
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.drained.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Opens a consumer span for one delivery, parented on whatever trace
/// context the publisher put in the message headers.
///
/// Only string headers can carry propagation fields; anything else in the
/// header table is skipped.
fn delivery_span(properties: &BasicProperties, queue: &str) -> BoxedSpan {
    let mut carrier: HashMap<String, String> = HashMap::new();
    if let Some(headers) = properties.headers() {
        for (key, value) in headers.inner() {
            if let AMQPValue::LongString(text) = value {
                if let Ok(text) = std::str::from_utf8(text.as_bytes()) {
                    carrier.insert(key.as_str().to_owned(), text.to_owned());
                }
            }
        }
    }

    let parent = global::get_text_map_propagator(|propagator| propagator.extract(&carrier));
    let tracer = global::tracer("amqp-chain");
    tracer
        .span_builder(format!("consume {queue}"))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &parent)
}

/// Innermost pipeline stage: the user handler plus the auto-reply policy.
struct HandlerTerminal {
    handler: Arc<dyn Handler>,
    auto_reply: bool,
}

#[async_trait]
impl Terminal for HandlerTerminal {
    async fn call(&self, message: Arc<Message>) -> Result<(), AmqpError> {
        let reply = self
            .handler
            .handle(message.payload().clone(), message.clone())
            .await?;

        if self.auto_reply && !message.is_handled() {
            if let Some(payload) = reply {
                if message.reply_to().is_some() && message.correlation_id().is_some() {
                    message.reply(payload).await?;
                }
            }
        }
        Ok(())
    }
}

/// Applies the post-pipeline policy and reports the outcome to the backoff.
async fn settle(
    message: &Message,
    result: Result<(), AmqpError>,
    auto_ack: bool,
    backoff: &dyn Backoff,
) -> Result<(), AmqpError> {
    match result {
        Ok(()) => {
            let explicitly_acked = message.state() == HandledState::Acked;
            if !message.is_handled() && auto_ack {
                if let Err(err) = message.ack().await {
                    warn!(error = err.to_string(), "auto-ack failed");
                    backoff.fail();
                    return Err(err);
                }
            }
            backoff.pass();
            if explicitly_acked {
                backoff.ack();
            }
            Ok(())
        }
        Err(err) => {
            warn!(error = err.to_string(), "delivery processing failed");
            if !message.is_handled() {
                if let Err(nack_err) = message.nack(false).await {
                    warn!(error = nack_err.to_string(), "auto-nack failed");
                    backoff.fail();
                    return Err(nack_err);
                }
            }
            backoff.nack();
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::testing::{json_message, message_with, RecordingResponder};
    use crate::middleware::Next;
    use parking_lot::Mutex;

    /// Records the order of backoff calls.
    #[derive(Default)]
    struct StubBackoff {
        calls: Mutex<Vec<&'static str>>,
    }

    impl StubBackoff {
        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Backoff for StubBackoff {
        async fn take(&self) {
            self.calls.lock().push("take");
        }

        fn pass(&self) {
            self.calls.lock().push("pass");
        }

        fn nack(&self) {
            self.calls.lock().push("nack");
        }

        fn ack(&self) {
            self.calls.lock().push("ack");
        }

        fn fail(&self) {
            self.calls.lock().push("fail");
        }
    }

    fn ok_handler() -> Arc<dyn Handler> {
        Arc::new(|_payload: Payload, _message: Arc<Message>| async move {
            Ok::<Option<Payload>, AmqpError>(None)
        })
    }

    fn failing_handler(reason: &'static str) -> Arc<dyn Handler> {
        Arc::new(move |_payload: Payload, _message: Arc<Message>| async move {
            Err::<Option<Payload>, AmqpError>(AmqpError::Handler(reason.to_owned()))
        })
    }

    async fn run_delivery(
        message: &Arc<Message>,
        layers: Layers,
        handler: Arc<dyn Handler>,
        auto_reply: bool,
        auto_ack: bool,
        backoff: &StubBackoff,
    ) -> Result<(), AmqpError> {
        backoff.take().await;
        let terminal: Arc<dyn Terminal> = Arc::new(HandlerTerminal { handler, auto_reply });
        let result = middleware::run_from(layers, terminal, message.clone(), 0).await;
        settle(message, result, auto_ack, backoff).await
    }

    #[tokio::test]
    async fn auto_ack_applies_exactly_once() {
        let responder = Arc::new(RecordingResponder::default());
        let message = Arc::new(json_message(b"\"test\"", responder.clone()));
        let backoff = StubBackoff::default();

        run_delivery(
            &message,
            Arc::new(vec![]),
            ok_handler(),
            false,
            true,
            &backoff,
        )
        .await
        .unwrap();

        assert_eq!(responder.ack_count(), 1);
        assert_eq!(message.state(), HandledState::Acked);
        assert_eq!(backoff.calls(), vec!["take", "pass"]);
    }

    #[tokio::test]
    async fn handler_failure_nacks_without_requeue() {
        let responder = Arc::new(RecordingResponder::default());
        let message = Arc::new(json_message(b"\"test\"", responder.clone()));
        let backoff = StubBackoff::default();

        let result = run_delivery(
            &message,
            Arc::new(vec![]),
            failing_handler("whoopsiedaisy"),
            false,
            true,
            &backoff,
        )
        .await;

        assert!(matches!(result, Err(AmqpError::Handler(_))));
        assert_eq!(responder.ack_count(), 0);
        assert_eq!(responder.nack_requeues(), vec![false]);
        assert_eq!(message.state(), HandledState::Nacked { requeue: false });
    }

    #[tokio::test]
    async fn succeed_then_fail_produces_the_documented_backoff_sequence() {
        let backoff = StubBackoff::default();
        let responder = Arc::new(RecordingResponder::default());

        let first = Arc::new(json_message(b"\"test\"", responder.clone()));
        run_delivery(
            &first,
            Arc::new(vec![]),
            ok_handler(),
            false,
            true,
            &backoff,
        )
        .await
        .unwrap();

        let second = Arc::new(json_message(b"\"test\"", responder.clone()));
        let _ = run_delivery(
            &second,
            Arc::new(vec![]),
            failing_handler("whoopsiedaisy"),
            false,
            true,
            &backoff,
        )
        .await;

        assert_eq!(backoff.calls(), vec!["take", "pass", "take", "nack"]);
    }

    #[tokio::test]
    async fn explicit_ack_is_reported_to_the_backoff() {
        let responder = Arc::new(RecordingResponder::default());
        let message = Arc::new(json_message(b"\"test\"", responder.clone()));
        let backoff = StubBackoff::default();

        let acking: Arc<dyn Handler> =
            Arc::new(|_payload: Payload, message: Arc<Message>| async move {
                message.ack().await?;
                Ok::<Option<Payload>, AmqpError>(None)
            });

        run_delivery(&message, Arc::new(vec![]), acking, false, true, &backoff)
            .await
            .unwrap();

        assert_eq!(responder.ack_count(), 1);
        assert_eq!(backoff.calls(), vec!["take", "pass", "ack"]);
    }

    #[tokio::test]
    async fn middleware_handling_skips_the_user_handler() {
        let responder = Arc::new(RecordingResponder::default());
        let message = Arc::new(json_message(b"\"test\"", responder.clone()));
        let backoff = StubBackoff::default();

        let layers: Layers = Arc::new(vec![Arc::new(
            |message: Arc<Message>, next: Next| async move {
                message.ack().await?;
                next.run().await
            },
        )
            as Arc<dyn crate::middleware::Middleware>]);

        let untouchable: Arc<dyn Handler> =
            Arc::new(|_payload: Payload, _message: Arc<Message>| async move {
                panic!("handler must not run for a handled message");
            });

        run_delivery(&message, layers, untouchable, false, true, &backoff)
            .await
            .unwrap();

        // Exactly one ack: the middleware's, no auto-ack on top.
        assert_eq!(responder.ack_count(), 1);
        assert_eq!(backoff.calls(), vec!["take", "pass", "ack"]);
    }

    #[tokio::test]
    async fn auto_reply_sends_the_handler_return_value() {
        let responder = Arc::new(RecordingResponder::default());
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(crate::message::JSON_CONTENT_TYPE))
            .with_reply_to(ShortString::from("amq.gen-reply"))
            .with_correlation_id(ShortString::from("corr-sum"));
        let message = Arc::new(message_with(properties, b"[0,1,2]", true, responder.clone()));
        let backoff = StubBackoff::default();

        let summing: Arc<dyn Handler> =
            Arc::new(|payload: Payload, _message: Arc<Message>| async move {
                let sum: i64 = payload
                    .as_json()
                    .and_then(|v| v.as_array().cloned())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .sum();
                Ok::<Option<Payload>, AmqpError>(Some(Payload::from(serde_json::json!(sum))))
            });

        run_delivery(&message, Arc::new(vec![]), summing, true, true, &backoff)
            .await
            .unwrap();

        let replies = responder.replies.lock().clone();
        assert_eq!(replies, vec![("amq.gen-reply".to_owned(), b"3".to_vec())]);
        assert_eq!(message.state(), HandledState::Replied);
        // The reply settles the delivery, no auto-ack on top of it.
        assert_eq!(responder.ack_count(), 1);
    }

    #[tokio::test]
    async fn no_auto_ack_leaves_the_message_unhandled() {
        let responder = Arc::new(RecordingResponder::default());
        let message = Arc::new(json_message(b"\"test\"", responder.clone()));
        let backoff = StubBackoff::default();

        run_delivery(
            &message,
            Arc::new(vec![]),
            ok_handler(),
            false,
            false,
            &backoff,
        )
        .await
        .unwrap();

        assert!(!message.is_handled());
        assert_eq!(responder.ack_count(), 0);
        assert_eq!(backoff.calls(), vec!["take", "pass"]);
    }
}
