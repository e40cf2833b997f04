// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Received Messages
//!
//! This module provides the immutable view over a single delivery handed to
//! middleware and handlers. A [`Message`] carries the delivery envelope, the
//! decoded payload and a handled-state machine: the first of ack, nack or
//! reply wins, and every later terminal call is a recorded no-op.

use crate::errors::AmqpError;
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions},
    types::ShortString,
    BasicProperties, Channel,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Content type set on UTF-8 JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content encoding set on UTF-8 JSON payloads
pub const UTF8_CONTENT_ENCODING: &str = "utf8";

/// A message body, either raw bytes or a decoded JSON document.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    /// Encodes the payload to wire bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AmqpError> {
        match self {
            Payload::Bytes(data) => Ok(data.clone()),
            Payload::Json(value) => serde_json::to_vec(value)
                .map_err(|err| AmqpError::Config(format!("unencodable payload: {err}"))),
        }
    }

    /// The decoded JSON document, when this payload is JSON.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Bytes(_) => None,
        }
    }

    /// True when the payload should be published as JSON.
    pub fn is_json(&self) -> bool {
        matches!(self, Payload::Json(_))
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Payload {
        Payload::Bytes(data)
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Payload {
        Payload::Bytes(data.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Payload {
        Payload::Json(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Payload {
        Payload::Json(serde_json::Value::String(value.to_owned()))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Payload {
        Payload::Json(serde_json::Value::String(value))
    }
}

/// Terminal disposition of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandledState {
    #[default]
    New,
    Acked,
    Nacked {
        requeue: bool,
    },
    Replied,
}

/// Broker-side effects of a delivery: acknowledge, reject or answer.
///
/// Production messages carry a channel-backed implementation; tests swap in
/// a recording stub so pipeline semantics can be verified without a broker.
#[async_trait]
pub(crate) trait Responder: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
    async fn reply(
        &self,
        reply_to: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError>;
}

/// Responder backed by the consumer's channel.
pub(crate) struct ChannelResponder {
    acker: Acker,
    channel: Arc<Channel>,
}

impl ChannelResponder {
    pub(crate) fn new(acker: Acker, channel: Arc<Channel>) -> ChannelResponder {
        ChannelResponder { acker, channel }
    }
}

#[async_trait]
impl Responder for ChannelResponder {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::transient(&err))
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| AmqpError::transient(&err))
    }

    async fn reply(
        &self,
        reply_to: &str,
        properties: BasicProperties,
        body: Vec<u8>,
    ) -> Result<(), AmqpError> {
        // Replies go through the default exchange, routed by the reply queue name.
        self.channel
            .basic_publish(
                "",
                reply_to,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|err| AmqpError::transient(&err))?
            .await
            .map_err(|err| AmqpError::transient(&err))?;
        Ok(())
    }
}

/// Immutable view over one received delivery.
///
/// Shared by reference through the middleware chain and the user handler.
/// The handled state is interior: ack, nack and reply race safely, the
/// first terminal transition wins.
pub struct Message {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    delivery_tag: u64,
    consumer_tag: String,
    queue: String,
    properties: BasicProperties,
    data: Vec<u8>,
    payload: Payload,
    no_ack: bool,
    state: Mutex<HandledState>,
    responder: Arc<dyn Responder>,
}

impl Message {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        exchange: String,
        routing_key: String,
        redelivered: bool,
        delivery_tag: u64,
        consumer_tag: String,
        queue: String,
        properties: BasicProperties,
        data: Vec<u8>,
        json: bool,
        no_ack: bool,
        responder: Arc<dyn Responder>,
    ) -> Result<Message, AmqpError> {
        let payload = decode_payload(&properties, &data, json)?;

        Ok(Message {
            exchange,
            routing_key,
            redelivered,
            delivery_tag,
            consumer_tag,
            queue,
            properties,
            data,
            payload,
            no_ack,
            state: Mutex::new(HandledState::New),
            responder,
        })
    }

    /// Exchange the message was published to.
    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Routing key the message was published with.
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// True when the broker redelivered this message.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Broker-assigned delivery tag, unique per channel.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Tag of the consumer the delivery arrived on.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    /// Name of the queue the delivery was consumed from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Raw delivery bytes, before JSON decoding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Decoded payload per the chain's JSON policy.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Full AMQP properties of the delivery.
    pub fn properties(&self) -> &BasicProperties {
        &self.properties
    }

    /// Correlation id property, when present.
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id().as_ref().map(ShortString::as_str)
    }

    /// Reply-to property, when present.
    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to().as_ref().map(ShortString::as_str)
    }

    /// Current terminal disposition.
    pub fn state(&self) -> HandledState {
        *self.state.lock()
    }

    /// True once any of ack, nack or reply has been applied.
    pub fn is_handled(&self) -> bool {
        self.state() != HandledState::New
    }

    /// Acknowledges the delivery.
    ///
    /// Returns `Ok(true)` when this call performed the transition and
    /// `Ok(false)` when the message was already handled.
    pub async fn ack(&self) -> Result<bool, AmqpError> {
        if !self.begin_transition(HandledState::Acked) {
            return Ok(false);
        }
        if !self.no_ack {
            self.responder.ack().await?;
        }
        Ok(true)
    }

    /// Rejects the delivery, optionally requeueing it.
    ///
    /// Returns `Ok(true)` when this call performed the transition and
    /// `Ok(false)` when the message was already handled.
    pub async fn nack(&self, requeue: bool) -> Result<bool, AmqpError> {
        if !self.begin_transition(HandledState::Nacked { requeue }) {
            return Ok(false);
        }
        if !self.no_ack {
            self.responder.nack(requeue).await?;
        }
        Ok(true)
    }

    /// Replies to the delivery through its reply-to queue.
    ///
    /// Requires the delivery to carry both `reply_to` and `correlation_id`.
    /// Replying settles the delivery: the broker-level acknowledge is sent
    /// once the reply has been published.
    pub async fn reply(&self, payload: Payload) -> Result<bool, AmqpError> {
        let reply_to = self
            .reply_to()
            .ok_or_else(|| AmqpError::Config("reply without reply_to".to_owned()))?
            .to_owned();
        let correlation_id = self
            .correlation_id()
            .ok_or_else(|| AmqpError::Config("reply without correlation_id".to_owned()))?
            .to_owned();

        if !self.begin_transition(HandledState::Replied) {
            return Ok(false);
        }

        let body = payload.to_bytes()?;
        let mut properties =
            BasicProperties::default().with_correlation_id(ShortString::from(correlation_id));
        if payload.is_json() {
            properties = properties
                .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
                .with_content_encoding(ShortString::from(UTF8_CONTENT_ENCODING));
        }

        self.responder.reply(&reply_to, properties, body).await?;
        if !self.no_ack {
            self.responder.ack().await?;
        }
        Ok(true)
    }

    /// Claims the terminal transition, recording duplicate attempts.
    fn begin_transition(&self, target: HandledState) -> bool {
        let mut state = self.state.lock();
        if *state != HandledState::New {
            debug!(
                delivery_tag = self.delivery_tag,
                current = ?*state,
                attempted = ?target,
                "message already handled, ignoring"
            );
            return false;
        }
        *state = target;
        true
    }

}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("state", &self.state())
            .finish()
    }
}

fn decode_payload(
    properties: &BasicProperties,
    data: &[u8],
    json: bool,
) -> Result<Payload, AmqpError> {
    let is_json = properties
        .content_type()
        .as_ref()
        .map(|ct| ct.as_str() == JSON_CONTENT_TYPE)
        .unwrap_or(false);

    if json && is_json {
        let value = serde_json::from_slice(data)
            .map_err(|err| AmqpError::Handler(format!("undecodable json payload: {err}")))?;
        return Ok(Payload::Json(value));
    }
    Ok(Payload::Bytes(data.to_vec()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every broker effect instead of talking to a channel.
    #[derive(Default)]
    pub(crate) struct RecordingResponder {
        pub(crate) acks: AtomicUsize,
        pub(crate) nacks: Mutex<Vec<bool>>,
        pub(crate) replies: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingResponder {
        pub(crate) fn ack_count(&self) -> usize {
            self.acks.load(Ordering::SeqCst)
        }

        pub(crate) fn nack_requeues(&self) -> Vec<bool> {
            self.nacks.lock().clone()
        }
    }

    #[async_trait]
    impl Responder for RecordingResponder {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
            self.nacks.lock().push(requeue);
            Ok(())
        }

        async fn reply(
            &self,
            reply_to: &str,
            _properties: BasicProperties,
            body: Vec<u8>,
        ) -> Result<(), AmqpError> {
            self.replies.lock().push((reply_to.to_owned(), body));
            Ok(())
        }
    }

    pub(crate) fn message_with(
        properties: BasicProperties,
        data: &[u8],
        json: bool,
        responder: Arc<RecordingResponder>,
    ) -> Message {
        Message::new(
            "".to_owned(),
            "test".to_owned(),
            false,
            1,
            "ctag-test".to_owned(),
            "test".to_owned(),
            properties,
            data.to_vec(),
            json,
            false,
            responder,
        )
        .unwrap()
    }

    pub(crate) fn json_message(
        data: &[u8],
        responder: Arc<RecordingResponder>,
    ) -> Message {
        message_with(
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
            data,
            true,
            responder,
        )
    }
}
