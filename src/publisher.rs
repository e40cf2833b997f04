// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module publishes messages built from a chain state. In confirm mode
//! the publish resolves only once the broker takes responsibility for the
//! message; a broker nack or a transport loss surfaces as an error, and
//! confirm-mode publishes cut off by a reconnect are retried up to the
//! manager's cap. The module also hosts the request/reply entry point,
//! correlating replies through the manager's reply link.

use crate::connection::ConnectionManager;
use crate::errors::AmqpError;
use crate::message::{Message, Payload, JSON_CONTENT_TYPE, UTF8_CONTENT_ENCODING};
use crate::rpc::NullResponder;
use crate::state::ChainState;
use lapin::{
    options::BasicPublishOptions,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::global;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Delivery mode marking a message persistent
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Per-publish options: AMQP properties, user headers and deadlines.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub(crate) headers: BTreeMap<ShortString, AMQPValue>,
    pub(crate) content_type: Option<String>,
    pub(crate) content_encoding: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) reply_to: Option<String>,
    pub(crate) message_id: Option<String>,
    pub(crate) timestamp: Option<u64>,
    pub(crate) app_id: Option<String>,
    pub(crate) kind: Option<String>,
    pub(crate) priority: Option<u8>,
    pub(crate) expiration: Option<String>,
    pub(crate) persistent: bool,
    pub(crate) timeout: Option<Duration>,
}

impl PublishOptions {
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Adds a user header.
    pub fn header(mut self, key: &str, value: AMQPValue) -> Self {
        self.headers.insert(ShortString::from(key), value);
        self
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn content_encoding(mut self, content_encoding: &str) -> Self {
        self.content_encoding = Some(content_encoding.to_owned());
        self
    }

    pub fn correlation_id(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_owned());
        self
    }

    pub fn message_id(mut self, message_id: &str) -> Self {
        self.message_id = Some(message_id.to_owned());
        self
    }

    /// Unix timestamp in seconds.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn app_id(mut self, app_id: &str) -> Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    /// The AMQP `type` property.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Per-message expiration in milliseconds.
    pub fn expiration(mut self, ms: u64) -> Self {
        self.expiration = Some(ms.to_string());
        self
    }

    /// Marks the message persistent (survives broker restarts on durable
    /// queues).
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Deadline for the broker confirm, or for the reply on RPC calls.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Publisher bound to one chain state.
pub struct Publisher {
    manager: ConnectionManager,
    state: ChainState,
}

impl Publisher {
    pub(crate) fn new(manager: ConnectionManager, state: ChainState) -> Publisher {
        Publisher { manager, state }
    }

    /// Asserts the chain's topology ahead of the first publish.
    pub(crate) async fn ensure_setup(&self) -> Result<(), AmqpError> {
        if self.state.skip_setup {
            return Ok(());
        }
        if self.state.exchange.is_none()
            && self.state.queue.is_none()
            && self.state.bindings.is_empty()
        {
            return Ok(());
        }
        let channel = self.manager.channel().await?;
        crate::setup::assert_topology(&channel, &self.state).await.map(|_| ())
    }

    /// Publishes to the chain's exchange with the given routing key.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        let exchange = self.state.exchange_name().to_owned();
        self.publish_raw(&exchange, routing_key, payload.into(), options)
            .await
    }

    /// Publishes directly to a queue through the default exchange.
    pub async fn publish_to_queue(
        &self,
        queue: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        self.publish_raw("", queue, payload.into(), options).await
    }

    /// Sends a request to the chain's queue and awaits the correlated
    /// reply.
    pub async fn rpc(
        &self,
        payload: impl Into<Payload>,
        mut options: PublishOptions,
    ) -> Result<Message, AmqpError> {
        let queue = match &self.state.queue {
            Some(queue) if !queue.name().is_empty() => queue.name().to_owned(),
            _ => return Err(AmqpError::Config("rpc without a target queue".to_owned())),
        };

        let link = self.manager.reply_link().await?;
        let registry = self.manager.registry();
        let correlation_id = Uuid::new_v4().to_string();
        let (_waiter, reply_rx) = registry.register(&correlation_id);

        let deadline = options.timeout.take();
        options.correlation_id = Some(correlation_id.clone());
        options.reply_to = Some(link.queue_name().to_owned());

        debug!(
            queue = queue.as_str(),
            correlation_id = correlation_id.as_str(),
            "rpc request"
        );
        self.publish_raw("", &queue, payload.into(), options).await?;

        let (properties, data) = self.await_reply(reply_rx, deadline).await?;
        Message::new(
            String::new(),
            String::new(),
            false,
            0,
            "rpc-reply".to_owned(),
            link.queue_name().to_owned(),
            properties,
            data,
            self.state.json,
            true,
            Arc::new(NullResponder),
        )
    }

    async fn await_reply(
        &self,
        reply_rx: oneshot::Receiver<(BasicProperties, Vec<u8>)>,
        deadline: Option<Duration>,
    ) -> Result<(BasicProperties, Vec<u8>), AmqpError> {
        let reply = async {
            match deadline {
                Some(deadline) => tokio::time::timeout(deadline, reply_rx)
                    .await
                    .map_err(|_| AmqpError::Timeout)?
                    .map_err(|_| AmqpError::Closed),
                None => reply_rx.await.map_err(|_| AmqpError::Closed),
            }
        };

        if self.state.reestablish {
            return reply.await;
        }

        // Without reestablish an in-flight rpc dies with the transport.
        let mut connected = self.manager.connected_watch();
        tokio::select! {
            raw = reply => raw,
            _ = connected.wait_for(|up| !*up) => {
                Err(AmqpError::Transient("connection lost during rpc".to_owned()))
            }
        }
    }

    async fn publish_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Payload,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        let body = payload.to_bytes()?;
        let json = self.state.json && payload.is_json();
        let properties = build_properties(&options, json);

        let retries = if self.state.confirm && self.state.reestablish {
            self.manager.confirm_retry_cap()
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let channel = if self.state.confirm {
                self.manager.confirm_channel().await?
            } else {
                self.manager.channel().await?
            };

            match self
                .send(&channel, exchange, routing_key, &body, properties.clone(), options.timeout)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < retries => {
                    warn!(
                        error = err.to_string(),
                        attempt, "publish interrupted, waiting for reconnect"
                    );
                    self.manager.wait_connected().await?;
                    attempt += 1;
                }
                Err(err) => {
                    error!(error = err.to_string(), "error publishing message");
                    return Err(err);
                }
            }
        }
    }

    async fn send(
        &self,
        channel: &Channel,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
        deadline: Option<Duration>,
    ) -> Result<(), AmqpError> {
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|err| AmqpError::transient(&err))?;

        if !self.state.confirm {
            return Ok(());
        }

        let confirmation = match deadline {
            Some(deadline) => tokio::time::timeout(deadline, confirm)
                .await
                .map_err(|_| AmqpError::Timeout)?,
            None => confirm.await,
        }
        .map_err(|err| AmqpError::transient(&err))?;

        match confirmation {
            Confirmation::Nack(_) => Err(AmqpError::Transient(
                "broker refused responsibility for the publish".to_owned(),
            )),
            _ => Ok(()),
        }
    }
}

/// Copies the active trace context into the outgoing headers, so consumer
/// spans downstream join the publisher's trace.
fn inject_trace_headers(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let mut carrier: HashMap<String, String> = HashMap::new();
    global::get_text_map_propagator(|propagator| propagator.inject(&mut carrier));
    for (key, value) in carrier {
        headers.insert(key.into(), AMQPValue::LongString(value.into()));
    }
}

/// Assembles AMQP properties from publish options and the JSON policy.
fn build_properties(options: &PublishOptions, json: bool) -> BasicProperties {
    let mut headers = options.headers.clone();
    inject_trace_headers(&mut headers);

    let message_id = options
        .message_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut properties = BasicProperties::default()
        .with_message_id(ShortString::from(message_id))
        .with_headers(FieldTable::from(headers));

    if json {
        properties = properties
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_content_encoding(ShortString::from(UTF8_CONTENT_ENCODING));
    } else {
        if let Some(content_type) = &options.content_type {
            properties = properties.with_content_type(ShortString::from(content_type.clone()));
        }
        if let Some(content_encoding) = &options.content_encoding {
            properties =
                properties.with_content_encoding(ShortString::from(content_encoding.clone()));
        }
    }

    if let Some(correlation_id) = &options.correlation_id {
        properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(reply_to) = &options.reply_to {
        properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(timestamp) = options.timestamp {
        properties = properties.with_timestamp(timestamp);
    }
    if let Some(app_id) = &options.app_id {
        properties = properties.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(kind) = &options.kind {
        properties = properties.with_kind(ShortString::from(kind.clone()));
    }
    if let Some(priority) = options.priority {
        properties = properties.with_priority(priority);
    }
    if let Some(expiration) = &options.expiration {
        properties = properties.with_expiration(ShortString::from(expiration.clone()));
    }
    if options.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }

    properties
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_policy_sets_content_headers() {
        let properties = build_properties(&PublishOptions::new(), true);
        assert_eq!(
            properties.content_type().as_ref().map(ShortString::as_str),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            properties
                .content_encoding()
                .as_ref()
                .map(ShortString::as_str),
            Some(UTF8_CONTENT_ENCODING)
        );
    }

    #[test]
    fn raw_payloads_keep_caller_content_type() {
        let options = PublishOptions::new().content_type("application/octet-stream");
        let properties = build_properties(&options, false);
        assert_eq!(
            properties.content_type().as_ref().map(ShortString::as_str),
            Some("application/octet-stream")
        );
    }

    #[test]
    fn message_id_defaults_to_a_fresh_uuid() {
        let a = build_properties(&PublishOptions::new(), true);
        let b = build_properties(&PublishOptions::new(), true);
        assert_ne!(a.message_id(), b.message_id());

        let fixed = build_properties(&PublishOptions::new().message_id("msg-1"), true);
        assert_eq!(
            fixed.message_id().as_ref().map(ShortString::as_str),
            Some("msg-1")
        );
    }

    #[test]
    fn rpc_properties_carry_the_reply_route() {
        let options = PublishOptions::new()
            .correlation_id("corr-7")
            .reply_to("amq.gen-reply")
            .persistent();
        let properties = build_properties(&options, true);

        assert_eq!(
            properties
                .correlation_id()
                .as_ref()
                .map(ShortString::as_str),
            Some("corr-7")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(ShortString::as_str),
            Some("amq.gen-reply")
        );
        assert_eq!(properties.delivery_mode(), &Some(PERSISTENT_DELIVERY_MODE));
    }
}
