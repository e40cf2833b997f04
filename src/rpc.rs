// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RPC Reply Routing
//!
//! This module provides the reply side of request/reply messaging: a single
//! anonymous, exclusive, auto-delete reply queue per connection manager and
//! a registry of pending waiters keyed by correlation id. The reply
//! dispatcher routes strictly by correlation id; replies nobody waits for
//! are dropped. Waiters unregister themselves on fulfilment, timeout or
//! drop, so a cancelled RPC leaves nothing behind.

use crate::errors::AmqpError;
use crate::message::Responder;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicConsumeOptions, QueueDeclareOptions},
    types::{FieldTable, ShortString},
    BasicProperties, Channel,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Raw reply as captured off the wire.
pub(crate) type RawReply = (BasicProperties, Vec<u8>);

/// Pending RPC waiters keyed by correlation id.
///
/// Insertions and removals are single-writer per entry: the waiter that
/// registered a correlation id is the only one that may cancel it, and the
/// dispatcher is the only fulfiller. The lock is never held across awaits.
#[derive(Default)]
pub(crate) struct ReplyRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<RawReply>>>,
}

impl ReplyRegistry {
    /// Registers a waiter for the given correlation id.
    pub(crate) fn register(
        self: &Arc<Self>,
        correlation_id: &str,
    ) -> (ReplyWaiter, oneshot::Receiver<RawReply>) {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id.to_owned(), tx);
        (
            ReplyWaiter {
                correlation_id: correlation_id.to_owned(),
                registry: self.clone(),
            },
            rx,
        )
    }

    /// Routes a reply to its waiter. Returns false when nobody waits.
    pub(crate) fn fulfill(&self, correlation_id: &str, reply: RawReply) -> bool {
        let sender = self.pending.lock().remove(correlation_id);
        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => false,
        }
    }

    /// Drops every pending waiter; their receivers observe closure.
    pub(crate) fn clear(&self) {
        self.pending.lock().clear();
    }

    fn cancel(&self, correlation_id: &str) {
        if self.pending.lock().remove(correlation_id).is_some() {
            debug!(correlation_id, "rpc waiter unregistered");
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Responder for reply messages, which are consumed in no-ack mode and
/// have no broker effects left to apply.
pub(crate) struct NullResponder;

#[async_trait]
impl Responder for NullResponder {
    async fn ack(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn reply(
        &self,
        _reply_to: &str,
        _properties: BasicProperties,
        _body: Vec<u8>,
    ) -> Result<(), AmqpError> {
        Err(AmqpError::Config(
            "rpc replies cannot be replied to".to_owned(),
        ))
    }
}

/// Removes the registry entry when the waiting call goes away.
pub(crate) struct ReplyWaiter {
    correlation_id: String,
    registry: Arc<ReplyRegistry>,
}

impl Drop for ReplyWaiter {
    fn drop(&mut self) {
        self.registry.cancel(&self.correlation_id);
    }
}

/// The per-manager reply queue and its dispatcher.
pub(crate) struct ReplyLink {
    queue: String,
    task: JoinHandle<()>,
}

impl ReplyLink {
    /// Declares the anonymous reply queue and starts the dispatcher.
    ///
    /// The dispatcher consumes in no-ack mode: replies are either routed to
    /// a waiter or dropped, redelivering them would help nobody.
    pub(crate) async fn open(
        channel: Arc<Channel>,
        registry: Arc<ReplyRegistry>,
    ) -> Result<ReplyLink, AmqpError> {
        let declared = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::transient(&err))?;
        let queue = declared.name().as_str().to_owned();

        let mut consumer = channel
            .basic_consume(
                &queue,
                "rpc-reply",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::transient(&err))?;

        debug!(queue = queue.as_str(), "reply link established");

        let task = tokio::spawn({
            let queue = queue.clone();
            let unmatched_logged = AtomicBool::new(false);
            async move {
                while let Some(result) = consumer.next().await {
                    match result {
                        Ok(delivery) => {
                            let correlation_id = delivery
                                .properties
                                .correlation_id()
                                .as_ref()
                                .map(ShortString::as_str)
                                .unwrap_or_default()
                                .to_owned();
                            let routed = registry
                                .fulfill(&correlation_id, (delivery.properties, delivery.data));
                            if !routed && !unmatched_logged.swap(true, Ordering::SeqCst) {
                                warn!(
                                    correlation_id = correlation_id.as_str(),
                                    "dropping reply without a waiter"
                                );
                            }
                        }
                        Err(err) => {
                            error!(
                                error = err.to_string(),
                                queue = queue.as_str(),
                                "reply link consumer failed"
                            );
                            break;
                        }
                    }
                }
            }
        });

        Ok(ReplyLink { queue, task })
    }

    /// Server-assigned name of the reply queue.
    pub(crate) fn queue_name(&self) -> &str {
        &self.queue
    }

    pub(crate) fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for ReplyLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}
