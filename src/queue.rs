// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue and Binding Descriptors
//!
//! This module provides types for declaratively describing AMQP queues and
//! the bindings between queues and exchanges. A queue declared with an empty
//! name is anonymous: the broker assigns a name at setup time and the
//! enclosing consumer pins that name for its lifetime.

use lapin::types::{AMQPValue, LongInt, LongString, ShortString};
use std::collections::BTreeMap;

/// Argument for the queue idle-expiration period
pub const QUEUE_EXPIRES_ARG: &str = "x-expires";
/// Argument for the per-message time-to-live
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";
/// Argument for the maximum number of messages held
pub const MAX_LENGTH_ARG: &str = "x-max-length";
/// Argument for the maximum queue size in bytes
pub const MAX_LENGTH_BYTES_ARG: &str = "x-max-length-bytes";
/// Argument for the dead-letter exchange
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
/// Argument for the dead-letter routing key
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// Definition of an AMQP queue with its configuration parameters.
///
/// This struct implements the builder pattern: every modifier consumes the
/// definition and returns an updated copy. An empty name requests a
/// server-generated anonymous queue.
#[derive(Debug, Clone, Default)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) exclusive: bool,
    pub(crate) auto_delete: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Creates an anonymous queue definition.
    ///
    /// The broker assigns the name during setup. Anonymous queues are
    /// declared exclusive and auto-delete, matching their single-consumer,
    /// connection-scoped usage.
    pub fn anonymous() -> QueueDefinition {
        QueueDefinition::new("").exclusive().auto_delete()
    }

    /// True when the broker assigns the name at declaration time.
    pub fn is_anonymous(&self) -> bool {
        self.name.is_empty()
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the queue exclusive to the declaring connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Sets the queue to auto-delete once the last consumer disconnects.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the declaration passive, checking existence without creating.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets the no_wait flag, making the declaration non-blocking.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Deletes the queue after it has been unused for `ms` milliseconds.
    pub fn expires(mut self, ms: i32) -> Self {
        self.arguments.insert(
            ShortString::from(QUEUE_EXPIRES_ARG),
            AMQPValue::LongInt(LongInt::from(ms)),
        );
        self
    }

    /// Sets the per-message time-to-live in milliseconds.
    pub fn message_ttl(mut self, ms: i32) -> Self {
        self.arguments.insert(
            ShortString::from(MESSAGE_TTL_ARG),
            AMQPValue::LongInt(LongInt::from(ms)),
        );
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.arguments.insert(
            ShortString::from(MAX_LENGTH_ARG),
            AMQPValue::LongInt(LongInt::from(max)),
        );
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.arguments.insert(
            ShortString::from(MAX_LENGTH_BYTES_ARG),
            AMQPValue::LongInt(LongInt::from(max_bytes)),
        );
        self
    }

    /// Routes rejected and expired messages to the given exchange.
    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.arguments.insert(
            ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
            AMQPValue::LongString(LongString::from(exchange)),
        );
        self
    }

    /// Overrides the routing key used when dead-lettering.
    pub fn dead_letter_routing_key(mut self, key: &str) -> Self {
        self.arguments.insert(
            ShortString::from(DEAD_LETTER_ROUTING_KEY_ARG),
            AMQPValue::LongString(LongString::from(key)),
        );
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Queue name as requested; empty for anonymous queues.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Patterns are routing keys for direct and topic exchanges. Fanout
/// exchanges ignore them, and headers exchanges interpret them through
/// header-match arguments instead.
#[derive(Debug, Clone)]
pub struct Binding {
    pub(crate) exchange: String,
    pub(crate) queue: Option<String>,
    pub(crate) patterns: Vec<String>,
}

impl Binding {
    /// Creates a binding from the given exchange to the chain's queue.
    ///
    /// The queue side defaults to the queue of the chain the binding is
    /// attached to, which may be anonymous and only named at setup time.
    pub fn new(exchange: &str) -> Binding {
        Binding {
            exchange: exchange.to_owned(),
            queue: None,
            patterns: vec![],
        }
    }

    /// Binds to an explicitly named queue instead of the chain's queue.
    pub fn queue(mut self, queue: &str) -> Self {
        self.queue = Some(queue.to_owned());
        self
    }

    /// Adds a routing-key pattern.
    pub fn pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(pattern.to_owned());
        self
    }

    /// Replaces the routing-key patterns.
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_queue_is_exclusive_auto_delete() {
        let def = QueueDefinition::anonymous();
        assert!(def.is_anonymous());
        assert!(def.exclusive);
        assert!(def.auto_delete);
    }

    #[test]
    fn argument_helpers_populate_broker_arguments() {
        let def = QueueDefinition::new("work")
            .durable()
            .message_ttl(30_000)
            .max_length(1_000)
            .dead_letter_exchange("work-dlx");

        assert_eq!(
            def.arguments.get(&ShortString::from(MESSAGE_TTL_ARG)),
            Some(&AMQPValue::LongInt(LongInt::from(30_000)))
        );
        assert_eq!(
            def.arguments.get(&ShortString::from(DEAD_LETTER_EXCHANGE_ARG)),
            Some(&AMQPValue::LongString(LongString::from("work-dlx")))
        );
        assert!(def.durable);
    }

    #[test]
    fn binding_collects_patterns_in_order() {
        let binding = Binding::new("events").pattern("user.*").pattern("order.#");
        assert_eq!(binding.patterns, vec!["user.*", "order.#"]);
        assert!(binding.queue.is_none());
    }
}
