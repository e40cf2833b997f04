// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Descriptors
//!
//! This module provides types for declaratively describing AMQP exchanges.
//! An [`ExchangeDefinition`] is an immutable descriptor built with chainable
//! modifiers; it is only asserted against the broker when the enclosing
//! chain first publishes or subscribes.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, LongString, ShortString};
use std::collections::BTreeMap;

/// Argument used to carry the inner routing kind of a delayed exchange
pub const DELAYED_EXCHANGE_TYPE_ARG: &str = "x-delayed-type";

/// Represents the types of exchanges available in AMQP 0-9-1.
///
/// - Direct: routes on an exact routing-key match
/// - Fanout: broadcasts to every bound queue
/// - Topic: routes on wildcard pattern matching
/// - Headers: routes on header values instead of routing keys
/// - XDelayedMessage: delayed delivery (broker plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XDelayedMessage,
}

impl ExchangeKind {
    /// True when bindings against this exchange carry routing-key patterns.
    pub(crate) fn uses_routing_keys(&self) -> bool {
        !matches!(self, ExchangeKind::Fanout | ExchangeKind::Headers)
    }
}

impl TryFrom<ExchangeKind> for lapin::ExchangeKind {
    type Error = AmqpError;

    fn try_from(kind: ExchangeKind) -> Result<lapin::ExchangeKind, AmqpError> {
        match kind {
            ExchangeKind::Direct => Ok(lapin::ExchangeKind::Direct),
            ExchangeKind::Fanout => Ok(lapin::ExchangeKind::Fanout),
            ExchangeKind::Headers => Ok(lapin::ExchangeKind::Headers),
            ExchangeKind::Topic => Ok(lapin::ExchangeKind::Topic),
            ExchangeKind::XDelayedMessage => {
                Ok(lapin::ExchangeKind::Custom("x-delayed-message".to_owned()))
            }
        }
    }
}

/// Definition of an AMQP exchange with its configuration parameters.
///
/// This struct implements the builder pattern: every modifier consumes the
/// definition and returns an updated copy, so intermediate values remain
/// valid for reuse across chains.
#[derive(Debug, Clone)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) auto_delete: bool,
    pub(crate) internal: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) arguments: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// The exchange defaults to a non-durable direct exchange.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: false,
            auto_delete: false,
            internal: false,
            passive: false,
            no_wait: false,
            arguments: BTreeMap::default(),
        }
    }

    /// Sets the exchange type.
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    pub fn direct(mut self) -> Self {
        self.kind = ExchangeKind::Direct;
        self
    }

    /// Sets the exchange type to Fanout.
    pub fn fanout(mut self) -> Self {
        self.kind = ExchangeKind::Fanout;
        self
    }

    /// Sets the exchange type to Topic.
    pub fn topic(mut self) -> Self {
        self.kind = ExchangeKind::Topic;
        self
    }

    /// Sets the exchange type to Headers.
    pub fn headers(mut self) -> Self {
        self.kind = ExchangeKind::Headers;
        self
    }

    /// Turns the exchange into a delayed-message exchange routing with the
    /// given inner kind.
    ///
    /// Requires the `x-delayed-message` plugin on the broker.
    pub fn delayed(mut self, inner: ExchangeKind) -> Self {
        let routing = match inner {
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            _ => "direct",
        };
        self.kind = ExchangeKind::XDelayedMessage;
        self.arguments.insert(
            ShortString::from(DELAYED_EXCHANGE_TYPE_ARG),
            AMQPValue::LongString(LongString::from(routing)),
        );
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
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

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    /// Exchange name as declared.
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifiers_return_updated_copies() {
        let base = ExchangeDefinition::new("orders");
        let durable = base.clone().topic().durable();

        assert_eq!(base.kind, ExchangeKind::Direct);
        assert!(!base.durable);
        assert_eq!(durable.kind, ExchangeKind::Topic);
        assert!(durable.durable);
    }

    #[test]
    fn delayed_exchange_records_inner_kind() {
        let def = ExchangeDefinition::new("scheduled").delayed(ExchangeKind::Topic);

        assert_eq!(def.kind, ExchangeKind::XDelayedMessage);
        let arg = def
            .arguments
            .get(&ShortString::from(DELAYED_EXCHANGE_TYPE_ARG))
            .unwrap();
        assert_eq!(arg, &AMQPValue::LongString(LongString::from("topic")));
    }

    #[test]
    fn delayed_kind_maps_to_custom_lapin_kind() {
        let kind: lapin::ExchangeKind = ExchangeKind::XDelayedMessage.try_into().unwrap();
        assert_eq!(
            kind,
            lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
        );
    }
}
