// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Setup
//!
//! This module asserts the topology described by a chain state against the
//! broker: exchange first, then queue, then bindings. Declarations are
//! idempotent; redeclaring with identical parameters succeeds, while a
//! parameter mismatch is rejected by the broker and surfaces as a setup
//! error. Anonymous queues resolve to their server-assigned name here.

use crate::errors::AmqpError;
use crate::exchange::ExchangeKind;
use crate::queue::Binding;
use crate::state::ChainState;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel,
};
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

/// Header-exchange argument selecting all-keys matching
const HEADERS_MATCH_ARG: &str = "x-match";

/// Names pinned by one setup pass.
#[derive(Debug, Default, Clone)]
pub(crate) struct Resolved {
    /// Declared queue name; for anonymous queues the server-assigned one.
    pub(crate) queue: Option<String>,
}

/// Asserts the state's topology, resolving anonymous queue names.
pub(crate) async fn assert_topology(
    channel: &Channel,
    state: &ChainState,
) -> Result<Resolved, AmqpError> {
    assert_topology_pinned(channel, state, None).await
}

/// Asserts the state's topology declaring the queue under a pinned name.
///
/// Used on reestablish, where an anonymous queue must come back under the
/// same server-assigned name the consumer already holds.
pub(crate) async fn assert_topology_pinned(
    channel: &Channel,
    state: &ChainState,
    pinned_queue: Option<&str>,
) -> Result<Resolved, AmqpError> {
    let mut resolved = Resolved {
        queue: pinned_queue
            .map(str::to_owned)
            .or_else(|| state.queue.as_ref().map(|q| q.name.clone())),
    };

    if state.skip_setup {
        debug!("setup skipped by configuration");
        return Ok(resolved);
    }

    if let Some(exchange) = &state.exchange {
        debug!(name = exchange.name.as_str(), "declaring exchange");
        channel
            .exchange_declare(
                &exchange.name,
                exchange.kind.clone().try_into()?,
                ExchangeDeclareOptions {
                    passive: exchange.passive,
                    durable: exchange.durable,
                    auto_delete: exchange.auto_delete,
                    internal: exchange.internal,
                    nowait: exchange.no_wait,
                },
                FieldTable::from(exchange.arguments.clone()),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = exchange.name.as_str(),
                    "error declaring exchange"
                );
                declare_error(err)
            })?;
    }

    if let Some(queue) = &state.queue {
        let name = pinned_queue.unwrap_or(&queue.name);
        debug!(name, anonymous = queue.is_anonymous(), "declaring queue");
        let declared = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: queue.passive,
                    durable: queue.durable,
                    exclusive: queue.exclusive,
                    auto_delete: queue.auto_delete,
                    nowait: queue.no_wait,
                },
                FieldTable::from(queue.arguments.clone()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error declaring queue");
                declare_error(err)
            })?;
        resolved.queue = Some(declared.name().as_str().to_owned());
    }

    for binding in &state.bindings {
        bind_queue(channel, state, binding, &resolved).await?;
    }

    Ok(resolved)
}

async fn bind_queue(
    channel: &Channel,
    state: &ChainState,
    binding: &Binding,
    resolved: &Resolved,
) -> Result<(), AmqpError> {
    let queue = match binding.queue.as_deref().or(resolved.queue.as_deref()) {
        Some(queue) => queue,
        None => {
            return Err(AmqpError::Config(
                "binding without a queue to bind".to_owned(),
            ))
        }
    };

    // The binding semantics follow the kind of the exchange being bound,
    // known when it is the chain's own exchange; defaults to routing keys.
    let kind = match &state.exchange {
        Some(exchange) if exchange.name == binding.exchange => exchange.kind.clone(),
        _ => ExchangeKind::Direct,
    };

    let binds: Vec<(String, FieldTable)> = match kind {
        ExchangeKind::Headers => {
            vec![(String::new(), headers_binding_args(&binding.patterns))]
        }
        kind if !kind.uses_routing_keys() => vec![(String::new(), FieldTable::default())],
        _ if binding.patterns.is_empty() => vec![(String::new(), FieldTable::default())],
        _ => binding
            .patterns
            .iter()
            .map(|pattern| (pattern.clone(), FieldTable::default()))
            .collect(),
    };

    for (routing_key, arguments) in binds {
        debug!(
            queue,
            exchange = binding.exchange.as_str(),
            routing_key = routing_key.as_str(),
            "binding queue"
        );
        channel
            .queue_bind(
                queue,
                &binding.exchange,
                &routing_key,
                QueueBindOptions { nowait: false },
                arguments,
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue,
                    exchange = binding.exchange.as_str(),
                    "error binding queue to exchange"
                );
                declare_error(err)
            })?;
    }

    Ok(())
}

/// Translates `key=value` patterns into header-match binding arguments.
fn headers_binding_args(patterns: &[String]) -> FieldTable {
    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(HEADERS_MATCH_ARG),
        AMQPValue::LongString(LongString::from("all")),
    );
    for pattern in patterns {
        match pattern.split_once('=') {
            Some((key, value)) => {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongString(LongString::from(value)),
                );
            }
            None => warn!(pattern = pattern.as_str(), "ignoring non key=value header pattern"),
        }
    }
    FieldTable::from(args)
}

fn declare_error(err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(_) => AmqpError::setup(&err),
        _ => AmqpError::transient(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_patterns_become_match_arguments() {
        let args = headers_binding_args(&["region=eu".to_owned(), "tier=gold".to_owned()]);
        let inner = args.inner();

        assert_eq!(
            inner.get(&ShortString::from("x-match")),
            Some(&AMQPValue::LongString(LongString::from("all")))
        );
        assert_eq!(
            inner.get(&ShortString::from("region")),
            Some(&AMQPValue::LongString(LongString::from("eu")))
        );
        assert_eq!(
            inner.get(&ShortString::from("tier")),
            Some(&AMQPValue::LongString(LongString::from("gold")))
        );
    }

    #[test]
    fn malformed_header_patterns_are_skipped() {
        let args = headers_binding_args(&["not-a-pair".to_owned()]);
        assert_eq!(args.inner().len(), 1);
    }
}
