// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Chain Builder
//!
//! This module provides the user-facing builder. A chain accumulates an
//! immutable [`ChainState`]; every modifier returns a new chain carrying an
//! adjusted copy, so the original stays valid and concurrently used chains
//! never alias. The terminal verbs are `publish`, `publish_to_queue`, `rpc`
//! and `subscribe`; topology is asserted lazily on first use.

use crate::backoff::Backoff;
use crate::connection::ConnectionManager;
use crate::consumer::{self, Consumer, Handler};
use crate::errors::AmqpError;
use crate::exchange::ExchangeDefinition;
use crate::message::{Message, Payload};
use crate::middleware::Middleware;
use crate::publisher::{PublishOptions, Publisher};
use crate::queue::{Binding, QueueDefinition};
use crate::state::ChainState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Chainable entry point for topology, publishing, consuming and RPC.
///
/// Obtained from [`ConnectionManager::chain`]. Cheap to build and branch:
/// modifiers clone the state, terminal verbs freeze it.
pub struct Chain {
    manager: ConnectionManager,
    state: ChainState,
    subscribed: AtomicBool,
    publisher: OnceCell<Arc<Publisher>>,
}

impl Chain {
    pub(crate) fn new(manager: ConnectionManager) -> Chain {
        Chain {
            manager,
            state: ChainState::default(),
            subscribed: AtomicBool::new(false),
            publisher: OnceCell::new(),
        }
    }

    fn with(&self, adjust: impl FnOnce(&mut ChainState)) -> Chain {
        let mut state = self.state.clone();
        adjust(&mut state);
        Chain {
            manager: self.manager.clone(),
            state,
            subscribed: AtomicBool::new(false),
            publisher: OnceCell::new(),
        }
    }

    /// The frozen state this chain carries.
    pub fn state(&self) -> &ChainState {
        &self.state
    }

    /// Sets the queue to consume from, publish to or rpc against.
    pub fn queue(&self, queue: QueueDefinition) -> Chain {
        self.with(|state| state.queue = Some(queue))
    }

    /// Sets the exchange publishes are routed through.
    pub fn exchange(&self, exchange: ExchangeDefinition) -> Chain {
        self.with(|state| state.exchange = Some(exchange))
    }

    /// Adds a binding asserted during setup.
    pub fn bind(&self, binding: Binding) -> Chain {
        self.with(|state| state.bindings.push(binding))
    }

    /// Acknowledges unhandled deliveries after the handler. Default true.
    pub fn auto_ack(&self, auto_ack: bool) -> Chain {
        self.with(|state| state.auto_ack = auto_ack)
    }

    /// Replies with the handler's return value on RPC deliveries. Default
    /// false.
    pub fn auto_reply(&self, auto_reply: bool) -> Chain {
        self.with(|state| state.auto_reply = auto_reply)
    }

    /// Bounds unacknowledged deliveries per consumer; 0 means unlimited.
    pub fn prefetch(&self, prefetch: u16) -> Chain {
        self.with(|state| state.prefetch = prefetch)
    }

    /// Encodes and decodes payloads as UTF-8 JSON. Default true.
    pub fn json(&self, json: bool) -> Chain {
        self.with(|state| state.json = json)
    }

    /// Awaits broker confirms on publishes. Default false.
    pub fn confirm(&self, confirm: bool) -> Chain {
        self.with(|state| state.confirm = confirm)
    }

    /// Skips topology assertion entirely. Default false.
    pub fn skip_setup(&self, skip_setup: bool) -> Chain {
        self.with(|state| state.skip_setup = skip_setup)
    }

    /// Restores consumers and retries confirm publishes after a transport
    /// loss. Default true.
    pub fn reestablish(&self, reestablish: bool) -> Chain {
        self.with(|state| state.reestablish = reestablish)
    }

    /// Failures tolerated within the failure span before the backoff
    /// pauses deliveries.
    pub fn fail_threshold(&self, threshold: usize) -> Chain {
        self.with(|state| state.fail_threshold = threshold)
    }

    /// Width of the sliding failure window.
    pub fn fail_span(&self, span: Duration) -> Chain {
        self.with(|state| state.fail_span = span)
    }

    /// Pause applied once the failure window overflows.
    pub fn fail_timeout(&self, timeout: Duration) -> Chain {
        self.with(|state| state.fail_timeout = timeout)
    }

    /// Replaces the default window backoff.
    pub fn backoff(&self, backoff: Arc<dyn Backoff>) -> Chain {
        self.with(|state| state.backoff = Some(backoff))
    }

    /// Appends a middleware layer; layers run in registration order.
    pub fn middleware(&self, middleware: impl Middleware + 'static) -> Chain {
        self.with(|state| state.middleware.push(Arc::new(middleware)))
    }

    /// Consumer priority on the queue.
    pub fn priority(&self, priority: u8) -> Chain {
        self.with(|state| state.priority = Some(priority))
    }

    /// Consumes without acknowledgements. Default false.
    pub fn no_ack(&self, no_ack: bool) -> Chain {
        self.with(|state| state.no_ack = no_ack)
    }

    /// Requests exclusive consumption of the queue. Default false.
    pub fn exclusive(&self, exclusive: bool) -> Chain {
        self.with(|state| state.exclusive = exclusive)
    }

    /// Publishes to this chain's exchange under the given routing key.
    pub async fn publish(
        &self,
        routing_key: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        self.publisher().await?.publish(routing_key, payload, options).await
    }

    /// Publishes straight to a queue through the default exchange.
    pub async fn publish_to_queue(
        &self,
        queue: &str,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        self.publisher()
            .await?
            .publish_to_queue(queue, payload, options)
            .await
    }

    /// Sends a request to this chain's queue and awaits the correlated
    /// reply.
    pub async fn rpc(
        &self,
        payload: impl Into<Payload>,
        options: PublishOptions,
    ) -> Result<Message, AmqpError> {
        self.publisher().await?.rpc(payload, options).await
    }

    /// Starts consuming this chain's queue with the given handler.
    ///
    /// A chain instance subscribes at most once; branch a new chain for a
    /// second consumer.
    pub async fn subscribe(&self, handler: impl Handler + 'static) -> Result<Consumer, AmqpError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::Config(
                "chain already subscribed, branch a new chain".to_owned(),
            ));
        }
        let result =
            consumer::subscribe(self.manager.clone(), self.state.clone(), Arc::new(handler)).await;
        if result.is_err() {
            self.subscribed.store(false, Ordering::SeqCst);
        }
        result
    }

    /// The publisher for this chain, asserting topology on first use.
    async fn publisher(&self) -> Result<Arc<Publisher>, AmqpError> {
        self.publisher
            .get_or_try_init(|| async {
                let publisher = Publisher::new(self.manager.clone(), self.state.clone());
                publisher.ensure_setup().await?;
                Ok(Arc::new(publisher))
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;

    fn detached_chain() -> Chain {
        // Builder-only tests never touch the transport.
        Chain {
            manager: ConnectionManager {
                inner: crate::connection::ManagerInner::detached(),
            },
            state: ChainState::default(),
            subscribed: AtomicBool::new(false),
            publisher: OnceCell::new(),
        }
    }

    #[test]
    fn modifiers_branch_instead_of_mutating() {
        let base = detached_chain().queue(QueueDefinition::new("work"));
        let tuned = base.prefetch(25).auto_ack(false).confirm(true);

        assert_eq!(base.state().prefetch, 0);
        assert!(base.state().auto_ack);
        assert!(!base.state().confirm);

        assert_eq!(tuned.state().prefetch, 25);
        assert!(!tuned.state().auto_ack);
        assert!(tuned.state().confirm);
        assert_eq!(tuned.state().queue.as_ref().unwrap().name(), "work");
    }

    #[test]
    fn topology_accumulates_in_order() {
        let chain = detached_chain()
            .exchange(ExchangeDefinition::new("events").kind(ExchangeKind::Topic))
            .queue(QueueDefinition::new("audit"))
            .bind(Binding::new("events").pattern("user.*"))
            .bind(Binding::new("events").pattern("order.*"));

        let state = chain.state();
        assert_eq!(state.exchange.as_ref().unwrap().name(), "events");
        assert_eq!(state.bindings.len(), 2);
        assert_eq!(state.bindings[0].patterns, vec!["user.*"]);
        assert_eq!(state.bindings[1].patterns, vec!["order.*"]);
    }

    #[test]
    fn middleware_registration_preserves_order() {
        let chain = detached_chain()
            .middleware(|_msg: Arc<Message>, next: crate::middleware::Next| async move {
                next.run().await
            })
            .middleware(|_msg: Arc<Message>, next: crate::middleware::Next| async move {
                next.run().await
            });

        assert_eq!(chain.state().middleware.len(), 2);
    }
}
