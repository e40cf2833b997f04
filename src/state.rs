// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Chain State
//!
//! This module provides the immutable configuration record that flows from
//! the chain builder into setup, publisher and consumer construction. Every
//! chain modifier clones the state and adjusts the copy, so concurrently
//! used chains never alias each other's configuration.

use crate::backoff::{Backoff, WindowBackoff};
use crate::exchange::ExchangeDefinition;
use crate::middleware::Middleware;
use crate::queue::{Binding, QueueDefinition};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Immutable record of every knob a chain carries.
///
/// Cloned per modifier; the previous value stays valid.
#[derive(Clone)]
pub struct ChainState {
    pub(crate) auto_ack: bool,
    pub(crate) auto_reply: bool,
    pub(crate) prefetch: u16,
    pub(crate) json: bool,
    pub(crate) confirm: bool,
    pub(crate) skip_setup: bool,
    pub(crate) reestablish: bool,
    pub(crate) no_ack: bool,
    pub(crate) exclusive: bool,
    pub(crate) priority: Option<u8>,
    pub(crate) fail_threshold: usize,
    pub(crate) fail_span: Duration,
    pub(crate) fail_timeout: Duration,
    pub(crate) queue: Option<QueueDefinition>,
    pub(crate) exchange: Option<ExchangeDefinition>,
    pub(crate) bindings: Vec<Binding>,
    pub(crate) middleware: Vec<Arc<dyn Middleware>>,
    pub(crate) backoff: Option<Arc<dyn Backoff>>,
}

impl Default for ChainState {
    fn default() -> ChainState {
        ChainState {
            auto_ack: true,
            auto_reply: false,
            prefetch: 0,
            json: true,
            confirm: false,
            skip_setup: false,
            reestablish: true,
            no_ack: false,
            exclusive: false,
            priority: None,
            fail_threshold: 3,
            fail_span: Duration::from_millis(60_000),
            fail_timeout: Duration::from_millis(30_000),
            queue: None,
            exchange: None,
            bindings: vec![],
            middleware: vec![],
            backoff: None,
        }
    }
}

impl ChainState {
    /// The backoff instance for a consumer built from this state: the
    /// configured override, or a window backoff from the legacy knobs.
    pub(crate) fn consumer_backoff(&self) -> Arc<dyn Backoff> {
        match &self.backoff {
            Some(backoff) => backoff.clone(),
            None => Arc::new(WindowBackoff::new(
                self.fail_threshold,
                self.fail_span,
                self.fail_timeout,
            )),
        }
    }

    /// Name of the publish target exchange, empty for the default exchange.
    pub(crate) fn exchange_name(&self) -> &str {
        self.exchange.as_ref().map(|e| e.name()).unwrap_or("")
    }
}

impl fmt::Debug for ChainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainState")
            .field("auto_ack", &self.auto_ack)
            .field("auto_reply", &self.auto_reply)
            .field("prefetch", &self.prefetch)
            .field("json", &self.json)
            .field("confirm", &self.confirm)
            .field("skip_setup", &self.skip_setup)
            .field("reestablish", &self.reestablish)
            .field("no_ack", &self.no_ack)
            .field("exclusive", &self.exclusive)
            .field("priority", &self.priority)
            .field("queue", &self.queue.as_ref().map(|q| q.name()))
            .field("exchange", &self.exchange.as_ref().map(|e| e.name()))
            .field("bindings", &self.bindings.len())
            .field("middleware", &self.middleware.len())
            .finish()
    }
}
