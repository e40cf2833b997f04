// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! This module provides the error taxonomy surfaced at the crate boundary.
//! The `AmqpError` enum classifies every failure a caller can observe:
//! configuration mistakes, broker-rejected declarations, transient transport
//! loss, handler failures, timeouts, cancellation and use-after-close.

use thiserror::Error;

/// Represents errors that can occur during AMQP operations.
///
/// Each variant is a stable identifier for one failure class. Transient
/// errors may succeed when retried after a reconnect; configuration and
/// setup errors are fatal at the call site.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid chain state, e.g. subscribing without a queue
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The broker rejected a declare, usually a passive mismatch
    #[error("topology setup rejected: {0}")]
    Setup(String),

    /// Channel or connection lost mid-operation
    #[error("transient failure: {0}")]
    Transient(String),

    /// The user handler or a middleware failed
    #[error("handler failure: {0}")]
    Handler(String),

    /// RPC or publisher-confirm deadline expired
    #[error("operation timed out")]
    Timeout,

    /// Caller-initiated abort
    #[error("operation cancelled")]
    Cancelled,

    /// Operation on a closed consumer, publisher or connection manager
    #[error("resource is closed")]
    Closed,
}

impl AmqpError {
    /// True when retrying after a reconnect may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AmqpError::Transient(_))
    }

    pub(crate) fn transient(err: &lapin::Error) -> AmqpError {
        AmqpError::Transient(err.to_string())
    }

    pub(crate) fn setup(err: &lapin::Error) -> AmqpError {
        AmqpError::Setup(err.to_string())
    }
}
