// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod rpc;
mod setup;

pub mod backoff;
pub mod chain;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod middleware;
pub mod publisher;
pub mod queue;
pub mod state;

pub use backoff::{Backoff, WindowBackoff};
pub use chain::Chain;
pub use connection::{ConnectOptions, ConnectionEvent, ConnectionManager, ManagerState};
pub use consumer::{Consumer, ConsumerState, Handler};
pub use errors::AmqpError;
pub use exchange::{ExchangeDefinition, ExchangeKind};
pub use message::{HandledState, Message, Payload};
pub use middleware::{Middleware, Next};
pub use publisher::{PublishOptions, Publisher};
pub use queue::{Binding, QueueDefinition};
pub use state::ChainState;
