// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Middleware Pipeline
//!
//! This module provides the per-delivery middleware chain. Each layer
//! receives the message and a [`Next`] token for the rest of the chain.
//! `Next::run` consumes the token, so a layer can advance the chain at most
//! once; a layer that settles without advancing and without handling the
//! message is advanced automatically by the runtime. A handled message
//! short-circuits every remaining layer, including the user handler.

use crate::errors::AmqpError;
use crate::message::Message;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A per-delivery decorator invoked in registration order.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, message: Arc<Message>, next: Next) -> Result<(), AmqpError>;
}

#[async_trait]
impl<F, Fut> Middleware for F
where
    F: Fn(Arc<Message>, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn handle(&self, message: Arc<Message>, next: Next) -> Result<(), AmqpError> {
        self(message, next).await
    }
}

/// Innermost stage of the pipeline, wrapping the user handler.
#[async_trait]
pub(crate) trait Terminal: Send + Sync {
    async fn call(&self, message: Arc<Message>) -> Result<(), AmqpError>;
}

pub(crate) type Layers = Arc<Vec<Arc<dyn Middleware>>>;

/// Continuation token for the remainder of the pipeline.
///
/// Running it consumes the token, which makes repeated advancement of the
/// same layer impossible by construction.
pub struct Next {
    layers: Layers,
    terminal: Arc<dyn Terminal>,
    message: Arc<Message>,
    index: usize,
    advanced: Arc<AtomicBool>,
}

impl Next {
    /// Runs the remaining layers and, ultimately, the user handler.
    ///
    /// Returns immediately when the message has already been handled.
    pub async fn run(self) -> Result<(), AmqpError> {
        self.advanced.store(true, Ordering::SeqCst);
        run_from(self.layers, self.terminal, self.message, self.index).await
    }
}

/// Runs the pipeline starting at `index`.
///
/// After a layer settles without advancing and without handling the
/// message, the chain advances automatically, exactly once per layer.
pub(crate) fn run_from(
    layers: Layers,
    terminal: Arc<dyn Terminal>,
    message: Arc<Message>,
    index: usize,
) -> BoxFuture<'static, Result<(), AmqpError>> {
    Box::pin(async move {
        if message.is_handled() {
            return Ok(());
        }
        if index >= layers.len() {
            return terminal.call(message).await;
        }

        let advanced = Arc::new(AtomicBool::new(false));
        let next = Next {
            layers: layers.clone(),
            terminal: terminal.clone(),
            message: message.clone(),
            index: index + 1,
            advanced: advanced.clone(),
        };

        let layer = layers[index].clone();
        layer.handle(message.clone(), next).await?;

        if !advanced.load(Ordering::SeqCst) && !message.is_handled() {
            return run_from(layers, terminal, message, index + 1).await;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::testing::{json_message, RecordingResponder};
    use std::sync::atomic::AtomicUsize;

    struct CountingTerminal {
        calls: AtomicUsize,
    }

    impl CountingTerminal {
        fn new() -> Arc<CountingTerminal> {
            Arc::new(CountingTerminal {
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Terminal for CountingTerminal {
        async fn call(&self, _message: Arc<Message>) -> Result<(), AmqpError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn message() -> Arc<Message> {
        Arc::new(json_message(
            b"\"test\"",
            Arc::new(RecordingResponder::default()),
        ))
    }

    #[tokio::test]
    async fn layers_run_in_registration_order() {
        let order: Arc<parking_lot::Mutex<Vec<&'static str>>> = Arc::default();
        let (a, b) = (order.clone(), order.clone());

        let layers: Layers = Arc::new(vec![
            Arc::new(move |_msg: Arc<Message>, next: Next| {
                let order = a.clone();
                async move {
                    order.lock().push("first");
                    next.run().await
                }
            }) as Arc<dyn Middleware>,
            Arc::new(move |_msg: Arc<Message>, next: Next| {
                let order = b.clone();
                async move {
                    order.lock().push("second");
                    next.run().await
                }
            }) as Arc<dyn Middleware>,
        ]);

        let terminal = CountingTerminal::new();
        run_from(layers, terminal.clone(), message(), 0)
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(terminal.calls(), 1);
    }

    #[tokio::test]
    async fn auto_next_fires_when_a_layer_does_not_advance() {
        let layers: Layers = Arc::new(vec![Arc::new(|_msg: Arc<Message>, _next: Next| async move {
            // Dropping the token without running it: the runtime advances.
            Ok(())
        }) as Arc<dyn Middleware>]);

        let terminal = CountingTerminal::new();
        run_from(layers, terminal.clone(), message(), 0)
            .await
            .unwrap();

        assert_eq!(terminal.calls(), 1);
    }

    #[tokio::test]
    async fn handled_message_short_circuits_downstream() {
        let layers: Layers = Arc::new(vec![
            Arc::new(|msg: Arc<Message>, next: Next| async move {
                msg.ack().await?;
                next.run().await
            }) as Arc<dyn Middleware>,
            Arc::new(|_msg: Arc<Message>, _next: Next| async move {
                panic!("downstream layer must not run after handling");
                #[allow(unreachable_code)]
                Ok(())
            }) as Arc<dyn Middleware>,
        ]);

        let terminal = CountingTerminal::new();
        run_from(layers, terminal.clone(), message(), 0)
            .await
            .unwrap();

        assert_eq!(terminal.calls(), 0);
    }

    #[tokio::test]
    async fn handled_message_suppresses_auto_next() {
        let layers: Layers = Arc::new(vec![Arc::new(|msg: Arc<Message>, _next: Next| async move {
            msg.ack().await?;
            Ok(())
        }) as Arc<dyn Middleware>]);

        let terminal = CountingTerminal::new();
        run_from(layers, terminal.clone(), message(), 0)
            .await
            .unwrap();

        assert_eq!(terminal.calls(), 0);
    }

    #[tokio::test]
    async fn a_failing_layer_short_circuits_the_chain() {
        let layers: Layers = Arc::new(vec![
            Arc::new(|_msg: Arc<Message>, _next: Next| async move {
                Err(AmqpError::Handler("whoopsiedaisy".to_owned()))
            }) as Arc<dyn Middleware>,
            Arc::new(|_msg: Arc<Message>, _next: Next| async move {
                panic!("must not run after a failing layer");
                #[allow(unreachable_code)]
                Ok(())
            }) as Arc<dyn Middleware>,
        ]);

        let terminal = CountingTerminal::new();
        let err = run_from(layers, terminal.clone(), message(), 0)
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::Handler(_)));
        assert_eq!(terminal.calls(), 0);
    }
}
