// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Backoff
//!
//! This module provides the pluggable failure-pacing strategy consulted by
//! consumers around every delivery. The default implementation tracks a
//! sliding window of recent failures and pauses admission once the window
//! overflows, giving a misbehaving downstream time to recover.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Failure-pacing policy consulted by a consumer around each delivery.
///
/// `take` is awaited before a delivery enters the pipeline and may suspend.
/// The remaining methods report delivery outcomes: `pass` on success,
/// `nack` on a handler or middleware failure, `ack` when user code settled
/// the message explicitly, and `fail` on fatal processing errors.
#[async_trait]
pub trait Backoff: Send + Sync {
    /// Awaits permission to process the next delivery.
    async fn take(&self);

    /// Reports a successfully processed delivery.
    fn pass(&self);

    /// Reports a failed delivery.
    fn nack(&self);

    /// Reports an explicit acknowledgement by user code.
    fn ack(&self);

    /// Reports a fatal processing failure.
    fn fail(&self);
}

struct WindowInner {
    failures: VecDeque<Instant>,
    suspended_until: Option<Instant>,
}

/// Default sliding-window backoff.
///
/// When more than `threshold` failures land within any `span` window, the
/// next `take` suspends for `timeout` before admitting further deliveries,
/// and [`Backoff::fail`] is emitted once per crossing.
pub struct WindowBackoff {
    threshold: usize,
    span: Duration,
    timeout: Duration,
    inner: Mutex<WindowInner>,
}

impl WindowBackoff {
    pub fn new(threshold: usize, span: Duration, timeout: Duration) -> WindowBackoff {
        WindowBackoff {
            threshold,
            span,
            timeout,
            inner: Mutex::new(WindowInner {
                failures: VecDeque::new(),
                suspended_until: None,
            }),
        }
    }

    fn suspension_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        match inner.suspended_until {
            Some(until) if until > Instant::now() => Some(until),
            Some(_) => {
                inner.suspended_until = None;
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl Backoff for WindowBackoff {
    async fn take(&self) {
        // The deadline may be pushed out by failures that land while we
        // sleep, so re-check until no suspension remains.
        while let Some(until) = self.suspension_deadline() {
            tokio::time::sleep_until(until).await;
        }
    }

    fn pass(&self) {}

    fn nack(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.failures.push_back(now);
        while let Some(first) = inner.failures.front() {
            if now.duration_since(*first) > self.span {
                inner.failures.pop_front();
            } else {
                break;
            }
        }
        if inner.failures.len() > self.threshold {
            inner.failures.clear();
            inner.suspended_until = Some(now + self.timeout);
            drop(inner);
            self.fail();
        }
    }

    fn ack(&self) {}

    fn fail(&self) {
        warn!(
            timeout_ms = self.timeout.as_millis() as u64,
            "failure threshold crossed, pausing deliveries"
        );
        debug!(threshold = self.threshold, "backoff window reset");
    }
}
