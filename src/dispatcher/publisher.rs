//! Blocking, backlog-aware delivery into bounded queues.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{ExecutionError, PerceptionResult};
use crate::event::Event;
use crate::generator::EventSink;

/// Shared dispatcher counters.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub published: AtomicU64,
    pub routed: AtomicU64,
    pub delivered: AtomicU64,
    pub matcher_outputs: AtomicU64,
    pub backlog_alerts: AtomicU64,
    pub dropped_deliveries: AtomicU64,
    pub matcher_failures: AtomicU64,
}

/// Point-in-time copy of the dispatcher counters.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherStats {
    /// Events accepted from publishers.
    pub published: u64,
    /// Events taken off the input and feedback queues.
    pub routed: u64,
    /// Copies handed to matcher queues.
    pub delivered: u64,
    /// Derived events returned by matchers.
    pub matcher_outputs: u64,
    /// Deliveries that stayed blocked past the alert threshold.
    pub backlog_alerts: u64,
    /// Copies not handed to a slow external subscriber.
    pub dropped_deliveries: u64,
    /// Events a matcher failed on because a predicate panicked.
    pub matcher_failures: u64,
    pub matchers: usize,
    pub subscriptions: usize,
}

impl Counters {
    pub(crate) fn snapshot(&self, matchers: usize, subscriptions: usize) -> DispatcherStats {
        DispatcherStats {
            published: self.published.load(Ordering::Relaxed),
            routed: self.routed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            matcher_outputs: self.matcher_outputs.load(Ordering::Relaxed),
            backlog_alerts: self.backlog_alerts.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
            matcher_failures: self.matcher_failures.load(Ordering::Relaxed),
            matchers,
            subscriptions,
        }
    }
}

/// Sends `event`, raising a backlog alert if the queue stays full for longer
/// than `alert_after`. Never drops the event while the receiver is alive.
pub(crate) fn deliver(
    tx: &Sender<Event>,
    event: Event,
    target: &str,
    alert_after: Duration,
    counters: &Counters,
) -> Result<(), ExecutionError> {
    let started = Instant::now();
    match tx.send_timeout(event, alert_after) {
        Ok(()) => Ok(()),
        Err(SendTimeoutError::Timeout(event)) => {
            counters.backlog_alerts.fetch_add(1, Ordering::Relaxed);
            let alert = ExecutionError::Backlog {
                target: target.to_string(),
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            error!(
                target: "perception::dispatcher",
                queue = target,
                queued = tx.len(),
                error = %alert,
                "delivery backlog; blocking until the queue drains"
            );
            tx.send(event).map_err(|_| ExecutionError::Disconnected {
                path: target.to_string(),
            })
        }
        Err(SendTimeoutError::Disconnected(_)) => Err(ExecutionError::Disconnected {
            path: target.to_string(),
        }),
    }
}

/// Cloneable handle for feeding events into the dispatcher.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: Sender<Event>,
    alert_after: Duration,
    counters: Arc<Counters>,
}

impl EventPublisher {
    pub(crate) fn new(tx: Sender<Event>, alert_after: Duration, counters: Arc<Counters>) -> Self {
        Self {
            tx,
            alert_after,
            counters,
        }
    }

    /// Queues an event for routing. Blocks while the input queue is full.
    pub fn publish(&self, event: Event) -> PerceptionResult<()> {
        deliver(&self.tx, event, "dispatcher_input", self.alert_after, &self.counters)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl EventSink for EventPublisher {
    fn emit(&self, event: Event) -> PerceptionResult<()> {
        self.publish(event)
    }
}
