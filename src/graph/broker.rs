//! Change broker for resource mutations.
//!
//! Every structural change and metric update in the graph is published as a
//! [`ResourceChange`] record. Watchers subscribe to a bounded channel instead
//! of registering callbacks on individual resources.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ExecutionError, PerceptionError, PerceptionResult};

use super::resource::CloudResource;

/// What happened to the resource.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
}

/// A published change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Graph version after the change.
    pub version: u64,
    /// What happened.
    pub kind: ChangeKind,
    /// When the change was published.
    pub changed_at: DateTime<Utc>,
    /// Snapshot of the resource right after the change.
    pub resource: CloudResource,
}

/// Fan-out of change records to subscribers.
///
/// Publishing never blocks: a subscriber whose buffer is full misses the
/// record and the miss is counted. Disconnected subscribers are pruned.
#[derive(Debug, Default)]
pub struct ChangeBroker {
    subscribers: Mutex<Vec<Sender<ResourceChange>>>,
    missed: AtomicU64,
}

impl ChangeBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watcher with a buffer of `capacity` records.
    pub fn subscribe(&self, capacity: usize) -> ChangeSubscription {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        ChangeSubscription { rx }
    }

    /// Publishes a record to every live subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, change: &ResourceChange) -> usize {
        let mut subs = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        subs.retain(|tx| match tx.try_send(change.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                self.missed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "perception::graph",
                    resource = %change.resource.name,
                    version = change.version,
                    "change subscriber is full; record missed"
                );
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
        delivered
    }

    /// Number of live subscribers (pruned lazily on publish).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Records missed because a subscriber buffer was full.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }
}

/// Receiving end of a broker subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChangeSubscription {
    rx: Receiver<ResourceChange>,
}

impl ChangeSubscription {
    /// Receive the next change (blocking).
    pub fn recv(&self) -> PerceptionResult<ResourceChange> {
        self.rx.recv().map_err(|_| disconnected())
    }

    /// Receive the next change with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> PerceptionResult<ResourceChange> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => PerceptionError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => disconnected(),
        })
    }

    /// Returns a change if one is already queued.
    pub fn try_recv(&self) -> Option<ResourceChange> {
        match self.rx.try_recv() {
            Ok(change) => Some(change),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

fn disconnected() -> PerceptionError {
    PerceptionError::Execution(ExecutionError::Disconnected {
        path: "change_subscription".to_string(),
    })
}

/// Handle a node uses to announce its own changes.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct Notifier {
    broker: Arc<ChangeBroker>,
    version: Arc<AtomicU64>,
}

impl Notifier {
    pub(crate) fn new(broker: Arc<ChangeBroker>, version: Arc<AtomicU64>) -> Self {
        Self { broker, version }
    }

    pub(crate) fn publish(&self, kind: ChangeKind, resource: CloudResource) {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.broker.publish(&ResourceChange {
            version,
            kind,
            changed_at: Utc::now(),
            resource,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::resource::{CoMetrics, ResourceMetrics};

    fn change(version: u64) -> ResourceChange {
        ResourceChange {
            version,
            kind: ChangeKind::Updated,
            changed_at: Utc::now(),
            resource: CloudResource {
                name: "co".to_string(),
                score: 0,
                parent: None,
                tier: None,
                metrics: ResourceMetrics::Co(CoMetrics { response_time: 1 }),
            },
        }
    }

    #[test]
    fn publish_reaches_every_subscriber() {
        let broker = ChangeBroker::new();
        let a = broker.subscribe(4);
        let b = broker.subscribe(4);

        assert_eq!(broker.publish(&change(1)), 2);
        assert_eq!(a.try_recv().unwrap().version, 1);
        assert_eq!(b.try_recv().unwrap().version, 1);
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let broker = ChangeBroker::new();
        let a = broker.subscribe(4);
        drop(broker.subscribe(4));

        assert_eq!(broker.publish(&change(1)), 1);
        assert_eq!(broker.subscriber_count(), 1);
        assert!(a.try_recv().is_some());
    }

    #[test]
    fn full_subscriber_counts_missed_records() {
        let broker = ChangeBroker::new();
        let a = broker.subscribe(1);

        broker.publish(&change(1));
        broker.publish(&change(2));
        assert_eq!(broker.missed(), 1);
        assert_eq!(a.try_recv().unwrap().version, 1);
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn recv_timeout_reports_timeout() {
        let broker = ChangeBroker::new();
        let a = broker.subscribe(1);
        let err = a.recv_timeout(Duration::from_millis(5)).unwrap_err();
        assert!(err.is_retryable());
    }
}
