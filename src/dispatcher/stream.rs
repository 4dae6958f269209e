use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{ExecutionError, PerceptionError, PerceptionResult};
use crate::event::{Event, EventKind};

use super::dispatcher::ControlMsg;
use super::ids::SubscriptionId;

/// A subscription stream for pipeline events.
///
/// Dropping this stream attempts best-effort unregistration. The stream
/// disconnects once the dispatcher shuts down and the buffer is drained.
#[derive(Debug)]
pub struct EventStream {
    subscription_id: SubscriptionId,
    kinds: Vec<EventKind>,
    rx: Receiver<Event>,
    control_tx: Sender<ControlMsg>,
    unregistered: AtomicBool,
}

impl EventStream {
    pub(crate) fn new(
        subscription_id: SubscriptionId,
        kinds: Vec<EventKind>,
        rx: Receiver<Event>,
        control_tx: Sender<ControlMsg>,
    ) -> Self {
        Self {
            subscription_id,
            kinds,
            rx,
            control_tx,
            unregistered: AtomicBool::new(false),
        }
    }

    /// The subscription id backing this stream.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Event kinds delivered to this stream. Empty means every kind.
    #[must_use]
    pub fn kinds(&self) -> &[EventKind] {
        &self.kinds
    }

    /// Asks the dispatcher to stop delivering to this stream.
    ///
    /// Non-blocking and idempotent. Events already buffered stay readable.
    pub fn unsubscribe(&self) {
        if !self.unregistered.swap(true, Ordering::AcqRel) {
            // The router may be gone or busy; never wait for it.
            let _ = self.control_tx.try_send(ControlMsg::Unsubscribe {
                subscription_id: self.subscription_id,
            });
        }
    }

    /// Receive the next event (blocking).
    pub fn recv(&self) -> PerceptionResult<Event> {
        self.rx.recv().map_err(|_| closed())
    }

    /// Receive the next event with a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> PerceptionResult<Event> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => PerceptionError::Execution(ExecutionError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
            RecvTimeoutError::Disconnected => closed(),
        })
    }

    /// Next buffered event, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Every event buffered right now.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn closed() -> PerceptionError {
    PerceptionError::Execution(ExecutionError::Disconnected {
        path: "event_stream".to_string(),
    })
}
