//! Dispatcher router.
//!
//! One routing worker takes events off the input queue (fed by generators
//! and external publishers) and the feedback queue (fed by matchers) and
//! fans each event out to every matcher registered for its kind and every
//! subscription interested in it. Each matcher runs on its own worker behind
//! a bounded FIFO queue, so per-key production order is preserved end to end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{
    bounded, select, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, PerceptionError, PerceptionResult};
use crate::event::{Event, EventKind};
use crate::matcher::{MatcherConfig, MatcherStats, PatternMatcher};

use super::ids::{MatcherId, SubscriptionId};
use super::publisher::{deliver, Counters, DispatcherStats, EventPublisher};
use super::stream::EventStream;
use super::worker::MatcherWorker;

/// Queue sizes and alert thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Max queued events from publishers before they block.
    pub input_capacity: usize,
    /// Per-matcher queue capacity.
    pub matcher_queue_capacity: usize,
    /// Max queued control messages.
    pub control_capacity: usize,
    /// Per-subscription stream buffer capacity.
    pub stream_capacity: usize,
    /// How long a delivery may block before a backlog alert is raised.
    pub backlog_alert_after_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            input_capacity: 4096,
            matcher_queue_capacity: 1024,
            control_capacity: 256,
            stream_capacity: 1024,
            backlog_alert_after_ms: 1000,
        }
    }
}

impl DispatcherConfig {
    /// Backlog alert threshold as a `Duration`.
    #[must_use]
    pub const fn backlog_alert_after(&self) -> Duration {
        Duration::from_millis(self.backlog_alert_after_ms)
    }
}

#[derive(Debug)]
pub(crate) enum ControlMsg {
    RegisterMatcher {
        route: MatcherRoute,
        reply: Sender<()>,
    },
    Subscribe {
        subscription_id: SubscriptionId,
        kinds: Vec<EventKind>,
        tx: Sender<Event>,
        reply: Sender<()>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Shutdown,
}

#[derive(Debug)]
pub(crate) struct MatcherRoute {
    id: MatcherId,
    name: String,
    inputs: Vec<EventKind>,
    tx: Sender<Event>,
    in_flight: Arc<AtomicU64>,
}

#[derive(Debug)]
struct SubscriptionEntry {
    kinds: Vec<EventKind>,
    tx: Sender<Event>,
}

impl SubscriptionEntry {
    fn wants(&self, kind: EventKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[derive(Debug)]
struct MatcherEntry {
    name: String,
    stats: Arc<Mutex<MatcherStats>>,
}

/// Routes events between generators, matchers and subscribers.
#[derive(Debug)]
pub struct Dispatcher {
    cfg: DispatcherConfig,
    matcher_cfg: MatcherConfig,
    control_tx: Sender<ControlMsg>,
    input_tx: Sender<Event>,
    feedback_tx: Sender<Event>,
    counters: Arc<Counters>,
    matchers: Mutex<HashMap<MatcherId, MatcherEntry>>,
    subscriptions: Arc<AtomicU64>,
    router: Mutex<Option<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

fn disconnected(path: &str) -> PerceptionError {
    PerceptionError::Execution(ExecutionError::Disconnected {
        path: path.to_string(),
    })
}

fn spawn_failed(name: String, err: &std::io::Error) -> PerceptionError {
    PerceptionError::Execution(ExecutionError::Spawn {
        name,
        message: err.to_string(),
    })
}

impl Dispatcher {
    /// Starts the routing worker.
    pub fn new(cfg: DispatcherConfig, matcher_cfg: MatcherConfig) -> PerceptionResult<Self> {
        let (control_tx, control_rx) = bounded::<ControlMsg>(cfg.control_capacity.max(1));
        let (input_tx, input_rx) = bounded::<Event>(cfg.input_capacity.max(1));
        let (feedback_tx, feedback_rx) = unbounded::<Event>();

        let counters = Arc::new(Counters::default());
        let subscriptions = Arc::new(AtomicU64::new(0));

        let router = Router {
            alert_after: cfg.backlog_alert_after(),
            counters: Arc::clone(&counters),
            subscription_count: Arc::clone(&subscriptions),
            routes: Vec::new(),
            subscriptions: HashMap::new(),
        };
        let join = thread::Builder::new()
            .name("perception-dispatcher".to_string())
            .spawn(move || router.run(&control_rx, &input_rx, &feedback_rx))
            .map_err(|e| spawn_failed("perception-dispatcher".to_string(), &e))?;

        info!(
            target: "perception::dispatcher",
            input_capacity = cfg.input_capacity,
            matcher_queue_capacity = cfg.matcher_queue_capacity,
            backlog_alert_after_ms = cfg.backlog_alert_after_ms,
            "dispatcher started"
        );

        Ok(Self {
            cfg,
            matcher_cfg,
            control_tx,
            input_tx,
            feedback_tx,
            counters,
            matchers: Mutex::new(HashMap::new()),
            subscriptions,
            router: Mutex::new(Some(join)),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Handle for feeding events in.
    #[must_use]
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher::new(
            self.input_tx.clone(),
            self.cfg.backlog_alert_after(),
            Arc::clone(&self.counters),
        )
    }

    /// Queues one event for routing.
    pub fn publish(&self, event: Event) -> PerceptionResult<()> {
        self.publisher().publish(event)
    }

    /// Starts a worker for `matcher` and routes its input kinds to it.
    ///
    /// Events already routed before registration are not replayed.
    pub fn register_matcher(&self, matcher: PatternMatcher) -> PerceptionResult<MatcherId> {
        if self.closed.load(Ordering::Acquire) {
            return Err(disconnected("dispatcher_control"));
        }

        let id = MatcherId::new();
        let name = matcher.name().to_string();
        let inputs = matcher.inputs().to_vec();
        let matcher = matcher.with_config(&self.matcher_cfg);
        let (tx, rx) = bounded::<Event>(self.cfg.matcher_queue_capacity.max(1));
        let in_flight = Arc::new(AtomicU64::new(0));
        let stats = Arc::new(Mutex::new(matcher.stats()));

        let worker = MatcherWorker {
            matcher,
            rx,
            feedback: self.feedback_tx.clone(),
            in_flight: Arc::clone(&in_flight),
            stats: Arc::clone(&stats),
            counters: Arc::clone(&self.counters),
            housekeeping: Duration::from_millis(self.matcher_cfg.housekeeping_interval_ms.max(1)),
        };
        let thread_name = format!("perception-match-{name}");
        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || worker.run())
            .map_err(|e| spawn_failed(thread_name, &e))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(join);

        let route = MatcherRoute {
            id,
            name: name.clone(),
            inputs: inputs.clone(),
            tx,
            in_flight,
        };
        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.control_tx
            .send(ControlMsg::RegisterMatcher { route, reply: reply_tx })
            .map_err(|_| disconnected("dispatcher_control"))?;
        reply_rx.recv().map_err(|_| disconnected("dispatcher_control"))?;

        self.matchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, MatcherEntry { name: name.clone(), stats });

        info!(
            target: "perception::dispatcher",
            matcher = %name,
            id = %id,
            inputs = ?inputs,
            "matcher registered"
        );
        Ok(id)
    }

    /// Subscribes to events of the given kinds; an empty slice means all.
    pub fn subscribe(&self, kinds: &[EventKind]) -> PerceptionResult<EventStream> {
        if self.closed.load(Ordering::Acquire) {
            return Err(disconnected("dispatcher_control"));
        }

        let subscription_id = SubscriptionId::new();
        let (tx, rx) = bounded::<Event>(self.cfg.stream_capacity.max(1));
        let stream = EventStream::new(subscription_id, kinds.to_vec(), rx, self.control_tx.clone());

        let (reply_tx, reply_rx) = bounded::<()>(1);
        self.control_tx
            .send(ControlMsg::Subscribe {
                subscription_id,
                kinds: kinds.to_vec(),
                tx,
                reply: reply_tx,
            })
            .map_err(|_| disconnected("dispatcher_control"))?;
        reply_rx.recv().map_err(|_| disconnected("dispatcher_control"))?;

        Ok(stream)
    }

    /// Names of the registered matchers.
    #[must_use]
    pub fn matchers(&self) -> Vec<(MatcherId, String)> {
        self.matchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, e)| (*id, e.name.clone()))
            .collect()
    }

    /// Latest counters reported by one matcher.
    #[must_use]
    pub fn matcher_stats(&self, id: MatcherId) -> Option<MatcherStats> {
        let matchers = self.matchers.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = matchers.get(&id)?;
        let stats = *entry.stats.lock().unwrap_or_else(PoisonError::into_inner);
        Some(stats)
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        let matchers = self.matchers.lock().unwrap_or_else(PoisonError::into_inner).len();
        let subscriptions =
            usize::try_from(self.subscriptions.load(Ordering::Relaxed)).unwrap_or(usize::MAX);
        self.counters.snapshot(matchers, subscriptions)
    }

    /// True once `shutdown` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drains queued events through every matcher, then stops all workers.
    ///
    /// Idempotent. Publishing after shutdown fails with `Disconnected`.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.control_tx.send(ControlMsg::Shutdown).is_err() {
            warn!(target: "perception::dispatcher", "router already gone");
        }

        let router = self.router.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = router {
            if handle.join().is_err() {
                warn!(target: "perception::dispatcher", "router thread panicked");
            }
        }

        // Matcher queues were closed by the router; workers exit once empty.
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            if handle.join().is_err() {
                warn!(target: "perception::dispatcher", "matcher worker panicked");
            }
        }

        let stats = self.stats();
        info!(
            target: "perception::dispatcher",
            routed = stats.routed,
            matcher_outputs = stats.matcher_outputs,
            backlog_alerts = stats.backlog_alerts,
            matcher_failures = stats.matcher_failures,
            "dispatcher stopped"
        );
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Router {
    alert_after: Duration,
    counters: Arc<Counters>,
    subscription_count: Arc<AtomicU64>,
    routes: Vec<MatcherRoute>,
    subscriptions: HashMap<SubscriptionId, SubscriptionEntry>,
}

impl Router {
    fn run(
        mut self,
        control_rx: &Receiver<ControlMsg>,
        input_rx: &Receiver<Event>,
        feedback_rx: &Receiver<Event>,
    ) {
        let mut stopping = false;
        while !stopping {
            select! {
                recv(control_rx) -> msg => match msg {
                    Ok(ControlMsg::Shutdown) | Err(_) => stopping = true,
                    Ok(msg) => self.apply(msg),
                },
                recv(feedback_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.route(&event);
                    }
                }
                recv(input_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.route(&event);
                    }
                }
            }
        }
        self.drain(control_rx, input_rx, feedback_rx);
    }

    fn apply(&mut self, msg: ControlMsg) {
        match msg {
            ControlMsg::RegisterMatcher { route, reply } => {
                self.routes.push(route);
                let _ = reply.send(());
            }
            ControlMsg::Subscribe {
                subscription_id,
                kinds,
                tx,
                reply,
            } => {
                self.subscriptions
                    .insert(subscription_id, SubscriptionEntry { kinds, tx });
                self.sync_subscription_count();
                let _ = reply.send(());
            }
            ControlMsg::Unsubscribe { subscription_id } => {
                if self.subscriptions.remove(&subscription_id).is_some() {
                    debug!(
                        target: "perception::dispatcher",
                        subscription = %subscription_id,
                        "unsubscribed"
                    );
                }
                self.sync_subscription_count();
            }
            ControlMsg::Shutdown => {}
        }
    }

    fn sync_subscription_count(&self) {
        self.subscription_count
            .store(self.subscriptions.len() as u64, Ordering::Relaxed);
    }

    fn route(&mut self, event: &Event) {
        self.counters.routed.fetch_add(1, Ordering::Relaxed);
        let kind = event.kind();

        let mut gone = Vec::new();
        for (id, sub) in &self.subscriptions {
            if !sub.wants(kind) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.counters.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "perception::dispatcher",
                        subscription = %id,
                        event_id = %event.id,
                        "subscriber too slow; event not delivered to it"
                    );
                }
                Err(TrySendError::Disconnected(_)) => gone.push(*id),
            }
        }
        if !gone.is_empty() {
            for id in gone {
                self.subscriptions.remove(&id);
            }
            self.sync_subscription_count();
        }

        let alert_after = self.alert_after;
        let counters = Arc::clone(&self.counters);
        self.routes.retain(|route| {
            if !route.inputs.contains(&kind) {
                return true;
            }
            route.in_flight.fetch_add(1, Ordering::AcqRel);
            match deliver(&route.tx, event.clone(), &route.name, alert_after, &counters) {
                Ok(()) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(err) => {
                    route.in_flight.fetch_sub(1, Ordering::AcqRel);
                    warn!(
                        target: "perception::dispatcher",
                        matcher = %route.name,
                        id = %route.id,
                        error = %err,
                        "matcher worker gone; route removed"
                    );
                    false
                }
            }
        });
    }

    fn in_flight(&self) -> u64 {
        self.routes
            .iter()
            .map(|r| r.in_flight.load(Ordering::Acquire))
            .sum()
    }

    /// Routes everything still queued, including derived events produced
    /// while draining, until every matcher is idle.
    fn drain(
        mut self,
        control_rx: &Receiver<ControlMsg>,
        input_rx: &Receiver<Event>,
        feedback_rx: &Receiver<Event>,
    ) {
        while let Ok(event) = input_rx.try_recv() {
            self.route(&event);
        }

        loop {
            match feedback_rx.recv_timeout(Duration::from_millis(10)) {
                Ok(event) => self.route(&event),
                Err(RecvTimeoutError::Timeout) => {
                    if self.in_flight() == 0 && feedback_rx.is_empty() {
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Answer pending registrations so callers do not hang.
        while let Ok(msg) = control_rx.try_recv() {
            match msg {
                ControlMsg::RegisterMatcher { reply, .. }
                | ControlMsg::Subscribe { reply, .. } => drop(reply),
                ControlMsg::Unsubscribe { .. } | ControlMsg::Shutdown => {}
            }
        }

        debug!(
            target: "perception::dispatcher",
            matchers = self.routes.len(),
            subscriptions = self.subscriptions.len(),
            "router drained"
        );
        self.routes.clear();
        self.subscriptions.clear();
        self.sync_subscription_count();
    }
}
