//! Per-matcher worker thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use crossbeam_channel::{select, tick, Receiver, Sender};
use tracing::{debug, error, warn};

use crate::event::Event;
use crate::matcher::{MatcherStats, PatternMatcher};

use super::publisher::Counters;

pub(crate) struct MatcherWorker {
    pub matcher: PatternMatcher,
    pub rx: Receiver<Event>,
    pub feedback: Sender<Event>,
    /// Events queued for this matcher and not yet fully processed.
    pub in_flight: Arc<AtomicU64>,
    pub stats: Arc<Mutex<MatcherStats>>,
    pub counters: Arc<Counters>,
    /// Interval between window sweeps, regardless of traffic.
    pub housekeeping: Duration,
}

impl MatcherWorker {
    pub(crate) fn run(self) {
        let Self {
            mut matcher,
            rx,
            feedback,
            in_flight,
            stats,
            counters,
            housekeeping,
        } = self;
        let publish_stats = |matcher: &PatternMatcher| {
            *stats.lock().unwrap_or_else(PoisonError::into_inner) = matcher.stats();
        };

        debug!(
            target: "perception::dispatcher",
            matcher = %matcher.name(),
            "matcher worker started"
        );
        let sweep = tick(housekeeping);
        let mut closed = false;
        while !closed {
            select! {
                recv(rx) -> msg => match msg {
                    Ok(event) => {
                        match catch_unwind(AssertUnwindSafe(|| matcher.consume(&event))) {
                            Ok(outputs) => {
                                for out in outputs {
                                    counters.matcher_outputs.fetch_add(1, Ordering::Relaxed);
                                    if feedback.send(out).is_err() {
                                        warn!(
                                            target: "perception::dispatcher",
                                            matcher = %matcher.name(),
                                            "feedback queue closed; derived event lost"
                                        );
                                    }
                                }
                            }
                            Err(_) => {
                                counters.matcher_failures.fetch_add(1, Ordering::Relaxed);
                                error!(
                                    target: "perception::dispatcher",
                                    matcher = %matcher.name(),
                                    event_id = %event.id,
                                    key = %event.key,
                                    "predicate panicked; event skipped by this matcher"
                                );
                            }
                        }
                        // Outputs are queued before the event stops counting as in flight.
                        in_flight.fetch_sub(1, Ordering::AcqRel);
                        publish_stats(&matcher);
                    }
                    Err(_) => closed = true,
                },
                recv(sweep) -> _ => {
                    if matcher.expire(Utc::now()) > 0 {
                        publish_stats(&matcher);
                    }
                }
            }
        }
        debug!(
            target: "perception::dispatcher",
            matcher = %matcher.name(),
            "matcher worker stopped"
        );
    }
}
