//! Pattern matchers: the simple and complex event generators.
//!
//! A [`PatternMatcher`] owns the partial matches of one [`Pattern`], grouped
//! by correlation key. Feeding it events with [`PatternMatcher::consume`]
//! advances those matches; completed matches go through the selection
//! function and come out as derived events of the matcher's output kind.
//!
//! The matcher is single-owner state. The dispatcher runs each matcher on a
//! dedicated worker, so nothing here is shared across threads.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::event::{CorrelationKey, DerivedEvent, Event, EventId, EventKind};
use crate::pattern::{Contiguity, MatchContext, MatchPolicy, Pattern};

/// Turns a completed match into a derived event, or nothing.
pub type SelectFn = Arc<dyn Fn(&CompletedMatch) -> Option<DerivedEvent> + Send + Sync>;

/// Regroups events before matching. `None` drops the event.
pub type KeySelector = Arc<dyn Fn(&Event) -> Option<CorrelationKey> + Send + Sync>;

/// Runtime limits of a matcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Partial matches kept per key; the oldest is evicted beyond this.
    /// Zero means unbounded.
    pub max_open_matches: usize,
    /// How often idle matches are checked against the window.
    pub housekeeping_interval_ms: u64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            max_open_matches: 256,
            housekeeping_interval_ms: 250,
        }
    }
}

/// A match whose every stage is satisfied.
#[derive(Debug, Clone)]
pub struct CompletedMatch {
    /// Matcher that produced it.
    pub generator: String,
    /// Pattern name.
    pub pattern: String,
    /// Key the match was grouped by.
    pub key: CorrelationKey,
    /// Timestamp of the first bound event.
    pub started_at: DateTime<Utc>,
    /// Timestamp of the last bound event.
    pub completed_at: DateTime<Utc>,
    /// Bound events per stage, in stage order.
    pub stages: Vec<(String, Vec<Event>)>,
}

impl CompletedMatch {
    /// Events bound to a stage. Empty for skipped optional stages.
    #[must_use]
    pub fn events(&self, stage: &str) -> &[Event] {
        self.stages
            .iter()
            .find(|(name, _)| name == stage)
            .map_or(&[][..], |(_, events)| events.as_slice())
    }

    /// Every bound event in binding order.
    pub fn all(&self) -> impl Iterator<Item = &Event> {
        self.stages.iter().flat_map(|(_, events)| events.iter())
    }

    /// Ids of every bound event.
    #[must_use]
    pub fn source_ids(&self) -> Vec<EventId> {
        self.all().map(|e| e.id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.iter().map(|(_, e)| e.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counters of one matcher.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatcherStats {
    pub consumed: u64,
    pub opened: u64,
    pub completed: u64,
    pub emitted: u64,
    pub expired: u64,
    pub discarded: u64,
    pub evicted: u64,
    pub select_failures: u64,
}

#[derive(Debug, Clone)]
struct PartialMatch {
    started_at: DateTime<Utc>,
    position: usize,
    count: u32,
    /// The current stage stopped looping after a gap in a consecutive run.
    frozen: bool,
    bindings: Vec<Vec<Event>>,
}

enum Step {
    Kept(PartialMatch),
    Advanced(PartialMatch),
    Expired,
    Discarded,
}

/// Stateful matcher for one pattern.
pub struct PatternMatcher {
    name: String,
    output: EventKind,
    inputs: Vec<EventKind>,
    pattern: Pattern,
    window: Option<TimeDelta>,
    select: SelectFn,
    key_selector: Option<KeySelector>,
    max_open_matches: usize,
    open: HashMap<CorrelationKey, Vec<PartialMatch>>,
    stats: MatcherStats,
}

impl fmt::Debug for PatternMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternMatcher")
            .field("name", &self.name)
            .field("output", &self.output)
            .field("inputs", &self.inputs)
            .field("pattern", &self.pattern.name())
            .field("open_keys", &self.open.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl PatternMatcher {
    fn with_output<F>(
        name: impl Into<String>,
        output: EventKind,
        inputs: Vec<EventKind>,
        pattern: Pattern,
        select: F,
    ) -> Self
    where
        F: Fn(&CompletedMatch) -> Option<DerivedEvent> + Send + Sync + 'static,
    {
        let window = pattern.window().and_then(|w| TimeDelta::from_std(w).ok());
        Self {
            name: name.into(),
            output,
            inputs,
            pattern,
            window,
            select: Arc::new(select),
            key_selector: None,
            max_open_matches: MatcherConfig::default().max_open_matches,
            open: HashMap::new(),
            stats: MatcherStats::default(),
        }
    }

    /// A matcher over primitive events emitting simple events.
    #[must_use]
    pub fn simple<F>(name: impl Into<String>, pattern: Pattern, select: F) -> Self
    where
        F: Fn(&CompletedMatch) -> Option<DerivedEvent> + Send + Sync + 'static,
    {
        Self::with_output(name, EventKind::Simple, vec![EventKind::Primitive], pattern, select)
    }

    /// A matcher over simple events emitting complex events.
    #[must_use]
    pub fn complex<F>(name: impl Into<String>, pattern: Pattern, select: F) -> Self
    where
        F: Fn(&CompletedMatch) -> Option<DerivedEvent> + Send + Sync + 'static,
    {
        Self::with_output(name, EventKind::Complex, vec![EventKind::Simple], pattern, select)
    }

    /// A simple matcher that never opens a match.
    #[must_use]
    pub fn blank(name: impl Into<String>) -> Self {
        let name = name.into();
        let pattern = Pattern::blank(name.clone());
        Self::simple(name, pattern, |_| None)
    }

    /// Replaces the consumed event kinds.
    #[must_use]
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = EventKind>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self.inputs.sort_unstable();
        self.inputs.dedup();
        self
    }

    /// Groups events by a custom key instead of their own.
    #[must_use]
    pub fn with_key_selector<F>(mut self, selector: F) -> Self
    where
        F: Fn(&Event) -> Option<CorrelationKey> + Send + Sync + 'static,
    {
        self.key_selector = Some(Arc::new(selector));
        self
    }

    /// Applies runtime limits.
    #[must_use]
    pub fn with_config(mut self, config: &MatcherConfig) -> Self {
        self.max_open_matches = config.max_open_matches;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind of the events this matcher emits.
    #[must_use]
    pub const fn output_kind(&self) -> EventKind {
        self.output
    }

    /// Kinds this matcher consumes.
    #[must_use]
    pub fn inputs(&self) -> &[EventKind] {
        &self.inputs
    }

    /// True if events of `kind` are fed to this matcher.
    #[must_use]
    pub fn accepts(&self, kind: EventKind) -> bool {
        self.inputs.contains(&kind)
    }

    #[must_use]
    pub const fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    #[must_use]
    pub const fn stats(&self) -> MatcherStats {
        self.stats
    }

    /// Partial matches currently in flight across all keys.
    #[must_use]
    pub fn open_matches(&self) -> usize {
        self.open.values().map(Vec::len).sum()
    }

    /// Feeds one event and returns the derived events it completed.
    pub fn consume(&mut self, event: &Event) -> Vec<Event> {
        if !self.accepts(event.kind()) {
            return Vec::new();
        }
        let key = match &self.key_selector {
            Some(selector) => match selector(event) {
                Some(key) => key,
                None => return Vec::new(),
            },
            None => event.key.clone(),
        };
        self.stats.consumed += 1;
        if self.pattern.is_blank() {
            return Vec::new();
        }

        let mut emitted = Vec::new();
        let previous = self.open.remove(&key).unwrap_or_default();
        let mut kept = Vec::with_capacity(previous.len() + 1);
        let mut consumed = false;

        for m in previous {
            match self.step(m, event) {
                Step::Kept(m) => kept.push(m),
                Step::Advanced(m) => {
                    consumed = true;
                    self.settle(m, &key, &mut kept, &mut emitted);
                }
                Step::Expired => self.stats.expired += 1,
                Step::Discarded => self.stats.discarded += 1,
            }
        }

        let may_open = match self.pattern.policy() {
            MatchPolicy::Concurrent => true,
            MatchPolicy::OneAtATime => kept.is_empty() && !consumed,
        };
        if may_open {
            if let Some(m) = self.open_with(event) {
                self.stats.opened += 1;
                self.settle(m, &key, &mut kept, &mut emitted);
            }
        }

        if self.max_open_matches > 0 && kept.len() > self.max_open_matches {
            let excess = kept.len() - self.max_open_matches;
            kept.drain(..excess);
            self.stats.evicted += excess as u64;
            warn!(
                target: "perception::matcher",
                matcher = %self.name,
                key = %key,
                evicted = excess,
                limit = self.max_open_matches,
                "too many open matches; evicted oldest"
            );
        }

        if !kept.is_empty() {
            self.open.insert(key, kept);
        }
        emitted
    }

    /// Retires matches whose window has elapsed at `now`. Returns how many.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let Some(window) = self.window else {
            return 0;
        };
        let mut expired = 0;
        self.open.retain(|_, matches| {
            let before = matches.len();
            matches.retain(|m| now - m.started_at <= window);
            expired += before - matches.len();
            !matches.is_empty()
        });
        if expired > 0 {
            self.stats.expired += expired as u64;
            debug!(
                target: "perception::matcher",
                matcher = %self.name,
                expired,
                "expired idle matches"
            );
        }
        expired
    }

    /// Drops every partial match.
    pub fn reset(&mut self) {
        self.open.clear();
    }

    fn step(&self, mut m: PartialMatch, event: &Event) -> Step {
        if let Some(window) = self.window {
            if event.timestamp - m.started_at > window {
                return Step::Expired;
            }
        }

        let stages = self.pattern.stages();
        let current = &stages[m.position];

        if current.quantifier.satisfied_by(m.count) {
            if let Some(next) = self.first_accepting(m.position + 1, event, &m.bindings) {
                m.bindings[next].push(event.clone());
                m.position = next;
                m.count = 1;
                m.frozen = false;
                return Step::Advanced(m);
            }
        }

        let ctx = MatchContext::new(stages, &m.bindings);
        if !m.frozen
            && current.quantifier.has_room(m.count)
            && current.condition.test(event, &ctx)
        {
            m.bindings[m.position].push(event.clone());
            m.count += 1;
            return Step::Advanced(m);
        }

        // Neither the next stage nor the current one took the event: a gap.
        if !current.quantifier.satisfied_by(m.count) {
            return if current.looping == Contiguity::Strict {
                Step::Discarded
            } else {
                Step::Kept(m)
            };
        }
        let next_strict = stages
            .get(m.position + 1)
            .is_some_and(|s| s.linking == Contiguity::Strict);
        if next_strict {
            return Step::Discarded;
        }
        if current.looping == Contiguity::Strict {
            m.frozen = true;
        }
        Step::Kept(m)
    }

    /// First stage from `from` that accepts `event`, skipping optional ones.
    fn first_accepting(
        &self,
        from: usize,
        event: &Event,
        bindings: &[Vec<Event>],
    ) -> Option<usize> {
        let stages = self.pattern.stages();
        let ctx = MatchContext::new(stages, bindings);
        for (i, stage) in stages.iter().enumerate().skip(from) {
            if stage.condition.test(event, &ctx) {
                return Some(i);
            }
            if !stage.quantifier.is_optional() {
                return None;
            }
        }
        None
    }

    fn open_with(&self, event: &Event) -> Option<PartialMatch> {
        let mut bindings = vec![Vec::new(); self.pattern.stages().len()];
        let position = self.first_accepting(0, event, &bindings)?;
        bindings[position].push(event.clone());
        Some(PartialMatch {
            started_at: event.timestamp,
            position,
            count: 1,
            frozen: false,
            bindings,
        })
    }

    fn settle(
        &mut self,
        m: PartialMatch,
        key: &CorrelationKey,
        kept: &mut Vec<PartialMatch>,
        emitted: &mut Vec<Event>,
    ) {
        if !self.pattern.completes(m.position, m.count) {
            kept.push(m);
            return;
        }
        self.stats.completed += 1;
        if let Some(event) = self.finish(m, key) {
            self.stats.emitted += 1;
            emitted.push(event);
        }
    }

    fn finish(&mut self, m: PartialMatch, key: &CorrelationKey) -> Option<Event> {
        let completed_at = m
            .bindings
            .iter()
            .rev()
            .find_map(|b| b.last())
            .map_or(m.started_at, |e| e.timestamp);
        let completed = CompletedMatch {
            generator: self.name.clone(),
            pattern: self.pattern.name().to_string(),
            key: key.clone(),
            started_at: m.started_at,
            completed_at,
            stages: self
                .pattern
                .stages()
                .iter()
                .map(|s| s.name.clone())
                .zip(m.bindings)
                .collect(),
        };

        let selected = match catch_unwind(AssertUnwindSafe(|| (self.select)(&completed))) {
            Ok(selected) => selected?,
            Err(_) => {
                self.stats.select_failures += 1;
                warn!(
                    target: "perception::matcher",
                    matcher = %self.name,
                    key = %key,
                    "selection function panicked; match dropped"
                );
                return None;
            }
        };

        let mut derived = selected;
        if derived.sources.is_empty() {
            derived.sources = completed.source_ids();
        }
        debug!(
            target: "perception::matcher",
            matcher = %self.name,
            key = %key,
            label = %derived.label,
            events = completed.len(),
            "pattern matched"
        );
        Event::derived(self.output, completed.key, completed_at, derived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{MetricKind, PrimitiveEvent};
    use crate::graph::ResourceType;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn rt(name: &str, value: i64, at_ms: i64) -> Event {
        Event::primitive_at(
            PrimitiveEvent {
                resource_name: name.to_string(),
                resource_type: ResourceType::Co,
                score: 0,
                metric: MetricKind::ResponseTime,
                value,
            },
            t0() + TimeDelta::milliseconds(at_ms),
        )
    }

    fn high(threshold: i64) -> impl Fn(&Event) -> bool + Send + Sync + 'static {
        move |e| e.metric(MetricKind::ResponseTime).is_some_and(|v| v > threshold)
    }

    fn label(
        label: &'static str,
    ) -> impl Fn(&CompletedMatch) -> Option<DerivedEvent> + Send + Sync {
        move |m| Some(DerivedEvent::new(m.generator.clone(), label))
    }

    fn feed(m: &mut PatternMatcher, events: &[Event]) -> Vec<Event> {
        events.iter().flat_map(|e| m.consume(e)).collect()
    }

    #[test]
    fn blank_matcher_never_emits() {
        let mut m = PatternMatcher::blank("SEG_Blank");
        let events: Vec<Event> = (0..100).map(|i| rt("co-1", i * 10, i)).collect();
        assert!(feed(&mut m, &events).is_empty());
        assert_eq!(m.open_matches(), 0);
        assert_eq!(m.stats().opened, 0);
    }

    #[test]
    fn completes_within_window_emits_once() {
        let pattern = Pattern::begin("high")
            .when(high(500))
            .times(3)
            .within(Duration::from_secs(10))
            .one_match_at_a_time()
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("high_rt"));

        let out = feed(&mut m, &[rt("co-1", 600, 0), rt("co-1", 700, 1000), rt("co-1", 800, 2000)]);
        assert_eq!(out.len(), 1);
        let ev = &out[0];
        assert_eq!(ev.kind(), EventKind::Simple);
        assert_eq!(ev.key, CorrelationKey::new(ResourceType::Co, "co-1"));
        assert_eq!(ev.timestamp, t0() + TimeDelta::milliseconds(2000));
        assert_eq!(ev.as_derived().unwrap().sources.len(), 3);
        assert_eq!(m.open_matches(), 0);
    }

    #[test]
    fn window_elapsed_discards_match() {
        let pattern = Pattern::begin("high")
            .when(high(500))
            .times(2)
            .within(Duration::from_secs(1))
            .one_match_at_a_time()
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("high_rt"));

        assert!(m.consume(&rt("co-1", 600, 0)).is_empty());
        // Second event lands after the window: old match expires, a new one opens.
        assert!(m.consume(&rt("co-1", 600, 1500)).is_empty());
        assert_eq!(m.stats().expired, 1);
        assert_eq!(m.open_matches(), 1);
    }

    #[test]
    fn expire_retires_idle_matches() {
        let pattern = Pattern::begin("high")
            .when(high(500))
            .times(2)
            .within(Duration::from_secs(1))
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("x"));
        m.consume(&rt("co-1", 600, 0));
        m.consume(&rt("co-2", 600, 0));
        assert_eq!(m.expire(t0() + TimeDelta::milliseconds(500)), 0);
        assert_eq!(m.expire(t0() + TimeDelta::milliseconds(1500)), 2);
        assert_eq!(m.open_matches(), 0);
    }

    #[test]
    fn keys_are_matched_independently() {
        let pattern = Pattern::begin("high").when(high(500)).times(2).build().unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("x"))
            .with_config(&MatcherConfig::default());

        let out = feed(&mut m, &[rt("co-1", 600, 0), rt("co-2", 600, 10), rt("co-2", 600, 20)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key.resource_name, "co-2");
    }

    #[test]
    fn strict_next_discards_on_gap() {
        let pattern = Pattern::begin("a")
            .when(high(500))
            .next("b")
            .when(high(900))
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("x"));

        let readings = [rt("co-1", 600, 0), rt("co-1", 100, 1), rt("co-1", 950, 2)];
        assert!(feed(&mut m, &readings).is_empty());
        assert!(m.stats().discarded >= 1);

        m.reset();
        let out = feed(&mut m, &[rt("co-1", 600, 10), rt("co-1", 950, 11)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn strict_next_after_loop_discards_on_gap() {
        let pattern = Pattern::begin("a")
            .when(|e| e.metric(MetricKind::ResponseTime) == Some(1))
            .one_or_more()
            .next("b")
            .when(|e| e.metric(MetricKind::ResponseTime) == Some(2))
            .one_match_at_a_time()
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("ab"));

        assert!(feed(&mut m, &[rt("co-1", 1, 0), rt("co-1", 7, 1), rt("co-1", 2, 2)]).is_empty());
        assert_eq!(m.stats().discarded, 1);
        assert_eq!(m.open_matches(), 0);

        let out = feed(&mut m, &[rt("co-1", 1, 10), rt("co-1", 1, 11), rt("co-1", 2, 12)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_derived().unwrap().sources.len(), 3);
    }

    #[test]
    fn consecutive_loop_stops_growing_after_gap() {
        let pattern = Pattern::begin("a")
            .when(|e| e.metric(MetricKind::ResponseTime) == Some(1))
            .one_or_more()
            .consecutive()
            .followed_by("b")
            .when(|e| e.metric(MetricKind::ResponseTime) == Some(2))
            .one_match_at_a_time()
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, |c: &CompletedMatch| {
            Some(DerivedEvent::new("seg", format!("a={}", c.events("a").len())))
        });

        let out = feed(
            &mut m,
            &[
                rt("co-1", 1, 0),
                rt("co-1", 1, 1),
                rt("co-1", 7, 2),
                rt("co-1", 1, 3),
                rt("co-1", 2, 4),
            ],
        );
        assert_eq!(out.len(), 1);
        assert!(out[0].has_label("a=2"));
    }

    #[test]
    fn panicking_predicate_surfaces_from_consume() {
        let pattern = Pattern::begin("boom")
            .when(|e| {
                assert!(e.metric(MetricKind::ResponseTime) != Some(13), "unlucky reading");
                true
            })
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("x"));

        let result = catch_unwind(AssertUnwindSafe(|| m.consume(&rt("co-1", 13, 0))));
        assert!(result.is_err());

        // The matcher stays usable for later events.
        assert_eq!(m.consume(&rt("co-1", 5, 1)).len(), 1);
    }

    #[test]
    fn followed_by_skips_unrelated_events() {
        let pattern = Pattern::begin("a")
            .when(|e| e.metric(MetricKind::ResponseTime) == Some(1))
            .followed_by("b")
            .when(|e| e.metric(MetricKind::ResponseTime) == Some(2))
            .one_match_at_a_time()
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("x"));
        let out = feed(
            &mut m,
            &[rt("co-1", 1, 0), rt("co-1", 7, 1), rt("co-1", 7, 2), rt("co-1", 2, 3)],
        );
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn optional_stage_can_be_skipped() {
        let is = |v: i64| move |e: &Event| e.metric(MetricKind::ResponseTime) == Some(v);
        let pattern = Pattern::begin("a")
            .when(is(1))
            .followed_by("b")
            .when(is(2))
            .optional()
            .followed_by("c")
            .when(is(3))
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, |c: &CompletedMatch| {
            Some(DerivedEvent::new("seg", format!("b={}", c.events("b").len())))
        });

        let out = feed(&mut m, &[rt("co-1", 1, 0), rt("co-1", 3, 1)]);
        assert_eq!(out.len(), 1);
        assert!(out[0].has_label("b=0"));

        let out = feed(&mut m, &[rt("co-1", 1, 2), rt("co-1", 2, 3), rt("co-1", 3, 4)]);
        assert_eq!(out.len(), 1);
        assert!(out[0].has_label("b=1"));
    }

    #[test]
    fn iterative_condition_sees_previous_events() {
        let pattern = Pattern::begin("first")
            .when(|_| true)
            .followed_by("rising")
            .when_iter(|e, ctx| {
                let prev = ctx.last().and_then(|p| p.metric(MetricKind::ResponseTime));
                matches!((prev, e.metric(MetricKind::ResponseTime)), (Some(p), Some(v)) if v > p)
            })
            .times(2)
            .consecutive()
            .one_match_at_a_time()
            .build()
            .unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("rising"));
        let out = feed(&mut m, &[rt("co-1", 10, 0), rt("co-1", 20, 1), rt("co-1", 30, 2)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn concurrent_policy_opens_overlapping_matches() {
        let pattern = Pattern::begin("high").when(high(500)).times(2).build().unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, label("x"));
        let out = feed(&mut m, &[rt("co-1", 600, 0), rt("co-1", 600, 1), rt("co-1", 600, 2)]);
        // (0,1) and (1,2) both complete.
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn select_returning_none_emits_nothing() {
        let pattern = Pattern::begin("high").when(high(500)).build().unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, |_| None);
        assert!(m.consume(&rt("co-1", 600, 0)).is_empty());
        assert_eq!(m.stats().completed, 1);
        assert_eq!(m.stats().emitted, 0);
    }

    #[test]
    fn panicking_select_is_contained() {
        let pattern = Pattern::begin("high").when(high(500)).build().unwrap();
        let mut m = PatternMatcher::simple("seg", pattern, |_| panic!("bad select"));
        assert!(m.consume(&rt("co-1", 600, 0)).is_empty());
        assert_eq!(m.stats().select_failures, 1);
        assert!(m.consume(&rt("co-1", 600, 1)).is_empty());
    }

    #[test]
    fn open_matches_are_bounded_per_key() {
        let pattern = Pattern::begin("high").when(high(500)).times(1000).build().unwrap();
        let config = MatcherConfig {
            max_open_matches: 4,
            ..MatcherConfig::default()
        };
        let mut m = PatternMatcher::simple("seg", pattern, label("x")).with_config(&config);
        let events: Vec<Event> = (0..10).map(|i| rt("co-1", 600, i)).collect();
        feed(&mut m, &events);
        assert_eq!(m.open_matches(), 4);
        assert_eq!(m.stats().evicted, 6);
    }

    #[test]
    fn complex_matcher_ignores_primitive_events() {
        let pattern = Pattern::begin("s")
            .when(|e| e.has_label("high_rt"))
            .times(2)
            .build()
            .unwrap();
        let mut m = PatternMatcher::complex("ceg", pattern, label("sustained"));
        assert!(!m.accepts(EventKind::Primitive));
        assert!(m.consume(&rt("co-1", 600, 0)).is_empty());
        assert_eq!(m.stats().consumed, 0);

        let key = CorrelationKey::new(ResourceType::Co, "co-1");
        let simple = |ms| {
            Event::derived(
                EventKind::Simple,
                key.clone(),
                t0() + TimeDelta::milliseconds(ms),
                DerivedEvent::new("seg", "high_rt"),
            )
            .unwrap()
        };
        let out = feed(&mut m, &[simple(0), simple(1)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), EventKind::Complex);
    }

    #[test]
    fn key_selector_regroups_events() {
        let pattern = Pattern::begin("high").when(high(500)).times(2).build().unwrap();
        let tier = CorrelationKey::new(ResourceType::Tier, "front");
        let selector_key = tier.clone();
        let mut m = PatternMatcher::simple("seg", pattern, label("x"))
            .with_key_selector(move |_| Some(selector_key.clone()));
        let out = feed(&mut m, &[rt("co-1", 600, 0), rt("co-2", 600, 1)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].key, tier);
    }
}
