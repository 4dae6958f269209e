//! Temporal patterns.
//!
//! A pattern is an ordered list of named stages. Each stage holds a condition
//! over incoming events, a quantifier saying how many events it binds, and
//! the contiguity with which it follows the previous stage. Patterns are
//! built fluently:
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use perception::pattern::Pattern;
//!
//! let pattern = Pattern::begin("slow")
//!     .when(|e| e.metric(MetricKind::ResponseTime).is_some_and(|v| v > 500))
//!     .times(3)
//!     .within(Duration::from_secs(10))
//!     .build()?;
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::BuildError;
use crate::event::Event;

/// Condition over a single event.
pub type Predicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Condition that may also look at the events already bound to the match.
pub type IterativePredicate = Arc<dyn Fn(&Event, &MatchContext<'_>) -> bool + Send + Sync>;

/// How a stage tests an event.
#[derive(Clone)]
pub enum Condition {
    /// Looks at the event alone.
    Simple(Predicate),
    /// Looks at the event and the partial match.
    Iterative(IterativePredicate),
    /// Rejects everything.
    Never,
}

impl Condition {
    /// Evaluates the condition.
    #[must_use]
    pub fn test(&self, event: &Event, ctx: &MatchContext<'_>) -> bool {
        match self {
            Self::Simple(p) => p(event),
            Self::Iterative(p) => p(event, ctx),
            Self::Never => false,
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Simple(_) => f.write_str("Simple(..)"),
            Self::Iterative(_) => f.write_str("Iterative(..)"),
            Self::Never => f.write_str("Never"),
        }
    }
}

/// Events already bound to a partial match, visible to iterative conditions.
#[derive(Debug, Clone, Copy)]
pub struct MatchContext<'a> {
    stages: &'a [Stage],
    bindings: &'a [Vec<Event>],
}

impl<'a> MatchContext<'a> {
    pub(crate) fn new(stages: &'a [Stage], bindings: &'a [Vec<Event>]) -> Self {
        Self { stages, bindings }
    }

    /// Events bound to the named stage so far.
    #[must_use]
    pub fn events(&self, stage: &str) -> &'a [Event] {
        self.stages
            .iter()
            .position(|s| s.name == stage)
            .and_then(|i| self.bindings.get(i))
            .map_or(&[][..], Vec::as_slice)
    }

    /// Most recently bound event.
    #[must_use]
    pub fn last(&self) -> Option<&'a Event> {
        self.bindings.iter().rev().find_map(|b| b.last())
    }

    /// Total number of bound events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bindings.iter().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How many events a stage binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quantifier {
    /// Events required before the match may move on.
    pub min: u32,
    /// Upper bound; `None` loops without limit.
    pub max: Option<u32>,
}

impl Quantifier {
    /// Exactly one event.
    pub const ONE: Self = Self {
        min: 1,
        max: Some(1),
    };

    /// True if the stage may bind no event at all.
    #[must_use]
    pub const fn is_optional(&self) -> bool {
        self.min == 0
    }

    /// True if the stage can take more than one event.
    #[must_use]
    pub const fn is_looping(&self) -> bool {
        match self.max {
            Some(max) => max > 1,
            None => true,
        }
    }

    /// True if `count` events satisfy the lower bound.
    #[must_use]
    pub const fn satisfied_by(&self, count: u32) -> bool {
        count >= self.min
    }

    /// True if the stage can bind another event after `count`.
    #[must_use]
    pub const fn has_room(&self, count: u32) -> bool {
        match self.max {
            Some(max) => count < max,
            None => true,
        }
    }
}

impl Default for Quantifier {
    fn default() -> Self {
        Self::ONE
    }
}

/// How strictly events must follow each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Contiguity {
    /// The very next event of the key must match ("next").
    Strict,
    /// Non-matching events in between are ignored ("followed by").
    #[default]
    Relaxed,
}

/// Whether a key may have several partial matches in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Every accepted event may start a new match.
    #[default]
    Concurrent,
    /// A new match only starts once the previous one is done.
    OneAtATime,
}

/// One step of a pattern.
#[derive(Debug, Clone)]
pub struct Stage {
    /// Stage name, unique within the pattern.
    pub name: String,
    /// Event test.
    pub condition: Condition,
    /// How many events the stage binds.
    pub quantifier: Quantifier,
    /// How this stage follows the previous one.
    pub linking: Contiguity,
    /// How repeated events of a looping stage follow each other.
    pub looping: Contiguity,
}

impl Stage {
    fn new(name: String, linking: Contiguity) -> Self {
        Self {
            name,
            condition: Condition::Never,
            quantifier: Quantifier::ONE,
            linking,
            looping: Contiguity::Relaxed,
        }
    }
}

/// A validated temporal pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    name: String,
    stages: Vec<Stage>,
    window: Option<Duration>,
    policy: MatchPolicy,
}

impl Pattern {
    /// Starts a pattern with its first stage.
    #[must_use]
    pub fn begin(stage: impl Into<String>) -> PatternBuilder {
        PatternBuilder {
            name: None,
            stages: vec![Stage::new(stage.into(), Contiguity::Relaxed)],
            explicit_condition: vec![false],
            window: None,
            policy: MatchPolicy::Concurrent,
        }
    }

    /// A pattern that can never match.
    #[must_use]
    pub fn blank(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: vec![Stage::new("NOPE".to_string(), Contiguity::Relaxed)],
            window: None,
            policy: MatchPolicy::Concurrent,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Maximum span between the first and last event of a match.
    #[must_use]
    pub const fn window(&self) -> Option<Duration> {
        self.window
    }

    #[must_use]
    pub const fn policy(&self) -> MatchPolicy {
        self.policy
    }

    /// True if no event can ever satisfy the first stage.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.stages
            .iter()
            .take_while(|s| s.quantifier.is_optional())
            .chain(self.stages.iter().find(|s| !s.quantifier.is_optional()))
            .all(|s| matches!(s.condition, Condition::Never))
    }

    /// True if a match positioned on `position` with `count` events there
    /// can be emitted.
    pub(crate) fn completes(&self, position: usize, count: u32) -> bool {
        self.stages
            .get(position)
            .is_some_and(|s| s.quantifier.satisfied_by(count))
            && self.stages[position + 1..]
                .iter()
                .all(|s| s.quantifier.is_optional())
    }
}

/// Fluent builder for [`Pattern`].
///
/// Condition and quantifier calls apply to the most recently added stage.
#[derive(Debug)]
pub struct PatternBuilder {
    name: Option<String>,
    stages: Vec<Stage>,
    explicit_condition: Vec<bool>,
    window: Option<Duration>,
    policy: MatchPolicy,
}

impl PatternBuilder {
    fn current(&mut self) -> &mut Stage {
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }

    fn push(mut self, name: String, linking: Contiguity) -> Self {
        self.stages.push(Stage::new(name, linking));
        self.explicit_condition.push(false);
        self
    }

    fn set_condition(mut self, condition: Condition) -> Self {
        self.current().condition = condition;
        if let Some(flag) = self.explicit_condition.last_mut() {
            *flag = true;
        }
        self
    }

    /// Names the pattern. Defaults to the first stage name.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the condition of the current stage.
    #[must_use]
    pub fn when<F>(self, predicate: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.set_condition(Condition::Simple(Arc::new(predicate)))
    }

    /// Sets a condition that can inspect the partial match.
    #[must_use]
    pub fn when_iter<F>(self, predicate: F) -> Self
    where
        F: Fn(&Event, &MatchContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.set_condition(Condition::Iterative(Arc::new(predicate)))
    }

    /// Makes the current stage reject every event.
    #[must_use]
    pub fn never(self) -> Self {
        self.set_condition(Condition::Never)
    }

    /// Appends a stage that must match the very next event.
    #[must_use]
    pub fn next(self, stage: impl Into<String>) -> Self {
        self.push(stage.into(), Contiguity::Strict)
    }

    /// Appends a stage that may be preceded by unrelated events.
    #[must_use]
    pub fn followed_by(self, stage: impl Into<String>) -> Self {
        self.push(stage.into(), Contiguity::Relaxed)
    }

    /// Lets the current stage bind nothing.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.current().quantifier.min = 0;
        self
    }

    /// One or more events.
    #[must_use]
    pub fn one_or_more(mut self) -> Self {
        self.current().quantifier = Quantifier { min: 1, max: None };
        self
    }

    /// Exactly `n` events.
    #[must_use]
    pub fn times(mut self, n: u32) -> Self {
        self.current().quantifier = Quantifier {
            min: n,
            max: Some(n),
        };
        self
    }

    /// At least `n` events.
    #[must_use]
    pub fn times_or_more(mut self, n: u32) -> Self {
        self.current().quantifier = Quantifier { min: n, max: None };
        self
    }

    /// Repeated events of the current stage must be contiguous.
    #[must_use]
    pub fn consecutive(mut self) -> Self {
        self.current().looping = Contiguity::Strict;
        self
    }

    /// Discards matches spanning more than `window`.
    #[must_use]
    pub fn within(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Allows one partial match per key at a time.
    #[must_use]
    pub fn one_match_at_a_time(mut self) -> Self {
        self.policy = MatchPolicy::OneAtATime;
        self
    }

    /// Validates and returns the pattern.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::InvalidPattern` when a stage has no condition, a
    /// stage name repeats, a quantifier is empty, every stage is optional, or
    /// the window is zero.
    pub fn build(self) -> Result<Pattern, BuildError> {
        let name = self
            .name
            .unwrap_or_else(|| self.stages[0].name.clone());
        let invalid = |reason: String| BuildError::InvalidPattern {
            pattern: name.clone(),
            reason,
        };

        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(invalid(format!("stage #{i} has an empty name")));
            }
            if self.stages[..i].iter().any(|s| s.name == stage.name) {
                return Err(invalid(format!("stage name '{}' is repeated", stage.name)));
            }
            if !self.explicit_condition[i] {
                return Err(invalid(format!("stage '{}' has no condition", stage.name)));
            }
            let q = stage.quantifier;
            if q.max == Some(0) {
                return Err(invalid(format!("stage '{}' can never bind an event", stage.name)));
            }
            if q.max.is_some_and(|max| max < q.min) {
                return Err(invalid(format!("stage '{}' has max below min", stage.name)));
            }
        }
        if self.stages.iter().all(|s| s.quantifier.is_optional()) {
            return Err(invalid("every stage is optional".to_string()));
        }
        if self.window.is_some_and(|w| w.is_zero()) {
            return Err(invalid("window must be positive".to_string()));
        }

        Ok(Pattern {
            name,
            stages: self.stages,
            window: self.window,
            policy: self.policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_sets_stage_properties() {
        let p = Pattern::begin("a")
            .when(|_| true)
            .times(3)
            .consecutive()
            .next("b")
            .when(|_| true)
            .optional()
            .followed_by("c")
            .when(|_| true)
            .one_or_more()
            .within(Duration::from_secs(5))
            .one_match_at_a_time()
            .named("abc")
            .build()
            .unwrap();

        assert_eq!(p.name(), "abc");
        let stages = p.stages();
        assert_eq!(stages.len(), 3);
        assert_eq!(stages[0].quantifier, Quantifier { min: 3, max: Some(3) });
        assert_eq!(stages[0].looping, Contiguity::Strict);
        assert_eq!(stages[1].linking, Contiguity::Strict);
        assert!(stages[1].quantifier.is_optional());
        assert_eq!(stages[2].linking, Contiguity::Relaxed);
        assert_eq!(stages[2].quantifier.max, None);
        assert_eq!(p.window(), Some(Duration::from_secs(5)));
        assert_eq!(p.policy(), MatchPolicy::OneAtATime);
    }

    #[test]
    fn stage_without_condition_is_rejected() {
        let err = Pattern::begin("a").when(|_| true).followed_by("b").build().unwrap_err();
        assert!(format!("{err}").contains("no condition"));
    }

    #[test]
    fn invalid_quantifiers_are_rejected() {
        assert!(Pattern::begin("a").when(|_| true).times(0).build().is_err());
        assert!(Pattern::begin("a").when(|_| true).optional().build().is_err());
        assert!(Pattern::begin("a")
            .when(|_| true)
            .within(Duration::ZERO)
            .build()
            .is_err());
    }

    #[test]
    fn repeated_stage_name_is_rejected() {
        let err = Pattern::begin("a")
            .when(|_| true)
            .next("a")
            .when(|_| true)
            .build()
            .unwrap_err();
        assert!(format!("{err}").contains("repeated"));
    }

    #[test]
    fn blank_pattern_is_blank() {
        let p = Pattern::blank("SEG_Blank");
        assert!(p.is_blank());
        assert_eq!(p.stages()[0].name, "NOPE");

        let p = Pattern::begin("a").when(|_| true).build().unwrap();
        assert!(!p.is_blank());
    }

    #[test]
    fn completion_requires_trailing_optionals() {
        let p = Pattern::begin("a")
            .when(|_| true)
            .times(2)
            .followed_by("b")
            .when(|_| true)
            .optional()
            .build()
            .unwrap();
        assert!(!p.completes(0, 1));
        assert!(p.completes(0, 2));
        assert!(p.completes(1, 1));
    }

    #[test]
    fn quantifier_bounds() {
        let q = Quantifier { min: 2, max: Some(4) };
        assert!(q.is_looping());
        assert!(!q.satisfied_by(1));
        assert!(q.satisfied_by(2));
        assert!(q.has_room(3));
        assert!(!q.has_room(4));
        assert!(!Quantifier::ONE.is_looping());
    }
}
