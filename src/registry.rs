//! Catalogue of generator kinds.
//!
//! The registry turns validated [`GeneratorDefinition`]s into primitive
//! generators and pattern matchers. Built-in kinds are registered by
//! [`GeneratorRegistry::with_builtins`]; applications may add their own.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::config::{GeneratorCategory, GeneratorDefinition, Param};
use crate::error::BuildError;
use crate::event::{AttributeValue, DerivedEvent, Event, MetricKind};
use crate::generator::{PrimitiveEventGenerator, PrimitiveMapper};
use crate::graph::ResourceType;
use crate::matcher::{CompletedMatch, PatternMatcher};
use crate::pattern::Pattern;

/// Label of events emitted by `SEG_Co_HighResponseTime`.
pub const HIGH_RESPONSE_TIME: &str = "high_response_time";
/// Label of events emitted by `SEG_Vm_HighCpu`.
pub const HIGH_CPU: &str = "high_cpu";
/// Label of events emitted by `CEG_Co_SustainedHighResponseTime`.
pub const SUSTAINED_HIGH_RESPONSE_TIME: &str = "sustained_high_response_time";

/// Builds a matcher from a generator name and its parameters.
pub type MatcherFactory =
    Arc<dyn Fn(&str, &[Param]) -> Result<PatternMatcher, BuildError> + Send + Sync>;

/// Something built from one definition.
#[derive(Debug)]
pub enum BuiltGenerator {
    /// A scheduled primitive generator.
    Primitive(PrimitiveEventGenerator),
    /// A simple or complex matcher.
    Matcher(PatternMatcher),
}

/// Result of building a whole definition list.
#[derive(Debug, Default)]
pub struct BuildOutcome {
    /// Primitive generators, in definition order.
    pub primitives: Vec<PrimitiveEventGenerator>,
    /// Matchers, in definition order.
    pub matchers: Vec<PatternMatcher>,
    /// Definitions that could not be built.
    pub errors: Vec<BuildError>,
}

/// Maps declared type names to constructors.
#[derive(Clone, Default)]
pub struct GeneratorRegistry {
    primitives: HashMap<String, PrimitiveMapper>,
    simples: HashMap<String, MatcherFactory>,
    complexes: HashMap<String, MatcherFactory>,
}

impl fmt::Debug for GeneratorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut simples: Vec<_> = self.simples.keys().collect();
        simples.sort();
        let mut complexes: Vec<_> = self.complexes.keys().collect();
        complexes.sort();
        f.debug_struct("GeneratorRegistry")
            .field("primitives", &self.primitives.len())
            .field("simples", &simples)
            .field("complexes", &complexes)
            .finish()
    }
}

fn key(type_name: &str) -> String {
    type_name.trim().to_ascii_lowercase()
}

impl GeneratorRegistry {
    /// An empty registry. Built-in primitive mappers are still resolved.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in simple and complex kind.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_simple("SEG_Blank", |name, _| Ok(PatternMatcher::blank(name)));
        registry.register_simple("SEG_Co_HighResponseTime", co_high_response_time);
        registry.register_simple("SEG_Vm_HighCpu", vm_high_cpu);
        registry.register_complex("CEG_Blank", |name, _| {
            Ok(PatternMatcher::complex(name, Pattern::blank(name), |_| None))
        });
        registry.register_complex(
            "CEG_Co_SustainedHighResponseTime",
            co_sustained_high_response_time,
        );
        registry
    }

    /// Adds or replaces a primitive kind.
    pub fn register_primitive(&mut self, type_name: &str, mapper: PrimitiveMapper) {
        self.primitives.insert(key(type_name), mapper);
    }

    /// Adds or replaces a simple kind.
    pub fn register_simple<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&str, &[Param]) -> Result<PatternMatcher, BuildError> + Send + Sync + 'static,
    {
        self.simples.insert(key(type_name), Arc::new(factory));
    }

    /// Adds or replaces a complex kind.
    pub fn register_complex<F>(&mut self, type_name: &str, factory: F)
    where
        F: Fn(&str, &[Param]) -> Result<PatternMatcher, BuildError> + Send + Sync + 'static,
    {
        self.complexes.insert(key(type_name), Arc::new(factory));
    }

    /// True if `type_name` is known for `category`.
    #[must_use]
    pub fn knows(&self, category: GeneratorCategory, type_name: &str) -> bool {
        match category {
            GeneratorCategory::Primitive => {
                self.primitives.contains_key(&key(type_name))
                    || PrimitiveMapper::from_type_name(type_name).is_some()
            }
            GeneratorCategory::Simple => self.simples.contains_key(&key(type_name)),
            GeneratorCategory::Complex => self.complexes.contains_key(&key(type_name)),
        }
    }

    /// Builds one definition.
    pub fn build(&self, definition: &GeneratorDefinition) -> Result<BuiltGenerator, BuildError> {
        let unknown = || BuildError::UnknownType {
            name: definition.name.clone(),
            category: definition.category,
            type_name: definition.type_name.clone(),
        };

        match definition.category {
            GeneratorCategory::Primitive => {
                let mapper = self
                    .primitives
                    .get(&key(&definition.type_name))
                    .cloned()
                    .or_else(|| PrimitiveMapper::from_type_name(&definition.type_name))
                    .ok_or_else(unknown)?;
                let interval = definition.runtime().ok_or_else(|| BuildError::InvalidInterval {
                    name: definition.name.clone(),
                    reason: "no refresh interval".to_string(),
                })?;
                PrimitiveEventGenerator::new(definition.name.clone(), mapper, interval)
                    .map(BuiltGenerator::Primitive)
            }
            GeneratorCategory::Simple | GeneratorCategory::Complex => {
                let factories = if definition.category == GeneratorCategory::Simple {
                    &self.simples
                } else {
                    &self.complexes
                };
                let factory = factories.get(&key(&definition.type_name)).ok_or_else(unknown)?;
                factory(&definition.name, &definition.params).map(BuiltGenerator::Matcher)
            }
        }
    }

    /// Builds every definition, collecting failures instead of stopping.
    #[must_use]
    pub fn build_all(&self, definitions: &[GeneratorDefinition]) -> BuildOutcome {
        let mut outcome = BuildOutcome::default();
        for definition in definitions.iter().filter(|d| d.enabled) {
            match self.build(definition) {
                Ok(BuiltGenerator::Primitive(g)) => outcome.primitives.push(g),
                Ok(BuiltGenerator::Matcher(m)) => outcome.matchers.push(m),
                Err(err) => {
                    warn!(target: "perception::config", error = %err, "generator not built");
                    outcome.errors.push(err);
                }
            }
        }
        outcome
    }
}

/// Reads positional parameters with defaults.
struct Params<'a> {
    name: &'a str,
    params: &'a [Param],
}

impl<'a> Params<'a> {
    const fn new(name: &'a str, params: &'a [Param]) -> Self {
        Self { name, params }
    }

    fn invalid(&self, position: usize, reason: String) -> BuildError {
        BuildError::InvalidParam {
            name: self.name.to_string(),
            position,
            reason,
        }
    }

    fn i64_or(&self, position: usize, default: i64) -> Result<i64, BuildError> {
        self.params
            .get(position)
            .map_or(Ok(default), |p| p.as_i64().map_err(|r| self.invalid(position, r)))
    }

    fn positive_u32_or(&self, position: usize, default: u32) -> Result<u32, BuildError> {
        let value = self.i64_or(position, i64::from(default))?;
        u32::try_from(value)
            .ok()
            .filter(|v| *v > 0)
            .ok_or_else(|| self.invalid(position, format!("must be a positive count, got {value}")))
    }

    fn window_or(&self, position: usize, default_ms: u64) -> Result<Duration, BuildError> {
        let value = self.i64_or(position, i64::try_from(default_ms).unwrap_or(i64::MAX))?;
        u64::try_from(value)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .ok_or_else(|| self.invalid(position, format!("window must be positive, got {value}")))
    }
}

fn threshold_summary(
    m: &CompletedMatch,
    metric: MetricKind,
    label: &str,
    threshold: i64,
) -> DerivedEvent {
    let values: Vec<i64> = m.all().filter_map(|e| e.metric(metric)).collect();
    let peak = values.iter().copied().max().unwrap_or_default();
    let count = i64::try_from(values.len()).unwrap_or(i64::MAX);
    let mean = if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<i64>() as f64 / values.len() as f64
    };
    let span_ms = (m.completed_at - m.started_at).num_milliseconds();
    DerivedEvent::new(m.generator.clone(), label)
        .with_attribute("threshold", AttributeValue::Int(threshold))
        .with_attribute("peak", AttributeValue::Int(peak))
        .with_attribute("mean", AttributeValue::Float(mean))
        .with_attribute("occurrences", AttributeValue::Int(count))
        .with_attribute("span_ms", AttributeValue::Int(span_ms))
}

fn above(
    resource_type: ResourceType,
    metric: MetricKind,
    threshold: i64,
) -> impl Fn(&Event) -> bool + Send + Sync {
    move |e| {
        e.key.resource_type == resource_type && e.metric(metric).is_some_and(|v| v > threshold)
    }
}

/// `SEG_Co_HighResponseTime(threshold = 500, occurrences = 3, window_ms = 10000)`.
fn co_high_response_time(name: &str, params: &[Param]) -> Result<PatternMatcher, BuildError> {
    let p = Params::new(name, params);
    let threshold = p.i64_or(0, 500)?;
    let occurrences = p.positive_u32_or(1, 3)?;
    let window = p.window_or(2, 10_000)?;

    let pattern = Pattern::begin("high")
        .when(above(ResourceType::Co, MetricKind::ResponseTime, threshold))
        .times(occurrences)
        .within(window)
        .one_match_at_a_time()
        .named(name)
        .build()?;
    Ok(PatternMatcher::simple(name, pattern, move |m| {
        Some(threshold_summary(m, MetricKind::ResponseTime, HIGH_RESPONSE_TIME, threshold))
    }))
}

/// `SEG_Vm_HighCpu(threshold = 90, occurrences = 3, window_ms = 10000)`.
fn vm_high_cpu(name: &str, params: &[Param]) -> Result<PatternMatcher, BuildError> {
    let p = Params::new(name, params);
    let threshold = p.i64_or(0, 90)?;
    let occurrences = p.positive_u32_or(1, 3)?;
    let window = p.window_or(2, 10_000)?;

    let pattern = Pattern::begin("high")
        .when(above(ResourceType::Vm, MetricKind::CpuConsumption, threshold))
        .times(occurrences)
        .within(window)
        .one_match_at_a_time()
        .named(name)
        .build()?;
    Ok(PatternMatcher::simple(name, pattern, move |m| {
        Some(threshold_summary(m, MetricKind::CpuConsumption, HIGH_CPU, threshold))
    }))
}

/// `CEG_Co_SustainedHighResponseTime(occurrences = 2, window_ms = 60000)`.
fn co_sustained_high_response_time(
    name: &str,
    params: &[Param],
) -> Result<PatternMatcher, BuildError> {
    let p = Params::new(name, params);
    let occurrences = p.positive_u32_or(0, 2)?;
    let window = p.window_or(1, 60_000)?;

    let pattern = Pattern::begin("alerts")
        .when(|e| e.key.resource_type == ResourceType::Co && e.has_label(HIGH_RESPONSE_TIME))
        .times(occurrences)
        .within(window)
        .one_match_at_a_time()
        .named(name)
        .build()?;
    Ok(PatternMatcher::complex(name, pattern, |m| {
        let peak = m
            .all()
            .filter_map(|e| e.as_derived()?.attributes.get("peak")?.as_int())
            .max()
            .unwrap_or_default();
        let alerts = i64::try_from(m.len()).unwrap_or(i64::MAX);
        let span_ms = (m.completed_at - m.started_at).num_milliseconds();
        Some(
            DerivedEvent::new(m.generator.clone(), SUSTAINED_HIGH_RESPONSE_TIME)
                .with_attribute("alerts", AttributeValue::Int(alerts))
                .with_attribute("peak", AttributeValue::Int(peak))
                .with_attribute("span_ms", AttributeValue::Int(span_ms)),
        )
    }))
}
