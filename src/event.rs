//! Event taxonomy.
//!
//! Every event travelling through the pipeline shares one envelope
//! ([`Event`]): an id, a timestamp, a correlation key and a kind-specific
//! body. Primitive events carry one metric reading; simple and complex events
//! carry a [`DerivedEvent`] produced by a pattern matcher.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{CloudResource, ResourceType};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Create a new random event id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Layer an event belongs to.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Primitive,
    Simple,
    Complex,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive => write!(f, "primitive"),
            Self::Simple => write!(f, "simple"),
            Self::Complex => write!(f, "complex"),
        }
    }
}

/// Groups related events: the resource an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    /// Type of the resource.
    pub resource_type: ResourceType,
    /// Name of the resource.
    pub resource_name: String,
}

impl CorrelationKey {
    #[must_use]
    pub fn new(resource_type: ResourceType, resource_name: impl Into<String>) -> Self {
        Self {
            resource_type,
            resource_name: resource_name.into(),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.resource_name)
    }
}

/// Which metric a primitive event reports.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ResponseTime,
    CpuConsumption,
    RamConsumption,
    DiskConsumption,
    Score,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ResponseTime => "response_time",
            Self::CpuConsumption => "cpu_consumption",
            Self::RamConsumption => "ram_consumption",
            Self::DiskConsumption => "disk_consumption",
            Self::Score => "score",
        };
        f.write_str(s)
    }
}

/// One metric reading of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimitiveEvent {
    /// Name of the source resource.
    pub resource_name: String,
    /// Type of the source resource.
    pub resource_type: ResourceType,
    /// Resource score at generation time.
    pub score: i64,
    /// Which metric was read.
    pub metric: MetricKind,
    /// The reading.
    pub value: i64,
}

impl PrimitiveEvent {
    /// Builds a reading from a resource snapshot.
    #[must_use]
    pub fn from_resource(resource: &CloudResource, metric: MetricKind, value: i64) -> Self {
        Self {
            resource_name: resource.name.clone(),
            resource_type: resource.resource_type(),
            score: resource.score,
            metric,
            value,
        }
    }

    #[must_use]
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(self.resource_type, self.resource_name.clone())
    }
}

/// Attribute value carried by a derived event.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl AttributeValue {
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// Body of a simple or complex event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedEvent {
    /// Name of the generator that produced it.
    pub generator: String,
    /// What was detected, e.g. `high_response_time`.
    pub label: String,
    /// Free-form details.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Events the match was built from, in binding order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<EventId>,
}

impl DerivedEvent {
    #[must_use]
    pub fn new(generator: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            generator: generator.into(),
            label: label.into(),
            attributes: BTreeMap::new(),
            sources: Vec::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    /// Sets the source events.
    #[must_use]
    pub fn with_sources(mut self, sources: Vec<EventId>) -> Self {
        self.sources = sources;
        self
    }
}

/// Kind-specific event content.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum EventBody {
    Primitive(PrimitiveEvent),
    Simple(DerivedEvent),
    Complex(DerivedEvent),
}

/// Common event envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique id.
    pub id: EventId,
    /// Generation time.
    pub timestamp: DateTime<Utc>,
    /// Grouping key.
    pub key: CorrelationKey,
    /// Content.
    pub body: EventBody,
}

impl Event {
    /// Wraps a primitive reading, stamped now.
    #[must_use]
    pub fn primitive(event: PrimitiveEvent) -> Self {
        Self::primitive_at(event, Utc::now())
    }

    /// Wraps a primitive reading with an explicit timestamp.
    #[must_use]
    pub fn primitive_at(event: PrimitiveEvent, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            timestamp,
            key: event.key(),
            body: EventBody::Primitive(event),
        }
    }

    /// Wraps a derived event of the given layer.
    ///
    /// Returns `None` for `EventKind::Primitive`, which has no derived form.
    #[must_use]
    pub fn derived(
        kind: EventKind,
        key: CorrelationKey,
        timestamp: DateTime<Utc>,
        event: DerivedEvent,
    ) -> Option<Self> {
        let body = match kind {
            EventKind::Primitive => return None,
            EventKind::Simple => EventBody::Simple(event),
            EventKind::Complex => EventBody::Complex(event),
        };
        Some(Self {
            id: EventId::new(),
            timestamp,
            key,
            body,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self.body {
            EventBody::Primitive(_) => EventKind::Primitive,
            EventBody::Simple(_) => EventKind::Simple,
            EventBody::Complex(_) => EventKind::Complex,
        }
    }

    #[must_use]
    pub const fn as_primitive(&self) -> Option<&PrimitiveEvent> {
        match &self.body {
            EventBody::Primitive(p) => Some(p),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_derived(&self) -> Option<&DerivedEvent> {
        match &self.body {
            EventBody::Simple(d) | EventBody::Complex(d) => Some(d),
            EventBody::Primitive(_) => None,
        }
    }

    /// Value of a primitive reading of `metric`, if this is one.
    #[must_use]
    pub fn metric(&self, metric: MetricKind) -> Option<i64> {
        self.as_primitive()
            .filter(|p| p.metric == metric)
            .map(|p| p.value)
    }

    /// True if this is a derived event with the given label.
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.as_derived().is_some_and(|d| d.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{CoMetrics, ResourceMetrics};

    fn co(name: &str, response_time: i64) -> CloudResource {
        CloudResource {
            name: name.to_string(),
            score: 1,
            parent: None,
            tier: None,
            metrics: ResourceMetrics::Co(CoMetrics { response_time }),
        }
    }

    #[test]
    fn primitive_event_is_keyed_by_resource() {
        let pe = PrimitiveEvent::from_resource(&co("co-1", 40), MetricKind::ResponseTime, 40);
        let ev = Event::primitive(pe);
        assert_eq!(ev.kind(), EventKind::Primitive);
        assert_eq!(ev.key, CorrelationKey::new(ResourceType::Co, "co-1"));
        assert_eq!(ev.metric(MetricKind::ResponseTime), Some(40));
        assert_eq!(ev.metric(MetricKind::CpuConsumption), None);
    }

    #[test]
    fn derived_rejects_primitive_kind() {
        let key = CorrelationKey::new(ResourceType::Co, "co-1");
        let d = DerivedEvent::new("g", "high");
        assert!(Event::derived(EventKind::Primitive, key.clone(), Utc::now(), d.clone()).is_none());

        let ev = Event::derived(EventKind::Complex, key, Utc::now(), d).unwrap();
        assert_eq!(ev.kind(), EventKind::Complex);
        assert!(ev.has_label("high"));
        assert!(ev.as_primitive().is_none());
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let key = CorrelationKey::new(ResourceType::Vm, "vm-1");
        let d = DerivedEvent::new("g", "high_cpu").with_attribute("peak", AttributeValue::Int(97));
        let ev = Event::derived(EventKind::Simple, key, Utc::now(), d).unwrap();

        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["body"]["kind"], "simple");
        assert_eq!(json["body"]["body"]["attributes"]["peak"]["value"], 97);

        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn correlation_key_display() {
        let key = CorrelationKey::new(ResourceType::Tier, "front");
        assert_eq!(key.to_string(), "TIER:front");
    }
}
