//! # Perception - event generation over a live cloud topology
//!
//! Perception watches a graph of cloud resources (physical machines, virtual
//! machines, contained instances and logical tiers) and derives higher-level
//! events from raw metric readings by matching temporal patterns.
//!
//! ## Core Concepts
//!
//! - **ResourceGraph**: the monitored topology, mutated in place by agents
//! - **PrimitiveEventGenerator**: polls the graph on its own cadence and emits one
//!   primitive event per metric reading
//! - **Pattern / PatternMatcher**: multi-stage, time-bounded state machines that
//!   turn event streams into simple and complex events
//! - **Dispatcher**: routes events between generators, matchers and subscribers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use perception::{Co, EventKind, Perception, PerceptionConfig, Pm, ResourceGraph, Vm};
//!
//! let graph = Arc::new(ResourceGraph::new());
//! let pm = Arc::new(Pm::new("pm-1"));
//! let vm = Arc::new(Vm::new("vm-1"));
//! vm.add_co(Co::new("co-1"));
//! pm.add_vm(vm);
//! graph.add_pm(pm);
//!
//! let outcome = perception::config::load_definitions("perception.json")?;
//! let config = PerceptionConfig::default();
//! let mut perception = Perception::start(graph, &outcome.definitions, &config)?;
//! let alerts = perception.subscribe(&[EventKind::Simple, EventKind::Complex])?;
//! while let Ok(event) = alerts.recv() {
//!     println!("{event:?}");
//! }
//! perception.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Topology and events
pub mod error;
pub mod event;
pub mod graph;

// Generation and matching
pub mod generator;
pub mod matcher;
pub mod pattern;

// Runtime
pub mod config;
pub mod dispatcher;
pub mod pipeline;
pub mod registry;

// Re-export primary types at crate root for convenience
pub use config::{
    GeneratorCategory, GeneratorDefinition, LoggingConfig, Param, ParamType, ParseOutcome,
    PerceptionConfig,
};
pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherStats, EventPublisher, EventStream, MatcherId,
};
pub use error::{
    BuildError, ConfigError, ExecutionError, FileError, MappingError, PerceptionError,
    PerceptionResult,
};
pub use event::{
    AttributeValue, CorrelationKey, DerivedEvent, Event, EventBody, EventId, EventKind, MetricKind,
    PrimitiveEvent,
};
pub use generator::{EventSink, GeneratorHandle, PrimitiveEventGenerator, PrimitiveMapper};
pub use graph::{
    CloudResource, CloudResourceHolder, Co, GraphSnapshot, Pm, Resource, ResourceGraph,
    ResourceType, Tier, Vm,
};
pub use matcher::{CompletedMatch, MatcherConfig, MatcherStats, PatternMatcher};
pub use pattern::{Contiguity, MatchPolicy, Pattern, PatternBuilder, Quantifier};
pub use pipeline::Perception;
pub use registry::{BuiltGenerator, GeneratorRegistry};
