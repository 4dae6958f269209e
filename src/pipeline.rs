//! The assembled pipeline.
//!
//! [`Perception`] wires a resource graph, the generators and matchers built
//! from a definition list, and a dispatcher between them. Shutdown stops the
//! generators first so the dispatcher can drain a closed input.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{load_definitions, GeneratorDefinition, PerceptionConfig};
use crate::dispatcher::{Dispatcher, DispatcherStats, EventPublisher, EventStream, MatcherId};
use crate::error::{BuildError, ConfigError, PerceptionResult};
use crate::event::EventKind;
use crate::generator::{EventSink, GeneratorHandle};
use crate::graph::ResourceGraph;
use crate::matcher::MatcherStats;
use crate::registry::GeneratorRegistry;

/// A running perception pipeline.
#[derive(Debug)]
pub struct Perception {
    graph: Arc<ResourceGraph>,
    dispatcher: Dispatcher,
    generators: Vec<GeneratorHandle>,
    matchers: Vec<(MatcherId, String)>,
    build_errors: Vec<BuildError>,
    config_errors: Vec<ConfigError>,
}

impl Perception {
    /// Builds and starts every definition with the built-in kinds.
    ///
    /// Definitions that fail to build are reported by [`Self::build_errors`]
    /// and do not prevent the others from running.
    pub fn start(
        graph: Arc<ResourceGraph>,
        definitions: &[GeneratorDefinition],
        config: &PerceptionConfig,
    ) -> PerceptionResult<Self> {
        Self::start_with_registry(graph, definitions, config, &GeneratorRegistry::with_builtins())
    }

    /// Loads definitions from a file and starts them.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read. Recoverable configuration problems
    /// are kept in [`Self::config_errors`].
    pub fn start_from_file(
        graph: Arc<ResourceGraph>,
        path: impl AsRef<Path>,
        config: &PerceptionConfig,
    ) -> PerceptionResult<Self> {
        let outcome = load_definitions(path)?;
        let mut perception = Self::start(graph, &outcome.definitions, config)?;
        perception.config_errors = outcome.errors;
        Ok(perception)
    }

    /// Builds and starts every definition with a custom registry.
    pub fn start_with_registry(
        graph: Arc<ResourceGraph>,
        definitions: &[GeneratorDefinition],
        config: &PerceptionConfig,
        registry: &GeneratorRegistry,
    ) -> PerceptionResult<Self> {
        let built = registry.build_all(definitions);
        let dispatcher = Dispatcher::new(config.dispatcher.clone(), config.matcher.clone())?;

        // Matchers first, so no primitive event is routed before they exist.
        let mut matchers = Vec::with_capacity(built.matchers.len());
        for matcher in built.matchers {
            let name = matcher.name().to_string();
            let id = dispatcher.register_matcher(matcher)?;
            matchers.push((id, name));
        }

        let sink: Arc<dyn EventSink> = Arc::new(dispatcher.publisher());
        let mut generators = Vec::with_capacity(built.primitives.len());
        for generator in built.primitives {
            generators.push(generator.start(Arc::clone(&graph), Arc::clone(&sink))?);
        }

        info!(
            target: "perception::pipeline",
            generators = generators.len(),
            matchers = matchers.len(),
            build_errors = built.errors.len(),
            "perception started"
        );

        Ok(Self {
            graph,
            dispatcher,
            generators,
            matchers,
            build_errors: built.errors,
            config_errors: Vec::new(),
        })
    }

    /// The monitored graph.
    #[must_use]
    pub fn graph(&self) -> &Arc<ResourceGraph> {
        &self.graph
    }

    /// The dispatcher.
    #[must_use]
    pub const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Subscribes to pipeline events; an empty slice means all kinds.
    pub fn subscribe(&self, kinds: &[EventKind]) -> PerceptionResult<EventStream> {
        self.dispatcher.subscribe(kinds)
    }

    /// Handle for injecting events from outside the generators.
    #[must_use]
    pub fn publisher(&self) -> EventPublisher {
        self.dispatcher.publisher()
    }

    /// Running primitive generators.
    #[must_use]
    pub fn generators(&self) -> &[GeneratorHandle] {
        &self.generators
    }

    /// Registered matchers.
    #[must_use]
    pub fn matchers(&self) -> &[(MatcherId, String)] {
        &self.matchers
    }

    /// Latest counters of a matcher, by generator name.
    #[must_use]
    pub fn matcher_stats(&self, name: &str) -> Option<MatcherStats> {
        let (id, _) = self.matchers.iter().find(|(_, n)| n == name)?;
        self.dispatcher.matcher_stats(*id)
    }

    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// Definitions that could not be built.
    #[must_use]
    pub fn build_errors(&self) -> &[BuildError] {
        &self.build_errors
    }

    /// Problems found while loading definitions from a file.
    #[must_use]
    pub fn config_errors(&self) -> &[ConfigError] {
        &self.config_errors
    }

    /// Stops every generator, then drains and stops the dispatcher.
    ///
    /// Idempotent.
    pub fn shutdown(&mut self) {
        for generator in &mut self.generators {
            generator.stop();
        }
        if !self.dispatcher.is_closed() {
            self.dispatcher.shutdown();
            let failures: u64 = self.generators.iter().map(GeneratorHandle::mapping_failures).sum();
            if failures > 0 {
                warn!(target: "perception::pipeline", failures, "mapping failures during run");
            }
            info!(target: "perception::pipeline", "perception stopped");
        }
    }
}

impl Drop for Perception {
    fn drop(&mut self) {
        self.shutdown();
    }
}
