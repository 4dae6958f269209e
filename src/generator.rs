//! Primitive event generators.
//!
//! A generator periodically snapshots the resource graph and maps every
//! resource it understands to a [`PrimitiveEvent`]. Each started generator owns
//! one worker thread driven by its own ticker, so a slow or failing generator
//! never delays another one.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use tracing::{debug, info, trace, warn};

use crate::error::{BuildError, ExecutionError, MappingError, PerceptionError, PerceptionResult};
use crate::event::{Event, MetricKind, PrimitiveEvent};
use crate::graph::{CloudResource, ResourceGraph, ResourceType};

/// Destination of generated events.
pub trait EventSink: Send + Sync {
    /// Hands one event over. May block under backpressure.
    fn emit(&self, event: Event) -> PerceptionResult<()>;
}

impl EventSink for Sender<Event> {
    fn emit(&self, event: Event) -> PerceptionResult<()> {
        self.send(event).map_err(|_| {
            PerceptionError::Execution(ExecutionError::Disconnected {
                path: "event_sink".to_string(),
            })
        })
    }
}

/// User-supplied mapping function.
pub type MapFn =
    Arc<dyn Fn(&CloudResource) -> Result<Option<PrimitiveEvent>, String> + Send + Sync>;

/// How a generator turns a resource into a reading.
///
/// Built-in mappers each handle exactly one resource type and one metric.
#[derive(Clone)]
pub enum PrimitiveMapper {
    /// Response time of Co instances.
    CoResponseTime,
    /// vCPU consumption of VMs.
    VmCpu,
    /// RAM consumption of VMs.
    VmRam,
    /// Disk consumption of VMs.
    VmDisk,
    /// CPU consumption of PMs.
    PmCpu,
    /// RAM consumption of PMs.
    PmRam,
    /// Disk consumption of PMs.
    PmDisk,
    /// Score of tiers.
    TierScore,
    /// Arbitrary mapping restricted to one resource type.
    Custom {
        /// Type the function is applied to; other resources are skipped.
        resource_type: ResourceType,
        /// The mapping.
        map: MapFn,
    },
}

impl fmt::Debug for PrimitiveMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom { resource_type, .. } => f
                .debug_struct("Custom")
                .field("resource_type", resource_type)
                .finish_non_exhaustive(),
            other => f.write_str(other.type_name()),
        }
    }
}

const BUILT_IN: [PrimitiveMapper; 8] = [
    PrimitiveMapper::CoResponseTime,
    PrimitiveMapper::VmCpu,
    PrimitiveMapper::VmRam,
    PrimitiveMapper::VmDisk,
    PrimitiveMapper::PmCpu,
    PrimitiveMapper::PmRam,
    PrimitiveMapper::PmDisk,
    PrimitiveMapper::TierScore,
];

impl PrimitiveMapper {
    /// Looks up a built-in mapper by its configuration type name.
    #[must_use]
    pub fn from_type_name(type_name: &str) -> Option<Self> {
        let wanted = type_name.trim();
        BUILT_IN
            .iter()
            .find(|m| m.type_name().eq_ignore_ascii_case(wanted))
            .cloned()
    }

    /// Configuration type name of this mapper.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::CoResponseTime => "PEG_Co_ResponseTime",
            Self::VmCpu => "PEG_Vm_Cpu",
            Self::VmRam => "PEG_Vm_Ram",
            Self::VmDisk => "PEG_Vm_Disk",
            Self::PmCpu => "PEG_Pm_Cpu",
            Self::PmRam => "PEG_Pm_Ram",
            Self::PmDisk => "PEG_Pm_Disk",
            Self::TierScore => "PEG_Tier_Score",
            Self::Custom { .. } => "custom",
        }
    }

    /// The only resource type this mapper produces events for.
    #[must_use]
    pub fn handles(&self) -> ResourceType {
        match self {
            Self::CoResponseTime => ResourceType::Co,
            Self::VmCpu | Self::VmRam | Self::VmDisk => ResourceType::Vm,
            Self::PmCpu | Self::PmRam | Self::PmDisk => ResourceType::Pm,
            Self::TierScore => ResourceType::Tier,
            Self::Custom { resource_type, .. } => *resource_type,
        }
    }

    /// Maps one snapshot. `Ok(None)` means "not for me".
    pub fn map(&self, resource: &CloudResource) -> Result<Option<PrimitiveEvent>, String> {
        let reading = |metric, value| Some(PrimitiveEvent::from_resource(resource, metric, value));
        let out = match (self, resource.as_co(), resource.as_vm(), resource.as_pm()) {
            (Self::CoResponseTime, Some(co), _, _) => {
                reading(MetricKind::ResponseTime, co.response_time)
            }
            (Self::VmCpu, _, Some(vm), _) => {
                reading(MetricKind::CpuConsumption, vm.vcpu_consumption)
            }
            (Self::VmRam, _, Some(vm), _) => {
                reading(MetricKind::RamConsumption, vm.ram_consumption)
            }
            (Self::VmDisk, _, Some(vm), _) => {
                reading(MetricKind::DiskConsumption, vm.disk_consumption)
            }
            (Self::PmCpu, _, _, Some(pm)) => {
                reading(MetricKind::CpuConsumption, pm.cpu_consumption)
            }
            (Self::PmRam, _, _, Some(pm)) => {
                reading(MetricKind::RamConsumption, pm.ram_consumption)
            }
            (Self::PmDisk, _, _, Some(pm)) => {
                reading(MetricKind::DiskConsumption, pm.disk_consumption)
            }
            (Self::TierScore, ..) if resource.resource_type() == ResourceType::Tier => {
                reading(MetricKind::Score, resource.score)
            }
            (Self::Custom { resource_type, map }, ..)
                if resource.resource_type() == *resource_type =>
            {
                return map(resource);
            }
            _ => None,
        };
        Ok(out)
    }
}

/// Counters of one running generator.
#[derive(Debug, Default)]
pub struct GeneratorStats {
    ticks: AtomicU64,
    emitted: AtomicU64,
    mapping_failures: AtomicU64,
    emit_failures: AtomicU64,
}

#[allow(missing_docs)]
impl GeneratorStats {
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn mapping_failures(&self) -> u64 {
        self.mapping_failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn emit_failures(&self) -> u64 {
        self.emit_failures.load(Ordering::Relaxed)
    }
}

/// Outcome of a single tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Resources in the snapshot.
    pub scanned: usize,
    /// Events handed to the sink.
    pub emitted: usize,
    /// Resources whose mapping failed.
    pub failures: usize,
}

/// A named, periodically scheduled resource-to-event mapper.
#[derive(Debug, Clone)]
pub struct PrimitiveEventGenerator {
    name: String,
    interval: Duration,
    mapper: PrimitiveMapper,
}

impl PrimitiveEventGenerator {
    /// Creates a generator.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::InvalidInterval` if `interval` is zero.
    pub fn new(
        name: impl Into<String>,
        mapper: PrimitiveMapper,
        interval: Duration,
    ) -> Result<Self, BuildError> {
        let name = name.into();
        if interval.is_zero() {
            return Err(BuildError::InvalidInterval {
                name,
                reason: "refresh interval must be positive".to_string(),
            });
        }
        Ok(Self {
            name,
            interval,
            mapper,
        })
    }

    /// Creates a generator from a millisecond interval.
    ///
    /// # Errors
    ///
    /// Returns `BuildError::InvalidInterval` if `interval_ms <= 0`.
    pub fn with_millis(
        name: impl Into<String>,
        mapper: PrimitiveMapper,
        interval_ms: i64,
    ) -> Result<Self, BuildError> {
        let name = name.into();
        let Ok(ms) = u64::try_from(interval_ms) else {
            return Err(BuildError::InvalidInterval {
                name,
                reason: format!("refresh interval must be positive, got {interval_ms}"),
            });
        };
        Self::new(name, mapper, Duration::from_millis(ms))
    }

    /// Generator name, unique within a configuration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Refresh interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// The mapping this generator applies.
    #[must_use]
    pub const fn mapper(&self) -> &PrimitiveMapper {
        &self.mapper
    }

    /// Maps one resource. Errors and panics in the mapper are both reported
    /// as `MappingError`; resources of other types yield `Ok(None)`.
    pub fn process_resource(
        &self,
        resource: &CloudResource,
    ) -> Result<Option<PrimitiveEvent>, MappingError> {
        match catch_unwind(AssertUnwindSafe(|| self.mapper.map(resource))) {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(reason)) => Err(MappingError::Failed {
                generator: self.name.clone(),
                resource: resource.name.clone(),
                resource_type: resource.resource_type(),
                reason,
            }),
            Err(payload) => Err(MappingError::Panicked {
                generator: self.name.clone(),
                resource: resource.name.clone(),
                resource_type: resource.resource_type(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Runs one tick against the current graph state.
    pub fn run_tick(
        &self,
        graph: &ResourceGraph,
        sink: &dyn EventSink,
        stats: &GeneratorStats,
    ) -> TickReport {
        stats.ticks.fetch_add(1, Ordering::Relaxed);
        let snapshot = graph.snapshot();
        let mut report = TickReport {
            scanned: snapshot.len(),
            ..TickReport::default()
        };

        for resource in &snapshot.resources {
            match self.process_resource(resource) {
                Ok(Some(pe)) => {
                    let event = Event::primitive_at(pe, snapshot.taken_at);
                    if let Err(err) = sink.emit(event) {
                        stats.emit_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            target: "perception::generator",
                            generator = %self.name,
                            error = %err,
                            "failed to emit primitive event"
                        );
                    } else {
                        stats.emitted.fetch_add(1, Ordering::Relaxed);
                        report.emitted += 1;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    stats.mapping_failures.fetch_add(1, Ordering::Relaxed);
                    report.failures += 1;
                    warn!(
                        target: "perception::generator",
                        error = %err,
                        "mapping failed; no event"
                    );
                }
            }
        }

        trace!(
            target: "perception::generator",
            generator = %self.name,
            version = snapshot.version,
            scanned = report.scanned,
            emitted = report.emitted,
            "tick"
        );
        report
    }

    /// Starts the generator on its own thread.
    ///
    /// The first tick fires one interval after start.
    pub fn start(
        self,
        graph: Arc<ResourceGraph>,
        sink: Arc<dyn EventSink>,
    ) -> PerceptionResult<GeneratorHandle> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let stats = Arc::new(GeneratorStats::default());
        let thread_stats = Arc::clone(&stats);
        let name = self.name.clone();
        let thread_name = format!("perception-peg-{}", self.name);

        let join = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let ticker = tick(self.interval);
                info!(
                    target: "perception::generator",
                    generator = %self.name,
                    kind = self.mapper.type_name(),
                    interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
                    "generator started"
                );
                let mut stopped = false;
                while !stopped {
                    select! {
                        recv(stop_rx) -> _ => stopped = true,
                        recv(ticker) -> _ => {
                            self.run_tick(&graph, sink.as_ref(), &thread_stats);
                        }
                    }
                }
                debug!(
                    target: "perception::generator",
                    generator = %self.name,
                    "generator stopped"
                );
            })
            .map_err(|e| {
                PerceptionError::Execution(ExecutionError::Spawn {
                    name: thread_name,
                    message: e.to_string(),
                })
            })?;

        Ok(GeneratorHandle {
            name,
            stop_tx: Some(stop_tx),
            join: Some(join),
            stats,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Handle on a running generator. Dropping it stops the generator.
#[derive(Debug)]
pub struct GeneratorHandle {
    name: String,
    stop_tx: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
    stats: Arc<GeneratorStats>,
}

impl GeneratorHandle {
    /// Name of the running generator.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Live counters.
    #[must_use]
    pub fn stats(&self) -> &GeneratorStats {
        &self.stats
    }

    /// Ticks run so far.
    #[must_use]
    pub fn ticks(&self) -> u64 {
        self.stats.ticks()
    }

    /// Events handed to the sink so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.stats.emitted()
    }

    /// Resources whose mapping failed so far.
    #[must_use]
    pub fn mapping_failures(&self) -> u64 {
        self.stats.mapping_failures()
    }

    /// True until `stop` has completed.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.join.is_some()
    }

    /// Stops the generator and waits for an in-flight tick to finish.
    ///
    /// Idempotent. No tick starts after this returns.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.join.take() {
            if handle.join().is_err() {
                warn!(
                    target: "perception::generator",
                    generator = %self.name,
                    "generator thread panicked"
                );
            }
        }
    }
}

impl Drop for GeneratorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
