//! Resource graph: the monitored cloud topology.
//!
//! The graph owns physical machines (which own VMs, which own Co instances)
//! and logical tiers. External agents mutate nodes in place; generators read
//! [`GraphSnapshot`]s and never observe a half-updated resource.

/// Change records and subscriptions.
pub mod broker;
/// Name-unique resource collections.
pub mod holder;
/// Live resource nodes.
pub mod nodes;
/// Immutable resource snapshots.
pub mod resource;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use broker::{ChangeBroker, ChangeKind, ChangeSubscription, ResourceChange};
pub use holder::{CloudResourceHolder, Resource};
pub use nodes::{Co, Pm, Tier, Vm};
pub use resource::{CloudResource, CoMetrics, PmMetrics, ResourceMetrics, ResourceType, VmMetrics};

use broker::Notifier;

/// Point-in-time copy of every resource in the graph.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    /// Graph version when the snapshot started.
    pub version: u64,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Every resource, PMs depth-first then tiers, each listed once.
    pub resources: Vec<CloudResource>,
}

impl GraphSnapshot {
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Resources of one type.
    pub fn of_type(&self, resource_type: ResourceType) -> impl Iterator<Item = &CloudResource> {
        self.resources
            .iter()
            .filter(move |r| r.resource_type() == resource_type)
    }
}

/// Root of the resource graph.
#[derive(Debug)]
pub struct ResourceGraph {
    pms: CloudResourceHolder<Pm>,
    tiers: CloudResourceHolder<Tier>,
    broker: Arc<ChangeBroker>,
    version: Arc<AtomicU64>,
}

impl Default for ResourceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceGraph {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pms: CloudResourceHolder::new(),
            tiers: CloudResourceHolder::new(),
            broker: Arc::new(ChangeBroker::new()),
            version: Arc::new(AtomicU64::new(0)),
        }
    }

    fn notifier(&self) -> Notifier {
        Notifier::new(Arc::clone(&self.broker), Arc::clone(&self.version))
    }

    /// Registers a physical machine and everything it already owns.
    pub fn add_pm(&self, pm: impl Into<Arc<Pm>>) -> bool {
        let pm = pm.into();
        if !self.pms.add(Arc::clone(&pm)) {
            return false;
        }
        let notifier = self.notifier();
        pm.attach(&notifier);
        notifier.publish(ChangeKind::Added, pm.snapshot());
        true
    }

    /// Registers a tier.
    pub fn add_tier(&self, tier: impl Into<Arc<Tier>>) -> bool {
        let tier = tier.into();
        if !self.tiers.add(Arc::clone(&tier)) {
            return false;
        }
        let notifier = self.notifier();
        tier.attach(&notifier);
        notifier.publish(ChangeKind::Added, tier.snapshot());
        true
    }

    #[must_use]
    pub const fn pms(&self) -> &CloudResourceHolder<Pm> {
        &self.pms
    }

    #[must_use]
    pub const fn tiers(&self) -> &CloudResourceHolder<Tier> {
        &self.tiers
    }

    /// The broker on which every change in this graph is published.
    #[must_use]
    pub fn broker(&self) -> &ChangeBroker {
        &self.broker
    }

    /// Subscribe to change records.
    pub fn subscribe(&self, capacity: usize) -> ChangeSubscription {
        self.broker.subscribe(capacity)
    }

    /// Monotonic version, bumped by every structural change or metric update.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Copies every resource. Each resource is read under its own lock only.
    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        let version = self.version();
        let mut all = Vec::new();
        // Tier members usually also hang under a PM. Identity, not name,
        // decides whether a member was already listed: names are only
        // unique among siblings.
        let mut hosted_vms = HashSet::new();
        let mut hosted_cos = HashSet::new();
        for pm in self.pms.to_vec() {
            all.push(pm.snapshot());
            for vm in pm.vms().to_vec() {
                all.push(vm.snapshot());
                for co in vm.cos().to_vec() {
                    all.push(co.snapshot());
                    hosted_cos.insert(Arc::as_ptr(&co));
                }
                hosted_vms.insert(Arc::as_ptr(&vm));
            }
        }
        for tier in self.tiers.to_vec() {
            all.push(tier.snapshot());
            for vm in tier.vms().to_vec() {
                if hosted_vms.insert(Arc::as_ptr(&vm)) {
                    all.push(vm.snapshot());
                }
            }
            for co in tier.cos().to_vec() {
                if hosted_cos.insert(Arc::as_ptr(&co)) {
                    all.push(co.snapshot());
                }
            }
        }

        GraphSnapshot {
            version,
            taken_at: Utc::now(),
            resources: all,
        }
    }

    /// Finds a resource anywhere in the graph.
    #[must_use]
    pub fn find(&self, resource_type: ResourceType, name: &str) -> Option<CloudResource> {
        match resource_type {
            ResourceType::Pm => self.pms.get(name).map(|pm| pm.snapshot()),
            ResourceType::Tier => self.tiers.get(name).map(|t| t.snapshot()),
            ResourceType::Vm => self.find_vm(name).map(|vm| vm.snapshot()),
            ResourceType::Co => self.pms.to_vec().iter().find_map(|pm| {
                pm.vms()
                    .to_vec()
                    .iter()
                    .find_map(|vm| vm.cos().get(name))
                    .map(|co| co.snapshot())
            }),
        }
    }

    /// Live handle on a hosted VM.
    #[must_use]
    pub fn find_vm(&self, name: &str) -> Option<Arc<Vm>> {
        self.pms.to_vec().iter().find_map(|pm| pm.vms().get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small_graph() -> (ResourceGraph, Arc<Co>) {
        let graph = ResourceGraph::new();
        let pm = Arc::new(Pm::new("pm-1"));
        let vm = Arc::new(Vm::new("vm-1"));
        let co = Arc::new(Co::new("co-1"));
        assert!(vm.add_co(Arc::clone(&co)));
        assert!(pm.add_vm(Arc::clone(&vm)));
        assert!(graph.add_pm(pm));

        let tier = Arc::new(Tier::new("front"));
        assert!(tier.add_co(Arc::clone(&co)));
        assert!(graph.add_tier(tier));
        (graph, co)
    }

    #[test]
    fn snapshot_lists_each_resource_once() {
        let (graph, _) = small_graph();
        let snap = graph.snapshot();
        assert_eq!(snap.len(), 4);
        assert_eq!(snap.of_type(ResourceType::Co).count(), 1);
        let co = snap.of_type(ResourceType::Co).next().unwrap();
        assert_eq!(co.tier.as_deref(), Some("front"));
    }

    #[test]
    fn snapshot_keeps_same_named_cos_on_different_vms() {
        let graph = ResourceGraph::new();
        let tier = Arc::new(Tier::new("front"));
        for (pm_name, rt) in [("pm-a", 10), ("pm-b", 999)] {
            let pm = Arc::new(Pm::new(pm_name));
            let vm = Arc::new(Vm::new(format!("vm-{pm_name}")));
            let co = Arc::new(Co::new("web"));
            co.set_response_time(rt);
            assert!(vm.add_co(Arc::clone(&co)));
            assert!(pm.add_vm(vm));
            assert!(graph.add_pm(pm));
            if pm_name == "pm-a" {
                assert!(tier.add_co(co));
            }
        }
        assert!(graph.add_tier(tier));

        let snap = graph.snapshot();
        let mut rts: Vec<i64> = snap
            .of_type(ResourceType::Co)
            .map(|co| co.as_co().unwrap().response_time)
            .collect();
        rts.sort_unstable();
        assert_eq!(rts, [10, 999]);
        assert_eq!(snap.len(), 7);
        let parents: Vec<_> = snap.of_type(ResourceType::Co).map(|co| co.parent.clone()).collect();
        assert_eq!(parents, [Some("vm-pm-a".to_string()), Some("vm-pm-b".to_string())]);
    }

    #[test]
    fn unhosted_tier_member_is_still_listed() {
        let graph = ResourceGraph::new();
        let tier = Arc::new(Tier::new("back"));
        assert!(tier.add_vm(Vm::new("floating")));
        assert!(graph.add_tier(tier));

        let snap = graph.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.of_type(ResourceType::Vm).next().unwrap().tier.as_deref(), Some("back"));
    }

    #[test]
    fn duplicate_pm_is_rejected() {
        let graph = ResourceGraph::new();
        assert!(graph.add_pm(Pm::new("pm-1")));
        assert!(!graph.add_pm(Pm::new("pm-1")));
        assert_eq!(graph.pms().count(), 1);
    }

    #[test]
    fn metric_update_publishes_change_and_bumps_version() {
        let (graph, co) = small_graph();
        let sub = graph.subscribe(16);
        let before = graph.version();

        co.set_response_time(250);

        let change = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(change.kind, ChangeKind::Updated);
        assert_eq!(change.resource.name, "co-1");
        assert_eq!(change.resource.as_co().unwrap().response_time, 250);
        assert!(graph.version() > before);
    }

    #[test]
    fn late_children_are_attached_to_the_broker() {
        let graph = ResourceGraph::new();
        let pm = Arc::new(Pm::new("pm-1"));
        assert!(graph.add_pm(Arc::clone(&pm)));
        let sub = graph.subscribe(16);

        let vm = Arc::new(Vm::new("vm-late"));
        assert!(pm.add_vm(Arc::clone(&vm)));
        let added = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(added.kind, ChangeKind::Added);

        vm.set_ram_consumption(512);
        let updated = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(updated.resource.as_vm().unwrap().ram_consumption, 512);
    }

    #[test]
    fn find_locates_nested_resources() {
        let (graph, _) = small_graph();
        assert_eq!(graph.find(ResourceType::Co, "co-1").unwrap().parent.as_deref(), Some("vm-1"));
        assert!(graph.find(ResourceType::Vm, "vm-1").is_some());
        assert!(graph.find(ResourceType::Vm, "vm-2").is_none());
        assert!(graph.find(ResourceType::Tier, "front").is_some());
    }
}
