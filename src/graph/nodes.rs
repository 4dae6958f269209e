//! Live resource nodes.
//!
//! Nodes are shared through `Arc` and mutated in place by monitoring agents.
//! Each node guards its own state, so reads of different resources never
//! contend on a common lock.

use std::sync::{PoisonError, RwLock};

use super::broker::{ChangeKind, Notifier};
use super::holder::{CloudResourceHolder, Resource};
use super::resource::{
    CloudResource, CoMetrics, PmMetrics, ResourceMetrics, ResourceType, VmMetrics,
};

#[derive(Debug, Clone, Default)]
struct NodeState<M> {
    score: i64,
    metrics: M,
    parent: Option<String>,
    tier: Option<String>,
}

#[derive(Debug)]
struct NodeCore<M> {
    name: String,
    state: RwLock<NodeState<M>>,
    notifier: RwLock<Option<Notifier>>,
}

impl<M: Clone + Default> NodeCore<M> {
    fn new(name: String) -> Self {
        Self {
            name,
            state: RwLock::new(NodeState::default()),
            notifier: RwLock::new(None),
        }
    }

    fn read(&self) -> NodeState<M> {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, f: impl FnOnce(&mut NodeState<M>)) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut *state);
    }

    /// Sets `slot` to `owner` unless it already names a different owner.
    fn claim(&self, owner: &str, slot: impl Fn(&mut NodeState<M>) -> &mut Option<String>) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = slot(&mut *state);
        if current.as_deref().is_some_and(|existing| existing != owner) {
            return false;
        }
        *current = Some(owner.to_string());
        true
    }

    fn release(&self, owner: &str, slot: impl Fn(&mut NodeState<M>) -> &mut Option<String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = slot(&mut *state);
        if current.as_deref() == Some(owner) {
            *current = None;
        }
    }

    fn notifier(&self) -> Option<Notifier> {
        self.notifier.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_notifier(&self, notifier: &Notifier) {
        *self.notifier.write().unwrap_or_else(PoisonError::into_inner) = Some(notifier.clone());
    }
}

fn announce<R: Resource + ?Sized>(resource: &R, notifier: Option<Notifier>, kind: ChangeKind) {
    if let Some(n) = notifier {
        n.publish(kind, resource.snapshot());
    }
}

fn adopt<R: Resource>(child: &R, notifier: Option<Notifier>) {
    if let Some(n) = notifier {
        child.attach(&n);
        n.publish(ChangeKind::Added, child.snapshot());
    }
}

// ---------------------------------------------------------------------------
// PM
// ---------------------------------------------------------------------------

/// Physical machine. Owns its VMs.
#[derive(Debug)]
pub struct Pm {
    core: NodeCore<PmMetrics>,
    vms: CloudResourceHolder<Vm>,
}

impl Pm {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: NodeCore::new(name.into()),
            vms: CloudResourceHolder::new(),
        }
    }

    #[must_use]
    pub fn score(&self) -> i64 {
        self.core.read().score
    }

    pub fn set_score(&self, score: i64) {
        self.core.update(|s| s.score = score);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    #[must_use]
    pub fn metrics(&self) -> PmMetrics {
        self.core.read().metrics
    }

    pub fn set_cpu_consumption(&self, value: i64) {
        self.core.update(|s| s.metrics.cpu_consumption = value);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    pub fn set_ram_consumption(&self, value: i64) {
        self.core.update(|s| s.metrics.ram_consumption = value);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    pub fn set_disk_consumption(&self, value: i64) {
        self.core.update(|s| s.metrics.disk_consumption = value);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    /// Places a VM on this machine.
    ///
    /// Fails if the name is taken here or the VM already runs on another PM.
    pub fn add_vm(&self, vm: impl Into<std::sync::Arc<Vm>>) -> bool {
        let vm = vm.into();
        if self.vms.exists(vm.name()) {
            return false;
        }
        if !vm.core.claim(&self.core.name, |s| &mut s.parent) {
            return false;
        }
        if !self.vms.add(std::sync::Arc::clone(&vm)) {
            vm.core.release(&self.core.name, |s| &mut s.parent);
            return false;
        }
        adopt(vm.as_ref(), self.core.notifier());
        true
    }

    /// Hosted VMs.
    #[must_use]
    pub const fn vms(&self) -> &CloudResourceHolder<Vm> {
        &self.vms
    }
}

impl Resource for Pm {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Pm
    }

    fn snapshot(&self) -> CloudResource {
        let s = self.core.read();
        CloudResource {
            name: self.core.name.clone(),
            score: s.score,
            parent: None,
            tier: None,
            metrics: ResourceMetrics::Pm(s.metrics),
        }
    }

    fn collect_snapshots(&self, out: &mut Vec<CloudResource>) {
        out.push(self.snapshot());
        for vm in self.vms.to_vec() {
            vm.collect_snapshots(out);
        }
    }

    fn attach(&self, notifier: &Notifier) {
        self.core.set_notifier(notifier);
        for vm in self.vms.to_vec() {
            vm.attach(notifier);
        }
    }
}

// ---------------------------------------------------------------------------
// VM
// ---------------------------------------------------------------------------

/// Virtual machine. Owns its Co instances.
#[derive(Debug)]
pub struct Vm {
    core: NodeCore<VmMetrics>,
    cos: CloudResourceHolder<Co>,
}

impl Vm {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: NodeCore::new(name.into()),
            cos: CloudResourceHolder::new(),
        }
    }

    #[must_use]
    pub fn score(&self) -> i64 {
        self.core.read().score
    }

    pub fn set_score(&self, score: i64) {
        self.core.update(|s| s.score = score);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    #[must_use]
    pub fn metrics(&self) -> VmMetrics {
        self.core.read().metrics
    }

    pub fn set_vcpu_consumption(&self, value: i64) {
        self.core.update(|s| s.metrics.vcpu_consumption = value);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    pub fn set_ram_consumption(&self, value: i64) {
        self.core.update(|s| s.metrics.ram_consumption = value);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    pub fn set_disk_consumption(&self, value: i64) {
        self.core.update(|s| s.metrics.disk_consumption = value);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    /// Name of the hosting PM.
    #[must_use]
    pub fn pm(&self) -> Option<String> {
        self.core.read().parent
    }

    /// Name of the tier this VM belongs to.
    #[must_use]
    pub fn tier(&self) -> Option<String> {
        self.core.read().tier
    }

    /// Places a Co instance on this VM.
    pub fn add_co(&self, co: impl Into<std::sync::Arc<Co>>) -> bool {
        let co = co.into();
        if self.cos.exists(co.name()) {
            return false;
        }
        if !co.core.claim(&self.core.name, |s| &mut s.parent) {
            return false;
        }
        if !self.cos.add(std::sync::Arc::clone(&co)) {
            co.core.release(&self.core.name, |s| &mut s.parent);
            return false;
        }
        adopt(co.as_ref(), self.core.notifier());
        true
    }

    /// Hosted Co instances.
    #[must_use]
    pub const fn cos(&self) -> &CloudResourceHolder<Co> {
        &self.cos
    }
}

impl Resource for Vm {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Vm
    }

    fn snapshot(&self) -> CloudResource {
        let s = self.core.read();
        CloudResource {
            name: self.core.name.clone(),
            score: s.score,
            parent: s.parent,
            tier: s.tier,
            metrics: ResourceMetrics::Vm(s.metrics),
        }
    }

    fn collect_snapshots(&self, out: &mut Vec<CloudResource>) {
        out.push(self.snapshot());
        for co in self.cos.to_vec() {
            out.push(co.snapshot());
        }
    }

    fn attach(&self, notifier: &Notifier) {
        self.core.set_notifier(notifier);
        for co in self.cos.to_vec() {
            co.attach(notifier);
        }
    }
}

// ---------------------------------------------------------------------------
// Co
// ---------------------------------------------------------------------------

/// Contained resource hosted by a VM.
#[derive(Debug)]
pub struct Co {
    core: NodeCore<CoMetrics>,
}

impl Co {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: NodeCore::new(name.into()),
        }
    }

    #[must_use]
    pub fn score(&self) -> i64 {
        self.core.read().score
    }

    pub fn set_score(&self, score: i64) {
        self.core.update(|s| s.score = score);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    /// Last observed response time, in milliseconds.
    #[must_use]
    pub fn response_time(&self) -> i64 {
        self.core.read().metrics.response_time
    }

    pub fn set_response_time(&self, millis: i64) {
        self.core.update(|s| s.metrics.response_time = millis);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    /// Name of the hosting VM.
    #[must_use]
    pub fn vm(&self) -> Option<String> {
        self.core.read().parent
    }

    #[must_use]
    pub fn tier(&self) -> Option<String> {
        self.core.read().tier
    }
}

impl Resource for Co {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Co
    }

    fn snapshot(&self) -> CloudResource {
        let s = self.core.read();
        CloudResource {
            name: self.core.name.clone(),
            score: s.score,
            parent: s.parent,
            tier: s.tier,
            metrics: ResourceMetrics::Co(s.metrics),
        }
    }

    fn attach(&self, notifier: &Notifier) {
        self.core.set_notifier(notifier);
    }
}

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Logical grouping of VMs and Co instances.
///
/// Members keep their physical owner; a member belongs to at most one tier.
#[derive(Debug)]
pub struct Tier {
    core: NodeCore<()>,
    vms: CloudResourceHolder<Vm>,
    cos: CloudResourceHolder<Co>,
}

impl Tier {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: NodeCore::new(name.into()),
            vms: CloudResourceHolder::new(),
            cos: CloudResourceHolder::new(),
        }
    }

    #[must_use]
    pub fn score(&self) -> i64 {
        self.core.read().score
    }

    pub fn set_score(&self, score: i64) {
        self.core.update(|s| s.score = score);
        announce(self, self.core.notifier(), ChangeKind::Updated);
    }

    /// Adds a VM to this tier. Fails if it already belongs to another tier.
    pub fn add_vm(&self, vm: impl Into<std::sync::Arc<Vm>>) -> bool {
        let vm = vm.into();
        if self.vms.exists(vm.name()) {
            return false;
        }
        if !vm.core.claim(&self.core.name, |s| &mut s.tier) {
            return false;
        }
        if !self.vms.add(std::sync::Arc::clone(&vm)) {
            vm.core.release(&self.core.name, |s| &mut s.tier);
            return false;
        }
        announce(
            vm.as_ref(),
            vm.core.notifier().or_else(|| self.core.notifier()),
            ChangeKind::Updated,
        );
        true
    }

    /// Adds a Co instance to this tier. Fails if it already belongs to another tier.
    pub fn add_co(&self, co: impl Into<std::sync::Arc<Co>>) -> bool {
        let co = co.into();
        if self.cos.exists(co.name()) {
            return false;
        }
        if !co.core.claim(&self.core.name, |s| &mut s.tier) {
            return false;
        }
        if !self.cos.add(std::sync::Arc::clone(&co)) {
            co.core.release(&self.core.name, |s| &mut s.tier);
            return false;
        }
        announce(
            co.as_ref(),
            co.core.notifier().or_else(|| self.core.notifier()),
            ChangeKind::Updated,
        );
        true
    }

    #[must_use]
    pub const fn vms(&self) -> &CloudResourceHolder<Vm> {
        &self.vms
    }

    #[must_use]
    pub const fn cos(&self) -> &CloudResourceHolder<Co> {
        &self.cos
    }
}

impl Resource for Tier {
    fn name(&self) -> &str {
        &self.core.name
    }

    fn resource_type(&self) -> ResourceType {
        ResourceType::Tier
    }

    fn snapshot(&self) -> CloudResource {
        let s = self.core.read();
        CloudResource {
            name: self.core.name.clone(),
            score: s.score,
            parent: None,
            tier: None,
            metrics: ResourceMetrics::Tier,
        }
    }

    fn collect_snapshots(&self, out: &mut Vec<CloudResource>) {
        out.push(self.snapshot());
        for vm in self.vms.to_vec() {
            out.push(vm.snapshot());
        }
        for co in self.cos.to_vec() {
            out.push(co.snapshot());
        }
    }

    fn attach(&self, notifier: &Notifier) {
        self.core.set_notifier(notifier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn pm_add_vm_sets_parent() {
        let pm = Pm::new("pm-1");
        let vm = Arc::new(Vm::new("vm-1"));
        assert!(pm.add_vm(Arc::clone(&vm)));
        assert_eq!(vm.pm().as_deref(), Some("pm-1"));
        assert_eq!(pm.vms().count(), 1);
    }

    #[test]
    fn vm_cannot_run_on_two_pms() {
        let a = Pm::new("pm-a");
        let b = Pm::new("pm-b");
        let vm = Arc::new(Vm::new("vm-1"));
        assert!(a.add_vm(Arc::clone(&vm)));
        assert!(!b.add_vm(Arc::clone(&vm)));
        assert_eq!(b.vms().count(), 0);
        assert_eq!(vm.pm().as_deref(), Some("pm-a"));
    }

    #[test]
    fn duplicate_vm_name_keeps_first_parent_link() {
        let pm = Pm::new("pm-1");
        assert!(pm.add_vm(Vm::new("vm-1")));
        let other = Arc::new(Vm::new("vm-1"));
        assert!(!pm.add_vm(Arc::clone(&other)));
        assert!(other.pm().is_none());
    }

    #[test]
    fn member_belongs_to_one_tier() {
        let front = Tier::new("front");
        let back = Tier::new("back");
        let co = Arc::new(Co::new("co-1"));
        assert!(front.add_co(Arc::clone(&co)));
        assert!(!back.add_co(Arc::clone(&co)));
        assert_eq!(co.tier().as_deref(), Some("front"));

        let vm = Arc::new(Vm::new("vm-1"));
        assert!(back.add_vm(Arc::clone(&vm)));
        assert!(!front.add_vm(vm));
    }

    #[test]
    fn snapshot_copies_current_metrics() {
        let vm = Vm::new("vm-1");
        vm.set_vcpu_consumption(4);
        vm.set_ram_consumption(2048);
        vm.set_score(7);

        let snap = vm.snapshot();
        vm.set_vcpu_consumption(8);

        assert_eq!(snap.score, 7);
        assert_eq!(snap.as_vm().unwrap().vcpu_consumption, 4);
        assert_eq!(vm.metrics().vcpu_consumption, 8);
    }

    #[test]
    fn collect_snapshots_walks_ownership_tree() {
        let pm = Pm::new("pm-1");
        let vm = Arc::new(Vm::new("vm-1"));
        assert!(vm.add_co(Co::new("co-1")));
        assert!(vm.add_co(Co::new("co-2")));
        assert!(pm.add_vm(vm));

        let mut out = Vec::new();
        pm.collect_snapshots(&mut out);
        let names: Vec<_> = out.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["pm-1", "vm-1", "co-1", "co-2"]);
        assert_eq!(out[2].parent.as_deref(), Some("vm-1"));
    }
}
