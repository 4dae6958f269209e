//! Ordered, name-unique resource collections.

use std::sync::{Arc, PoisonError, RwLock};

use super::broker::Notifier;
use super::resource::{CloudResource, ResourceType};

/// Common surface of live resource nodes.
pub trait Resource: Send + Sync {
    /// Stable name of the resource.
    fn name(&self) -> &str;

    /// Type tag of the resource.
    fn resource_type(&self) -> ResourceType;

    /// Copy the current state into an immutable snapshot.
    fn snapshot(&self) -> CloudResource;

    /// Append snapshots of this resource and everything it owns.
    fn collect_snapshots(&self, out: &mut Vec<CloudResource>) {
        out.push(self.snapshot());
    }

    #[doc(hidden)]
    fn attach(&self, notifier: &Notifier);
}

/// Owns an ordered collection of resources of one type.
///
/// Invariant: no two resources share a name. All operations take the inner
/// lock, so concurrent `add`/`get`/iteration cannot break the invariant or
/// observe a half-inserted entry.
#[derive(Debug)]
pub struct CloudResourceHolder<T> {
    items: RwLock<Vec<Arc<T>>>,
}

impl<T> Default for CloudResourceHolder<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
        }
    }
}

impl<T: Resource> CloudResourceHolder<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resource. Returns false, leaving the holder untouched, if the
    /// name is already present.
    pub fn add(&self, resource: impl Into<Arc<T>>) -> bool {
        let resource = resource.into();
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        if items.iter().any(|r| r.name() == resource.name()) {
            return false;
        }
        items.push(resource);
        true
    }

    /// Looks a resource up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    /// Looks a resource up by insertion position.
    #[must_use]
    pub fn get_at(&self, index: usize) -> Option<Arc<T>> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|r| r.name() == name)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.items.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Handles to every resource, in insertion order.
    ///
    /// The returned vector is detached from the holder: later additions are
    /// not visible through it.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Arc<T>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::nodes::Co;

    #[test]
    fn duplicate_name_is_rejected_and_first_kept() {
        let holder = CloudResourceHolder::<Co>::new();
        let first = Co::new("co-1");
        first.set_response_time(10);
        let second = Co::new("co-1");
        second.set_response_time(99);

        assert!(holder.add(first));
        assert!(!holder.add(second));
        assert_eq!(holder.count(), 1);
        let kept = holder.get("co-1").unwrap();
        assert_eq!(kept.response_time(), 10);
    }

    #[test]
    fn lookup_by_name_and_index() {
        let holder = CloudResourceHolder::<Co>::new();
        assert!(holder.add(Co::new("a")));
        assert!(holder.add(Co::new("b")));

        assert!(holder.exists("b"));
        assert!(!holder.exists("c"));
        assert_eq!(holder.get_at(1).unwrap().name(), "b");
        assert!(holder.get_at(2).is_none());
        assert!(holder.get("c").is_none());
    }

    #[test]
    fn concurrent_adds_keep_names_unique() {
        let holder = Arc::new(CloudResourceHolder::<Co>::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let holder = Arc::clone(&holder);
                std::thread::spawn(move || {
                    (0..50)
                        .filter(|i| holder.add(Co::new(format!("co-{i}"))))
                        .count()
                })
            })
            .collect();

        let added: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(added, 50);
        assert_eq!(holder.count(), 50);
    }
}
