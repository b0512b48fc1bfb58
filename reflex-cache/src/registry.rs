//! Subscription registry: reference counts of live interest per item or query.

use std::collections::HashMap;
use std::hash::Hash;

use reflex_core::InterestKey;
use uuid::Uuid;

/// Proof of one acquired interest. Released exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle<Id> {
    id: Uuid,
    key: InterestKey<Id>,
}

impl<Id> SubscriptionHandle<Id> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &InterestKey<Id> {
        &self.key
    }
}

/// Count transition caused by an acquire or release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Count went from zero to one.
    First,
    /// Count went up, but was already positive.
    Additional,
    /// Count dropped to zero.
    LastReleased,
    /// Count dropped, but is still positive.
    Remaining,
    /// The handle had already been released.
    Unknown,
}

/// Reference counts of live observers.
#[derive(Debug)]
pub struct SubscriptionRegistry<Id> {
    counts: HashMap<InterestKey<Id>, usize>,
    handles: HashMap<Uuid, InterestKey<Id>>,
}

impl<Id> Default for SubscriptionRegistry<Id> {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            handles: HashMap::new(),
        }
    }
}

impl<Id: Clone + Eq + Hash> SubscriptionRegistry<Id> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, key: InterestKey<Id>) -> (SubscriptionHandle<Id>, Transition) {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        let transition = if *count == 1 {
            Transition::First
        } else {
            Transition::Additional
        };

        let handle = SubscriptionHandle {
            id: Uuid::now_v7(),
            key,
        };
        self.handles.insert(handle.id, handle.key.clone());
        (handle, transition)
    }

    pub fn release(&mut self, handle: &SubscriptionHandle<Id>) -> Transition {
        let Some(key) = self.handles.remove(&handle.id) else {
            return Transition::Unknown;
        };
        match self.counts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                Transition::Remaining
            }
            Some(_) => {
                self.counts.remove(&key);
                Transition::LastReleased
            }
            None => Transition::Unknown,
        }
    }

    pub fn count(&self, key: &InterestKey<Id>) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn is_active(&self, key: &InterestKey<Id>) -> bool {
        self.count(key) > 0
    }

    /// Every key with at least one live observer.
    pub fn active_keys(&self) -> Vec<InterestKey<Id>> {
        self.counts.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str) -> InterestKey<String> {
        InterestKey::Item(id.to_string())
    }

    #[test]
    fn test_acquire_release_counts() {
        let mut registry = SubscriptionRegistry::new();
        let (a, t1) = registry.acquire(item("U1"));
        let (b, t2) = registry.acquire(item("U1"));
        assert_eq!(t1, Transition::First);
        assert_eq!(t2, Transition::Additional);
        assert_eq!(registry.count(&item("U1")), 2);
        assert_ne!(a.id(), b.id());

        assert_eq!(registry.release(&a), Transition::Remaining);
        assert!(registry.is_active(&item("U1")));
        assert_eq!(registry.release(&b), Transition::LastReleased);
        assert!(!registry.is_active(&item("U1")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_double_release_is_ignored() {
        let mut registry = SubscriptionRegistry::new();
        let (a, _) = registry.acquire(item("U1"));
        let (_b, _) = registry.acquire(item("U1"));
        assert_eq!(registry.release(&a), Transition::Remaining);
        assert_eq!(registry.release(&a), Transition::Unknown);
        assert_eq!(registry.count(&item("U1")), 1);
    }

    #[test]
    fn test_active_keys() {
        let mut registry = SubscriptionRegistry::new();
        let (_a, _) = registry.acquire(item("U1"));
        let (_b, _) = registry.acquire(item("U2"));
        let mut keys = registry.active_keys();
        keys.sort();
        assert_eq!(keys, vec![item("U1"), item("U2")]);
        assert_eq!(registry.len(), 2);
    }
}
