//! Activation-timestamp guard.
//!
//! Remembers when each push subscription became active. Fetch results whose
//! snapshot predates the activation of a subscription covering the same data
//! are discarded, so a slow poll response cannot overwrite push-derived state.

use std::collections::HashMap;
use std::hash::Hash;

use reflex_core::{InterestKey, Timestamp};

#[derive(Debug)]
pub struct ActivationGuard<Id> {
    activations: HashMap<InterestKey<Id>, Timestamp>,
}

impl<Id> Default for ActivationGuard<Id> {
    fn default() -> Self {
        Self {
            activations: HashMap::new(),
        }
    }
}

impl<Id: Clone + Eq + Hash> ActivationGuard<Id> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activation at `at`. Activation times never move backwards.
    pub fn activate(&mut self, key: InterestKey<Id>, at: Timestamp) {
        self.activations
            .entry(key)
            .and_modify(|current| {
                if at > *current {
                    *current = at;
                }
            })
            .or_insert(at);
    }

    pub fn deactivate(&mut self, key: &InterestKey<Id>) {
        self.activations.remove(key);
    }

    pub fn activated_at(&self, key: &InterestKey<Id>) -> Option<Timestamp> {
        self.activations.get(key).copied()
    }

    /// Whether data snapshotted at `snapshot_at` may be applied to `key`.
    pub fn admits(&self, key: &InterestKey<Id>, snapshot_at: Timestamp) -> bool {
        self.activated_at(key)
            .map_or(true, |active_at| snapshot_at >= active_at)
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[test]
    fn test_admits_only_after_activation() {
        let mut guard = ActivationGuard::new();
        let key: InterestKey<String> = InterestKey::Item("U1".to_string());
        let now = Utc::now();

        assert!(guard.admits(&key, now - Duration::seconds(60)));

        guard.activate(key.clone(), now);
        assert!(!guard.admits(&key, now - Duration::milliseconds(1)));
        assert!(guard.admits(&key, now));
        assert!(guard.admits(&key, now + Duration::seconds(1)));

        guard.deactivate(&key);
        assert!(guard.admits(&key, now - Duration::seconds(60)));
        assert!(guard.is_empty());
    }

    #[test]
    fn test_activation_never_moves_backwards() {
        let mut guard = ActivationGuard::new();
        let key: InterestKey<String> = InterestKey::Item("U1".to_string());
        let now = Utc::now();

        guard.activate(key.clone(), now);
        guard.activate(key.clone(), now - Duration::seconds(5));
        assert_eq!(guard.activated_at(&key), Some(now));
    }
}
