//! Query store: cached result sets and in-place reconstruction.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use reflex_core::{ConsistencyError, Freshness, Model, QueryKey, QuerySpec, Timestamp};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;

use super::item::ItemStore;

/// One cached query result.
#[derive(Debug)]
pub struct CachedQuery<M: Model> {
    spec: QuerySpec,
    key: QueryKey,
    matched: Vec<M::Id>,
    fetched_at: Option<Timestamp>,
    freshness: Option<Freshness>,
    last_accessed: Instant,
    tx: watch::Sender<Vec<M>>,
}

impl<M: Model> CachedQuery<M> {
    fn new(spec: QuerySpec, now: Instant) -> Self {
        Self {
            key: spec.key(),
            spec,
            matched: Vec::new(),
            fetched_at: None,
            freshness: None,
            last_accessed: now,
            tx: watch::Sender::new(Vec::new()),
        }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Matched identities in rank order.
    pub fn matched(&self) -> &[M::Id] {
        &self.matched
    }

    pub fn contains(&self, id: &M::Id) -> bool {
        self.matched.contains(id)
    }

    pub fn fetched_at(&self) -> Option<Timestamp> {
        self.fetched_at
    }

    pub fn is_fetched(&self) -> bool {
        self.fetched_at.is_some()
    }

    pub fn freshness(&self) -> Option<Freshness> {
        self.freshness
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }

    /// Returns true if the requirement became tighter.
    pub fn require(&mut self, freshness: Freshness) -> bool {
        let previous = self.freshness;
        self.freshness = Some(match previous {
            Some(current) => current.tighter(freshness),
            None => freshness,
        });
        self.freshness != previous
    }

    pub fn is_fresh(&self, freshness: Freshness, now: Timestamp) -> bool {
        self.fetched_at
            .is_some_and(|fetched_at| freshness.is_fresh(fetched_at, now))
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<M>> {
        self.tx.subscribe()
    }

    /// Replace the result with a freshly fetched one.
    pub fn install(&mut self, matched: Vec<M::Id>, fetched_at: Timestamp) {
        self.matched = matched;
        self.fetched_at = Some(fetched_at);
    }

    /// Drop the result so the next access refetches it.
    pub fn invalidate(&mut self) -> bool {
        self.matched.clear();
        self.fetched_at = None;
        self.notify(Vec::new())
    }

    /// Reconstruct after `id` took the value projected as `projection`.
    ///
    /// `resolve` yields the projection of every other matched identity.
    /// Returns whether the matched list changed shape or content.
    pub fn reconstruct_upsert<'a, F>(
        &mut self,
        id: &M::Id,
        projection: &Value,
        resolve: F,
    ) -> Result<bool, ConsistencyError>
    where
        F: Fn(&M::Id) -> Option<&'a Value>,
    {
        if !self.is_fetched() {
            return Ok(false);
        }

        let previous = self.matched.iter().position(|m| m == id);
        if let Some(position) = previous {
            self.matched.remove(position);
        }
        if !self.spec.matches(projection) {
            return Ok(previous.is_some());
        }

        let mut insert_at = self.matched.len();
        for (index, other) in self.matched.iter().enumerate() {
            let other_projection = resolve(other).ok_or_else(|| ConsistencyError::MissingItem {
                query: self.key.to_string(),
                id: other.to_string(),
            })?;
            if self.spec.rank((id, projection), (other, other_projection)) == Ordering::Less {
                insert_at = index;
                break;
            }
        }

        if previous.is_none() && self.spec.is_full(self.matched.len()) && insert_at == self.matched.len() {
            // Ranks below everything in a full result.
            return Ok(false);
        }

        self.matched.insert(insert_at, id.clone());
        if let Some(limit) = self.spec.limit {
            self.matched.truncate(limit);
        }
        Ok(true)
    }

    /// Reconstruct after `id` was removed. The result is not refilled.
    pub fn reconstruct_removed(&mut self, id: &M::Id) -> bool {
        match self.matched.iter().position(|m| m == id) {
            Some(position) => {
                self.matched.remove(position);
                true
            }
            None => false,
        }
    }

    /// Resolve matched identities into values, checking the result is intact.
    pub fn materialize(&self, items: &ItemStore<M>) -> Result<Vec<M>, ConsistencyError> {
        let mut values = Vec::with_capacity(self.matched.len());
        let mut previous: Option<(&M::Id, &Value)> = None;
        for id in &self.matched {
            let missing = || ConsistencyError::MissingItem {
                query: self.key.to_string(),
                id: id.to_string(),
            };
            let entry = items.get(id).ok_or_else(missing)?;
            let (value, projection) = entry
                .value()
                .zip(entry.projection())
                .ok_or_else(missing)?;
            if let Some(before) = previous {
                if self.spec.rank(before, (id, projection)) != Ordering::Less {
                    return Err(ConsistencyError::OrderViolated {
                        query: self.key.to_string(),
                    });
                }
            }
            previous = Some((id, projection));
            values.push(value.clone());
        }
        Ok(values)
    }

    /// Send a materialized result to observers if it differs.
    pub fn notify(&self, values: Vec<M>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == values {
                false
            } else {
                *current = values;
                true
            }
        })
    }
}

/// Cached queries keyed by their canonical key.
#[derive(Debug)]
pub struct QueryStore<M: Model> {
    entries: HashMap<QueryKey, CachedQuery<M>>,
}

impl<M: Model> Default for QueryStore<M> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<M: Model> QueryStore<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for `spec`, marking it accessed.
    pub fn entry(&mut self, spec: &QuerySpec, now: Instant) -> &mut CachedQuery<M> {
        let entry = self
            .entries
            .entry(spec.key())
            .or_insert_with(|| CachedQuery::new(spec.clone(), now));
        entry.touch(now);
        entry
    }

    pub fn get(&self, key: &QueryKey) -> Option<&CachedQuery<M>> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &QueryKey) -> Option<&mut CachedQuery<M>> {
        self.entries.get_mut(key)
    }

    pub fn spec(&self, key: &QueryKey) -> Option<QuerySpec> {
        self.entries.get(key).map(|query| query.spec.clone())
    }

    pub fn invalidate(&mut self, key: &QueryKey) -> bool {
        self.entries
            .get_mut(key)
            .is_some_and(CachedQuery::invalidate)
    }

    /// Drop every result. Entries for which `keep` holds stay as unfetched
    /// placeholders.
    pub fn clear(&mut self, keep: impl Fn(&QueryKey) -> bool) {
        self.entries.retain(|key, query| {
            if keep(key) {
                query.invalidate();
                true
            } else {
                false
            }
        });
    }

    pub fn evict(&mut self, key: &QueryKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Identities referenced by any cached result.
    pub fn referenced_ids(&self) -> HashSet<M::Id> {
        self.entries
            .values()
            .flat_map(|query| query.matched.iter().cloned())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&QueryKey, &CachedQuery<M>)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&QueryKey, &mut CachedQuery<M>)> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use reflex_core::{FilterExpr, OrderBy};
    use reflex_test_utils::User;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone)]
    enum Op {
        Upsert(u8, u32),
        Remove(u8),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..12, 0u32..60).prop_map(|(id, age)| Op::Upsert(id, age)),
            (0u8..12).prop_map(Op::Remove),
        ]
    }

    fn spec(limit: usize) -> QuerySpec {
        QuerySpec::new(FilterExpr::gte("age", json!(18)))
            .with_order(OrderBy::desc("age"))
            .with_limit(limit)
    }

    fn user(id: u8, age: u32) -> User {
        User::new(format!("U{id:02}"), format!("user-{id}"), age)
    }

    /// Apply one op to both the server model and the cache.
    fn apply(
        op: &Op,
        server: &mut BTreeMap<String, User>,
        items: &mut ItemStore<User>,
        query: &mut CachedQuery<User>,
    ) {
        let now = Utc::now();
        match op {
            Op::Upsert(id, age) => {
                let u = user(*id, *age);
                let projection = serde_json::to_value(&u).unwrap();
                server.insert(u.id.clone(), u.clone());
                items.upsert(u.id.clone(), u.clone(), projection.clone(), now, now, Instant::now());
                query
                    .reconstruct_upsert(&u.id, &projection, |id| items.projection(id))
                    .unwrap();
            }
            Op::Remove(id) => {
                let key = user(*id, 0).id;
                server.remove(&key);
                items.remove(&key, false, now, now, Instant::now());
                query.reconstruct_removed(&key);
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        /// Property: inserting new identities reconstructs exactly the
        /// from-scratch result.
        #[test]
        fn prop_inserts_match_full_evaluation(
            ages in proptest::collection::vec(0u32..60, 0..6),
            new_ages in proptest::collection::vec(0u32..60, 1..6),
            limit in 1usize..5,
        ) {
            let spec = spec(limit);
            let mut server = BTreeMap::new();
            let mut items = ItemStore::new();
            for (i, age) in ages.iter().enumerate() {
                let u = user(i as u8, *age);
                let projection = serde_json::to_value(&u).unwrap();
                items.upsert(u.id.clone(), u.clone(), projection, Utc::now(), Utc::now(), Instant::now());
                server.insert(u.id.clone(), u);
            }
            let mut query = CachedQuery::new(spec.clone(), Instant::now());
            let initial: Vec<String> = spec.evaluate(server.values().cloned()).into_iter().map(|u| u.id).collect();
            query.install(initial, Utc::now());

            for (offset, age) in new_ages.iter().enumerate() {
                let op = Op::Upsert((ages.len() + offset) as u8, *age);
                apply(&op, &mut server, &mut items, &mut query);
            }

            let expected = spec.evaluate(server.values().cloned());
            prop_assert_eq!(query.materialize(&items).unwrap(), expected);
        }

        /// Property: after arbitrary upserts and removals every cached member
        /// is live, matches the filter, is correctly ordered, and the limit holds.
        #[test]
        fn prop_reconstruction_preserves_invariants(
            ops in proptest::collection::vec(arb_op(), 0..40),
            limit in 1usize..5,
        ) {
            let spec = spec(limit);
            let mut server = BTreeMap::new();
            let mut items = ItemStore::new();
            let mut query = CachedQuery::new(spec.clone(), Instant::now());
            query.install(Vec::new(), Utc::now());

            for op in &ops {
                apply(op, &mut server, &mut items, &mut query);
            }

            let values = query.materialize(&items).unwrap();
            prop_assert!(values.len() <= limit);
            for value in &values {
                prop_assert_eq!(server.get(&value.id), Some(value));
                prop_assert!(value.age >= 18);
            }
        }
    }
}
