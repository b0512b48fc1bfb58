//! Query specifications and result ordering

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::filter::{lookup, total_cmp, FilterExpr};
use crate::identity::Model;

/// Sort direction for one ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// One `(field, direction)` ordering key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Result ordering for a query.
///
/// Keys are applied left to right. Records missing a sort field rank after
/// records that have it, regardless of direction. Callers that need a total
/// order break the remaining ties by identity (see [`QuerySpec::rank`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct OrderBy {
    keys: Vec<SortKey>,
}

impl OrderBy {
    /// No explicit ordering; results are ordered by identity.
    pub fn none() -> Self {
        Self::default()
    }

    /// Order by `field` ascending.
    pub fn asc(field: impl Into<String>) -> Self {
        Self::none().then_asc(field)
    }

    /// Order by `field` descending.
    pub fn desc(field: impl Into<String>) -> Self {
        Self::none().then_desc(field)
    }

    /// Add an ascending tie-break key.
    pub fn then_asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push(SortKey {
            field: field.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    /// Add a descending tie-break key.
    pub fn then_desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push(SortKey {
            field: field.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    pub fn keys(&self) -> &[SortKey] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Compare two JSON records by the ordering keys only.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        for key in &self.keys {
            let ordering = match (lookup(a, &key.field), lookup(b, &key.field)) {
                (Some(x), Some(y)) => match key.direction {
                    SortDirection::Asc => total_cmp(x, y),
                    SortDirection::Desc => total_cmp(y, x),
                },
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// A cacheable query: filter, ordering and optional limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QuerySpec {
    pub filter: FilterExpr,
    #[serde(default)]
    pub order: OrderBy,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl QuerySpec {
    pub fn new(filter: FilterExpr) -> Self {
        Self {
            filter,
            order: OrderBy::none(),
            limit: None,
        }
    }

    /// Query matching every record.
    pub fn all() -> Self {
        Self::new(FilterExpr::All)
    }

    pub fn with_order(mut self, order: OrderBy) -> Self {
        self.order = order;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonical cache key for this query.
    ///
    /// Structurally equal specs produce equal keys.
    pub fn key(&self) -> QueryKey {
        match serde_json::to_string(self) {
            Ok(encoded) => QueryKey(encoded),
            Err(_) => QueryKey(format!("{:?}", self)),
        }
    }

    /// Whether a JSON record satisfies this query's filter.
    pub fn matches(&self, record: &Value) -> bool {
        self.filter.matches(record)
    }

    /// Rank two records: ordering keys first, identity ascending on ties.
    pub fn rank<Id: Ord>(&self, a: (&Id, &Value), b: (&Id, &Value)) -> Ordering {
        self.order.compare(a.1, b.1).then_with(|| a.0.cmp(b.0))
    }

    /// Whether `len` results have reached the limit.
    pub fn is_full(&self, len: usize) -> bool {
        self.limit.is_some_and(|limit| len >= limit)
    }

    /// Evaluate this query from scratch over a set of records.
    ///
    /// Records that fail to serialize are skipped.
    pub fn evaluate<M: Model>(&self, records: impl IntoIterator<Item = M>) -> Vec<M> {
        let mut ranked: Vec<(M::Id, Value, M)> = records
            .into_iter()
            .filter_map(|record| {
                let projection = serde_json::to_value(&record).ok()?;
                self.matches(&projection)
                    .then(|| (record.id(), projection, record))
            })
            .collect();
        ranked.sort_by(|a, b| self.rank((&a.0, &a.1), (&b.0, &b.1)));
        if let Some(limit) = self.limit {
            ranked.truncate(limit);
        }
        ranked.into_iter().map(|(_, _, record)| record).collect()
    }
}

/// Canonical, hashable key of a [`QuerySpec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Person {
        id: u32,
        age: Option<u32>,
        name: String,
    }

    impl Model for Person {
        type Id = u32;
        type Delta = ();

        fn entity_name() -> &'static str {
            "person"
        }

        fn id(&self) -> u32 {
            self.id
        }
    }

    fn person(id: u32, age: Option<u32>, name: &str) -> Person {
        Person {
            id,
            age,
            name: name.to_string(),
        }
    }

    #[test]
    fn test_key_is_structural() {
        let a = QuerySpec::new(FilterExpr::gt("age", json!(18)))
            .with_order(OrderBy::asc("age"))
            .with_limit(2);
        let b = QuerySpec::new(FilterExpr::gt("age", json!(18)))
            .with_order(OrderBy::asc("age"))
            .with_limit(2);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), a.clone().with_limit(3).key());
    }

    #[test]
    fn test_missing_sort_field_ranks_last() {
        let order = OrderBy::desc("age");
        assert_eq!(order.compare(&json!({"age": 1}), &json!({})), Ordering::Less);
        assert_eq!(order.compare(&json!({}), &json!({"age": 1})), Ordering::Greater);
        assert_eq!(order.compare(&json!({"age": 1}), &json!({"age": 5})), Ordering::Greater);
    }

    #[test]
    fn test_rank_breaks_ties_by_identity() {
        let spec = QuerySpec::all().with_order(OrderBy::asc("age"));
        let a = json!({"age": 30});
        assert_eq!(spec.rank((&1, &a), (&2, &a)), Ordering::Less);
        assert_eq!(spec.rank((&2, &a), (&1, &a)), Ordering::Greater);
    }

    #[test]
    fn test_evaluate_filters_sorts_and_limits() {
        let spec = QuerySpec::new(FilterExpr::gt("age", json!(18)))
            .with_order(OrderBy::asc("age").then_asc("name"))
            .with_limit(2);
        let records = vec![
            person(1, Some(40), "d"),
            person(2, Some(17), "a"),
            person(3, Some(20), "b"),
            person(4, None, "x"),
            person(5, Some(25), "c"),
        ];
        let ids: Vec<u32> = spec.evaluate(records).iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 5]);
    }

    #[test]
    fn test_is_full() {
        assert!(!QuerySpec::all().is_full(1000));
        assert!(QuerySpec::all().with_limit(2).is_full(2));
        assert!(!QuerySpec::all().with_limit(2).is_full(1));
    }
}
