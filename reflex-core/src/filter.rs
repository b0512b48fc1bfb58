//! Filter expressions for cached queries
//!
//! A [`FilterExpr`] is evaluated against the JSON projection of a model, so
//! the same expression can be shipped to the remote API, to a push channel,
//! and evaluated locally when a query result is reconstructed from a single
//! item change.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (for strings) or element (for arrays)
    Contains,
    /// In list of values
    In,
}

/// Filter expression tree.
///
/// A comparison against a missing field never matches, including `Ne`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FilterExpr {
    /// Matches every record.
    All,
    /// Field comparison.
    Compare {
        /// Field to filter on (dotted paths address nested objects)
        field: String,
        /// Operator to apply
        operator: FilterOperator,
        /// Value to compare against
        value: Value,
    },
    /// Logical AND
    And { all: Vec<FilterExpr> },
    /// Logical OR
    Or { any: Vec<FilterExpr> },
    /// Logical NOT
    Not { expr: Box<FilterExpr> },
}

impl Default for FilterExpr {
    fn default() -> Self {
        Self::All
    }
}

impl FilterExpr {
    /// Create a new comparison expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self::Compare {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create an inequality filter.
    pub fn ne(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Ne, value)
    }

    /// Create a greater-than filter.
    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Gt, value)
    }

    /// Create a greater-than-or-equal filter.
    pub fn gte(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Gte, value)
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Lt, value)
    }

    /// Create a less-than-or-equal filter.
    pub fn lte(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Lte, value)
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    /// Create a membership filter. `values` should be a JSON array.
    pub fn one_of(field: impl Into<String>, values: Value) -> Self {
        Self::new(field, FilterOperator::In, values)
    }

    /// Combine with another expression using AND.
    pub fn and(self, other: FilterExpr) -> Self {
        match self {
            Self::And { mut all } => {
                all.push(other);
                Self::And { all }
            }
            Self::All => other,
            first => Self::And {
                all: vec![first, other],
            },
        }
    }

    /// Combine with another expression using OR.
    pub fn or(self, other: FilterExpr) -> Self {
        match self {
            Self::Or { mut any } => {
                any.push(other);
                Self::Or { any }
            }
            first => Self::Or {
                any: vec![first, other],
            },
        }
    }

    /// Negate an expression.
    pub fn negate(expr: FilterExpr) -> Self {
        Self::Not {
            expr: Box::new(expr),
        }
    }

    /// Evaluate this expression against a JSON record.
    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Self::All => true,
            Self::Compare {
                field,
                operator,
                value,
            } => match lookup(record, field) {
                Some(actual) => compare(actual, *operator, value),
                None => false,
            },
            Self::And { all } => all.iter().all(|expr| expr.matches(record)),
            Self::Or { any } => any.iter().any(|expr| expr.matches(record)),
            Self::Not { expr } => !expr.matches(record),
        }
    }
}

/// Resolve a dotted field path inside a JSON record.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |current, segment| current.get(segment))
}

fn compare(actual: &Value, operator: FilterOperator, expected: &Value) -> bool {
    match operator {
        FilterOperator::Eq => values_equal(actual, expected),
        FilterOperator::Ne => !values_equal(actual, expected),
        FilterOperator::Gt => partial_cmp(actual, expected) == Some(Ordering::Greater),
        FilterOperator::Gte => matches!(
            partial_cmp(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::Lt => partial_cmp(actual, expected) == Some(Ordering::Less),
        FilterOperator::Lte => matches!(
            partial_cmp(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            _ => false,
        },
        FilterOperator::In => match expected {
            Value::Array(candidates) => candidates.iter().any(|c| values_equal(actual, c)),
            _ => false,
        },
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || partial_cmp(a, b) == Some(Ordering::Equal)
}

/// Compare two scalar JSON values of the same kind.
///
/// Numbers compare numerically, strings lexically, booleans false < true.
/// Values of different kinds (or non-scalars) are incomparable.
pub fn partial_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order over JSON values, used for sorting.
///
/// Values of the same scalar kind use [`partial_cmp`]; otherwise values are
/// ranked by kind (null < bool < number < string < array < object), and
/// non-scalars of the same kind fall back to their serialized text.
pub fn total_cmp(a: &Value, b: &Value) -> Ordering {
    if let Some(ordering) = partial_cmp(a, b) {
        return ordering;
    }
    let rank = kind_rank(a).cmp(&kind_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    a.to_string().cmp(&b.to_string())
}

fn kind_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Property: NOT inverts every comparison on a present field.
        #[test]
        fn prop_negation_inverts(age in 0u32..120, threshold in 0u32..120) {
            let record = json!({ "age": age });
            let expr = FilterExpr::gt("age", json!(threshold));
            prop_assert_eq!(FilterExpr::negate(expr.clone()).matches(&record), !expr.matches(&record));
        }

        /// Property: Gt and Lte partition numeric records.
        #[test]
        fn prop_gt_lte_partition(age in -1000i64..1000, threshold in -1000i64..1000) {
            let record = json!({ "age": age });
            let gt = FilterExpr::gt("age", json!(threshold)).matches(&record);
            let lte = FilterExpr::lte("age", json!(threshold)).matches(&record);
            prop_assert!(gt ^ lte);
        }

        /// Property: total_cmp is antisymmetric on strings and numbers.
        #[test]
        fn prop_total_cmp_antisymmetric(a in any::<i32>(), b in "[a-z]{0,6}") {
            let x = json!(a);
            let y = json!(b);
            prop_assert_eq!(total_cmp(&x, &y), total_cmp(&y, &x).reverse());
        }
    }
}
