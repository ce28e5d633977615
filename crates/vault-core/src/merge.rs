//! Field-level merging of context data maps.
//!
//! `latest` keeps, per key, the value from the most recently updated
//! context. `combine` accumulates every value for a key into a sequence,
//! walking contexts in the order given; it is order-sensitive and not
//! idempotent.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    #[default]
    Latest,
    Combine,
}

impl MergeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MergeStrategy::Latest => "latest",
            MergeStrategy::Combine => "combine",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest" => Ok(MergeStrategy::Latest),
            "combine" => Ok(MergeStrategy::Combine),
            other => Err(Error::invalid(format!(
                "unsupported merge strategy '{other}' (expected 'latest' or 'combine')"
            ))),
        }
    }
}

/// Merge the `data` maps of `contexts` under `strategy`.
pub fn merge_data(contexts: &[Context], strategy: MergeStrategy) -> Map<String, Value> {
    match strategy {
        MergeStrategy::Latest => merge_latest(contexts),
        MergeStrategy::Combine => merge_combine(contexts),
    }
}

fn merge_latest(contexts: &[Context]) -> Map<String, Value> {
    let mut by_recency: Vec<&Context> = contexts.iter().collect();
    // Stable: equal timestamps keep input order.
    by_recency.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    let mut merged = Map::new();
    for context in by_recency {
        for (key, value) in &context.data {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

fn merge_combine(contexts: &[Context]) -> Map<String, Value> {
    let mut merged = Map::new();
    for context in contexts {
        for (key, value) in &context.data {
            match merged.get_mut(key) {
                Some(existing) => combine_value(existing, value.clone()),
                None => {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
    }
    merged
}

/// Fold `incoming` into an existing slot.
///
/// A sequence slot is extended with the elements of a sequence, or gains a
/// non-sequence as one element. Any other slot becomes `[existing, incoming]`.
pub fn combine_value(slot: &mut Value, incoming: Value) {
    match slot {
        Value::Array(items) => match incoming {
            Value::Array(more) => items.extend(more),
            single => items.push(single),
        },
        existing => {
            let old = existing.take();
            *existing = Value::Array(vec![old, incoming]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Timestamp;
    use proptest::prelude::*;
    use serde_json::json;

    fn ctx(id: &str, updated_ms: i64, data: Value) -> Context {
        Context {
            id: id.to_string(),
            user_id: format!("user-of-{id}"),
            context_type: format!("type-of-{id}"),
            data: data.as_object().cloned().unwrap_or_default(),
            metadata: Map::new(),
            created_at: Timestamp::from_unix_millis(0),
            updated_at: Timestamp::from_unix_millis(updated_ms),
        }
    }

    #[test]
    fn test_parse_strategy() {
        assert_eq!("latest".parse::<MergeStrategy>().unwrap(), MergeStrategy::Latest);
        assert_eq!("combine".parse::<MergeStrategy>().unwrap(), MergeStrategy::Combine);
        let err = "union".parse::<MergeStrategy>().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!("Latest".parse::<MergeStrategy>().is_err());
    }

    #[test]
    fn test_latest_newer_value_wins() {
        let a = ctx("a", 1_000, json!({"x": 1}));
        let b = ctx("b", 2_000, json!({"x": 2, "y": 3}));
        let merged = merge_data(&[a, b], MergeStrategy::Latest);
        assert_eq!(Value::Object(merged), json!({"x": 2, "y": 3}));
    }

    #[test]
    fn test_latest_ignores_input_order() {
        let a = ctx("a", 1_000, json!({"x": 1, "only_a": true}));
        let b = ctx("b", 2_000, json!({"x": 2}));
        let forward = merge_data(&[a.clone(), b.clone()], MergeStrategy::Latest);
        let backward = merge_data(&[b, a], MergeStrategy::Latest);
        assert_eq!(forward, backward);
        assert_eq!(forward["only_a"], json!(true));
    }

    #[test]
    fn test_latest_tie_keeps_first_given() {
        let a = ctx("a", 1_000, json!({"x": "first"}));
        let b = ctx("b", 1_000, json!({"x": "second"}));
        let merged = merge_data(&[a, b], MergeStrategy::Latest);
        assert_eq!(merged["x"], json!("first"));
    }

    #[test]
    fn test_combine_extends_sequences() {
        let a = ctx("a", 0, json!({"tags": [1, 2]}));
        let b = ctx("b", 0, json!({"tags": [3]}));
        let merged = merge_data(&[a, b], MergeStrategy::Combine);
        assert_eq!(merged["tags"], json!([1, 2, 3]));
    }

    #[test]
    fn test_combine_pairs_scalars() {
        let a = ctx("a", 0, json!({"name": "a"}));
        let b = ctx("b", 0, json!({"name": "b"}));
        let merged = merge_data(&[a, b], MergeStrategy::Combine);
        assert_eq!(merged["name"], json!(["a", "b"]));
    }

    #[test]
    fn test_combine_third_write_appends() {
        let a = ctx("a", 0, json!({"name": "a"}));
        let b = ctx("b", 0, json!({"name": "b"}));
        let c = ctx("c", 0, json!({"name": "c"}));
        let merged = merge_data(&[a, b, c], MergeStrategy::Combine);
        assert_eq!(merged["name"], json!(["a", "b", "c"]));
    }

    #[test]
    fn test_combine_is_order_sensitive() {
        let a = ctx("a", 0, json!({"v": "a"}));
        let b = ctx("b", 0, json!({"v": ["b"]}));
        let ab = merge_data(&[a.clone(), b.clone()], MergeStrategy::Combine);
        let ba = merge_data(&[b, a], MergeStrategy::Combine);
        assert_eq!(ab["v"], json!(["a", ["b"]]));
        assert_eq!(ba["v"], json!(["b", "a"]));
    }

    #[test]
    fn test_combine_keeps_unique_keys() {
        let a = ctx("a", 0, json!({"x": 1}));
        let b = ctx("b", 0, json!({"y": {"nested": true}}));
        let merged = merge_data(&[a, b], MergeStrategy::Combine);
        assert_eq!(Value::Object(merged), json!({"x": 1, "y": {"nested": true}}));
    }

    #[test]
    fn test_combine_does_not_touch_sources() {
        let a = ctx("a", 0, json!({"tags": [1]}));
        let b = ctx("b", 0, json!({"tags": [2]}));
        let sources = [a, b];
        merge_data(&sources, MergeStrategy::Combine);
        assert_eq!(sources[0].data["tags"], json!([1]));
    }

    #[test]
    fn test_empty_input_merges_to_empty() {
        assert!(merge_data(&[], MergeStrategy::Latest).is_empty());
        assert!(merge_data(&[], MergeStrategy::Combine).is_empty());
    }

    proptest! {
        #[test]
        fn latest_keeps_every_key(
            first in proptest::collection::btree_map("[a-d]", 0i64..100, 0..4),
            second in proptest::collection::btree_map("[a-d]", 0i64..100, 0..4),
        ) {
            let a = ctx("a", 1, json!(first));
            let b = ctx("b", 2, json!(second));
            let merged = merge_data(&[a, b], MergeStrategy::Latest);
            for (k, v) in &second {
                prop_assert_eq!(&merged[k], &json!(v));
            }
            for (k, v) in &first {
                if !second.contains_key(k) {
                    prop_assert_eq!(&merged[k], &json!(v));
                }
            }
            prop_assert_eq!(merged.len(), first.keys().chain(second.keys()).collect::<std::collections::BTreeSet<_>>().len());
        }

        #[test]
        fn combine_of_sequences_concatenates(
            first in proptest::collection::vec(0i64..100, 0..5),
            second in proptest::collection::vec(0i64..100, 0..5),
        ) {
            let a = ctx("a", 0, json!({"k": first}));
            let b = ctx("b", 0, json!({"k": second}));
            let merged = merge_data(&[a, b], MergeStrategy::Combine);
            let expected: Vec<i64> = first.iter().chain(second.iter()).copied().collect();
            prop_assert_eq!(&merged["k"], &json!(expected));
        }
    }
}
