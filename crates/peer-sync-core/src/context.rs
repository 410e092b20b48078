//! Shared application context and the merge rule applied to it.

use serde_json::{Map, Value};

/// Shared key/value state replicated between the two endpoints.
///
/// A stored context never contains `null` values: `null` is the
/// "absent" marker and removes the key during a merge.
pub type Context = Map<String, Value>;

/// Result of merging an incoming context into the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The merged context, already stripped of absent values.
    pub context: Context,
    /// Whether the merged context differs from the current one.
    pub changed: bool,
}

/// Merge `incoming` over `current`, key by key.
///
/// Every key in `incoming` overwrites the same key in `current`; keys whose
/// resulting value is `null` are dropped afterwards.
#[must_use]
pub fn merge(current: &Context, incoming: &Context) -> MergeOutcome {
    let mut context = current.clone();
    for (key, value) in incoming {
        context.insert(key.clone(), value.clone());
    }
    strip_absent(&mut context);

    let changed = context != *current;
    MergeOutcome { context, changed }
}

/// Remove every entry whose value is `null`.
pub fn strip_absent(context: &mut Context) {
    context.retain(|_, value| !value.is_null());
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_last_writer_wins_per_key() {
        let first = merge(&Context::new(), &ctx(json!({"a": 1, "b": 2})));
        assert!(first.changed);

        let second = merge(&first.context, &ctx(json!({"b": 3})));
        assert!(second.changed);
        assert_eq!(second.context, ctx(json!({"a": 1, "b": 3})));
    }

    #[test]
    fn test_absent_value_removes_key() {
        let outcome = merge(&ctx(json!({"a": 1})), &ctx(json!({"a": null})));
        assert!(outcome.changed);
        assert!(outcome.context.is_empty());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let incoming = ctx(json!({"theme": "dark", "count": 4}));
        let once = merge(&Context::new(), &incoming);
        let twice = merge(&once.context, &incoming);

        assert!(once.changed);
        assert!(!twice.changed);
        assert_eq!(once.context, twice.context);
    }

    #[test]
    fn test_absent_for_missing_key_is_unchanged() {
        let current = ctx(json!({"a": 1}));
        let outcome = merge(&current, &ctx(json!({"zzz": null})));
        assert!(!outcome.changed);
        assert_eq!(outcome.context, current);
    }

    #[test]
    fn test_nested_values_replace_whole() {
        let current = ctx(json!({"profile": {"name": "kit", "age": 3}}));
        let outcome = merge(&current, &ctx(json!({"profile": {"name": "kat"}})));
        assert_eq!(outcome.context, ctx(json!({"profile": {"name": "kat"}})));
    }
}
