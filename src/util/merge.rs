//! Deep merge over [`Value`](crate::envelope::Value), ported from
//! `weavegraph::utils::json_ext::deep_merge`.

use crate::envelope::Value;

/// Conflict resolution strategy for [`deep_merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Keep the left operand's scalar on conflict.
    PreferLeft,
    /// Keep the right operand's scalar on conflict (used by the `merge`
    /// transform's `shallow` mode and the tool-overlay merge).
    PreferRight,
    /// Recurse into maps; concatenate arrays; prefer right on scalar
    /// conflicts (used by the `merge` transform's `deep` mode and
    /// overlay merging, matching `weavegraph`'s `DeepMerge`).
    Deep,
}

/// Deep-merge two values. Two maps merge key-wise; two lists concatenate
/// under [`MergeStrategy::Deep`] or pick one side otherwise; anything else
/// falls back to the strategy's scalar rule.
pub fn deep_merge(left: &Value, right: &Value, strategy: MergeStrategy) -> Value {
    match (left, right) {
        (Value::Map(l), Value::Map(r)) => {
            let mut out = l.clone();
            for (k, rv) in r.iter() {
                match out.get(k) {
                    Some(lv) => {
                        let merged = deep_merge(lv, rv, strategy);
                        out.insert(k.clone(), merged);
                    }
                    None => {
                        out.insert(k.clone(), rv.clone());
                    }
                }
            }
            Value::Map(out)
        }
        (Value::List(l), Value::List(r)) => match strategy {
            MergeStrategy::PreferLeft => Value::List(l.clone()),
            MergeStrategy::PreferRight => Value::List(r.clone()),
            MergeStrategy::Deep => {
                let mut out = l.clone();
                out.extend(r.clone());
                Value::List(out)
            }
        },
        (l, r) if l == r => l.clone(),
        (l, r) => match strategy {
            MergeStrategy::PreferLeft => l.clone(),
            MergeStrategy::PreferRight | MergeStrategy::Deep => r.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_merge_combines_nested_maps() {
        let left = Value::map([("a", Value::Number(1.0)), ("b", Value::map([("x", Value::Number(10.0))]))]);
        let right = Value::map([("b", Value::map([("y", Value::Number(20.0))])), ("c", Value::Number(3.0))]);
        let merged = deep_merge(&left, &right, MergeStrategy::Deep);
        let expected = Value::map([
            ("a", Value::Number(1.0)),
            ("b", Value::map([("x", Value::Number(10.0)), ("y", Value::Number(20.0))])),
            ("c", Value::Number(3.0)),
        ]);
        assert_eq!(merged, expected);
    }

    #[test]
    fn prefer_left_keeps_left_scalar() {
        let left = Value::Number(1.0);
        let right = Value::Number(2.0);
        assert_eq!(deep_merge(&left, &right, MergeStrategy::PreferLeft), Value::Number(1.0));
    }
}
