//! Dot-path navigation over [`Value`](crate::envelope::Value) maps.
//!
//! Mirrors `weavegraph::utils::json_ext::{get_by_path, set_by_path}` but
//! operates on PetalFlow's typed `Value` instead of `serde_json::Value`,
//! and additionally supports deletion (needed by the guardian/transform
//! nodes, which the teacher's JSON helpers never required).

use crate::envelope::Value;

/// Read a value at a dot-separated path (`"a.b.c"`). An empty path returns
/// the root. Missing intermediates or a non-map encountered mid-path yield
/// `None` ("not found" per spec.md §4.1).
pub fn get_nested<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut current = root;
    for part in path.split('.') {
        match current {
            Value::Map(map) => current = map.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Write a value at a dot-separated path, creating intermediate maps as
/// needed. Fails only if an existing non-map value occupies an
/// intermediate segment.
pub fn set_nested(root: &mut Value, path: &str, value: Value) -> Result<(), DotPathError> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for part in &parts[..parts.len() - 1] {
        if !matches!(current, Value::Map(_)) {
            if matches!(current, Value::Null) {
                *current = Value::Map(Default::default());
            } else {
                return Err(DotPathError::NotAMap { path: path.to_string() });
            }
        }
        let Value::Map(map) = current else {
            unreachable!()
        };
        current = map
            .entry((*part).to_string())
            .or_insert_with(|| Value::Map(Default::default()));
    }
    let Value::Map(map) = current else {
        return Err(DotPathError::NotAMap { path: path.to_string() });
    };
    map.insert(parts[parts.len() - 1].to_string(), value);
    Ok(())
}

/// Remove a value at a dot-separated path, returning the removed value if
/// present.
pub fn remove_nested(root: &mut Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return None;
    }
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = root;
    for part in &parts[..parts.len() - 1] {
        match current {
            Value::Map(map) => current = map.get_mut(*part)?,
            _ => return None,
        }
    }
    match current {
        Value::Map(map) => map.remove(parts[parts.len() - 1]),
        _ => None,
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DotPathError {
    #[error("cannot set nested value: '{path}' traverses a non-map value")]
    NotAMap { path: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Value;

    #[test]
    fn get_missing_intermediate_is_none() {
        let root = Value::map([("a", Value::String("x".into()))]);
        assert!(get_nested(&root, "a.b").is_none());
    }

    #[test]
    fn set_creates_intermediates() {
        let mut root = Value::Map(Default::default());
        set_nested(&mut root, "a.b.c", Value::Number(1.0)).unwrap();
        assert_eq!(get_nested(&root, "a.b.c"), Some(&Value::Number(1.0)));
    }

    #[test]
    fn remove_returns_value() {
        let mut root = Value::Map(Default::default());
        set_nested(&mut root, "a.b", Value::Bool(true)).unwrap();
        let removed = remove_nested(&mut root, "a.b");
        assert_eq!(removed, Some(Value::Bool(true)));
        assert!(get_nested(&root, "a.b").is_none());
    }

    #[test]
    fn set_on_non_map_fails() {
        let mut root = Value::String("leaf".into());
        let err = set_nested(&mut root, "a.b", Value::Bool(true));
        assert!(err.is_err());
    }
}
