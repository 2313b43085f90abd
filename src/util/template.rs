//! Minimal `{{expr}}` text-template renderer used by the LLM node's
//! `PromptTemplate` and the transform node's `template` operation (spec.md
//! §4.3, §4.6).
//!
//! No templating crate appears anywhere in the pack, so this is hand-rolled
//! in the same small-regex style as `tools::manifest`'s name pattern: a
//! single compiled `Regex` finds `{{...}}` markers, each body is a dot path
//! optionally followed by `| helper[:arg]` pipe stages.

use regex::Regex;
use std::sync::LazyLock;

use crate::envelope::Value;
use crate::util::dotpath;

static MARKER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").unwrap());

/// True if `template` contains at least one `{{...}}` marker. The LLM node
/// falls back to `input_text` concatenation when a rendered template has
/// none (spec.md §4.3).
pub fn has_markers(template: &str) -> bool {
    MARKER_RE.is_match(template)
}

/// Render every `{{expr}}` marker against `context` (a `Value::Map`),
/// resolving dot paths and applying pipe helpers left to right. Unknown
/// paths render as an empty string; unknown helpers pass their input
/// through unchanged.
pub fn render(template: &str, context: &Value) -> String {
    MARKER_RE
        .replace_all(template, |caps: &regex::Captures| render_expr(&caps[1], context))
        .into_owned()
}

fn render_expr(expr: &str, context: &Value) -> String {
    let mut stages = expr.split('|').map(str::trim);
    let path = stages.next().unwrap_or("");
    let mut current = dotpath::get_nested(context, path).cloned().unwrap_or(Value::Null);

    for stage in stages {
        current = apply_helper(stage, current, context);
    }
    current.render_text()
}

fn apply_helper(stage: &str, value: Value, context: &Value) -> Value {
    let (name, arg) = match stage.split_once(':') {
        Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
        None => (stage.trim(), None),
    };
    match name {
        "json" => Value::String(serde_json::to_string(&value.to_json()).unwrap_or_default()),
        "upper" => Value::String(value.render_text().to_uppercase()),
        "lower" => Value::String(value.render_text().to_lowercase()),
        "default" => {
            if value.is_null() {
                arg.map(Value::from).unwrap_or(Value::Null)
            } else {
                value
            }
        }
        "coalesce" => {
            if !value.is_null() {
                value
            } else {
                arg.and_then(|path| dotpath::get_nested(context, path).cloned()).unwrap_or(Value::Null)
            }
        }
        _ => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Value {
        Value::map([
            ("name", Value::from("ana")),
            ("count", Value::Number(3.0)),
            ("input", Value::map([("y", Value::from("hi"))])),
        ])
    }

    #[test]
    fn renders_simple_path() {
        assert_eq!(render("hello {{name}}", &ctx()), "hello ana");
    }

    #[test]
    fn renders_nested_path() {
        assert_eq!(render("{{input.y}}!", &ctx()), "hi!");
    }

    #[test]
    fn missing_path_renders_empty() {
        assert_eq!(render("[{{missing}}]", &ctx()), "[]");
    }

    #[test]
    fn upper_helper_transforms_text() {
        assert_eq!(render("{{name | upper}}", &ctx()), "ANA");
    }

    #[test]
    fn default_helper_substitutes_when_null() {
        assert_eq!(render("{{missing | default:\"none\"}}", &ctx()), "none");
    }

    #[test]
    fn has_markers_detects_interpolation() {
        assert!(has_markers("hi {{name}}"));
        assert!(!has_markers("plain text"));
    }
}
