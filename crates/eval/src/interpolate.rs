//! `$(jsonpath)$` substitution over template trees.

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::Value;

use crate::jsonpath::{self, JsonPathError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InterpolateError {
    #[error("evaluate tag $({expression})$: {source}")]
    Evaluate { expression: String, source: JsonPathError },
    #[error("tag must not point to nil value: {0}")]
    NilValue(String),
    #[error("tag pattern: {0}")]
    Pattern(String),
}

impl InterpolateError {
    /// Expression that could not be resolved because nothing is at its path.
    pub fn missing_expression(&self) -> Option<&str> {
        match self {
            InterpolateError::Evaluate { expression, source } if source.is_missing() => Some(expression),
            _ => None,
        }
    }
}

static TAG: OnceCell<Regex> = OnceCell::new();

fn tag_re() -> Result<&'static Regex, InterpolateError> {
    TAG.get_or_try_init(|| Regex::new(r"\$\((.+?)\)\$")).map_err(|e| InterpolateError::Pattern(e.to_string()))
}

fn is_single_tag(s: &str) -> bool {
    s.starts_with("$(") && s.ends_with(")$") && s.matches("$(").count() == 1
}

fn eval(expression: &str, ctx: &Value) -> Result<Value, InterpolateError> {
    jsonpath::evaluate_single(expression.trim(), ctx)
        .map_err(|source| InterpolateError::Evaluate { expression: expression.to_string(), source })
}

/// Substitute one string leaf; a lone tag keeps the referenced value's type.
pub fn interpolate_str(s: &str, ctx: &Value) -> Result<Value, InterpolateError> {
    if is_single_tag(s) {
        return eval(&s[2..s.len() - 2], ctx);
    }
    let re = tag_re()?;
    if !re.is_match(s) {
        return Ok(Value::String(s.to_string()));
    }
    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in re.captures_iter(s) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else { continue };
        out.push_str(&s[last..whole.start()]);
        match eval(expr.as_str(), ctx)? {
            Value::Null => return Err(InterpolateError::NilValue(expr.as_str().to_string())),
            Value::String(v) => out.push_str(&v),
            other => out.push_str(&other.to_string()),
        }
        last = whole.end();
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}

/// Walk a template tree and substitute every string leaf. Keys are left alone.
pub fn interpolate(raw: &Value, ctx: &Value) -> Result<Value, InterpolateError> {
    match raw {
        Value::String(s) => interpolate_str(s, ctx),
        Value::Array(items) => items.iter().map(|v| interpolate(v, ctx)).collect::<Result<Vec<_>, _>>().map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), interpolate(v, ctx)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> Value {
        json!({
            "workload": {"metadata": {"name": "w"}},
            "params": {"port": 8080, "tags": ["a", "b"], "empty": null},
            "source": {"url": "https://git/x", "revision": "abc"}
        })
    }

    #[test]
    fn whole_string_keeps_type() {
        let out = interpolate(&json!({"port": "$(params.port)$", "tags": "$(params.tags)$"}), &ctx()).unwrap();
        assert_eq!(out, json!({"port": 8080, "tags": ["a", "b"]}));
    }

    #[test]
    fn embedded_tags_coerce_to_string() {
        let out = interpolate(&json!("$(workload.metadata.name)$-$(params.port)$ @ $(source.url)$"), &ctx()).unwrap();
        assert_eq!(out, json!("w-8080 @ https://git/x"));
    }

    #[test]
    fn nested_structures_are_walked() {
        let raw = json!({"spec": {"items": [{"url": "$(source.url)$"}, 3, true]}});
        let out = interpolate(&raw, &ctx()).unwrap();
        assert_eq!(out, json!({"spec": {"items": [{"url": "https://git/x"}, 3, true]}}));
    }

    #[test]
    fn unresolved_path_fails_fast() {
        let err = interpolate(&json!({"a": "$(sources.source.url)$"}), &ctx()).unwrap_err();
        assert_eq!(err.missing_expression(), Some("sources.source.url"));
        let err = interpolate(&json!("x-$(params.empty)$"), &ctx()).unwrap_err();
        assert!(matches!(err, InterpolateError::NilValue(_)));
    }

    #[test]
    fn second_pass_is_identity() {
        let raw = json!({"url": "$(source.url)$", "name": "$(workload.metadata.name)$-x", "n": 1});
        let once = interpolate(&raw, &ctx()).unwrap();
        let twice = interpolate(&once, &ctx()).unwrap();
        assert_eq!(once, twice);
    }
}
