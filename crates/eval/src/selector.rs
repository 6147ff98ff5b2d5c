//! Label and field selector matching for blueprint and template-option selection.

use std::collections::BTreeMap;

use carto_core::blueprint::{BlueprintSpec, FieldSelectorOperator, FieldSelectorRequirement, OptionSelector, TemplateOption};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;
use serde_json::Value;

use crate::jsonpath::{JsonPath, JsonPathError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SelectorError {
    #[error("selector labels or matchExpressions are not valid: operator [{0}] is not supported")]
    InvalidOperator(String),
    #[error("unable to match field requirement with key [{key}] operator [{operator:?}] values [{values:?}]: {source}")]
    Field { key: String, operator: FieldSelectorOperator, values: Vec<String>, source: JsonPathError },
}

pub fn matches_labels(labels: &BTreeMap<String, String>, want: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| labels.get(k) == Some(v))
}

pub fn matches_expressions(labels: &BTreeMap<String, String>, exprs: &[LabelSelectorRequirement]) -> Result<bool, SelectorError> {
    for req in exprs {
        let values = req.values.as_deref().unwrap_or_default();
        let have = labels.get(&req.key);
        let ok = match req.operator.as_str() {
            "In" => have.map(|v| values.contains(v)).unwrap_or(false),
            "NotIn" => have.map(|v| !values.contains(v)).unwrap_or(true),
            "Exists" => have.is_some(),
            "DoesNotExist" => have.is_none(),
            other => return Err(SelectorError::InvalidOperator(other.to_string())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluate one field requirement; a path with nothing behind it counts as absent.
pub fn field_matches(req: &FieldSelectorRequirement, obj: &Value) -> Result<bool, SelectorError> {
    let wrap = |source| SelectorError::Field {
        key: req.key.clone(),
        operator: req.operator,
        values: req.values.clone(),
        source,
    };
    let path = JsonPath::parse(&req.key).map_err(wrap)?;
    let found = path.evaluate(obj);
    let actual = match found.len() {
        0 => None,
        1 => Some(as_text(found[0])),
        _ => return Err(wrap(JsonPathError::TooManyResults(req.key.clone()))),
    };
    Ok(match req.operator {
        FieldSelectorOperator::In => actual.map(|a| req.values.contains(&a)).unwrap_or(false),
        FieldSelectorOperator::NotIn => actual.map(|a| !req.values.contains(&a)).unwrap_or(true),
        FieldSelectorOperator::Exists => actual.is_some(),
        FieldSelectorOperator::DoesNotExist => actual.is_none(),
    })
}

pub fn matches_all_fields(reqs: &[FieldSelectorRequirement], obj: &Value) -> Result<bool, SelectorError> {
    for r in reqs {
        if !field_matches(r, obj)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Full selector match: labels, label expressions and field requirements all hold.
///
/// An empty selector matches nothing.
pub fn selector_matches(
    match_labels: &BTreeMap<String, String>,
    match_expressions: &[LabelSelectorRequirement],
    match_fields: &[FieldSelectorRequirement],
    labels: &BTreeMap<String, String>,
    obj: &Value,
) -> Result<bool, SelectorError> {
    if match_labels.is_empty() && match_expressions.is_empty() && match_fields.is_empty() {
        return Ok(false);
    }
    if !matches_labels(labels, match_labels) || !matches_expressions(labels, match_expressions)? {
        return Ok(false);
    }
    matches_all_fields(match_fields, obj)
}

pub fn blueprint_matches(spec: &BlueprintSpec, labels: &BTreeMap<String, String>, owner: &Value) -> Result<bool, SelectorError> {
    selector_matches(&spec.selector, &spec.selector_match_expressions, &spec.selector_match_fields, labels, owner)
}

pub fn option_matches(sel: &OptionSelector, labels: &BTreeMap<String, String>, owner: &Value) -> Result<bool, SelectorError> {
    selector_matches(&sel.match_labels, &sel.match_expressions, &sel.match_fields, labels, owner)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OptionSelectionError {
    #[error("error matching against template option [{option}]: {source}")]
    Resolve { option: String, source: SelectorError },
    #[error("template option [{0}] uses passThrough which is not supported")]
    PassThrough(String),
    #[error("expected exactly 1 option to match, found [{}] matching options {}", .0.len(), fmt_names(.0))]
    Match(Vec<String>),
}

fn fmt_names(names: &[String]) -> String {
    if names.is_empty() {
        String::new()
    } else {
        format!("[{}]", names.join(", "))
    }
}

/// Pick the single option whose selector matches the owner.
pub fn select_option<'a>(
    options: &'a [TemplateOption],
    labels: &BTreeMap<String, String>,
    owner: &Value,
) -> Result<&'a TemplateOption, OptionSelectionError> {
    let mut matched = Vec::new();
    for opt in options {
        let hit = option_matches(&opt.selector, labels, owner)
            .map_err(|source| OptionSelectionError::Resolve { option: opt.name.clone(), source })?;
        if hit {
            matched.push(opt);
        }
    }
    match matched.as_slice() {
        [one] if one.pass_through.is_some() => Err(OptionSelectionError::PassThrough(one.name.clone())),
        [one] => Ok(one),
        many => Err(OptionSelectionError::Match(many.iter().map(|o| o.name.clone()).collect())),
    }
}
