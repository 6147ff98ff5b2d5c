//! Health rules: per-resource `Healthy` and the owner-level `ResourcesHealthy` rollup.

use carto_core::condition_manager::ConditionManager;
use carto_core::conditions::{self, condition, ConditionStatus};
use carto_core::status::{RealizedResource, ResourceStatus};
use carto_core::template::{HealthMatchFieldRequirement, HealthMatchRule, HealthRule, MultiMatchHealthRule, TemplateKind};
use carto_core::Condition;
use serde_json::Value;

use crate::jsonpath;
use crate::output::text;
use crate::selector::field_matches;

fn healthy(status: ConditionStatus, reason: &str, message: impl Into<String>) -> Condition {
    condition(conditions::HEALTHY, status, reason, message)
}

fn object_condition<'a>(obj: &'a Value, type_: &str) -> Option<&'a Value> {
    obj.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn field<'a>(c: &'a Value, key: &str) -> &'a str {
    c.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Compute the `Healthy` condition for one resource.
pub fn determine_health(rule: Option<&HealthRule>, realized: Option<&RealizedResource>, stamped: Option<&Value>) -> Condition {
    let Some(rule) = rule else {
        let Some(realized) = realized else {
            return healthy(ConditionStatus::Unknown, conditions::NO_RESOURCE, "");
        };
        if !realized.outputs.is_empty() {
            return healthy(ConditionStatus::True, conditions::OUTPUT_AVAILABLE, "");
        }
        let plain = realized
            .template_ref
            .as_ref()
            .map(|t| t.kind == TemplateKind::Template.kind())
            .unwrap_or(false);
        if plain {
            return healthy(ConditionStatus::True, conditions::ALWAYS_HEALTHY, "");
        }
        return healthy(ConditionStatus::Unknown, conditions::OUTPUT_NOT_AVAILABLE, "");
    };

    if rule.always_healthy.is_some() {
        return healthy(ConditionStatus::True, conditions::ALWAYS_HEALTHY, "");
    }
    match (stamped, rule.single_condition_type.as_deref(), rule.multi_match.as_ref()) {
        (Some(obj), Some(type_), _) if !type_.is_empty() => single_condition(type_, obj),
        (Some(obj), _, Some(mm)) => multi_match(mm, obj),
        _ => healthy(ConditionStatus::Unknown, conditions::UNKNOWN, ""),
    }
}

fn single_condition(type_: &str, obj: &Value) -> Condition {
    let reason = format!("{type_}Condition");
    match object_condition(obj, type_) {
        Some(c) => {
            let status = match field(c, "status") {
                "True" => ConditionStatus::True,
                "False" => ConditionStatus::False,
                _ => ConditionStatus::Unknown,
            };
            healthy(status, &reason, field(c, "message"))
        }
        None => healthy(
            ConditionStatus::Unknown,
            &reason,
            format!("condition with type [{type_}] not found on resource status"),
        ),
    }
}

fn field_message(req: &HealthMatchFieldRequirement, obj: &Value) -> String {
    let value = jsonpath::evaluate_single(&req.requirement.key, obj)
        .map(|v| text(&v))
        .unwrap_or_else(|_| "<error retrieving field value>".to_string());
    let path = req.message_path.as_deref().unwrap_or_default();
    let message = jsonpath::evaluate_single(path, obj)
        .map(|v| text(&v))
        .unwrap_or_else(|_| format!("unknown, error retrieving message path [{path}]"));
    format!("field value: {value}, message: {message}")
}

fn condition_message(c: &Value) -> String {
    format!("condition status: {}, message: {}", field(c, "status"), field(c, "message"))
}

fn multi_match(rule: &MultiMatchHealthRule, obj: &Value) -> Condition {
    if let Some(c) = any_unhealthy(&rule.unhealthy, obj) {
        return c;
    }
    if let Some(c) = all_healthy(&rule.healthy, obj) {
        return c;
    }
    healthy(ConditionStatus::Unknown, conditions::NO_MATCHES_FULFILLED, "")
}

fn any_unhealthy(rule: &HealthMatchRule, obj: &Value) -> Option<Condition> {
    for req in &rule.match_conditions {
        if let Some(c) = object_condition(obj, &req.type_).filter(|c| field(c, "status") == req.status) {
            return Some(healthy(ConditionStatus::False, conditions::MATCHED_CONDITION, condition_message(c)));
        }
    }
    for req in &rule.match_fields {
        if field_matches(&req.requirement, obj).unwrap_or(false) {
            return Some(healthy(ConditionStatus::False, conditions::MATCHED_FIELD, field_message(req, obj)));
        }
    }
    None
}

fn all_healthy(rule: &HealthMatchRule, obj: &Value) -> Option<Condition> {
    let mut first: Option<(&str, String)> = None;
    for req in &rule.match_conditions {
        let c = object_condition(obj, &req.type_).filter(|c| field(c, "status") == req.status)?;
        if first.is_none() {
            first = Some((conditions::MATCHED_CONDITION, condition_message(c)));
        }
    }
    for req in &rule.match_fields {
        if !field_matches(&req.requirement, obj).unwrap_or(false) {
            return None;
        }
        if first.is_none() {
            first = Some((conditions::MATCHED_FIELD, field_message(req, obj)));
        }
    }
    let (reason, message) =
        first.unwrap_or((conditions::MATCHED_RULES, "no healthy requirements declared".to_string()));
    Some(healthy(ConditionStatus::True, reason, message))
}

/// Fold every resource's `Healthy` into the owner's `ResourcesHealthy`.
pub fn owner_health_condition(resources: &[ResourceStatus], previous: &[Condition]) -> Condition {
    let prev = conditions::find(previous, conditions::RESOURCES_HEALTHY).cloned();
    let mut manager = ConditionManager::new(conditions::RESOURCES_HEALTHY, &[]);
    for r in resources {
        if let Some(c) = conditions::find(&r.conditions, conditions::HEALTHY) {
            manager.add_positive(c.clone());
        }
    }
    let (mut all, _) = manager.finalize();
    let mut parent = all.pop().unwrap_or_else(|| condition(conditions::RESOURCES_HEALTHY, ConditionStatus::Unknown, conditions::UNKNOWN, ""));
    parent.reason = conditions::HEALTHY_CONDITION_RULE.to_string();
    if let Some(prev) = prev.filter(|p| conditions::same_state(p, &parent)) {
        parent.last_transition_time = prev.last_transition_time;
    }
    parent
}
