//! Condition types, reasons and constructors.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

// Condition types
pub const READY: &str = "Ready";
pub const SUPPLY_CHAIN_READY: &str = "SupplyChainReady";
pub const DELIVERY_READY: &str = "DeliveryReady";
pub const RESOURCES_SUBMITTED: &str = "ResourcesSubmitted";
pub const RESOURCES_HEALTHY: &str = "ResourcesHealthy";
pub const RESOURCE_SUBMITTED: &str = "ResourceSubmitted";
pub const HEALTHY: &str = "Healthy";
pub const TEMPLATES_READY: &str = "TemplatesReady";
pub const RUN_TEMPLATE_READY: &str = "RunTemplateReady";
pub const STAMPED_OBJECT_CONDITION: &str = "StampedObjectCondition";

// Blueprint selection reasons
pub const READY_REASON: &str = "Ready";
pub const WORKLOAD_LABELS_MISSING: &str = "WorkloadLabelsMissing";
pub const SUPPLY_CHAIN_NOT_FOUND: &str = "SupplyChainNotFound";
pub const MULTIPLE_SUPPLY_CHAIN_MATCHES: &str = "MultipleSupplyChainMatches";
pub const DELIVERABLE_LABELS_MISSING: &str = "DeliverableLabelsMissing";
pub const DELIVERY_NOT_FOUND: &str = "DeliveryNotFound";
pub const MULTIPLE_DELIVERY_MATCHES: &str = "MultipleDeliveryMatches";
pub const BLUEPRINT_NOT_READY: &str = "BlueprintNotReady";
pub const SELECTOR_ERROR: &str = "SelectorError";

// ResourcesSubmitted reasons
pub const RESOURCE_SUBMISSION_COMPLETE: &str = "ResourceSubmissionComplete";
pub const TEMPLATE_OBJECT_RETRIEVAL_FAILURE: &str = "TemplateObjectRetrievalFailure";
pub const MISSING_VALUE_AT_PATH: &str = "MissingValueAtPath";
pub const TEMPLATE_STAMP_FAILURE: &str = "TemplateStampFailure";
pub const TEMPLATE_REJECTED_BY_API_SERVER: &str = "TemplateRejectedByAPIServer";
pub const UNKNOWN_ERROR: &str = "UnknownError";
pub const RESOLVE_TEMPLATE_OPTIONS_ERROR: &str = "ResolveTemplateOptionsError";
pub const TEMPLATE_OPTIONS_MATCH_ERROR: &str = "TemplateOptionsMatchError";
pub const DEPLOYMENT_CONDITION_NOT_MET: &str = "ConditionNotMet";
pub const DEPLOYMENT_FAILED_CONDITION_MET: &str = "FailedConditionMet";
pub const FAILED_TO_LIST_CREATED_OBJECTS: &str = "FailedToListCreatedObjects";
pub const SERVICE_ACCOUNT_ERROR: &str = "ServiceAccountError";
pub const SERVICE_ACCOUNT_TOKEN_ERROR: &str = "ServiceAccountTokenError";
pub const RESOURCE_REALIZER_BUILDER_ERROR: &str = "ResourceRealizerBuilderError";

// Blueprint reasons
pub const TEMPLATES_NOT_FOUND: &str = "TemplatesNotFound";
pub const INVALID: &str = "Invalid";

// Runnable reasons
pub const RUN_TEMPLATE_NOT_FOUND: &str = "RunTemplateNotFound";
pub const STAMPED_OBJECT_REJECTED_BY_API_SERVER: &str = "StampedObjectRejectedByAPIServer";
pub const OUTPUT_PATH_NOT_SATISFIED: &str = "OutputPathNotSatisfied";
pub const CLIENT_BUILDER_ERROR: &str = "ClientBuilderError";
pub const SUCCEEDED_CONDITION: &str = "SucceededCondition";

// Health reasons
pub const OUTPUT_AVAILABLE: &str = "OutputAvailable";
pub const OUTPUT_NOT_AVAILABLE: &str = "OutputNotAvailable";
pub const ALWAYS_HEALTHY: &str = "AlwaysHealthy";
pub const NO_STAMPED_OBJECT: &str = "NoStampedObject";
pub const NO_RESOURCE: &str = "NoResource";
pub const NO_MATCHES_FULFILLED: &str = "NoMatchesFulfilled";
pub const MATCHED_CONDITION: &str = "MatchedCondition";
pub const MATCHED_FIELD: &str = "MatchedField";
pub const MATCHED_RULES: &str = "MatchedRules";
pub const HEALTHY_CONDITION_RULE: &str = "HealthyConditionRule";
pub const UNKNOWN: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "True" => ConditionStatus::True,
            "False" => ConditionStatus::False,
            _ => ConditionStatus::Unknown,
        }
    }

    pub fn of(c: &Condition) -> Self {
        Self::parse(&c.status)
    }
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn epoch() -> Time {
    Time(DateTime::<Utc>::from_timestamp(0, 0).unwrap_or_default())
}

/// Build a condition; the transition time is stamped later by a `ConditionManager`.
pub fn condition(type_: &str, status: ConditionStatus, reason: &str, message: impl Into<String>) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.as_str().to_string(),
        reason: reason.to_string(),
        message: message.into(),
        last_transition_time: epoch(),
        observed_generation: None,
    }
}

pub fn find<'a>(conds: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conds.iter().find(|c| c.type_ == type_)
}

/// Equality ignoring `lastTransitionTime`.
pub fn same_state(a: &Condition, b: &Condition) -> bool {
    a.type_ == b.type_
        && a.status == b.status
        && a.reason == b.reason
        && a.message == b.message
        && a.observed_generation == b.observed_generation
}

// ---- owner-level constructors ----

pub fn blueprint_ready(type_: &str) -> Condition {
    condition(type_, ConditionStatus::True, READY_REASON, "")
}

pub fn resources_submitted() -> Condition {
    condition(RESOURCES_SUBMITTED, ConditionStatus::True, RESOURCE_SUBMISSION_COMPLETE, "")
}

pub fn resource_submitted() -> Condition {
    condition(RESOURCE_SUBMITTED, ConditionStatus::True, RESOURCE_SUBMISSION_COMPLETE, "")
}

pub fn missing_value_at_path(type_: &str, expression: &str, fq_type: &str, name: &str, namespace: &str) -> Condition {
    let ns_msg = if namespace.is_empty() { String::new() } else { format!(" in namespace [{namespace}]") };
    condition(
        type_,
        ConditionStatus::Unknown,
        MISSING_VALUE_AT_PATH,
        format!("waiting to read value [{expression}] from resource [{fq_type}/{name}]{ns_msg}"),
    )
}

pub fn service_account_error(msg: impl Into<String>) -> Condition {
    condition(RESOURCES_SUBMITTED, ConditionStatus::False, SERVICE_ACCOUNT_ERROR, msg)
}

pub fn service_account_token_error(msg: impl Into<String>) -> Condition {
    condition(RESOURCES_SUBMITTED, ConditionStatus::False, SERVICE_ACCOUNT_TOKEN_ERROR, msg)
}

pub fn resource_realizer_builder_error(msg: impl Into<String>) -> Condition {
    condition(RESOURCES_SUBMITTED, ConditionStatus::False, RESOURCE_REALIZER_BUILDER_ERROR, msg)
}

// ---- blueprint constructors ----

pub fn templates_ready() -> Condition {
    condition(TEMPLATES_READY, ConditionStatus::True, READY_REASON, "")
}

pub fn templates_not_found(resources: &[String]) -> Condition {
    condition(
        TEMPLATES_READY,
        ConditionStatus::False,
        TEMPLATES_NOT_FOUND,
        format!("did not find the template of the resource(s) [{}]", resources.join(", ")),
    )
}

pub fn blueprint_invalid(msg: impl Into<String>) -> Condition {
    condition(TEMPLATES_READY, ConditionStatus::False, INVALID, msg)
}

// ---- runnable constructors ----

pub fn run_template_ready() -> Condition {
    condition(RUN_TEMPLATE_READY, ConditionStatus::True, READY_REASON, "")
}

pub fn run_template_failure(reason: &str, msg: impl Into<String>) -> Condition {
    condition(RUN_TEMPLATE_READY, ConditionStatus::False, reason, msg)
}

/// Mirror of the stamped object's `Succeeded` condition, or Unknown when absent.
pub fn stamped_object_condition(succeeded: Option<&serde_json::Value>) -> Condition {
    match succeeded {
        None => condition(STAMPED_OBJECT_CONDITION, ConditionStatus::Unknown, "Unknown", ""),
        Some(c) => {
            let status = c.get("status").and_then(|v| v.as_str()).unwrap_or("Unknown");
            let reason = c.get("reason").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).unwrap_or(SUCCEEDED_CONDITION);
            let message = c.get("message").and_then(|v| v.as_str()).unwrap_or_default();
            condition(STAMPED_OBJECT_CONDITION, ConditionStatus::parse(status), reason, message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_value_message_mentions_namespace_when_set() {
        let c = missing_value_at_path(RESOURCE_SUBMITTED, "spec.url", "thing.example.com", "obj", "ns");
        assert_eq!(c.status, "Unknown");
        assert_eq!(c.message, "waiting to read value [spec.url] from resource [thing.example.com/obj] in namespace [ns]");
        let c = missing_value_at_path(RESOURCE_SUBMITTED, "spec.url", "thing.example.com", "obj", "");
        assert!(!c.message.contains("namespace"));
    }

    #[test]
    fn stamped_condition_mirrors_succeeded() {
        let c = stamped_object_condition(Some(&json!({"type": "Succeeded", "status": "False", "reason": "Boom", "message": "m"})));
        assert_eq!((c.status.as_str(), c.reason.as_str(), c.message.as_str()), ("False", "Boom", "m"));
        let c = stamped_object_condition(None);
        assert_eq!(c.status, "Unknown");
    }

    #[test]
    fn templates_not_found_lists_resources() {
        let c = templates_not_found(&["a".into(), "b".into()]);
        assert_eq!(c.message, "did not find the template of the resource(s) [a, b]");
    }
}
