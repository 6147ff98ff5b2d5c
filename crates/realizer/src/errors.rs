//! Failure taxonomy of one realization and the conditions each failure surfaces as.

use std::fmt;

use carto_api::RepoError;
use carto_core::blueprint::BlueprintKind;
use carto_core::conditions::{self, condition, ConditionStatus};
use carto_core::status::StampedRef;
use carto_core::Condition;
use carto_eval::{OutputError, StampError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlueprintType {
    SupplyChain,
    Delivery,
}

impl From<BlueprintKind> for BlueprintType {
    fn from(k: BlueprintKind) -> Self {
        match k {
            BlueprintKind::SupplyChain => BlueprintType::SupplyChain,
            BlueprintKind::Delivery => BlueprintType::Delivery,
        }
    }
}

impl fmt::Display for BlueprintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlueprintType::SupplyChain => f.write_str("supply chain"),
            BlueprintType::Delivery => f.write_str("delivery"),
        }
    }
}

/// Where in a blueprint a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub resource: String,
    pub blueprint: String,
    pub blueprint_type: BlueprintType,
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource [{}] in {} [{}]", self.resource, self.blueprint_type, self.blueprint)
    }
}

fn option_list(names: &[String]) -> String {
    if names.is_empty() {
        String::new()
    } else {
        format!("[{}] ", names.join(", "))
    }
}

fn expression_part(e: &OutputError) -> String {
    e.expression().map(|x| format!("[{x}] ")).unwrap_or_default()
}

fn object_name(r: &StampedRef) -> String {
    format!("{}/{}", r.namespace(), r.name)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RealizerError {
    #[error("unable to get template [{template}] for {site}: {source}")]
    GetTemplate { template: String, site: Site, source: RepoError },

    #[error("error matching against template option [{option}] for {site}: {reason}")]
    ResolveTemplateOption { option: String, site: Site, reason: String },

    #[error("expected exactly 1 option to match, found [{}] matching options {}for {site}", .options.len(), option_list(.options))]
    TemplateOptionsMatch { options: Vec<String>, site: Site },

    #[error("unable to stamp object for resource [{}] for template [{template_kind}/{template}] in {} [{}]: {source}",
        .site.resource, .site.blueprint_type, .site.blueprint)]
    Stamp { template_kind: String, template: String, site: Site, source: StampError },

    #[error("unable to apply object [{object}] for {site}: {source}")]
    ApplyStampedObject { object: String, site: Site, source: RepoError },

    #[error("unable to list objects in namespace [{namespace}] with labels [{labels}]: {source}")]
    ListCreatedObjects { namespace: String, labels: String, source: RepoError },

    #[error("unable to retrieve outputs {}from stamped object [{}] of type [{fq_type}] for {site}: {source}",
        expression_part(.source), object_name(.stamped))]
    RetrieveOutput { stamped: StampedRef, fq_type: String, site: Site, source: OutputError },
}

impl RealizerError {
    /// Unhandled failures abort the traversal and requeue the owner with back-off.
    pub fn is_unhandled(&self) -> bool {
        match self {
            RealizerError::GetTemplate { .. } | RealizerError::ListCreatedObjects { .. } => true,
            RealizerError::ApplyStampedObject { source, .. } => !source.is_forbidden(),
            RealizerError::ResolveTemplateOption { .. }
            | RealizerError::TemplateOptionsMatch { .. }
            | RealizerError::Stamp { .. }
            | RealizerError::RetrieveOutput { .. } => false,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        match self {
            RealizerError::GetTemplate { site, .. }
            | RealizerError::ResolveTemplateOption { site, .. }
            | RealizerError::TemplateOptionsMatch { site, .. }
            | RealizerError::Stamp { site, .. }
            | RealizerError::ApplyStampedObject { site, .. }
            | RealizerError::RetrieveOutput { site, .. } => Some(&site.resource),
            RealizerError::ListCreatedObjects { .. } => None,
        }
    }

    /// Condition of type `type_` describing this failure; used for both the
    /// per-resource `ResourceSubmitted` and the owner's `ResourcesSubmitted`.
    pub fn condition(&self, type_: &str) -> Condition {
        let msg = self.to_string();
        match self {
            RealizerError::GetTemplate { .. } => {
                condition(type_, ConditionStatus::False, conditions::TEMPLATE_OBJECT_RETRIEVAL_FAILURE, msg)
            }
            RealizerError::ResolveTemplateOption { .. } => {
                condition(type_, ConditionStatus::False, conditions::RESOLVE_TEMPLATE_OPTIONS_ERROR, msg)
            }
            RealizerError::TemplateOptionsMatch { .. } => {
                condition(type_, ConditionStatus::False, conditions::TEMPLATE_OPTIONS_MATCH_ERROR, msg)
            }
            RealizerError::Stamp { source, .. } if source.missing_expression().is_some() => {
                condition(type_, ConditionStatus::Unknown, conditions::MISSING_VALUE_AT_PATH, msg)
            }
            RealizerError::Stamp { .. } => condition(type_, ConditionStatus::False, conditions::TEMPLATE_STAMP_FAILURE, msg),
            RealizerError::ApplyStampedObject { .. } => {
                condition(type_, ConditionStatus::False, conditions::TEMPLATE_REJECTED_BY_API_SERVER, msg)
            }
            RealizerError::ListCreatedObjects { .. } => {
                condition(type_, ConditionStatus::False, conditions::FAILED_TO_LIST_CREATED_OBJECTS, msg)
            }
            RealizerError::RetrieveOutput { stamped, fq_type, site, source } => match source {
                OutputError::JsonPath { expression, .. } => {
                    conditions::missing_value_at_path(type_, expression, fq_type, &stamped.name, stamped.namespace())
                }
                OutputError::ObservedGeneration(_) => condition(
                    type_,
                    ConditionStatus::False,
                    conditions::TEMPLATE_STAMP_FAILURE,
                    format!(
                        "resource [{}] cannot satisfy observedCompletion without observedGeneration in object status",
                        site.resource
                    ),
                ),
                OutputError::ConditionNotMet(m) => condition(
                    type_,
                    ConditionStatus::Unknown,
                    conditions::DEPLOYMENT_CONDITION_NOT_MET,
                    format!("resource [{}] condition not met: {m}", site.resource),
                ),
                OutputError::FailedConditionMet(m) => condition(
                    type_,
                    ConditionStatus::False,
                    conditions::DEPLOYMENT_FAILED_CONDITION_MET,
                    format!("resource [{}] failed condition met: {m}", site.resource),
                ),
                _ => condition(type_, ConditionStatus::False, conditions::UNKNOWN_ERROR, msg),
            },
        }
    }
}

/// Failures of one runnable realization.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RunnableError {
    #[error("unable to get run template [{template}]: {source}")]
    GetRunTemplate { template: String, source: RepoError },

    #[error("unable to resolve selector [{labels}], apiVersion [{api_version}], kind [{kind}]: {reason}")]
    ResolveSelector { labels: String, api_version: String, kind: String, reason: String },

    #[error("unable to stamp object for run template [{template}]: {source}")]
    Stamp { template: String, source: StampError },

    #[error("unable to apply object [{object}] for run template [{template}]: {source}")]
    ApplyStampedObject { object: String, template: String, source: RepoError },

    #[error("unable to list objects in namespace [{namespace}] with labels [{labels}]: {source}")]
    ListCreatedObjects { namespace: String, labels: String, source: RepoError },

    #[error("unable to retrieve outputs from stamped object [{}] of type [{fq_type}] for run template [{template}]: {reason}", object_name(.stamped))]
    RetrieveOutput { stamped: StampedRef, fq_type: String, template: String, reason: String },
}

impl RunnableError {
    pub fn is_unhandled(&self) -> bool {
        match self {
            RunnableError::GetRunTemplate { .. } | RunnableError::ListCreatedObjects { .. } => true,
            RunnableError::ApplyStampedObject { source, .. } => !source.is_forbidden(),
            RunnableError::ResolveSelector { .. } | RunnableError::Stamp { .. } | RunnableError::RetrieveOutput { .. } => false,
        }
    }

    /// `RunTemplateReady` condition for this failure.
    pub fn condition(&self) -> Condition {
        let msg = self.to_string();
        match self {
            RunnableError::GetRunTemplate { .. } => conditions::run_template_failure(conditions::RUN_TEMPLATE_NOT_FOUND, msg),
            RunnableError::ResolveSelector { .. } | RunnableError::Stamp { .. } => {
                conditions::run_template_failure(conditions::TEMPLATE_STAMP_FAILURE, msg)
            }
            RunnableError::ApplyStampedObject { .. } => {
                conditions::run_template_failure(conditions::STAMPED_OBJECT_REJECTED_BY_API_SERVER, msg)
            }
            RunnableError::ListCreatedObjects { .. } => {
                conditions::run_template_failure(conditions::FAILED_TO_LIST_CREATED_OBJECTS, msg)
            }
            RunnableError::RetrieveOutput { stamped, fq_type, .. } => {
                let ns = if stamped.namespace().is_empty() {
                    String::new()
                } else {
                    format!(" in namespace [{}]", stamped.namespace())
                };
                conditions::run_template_failure(
                    conditions::OUTPUT_PATH_NOT_SATISFIED,
                    format!("waiting to read value from resource [{fq_type}/{}]{ns}: {msg}", stamped.name),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_eval::JsonPathError;

    fn site() -> Site {
        Site { resource: "src".into(), blueprint: "sc".into(), blueprint_type: BlueprintType::SupplyChain }
    }

    fn stamped() -> StampedRef {
        StampedRef { api_version: "example.com/v1".into(), kind: "Thing".into(), namespace: Some("ns".into()), name: "w-src".into() }
    }

    #[test]
    fn messages_name_the_blueprint() {
        let e = RealizerError::GetTemplate { template: "git".into(), site: site(), source: RepoError::NotFound("gone".into()) };
        assert_eq!(e.to_string(), "unable to get template [git] for resource [src] in supply chain [sc]: not_found: gone");

        let e = RealizerError::TemplateOptionsMatch { options: vec!["a".into(), "b".into()], site: site() };
        assert_eq!(
            e.to_string(),
            "expected exactly 1 option to match, found [2] matching options [a, b] for resource [src] in supply chain [sc]"
        );
        let e = RealizerError::TemplateOptionsMatch { options: vec![], site: site() };
        assert_eq!(e.to_string(), "expected exactly 1 option to match, found [0] matching options for resource [src] in supply chain [sc]");

        let e = RealizerError::Stamp {
            template_kind: "ClusterSourceTemplate".into(),
            template: "git".into(),
            site: Site { blueprint_type: BlueprintType::Delivery, ..site() },
            source: StampError::NoTemplate,
        };
        assert!(e.to_string().starts_with("unable to stamp object for resource [src] for template [ClusterSourceTemplate/git] in delivery [sc]: "));
    }

    #[test]
    fn classification() {
        let apply = |source| RealizerError::ApplyStampedObject { object: "ns/x".into(), site: site(), source };
        assert!(!apply(RepoError::Forbidden("no".into())).is_unhandled());
        assert!(apply(RepoError::Invalid("bad".into())).is_unhandled());
        assert!(RealizerError::ListCreatedObjects { namespace: "ns".into(), labels: "".into(), source: RepoError::Internal("x".into()) }.is_unhandled());
        assert!(!RealizerError::TemplateOptionsMatch { options: vec![], site: site() }.is_unhandled());
    }

    #[test]
    fn retrieve_output_conditions() {
        let err = |source| RealizerError::RetrieveOutput { stamped: stamped(), fq_type: "thing.example.com".into(), site: site(), source };

        let c = err(OutputError::JsonPath {
            field: "url",
            expression: "spec.url".into(),
            source: JsonPathError::NoValue("spec.url".into()),
        })
        .condition(conditions::RESOURCE_SUBMITTED);
        assert_eq!((c.status.as_str(), c.reason.as_str()), ("Unknown", conditions::MISSING_VALUE_AT_PATH));
        assert_eq!(c.message, "waiting to read value [spec.url] from resource [thing.example.com/w-src] in namespace [ns]");

        let c = err(OutputError::ConditionNotMet("waiting".into())).condition(conditions::RESOURCES_SUBMITTED);
        assert_eq!((c.status.as_str(), c.message.as_str()), ("Unknown", "resource [src] condition not met: waiting"));

        let c = err(OutputError::FailedConditionMet("boom".into())).condition(conditions::RESOURCES_SUBMITTED);
        assert_eq!((c.status.as_str(), c.reason.as_str()), ("False", conditions::DEPLOYMENT_FAILED_CONDITION_MET));

        let c = err(OutputError::ObservedGeneration(JsonPathError::NoValue("x".into()))).condition(conditions::RESOURCES_SUBMITTED);
        assert_eq!(c.reason, conditions::TEMPLATE_STAMP_FAILURE);

        let e = err(OutputError::JsonPath { field: "url", expression: "spec.url".into(), source: JsonPathError::NoValue("spec.url".into()) });
        assert!(e.to_string().starts_with("unable to retrieve outputs [spec.url] from stamped object [ns/w-src] of type [thing.example.com]"));
    }

    #[test]
    fn runnable_conditions() {
        let e = RunnableError::GetRunTemplate { template: "rt".into(), source: RepoError::NotFound("rt".into()) };
        assert!(e.is_unhandled());
        assert_eq!(e.condition().reason, conditions::RUN_TEMPLATE_NOT_FOUND);
        let e = RunnableError::RetrieveOutput {
            stamped: stamped(),
            fq_type: "thing.example.com".into(),
            template: "rt".into(),
            reason: "no value".into(),
        };
        assert!(!e.is_unhandled());
        assert!(e.condition().message.starts_with("waiting to read value from resource [thing.example.com/w-src] in namespace [ns]: "));
    }
}
