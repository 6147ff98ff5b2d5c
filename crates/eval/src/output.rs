//! Typed outputs read back from stamped objects, and deployment readiness checks.

use std::collections::BTreeMap;

use carto_core::template::{ObservedCompletion, ObservedMatch, Template, TemplateKind};
use serde_json::Value;

use crate::jsonpath::{self, JsonPathError};

/// Value a resource hands to its downstream consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Source { url: Value, revision: Value },
    Image(Value),
    Config(Value),
    /// A deployment passes its source input through once it has settled.
    Deployment { url: Value, revision: Value },
}

impl Output {
    /// Url and revision for consumers that read a source; deployments qualify.
    pub fn source(&self) -> Option<(&Value, &Value)> {
        match self {
            Output::Source { url, revision } | Output::Deployment { url, revision } => Some((url, revision)),
            _ => None,
        }
    }

    pub fn image(&self) -> Option<&Value> {
        match self {
            Output::Image(v) => Some(v),
            _ => None,
        }
    }

    pub fn config(&self) -> Option<&Value> {
        match self {
            Output::Config(v) => Some(v),
            _ => None,
        }
    }

    /// Named fields for status rows, in display order.
    pub fn fields(&self) -> Vec<(&'static str, &Value)> {
        match self {
            Output::Source { url, revision } | Output::Deployment { url, revision } => {
                vec![("url", url), ("revision", revision)]
            }
            Output::Image(v) => vec![("image", v)],
            Output::Config(v) => vec![("config", v)],
        }
    }
}

/// Outputs produced so far in one traversal, keyed by blueprint resource name.
pub type OutputBus = BTreeMap<String, Output>;

/// Source-shaped input handed to a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentInput {
    pub url: Value,
    pub revision: Value,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OutputError {
    #[error("failed to evaluate {field} path [{expression}]: {source}")]
    JsonPath { field: &'static str, expression: String, source: JsonPathError },
    #[error("failed to evaluate status.observedGeneration: {0}")]
    ObservedGeneration(JsonPathError),
    #[error("{0}")]
    ConditionNotMet(String),
    #[error("{0}")]
    FailedConditionMet(String),
    #[error("template has no {0} path")]
    PathUnset(&'static str),
    #[error("deployment not found in upstream template")]
    NoDeploymentInput,
}

impl OutputError {
    /// Expression behind a missing value, for `MissingValueAtPath` reporting.
    pub fn expression(&self) -> Option<&str> {
        match self {
            OutputError::JsonPath { expression, .. } => Some(expression),
            _ => None,
        }
    }
}

pub(crate) fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read(field: &'static str, path: Option<&str>, obj: &Value) -> Result<Value, OutputError> {
    let expression = path.filter(|p| !p.is_empty()).ok_or(OutputError::PathUnset(field))?;
    jsonpath::evaluate_single(expression, obj).map_err(|source| OutputError::JsonPath {
        field,
        expression: expression.to_string(),
        source,
    })
}

/// Extract the template kind's output from the persisted object.
///
/// `ClusterTemplate` yields nothing. Deployment templates yield their source
/// input once the object satisfies its readiness rules.
pub fn read_output(template: &Template, obj: &Value, deployment: Option<&DeploymentInput>) -> Result<Option<Output>, OutputError> {
    let spec = &template.spec;
    let out = match template.kind {
        TemplateKind::Source => Output::Source {
            url: read("url", spec.url_path.as_deref(), obj)?,
            revision: read("revision", spec.revision_path.as_deref(), obj)?,
        },
        TemplateKind::Image => Output::Image(read("image", spec.image_path.as_deref(), obj)?),
        TemplateKind::Config => Output::Config(read("config", spec.config_path.as_deref(), obj)?),
        TemplateKind::Deployment => {
            match &spec.observed_completion {
                Some(oc) => observed_completion_ready(oc, obj)?,
                None => observed_matches_ready(&spec.observed_matches, obj)?,
            }
            let input = deployment.ok_or(OutputError::NoDeploymentInput)?;
            Output::Deployment { url: input.url.clone(), revision: input.revision.clone() }
        }
        TemplateKind::Template => return Ok(None),
    };
    Ok(Some(out))
}

pub fn observed_matches_ready(matches: &[ObservedMatch], obj: &Value) -> Result<(), OutputError> {
    for m in matches {
        let input = jsonpath::evaluate_single(&m.input, obj)
            .map_err(|e| OutputError::ConditionNotMet(format!("could not find value on input [{}]: {e}", m.input)))?;
        let output = jsonpath::evaluate_single(&m.output, obj)
            .map_err(|e| OutputError::ConditionNotMet(format!("could not find value on output [{}]: {e}", m.output)))?;
        if input != output {
            return Err(OutputError::ConditionNotMet(format!(
                "input [{}] and output [{}] do not match: {} != {}",
                m.input,
                m.output,
                text(&input),
                text(&output)
            )));
        }
    }
    Ok(())
}

pub fn observed_completion_ready(oc: &ObservedCompletion, obj: &Value) -> Result<(), OutputError> {
    let generation = jsonpath::evaluate_single("metadata.generation", obj).map_err(|source| OutputError::JsonPath {
        field: "generation",
        expression: "metadata.generation".into(),
        source,
    })?;
    let observed = jsonpath::evaluate_single("status.observedGeneration", obj).map_err(OutputError::ObservedGeneration)?;
    if observed != generation {
        return Err(OutputError::ConditionNotMet(format!(
            "status.observedGeneration does not equal metadata.generation: {} != {}",
            text(&observed),
            text(&generation)
        )));
    }

    if let Some(failed) = &oc.failed {
        match jsonpath::evaluate_single(&failed.key, obj) {
            Ok(v) if text(&v) == failed.value => {
                return Err(OutputError::FailedConditionMet(format!(
                    "deployment failure condition [{}] was: {}",
                    failed.key,
                    text(&v)
                )));
            }
            Ok(_) => {}
            Err(e) if e.is_missing() => {}
            Err(source) => {
                return Err(OutputError::JsonPath { field: "failed condition", expression: failed.key.clone(), source });
            }
        }
    }

    let succeeded = jsonpath::evaluate_single(&oc.succeeded.key, obj).map_err(|e| {
        OutputError::ConditionNotMet(format!("failed to evaluate succeededCondition.Key [{}]: {e}", oc.succeeded.key))
    })?;
    if text(&succeeded) != oc.succeeded.value {
        return Err(OutputError::ConditionNotMet(format!(
            "deployment success condition [{}] was: {}, expected: {}",
            oc.succeeded.key,
            text(&succeeded),
            oc.succeeded.value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn template(kind: &str, spec: Value) -> Template {
        Template::from_object(&json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": kind,
            "metadata": {"name": "t"},
            "spec": spec
        }))
        .unwrap()
    }

    #[test]
    fn source_paths_read_from_object() {
        let t = template("ClusterSourceTemplate", json!({"urlPath": "status.url", "revisionPath": "status.rev"}));
        let obj = json!({"status": {"url": "https://x", "rev": "abc"}});
        let out = read_output(&t, &obj, None).unwrap().unwrap();
        assert_eq!(out, Output::Source { url: json!("https://x"), revision: json!("abc") });

        let err = read_output(&t, &json!({"status": {"url": "https://x"}}), None).unwrap_err();
        assert_eq!(err.expression(), Some("status.rev"));
    }

    #[test]
    fn plain_template_has_no_output() {
        let t = template("ClusterTemplate", json!({}));
        assert_eq!(read_output(&t, &json!({}), None).unwrap(), None);
    }

    #[test]
    fn deployment_completion_states() {
        let t = template(
            "ClusterDeploymentTemplate",
            json!({"observedCompletion": {
                "succeeded": {"key": "status.phase", "value": "Done"},
                "failed": {"key": "status.phase", "value": "Failed"}
            }}),
        );
        let input = DeploymentInput { url: json!("u"), revision: json!("r") };

        let no_og = json!({"metadata": {"generation": 2}, "status": {}});
        assert!(matches!(read_output(&t, &no_og, Some(&input)), Err(OutputError::ObservedGeneration(_))));

        let stale = json!({"metadata": {"generation": 2}, "status": {"observedGeneration": 1, "phase": "Done"}});
        assert!(matches!(read_output(&t, &stale, Some(&input)), Err(OutputError::ConditionNotMet(_))));

        let failed = json!({"metadata": {"generation": 2}, "status": {"observedGeneration": 2, "phase": "Failed"}});
        assert!(matches!(read_output(&t, &failed, Some(&input)), Err(OutputError::FailedConditionMet(_))));

        let done = json!({"metadata": {"generation": 2}, "status": {"observedGeneration": 2, "phase": "Done"}});
        let out = read_output(&t, &done, Some(&input)).unwrap().unwrap();
        assert_eq!(out.source(), Some((&json!("u"), &json!("r"))));
        assert_eq!(read_output(&t, &done, None).unwrap_err(), OutputError::NoDeploymentInput);
    }

    #[test]
    fn deployment_observed_matches() {
        let t = template("ClusterDeploymentTemplate", json!({"observedMatches": [{"input": "spec.want", "output": "status.have"}]}));
        let input = DeploymentInput { url: json!("u"), revision: json!("r") };
        let behind = json!({"spec": {"want": 2}, "status": {"have": 1}});
        let err = read_output(&t, &behind, Some(&input)).unwrap_err();
        assert_eq!(err.to_string(), "input [spec.want] and output [status.have] do not match: 2 != 1");
        let settled = json!({"spec": {"want": 2}, "status": {"have": 2}});
        assert!(read_output(&t, &settled, Some(&input)).is_ok());
    }
}
