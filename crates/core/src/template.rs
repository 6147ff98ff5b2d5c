//! Stamp recipes: cluster templates of every kind share one typed model.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blueprint::FieldSelectorRequirement;
use crate::params::TemplateParam;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TemplateKind {
    Source,
    Image,
    Config,
    Deployment,
    Template,
}

impl TemplateKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "ClusterSourceTemplate" => Some(TemplateKind::Source),
            "ClusterImageTemplate" => Some(TemplateKind::Image),
            "ClusterConfigTemplate" => Some(TemplateKind::Config),
            "ClusterDeploymentTemplate" => Some(TemplateKind::Deployment),
            "ClusterTemplate" => Some(TemplateKind::Template),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TemplateKind::Source => "ClusterSourceTemplate",
            TemplateKind::Image => "ClusterImageTemplate",
            TemplateKind::Config => "ClusterConfigTemplate",
            TemplateKind::Deployment => "ClusterDeploymentTemplate",
            TemplateKind::Template => "ClusterTemplate",
        }
    }

    pub fn all() -> [TemplateKind; 5] {
        [TemplateKind::Source, TemplateKind::Image, TemplateKind::Config, TemplateKind::Deployment, TemplateKind::Template]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Mutable,
    Immutable,
    Tekton,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Mutable => "mutable",
            Lifecycle::Immutable => "immutable",
            Lifecycle::Tekton => "tekton",
        }
    }

    /// Immutable and tekton stamps are create-only.
    pub fn is_immutable(&self) -> bool {
        !matches!(self, Lifecycle::Mutable)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionRequirement {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMatchFieldRequirement {
    #[serde(flatten)]
    pub requirement: FieldSelectorRequirement,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMatchRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_conditions: Vec<ConditionRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<HealthMatchFieldRequirement>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiMatchHealthRule {
    #[serde(default)]
    pub healthy: HealthMatchRule,
    #[serde(default)]
    pub unhealthy: HealthMatchRule,
}

/// Exactly one of the three rule shapes is expected to be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_healthy: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub single_condition_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_match: Option<MultiMatchHealthRule>,
}

impl HealthRule {
    pub fn single_condition(type_: &str) -> Self {
        Self { single_condition_type: Some(type_.to_string()), ..Default::default() }
    }

    fn validate(&self) -> Result<(), String> {
        let set = [self.always_healthy.is_some(), self.single_condition_type.is_some(), self.multi_match.is_some()]
            .iter()
            .filter(|b| **b)
            .count();
        if set != 1 {
            return Err("healthRule must set exactly one of alwaysHealthy, singleConditionType, multiMatch".into());
        }
        if let Some(mm) = &self.multi_match {
            for side in [&mm.healthy, &mm.unhealthy] {
                if side.match_conditions.is_empty() && side.match_fields.is_empty() {
                    return Err("healthRule.multiMatch sides must set matchConditions or matchFields".into());
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default = "default_retained")]
    pub max_failed_runs: usize,
    #[serde(default = "default_retained")]
    pub max_successful_runs: usize,
}

fn default_retained() -> usize {
    10
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self { max_failed_runs: default_retained(), max_successful_runs: default_retained() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedMatch {
    pub input: String,
    pub output: String,
}

/// `key` is a JSONPath on the stamped object compared as text against `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionCondition {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservedCompletion {
    pub succeeded: CompletionCondition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<CompletionCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ytt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<TemplateParam>,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_rule: Option<HealthRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub observed_matches: Vec<ObservedMatch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_completion: Option<ObservedCompletion>,
}

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("unknown template kind {0}")]
    UnknownKind(String),
    #[error("template {name} has no metadata.name")]
    MissingName { name: String },
    #[error("decode template {name}: {source}")]
    Decode { name: String, source: serde_json::Error },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub kind: TemplateKind,
    pub spec: TemplateSpec,
}

impl Template {
    pub fn new(kind: TemplateKind, name: &str, spec: TemplateSpec) -> Self {
        Self { name: name.to_string(), kind, spec }
    }

    /// Decode a raw cluster object of any template kind.
    pub fn from_object(obj: &Value) -> Result<Self, TemplateError> {
        let kind_str = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        let kind = TemplateKind::from_kind(kind_str).ok_or_else(|| TemplateError::UnknownKind(kind_str.to_string()))?;
        let name = obj
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TemplateError::MissingName { name: kind_str.to_string() })?
            .to_string();
        let spec_value = obj.get("spec").cloned().unwrap_or_else(|| Value::Object(Default::default()));
        let spec: TemplateSpec =
            serde_json::from_value(spec_value).map_err(|source| TemplateError::Decode { name: name.clone(), source })?;
        Ok(Self { name, kind, spec })
    }

    pub fn to_object(&self) -> Value {
        let spec = serde_json::to_value(&self.spec).unwrap_or(Value::Null);
        serde_json::json!({
            "apiVersion": crate::API_VERSION,
            "kind": self.kind.kind(),
            "metadata": {"name": self.name},
            "spec": spec,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.spec.lifecycle
    }

    /// Rule used for health checks; tekton stamps default to their `Succeeded` condition.
    pub fn health_rule(&self) -> Option<HealthRule> {
        match (&self.spec.health_rule, self.spec.lifecycle) {
            (Some(r), _) => Some(r.clone()),
            (None, Lifecycle::Tekton) => Some(HealthRule::single_condition("Succeeded")),
            (None, _) => None,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.spec.retention_policy.unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.spec.template.is_some() == self.spec.ytt.is_some() {
            return Err(format!("template {} must set exactly one of spec.template and spec.ytt", self.name));
        }
        if let Some(rule) = &self.spec.health_rule {
            rule.validate()?;
        }
        if self.spec.retention_policy.is_some() && self.spec.lifecycle == Lifecycle::Mutable {
            return Err(format!("template {} sets retentionPolicy on a mutable lifecycle", self.name));
        }
        if self.kind == TemplateKind::Deployment
            && self.spec.observed_matches.is_empty() == self.spec.observed_completion.is_none()
        {
            return Err(format!(
                "template {} must set exactly one of spec.observedMatches and spec.observedCompletion",
                self.name
            ));
        }
        Ok(())
    }
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "carto.run", version = "v1alpha1", kind = "ClusterRunTemplate", derive = "PartialEq", schema = "disabled")]
pub struct RunTemplateSpec {
    pub template: Value,
    /// Output name to JSONPath on the stamped object.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
}
