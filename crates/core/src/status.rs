//! Status shapes written by the engine on owners.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::refs::{api_version_of, gvk_from_api_version};

/// Reference to an object the engine stamped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StampedRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl StampedRef {
    pub fn from_object(obj: &Value) -> Option<Self> {
        Some(Self {
            api_version: obj.get("apiVersion")?.as_str()?.to_string(),
            kind: obj.get("kind")?.as_str()?.to_string(),
            namespace: obj.pointer("/metadata/namespace").and_then(|v| v.as_str()).map(str::to_string),
            name: obj.pointer("/metadata/name")?.as_str()?.to_string(),
        })
    }

    pub fn from_gvk(gvk: &GroupVersionKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            api_version: api_version_of(gvk),
            kind: gvk.kind.clone(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        gvk_from_api_version(&self.api_version, &self.kind)
    }

    pub fn group(&self) -> String {
        self.gvk().group
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }

    /// Same group, kind, namespace and name; the version may differ.
    pub fn same_object(&self, other: &StampedRef) -> bool {
        self.group() == other.group() && self.kind == other.kind && self.namespace() == other.namespace() && self.name == other.name
    }
}

impl std::fmt::Display for StampedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{}/{} {}", self.api_version, self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

impl TemplateRef {
    pub fn new(kind: &str, name: &str) -> Self {
        Self { api_version: crate::API_VERSION.to_string(), kind: kind.to_string(), name: name.to_string() }
    }
}

/// Upstream resource a realized resource consumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInput {
    pub name: String,
}

/// One output field of a resource, fingerprinted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOutput {
    pub name: String,
    pub preview: String,
    pub digest: String,
    pub last_transition_time: Time,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealizedResource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stamped_ref: Option<StampedRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_ref: Option<TemplateRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ResourceInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<ResourceOutput>,
}

impl RealizedResource {
    pub fn named(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    #[serde(flatten)]
    pub realized: RealizedResource,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl ResourceStatus {
    pub fn name(&self) -> &str {
        &self.realized.name
    }
}

/// Reference from an owner to the blueprint it was realized against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlueprintRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stamped_ref_from_object_and_equivalence() {
        let a = StampedRef::from_object(&json!({
            "apiVersion": "example.com/v1", "kind": "Thing",
            "metadata": {"name": "t", "namespace": "ns"}
        }))
        .unwrap();
        let b = StampedRef { api_version: "example.com/v2".into(), ..a.clone() };
        assert!(a.same_object(&b));
        let c = StampedRef { name: "other".into(), ..a.clone() };
        assert!(!a.same_object(&c));
        assert_eq!(a.to_string(), "example.com/v1/Thing ns/t");
    }

    #[test]
    fn resource_status_flattens_realized_fields() {
        let row: ResourceStatus = serde_json::from_value(json!({
            "name": "src",
            "stampedRef": {"apiVersion": "v1", "kind": "ConfigMap", "namespace": "ns", "name": "w-src"},
            "templateRef": {"apiVersion": "carto.run/v1alpha1", "kind": "ClusterSourceTemplate", "name": "git"},
            "conditions": []
        }))
        .unwrap();
        assert_eq!(row.name(), "src");
        assert_eq!(row.realized.stamped_ref.unwrap().kind, "ConfigMap");
    }
}
