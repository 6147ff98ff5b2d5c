//! Object identities shared by the tracker, mapper and status tables.

use std::fmt;

use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};

/// `namespace/name` key of a namespaced (or cluster scoped, with empty namespace) object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self { namespace: String::new(), name: name.into() }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), kind: kind.into() }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// Key of an object some owner depends on (service account, template, blueprint).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyKey {
    pub group_kind: GroupKind,
    pub name: NamespacedName,
}

impl DependencyKey {
    pub fn new(group_kind: GroupKind, name: NamespacedName) -> Self {
        Self { group_kind, name }
    }

    pub fn service_account(namespace: &str, name: &str) -> Self {
        Self::new(GroupKind::new("", "ServiceAccount"), NamespacedName::new(namespace, name))
    }

    pub fn template(kind: &str, name: &str) -> Self {
        Self::new(GroupKind::new(crate::GROUP, kind), NamespacedName::cluster(name))
    }
}

impl fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group_kind, self.name)
    }
}

/// Split `group/version` (or bare `version` for the core group).
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = split_api_version(api_version);
    GroupVersionKind { group, version, kind: kind.to_string() }
}

pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Human readable `kind.group` used in condition messages.
pub fn fully_qualified_type(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.kind.to_lowercase()
    } else {
        format!("{}.{}", gvk.kind.to_lowercase(), gvk.group)
    }
}

/// Ensure `apiVersion` and `kind` are present on a serialized object.
pub fn with_type_meta(mut v: serde_json::Value, api_version: &str, kind: &str) -> serde_json::Value {
    if let Some(obj) = v.as_object_mut() {
        obj.entry("apiVersion").or_insert_with(|| api_version.into());
        obj.entry("kind").or_insert_with(|| kind.into());
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_omits_empty_namespace() {
        assert_eq!(NamespacedName::cluster("x").to_string(), "x");
        assert_eq!(NamespacedName::new("ns", "x").to_string(), "ns/x");
        let key = DependencyKey::service_account("ns", "sa");
        assert_eq!(key.to_string(), "ServiceAccount/ns/sa");
    }

    #[test]
    fn api_version_split_handles_core_group() {
        let gvk = gvk_from_api_version("v1", "ConfigMap");
        assert_eq!(gvk.group, "");
        assert_eq!(api_version_of(&gvk), "v1");
        let gvk = gvk_from_api_version("carto.run/v1alpha1", "Workload");
        assert_eq!(gvk.group, "carto.run");
        assert_eq!(fully_qualified_type(&gvk), "workload.carto.run");
    }
}
