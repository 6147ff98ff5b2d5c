//! Owners (workloads, deliverables, runnables) and the per-kind strategy table.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference};
use kube::{CustomResource, Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blueprint::BlueprintKind;
use crate::conditions;
use crate::labels;
use crate::params::OwnerParam;
use crate::refs::NamespacedName;
use crate::status::{BlueprintRef, OwnerStatus, ResourceStatus};
use crate::template::RetentionPolicy;

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "Workload",
    namespaced,
    status = "WorkloadStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<OwnerParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_claims: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    #[serde(flatten)]
    pub owner: OwnerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supply_chain_ref: Option<BlueprintRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "Deliverable",
    namespaced,
    status = "DeliverableStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DeliverableSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<OwnerParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverableStatus {
    #[serde(flatten)]
    pub owner: OwnerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_ref: Option<BlueprintRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunTemplateReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
}

/// Additional object a run template may read as `selected`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    pub resource: ResourceType,
    #[serde(default)]
    pub matching_labels: BTreeMap<String, String>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "carto.run",
    version = "v1alpha1",
    kind = "Runnable",
    namespaced,
    status = "RunnableStatus",
    derive = "PartialEq",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct RunnableSpec {
    pub run_template_ref: RunTemplateReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<ResourceSelector>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_policy: Option<RetentionPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnableStatus {
    #[serde(flatten)]
    pub owner: OwnerStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerKind {
    Workload,
    Deliverable,
    Runnable,
}

/// Per-kind constants the shared reconcile skeleton consults.
#[derive(Debug)]
pub struct OwnerStrategy {
    pub kind: &'static str,
    /// Key under which the owner object appears in the stamping context.
    pub context_key: &'static str,
    pub name_label: &'static str,
    pub namespace_label: &'static str,
    pub blueprint: Option<BlueprintKind>,
    pub blueprint_name_label: &'static str,
    pub blueprint_ready_type: &'static str,
    pub labels_missing_reason: &'static str,
    pub not_found_reason: &'static str,
    pub multiple_matches_reason: &'static str,
}

static WORKLOAD: OwnerStrategy = OwnerStrategy {
    kind: "Workload",
    context_key: "workload",
    name_label: labels::WORKLOAD_NAME,
    namespace_label: labels::WORKLOAD_NAMESPACE,
    blueprint: Some(BlueprintKind::SupplyChain),
    blueprint_name_label: labels::SUPPLY_CHAIN_NAME,
    blueprint_ready_type: conditions::SUPPLY_CHAIN_READY,
    labels_missing_reason: conditions::WORKLOAD_LABELS_MISSING,
    not_found_reason: conditions::SUPPLY_CHAIN_NOT_FOUND,
    multiple_matches_reason: conditions::MULTIPLE_SUPPLY_CHAIN_MATCHES,
};

static DELIVERABLE: OwnerStrategy = OwnerStrategy {
    kind: "Deliverable",
    context_key: "deliverable",
    name_label: labels::DELIVERABLE_NAME,
    namespace_label: labels::DELIVERABLE_NAMESPACE,
    blueprint: Some(BlueprintKind::Delivery),
    blueprint_name_label: labels::DELIVERY_NAME,
    blueprint_ready_type: conditions::DELIVERY_READY,
    labels_missing_reason: conditions::DELIVERABLE_LABELS_MISSING,
    not_found_reason: conditions::DELIVERY_NOT_FOUND,
    multiple_matches_reason: conditions::MULTIPLE_DELIVERY_MATCHES,
};

static RUNNABLE: OwnerStrategy = OwnerStrategy {
    kind: "Runnable",
    context_key: "runnable",
    name_label: labels::RUNNABLE_NAME,
    namespace_label: labels::RUNNABLE_NAMESPACE,
    blueprint: None,
    blueprint_name_label: labels::RUN_TEMPLATE_NAME,
    blueprint_ready_type: conditions::RUN_TEMPLATE_READY,
    labels_missing_reason: "",
    not_found_reason: conditions::RUN_TEMPLATE_NOT_FOUND,
    multiple_matches_reason: "",
};

impl OwnerKind {
    pub fn strategy(&self) -> &'static OwnerStrategy {
        match self {
            OwnerKind::Workload => &WORKLOAD,
            OwnerKind::Deliverable => &DELIVERABLE,
            OwnerKind::Runnable => &RUNNABLE,
        }
    }

    pub fn kind(&self) -> &'static str {
        self.strategy().kind
    }
}

/// Owner realized against a blueprint.
#[derive(Debug, Clone, PartialEq)]
pub enum Owner {
    Workload(Workload),
    Deliverable(Deliverable),
}

impl From<Workload> for Owner {
    fn from(w: Workload) -> Self {
        Owner::Workload(w)
    }
}

impl From<Deliverable> for Owner {
    fn from(d: Deliverable) -> Self {
        Owner::Deliverable(d)
    }
}

impl Owner {
    pub fn kind(&self) -> OwnerKind {
        match self {
            Owner::Workload(_) => OwnerKind::Workload,
            Owner::Deliverable(_) => OwnerKind::Deliverable,
        }
    }

    pub fn strategy(&self) -> &'static OwnerStrategy {
        self.kind().strategy()
    }

    fn meta(&self) -> &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
        match self {
            Owner::Workload(w) => w.meta(),
            Owner::Deliverable(d) => d.meta(),
        }
    }

    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.meta().namespace.clone().unwrap_or_default()
    }

    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(self.namespace(), self.name())
    }

    pub fn generation(&self) -> Option<i64> {
        self.meta().generation
    }

    pub fn labels(&self) -> BTreeMap<String, String> {
        self.meta().labels.clone().unwrap_or_default()
    }

    pub fn params(&self) -> &[OwnerParam] {
        match self {
            Owner::Workload(w) => &w.spec.params,
            Owner::Deliverable(d) => &d.spec.params,
        }
    }

    /// Explicit service account, empty strings count as unset.
    pub fn service_account_name(&self) -> Option<&str> {
        let sa = match self {
            Owner::Workload(w) => w.spec.service_account_name.as_deref(),
            Owner::Deliverable(d) => d.spec.service_account_name.as_deref(),
        };
        sa.filter(|s| !s.is_empty())
    }

    fn status_parts(&self) -> Option<(&OwnerStatus, &[ResourceStatus])> {
        match self {
            Owner::Workload(w) => w.status.as_ref().map(|s| (&s.owner, s.resources.as_slice())),
            Owner::Deliverable(d) => d.status.as_ref().map(|s| (&s.owner, s.resources.as_slice())),
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status_parts().map(|(o, _)| o.conditions.as_slice()).unwrap_or_default()
    }

    pub fn resources(&self) -> &[ResourceStatus] {
        self.status_parts().map(|(_, r)| r).unwrap_or_default()
    }

    pub fn observed_generation(&self) -> Option<i64> {
        self.status_parts().and_then(|(o, _)| o.observed_generation)
    }

    pub fn blueprint_ref(&self) -> Option<&BlueprintRef> {
        match self {
            Owner::Workload(w) => w.status.as_ref().and_then(|s| s.supply_chain_ref.as_ref()),
            Owner::Deliverable(d) => d.status.as_ref().and_then(|s| s.delivery_ref.as_ref()),
        }
    }

    /// Replace the whole status; the engine never writes anything else on an owner.
    pub fn set_status(
        &mut self,
        conditions: Vec<Condition>,
        resources: Vec<ResourceStatus>,
        blueprint_ref: Option<BlueprintRef>,
        observed_generation: Option<i64>,
    ) {
        let owner = OwnerStatus { observed_generation, conditions };
        match self {
            Owner::Workload(w) => {
                w.status = Some(WorkloadStatus { owner, supply_chain_ref: blueprint_ref, resources });
            }
            Owner::Deliverable(d) => {
                d.status = Some(DeliverableStatus { owner, delivery_ref: blueprint_ref, resources });
            }
        }
    }

    /// Full object as JSON, including `apiVersion` and `kind`.
    pub fn to_value(&self) -> Value {
        let v = match self {
            Owner::Workload(w) => serde_json::to_value(w),
            Owner::Deliverable(d) => serde_json::to_value(d),
        };
        crate::refs::with_type_meta(v.unwrap_or(Value::Null), crate::API_VERSION, self.strategy().kind)
    }

    /// `status` subtree as JSON.
    pub fn status_value(&self) -> Value {
        let v = match self {
            Owner::Workload(w) => serde_json::to_value(&w.status),
            Owner::Deliverable(d) => serde_json::to_value(&d.status),
        };
        v.unwrap_or(Value::Null)
    }

    pub fn owner_reference(&self) -> OwnerReference {
        controller_reference(crate::API_VERSION, self.strategy().kind, &self.name(), self.meta().uid.as_deref())
    }
}

impl Runnable {
    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn service_account_name(&self) -> &str {
        self.spec.service_account_name.as_deref().filter(|s| !s.is_empty()).unwrap_or("default")
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.owner.conditions.as_slice()).unwrap_or_default()
    }

    pub fn outputs(&self) -> BTreeMap<String, Value> {
        self.status.as_ref().map(|s| s.outputs.clone()).unwrap_or_default()
    }

    pub fn owner_reference(&self) -> OwnerReference {
        controller_reference(crate::API_VERSION, "Runnable", &self.name_any(), self.meta().uid.as_deref())
    }
}

pub fn controller_reference(api_version: &str, kind: &str, name: &str, uid: Option<&str>) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.unwrap_or_default().to_string(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}
