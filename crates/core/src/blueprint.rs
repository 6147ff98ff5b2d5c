//! Supply chains and deliveries: the blueprints owners are realized against.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelectorRequirement};
use kube::{CustomResource, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::conditions;
use crate::params::BlueprintParam;
use crate::refs::DependencyKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldSelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Requirement over a JSONPath `key` evaluated against an object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSelectorRequirement {
    pub key: String,
    pub operator: FieldSelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<FieldSelectorRequirement>,
}

impl OptionSelector {
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty() && self.match_fields.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateOption {
    pub name: String,
    #[serde(default)]
    pub selector: OptionSelector,
    /// Input forwarded without stamping; not supported by this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_through: Option<String>,
}

/// Either a single `{kind, name}` or a list of selectable options of one kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlueprintTemplateRef {
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<TemplateOption>,
}

impl BlueprintTemplateRef {
    pub fn single(kind: &str, name: &str) -> Self {
        Self { kind: kind.to_string(), name: Some(name.to_string()), options: Vec::new() }
    }

    /// Every template name this reference may resolve to.
    pub fn template_names(&self) -> Vec<&str> {
        match &self.name {
            Some(n) if self.options.is_empty() => vec![n.as_str()],
            _ => self.options.iter().filter(|o| o.pass_through.is_none()).map(|o| o.name.as_str()).collect(),
        }
    }
}

/// Binds an upstream resource's output to a local alias.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub name: String,
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentInput {
    pub resource: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintResource {
    pub name: String,
    pub template_ref: BlueprintTemplateRef,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<ResourceReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentInput>,
}

impl BlueprintResource {
    /// Names of upstream resources this resource reads from.
    pub fn upstream(&self) -> impl Iterator<Item = &str> {
        self.sources
            .iter()
            .chain(self.images.iter())
            .chain(self.configs.iter())
            .map(|r| r.resource.as_str())
            .chain(self.deployment.iter().map(|d| d.resource.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceAccountRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintSpec {
    #[serde(default)]
    pub resources: Vec<BlueprintResource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector_match_expressions: Vec<LabelSelectorRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selector_match_fields: Vec<FieldSelectorRequirement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<BlueprintParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_ref: Option<ServiceAccountRef>,
}

impl BlueprintSpec {
    /// Check names are unique, inputs only point backwards and option lists are well formed.
    ///
    /// Forward-only inputs keep the resource graph acyclic.
    pub fn validate(&self) -> Result<(), String> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for res in &self.resources {
            if res.name.is_empty() {
                return Err("resource with empty name".to_string());
            }
            for up in res.upstream() {
                if !seen.contains(up) {
                    return Err(format!(
                        "resource [{}] references input [{}] which is not an earlier resource",
                        res.name, up
                    ));
                }
            }
            if !seen.insert(res.name.as_str()) {
                return Err(format!("duplicate resource name [{}]", res.name));
            }
            validate_template_ref(&res.name, &res.template_ref)?;
        }
        Ok(())
    }

    pub fn selects_anything(&self) -> bool {
        !(self.selector.is_empty() && self.selector_match_expressions.is_empty() && self.selector_match_fields.is_empty())
    }
}

fn validate_template_ref(resource: &str, r: &BlueprintTemplateRef) -> Result<(), String> {
    match (&r.name, r.options.is_empty()) {
        (Some(_), false) => {
            return Err(format!("resource [{resource}] templateRef must set exactly one of name and options"))
        }
        (None, true) => return Err(format!("resource [{resource}] templateRef has neither name nor options")),
        _ => {}
    }
    if r.options.is_empty() {
        return Ok(());
    }
    if r.options.len() < 2 {
        return Err(format!("resource [{resource}] templateRef.options must have more than one option"));
    }
    let mut names = BTreeSet::new();
    for o in &r.options {
        if !names.insert(o.name.as_str()) {
            return Err(format!("resource [{resource}] templateRef.options has duplicate option [{}]", o.name));
        }
    }
    let with_selector = r.options.iter().filter(|o| !o.selector.is_empty()).count();
    if with_selector != 0 && with_selector != r.options.len() {
        return Err(format!("resource [{resource}] templateRef.options must all set a selector or none"));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlueprintStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "carto.run", version = "v1alpha1", kind = "ClusterSupplyChain", status = "BlueprintStatus", derive = "PartialEq", schema = "disabled")]
pub struct SupplyChainSpec {
    #[serde(flatten)]
    pub blueprint: BlueprintSpec,
}

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(group = "carto.run", version = "v1alpha1", kind = "ClusterDelivery", status = "BlueprintStatus", derive = "PartialEq", schema = "disabled")]
pub struct DeliverySpec {
    #[serde(flatten)]
    pub blueprint: BlueprintSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlueprintKind {
    SupplyChain,
    Delivery,
}

impl BlueprintKind {
    pub fn kind(&self) -> &'static str {
        match self {
            BlueprintKind::SupplyChain => "ClusterSupplyChain",
            BlueprintKind::Delivery => "ClusterDelivery",
        }
    }

    /// Template kinds a blueprint of this kind may reference.
    pub fn allowed_template_kinds(&self) -> &'static [&'static str] {
        match self {
            BlueprintKind::SupplyChain => {
                &["ClusterSourceTemplate", "ClusterImageTemplate", "ClusterConfigTemplate", "ClusterTemplate"]
            }
            BlueprintKind::Delivery => {
                &["ClusterSourceTemplate", "ClusterDeploymentTemplate", "ClusterConfigTemplate", "ClusterTemplate"]
            }
        }
    }
}

/// Tagged blueprint variant; the reconcilers only see this.
#[derive(Debug, Clone, PartialEq)]
pub enum Blueprint {
    SupplyChain(ClusterSupplyChain),
    Delivery(ClusterDelivery),
}

impl Blueprint {
    pub fn kind(&self) -> BlueprintKind {
        match self {
            Blueprint::SupplyChain(_) => BlueprintKind::SupplyChain,
            Blueprint::Delivery(_) => BlueprintKind::Delivery,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Blueprint::SupplyChain(b) => b.name_any(),
            Blueprint::Delivery(b) => b.name_any(),
        }
    }

    pub fn uid(&self) -> Option<String> {
        match self {
            Blueprint::SupplyChain(b) => b.metadata.uid.clone(),
            Blueprint::Delivery(b) => b.metadata.uid.clone(),
        }
    }

    pub fn generation(&self) -> Option<i64> {
        match self {
            Blueprint::SupplyChain(b) => b.metadata.generation,
            Blueprint::Delivery(b) => b.metadata.generation,
        }
    }

    pub fn spec(&self) -> &BlueprintSpec {
        match self {
            Blueprint::SupplyChain(b) => &b.spec.blueprint,
            Blueprint::Delivery(b) => &b.spec.blueprint,
        }
    }

    pub fn status(&self) -> Option<&BlueprintStatus> {
        match self {
            Blueprint::SupplyChain(b) => b.status.as_ref(),
            Blueprint::Delivery(b) => b.status.as_ref(),
        }
    }

    pub fn conditions(&self) -> &[Condition] {
        self.status().map(|s| s.conditions.as_slice()).unwrap_or_default()
    }

    pub fn set_status(&mut self, status: BlueprintStatus) {
        match self {
            Blueprint::SupplyChain(b) => b.status = Some(status),
            Blueprint::Delivery(b) => b.status = Some(status),
        }
    }

    /// `Ready` condition, if the blueprint reconciler has written one.
    pub fn ready_condition(&self) -> Option<&Condition> {
        conditions::find(self.conditions(), conditions::READY)
    }

    pub fn template_keys(&self) -> Vec<DependencyKey> {
        self.spec()
            .resources
            .iter()
            .flat_map(|r| {
                r.template_ref
                    .template_names()
                    .into_iter()
                    .map(|n| DependencyKey::template(&r.template_ref.kind, n))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn to_value(&self) -> serde_json::Value {
        let v = match self {
            Blueprint::SupplyChain(b) => serde_json::to_value(b),
            Blueprint::Delivery(b) => serde_json::to_value(b),
        };
        crate::refs::with_type_meta(v.unwrap_or(serde_json::Value::Null), crate::API_VERSION, self.kind().kind())
    }
}
