//! Stamping context assembly and the stamper that turns a template into an object.

use std::collections::BTreeMap;

use carto_core::blueprint::BlueprintResource;
use carto_core::labels::{self, Labels};
use carto_core::owner::OwnerStrategy;
use carto_core::status::ResourceInput;
use carto_core::template::{Lifecycle, Template};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{json, Map, Value};

use crate::interpolate::{self, InterpolateError};
use crate::output::{DeploymentInput, OutputBus};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StampError {
    #[error("failed to interpolate template: {0}")]
    Interpolate(#[from] InterpolateError),
    #[error("unknown resource template type, expected either template or ytt")]
    NoTemplate,
    #[error("ytt templates are not supported")]
    YttUnsupported,
    #[error("stamped resource is not an object")]
    NotAnObject,
    #[error("cannot set namespace in resource template")]
    NamespaceMismatch,
}

impl StampError {
    pub fn missing_expression(&self) -> Option<&str> {
        match self {
            StampError::Interpolate(e) => e.missing_expression(),
            _ => None,
        }
    }
}

/// Inputs a resource reads from the outputs of earlier resources.
///
/// Inputs whose producer has not yet produced the expected output kind are
/// left out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Inputs {
    pub sources: BTreeMap<String, Value>,
    pub images: BTreeMap<String, Value>,
    pub configs: BTreeMap<String, Value>,
    pub deployment: Option<DeploymentInput>,
}

impl Inputs {
    pub fn gather(resource: &BlueprintResource, bus: &OutputBus) -> Self {
        let mut inputs = Inputs::default();
        for r in &resource.sources {
            if let Some((url, revision)) = bus.get(&r.resource).and_then(|o| o.source()) {
                inputs.sources.insert(r.name.clone(), json!({"url": url, "revision": revision, "name": r.name}));
            }
        }
        for r in &resource.images {
            if let Some(image) = bus.get(&r.resource).and_then(|o| o.image()) {
                inputs.images.insert(r.name.clone(), json!({"image": image, "name": r.name}));
            }
        }
        for r in &resource.configs {
            if let Some(config) = bus.get(&r.resource).and_then(|o| o.config()) {
                inputs.configs.insert(r.name.clone(), json!({"config": config, "name": r.name}));
            }
        }
        if let Some(d) = &resource.deployment {
            if let Some((url, revision)) = bus.get(&d.resource).and_then(|o| o.source()) {
                inputs.deployment = Some(DeploymentInput { url: url.clone(), revision: revision.clone() });
            }
        }
        inputs
    }

    /// Upstream resources the resource consumes, for status provenance.
    pub fn provenance(resource: &BlueprintResource) -> Vec<ResourceInput> {
        resource.upstream().map(|name| ResourceInput { name: name.to_string() }).collect()
    }
}

fn single(map: &BTreeMap<String, Value>) -> Option<&Value> {
    if map.len() == 1 {
        map.values().next()
    } else {
        None
    }
}

/// Keys a workload or deliverable is reachable under, so one template can
/// serve both supply chains and deliveries.
const BLUEPRINT_OWNER_KEYS: [&str; 2] = ["workload", "deliverable"];

/// Interpolation context for a blueprint resource.
pub fn build_context(owner_key: &str, owner: &Value, params: Value, inputs: &Inputs) -> Value {
    let mut ctx = Map::new();
    if BLUEPRINT_OWNER_KEYS.contains(&owner_key) {
        for key in BLUEPRINT_OWNER_KEYS {
            ctx.insert(key.to_string(), owner.clone());
        }
    } else {
        ctx.insert(owner_key.to_string(), owner.clone());
    }
    ctx.insert("params".into(), params);
    ctx.insert("sources".into(), json!(inputs.sources));
    ctx.insert("images".into(), json!(inputs.images));
    ctx.insert("configs".into(), json!(inputs.configs));
    let deployment = inputs
        .deployment
        .as_ref()
        .map(|d| json!({"url": d.url, "revision": d.revision}))
        .unwrap_or(Value::Null);
    ctx.insert("deployment".into(), deployment);
    if let Some(s) = single(&inputs.sources) {
        ctx.insert("source".into(), s.clone());
    }
    if let Some(i) = single(&inputs.images).and_then(|v| v.get("image")) {
        ctx.insert("image".into(), i.clone());
    }
    if let Some(c) = single(&inputs.configs).and_then(|v| v.get("config")) {
        ctx.insert("config".into(), c.clone());
    }
    Value::Object(ctx)
}

/// Labels put on every object stamped for an owner's resource.
pub fn stamping_labels(
    strategy: &OwnerStrategy,
    owner_name: &str,
    owner_namespace: &str,
    blueprint_name: &str,
    resource_name: &str,
    template: &Template,
) -> Labels {
    let mut l = Labels::new();
    l.insert(strategy.name_label.into(), owner_name.into());
    l.insert(strategy.namespace_label.into(), owner_namespace.into());
    l.insert(strategy.blueprint_name_label.into(), blueprint_name.into());
    l.insert(labels::RESOURCE_NAME.into(), resource_name.into());
    l.insert(labels::TEMPLATE_KIND.into(), template.kind.kind().into());
    l.insert(labels::CLUSTER_TEMPLATE_NAME.into(), template.name.clone());
    l.insert(labels::TEMPLATE_LIFECYCLE.into(), template.lifecycle().as_str().into());
    l
}

/// Turns templates into objects owned by one owner.
pub struct Stamper {
    namespace: String,
    owner_ref: OwnerReference,
    labels: Labels,
}

impl Stamper {
    pub fn new(namespace: &str, owner_ref: OwnerReference, labels: Labels) -> Self {
        Self { namespace: namespace.to_string(), owner_ref, labels }
    }

    pub fn stamp(&self, template: &Template, name_prefix: &str, ctx: &Value) -> Result<Value, StampError> {
        if template.spec.ytt.is_some() {
            return Err(StampError::YttUnsupported);
        }
        let raw = template.spec.template.as_ref().ok_or(StampError::NoTemplate)?;
        self.stamp_raw(raw, template.lifecycle(), name_prefix, ctx)
    }

    /// Interpolate `raw` and stamp ownership, labels, namespace and a name onto it.
    ///
    /// Unnamed mutable objects are named `name_prefix`; unnamed immutable ones get
    /// `generateName: {name_prefix}-`.
    pub fn stamp_raw(&self, raw: &Value, lifecycle: Lifecycle, name_prefix: &str, ctx: &Value) -> Result<Value, StampError> {
        let mut obj = interpolate::interpolate(raw, ctx)?;
        let root = obj.as_object_mut().ok_or(StampError::NotAnObject)?;
        let meta = root.entry("metadata").or_insert_with(|| Value::Object(Map::new()));
        let meta = meta.as_object_mut().ok_or(StampError::NotAnObject)?;

        match meta.get("namespace").and_then(Value::as_str) {
            Some(ns) if !ns.is_empty() && ns != self.namespace => return Err(StampError::NamespaceMismatch),
            _ => {}
        }
        meta.insert("namespace".into(), Value::String(self.namespace.clone()));

        let named = meta.get("name").and_then(Value::as_str).is_some_and(|n| !n.is_empty());
        let generated = meta.get("generateName").and_then(Value::as_str).is_some_and(|n| !n.is_empty());
        if !named && !generated {
            if lifecycle.is_immutable() {
                meta.insert("generateName".into(), Value::String(format!("{name_prefix}-")));
            } else {
                meta.insert("name".into(), Value::String(name_prefix.to_string()));
            }
        }

        meta.insert("ownerReferences".into(), json!([self.owner_ref]));

        let mut merged: Labels = meta
            .get("labels")
            .and_then(|l| serde_json::from_value(l.clone()).ok())
            .unwrap_or_default();
        merged.extend(self.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        meta.insert("labels".into(), json!(merged));
        Ok(obj)
    }
}
