//! Turn a watch event on any object into the reconcile requests it affects.

use std::collections::BTreeSet;

use carto_api::Repository;
use carto_core::blueprint::{Blueprint, BlueprintKind};
use carto_core::owner::Owner;
use carto_core::refs::{split_api_version, DependencyKey, NamespacedName};
use carto_core::template::TemplateKind;
use carto_eval::selector::blueprint_matches;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, RoleRef, Subject};
use serde_json::Value;
use tracing::{trace, warn};

use crate::context::{Context, ControllerKind, Request};

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

fn str_at<'a>(obj: &'a Value, pointer: &str) -> &'a str {
    obj.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

/// Requests to enqueue for a changed `obj`.
pub async fn requests_for(ctx: &Context, obj: &Value) -> Vec<Request> {
    let (group, _) = split_api_version(str_at(obj, "/apiVersion"));
    let kind = str_at(obj, "/kind");
    let name = str_at(obj, "/metadata/name");
    let namespace = str_at(obj, "/metadata/namespace");

    let mut out = BTreeSet::new();
    match (group.as_str(), kind) {
        ("", "ServiceAccount") => out.extend(tracked_by_service_accounts(ctx, [NamespacedName::new(namespace, name)])),
        (RBAC_GROUP, "RoleBinding") => match serde_json::from_value::<RoleBinding>(obj.clone()) {
            Ok(rb) => out.extend(tracked_by_service_accounts(ctx, subjects(rb.subjects.as_deref(), namespace))),
            Err(e) => warn!(name, error = %e, "cannot decode role binding"),
        },
        (RBAC_GROUP, "ClusterRoleBinding") => match serde_json::from_value::<ClusterRoleBinding>(obj.clone()) {
            Ok(crb) => out.extend(tracked_by_service_accounts(ctx, subjects(crb.subjects.as_deref(), ""))),
            Err(e) => warn!(name, error = %e, "cannot decode cluster role binding"),
        },
        (RBAC_GROUP, "Role") => {
            let sas = bound_to_role(ctx.system.as_ref(), "Role", name, Some(namespace)).await;
            out.extend(tracked_by_service_accounts(ctx, sas));
        }
        (RBAC_GROUP, "ClusterRole") => {
            let sas = bound_to_role(ctx.system.as_ref(), "ClusterRole", name, None).await;
            out.extend(tracked_by_service_accounts(ctx, sas));
        }
        (carto_core::GROUP, "ClusterRunTemplate") => {
            out.extend(ctx.tracker.lookup(&DependencyKey::template(kind, name)));
        }
        (carto_core::GROUP, "ClusterSupplyChain") => {
            out.extend(owners_of_blueprint(ctx, BlueprintKind::SupplyChain, obj, name).await);
        }
        (carto_core::GROUP, "ClusterDelivery") => {
            out.extend(owners_of_blueprint(ctx, BlueprintKind::Delivery, obj, name).await);
        }
        (carto_core::GROUP, k) if TemplateKind::from_kind(k).is_some() => {
            out.extend(ctx.tracker.lookup(&DependencyKey::template(kind, name)));
        }
        (carto_core::GROUP, "Workload" | "Deliverable" | "Runnable") => {
            if let Some(c) = ControllerKind::from_kind(kind) {
                out.insert(Request::new(c, NamespacedName::new(namespace, name)));
            }
        }
        _ => out.extend(controlling_owner(obj, namespace)),
    }
    trace!(kind, name, requests = out.len(), "mapped watch event");
    out.into_iter().collect()
}

fn tracked_by_service_accounts<I>(ctx: &Context, sas: I) -> Vec<Request>
where
    I: IntoIterator<Item = NamespacedName>,
{
    sas.into_iter()
        .flat_map(|sa| ctx.tracker.lookup(&DependencyKey::service_account(&sa.namespace, &sa.name)))
        .collect()
}

/// Service-account subjects of a binding; a subject without namespace takes the binding's.
fn subjects(subjects: Option<&[Subject]>, binding_namespace: &str) -> Vec<NamespacedName> {
    subjects
        .unwrap_or_default()
        .iter()
        .filter(|s| s.kind == "ServiceAccount")
        .map(|s| {
            let ns = s
                .namespace
                .as_deref()
                .filter(|n| !n.is_empty())
                .or(Some(binding_namespace).filter(|n| !n.is_empty()))
                .unwrap_or("default");
            NamespacedName::new(ns, &s.name)
        })
        .collect()
}

fn refers_to(role_ref: &RoleRef, kind: &str, name: &str) -> bool {
    (role_ref.api_group.is_empty() || role_ref.api_group == RBAC_GROUP) && role_ref.kind == kind && role_ref.name == name
}

/// Service accounts bound to a role; `namespace` limits role bindings to the role's own namespace.
async fn bound_to_role(system: &dyn Repository, kind: &str, name: &str, namespace: Option<&str>) -> Vec<NamespacedName> {
    let mut out = Vec::new();
    match system.list_role_bindings().await {
        Ok(rbs) => {
            for rb in rbs {
                let rb_ns = rb.metadata.namespace.clone().unwrap_or_default();
                if namespace.is_some_and(|ns| ns != rb_ns) || !refers_to(&rb.role_ref, kind, name) {
                    continue;
                }
                out.extend(subjects(rb.subjects.as_deref(), &rb_ns));
            }
        }
        Err(e) => warn!(role = name, error = %e, "cannot list role bindings"),
    }
    if namespace.is_none() {
        match system.list_cluster_role_bindings().await {
            Ok(crbs) => {
                for crb in crbs.into_iter().filter(|crb| refers_to(&crb.role_ref, kind, name)) {
                    out.extend(subjects(crb.subjects.as_deref(), ""));
                }
            }
            Err(e) => warn!(role = name, error = %e, "cannot list cluster role bindings"),
        }
    }
    out
}

/// The blueprint itself plus every owner it selects or was last realized against.
async fn owners_of_blueprint(ctx: &Context, kind: BlueprintKind, obj: &Value, name: &str) -> Vec<Request> {
    let controller = match kind {
        BlueprintKind::SupplyChain => ControllerKind::SupplyChain,
        BlueprintKind::Delivery => ControllerKind::Delivery,
    };
    let mut out = vec![Request::new(controller, NamespacedName::cluster(name))];

    let blueprint = match kind {
        BlueprintKind::SupplyChain => serde_json::from_value(obj.clone()).map(Blueprint::SupplyChain),
        BlueprintKind::Delivery => serde_json::from_value(obj.clone()).map(Blueprint::Delivery),
    };
    let blueprint = match blueprint {
        Ok(b) => b,
        Err(e) => {
            warn!(blueprint = name, error = %e, "cannot decode blueprint");
            return out;
        }
    };

    let owners: Vec<Owner> = match kind {
        BlueprintKind::SupplyChain => ctx.system.list_workloads().await.map(|v| v.into_iter().map(Owner::from).collect()),
        BlueprintKind::Delivery => ctx.system.list_deliverables().await.map(|v| v.into_iter().map(Owner::from).collect()),
    }
    .unwrap_or_else(|e| {
        warn!(blueprint = name, error = %e, "cannot list owners");
        Vec::new()
    });

    for owner in owners {
        let realized_against = owner.blueprint_ref().is_some_and(|r| r.kind == kind.kind() && r.name == name);
        let selected = blueprint_matches(blueprint.spec(), &owner.labels(), &owner.to_value()).unwrap_or(false);
        if realized_against || selected {
            out.push(Request::new(owner.kind().into(), owner.key()));
        }
    }
    out
}

/// Controlling owner reference to a carto.run owner kind.
fn controlling_owner(obj: &Value, namespace: &str) -> Option<Request> {
    let refs = obj.pointer("/metadata/ownerReferences")?.as_array()?;
    refs.iter()
        .filter(|r| r.get("controller").and_then(Value::as_bool) == Some(true))
        .find_map(|r| {
            let (group, _) = split_api_version(str_at(r, "/apiVersion"));
            if group != carto_core::GROUP {
                return None;
            }
            let controller = ControllerKind::from_kind(str_at(r, "/kind"))?;
            matches!(controller, ControllerKind::Workload | ControllerKind::Deliverable | ControllerKind::Runnable)
                .then(|| Request::new(controller, NamespacedName::new(namespace, str_at(r, "/name"))))
        })
}
