//! Workload and deliverable reconciliation.
//!
//! One skeleton serves both owner kinds; the per-kind differences come from
//! [`OwnerStrategy`](carto_core::owner::OwnerStrategy). A pass selects the single matching blueprint, resolves
//! the service account, realizes every resource, garbage-collects stamped
//! objects that fell out of the blueprint and finally writes the status.

use std::collections::BTreeMap;

use carto_api::{RepoResult, Repository};
use carto_core::blueprint::{Blueprint, BlueprintKind, BlueprintSpec};
use carto_core::condition_manager::ConditionManager;
use carto_core::conditions::{self, condition, ConditionStatus};
use carto_core::owner::{Owner, OwnerKind};
use carto_core::refs::{DependencyKey, NamespacedName};
use carto_core::status::BlueprintRef;
use carto_core::Condition;
use carto_eval::owner_health_condition;
use carto_eval::selector::blueprint_matches;
use carto_realizer::{realize, BlueprintType, ResourceRealizer, ResourceStatuses};
use tracing::{debug, info, instrument, warn};

use crate::context::{Context, Request};
use crate::error::ReconcileError;
use crate::{events, orphans};

/// State a pass accumulates before the status write.
struct Pass {
    blueprint_ref: Option<BlueprintRef>,
    statuses: Option<ResourceStatuses>,
    deps: Vec<DependencyKey>,
}

async fn load(system: &dyn Repository, kind: OwnerKind, key: &NamespacedName) -> RepoResult<Option<Owner>> {
    Ok(match kind {
        OwnerKind::Workload => system.get_workload(key).await?.map(Owner::from),
        OwnerKind::Deliverable => system.get_deliverable(key).await?.map(Owner::from),
        OwnerKind::Runnable => None,
    })
}

/// Reconcile one workload or deliverable.
#[instrument(skip_all, fields(kind = kind.kind(), owner = %key))]
pub async fn reconcile(ctx: &Context, kind: OwnerKind, key: &NamespacedName) -> Result<(), ReconcileError> {
    let request = Request::new(kind.into(), key.clone());
    let owner = match load(ctx.system.as_ref(), kind, key).await {
        Ok(Some(o)) => o,
        Ok(None) => {
            debug!("owner gone, dropping tracked dependencies");
            ctx.tracker.clear_tracked(&request);
            return Ok(());
        }
        Err(e) => return Err(ReconcileError::unhandled(e, format!("failed to get {} [{key}]", kind.kind().to_lowercase()))),
    };

    let mut manager = ConditionManager::new(conditions::READY, owner.conditions());
    let mut pass = Pass { blueprint_ref: owner.blueprint_ref().cloned(), statuses: None, deps: Vec::new() };
    let result = drive(ctx, &owner, &mut manager, &mut pass).await;
    complete(ctx, &request, owner, manager, pass, result).await
}

async fn drive(ctx: &Context, owner: &Owner, manager: &mut ConditionManager, pass: &mut Pass) -> Result<(), ReconcileError> {
    let strategy = owner.strategy();
    let blueprint = select_blueprint(ctx, owner, manager).await?;
    let blueprint_type = BlueprintType::from(blueprint.kind());
    pass.blueprint_ref = Some(BlueprintRef { kind: blueprint.kind().kind().to_string(), name: blueprint.name() });

    match blueprint.ready_condition() {
        Some(c) if ConditionStatus::of(c) == ConditionStatus::True => {}
        ready => {
            manager.add_positive(blueprint_not_ready(strategy.blueprint_ready_type, ready));
            return Err(ReconcileError::handled(format!("{blueprint_type} [{}] is not in ready state", blueprint.name())));
        }
    }
    manager.add_positive(conditions::blueprint_ready(strategy.blueprint_ready_type));

    let sa_key = service_account_for(owner, blueprint.spec());
    pass.deps.push(DependencyKey::service_account(&sa_key.namespace, &sa_key.name));
    let sa = match ctx.system.get_service_account(&sa_key).await {
        Ok(Some(sa)) => sa,
        Ok(None) => {
            let msg = format!("service account [{sa_key}] not found");
            manager.add_positive(conditions::service_account_error(msg.clone()));
            return Err(ReconcileError::handled(msg));
        }
        Err(e) => {
            manager.add_positive(conditions::service_account_error(e.to_string()));
            return Err(ReconcileError::handled(format!("failed to get service account [{sa_key}]: {e}")));
        }
    };

    let token = match ctx.tokens.get_service_account_token(&sa).await {
        Ok(t) => t,
        Err(e) => {
            manager.add_positive(conditions::service_account_token_error(e.to_string()));
            return Err(ReconcileError::handled(format!("failed to get token for service account [{sa_key}]: {e}")));
        }
    };

    let repo = match ctx.builder.build(&token) {
        Ok(r) => r,
        Err(e) => {
            manager.add_positive(conditions::resource_realizer_builder_error(e.to_string()));
            return Err(ReconcileError::unhandled(e, "failed to build resource realizer"));
        }
    };

    let spec = blueprint.spec();
    let realizer = ResourceRealizer::new(
        owner.clone(),
        &blueprint.name(),
        blueprint_type,
        spec.params.clone(),
        ctx.system.clone(),
        repo,
    );
    let mut statuses = ResourceStatuses::new(owner.resources());
    let report = realize(&realizer, &spec.resources, &mut statuses).await;
    pass.deps.extend(report.templates);

    match &report.error {
        Some(e) => manager.add_positive(e.condition(conditions::RESOURCES_SUBMITTED)),
        None => manager.add_positive(conditions::resources_submitted()),
    }
    let current = statuses.current();
    manager.add_positive(owner_health_condition(&current, owner.conditions()));

    let owner_ref = Request::new(owner.kind().into(), owner.key()).object_ref();
    let mut out = Vec::new();
    // An aborted walk leaves rows unrealized; their objects are not orphans.
    if report.error.as_ref().map_or(true, |e| !e.is_unhandled()) {
        for removed in orphans::cleanup(ctx.system.as_ref(), owner.resources(), &current).await {
            out.push(events::removed_event(&owner_ref, &removed));
        }
    }
    for row in &current {
        if let Some(r) = &row.realized.stamped_ref {
            ctx.watcher.watch(&r.api_version, &r.kind);
        }
    }
    out.extend(events::resource_events(&owner_ref, &statuses));
    events::emit(ctx.events.as_ref(), out).await;
    pass.statuses = Some(statuses);

    match report.error {
        None => Ok(()),
        Some(e) if e.is_unhandled() => Err(ReconcileError::unhandled(e, "failed to realize resources")),
        Some(e) => Err(ReconcileError::handled(e)),
    }
}

/// Find the one blueprint whose selector the owner satisfies.
async fn select_blueprint(ctx: &Context, owner: &Owner, manager: &mut ConditionManager) -> Result<Blueprint, ReconcileError> {
    let strategy = owner.strategy();
    let owner_kind = strategy.kind.to_lowercase();
    let Some(bp_kind) = strategy.blueprint else {
        return Err(ReconcileError::handled(format!("{owner_kind} has no blueprint kind")));
    };
    let bp_type = BlueprintType::from(bp_kind);
    let ready_type = strategy.blueprint_ready_type;

    let labels = owner.labels();
    if labels.is_empty() {
        manager.add_positive(condition(
            ready_type,
            ConditionStatus::False,
            strategy.labels_missing_reason,
            format!("{owner_kind} has no labels to match to {bp_type}"),
        ));
        return Err(ReconcileError::handled(format!("{owner_kind} [{}] is missing required labels", owner.key())));
    }

    let candidates = list_blueprints(ctx.system.as_ref(), bp_kind)
        .await
        .map_err(|e| ReconcileError::unhandled(e, format!("failed to list {bp_type} for {owner_kind} [{}]", owner.key())))?;

    let owner_value = owner.to_value();
    let mut matched = Vec::new();
    let mut selector_failure = None;
    for bp in candidates {
        match blueprint_matches(bp.spec(), &labels, &owner_value) {
            Ok(true) => matched.push(bp),
            Ok(false) => {}
            Err(e) => {
                warn!(blueprint = %bp.name(), error = %e, "blueprint selector cannot be evaluated");
                selector_failure.get_or_insert_with(|| format!("{bp_type} [{}]: {e}", bp.name()));
            }
        }
    }

    match matched.len() {
        1 => Ok(matched.remove(0)),
        0 => {
            if let Some(msg) = selector_failure {
                manager.add_positive(condition(ready_type, ConditionStatus::False, conditions::SELECTOR_ERROR, msg.clone()));
                return Err(ReconcileError::handled(msg));
            }
            manager.add_positive(condition(
                ready_type,
                ConditionStatus::False,
                strategy.not_found_reason,
                format!("no {bp_type} found where full selector is satisfied by labels: {}", fmt_labels(&labels)),
            ));
            Err(ReconcileError::handled(format!("no {bp_type} matches {owner_kind} [{}]", owner.key())))
        }
        _ => {
            let names: Vec<String> = matched.iter().map(Blueprint::name).collect();
            manager.add_positive(condition(
                ready_type,
                ConditionStatus::False,
                strategy.multiple_matches_reason,
                format!("{owner_kind} may only match a single {bp_type}'s selector"),
            ));
            Err(ReconcileError::handled(format!(
                "{owner_kind} [{}] matches more than one {bp_type}: [{}]",
                owner.key(),
                names.join(", ")
            )))
        }
    }
}

async fn list_blueprints(system: &dyn Repository, kind: BlueprintKind) -> RepoResult<Vec<Blueprint>> {
    Ok(match kind {
        BlueprintKind::SupplyChain => system.list_supply_chains().await?.into_iter().map(Blueprint::SupplyChain).collect(),
        BlueprintKind::Delivery => system.list_deliveries().await?.into_iter().map(Blueprint::Delivery).collect(),
    })
}

fn fmt_labels(labels: &BTreeMap<String, String>) -> String {
    let pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}:{v}")).collect();
    format!("map[{}]", pairs.join(" "))
}

/// The blueprint's own `Ready` condition, surfaced under the owner's type.
fn blueprint_not_ready(type_: &str, ready: Option<&Condition>) -> Condition {
    match ready {
        Some(c) => {
            let reason = if c.reason.is_empty() { conditions::BLUEPRINT_NOT_READY } else { c.reason.as_str() };
            condition(type_, ConditionStatus::of(c), reason, c.message.clone())
        }
        None => condition(type_, ConditionStatus::Unknown, conditions::BLUEPRINT_NOT_READY, "blueprint has not been reconciled"),
    }
}

/// Owner's own service account, else the blueprint's reference, else `default`.
pub fn service_account_for(owner: &Owner, spec: &BlueprintSpec) -> NamespacedName {
    if let Some(name) = owner.service_account_name() {
        return NamespacedName::new(owner.namespace(), name);
    }
    if let Some(r) = spec.service_account_ref.as_ref().filter(|r| !r.name.is_empty()) {
        let ns = r.namespace.clone().filter(|n| !n.is_empty()).unwrap_or_else(|| owner.namespace());
        return NamespacedName::new(ns, &r.name);
    }
    NamespacedName::new(owner.namespace(), "default")
}

async fn complete(
    ctx: &Context,
    request: &Request,
    mut owner: Owner,
    manager: ConditionManager,
    pass: Pass,
    result: Result<(), ReconcileError>,
) -> Result<(), ReconcileError> {
    let (conds, changed) = manager.finalize();
    let (resources, resources_changed) = match &pass.statuses {
        Some(s) => (s.current(), s.is_changed()),
        None => (owner.resources().to_vec(), false),
    };
    let generation = owner.generation();
    let ref_changed = pass.blueprint_ref.as_ref() != owner.blueprint_ref();
    let stale = owner.observed_generation() != generation;

    ctx.tracker.repoint(request, pass.deps);

    if changed || stale || resources_changed || ref_changed {
        owner.set_status(conds, resources, pass.blueprint_ref, generation);
        ctx.system
            .update_status(&request.object_ref(), &owner.status_value())
            .await
            .map_err(|e| ReconcileError::unhandled(e, format!("failed to update status for {request}")))?;
        debug!("status updated");
    }

    match &result {
        Ok(()) => info!("reconciled"),
        Err(e) if e.is_unhandled() => warn!(error = %format!("{e:#}"), "reconcile failed"),
        Err(e) => info!(reason = %e, "reconcile blocked"),
    }
    result
}
