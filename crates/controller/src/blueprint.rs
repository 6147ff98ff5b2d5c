//! Supply chain and delivery reconciliation: validate the resource graph and
//! check that every referenced template exists.

use carto_api::{RepoResult, Repository};
use carto_core::blueprint::{Blueprint, BlueprintKind, BlueprintStatus};
use carto_core::condition_manager::ConditionManager;
use carto_core::conditions;
use carto_core::refs::DependencyKey;
use carto_core::template::TemplateKind;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::context::{Context, Request};
use crate::error::ReconcileError;

async fn load(system: &dyn Repository, kind: BlueprintKind, name: &str) -> RepoResult<Option<Blueprint>> {
    Ok(match kind {
        BlueprintKind::SupplyChain => system.get_supply_chain(name).await?.map(Blueprint::SupplyChain),
        BlueprintKind::Delivery => system.get_delivery(name).await?.map(Blueprint::Delivery),
    })
}

#[instrument(skip_all, fields(kind = kind.kind(), blueprint = %request.key))]
pub async fn reconcile(ctx: &Context, kind: BlueprintKind, request: &Request) -> Result<(), ReconcileError> {
    let name = request.key.name.as_str();
    let blueprint = match load(ctx.system.as_ref(), kind, name).await {
        Ok(Some(b)) => b,
        Ok(None) => {
            debug!("blueprint gone, dropping tracked dependencies");
            ctx.tracker.clear_tracked(request);
            return Ok(());
        }
        Err(e) => return Err(ReconcileError::unhandled(e, format!("failed to get {} [{name}]", kind.kind()))),
    };

    let mut manager = ConditionManager::new(conditions::READY, blueprint.conditions());
    let mut deps = Vec::new();
    let result = check(ctx, &blueprint, &mut manager, &mut deps).await;
    ctx.tracker.repoint(request, deps);
    complete(ctx, request, blueprint, manager, result).await
}

fn validate(blueprint: &Blueprint) -> Result<(), String> {
    let spec = blueprint.spec();
    spec.validate()?;
    let allowed = blueprint.kind().allowed_template_kinds();
    for res in &spec.resources {
        let kind = res.template_ref.kind.as_str();
        if !allowed.contains(&kind) {
            return Err(format!(
                "resource [{}] references template kind [{kind}] which a {} may not use",
                res.name,
                blueprint.kind().kind()
            ));
        }
    }
    Ok(())
}

async fn check(
    ctx: &Context,
    blueprint: &Blueprint,
    manager: &mut ConditionManager,
    deps: &mut Vec<DependencyKey>,
) -> Result<(), ReconcileError> {
    if let Err(msg) = validate(blueprint) {
        manager.add_positive(conditions::blueprint_invalid(msg.clone()));
        return Err(ReconcileError::handled(msg));
    }

    let mut not_found: Vec<String> = Vec::new();
    for res in &blueprint.spec().resources {
        let kind_name = res.template_ref.kind.as_str();
        let Some(kind) = TemplateKind::from_kind(kind_name) else { continue };
        for template in res.template_ref.template_names() {
            deps.push(DependencyKey::template(kind_name, template));
            let found = ctx
                .system
                .get_template(kind, template)
                .await
                .map_err(|e| ReconcileError::unhandled(e, format!("failed to get cluster template [{kind_name}/{template}]")))?;
            if found.is_none() && !not_found.contains(&res.name) {
                not_found.push(res.name.clone());
            }
        }
    }

    if not_found.is_empty() {
        manager.add_positive(conditions::templates_ready());
    } else {
        manager.add_positive(conditions::templates_not_found(&not_found));
    }
    Ok(())
}

async fn complete(
    ctx: &Context,
    request: &Request,
    mut blueprint: Blueprint,
    manager: ConditionManager,
    result: Result<(), ReconcileError>,
) -> Result<(), ReconcileError> {
    let (conds, changed) = manager.finalize();
    let generation = blueprint.generation();
    let observed = blueprint.status().and_then(|s| s.observed_generation);

    if changed || observed != generation {
        blueprint.set_status(BlueprintStatus { observed_generation: generation, conditions: conds });
        let status = serde_json::to_value(blueprint.status()).unwrap_or(Value::Null);
        ctx.system
            .update_status(&request.object_ref(), &status)
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

#[cfg(test)]
mod tests {
    use super::*;
    use carto_core::blueprint::ClusterSupplyChain;
    use serde_json::json;

    fn chain(resources: Value) -> Blueprint {
        let sc: ClusterSupplyChain = serde_json::from_value(json!({
            "apiVersion": "carto.run/v1alpha1", "kind": "ClusterSupplyChain",
            "metadata": {"name": "sc"},
            "spec": {"selector": {"app": "web"}, "resources": resources}
        }))
        .unwrap();
        Blueprint::SupplyChain(sc)
    }

    #[test]
    fn deployment_templates_are_rejected_in_supply_chains() {
        let bp = chain(json!([{"name": "deploy", "templateRef": {"kind": "ClusterDeploymentTemplate", "name": "d"}}]));
        let err = validate(&bp).unwrap_err();
        assert!(err.contains("ClusterDeploymentTemplate"), "{err}");
    }

    #[test]
    fn forward_inputs_are_rejected() {
        let bp = chain(json!([
            {"name": "a", "templateRef": {"kind": "ClusterTemplate", "name": "t"}, "configs": [{"name": "c", "resource": "b"}]},
            {"name": "b", "templateRef": {"kind": "ClusterTemplate", "name": "t"}}
        ]));
        assert!(validate(&bp).is_err());
        let ok = chain(json!([{"name": "a", "templateRef": {"kind": "ClusterTemplate", "name": "t"}}]));
        assert!(validate(&ok).is_ok());
    }
}
