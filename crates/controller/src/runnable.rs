//! Runnable reconciliation.

use std::collections::BTreeMap;

use carto_core::condition_manager::ConditionManager;
use carto_core::conditions;
use carto_core::owner::{Runnable, RunnableStatus};
use carto_core::refs::{DependencyKey, NamespacedName};
use carto_core::status::{OwnerStatus, StampedRef};
use carto_realizer::runnable::{self as run, run_template_key, succeeded_condition};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::context::{Context, ControllerKind, Request};
use crate::error::ReconcileError;

#[instrument(skip_all, fields(runnable = %key))]
pub async fn reconcile(ctx: &Context, key: &NamespacedName) -> Result<(), ReconcileError> {
    let request = Request::new(ControllerKind::Runnable, key.clone());
    let runnable = match ctx.system.get_runnable(key).await {
        Ok(Some(r)) => r,
        Ok(None) => {
            debug!("runnable gone, dropping tracked dependencies");
            ctx.tracker.clear_tracked(&request);
            return Ok(());
        }
        Err(e) => return Err(ReconcileError::unhandled(e, format!("failed to get runnable [{key}]"))),
    };

    let mut manager = ConditionManager::new(conditions::READY, runnable.conditions());
    let sa_key = NamespacedName::new(&key.namespace, runnable.service_account_name());
    ctx.tracker.repoint(
        &request,
        [DependencyKey::service_account(&sa_key.namespace, &sa_key.name), run_template_key(&runnable)],
    );

    let mut outputs = runnable.outputs();
    let result = drive(ctx, &runnable, &sa_key, &mut manager, &mut outputs).await;
    complete(ctx, &request, runnable, manager, outputs, result).await
}

async fn drive(
    ctx: &Context,
    runnable: &Runnable,
    sa_key: &NamespacedName,
    manager: &mut ConditionManager,
    outputs: &mut BTreeMap<String, Value>,
) -> Result<(), ReconcileError> {
    let sa = match ctx.system.get_service_account(sa_key).await {
        Ok(Some(sa)) => sa,
        Ok(None) => {
            let msg = format!("service account [{sa_key}] not found");
            manager.add_positive(conditions::run_template_failure(conditions::SERVICE_ACCOUNT_ERROR, msg.clone()));
            return Err(ReconcileError::handled(msg));
        }
        Err(e) => {
            manager.add_positive(conditions::run_template_failure(conditions::SERVICE_ACCOUNT_ERROR, e.to_string()));
            return Err(ReconcileError::handled(format!("failed to get service account [{sa_key}]: {e}")));
        }
    };

    let token = match ctx.tokens.get_service_account_token(&sa).await {
        Ok(t) => t,
        Err(e) => {
            manager.add_positive(conditions::run_template_failure(conditions::SERVICE_ACCOUNT_TOKEN_ERROR, e.to_string()));
            return Err(ReconcileError::handled(format!("failed to get token for service account [{sa_key}]: {e}")));
        }
    };

    let repo = match ctx.builder.build(&token) {
        Ok(r) => r,
        Err(e) => {
            manager.add_positive(conditions::run_template_failure(conditions::CLIENT_BUILDER_ERROR, e.to_string()));
            return Err(ReconcileError::unhandled(e, "failed to build resource realizer"));
        }
    };

    let outcome = run::realize(runnable, ctx.system.as_ref(), repo.as_ref()).await;
    match &outcome.error {
        Some(e) => manager.add_positive(e.condition()),
        None => manager.add_positive(conditions::run_template_ready()),
    }

    let stamped = outcome.stamped.as_ref();
    manager.add_positive(conditions::stamped_object_condition(stamped.and_then(succeeded_condition)));
    if let Some(r) = stamped.and_then(StampedRef::from_object) {
        ctx.watcher.watch(&r.api_version, &r.kind);
    }
    if outcome.error.is_none() || !outcome.outputs.is_empty() {
        *outputs = outcome.outputs;
    }

    match outcome.error {
        None => Ok(()),
        Some(e) if e.is_unhandled() => Err(ReconcileError::unhandled(e, "failed to realize runnable")),
        Some(e) => Err(ReconcileError::handled(e)),
    }
}

async fn complete(
    ctx: &Context,
    request: &Request,
    mut runnable: Runnable,
    manager: ConditionManager,
    outputs: BTreeMap<String, Value>,
    result: Result<(), ReconcileError>,
) -> Result<(), ReconcileError> {
    let (conds, changed) = manager.finalize();
    let generation = runnable.metadata.generation;
    let previous = runnable.status.take().unwrap_or_default();

    if changed || previous.owner.observed_generation != generation || previous.outputs != outputs {
        runnable.status = Some(RunnableStatus { owner: OwnerStatus { observed_generation: generation, conditions: conds }, outputs });
        let status = serde_json::to_value(&runnable.status).unwrap_or(Value::Null);
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
