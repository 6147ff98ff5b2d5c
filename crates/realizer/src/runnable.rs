//! Stamp a runnable's `ClusterRunTemplate` and read outputs from its latest successful run.

use std::collections::BTreeMap;

use carto_api::{RepoError, Repository};
use carto_core::conditions::ConditionStatus;
use carto_core::labels::{self, Labels};
use carto_core::owner::{ResourceSelector, Runnable};
use carto_core::refs::{fully_qualified_type, with_type_meta, DependencyKey};
use carto_core::status::StampedRef;
use carto_core::template::{Lifecycle, RetentionPolicy};
use carto_eval::jsonpath;
use carto_eval::Stamper;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::errors::RunnableError;
use crate::resource::{display_name, fmt_labels};
use crate::retention::{self, Run};

const SUCCEEDED_STATUS: &str = r#".status.conditions[?(@.type=="Succeeded")].status"#;

/// Result of one runnable pass.
#[derive(Debug, Default)]
pub struct RunnableOutcome {
    pub stamped: Option<Value>,
    /// Outputs of the latest successful run, or the previous ones when there is none yet.
    pub outputs: BTreeMap<String, Value>,
    pub error: Option<RunnableError>,
}

impl RunnableOutcome {
    fn failed(mut self, err: RunnableError) -> Self {
        self.error = Some(err);
        self
    }
}

pub fn run_template_key(runnable: &Runnable) -> DependencyKey {
    DependencyKey::template("ClusterRunTemplate", &runnable.spec.run_template_ref.name)
}

/// Status of a run's `Succeeded` condition; absent reads as `Unknown`.
pub fn succeeded(obj: &Value) -> ConditionStatus {
    match jsonpath::evaluate(SUCCEEDED_STATUS, obj) {
        Ok(found) => found.first().and_then(Value::as_str).map(ConditionStatus::parse).unwrap_or(ConditionStatus::Unknown),
        Err(e) => {
            warn!(error = %e, "cannot read Succeeded condition");
            ConditionStatus::Unknown
        }
    }
}

/// The `Succeeded` condition object of a run, if any.
pub fn succeeded_condition(obj: &Value) -> Option<&Value> {
    obj.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("Succeeded"))
}

/// Resolve `selector` to exactly one object, namespaced first then cluster scoped.
async fn resolve_selector(repo: &dyn Repository, selector: &ResourceSelector, namespace: &str) -> Result<Value, RunnableError> {
    let err = |reason: String| RunnableError::ResolveSelector {
        labels: fmt_labels(&selector.matching_labels),
        api_version: selector.resource.api_version.clone(),
        kind: selector.resource.kind.clone(),
        reason,
    };
    let (api_version, kind) = (&selector.resource.api_version, &selector.resource.kind);
    let mut found = repo
        .list_objects(api_version, kind, namespace, &selector.matching_labels)
        .await
        .map_err(|e| err(format!("failed to list objects in namespace matching selector: {e}")))?;
    if found.is_empty() {
        found = repo
            .list_objects(api_version, kind, "", &selector.matching_labels)
            .await
            .map_err(|e| err(format!("failed to list objects at cluster scope matching selector: {e}")))?;
    }
    match found.len() {
        0 => Err(err("selector did not match any objects".into())),
        1 => Ok(found.remove(0)),
        _ => Err(err("selector matched multiple objects".into())),
    }
}

fn read_outputs(outputs: &BTreeMap<String, String>, obj: &Value) -> Result<BTreeMap<String, Value>, String> {
    outputs
        .iter()
        .map(|(name, path)| {
            jsonpath::evaluate_single(path, obj)
                .map(|v| (name.clone(), v))
                .map_err(|e| format!("failed to evaluate path [{path}] for output [{name}]: {e}"))
        })
        .collect()
}

/// Realize one runnable.
///
/// `system` reads the run template; `repo` acts as the runnable's service account.
#[instrument(skip_all, fields(runnable = %runnable.key()))]
pub async fn realize(runnable: &Runnable, system: &dyn Repository, repo: &dyn Repository) -> RunnableOutcome {
    let out = RunnableOutcome::default();
    let template_name = runnable.spec.run_template_ref.name.clone();
    let key = runnable.key();
    let namespace = key.namespace.clone();

    let run_template = match system.get_run_template(&template_name).await {
        Ok(Some(t)) => t,
        Ok(None) => {
            let source = RepoError::NotFound(format!("ClusterRunTemplate [{template_name}]"));
            return out.failed(RunnableError::GetRunTemplate { template: template_name, source });
        }
        Err(source) => return out.failed(RunnableError::GetRunTemplate { template: template_name, source }),
    };

    let mut stamp_labels = Labels::new();
    stamp_labels.insert(labels::RUNNABLE_NAME.into(), key.name.clone());
    stamp_labels.insert(labels::RUN_TEMPLATE_NAME.into(), template_name.clone());

    let selected = match &runnable.spec.selector {
        Some(sel) => match resolve_selector(repo, sel, &namespace).await {
            Ok(v) => v,
            Err(e) => return out.failed(e),
        },
        None => Value::Null,
    };

    let runnable_value = with_type_meta(serde_json::to_value(runnable).unwrap_or(Value::Null), carto_core::API_VERSION, "Runnable");
    let ctx = json!({"runnable": runnable_value, "selected": selected});
    let stamper = Stamper::new(&namespace, runnable.owner_reference(), stamp_labels.clone());
    let stamped = match stamper.stamp_raw(&run_template.spec.template, Lifecycle::Immutable, &key.name, &ctx) {
        Ok(s) => s,
        Err(source) => return out.failed(RunnableError::Stamp { template: template_name, source }),
    };

    let created = match repo.ensure_object(&stamped, false).await {
        Ok(c) => c,
        Err(source) => {
            return out.failed(RunnableError::ApplyStampedObject { object: display_name(&stamped), template: template_name, source })
        }
    };
    debug!(object = %display_name(&created), "created run");
    let mut out = RunnableOutcome { stamped: Some(created.clone()), ..out };

    let api_version = created.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
    let kind = created.get("kind").and_then(Value::as_str).unwrap_or_default();
    let objects = match repo.list_objects(api_version, kind, &namespace, &stamp_labels).await {
        Ok(o) => o,
        Err(source) => {
            return out.failed(RunnableError::ListCreatedObjects { namespace, labels: fmt_labels(&stamp_labels), source })
        }
    };

    let mut runs: Vec<Run> = objects.into_iter().map(|object| Run { status: succeeded(&object), object }).collect();
    retention::newest_first(&mut runs);
    let policy: RetentionPolicy = runnable.spec.retention_policy.unwrap_or_default();
    let pruned = retention::prune(repo, &runs, &policy).await;

    let latest = runs
        .iter()
        .filter(|r| StampedRef::from_object(&r.object).map_or(true, |s| !pruned.contains(&s)))
        .find(|r| r.status == ConditionStatus::True);

    let outputs = match latest {
        Some(run) => match read_outputs(&run_template.spec.outputs, &run.object) {
            Ok(o) => o,
            Err(reason) => {
                let stamped = StampedRef::from_object(&run.object).unwrap_or_default();
                let fq_type = fully_qualified_type(&stamped.gvk());
                out.error = Some(RunnableError::RetrieveOutput { stamped, fq_type, template: template_name, reason });
                return out;
            }
        },
        None => BTreeMap::new(),
    };
    out.outputs = if outputs.is_empty() { runnable.outputs() } else { outputs };
    out
}
