//! Ordered walk over a blueprint's resources, threading outputs downstream.

use carto_core::blueprint::BlueprintResource;
use carto_core::conditions::{self, find};
use carto_core::refs::DependencyKey;
use carto_core::status::{RealizedResource, ResourceStatus, StampedRef, TemplateRef};
use carto_core::Condition;
use carto_eval::{determine_health, output_rows, Inputs, OutputBus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::{debug, warn};

use crate::errors::RealizerError;
use crate::resource::{RealizeResource, Realized};
use crate::statuses::ResourceStatuses;

/// Outcome of one traversal.
#[derive(Debug, Default)]
pub struct RealizeReport {
    /// Every template a resource resolved to, found or not.
    pub templates: Vec<DependencyKey>,
    /// First failure; unhandled failures stop the walk.
    pub error: Option<RealizerError>,
}

/// Realize `resources` in order, recording one status row each.
///
/// Handled failures are recorded and the walk continues; downstream
/// resources then see no output from the failed one.
pub async fn realize(rr: &dyn RealizeResource, resources: &[BlueprintResource], statuses: &mut ResourceStatuses) -> RealizeReport {
    let mut report = RealizeReport::default();
    let mut bus = OutputBus::new();

    for resource in resources {
        let mut done = rr.realize(resource, &bus).await;
        if let Some(key) = done.template_key.take() {
            report.templates.push(key);
        }

        let (realized, healthy) = status_row(resource, &done, statuses);
        statuses.add(realized, done.error.as_ref(), healthy.into_iter().collect());

        if let Some(output) = done.output.take() {
            bus.insert(resource.name.clone(), output);
        }
        let Some(err) = done.error else { continue };
        let unhandled = err.is_unhandled();
        if unhandled {
            warn!(resource = %resource.name, error = %err, "unhandled error realizing resource");
        } else {
            debug!(resource = %resource.name, error = %err, "handled error realizing resource");
        }
        if report.error.is_none() {
            report.error = Some(err);
        }
        if unhandled {
            break;
        }
    }
    report
}

/// Build the row for a resource; with nothing stamped the previous row is kept.
fn status_row(resource: &BlueprintResource, done: &Realized, statuses: &ResourceStatuses) -> (RealizedResource, Option<Condition>) {
    let previous: Option<&ResourceStatus> = statuses.previous(&resource.name);
    let (Some(template), Some(stamped)) = (&done.template, &done.stamped) else {
        if let Some(prev) = previous {
            return (prev.realized.clone(), find(&prev.conditions, conditions::HEALTHY).cloned());
        }
        let mut realized = RealizedResource::named(&resource.name);
        realized.inputs = Inputs::provenance(resource);
        if let Some(t) = &done.template {
            realized.template_ref = Some(TemplateRef::new(t.kind.kind(), &t.name));
        }
        let rule = done.template.as_ref().and_then(|t| t.health_rule());
        let healthy = determine_health(rule.as_ref(), Some(&realized), None);
        return (realized, Some(healthy));
    };

    let prev_outputs = previous.map(|p| p.realized.outputs.as_slice()).unwrap_or_default();
    let outputs = match &done.output {
        Some(output) => match output_rows(output, prev_outputs, Time(statuses.now())) {
            Ok(rows) => rows,
            Err(e) => {
                warn!(resource = %resource.name, error = %e, "cannot render output rows, keeping previous");
                prev_outputs.to_vec()
            }
        },
        None => prev_outputs.to_vec(),
    };

    let realized = RealizedResource {
        name: resource.name.clone(),
        stamped_ref: StampedRef::from_object(stamped),
        template_ref: Some(TemplateRef::new(template.kind.kind(), &template.name)),
        inputs: Inputs::provenance(resource),
        outputs,
    };
    let healthy = determine_health(template.health_rule().as_ref(), Some(&realized), Some(stamped));
    (realized, Some(healthy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_api::RepoError;
    use carto_core::blueprint::{BlueprintTemplateRef, ResourceReference};
    use carto_core::template::{Template, TemplateKind, TemplateSpec};
    use carto_eval::Output;
    use serde_json::json;
    use std::sync::Mutex;

    use crate::errors::{BlueprintType, Site};

    /// Scripted per-resource outcomes; records the bus each resource saw.
    struct Scripted {
        seen: Mutex<Vec<(String, Vec<String>)>>,
    }

    fn site(r: &str) -> Site {
        Site { resource: r.into(), blueprint: "sc".into(), blueprint_type: BlueprintType::SupplyChain }
    }

    #[async_trait::async_trait]
    impl RealizeResource for Scripted {
        async fn realize(&self, resource: &BlueprintResource, bus: &OutputBus) -> Realized {
            self.seen.lock().unwrap().push((resource.name.clone(), bus.keys().cloned().collect()));
            let template = Template::new(TemplateKind::Source, &resource.template_ref.kind, TemplateSpec::default());
            let stamped = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": resource.name, "namespace": "ns"}});
            let mut out = Realized {
                template_key: Some(DependencyKey::template("ClusterSourceTemplate", &resource.template_ref.kind)),
                template: Some(template),
                stamped: Some(stamped),
                ..Default::default()
            };
            match resource.template_ref.kind.as_str() {
                "ok" => out.output = Some(Output::Source { url: json!("https://x"), revision: json!("abc") }),
                "handled" => {
                    out.error = Some(RealizerError::TemplateOptionsMatch { options: vec![], site: site(&resource.name) });
                }
                "unhandled" => {
                    out.template = None;
                    out.stamped = None;
                    out.error = Some(RealizerError::GetTemplate {
                        template: "t".into(),
                        site: site(&resource.name),
                        source: RepoError::NotFound("t".into()),
                    });
                }
                _ => {}
            }
            out
        }
    }

    fn resource(name: &str, behaviour: &str, sources: &[&str]) -> BlueprintResource {
        BlueprintResource {
            name: name.into(),
            template_ref: BlueprintTemplateRef { kind: behaviour.into(), ..Default::default() },
            sources: sources.iter().map(|s| ResourceReference { name: s.to_string(), resource: s.to_string() }).collect(),
            ..Default::default()
        }
    }

    fn scripted() -> Scripted {
        Scripted { seen: Mutex::new(Vec::new()) }
    }

    #[tokio::test]
    async fn outputs_flow_downstream_in_order() {
        let rr = scripted();
        let mut statuses = ResourceStatuses::new(&[]);
        let resources = [resource("a", "ok", &[]), resource("b", "ok", &["a"])];
        let report = realize(&rr, &resources, &mut statuses).await;
        assert!(report.error.is_none());
        assert_eq!(report.templates.len(), 2);

        let seen = rr.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![("a".to_string(), vec![]), ("b".to_string(), vec!["a".to_string()])]);

        let rows = statuses.current();
        assert_eq!(rows[1].realized.inputs[0].name, "a");
        assert_eq!(rows[0].realized.outputs.len(), 2);
        let healthy = find(&rows[0].conditions, conditions::HEALTHY).unwrap();
        assert_eq!((healthy.status.as_str(), healthy.reason.as_str()), ("True", conditions::OUTPUT_AVAILABLE));
    }

    #[tokio::test]
    async fn handled_errors_continue() {
        let rr = scripted();
        let mut statuses = ResourceStatuses::new(&[]);
        let resources = [resource("a", "handled", &[]), resource("b", "ok", &["a"])];
        let report = realize(&rr, &resources, &mut statuses).await;
        assert!(matches!(report.error, Some(RealizerError::TemplateOptionsMatch { .. })));
        assert_eq!(statuses.current().len(), 2);
        assert_eq!(rr.seen.lock().unwrap()[1].1, Vec::<String>::new());
    }

    #[tokio::test]
    async fn unhandled_errors_stop_and_keep_previous_row() {
        let mut first = ResourceStatuses::new(&[]);
        let rr = scripted();
        realize(&rr, &[resource("a", "ok", &[]), resource("b", "ok", &[])], &mut first).await;
        let prev = first.current();

        let mut statuses = ResourceStatuses::new(&prev);
        let resources = [resource("a", "unhandled", &[]), resource("b", "ok", &[])];
        let report = realize(&rr, &resources, &mut statuses).await;
        assert!(report.error.as_ref().is_some_and(RealizerError::is_unhandled));

        let rows = statuses.current();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].realized, prev[0].realized);
        let submitted = find(&rows[0].conditions, conditions::RESOURCE_SUBMITTED).unwrap();
        assert_eq!(submitted.reason, conditions::TEMPLATE_OBJECT_RETRIEVAL_FAILURE);
    }
}
