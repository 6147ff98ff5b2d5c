//! Realize one blueprint resource: pick a template, stamp it, apply it, read its output.

use std::sync::Arc;

use carto_api::{RepoError, Repository};
use carto_core::blueprint::{BlueprintResource, BlueprintTemplateRef};
use carto_core::conditions::ConditionStatus;
use carto_core::labels::Labels;
use carto_core::owner::Owner;
use carto_core::params::BlueprintParam;
use carto_core::refs::{fully_qualified_type, DependencyKey};
use carto_core::status::StampedRef;
use carto_core::template::{HealthRule, Template, TemplateKind};
use carto_eval::selector::{select_option, OptionSelectionError};
use carto_eval::{build_context, determine_health, read_output, stamping_labels, Inputs, Output, OutputBus, Stamper};
use metrics::counter;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::errors::{BlueprintType, RealizerError, Site};
use crate::retention::{self, Run};

/// What realizing one resource produced, including partial results on failure.
#[derive(Debug, Default)]
pub struct Realized {
    /// Template the resource resolved to, when it was named at all.
    pub template_key: Option<DependencyKey>,
    pub template: Option<Template>,
    /// Persisted stamped object.
    pub stamped: Option<Value>,
    pub output: Option<Output>,
    pub error: Option<RealizerError>,
}

impl Realized {
    fn failed(mut self, err: RealizerError) -> Self {
        self.error = Some(err);
        self
    }
}

#[async_trait::async_trait]
pub trait RealizeResource: Send + Sync {
    async fn realize(&self, resource: &BlueprintResource, bus: &OutputBus) -> Realized;
}

/// Realizes the resources of one owner against one blueprint.
///
/// Templates are read with the controller's own repository; stamped objects
/// are written with the owner's service-account repository.
pub struct ResourceRealizer {
    owner: Owner,
    owner_value: Value,
    blueprint: String,
    blueprint_type: BlueprintType,
    blueprint_params: Vec<BlueprintParam>,
    system: Arc<dyn Repository>,
    repo: Arc<dyn Repository>,
}

impl ResourceRealizer {
    pub fn new(
        owner: Owner,
        blueprint: &str,
        blueprint_type: BlueprintType,
        blueprint_params: Vec<BlueprintParam>,
        system: Arc<dyn Repository>,
        repo: Arc<dyn Repository>,
    ) -> Self {
        let owner_value = owner.to_value();
        Self {
            owner,
            owner_value,
            blueprint: blueprint.to_string(),
            blueprint_type,
            blueprint_params,
            system,
            repo,
        }
    }

    fn site(&self, resource: &str) -> Site {
        Site { resource: resource.to_string(), blueprint: self.blueprint.clone(), blueprint_type: self.blueprint_type }
    }

    fn template_name(&self, resource: &str, tref: &BlueprintTemplateRef) -> Result<String, RealizerError> {
        if tref.options.is_empty() {
            return Ok(tref.name.clone().unwrap_or_default());
        }
        let labels = self.owner.labels();
        match select_option(&tref.options, &labels, &self.owner_value) {
            Ok(opt) => Ok(opt.name.clone()),
            Err(OptionSelectionError::Resolve { option, source }) => {
                Err(RealizerError::ResolveTemplateOption { option, site: self.site(resource), reason: source.to_string() })
            }
            Err(OptionSelectionError::PassThrough(option)) => Err(RealizerError::ResolveTemplateOption {
                option,
                site: self.site(resource),
                reason: "passThrough options are not supported".into(),
            }),
            Err(OptionSelectionError::Match(options)) => {
                Err(RealizerError::TemplateOptionsMatch { options, site: self.site(resource) })
            }
        }
    }

    async fn get_template(&self, resource: &str, kind: &str, name: &str) -> Result<Template, RealizerError> {
        let err = |source| RealizerError::GetTemplate { template: name.to_string(), site: self.site(resource), source };
        let kind = TemplateKind::from_kind(kind).ok_or_else(|| err(RepoError::Invalid(format!("unknown template kind {kind}"))))?;
        match self.system.get_template(kind, name).await {
            Ok(Some(t)) => Ok(t),
            Ok(None) => Err(err(RepoError::NotFound(format!("{} [{name}]", kind.kind())))),
            Err(e) => Err(err(e)),
        }
    }

    async fn apply(&self, resource: &str, obj: &Value, allow_update: bool) -> Result<Value, RealizerError> {
        match self.repo.ensure_object(obj, allow_update).await {
            Ok(v) => {
                counter!("stamp_apply_total", 1u64);
                Ok(v)
            }
            Err(source) => {
                counter!("stamp_apply_err_total", 1u64);
                Err(RealizerError::ApplyStampedObject { object: display_name(obj), site: self.site(resource), source })
            }
        }
    }

    /// Create-only path: one new object per pass, then prune old runs and
    /// return the newest successful run to read outputs from.
    async fn apply_immutable(
        &self,
        resource: &str,
        template: &Template,
        stamped: &Value,
        labels: &Labels,
    ) -> Result<(Value, Option<Value>), RealizerError> {
        let created = self.apply(resource, stamped, false).await?;
        let api_version = created.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
        let kind = created.get("kind").and_then(Value::as_str).unwrap_or_default();
        let namespace = self.owner.namespace();

        let objects = self.repo.list_objects(api_version, kind, &namespace, labels).await.map_err(|source| {
            RealizerError::ListCreatedObjects { namespace: namespace.clone(), labels: fmt_labels(labels), source }
        })?;

        let rule = template.health_rule().unwrap_or_else(|| HealthRule { always_healthy: Some(json!({})), ..Default::default() });
        let mut runs: Vec<Run> = objects
            .into_iter()
            .map(|object| {
                let status = ConditionStatus::of(&determine_health(Some(&rule), None, Some(&object)));
                Run { object, status }
            })
            .collect();
        retention::newest_first(&mut runs);
        let pruned = retention::prune(self.repo.as_ref(), &runs, &template.retention()).await;

        let latest = runs
            .iter()
            .filter(|r| StampedRef::from_object(&r.object).map_or(true, |s| !pruned.contains(&s)))
            .find(|r| r.status == ConditionStatus::True)
            .map(|r| r.object.clone());
        Ok((created, latest))
    }
}

#[async_trait::async_trait]
impl RealizeResource for ResourceRealizer {
    #[instrument(skip_all, fields(owner = %self.owner.key(), resource = %resource.name))]
    async fn realize(&self, resource: &BlueprintResource, bus: &OutputBus) -> Realized {
        let mut out = Realized::default();
        let site = self.site(&resource.name);

        let name = match self.template_name(&resource.name, &resource.template_ref) {
            Ok(n) => n,
            Err(e) => return out.failed(e),
        };
        out.template_key = Some(DependencyKey::template(&resource.template_ref.kind, &name));

        let template = match self.get_template(&resource.name, &resource.template_ref.kind, &name).await {
            Ok(t) => t,
            Err(e) => return out.failed(e),
        };
        out.template = Some(template.clone());

        let params = carto_eval::params::merge(&template.spec.params, &self.blueprint_params, &resource.params, self.owner.params());
        let inputs = Inputs::gather(resource, bus);
        let strategy = self.owner.strategy();
        let ctx = build_context(strategy.context_key, &self.owner_value, params, &inputs);

        let (owner_name, namespace) = (self.owner.name(), self.owner.namespace());
        let labels = stamping_labels(strategy, &owner_name, &namespace, &self.blueprint, &resource.name, &template);
        let stamper = Stamper::new(&namespace, self.owner.owner_reference(), labels.clone());
        let stamped = match stamper.stamp(&template, &format!("{owner_name}-{}", resource.name), &ctx) {
            Ok(s) => s,
            Err(source) => {
                return out.failed(RealizerError::Stamp {
                    template_kind: template.kind.kind().to_string(),
                    template: template.name.clone(),
                    site,
                    source,
                })
            }
        };

        let (persisted, readable) = if template.lifecycle().is_immutable() {
            match self.apply_immutable(&resource.name, &template, &stamped, &labels).await {
                Ok(pair) => pair,
                Err(e) => return out.failed(e),
            }
        } else {
            match self.apply(&resource.name, &stamped, true).await {
                Ok(p) => (p.clone(), Some(p)),
                Err(e) => return out.failed(e),
            }
        };
        debug!(object = %display_name(&persisted), "applied stamped object");
        out.stamped = Some(persisted);

        let Some(readable) = readable else {
            debug!("no successful run to read outputs from yet");
            return out;
        };
        match read_output(&template, &readable, inputs.deployment.as_ref()) {
            Ok(output) => out.output = output,
            Err(source) => {
                let stamped = StampedRef::from_object(&readable).unwrap_or_default();
                let fq_type = fully_qualified_type(&stamped.gvk());
                out.error = Some(RealizerError::RetrieveOutput { stamped, fq_type, site, source });
            }
        }
        out
    }
}

/// `namespace/name`, falling back to `generateName` for unnamed objects.
pub(crate) fn display_name(obj: &Value) -> String {
    let ns = obj.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or_default();
    let name = obj
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .or_else(|| obj.pointer("/metadata/generateName").and_then(Value::as_str))
        .unwrap_or_default();
    format!("{ns}/{name}")
}

pub(crate) fn fmt_labels(labels: &Labels) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_api::MemoryRepository;
    use carto_core::owner::Workload;
    use carto_core::template::{Lifecycle, TemplateSpec};

    fn workload() -> Owner {
        let w: Workload = serde_json::from_value(json!({
            "apiVersion": "carto.run/v1alpha1",
            "kind": "Workload",
            "metadata": {"name": "app", "namespace": "dev", "uid": "w-uid", "labels": {"type": "web"}},
            "spec": {"params": [{"name": "port", "value": 8080}]}
        }))
        .unwrap();
        Owner::Workload(w)
    }

    fn config_template(lifecycle: Lifecycle) -> Template {
        let mut spec = TemplateSpec {
            template: Some(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "data": {"port": "$(params.port)$"}
            })),
            config_path: Some(".data".into()),
            lifecycle,
            ..Default::default()
        };
        spec.params = serde_json::from_value(json!([{"name": "port", "default": 80}])).unwrap();
        Template::new(TemplateKind::Config, "cfg", spec)
    }

    fn resource(template: &str) -> BlueprintResource {
        BlueprintResource {
            name: "config".into(),
            template_ref: BlueprintTemplateRef::single("ClusterConfigTemplate", template),
            ..Default::default()
        }
    }

    fn realizer(repo: &Arc<MemoryRepository>) -> ResourceRealizer {
        ResourceRealizer::new(workload(), "sc", BlueprintType::SupplyChain, vec![], repo.clone(), repo.clone())
    }

    #[tokio::test]
    async fn stamps_applies_and_reads_config() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(config_template(Lifecycle::Mutable).to_object());
        let out = realizer(&repo).realize(&resource("cfg"), &OutputBus::new()).await;
        assert!(out.error.is_none(), "{:?}", out.error);

        let stamped = out.stamped.unwrap();
        assert_eq!(stamped["metadata"]["name"], "app-config");
        assert_eq!(stamped["metadata"]["namespace"], "dev");
        assert_eq!(stamped["metadata"]["labels"]["carto.run/workload-name"], "app");
        assert_eq!(stamped["metadata"]["ownerReferences"][0]["uid"], "w-uid");
        assert_eq!(stamped["data"]["port"], 8080);
        assert_eq!(out.output, Some(Output::Config(json!({"port": 8080}))));
        assert_eq!(out.template_key, Some(DependencyKey::template("ClusterConfigTemplate", "cfg")));
    }

    #[tokio::test]
    async fn missing_template_is_unhandled() {
        let repo = Arc::new(MemoryRepository::new());
        let out = realizer(&repo).realize(&resource("nope"), &OutputBus::new()).await;
        let err = out.error.unwrap();
        assert!(matches!(err, RealizerError::GetTemplate { .. }));
        assert!(err.is_unhandled());
        assert!(out.template.is_none());
        assert_eq!(out.template_key, Some(DependencyKey::template("ClusterConfigTemplate", "nope")));
    }

    #[tokio::test]
    async fn forbidden_apply_is_handled() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(config_template(Lifecycle::Mutable).to_object());
        repo.fail("ensure_object", RepoError::Forbidden("sa cannot create configmaps".into()));
        let out = realizer(&repo).realize(&resource("cfg"), &OutputBus::new()).await;
        let err = out.error.unwrap();
        assert!(matches!(err, RealizerError::ApplyStampedObject { .. }));
        assert!(!err.is_unhandled());
        assert!(err.to_string().starts_with("unable to apply object [dev/app-config] for resource [config] in supply chain [sc]"));
    }

    #[tokio::test]
    async fn immutable_stamps_create_new_objects() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(config_template(Lifecycle::Immutable).to_object());
        let r = realizer(&repo);
        let first = r.realize(&resource("cfg"), &OutputBus::new()).await;
        let second = r.realize(&resource("cfg"), &OutputBus::new()).await;
        assert!(first.error.is_none() && second.error.is_none());

        let a = first.stamped.unwrap();
        let b = second.stamped.unwrap();
        assert_ne!(a["metadata"]["name"], b["metadata"]["name"]);
        assert!(a["metadata"]["name"].as_str().unwrap().starts_with("app-config-"));
        assert_eq!(repo.objects_of_kind("ConfigMap").len(), 2);
        assert_eq!(second.output, Some(Output::Config(json!({"port": 8080}))));
    }

    #[tokio::test]
    async fn immutable_list_failure_is_unhandled() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(config_template(Lifecycle::Immutable).to_object());
        repo.fail("list_objects", RepoError::Internal("etcd down".into()));
        let out = realizer(&repo).realize(&resource("cfg"), &OutputBus::new()).await;
        let err = out.error.unwrap();
        assert!(matches!(err, RealizerError::ListCreatedObjects { .. }));
        assert!(err.is_unhandled());
    }

    #[tokio::test]
    async fn tekton_output_waits_for_success() {
        let repo = Arc::new(MemoryRepository::new());
        let mut t = config_template(Lifecycle::Tekton);
        t.spec.config_path = Some(".status.results".into());
        repo.insert(t.to_object());
        let r = realizer(&repo);

        let first = r.realize(&resource("cfg"), &OutputBus::new()).await;
        assert!(first.error.is_none());
        assert!(first.output.is_none());

        let run = StampedRef::from_object(first.stamped.as_ref().unwrap()).unwrap();
        repo.set_status(&run, json!({"conditions": [{"type": "Succeeded", "status": "True"}], "results": ["ok"]}));
        let second = r.realize(&resource("cfg"), &OutputBus::new()).await;
        assert_eq!(second.output, Some(Output::Config(json!(["ok"]))));
        assert_ne!(StampedRef::from_object(second.stamped.as_ref().unwrap()).unwrap(), run);
    }

    #[test]
    fn display_name_falls_back_to_generate_name() {
        assert_eq!(display_name(&json!({"metadata": {"namespace": "ns", "generateName": "x-"}})), "ns/x-");
        assert_eq!(display_name(&json!({"metadata": {"namespace": "ns", "name": "x"}})), "ns/x");
    }
}
