use std::sync::Arc;
use std::time::Duration;

use carto_api::{MemoryEventSink, MemoryRepository, RecordingWatcher, Repository, StaticRepositoryBuilder, StaticTokenManager};
use carto_controller::events::{RESOURCE_OUTPUT_CHANGED, STAMPED_OBJECT_APPLIED};
use carto_controller::{mapper, Context, Controller, ControllerConfig, ControllerKind, ReconcileError, Request};
use carto_core::conditions::{self, find};
use carto_core::owner::Owner;
use carto_core::refs::{DependencyKey, NamespacedName};
use carto_core::status::{ResourceStatus, StampedRef};
use carto_core::Condition;
use serde_json::{json, Value};

struct Harness {
    repo: Arc<MemoryRepository>,
    builder: Arc<StaticRepositoryBuilder>,
    tokens: Arc<StaticTokenManager>,
    events: Arc<MemoryEventSink>,
    watcher: Arc<RecordingWatcher>,
    controller: Arc<Controller>,
}

impl Harness {
    fn new() -> Self {
        let repo = Arc::new(MemoryRepository::new());
        let builder = Arc::new(StaticRepositoryBuilder::new(repo.clone()));
        let tokens = Arc::new(StaticTokenManager::new());
        let events = Arc::new(MemoryEventSink::new());
        let watcher = Arc::new(RecordingWatcher::new());
        let config = ControllerConfig::default();
        let ctx = Context::new(repo.clone(), builder.clone(), tokens.clone(), events.clone(), watcher.clone(), &config);
        let controller = Controller::new(ctx, config);
        Self { repo, builder, tokens, events, watcher, controller }
    }

    fn ctx(&self) -> &Context {
        self.controller.context()
    }

    async fn reconcile(&self, kind: ControllerKind, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        self.controller.reconcile(&Request::new(kind, NamespacedName::new(namespace, name))).await
    }

    async fn workload(&self, name: &str) -> Owner {
        let w = self.repo.get_workload(&NamespacedName::new("dev", name)).await.unwrap().unwrap();
        Owner::from(w)
    }

    async fn deliverable(&self, name: &str) -> Owner {
        let d = self.repo.get_deliverable(&NamespacedName::new("dev", name)).await.unwrap().unwrap();
        Owner::from(d)
    }

    fn service_account(&self, name: &str) {
        self.repo.insert(json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": name, "namespace": "dev"}}));
    }

    fn template(&self, kind: &str, name: &str, spec: Value) {
        self.repo.insert(json!({"apiVersion": "carto.run/v1alpha1", "kind": kind, "metadata": {"name": name}, "spec": spec}));
    }

    /// Insert a blueprint and let its own reconciler mark it ready.
    async fn blueprint(&self, kind: ControllerKind, name: &str, spec: Value) {
        self.repo.insert(json!({"apiVersion": "carto.run/v1alpha1", "kind": kind.kind(), "metadata": {"name": name}, "spec": spec}));
        self.reconcile(kind, "", name).await.unwrap();
    }

    fn owner(&self, kind: &str, name: &str, labels: Value, spec: Value) {
        self.repo.insert(json!({
            "apiVersion": "carto.run/v1alpha1", "kind": kind,
            "metadata": {"name": name, "namespace": "dev", "labels": labels},
            "spec": spec
        }));
    }

    fn object(&self, api_version: &str, kind: &str, name: &str) -> Option<Value> {
        self.repo.object(&stamped_ref(api_version, kind, name))
    }
}

fn stamped_ref(api_version: &str, kind: &str, name: &str) -> StampedRef {
    StampedRef { api_version: api_version.into(), kind: kind.into(), namespace: Some("dev".into()), name: name.into() }
}

fn status_of<'a>(conds: &'a [Condition], type_: &str) -> (&'a str, &'a str) {
    let c = find(conds, type_).unwrap_or_else(|| panic!("no {type_} condition in {conds:?}"));
    (c.status.as_str(), c.reason.as_str())
}

fn row<'a>(rows: &'a [ResourceStatus], name: &str) -> &'a ResourceStatus {
    rows.iter().find(|r| r.name() == name).unwrap_or_else(|| panic!("no row {name}"))
}

fn source_template(with_url: bool) -> Value {
    let mut spec = json!({"ref": "main"});
    if with_url {
        spec["url"] = json!("$(workload.spec.source.git.url)$");
    }
    json!({
        "template": {"apiVersion": "example.com/v1", "kind": "Source", "spec": spec},
        "urlPath": ".spec.url"
    })
}

fn image_template() -> Value {
    json!({
        "template": {"apiVersion": "example.com/v1", "kind": "Image", "spec": {"source": "$(source.url)$", "tag": "registry/app"}},
        "imagePath": ".spec.tag"
    })
}

fn two_step_chain() -> Value {
    json!({
        "selector": {"app": "x"},
        "resources": [
            {"name": "src", "templateRef": {"kind": "ClusterSourceTemplate", "name": "src"}},
            {"name": "img", "templateRef": {"kind": "ClusterImageTemplate", "name": "img"},
             "sources": [{"name": "source", "resource": "src"}]}
        ]
    })
}

fn app_workload(h: &Harness, sa: &str) {
    h.owner(
        "Workload",
        "app",
        json!({"app": "x"}),
        json!({"serviceAccountName": sa, "source": {"git": {"url": "https://github.com/acme/app"}}}),
    );
}

#[tokio::test]
async fn two_resource_chain_becomes_ready_in_one_pass() {
    let h = Harness::new();
    h.service_account("default");
    h.template("ClusterSourceTemplate", "src", source_template(true));
    h.template("ClusterImageTemplate", "img", image_template());
    h.blueprint(ControllerKind::SupplyChain, "chain", two_step_chain()).await;
    app_workload(&h, "");

    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();

    assert!(h.object("example.com/v1", "Source", "app-src").is_some());
    let image = h.object("example.com/v1", "Image", "app-img").unwrap();
    assert_eq!(image["spec"]["source"], "https://github.com/acme/app");

    let w = h.workload("app").await;
    assert_eq!(status_of(w.conditions(), conditions::READY).0, "True", "{:?}", w.conditions());
    assert_eq!(w.blueprint_ref().map(|r| r.name.as_str()), Some("chain"));
    assert_eq!(w.observed_generation(), Some(1));
    assert_eq!(w.resources().len(), 2);

    let reasons = h.events.reasons();
    assert_eq!(reasons.iter().filter(|r| *r == STAMPED_OBJECT_APPLIED).count(), 2);
    assert_eq!(reasons.iter().filter(|r| *r == RESOURCE_OUTPUT_CHANGED).count(), 2);
    assert!(h.watcher.watched().contains(&("example.com/v1".to_string(), "Image".to_string())));

    let app = Request::new(ControllerKind::Workload, NamespacedName::new("dev", "app"));
    assert_eq!(h.ctx().tracker.lookup(&DependencyKey::template("ClusterImageTemplate", "img")), [app]);

    // a settled owner is not written again
    let writes = h.repo.count_calls("update_status carto.run/v1alpha1/Workload");
    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();
    assert_eq!(h.repo.count_calls("update_status carto.run/v1alpha1/Workload"), writes);
}

#[tokio::test]
async fn missing_output_skips_downstream_and_leaves_owner_unknown() {
    let h = Harness::new();
    h.service_account("default");
    h.template("ClusterSourceTemplate", "src", source_template(false));
    h.template("ClusterImageTemplate", "img", image_template());
    h.blueprint(ControllerKind::SupplyChain, "chain", two_step_chain()).await;
    app_workload(&h, "");

    let err = h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap_err();
    assert!(!err.is_unhandled(), "{err}");

    let w = h.workload("app").await;
    let rows = w.resources();
    assert_eq!(
        status_of(&row(rows, "src").conditions, conditions::RESOURCE_SUBMITTED),
        ("Unknown", conditions::MISSING_VALUE_AT_PATH)
    );
    assert!(row(rows, "img").realized.stamped_ref.is_none());
    assert!(h.object("example.com/v1", "Image", "app-img").is_none());
    assert_eq!(status_of(w.conditions(), conditions::READY).0, "Unknown");
}

#[tokio::test]
async fn immutable_revisions_are_kept_across_passes() {
    let h = Harness::new();
    h.service_account("default");
    h.template(
        "ClusterTemplate",
        "job",
        json!({"lifecycle": "immutable", "template": {"apiVersion": "example.com/v1", "kind": "Job", "spec": {"image": "busybox"}}}),
    );
    h.blueprint(
        ControllerKind::SupplyChain,
        "chain",
        json!({"selector": {"app": "x"}, "resources": [{"name": "test", "templateRef": {"kind": "ClusterTemplate", "name": "job"}}]}),
    )
    .await;
    app_workload(&h, "");

    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();
    let first = h.workload("app").await.resources()[0].realized.stamped_ref.clone().unwrap();
    assert!(first.name.starts_with("app-test-"), "{first}");
    assert_eq!(h.repo.objects_of_kind("Job").len(), 1);

    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();
    let rows = h.workload("app").await.resources().to_vec();
    assert_eq!(rows.len(), 1);
    let second = rows[0].realized.stamped_ref.clone().unwrap();
    assert_ne!(first.name, second.name);
    assert_eq!(h.repo.objects_of_kind("Job").len(), 2);
    assert_eq!(h.repo.count_calls("delete"), 0);
}

#[tokio::test(start_paused = true)]
async fn service_account_changes_requeue_owners_until_cleared_or_expired() {
    let h = Harness::new();
    h.service_account("sa-1");
    h.template("ClusterSourceTemplate", "src", source_template(true));
    h.template("ClusterImageTemplate", "img", image_template());
    h.blueprint(ControllerKind::SupplyChain, "chain", two_step_chain()).await;
    app_workload(&h, "sa-1");
    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();

    let sa = json!({"apiVersion": "v1", "kind": "ServiceAccount", "metadata": {"name": "sa-1", "namespace": "dev"}});
    let app = Request::new(ControllerKind::Workload, NamespacedName::new("dev", "app"));
    assert_eq!(mapper::requests_for(h.ctx(), &sa).await, [app.clone()]);
    assert_eq!(h.controller.enqueue_for(&sa).await, 1);
    assert_eq!(h.controller.queue().len(), 1);

    tokio::time::advance(h.ctx().tracker.lease() + Duration::from_secs(1)).await;
    assert!(mapper::requests_for(h.ctx(), &sa).await.is_empty(), "lease expired");

    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();
    assert_eq!(mapper::requests_for(h.ctx(), &sa).await, [app.clone()]);
    h.repo.remove(&app.object_ref());
    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();
    assert!(mapper::requests_for(h.ctx(), &sa).await.is_empty(), "cleared with the owner");
}

#[tokio::test]
async fn delivery_health_follows_the_succeeded_condition() {
    let h = Harness::new();
    h.service_account("default");
    h.template(
        "ClusterTemplate",
        "app-deploy",
        json!({
            "template": {"apiVersion": "example.com/v1", "kind": "App", "spec": {"source": "$(deliverable.spec.source.image)$"}},
            "healthRule": {"singleConditionType": "Succeeded"}
        }),
    );
    h.blueprint(
        ControllerKind::Delivery,
        "deliver",
        json!({"selector": {"app": "x"}, "resources": [{"name": "deploy", "templateRef": {"kind": "ClusterTemplate", "name": "app-deploy"}}]}),
    )
    .await;
    h.owner("Deliverable", "app", json!({"app": "x"}), json!({"source": {"image": "registry/app@sha256:1"}}));

    h.reconcile(ControllerKind::Deliverable, "dev", "app").await.unwrap();
    let app = stamped_ref("example.com/v1", "App", "app-deploy");
    assert_eq!(h.repo.object(&app).unwrap()["spec"]["source"], "registry/app@sha256:1");

    h.repo.set_status(&app, json!({"conditions": [{"type": "Succeeded", "status": "True"}]}));
    h.reconcile(ControllerKind::Deliverable, "dev", "app").await.unwrap();
    let d = h.deliverable("app").await;
    assert_eq!(status_of(&d.resources()[0].conditions, conditions::HEALTHY), ("True", "SucceededCondition"));
    assert_eq!(status_of(d.conditions(), conditions::READY).0, "True");
    assert_eq!(d.blueprint_ref().map(|r| r.kind.as_str()), Some("ClusterDelivery"));

    h.repo.set_status(&app, json!({"conditions": [{"type": "Succeeded", "status": "False", "message": "crashloop"}]}));
    h.reconcile(ControllerKind::Deliverable, "dev", "app").await.unwrap();
    let d = h.deliverable("app").await;
    assert_eq!(status_of(&d.resources()[0].conditions, conditions::HEALTHY), ("False", "SucceededCondition"));
    assert_eq!(status_of(d.conditions(), conditions::RESOURCES_HEALTHY).0, "False");
}

#[tokio::test]
async fn blueprint_service_account_drives_the_stamping_repository() {
    let h = Harness::new();
    h.service_account("sc-sa");
    h.template("ClusterSourceTemplate", "src", source_template(true));
    h.template("ClusterImageTemplate", "img", image_template());
    let mut chain = two_step_chain();
    chain["serviceAccountRef"] = json!({"name": "sc-sa"});
    h.blueprint(ControllerKind::SupplyChain, "chain", chain).await;
    app_workload(&h, "");

    h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap();

    assert_eq!(h.repo.count_calls("get_service_account"), 1);
    assert!(h.repo.calls().contains(&"get_service_account dev/sc-sa".to_string()));
    assert_eq!(h.tokens.requested(), ["dev/sc-sa"]);
    assert_eq!(h.builder.tokens(), ["token-dev-sc-sa"]);
}

#[tokio::test]
async fn selection_failures_are_reported_on_the_owner() {
    let h = Harness::new();
    h.service_account("default");
    h.owner("Workload", "bare", json!({}), json!({}));
    h.owner("Workload", "lonely", json!({"app": "nothing"}), json!({}));
    h.owner("Workload", "greedy", json!({"app": "x"}), json!({}));
    h.blueprint(ControllerKind::SupplyChain, "one", json!({"selector": {"app": "x"}, "resources": []})).await;
    h.blueprint(ControllerKind::SupplyChain, "two", json!({"selector": {"app": "x"}, "resources": []})).await;

    for (name, reason) in [
        ("bare", conditions::WORKLOAD_LABELS_MISSING),
        ("lonely", conditions::SUPPLY_CHAIN_NOT_FOUND),
        ("greedy", conditions::MULTIPLE_SUPPLY_CHAIN_MATCHES),
    ] {
        let err = h.reconcile(ControllerKind::Workload, "dev", name).await.unwrap_err();
        assert!(!err.is_unhandled());
        let w = h.workload(name).await;
        assert_eq!(status_of(w.conditions(), conditions::SUPPLY_CHAIN_READY), ("False", reason), "{name}");
        assert_eq!(status_of(w.conditions(), conditions::READY).0, "False");
    }
    let lonely = h.workload("lonely").await;
    let msg = &find(lonely.conditions(), conditions::SUPPLY_CHAIN_READY).unwrap().message;
    assert!(msg.contains("app:nothing"), "{msg}");
}

#[tokio::test]
async fn blueprint_with_missing_templates_blocks_its_owners() {
    let h = Harness::new();
    h.service_account("default");
    h.template("ClusterSourceTemplate", "src", source_template(true));
    h.blueprint(ControllerKind::SupplyChain, "chain", two_step_chain()).await;
    app_workload(&h, "");

    let sc = h.repo.object(&StampedRef {
        api_version: "carto.run/v1alpha1".into(),
        kind: "ClusterSupplyChain".into(),
        namespace: None,
        name: "chain".into(),
    });
    let sc_conds: Vec<Condition> = serde_json::from_value(sc.unwrap()["status"]["conditions"].clone()).unwrap();
    assert_eq!(status_of(&sc_conds, conditions::TEMPLATES_READY), ("False", conditions::TEMPLATES_NOT_FOUND));

    let err = h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap_err();
    assert!(!err.is_unhandled());
    let w = h.workload("app").await;
    assert_eq!(status_of(w.conditions(), conditions::SUPPLY_CHAIN_READY), ("False", conditions::TEMPLATES_NOT_FOUND));
    assert!(w.resources().is_empty());

    // the missing template arrives: the tracker maps it back to the chain
    let img = json!({"apiVersion": "carto.run/v1alpha1", "kind": "ClusterImageTemplate", "metadata": {"name": "img"}, "spec": image_template()});
    let chain = Request::new(ControllerKind::SupplyChain, NamespacedName::cluster("chain"));
    assert_eq!(mapper::requests_for(h.ctx(), &img).await, [chain]);
}

#[tokio::test]
async fn service_account_problems_are_handled() {
    let h = Harness::new();
    h.template("ClusterSourceTemplate", "src", source_template(true));
    h.template("ClusterImageTemplate", "img", image_template());
    h.blueprint(ControllerKind::SupplyChain, "chain", two_step_chain()).await;
    app_workload(&h, "ghost");

    let err = h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap_err();
    assert!(!err.is_unhandled());
    let w = h.workload("app").await;
    assert_eq!(
        status_of(w.conditions(), conditions::RESOURCES_SUBMITTED),
        ("False", conditions::SERVICE_ACCOUNT_ERROR)
    );

    h.service_account("ghost");
    h.tokens.fail_with("token endpoint down");
    let err = h.reconcile(ControllerKind::Workload, "dev", "app").await.unwrap_err();
    assert!(!err.is_unhandled());
    let w = h.workload("app").await;
    assert_eq!(
        status_of(w.conditions(), conditions::RESOURCES_SUBMITTED),
        ("False", conditions::SERVICE_ACCOUNT_TOKEN_ERROR)
    );
    assert_eq!(h.repo.count_calls("ensure_object"), 0);
}

#[tokio::test]
async fn runnable_reads_outputs_from_its_latest_successful_run() {
    let h = Harness::new();
    h.service_account("default");
    h.template(
        "ClusterRunTemplate",
        "tests",
        json!({
            "template": {"apiVersion": "tekton.dev/v1beta1", "kind": "TaskRun", "spec": {"params": [{"name": "url", "value": "$(runnable.spec.inputs.url)$"}]}},
            "outputs": {"revision": ".status.results[0].value"}
        }),
    );
    h.owner("Runnable", "r", json!({}), json!({"runTemplateRef": {"name": "tests"}, "inputs": {"url": "https://git/x"}}));

    h.reconcile(ControllerKind::Runnable, "dev", "r").await.unwrap();
    let runs = h.repo.objects_of_kind("TaskRun");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["spec"]["params"][0]["value"], "https://git/x");
    let run = StampedRef::from_object(&runs[0]).unwrap();
    assert!(h.watcher.watched().contains(&("tekton.dev/v1beta1".to_string(), "TaskRun".to_string())));

    h.repo.set_status(&run, json!({"conditions": [{"type": "Succeeded", "status": "True"}], "results": [{"value": "abc"}]}));
    h.reconcile(ControllerKind::Runnable, "dev", "r").await.unwrap();

    let r = h.repo.get_runnable(&NamespacedName::new("dev", "r")).await.unwrap().unwrap();
    assert_eq!(r.outputs().get("revision"), Some(&json!("abc")));
    assert_eq!(status_of(r.conditions(), conditions::RUN_TEMPLATE_READY), ("True", conditions::READY_REASON));

    let tracked = h.ctx().tracker.lookup(&DependencyKey::template("ClusterRunTemplate", "tests"));
    assert_eq!(tracked, [Request::new(ControllerKind::Runnable, NamespacedName::new("dev", "r"))]);
}
