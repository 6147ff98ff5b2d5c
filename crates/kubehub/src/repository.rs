//! `Repository` over the Kubernetes API: typed access to Cartographer kinds,
//! dynamic access to stamped objects, server-side apply for updates.

use std::sync::Arc;

use carto_api::{RepoError, RepoResult, Repository, RepositoryBuilder};
use carto_core::blueprint::{ClusterDelivery, ClusterSupplyChain};
use carto_core::labels::Labels;
use carto_core::owner::{Deliverable, Runnable, Workload};
use carto_core::refs::{gvk_from_api_version, NamespacedName};
use carto_core::status::StampedRef;
use carto_core::template::{ClusterRunTemplate, Template, TemplateKind};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::AuthInfo,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client, Config,
};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::cache::StampCache;
use crate::discovery::{ApiResolver, Resolved};
use crate::errors::{absent_ok, repo_error};

fn strip_managed_fields(mut v: Value) -> Value {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
    v
}

fn to_value(obj: &DynamicObject) -> RepoResult<Value> {
    serde_json::to_value(obj)
        .map(strip_managed_fields)
        .map_err(|e| RepoError::Internal(format!("encoding object: {e}")))
}

fn str_at<'a>(obj: &'a Value, pointer: &str) -> &'a str {
    obj.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

/// `k=v,k2=v2` label selector.
pub fn label_selector(labels: &Labels) -> String {
    labels.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",")
}

/// Kubernetes-backed repository acting with one client's identity.
#[derive(Clone)]
pub struct KubeRepository {
    client: Client,
    resolver: Arc<ApiResolver>,
    field_manager: String,
    cache: Arc<StampCache>,
}

impl KubeRepository {
    pub fn new(client: Client, resolver: Arc<ApiResolver>, field_manager: &str, cache: Arc<StampCache>) -> Self {
        Self { client, resolver, field_manager: field_manager.to_string(), cache }
    }

    async fn get_typed<K>(&self, api: Api<K>, name: &str) -> RepoResult<Option<K>>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        absent_ok(api.get(name).await)
    }

    async fn list_typed<K>(&self, api: Api<K>) -> RepoResult<Vec<K>>
    where
        K: Clone + DeserializeOwned + std::fmt::Debug,
    {
        api.list(&ListParams::default()).await.map(|l| l.items).map_err(repo_error)
    }

    fn dynamic_api(&self, resolved: &Resolved, namespace: &str) -> RepoResult<Api<DynamicObject>> {
        if !resolved.namespaced {
            return Ok(Api::all_with(self.client.clone(), &resolved.resource));
        }
        if namespace.is_empty() {
            return Err(RepoError::Invalid(format!("namespace required for namespaced kind {}", resolved.resource.kind)));
        }
        Ok(Api::namespaced_with(self.client.clone(), namespace, &resolved.resource))
    }

    async fn api_for(&self, api_version: &str, kind: &str, namespace: &str) -> RepoResult<Api<DynamicObject>> {
        let resolved = self.resolver.resolve(&gvk_from_api_version(api_version, kind)).await?;
        self.dynamic_api(&resolved, namespace)
    }

    async fn patch_apply(&self, api: &Api<DynamicObject>, name: &str, obj: &DynamicObject, submitted: &Value) -> RepoResult<Value> {
        if let Some(live) = absent_ok(api.get(name).await)? {
            if let Some(hit) = self.cache.unchanged(submitted, &to_value(&live)?) {
                debug!(name, "stamp unchanged since last apply");
                return Ok(hit);
            }
        }
        let pp = PatchParams::apply(&self.field_manager).force();
        let applied = api.patch(name, &pp, &Patch::Apply(obj)).await.map_err(repo_error)?;
        let persisted = to_value(&applied)?;
        self.cache.set(submitted, &persisted);
        Ok(persisted)
    }
}

#[async_trait::async_trait]
impl Repository for KubeRepository {
    async fn get_workload(&self, key: &NamespacedName) -> RepoResult<Option<Workload>> {
        self.get_typed(Api::namespaced(self.client.clone(), &key.namespace), &key.name).await
    }

    async fn get_deliverable(&self, key: &NamespacedName) -> RepoResult<Option<Deliverable>> {
        self.get_typed(Api::namespaced(self.client.clone(), &key.namespace), &key.name).await
    }

    async fn get_runnable(&self, key: &NamespacedName) -> RepoResult<Option<Runnable>> {
        self.get_typed(Api::namespaced(self.client.clone(), &key.namespace), &key.name).await
    }

    async fn list_workloads(&self) -> RepoResult<Vec<Workload>> {
        self.list_typed(Api::all(self.client.clone())).await
    }

    async fn list_deliverables(&self) -> RepoResult<Vec<Deliverable>> {
        self.list_typed(Api::all(self.client.clone())).await
    }

    async fn list_runnables(&self) -> RepoResult<Vec<Runnable>> {
        self.list_typed(Api::all(self.client.clone())).await
    }

    async fn get_supply_chain(&self, name: &str) -> RepoResult<Option<ClusterSupplyChain>> {
        self.get_typed(Api::all(self.client.clone()), name).await
    }

    async fn get_delivery(&self, name: &str) -> RepoResult<Option<ClusterDelivery>> {
        self.get_typed(Api::all(self.client.clone()), name).await
    }

    async fn list_supply_chains(&self) -> RepoResult<Vec<ClusterSupplyChain>> {
        self.list_typed(Api::all(self.client.clone())).await
    }

    async fn list_deliveries(&self) -> RepoResult<Vec<ClusterDelivery>> {
        self.list_typed(Api::all(self.client.clone())).await
    }

    async fn get_template(&self, kind: TemplateKind, name: &str) -> RepoResult<Option<Template>> {
        let gvk = GroupVersionKind::gvk(carto_core::GROUP, carto_core::VERSION, kind.kind());
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ApiResource::from_gvk(&gvk));
        let Some(obj) = absent_ok(api.get(name).await)? else { return Ok(None) };
        let mut raw = to_value(&obj)?;
        // list/get responses may omit type meta on dynamic objects
        raw["apiVersion"] = json!(carto_core::API_VERSION);
        raw["kind"] = json!(kind.kind());
        Template::from_object(&raw).map(Some).map_err(|e| RepoError::Invalid(e.to_string()))
    }

    async fn get_run_template(&self, name: &str) -> RepoResult<Option<ClusterRunTemplate>> {
        self.get_typed(Api::all(self.client.clone()), name).await
    }

    async fn get_service_account(&self, key: &NamespacedName) -> RepoResult<Option<ServiceAccount>> {
        self.get_typed(Api::namespaced(self.client.clone(), &key.namespace), &key.name).await
    }

    async fn list_role_bindings(&self) -> RepoResult<Vec<RoleBinding>> {
        self.list_typed(Api::all(self.client.clone())).await
    }

    async fn list_cluster_role_bindings(&self) -> RepoResult<Vec<ClusterRoleBinding>> {
        self.list_typed(Api::all(self.client.clone())).await
    }

    async fn get_object(&self, reference: &StampedRef) -> RepoResult<Option<Value>> {
        let api = self.api_for(&reference.api_version, &reference.kind, reference.namespace()).await?;
        absent_ok(api.get(&reference.name).await)?.map(|o| to_value(&o)).transpose()
    }

    async fn list_objects(&self, api_version: &str, kind: &str, namespace: &str, labels: &Labels) -> RepoResult<Vec<Value>> {
        let resolved = self.resolver.resolve(&gvk_from_api_version(api_version, kind)).await?;
        let api = if resolved.namespaced && namespace.is_empty() {
            Api::all_with(self.client.clone(), &resolved.resource)
        } else {
            self.dynamic_api(&resolved, namespace)?
        };
        let lp = ListParams::default().labels(&label_selector(labels));
        let list = api.list(&lp).await.map_err(repo_error)?;
        list.items
            .iter()
            .map(|o| {
                let mut v = to_value(o)?;
                v["apiVersion"] = json!(api_version);
                v["kind"] = json!(kind);
                Ok(v)
            })
            .collect()
    }

    async fn ensure_object(&self, obj: &Value, allow_update: bool) -> RepoResult<Value> {
        let (api_version, kind) = (str_at(obj, "/apiVersion"), str_at(obj, "/kind"));
        let (namespace, name) = (str_at(obj, "/metadata/namespace"), str_at(obj, "/metadata/name"));
        let api = self.api_for(api_version, kind, namespace).await?;
        let dynamic: DynamicObject =
            serde_json::from_value(obj.clone()).map_err(|e| RepoError::Invalid(format!("decoding {kind}: {e}")))?;

        if name.is_empty() || !allow_update {
            let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
            let created = api.create(&pp, &dynamic).await.map_err(repo_error)?;
            debug!(kind, name = created.metadata.name.as_deref().unwrap_or_default(), "created");
            return to_value(&created);
        }
        self.patch_apply(&api, name, &dynamic, obj).await
    }

    async fn delete(&self, reference: &StampedRef) -> RepoResult<()> {
        let api = self.api_for(&reference.api_version, &reference.kind, reference.namespace()).await?;
        api.delete(&reference.name, &DeleteParams::background()).await.map_err(repo_error)?;
        self.cache.forget(&reference.api_version, &reference.kind, reference.namespace(), &reference.name);
        Ok(())
    }

    async fn update_status(&self, reference: &StampedRef, status: &Value) -> RepoResult<()> {
        let api = self.api_for(&reference.api_version, &reference.kind, reference.namespace()).await?;
        let patch = json!({"status": status});
        api.patch_status(&reference.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(repo_error)?;
        Ok(())
    }
}

/// Builds repositories that authenticate with a service account token.
pub struct KubeRepositoryBuilder {
    base: Config,
    resolver: Arc<ApiResolver>,
    field_manager: String,
    cache: Arc<StampCache>,
}

impl KubeRepositoryBuilder {
    pub fn new(base: Config, resolver: Arc<ApiResolver>, field_manager: &str, cache: Arc<StampCache>) -> Self {
        Self { base, resolver, field_manager: field_manager.to_string(), cache }
    }
}

/// The controller's config with its credentials replaced by `token`.
pub fn config_for_token(base: &Config, token: &SecretString) -> Config {
    let mut config = base.clone();
    config.auth_info = AuthInfo { token: Some(token.clone()), ..Default::default() };
    config
}

impl RepositoryBuilder for KubeRepositoryBuilder {
    fn build(&self, token: &SecretString) -> RepoResult<Arc<dyn Repository>> {
        let client = Client::try_from(config_for_token(&self.base, token))
            .map_err(|e| RepoError::Internal(format!("building client: {e}")))?;
        Ok(Arc::new(KubeRepository::new(client, self.resolver.clone(), &self.field_manager, self.cache.clone())))
    }
}
