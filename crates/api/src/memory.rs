//! In-memory implementations of the API seams, used by tests and dry runs.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use carto_core::blueprint::{ClusterDelivery, ClusterSupplyChain};
use carto_core::labels::{contains_all, labels_of, Labels};
use carto_core::owner::{Deliverable, Runnable, Workload};
use carto_core::refs::{split_api_version, NamespacedName};
use carto_core::status::StampedRef;
use carto_core::template::{ClusterRunTemplate, Template, TemplateKind};
use chrono::{SecondsFormat, TimeZone, Utc};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::debug;

use crate::{Event, EventSink, RepoError, RepoResult, Repository, RepositoryBuilder, StampedWatcher, TokenError, TokenManager};

type ObjKey = (String, String, String, String);

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";
const CREATED_BASE_SECS: i64 = 1_700_000_000;

#[derive(Default)]
struct State {
    objects: BTreeMap<ObjKey, Value>,
    calls: Vec<String>,
    failures: HashMap<String, RepoError>,
    counter: u64,
}

fn key_of(api_version: &str, kind: &str, namespace: &str, name: &str) -> ObjKey {
    let (group, _) = split_api_version(api_version);
    (group, kind.to_string(), namespace.to_string(), name.to_string())
}

fn str_at<'a>(obj: &'a Value, pointer: &str) -> &'a str {
    obj.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn key_of_object(obj: &Value) -> ObjKey {
    key_of(
        str_at(obj, "/apiVersion"),
        str_at(obj, "/kind"),
        str_at(obj, "/metadata/namespace"),
        str_at(obj, "/metadata/name"),
    )
}

fn decode<T: DeserializeOwned>(v: Value) -> RepoResult<T> {
    serde_json::from_value(v).map_err(|e| RepoError::Invalid(e.to_string()))
}

/// Everything but `metadata` and `status`.
fn desired_part(obj: &Value) -> Value {
    let mut v = obj.clone();
    if let Some(m) = v.as_object_mut() {
        m.remove("metadata");
        m.remove("status");
    }
    v
}

/// Object store keyed by group, kind, namespace and name.
///
/// Records every call, can be told to fail an operation, and fills in
/// `uid`, `generation`, `creationTimestamp` and generated names like an API
/// server would.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, op: &str, detail: String) -> RepoResult<()> {
        let mut st = self.lock();
        st.calls.push(format!("{op} {detail}"));
        match st.failures.get(op) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    /// Store an object as-is apart from server-populated metadata.
    pub fn insert(&self, mut obj: Value) -> Value {
        let mut st = self.lock();
        st.counter += 1;
        let n = st.counter;
        if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.entry("uid").or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
            meta.entry("generation").or_insert(json!(1));
            meta.entry("creationTimestamp").or_insert_with(|| json!(created_at(n)));
        }
        st.objects.insert(key_of_object(&obj), obj.clone());
        obj
    }

    pub fn object(&self, reference: &StampedRef) -> Option<Value> {
        let k = key_of(&reference.api_version, &reference.kind, reference.namespace(), &reference.name);
        self.lock().objects.get(&k).cloned()
    }

    pub fn objects_of_kind(&self, kind: &str) -> Vec<Value> {
        self.lock().objects.iter().filter(|((_, k, _, _), _)| k == kind).map(|(_, v)| v.clone()).collect()
    }

    /// Overwrite `status` directly, as a downstream controller would.
    pub fn set_status(&self, reference: &StampedRef, status: Value) -> bool {
        let k = key_of(&reference.api_version, &reference.kind, reference.namespace(), &reference.name);
        match self.lock().objects.get_mut(&k) {
            Some(obj) => {
                obj["status"] = status;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, reference: &StampedRef) -> Option<Value> {
        let k = key_of(&reference.api_version, &reference.kind, reference.namespace(), &reference.name);
        self.lock().objects.remove(&k)
    }

    /// Make every later call to `op` fail with `err`.
    pub fn fail(&self, op: &str, err: RepoError) {
        self.lock().failures.insert(op.to_string(), err);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, prefix: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn get_typed<T: DeserializeOwned>(&self, k: ObjKey) -> RepoResult<Option<T>> {
        let found = self.lock().objects.get(&k).cloned();
        found.map(decode).transpose()
    }

    fn list_typed<T: DeserializeOwned>(&self, group: &str, kind: &str) -> RepoResult<Vec<T>> {
        let found: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|((g, k, _, _), _)| g == group && k == kind)
            .map(|(_, v)| v.clone())
            .collect();
        found.into_iter().map(decode).collect()
    }
}

fn created_at(n: u64) -> String {
    let secs = CREATED_BASE_SECS + i64::try_from(n).unwrap_or_default();
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait::async_trait]
impl Repository for MemoryRepository {
    async fn get_workload(&self, key: &NamespacedName) -> RepoResult<Option<Workload>> {
        self.check("get_workload", key.to_string())?;
        self.get_typed(key_of(carto_core::API_VERSION, "Workload", &key.namespace, &key.name))
    }

    async fn get_deliverable(&self, key: &NamespacedName) -> RepoResult<Option<Deliverable>> {
        self.check("get_deliverable", key.to_string())?;
        self.get_typed(key_of(carto_core::API_VERSION, "Deliverable", &key.namespace, &key.name))
    }

    async fn get_runnable(&self, key: &NamespacedName) -> RepoResult<Option<Runnable>> {
        self.check("get_runnable", key.to_string())?;
        self.get_typed(key_of(carto_core::API_VERSION, "Runnable", &key.namespace, &key.name))
    }

    async fn list_workloads(&self) -> RepoResult<Vec<Workload>> {
        self.check("list_workloads", String::new())?;
        self.list_typed(carto_core::GROUP, "Workload")
    }

    async fn list_deliverables(&self) -> RepoResult<Vec<Deliverable>> {
        self.check("list_deliverables", String::new())?;
        self.list_typed(carto_core::GROUP, "Deliverable")
    }

    async fn list_runnables(&self) -> RepoResult<Vec<Runnable>> {
        self.check("list_runnables", String::new())?;
        self.list_typed(carto_core::GROUP, "Runnable")
    }

    async fn get_supply_chain(&self, name: &str) -> RepoResult<Option<ClusterSupplyChain>> {
        self.check("get_supply_chain", name.to_string())?;
        self.get_typed(key_of(carto_core::API_VERSION, "ClusterSupplyChain", "", name))
    }

    async fn get_delivery(&self, name: &str) -> RepoResult<Option<ClusterDelivery>> {
        self.check("get_delivery", name.to_string())?;
        self.get_typed(key_of(carto_core::API_VERSION, "ClusterDelivery", "", name))
    }

    async fn list_supply_chains(&self) -> RepoResult<Vec<ClusterSupplyChain>> {
        self.check("list_supply_chains", String::new())?;
        self.list_typed(carto_core::GROUP, "ClusterSupplyChain")
    }

    async fn list_deliveries(&self) -> RepoResult<Vec<ClusterDelivery>> {
        self.check("list_deliveries", String::new())?;
        self.list_typed(carto_core::GROUP, "ClusterDelivery")
    }

    async fn get_template(&self, kind: TemplateKind, name: &str) -> RepoResult<Option<Template>> {
        self.check("get_template", format!("{}/{name}", kind.kind()))?;
        let found = self.lock().objects.get(&key_of(carto_core::API_VERSION, kind.kind(), "", name)).cloned();
        found
            .map(|v| Template::from_object(&v).map_err(|e| RepoError::Invalid(e.to_string())))
            .transpose()
    }

    async fn get_run_template(&self, name: &str) -> RepoResult<Option<ClusterRunTemplate>> {
        self.check("get_run_template", name.to_string())?;
        self.get_typed(key_of(carto_core::API_VERSION, "ClusterRunTemplate", "", name))
    }

    async fn get_service_account(&self, key: &NamespacedName) -> RepoResult<Option<ServiceAccount>> {
        self.check("get_service_account", key.to_string())?;
        self.get_typed(key_of("v1", "ServiceAccount", &key.namespace, &key.name))
    }

    async fn list_role_bindings(&self) -> RepoResult<Vec<RoleBinding>> {
        self.check("list_role_bindings", String::new())?;
        self.list_typed(RBAC_GROUP, "RoleBinding")
    }

    async fn list_cluster_role_bindings(&self) -> RepoResult<Vec<ClusterRoleBinding>> {
        self.check("list_cluster_role_bindings", String::new())?;
        self.list_typed(RBAC_GROUP, "ClusterRoleBinding")
    }

    async fn get_object(&self, reference: &StampedRef) -> RepoResult<Option<Value>> {
        self.check("get_object", reference.to_string())?;
        Ok(self.object(reference))
    }

    async fn list_objects(&self, api_version: &str, kind: &str, namespace: &str, labels: &Labels) -> RepoResult<Vec<Value>> {
        self.check("list_objects", format!("{api_version}/{kind} {namespace}"))?;
        let (group, _) = split_api_version(api_version);
        let st = self.lock();
        Ok(st
            .objects
            .iter()
            .filter(|((g, k, ns, _), _)| *g == group && k == kind && ns == namespace)
            .filter(|(_, v)| contains_all(&labels_of(v), labels))
            .map(|(_, v)| v.clone())
            .collect())
    }

    async fn ensure_object(&self, obj: &Value, allow_update: bool) -> RepoResult<Value> {
        let name = str_at(obj, "/metadata/name");
        let generate = str_at(obj, "/metadata/generateName");
        self.check("ensure_object", format!("{} {}/{}", str_at(obj, "/kind"), str_at(obj, "/metadata/namespace"), if name.is_empty() { generate } else { name }))?;

        let mut obj = obj.clone();
        let mut st = self.lock();
        st.counter += 1;
        let n = st.counter;
        if name.is_empty() {
            if generate.is_empty() {
                return Err(RepoError::Invalid("metadata.name or metadata.generateName is required".into()));
            }
            let generated = format!("{generate}{n:05}");
            if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.insert("name".into(), json!(generated));
            }
        }
        let k = key_of_object(&obj);

        match st.objects.get(&k).cloned() {
            Some(_) if !allow_update => Err(RepoError::Conflict(format!("{} {} already exists", k.1, k.3))),
            Some(existing) => {
                let changed = desired_part(&existing) != desired_part(&obj);
                let generation = existing.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(1);
                if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
                    for f in ["uid", "creationTimestamp"] {
                        if let Some(v) = existing.pointer(&format!("/metadata/{f}")) {
                            meta.insert(f.into(), v.clone());
                        }
                    }
                    meta.insert("generation".into(), json!(if changed { generation + 1 } else { generation }));
                }
                if let Some(status) = existing.get("status") {
                    obj["status"] = status.clone();
                }
                debug!(kind = %k.1, name = %k.3, changed, "memory repo: updated");
                st.objects.insert(k, obj.clone());
                Ok(obj)
            }
            None => {
                if let Some(meta) = obj.get_mut("metadata").and_then(Value::as_object_mut) {
                    meta.insert("uid".into(), json!(uuid::Uuid::new_v4().to_string()));
                    meta.insert("generation".into(), json!(1));
                    meta.insert("creationTimestamp".into(), json!(created_at(n)));
                }
                debug!(kind = %k.1, name = %k.3, "memory repo: created");
                st.objects.insert(k, obj.clone());
                Ok(obj)
            }
        }
    }

    async fn delete(&self, reference: &StampedRef) -> RepoResult<()> {
        self.check("delete", reference.to_string())?;
        match self.remove(reference) {
            Some(_) => Ok(()),
            None => Err(RepoError::NotFound(reference.to_string())),
        }
    }

    async fn update_status(&self, reference: &StampedRef, status: &Value) -> RepoResult<()> {
        self.check("update_status", reference.to_string())?;
        if self.set_status(reference, status.clone()) {
            Ok(())
        } else {
            Err(RepoError::NotFound(reference.to_string()))
        }
    }
}

/// Hands out the same repository for every token and remembers the tokens seen.
pub struct StaticRepositoryBuilder {
    repo: Arc<MemoryRepository>,
    tokens: Mutex<Vec<String>>,
}

impl StaticRepositoryBuilder {
    pub fn new(repo: Arc<MemoryRepository>) -> Self {
        Self { repo, tokens: Mutex::new(Vec::new()) }
    }

    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl RepositoryBuilder for StaticRepositoryBuilder {
    fn build(&self, token: &SecretString) -> RepoResult<Arc<dyn Repository>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner).push(token.expose_secret().clone());
        Ok(self.repo.clone())
    }
}

/// Returns `token-{namespace}-{name}` for every service account.
#[derive(Default)]
pub struct StaticTokenManager {
    requested: Mutex<Vec<String>>,
    fail: Mutex<Option<String>>,
}

impl StaticTokenManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&self, msg: &str) {
        *self.fail.lock().unwrap_or_else(PoisonError::into_inner) = Some(msg.to_string());
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl TokenManager for StaticTokenManager {
    async fn get_service_account_token(&self, sa: &ServiceAccount) -> Result<SecretString, TokenError> {
        let ns = sa.metadata.namespace.clone().unwrap_or_default();
        let name = sa.metadata.name.clone().unwrap_or_default();
        self.requested.lock().unwrap_or_else(PoisonError::into_inner).push(format!("{ns}/{name}"));
        if let Some(msg) = self.fail.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return Err(TokenError::Request { sa: format!("{ns}/{name}"), msg });
        }
        Ok(SecretString::new(format!("token-{ns}-{name}")))
    }
}

#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait::async_trait]
impl EventSink for MemoryEventSink {
    async fn record(&self, event: Event) {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).push(event);
    }
}

#[derive(Default)]
pub struct RecordingWatcher {
    watched: Mutex<BTreeSet<(String, String)>>,
}

impl RecordingWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched(&self) -> BTreeSet<(String, String)> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl StampedWatcher for RecordingWatcher {
    fn watch(&self, api_version: &str, kind: &str) {
        self.watched
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((api_version.to_string(), kind.to_string()));
    }
}
