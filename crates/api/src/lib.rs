//! Cartographer API seams.
//!
//! The engine talks to the cluster only through the traits defined here:
//! a `Repository` for objects, a `TokenManager` for service-account tokens,
//! an `EventSink` for events and a `StampedWatcher` that keeps watches open
//! on stamped kinds. Kube-backed implementations live in `carto-kubehub`;
//! the in-memory ones in [`memory`] back tests and dry runs.

#![forbid(unsafe_code)]

use std::sync::Arc;

use carto_core::blueprint::{ClusterDelivery, ClusterSupplyChain};
use carto_core::labels::Labels;
use carto_core::owner::{Deliverable, Runnable, Workload};
use carto_core::refs::NamespacedName;
use carto_core::status::StampedRef;
use carto_core::template::{ClusterRunTemplate, Template, TemplateKind};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod memory;

pub use memory::{MemoryEventSink, MemoryRepository, RecordingWatcher, StaticRepositoryBuilder, StaticTokenManager};

/// Repository errors, classified the way the engine reacts to them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RepoError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RepoError::NotFound(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, RepoError::Forbidden(_))
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Cluster access used by reconcilers. Getters return `Ok(None)` for absent objects.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn get_workload(&self, key: &NamespacedName) -> RepoResult<Option<Workload>>;
    async fn get_deliverable(&self, key: &NamespacedName) -> RepoResult<Option<Deliverable>>;
    async fn get_runnable(&self, key: &NamespacedName) -> RepoResult<Option<Runnable>>;

    async fn list_workloads(&self) -> RepoResult<Vec<Workload>>;
    async fn list_deliverables(&self) -> RepoResult<Vec<Deliverable>>;
    async fn list_runnables(&self) -> RepoResult<Vec<Runnable>>;

    async fn get_supply_chain(&self, name: &str) -> RepoResult<Option<ClusterSupplyChain>>;
    async fn get_delivery(&self, name: &str) -> RepoResult<Option<ClusterDelivery>>;
    async fn list_supply_chains(&self) -> RepoResult<Vec<ClusterSupplyChain>>;
    async fn list_deliveries(&self) -> RepoResult<Vec<ClusterDelivery>>;

    async fn get_template(&self, kind: TemplateKind, name: &str) -> RepoResult<Option<Template>>;
    async fn get_run_template(&self, name: &str) -> RepoResult<Option<ClusterRunTemplate>>;

    async fn get_service_account(&self, key: &NamespacedName) -> RepoResult<Option<ServiceAccount>>;
    async fn list_role_bindings(&self) -> RepoResult<Vec<RoleBinding>>;
    async fn list_cluster_role_bindings(&self) -> RepoResult<Vec<ClusterRoleBinding>>;

    async fn get_object(&self, reference: &StampedRef) -> RepoResult<Option<Value>>;

    /// Objects of one kind in one namespace carrying every label in `labels`.
    async fn list_objects(&self, api_version: &str, kind: &str, namespace: &str, labels: &Labels) -> RepoResult<Vec<Value>>;

    /// Create or, when `allow_update`, update the object; returns the persisted object.
    ///
    /// Objects carrying only `metadata.generateName` are always created.
    async fn ensure_object(&self, obj: &Value, allow_update: bool) -> RepoResult<Value>;

    async fn delete(&self, reference: &StampedRef) -> RepoResult<()>;

    /// Replace the `status` of the object; spec and metadata are left as they are.
    async fn update_status(&self, reference: &StampedRef, status: &Value) -> RepoResult<()>;
}

/// Builds a repository acting with a service account's token.
pub trait RepositoryBuilder: Send + Sync {
    fn build(&self, token: &SecretString) -> RepoResult<Arc<dyn Repository>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("service account has no uid: {0}")]
    MissingUid(String),
    #[error("token request for {sa}: {msg}")]
    Request { sa: String, msg: String },
}

/// Mints bearer tokens for service accounts.
#[async_trait::async_trait]
pub trait TokenManager: Send + Sync {
    async fn get_service_account_token(&self, sa: &ServiceAccount) -> Result<SecretString, TokenError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub regarding: StampedRef,
    pub type_: EventType,
    pub reason: String,
    pub message: String,
}

impl Event {
    pub fn normal(regarding: StampedRef, reason: &str, message: impl Into<String>) -> Self {
        Self { regarding, type_: EventType::Normal, reason: reason.to_string(), message: message.into() }
    }
}

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: Event);
}

/// Keeps a watch open on every kind the engine has stamped.
pub trait StampedWatcher: Send + Sync {
    fn watch(&self, api_version: &str, kind: &str);
}
