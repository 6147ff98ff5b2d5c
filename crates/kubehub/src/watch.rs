//! List+watch streams that turn cluster changes into queued reconciles.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use carto_api::StampedWatcher;
use carto_controller::Controller;
use carto_core::refs::gvk_from_api_version;
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{watcher, WatchStreamExt},
};
use serde_json::Value;
use tokio::sync::{mpsc, watch as signal};
use tracing::{debug, info, warn};

use crate::discovery::ApiResolver;

/// Kinds whose changes can re-enqueue an owner or blueprint.
pub const ENGINE_KINDS: &[(&str, &str)] = &[
    ("carto.run/v1alpha1", "Workload"),
    ("carto.run/v1alpha1", "Deliverable"),
    ("carto.run/v1alpha1", "Runnable"),
    ("carto.run/v1alpha1", "ClusterSupplyChain"),
    ("carto.run/v1alpha1", "ClusterDelivery"),
    ("carto.run/v1alpha1", "ClusterSourceTemplate"),
    ("carto.run/v1alpha1", "ClusterImageTemplate"),
    ("carto.run/v1alpha1", "ClusterConfigTemplate"),
    ("carto.run/v1alpha1", "ClusterDeploymentTemplate"),
    ("carto.run/v1alpha1", "ClusterTemplate"),
    ("carto.run/v1alpha1", "ClusterRunTemplate"),
    ("v1", "ServiceAccount"),
    ("rbac.authorization.k8s.io/v1", "Role"),
    ("rbac.authorization.k8s.io/v1", "RoleBinding"),
    ("rbac.authorization.k8s.io/v1", "ClusterRole"),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding"),
];

type Watched = Arc<Mutex<BTreeSet<(String, String)>>>;

/// Starts one watch per kind and forwards every observed object.
pub struct WatchHub {
    resolver: Arc<ApiResolver>,
    client: kube::Client,
    tx: mpsc::Sender<Value>,
    shutdown: signal::Receiver<bool>,
    watched: Watched,
}

impl WatchHub {
    /// Returns the hub and the receiving end of the object channel.
    pub fn new(
        client: kube::Client,
        resolver: Arc<ApiResolver>,
        shutdown: signal::Receiver<bool>,
        buffer: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let hub = Arc::new(Self { resolver, client, tx, shutdown, watched: Watched::default() });
        (hub, rx)
    }

    pub fn watch_engine_kinds(&self) {
        for (api_version, kind) in ENGINE_KINDS {
            self.watch(api_version, kind);
        }
    }

    pub fn watched(&self) -> BTreeSet<(String, String)> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl StampedWatcher for WatchHub {
    fn watch(&self, api_version: &str, kind: &str) {
        let key = (api_version.to_string(), kind.to_string());
        if !self.watched.lock().unwrap_or_else(PoisonError::into_inner).insert(key.clone()) {
            return;
        }
        let resolver = self.resolver.clone();
        let client = self.client.clone();
        let tx = self.tx.clone();
        let mut shutdown = self.shutdown.clone();
        let watched = self.watched.clone();
        tokio::spawn(async move {
            let (api_version, kind) = (key.0.clone(), key.1.clone());
            let resolved = match resolver.resolve(&gvk_from_api_version(&api_version, &kind)).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(api_version = %api_version, kind = %kind, error = %e, "cannot watch kind");
                    // the next stamp of this kind retries
                    watched.lock().unwrap_or_else(PoisonError::into_inner).remove(&key);
                    return;
                }
            };
            let api: Api<DynamicObject> = Api::all_with(client, &resolved.resource);
            let stream = watcher(api, watcher::Config::default()).default_backoff().touched_objects();
            futures::pin_mut!(stream);
            info!(api_version = %api_version, kind = %kind, "watch started");
            loop {
                tokio::select! {
                    next = stream.next() => match next {
                        Some(Ok(obj)) => {
                            let Ok(mut v) = serde_json::to_value(&obj) else { continue };
                            v["apiVersion"] = Value::String(api_version.clone());
                            v["kind"] = Value::String(kind.clone());
                            if tx.send(v).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => debug!(kind = %kind, error = %e, "watch error, retrying"),
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(api_version = %api_version, kind = %kind, "watch stopped");
        });
    }
}

/// Feed watched objects to the controller until the channel closes.
pub async fn pump(controller: Arc<Controller>, mut rx: mpsc::Receiver<Value>) {
    while let Some(obj) = rx.recv().await {
        let n = controller.enqueue_for(&obj).await;
        if n > 0 {
            debug!(requests = n, kind = obj.get("kind").and_then(serde_json::Value::as_str).unwrap_or_default(), "queued from watch");
        }
    }
}
