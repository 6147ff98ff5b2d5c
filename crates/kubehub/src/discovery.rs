//! GVK resolution backed by kube Discovery, cached per process.

use std::sync::{PoisonError, RwLock};

use carto_api::{RepoError, RepoResult};
use kube::{
    core::{ApiResource, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use rustc_hash::FxHashMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct Resolved {
    pub resource: ApiResource,
    pub namespaced: bool,
}

/// Resolves kinds to API resources; unknown kinds trigger one discovery run.
pub struct ApiResolver {
    client: Client,
    cache: RwLock<FxHashMap<GroupVersionKind, Resolved>>,
}

impl ApiResolver {
    pub fn new(client: Client) -> Self {
        let resolver = Self { client, cache: RwLock::new(FxHashMap::default()) };
        resolver.seed_carto_kinds();
        resolver
    }

    /// Cartographer's own kinds are known without asking the server.
    fn seed_carto_kinds(&self) {
        let namespaced = ["Workload", "Deliverable", "Runnable"];
        let cluster = [
            "ClusterSupplyChain",
            "ClusterDelivery",
            "ClusterSourceTemplate",
            "ClusterImageTemplate",
            "ClusterConfigTemplate",
            "ClusterDeploymentTemplate",
            "ClusterTemplate",
            "ClusterRunTemplate",
        ];
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        for (kinds, ns) in [(&namespaced[..], true), (&cluster[..], false)] {
            for kind in kinds {
                let gvk = GroupVersionKind::gvk(carto_core::GROUP, carto_core::VERSION, kind);
                cache.insert(gvk.clone(), Resolved { resource: ApiResource::from_gvk(&gvk), namespaced: ns });
            }
        }
    }

    pub fn cached(&self, gvk: &GroupVersionKind) -> Option<Resolved> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).get(gvk).cloned()
    }

    pub async fn resolve(&self, gvk: &GroupVersionKind) -> RepoResult<Resolved> {
        if let Some(hit) = self.cached(gvk) {
            return Ok(hit);
        }
        debug!(group = %gvk.group, version = %gvk.version, kind = %gvk.kind, "discovery miss");
        self.refresh().await?;
        self.cached(gvk).ok_or_else(|| {
            RepoError::NotFound(format!("no resource served for {}/{} {}", gvk.group, gvk.version, gvk.kind))
        })
    }

    /// Re-run discovery and replace every non-seeded entry.
    pub async fn refresh(&self) -> RepoResult<()> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| RepoError::Internal(format!("discovery failed: {e}")))?;
        let mut found = 0usize;
        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
                    cache.insert(gvk, Resolved { resource: ar, namespaced: matches!(caps.scope, Scope::Namespaced) });
                    found += 1;
                }
            }
        }
        info!(resources = found, "discovery refreshed");
        Ok(())
    }
}
