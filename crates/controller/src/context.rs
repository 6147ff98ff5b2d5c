//! Shared handles every reconciler works with, and the queue key type.

use std::fmt;
use std::sync::Arc;

use carto_api::{EventSink, Repository, RepositoryBuilder, StampedWatcher, TokenManager};
use carto_core::owner::OwnerKind;
use carto_core::refs::NamespacedName;
use carto_core::status::StampedRef;
use carto_tracker::DependencyTracker;

use crate::config::ControllerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ControllerKind {
    Workload,
    Deliverable,
    Runnable,
    SupplyChain,
    Delivery,
}

impl ControllerKind {
    pub const ALL: [ControllerKind; 5] = [
        ControllerKind::Workload,
        ControllerKind::Deliverable,
        ControllerKind::Runnable,
        ControllerKind::SupplyChain,
        ControllerKind::Delivery,
    ];

    /// Metric label and log field value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerKind::Workload => "workload",
            ControllerKind::Deliverable => "deliverable",
            ControllerKind::Runnable => "runnable",
            ControllerKind::SupplyChain => "supply-chain",
            ControllerKind::Delivery => "delivery",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ControllerKind::Workload => "Workload",
            ControllerKind::Deliverable => "Deliverable",
            ControllerKind::Runnable => "Runnable",
            ControllerKind::SupplyChain => "ClusterSupplyChain",
            ControllerKind::Delivery => "ClusterDelivery",
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.kind() == kind)
    }
}

impl From<OwnerKind> for ControllerKind {
    fn from(k: OwnerKind) -> Self {
        match k {
            OwnerKind::Workload => ControllerKind::Workload,
            OwnerKind::Deliverable => ControllerKind::Deliverable,
            OwnerKind::Runnable => ControllerKind::Runnable,
        }
    }
}

/// One unit of work: reconcile this object with this controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Request {
    pub controller: ControllerKind,
    pub key: NamespacedName,
}

impl Request {
    pub fn new(controller: ControllerKind, key: NamespacedName) -> Self {
        Self { controller, key }
    }

    /// Reference used for status writes and events.
    pub fn object_ref(&self) -> StampedRef {
        let namespace = (!self.key.namespace.is_empty()).then(|| self.key.namespace.clone());
        StampedRef {
            api_version: carto_core::API_VERSION.to_string(),
            kind: self.controller.kind().to_string(),
            namespace,
            name: self.key.name.clone(),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller.as_str(), self.key)
    }
}

/// Everything a reconcile needs besides the request itself.
pub struct Context {
    /// Acts as the controller itself: reads owners, blueprints, templates, writes statuses.
    pub system: Arc<dyn Repository>,
    /// Builds repositories acting as an owner's service account.
    pub builder: Arc<dyn RepositoryBuilder>,
    pub tokens: Arc<dyn TokenManager>,
    pub events: Arc<dyn EventSink>,
    pub watcher: Arc<dyn StampedWatcher>,
    pub tracker: DependencyTracker<Request>,
}

impl Context {
    pub fn new(
        system: Arc<dyn Repository>,
        builder: Arc<dyn RepositoryBuilder>,
        tokens: Arc<dyn TokenManager>,
        events: Arc<dyn EventSink>,
        watcher: Arc<dyn StampedWatcher>,
        config: &ControllerConfig,
    ) -> Self {
        Self { system, builder, tokens, events, watcher, tracker: DependencyTracker::new(config.tracker_lease()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_drops_empty_namespace() {
        let r = Request::new(ControllerKind::SupplyChain, NamespacedName::cluster("sc"));
        let o = r.object_ref();
        assert_eq!((o.kind.as_str(), o.namespace.as_deref()), ("ClusterSupplyChain", None));
        let r = Request::new(ControllerKind::Workload, NamespacedName::new("dev", "app"));
        assert_eq!(r.object_ref().namespace.as_deref(), Some("dev"));
        assert_eq!(r.to_string(), "workload:dev/app");
        assert_eq!(ControllerKind::from_kind("ClusterDelivery"), Some(ControllerKind::Delivery));
    }
}
