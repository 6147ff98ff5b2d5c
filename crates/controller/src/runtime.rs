//! Worker pool, periodic resync and failure requeue around the reconcilers.

use std::sync::Arc;
use std::time::Instant;

use carto_core::blueprint::{Blueprint, BlueprintKind};
use carto_core::owner::{Owner, OwnerKind};
use carto_core::refs::NamespacedName;
use metrics::{counter, histogram};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::context::{Context, ControllerKind, Request};
use crate::error::ReconcileError;
use crate::queue::WorkQueue;
use crate::{blueprint, mapper, owner, runnable};

/// All five controllers sharing one queue, one tracker and one set of handles.
pub struct Controller {
    ctx: Arc<Context>,
    queue: Arc<WorkQueue<Request>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(ctx: Context, config: ControllerConfig) -> Arc<Self> {
        let queue = Arc::new(WorkQueue::new(config.queue_cap, config.requeue_backoff, config.requeue_backoff_max));
        Arc::new(Self { ctx: Arc::new(ctx), queue, config })
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn queue(&self) -> &Arc<WorkQueue<Request>> {
        &self.queue
    }

    /// Queue every request a watch event on `obj` maps to.
    pub async fn enqueue_for(&self, obj: &Value) -> usize {
        let requests = mapper::requests_for(&self.ctx, obj).await;
        let n = requests.len();
        for r in requests {
            self.queue.add(r);
        }
        n
    }

    /// Run one reconcile and record its metrics.
    pub async fn reconcile(&self, req: &Request) -> Result<(), ReconcileError> {
        let label = req.controller.as_str();
        counter!("reconcile_total", 1u64, "controller" => label);
        let started = Instant::now();
        let res = match req.controller {
            ControllerKind::Workload => owner::reconcile(&self.ctx, OwnerKind::Workload, &req.key).await,
            ControllerKind::Deliverable => owner::reconcile(&self.ctx, OwnerKind::Deliverable, &req.key).await,
            ControllerKind::Runnable => runnable::reconcile(&self.ctx, &req.key).await,
            ControllerKind::SupplyChain => blueprint::reconcile(&self.ctx, BlueprintKind::SupplyChain, req).await,
            ControllerKind::Delivery => blueprint::reconcile(&self.ctx, BlueprintKind::Delivery, req).await,
        };
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        if matches!(&res, Err(e) if e.is_unhandled()) {
            counter!("reconcile_errors_total", 1u64, "controller" => label);
        }
        res
    }

    /// Reconcile a dequeued request; unhandled failures come back after backoff.
    async fn process(&self, req: Request) {
        let retry = match self.reconcile(&req).await {
            Err(e) if e.is_unhandled() => Some(self.queue.backoff(&req)),
            _ => {
                self.queue.forget(&req);
                None
            }
        };
        self.queue.done(&req);
        if let Some(delay) = retry {
            debug!(request = %req, delay_ms = delay.as_millis() as u64, "requeue after failure");
            self.queue.add_after(req, delay);
        }
    }

    /// Queue every known owner and blueprint; returns how many requests were added.
    pub async fn resync(&self) -> usize {
        let system = self.ctx.system.as_ref();
        let mut requests = Vec::new();

        match system.list_supply_chains().await {
            Ok(v) => requests.extend(v.into_iter().map(|b| blueprint_request(Blueprint::SupplyChain(b)))),
            Err(e) => warn!(error = %e, "resync: cannot list supply chains"),
        }
        match system.list_deliveries().await {
            Ok(v) => requests.extend(v.into_iter().map(|b| blueprint_request(Blueprint::Delivery(b)))),
            Err(e) => warn!(error = %e, "resync: cannot list deliveries"),
        }
        match system.list_workloads().await {
            Ok(v) => requests.extend(v.into_iter().map(|w| owner_request(Owner::from(w)))),
            Err(e) => warn!(error = %e, "resync: cannot list workloads"),
        }
        match system.list_deliverables().await {
            Ok(v) => requests.extend(v.into_iter().map(|d| owner_request(Owner::from(d)))),
            Err(e) => warn!(error = %e, "resync: cannot list deliverables"),
        }
        match system.list_runnables().await {
            Ok(v) => requests.extend(v.iter().map(|r| Request::new(ControllerKind::Runnable, r.key()))),
            Err(e) => warn!(error = %e, "resync: cannot list runnables"),
        }

        let n = requests.len();
        for r in requests {
            self.queue.add(r);
        }
        n
    }

    /// Drain the queue with `concurrency` workers per controller until `shutdown` flips.
    ///
    /// The first resync fires immediately.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let workers = self.config.concurrency.max(1) * ControllerKind::ALL.len();
        info!(workers, resync_secs = self.config.resync.as_secs(), "controller starting");
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let this = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                while let Some(req) = this.queue.next().await {
                    this.process(req).await;
                }
                debug!(worker = id, "worker stopped");
            }));
        }

        let mut ticker = tokio::time::interval(self.config.resync);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let n = self.resync().await;
                    debug!(requests = n, "resync queued");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("controller stopping");
        self.queue.shutdown();
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "worker task failed");
            }
        }
        info!("controller stopped");
    }
}

fn owner_request(owner: Owner) -> Request {
    Request::new(owner.kind().into(), owner.key())
}

fn blueprint_request(bp: Blueprint) -> Request {
    let controller = match bp.kind() {
        BlueprintKind::SupplyChain => ControllerKind::SupplyChain,
        BlueprintKind::Delivery => ControllerKind::Delivery,
    };
    Request::new(controller, NamespacedName::cluster(bp.name()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use carto_api::{MemoryEventSink, MemoryRepository, RecordingWatcher, RepoError, StaticRepositoryBuilder, StaticTokenManager};
    use serde_json::json;

    fn controller(repo: &Arc<MemoryRepository>) -> Arc<Controller> {
        let config = ControllerConfig::default();
        let ctx = Context::new(
            repo.clone(),
            Arc::new(StaticRepositoryBuilder::new(repo.clone())),
            Arc::new(StaticTokenManager::new()),
            Arc::new(MemoryEventSink::new()),
            Arc::new(RecordingWatcher::new()),
            &config,
        );
        Controller::new(ctx, config)
    }

    #[tokio::test]
    async fn resync_queues_every_kind() {
        let repo = Arc::new(MemoryRepository::new());
        repo.insert(json!({"apiVersion": "carto.run/v1alpha1", "kind": "ClusterSupplyChain", "metadata": {"name": "sc"}, "spec": {}}));
        repo.insert(json!({"apiVersion": "carto.run/v1alpha1", "kind": "Workload", "metadata": {"name": "app", "namespace": "dev"}, "spec": {}}));
        repo.insert(json!({
            "apiVersion": "carto.run/v1alpha1", "kind": "Runnable",
            "metadata": {"name": "r", "namespace": "dev"},
            "spec": {"runTemplateRef": {"name": "t"}}
        }));
        let c = controller(&repo);
        assert_eq!(c.resync().await, 3);
        assert_eq!(c.queue().len(), 3);
        assert_eq!(c.resync().await, 3);
        assert_eq!(c.queue().len(), 3, "pending keys are deduplicated");
    }

    #[tokio::test(start_paused = true)]
    async fn unhandled_failures_requeue_with_backoff() {
        let repo = Arc::new(MemoryRepository::new());
        repo.fail("get_workload", RepoError::Internal("etcd down".into()));
        let c = controller(&repo);
        let req = Request::new(ControllerKind::Workload, NamespacedName::new("dev", "app"));

        c.queue().add(req.clone());
        let got = c.queue().next().await.unwrap();
        c.process(got).await;
        assert_eq!(c.queue().failures(&req), 1);
        assert!(c.queue().is_empty());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(c.queue().len(), 1);

        repo.clear_failures();
        let got = c.queue().next().await.unwrap();
        c.process(got).await;
        assert_eq!(c.queue().failures(&req), 0, "success forgets the failure count");
        assert!(c.queue().is_empty());
    }

    #[tokio::test]
    async fn missing_objects_reconcile_cleanly() {
        let repo = Arc::new(MemoryRepository::new());
        let c = controller(&repo);
        for kind in ControllerKind::ALL {
            let key = if matches!(kind, ControllerKind::SupplyChain | ControllerKind::Delivery) {
                NamespacedName::cluster("gone")
            } else {
                NamespacedName::new("dev", "gone")
            };
            assert!(c.reconcile(&Request::new(kind, key)).await.is_ok(), "{kind:?}");
        }
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let repo = Arc::new(MemoryRepository::new());
        let c = controller(&repo);
        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&c).run(rx));
        tokio::time::timeout(Duration::from_secs(5), async {
            while repo.count_calls("list_workloads") == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(c.queue().is_empty());
    }
}
