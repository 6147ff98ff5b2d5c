//! Cartographer tracker – lease-bounded reverse index from dependencies to owners
//!
//! Reconcilers record which objects (service accounts, templates, blueprints)
//! an owner read. Watch events on those objects are turned back into owner
//! keys through [`DependencyTracker::lookup`]. Entries expire after the lease
//! so owners that vanish without `clear_tracked` do not leak.

#![forbid(unsafe_code)]

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use carto_core::refs::DependencyKey;
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::trace;

type Leases<K> = FxHashMap<K, Instant>;

/// One coarse lock over the whole map; reads purge expired leases.
pub struct DependencyTracker<K> {
    lease: Duration,
    index: Mutex<FxHashMap<DependencyKey, Leases<K>>>,
}

impl<K> DependencyTracker<K>
where
    K: Clone + Eq + Hash + std::fmt::Debug,
{
    pub fn new(lease: Duration) -> Self {
        Self { lease, index: Mutex::new(FxHashMap::default()) }
    }

    /// Lease for a given resync period.
    pub fn for_resync(resync: Duration) -> Self {
        Self::new(resync.saturating_mul(2))
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<DependencyKey, Leases<K>>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `owner` as interested in `dep` until now + lease.
    pub fn track(&self, dep: DependencyKey, owner: K) {
        let expiry = Instant::now() + self.lease;
        trace!(dep = %dep, owner = ?owner, "track");
        self.lock().entry(dep).or_default().insert(owner, expiry);
    }

    /// Replace everything `owner` tracks with `deps`.
    pub fn repoint<I>(&self, owner: &K, deps: I)
    where
        I: IntoIterator<Item = DependencyKey>,
    {
        let expiry = Instant::now() + self.lease;
        let mut index = self.lock();
        remove_owner(&mut index, owner);
        for dep in deps {
            index.entry(dep).or_default().insert(owner.clone(), expiry);
        }
    }

    /// Owners with a live lease on `dep`.
    pub fn lookup(&self, dep: &DependencyKey) -> Vec<K> {
        counter!("tracker_lookups_total", 1u64);
        let now = Instant::now();
        let mut index = self.lock();
        let Some(leases) = index.get_mut(dep) else {
            return Vec::new();
        };
        leases.retain(|_, expiry| *expiry > now);
        let owners: Vec<K> = leases.keys().cloned().collect();
        if leases.is_empty() {
            index.remove(dep);
        }
        owners
    }

    pub fn clear_tracked(&self, owner: &K) {
        remove_owner(&mut self.lock(), owner);
    }

    /// Number of dependencies with at least one lease, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn remove_owner<K: Eq + Hash>(index: &mut FxHashMap<DependencyKey, Leases<K>>, owner: &K) {
    index.retain(|_, leases| {
        leases.remove(owner);
        !leases.is_empty()
    });
}
