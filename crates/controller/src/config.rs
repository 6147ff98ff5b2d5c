//! Controller settings read from `CARTO_*` environment variables.

use std::time::Duration;

/// Runtime knobs shared by every controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Period of the full resync; tracker leases last twice as long.
    pub resync: Duration,
    /// Workers per controller.
    pub concurrency: usize,
    pub requeue_backoff: Duration,
    pub requeue_backoff_max: Duration,
    pub token_gc: Duration,
    pub field_manager: String,
    /// Work queue high-water mark and watch channel buffer. The queue never
    /// drops keys; a backlog past this is logged.
    pub queue_cap: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync: Duration::from_secs(36_000),
            concurrency: 2,
            requeue_backoff: Duration::from_millis(500),
            requeue_backoff_max: Duration::from_secs(60),
            token_gc: Duration::from_secs(86_400),
            field_manager: "cartographer".to_string(),
            queue_cap: 2048,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key lookup; unparsable values fall back to defaults.
    pub fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let num = |k: &str| get(k).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            resync: num("CARTO_RESYNC_SECS").filter(|s| *s > 0).map(Duration::from_secs).unwrap_or(d.resync),
            concurrency: num("CARTO_CONCURRENCY").filter(|n| *n > 0).map(|n| n as usize).unwrap_or(d.concurrency),
            requeue_backoff: num("CARTO_REQUEUE_BACKOFF_MS").map(Duration::from_millis).unwrap_or(d.requeue_backoff),
            requeue_backoff_max: num("CARTO_REQUEUE_BACKOFF_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.requeue_backoff_max),
            token_gc: num("CARTO_TOKEN_GC_SECS").filter(|s| *s > 0).map(Duration::from_secs).unwrap_or(d.token_gc),
            field_manager: get("CARTO_FIELD_MANAGER").filter(|s| !s.trim().is_empty()).unwrap_or(d.field_manager),
            queue_cap: num("CARTO_QUEUE_CAP").filter(|n| *n > 0).map(|n| n as usize).unwrap_or(d.queue_cap),
        }
    }

    /// Lease handed to dependency trackers.
    pub fn tracker_lease(&self) -> Duration {
        self.resync.saturating_mul(2)
    }
}
