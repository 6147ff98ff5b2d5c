//! Bookkeeping for create-only stamps: rank runs, prune old ones, find the newest success.

use carto_api::Repository;
use carto_core::conditions::ConditionStatus;
use carto_core::status::StampedRef;
use carto_core::template::RetentionPolicy;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tracing::{debug, warn};

/// A stamped run and how it went.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub object: Value,
    pub status: ConditionStatus,
}

impl Run {
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.object
            .pointer("/metadata/creationTimestamp")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Sort newest first; objects without a timestamp sort last.
pub fn newest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| b.created_at().cmp(&a.created_at()));
}

/// Runs that fall outside `policy`, given runs sorted newest first.
///
/// Runs still in flight (`Unknown`) are never pruned.
pub fn expired<'a>(runs: &'a [Run], policy: &RetentionPolicy) -> Vec<&'a Run> {
    let (mut ok, mut failed) = (0usize, 0usize);
    let mut out = Vec::new();
    for run in runs {
        match run.status {
            ConditionStatus::True => {
                ok += 1;
                if ok > policy.max_successful_runs {
                    out.push(run);
                }
            }
            ConditionStatus::False => {
                failed += 1;
                if failed > policy.max_failed_runs {
                    out.push(run);
                }
            }
            ConditionStatus::Unknown => {}
        }
    }
    out
}

/// Delete expired runs; failures are logged and skipped. Returns the deleted refs.
pub async fn prune(repo: &dyn Repository, runs: &[Run], policy: &RetentionPolicy) -> Vec<StampedRef> {
    let mut deleted = Vec::new();
    for run in expired(runs, policy) {
        let Some(r) = StampedRef::from_object(&run.object) else { continue };
        match repo.delete(&r).await {
            Ok(()) => {
                debug!(object = %r, "pruned run");
                counter!("orphans_deleted_total", 1u64);
                deleted.push(r);
            }
            Err(e) => warn!(object = %r, error = %e, "failed to prune run"),
        }
    }
    deleted
}

/// Newest run that succeeded, given runs sorted newest first.
pub fn latest_successful(runs: &[Run]) -> Option<&Run> {
    runs.iter().find(|r| r.status == ConditionStatus::True)
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_api::MemoryRepository;
    use serde_json::json;

    fn run(name: &str, ts: &str, status: ConditionStatus) -> Run {
        Run {
            object: json!({
                "apiVersion": "tekton.dev/v1beta1",
                "kind": "TaskRun",
                "metadata": {"name": name, "namespace": "ns", "creationTimestamp": ts}
            }),
            status,
        }
    }

    fn names(runs: &[&Run]) -> Vec<String> {
        runs.iter().map(|r| r.object["metadata"]["name"].as_str().unwrap().to_string()).collect()
    }

    #[test]
    fn sorts_and_picks_latest_success() {
        let mut runs = vec![
            run("a", "2024-01-01T00:00:01Z", ConditionStatus::True),
            run("c", "2024-01-01T00:00:03Z", ConditionStatus::Unknown),
            run("b", "2024-01-01T00:00:02Z", ConditionStatus::True),
        ];
        newest_first(&mut runs);
        assert_eq!(names(&runs.iter().collect::<Vec<_>>()), ["c", "b", "a"]);
        assert_eq!(latest_successful(&runs).map(|r| r.object["metadata"]["name"].clone()), Some(json!("b")));
    }

    #[test]
    fn keeps_policy_counts() {
        let mut runs = vec![
            run("s1", "2024-01-01T00:00:05Z", ConditionStatus::True),
            run("f1", "2024-01-01T00:00:04Z", ConditionStatus::False),
            run("s2", "2024-01-01T00:00:03Z", ConditionStatus::True),
            run("f2", "2024-01-01T00:00:02Z", ConditionStatus::False),
            run("u", "2024-01-01T00:00:01Z", ConditionStatus::Unknown),
        ];
        newest_first(&mut runs);
        let policy = RetentionPolicy { max_failed_runs: 1, max_successful_runs: 1 };
        assert_eq!(names(&expired(&runs, &policy)), ["s2", "f2"]);
    }

    #[tokio::test]
    async fn prune_deletes_from_repository() {
        let repo = MemoryRepository::new();
        let a = repo.insert(json!({"apiVersion": "tekton.dev/v1beta1", "kind": "TaskRun", "metadata": {"name": "a", "namespace": "ns"}}));
        let b = repo.insert(json!({"apiVersion": "tekton.dev/v1beta1", "kind": "TaskRun", "metadata": {"name": "b", "namespace": "ns"}}));
        let mut runs = vec![Run { object: a, status: ConditionStatus::False }, Run { object: b, status: ConditionStatus::False }];
        newest_first(&mut runs);
        let policy = RetentionPolicy { max_failed_runs: 1, max_successful_runs: 10 };
        let deleted = prune(&repo, &runs, &policy).await;
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].name, "a");
        assert_eq!(repo.objects_of_kind("TaskRun").len(), 1);
    }
}
