//! Deletion of stamped objects an owner no longer realizes.

use carto_api::{RepoError, Repository};
use carto_core::labels::{self, labels_of};
use carto_core::status::{ResourceStatus, StampedRef};
use carto_core::template::{Lifecycle, TemplateKind};
use metrics::counter;
use tracing::{debug, warn};

/// How a previous row is matched against the current ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Equivalence {
    /// Same group, kind, namespace and name.
    Object,
    /// Same resource name and template: older immutable revisions stay.
    Resource,
}

fn equivalent(test: Equivalence, prev: &ResourceStatus, prev_ref: &StampedRef, cur: &ResourceStatus) -> bool {
    let Some(cur_ref) = cur.realized.stamped_ref.as_ref() else { return false };
    match test {
        Equivalence::Object => cur_ref.same_object(prev_ref),
        Equivalence::Resource => {
            let same_template = match (&prev.realized.template_ref, &cur.realized.template_ref) {
                (Some(p), Some(c)) => p.kind == c.kind && p.name == c.name,
                _ => false,
            };
            same_template && prev.name() == cur.name()
        }
    }
}

/// Pick the equivalence test for a previous row; `None` means the template is gone.
async fn equivalence_for(system: &dyn Repository, prev: &ResourceStatus, prev_ref: &StampedRef) -> Result<Option<Equivalence>, RepoError> {
    let Some(tref) = prev.realized.template_ref.as_ref() else {
        return Ok(Some(Equivalence::Object));
    };
    let Some(kind) = TemplateKind::from_kind(&tref.kind) else {
        return Ok(None);
    };
    let Some(template) = system.get_template(kind, &tref.name).await? else {
        return Ok(None);
    };
    if !template.lifecycle().is_immutable() {
        return Ok(Some(Equivalence::Object));
    }
    // The template may have switched lifecycle since the object was stamped.
    let Some(live) = system.get_object(prev_ref).await? else {
        return Ok(Some(Equivalence::Object));
    };
    let stamped_immutable = labels_of(&live)
        .get(labels::TEMPLATE_LIFECYCLE)
        .is_some_and(|l| l != Lifecycle::Mutable.as_str());
    Ok(Some(if stamped_immutable { Equivalence::Resource } else { Equivalence::Object }))
}

/// Previous stamped objects with no equivalent among `current`.
pub async fn orphaned(system: &dyn Repository, previous: &[ResourceStatus], current: &[ResourceStatus]) -> Vec<StampedRef> {
    let mut out = Vec::new();
    for prev in previous {
        let Some(prev_ref) = prev.realized.stamped_ref.as_ref() else { continue };
        let test = match equivalence_for(system, prev, prev_ref).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                debug!(resource = %prev.name(), object = %prev_ref, "template gone, object orphaned");
                out.push(prev_ref.clone());
                continue;
            }
            Err(e) => {
                warn!(resource = %prev.name(), object = %prev_ref, error = %e, "cannot classify previous object, keeping it");
                continue;
            }
        };
        if !current.iter().any(|cur| equivalent(test, prev, prev_ref, cur)) {
            out.push(prev_ref.clone());
        }
    }
    out
}

/// Delete orphaned objects; returns the ones actually removed.
///
/// Failures are logged and retried on the next pass.
pub async fn cleanup(system: &dyn Repository, previous: &[ResourceStatus], current: &[ResourceStatus]) -> Vec<StampedRef> {
    let mut deleted = Vec::new();
    for r in orphaned(system, previous, current).await {
        match system.delete(&r).await {
            Ok(()) => {
                counter!("orphans_deleted_total", 1u64);
                debug!(object = %r, "deleted orphaned object");
                deleted.push(r);
            }
            Err(e) if e.is_not_found() => debug!(object = %r, "orphaned object already gone"),
            Err(e) => warn!(object = %r, error = %e, "failed to delete orphaned object"),
        }
    }
    deleted
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_api::MemoryRepository;
    use carto_core::status::{RealizedResource, TemplateRef};
    use carto_core::template::{Template, TemplateSpec};
    use serde_json::json;

    fn row(name: &str, template: &str, stamped: &str) -> ResourceStatus {
        let mut r = RealizedResource::named(name);
        r.template_ref = Some(TemplateRef::new("ClusterTemplate", template));
        r.stamped_ref = Some(StampedRef {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            namespace: Some("dev".into()),
            name: stamped.into(),
        });
        ResourceStatus { realized: r, conditions: vec![] }
    }

    fn cm(repo: &MemoryRepository, name: &str, lifecycle: &str) {
        repo.insert(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "dev", "labels": {(labels::TEMPLATE_LIFECYCLE): lifecycle}}
        }));
    }

    fn template(repo: &MemoryRepository, name: &str, lifecycle: Lifecycle) {
        let spec = TemplateSpec {
            template: Some(json!({"apiVersion": "v1", "kind": "ConfigMap"})),
            lifecycle,
            ..Default::default()
        };
        repo.insert(Template::new(TemplateKind::Template, name, spec).to_object());
    }

    #[tokio::test]
    async fn mutable_objects_are_matched_by_identity() {
        let repo = MemoryRepository::new();
        template(&repo, "cm", Lifecycle::Mutable);
        cm(&repo, "a", "mutable");
        cm(&repo, "b", "mutable");
        let prev = [row("r1", "cm", "a"), row("r2", "cm", "b")];
        let cur = [row("r1", "cm", "a")];
        let deleted = cleanup(&repo, &prev, &cur).await;
        assert_eq!(deleted.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), ["b"]);
        assert_eq!(repo.objects_of_kind("ConfigMap").len(), 1);
    }

    #[tokio::test]
    async fn immutable_revisions_survive_while_the_resource_keeps_its_template() {
        let repo = MemoryRepository::new();
        template(&repo, "run", Lifecycle::Immutable);
        template(&repo, "other", Lifecycle::Immutable);
        cm(&repo, "test-1", "immutable");
        let prev = [row("test", "run", "test-1")];

        assert!(orphaned(&repo, &prev, &[row("test", "run", "test-2")]).await.is_empty());
        let gone = orphaned(&repo, &prev, &[row("test", "other", "test-2")]).await;
        assert_eq!(gone.len(), 1);
    }

    #[tokio::test]
    async fn missing_template_orphans_unconditionally() {
        let repo = MemoryRepository::new();
        cm(&repo, "a", "mutable");
        let prev = [row("r1", "vanished", "a")];
        let gone = orphaned(&repo, &prev, &prev).await;
        assert_eq!(gone.len(), 1);
    }

    #[tokio::test]
    async fn delete_failures_are_swallowed() {
        let repo = MemoryRepository::new();
        template(&repo, "cm", Lifecycle::Mutable);
        cm(&repo, "a", "mutable");
        repo.fail("delete", RepoError::Forbidden("no".into()));
        let deleted = cleanup(&repo, &[row("r1", "cm", "a")], &[]).await;
        assert!(deleted.is_empty());
        assert_eq!(repo.count_calls("delete"), 1);
    }
}
