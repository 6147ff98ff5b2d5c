//! Events describing what a reconcile changed on an owner's resources.

use carto_api::{Event, EventSink};
use carto_core::conditions::{self, find};
use carto_core::refs::fully_qualified_type;
use carto_core::status::{ResourceStatus, StampedRef};
use carto_realizer::ResourceStatuses;

pub const RESOURCE_OUTPUT_CHANGED: &str = "ResourceOutputChanged";
pub const RESOURCE_HEALTHY_STATUS_CHANGED: &str = "ResourceHealthyStatusChanged";
pub const STAMPED_OBJECT_APPLIED: &str = "StampedObjectApplied";
pub const STAMPED_OBJECT_REMOVED: &str = "StampedObjectRemoved";

fn qualified(r: &StampedRef) -> String {
    format!("{}/{}", fully_qualified_type(&r.gvk()), r.name)
}

fn digests(row: &ResourceStatus) -> Vec<(&str, &str)> {
    row.realized.outputs.iter().map(|o| (o.name.as_str(), o.digest.as_str())).collect()
}

/// Events for every resource row that changed in this pass.
pub fn resource_events(owner: &StampedRef, statuses: &ResourceStatuses) -> Vec<Event> {
    let mut out = Vec::new();
    for row in statuses.current() {
        let name = row.name();
        let prev = statuses.previous(name);
        let Some(stamped) = row.realized.stamped_ref.as_ref() else { continue };

        let prev_stamped = prev.and_then(|p| p.realized.stamped_ref.as_ref());
        if prev_stamped.map_or(true, |p| !p.same_object(stamped)) {
            out.push(Event::normal(
                owner.clone(),
                STAMPED_OBJECT_APPLIED,
                format!("[{name}] applied [{}]", qualified(stamped)),
            ));
        }

        let now = digests(&row);
        if !now.is_empty() && prev.map_or(true, |p| digests(p) != now) {
            out.push(Event::normal(
                owner.clone(),
                RESOURCE_OUTPUT_CHANGED,
                format!("[{name}] found a new output in [{}]", qualified(stamped)),
            ));
        }

        if statuses.changed_condition_types(name).iter().any(|t| t == conditions::HEALTHY) {
            let before = prev.and_then(|p| find(&p.conditions, conditions::HEALTHY)).map(|c| c.status.as_str());
            let after = find(&row.conditions, conditions::HEALTHY).map(|c| c.status.clone()).unwrap_or_default();
            if before.is_some_and(|b| b != after) {
                out.push(Event::normal(
                    owner.clone(),
                    RESOURCE_HEALTHY_STATUS_CHANGED,
                    format!("[{name}] found healthy status in [{}] changed to [{after}]", qualified(stamped)),
                ));
            }
        }
    }
    out
}

pub fn removed_event(owner: &StampedRef, removed: &StampedRef) -> Event {
    Event::normal(owner.clone(), STAMPED_OBJECT_REMOVED, format!("deleted orphaned object [{}]", qualified(removed)))
}

pub async fn emit(sink: &dyn EventSink, events: Vec<Event>) {
    for e in events {
        sink.record(e).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carto_core::conditions::{condition, ConditionStatus};
    use carto_core::status::{RealizedResource, ResourceOutput};

    fn owner() -> StampedRef {
        StampedRef { api_version: "carto.run/v1alpha1".into(), kind: "Workload".into(), namespace: Some("dev".into()), name: "app".into() }
    }

    fn realized(stamped: &str, digest: &str) -> RealizedResource {
        let mut r = RealizedResource::named("src");
        r.stamped_ref = Some(StampedRef {
            api_version: "source.toolkit.fluxcd.io/v1beta1".into(),
            kind: "GitRepository".into(),
            namespace: Some("dev".into()),
            name: stamped.into(),
        });
        if !digest.is_empty() {
            r.outputs = vec![ResourceOutput {
                name: "url".into(),
                preview: "u".into(),
                digest: digest.into(),
                last_transition_time: conditions::epoch(),
            }];
        }
        r
    }

    fn healthy(status: ConditionStatus) -> carto_core::Condition {
        condition(conditions::HEALTHY, status, conditions::OUTPUT_AVAILABLE, "")
    }

    #[test]
    fn first_pass_announces_apply_and_output() {
        let mut s = ResourceStatuses::new(&[]);
        s.add(realized("app-src", "sha256:1"), None, vec![healthy(ConditionStatus::True)]);
        let reasons: Vec<String> = resource_events(&owner(), &s).into_iter().map(|e| e.reason).collect();
        assert_eq!(reasons, [STAMPED_OBJECT_APPLIED, RESOURCE_OUTPUT_CHANGED]);
    }

    #[test]
    fn later_passes_report_only_transitions() {
        let mut first = ResourceStatuses::new(&[]);
        first.add(realized("app-src", "sha256:1"), None, vec![healthy(ConditionStatus::Unknown)]);
        let prev = first.current();

        let mut same = ResourceStatuses::new(&prev);
        same.add(realized("app-src", "sha256:1"), None, vec![healthy(ConditionStatus::Unknown)]);
        assert!(resource_events(&owner(), &same).is_empty());

        let mut moved = ResourceStatuses::new(&prev);
        moved.add(realized("app-src", "sha256:2"), None, vec![healthy(ConditionStatus::True)]);
        let events = resource_events(&owner(), &moved);
        let reasons: Vec<&str> = events.iter().map(|e| e.reason.as_str()).collect();
        assert_eq!(reasons, [RESOURCE_OUTPUT_CHANGED, RESOURCE_HEALTHY_STATUS_CHANGED]);
        assert_eq!(
            events[1].message,
            "[src] found healthy status in [gitrepository.source.toolkit.fluxcd.io/app-src] changed to [True]"
        );
    }
}
