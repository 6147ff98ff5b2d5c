//! Record engine events as core/v1 Events on the owner they concern.

use carto_api::{Event, EventSink};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event as CoreEvent, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::warn;

pub struct KubeEventRecorder {
    client: Client,
    component: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, component: &str) -> Self {
        Self { client, component: component.to_string() }
    }
}

/// Core event for `event`, named after the object it regards.
pub fn to_core_event(event: &Event, component: &str, now: DateTime<Utc>) -> CoreEvent {
    let r = &event.regarding;
    CoreEvent {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}.", r.name)),
            namespace: r.namespace.clone(),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(r.api_version.clone()),
            kind: Some(r.kind.clone()),
            name: Some(r.name.clone()),
            namespace: r.namespace.clone(),
            ..Default::default()
        },
        reason: Some(event.reason.clone()),
        message: Some(event.message.clone()),
        type_: Some(event.type_.as_str().to_string()),
        source: Some(EventSource { component: Some(component.to_string()), ..Default::default() }),
        reporting_component: Some(component.to_string()),
        first_timestamp: Some(Time(now)),
        last_timestamp: Some(Time(now)),
        count: Some(1),
        ..Default::default()
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventRecorder {
    async fn record(&self, event: Event) {
        let namespace = event.regarding.namespace.clone().unwrap_or_else(|| "default".to_string());
        let api: Api<CoreEvent> = Api::namespaced(self.client.clone(), &namespace);
        let core = to_core_event(&event, &self.component, Utc::now());
        if let Err(e) = api.create(&PostParams::default(), &core).await {
            warn!(reason = %event.reason, regarding = %event.regarding, error = %e, "cannot record event");
        }
    }
}
