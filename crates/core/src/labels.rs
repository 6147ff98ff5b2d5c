//! Label keys stamped on every object the engine creates.

use std::collections::BTreeMap;

pub const RESOURCE_NAME: &str = "carto.run/resource-name";
pub const TEMPLATE_KIND: &str = "carto.run/template-kind";
pub const CLUSTER_TEMPLATE_NAME: &str = "carto.run/cluster-template-name";
pub const TEMPLATE_LIFECYCLE: &str = "carto.run/template-lifecycle";

pub const SUPPLY_CHAIN_NAME: &str = "carto.run/supply-chain-name";
pub const DELIVERY_NAME: &str = "carto.run/delivery-name";

pub const WORKLOAD_NAME: &str = "carto.run/workload-name";
pub const WORKLOAD_NAMESPACE: &str = "carto.run/workload-namespace";
pub const DELIVERABLE_NAME: &str = "carto.run/deliverable-name";
pub const DELIVERABLE_NAMESPACE: &str = "carto.run/deliverable-namespace";
pub const RUNNABLE_NAME: &str = "carto.run/runnable-name";
pub const RUNNABLE_NAMESPACE: &str = "carto.run/runnable-namespace";
pub const RUN_TEMPLATE_NAME: &str = "carto.run/run-template-name";

pub type Labels = BTreeMap<String, String>;

/// Read `metadata.labels` from a raw object.
pub fn labels_of(obj: &serde_json::Value) -> Labels {
    obj.pointer("/metadata/labels")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// True when every pair in `want` is present in `have`.
pub fn contains_all(have: &Labels, want: &Labels) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}
