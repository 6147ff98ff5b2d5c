//! Offline stamping: render one template for one owner without a cluster.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Context, Result};
use carto_core::owner::{Deliverable, Owner, Workload};
use carto_core::template::Template;
use carto_eval::{build_context, params, stamping_labels, DeploymentInput, Inputs, Stamper};
use serde_json::Value;

/// Parse YAML (or JSON, which is YAML) into a JSON value.
pub fn parse_document(text: &str) -> Result<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
    serde_json::to_value(yaml).context("converting YAML to JSON")
}

fn owner_of(obj: &Value) -> Result<Owner> {
    match obj.get("kind").and_then(Value::as_str) {
        Some("Workload") => Ok(Owner::from(serde_json::from_value::<Workload>(obj.clone()).context("decoding workload")?)),
        Some("Deliverable") => {
            Ok(Owner::from(serde_json::from_value::<Deliverable>(obj.clone()).context("decoding deliverable")?))
        }
        other => bail!("owner must be a Workload or Deliverable, got {:?}", other.unwrap_or_default()),
    }
}

fn named_map(v: Option<&Value>) -> BTreeMap<String, Value> {
    v.and_then(Value::as_object).map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).unwrap_or_default()
}

/// Upstream inputs as `{sources: {name: {url, revision}}, images: {...}, configs: {...}, deployment: {url, revision}}`.
pub fn inputs_from(doc: &Value) -> Inputs {
    Inputs {
        sources: named_map(doc.get("sources")),
        images: named_map(doc.get("images")),
        configs: named_map(doc.get("configs")),
        deployment: doc.get("deployment").map(|d| DeploymentInput {
            url: d.get("url").cloned().unwrap_or(Value::Null),
            revision: d.get("revision").cloned().unwrap_or(Value::Null),
        }),
    }
}

/// Stamp `template` for `owner` as blueprint resource `resource`.
pub fn stamp(template: &Value, owner: &Value, inputs: &Value, blueprint: &str, resource: &str) -> Result<Value> {
    let template = Template::from_object(template).map_err(|e| anyhow!("decoding template: {e}"))?;
    let owner = owner_of(owner)?;
    let strategy = owner.strategy();
    let params = params::merge(&template.spec.params, &[], &[], owner.params());
    let ctx = build_context(strategy.context_key, &owner.to_value(), params, &inputs_from(inputs));
    let labels = stamping_labels(strategy, &owner.name(), &owner.namespace(), blueprint, resource, &template);
    let stamper = Stamper::new(&owner.namespace(), owner.owner_reference(), labels);
    stamper
        .stamp(&template, &format!("{}-{resource}", owner.name()), &ctx)
        .with_context(|| format!("stamping {} [{}]", template.kind.kind(), template.name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn workload() -> Value {
        json!({
            "apiVersion": "carto.run/v1alpha1", "kind": "Workload",
            "metadata": {"name": "app", "namespace": "dev", "uid": "w-uid"},
            "spec": {"params": [{"name": "port", "value": 9090}], "source": {"git": {"url": "https://github.com/acme/app"}}}
        })
    }

    #[test]
    fn yaml_templates_stamp_with_owner_params_and_inputs() {
        let template = parse_document(
            r#"
apiVersion: carto.run/v1alpha1
kind: ClusterConfigTemplate
metadata:
  name: app-config
spec:
  configPath: .data
  params:
    - name: port
      default: 8080
  template:
    apiVersion: v1
    kind: ConfigMap
    data:
      port: $(params.port)$
      image: $(image)$
      repo: $(workload.spec.source.git.url)$
"#,
        )
        .unwrap();
        let inputs = json!({"images": {"image": {"image": "registry/app@sha256:1", "name": "image"}}});

        let obj = stamp(&template, &workload(), &inputs, "chain", "config").unwrap();
        assert_eq!(obj["metadata"]["name"], "app-config");
        assert_eq!(obj["metadata"]["namespace"], "dev");
        assert_eq!(obj["data"]["port"], 9090);
        assert_eq!(obj["data"]["image"], "registry/app@sha256:1");
        assert_eq!(obj["data"]["repo"], "https://github.com/acme/app");
        assert_eq!(obj["metadata"]["labels"]["carto.run/workload-name"], "app");
        assert_eq!(obj["metadata"]["labels"]["carto.run/resource-name"], "config");
        assert_eq!(obj["metadata"]["ownerReferences"][0]["uid"], "w-uid");
    }

    #[test]
    fn runnables_are_not_blueprint_owners() {
        let template = json!({"apiVersion": "carto.run/v1alpha1", "kind": "ClusterTemplate", "metadata": {"name": "t"}, "spec": {"template": {}}});
        let owner = json!({"apiVersion": "carto.run/v1alpha1", "kind": "Runnable", "metadata": {"name": "r"}});
        let err = stamp(&template, &owner, &Value::Null, "chain", "r").unwrap_err();
        assert!(err.to_string().contains("Workload or Deliverable"), "{err}");
    }
}
