//! Parameter resolution across template, blueprint, resource and owner layers.

use carto_core::params::{BlueprintParam, OwnerParam, TemplateParam};
use serde_json::{Map, Value};
use tracing::warn;

fn lookup<'a>(params: &'a [BlueprintParam], name: &str) -> Option<&'a BlueprintParam> {
    params.iter().find(|p| p.name == name)
}

/// Resolve the params for one resource.
///
/// Only names the template declares are emitted. A `value` on the resource or
/// blueprint locks the param and owner overrides are ignored; a `default` only
/// yields to owner params.
pub fn merge(
    template: &[TemplateParam],
    blueprint: &[BlueprintParam],
    resource: &[BlueprintParam],
    owner: &[OwnerParam],
) -> Value {
    let mut out = Map::with_capacity(template.len());
    for tp in template {
        let res = lookup(resource, &tp.name);
        let bp = lookup(blueprint, &tp.name);
        let own = owner.iter().find(|p| p.name == tp.name).map(|p| &p.value);

        let locked = res.and_then(|p| p.value.as_ref()).or_else(|| bp.and_then(|p| p.value.as_ref()));
        let value = match (locked, own) {
            (Some(v), Some(_)) => {
                warn!(param = %tp.name, "owner override ignored for locked param");
                v
            }
            (Some(v), None) => v,
            (None, Some(v)) => v,
            (None, None) => res
                .and_then(|p| p.default.as_ref())
                .or_else(|| bp.and_then(|p| p.default.as_ref()))
                .unwrap_or(&tp.default),
        };
        out.insert(tp.name.clone(), value.clone());
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tp(name: &str, default: Value) -> TemplateParam {
        TemplateParam { name: name.into(), default }
    }

    fn op(name: &str, value: Value) -> OwnerParam {
        OwnerParam { name: name.into(), value }
    }

    #[test]
    fn precedence_layers() {
        let template = vec![tp("a", json!("t")), tp("b", json!("t")), tp("c", json!("t")), tp("d", json!("t"))];
        let blueprint = vec![BlueprintParam::default("b", json!("bp-default")), BlueprintParam::value("c", json!("bp-value"))];
        let resource = vec![BlueprintParam::default("d", json!("res-default"))];
        let owner = vec![op("b", json!("owner")), op("c", json!("owner")), op("zzz", json!(1))];
        let got = merge(&template, &blueprint, &resource, &owner);
        assert_eq!(got, json!({"a": "t", "b": "owner", "c": "bp-value", "d": "res-default"}));
    }

    #[test]
    fn resource_value_beats_blueprint_value() {
        let template = vec![tp("x", json!(0))];
        let blueprint = vec![BlueprintParam::value("x", json!(1))];
        let resource = vec![BlueprintParam::value("x", json!(2))];
        assert_eq!(merge(&template, &blueprint, &resource, &[op("x", json!(3))]), json!({"x": 2}));
    }

    #[test]
    fn locked_blueprint_value_ignores_owner_override() {
        let template = vec![tp("port", json!(8080))];
        let blueprint = vec![BlueprintParam::value("port", json!(80))];
        assert_eq!(merge(&template, &blueprint, &[], &[op("port", json!(9090))]), json!({"port": 80}));
    }

    #[test]
    fn resource_default_beats_blueprint_default() {
        let template = vec![tp("x", json!(0))];
        let blueprint = vec![BlueprintParam::default("x", json!(1))];
        let resource = vec![BlueprintParam::default("x", json!(2))];
        assert_eq!(merge(&template, &blueprint, &resource, &[]), json!({"x": 2}));
    }

    #[test]
    fn undeclared_params_are_dropped() {
        let got = merge(&[], &[BlueprintParam::value("x", json!(1))], &[], &[op("y", json!(2))]);
        assert_eq!(got, json!({}));
    }
}
