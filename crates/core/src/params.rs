use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Param supplied by a workload or deliverable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerParam {
    pub name: String,
    pub value: Value,
}

/// Param declared on a blueprint or one of its resources.
///
/// `value` locks the param against owner overrides, `default` only supplies a fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueprintParam {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl BlueprintParam {
    pub fn value(name: &str, value: Value) -> Self {
        Self { name: name.to_string(), value: Some(value), default: None }
    }

    pub fn default(name: &str, default: Value) -> Self {
        Self { name: name.to_string(), value: None, default: Some(default) }
    }
}

/// Param declared by a template; only declared names reach the interpolation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateParam {
    pub name: String,
    #[serde(default)]
    pub default: Value,
}
