//! Cartographer core types – owners, blueprints, templates, statuses and conditions

#![forbid(unsafe_code)]

pub mod blueprint;
pub mod condition_manager;
pub mod conditions;
pub mod labels;
pub mod owner;
pub mod params;
pub mod refs;
pub mod status;
pub mod template;

pub const GROUP: &str = "carto.run";
pub const VERSION: &str = "v1alpha1";
pub const API_VERSION: &str = "carto.run/v1alpha1";

pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;

pub mod prelude {
    pub use super::blueprint::{
        Blueprint, BlueprintKind, BlueprintResource, BlueprintSpec, BlueprintTemplateRef, ClusterDelivery,
        ClusterSupplyChain, FieldSelectorOperator, FieldSelectorRequirement, OptionSelector, ResourceReference,
        TemplateOption,
    };
    pub use super::condition_manager::{ConditionManager, Polarity};
    pub use super::conditions::{self, ConditionStatus};
    pub use super::owner::{Deliverable, Owner, OwnerKind, OwnerStrategy, Runnable, Workload};
    pub use super::params::{BlueprintParam, OwnerParam, TemplateParam};
    pub use super::refs::{DependencyKey, GroupKind, NamespacedName};
    pub use super::status::{RealizedResource, ResourceOutput, ResourceStatus, StampedRef, TemplateRef};
    pub use super::template::{ClusterRunTemplate, HealthRule, Lifecycle, Template, TemplateKind, TemplateSpec};
    pub use super::Condition;
}
