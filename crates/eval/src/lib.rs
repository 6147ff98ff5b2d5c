//! Cartographer eval – JSONPath, `$(expr)$` interpolation, selectors, param merge, stamping, outputs and health rules

#![forbid(unsafe_code)]

pub mod digest;
pub mod health;
pub mod interpolate;
pub mod jsonpath;
pub mod output;
pub mod params;
pub mod selector;
pub mod stamp;

pub use digest::output_rows;
pub use health::{determine_health, owner_health_condition};
pub use interpolate::{interpolate, InterpolateError};
pub use jsonpath::{JsonPath, JsonPathError};
pub use output::{read_output, DeploymentInput, Output, OutputBus, OutputError};
pub use selector::{select_option, OptionSelectionError, SelectorError};
pub use stamp::{build_context, stamping_labels, Inputs, StampError, Stamper};
