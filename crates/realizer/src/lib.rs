//! Cartographer realizer – walks a blueprint's resources for one owner
//!
//! [`realize`] visits resources in blueprint order, handing each the outputs
//! produced so far. A [`ResourceRealizer`] picks the template, stamps it,
//! applies the object with the owner's service-account repository and reads
//! the output back. Outcomes land in [`ResourceStatuses`] rows; failures are
//! typed by [`RealizerError`] and decide whether the walk continues.
//!
//! Runnables take a separate, single-object path in [`runnable`].

#![forbid(unsafe_code)]

pub mod errors;
pub mod realizer;
pub mod resource;
pub mod retention;
pub mod runnable;
pub mod statuses;

pub use errors::{BlueprintType, RealizerError, RunnableError, Site};
pub use realizer::{realize, RealizeReport};
pub use resource::{RealizeResource, Realized, ResourceRealizer};
pub use runnable::RunnableOutcome;
pub use statuses::ResourceStatuses;
