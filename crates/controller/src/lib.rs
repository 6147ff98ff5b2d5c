//! Cartographer controller – reconcilers, watch-event mapping and the worker runtime
//!
//! Five controllers share one [`Context`]: workloads and deliverables are
//! realized against the blueprint selecting them, runnables stamp their run
//! template, and supply chains and deliveries check their templates exist.
//! Watch events are mapped back to requests through the dependency tracker
//! and the owner references of stamped objects.

#![forbid(unsafe_code)]

pub mod blueprint;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod mapper;
pub mod orphans;
pub mod owner;
pub mod queue;
pub mod runnable;
pub mod runtime;

pub use config::ControllerConfig;
pub use context::{Context, ControllerKind, Request};
pub use error::ReconcileError;
pub use queue::WorkQueue;
pub use runtime::Controller;
