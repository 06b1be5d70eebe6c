//! Narrow interfaces to the external collaborators of this worker.
//!
//! Feature matching, nonlinear optimization, the local mapper and the
//! tracker all live in other threads or crates; place recognition reaches
//! them through the traits and handshake structs defined here.

pub mod local_mapper;
pub mod matcher;
pub mod optimizer;
pub mod tracker;

pub use local_mapper::MapperControl;
pub use matcher::{FeatureMatcher, FuseOutcome, ProjectionParams};
pub use optimizer::{EssentialGraphProblem, Optimizer};
pub use tracker::TrackerBridge;
