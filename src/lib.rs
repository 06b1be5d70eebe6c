//! Place recognition, loop closure and map merging for a multi-map
//! visual-inertial SLAM backend.
//!
//! The crate hosts the background worker that watches the stream of newly
//! created keyframes and decides, for each one, whether the robot is
//! re-observing a previously mapped region. Two outcomes exist:
//!
//! 1. **Loop closure** — the match lies in the currently active map, so the
//!    accumulated drift is corrected in place.
//! 2. **Map merge** — the match lies in another map of the [`atlas::Atlas`],
//!    so the two maps are fused into one.
//!
//! Frontend tracking, local mapping, ORB feature matching, the nonlinear
//! optimizer and IMU preintegration are external collaborators reached
//! through the narrow interfaces in [`interfaces`].

pub mod atlas;
pub mod geometry;
pub mod imu;
pub mod interfaces;
pub mod loop_closing;
pub mod sensor;

pub use loop_closing::{LoopCloser, LoopCloserStats, LoopClosingConfig};
pub use sensor::Sensor;
