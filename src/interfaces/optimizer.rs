//! Nonlinear-optimization interface.
//!
//! Bundle adjustment and pose-graph optimization run in the external
//! optimizer. Short optimizations are called under the caller's atlas
//! write guard; the long-running global variants receive the lock handle
//! and a cooperative stop flag instead.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;

use parking_lot::RwLock;

use crate::atlas::{Atlas, KeyFrameId, MapId, MapPointId};
use crate::geometry::Sim3;
use crate::imu::ImuBias;

/// Inputs of an essential-graph optimization after a loop closure.
#[derive(Debug, Clone, Default)]
pub struct EssentialGraphProblem {
    /// Corrected world-to-camera similarities for the propagated window.
    pub corrected: HashMap<KeyFrameId, Sim3>,
    /// The same keyframes' similarities before correction.
    pub non_corrected: HashMap<KeyFrameId, Sim3>,
    /// Covisibility links that appeared when the loop was fused, keyed by
    /// the window keyframe.
    pub loop_connections: HashMap<KeyFrameId, HashSet<KeyFrameId>>,
}

/// Optimization services supplied by the backend solver.
///
/// Contracts for the global variants: every keyframe pose produced by the
/// optimization must be staged in `pose_gba` (and `vel_gba` / `bias_gba`
/// for inertial maps) with `ba_global_for` stamped to `loop_kf`; every
/// optimized map point stages `pos_gba` with the same stamp. The supervisor
/// commits or discards the staged state afterwards. Implementations poll
/// `stop` and return early when it is raised, leaving whatever was staged.
pub trait Optimizer: Send + Sync {
    /// Refine the relative similarity `s_cm` between two keyframes from
    /// their slot-indexed matches. Rejected matches are cleared from
    /// `matches`. Returns the number of inliers.
    fn optimize_sim3(
        &self,
        atlas: &Atlas,
        current: KeyFrameId,
        matched: KeyFrameId,
        matches: &mut [Option<MapPointId>],
        s_cm: &mut Sim3,
        iterations: usize,
        fix_scale: bool,
    ) -> usize;

    /// 7-DoF essential-graph optimization over `map` after a loop closure.
    fn optimize_essential_graph(
        &self,
        atlas: &mut Atlas,
        map: MapId,
        matched_kf: KeyFrameId,
        current_kf: KeyFrameId,
        problem: &EssentialGraphProblem,
        fix_scale: bool,
    );

    /// 4-DoF (yaw + translation) variant used once the IMU has fixed
    /// roll, pitch and scale.
    fn optimize_essential_graph_4dof(
        &self,
        atlas: &mut Atlas,
        map: MapId,
        matched_kf: KeyFrameId,
        current_kf: KeyFrameId,
        problem: &EssentialGraphProblem,
    );

    /// Partial essential graph over the leftovers of a merged-away map:
    /// `outside_kfs` are optimized against the fixed welding windows.
    fn optimize_essential_graph_partial(
        &self,
        atlas: &mut Atlas,
        current_kf: KeyFrameId,
        fixed_kfs: &[KeyFrameId],
        fixed_corrected_kfs: &[KeyFrameId],
        outside_kfs: &[KeyFrameId],
        outside_mps: &[MapPointId],
    );

    /// Local (welding) bundle adjustment over `adjusted` with `fixed` as
    /// anchor keyframes.
    fn local_bundle_adjustment(
        &self,
        atlas: &mut Atlas,
        current: KeyFrameId,
        adjusted: &[KeyFrameId],
        fixed: &[KeyFrameId],
        stop: &AtomicBool,
    );

    /// Visual-inertial welding bundle adjustment around a merge seam.
    fn merge_inertial_ba(
        &self,
        atlas: &mut Atlas,
        current: KeyFrameId,
        matched: KeyFrameId,
        map: MapId,
        stop: &AtomicBool,
    );

    /// Inertial-only optimization estimating gyro/accel biases of a map
    /// whose IMU initialization is incomplete.
    fn inertial_optimization(&self, atlas: &mut Atlas, map: MapId) -> ImuBias;

    /// Full visual bundle adjustment over `map`.
    fn global_bundle_adjustment(
        &self,
        atlas: &RwLock<Atlas>,
        map: MapId,
        iterations: usize,
        loop_kf: KeyFrameId,
        stop: &AtomicBool,
    );

    /// Full visual-inertial bundle adjustment over `map`.
    fn full_inertial_ba(
        &self,
        atlas: &RwLock<Atlas>,
        map: MapId,
        iterations: usize,
        loop_kf: KeyFrameId,
        stop: &AtomicBool,
    );
}
