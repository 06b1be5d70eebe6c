//! Feature-matching interface.
//!
//! The ORB matcher owns the keypoints and descriptors; this crate only sees
//! slot-indexed match results. All methods are read-only with respect to
//! the map — proposed mutations (fusions) are returned as values and
//! applied by the caller under the atlas write lock, following the
//! collect / solve / apply discipline used throughout the worker.

use crate::atlas::{Atlas, KeyFrameId, MapPointId};
use crate::geometry::Sim3;

/// Search window parameters for projection-based matching.
#[derive(Debug, Clone, Copy)]
pub struct ProjectionParams {
    /// Search radius in pixels (scaled by the feature octave upstream).
    pub radius: f64,
    /// Descriptor distance ratio for accepting the best match.
    pub ratio: f64,
}

/// Outcome of a fuse pass for one candidate map point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseOutcome {
    /// Candidate did not project onto any feature.
    None,
    /// The projected feature slot already holds `existing`; the candidate
    /// and `existing` are duplicates.
    Duplicate { existing: MapPointId },
    /// The projected feature slot is free; attach the candidate there.
    Attach { keyframe: KeyFrameId, slot: usize },
}

/// Matching services supplied by the ORB frontend.
pub trait FeatureMatcher: Send + Sync {
    /// BoW-accelerated matching of `current` against `other`.
    ///
    /// Returns, for each matched feature slot of `current`, the map point
    /// observed by `other` at the corresponding feature.
    fn search_by_bow(
        &self,
        atlas: &Atlas,
        current: KeyFrameId,
        other: KeyFrameId,
    ) -> Vec<(usize, MapPointId)>;

    /// Project `candidates` into `kf` through `scw` (world-to-camera
    /// similarity) and match against unassociated features.
    ///
    /// `hints`, when given, carries the keyframe each candidate was
    /// collected from, letting the matcher narrow descriptor comparisons.
    /// The result has one entry per feature slot of `kf`.
    fn search_by_projection(
        &self,
        atlas: &Atlas,
        kf: KeyFrameId,
        scw: &Sim3,
        candidates: &[MapPointId],
        hints: Option<&[KeyFrameId]>,
        params: ProjectionParams,
    ) -> Vec<Option<MapPointId>>;

    /// Project `candidates` into `kf` through `scw` and report, for each
    /// candidate, whether it duplicates an existing association or can be
    /// attached to a free slot. One entry per candidate.
    fn fuse(
        &self,
        atlas: &Atlas,
        kf: KeyFrameId,
        scw: &Sim3,
        candidates: &[MapPointId],
        radius: f64,
    ) -> Vec<FuseOutcome>;
}
