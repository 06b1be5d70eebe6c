//! KeyFrame — a selected frame retained as a node of the map graph.
//!
//! Keyframes carry the pose estimate, the covisibility adjacency, the
//! spanning tree used by essential-graph optimization, and the loop/merge
//! edges added by this worker. Feature data (keypoints, descriptors) lives
//! with the matcher on the other side of the interface; a keyframe only
//! keeps the per-feature map-point slots and its BoW histogram.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::geometry::SE3;
use crate::imu::ImuBias;

use super::keyframe_db::BowVector;
use super::types::{KeyFrameId, MapId, MapPointId};

/// A keyframe in the SLAM graph.
#[derive(Debug, Clone)]
pub struct KeyFrame {
    /// Unique, monotonically increasing identifier.
    pub id: KeyFrameId,

    /// Owning map.
    pub map_id: MapId,

    /// Pose: world-to-camera transform (T_cw).
    pose: SE3,

    /// Body velocity in world frame, once the IMU is initialized.
    velocity: Option<Vector3<f64>>,

    /// IMU bias estimate at this keyframe.
    imu_bias: ImuBias,

    /// Sparse BoW histogram used for place recognition.
    pub bow: Option<BowVector>,

    /// Feature index → MapPoint association.
    map_point_slots: Vec<Option<MapPointId>>,

    /// Covisibility adjacency: connected keyframe → number of shared points.
    covisibility_weights: HashMap<KeyFrameId, usize>,

    // Spanning tree
    parent: Option<KeyFrameId>,
    children: HashSet<KeyFrameId>,
    /// True until the keyframe has been wired into the spanning tree.
    pub first_connection: bool,

    /// Loop edges added on loop closure (mutual).
    loop_edges: HashSet<KeyFrameId>,
    /// Merge edges added on map merge (mutual).
    merge_edges: HashSet<KeyFrameId>,

    /// Temporal chain for inertial configurations.
    pub prev_kf: Option<KeyFrameId>,
    pub next_kf: Option<KeyFrameId>,

    // Erase pinning. A pinned keyframe survives erase requests; the request
    // is remembered and acted on at the final unpin.
    pin_count: u32,
    to_be_erased: bool,
    is_bad: bool,

    // ── Merge staging ────────────────────────────────────────────────────
    /// Corrected pose staged by the merge planner, committed under the map
    /// lock.
    pub pose_merge: Option<SE3>,
    /// Corrected velocity staged by the merge planner.
    pub vel_merge: Option<Vector3<f64>>,
    /// Pose at the instant the merge commit overwrote it.
    pub pose_before_merge: Option<SE3>,
    /// Id of the keyframe whose merge corrected this one.
    pub merge_corrected_for: Option<KeyFrameId>,

    // ── Global BA staging ────────────────────────────────────────────────
    /// Pose produced by global BA (directly or by spanning-tree
    /// propagation), applied by the supervisor.
    pub pose_gba: Option<SE3>,
    pub vel_gba: Option<Vector3<f64>>,
    pub bias_gba: Option<ImuBias>,
    /// Loop-keyframe id stamped when `pose_gba` was produced.
    pub ba_global_for: Option<KeyFrameId>,
    /// Pose right before the GBA result overwrote it; map points that were
    /// not directly optimized are re-expressed through this.
    pub pose_before_gba: Option<SE3>,
}

impl KeyFrame {
    /// Create a keyframe with `num_features` empty map-point slots.
    pub fn new(id: KeyFrameId, map_id: MapId, pose: SE3, num_features: usize) -> Self {
        Self {
            id,
            map_id,
            pose,
            velocity: None,
            imu_bias: ImuBias::zero(),
            bow: None,
            map_point_slots: vec![None; num_features],
            covisibility_weights: HashMap::new(),
            parent: None,
            children: HashSet::new(),
            first_connection: true,
            loop_edges: HashSet::new(),
            merge_edges: HashSet::new(),
            prev_kf: None,
            next_kf: None,
            pin_count: 0,
            to_be_erased: false,
            is_bad: false,
            pose_merge: None,
            vel_merge: None,
            pose_before_merge: None,
            merge_corrected_for: None,
            pose_gba: None,
            vel_gba: None,
            bias_gba: None,
            ba_global_for: None,
            pose_before_gba: None,
        }
    }

    // ── Pose and IMU state ───────────────────────────────────────────────

    /// World-to-camera transform.
    pub fn pose(&self) -> &SE3 {
        &self.pose
    }

    /// Camera-to-world transform.
    pub fn pose_inverse(&self) -> SE3 {
        self.pose.inverse()
    }

    pub fn set_pose(&mut self, pose: SE3) {
        self.pose = pose;
    }

    /// Camera center in world frame.
    pub fn camera_center(&self) -> Vector3<f64> {
        self.pose.inverse().translation
    }

    pub fn velocity(&self) -> Option<Vector3<f64>> {
        self.velocity
    }

    pub fn set_velocity(&mut self, v: Vector3<f64>) {
        self.velocity = Some(v);
    }

    pub fn imu_bias(&self) -> ImuBias {
        self.imu_bias
    }

    pub fn set_new_bias(&mut self, bias: ImuBias) {
        self.imu_bias = bias;
    }

    // ── Map-point slots ──────────────────────────────────────────────────

    pub fn num_features(&self) -> usize {
        self.map_point_slots.len()
    }

    pub fn map_point(&self, slot: usize) -> Option<MapPointId> {
        self.map_point_slots.get(slot).copied().flatten()
    }

    /// Associate a feature slot with a map point, returning the previous
    /// occupant if any.
    pub fn set_map_point(&mut self, slot: usize, mp: MapPointId) -> Option<MapPointId> {
        if slot >= self.map_point_slots.len() {
            return None;
        }
        self.map_point_slots[slot].replace(mp)
    }

    pub fn erase_map_point(&mut self, slot: usize) -> Option<MapPointId> {
        self.map_point_slots.get_mut(slot).and_then(|s| s.take())
    }

    /// All occupied slots as (slot, map point) pairs.
    pub fn map_point_matches(&self) -> impl Iterator<Item = (usize, MapPointId)> + '_ {
        self.map_point_slots
            .iter()
            .enumerate()
            .filter_map(|(idx, mp)| mp.map(|id| (idx, id)))
    }

    /// Distinct map points observed by this keyframe.
    pub fn map_points(&self) -> HashSet<MapPointId> {
        self.map_point_slots.iter().flatten().copied().collect()
    }

    // ── Covisibility graph ───────────────────────────────────────────────

    pub fn covisibility_weight(&self, other: KeyFrameId) -> usize {
        self.covisibility_weights.get(&other).copied().unwrap_or(0)
    }

    pub fn set_covisibility_weight(&mut self, other: KeyFrameId, weight: usize) {
        if other != self.id {
            self.covisibility_weights.insert(other, weight);
        }
    }

    pub fn erase_covisibility(&mut self, other: KeyFrameId) {
        self.covisibility_weights.remove(&other);
    }

    pub fn replace_covisibility(&mut self, weights: HashMap<KeyFrameId, usize>) {
        self.covisibility_weights = weights;
        self.covisibility_weights.remove(&self.id);
    }

    /// Connected keyframes, unordered.
    pub fn connected_keyframes(&self) -> HashSet<KeyFrameId> {
        self.covisibility_weights.keys().copied().collect()
    }

    /// Connected keyframes ordered by weight, best first.
    pub fn covisibles_by_weight(&self) -> Vec<KeyFrameId> {
        let mut ordered: Vec<(KeyFrameId, usize)> = self
            .covisibility_weights
            .iter()
            .map(|(&id, &w)| (id, w))
            .collect();
        // Tie-break on id for determinism.
        ordered.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ordered.into_iter().map(|(id, _)| id).collect()
    }

    /// The N best covisible keyframes.
    pub fn best_covisibles(&self, n: usize) -> Vec<KeyFrameId> {
        let mut ordered = self.covisibles_by_weight();
        ordered.truncate(n);
        ordered
    }

    // ── Spanning tree ────────────────────────────────────────────────────

    pub fn parent(&self) -> Option<KeyFrameId> {
        self.parent
    }

    /// Re-link this keyframe under a new parent. The caller maintains the
    /// child set of both parents.
    pub fn change_parent(&mut self, parent: KeyFrameId) {
        self.parent = Some(parent);
    }

    pub fn clear_parent(&mut self) {
        self.parent = None;
    }

    pub fn children(&self) -> &HashSet<KeyFrameId> {
        &self.children
    }

    pub fn add_child(&mut self, child: KeyFrameId) {
        self.children.insert(child);
    }

    pub fn erase_child(&mut self, child: KeyFrameId) {
        self.children.remove(&child);
    }

    // ── Loop and merge edges ─────────────────────────────────────────────

    /// Add a loop edge. A keyframe with loop edges is permanently
    /// protected from culling.
    pub fn add_loop_edge(&mut self, other: KeyFrameId) {
        self.loop_edges.insert(other);
    }

    pub fn loop_edges(&self) -> &HashSet<KeyFrameId> {
        &self.loop_edges
    }

    pub fn add_merge_edge(&mut self, other: KeyFrameId) {
        self.merge_edges.insert(other);
    }

    pub fn merge_edges(&self) -> &HashSet<KeyFrameId> {
        &self.merge_edges
    }

    // ── Erase pinning ────────────────────────────────────────────────────

    /// Pin this keyframe: erase requests are deferred until unpinned.
    pub fn set_not_erase(&mut self) {
        self.pin_count += 1;
    }

    /// Release one pin. Returns true when this was the last pin and an
    /// erase request is pending — the caller must then actually erase the
    /// keyframe from its map.
    pub fn set_erase(&mut self) -> bool {
        self.pin_count = self.pin_count.saturating_sub(1);
        self.pin_count == 0 && self.to_be_erased
    }

    /// Request erasure. Returns true if the keyframe can be erased right
    /// now (not pinned); otherwise the request is remembered.
    pub fn request_erase(&mut self) -> bool {
        if self.pin_count > 0 {
            self.to_be_erased = true;
            false
        } else {
            true
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    pub fn is_bad(&self) -> bool {
        self.is_bad
    }

    pub fn set_bad(&mut self) {
        self.is_bad = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kf(id: u64) -> KeyFrame {
        KeyFrame::new(KeyFrameId::new(id), MapId::new(0), SE3::identity(), 8)
    }

    #[test]
    fn test_slot_association() {
        let mut k = kf(1);
        assert_eq!(k.set_map_point(3, MapPointId::new(100)), None);
        assert_eq!(k.map_point(3), Some(MapPointId::new(100)));
        assert_eq!(
            k.set_map_point(3, MapPointId::new(200)),
            Some(MapPointId::new(100))
        );
        assert_eq!(k.erase_map_point(3), Some(MapPointId::new(200)));
        assert_eq!(k.map_point(3), None);
        // Out of range slots are ignored
        assert_eq!(k.set_map_point(99, MapPointId::new(1)), None);
    }

    #[test]
    fn test_covisibility_ordering() {
        let mut k = kf(1);
        k.set_covisibility_weight(KeyFrameId::new(2), 50);
        k.set_covisibility_weight(KeyFrameId::new(3), 100);
        k.set_covisibility_weight(KeyFrameId::new(4), 25);
        // Self connections are refused
        k.set_covisibility_weight(KeyFrameId::new(1), 500);

        let best = k.best_covisibles(2);
        assert_eq!(best, vec![KeyFrameId::new(3), KeyFrameId::new(2)]);
        assert_eq!(k.covisibility_weight(KeyFrameId::new(1)), 0);
    }

    #[test]
    fn test_pinning_defers_erase() {
        let mut k = kf(5);
        k.set_not_erase();
        k.set_not_erase();

        assert!(!k.request_erase());
        assert!(!k.set_erase()); // one pin remains
        assert!(k.set_erase()); // final unpin surfaces the pending erase
    }

    #[test]
    fn test_unpinned_erase_is_immediate() {
        let mut k = kf(6);
        assert!(k.request_erase());
    }
}
