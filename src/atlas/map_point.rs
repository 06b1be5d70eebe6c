//! MapPoint — a triangulated 3D landmark observed by keyframes.

use std::collections::HashMap;

use nalgebra::Vector3;

use super::types::{KeyFrameId, MapId, MapPointId};

/// A 3D landmark.
#[derive(Debug, Clone)]
pub struct MapPoint {
    pub id: MapPointId,

    /// Owning map. Always equals the owning map of the reference keyframe.
    pub map_id: MapId,

    /// Position in world frame.
    position: Vector3<f64>,

    /// Mean viewing direction (unit vector, world frame).
    normal: Vector3<f64>,

    /// Scale-invariance distance bounds, derived from the reference
    /// observation.
    pub min_distance: f64,
    pub max_distance: f64,

    /// Observing keyframes → feature slot in that keyframe.
    observations: HashMap<KeyFrameId, usize>,

    /// Keyframe that created this point.
    reference_kf: KeyFrameId,

    is_bad: bool,

    // ── Correction stamps ────────────────────────────────────────────────
    /// Id of the loop keyframe whose correction last moved this point.
    /// Guards against applying the same propagation twice.
    pub corrected_by_kf: Option<KeyFrameId>,
    /// Keyframe through which the correction was propagated.
    pub corrected_reference: Option<KeyFrameId>,

    // ── Global BA staging ────────────────────────────────────────────────
    pub pos_gba: Option<Vector3<f64>>,
    pub ba_global_for: Option<KeyFrameId>,

    // ── Merge staging ────────────────────────────────────────────────────
    pub pos_merge: Option<Vector3<f64>>,
    pub normal_merge: Option<Vector3<f64>>,
}

impl MapPoint {
    pub fn new(id: MapPointId, map_id: MapId, position: Vector3<f64>, reference_kf: KeyFrameId) -> Self {
        Self {
            id,
            map_id,
            position,
            normal: Vector3::zeros(),
            min_distance: 0.0,
            max_distance: f64::INFINITY,
            observations: HashMap::new(),
            reference_kf,
            is_bad: false,
            corrected_by_kf: None,
            corrected_reference: None,
            pos_gba: None,
            ba_global_for: None,
            pos_merge: None,
            normal_merge: None,
        }
    }

    pub fn world_pos(&self) -> Vector3<f64> {
        self.position
    }

    pub fn set_world_pos(&mut self, pos: Vector3<f64>) {
        self.position = pos;
    }

    pub fn normal(&self) -> Vector3<f64> {
        self.normal
    }

    pub fn set_normal(&mut self, normal: Vector3<f64>) {
        self.normal = normal;
    }

    pub fn reference_keyframe(&self) -> KeyFrameId {
        self.reference_kf
    }

    pub fn set_reference_keyframe(&mut self, kf: KeyFrameId) {
        self.reference_kf = kf;
    }

    pub fn observations(&self) -> &HashMap<KeyFrameId, usize> {
        &self.observations
    }

    pub fn num_observations(&self) -> usize {
        self.observations.len()
    }

    pub fn is_observed_by(&self, kf: KeyFrameId) -> bool {
        self.observations.contains_key(&kf)
    }

    pub fn observation_slot(&self, kf: KeyFrameId) -> Option<usize> {
        self.observations.get(&kf).copied()
    }

    pub fn add_observation(&mut self, kf: KeyFrameId, slot: usize) {
        self.observations.insert(kf, slot);
    }

    /// Remove an observation. Returns true if it existed.
    pub fn erase_observation(&mut self, kf: KeyFrameId) -> bool {
        let removed = self.observations.remove(&kf).is_some();
        if removed && self.reference_kf == kf {
            if let Some(&next_ref) = self.observations.keys().min() {
                self.reference_kf = next_ref;
            }
        }
        removed
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

    #[test]
    fn test_observation_bookkeeping() {
        let mut mp = MapPoint::new(
            MapPointId::new(0),
            MapId::new(0),
            Vector3::new(1.0, 2.0, 3.0),
            KeyFrameId::new(1),
        );
        mp.add_observation(KeyFrameId::new(1), 4);
        mp.add_observation(KeyFrameId::new(2), 7);

        assert_eq!(mp.num_observations(), 2);
        assert_eq!(mp.observation_slot(KeyFrameId::new(2)), Some(7));
        assert!(mp.erase_observation(KeyFrameId::new(2)));
        assert!(!mp.erase_observation(KeyFrameId::new(2)));
    }

    #[test]
    fn test_reference_moves_when_reference_observation_erased() {
        let mut mp = MapPoint::new(
            MapPointId::new(0),
            MapId::new(0),
            Vector3::zeros(),
            KeyFrameId::new(1),
        );
        mp.add_observation(KeyFrameId::new(1), 0);
        mp.add_observation(KeyFrameId::new(3), 0);
        mp.erase_observation(KeyFrameId::new(1));
        assert_eq!(mp.reference_keyframe(), KeyFrameId::new(3));
    }
}
