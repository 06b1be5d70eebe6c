//! Map — a connected set of keyframes and map points sharing a frame.
//!
//! Entities themselves live in the [`super::Atlas`]; a map is the id-set
//! plus per-map state (origin keyframes, IMU initialization stages, change
//! index). Moving a keyframe between maps is therefore a set operation, not
//! a data move.

use std::collections::HashSet;

use super::types::{KeyFrameId, MapId, MapPointId};

/// A map inside the Atlas.
#[derive(Debug, Clone)]
pub struct Map {
    pub id: MapId,

    keyframes: HashSet<KeyFrameId>,
    map_points: HashSet<MapPointId>,

    /// First keyframe(s) of the map; roots of the spanning tree.
    origin_keyframes: Vec<KeyFrameId>,

    imu_initialized: bool,
    inertial_ba1: bool,
    inertial_ba2: bool,

    /// Monotonic counter bumped on every structural change worth
    /// re-reading the map for.
    change_index: u64,
    /// Change index of the last big change (loop closure, merge, GBA).
    last_big_change_index: u64,

    is_bad: bool,
}

impl Map {
    pub fn new(id: MapId) -> Self {
        Self {
            id,
            keyframes: HashSet::new(),
            map_points: HashSet::new(),
            origin_keyframes: Vec::new(),
            imu_initialized: false,
            inertial_ba1: false,
            inertial_ba2: false,
            change_index: 0,
            last_big_change_index: 0,
            is_bad: false,
        }
    }

    // ── Membership ───────────────────────────────────────────────────────

    pub fn add_keyframe(&mut self, kf: KeyFrameId) {
        if self.keyframes.insert(kf) && self.origin_keyframes.is_empty() {
            self.origin_keyframes.push(kf);
        }
    }

    pub fn erase_keyframe(&mut self, kf: KeyFrameId) {
        self.keyframes.remove(&kf);
    }

    pub fn contains_keyframe(&self, kf: KeyFrameId) -> bool {
        self.keyframes.contains(&kf)
    }

    pub fn keyframes(&self) -> &HashSet<KeyFrameId> {
        &self.keyframes
    }

    pub fn num_keyframes(&self) -> usize {
        self.keyframes.len()
    }

    pub fn add_map_point(&mut self, mp: MapPointId) {
        self.map_points.insert(mp);
    }

    pub fn erase_map_point(&mut self, mp: MapPointId) {
        self.map_points.remove(&mp);
    }

    pub fn map_points(&self) -> &HashSet<MapPointId> {
        &self.map_points
    }

    pub fn num_map_points(&self) -> usize {
        self.map_points.len()
    }

    pub fn origin_keyframes(&self) -> &[KeyFrameId] {
        &self.origin_keyframes
    }

    pub fn set_origin_keyframe(&mut self, kf: KeyFrameId) {
        if !self.origin_keyframes.contains(&kf) {
            self.origin_keyframes.push(kf);
        }
    }

    // ── IMU initialization stages ────────────────────────────────────────

    pub fn is_imu_initialized(&self) -> bool {
        self.imu_initialized
    }

    pub fn set_imu_initialized(&mut self) {
        self.imu_initialized = true;
    }

    pub fn inertial_ba1_done(&self) -> bool {
        self.inertial_ba1
    }

    pub fn set_inertial_ba1_done(&mut self) {
        self.inertial_ba1 = true;
    }

    pub fn inertial_ba2_done(&self) -> bool {
        self.inertial_ba2
    }

    pub fn set_inertial_ba2_done(&mut self) {
        self.inertial_ba2 = true;
    }

    // ── Change tracking ──────────────────────────────────────────────────

    pub fn change_index(&self) -> u64 {
        self.change_index
    }

    pub fn increase_change_index(&mut self) {
        self.change_index += 1;
    }

    /// Record a big change (loop closure, merge, finished GBA). Readers
    /// compare against [`Map::last_big_change_index`] to detect teleports.
    pub fn inform_new_big_change(&mut self) {
        self.change_index += 1;
        self.last_big_change_index = self.change_index;
    }

    pub fn last_big_change_index(&self) -> u64 {
        self.last_big_change_index
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
    fn test_first_keyframe_becomes_origin() {
        let mut map = Map::new(MapId::new(0));
        map.add_keyframe(KeyFrameId::new(7));
        map.add_keyframe(KeyFrameId::new(8));
        assert_eq!(map.origin_keyframes(), &[KeyFrameId::new(7)]);
    }

    #[test]
    fn test_big_change_tracks_change_index() {
        let mut map = Map::new(MapId::new(0));
        map.increase_change_index();
        assert_eq!(map.last_big_change_index(), 0);
        map.inform_new_big_change();
        assert_eq!(map.change_index(), 2);
        assert_eq!(map.last_big_change_index(), 2);
    }
}
