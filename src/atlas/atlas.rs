//! Atlas — owner of all maps, keyframes and map points.
//!
//! One map is marked *current*; the tracker and local mapper operate on it.
//! Loop closing may swap the current map when a merge fuses two maps.
//!
//! The whole Atlas is guarded by a single `RwLock` at the call sites: a
//! write guard is the map-update critical section, and cross-map commits
//! (merges) are naturally atomic under it.

use std::collections::{HashMap, HashSet, VecDeque};

use nalgebra::Vector3;

use crate::geometry::SE3;

use super::keyframe::KeyFrame;
use super::keyframe_db::KeyFrameDatabase;
use super::map::Map;
use super::map_point::MapPoint;
use super::types::{KeyFrameId, MapId, MapPointId};

/// Minimum number of shared map points for a covisibility edge.
const COVISIBILITY_MIN_WEIGHT: usize = 15;

/// Multi-map container.
#[derive(Debug)]
pub struct Atlas {
    keyframes: HashMap<KeyFrameId, KeyFrame>,
    map_points: HashMap<MapPointId, MapPoint>,
    maps: HashMap<MapId, Map>,
    current_map: MapId,

    next_kf_id: u64,
    next_mp_id: u64,
    next_map_id: u64,

    /// Shared place-recognition database.
    pub keyframe_db: KeyFrameDatabase,
}

impl Atlas {
    /// Create an Atlas with a single empty current map.
    pub fn new() -> Self {
        let first = MapId::new(0);
        let mut maps = HashMap::new();
        maps.insert(first, Map::new(first));

        Self {
            keyframes: HashMap::new(),
            map_points: HashMap::new(),
            maps,
            current_map: first,
            next_kf_id: 0,
            next_mp_id: 0,
            next_map_id: 1,
            keyframe_db: KeyFrameDatabase::new(),
        }
    }

    // ── Maps ─────────────────────────────────────────────────────────────

    pub fn current_map_id(&self) -> MapId {
        self.current_map
    }

    pub fn current_map(&self) -> &Map {
        &self.maps[&self.current_map]
    }

    pub fn current_map_mut(&mut self) -> &mut Map {
        self.maps.get_mut(&self.current_map).expect("current map exists")
    }

    pub fn map(&self, id: MapId) -> Option<&Map> {
        self.maps.get(&id)
    }

    pub fn map_mut(&mut self, id: MapId) -> Option<&mut Map> {
        self.maps.get_mut(&id)
    }

    /// Create a new empty map and make it current.
    pub fn create_map(&mut self) -> MapId {
        let id = MapId::new(self.next_map_id);
        self.next_map_id += 1;
        self.maps.insert(id, Map::new(id));
        self.current_map = id;
        id
    }

    /// Switch the current map.
    pub fn change_map(&mut self, id: MapId) {
        debug_assert!(self.maps.contains_key(&id));
        self.current_map = id;
    }

    pub fn set_map_bad(&mut self, id: MapId) {
        if let Some(map) = self.maps.get_mut(&id) {
            map.set_bad();
        }
    }

    /// Number of maps not marked bad.
    pub fn count_maps(&self) -> usize {
        self.maps.values().filter(|m| !m.is_bad()).count()
    }

    /// Drop every empty map marked bad.
    pub fn remove_bad_maps(&mut self) {
        self.maps
            .retain(|&id, m| id == self.current_map || !m.is_bad() || m.num_keyframes() > 0);
    }

    /// Record a big change on a map so that readers re-localize against it.
    pub fn inform_new_big_change(&mut self, id: MapId) {
        if let Some(map) = self.maps.get_mut(&id) {
            map.inform_new_big_change();
        }
    }

    // ── Entity creation and access ───────────────────────────────────────

    /// Create a keyframe in `map_id` with `num_features` feature slots.
    pub fn create_keyframe(&mut self, map_id: MapId, pose: SE3, num_features: usize) -> KeyFrameId {
        let id = KeyFrameId::new(self.next_kf_id);
        self.next_kf_id += 1;
        self.keyframes
            .insert(id, KeyFrame::new(id, map_id, pose, num_features));
        if let Some(map) = self.maps.get_mut(&map_id) {
            map.add_keyframe(id);
        }
        id
    }

    /// Create a map point in `map_id` observed first by `reference_kf`.
    pub fn create_map_point(
        &mut self,
        map_id: MapId,
        position: Vector3<f64>,
        reference_kf: KeyFrameId,
    ) -> MapPointId {
        let id = MapPointId::new(self.next_mp_id);
        self.next_mp_id += 1;
        self.map_points
            .insert(id, MapPoint::new(id, map_id, position, reference_kf));
        if let Some(map) = self.maps.get_mut(&map_id) {
            map.add_map_point(id);
        }
        id
    }

    pub fn keyframe(&self, id: KeyFrameId) -> Option<&KeyFrame> {
        self.keyframes.get(&id)
    }

    pub fn keyframe_mut(&mut self, id: KeyFrameId) -> Option<&mut KeyFrame> {
        self.keyframes.get_mut(&id)
    }

    pub fn map_point(&self, id: MapPointId) -> Option<&MapPoint> {
        self.map_points.get(&id)
    }

    pub fn map_point_mut(&mut self, id: MapPointId) -> Option<&mut MapPoint> {
        self.map_points.get_mut(&id)
    }

    /// All keyframes of a map, unordered.
    pub fn all_keyframes(&self, map_id: MapId) -> Vec<KeyFrameId> {
        self.maps
            .get(&map_id)
            .map(|m| m.keyframes().iter().copied().collect())
            .unwrap_or_default()
    }

    /// All map points of a map, unordered.
    pub fn all_map_points(&self, map_id: MapId) -> Vec<MapPointId> {
        self.maps
            .get(&map_id)
            .map(|m| m.map_points().iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn keyframes_in_map(&self, map_id: MapId) -> usize {
        self.maps.get(&map_id).map(|m| m.num_keyframes()).unwrap_or(0)
    }

    // ── Associations ─────────────────────────────────────────────────────

    /// Bind a keyframe feature slot to a map point (both directions).
    pub fn associate(&mut self, kf_id: KeyFrameId, slot: usize, mp_id: MapPointId) -> bool {
        if !self.map_points.contains_key(&mp_id) {
            return false;
        }
        match self.keyframes.get_mut(&kf_id) {
            Some(kf) => {
                kf.set_map_point(slot, mp_id);
            }
            None => return false,
        }
        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            mp.add_observation(kf_id, slot);
        }
        true
    }

    /// Distinct map points observed by a set of keyframes.
    pub fn map_points_of(&self, kfs: &[KeyFrameId]) -> Vec<MapPointId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &kf_id in kfs {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                for (_, mp_id) in kf.map_point_matches() {
                    if self
                        .map_points
                        .get(&mp_id)
                        .map_or(false, |mp| !mp.is_bad())
                        && seen.insert(mp_id)
                    {
                        out.push(mp_id);
                    }
                }
            }
        }
        out
    }

    // ── Covisibility and spanning tree ───────────────────────────────────

    /// Recompute the covisibility edges of a keyframe from the current
    /// observations, mirror them into the neighbors, and wire the keyframe
    /// into the spanning tree on its first connection.
    pub fn update_connections(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };

        // Count shared observations per neighbor.
        let mut counters: HashMap<KeyFrameId, usize> = HashMap::new();
        for (_, mp_id) in kf.map_point_matches() {
            let Some(mp) = self.map_points.get(&mp_id) else {
                continue;
            };
            if mp.is_bad() {
                continue;
            }
            for (&other, _) in mp.observations() {
                if other != kf_id {
                    *counters.entry(other).or_insert(0) += 1;
                }
            }
        }

        // Keep edges above threshold; if none qualifies, keep the best one.
        let mut weights: HashMap<KeyFrameId, usize> = counters
            .iter()
            .filter(|(_, &w)| w >= COVISIBILITY_MIN_WEIGHT)
            .map(|(&id, &w)| (id, w))
            .collect();
        let best = counters
            .iter()
            .max_by_key(|&(&id, &w)| (w, std::cmp::Reverse(id)))
            .map(|(&id, &w)| (id, w));
        if weights.is_empty() {
            if let Some((id, w)) = best {
                weights.insert(id, w);
            }
        }

        // Mirror into neighbors.
        for (&other, &w) in &weights {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.set_covisibility_weight(kf_id, w);
            }
        }
        // Drop stale mirrored edges.
        let old_neighbors = self.keyframes[&kf_id].connected_keyframes();
        for other in old_neighbors {
            if !weights.contains_key(&other) {
                if let Some(other_kf) = self.keyframes.get_mut(&other) {
                    other_kf.erase_covisibility(kf_id);
                }
            }
        }

        let first_connection = {
            let kf = self.keyframes.get_mut(&kf_id).expect("checked above");
            kf.replace_covisibility(weights);
            kf.first_connection && kf.parent().is_none()
        };

        // On first connection, graft under the strongest neighbor.
        if first_connection {
            let is_origin = self
                .maps
                .get(&self.keyframes[&kf_id].map_id)
                .map_or(false, |m| m.origin_keyframes().contains(&kf_id));
            if !is_origin {
                if let Some((parent, _)) = best {
                    if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                        kf.change_parent(parent);
                        kf.first_connection = false;
                    }
                    if let Some(parent_kf) = self.keyframes.get_mut(&parent) {
                        parent_kf.add_child(kf_id);
                    }
                }
            }
        }
    }

    // ── Replacement and removal ──────────────────────────────────────────

    /// Replace `old` by `new`: every observation of `old` is redirected to
    /// `new` unless the keyframe already observes `new`, then `old` is
    /// marked bad and dropped from its map.
    pub fn replace_map_point(&mut self, old: MapPointId, new: MapPointId) {
        if old == new || !self.map_points.contains_key(&new) {
            return;
        }
        let Some(old_mp) = self.map_points.get(&old) else {
            return;
        };
        let observations: Vec<(KeyFrameId, usize)> =
            old_mp.observations().iter().map(|(&k, &s)| (k, s)).collect();
        let old_map = old_mp.map_id;

        for (kf_id, slot) in observations {
            let already_seen = self
                .map_points
                .get(&new)
                .map_or(false, |mp| mp.is_observed_by(kf_id));

            if already_seen {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    if kf.map_point(slot) == Some(old) {
                        kf.erase_map_point(slot);
                    }
                }
            } else {
                if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                    kf.set_map_point(slot, new);
                }
                if let Some(mp) = self.map_points.get_mut(&new) {
                    mp.add_observation(kf_id, slot);
                }
            }
        }

        if let Some(mp) = self.map_points.get_mut(&old) {
            mp.set_bad();
        }
        if let Some(map) = self.maps.get_mut(&old_map) {
            map.erase_map_point(old);
        }
        self.map_points.remove(&old);
        self.update_normal_and_depth(new);
    }

    /// Erase a map point everywhere.
    pub fn erase_map_point(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let observations: Vec<(KeyFrameId, usize)> =
            mp.observations().iter().map(|(&k, &s)| (k, s)).collect();
        let map_id = mp.map_id;

        for (kf_id, slot) in observations {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                if kf.map_point(slot) == Some(mp_id) {
                    kf.erase_map_point(slot);
                }
            }
        }
        if let Some(map) = self.maps.get_mut(&map_id) {
            map.erase_map_point(mp_id);
        }
        self.map_points.remove(&mp_id);
    }

    /// Pin a keyframe against erasure.
    pub fn set_not_erase(&mut self, kf_id: KeyFrameId) {
        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_not_erase();
        }
    }

    /// Release one pin; performs a deferred erase if one is pending and
    /// this was the last pin.
    pub fn set_erase(&mut self, kf_id: KeyFrameId) {
        let erase_now = self
            .keyframes
            .get_mut(&kf_id)
            .map_or(false, |kf| kf.set_erase());
        if erase_now {
            self.erase_keyframe(kf_id);
        }
    }

    /// Request erasure of a keyframe. Pinned keyframes are erased at their
    /// final unpin; keyframes holding loop edges are never erased.
    pub fn request_erase_keyframe(&mut self, kf_id: KeyFrameId) {
        let erase_now = match self.keyframes.get_mut(&kf_id) {
            Some(kf) => {
                if !kf.loop_edges().is_empty() {
                    return;
                }
                kf.request_erase()
            }
            None => false,
        };
        if erase_now {
            self.erase_keyframe(kf_id);
        }
    }

    /// Remove a keyframe, cleaning observations, covisibility and the
    /// spanning tree (children are reparented to the grandparent).
    fn erase_keyframe(&mut self, kf_id: KeyFrameId) {
        let Some(kf) = self.keyframes.get(&kf_id) else {
            return;
        };
        let map_id = kf.map_id;
        let slots: Vec<(usize, MapPointId)> = kf.map_point_matches().collect();
        let neighbors = kf.connected_keyframes();
        let parent = kf.parent();
        let children: Vec<KeyFrameId> = kf.children().iter().copied().collect();

        for (_, mp_id) in slots {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.erase_observation(kf_id);
            }
        }
        for other in neighbors {
            if let Some(other_kf) = self.keyframes.get_mut(&other) {
                other_kf.erase_covisibility(kf_id);
            }
        }
        if let Some(parent_id) = parent {
            if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                parent_kf.erase_child(kf_id);
            }
            for child in &children {
                if let Some(child_kf) = self.keyframes.get_mut(child) {
                    child_kf.change_parent(parent_id);
                }
                if let Some(parent_kf) = self.keyframes.get_mut(&parent_id) {
                    parent_kf.add_child(*child);
                }
            }
        } else if let Some((&new_root, rest)) = children.split_first() {
            if let Some(root_kf) = self.keyframes.get_mut(&new_root) {
                root_kf.clear_parent();
            }
            for child in rest {
                if let Some(child_kf) = self.keyframes.get_mut(child) {
                    child_kf.change_parent(new_root);
                }
                if let Some(root_kf) = self.keyframes.get_mut(&new_root) {
                    root_kf.add_child(*child);
                }
            }
        }

        if let Some(kf) = self.keyframes.get_mut(&kf_id) {
            kf.set_bad();
        }
        if let Some(map) = self.maps.get_mut(&map_id) {
            map.erase_keyframe(kf_id);
        }
        self.keyframe_db.erase(kf_id);
        self.keyframes.remove(&kf_id);
    }

    // ── Geometry maintenance ─────────────────────────────────────────────

    /// Recompute a map point's mean viewing direction and distance bounds
    /// from its current observations.
    pub fn update_normal_and_depth(&mut self, mp_id: MapPointId) {
        let Some(mp) = self.map_points.get(&mp_id) else {
            return;
        };
        let pos = mp.world_pos();
        let reference = mp.reference_keyframe();

        let mut normal = Vector3::zeros();
        let mut n = 0usize;
        for (&kf_id, _) in mp.observations() {
            if let Some(kf) = self.keyframes.get(&kf_id) {
                let dir = pos - kf.camera_center();
                let norm = dir.norm();
                if norm > 1e-12 {
                    normal += dir / norm;
                    n += 1;
                }
            }
        }
        let ref_dist = self
            .keyframes
            .get(&reference)
            .map(|kf| (pos - kf.camera_center()).norm());

        if let Some(mp) = self.map_points.get_mut(&mp_id) {
            if n > 0 {
                mp.set_normal(normal / n as f64);
            }
            if let Some(dist) = ref_dist {
                mp.min_distance = dist / 1.2;
                mp.max_distance = dist * 1.2;
            }
        }
    }

    /// Re-express an entire map in a new world frame: every pose, velocity
    /// and point is rotated by `t_yw` and scaled by `s`.
    ///
    /// Used by the inertial merge, where the IMU-observed frame of the
    /// active map is authoritative and the map itself is moved.
    pub fn apply_scaled_rotation(&mut self, map_id: MapId, t_yw: &SE3, s: f64, scale_velocity: bool) {
        let kf_ids = self.all_keyframes(map_id);
        let mp_ids = self.all_map_points(map_id);
        let r_yw = t_yw.rotation;
        let t_yw_t = t_yw.translation;

        for kf_id in kf_ids {
            if let Some(kf) = self.keyframes.get_mut(&kf_id) {
                // T_cy = (T_yw * T_wc_scaled)⁻¹ with the camera center scaled.
                let mut t_wc = kf.pose_inverse();
                t_wc.translation *= s;
                let t_yc = t_yw.compose(&t_wc);
                kf.set_pose(t_yc.inverse());

                if let Some(v) = kf.velocity() {
                    let rotated = r_yw * v;
                    kf.set_velocity(if scale_velocity { rotated * s } else { rotated });
                }
            }
        }
        for mp_id in mp_ids {
            if let Some(mp) = self.map_points.get_mut(&mp_id) {
                mp.set_world_pos(s * (r_yw * mp.world_pos()) + t_yw_t);
            }
            self.update_normal_and_depth(mp_id);
        }
    }

    // ── Traversal helpers ────────────────────────────────────────────────

    /// Breadth-first order over the spanning tree from the map origins.
    pub fn spanning_tree_bfs(&self, map_id: MapId) -> Vec<KeyFrameId> {
        let Some(map) = self.maps.get(&map_id) else {
            return Vec::new();
        };
        let mut queue: VecDeque<KeyFrameId> = map.origin_keyframes().iter().copied().collect();
        let mut visited: HashSet<KeyFrameId> = queue.iter().copied().collect();
        let mut order = Vec::new();

        while let Some(kf_id) = queue.pop_front() {
            order.push(kf_id);
            if let Some(kf) = self.keyframes.get(&kf_id) {
                for &child in kf.children() {
                    if visited.insert(child) {
                        queue.push_back(child);
                    }
                }
            }
        }
        order
    }
}

impl Default for Atlas {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atlas_with_two_kfs() -> (Atlas, KeyFrameId, KeyFrameId, MapPointId) {
        let mut atlas = Atlas::new();
        let m = atlas.current_map_id();
        let kf1 = atlas.create_keyframe(m, SE3::identity(), 10);
        let kf2 = atlas.create_keyframe(m, SE3::identity(), 10);
        let mp = atlas.create_map_point(m, Vector3::new(0.0, 0.0, 5.0), kf1);
        atlas.associate(kf1, 0, mp);
        atlas.associate(kf2, 0, mp);
        (atlas, kf1, kf2, mp)
    }

    #[test]
    fn test_associate_links_both_directions() {
        let (atlas, kf1, kf2, mp) = atlas_with_two_kfs();
        assert_eq!(atlas.keyframe(kf1).unwrap().map_point(0), Some(mp));
        assert!(atlas.map_point(mp).unwrap().is_observed_by(kf2));
        assert_eq!(atlas.map_point(mp).unwrap().num_observations(), 2);
    }

    #[test]
    fn test_update_connections_keeps_best_edge_below_threshold() {
        let (mut atlas, kf1, kf2, _) = atlas_with_two_kfs();
        // Only one shared point, below the 15-point threshold, so the best
        // edge is kept as the single connection.
        atlas.update_connections(kf1);
        assert_eq!(atlas.keyframe(kf1).unwrap().covisibility_weight(kf2), 1);
        assert_eq!(atlas.keyframe(kf2).unwrap().covisibility_weight(kf1), 1);
    }

    #[test]
    fn test_first_connection_sets_parent() {
        let (mut atlas, kf1, kf2, _) = atlas_with_two_kfs();
        atlas.update_connections(kf2);
        assert_eq!(atlas.keyframe(kf2).unwrap().parent(), Some(kf1));
        assert!(atlas.keyframe(kf1).unwrap().children().contains(&kf2));
        // kf1 is the map origin and stays a root.
        atlas.update_connections(kf1);
        assert_eq!(atlas.keyframe(kf1).unwrap().parent(), None);
    }

    #[test]
    fn test_replace_map_point_redirects_observations() {
        let (mut atlas, kf1, kf2, mp) = atlas_with_two_kfs();
        let m = atlas.current_map_id();
        let other = atlas.create_map_point(m, Vector3::new(0.1, 0.0, 5.0), kf2);
        atlas.associate(kf2, 3, other);

        atlas.replace_map_point(other, mp);

        assert!(atlas.map_point(other).is_none());
        assert_eq!(atlas.keyframe(kf2).unwrap().map_point(3), None); // kf2 already saw mp
        assert!(atlas.map_point(mp).unwrap().is_observed_by(kf1));
    }

    #[test]
    fn test_replace_map_point_moves_fresh_observers() {
        let (mut atlas, _kf1, _kf2, mp) = atlas_with_two_kfs();
        let m = atlas.current_map_id();
        let kf3 = atlas.create_keyframe(m, SE3::identity(), 10);
        let lone = atlas.create_map_point(m, Vector3::new(0.2, 0.0, 4.0), kf3);
        atlas.associate(kf3, 5, lone);

        atlas.replace_map_point(lone, mp);

        assert_eq!(atlas.keyframe(kf3).unwrap().map_point(5), Some(mp));
        assert!(atlas.map_point(mp).unwrap().is_observed_by(kf3));
    }

    #[test]
    fn test_pinned_keyframe_survives_erase_request() {
        let (mut atlas, _, kf2, mp) = atlas_with_two_kfs();
        atlas.set_not_erase(kf2);
        atlas.request_erase_keyframe(kf2);
        assert!(atlas.keyframe(kf2).is_some());
        assert!(atlas.map_point(mp).unwrap().is_observed_by(kf2));

        atlas.set_erase(kf2);
        assert!(atlas.keyframe(kf2).is_none());
        assert!(!atlas.map_point(mp).unwrap().is_observed_by(kf2));
    }

    #[test]
    fn test_erase_reparents_children() {
        let mut atlas = Atlas::new();
        let m = atlas.current_map_id();
        let root = atlas.create_keyframe(m, SE3::identity(), 4);
        let mid = atlas.create_keyframe(m, SE3::identity(), 4);
        let leaf = atlas.create_keyframe(m, SE3::identity(), 4);
        atlas.keyframe_mut(mid).unwrap().change_parent(root);
        atlas.keyframe_mut(root).unwrap().add_child(mid);
        atlas.keyframe_mut(leaf).unwrap().change_parent(mid);
        atlas.keyframe_mut(mid).unwrap().add_child(leaf);

        atlas.request_erase_keyframe(mid);

        assert_eq!(atlas.keyframe(leaf).unwrap().parent(), Some(root));
        assert!(atlas.keyframe(root).unwrap().children().contains(&leaf));
    }

    #[test]
    fn test_apply_scaled_rotation_identity_scales_centers() {
        let mut atlas = Atlas::new();
        let m = atlas.current_map_id();
        let kf = atlas.create_keyframe(
            m,
            SE3::from_parts(nalgebra::UnitQuaternion::identity(), Vector3::new(0.0, 0.0, -2.0)),
            4,
        );
        let mp = atlas.create_map_point(m, Vector3::new(1.0, 0.0, 3.0), kf);
        atlas.associate(kf, 0, mp);

        atlas.apply_scaled_rotation(m, &SE3::identity(), 2.0, false);

        let center = atlas.keyframe(kf).unwrap().camera_center();
        approx::assert_relative_eq!(center, Vector3::new(0.0, 0.0, 4.0), epsilon = 1e-9);
        approx::assert_relative_eq!(
            atlas.map_point(mp).unwrap().world_pos(),
            Vector3::new(2.0, 0.0, 6.0),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_spanning_tree_bfs_order() {
        let mut atlas = Atlas::new();
        let m = atlas.current_map_id();
        let root = atlas.create_keyframe(m, SE3::identity(), 4);
        let a = atlas.create_keyframe(m, SE3::identity(), 4);
        let b = atlas.create_keyframe(m, SE3::identity(), 4);
        atlas.keyframe_mut(a).unwrap().change_parent(root);
        atlas.keyframe_mut(root).unwrap().add_child(a);
        atlas.keyframe_mut(b).unwrap().change_parent(a);
        atlas.keyframe_mut(a).unwrap().add_child(b);

        assert_eq!(atlas.spanning_tree_bfs(m), vec![root, a, b]);
    }
}
