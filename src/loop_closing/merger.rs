//! Map merging: fusing two maps of the Atlas around a detected common
//! region.
//!
//! **Visual variant**: the merge map becomes the new active map. The local
//! window around the current keyframe is re-expressed in the merge map's
//! frame through shadow fields and committed atomically; the rest of the
//! old map follows after the welding bundle adjustment.
//!
//! **Visual-inertial variant**: the IMU makes the active map's frame
//! authoritative, so the strategy inverts — the whole active map is
//! rotated/scaled onto the other map's frame and the other map's entities
//! migrate into it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use crate::atlas::{Atlas, KeyFrameId, MapId, MapPointId};
use crate::geometry::{Sim3, SE3};
use crate::sensor::Sensor;

use super::corrector::{search_and_fuse, search_and_fuse_se3};
use super::loop_closer::WorkerCtx;

/// Target size of the welding windows in the visual merge.
const WINDOW_KEYFRAMES: usize = 25;
/// Expansion rounds allowed to reach the target size.
const WINDOW_EXPANSION_ROUNDS: usize = 5;
/// Welding window cap per side in the inertial merge.
const INERTIAL_WINDOW_KEYFRAMES: usize = 6;
/// Fuse-candidate cap in the inertial merge.
const INERTIAL_FUSE_CANDIDATES: usize = 1000;
/// Below this size the merged inertial map carries too little information
/// to propagate through a welding BA.
const MIN_KEYFRAMES_FOR_INERTIAL_BA: usize = 10;
/// Above this size an IMU-initialized map skips the relaunched global BA.
const MAX_KEYFRAMES_FOR_GBA: usize = 200;

/// Visual merge: pull the local window of the active map into the merge
/// map, then migrate the leftovers.
pub(crate) fn merge_local(
    ctx: &WorkerCtx,
    current: KeyFrameId,
    matched: KeyFrameId,
    merge_scw: &Sim3,
) {
    tracing::info!("merging maps (visual) around {current} -> {matched}");

    let relaunch_ba = ctx.gba.is_running();
    ctx.gba.abort_if_running();

    ctx.mapper.request_stop();
    while !ctx.mapper.is_stopped() {
        thread::sleep(Duration::from_millis(1));
    }
    ctx.mapper.empty_queue();

    let (current_map, merge_map) = {
        let atlas = ctx.atlas.read();
        let (Some(kf_c), Some(kf_m)) = (atlas.keyframe(current), atlas.keyframe(matched)) else {
            ctx.mapper.release();
            return;
        };
        (kf_c.map_id, kf_m.map_id)
    };

    // Pre-merge camera-to-world of the current keyframe; the leftover
    // correction after the welding BA still propagates through it.
    let t_wc_before = {
        let atlas = ctx.atlas.read();
        atlas.keyframe(current).expect("checked above").pose_inverse()
    };

    let imu_initialized = {
        let atlas = ctx.atlas.read();
        atlas.map(current_map).map_or(false, |m| m.is_imu_initialized())
    };

    let (local_window, merge_window, fuse_candidates, corrected) = {
        let mut atlas = ctx.atlas.write();
        atlas.update_connections(current);

        let local_window = build_window(&atlas, current);
        let merge_window = build_window(&atlas, matched);
        let local_points = atlas.map_points_of(&local_window);
        let fuse_candidates = atlas.map_points_of(&merge_window);

        // Plan: corrected similarity per local keyframe, staged in shadow
        // fields without touching live state.
        let mut corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        let mut non_corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        for &kf_id in &local_window {
            let Some(kf) = atlas.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() {
                continue;
            }
            let t_iw = kf.pose().clone();
            non_corrected.insert(kf_id, Sim3::from_se3(&t_iw));
            let corrected_siw = if kf_id == current {
                merge_scw.clone()
            } else {
                let t_ic = t_iw.compose(&t_wc_before);
                Sim3::from_se3(&t_ic).compose(merge_scw)
            };
            corrected.insert(kf_id, corrected_siw);
        }

        for &kf_id in &local_window {
            let Some(siw) = corrected.get(&kf_id) else {
                continue;
            };
            let staged_pose = siw.to_se3_scaled();
            let staged_vel = if imu_initialized {
                let rot_correction = siw.rotation.inverse() * non_corrected[&kf_id].rotation;
                atlas
                    .keyframe(kf_id)
                    .and_then(|kf| kf.velocity())
                    .map(|v| rot_correction * v)
            } else {
                None
            };
            if let Some(kf) = atlas.keyframe_mut(kf_id) {
                kf.pose_merge = Some(staged_pose);
                kf.vel_merge = staged_vel;
            }
        }

        for &mp_id in &local_points {
            let Some(mp) = atlas.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad() {
                continue;
            }
            // A point whose reference keyframe is outside the window stays
            // behind and is corrected with the leftovers.
            let Some(siw) = corrected.get(&mp.reference_keyframe()) else {
                continue;
            };
            let swi = siw.inverse();
            let non_corrected_siw = &non_corrected[&mp.reference_keyframe()];
            let staged =
                swi.transform_point(&non_corrected_siw.transform_point(&mp.world_pos()));
            let rot_correction = swi.rotation * non_corrected_siw.rotation;
            let staged_normal = rot_correction * mp.normal();
            if let Some(mp) = atlas.map_point_mut(mp_id) {
                mp.pos_merge = Some(staged);
                mp.normal_merge = Some(staged_normal);
            }
        }

        // Commit: shadow fields go live and the window changes ownership.
        for &kf_id in &local_window {
            let Some(kf) = atlas.keyframe_mut(kf_id) else {
                continue;
            };
            if kf.is_bad() || kf.pose_merge.is_none() {
                continue;
            }
            kf.pose_before_merge = Some(kf.pose().clone());
            let staged = kf.pose_merge.clone().expect("staged above");
            kf.set_pose(staged);
            kf.merge_corrected_for = Some(current);
            if let Some(vel) = kf.vel_merge {
                kf.set_velocity(vel);
            }
            kf.map_id = merge_map;
            if let Some(map) = atlas.map_mut(merge_map) {
                map.add_keyframe(kf_id);
            }
            if let Some(map) = atlas.map_mut(current_map) {
                map.erase_keyframe(kf_id);
            }
        }
        for &mp_id in &local_points {
            let Some(mp) = atlas.map_point_mut(mp_id) else {
                continue;
            };
            if mp.is_bad() || mp.pos_merge.is_none() {
                continue;
            }
            if let Some(pos) = mp.pos_merge.take() {
                mp.set_world_pos(pos);
            }
            if let Some(normal) = mp.normal_merge.take() {
                mp.set_normal(normal);
            }
            mp.map_id = merge_map;
            if let Some(map) = atlas.map_mut(merge_map) {
                map.add_map_point(mp_id);
            }
            if let Some(map) = atlas.map_mut(current_map) {
                map.erase_map_point(mp_id);
            }
        }

        atlas.change_map(merge_map);
        atlas.set_map_bad(current_map);
        if let Some(map) = atlas.map_mut(merge_map) {
            map.increase_change_index();
        }

        // Weld the spanning trees: the parent chain above the current
        // keyframe is reversed and the current keyframe grafts under the
        // matched one.
        if let Some(&origin) = atlas
            .map(current_map)
            .and_then(|m| m.origin_keyframes().first())
        {
            if let Some(kf) = atlas.keyframe_mut(origin) {
                kf.first_connection = false;
            }
        }
        reverse_parent_chain(&mut atlas, current, matched);

        atlas.update_connections(matched);

        (local_window, merge_window, fuse_candidates, corrected)
    };

    // Fuse duplicated landmarks between both windows.
    search_and_fuse(ctx, &corrected, &fuse_candidates);

    {
        let mut atlas = ctx.atlas.write();
        for &kf_id in local_window.iter().chain(&merge_window) {
            if atlas.keyframe(kf_id).map_or(false, |kf| !kf.is_bad()) {
                atlas.update_connections(kf_id);
            }
        }
    }

    // Welding bundle adjustment over both windows.
    {
        let stop = AtomicBool::new(false);
        let mut atlas = ctx.atlas.write();
        if ctx.config.sensor.is_inertial() {
            ctx.optimizer
                .merge_inertial_ba(&mut atlas, current, matched, merge_map, &stop);
        } else {
            ctx.optimizer.local_bundle_adjustment(
                &mut atlas,
                current,
                &local_window,
                &merge_window,
                &stop,
            );
        }
    }

    ctx.mapper.release();

    migrate_leftovers(
        ctx,
        current,
        current_map,
        merge_map,
        merge_scw,
        &t_wc_before,
        &local_window,
        &merge_window,
    );

    if relaunch_ba {
        let launch = {
            let atlas = ctx.atlas.read();
            let imu = atlas.map(merge_map).map_or(false, |m| m.is_imu_initialized());
            !imu || (atlas.keyframes_in_map(merge_map) < MAX_KEYFRAMES_FOR_GBA
                && atlas.count_maps() == 1)
        };
        if launch {
            ctx.gba.launch(
                ctx.atlas.clone(),
                ctx.optimizer.clone(),
                ctx.mapper.clone(),
                merge_map,
                current,
            );
        }
    }

    {
        let mut atlas = ctx.atlas.write();
        if let Some(kf) = atlas.keyframe_mut(matched) {
            kf.add_merge_edge(current);
        }
        if let Some(kf) = atlas.keyframe_mut(current) {
            kf.add_merge_edge(matched);
        }
        if let Some(map) = atlas.map_mut(current_map) {
            map.increase_change_index();
        }
        if let Some(map) = atlas.map_mut(merge_map) {
            map.increase_change_index();
        }
        atlas.inform_new_big_change(merge_map);
        atlas.remove_bad_maps();
    }

    tracing::info!("visual merge finished, active map is now {merge_map}");
}

/// Correct and migrate whatever the old map still holds outside the
/// welding window.
#[allow(clippy::too_many_arguments)]
fn migrate_leftovers(
    ctx: &WorkerCtx,
    current: KeyFrameId,
    current_map: MapId,
    merge_map: MapId,
    merge_scw: &Sim3,
    t_wc_before: &SE3,
    local_window: &[KeyFrameId],
    merge_window: &[KeyFrameId],
) {
    let outside_kfs = {
        let atlas = ctx.atlas.read();
        atlas.all_keyframes(current_map)
    };
    let outside_mps = {
        let atlas = ctx.atlas.read();
        atlas.all_map_points(current_map)
    };
    if outside_kfs.is_empty() && outside_mps.is_empty() {
        return;
    }

    if ctx.config.sensor == Sensor::Monocular {
        // Scale drift is the dominant error; the closed-form correction is
        // applied directly to the leftovers.
        let mut atlas = ctx.atlas.write();
        let mut corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        let mut non_corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();

        for &kf_id in &outside_kfs {
            let Some(kf) = atlas.keyframe(kf_id) else {
                continue;
            };
            if kf.is_bad() || kf.map_id != current_map {
                continue;
            }
            let t_iw = kf.pose().clone();
            let siw = Sim3::from_se3(&t_iw);
            let t_ic = t_iw.compose(t_wc_before);
            let corrected_siw = Sim3::from_se3(&t_ic).compose(merge_scw);

            non_corrected.insert(kf_id, siw);
            corrected.insert(kf_id, corrected_siw.clone());

            if let Some(kf) = atlas.keyframe_mut(kf_id) {
                kf.pose_before_merge = Some(kf.pose().clone());
                kf.set_pose(corrected_siw.to_se3_scaled());
            }
        }

        for &mp_id in &outside_mps {
            let Some(mp) = atlas.map_point(mp_id) else {
                continue;
            };
            if mp.is_bad() || mp.map_id != current_map {
                continue;
            }
            let reference = mp.reference_keyframe();
            let (Some(siw_corr), Some(siw)) =
                (corrected.get(&reference), non_corrected.get(&reference))
            else {
                continue;
            };
            let pos = mp.world_pos();
            let moved = siw_corr
                .inverse()
                .transform_point(&siw.transform_point(&pos));
            if let Some(mp) = atlas.map_point_mut(mp_id) {
                mp.set_world_pos(moved);
            }
            atlas.update_normal_and_depth(mp_id);
        }
    }

    ctx.mapper.request_stop();
    while !ctx.mapper.is_stopped() {
        thread::sleep(Duration::from_millis(1));
    }

    if ctx.config.sensor != Sensor::Monocular {
        let mut atlas = ctx.atlas.write();
        ctx.optimizer.optimize_essential_graph_partial(
            &mut atlas,
            current,
            merge_window,
            local_window,
            &outside_kfs,
            &outside_mps,
        );
    }

    {
        let mut atlas = ctx.atlas.write();
        for &kf_id in &outside_kfs {
            let moved = match atlas.keyframe_mut(kf_id) {
                Some(kf) if !kf.is_bad() && kf.map_id == current_map => {
                    kf.map_id = merge_map;
                    true
                }
                _ => false,
            };
            if moved {
                if let Some(map) = atlas.map_mut(merge_map) {
                    map.add_keyframe(kf_id);
                }
                if let Some(map) = atlas.map_mut(current_map) {
                    map.erase_keyframe(kf_id);
                }
            }
        }
        for &mp_id in &outside_mps {
            let moved = match atlas.map_point_mut(mp_id) {
                Some(mp) if !mp.is_bad() => {
                    mp.map_id = merge_map;
                    true
                }
                _ => false,
            };
            if moved {
                if let Some(map) = atlas.map_mut(merge_map) {
                    map.add_map_point(mp_id);
                }
                if let Some(map) = atlas.map_mut(current_map) {
                    map.erase_map_point(mp_id);
                }
            }
        }
    }

    ctx.mapper.release();
}

/// Visual-inertial merge: re-express the active map in the matched map's
/// frame and absorb the matched map.
pub(crate) fn merge_local2(
    ctx: &WorkerCtx,
    current: KeyFrameId,
    matched: KeyFrameId,
    s_old_new: &Sim3,
) {
    tracing::info!("merging maps (inertial) around {current} -> {matched}");

    ctx.gba.abort_if_running();
    ctx.mapper.request_stop();
    while !ctx.mapper.is_stopped() {
        thread::sleep(Duration::from_millis(1));
    }

    let (current_map, merge_map) = {
        let atlas = ctx.atlas.read();
        let (Some(kf_c), Some(kf_m)) = (atlas.keyframe(current), atlas.keyframe(matched)) else {
            ctx.mapper.release();
            return;
        };
        (kf_c.map_id, kf_m.map_id)
    };

    ctx.mapper.empty_queue();

    // The IMU frame of the active map is authoritative: move the whole
    // active map instead of the welding window.
    {
        let mut atlas = ctx.atlas.write();
        let s = s_old_new.scale;
        let t_on = s_old_new.to_se3();
        atlas.apply_scaled_rotation(current_map, &t_on, s, s != 1.0);

        let bias = atlas
            .keyframe(current)
            .map(|kf| kf.imu_bias())
            .unwrap_or_default();
        ctx.tracker.update_frame_imu(s, bias, ctx.tracker.last_keyframe());
    }

    let num_kf_new = {
        let atlas = ctx.atlas.read();
        atlas.keyframes_in_map(current_map)
    };

    // An incompletely initialized map gets its biases re-estimated before
    // absorbing the other map.
    let needs_imu_init = {
        let atlas = ctx.atlas.read();
        ctx.config.sensor.is_inertial()
            && atlas.map(current_map).map_or(false, |m| !m.inertial_ba2_done())
    };
    if needs_imu_init {
        let bias = {
            let mut atlas = ctx.atlas.write();
            ctx.optimizer.inertial_optimization(&mut atlas, current_map)
        };
        let mut atlas = ctx.atlas.write();
        ctx.tracker.update_frame_imu(1.0, bias, ctx.tracker.last_keyframe());
        if let Some(map) = atlas.map_mut(current_map) {
            map.set_inertial_ba2_done();
            map.set_inertial_ba1_done();
            map.set_imu_initialized();
        }
    }

    // Absorb the matched map wholesale.
    {
        let mut atlas = ctx.atlas.write();
        for kf_id in atlas.all_keyframes(merge_map) {
            let ok = match atlas.keyframe_mut(kf_id) {
                Some(kf) if !kf.is_bad() && kf.map_id == merge_map => {
                    kf.map_id = current_map;
                    true
                }
                _ => false,
            };
            if ok {
                if let Some(map) = atlas.map_mut(current_map) {
                    map.add_keyframe(kf_id);
                }
                if let Some(map) = atlas.map_mut(merge_map) {
                    map.erase_keyframe(kf_id);
                }
            }
        }
        for mp_id in atlas.all_map_points(merge_map) {
            let ok = match atlas.map_point_mut(mp_id) {
                Some(mp) if !mp.is_bad() && mp.map_id == merge_map => {
                    mp.map_id = current_map;
                    true
                }
                _ => false,
            };
            if ok {
                if let Some(map) = atlas.map_mut(current_map) {
                    map.add_map_point(mp_id);
                }
                if let Some(map) = atlas.map_mut(merge_map) {
                    map.erase_map_point(mp_id);
                }
            }
        }

        // The matched map's spanning tree re-roots under the current
        // keyframe.
        if let Some(&origin) = atlas
            .map(merge_map)
            .and_then(|m| m.origin_keyframes().first())
        {
            if let Some(kf) = atlas.keyframe_mut(origin) {
                kf.first_connection = false;
            }
        }
        reverse_parent_chain(&mut atlas, matched, current);
    }

    // Small welding windows around the seam.
    let (current_window, fuse_candidates) = {
        let mut atlas = ctx.atlas.write();
        atlas.update_connections(current);

        let mut merge_window = vec![matched];
        merge_window.extend(
            atlas
                .keyframe(matched)
                .map(|kf| kf.covisibles_by_weight())
                .unwrap_or_default(),
        );
        merge_window.truncate(INERTIAL_WINDOW_KEYFRAMES);

        let mut current_window = vec![current];
        current_window.extend(
            atlas
                .keyframe(current)
                .map(|kf| kf.covisibles_by_weight())
                .unwrap_or_default(),
        );
        current_window.truncate(INERTIAL_WINDOW_KEYFRAMES);

        let mut fuse_candidates = atlas.map_points_of(&merge_window);
        fuse_candidates.truncate(INERTIAL_FUSE_CANDIDATES);

        (current_window, fuse_candidates)
    };

    search_and_fuse_se3(ctx, &current_window, &fuse_candidates);

    {
        let mut atlas = ctx.atlas.write();
        let refresh: Vec<KeyFrameId> = current_window
            .iter()
            .copied()
            .chain(std::iter::once(matched))
            .collect();
        for kf_id in refresh {
            if atlas.keyframe(kf_id).map_or(false, |kf| !kf.is_bad()) {
                atlas.update_connections(kf_id);
            }
        }
    }

    // A tiny merged map cannot propagate the welding information.
    if num_kf_new < MIN_KEYFRAMES_FOR_INERTIAL_BA {
        finish_inertial_merge(ctx, current, matched, current_map, merge_map);
        return;
    }

    let Some(last_kf) = ctx.tracker.last_keyframe() else {
        tracing::warn!("tracker has no keyframe, skipping welding BA");
        ctx.mapper.release();
        return;
    };

    {
        let stop = AtomicBool::new(false);
        let mut atlas = ctx.atlas.write();
        ctx.optimizer
            .merge_inertial_ba(&mut atlas, last_kf, matched, current_map, &stop);
    }

    finish_inertial_merge(ctx, current, matched, current_map, merge_map);
}

fn finish_inertial_merge(
    ctx: &WorkerCtx,
    current: KeyFrameId,
    matched: KeyFrameId,
    current_map: MapId,
    merge_map: MapId,
) {
    ctx.mapper.release();

    let mut atlas = ctx.atlas.write();
    if let Some(kf) = atlas.keyframe_mut(matched) {
        kf.add_merge_edge(current);
    }
    if let Some(kf) = atlas.keyframe_mut(current) {
        kf.add_merge_edge(matched);
    }
    atlas.set_map_bad(merge_map);
    if let Some(map) = atlas.map_mut(current_map) {
        map.increase_change_index();
    }
    atlas.inform_new_big_change(current_map);
    atlas.remove_bad_maps();

    tracing::info!("inertial merge finished, active map is {current_map}");
}

/// Covisibility window around `seed`: the best covisibles plus bounded
/// BFS expansion until the window holds enough keyframes.
fn build_window(atlas: &Atlas, seed: KeyFrameId) -> Vec<KeyFrameId> {
    let mut window: Vec<KeyFrameId> = Vec::new();
    let mut in_window: HashSet<KeyFrameId> = HashSet::new();

    let push = |window: &mut Vec<KeyFrameId>,
                    in_window: &mut HashSet<KeyFrameId>,
                    kf: KeyFrameId| {
        if in_window.insert(kf) {
            window.push(kf);
        }
    };

    push(&mut window, &mut in_window, seed);
    if let Some(kf) = atlas.keyframe(seed) {
        for c in kf.best_covisibles(WINDOW_KEYFRAMES) {
            push(&mut window, &mut in_window, c);
        }
    }

    for _ in 0..WINDOW_EXPANSION_ROUNDS {
        if window.len() >= WINDOW_KEYFRAMES {
            break;
        }
        let mut fresh = Vec::new();
        for &kf_id in &window {
            let Some(kf) = atlas.keyframe(kf_id) else {
                continue;
            };
            for c in kf.best_covisibles(WINDOW_KEYFRAMES / 2) {
                if !in_window.contains(&c)
                    && atlas.keyframe(c).map_or(false, |kf| !kf.is_bad())
                {
                    fresh.push(c);
                }
            }
        }
        for c in fresh {
            push(&mut window, &mut in_window, c);
        }
    }

    window
}

/// Reverse the parent chain above `kf` and graft `kf` under `new_parent`.
///
/// The old parent pointer is cleared before each re-link, so no cycle can
/// form while the chain flips.
fn reverse_parent_chain(atlas: &mut Atlas, kf: KeyFrameId, new_parent: KeyFrameId) {
    let mut chain_child = atlas.keyframe(kf).and_then(|k| k.parent());
    reparent(atlas, kf, new_parent);

    let mut chain_parent = kf;
    while let Some(node) = chain_child {
        let next = atlas.keyframe(node).and_then(|k| k.parent());
        if let Some(node_kf) = atlas.keyframe_mut(node) {
            node_kf.erase_child(chain_parent);
        }
        reparent(atlas, node, chain_parent);
        chain_parent = node;
        chain_child = next;
    }
}

/// Unlink `kf` from its old parent and link it under `new_parent`.
fn reparent(atlas: &mut Atlas, kf: KeyFrameId, new_parent: KeyFrameId) {
    let old_parent = atlas.keyframe(kf).and_then(|k| k.parent());
    if let Some(old) = old_parent {
        if let Some(old_kf) = atlas.keyframe_mut(old) {
            old_kf.erase_child(kf);
        }
    }
    if let Some(kf_mut) = atlas.keyframe_mut(kf) {
        kf_mut.change_parent(new_parent);
        kf_mut.first_connection = false;
    }
    if let Some(parent_kf) = atlas.keyframe_mut(new_parent) {
        parent_kf.add_child(kf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::Atlas;
    use crate::geometry::SE3;

    #[test]
    fn test_reverse_parent_chain_keeps_tree_acyclic() {
        let mut atlas = Atlas::new();
        let m = atlas.current_map_id();
        // Chain: a -> b -> c (parent pointers), plus a separate root r.
        let a = atlas.create_keyframe(m, SE3::identity(), 4);
        let b = atlas.create_keyframe(m, SE3::identity(), 4);
        let c = atlas.create_keyframe(m, SE3::identity(), 4);
        let r = atlas.create_keyframe(m, SE3::identity(), 4);
        reparent(&mut atlas, b, a);
        reparent(&mut atlas, c, b);

        // Graft c under r; the chain above c reverses.
        reverse_parent_chain(&mut atlas, c, r);

        assert_eq!(atlas.keyframe(c).unwrap().parent(), Some(r));
        assert_eq!(atlas.keyframe(b).unwrap().parent(), Some(c));
        assert_eq!(atlas.keyframe(a).unwrap().parent(), Some(b));
        // No node is its own ancestor.
        for kf in [a, b, c] {
            let mut seen = std::collections::HashSet::new();
            let mut cursor = Some(kf);
            while let Some(node) = cursor {
                assert!(seen.insert(node), "cycle through {node}");
                cursor = atlas.keyframe(node).and_then(|k| k.parent());
            }
        }
        // Child sets mirror the parent pointers.
        assert!(atlas.keyframe(r).unwrap().children().contains(&c));
        assert!(atlas.keyframe(c).unwrap().children().contains(&b));
        assert!(!atlas.keyframe(a).unwrap().children().contains(&b));
    }

    use std::sync::Arc;

    use crate::loop_closing::testutil::{make_ctx, scattered_positions};
    use crate::sensor::Sensor;
    use nalgebra::Vector3;

    /// Two maps with a keyframe chain each; the current map's tail matched
    /// the other map's tail.
    fn two_map_fixture(
        kfs_per_map: usize,
        shared_points: usize,
    ) -> (
        Arc<parking_lot::RwLock<Atlas>>,
        crate::atlas::MapId,
        crate::atlas::MapId,
        KeyFrameId,
        KeyFrameId,
    ) {
        let mut atlas = Atlas::new();
        let map_b = atlas.current_map_id(); // merge target
        let positions = scattered_positions(shared_points);

        // Map B: linear chain, the matched keyframe last.
        let mut prev: Option<KeyFrameId> = None;
        let mut matched = KeyFrameId::new(0);
        for _ in 0..kfs_per_map {
            let kf = atlas.create_keyframe(map_b, SE3::identity(), shared_points);
            if let Some(p) = prev {
                reparent(&mut atlas, kf, p);
                atlas.keyframe_mut(kf).unwrap().set_covisibility_weight(p, 30);
                atlas.keyframe_mut(p).unwrap().set_covisibility_weight(kf, 30);
            }
            prev = Some(kf);
            matched = kf;
        }
        for (slot, p) in positions.iter().enumerate() {
            let mp = atlas.create_map_point(map_b, *p, matched);
            atlas.associate(matched, slot, mp);
        }

        // Map A: the active map, same shape.
        let map_a = atlas.create_map();
        let mut prev: Option<KeyFrameId> = None;
        let mut current = KeyFrameId::new(0);
        for _ in 0..kfs_per_map {
            let kf = atlas.create_keyframe(map_a, SE3::identity(), shared_points);
            if let Some(p) = prev {
                reparent(&mut atlas, kf, p);
                atlas.keyframe_mut(kf).unwrap().set_covisibility_weight(p, 30);
                atlas.keyframe_mut(p).unwrap().set_covisibility_weight(kf, 30);
            }
            prev = Some(kf);
            current = kf;
        }
        for (slot, p) in positions.iter().enumerate() {
            let mp = atlas.create_map_point(map_a, *p, current);
            atlas.associate(current, slot, mp);
        }

        (Arc::new(parking_lot::RwLock::new(atlas)), map_a, map_b, current, matched)
    }

    #[test]
    fn test_cross_map_merge_moves_everything_into_merge_map() {
        let (atlas, map_a, map_b, current, matched) = two_map_fixture(40, 20);
        let (ctx, _mapper, optimizer, _tracker) = make_ctx(atlas.clone(), Sensor::Monocular);

        merge_local(&ctx, current, matched, &Sim3::identity());

        let atlas = atlas.read();
        // The merge map absorbed all 80 keyframes and is now current.
        assert_eq!(atlas.keyframes_in_map(map_b), 80);
        assert_eq!(atlas.current_map_id(), map_b);
        // The old map is empty and gone (or at least marked bad).
        assert!(atlas
            .map(map_a)
            .map_or(true, |m| m.is_bad() && m.num_keyframes() == 0));

        // The spanning tree is connected: BFS from the merge map's origin
        // reaches every keyframe.
        let reached = atlas.spanning_tree_bfs(map_b);
        assert_eq!(reached.len(), 80);
        // The origin is still the old merge-map origin.
        let origin = atlas.map(map_b).unwrap().origin_keyframes()[0];
        assert!(reached.first() == Some(&origin));

        // Mutual merge edges and a welding BA.
        assert!(atlas.keyframe(current).unwrap().merge_edges().contains(&matched));
        assert!(atlas.keyframe(matched).unwrap().merge_edges().contains(&current));
        assert!(optimizer.called("local_bundle_adjustment"));

        // Duplicated landmarks between the welding windows were fused.
        let total_points = atlas.map(map_b).unwrap().num_map_points();
        assert_eq!(total_points, 20);
    }

    #[test]
    fn test_inertial_merge_absorbs_other_map() {
        let (atlas, map_a, map_b, current, matched) = two_map_fixture(12, 20);
        {
            let mut a = atlas.write();
            let m = a.map_mut(map_a).unwrap();
            m.set_imu_initialized();
            m.set_inertial_ba1_done();
            m.set_inertial_ba2_done();
        }
        let (ctx, _mapper, optimizer, tracker) = make_ctx(atlas.clone(), Sensor::ImuStereo);
        *tracker.last_kf.lock() = Some(current);

        // Identity alignment: the active map does not move, the other map
        // migrates in.
        merge_local2(&ctx, current, matched, &Sim3::identity());

        let atlas = atlas.read();
        assert_eq!(atlas.keyframes_in_map(map_a), 24);
        assert!(atlas.map(map_b).map_or(true, |m| m.is_bad() && m.num_keyframes() == 0));
        assert_eq!(atlas.current_map_id(), map_a);
        // Welding BA ran on the seam.
        assert!(optimizer.called("merge_inertial_ba"));
        // The matched keyframe re-rooted under the current one.
        assert_eq!(atlas.keyframe(matched).unwrap().parent(), Some(current));
    }

    #[test]
    fn test_inertial_merge_scales_active_map() {
        let (atlas, map_a, _map_b, current, matched) = two_map_fixture(12, 4);
        {
            let mut a = atlas.write();
            let m = a.map_mut(map_a).unwrap();
            m.set_imu_initialized();
            m.set_inertial_ba1_done();
            m.set_inertial_ba2_done();
            // Give the current keyframe a measurable camera center.
            a.keyframe_mut(current).unwrap().set_pose(SE3::from_parts(
                nalgebra::UnitQuaternion::identity(),
                Vector3::new(0.0, 0.0, -2.0),
            ));
        }
        let (ctx, _mapper, _optimizer, tracker) = make_ctx(atlas.clone(), Sensor::ImuStereo);
        *tracker.last_kf.lock() = Some(current);

        let s_old_new = Sim3::from_parts(nalgebra::UnitQuaternion::identity(), Vector3::zeros(), 2.0);
        merge_local2(&ctx, current, matched, &s_old_new);

        let atlas = atlas.read();
        let center = atlas.keyframe(current).unwrap().camera_center();
        approx::assert_relative_eq!(center, Vector3::new(0.0, 0.0, 4.0), epsilon = 1e-9);
        // The tracker was told about the scale change.
        assert!(tracker.imu_updates.lock().contains(&2.0));
    }

    #[test]
    fn test_build_window_expands_through_covisibility() {
        let mut atlas = Atlas::new();
        let m = atlas.current_map_id();
        let seed = atlas.create_keyframe(m, SE3::identity(), 4);
        let mid = atlas.create_keyframe(m, SE3::identity(), 4);
        let far = atlas.create_keyframe(m, SE3::identity(), 4);
        atlas.keyframe_mut(seed).unwrap().set_covisibility_weight(mid, 30);
        atlas.keyframe_mut(mid).unwrap().set_covisibility_weight(seed, 30);
        atlas.keyframe_mut(mid).unwrap().set_covisibility_weight(far, 20);
        atlas.keyframe_mut(far).unwrap().set_covisibility_weight(mid, 20);

        let window = build_window(&atlas, seed);
        assert!(window.contains(&seed));
        assert!(window.contains(&mid));
        // `far` is two covisibility hops away; the expansion pulls it in.
        assert!(window.contains(&far));
    }
}
