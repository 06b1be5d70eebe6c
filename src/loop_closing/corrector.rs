//! Loop correction: Sim3 propagation, map-point fusion and
//! essential-graph optimization.
//!
//! The detected similarity places the current keyframe on the far side of
//! the loop; the correction is propagated to the covisibility neighborhood
//! through relative poses, duplicated landmarks are fused, and the
//! essential graph distributes the residual error over the whole map.

use std::collections::{HashMap, HashSet};
use std::thread;
use std::time::Duration;

use crate::atlas::{KeyFrameId, MapPointId};
use crate::geometry::Sim3;
use crate::interfaces::{EssentialGraphProblem, FuseOutcome};

use super::loop_closer::WorkerCtx;

/// Radius of the fuse projection window, in pixels.
const FUSE_RADIUS: f64 = 4.0;
/// Above this size an IMU-initialized map skips the post-loop global BA.
const MAX_KEYFRAMES_FOR_GBA: usize = 200;

/// Correct the active map after a committed loop detection.
///
/// `loop_scw` is the verified world-to-current similarity, `loop_points`
/// the landmarks around the matched keyframe, and `matched_slots` the
/// slot-indexed matches on the current keyframe.
pub(crate) fn correct_loop(
    ctx: &WorkerCtx,
    current: KeyFrameId,
    matched: KeyFrameId,
    loop_scw: Sim3,
    loop_points: &[MapPointId],
    matched_slots: &[Option<MapPointId>],
) {
    tracing::info!("correcting loop {current} -> {matched}");

    // Freeze concurrent mapping and invalidate any in-flight global BA.
    ctx.mapper.request_stop();
    ctx.mapper.empty_queue();
    ctx.gba.abort_if_running();
    while !ctx.mapper.is_stopped() {
        thread::sleep(Duration::from_millis(1));
    }

    let (map_id, problem, imu_initialized) = {
        let mut atlas = ctx.atlas.write();
        let Some(kf) = atlas.keyframe(current) else {
            ctx.mapper.release();
            return;
        };
        let map_id = kf.map_id;

        atlas.update_connections(current);

        // Ω: the current keyframe and its covisibility neighborhood.
        let mut window = atlas
            .keyframe(current)
            .map(|kf| kf.covisibles_by_weight())
            .unwrap_or_default();
        window.push(current);

        let imu_initialized = atlas
            .map(map_id)
            .map_or(false, |m| m.is_imu_initialized());

        // Corrected similarity per keyframe, propagated through relative
        // poses: S'_iw = T_ic ∘ S_cw. Non-corrected poses are kept for the
        // point re-expression and the essential graph.
        let t_wc = atlas.keyframe(current).expect("checked above").pose_inverse();
        let mut corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        let mut non_corrected: HashMap<KeyFrameId, Sim3> = HashMap::new();
        for &kf_id in &window {
            let Some(kf) = atlas.keyframe(kf_id) else {
                continue;
            };
            let t_iw = kf.pose().clone();
            non_corrected.insert(kf_id, Sim3::from_se3(&t_iw));
            if kf_id == current {
                corrected.insert(kf_id, loop_scw.clone());
            } else {
                let t_ic = t_iw.compose(&t_wc);
                corrected.insert(kf_id, Sim3::from_se3(&t_ic).compose(&loop_scw));
            }
        }

        // Commit the corrected poses (translation re-scaled).
        for (&kf_id, siw) in &corrected {
            if let Some(kf) = atlas.keyframe_mut(kf_id) {
                kf.set_pose(siw.to_se3_scaled());
            }
        }

        // Re-express every observed landmark once: out through the stale
        // pose, back in through the corrected one.
        for &kf_id in &window {
            let corrected_swi = corrected[&kf_id].inverse();
            let non_corrected_siw = &non_corrected[&kf_id];

            let observed: Vec<MapPointId> = atlas
                .keyframe(kf_id)
                .map(|kf| kf.map_point_matches().map(|(_, mp)| mp).collect())
                .unwrap_or_default();
            for mp_id in observed {
                let skip = atlas.map_point(mp_id).map_or(true, |mp| {
                    mp.is_bad() || mp.corrected_by_kf == Some(current)
                });
                if skip {
                    continue;
                }
                if let Some(mp) = atlas.map_point_mut(mp_id) {
                    let pos = mp.world_pos();
                    mp.set_world_pos(corrected_swi.transform_point(
                        &non_corrected_siw.transform_point(&pos),
                    ));
                    mp.corrected_by_kf = Some(current);
                    mp.corrected_reference = Some(kf_id);
                }
                atlas.update_normal_and_depth(mp_id);
            }

            // Velocities rotate with the orientation delta.
            if imu_initialized {
                let rot_correction =
                    corrected[&kf_id].rotation.inverse() * non_corrected[&kf_id].rotation;
                if let Some(kf) = atlas.keyframe_mut(kf_id) {
                    if let Some(vel) = kf.velocity() {
                        kf.set_velocity(rot_correction * vel);
                    }
                }
            }

            atlas.update_connections(kf_id);
        }

        if let Some(map) = atlas.map_mut(map_id) {
            map.increase_change_index();
        }

        // Loop fusion on the current keyframe: loop-side landmarks replace
        // or fill the matched slots.
        for (slot, loop_mp) in matched_slots.iter().enumerate() {
            let Some(loop_mp) = loop_mp else {
                continue;
            };
            let own = atlas.keyframe(current).and_then(|kf| kf.map_point(slot));
            match own {
                Some(own_mp) if own_mp != *loop_mp => {
                    atlas.replace_map_point(own_mp, *loop_mp);
                }
                Some(_) => {}
                None => {
                    if let Some(kf) = atlas.keyframe_mut(current) {
                        kf.set_map_point(slot, *loop_mp);
                    }
                    if let Some(mp) = atlas.map_point_mut(*loop_mp) {
                        mp.add_observation(current, slot);
                    }
                }
            }
        }

        (
            map_id,
            EssentialGraphProblem {
                corrected,
                non_corrected,
                loop_connections: HashMap::new(),
            },
            imu_initialized,
        )
    };

    // Project the loop-side landmarks into the whole window and fuse
    // duplicates.
    search_and_fuse(ctx, &problem.corrected, loop_points);

    // New covisibility links attaching both sides of the loop feed the
    // essential graph.
    let mut problem = problem;
    {
        let mut atlas = ctx.atlas.write();
        let window: Vec<KeyFrameId> = problem.corrected.keys().copied().collect();
        let window_set: HashSet<KeyFrameId> = window.iter().copied().collect();
        for &kf_id in &window {
            let previous: HashSet<KeyFrameId> = atlas
                .keyframe(kf_id)
                .map(|kf| kf.connected_keyframes())
                .unwrap_or_default();
            atlas.update_connections(kf_id);
            let mut fresh = atlas
                .keyframe(kf_id)
                .map(|kf| kf.connected_keyframes())
                .unwrap_or_default();
            fresh.retain(|kf| !previous.contains(kf) && !window_set.contains(kf));
            problem.loop_connections.insert(kf_id, fresh);
        }
    }

    // Distribute the residual drift over the essential graph.
    {
        let mut atlas = ctx.atlas.write();
        let fix_scale = {
            let map = atlas.map(map_id).expect("map exists");
            ctx.config.sensor.fix_scale_for_map(map)
        };
        if ctx.config.sensor.is_inertial() && imu_initialized {
            ctx.optimizer
                .optimize_essential_graph_4dof(&mut atlas, map_id, matched, current, &problem);
        } else {
            ctx.optimizer.optimize_essential_graph(
                &mut atlas, map_id, matched, current, &problem, fix_scale,
            );
        }

        atlas.inform_new_big_change(map_id);

        if let Some(kf) = atlas.keyframe_mut(matched) {
            kf.add_loop_edge(current);
        }
        if let Some(kf) = atlas.keyframe_mut(current) {
            kf.add_loop_edge(matched);
        }
    }

    // Full BA is affordable on small or visual-only maps.
    let launch_gba = {
        let atlas = ctx.atlas.read();
        !imu_initialized
            || (atlas.keyframes_in_map(map_id) < MAX_KEYFRAMES_FOR_GBA && atlas.count_maps() == 1)
    };
    if launch_gba {
        ctx.gba.launch(
            ctx.atlas.clone(),
            ctx.optimizer.clone(),
            ctx.mapper.clone(),
            map_id,
            current,
        );
    }

    ctx.mapper.release();
    tracing::info!("loop closed {current} -> {matched}");
}

/// Project `points` into every keyframe of `corrected` through its
/// corrected similarity and fuse duplicates.
///
/// Matching runs under the read lock; mutations are applied afterwards
/// under the write lock.
pub(crate) fn search_and_fuse(
    ctx: &WorkerCtx,
    corrected: &HashMap<KeyFrameId, Sim3>,
    points: &[MapPointId],
) {
    for (&kf_id, scw) in corrected {
        let outcomes = {
            let atlas = ctx.atlas.read();
            ctx.matcher.fuse(&atlas, kf_id, scw, points, FUSE_RADIUS)
        };
        apply_fuse_outcomes(ctx, kf_id, points, &outcomes);
    }
}

/// SE3-pose variant: each keyframe projects through its own current pose.
pub(crate) fn search_and_fuse_se3(ctx: &WorkerCtx, keyframes: &[KeyFrameId], points: &[MapPointId]) {
    for &kf_id in keyframes {
        let Some(scw) = ({
            let atlas = ctx.atlas.read();
            atlas.keyframe(kf_id).map(|kf| Sim3::from_se3(kf.pose()))
        }) else {
            continue;
        };
        let outcomes = {
            let atlas = ctx.atlas.read();
            ctx.matcher.fuse(&atlas, kf_id, &scw, points, FUSE_RADIUS)
        };
        apply_fuse_outcomes(ctx, kf_id, points, &outcomes);
    }
}

fn apply_fuse_outcomes(
    ctx: &WorkerCtx,
    kf_id: KeyFrameId,
    points: &[MapPointId],
    outcomes: &[FuseOutcome],
) {
    let mut atlas = ctx.atlas.write();
    for (idx, outcome) in outcomes.iter().enumerate() {
        let Some(&candidate) = points.get(idx) else {
            break;
        };
        match *outcome {
            FuseOutcome::None => {}
            FuseOutcome::Duplicate { existing } => {
                // The landmark seen from the far side wins.
                if existing != candidate {
                    atlas.replace_map_point(existing, candidate);
                }
            }
            FuseOutcome::Attach { keyframe, slot } => {
                debug_assert_eq!(keyframe, kf_id);
                if let Some(kf) = atlas.keyframe_mut(keyframe) {
                    kf.set_map_point(slot, candidate);
                }
                if let Some(mp) = atlas.map_point_mut(candidate) {
                    mp.add_observation(keyframe, slot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::loop_closing::detection::{Detector, RegionTrack};
    use crate::loop_closing::testutil::{make_ctx, RevisitFixture};
    use crate::sensor::Sensor;
    use nalgebra::Vector3;

    /// Run detection to commitment, then correct the loop.
    #[test]
    fn test_clean_loop_fuses_duplicates_and_adds_loop_edges() {
        let fixture = RevisitFixture::build(120);
        let (ctx, _mapper, optimizer, tracker) =
            make_ctx(fixture.atlas.clone(), Sensor::Monocular);

        let mut loop_track = RegionTrack::default();
        let mut merge_track = RegionTrack::default();
        ctx.atlas.write().set_not_erase(fixture.current);
        let detector = Detector {
            atlas: &ctx.atlas,
            matcher: ctx.matcher.as_ref(),
            optimizer: ctx.optimizer.as_ref(),
            params: &ctx.config.detection,
            sensor: ctx.config.sensor,
        };
        detector.detect_common_regions(fixture.current, &mut loop_track, &mut merge_track);
        assert!(loop_track.detected);

        correct_loop(
            &ctx,
            fixture.current,
            fixture.matched,
            loop_track.scw.clone(),
            &loop_track.map_points,
            &loop_track.matched_map_points,
        );
        loop_track.clear(&ctx.atlas);

        let atlas = ctx.atlas.read();
        // Mutual loop edges.
        assert!(atlas
            .keyframe(fixture.current)
            .unwrap()
            .loop_edges()
            .contains(&fixture.matched));
        assert!(atlas
            .keyframe(fixture.matched)
            .unwrap()
            .loop_edges()
            .contains(&fixture.current));

        // Duplicated landmarks are gone: the loop-side points absorbed the
        // fresh ones, and the current keyframe now observes the old ones.
        for (slot, &old_mp) in fixture.old_points.iter().enumerate() {
            assert_eq!(
                atlas.keyframe(fixture.current).unwrap().map_point(slot),
                Some(old_mp)
            );
        }
        for &new_mp in &fixture.new_points {
            assert!(atlas.map_point(new_mp).is_none());
        }

        // Both sides of the loop are covisible after fusion.
        assert!(atlas
            .keyframe(fixture.current)
            .unwrap()
            .connected_keyframes()
            .contains(&fixture.matched));

        // The essential graph ran; no global BA was launched (multi-map,
        // IMU-initialized fixture).
        assert!(optimizer.called("optimize_essential_graph"));
        assert!(!ctx.gba.is_running());
        assert!(tracker.imu_updates.lock().is_empty());

        // Mapper was released.
        assert!(!ctx.mapper.stop_requested());
    }

    /// Per-point stamps gate re-application: a second identical correction
    /// must not move any landmark.
    #[test]
    fn test_correction_is_idempotent_on_map_points() {
        let fixture = RevisitFixture::build(40);
        let (ctx, _mapper, _optimizer, _tracker) =
            make_ctx(fixture.atlas.clone(), Sensor::Monocular);

        let loop_scw = Sim3::from_parts(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(1.0, 0.0, 0.0),
            1.0,
        );

        correct_loop(&ctx, fixture.current, fixture.matched, loop_scw.clone(), &[], &[]);

        let after_first: Vec<Vector3<f64>> = {
            let atlas = ctx.atlas.read();
            fixture
                .new_points
                .iter()
                .map(|&mp| atlas.map_point(mp).unwrap().world_pos())
                .collect()
        };
        // The window was at identity, so every observed point moved by the
        // inverse similarity.
        {
            let atlas = ctx.atlas.read();
            for (&mp, moved) in fixture.new_points.iter().zip(&after_first) {
                let mp = atlas.map_point(mp).unwrap();
                assert_eq!(mp.corrected_by_kf, Some(fixture.current));
                approx::assert_relative_eq!(
                    *moved,
                    mp.world_pos(),
                    epsilon = 1e-12
                );
            }
        }

        correct_loop(&ctx, fixture.current, fixture.matched, loop_scw, &[], &[]);

        let atlas = ctx.atlas.read();
        for (&mp, before) in fixture.new_points.iter().zip(&after_first) {
            approx::assert_relative_eq!(
                atlas.map_point(mp).unwrap().world_pos(),
                *before,
                epsilon = 1e-12
            );
        }
    }

    /// The corrected pose commits the translation divided by the scale.
    #[test]
    fn test_scaled_correction_commits_rescaled_pose() {
        let fixture = RevisitFixture::build(40);
        let (ctx, _mapper, _optimizer, _tracker) =
            make_ctx(fixture.atlas.clone(), Sensor::Monocular);

        let loop_scw = Sim3::from_parts(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(2.0, 0.0, 0.0),
            2.0,
        );
        correct_loop(&ctx, fixture.current, fixture.matched, loop_scw, &[], &[]);

        let atlas = ctx.atlas.read();
        let pose = atlas.keyframe(fixture.current).unwrap().pose().clone();
        approx::assert_relative_eq!(
            pose.translation,
            Vector3::new(1.0, 0.0, 0.0),
            epsilon = 1e-12
        );
        assert_eq!(pose, SE3::from_parts(pose.rotation, pose.translation));
    }
}
