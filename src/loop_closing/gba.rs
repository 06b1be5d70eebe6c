//! Global bundle adjustment supervisor.
//!
//! Full BA is too slow to run under the map lock, so it runs on a detached
//! thread against a snapshot-free map: the optimizer stages its results in
//! the `pose_gba` / `pos_gba` fields and the supervisor reconciles them
//! with whatever the local mapper built in the meantime, by propagating
//! corrections through the spanning tree.
//!
//! A newer loop closure supersedes an in-flight run: it raises the shared
//! stop flag and bumps the epoch counter, and the supervisor discards its
//! results when it observes the mismatch.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::atlas::{Atlas, KeyFrameId, MapId};
use crate::interfaces::{MapperControl, Optimizer};

/// Visual GBA iteration budget.
const GBA_ITERATIONS: usize = 10;
/// Full-inertial BA iteration budget.
const FULL_INERTIAL_BA_ITERATIONS: usize = 7;

#[derive(Debug, Default)]
struct GbaFlags {
    running: bool,
    finished: bool,
    /// Bumped whenever a newer correction invalidates in-flight results.
    epoch: u64,
}

/// Shared state of the detached global-BA worker.
#[derive(Debug, Default)]
pub struct GbaSupervisor {
    flags: Mutex<GbaFlags>,
    stop: Arc<AtomicBool>,
}

impl GbaSupervisor {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(GbaFlags::default()),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags.lock().running
    }

    pub fn is_finished(&self) -> bool {
        self.flags.lock().finished
    }

    pub fn current_epoch(&self) -> u64 {
        self.flags.lock().epoch
    }

    /// Cancel an in-flight run, if any. The optimizer observes the stop
    /// flag; the epoch bump makes the supervisor discard whatever was
    /// staged even if the optimizer finished in the meantime.
    pub fn abort_if_running(&self) {
        let mut flags = self.flags.lock();
        if flags.running {
            self.stop.store(true, Ordering::SeqCst);
            flags.epoch += 1;
            tracing::info!("stopping global bundle adjustment");
        }
    }

    /// Launch a run for `map`, detached. `loop_kf` stamps everything this
    /// run touches.
    pub fn launch(
        self: &Arc<Self>,
        atlas: Arc<RwLock<Atlas>>,
        optimizer: Arc<dyn Optimizer>,
        mapper: Arc<MapperControl>,
        map: MapId,
        loop_kf: KeyFrameId,
    ) -> thread::JoinHandle<()> {
        {
            let mut flags = self.flags.lock();
            flags.running = true;
            flags.finished = false;
        }
        self.stop.store(false, Ordering::SeqCst);

        let supervisor = Arc::clone(self);
        thread::spawn(move || {
            supervisor.run(atlas, optimizer.as_ref(), &mapper, map, loop_kf);
        })
    }

    fn run(
        &self,
        atlas: Arc<RwLock<Atlas>>,
        optimizer: &dyn Optimizer,
        mapper: &MapperControl,
        map: MapId,
        loop_kf: KeyFrameId,
    ) {
        tracing::info!("starting global bundle adjustment for {map}");

        let idx = self.flags.lock().epoch;
        let imu_init = atlas
            .read()
            .map(map)
            .map_or(false, |m| m.is_imu_initialized());

        if imu_init {
            optimizer.full_inertial_ba(&atlas, map, FULL_INERTIAL_BA_ITERATIONS, loop_kf, &self.stop);
        } else {
            optimizer.global_bundle_adjustment(&atlas, map, GBA_ITERATIONS, loop_kf, &self.stop);
        }

        let mut flags = self.flags.lock();
        // A newer correction superseded this run; its results are stale.
        if idx != flags.epoch {
            flags.running = false;
            return;
        }
        // IMU initialization flipped mid-run: the visual-only solution no
        // longer matches the map's parametrization.
        let imu_init_now = atlas
            .read()
            .map(map)
            .map_or(false, |m| m.is_imu_initialized());
        if !imu_init && imu_init_now {
            flags.running = false;
            return;
        }

        if !self.stop.load(Ordering::SeqCst) {
            tracing::info!("global bundle adjustment finished, updating map");

            mapper.request_stop();
            while !mapper.is_stopped() && !mapper.is_finished() {
                thread::sleep(Duration::from_millis(1));
            }

            let mut atlas = atlas.write();
            propagate_gba_corrections(&mut atlas, map, loop_kf);
            atlas.inform_new_big_change(map);
            if let Some(m) = atlas.map_mut(map) {
                m.increase_change_index();
            }
            drop(atlas);

            mapper.release();
            tracing::info!("map updated after global bundle adjustment");
        }

        flags.finished = true;
        flags.running = false;
    }
}

/// Propagate staged GBA results through the spanning tree and re-express
/// every map point.
///
/// Keyframes created while the optimization ran were never optimized; they
/// inherit their parent's correction (`T_child,parent ∘ parent_gba`). The
/// pre-overwrite pose of every keyframe is kept so that non-optimized map
/// points can be carried through their reference keyframe.
pub(crate) fn propagate_gba_corrections(atlas: &mut Atlas, map: MapId, loop_kf: KeyFrameId) {
    // BFS from the origins, stamping children that the optimizer missed.
    let order = atlas.spanning_tree_bfs(map);
    for &kf_id in &order {
        let Some(kf) = atlas.keyframe(kf_id) else {
            continue;
        };
        let parent_twc = kf.pose_inverse();
        let parent_gba = kf.pose_gba.clone();
        let children: Vec<KeyFrameId> = kf.children().iter().copied().collect();

        for child_id in children {
            let Some(child) = atlas.keyframe_mut(child_id) else {
                continue;
            };
            if child.is_bad() || child.ba_global_for == Some(loop_kf) {
                continue;
            }
            let Some(parent_gba) = parent_gba.as_ref() else {
                continue;
            };
            let t_child_parent = child.pose().compose(&parent_twc);
            let child_gba = t_child_parent.compose(parent_gba);

            let rot_correction = child_gba.rotation.inverse() * child.pose().rotation;
            if let Some(vel) = child.velocity() {
                child.vel_gba = Some(rot_correction * vel);
            }
            child.bias_gba = Some(child.imu_bias());
            child.pose_gba = Some(child_gba);
            child.ba_global_for = Some(loop_kf);
        }

        // Commit this keyframe's own staged pose.
        if let Some(kf) = atlas.keyframe_mut(kf_id) {
            if kf.ba_global_for == Some(loop_kf) {
                if let Some(pose_gba) = kf.pose_gba.clone() {
                    kf.pose_before_gba = Some(kf.pose().clone());
                    kf.set_pose(pose_gba);
                }
                if let Some(vel) = kf.vel_gba {
                    kf.set_velocity(vel);
                }
                if let Some(bias) = kf.bias_gba {
                    kf.set_new_bias(bias);
                }
            }
        }
    }

    // Map points: directly optimized ones take their staged position,
    // the rest ride along with their reference keyframe.
    for mp_id in atlas.all_map_points(map) {
        let Some(mp) = atlas.map_point(mp_id) else {
            continue;
        };
        if mp.is_bad() {
            continue;
        }

        if mp.ba_global_for == Some(loop_kf) {
            if let Some(pos) = mp.pos_gba {
                atlas.map_point_mut(mp_id).expect("just read").set_world_pos(pos);
            }
            continue;
        }

        let reference = mp.reference_keyframe();
        let Some(ref_kf) = atlas.keyframe(reference) else {
            continue;
        };
        if ref_kf.ba_global_for != Some(loop_kf) {
            continue;
        }
        let Some(before) = ref_kf.pose_before_gba.clone() else {
            continue;
        };
        // Into the pre-GBA camera, back out through the corrected camera.
        let cam = before.transform_point(&mp.world_pos());
        let corrected = ref_kf.pose_inverse().transform_point(&cam);
        atlas
            .map_point_mut(mp_id)
            .expect("just read")
            .set_world_pos(corrected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::SE3;
    use crate::loop_closing::testutil::{AutoMapper, RecordingOptimizer};
    use nalgebra::Vector3;

    fn small_map() -> (Arc<RwLock<Atlas>>, MapId, KeyFrameId) {
        let mut atlas = Atlas::new();
        let map = atlas.current_map_id();
        let root = atlas.create_keyframe(map, SE3::identity(), 4);
        for _ in 0..3 {
            let kf = atlas.create_keyframe(map, SE3::identity(), 4);
            atlas.keyframe_mut(kf).unwrap().change_parent(root);
            atlas.keyframe_mut(root).unwrap().add_child(kf);
        }
        (Arc::new(RwLock::new(atlas)), map, root)
    }

    #[test]
    fn test_completed_gba_commits_staged_state() {
        let (atlas, map, root) = small_map();
        let mapper = AutoMapper::start();
        let optimizer: Arc<RecordingOptimizer> = Arc::new(RecordingOptimizer::new());
        let supervisor = Arc::new(GbaSupervisor::new());

        let join = supervisor.launch(
            atlas.clone(),
            optimizer,
            mapper.control.clone(),
            map,
            KeyFrameId::new(7),
        );
        join.join().unwrap();

        assert!(!supervisor.is_running());
        assert!(supervisor.is_finished());
        let atlas = atlas.read();
        let kf = atlas.keyframe(root).unwrap();
        assert_eq!(kf.ba_global_for, Some(KeyFrameId::new(7)));
        assert!(kf.pose_before_gba.is_some());
    }

    /// A newer loop supersedes an in-flight run: its staged results are
    /// discarded, nothing is committed.
    #[test]
    fn test_superseded_gba_discards_results() {
        let (atlas, map, root) = small_map();
        let mapper = AutoMapper::start();
        let (release, gate) = crossbeam_channel::bounded::<()>(1);
        let optimizer: Arc<RecordingOptimizer> = Arc::new(RecordingOptimizer::gated(gate));
        let supervisor = Arc::new(GbaSupervisor::new());

        let join = supervisor.launch(
            atlas.clone(),
            optimizer,
            mapper.control.clone(),
            map,
            KeyFrameId::new(7),
        );

        // A second loop closure arrives while the optimizer is still
        // blocked, then the optimizer is released.
        while !supervisor.is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        supervisor.abort_if_running();
        release.send(()).unwrap();
        join.join().unwrap();

        assert!(!supervisor.is_running());
        assert!(!supervisor.is_finished());
        let atlas = atlas.read();
        let kf = atlas.keyframe(root).unwrap();
        // Neither staged nor committed state carries the canceled run.
        assert_eq!(kf.ba_global_for, None);
        assert!(kf.pose_before_gba.is_none());
        assert_eq!(kf.pose(), &SE3::identity());
    }

    #[test]
    fn test_abort_bumps_epoch_only_when_running() {
        let sup = GbaSupervisor::new();
        sup.abort_if_running();
        assert_eq!(sup.current_epoch(), 0);

        sup.flags.lock().running = true;
        sup.abort_if_running();
        assert_eq!(sup.current_epoch(), 1);
        assert!(sup.stop.load(Ordering::SeqCst));
    }

    #[test]
    fn test_propagation_carries_unoptimized_children() {
        let mut atlas = Atlas::new();
        let map = atlas.current_map_id();
        let loop_kf = KeyFrameId::new(99);

        let root = atlas.create_keyframe(map, SE3::identity(), 4);
        let child_pose = SE3::from_parts(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(0.0, 0.0, -1.0),
        );
        let child = atlas.create_keyframe(map, child_pose, 4);
        atlas.keyframe_mut(child).unwrap().change_parent(root);
        atlas.keyframe_mut(root).unwrap().add_child(child);

        // Only the root was optimized: shifted one meter along x.
        let root_gba = SE3::from_parts(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(1.0, 0.0, 0.0),
        );
        {
            let kf = atlas.keyframe_mut(root).unwrap();
            kf.pose_gba = Some(root_gba.clone());
            kf.ba_global_for = Some(loop_kf);
        }

        propagate_gba_corrections(&mut atlas, map, loop_kf);

        let root_kf = atlas.keyframe(root).unwrap();
        assert_eq!(root_kf.pose(), &root_gba);
        assert_eq!(root_kf.pose_before_gba, Some(SE3::identity()));

        // Child inherits T_child,root ∘ root_gba.
        let child_kf = atlas.keyframe(child).unwrap();
        assert_eq!(child_kf.ba_global_for, Some(loop_kf));
        approx::assert_relative_eq!(
            child_kf.pose().translation,
            Vector3::new(1.0, 0.0, -1.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_unoptimized_points_ride_their_reference() {
        let mut atlas = Atlas::new();
        let map = atlas.current_map_id();
        let loop_kf = KeyFrameId::new(42);

        let kf = atlas.create_keyframe(map, SE3::identity(), 4);
        let mp = atlas.create_map_point(map, Vector3::new(0.0, 0.0, 5.0), kf);
        atlas.associate(kf, 0, mp);

        let shifted = SE3::from_parts(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(0.5, 0.0, 0.0),
        );
        {
            let k = atlas.keyframe_mut(kf).unwrap();
            k.pose_gba = Some(shifted);
            k.ba_global_for = Some(loop_kf);
        }

        propagate_gba_corrections(&mut atlas, map, loop_kf);

        // Camera-frame coordinates are preserved: the point moved with the
        // keyframe, i.e. by the inverse of the camera shift.
        approx::assert_relative_eq!(
            atlas.map_point(mp).unwrap().world_pos(),
            Vector3::new(-0.5, 0.0, 5.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn test_stamped_points_take_staged_position() {
        let mut atlas = Atlas::new();
        let map = atlas.current_map_id();
        let loop_kf = KeyFrameId::new(7);

        let kf = atlas.create_keyframe(map, SE3::identity(), 4);
        let mp = atlas.create_map_point(map, Vector3::new(1.0, 1.0, 1.0), kf);
        {
            let p = atlas.map_point_mut(mp).unwrap();
            p.pos_gba = Some(Vector3::new(9.0, 9.0, 9.0));
            p.ba_global_for = Some(loop_kf);
        }

        propagate_gba_corrections(&mut atlas, map, loop_kf);
        assert_eq!(
            atlas.map_point(mp).unwrap().world_pos(),
            Vector3::new(9.0, 9.0, 9.0)
        );
    }
}
