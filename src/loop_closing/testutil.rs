//! Test doubles and fixtures for the loop-closing pipeline.
//!
//! The matcher is replaced by a geometry-driven stand-in that matches
//! landmarks by world-space proximity, so detection behaves like the real
//! pipeline without descriptors. The optimizer records every call and
//! stages identity corrections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::Receiver;
use nalgebra::Vector3;
use parking_lot::{Mutex, RwLock};

use crate::atlas::{Atlas, KeyFrameId, MapId, MapPointId};
use crate::geometry::{Sim3, SE3};
use crate::imu::ImuBias;
use crate::interfaces::{
    EssentialGraphProblem, FeatureMatcher, FuseOutcome, MapperControl, Optimizer,
    ProjectionParams, TrackerBridge,
};
use crate::sensor::Sensor;

use super::gba::GbaSupervisor;
use super::loop_closer::{LoopClosingConfig, WorkerCtx};

// ── Matcher ──────────────────────────────────────────────────────────────

/// Matches landmarks by world-space proximity instead of descriptors.
pub struct GeometricMatcher {
    /// World-distance below which two landmarks count as the same feature.
    pub tolerance: f64,
}

impl GeometricMatcher {
    pub fn new() -> Self {
        Self { tolerance: 0.05 }
    }

    /// Slot of `kf` whose own landmark lies near `pos` (camera frame of
    /// `kf` mapped through `scw`-style world coordinates are not needed:
    /// the fixtures keep all poses at identity, so world distance is the
    /// matching criterion).
    fn matching_slot(&self, atlas: &Atlas, kf: KeyFrameId, pos: &Vector3<f64>) -> Option<usize> {
        let kf = atlas.keyframe(kf)?;
        for (slot, mp_id) in kf.map_point_matches() {
            let Some(mp) = atlas.map_point(mp_id) else {
                continue;
            };
            if (mp.world_pos() - pos).norm() < self.tolerance {
                return Some(slot);
            }
        }
        None
    }
}

impl FeatureMatcher for GeometricMatcher {
    fn search_by_bow(
        &self,
        atlas: &Atlas,
        current: KeyFrameId,
        other: KeyFrameId,
    ) -> Vec<(usize, MapPointId)> {
        let Some(other_kf) = atlas.keyframe(other) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (_, other_mp) in other_kf.map_point_matches() {
            let Some(mp) = atlas.map_point(other_mp) else {
                continue;
            };
            if let Some(slot) = self.matching_slot(atlas, current, &mp.world_pos()) {
                out.push((slot, other_mp));
            }
        }
        out
    }

    fn search_by_projection(
        &self,
        atlas: &Atlas,
        kf: KeyFrameId,
        scw: &Sim3,
        candidates: &[MapPointId],
        _hints: Option<&[KeyFrameId]>,
        _params: ProjectionParams,
    ) -> Vec<Option<MapPointId>> {
        let num_slots = atlas.keyframe(kf).map(|k| k.num_features()).unwrap_or(0);
        let mut out = vec![None; num_slots];
        let t_wc = atlas
            .keyframe(kf)
            .map(|k| k.pose_inverse())
            .unwrap_or_else(SE3::identity);

        for &candidate in candidates {
            let Some(mp) = atlas.map_point(candidate) else {
                continue;
            };
            // Where the candidate lands in the keyframe's world given the
            // hypothesized similarity.
            let in_camera = scw.transform_point(&mp.world_pos());
            let in_world = t_wc.transform_point(&in_camera);
            if let Some(slot) = self.matching_slot(atlas, kf, &in_world) {
                if out[slot].is_none() {
                    out[slot] = Some(candidate);
                }
            }
        }
        out
    }

    fn fuse(
        &self,
        atlas: &Atlas,
        kf: KeyFrameId,
        scw: &Sim3,
        candidates: &[MapPointId],
        _radius: f64,
    ) -> Vec<FuseOutcome> {
        let t_wc = atlas
            .keyframe(kf)
            .map(|k| k.pose_inverse())
            .unwrap_or_else(SE3::identity);

        candidates
            .iter()
            .map(|&candidate| {
                let Some(mp) = atlas.map_point(candidate) else {
                    return FuseOutcome::None;
                };
                let in_camera = scw.transform_point(&mp.world_pos());
                let in_world = t_wc.transform_point(&in_camera);
                match self.matching_slot(atlas, kf, &in_world) {
                    Some(slot) => {
                        let existing = atlas
                            .keyframe(kf)
                            .and_then(|k| k.map_point(slot))
                            .expect("matching slot is occupied");
                        if existing == candidate {
                            FuseOutcome::None
                        } else {
                            FuseOutcome::Duplicate { existing }
                        }
                    }
                    None => FuseOutcome::None,
                }
            })
            .collect()
    }
}

// ── Optimizer ────────────────────────────────────────────────────────────

/// Records every optimization call; global BA stages identity corrections
/// with the proper stamps.
pub struct RecordingOptimizer {
    pub calls: Mutex<Vec<String>>,
    /// When set, `global_bundle_adjustment` blocks on this channel first.
    pub gba_gate: Option<Receiver<()>>,
}

impl RecordingOptimizer {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gba_gate: None,
        }
    }

    pub fn gated(gate: Receiver<()>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            gba_gate: Some(gate),
        }
    }

    pub fn called(&self, prefix: &str) -> bool {
        self.calls.lock().iter().any(|c| c.starts_with(prefix))
    }
}

impl Optimizer for RecordingOptimizer {
    fn optimize_sim3(
        &self,
        _atlas: &Atlas,
        current: KeyFrameId,
        matched: KeyFrameId,
        matches: &mut [Option<MapPointId>],
        _s_cm: &mut Sim3,
        _iterations: usize,
        _fix_scale: bool,
    ) -> usize {
        self.calls
            .lock()
            .push(format!("optimize_sim3 {current} {matched}"));
        matches.iter().flatten().count()
    }

    fn optimize_essential_graph(
        &self,
        _atlas: &mut Atlas,
        map: MapId,
        matched_kf: KeyFrameId,
        current_kf: KeyFrameId,
        _problem: &EssentialGraphProblem,
        _fix_scale: bool,
    ) {
        self.calls.lock().push(format!(
            "optimize_essential_graph {map} {matched_kf} {current_kf}"
        ));
    }

    fn optimize_essential_graph_4dof(
        &self,
        _atlas: &mut Atlas,
        map: MapId,
        matched_kf: KeyFrameId,
        current_kf: KeyFrameId,
        _problem: &EssentialGraphProblem,
    ) {
        self.calls.lock().push(format!(
            "optimize_essential_graph_4dof {map} {matched_kf} {current_kf}"
        ));
    }

    fn optimize_essential_graph_partial(
        &self,
        _atlas: &mut Atlas,
        current_kf: KeyFrameId,
        _fixed_kfs: &[KeyFrameId],
        _fixed_corrected_kfs: &[KeyFrameId],
        outside_kfs: &[KeyFrameId],
        _outside_mps: &[MapPointId],
    ) {
        self.calls.lock().push(format!(
            "optimize_essential_graph_partial {current_kf} outside={}",
            outside_kfs.len()
        ));
    }

    fn local_bundle_adjustment(
        &self,
        _atlas: &mut Atlas,
        current: KeyFrameId,
        adjusted: &[KeyFrameId],
        fixed: &[KeyFrameId],
        _stop: &AtomicBool,
    ) {
        self.calls.lock().push(format!(
            "local_bundle_adjustment {current} adjusted={} fixed={}",
            adjusted.len(),
            fixed.len()
        ));
    }

    fn merge_inertial_ba(
        &self,
        _atlas: &mut Atlas,
        current: KeyFrameId,
        matched: KeyFrameId,
        _map: MapId,
        _stop: &AtomicBool,
    ) {
        self.calls
            .lock()
            .push(format!("merge_inertial_ba {current} {matched}"));
    }

    fn inertial_optimization(&self, _atlas: &mut Atlas, map: MapId) -> ImuBias {
        self.calls.lock().push(format!("inertial_optimization {map}"));
        ImuBias::zero()
    }

    fn global_bundle_adjustment(
        &self,
        atlas: &RwLock<Atlas>,
        map: MapId,
        _iterations: usize,
        loop_kf: KeyFrameId,
        stop: &AtomicBool,
    ) {
        if let Some(gate) = &self.gba_gate {
            let _ = gate.recv();
        }
        self.calls
            .lock()
            .push(format!("global_bundle_adjustment {map} {loop_kf}"));
        if stop.load(Ordering::SeqCst) {
            return;
        }
        stage_identity_gba(atlas, map, loop_kf);
    }

    fn full_inertial_ba(
        &self,
        atlas: &RwLock<Atlas>,
        map: MapId,
        _iterations: usize,
        loop_kf: KeyFrameId,
        stop: &AtomicBool,
    ) {
        self.calls
            .lock()
            .push(format!("full_inertial_ba {map} {loop_kf}"));
        if stop.load(Ordering::SeqCst) {
            return;
        }
        stage_identity_gba(atlas, map, loop_kf);
    }
}

/// Stage current poses/positions as the "optimized" result.
fn stage_identity_gba(atlas: &RwLock<Atlas>, map: MapId, loop_kf: KeyFrameId) {
    let mut atlas = atlas.write();
    for kf_id in atlas.all_keyframes(map) {
        if let Some(kf) = atlas.keyframe_mut(kf_id) {
            kf.pose_gba = Some(kf.pose().clone());
            kf.ba_global_for = Some(loop_kf);
        }
    }
    for mp_id in atlas.all_map_points(map) {
        if let Some(mp) = atlas.map_point_mut(mp_id) {
            mp.pos_gba = Some(mp.world_pos());
            mp.ba_global_for = Some(loop_kf);
        }
    }
}

// ── Local mapper / tracker doubles ───────────────────────────────────────

/// Background thread acknowledging stop requests like a local mapper
/// would.
pub struct AutoMapper {
    pub control: Arc<MapperControl>,
    kill: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl AutoMapper {
    pub fn start() -> Self {
        let control = Arc::new(MapperControl::new());
        let kill = Arc::new(AtomicBool::new(false));
        let thread_control = control.clone();
        let thread_kill = kill.clone();
        let handle = thread::spawn(move || {
            while !thread_kill.load(Ordering::SeqCst) {
                if thread_control.stop_requested() && !thread_control.is_stopped() {
                    thread_control.acknowledge_stop();
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        Self {
            control,
            kill,
            handle: Some(handle),
        }
    }
}

impl Drop for AutoMapper {
    fn drop(&mut self) {
        self.kill.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Tracker double recording the calls it receives.
#[derive(Default)]
pub struct NullTracker {
    pub last_kf: Mutex<Option<KeyFrameId>>,
    pub teleported: AtomicBool,
    pub imu_updates: Mutex<Vec<f64>>,
}

impl TrackerBridge for NullTracker {
    fn last_keyframe(&self) -> Option<KeyFrameId> {
        *self.last_kf.lock()
    }

    fn update_frame_imu(&self, scale: f64, _bias: ImuBias, _keyframe: Option<KeyFrameId>) {
        self.imu_updates.lock().push(scale);
    }

    fn lock_pre_teleport_translation(&self, _locked: bool) {}

    fn set_teleported(&self) {
        self.teleported.store(true, Ordering::SeqCst);
    }
}

// ── Fixtures ─────────────────────────────────────────────────────────────

/// Deterministic, well-spread landmark positions.
pub fn scattered_positions(n: usize) -> Vec<Vector3<f64>> {
    (0..n)
        .map(|i| {
            let f = i as f64;
            Vector3::new(
                (f * 0.37).sin() * 4.0,
                (f * 0.71).cos() * 3.0,
                5.0 + (f * 0.13).sin() * 2.0,
            )
        })
        .collect()
}

/// Worker context with all collaborators replaced by doubles.
pub fn make_ctx(
    atlas: Arc<RwLock<Atlas>>,
    sensor: Sensor,
) -> (WorkerCtx, AutoMapper, Arc<RecordingOptimizer>, Arc<NullTracker>) {
    let mapper = AutoMapper::start();
    let optimizer = Arc::new(RecordingOptimizer::new());
    let tracker = Arc::new(NullTracker::default());
    let ctx = WorkerCtx {
        atlas,
        matcher: Arc::new(GeometricMatcher::new()),
        optimizer: optimizer.clone(),
        mapper: mapper.control.clone(),
        tracker: tracker.clone(),
        gba: Arc::new(GbaSupervisor::new()),
        config: LoopClosingConfig {
            sensor,
            ..LoopClosingConfig::default()
        },
    };
    (ctx, mapper, optimizer, tracker)
}

/// A loop-closure fixture: one map holding an "old" region (the matched
/// keyframe and two neighbors) and a "new" region (the current keyframe
/// and three neighbors) observing `n_points` duplicated landmarks at the
/// same world positions.
pub struct RevisitFixture {
    pub atlas: Arc<RwLock<Atlas>>,
    pub map: MapId,
    pub current: KeyFrameId,
    pub current_neighbors: Vec<KeyFrameId>,
    pub matched: KeyFrameId,
    pub matched_neighbors: Vec<KeyFrameId>,
    pub old_points: Vec<MapPointId>,
    pub new_points: Vec<MapPointId>,
}

impl RevisitFixture {
    pub fn build(n_points: usize) -> Self {
        let mut atlas = Atlas::new();
        let map = atlas.current_map_id();
        let positions = scattered_positions(n_points);

        // Old region.
        let matched = atlas.create_keyframe(map, SE3::identity(), n_points);
        let matched_neighbors: Vec<KeyFrameId> = (0..2)
            .map(|_| atlas.create_keyframe(map, SE3::identity(), n_points))
            .collect();
        let old_points: Vec<MapPointId> = positions
            .iter()
            .map(|p| atlas.create_map_point(map, *p, matched))
            .collect();
        for (slot, &mp) in old_points.iter().enumerate() {
            atlas.associate(matched, slot, mp);
            for &nb in &matched_neighbors {
                atlas.associate(nb, slot, mp);
            }
        }

        // Filler so the map passes the minimum-size precondition.
        for _ in 0..6 {
            atlas.create_keyframe(map, SE3::identity(), 0);
        }

        // New region, observing duplicated landmarks.
        let current_neighbors: Vec<KeyFrameId> = (0..3)
            .map(|_| atlas.create_keyframe(map, SE3::identity(), n_points))
            .collect();
        let current = atlas.create_keyframe(map, SE3::identity(), n_points);
        let new_points: Vec<MapPointId> = positions
            .iter()
            .map(|p| atlas.create_map_point(map, *p, current))
            .collect();
        for (slot, &mp) in new_points.iter().enumerate() {
            atlas.associate(current, slot, mp);
            for &nb in &current_neighbors {
                atlas.associate(nb, slot, mp);
            }
        }

        // Covisibility inside each region only: the two regions must not
        // be connected, otherwise detection rejects the candidate as
        // same-neighborhood.
        for &kf in &[matched] {
            for &nb in &matched_neighbors {
                atlas.keyframe_mut(kf).unwrap().set_covisibility_weight(nb, n_points);
                atlas.keyframe_mut(nb).unwrap().set_covisibility_weight(kf, n_points);
            }
        }
        for &nb in &current_neighbors {
            atlas.keyframe_mut(current).unwrap().set_covisibility_weight(nb, n_points);
            atlas.keyframe_mut(nb).unwrap().set_covisibility_weight(current, n_points);
        }

        // BoW entries: the matched keyframe is retrievable, the current
        // keyframe knows its own histogram.
        let bow: HashMap<u32, f64> = [(1u32, 1.0f64)].into_iter().collect();
        atlas.keyframe_mut(matched).unwrap().bow = Some(bow.clone());
        atlas.keyframe_mut(current).unwrap().bow = Some(bow.clone());
        atlas.keyframe_db.add(matched, bow, map);

        // A second live map suppresses the post-loop global BA, keeping
        // single-threaded tests deterministic.
        let extra = atlas.create_map();
        atlas.change_map(map);
        atlas.create_keyframe(extra, SE3::identity(), 0);
        atlas.map_mut(map).unwrap().set_imu_initialized();

        Self {
            atlas: Arc::new(RwLock::new(atlas)),
            map,
            current,
            current_neighbors,
            matched,
            matched_neighbors,
            old_points,
            new_points,
        }
    }
}
