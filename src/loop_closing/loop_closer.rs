//! The loop-closing worker thread.
//!
//! One long-lived loop consumes the keyframe queue, runs the two-track
//! common-region detector, and on a committed detection dispatches either
//! the loop corrector or one of the map mergers. Global BA runs detached
//! under the [`GbaSupervisor`].

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::{Mutex, RwLock};

use crate::atlas::{Atlas, KeyFrameId, MapId};
use crate::geometry::Sim3;
use crate::interfaces::{FeatureMatcher, MapperControl, Optimizer, TrackerBridge};
use crate::sensor::Sensor;

use super::corrector::correct_loop;
use super::detection::{DetectionOutcome, DetectionParams, Detector, RegionTrack};
use super::gba::GbaSupervisor;
use super::merger::{merge_local, merge_local2};
use super::queue::KeyFrameQueue;

/// Idle poll period of the worker loop.
const IDLE_POLL: Duration = Duration::from_millis(5);
/// Poll period while a reset requester waits for the acknowledgement.
const RESET_ACK_POLL: Duration = Duration::from_millis(5);
/// Poll period for the active-map variant.
const RESET_MAP_ACK_POLL: Duration = Duration::from_millis(3);

/// Configuration of the loop-closing worker.
#[derive(Debug, Clone)]
pub struct LoopClosingConfig {
    /// Sensor suite of the frontend.
    pub sensor: Sensor,
    /// Master switch: with place recognition off, keyframes drain through
    /// the queue untouched.
    pub active: bool,
    /// Detection thresholds.
    pub detection: DetectionParams,
    /// Maximum |scale - 1| accepted for an inertial merge.
    pub merge_scale_gate: f64,
    /// Maximum pitch/roll of an inertial loop correction, in radians.
    pub loop_rotation_gate_pitch_roll: f64,
    /// Maximum yaw of an inertial loop correction, in radians.
    pub loop_rotation_gate_yaw: f64,
}

impl Default for LoopClosingConfig {
    fn default() -> Self {
        Self {
            sensor: Sensor::Monocular,
            active: true,
            detection: DetectionParams::default(),
            merge_scale_gate: 0.1,
            loop_rotation_gate_pitch_roll: 0.008,
            loop_rotation_gate_yaw: 0.349,
        }
    }
}

/// Worker counters, updated atomically so the handle can read them live.
#[derive(Debug, Default)]
pub struct LoopCloserStats {
    pub keyframes_processed: AtomicUsize,
    pub regions_detected: AtomicUsize,
    pub loops_closed: AtomicUsize,
    pub maps_merged: AtomicUsize,
}

#[derive(Debug, Default)]
struct StatusFlags {
    active: AtomicBool,
    finish_requested: AtomicBool,
    finished: AtomicBool,
    /// Latched when any loop was corrected.
    loop_closed: AtomicBool,
    /// Latched when a local map merge completed.
    merged_local_map: AtomicBool,
}

#[derive(Debug, Default)]
struct ResetState {
    reset_all: bool,
    reset_map: Option<MapId>,
}

/// Collaborators shared by the worker and its sub-procedures.
pub(crate) struct WorkerCtx {
    pub atlas: Arc<RwLock<Atlas>>,
    pub matcher: Arc<dyn FeatureMatcher>,
    pub optimizer: Arc<dyn Optimizer>,
    pub mapper: Arc<MapperControl>,
    pub tracker: Arc<dyn TrackerBridge>,
    pub gba: Arc<GbaSupervisor>,
    pub config: LoopClosingConfig,
}

/// The loop-closing worker.
pub struct LoopCloser {
    ctx: WorkerCtx,
    queue: Arc<KeyFrameQueue>,
    reset: Arc<Mutex<ResetState>>,
    stats: Arc<LoopCloserStats>,
    flags: Arc<StatusFlags>,
    loop_track: RegionTrack,
    merge_track: RegionTrack,
}

impl LoopCloser {
    pub fn new(
        atlas: Arc<RwLock<Atlas>>,
        matcher: Arc<dyn FeatureMatcher>,
        optimizer: Arc<dyn Optimizer>,
        mapper: Arc<MapperControl>,
        tracker: Arc<dyn TrackerBridge>,
        config: LoopClosingConfig,
    ) -> Self {
        let flags = Arc::new(StatusFlags {
            active: AtomicBool::new(config.active),
            ..StatusFlags::default()
        });
        Self {
            ctx: WorkerCtx {
                atlas,
                matcher,
                optimizer,
                mapper,
                tracker,
                gba: Arc::new(GbaSupervisor::new()),
                config,
            },
            queue: Arc::new(KeyFrameQueue::new()),
            reset: Arc::new(Mutex::new(ResetState::default())),
            stats: Arc::new(LoopCloserStats::default()),
            flags,
            loop_track: RegionTrack::default(),
            merge_track: RegionTrack::default(),
        }
    }

    /// Cloneable control handle for the other threads.
    pub fn handle(&self) -> LoopClosingHandle {
        LoopClosingHandle {
            atlas: self.ctx.atlas.clone(),
            queue: self.queue.clone(),
            reset: self.reset.clone(),
            stats: self.stats.clone(),
            flags: self.flags.clone(),
            gba: self.ctx.gba.clone(),
        }
    }

    /// Run the worker loop until a finish request arrives.
    pub fn run(&mut self) {
        tracing::info!("loop closing thread started");
        self.flags.finished.store(false, Ordering::SeqCst);

        loop {
            if self.queue.has_new_keyframes() {
                if self.flags.active.load(Ordering::SeqCst) {
                    self.process_next_keyframe();
                } else {
                    // Place recognition disabled: drain silently.
                    self.queue.pop();
                }
            }

            self.reset_if_requested();

            if self.flags.finish_requested.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(IDLE_POLL);
        }

        // Release any pins held by live tracks before exiting.
        self.loop_track.clear(&self.ctx.atlas);
        self.merge_track.clear(&self.ctx.atlas);

        self.flags.finished.store(true, Ordering::SeqCst);
        tracing::info!(
            "loop closing thread exiting: processed={}, detected={}, loops={}, merges={}",
            self.stats.keyframes_processed.load(Ordering::Relaxed),
            self.stats.regions_detected.load(Ordering::Relaxed),
            self.stats.loops_closed.load(Ordering::Relaxed),
            self.stats.maps_merged.load(Ordering::Relaxed),
        );
    }

    /// Move the worker onto its own thread.
    pub fn spawn(mut self) -> thread::JoinHandle<()> {
        thread::Builder::new()
            .name("loop-closing".into())
            .spawn(move || self.run())
            .expect("spawn loop closing thread")
    }

    /// One detection + dispatch round for the oldest queued keyframe.
    fn process_next_keyframe(&mut self) {
        let Some((current, _)) = self.queue.pop() else {
            return;
        };
        self.stats
            .keyframes_processed
            .fetch_add(1, Ordering::Relaxed);

        // Pin before anything else so the culling thread cannot race us.
        {
            let mut atlas = self.ctx.atlas.write();
            if atlas.keyframe(current).map_or(true, |kf| kf.is_bad()) {
                return;
            }
            atlas.set_not_erase(current);
        }

        let outcome = {
            let detector = Detector {
                atlas: &self.ctx.atlas,
                matcher: self.ctx.matcher.as_ref(),
                optimizer: self.ctx.optimizer.as_ref(),
                params: &self.ctx.config.detection,
                sensor: self.ctx.config.sensor,
            };
            detector.detect_common_regions(current, &mut self.loop_track, &mut self.merge_track)
        };
        if outcome != DetectionOutcome::Detected {
            return;
        }
        self.stats.regions_detected.fetch_add(1, Ordering::Relaxed);

        // A merge supersedes a loop detected in the same iteration.
        if self.merge_track.detected {
            let aborted_for_scale = self.handle_merge(current);
            if aborted_for_scale {
                // Nothing was mutated; the loop hypothesis stays alive and
                // is reconsidered with the next keyframe.
                return;
            }
            self.merge_track.clear(&self.ctx.atlas);
            if self.loop_track.detected {
                self.loop_track.clear(&self.ctx.atlas);
            }
        }

        if self.loop_track.detected {
            self.handle_loop(current);
            self.loop_track.clear(&self.ctx.atlas);
        }
    }

    /// Dispatch a committed merge. Returns true when the inertial
    /// pre-commit gate rejected the transform (merge state cleared, maps
    /// untouched).
    fn handle_merge(&mut self, current: KeyFrameId) -> bool {
        let Some(matched) = self.merge_track.matched_kf else {
            return false;
        };
        let sensor = self.ctx.config.sensor;

        let (imu_ready, inertial_ba1) = {
            let atlas = self.ctx.atlas.read();
            let map = atlas
                .keyframe(current)
                .and_then(|kf| atlas.map(kf.map_id));
            (
                map.map_or(false, |m| m.is_imu_initialized()),
                map.map_or(false, |m| m.inertial_ba1_done()),
            )
        };

        if sensor.is_inertial() && !imu_ready {
            tracing::warn!("IMU not initialized, merge aborted");
            return false;
        }

        // S_old,new: how the active map's world moves onto the other
        // map's frame.
        let mut s_old_new = {
            let atlas = self.ctx.atlas.read();
            let Some(kf) = atlas.keyframe(current) else {
                return false;
            };
            let s_cw1 = Sim3::from_se3(kf.pose());
            self.merge_track.scw.inverse().compose(&s_cw1)
        };

        if sensor.is_inertial() {
            if (s_old_new.scale - 1.0).abs() > self.ctx.config.merge_scale_gate {
                tracing::warn!(scale = s_old_new.scale, "badly estimated scale, merge aborted");
                self.merge_track.clear(&self.ctx.atlas);
                return true;
            }
            // Gravity is observable: only yaw may move once the first
            // inertial BA has run.
            if inertial_ba1 {
                let mut phi = s_old_new.rotation_log();
                phi.x = 0.0;
                phi.y = 0.0;
                s_old_new = Sim3::from_parts(
                    UnitQuaternion::from_scaled_axis(phi),
                    s_old_new.translation,
                    1.0,
                );
            }
        }

        let merge_scw = self.merge_track.scw.clone();

        self.ctx.mapper.set_done_viba(false);
        self.ctx.tracker.lock_pre_teleport_translation(true);

        if sensor.is_inertial() {
            merge_local2(&self.ctx, current, matched, &s_old_new);
        } else {
            merge_local(&self.ctx, current, matched, &merge_scw);
        }

        self.ctx.tracker.set_teleported();
        self.stats.maps_merged.fetch_add(1, Ordering::Relaxed);
        self.flags.merged_local_map.store(true, Ordering::SeqCst);
        false
    }

    /// Dispatch a committed loop closure.
    fn handle_loop(&mut self, current: KeyFrameId) {
        let Some(matched) = self.loop_track.matched_kf else {
            return;
        };
        let config = &self.ctx.config;
        let mut loop_scw = self.loop_track.scw.clone();
        let mut good_loop = true;

        if config.sensor.is_inertial() {
            let (t_wc, inertial_ba2) = {
                let atlas = self.ctx.atlas.read();
                let Some(kf) = atlas.keyframe(current) else {
                    return;
                };
                let ba2 = atlas
                    .map(kf.map_id)
                    .map_or(false, |m| m.inertial_ba2_done());
                (Sim3::from_se3(&kf.pose_inverse()), ba2)
            };

            // The correction seen from the world frame must be a
            // near-yaw-only rotation, otherwise the match contradicts
            // gravity.
            let mut s_ww_new = t_wc.compose(&loop_scw);
            let phi = s_ww_new.rotation_log();
            if phi.x.abs() < config.loop_rotation_gate_pitch_roll
                && phi.y.abs() < config.loop_rotation_gate_pitch_roll
                && phi.z.abs() < config.loop_rotation_gate_yaw
            {
                if inertial_ba2 {
                    let yaw_only = Vector3::new(0.0, 0.0, phi.z);
                    s_ww_new = Sim3::from_parts(
                        UnitQuaternion::from_scaled_axis(yaw_only),
                        s_ww_new.translation,
                        1.0,
                    );
                    loop_scw = t_wc.inverse().compose(&s_ww_new);
                }
            } else {
                tracing::warn!(?phi, "loop rotation contradicts gravity, rejected");
                good_loop = false;
            }
        }

        if good_loop {
            self.ctx.mapper.set_done_viba(false);
            self.ctx.tracker.lock_pre_teleport_translation(true);

            let map_points = std::mem::take(&mut self.loop_track.map_points);
            let matched_slots = std::mem::take(&mut self.loop_track.matched_map_points);
            correct_loop(
                &self.ctx,
                current,
                matched,
                loop_scw,
                &map_points,
                &matched_slots,
            );

            self.ctx.tracker.set_teleported();
            self.stats.loops_closed.fetch_add(1, Ordering::Relaxed);
            self.flags.loop_closed.store(true, Ordering::SeqCst);
        }
    }

    /// Request-ack reset handling, run between iterations.
    fn reset_if_requested(&mut self) {
        let mut state = self.reset.lock();
        if state.reset_all {
            tracing::info!("loop closing reset: dropping {} queued keyframes", self.queue.len());
            self.queue.clear();
            state.reset_all = false;
            state.reset_map = None;
        } else if let Some(map) = state.reset_map.take() {
            self.queue.clear_map(map);
        }
    }
}

/// Control handle shared with the tracker, the local mapper and the
/// system shutdown path.
#[derive(Clone)]
pub struct LoopClosingHandle {
    atlas: Arc<RwLock<Atlas>>,
    queue: Arc<KeyFrameQueue>,
    reset: Arc<Mutex<ResetState>>,
    stats: Arc<LoopCloserStats>,
    flags: Arc<StatusFlags>,
    gba: Arc<GbaSupervisor>,
}

impl LoopClosingHandle {
    /// Queue a keyframe for place recognition.
    pub fn insert_keyframe(&self, kf: KeyFrameId) {
        let map = {
            let atlas = self.atlas.read();
            atlas.keyframe(kf).map(|k| k.map_id)
        };
        if let Some(map) = map {
            self.queue.push(kf, map);
        }
    }

    /// Flush the whole queue. Blocks until the worker acknowledges.
    pub fn request_reset(&self) {
        self.reset.lock().reset_all = true;
        loop {
            if !self.reset.lock().reset_all {
                break;
            }
            thread::sleep(RESET_ACK_POLL);
        }
    }

    /// Flush only the entries belonging to `map`. Blocks until the worker
    /// acknowledges.
    pub fn request_reset_active_map(&self, map: MapId) {
        self.reset.lock().reset_map = Some(map);
        loop {
            if self.reset.lock().reset_map.is_none() {
                break;
            }
            thread::sleep(RESET_MAP_ACK_POLL);
        }
    }

    /// Stop the worker after its current iteration.
    pub fn request_finish(&self) {
        self.flags.finish_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.flags.finished.load(Ordering::SeqCst)
    }

    /// Toggle place recognition at runtime.
    pub fn set_active(&self, active: bool) {
        self.flags.active.store(active, Ordering::SeqCst);
    }

    pub fn is_running_gba(&self) -> bool {
        self.gba.is_running()
    }

    pub fn is_finished_gba(&self) -> bool {
        self.gba.is_finished()
    }

    /// A loop has been corrected at some point in this session.
    pub fn loop_closed(&self) -> bool {
        self.flags.loop_closed.load(Ordering::SeqCst)
    }

    /// A map merge completed at some point in this session.
    pub fn merged_local_map(&self) -> bool {
        self.flags.merged_local_map.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &LoopCloserStats {
        &self.stats
    }

    pub fn queued_keyframes(&self) -> usize {
        self.queue.len()
    }
}
