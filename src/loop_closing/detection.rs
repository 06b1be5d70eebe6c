//! Common-region detection: the per-keyframe state machine deciding
//! whether the current keyframe re-observes a mapped region.
//!
//! Two tracks run the same algorithm with independent state: the **loop**
//! track matches inside the active map, the **merge** track matches into
//! other maps of the Atlas. A track survives across keyframes as long as
//! its hypothesis keeps verifying; after three consecutive verifications
//! the detection is committed to the worker.

use std::collections::HashSet;

use nalgebra::Vector3;
use parking_lot::RwLock;

use crate::atlas::{Atlas, KeyFrameId, MapPointId};
use crate::geometry::Sim3;
use crate::interfaces::{FeatureMatcher, Optimizer, ProjectionParams};
use crate::sensor::Sensor;

use super::sim3_solver::{Sim3Ransac, Sim3RansacParams, Sim3RansacStatus};

/// Thresholds of the detection pipeline.
#[derive(Debug, Clone)]
pub struct DetectionParams {
    /// BoW candidates fetched per track.
    pub num_bow_candidates: usize,
    /// Size of covisible windows around candidates.
    pub num_covisibles: usize,
    /// Projection matches required to enter Sim3 refinement.
    pub min_proj_matches: usize,
    /// Inliers required after Sim3 optimization on the refine path.
    pub min_proj_opt_matches: usize,
    /// Re-projection matches required to accept a hypothesis.
    pub min_reproj_matches: usize,
    /// Distinct BoW matches required to run RANSAC.
    pub min_bow_matches: usize,
    /// Inliers required after Sim3 optimization on the BoW path.
    pub min_sim3_inliers: usize,
    /// Covisible keyframes of the current frame that must verify the
    /// candidate for an immediate commit.
    pub parallax_consensus: usize,
    /// RANSAC configuration (scale fixing is decided per map).
    pub ransac: Sim3RansacParams,
    /// RANSAC chunk size per `iterate` call.
    pub ransac_chunk: usize,
    /// Projection window on the refine path.
    pub refine_projection: ProjectionParams,
    /// Coarse projection window on the BoW path.
    pub coarse_projection: ProjectionParams,
    /// Fine projection window after Sim3 optimization.
    pub fine_projection: ProjectionParams,
    /// Minimum keyframes in the active map before detection runs.
    pub min_map_keyframes: usize,
    /// Stricter bound for stereo rigs.
    pub min_map_keyframes_stereo: usize,
}

impl Default for DetectionParams {
    fn default() -> Self {
        Self {
            num_bow_candidates: 3,
            num_covisibles: 10,
            min_proj_matches: 30,
            min_proj_opt_matches: 50,
            min_reproj_matches: 100,
            min_bow_matches: 20,
            min_sim3_inliers: 20,
            parallax_consensus: 3,
            ransac: Sim3RansacParams::default(),
            ransac_chunk: 20,
            refine_projection: ProjectionParams {
                radius: 3.0,
                ratio: 1.5,
            },
            coarse_projection: ProjectionParams {
                radius: 8.0,
                ratio: 1.5,
            },
            fine_projection: ProjectionParams {
                radius: 5.0,
                ratio: 1.0,
            },
            min_map_keyframes: 12,
            min_map_keyframes_stereo: 5,
        }
    }
}

/// Persistent state of one detection track (loop or merge).
#[derive(Debug, Default)]
pub struct RegionTrack {
    /// Consecutive keyframes on which the hypothesis verified.
    pub num_coincidences: usize,
    /// Consecutive keyframes on which it failed.
    pub num_not_found: usize,
    /// Hypothesized partner keyframe (pinned while set).
    pub matched_kf: Option<KeyFrameId>,
    /// Most recent own keyframe that verified (pinned while set).
    pub last_current_kf: Option<KeyFrameId>,
    /// Cumulative world-to-`last_current_kf` similarity.
    pub scw: Sim3,
    /// Candidate-side map points around the partner.
    pub map_points: Vec<MapPointId>,
    /// Slot-indexed matches on the last verified own keyframe.
    pub matched_map_points: Vec<Option<MapPointId>>,
    /// Raised when `num_coincidences` reached the commit threshold.
    pub detected: bool,
}

impl RegionTrack {
    pub fn is_active(&self) -> bool {
        self.num_coincidences > 0
    }

    /// Drop all state, releasing the pins held on the anchor keyframes.
    pub fn clear(&mut self, atlas: &RwLock<Atlas>) {
        let last = self.last_current_kf.take();
        let matched = self.matched_kf.take();
        if last.is_some() || matched.is_some() {
            let mut atlas = atlas.write();
            if let Some(kf) = last {
                atlas.set_erase(kf);
            }
            if let Some(kf) = matched {
                atlas.set_erase(kf);
            }
        }
        self.num_coincidences = 0;
        self.num_not_found = 0;
        self.scw = Sim3::identity();
        self.map_points.clear();
        self.matched_map_points.clear();
        self.detected = false;
    }
}

/// What the detector concluded for one keyframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Preconditions failed; the keyframe went straight to the database.
    Skipped,
    /// No track committed this iteration.
    NoDetection,
    /// At least one track committed (see the tracks' `detected` flags).
    Detected,
}

/// Detection context borrowed from the worker for one keyframe.
pub(crate) struct Detector<'a> {
    pub atlas: &'a RwLock<Atlas>,
    pub matcher: &'a dyn FeatureMatcher,
    pub optimizer: &'a dyn Optimizer,
    pub params: &'a DetectionParams,
    pub sensor: Sensor,
}

impl<'a> Detector<'a> {
    /// Run both tracks for `current`, which the caller has already pinned.
    ///
    /// The dequeue pin is always released here; tracks that keep referring
    /// to `current` hold their own pin.
    pub fn detect_common_regions(
        &self,
        current: KeyFrameId,
        loop_track: &mut RegionTrack,
        merge_track: &mut RegionTrack,
    ) -> DetectionOutcome {
        if self.skip_preconditions(current) {
            self.add_to_database(current);
            self.release_dequeue_pin(current);
            return DetectionOutcome::Skipped;
        }

        // Geometric continuation of an existing hypothesis.
        let loop_in_kf = self.advance_track(current, loop_track);
        let merge_in_kf = self.advance_track(current, merge_track);

        if loop_track.detected || merge_track.detected {
            self.add_to_database(current);
            self.release_dequeue_pin(current);
            return DetectionOutcome::Detected;
        }

        // Fresh search in the BoW database.
        let (loop_cands, merge_cands) = if !loop_in_kf || !merge_in_kf {
            self.query_database(current)
        } else {
            (Vec::new(), Vec::new())
        };

        if !loop_in_kf && !loop_cands.is_empty() {
            self.detect_from_bow(current, &loop_cands, loop_track);
        }
        if !merge_in_kf && !merge_cands.is_empty() {
            self.detect_from_bow(current, &merge_cands, merge_track);
        }

        self.add_to_database(current);

        if loop_track.detected || merge_track.detected {
            self.release_dequeue_pin(current);
            DetectionOutcome::Detected
        } else {
            self.release_dequeue_pin(current);
            DetectionOutcome::NoDetection
        }
    }

    /// Map-maturity preconditions: too-young maps produce spurious matches.
    fn skip_preconditions(&self, current: KeyFrameId) -> bool {
        let atlas = self.atlas.read();
        let Some(kf) = atlas.keyframe(current) else {
            return true;
        };
        let Some(map) = atlas.map(kf.map_id) else {
            return true;
        };

        if self.sensor.is_inertial() && !map.inertial_ba2_done() {
            return true;
        }
        if self.sensor == Sensor::Stereo
            && map.num_keyframes() < self.params.min_map_keyframes_stereo
        {
            return true;
        }
        map.num_keyframes() < self.params.min_map_keyframes
    }

    fn add_to_database(&self, current: KeyFrameId) {
        let mut atlas = self.atlas.write();
        let Some(kf) = atlas.keyframe(current) else {
            return;
        };
        let bow = kf.bow.clone().unwrap_or_default();
        let map = kf.map_id;
        atlas.keyframe_db.add(current, bow, map);
    }

    fn release_dequeue_pin(&self, current: KeyFrameId) {
        self.atlas.write().set_erase(current);
    }

    fn query_database(&self, current: KeyFrameId) -> (Vec<KeyFrameId>, Vec<KeyFrameId>) {
        let atlas = self.atlas.read();
        let Some(kf) = atlas.keyframe(current) else {
            return (Vec::new(), Vec::new());
        };
        let Some(bow) = kf.bow.as_ref() else {
            return (Vec::new(), Vec::new());
        };
        let connected = kf.connected_keyframes();
        atlas.keyframe_db.detect_n_best_candidates(
            current,
            bow,
            kf.map_id,
            &connected,
            self.params.num_bow_candidates,
        )
    }

    // ── Track continuation (cheap path) ──────────────────────────────────

    /// If the track is alive, verify its hypothesis against `current` using
    /// the pose-predicted similarity. Returns true when this keyframe
    /// produced a verification (successful or not, the track consumed it).
    fn advance_track(&self, current: KeyFrameId, track: &mut RegionTrack) -> bool {
        if !track.is_active() {
            return false;
        }
        let (matched, last) = match (track.matched_kf, track.last_current_kf) {
            (Some(m), Some(l)) => (m, l),
            _ => return false,
        };

        // Ŝ_cw = T_c,last ∘ S_last,w
        let predicted = {
            let atlas = self.atlas.read();
            let (Some(kf_c), Some(kf_l)) = (atlas.keyframe(current), atlas.keyframe(last)) else {
                return false;
            };
            let t_cl = kf_c.pose().compose(&kf_l.pose_inverse());
            Sim3::from_se3(&t_cl).compose(&track.scw)
        };

        match self.refine_from_prior(current, matched, &predicted) {
            Some(refined) => {
                track.num_coincidences += 1;
                track.num_not_found = 0;
                {
                    let mut atlas = self.atlas.write();
                    atlas.set_erase(last);
                    atlas.set_not_erase(current);
                }
                track.last_current_kf = Some(current);
                track.scw = refined.scw;
                track.map_points = refined.map_points;
                track.matched_map_points = refined.matched_map_points;
                track.detected = track.num_coincidences >= 3;
                true
            }
            None => {
                track.num_not_found += 1;
                if track.num_not_found >= 2 {
                    track.clear(self.atlas);
                }
                false
            }
        }
    }

    // ── Sim3 refinement from a prior (cheap path) ────────────────────────

    fn refine_from_prior(
        &self,
        current: KeyFrameId,
        matched: KeyFrameId,
        prior_scw: &Sim3,
    ) -> Option<RefinedHypothesis> {
        let params = self.params;

        let (num, _, _, matches) =
            self.find_matches_by_projection(current, matched, prior_scw, params.refine_projection);
        if num < params.min_proj_matches {
            return None;
        }

        // Optimize the relative similarity seeded by the prior.
        let (mut s_cm, fix_scale) = {
            let atlas = self.atlas.read();
            let kf_m = atlas.keyframe(matched)?;
            let map = atlas.map(atlas.keyframe(current)?.map_id)?;
            let s_wm = Sim3::from_se3(&kf_m.pose_inverse());
            (prior_scw.compose(&s_wm), self.sensor.fix_scale_for_map(map))
        };

        let mut opt_matches = matches;
        let num_opt = {
            let atlas = self.atlas.read();
            self.optimizer.optimize_sim3(
                &atlas,
                current,
                matched,
                &mut opt_matches,
                &mut s_cm,
                10,
                fix_scale,
            )
        };
        if num_opt <= params.min_proj_opt_matches {
            return None;
        }

        let refined_scw = {
            let atlas = self.atlas.read();
            let s_mw = Sim3::from_se3(atlas.keyframe(matched)?.pose());
            s_cm.compose(&s_mw)
        };

        let (num_rep, window_mps_rep, _, matches_rep) = self.find_matches_by_projection(
            current,
            matched,
            &refined_scw,
            params.refine_projection,
        );
        if num_rep < params.min_reproj_matches {
            return None;
        }

        Some(RefinedHypothesis {
            scw: refined_scw,
            map_points: window_mps_rep,
            matched_map_points: matches_rep,
        })
    }

    /// Quick verification used for the parallax consensus: project the
    /// candidate neighborhood into `kf` and count.
    fn verify_from_projection(&self, kf: KeyFrameId, matched: KeyFrameId, scw: &Sim3) -> bool {
        let (num, _, _, _) =
            self.find_matches_by_projection(kf, matched, scw, self.params.refine_projection);
        num >= self.params.min_proj_matches
    }

    /// Project the covisible neighborhood of `matched` into `current`.
    ///
    /// Returns (match count, window map points, per-point source keyframes,
    /// slot-indexed matches on `current`).
    fn find_matches_by_projection(
        &self,
        current: KeyFrameId,
        matched: KeyFrameId,
        scw: &Sim3,
        projection: ProjectionParams,
    ) -> (usize, Vec<MapPointId>, Vec<KeyFrameId>, Vec<Option<MapPointId>>) {
        let atlas = self.atlas.read();
        let n_cov = self.params.num_covisibles;

        let Some(kf_m) = atlas.keyframe(matched) else {
            return (0, Vec::new(), Vec::new(), Vec::new());
        };
        let mut window = kf_m.best_covisibles(n_cov);
        let initial = window.clone();
        window.push(matched);
        let mut in_window: HashSet<KeyFrameId> = window.iter().copied().collect();

        // Thin neighborhoods are widened one ring, avoiding the current
        // keyframe's own neighborhood.
        if initial.len() < n_cov {
            let current_neighbors = atlas
                .keyframe(current)
                .map(|kf| kf.connected_keyframes())
                .unwrap_or_default();
            for kf_id in initial {
                let Some(kf) = atlas.keyframe(kf_id) else {
                    continue;
                };
                let mut inserted = 0;
                for other in kf.best_covisibles(n_cov) {
                    if inserted >= n_cov {
                        break;
                    }
                    if !in_window.contains(&other) && !current_neighbors.contains(&other) {
                        in_window.insert(other);
                        window.push(other);
                        inserted += 1;
                    }
                }
            }
        }

        // Distinct candidate points with their source keyframe.
        let mut seen = HashSet::new();
        let mut points = Vec::new();
        let mut sources = Vec::new();
        for &kf_id in &window {
            let Some(kf) = atlas.keyframe(kf_id) else {
                continue;
            };
            for (_, mp_id) in kf.map_point_matches() {
                if atlas.map_point(mp_id).map_or(false, |mp| !mp.is_bad()) && seen.insert(mp_id) {
                    points.push(mp_id);
                    sources.push(kf_id);
                }
            }
        }

        let matches =
            self.matcher
                .search_by_projection(&atlas, current, scw, &points, None, projection);
        let num = matches.iter().flatten().count();
        (num, points, sources, matches)
    }

    // ── Fresh detection from BoW candidates (expensive path) ─────────────

    /// Try every BoW candidate; the best verified one (by re-projection
    /// count) initializes `track`. Returns true when the track committed
    /// immediately through parallax consensus.
    pub(crate) fn detect_from_bow(
        &self,
        current: KeyFrameId,
        candidates: &[KeyFrameId],
        track: &mut RegionTrack,
    ) -> bool {
        let params = self.params;

        struct Best {
            reproj_matches: usize,
            coincidences: usize,
            matched_kf: KeyFrameId,
            scw: Sim3,
            map_points: Vec<MapPointId>,
            matched_map_points: Vec<Option<MapPointId>>,
        }
        let mut best: Option<Best> = None;

        let connected = {
            let atlas = self.atlas.read();
            atlas
                .keyframe(current)
                .map(|kf| kf.connected_keyframes())
                .unwrap_or_default()
        };

        for &candidate in candidates {
            let Some(seed) = self.bow_seed(current, candidate, &connected) else {
                continue;
            };
            if seed.slot_matches_count < params.min_bow_matches {
                continue;
            }

            // RANSAC over the 3D-3D pairs in bounded chunks.
            let fix_scale = {
                let atlas = self.atlas.read();
                let Some(map) = atlas.keyframe(current).and_then(|kf| atlas.map(kf.map_id))
                else {
                    continue;
                };
                self.sensor.fix_scale_for_map(map)
            };
            let mut solver = Sim3Ransac::new(
                seed.points_matched,
                seed.points_current,
                Sim3RansacParams {
                    fix_scale,
                    ..params.ransac
                },
            );
            let mut status = Sim3RansacStatus::InProgress;
            while matches!(status, Sim3RansacStatus::InProgress) {
                status = solver.iterate(params.ransac_chunk);
            }
            let Sim3RansacStatus::Converged {
                transform: mut s_cm,
                ..
            } = status
            else {
                continue;
            };

            // Coarse projection of the candidate neighborhood.
            let scw = {
                let atlas = self.atlas.read();
                let Some(kf) = atlas.keyframe(candidate) else {
                    continue;
                };
                s_cm.compose(&Sim3::from_se3(kf.pose()))
            };
            let (points, sources) = self.neighborhood_points(candidate);
            let coarse_matches = {
                let atlas = self.atlas.read();
                self.matcher.search_by_projection(
                    &atlas,
                    current,
                    &scw,
                    &points,
                    Some(&sources),
                    params.coarse_projection,
                )
            };
            if coarse_matches.iter().flatten().count() < params.min_proj_opt_matches {
                continue;
            }

            // Nonlinear refinement of the relative similarity.
            let mut opt_matches = coarse_matches;
            let num_opt = {
                let atlas = self.atlas.read();
                self.optimizer.optimize_sim3(
                    &atlas,
                    current,
                    candidate,
                    &mut opt_matches,
                    &mut s_cm,
                    10,
                    self.sensor.fix_scale(),
                )
            };
            if num_opt < params.min_sim3_inliers {
                continue;
            }

            // Fine re-projection with the optimized similarity.
            let scw = {
                let atlas = self.atlas.read();
                let Some(kf) = atlas.keyframe(candidate) else {
                    continue;
                };
                s_cm.compose(&Sim3::from_se3(kf.pose()))
            };
            let fine_matches = {
                let atlas = self.atlas.read();
                self.matcher.search_by_projection(
                    &atlas,
                    current,
                    &scw,
                    &points,
                    None,
                    params.fine_projection,
                )
            };
            let num_fine = fine_matches.iter().flatten().count();
            if num_fine < params.min_reproj_matches {
                continue;
            }

            // Parallax consensus: the current keyframe's own neighbors must
            // also see the candidate region.
            let neighbors = {
                let atlas = self.atlas.read();
                atlas
                    .keyframe(current)
                    .map(|kf| kf.best_covisibles(params.num_covisibles))
                    .unwrap_or_default()
            };
            let mut consensus = 0;
            for neighbor in neighbors {
                if consensus >= params.parallax_consensus {
                    break;
                }
                let s_jw = {
                    let atlas = self.atlas.read();
                    let (Some(kf_j), Some(kf_c)) =
                        (atlas.keyframe(neighbor), atlas.keyframe(current))
                    else {
                        continue;
                    };
                    let t_jc = kf_j.pose().compose(&kf_c.pose_inverse());
                    Sim3::from_se3(&t_jc).compose(&scw)
                };
                if self.verify_from_projection(neighbor, candidate, &s_jw) {
                    consensus += 1;
                }
            }

            if best.as_ref().map_or(true, |b| num_fine > b.reproj_matches) {
                best = Some(Best {
                    reproj_matches: num_fine,
                    coincidences: consensus,
                    matched_kf: candidate,
                    scw,
                    map_points: points,
                    matched_map_points: fine_matches,
                });
            }
        }

        if let Some(best) = best {
            {
                // Pin the new anchors before releasing any previous ones,
                // so a keyframe serving both roles never transits through
                // an unpinned state.
                let mut atlas = self.atlas.write();
                atlas.set_not_erase(best.matched_kf);
                atlas.set_not_erase(current);
                if let Some(prev) = track.matched_kf.take() {
                    atlas.set_erase(prev);
                }
                if let Some(prev) = track.last_current_kf.take() {
                    atlas.set_erase(prev);
                }
            }
            track.matched_kf = Some(best.matched_kf);
            track.last_current_kf = Some(current);
            track.num_coincidences = best.coincidences;
            track.num_not_found = 0;
            track.scw = best.scw;
            track.map_points = best.map_points;
            track.matched_map_points = best.matched_map_points;
            track.detected = best.coincidences >= 3;
            if !track.detected {
                tracing::debug!(
                    "place recognition: candidate {} verified with {} matches, \
                     consensus {}/{}",
                    best.matched_kf,
                    best.reproj_matches,
                    best.coincidences,
                    self.params.parallax_consensus,
                );
            }
            track.detected
        } else {
            false
        }
    }

    /// BoW matching of `current` against the candidate's covisible window,
    /// producing deduplicated 3D-3D pairs for RANSAC.
    fn bow_seed(
        &self,
        current: KeyFrameId,
        candidate: KeyFrameId,
        connected: &HashSet<KeyFrameId>,
    ) -> Option<BowSeed> {
        let atlas = self.atlas.read();
        let kf_cand = atlas.keyframe(candidate)?;
        if kf_cand.is_bad() {
            return None;
        }

        let mut window = kf_cand.best_covisibles(self.params.num_covisibles);
        window.insert(0, candidate);

        // A candidate inside the current neighborhood is not a loop, it is
        // the same place seen a moment ago.
        if window.iter().any(|kf| connected.contains(kf)) {
            return None;
        }

        let kf_c = atlas.keyframe(current)?;
        let num_slots = kf_c.num_features();
        let mut slot_matches: Vec<Option<MapPointId>> = vec![None; num_slots];
        let mut seen: HashSet<MapPointId> = HashSet::new();
        let mut count = 0usize;

        for &window_kf in &window {
            if atlas.keyframe(window_kf).map_or(true, |kf| kf.is_bad()) {
                continue;
            }
            for (slot, mp) in self.matcher.search_by_bow(&atlas, current, window_kf) {
                if slot >= num_slots {
                    continue;
                }
                if atlas.map_point(mp).map_or(true, |p| p.is_bad()) {
                    continue;
                }
                if seen.insert(mp) {
                    count += 1;
                    slot_matches[slot] = Some(mp);
                }
            }
        }

        // 3D-3D pairs: both sides must have geometry for the slot.
        let t_cw = kf_c.pose().clone();
        let t_mw = atlas.keyframe(candidate)?.pose().clone();
        let mut points_current = Vec::new();
        let mut points_matched = Vec::new();
        for (slot, matched_mp) in slot_matches.iter().enumerate() {
            let (Some(matched_mp), Some(own_mp)) = (matched_mp, kf_c.map_point(slot)) else {
                continue;
            };
            let (Some(own), Some(other)) = (atlas.map_point(own_mp), atlas.map_point(*matched_mp))
            else {
                continue;
            };
            points_current.push(t_cw.transform_point(&own.world_pos()));
            points_matched.push(t_mw.transform_point(&other.world_pos()));
        }

        Some(BowSeed {
            slot_matches_count: count,
            points_current,
            points_matched,
        })
    }

    /// Distinct map points around a keyframe (best covisibles + itself).
    fn neighborhood_points(&self, kf_id: KeyFrameId) -> (Vec<MapPointId>, Vec<KeyFrameId>) {
        let atlas = self.atlas.read();
        let Some(kf) = atlas.keyframe(kf_id) else {
            return (Vec::new(), Vec::new());
        };
        let mut window = kf.best_covisibles(self.params.num_covisibles);
        window.push(kf_id);

        let mut seen = HashSet::new();
        let mut points = Vec::new();
        let mut sources = Vec::new();
        for w in window {
            let Some(wkf) = atlas.keyframe(w) else {
                continue;
            };
            for (_, mp) in wkf.map_point_matches() {
                if atlas.map_point(mp).map_or(false, |p| !p.is_bad()) && seen.insert(mp) {
                    points.push(mp);
                    sources.push(w);
                }
            }
        }
        (points, sources)
    }
}

struct RefinedHypothesis {
    scw: Sim3,
    map_points: Vec<MapPointId>,
    matched_map_points: Vec<Option<MapPointId>>,
}

struct BowSeed {
    slot_matches_count: usize,
    points_current: Vec<Vector3<f64>>,
    points_matched: Vec<Vector3<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loop_closing::testutil::{make_ctx, RevisitFixture};

    fn run_detection(
        fixture: &RevisitFixture,
        sensor: Sensor,
    ) -> (DetectionOutcome, RegionTrack, RegionTrack, std::sync::Arc<crate::loop_closing::testutil::RecordingOptimizer>) {
        let (ctx, _mapper, optimizer, _tracker) = make_ctx(fixture.atlas.clone(), sensor);
        let mut loop_track = RegionTrack::default();
        let mut merge_track = RegionTrack::default();

        fixture.atlas.write().set_not_erase(fixture.current);
        let detector = Detector {
            atlas: &ctx.atlas,
            matcher: ctx.matcher.as_ref(),
            optimizer: ctx.optimizer.as_ref(),
            params: &ctx.config.detection,
            sensor: ctx.config.sensor,
        };
        let outcome =
            detector.detect_common_regions(fixture.current, &mut loop_track, &mut merge_track);
        (outcome, loop_track, merge_track, optimizer)
    }

    #[test]
    fn test_clean_revisit_commits_through_parallax_consensus() {
        let fixture = RevisitFixture::build(120);
        let (outcome, loop_track, merge_track, _) = run_detection(&fixture, Sensor::Monocular);

        assert_eq!(outcome, DetectionOutcome::Detected);
        assert!(loop_track.detected);
        assert_eq!(loop_track.matched_kf, Some(fixture.matched));
        assert_eq!(loop_track.last_current_kf, Some(fixture.current));
        assert!(loop_track.num_coincidences >= 3);
        assert!(!merge_track.detected);

        // Track anchors are pinned; the dequeue pin was released.
        let atlas = fixture.atlas.read();
        assert!(atlas.keyframe(fixture.matched).unwrap().is_pinned());
        assert!(atlas.keyframe(fixture.current).unwrap().is_pinned());
    }

    #[test]
    fn test_sub_threshold_reprojection_does_not_commit() {
        // 95 duplicated landmarks: every stage passes except the final
        // 100-match re-projection gate.
        let fixture = RevisitFixture::build(95);
        let (outcome, loop_track, merge_track, _) = run_detection(&fixture, Sensor::Monocular);

        assert_eq!(outcome, DetectionOutcome::NoDetection);
        assert!(!loop_track.detected);
        assert_eq!(loop_track.num_coincidences, 0);
        assert!(loop_track.matched_kf.is_none());
        assert!(!merge_track.detected);

        // Nothing stays pinned after a miss.
        let atlas = fixture.atlas.read();
        assert!(!atlas.keyframe(fixture.current).unwrap().is_pinned());
        assert!(!atlas.keyframe(fixture.matched).unwrap().is_pinned());
    }

    #[test]
    fn test_same_neighborhood_candidate_is_rejected_before_ransac() {
        let fixture = RevisitFixture::build(120);
        // Connect the current keyframe to the candidate's neighborhood: the
        // match is now "the same place a moment ago", not a loop.
        {
            let mut atlas = fixture.atlas.write();
            let nb = fixture.matched_neighbors[0];
            atlas
                .keyframe_mut(fixture.current)
                .unwrap()
                .set_covisibility_weight(nb, 50);
            atlas
                .keyframe_mut(nb)
                .unwrap()
                .set_covisibility_weight(fixture.current, 50);
        }

        let (outcome, loop_track, _, optimizer) = run_detection(&fixture, Sensor::Monocular);

        assert_eq!(outcome, DetectionOutcome::NoDetection);
        assert!(!loop_track.detected);
        // The candidate was discarded before any geometric machinery ran.
        assert!(!optimizer.called("optimize_sim3"));
    }

    #[test]
    fn test_small_map_skips_detection() {
        let fixture = RevisitFixture::build(30);
        // Shrink the map below the 12-keyframe precondition by moving the
        // filler keyframes out of it.
        {
            let mut atlas = fixture.atlas.write();
            let ids = atlas.all_keyframes(fixture.map);
            let mut removed = 0;
            for kf in ids {
                let untouched = kf != fixture.current
                    && kf != fixture.matched
                    && !fixture.current_neighbors.contains(&kf)
                    && !fixture.matched_neighbors.contains(&kf);
                if untouched && removed < 6 {
                    atlas.map_mut(fixture.map).unwrap().erase_keyframe(kf);
                    removed += 1;
                }
            }
        }

        let (outcome, loop_track, merge_track, optimizer) =
            run_detection(&fixture, Sensor::Monocular);
        assert_eq!(outcome, DetectionOutcome::Skipped);
        assert!(!loop_track.detected && !merge_track.detected);
        assert!(optimizer.calls.lock().is_empty());
        // Skipped keyframes still land in the recognition database.
        assert!(fixture.atlas.read().keyframe_db.contains(fixture.current));
    }

    #[test]
    fn test_inertial_map_before_second_ba_stage_is_skipped() {
        let fixture = RevisitFixture::build(120);
        let (outcome, loop_track, _, _) = run_detection(&fixture, Sensor::ImuStereo);
        // The fixture map never ran the inertial BA stages.
        assert_eq!(outcome, DetectionOutcome::Skipped);
        assert!(!loop_track.detected);
    }

    #[test]
    fn test_track_continuation_drops_after_two_misses() {
        let fixture = RevisitFixture::build(120);
        let (_, mut loop_track, mut merge_track, _) = run_detection(&fixture, Sensor::Monocular);
        assert!(loop_track.detected);
        loop_track.detected = false;

        // Two keyframes far away from the hypothesis: both verifications
        // miss and the state drops.
        let (ctx, _mapper, _optimizer, _tracker) =
            make_ctx(fixture.atlas.clone(), Sensor::Monocular);
        let far_pose = crate::geometry::SE3::from_parts(
            nalgebra::UnitQuaternion::identity(),
            Vector3::new(500.0, 0.0, 0.0),
        );
        for step in 0..2 {
            let kf = {
                let mut atlas = ctx.atlas.write();
                let kf = atlas.create_keyframe(fixture.map, far_pose.clone(), 0);
                atlas.set_not_erase(kf);
                kf
            };
            let detector = Detector {
                atlas: &ctx.atlas,
                matcher: ctx.matcher.as_ref(),
                optimizer: ctx.optimizer.as_ref(),
                params: &ctx.config.detection,
                sensor: ctx.config.sensor,
            };
            detector.detect_common_regions(kf, &mut loop_track, &mut merge_track);
            if step == 0 {
                assert_eq!(loop_track.num_not_found, 1);
                assert!(loop_track.is_active());
            }
        }

        assert!(!loop_track.is_active());
        assert!(loop_track.matched_kf.is_none());
        let atlas = fixture.atlas.read();
        assert!(!atlas.keyframe(fixture.matched).unwrap().is_pinned());
        assert!(!atlas.keyframe(fixture.current).unwrap().is_pinned());
    }
}
