//! Sim3 RANSAC over 3D-3D correspondences (Horn's closed form).
//!
//! Estimates the similarity aligning the matched keyframe's camera frame
//! with the current keyframe's camera frame. The solver is driven in
//! bounded chunks — `iterate(n)` — so the detector can interleave
//! candidates without committing to a full RANSAC budget up front.

use nalgebra::{Matrix3, UnitQuaternion, Vector3};
use rand::prelude::*;

use crate::geometry::Sim3;

/// RANSAC configuration.
#[derive(Debug, Clone, Copy)]
pub struct Sim3RansacParams {
    /// Desired probability of having sampled an outlier-free triple.
    pub probability: f64,
    /// Inliers required to declare convergence.
    pub min_inliers: usize,
    /// Hard iteration budget.
    pub max_iterations: usize,
    /// Point-to-point inlier threshold in meters.
    pub inlier_threshold: f64,
    /// Fix the scale to 1 (observable-scale configurations).
    pub fix_scale: bool,
}

impl Default for Sim3RansacParams {
    fn default() -> Self {
        Self {
            probability: 0.99,
            min_inliers: 15,
            max_iterations: 300,
            inlier_threshold: 0.075,
            fix_scale: true,
        }
    }
}

/// Progress report of a chunked RANSAC run.
#[derive(Debug, Clone)]
pub enum Sim3RansacStatus {
    /// Budget left, no convergence yet.
    InProgress,
    /// Enough inliers were found; the refined estimate is final.
    Converged {
        transform: Sim3,
        inliers: Vec<usize>,
    },
    /// Budget exhausted without convergence.
    NoMore,
}

impl Sim3RansacStatus {
    pub fn is_converged(&self) -> bool {
        matches!(self, Sim3RansacStatus::Converged { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Sim3RansacStatus::NoMore)
    }
}

/// Incremental Sim3 RANSAC solver.
#[derive(Debug)]
pub struct Sim3Ransac {
    /// Matched 3D points in the matched keyframe's camera frame.
    points_matched: Vec<Vector3<f64>>,
    /// The same correspondences in the current keyframe's camera frame.
    points_current: Vec<Vector3<f64>>,
    params: Sim3RansacParams,
    rng: rand::rngs::ThreadRng,

    iterations_done: usize,
    adaptive_max: usize,
    best_transform: Option<Sim3>,
    best_inliers: Vec<usize>,
}

impl Sim3Ransac {
    /// Build a solver from paired camera-frame points; entry `i` of both
    /// slices describes the same correspondence.
    pub fn new(
        points_matched: Vec<Vector3<f64>>,
        points_current: Vec<Vector3<f64>>,
        params: Sim3RansacParams,
    ) -> Self {
        debug_assert_eq!(points_matched.len(), points_current.len());
        let adaptive_max = params.max_iterations;
        Self {
            points_matched,
            points_current,
            params,
            rng: rand::thread_rng(),
            iterations_done: 0,
            adaptive_max,
            best_transform: None,
            best_inliers: Vec::new(),
        }
    }

    /// Run up to `n` more RANSAC iterations.
    pub fn iterate(&mut self, n: usize) -> Sim3RansacStatus {
        let total = self.points_matched.len();
        if total < 3 || total < self.params.min_inliers {
            return Sim3RansacStatus::NoMore;
        }

        for _ in 0..n {
            if self.iterations_done >= self.adaptive_max.min(self.params.max_iterations) {
                return self.finish();
            }
            self.iterations_done += 1;

            let sample = sample_three(&mut self.rng, total);
            let m: Vec<_> = sample.iter().map(|&i| self.points_matched[i]).collect();
            let c: Vec<_> = sample.iter().map(|&i| self.points_current[i]).collect();

            let Some(model) = horn_alignment(&m, &c, self.params.fix_scale) else {
                continue;
            };
            let inliers = self.find_inliers(&model);

            if inliers.len() > self.best_inliers.len() {
                self.best_inliers = inliers;
                self.best_transform = Some(model);

                let ratio = self.best_inliers.len() as f64 / total as f64;
                self.adaptive_max = self
                    .adaptive_max
                    .min(self.iterations_done + adaptive_iterations(ratio, self.params.probability));

                if self.best_inliers.len() >= self.params.min_inliers {
                    return self.finish();
                }
            }
        }

        if self.iterations_done >= self.adaptive_max.min(self.params.max_iterations) {
            self.finish()
        } else {
            Sim3RansacStatus::InProgress
        }
    }

    /// Refine the best model on its inliers and report the final status.
    fn finish(&mut self) -> Sim3RansacStatus {
        if self.best_inliers.len() < self.params.min_inliers {
            return Sim3RansacStatus::NoMore;
        }

        let m: Vec<_> = self
            .best_inliers
            .iter()
            .map(|&i| self.points_matched[i])
            .collect();
        let c: Vec<_> = self
            .best_inliers
            .iter()
            .map(|&i| self.points_current[i])
            .collect();

        if let Some(refined) = horn_alignment(&m, &c, self.params.fix_scale) {
            let refined_inliers = self.find_inliers(&refined);
            if refined_inliers.len() >= self.best_inliers.len() {
                self.best_inliers = refined_inliers;
                self.best_transform = Some(refined);
            }
        }

        Sim3RansacStatus::Converged {
            transform: self.best_transform.clone().expect("inliers imply a model"),
            inliers: self.best_inliers.clone(),
        }
    }

    fn find_inliers(&self, model: &Sim3) -> Vec<usize> {
        let threshold_sq = self.params.inlier_threshold * self.params.inlier_threshold;
        self.points_matched
            .iter()
            .zip(&self.points_current)
            .enumerate()
            .filter(|(_, (m, c))| (model.transform_point(m) - *c).norm_squared() < threshold_sq)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Closed-form similarity alignment: finds S with c_i ≈ S * m_i.
///
/// Reference: B.K.P. Horn, "Closed-form solution of absolute orientation
/// using unit quaternions".
fn horn_alignment(m: &[Vector3<f64>], c: &[Vector3<f64>], fix_scale: bool) -> Option<Sim3> {
    let n = m.len();
    if n < 3 {
        return None;
    }

    let centroid_m: Vector3<f64> = m.iter().sum::<Vector3<f64>>() / n as f64;
    let centroid_c: Vector3<f64> = c.iter().sum::<Vector3<f64>>() / n as f64;

    let centered_m: Vec<_> = m.iter().map(|p| p - centroid_m).collect();
    let centered_c: Vec<_> = c.iter().map(|p| p - centroid_c).collect();

    let scale = if fix_scale {
        1.0
    } else {
        let sum_m: f64 = centered_m.iter().map(|p| p.norm_squared()).sum();
        let sum_c: f64 = centered_c.iter().map(|p| p.norm_squared()).sum();
        if sum_m < 1e-10 {
            return None;
        }
        (sum_c / sum_m).sqrt()
    };

    // Cross-covariance H = Σ m_i c_iᵀ, rotation from its SVD.
    let mut h = Matrix3::zeros();
    for (pm, pc) in centered_m.iter().zip(&centered_c) {
        h += pm * pc.transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;

    let mut rotation_mat = v_t.transpose() * u.transpose();
    if rotation_mat.determinant() < 0.0 {
        // Reflection: flip the last column of V.
        let mut v = v_t.transpose();
        for i in 0..3 {
            v[(i, 2)] = -v[(i, 2)];
        }
        rotation_mat = v * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(
        &nalgebra::Rotation3::from_matrix_unchecked(rotation_mat),
    );
    let translation = centroid_c - scale * (rotation * centroid_m);

    Some(Sim3 {
        rotation,
        translation,
        scale,
    })
}

fn sample_three(rng: &mut impl Rng, n: usize) -> [usize; 3] {
    let mut out = [rng.gen_range(0..n); 3];
    loop {
        out[1] = rng.gen_range(0..n);
        if out[1] != out[0] {
            break;
        }
    }
    loop {
        out[2] = rng.gen_range(0..n);
        if out[2] != out[0] && out[2] != out[1] {
            break;
        }
    }
    out
}

/// RANSAC iteration count for a given inlier ratio:
/// k = log(1 - p) / log(1 - w³).
fn adaptive_iterations(inlier_ratio: f64, probability: f64) -> usize {
    if inlier_ratio <= 0.0 {
        return usize::MAX;
    }
    if inlier_ratio >= 1.0 {
        return 1;
    }
    let w3 = inlier_ratio.powi(3);
    let denom = (1.0 - w3).ln();
    if denom.abs() < 1e-10 {
        return 1;
    }
    (((1.0 - probability).ln() / denom).ceil() as usize).max(1)
}
