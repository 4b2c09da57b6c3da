//! Single camera absolute pose from 2D-3D correspondences.

use nalgebra as na;
use serde::{Deserialize, Serialize};
use sqpnp_simple::sqpnp_solve_glam;

use super::dlt::{DLT_MIN_POINTS, resection};
use super::p3p::p3p;
use super::ransac::{Estimator, RansacOptions, ransac};
use super::refine::{IntrinsicsRefinement, Observation, refine_single};
use crate::camera::{Intrinsics, IntrinsicsMode, IntrinsicsSeed};
use crate::matching::Correspondence;
use crate::types::{Pose3, RvecTvec};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoseSolverOptions {
    /// Inlier threshold in pixels.
    pub reprojection_error: f64,
    pub max_iterations: usize,
    pub min_inliers: usize,
    pub seed: u64,
    /// Levenberg-Marquardt on the consensus set.
    pub refine: bool,
    /// Let the refinement move distortion of approximate intrinsics.
    pub refine_intrinsics: bool,
}

impl Default for PoseSolverOptions {
    fn default() -> Self {
        Self {
            reprojection_error: 4.0,
            max_iterations: 1024,
            min_inliers: 7,
            seed: 42,
            refine: true,
            refine_intrinsics: true,
        }
    }
}

impl PoseSolverOptions {
    pub(crate) fn ransac_options(&self, min_samples: usize) -> RansacOptions {
        RansacOptions {
            max_iters: self.max_iterations,
            thresh: self.reprojection_error,
            min_inliers: self.min_inliers.max(min_samples + 1),
            seed: self.seed,
            ..RansacOptions::default()
        }
    }
}

/// Reprojection error over the final inlier set.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ReprojectionStats {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl ReprojectionStats {
    pub fn from_errors(errors: impl IntoIterator<Item = f64>) -> ReprojectionStats {
        let (mut sum, mut count) = (0.0, 0usize);
        let mut stats = ReprojectionStats {
            mean: 0.0,
            min: f64::INFINITY,
            max: 0.0,
        };
        for e in errors {
            sum += e;
            count += 1;
            stats.min = stats.min.min(e);
            stats.max = stats.max.max(e);
        }
        if count == 0 {
            return ReprojectionStats::default();
        }
        stats.mean = sum / count as f64;
        stats
    }
}

#[derive(Debug, Clone)]
pub struct PoseEstimate {
    pub pose: Pose3,
    pub intrinsics: Intrinsics,
    /// Indices into the correspondence slice.
    pub inliers: Vec<usize>,
    pub stats: ReprojectionStats,
}

#[derive(Debug, Clone, Copy)]
struct PoseModel {
    pose: Pose3,
    focal: f64,
}

struct CalibratedEstimator<'a> {
    intrinsics: &'a Intrinsics,
    bearings: Vec<na::Vector3<f64>>,
}

impl CalibratedEstimator<'_> {
    fn sqpnp(&self, data: &[Correspondence], inliers: &[usize]) -> Option<Pose3> {
        let (p3ds, p2ds): (Vec<_>, Vec<_>) = inliers
            .iter()
            .map(|&i| {
                let p = data[i].p3d;
                let xy = self.intrinsics.undistort_normalized(&data[i].p2d);
                (
                    glam::Vec3::new(p.x as f32, p.y as f32, p.z as f32),
                    glam::Vec2::new(xy.x as f32, xy.y as f32),
                )
            })
            .unzip();
        let (r, t) = sqpnp_solve_glam(&p3ds, &p2ds)?;
        let rt = RvecTvec::new(na::dvector![r.0, r.1, r.2], na::dvector![t.0, t.1, t.2]);
        Some(Pose3::from_isometry(&rt.to_na_isometry3()))
    }
}

impl Estimator for CalibratedEstimator<'_> {
    type Datum = Correspondence;
    type Model = PoseModel;
    const MIN_SAMPLES: usize = 3;

    fn fit(&self, data: &[Correspondence], sample: &[usize]) -> Vec<PoseModel> {
        let world = [data[sample[0]].p3d, data[sample[1]].p3d, data[sample[2]].p3d];
        let bearings = [
            self.bearings[sample[0]],
            self.bearings[sample[1]],
            self.bearings[sample[2]],
        ];
        p3p(&world, &bearings)
            .into_iter()
            .map(|pose| PoseModel {
                pose,
                focal: self.intrinsics.focal,
            })
            .collect()
    }

    fn residual(&self, model: &PoseModel, datum: &Correspondence) -> f64 {
        self.intrinsics.residual(&model.pose, &datum.p3d, &datum.p2d)
    }

    fn refit(&self, data: &[Correspondence], inliers: &[usize]) -> Option<PoseModel> {
        self.sqpnp(data, inliers).map(|pose| PoseModel {
            pose,
            focal: self.intrinsics.focal,
        })
    }
}

struct UnknownFocalEstimator<'a> {
    guess: &'a Intrinsics,
}

impl UnknownFocalEstimator<'_> {
    fn resect(&self, data: &[Correspondence], idx: &[usize]) -> Option<PoseModel> {
        let world: Vec<_> = idx.iter().map(|&i| data[i].p3d).collect();
        let image: Vec<_> = idx.iter().map(|&i| data[i].p2d).collect();
        let r = resection(&world, &image)?;
        Some(PoseModel {
            pose: r.pose,
            focal: r.focal,
        })
    }
}

impl Estimator for UnknownFocalEstimator<'_> {
    type Datum = Correspondence;
    type Model = PoseModel;
    const MIN_SAMPLES: usize = DLT_MIN_POINTS;

    fn fit(&self, data: &[Correspondence], sample: &[usize]) -> Vec<PoseModel> {
        self.resect(data, sample).into_iter().collect()
    }

    fn residual(&self, model: &PoseModel, datum: &Correspondence) -> f64 {
        self.guess
            .with_focal(model.focal)
            .residual(&model.pose, &datum.p3d, &datum.p2d)
    }

    fn refit(&self, data: &[Correspondence], inliers: &[usize]) -> Option<PoseModel> {
        self.resect(data, inliers)
    }
}

/// Indices of the correspondences whose reprojection error under `pose`
/// is at most `threshold` pixels.
pub fn inliers_for_pose(
    correspondences: &[Correspondence],
    pose: &Pose3,
    intrinsics: &Intrinsics,
    threshold: f64,
) -> Vec<usize> {
    correspondences
        .iter()
        .enumerate()
        .filter(|(_, c)| intrinsics.residual(pose, &c.p3d, &c.p2d) <= threshold)
        .map(|(i, _)| i)
        .collect()
}

pub fn reprojection_stats(
    correspondences: &[Correspondence],
    inliers: &[usize],
    pose: &Pose3,
    intrinsics: &Intrinsics,
) -> ReprojectionStats {
    ReprojectionStats::from_errors(inliers.iter().map(|&i| {
        let c = &correspondences[i];
        intrinsics.residual(pose, &c.p3d, &c.p2d)
    }))
}

/// Smallest inlier count accepted for a solve in `mode`.
pub fn inlier_floor(mode: IntrinsicsMode, opts: &PoseSolverOptions) -> usize {
    let min_samples = match mode {
        IntrinsicsMode::Unknown => DLT_MIN_POINTS,
        _ => 3,
    };
    opts.min_inliers.max(min_samples + 1)
}

fn rms(correspondences: &[Correspondence], inliers: &[usize], pose: &Pose3, intr: &Intrinsics) -> f64 {
    if inliers.is_empty() {
        return f64::INFINITY;
    }
    let ss: f64 = inliers
        .iter()
        .map(|&i| intr.residual(pose, &correspondences[i].p3d, &correspondences[i].p2d).powi(2))
        .sum();
    (ss / inliers.len() as f64).sqrt()
}

/// Robust pose (and focal length when the seed is unknown) from noisy
/// correspondences. `None` when the consensus set stays below the floor.
pub fn solve_pose(
    correspondences: &[Correspondence],
    seed: &IntrinsicsSeed,
    opts: &PoseSolverOptions,
) -> Option<PoseEstimate> {
    let floor = inlier_floor(seed.mode, opts);
    if correspondences.len() < floor {
        log::debug!(
            "pose solver: {} correspondences, need at least {}",
            correspondences.len(),
            floor
        );
        return None;
    }

    let (model, intrinsics) = match seed.mode {
        IntrinsicsMode::Unknown => {
            let estimator = UnknownFocalEstimator {
                guess: &seed.intrinsics,
            };
            let result = ransac(&estimator, correspondences, &opts.ransac_options(DLT_MIN_POINTS));
            let model = result.model?;
            (model, seed.intrinsics.with_focal(model.focal))
        }
        IntrinsicsMode::Approximate | IntrinsicsMode::Known => {
            let estimator = CalibratedEstimator {
                intrinsics: &seed.intrinsics,
                bearings: correspondences
                    .iter()
                    .map(|c| seed.intrinsics.bearing(&c.p2d))
                    .collect(),
            };
            let result = ransac(&estimator, correspondences, &opts.ransac_options(3));
            (result.model?, seed.intrinsics.clone())
        }
    };

    let mut pose = model.pose;
    let mut intrinsics = intrinsics;
    let mut inliers = inliers_for_pose(correspondences, &pose, &intrinsics, opts.reprojection_error);

    if opts.refine {
        let refinement = match seed.mode {
            IntrinsicsMode::Known => IntrinsicsRefinement::Fixed,
            IntrinsicsMode::Unknown => IntrinsicsRefinement::Focal,
            IntrinsicsMode::Approximate if opts.refine_intrinsics => {
                IntrinsicsRefinement::FocalAndDistortion
            }
            IntrinsicsMode::Approximate => IntrinsicsRefinement::Fixed,
        };
        let observations: Vec<_> = inliers
            .iter()
            .map(|&i| Observation {
                camera: 0,
                p3d: correspondences[i].p3d,
                p2d: correspondences[i].p2d,
            })
            .collect();
        match refine_single(&observations, &pose, &intrinsics, refinement, opts.reprojection_error) {
            Some((refined_pose, refined_intrinsics)) => {
                let refined_inliers = inliers_for_pose(
                    correspondences,
                    &refined_pose,
                    &refined_intrinsics,
                    opts.reprojection_error,
                );
                let before = rms(correspondences, &inliers, &pose, &intrinsics);
                let after = rms(correspondences, &refined_inliers, &refined_pose, &refined_intrinsics);
                if refined_inliers.len() > inliers.len()
                    || (refined_inliers.len() == inliers.len() && after <= before)
                {
                    pose = refined_pose;
                    intrinsics = refined_intrinsics;
                    inliers = refined_inliers;
                } else {
                    log::debug!("pose solver: refinement rejected ({:.4} -> {:.4} px)", before, after);
                }
            }
            None => log::debug!("pose solver: refinement did not converge"),
        }
    }

    if inliers.len() < floor {
        log::debug!("pose solver: {} inliers below floor {}", inliers.len(), floor);
        return None;
    }
    let stats = reprojection_stats(correspondences, &inliers, &pose, &intrinsics);
    log::debug!(
        "pose solver: {} / {} inliers, mean error {:.3} px, focal {:.1}",
        inliers.len(),
        correspondences.len(),
        stats.mean,
        intrinsics.focal
    );
    Some(PoseEstimate {
        pose,
        intrinsics,
        inliers,
        stats,
    })
}
