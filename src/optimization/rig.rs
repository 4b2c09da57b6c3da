//! Joint pose of a rigid multi-camera rig.
//!
//! Hypotheses come from P3P inside one camera and are lifted to the main
//! camera through that camera's fixed sub-pose; every hypothesis is then
//! scored on the correspondences of all cameras at once.

use std::ops::Range;

use nalgebra as na;
use rand::Rng;
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;

use super::p3p::p3p;
use super::pnp::{PoseSolverOptions, ReprojectionStats};
use super::ransac::{Estimator, ransac, score};
use super::refine::{Observation, refine_rig};
use crate::camera::Intrinsics;
use crate::matching::Correspondence;
use crate::types::Pose3;

/// One rig camera. `sub_pose` maps main camera coordinates into this
/// camera; it is the identity for the main camera.
#[derive(Debug, Clone)]
pub struct RigCamera<'a> {
    pub correspondences: &'a [Correspondence],
    pub intrinsics: Intrinsics,
    pub sub_pose: Pose3,
}

#[derive(Debug, Clone)]
pub struct RigEstimate {
    pub main_pose: Pose3,
    /// Inlier indices per camera, into that camera's correspondences.
    pub inliers: Vec<Vec<usize>>,
    pub stats: ReprojectionStats,
}

impl RigEstimate {
    pub fn num_inliers(&self) -> usize {
        self.inliers.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigFailure {
    /// Fewer than two cameras contributed correspondences.
    Degenerate,
    InsufficientInliers,
}

#[derive(Debug, Clone, Copy)]
struct RigDatum {
    camera: usize,
    p3d: na::Vector3<f64>,
    p2d: na::Vector2<f64>,
    bearing: na::Vector3<f64>,
}

struct RigEstimator<'a> {
    cameras: &'a [RigCamera<'a>],
    /// Contiguous data range of every camera with at least 3 points.
    sample_ranges: Vec<Range<usize>>,
    huber: f64,
}

impl RigEstimator<'_> {
    fn observations(&self, data: &[RigDatum], idx: &[usize]) -> Vec<Observation> {
        idx.iter()
            .map(|&i| Observation {
                camera: data[i].camera,
                p3d: data[i].p3d,
                p2d: data[i].p2d,
            })
            .collect()
    }

    fn camera_table(&self) -> Vec<(Intrinsics, Pose3)> {
        self.cameras
            .iter()
            .map(|c| (c.intrinsics.clone(), c.sub_pose))
            .collect()
    }
}

impl Estimator for RigEstimator<'_> {
    type Datum = RigDatum;
    type Model = Pose3;
    const MIN_SAMPLES: usize = 3;

    fn sample(&self, _data: &[RigDatum], rng: &mut ChaCha8Rng) -> Option<Vec<usize>> {
        if self.sample_ranges.is_empty() {
            return None;
        }
        let total: usize = self.sample_ranges.iter().map(|r| r.len()).sum();
        // cameras are picked proportionally to their number of points
        let mut pick = rng.random_range(0..total);
        let range = self
            .sample_ranges
            .iter()
            .find(|r| {
                if pick < r.len() {
                    true
                } else {
                    pick -= r.len();
                    false
                }
            })?
            .clone();
        Some(
            sample(rng, range.len(), 3)
                .into_iter()
                .map(|i| range.start + i)
                .collect(),
        )
    }

    fn fit(&self, data: &[RigDatum], sample: &[usize]) -> Vec<Pose3> {
        let camera = &self.cameras[data[sample[0]].camera];
        let world = [data[sample[0]].p3d, data[sample[1]].p3d, data[sample[2]].p3d];
        let bearings = [
            data[sample[0]].bearing,
            data[sample[1]].bearing,
            data[sample[2]].bearing,
        ];
        let to_main = camera.sub_pose.inverse();
        p3p(&world, &bearings)
            .into_iter()
            .map(|camera_pose| to_main.compose(&camera_pose))
            .collect()
    }

    fn residual(&self, main_pose: &Pose3, datum: &RigDatum) -> f64 {
        let camera = &self.cameras[datum.camera];
        let pose = camera.sub_pose.compose(main_pose);
        camera.intrinsics.residual(&pose, &datum.p3d, &datum.p2d)
    }
}

fn lift(cameras: &[RigCamera]) -> Vec<RigDatum> {
    cameras
        .iter()
        .enumerate()
        .flat_map(|(ci, cam)| {
            cam.correspondences.iter().map(move |c| RigDatum {
                camera: ci,
                p3d: c.p3d,
                p2d: c.p2d,
                bearing: cam.intrinsics.bearing(&c.p2d),
            })
        })
        .collect()
}

fn split_inliers(cameras: &[RigCamera], data: &[RigDatum], inliers: &[usize]) -> Vec<Vec<usize>> {
    let mut offsets = Vec::with_capacity(cameras.len());
    let mut start = 0;
    for cam in cameras {
        offsets.push(start);
        start += cam.correspondences.len();
    }
    let mut per_camera = vec![Vec::new(); cameras.len()];
    for &i in inliers {
        let c = data[i].camera;
        per_camera[c].push(i - offsets[c]);
    }
    per_camera
}

/// Robust main camera pose of a rig with known sub-poses.
pub fn solve_rig(cameras: &[RigCamera], opts: &PoseSolverOptions) -> Result<RigEstimate, RigFailure> {
    let contributing = cameras
        .iter()
        .filter(|c| !c.correspondences.is_empty())
        .count();
    if contributing < 2 {
        log::debug!("rig solver: only {} camera(s) with correspondences", contributing);
        return Err(RigFailure::Degenerate);
    }

    let data = lift(cameras);
    let mut sample_ranges = Vec::new();
    let mut start = 0;
    for cam in cameras {
        let end = start + cam.correspondences.len();
        if cam.correspondences.len() >= 3 {
            sample_ranges.push(start..end);
        }
        start = end;
    }
    let estimator = RigEstimator {
        cameras,
        sample_ranges,
        huber: opts.reprojection_error,
    };
    let floor = opts.min_inliers.max(RigEstimator::MIN_SAMPLES + 1);
    let ransac_opts = opts.ransac_options(RigEstimator::MIN_SAMPLES);
    let result = ransac(&estimator, &data, &ransac_opts);
    let Some(mut main_pose) = result.model else {
        log::debug!("rig solver: no consensus over {} correspondences", data.len());
        return Err(RigFailure::InsufficientInliers);
    };
    let mut inliers = result.inliers;
    let mut inlier_rms = result.inlier_rms;

    if opts.refine {
        let observations = estimator.observations(&data, &inliers);
        if let Some(refined) = refine_rig(&observations, &estimator.camera_table(), &main_pose, estimator.huber) {
            let (refined_inliers, refined_rms) = score(&estimator, &refined, &data, opts.reprojection_error);
            if refined_inliers.len() > inliers.len()
                || (refined_inliers.len() == inliers.len() && refined_rms <= inlier_rms)
            {
                main_pose = refined;
                inliers = refined_inliers;
                inlier_rms = refined_rms;
            }
        }
    }

    if inliers.len() < floor {
        log::debug!("rig solver: {} inliers below floor {}", inliers.len(), floor);
        return Err(RigFailure::InsufficientInliers);
    }
    let stats = ReprojectionStats::from_errors(
        inliers.iter().map(|&i| estimator.residual(&main_pose, &data[i])),
    );
    log::debug!(
        "rig solver: {} / {} inliers over {} cameras, rms {:.4} px",
        inliers.len(),
        data.len(),
        contributing,
        inlier_rms
    );
    Ok(RigEstimate {
        main_pose,
        inliers: split_inliers(cameras, &data, &inliers),
        stats,
    })
}
