use std::collections::HashMap;

use nalgebra as na;
use tiny_solver::LevenbergMarquardtOptimizer;
use tiny_solver::loss_functions::HuberLoss;
use tiny_solver::optimizer::{Optimizer, OptimizerOptions};
use tiny_solver::problem::Problem;

use super::factors::{PoseIntrinsicsReprojectionFactor, PoseReprojectionFactor, RigReprojectionFactor};
use crate::camera::Intrinsics;
use crate::types::{Pose3, RvecTvec, ToRvecTvec};

/// Which intrinsics parameters the refinement may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicsRefinement {
    Fixed,
    Focal,
    FocalAndDistortion,
}

/// One 2D-3D observation used by the refinement.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    pub camera: usize,
    pub p3d: na::Vector3<f64>,
    pub p2d: na::Vector2<f64>,
}

fn optimizer_options() -> OptimizerOptions {
    OptimizerOptions {
        max_iteration: 50,
        ..OptimizerOptions::default()
    }
}

fn huber(scale: f64) -> Option<Box<dyn tiny_solver::loss_functions::Loss + Send>> {
    if scale > 0.0 {
        Some(Box::new(HuberLoss::new(scale)))
    } else {
        None
    }
}

fn pose_from_result(result: &HashMap<String, na::DVector<f64>>) -> Option<Pose3> {
    let rvec = result.get("rvec")?.clone();
    let tvec = result.get("tvec")?.clone();
    let pose = Pose3::from_isometry(&RvecTvec::new(rvec, tvec).to_na_isometry3());
    pose.rotation
        .iter()
        .chain(pose.center.iter())
        .all(|v| v.is_finite())
        .then_some(pose)
}

/// Levenberg-Marquardt over one camera pose and optionally its focal length
/// and distortion. The principal point is never refined.
pub fn refine_single(
    observations: &[Observation],
    pose: &Pose3,
    intrinsics: &Intrinsics,
    refinement: IntrinsicsRefinement,
    huber_scale: f64,
) -> Option<(Pose3, Intrinsics)> {
    if observations.is_empty() {
        return None;
    }
    let mut problem = Problem::new();
    let rt = pose.to_isometry().to_rvec_tvec();
    let mut initial = HashMap::<String, na::DVector<f64>>::from([
        ("rvec".to_string(), rt.rvec),
        ("tvec".to_string(), rt.tvec),
    ]);
    let params = intrinsics.params();
    match refinement {
        IntrinsicsRefinement::Fixed => {
            let fixed: [f64; 6] = std::array::from_fn(|i| params[i]);
            for obs in observations {
                let factor = PoseReprojectionFactor {
                    intrinsics: fixed,
                    p3d: obs.p3d,
                    p2d: obs.p2d,
                };
                problem.add_residual_block(2, &["rvec", "tvec"], Box::new(factor), huber(huber_scale));
            }
        }
        IntrinsicsRefinement::Focal | IntrinsicsRefinement::FocalAndDistortion => {
            for obs in observations {
                let factor = PoseIntrinsicsReprojectionFactor {
                    p3d: obs.p3d,
                    p2d: obs.p2d,
                };
                problem.add_residual_block(
                    2,
                    &["intrinsics", "rvec", "tvec"],
                    Box::new(factor),
                    huber(huber_scale),
                );
            }
            let fixed: &[usize] = match refinement {
                IntrinsicsRefinement::Focal => &[1, 2, 3, 4, 5],
                _ => &[1, 2],
            };
            for &idx in fixed {
                problem.fix_variable("intrinsics", idx);
            }
            initial.insert("intrinsics".to_string(), params);
        }
    }

    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer.optimize(&problem, &initial, Some(optimizer_options()))?;
    let refined_pose = pose_from_result(&result)?;
    let refined_intrinsics = match result.get("intrinsics") {
        Some(p) if p.iter().all(|v| v.is_finite()) && p[0] > 0.0 => {
            Intrinsics::from_params(intrinsics.width, intrinsics.height, p.as_slice())
        }
        Some(_) => return None,
        None => intrinsics.clone(),
    };
    Some((refined_pose, refined_intrinsics))
}

/// Levenberg-Marquardt over the main camera pose of a rig. `cameras` holds
/// the fixed intrinsics and main-to-camera sub-pose of every rig camera,
/// the main camera's sub-pose being the identity.
pub fn refine_rig(
    observations: &[Observation],
    cameras: &[(Intrinsics, Pose3)],
    main_pose: &Pose3,
    huber_scale: f64,
) -> Option<Pose3> {
    if observations.is_empty() {
        return None;
    }
    let mut problem = Problem::new();
    for obs in observations {
        let (intrinsics, sub_pose) = cameras.get(obs.camera)?;
        let params = intrinsics.params();
        let factor = RigReprojectionFactor {
            intrinsics: std::array::from_fn(|i| params[i]),
            rel_rotation: sub_pose.rotation,
            rel_translation: sub_pose.translation(),
            p3d: obs.p3d,
            p2d: obs.p2d,
        };
        problem.add_residual_block(2, &["rvec", "tvec"], Box::new(factor), huber(huber_scale));
    }
    let rt = main_pose.to_isometry().to_rvec_tvec();
    let initial = HashMap::<String, na::DVector<f64>>::from([
        ("rvec".to_string(), rt.rvec),
        ("tvec".to_string(), rt.tvec),
    ]);
    let optimizer = LevenbergMarquardtOptimizer::default();
    let result = optimizer.optimize(&problem, &initial, Some(optimizer_options()))?;
    pose_from_result(&result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scene(pose: &Pose3, intrinsics: &Intrinsics) -> Vec<Observation> {
        (0..30)
            .filter_map(|i| {
                let f = i as f64;
                let p3d = na::Vector3::new((f * 0.9).sin() * 2.0, (f * 0.5).cos(), 5.0 + (f * 0.3).sin());
                let p2d = intrinsics.project_world(pose, &p3d)?;
                Some(Observation { camera: 0, p3d, p2d })
            })
            .collect()
    }

    #[test]
    fn converges_from_perturbed_pose() {
        let intrinsics = Intrinsics::from_params(640, 480, &[500.0, 320.0, 240.0]);
        let gt = Pose3::from_isometry(&na::Isometry3::new(
            na::Vector3::new(0.1, 0.0, 0.2),
            na::Vector3::new(0.02, -0.05, 0.01),
        ));
        let obs = scene(&gt, &intrinsics);
        let start = Pose3::from_isometry(&na::Isometry3::new(
            na::Vector3::new(0.15, -0.05, 0.3),
            na::Vector3::new(0.04, -0.02, 0.0),
        ));
        let (pose, refined) =
            refine_single(&obs, &start, &intrinsics, IntrinsicsRefinement::Fixed, 0.0).unwrap();
        assert_eq!(refined, intrinsics);
        assert!(pose.rotation_angle_to(&gt) < 1e-6);
        assert!(pose.center_distance_to(&gt) < 1e-6);
    }

    #[test]
    fn focal_is_refined() {
        let intrinsics = Intrinsics::from_params(640, 480, &[500.0, 320.0, 240.0]);
        let gt = Pose3::from_isometry(&na::Isometry3::new(
            na::Vector3::new(0.0, 0.1, 0.0),
            na::Vector3::new(0.0, 0.03, 0.0),
        ));
        let obs = scene(&gt, &intrinsics);
        let (_, refined) = refine_single(
            &obs,
            &gt,
            &intrinsics.with_focal(530.0),
            IntrinsicsRefinement::Focal,
            0.0,
        )
        .unwrap();
        assert!((refined.focal - 500.0).abs() < 1e-3, "focal {}", refined.focal);
        assert_eq!(refined.principal_point, intrinsics.principal_point);
    }
}
