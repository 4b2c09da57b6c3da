pub mod dlt;
pub mod factors;
pub mod p3p;
pub mod pnp;
pub mod ransac;
pub mod refine;
pub mod rig;

pub use pnp::{
    PoseEstimate, PoseSolverOptions, ReprojectionStats, inlier_floor, inliers_for_pose,
    reprojection_stats, solve_pose,
};
pub use rig::{RigCamera, RigEstimate, RigFailure, solve_rig};
