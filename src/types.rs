use nalgebra as na;
use serde::{Deserialize, Serialize};

/// Frame time stamp in nanoseconds.
pub type FrameTime = i64;

/// Axis-angle rotation and translation of a world to camera transform.
///
/// This is the parameterization handed to the non-linear optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct RvecTvec {
    pub rvec: na::DVector<f64>,
    pub tvec: na::DVector<f64>,
}

impl RvecTvec {
    pub fn new(rvec: na::DVector<f64>, tvec: na::DVector<f64>) -> RvecTvec {
        RvecTvec { rvec, tvec }
    }
    pub fn na_rvec(&self) -> na::Vector3<f64> {
        na::Vector3::new(self.rvec[0], self.rvec[1], self.rvec[2])
    }
    pub fn na_tvec(&self) -> na::Vector3<f64> {
        na::Vector3::new(self.tvec[0], self.tvec[1], self.tvec[2])
    }
    pub fn to_na_isometry3(&self) -> na::Isometry3<f64> {
        na::Isometry3::new(self.na_tvec(), self.na_rvec())
    }
}

pub trait ToRvecTvec {
    fn to_rvec_tvec(&self) -> RvecTvec;
}

impl ToRvecTvec for na::Isometry3<f64> {
    fn to_rvec_tvec(&self) -> RvecTvec {
        let rvec = self.rotation.scaled_axis();
        let tvec = self.translation.vector;
        RvecTvec::new(
            na::dvector![rvec.x, rvec.y, rvec.z],
            na::dvector![tvec.x, tvec.y, tvec.z],
        )
    }
}

/// Camera pose as a world to camera rotation and the camera center in world
/// coordinates: `x_cam = R * (X - C)`.
///
/// Rig sub-poses use the same representation with the main camera frame in
/// place of the world frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose3 {
    pub rotation: na::Matrix3<f64>,
    pub center: na::Vector3<f64>,
}

impl Default for Pose3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl Pose3 {
    pub fn new(rotation: na::Matrix3<f64>, center: na::Vector3<f64>) -> Pose3 {
        Pose3 { rotation, center }
    }

    pub fn identity() -> Pose3 {
        Pose3 {
            rotation: na::Matrix3::identity(),
            center: na::Vector3::zeros(),
        }
    }

    pub fn from_isometry(iso: &na::Isometry3<f64>) -> Pose3 {
        let rotation = iso.rotation.to_rotation_matrix().into_inner();
        let center = -(rotation.transpose() * iso.translation.vector);
        Pose3 { rotation, center }
    }

    /// World to camera transform.
    pub fn to_isometry(&self) -> na::Isometry3<f64> {
        let rot = na::Rotation3::from_matrix(&self.rotation);
        let translation = -(rot * self.center);
        na::Isometry3::from_parts(
            na::Translation3::from(translation),
            na::UnitQuaternion::from_rotation_matrix(&rot),
        )
    }

    pub fn translation(&self) -> na::Vector3<f64> {
        -(self.rotation * self.center)
    }

    pub fn transform_point(&self, p_world: &na::Vector3<f64>) -> na::Vector3<f64> {
        self.rotation * (p_world - self.center)
    }

    /// `self` applied after `other`: for a rig sub-pose `s` and main camera
    /// pose `m`, `s.compose(&m)` is the pose of the secondary camera.
    pub fn compose(&self, other: &Pose3) -> Pose3 {
        Pose3 {
            rotation: self.rotation * other.rotation,
            center: other.center + other.rotation.transpose() * self.center,
        }
    }

    pub fn inverse(&self) -> Pose3 {
        Pose3 {
            rotation: self.rotation.transpose(),
            center: -(self.rotation * self.center),
        }
    }

    /// Angle in radians of the relative rotation between two poses.
    pub fn rotation_angle_to(&self, other: &Pose3) -> f64 {
        let r_diff = self.rotation.transpose() * other.rotation;
        let cos_theta = ((r_diff.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
        cos_theta.acos()
    }

    pub fn center_distance_to(&self, other: &Pose3) -> f64 {
        (self.center - other.center).norm()
    }
}
