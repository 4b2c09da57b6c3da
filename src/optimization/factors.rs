use nalgebra as na;
use tiny_solver::factors::Factor;

use crate::camera::project_with_params;

/// Rotates `p` by the axis-angle vector `rvec`.
///
/// Written out with Rodrigues' formula so it can be evaluated on dual
/// numbers; near zero the first order expansion avoids the singular
/// derivative of the angle.
pub fn rotate_point<T: na::RealField + Clone>(
    rvec: &na::Vector3<T>,
    p: &na::Vector3<T>,
) -> na::Vector3<T> {
    let theta2 = rvec.norm_squared();
    if theta2 < T::from_f64(1e-12).unwrap() {
        return p + rvec.cross(p);
    }
    let theta = theta2.sqrt();
    let axis = rvec / theta.clone();
    let (sin, cos) = (theta.clone().sin(), theta.cos());
    let one = T::one();
    p * cos.clone() + axis.cross(p) * sin + axis.clone() * (axis.dot(p) * (one - cos))
}

fn vec3<T: na::RealField + Clone>(v: &na::DVector<T>) -> na::Vector3<T> {
    na::Vector3::new(v[0].clone(), v[1].clone(), v[2].clone())
}

fn cast3<T: na::RealField>(v: &na::Vector3<f64>) -> na::Vector3<T> {
    v.map(|x| T::from_f64(x).unwrap())
}

fn residual<T: na::RealField + Clone>(
    intrinsics: &[T],
    p_cam: &na::Vector3<T>,
    p2d: &na::Vector2<f64>,
) -> na::DVector<T> {
    let p = project_with_params(intrinsics, p_cam);
    na::dvector![
        p[0].clone() - T::from_f64(p2d.x).unwrap(),
        p[1].clone() - T::from_f64(p2d.y).unwrap()
    ]
}

/// Reprojection with fixed intrinsics. Parameters `[rvec, tvec]`.
pub struct PoseReprojectionFactor {
    pub intrinsics: [f64; 6],
    pub p3d: na::Vector3<f64>,
    pub p2d: na::Vector2<f64>,
}

impl<T: na::RealField> Factor<T> for PoseReprojectionFactor {
    fn residual_func(&self, params: &[na::DVector<T>]) -> na::DVector<T> {
        let rvec = vec3(&params[0]);
        let tvec = vec3(&params[1]);
        let p_cam = rotate_point(&rvec, &cast3(&self.p3d)) + tvec;
        let intrinsics = self.intrinsics.map(|x| T::from_f64(x).unwrap());
        residual(&intrinsics, &p_cam, &self.p2d)
    }
}

/// Reprojection with the intrinsics as a parameter block.
/// Parameters `[intrinsics(6), rvec, tvec]`.
pub struct PoseIntrinsicsReprojectionFactor {
    pub p3d: na::Vector3<f64>,
    pub p2d: na::Vector2<f64>,
}

impl<T: na::RealField> Factor<T> for PoseIntrinsicsReprojectionFactor {
    fn residual_func(&self, params: &[na::DVector<T>]) -> na::DVector<T> {
        let rvec = vec3(&params[1]);
        let tvec = vec3(&params[2]);
        let p_cam = rotate_point(&rvec, &cast3(&self.p3d)) + tvec;
        residual(params[0].as_slice(), &p_cam, &self.p2d)
    }
}

/// Reprojection into a secondary rig camera rigidly attached to the main
/// camera. Parameters `[rvec, tvec]` of the main camera; the sub-pose
/// `x_sub = R_rel * x_main + t_rel` is constant.
pub struct RigReprojectionFactor {
    pub intrinsics: [f64; 6],
    pub rel_rotation: na::Matrix3<f64>,
    pub rel_translation: na::Vector3<f64>,
    pub p3d: na::Vector3<f64>,
    pub p2d: na::Vector2<f64>,
}

impl<T: na::RealField> Factor<T> for RigReprojectionFactor {
    fn residual_func(&self, params: &[na::DVector<T>]) -> na::DVector<T> {
        let rvec = vec3(&params[0]);
        let tvec = vec3(&params[1]);
        let p_main = rotate_point(&rvec, &cast3(&self.p3d)) + tvec;
        let rel_rotation = self.rel_rotation.map(|x| T::from_f64(x).unwrap());
        let p_cam = rel_rotation * p_main + cast3(&self.rel_translation);
        let intrinsics = self.intrinsics.map(|x| T::from_f64(x).unwrap());
        residual(&intrinsics, &p_cam, &self.p2d)
    }
}
