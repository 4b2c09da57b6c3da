use nalgebra as na;
use serde::{Deserialize, Serialize};

use crate::types::Pose3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CameraType {
    #[default]
    PinholeRadialK3,
}

/// How much of an input camera's intrinsics the solver may trust.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum IntrinsicsMode {
    /// Focal length is estimated together with the pose.
    #[default]
    Unknown,
    /// The seed is used to initialize the solve and refined afterwards.
    Approximate,
    /// The seed is held fixed, only the pose is solved.
    Known,
}

/// Pinhole camera with three radial distortion coefficients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    #[serde(default)]
    pub camera_type: CameraType,
    pub width: u32,
    pub height: u32,
    pub focal: f64,
    pub principal_point: na::Vector2<f64>,
    #[serde(default)]
    pub distortion: [f64; 3],
}

/// Projects a camera frame point with `[focal, ppx, ppy, k1, k2, k3]`.
///
/// Generic so that the optimizer can evaluate it on dual numbers.
pub fn project_with_params<T: na::RealField + Clone>(
    params: &[T],
    p_cam: &na::Vector3<T>,
) -> na::Vector2<T> {
    let one = T::one();
    let x = p_cam[0].clone() / p_cam[2].clone();
    let y = p_cam[1].clone() / p_cam[2].clone();
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let d = one
        + params[3].clone() * r2
        + params[4].clone() * r4
        + params[5].clone() * r6;
    na::Vector2::new(
        params[0].clone() * x * d.clone() + params[1].clone(),
        params[0].clone() * y * d + params[2].clone(),
    )
}

impl Intrinsics {
    /// Default guess for an uncalibrated camera: principal point at the
    /// image center and a focal length equal to the larger image side.
    pub fn new(width: u32, height: u32) -> Intrinsics {
        Intrinsics {
            camera_type: CameraType::PinholeRadialK3,
            width,
            height,
            focal: width.max(height) as f64,
            principal_point: na::Vector2::new(width as f64 / 2.0, height as f64 / 2.0),
            distortion: [0.0; 3],
        }
    }

    pub fn from_params(width: u32, height: u32, params: &[f64]) -> Intrinsics {
        let mut distortion = [0.0; 3];
        for (d, p) in distortion.iter_mut().zip(params.iter().skip(3)) {
            *d = *p;
        }
        Intrinsics {
            camera_type: CameraType::PinholeRadialK3,
            width,
            height,
            focal: params[0],
            principal_point: na::Vector2::new(params[1], params[2]),
            distortion,
        }
    }

    pub fn with_focal(&self, focal: f64) -> Intrinsics {
        Intrinsics {
            focal,
            ..self.clone()
        }
    }

    pub fn params(&self) -> na::DVector<f64> {
        na::dvector![
            self.focal,
            self.principal_point.x,
            self.principal_point.y,
            self.distortion[0],
            self.distortion[1],
            self.distortion[2]
        ]
    }

    pub fn has_distortion(&self) -> bool {
        self.distortion.iter().any(|k| *k != 0.0)
    }

    /// Projects a point given in camera coordinates. `None` behind the camera.
    pub fn project(&self, p_cam: &na::Vector3<f64>) -> Option<na::Vector2<f64>> {
        if p_cam.z <= f64::EPSILON {
            return None;
        }
        Some(project_with_params(self.params().as_slice(), p_cam))
    }

    pub fn project_world(&self, pose: &Pose3, p_world: &na::Vector3<f64>) -> Option<na::Vector2<f64>> {
        self.project(&pose.transform_point(p_world))
    }

    pub fn contains(&self, p2d: &na::Vector2<f64>) -> bool {
        p2d.x >= 0.0 && p2d.y >= 0.0 && p2d.x < self.width as f64 && p2d.y < self.height as f64
    }

    /// Pixel distance between an observation and the projection of a world
    /// point. Points behind the camera have infinite error.
    pub fn residual(&self, pose: &Pose3, p3d: &na::Vector3<f64>, p2d: &na::Vector2<f64>) -> f64 {
        match self.project_world(pose, p3d) {
            Some(p) => (p - p2d).norm(),
            None => f64::INFINITY,
        }
    }

    /// Removes lens distortion from a pixel and returns normalized image
    /// coordinates `(x/z, y/z)`.
    pub fn undistort_normalized(&self, p2d: &na::Vector2<f64>) -> na::Vector2<f64> {
        let xd = (p2d - self.principal_point) / self.focal;
        if !self.has_distortion() {
            return xd;
        }
        let [k1, k2, k3] = self.distortion;
        let mut xu = xd;
        for _ in 0..20 {
            let r2 = xu.norm_squared();
            let d = 1.0 + k1 * r2 + k2 * r2 * r2 + k3 * r2 * r2 * r2;
            let next = xd / d;
            if (next - xu).norm() < 1e-12 {
                return next;
            }
            xu = next;
        }
        xu
    }

    /// Unit viewing ray through a pixel, in camera coordinates.
    pub fn bearing(&self, p2d: &na::Vector2<f64>) -> na::Vector3<f64> {
        let xy = self.undistort_normalized(p2d);
        na::Vector3::new(xy.x, xy.y, 1.0).normalize()
    }

    pub fn k_matrix(&self) -> na::Matrix3<f64> {
        na::Matrix3::new(
            self.focal,
            0.0,
            self.principal_point.x,
            0.0,
            self.focal,
            self.principal_point.y,
            0.0,
            0.0,
            1.0,
        )
    }
}

/// Intrinsics guess for one input camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntrinsicsSeed {
    pub mode: IntrinsicsMode,
    pub intrinsics: Intrinsics,
}

impl IntrinsicsSeed {
    pub fn unknown(width: u32, height: u32) -> IntrinsicsSeed {
        IntrinsicsSeed {
            mode: IntrinsicsMode::Unknown,
            intrinsics: Intrinsics::new(width, height),
        }
    }
    pub fn approximate(intrinsics: Intrinsics) -> IntrinsicsSeed {
        IntrinsicsSeed {
            mode: IntrinsicsMode::Approximate,
            intrinsics,
        }
    }
    pub fn known(intrinsics: Intrinsics) -> IntrinsicsSeed {
        IntrinsicsSeed {
            mode: IntrinsicsMode::Known,
            intrinsics,
        }
    }
    pub fn has_intrinsics(&self) -> bool {
        self.mode != IntrinsicsMode::Unknown
    }
}
