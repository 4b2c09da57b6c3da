//! Camera resection with unknown focal length.
//!
//! A normalized DLT estimates the full 3x4 projection matrix, which is split
//! into `K [R | t]` by an RQ decomposition. Only the focal length is taken
//! from `K`; the principal point stays at the caller's guess.

use nalgebra as na;

use crate::types::Pose3;

pub const DLT_MIN_POINTS: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resection {
    pub pose: Pose3,
    pub focal: f64,
}

fn normalize_2d(points: &[na::Vector2<f64>]) -> Option<na::Matrix3<f64>> {
    let n = points.len() as f64;
    let c = points.iter().sum::<na::Vector2<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - c).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let s = std::f64::consts::SQRT_2 / mean_dist;
    Some(na::Matrix3::new(s, 0.0, -s * c.x, 0.0, s, -s * c.y, 0.0, 0.0, 1.0))
}

fn normalize_3d(points: &[na::Vector3<f64>]) -> Option<na::Matrix4<f64>> {
    let n = points.len() as f64;
    let c = points.iter().sum::<na::Vector3<f64>>() / n;
    let mean_dist = points.iter().map(|p| (p - c).norm()).sum::<f64>() / n;
    if mean_dist <= f64::EPSILON {
        return None;
    }
    let s = 3.0f64.sqrt() / mean_dist;
    Some(na::Matrix4::new(
        s,
        0.0,
        0.0,
        -s * c.x,
        0.0,
        s,
        0.0,
        -s * c.y,
        0.0,
        0.0,
        s,
        -s * c.z,
        0.0,
        0.0,
        0.0,
        1.0,
    ))
}

/// Projection matrix from at least six 2D-3D pairs.
pub fn projection_matrix(
    world: &[na::Vector3<f64>],
    image: &[na::Vector2<f64>],
) -> Option<na::Matrix3x4<f64>> {
    let n = world.len();
    if n < DLT_MIN_POINTS || image.len() != n {
        return None;
    }
    let t2 = normalize_2d(image)?;
    let t3 = normalize_3d(world)?;

    let mut a = na::DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (pw, pi)) in world.iter().zip(image).enumerate() {
        let x = t3 * pw.push(1.0);
        let u = t2 * pi.push(1.0);
        let (r0, r1) = (2 * i, 2 * i + 1);
        for k in 0..4 {
            a[(r0, k)] = x[k];
            a[(r0, 8 + k)] = -u.x * x[k];
            a[(r1, 4 + k)] = x[k];
            a[(r1, 8 + k)] = -u.y * x[k];
        }
    }
    let svd = a.svd(false, true);
    let v_t = svd.v_t?;
    let (min_idx, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))?;
    let row = v_t.row(min_idx);
    let p_norm = na::Matrix3x4::from_row_slice(row.transpose().as_slice());

    let t2_inv = t2.try_inverse()?;
    Some(t2_inv * p_norm * t3)
}

/// Splits `M = K R` with `K` upper triangular with positive diagonal.
fn rq3(m: &na::Matrix3<f64>) -> (na::Matrix3<f64>, na::Matrix3<f64>) {
    let flip = na::Matrix3::new(0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
    let qr = (flip * m).transpose().qr();
    let q = qr.q();
    let r = qr.r();
    let mut k = flip * r.transpose() * flip;
    let mut rot = flip * q.transpose();
    for i in 0..3 {
        if k[(i, i)] < 0.0 {
            k.column_mut(i).neg_mut();
            rot.row_mut(i).neg_mut();
        }
    }
    (k, rot)
}

/// Pose and focal length from a projection matrix.
pub fn decompose(p: &na::Matrix3x4<f64>) -> Option<Resection> {
    let mut m = p.fixed_view::<3, 3>(0, 0).into_owned();
    let mut p4 = p.column(3).into_owned();
    let det = m.determinant();
    if det.abs() < 1e-300 {
        return None;
    }
    if det < 0.0 {
        m = -m;
        p4 = -p4;
    }
    let (k, rot) = rq3(&m);
    if k[(2, 2)].abs() < 1e-300 {
        return None;
    }
    let k = k / k[(2, 2)];
    let focal = 0.5 * (k[(0, 0)] + k[(1, 1)]);
    if !focal.is_finite() || focal <= 0.0 {
        return None;
    }
    let center = -(m.try_inverse()? * p4);
    Some(Resection {
        pose: Pose3::new(rot, center),
        focal,
    })
}

pub fn resection(world: &[na::Vector3<f64>], image: &[na::Vector2<f64>]) -> Option<Resection> {
    decompose(&projection_matrix(world, image)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Intrinsics;

    #[test]
    fn recovers_focal_and_pose() {
        let intr = Intrinsics::from_params(1280, 720, &[950.0, 640.0, 360.0]);
        let gt = Pose3::from_isometry(&na::Isometry3::new(
            na::Vector3::new(0.2, -0.1, 3.0),
            na::Vector3::new(0.05, 0.3, -0.1),
        ));
        let mut world = Vec::new();
        let mut image = Vec::new();
        for i in 0..12 {
            let f = i as f64;
            let p = na::Vector3::new((f * 0.7).sin(), (f * 1.3).cos() * 0.8, (f * 0.4).sin() * 0.9);
            image.push(intr.project_world(&gt, &p).unwrap());
            world.push(p);
        }
        let res = resection(&world, &image).unwrap();
        assert!((res.focal - 950.0).abs() < 1e-4, "focal {}", res.focal);
        assert!(res.pose.rotation_angle_to(&gt) < 1e-8);
        assert!(res.pose.center_distance_to(&gt) < 1e-6);
    }
}
