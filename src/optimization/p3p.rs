//! Grunert's P3P solver on unit bearing vectors.

use nalgebra as na;

use crate::types::Pose3;

fn poly_mul(a: &[f64; 5], b: &[f64; 5]) -> [f64; 5] {
    let mut out = [0.0; 5];
    for i in 0..5 {
        for j in 0..5 - i {
            out[i + j] += a[i] * b[j];
        }
    }
    out
}

/// Real roots of a polynomial with coefficients in ascending order.
///
/// Leading near-zero coefficients are dropped, the roots come from the
/// eigenvalues of the companion matrix and are polished with Newton steps.
pub fn real_roots(coeffs: &[f64]) -> Vec<f64> {
    let scale = coeffs.iter().fold(0.0f64, |m, c| m.max(c.abs()));
    if scale == 0.0 {
        return Vec::new();
    }
    let mut degree = coeffs.len() - 1;
    while degree > 0 && coeffs[degree].abs() < 1e-12 * scale {
        degree -= 1;
    }
    if degree == 0 {
        return Vec::new();
    }
    let lead = coeffs[degree];
    let mut comp = na::DMatrix::<f64>::zeros(degree, degree);
    for j in 0..degree {
        comp[(0, j)] = -coeffs[degree - 1 - j] / lead;
    }
    for i in 1..degree {
        comp[(i, i - 1)] = 1.0;
    }
    let eigvals = na::Schur::new(comp).complex_eigenvalues();

    let eval = |x: f64| {
        let mut v = 0.0;
        let mut dv = 0.0;
        for &c in coeffs[..=degree].iter().rev() {
            dv = dv * x + v;
            v = v * x + c;
        }
        (v, dv)
    };

    let mut roots: Vec<f64> = eigvals
        .iter()
        .filter(|z| z.im.abs() < 1e-6 * (1.0 + z.re.abs()))
        .map(|z| {
            let mut x = z.re;
            for _ in 0..5 {
                let (v, dv) = eval(x);
                if dv.abs() < 1e-300 {
                    break;
                }
                let step = v / dv;
                x -= step;
                if step.abs() < 1e-15 * (1.0 + x.abs()) {
                    break;
                }
            }
            x
        })
        .collect();
    roots.sort_by(|a, b| a.total_cmp(b));
    roots.dedup_by(|a, b| (*a - *b).abs() < 1e-10);
    roots
}

/// World to camera pose aligning `world` onto `camera` (Kabsch).
pub fn pose_from_points(world: &[na::Vector3<f64>], camera: &[na::Vector3<f64>]) -> Option<Pose3> {
    if world.len() != camera.len() || world.len() < 3 {
        return None;
    }
    let n = world.len() as f64;
    let c_w = world.iter().sum::<na::Vector3<f64>>() / n;
    let c_c = camera.iter().sum::<na::Vector3<f64>>() / n;
    let mut h = na::Matrix3::zeros();
    for (pw, pc) in world.iter().zip(camera) {
        h += (pc - c_c) * (pw - c_w).transpose();
    }
    let svd = h.svd(true, true);
    let u = svd.u?;
    let v_t = svd.v_t?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_fix = u;
        u_fix.column_mut(2).neg_mut();
        r = u_fix * v_t;
    }
    let t = c_c - r * c_w;
    Some(Pose3::new(r, -(r.transpose() * t)))
}

/// Up to four world to camera poses from three points and their unit
/// bearing vectors. Solutions with points behind the camera are dropped.
pub fn p3p(world: &[na::Vector3<f64>; 3], bearings: &[na::Vector3<f64>; 3]) -> Vec<Pose3> {
    let a = (world[1] - world[2]).norm();
    let b = (world[0] - world[2]).norm();
    let c = (world[0] - world[1]).norm();
    if a <= f64::EPSILON || b <= f64::EPSILON || c <= f64::EPSILON {
        return Vec::new();
    }
    // collinear points give a one parameter family of poses
    if (world[1] - world[0]).cross(&(world[2] - world[0])).norm() < 1e-10 * c * b {
        return Vec::new();
    }

    let cos_alpha = bearings[1].dot(&bearings[2]);
    let cos_beta = bearings[0].dot(&bearings[2]);
    let cos_gamma = bearings[0].dot(&bearings[1]);

    let (a2, b2, c2) = (a * a, b * b, c * c);
    let d = (b2 - a2) / c2;
    let e = b2 / c2;

    let n_poly = [1.0 - d, 2.0 * d * cos_gamma, -(1.0 + d), 0.0, 0.0];
    let d_poly = [2.0 * cos_beta, -2.0 * cos_alpha, 0.0, 0.0, 0.0];
    let e_poly = [1.0 - e, 2.0 * e * cos_gamma, -e, 0.0, 0.0];

    let n2 = poly_mul(&n_poly, &n_poly);
    let nd = poly_mul(&n_poly, &d_poly);
    let ed2 = poly_mul(&e_poly, &poly_mul(&d_poly, &d_poly));
    let mut coeffs = [0.0; 5];
    for i in 0..5 {
        coeffs[i] = n2[i] - 2.0 * cos_beta * nd[i] + ed2[i];
    }

    let mut solutions = Vec::new();
    for u in real_roots(&coeffs) {
        if u <= 0.0 {
            continue;
        }
        let den = 2.0 * (cos_beta - u * cos_alpha);
        let k = 1.0 + u * u - 2.0 * u * cos_gamma;
        if den.abs() < 1e-12 || k <= 1e-12 {
            continue;
        }
        let v = (n_poly[0] + n_poly[1] * u + n_poly[2] * u * u) / den;
        if v <= 0.0 {
            continue;
        }
        let x = (c2 / k).sqrt();
        let cam = [bearings[0] * x, bearings[1] * (u * x), bearings[2] * (v * x)];
        if let Some(pose) = pose_from_points(world, &cam) {
            solutions.push(pose);
        }
    }
    solutions
}
