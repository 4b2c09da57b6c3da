use image::{DynamicImage, GrayImage, RgbImage};
use nalgebra as na;
use rayon::prelude::*;

use crate::cache::LocalizationResult;
use crate::camera::Intrinsics;

/// For every pixel of the undistorted output, the pixel of the distorted
/// input it samples. The output keeps the focal length and principal point.
pub fn undistortion_map(intrinsics: &Intrinsics) -> (na::DMatrix<f32>, na::DMatrix<f32>) {
    let (w, h) = (intrinsics.width as usize, intrinsics.height as usize);
    let coords: Vec<(f32, f32)> = (0..w * h)
        .into_par_iter()
        .map(|idx| {
            let (x, y) = ((idx % w) as f64, (idx / w) as f64);
            let ray = na::Vector3::new(
                (x - intrinsics.principal_point.x) / intrinsics.focal,
                (y - intrinsics.principal_point.y) / intrinsics.focal,
                1.0,
            );
            match intrinsics.project(&ray) {
                Some(p) => (p.x as f32, p.y as f32),
                None => (f32::NAN, f32::NAN),
            }
        })
        .collect();
    let map0 = na::DMatrix::from_fn(h, w, |r, c| coords[r * w + c].0);
    let map1 = na::DMatrix::from_fn(h, w, |r, c| coords[r * w + c].1);
    (map0, map1)
}

fn source_pixel(x: f32, y: f32, width: u32, height: u32) -> Option<(u32, u32)> {
    if x.is_nan() || y.is_nan() {
        return None;
    }
    let (xr, yr) = (x.round(), y.round());
    if xr < 0.0 || yr < 0.0 || xr >= width as f32 || yr >= height as f32 {
        None
    } else {
        Some((xr as u32, yr as u32))
    }
}

/// Nearest neighbour remap. Pixels sampling outside the source are black.
pub fn remap(src: &DynamicImage, map0: &na::DMatrix<f32>, map1: &na::DMatrix<f32>) -> DynamicImage {
    let (r, c) = map0.shape();
    match src {
        DynamicImage::ImageLuma8(img) => {
            DynamicImage::ImageLuma8(GrayImage::from_par_fn(c as u32, r as u32, |x, y| {
                let (row, col) = (y as usize, x as usize);
                match source_pixel(map0[(row, col)], map1[(row, col)], img.width(), img.height()) {
                    Some((sx, sy)) => *img.get_pixel(sx, sy),
                    None => image::Luma([0]),
                }
            }))
        }
        other => {
            let img = other.to_rgb8();
            DynamicImage::ImageRgb8(RgbImage::from_par_fn(c as u32, r as u32, |x, y| {
                let (row, col) = (y as usize, x as usize);
                match source_pixel(map0[(row, col)], map1[(row, col)], img.width(), img.height()) {
                    Some((sx, sy)) => *img.get_pixel(sx, sy),
                    None => image::Rgb([0, 0, 0]),
                }
            }))
        }
    }
}

pub fn undistort_image(image: &DynamicImage, intrinsics: &Intrinsics) -> DynamicImage {
    if !intrinsics.has_distortion() {
        return image.clone();
    }
    let (map0, map1) = undistortion_map(intrinsics);
    remap(image, &map0, &map1)
}

/// Output image of a frame: undistorted with the estimated intrinsics when
/// localized, the input unchanged otherwise.
pub fn output_image(image: &DynamicImage, result: Option<&LocalizationResult>) -> DynamicImage {
    match result {
        Some(r) => undistort_image(image, &r.intrinsics),
        None => image.clone(),
    }
}
