//! Local features: AKAZE keypoints with binary descriptors, plus square
//! fiducial marker corners.

use akaze::Akaze;
use aprilgrid::TagFamily;
use aprilgrid::detector::TagDetector;
use image::{DynamicImage, GrayImage};
use nalgebra as na;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Unpacked length of an AKAZE descriptor (64 bytes).
pub const DESCRIPTOR_LEN: usize = 64 * 8;

/// Keypoint in full resolution pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub x: f32,
    pub y: f32,
    pub scale: f32,
    pub orientation: f32,
}

/// Detected marker corner. `id` is `tag_id * 4 + corner`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarkerObservation {
    pub id: u32,
    pub point: na::Vector2<f64>,
}

/// Everything extracted from one image. `descriptors[i]` belongs to
/// `features[i]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Regions {
    pub features: Vec<Feature>,
    pub descriptors: Vec<Vec<f32>>,
    pub markers: Vec<MarkerObservation>,
}

impl Regions {
    pub fn len(&self) -> usize {
        self.features.len()
    }
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.markers.is_empty()
    }
    pub fn point(&self, index: usize) -> na::Vector2<f64> {
        let f = &self.features[index];
        na::Vector2::new(f.x as f64, f.y as f64)
    }
}

/// Detector density. Higher presets use more octaves, a lower detector
/// threshold and keep more features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum FeaturePreset {
    Low,
    Medium,
    #[default]
    Normal,
    High,
    Ultra,
}

impl FeaturePreset {
    fn octaves(self) -> u32 {
        match self {
            FeaturePreset::Low => 2,
            FeaturePreset::Medium | FeaturePreset::Normal => 3,
            FeaturePreset::High | FeaturePreset::Ultra => 4,
        }
    }
    fn detector_threshold(self) -> f64 {
        match self {
            FeaturePreset::Low => 0.008,
            FeaturePreset::Medium => 0.003,
            FeaturePreset::Normal => 0.001,
            FeaturePreset::High => 0.0005,
            FeaturePreset::Ultra => 0.0001,
        }
    }
    fn max_features(self) -> usize {
        match self {
            FeaturePreset::Low => 1000,
            FeaturePreset::Medium => 2000,
            FeaturePreset::Normal => 4000,
            FeaturePreset::High => 8000,
            FeaturePreset::Ultra => 16000,
        }
    }
}

pub trait FeatureExtractor: Send + Sync {
    fn extract(&self, image: &GrayImage, preset: FeaturePreset) -> Regions;

    /// Length of every descriptor `extract` produces.
    fn descriptor_len(&self) -> usize;
}

pub trait MarkerDetector: Send + Sync {
    fn detect(&self, image: &GrayImage) -> Vec<MarkerObservation>;
}

/// Unpacks a binary descriptor into one `0.0`/`1.0` entry per bit, so the
/// squared L2 distance between two unpacked descriptors is their Hamming
/// distance.
pub fn unpack_bits(bytes: &[u8]) -> Vec<f32> {
    bytes
        .iter()
        .flat_map(|b| (0..8).map(move |i| ((b >> i) & 1) as f32))
        .collect()
}

/// AKAZE keypoints and binary MLDB descriptors.
#[derive(Debug, Clone, Default)]
pub struct AkazeExtractor;

impl FeatureExtractor for AkazeExtractor {
    fn extract(&self, image: &GrayImage, preset: FeaturePreset) -> Regions {
        let Some(gray) =
            akaze_image::GrayImage::from_raw(image.width(), image.height(), image.as_raw().clone())
        else {
            log::warn!("image buffer does not match {}x{}", image.width(), image.height());
            return Regions::default();
        };
        let mut akaze = Akaze::new(preset.detector_threshold());
        akaze.max_octave_evolution = preset.octaves();
        let (keypoints, descriptors) = akaze.extract(&akaze_image::DynamicImage::ImageLuma8(gray));

        let mut candidates: Vec<_> = keypoints
            .into_par_iter()
            .zip(descriptors.into_par_iter())
            .map(|(kp, d)| {
                let feature = Feature {
                    x: kp.point.0,
                    y: kp.point.1,
                    scale: kp.size,
                    orientation: kp.angle,
                };
                (kp.response, feature, unpack_bits(d.bytes()))
            })
            .collect();
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then(a.1.y.total_cmp(&b.1.y))
                .then(a.1.x.total_cmp(&b.1.x))
        });
        candidates.truncate(preset.max_features());
        let (features, descriptors): (Vec<_>, Vec<_>) =
            candidates.into_iter().map(|(_, f, d)| (f, d)).unzip();
        log::trace!("extracted {} features", features.len());
        Regions {
            features,
            descriptors,
            markers: Vec::new(),
        }
    }

    fn descriptor_len(&self) -> usize {
        DESCRIPTOR_LEN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum MarkerFamily {
    T16h5,
    T25h7,
    T25h9,
    #[default]
    T36h11,
}

impl MarkerFamily {
    fn tag_family(self) -> TagFamily {
        match self {
            MarkerFamily::T16h5 => TagFamily::T16H5,
            MarkerFamily::T25h7 => TagFamily::T25H7,
            MarkerFamily::T25h9 => TagFamily::T25H9,
            MarkerFamily::T36h11 => TagFamily::T36H11,
        }
    }
}

/// AprilTag corners. A detector is built per call so the type stays
/// `Send + Sync`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AprilTagDetector {
    pub family: MarkerFamily,
}

impl MarkerDetector for AprilTagDetector {
    fn detect(&self, image: &GrayImage) -> Vec<MarkerObservation> {
        let detector = TagDetector::new(&self.family.tag_family(), None);
        let detected = detector.detect(&DynamicImage::ImageLuma8(image.clone()));
        let mut markers: Vec<_> = detected
            .iter()
            .flat_map(|(tag_id, corners)| {
                corners.iter().enumerate().map(move |(i, p)| MarkerObservation {
                    id: tag_id * 4 + i as u32,
                    point: na::Vector2::new(p.0 as f64, p.1 as f64),
                })
            })
            .collect();
        markers.sort_by_key(|m| m.id);
        log::trace!("detected {} marker corners", markers.len());
        markers
    }
}
