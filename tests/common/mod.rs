#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use camera_localizer::camera::Intrinsics;
use camera_localizer::database::{DatabaseView, SceneDatabase, ScenePoint, ViewFeature};
use camera_localizer::features::{
    Feature, FeatureExtractor, FeaturePreset, MarkerDetector, MarkerObservation, Regions,
};
use camera_localizer::localizer::VoctreeLocalizer;
use camera_localizer::types::Pose3;
use camera_localizer::voctree::VocabularyTree;
use image::{GrayImage, Luma};
use nalgebra as na;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const DESC_LEN: usize = 32;
pub const WIDTH: u32 = 640;
pub const HEIGHT: u32 = 480;

pub fn intrinsics() -> Intrinsics {
    Intrinsics::from_params(WIDTH, HEIGHT, &[500.0, 320.0, 240.0])
}

pub fn pose(translation: [f64; 3], rotation: [f64; 3]) -> Pose3 {
    Pose3::from_isometry(&na::Isometry3::new(
        na::Vector3::from(translation),
        na::Vector3::from(rotation),
    ))
}

fn random_unit(rng: &mut ChaCha8Rng) -> Vec<f32> {
    let mut v: Vec<f32> = (0..DESC_LEN).map(|_| rng.random_range(-1.0..1.0)).collect();
    let n = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    v.iter_mut().for_each(|x| *x /= n);
    v
}

fn jitter(desc: &[f32], rng: &mut ChaCha8Rng, amount: f32) -> Vec<f32> {
    desc.iter()
        .map(|x| x + rng.random_range(-amount..amount))
        .collect()
}

/// Random 3D points with random descriptors, reconstructed from a few
/// database views.
pub struct SyntheticScene {
    pub points: Vec<na::Vector3<f64>>,
    pub descriptors: Vec<Vec<f32>>,
    pub database: Arc<SceneDatabase>,
    pub tree: VocabularyTree,
}

impl SyntheticScene {
    pub fn new(num_points: usize, seed: u64) -> SyntheticScene {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let points: Vec<_> = (0..num_points)
            .map(|_| {
                na::Vector3::new(
                    rng.random_range(-3.0..3.0),
                    rng.random_range(-2.0..2.0),
                    rng.random_range(5.0..9.0),
                )
            })
            .collect();
        let descriptors: Vec<_> = (0..num_points).map(|_| random_unit(&mut rng)).collect();

        let intr = intrinsics();
        let view_poses = [
            pose([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]),
            pose([0.5, 0.0, 0.0], [0.0, -0.05, 0.0]),
            pose([-0.5, 0.1, 0.0], [0.02, 0.05, 0.0]),
        ];
        let views: Vec<DatabaseView> = view_poses
            .iter()
            .enumerate()
            .map(|(vi, view_pose)| DatabaseView {
                id: vi as u32,
                features: points
                    .iter()
                    .enumerate()
                    .filter_map(|(pi, p)| {
                        let p2d = intr.project_world(view_pose, p)?;
                        intr.contains(&p2d).then(|| ViewFeature {
                            point_id: pi as u32,
                            x: p2d.x as f32,
                            y: p2d.y as f32,
                            descriptor: jitter(&descriptors[pi], &mut rng, 1e-3),
                        })
                    })
                    .collect(),
                markers: Vec::new(),
            })
            .collect();
        let scene_points = points
            .iter()
            .enumerate()
            .map(|(i, p)| ScenePoint {
                id: i as u32,
                position: *p,
            })
            .collect();
        let database = SceneDatabase::new(scene_points, views, Vec::new()).unwrap();
        let refs: Vec<&[f32]> = database.descriptors().collect();
        let tree = VocabularyTree::train(&refs, 4, 2, seed);
        SyntheticScene {
            points,
            descriptors,
            database: Arc::new(database),
            tree,
        }
    }

    /// What a camera at `pose` sees. `outlier_ratio` of the features carry
    /// the descriptor of a wrong point.
    pub fn observe(&self, pose: &Pose3, intr: &Intrinsics, outlier_ratio: f64, seed: u64) -> Regions {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut regions = Regions::default();
        for (pi, p) in self.points.iter().enumerate() {
            let Some(p2d) = intr.project_world(pose, p) else {
                continue;
            };
            if !intr.contains(&p2d) {
                continue;
            }
            let desc = if rng.random_bool(outlier_ratio) {
                let other = (pi + 1 + rng.random_range(0..self.points.len() - 1)) % self.points.len();
                &self.descriptors[other]
            } else {
                &self.descriptors[pi]
            };
            regions.features.push(Feature {
                x: p2d.x as f32,
                y: p2d.y as f32,
                scale: 1.0,
                orientation: 0.0,
            });
            regions.descriptors.push(jitter(desc, &mut rng, 1e-3));
        }
        regions
    }

    /// Like `observe`, but every `ambiguous_every`-th feature carries a
    /// blend of two point descriptors that fails the blind ratio test.
    pub fn observe_ambiguous(&self, pose: &Pose3, intr: &Intrinsics, ambiguous_every: usize) -> Regions {
        let mut regions = self.observe(pose, intr, 0.0, 0);
        let n = self.descriptors.len();
        let mut visible = 0;
        for (pi, p) in self.points.iter().enumerate() {
            let Some(p2d) = intr.project_world(pose, p) else {
                continue;
            };
            if !intr.contains(&p2d) {
                continue;
            }
            if visible % ambiguous_every == 0 {
                let other = &self.descriptors[(pi + 1) % n];
                regions.descriptors[visible] = self.descriptors[pi]
                    .iter()
                    .zip(other)
                    .map(|(a, b)| 0.5 * (a + b))
                    .collect();
            }
            visible += 1;
        }
        regions
    }

    /// Same points and views with surveyed marker corners added.
    pub fn database_with_markers(&self, corners: &[ScenePoint]) -> Arc<SceneDatabase> {
        let points = self
            .points
            .iter()
            .enumerate()
            .map(|(i, p)| ScenePoint {
                id: i as u32,
                position: *p,
            })
            .collect();
        Arc::new(SceneDatabase::new(points, self.database.views().to_vec(), corners.to_vec()).unwrap())
    }

    pub fn localizer(&self, extractor: ScriptedExtractor) -> VoctreeLocalizer {
        VoctreeLocalizer::new(self.database.clone(), self.tree.clone(), None, Box::new(extractor)).unwrap()
    }
}

/// Returns prepared regions keyed on the value of the image's first pixel.
#[derive(Clone, Default)]
pub struct ScriptedExtractor {
    pub frames: HashMap<u8, Regions>,
    pub calls: Arc<AtomicUsize>,
}

impl ScriptedExtractor {
    pub fn with(mut self, key: u8, regions: Regions) -> ScriptedExtractor {
        self.frames.insert(key, regions);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FeatureExtractor for ScriptedExtractor {
    fn extract(&self, image: &GrayImage, _preset: FeaturePreset) -> Regions {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.frames
            .get(&image.get_pixel(0, 0)[0])
            .cloned()
            .unwrap_or_default()
    }

    fn descriptor_len(&self) -> usize {
        DESC_LEN
    }
}

/// Image whose first pixel selects the scripted regions.
pub fn keyed_image(key: u8) -> GrayImage {
    let mut img = GrayImage::new(WIDTH, HEIGHT);
    img.put_pixel(0, 0, Luma([key]));
    img
}

/// Corners of `tags` markers scattered through the scene volume, with ids
/// `tag * 4 + corner` starting at zero.
pub fn marker_corners(tags: u32, seed: u64) -> Vec<ScenePoint> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..tags)
        .flat_map(|tag| {
            let center = na::Vector3::new(
                rng.random_range(-2.5..2.5),
                rng.random_range(-1.5..1.5),
                rng.random_range(5.0..8.0),
            );
            [(-0.1, -0.1), (0.1, -0.1), (0.1, 0.1), (-0.1, 0.1)]
                .into_iter()
                .enumerate()
                .map(move |(c, (dx, dy))| ScenePoint {
                    id: tag * 4 + c as u32,
                    position: center + na::Vector3::new(dx, dy, 0.0),
                })
        })
        .collect()
}

/// Marker corners a camera at `pose` sees.
pub fn observe_markers(corners: &[ScenePoint], pose: &Pose3, intr: &Intrinsics) -> Vec<MarkerObservation> {
    corners
        .iter()
        .filter_map(|c| {
            let p2d = intr.project_world(pose, &c.position)?;
            intr.contains(&p2d).then_some(MarkerObservation { id: c.id, point: p2d })
        })
        .collect()
}

/// Marker detector returning prepared corners keyed like `ScriptedExtractor`.
#[derive(Clone, Default)]
pub struct ScriptedMarkers {
    pub frames: HashMap<u8, Vec<MarkerObservation>>,
}

impl ScriptedMarkers {
    pub fn with(mut self, key: u8, markers: Vec<MarkerObservation>) -> ScriptedMarkers {
        self.frames.insert(key, markers);
        self
    }
}

impl MarkerDetector for ScriptedMarkers {
    fn detect(&self, image: &GrayImage) -> Vec<MarkerObservation> {
        self.frames
            .get(&image.get_pixel(0, 0)[0])
            .cloned()
            .unwrap_or_default()
    }
}
