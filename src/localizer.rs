//! Localizer variants. Each turns an image into 2D-3D correspondences
//! against the scene database; the orchestration only sees the trait.

use std::sync::Arc;

use image::GrayImage;

use crate::camera::Intrinsics;
use crate::config::{ConfigurationError, DatabaseConfig, FeatureType, LocalizerParams, MatchingAlgorithm};
use crate::database::{DatabaseView, SceneDatabase};
use crate::features::{
    AkazeExtractor, AprilTagDetector, FeatureExtractor, FeaturePreset, MarkerDetector, Regions,
};
use crate::matching::{
    Correspondence, MatchOptions, guided_match, marker_correspondences, match_view,
    merge_correspondences,
};
use crate::types::Pose3;
use crate::voctree::{ViewIndex, VocabularyTree};

/// Correspondences of one image plus the database views they came from.
#[derive(Debug, Clone, Default)]
pub struct MatchedFrame {
    pub correspondences: Vec<Correspondence>,
    /// Indices into `SceneDatabase::views`, best ranked first.
    pub views: Vec<usize>,
}

pub trait Localizer: Send + Sync {
    fn is_initialized(&self) -> bool;

    fn database(&self) -> &SceneDatabase;

    fn extract(&self, image: &GrayImage, preset: FeaturePreset) -> Regions;

    /// Blind correspondence search. An empty result means failure and is
    /// not retried.
    fn build_correspondences(&self, regions: &Regions, params: &LocalizerParams) -> MatchedFrame;

    /// Correspondences found by projecting the points of `frame.views`
    /// with a pose estimate. Variants without descriptors find none.
    fn guided_correspondences(
        &self,
        _regions: &Regions,
        _frame: &MatchedFrame,
        _pose: &Pose3,
        _intrinsics: &Intrinsics,
        _params: &LocalizerParams,
    ) -> Vec<Correspondence> {
        Vec::new()
    }
}

fn match_options(params: &LocalizerParams) -> MatchOptions {
    MatchOptions {
        distance_ratio: params.distance_ratio,
        max_results: params.max_results,
    }
}

/// Vocabulary tree retrieval followed by ratio-tested descriptor matching,
/// optionally augmented with marker corners.
pub struct VoctreeLocalizer {
    database: Arc<SceneDatabase>,
    index: ViewIndex,
    extractor: Box<dyn FeatureExtractor>,
    marker_detector: Option<Box<dyn MarkerDetector>>,
}

impl VoctreeLocalizer {
    pub fn new(
        database: Arc<SceneDatabase>,
        tree: VocabularyTree,
        weights: Option<Vec<f32>>,
        extractor: Box<dyn FeatureExtractor>,
    ) -> Result<VoctreeLocalizer, ConfigurationError> {
        let expected = extractor.descriptor_len();
        if database.descriptor_len() != 0 && database.descriptor_len() != expected {
            return Err(ConfigurationError::InvalidDatabase(format!(
                "descriptor length {} does not match the extractor's {}",
                database.descriptor_len(),
                expected
            )));
        }
        let index = ViewIndex::build(tree, weights, &database)?;
        Ok(VoctreeLocalizer {
            database,
            index,
            extractor,
            marker_detector: None,
        })
    }

    pub fn with_marker_detector(mut self, detector: Box<dyn MarkerDetector>) -> VoctreeLocalizer {
        self.marker_detector = Some(detector);
        self
    }
}

impl Localizer for VoctreeLocalizer {
    fn is_initialized(&self) -> bool {
        !self.database.views().is_empty() && self.index.tree().num_words > 0
    }

    fn database(&self) -> &SceneDatabase {
        &self.database
    }

    fn extract(&self, image: &GrayImage, preset: FeaturePreset) -> Regions {
        let mut regions = self.extractor.extract(image, preset);
        if let Some(detector) = &self.marker_detector {
            regions.markers = detector.detect(image);
        }
        regions
    }

    fn build_correspondences(&self, regions: &Regions, params: &LocalizerParams) -> MatchedFrame {
        let mut frame = MatchedFrame::default();
        if !regions.descriptors.is_empty() {
            let candidates = self
                .index
                .query(&regions.descriptors, params.num_candidate_views);
            log::debug!("voctree: {} candidate views", candidates.len());
            let options = match_options(params);
            for candidate in candidates {
                let view = &self.database.views()[candidate.view_index];
                let matches = match_view(regions, view, &self.database, &options);
                log::trace!(
                    "view {} (score {:.3}): {} matches",
                    view.id,
                    candidate.score,
                    matches.len()
                );
                if matches.is_empty() {
                    continue;
                }
                frame.views.push(candidate.view_index);
                frame.correspondences = merge_correspondences(&frame.correspondences, &matches);
                if params.algorithm == MatchingAlgorithm::FirstBest {
                    break;
                }
            }
        }
        if self.marker_detector.is_some() {
            let markers = marker_correspondences(regions, &self.database);
            frame.correspondences = merge_correspondences(&frame.correspondences, &markers);
        }
        frame
    }

    fn guided_correspondences(
        &self,
        regions: &Regions,
        frame: &MatchedFrame,
        pose: &Pose3,
        intrinsics: &Intrinsics,
        params: &LocalizerParams,
    ) -> Vec<Correspondence> {
        let views: Vec<&DatabaseView> = frame
            .views
            .iter()
            .filter_map(|&i| self.database.views().get(i))
            .collect();
        guided_match(
            regions,
            &views,
            &self.database,
            pose,
            intrinsics,
            params.guided_search_radius,
            &match_options(params),
        )
    }
}

/// Localization from fiducial marker corners with surveyed 3D positions.
pub struct MarkerLocalizer {
    database: Arc<SceneDatabase>,
    detector: Box<dyn MarkerDetector>,
}

impl MarkerLocalizer {
    pub fn new(
        database: Arc<SceneDatabase>,
        detector: Box<dyn MarkerDetector>,
    ) -> Result<MarkerLocalizer, ConfigurationError> {
        if !database.has_markers() {
            return Err(ConfigurationError::UnsupportedFeatureType {
                feature_type: FeatureType::Marker,
                requirement: "marker positions in the scene database",
            });
        }
        Ok(MarkerLocalizer { database, detector })
    }

    /// Views sharing the most marker corners with the query.
    fn nearest_views(&self, regions: &Regions, count: usize) -> Vec<usize> {
        let mut shared: Vec<(usize, usize)> = self
            .database
            .views()
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let n = regions.markers.iter().filter(|m| v.markers.contains(&m.id)).count();
                (i, n)
            })
            .filter(|(_, n)| *n > 0)
            .collect();
        shared.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        shared.into_iter().take(count).map(|(i, _)| i).collect()
    }
}

impl Localizer for MarkerLocalizer {
    fn is_initialized(&self) -> bool {
        self.database.has_markers()
    }

    fn database(&self) -> &SceneDatabase {
        &self.database
    }

    fn extract(&self, image: &GrayImage, _preset: FeaturePreset) -> Regions {
        Regions {
            markers: self.detector.detect(image),
            ..Regions::default()
        }
    }

    fn build_correspondences(&self, regions: &Regions, params: &LocalizerParams) -> MatchedFrame {
        let correspondences = marker_correspondences(regions, &self.database);
        log::debug!(
            "markers: {} corners, {} with known positions",
            regions.markers.len(),
            correspondences.len()
        );
        MatchedFrame {
            correspondences,
            views: self.nearest_views(regions, params.nearest_key_frames),
        }
    }
}

/// Loads the database and index named by `config` and builds the matching
/// localizer variant.
pub fn build_localizer(config: &DatabaseConfig) -> Result<Arc<dyn Localizer>, ConfigurationError> {
    let reconstruction = config
        .reconstruction_path
        .as_ref()
        .ok_or(ConfigurationError::MissingPath("reconstruction"))?;
    let database = Arc::new(SceneDatabase::load(reconstruction)?);
    let marker_detector = AprilTagDetector {
        family: config.marker_family,
    };

    match config.feature_type {
        FeatureType::Marker => Ok(Arc::new(MarkerLocalizer::new(
            database,
            Box::new(marker_detector),
        )?)),
        FeatureType::Sift | FeatureType::SiftAndMarker => {
            let tree_path = config
                .voctree_path
                .as_ref()
                .ok_or(ConfigurationError::MissingPath("vocabulary tree"))?;
            let tree = VocabularyTree::load(tree_path)?;
            let weights = config
                .voctree_weights_path
                .as_deref()
                .map(ViewIndex::load_weights)
                .transpose()?;
            if config.feature_type == FeatureType::SiftAndMarker && !database.has_markers() {
                return Err(ConfigurationError::UnsupportedFeatureType {
                    feature_type: FeatureType::SiftAndMarker,
                    requirement: "marker positions in the scene database",
                });
            }
            let localizer =
                VoctreeLocalizer::new(database, tree, weights, Box::new(AkazeExtractor))?;
            if config.feature_type == FeatureType::SiftAndMarker {
                Ok(Arc::new(localizer.with_marker_detector(Box::new(marker_detector))))
            } else {
                Ok(Arc::new(localizer))
            }
        }
    }
}
