use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::{FeaturePreset, MarkerFamily};
use crate::optimization::PoseSolverOptions;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{0} path is not set")]
    MissingPath(&'static str),
    #[error("{what} not found at {path}")]
    NotFound { what: &'static str, path: PathBuf },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("malformed {what} file {path}: {reason}")]
    Malformed {
        what: &'static str,
        path: PathBuf,
        reason: String,
    },
    #[error("invalid scene database: {0}")]
    InvalidDatabase(String),
    #[error("invalid vocabulary tree: {0}")]
    InvalidVocabulary(String),
    #[error("feature type {feature_type:?} requires {requirement}")]
    UnsupportedFeatureType {
        feature_type: FeatureType,
        requirement: &'static str,
    },
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Which kind of image evidence drives the localization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum FeatureType {
    /// AKAZE descriptors retrieved through the vocabulary tree.
    #[default]
    Sift,
    /// Descriptors plus marker corners.
    SiftAndMarker,
    /// Marker corners only.
    Marker,
}

impl FeatureType {
    pub fn uses_descriptors(self) -> bool {
        matches!(self, FeatureType::Sift | FeatureType::SiftAndMarker)
    }
    pub fn uses_markers(self) -> bool {
        matches!(self, FeatureType::SiftAndMarker | FeatureType::Marker)
    }
}

/// How correspondences from several candidate views are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum MatchingAlgorithm {
    /// Stop at the best ranked view that yields correspondences.
    FirstBest,
    /// Merge correspondences of all candidate views.
    #[default]
    AllResults,
}

/// Where the scene database lives and what index is built over it.
/// Changing any of it requires a rebuild of the localizer.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub reconstruction_path: Option<PathBuf>,
    pub voctree_path: Option<PathBuf>,
    #[serde(default)]
    pub voctree_weights_path: Option<PathBuf>,
    #[serde(default)]
    pub feature_type: FeatureType,
    #[serde(default)]
    pub marker_family: MarkerFamily,
}

/// Per-request tuning that never requires reloading the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerParams {
    pub preset: FeaturePreset,
    pub algorithm: MatchingAlgorithm,
    pub num_candidate_views: usize,
    /// Correspondences kept per matched view, 0 keeps all.
    pub max_results: usize,
    pub distance_ratio: f32,
    pub reprojection_error: f64,
    pub use_guided_matching: bool,
    pub guided_search_radius: f64,
    /// Database views consulted by the marker localizer.
    pub nearest_key_frames: usize,
    pub refine: bool,
    pub refine_intrinsics: bool,
    pub ransac_iterations: usize,
    pub min_inliers: usize,
    pub seed: u64,
}

impl Default for LocalizerParams {
    fn default() -> Self {
        Self {
            preset: FeaturePreset::Normal,
            algorithm: MatchingAlgorithm::AllResults,
            num_candidate_views: 4,
            max_results: 0,
            distance_ratio: 0.8,
            reprojection_error: 4.0,
            use_guided_matching: false,
            guided_search_radius: 20.0,
            nearest_key_frames: 4,
            refine: true,
            refine_intrinsics: true,
            ransac_iterations: 1024,
            min_inliers: 7,
            seed: 42,
        }
    }
}

impl LocalizerParams {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |name: &'static str, reason: &str| {
            Err(ConfigurationError::InvalidParameter {
                name,
                reason: reason.to_string(),
            })
        };
        if self.num_candidate_views == 0 {
            return invalid("num_candidate_views", "must be at least 1");
        }
        if !(self.distance_ratio > 0.0 && self.distance_ratio <= 1.0) {
            return invalid("distance_ratio", "must be in (0, 1]");
        }
        if !(self.reprojection_error > 0.0 && self.reprojection_error.is_finite()) {
            return invalid("reprojection_error", "must be a positive number of pixels");
        }
        if self.use_guided_matching && !(self.guided_search_radius > 0.0) {
            return invalid("guided_search_radius", "must be positive");
        }
        if self.nearest_key_frames == 0 {
            return invalid("nearest_key_frames", "must be at least 1");
        }
        if self.ransac_iterations == 0 {
            return invalid("ransac_iterations", "must be at least 1");
        }
        Ok(())
    }

    pub fn solver_options(&self) -> PoseSolverOptions {
        PoseSolverOptions {
            reprojection_error: self.reprojection_error,
            max_iterations: self.ransac_iterations,
            min_inliers: self.min_inliers,
            seed: self.seed,
            refine: self.refine,
            refine_intrinsics: self.refine_intrinsics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalizerConfig {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub params: LocalizerParams,
}

impl LocalizerConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.database.reconstruction_path.is_none() {
            return Err(ConfigurationError::MissingPath("reconstruction"));
        }
        if self.database.feature_type.uses_descriptors() && self.database.voctree_path.is_none() {
            return Err(ConfigurationError::MissingPath("vocabulary tree"));
        }
        self.params.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_modes_need_a_vocabulary_tree() {
        let config = LocalizerConfig {
            database: DatabaseConfig {
                reconstruction_path: Some("scene.json".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::MissingPath("vocabulary tree"))
        ));

        let markers_only = LocalizerConfig {
            database: DatabaseConfig {
                feature_type: FeatureType::Marker,
                ..config.database.clone()
            },
            ..config
        };
        assert!(markers_only.validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        let params = LocalizerParams {
            distance_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            params.validate(),
            Err(ConfigurationError::InvalidParameter {
                name: "distance_ratio",
                ..
            })
        ));
    }

    #[test]
    fn params_fill_defaults_from_partial_json() {
        let params: LocalizerParams =
            serde_json::from_str(r#"{ "reprojection_error": 2.5, "algorithm": "FirstBest" }"#)
                .unwrap();
        assert_eq!(params.reprojection_error, 2.5);
        assert_eq!(params.algorithm, MatchingAlgorithm::FirstBest);
        assert_eq!(params.num_candidate_views, 4);
    }
}
