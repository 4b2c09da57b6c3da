pub mod cache;
pub mod camera;
pub mod config;
pub mod data_loader;
pub mod database;
pub mod engine;
pub mod features;
pub mod io;
pub mod localizer;
pub mod matching;
pub mod optimization;
pub mod rig_calibration;
pub mod types;
pub mod undistort;
pub mod voctree;

pub use cache::{FailureReason, LocalizationOutcome, LocalizationResult};
pub use config::{ConfigurationError, LocalizerConfig, LocalizerParams};
pub use engine::{AbortCheck, CameraInput, FrameRequest, LocalizerEngine, NeverAbort};
