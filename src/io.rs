use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::cache::{LocalizationCache, SolveMode};
use crate::camera::Intrinsics;
use crate::config::ConfigurationError;
use crate::optimization::ReprojectionStats;
use crate::types::FrameTime;

/// Serializes an object to a pretty printed JSON file.
///
/// # Arguments
/// * `output_path` - File to create or overwrite.
/// * `object` - Any serializable value.
pub fn object_to_json<T: Serialize>(output_path: &Path, object: &T) -> Result<(), ConfigurationError> {
    let j = serde_json::to_string_pretty(object).map_err(|source| ConfigurationError::Parse {
        path: output_path.to_path_buf(),
        source,
    })?;
    let mut file = std::fs::File::create(output_path).map_err(|source| ConfigurationError::Io {
        path: output_path.to_path_buf(),
        source,
    })?;
    file.write_all(j.as_bytes()).map_err(|source| ConfigurationError::Io {
        path: output_path.to_path_buf(),
        source,
    })
}

/// Deserializes an object from a JSON file.
///
/// Fields the type defaults with serde may be left out of the file.
pub fn object_from_json<T: DeserializeOwned>(file_path: &Path) -> Result<T, ConfigurationError> {
    let contents = read_to_string(file_path)?;
    serde_json::from_str(&contents).map_err(|source| ConfigurationError::Parse {
        path: file_path.to_path_buf(),
        source,
    })
}

pub(crate) fn read_to_string(path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Whitespace separated numbers, skipping `#` comments.
pub(crate) fn read_numbers(path: &Path, what: &'static str) -> Result<Vec<f64>, ConfigurationError> {
    let contents = read_to_string(path)?;
    contents
        .lines()
        .map(|l| l.split('#').next().unwrap_or(""))
        .flat_map(str::split_whitespace)
        .map(|tok| {
            tok.parse::<f64>().map_err(|_| ConfigurationError::Malformed {
                what,
                path: path.to_path_buf(),
                reason: format!("'{}' is not a number", tok),
            })
        })
        .collect()
}

/// Reads a pinhole lens file: `width height focal ppx ppy [k1 k2 k3]`.
///
/// Distortion coefficients past the third are ignored with a warning.
/// Values may be split over any number of lines and `#` starts a comment.
///
/// Returns the intrinsics and the warnings raised while reading them.
pub fn read_lens_calibration(path: &Path) -> Result<(Intrinsics, Vec<String>), ConfigurationError> {
    let values = read_numbers(path, "lens calibration")?;
    if values.len() < 5 {
        return Err(ConfigurationError::Malformed {
            what: "lens calibration",
            path: path.to_path_buf(),
            reason: format!("expected at least 5 values, found {}", values.len()),
        });
    }
    let (width, height) = (values[0], values[1]);
    if width < 1.0 || height < 1.0 || width.fract() != 0.0 || height.fract() != 0.0 {
        return Err(ConfigurationError::Malformed {
            what: "lens calibration",
            path: path.to_path_buf(),
            reason: format!("invalid image size {}x{}", width, height),
        });
    }
    let mut warnings = Vec::new();
    let distortion = &values[5..];
    if distortion.len() > 3 {
        let msg = format!(
            "{}: {} distortion parameters ignored",
            path.display(),
            distortion.len() - 3
        );
        log::warn!("{}", msg);
        warnings.push(msg);
    }
    let params: Vec<f64> = values[2..5]
        .iter()
        .chain(distortion.iter().take(3))
        .copied()
        .collect();
    Ok((
        Intrinsics::from_params(width as u32, height as u32, &params),
        warnings,
    ))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TrackEntry {
    pub time_ns: FrameTime,
    pub camera: usize,
    /// Row major world to camera rotation.
    pub rotation: [f64; 9],
    pub center: [f64; 3],
    pub focal: f64,
    pub principal_point: [f64; 2],
    pub distortion: [f64; 3],
    pub inliers: usize,
    pub reprojection_error: ReprojectionStats,
    pub rig: bool,
}

/// Writes every cached localization as a JSON track sorted by time.
///
/// Each entry carries the pose and intrinsics of the camera the result was
/// requested for.
///
/// # Arguments
/// * `output_path` - JSON file to write.
/// * `cache` - Results to export, failed times are absent from it.
///
/// Returns the number of entries written.
pub fn write_track(output_path: &Path, cache: &LocalizationCache) -> Result<usize, ConfigurationError> {
    let entries: Vec<TrackEntry> = cache
        .entries()
        .into_iter()
        .map(|(time_ns, r)| {
            let pose = &r.output_pose;
            let m = &pose.rotation;
            TrackEntry {
                time_ns,
                camera: r.output_index,
                rotation: [
                    m[(0, 0)],
                    m[(0, 1)],
                    m[(0, 2)],
                    m[(1, 0)],
                    m[(1, 1)],
                    m[(1, 2)],
                    m[(2, 0)],
                    m[(2, 1)],
                    m[(2, 2)],
                ],
                center: [pose.center.x, pose.center.y, pose.center.z],
                focal: r.intrinsics.focal,
                principal_point: [r.intrinsics.principal_point.x, r.intrinsics.principal_point.y],
                distortion: r.intrinsics.distortion,
                inliers: r.num_inliers(),
                reprojection_error: r.stats,
                rig: matches!(r.mode, SolveMode::Rig { .. }),
            }
        })
        .collect();
    object_to_json(output_path, &entries)?;
    log::info!("wrote {} poses to {}", entries.len(), output_path.display());
    Ok(entries.len())
}
