use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::glob;
use image::{GrayImage, ImageReader};

use crate::config::ConfigurationError;
use crate::types::FrameTime;

/// Spacing of synthesized timestamps when file names carry none.
const FRAME_INTERVAL_NS: FrameTime = 100_000_000;

/// Parses the timestamp from a file path.
///
/// Assumes the filename (without extension) is a timestamp in nanoseconds.
pub fn path_to_timestamp(path: &Path) -> Option<FrameTime> {
    path.file_stem()?.to_str()?.parse().ok()
}

fn img_filter(rp: glob::GlobResult) -> Option<PathBuf> {
    if let Ok(p) = rp {
        for ext in &[".png", ".jpg", ".jpeg"] {
            if p.as_os_str().to_string_lossy().to_lowercase().ends_with(ext) {
                return Some(p);
            }
        }
    }
    None
}

/// Image files of one frame time, one per camera.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameFiles {
    pub time: FrameTime,
    pub paths: Vec<PathBuf>,
}

fn camera_images(pattern: &str) -> Result<Vec<PathBuf>, ConfigurationError> {
    let paths = glob(pattern).map_err(|e| ConfigurationError::Malformed {
        what: "image pattern",
        path: PathBuf::from(pattern),
        reason: e.to_string(),
    })?;
    let mut sorted: Vec<PathBuf> = paths.filter_map(img_filter).collect();
    sorted.sort();
    Ok(sorted)
}

fn timestamped(paths: Vec<PathBuf>) -> BTreeMap<FrameTime, PathBuf> {
    if paths.iter().all(|p| path_to_timestamp(p).is_some()) {
        paths
            .into_iter()
            .filter_map(|p| Some((path_to_timestamp(&p)?, p)))
            .collect()
    } else {
        paths
            .into_iter()
            .enumerate()
            .map(|(i, p)| (i as FrameTime * FRAME_INTERVAL_NS, p))
            .collect()
    }
}

/// Lists the frames of an image sequence.
///
/// A single camera reads `root/*`, a rig reads `root/cam{i}/*` for every
/// camera and keeps the times present in all of them. File stems are used
/// as nanosecond timestamps, or frames are numbered when any stem is not a
/// number.
///
/// # Arguments
/// * `root_folder` - Path to the sequence root.
/// * `cam_num` - Number of cameras, more than one expects `cam{i}` folders.
/// * `start_idx` - Index of the first frame kept.
/// * `step` - Step size for sampling frames.
pub fn list_frames(
    root_folder: &Path,
    cam_num: usize,
    start_idx: usize,
    step: usize,
) -> Result<Vec<FrameFiles>, ConfigurationError> {
    if !root_folder.is_dir() {
        return Err(ConfigurationError::NotFound {
            what: "image folder",
            path: root_folder.to_path_buf(),
        });
    }
    let cameras: Vec<BTreeMap<FrameTime, PathBuf>> = (0..cam_num.max(1))
        .map(|cam_idx| {
            let pattern = if cam_num > 1 {
                format!("{}/cam{}/*", root_folder.display(), cam_idx)
            } else {
                format!("{}/*", root_folder.display())
            };
            log::trace!("listing {}", pattern);
            camera_images(&pattern).map(timestamped)
        })
        .collect::<Result<_, _>>()?;

    let Some((main, secondary)) = cameras.split_first() else {
        return Ok(Vec::new());
    };
    let frames: Vec<FrameFiles> = main
        .iter()
        .filter_map(|(time, path)| {
            let mut paths = vec![path.clone()];
            for cam in secondary {
                paths.push(cam.get(time)?.clone());
            }
            Some(FrameFiles { time: *time, paths })
        })
        .skip(start_idx)
        .step_by(step.max(1))
        .collect();
    log::debug!("{} frame(s) over {} camera(s)", frames.len(), cameras.len());
    Ok(frames)
}

/// Decodes an image file and converts it to 8-bit grayscale.
pub fn load_gray(path: &Path) -> Result<GrayImage, ConfigurationError> {
    let reader = ImageReader::open(path).map_err(|source| ConfigurationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let img = reader.decode().map_err(|e| ConfigurationError::Malformed {
        what: "image",
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(img.into_luma8())
}
