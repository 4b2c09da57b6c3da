//! Rig calibration files and their mapping onto connected camera inputs.

use std::path::Path;

use nalgebra as na;

use crate::config::ConfigurationError;
use crate::io::read_numbers;
use crate::types::Pose3;

/// Number of camera inputs the engine accepts per request, main camera
/// included.
pub const MAX_INPUTS: usize = 5;

const VALUES_PER_POSE: usize = 12;

/// Reads a rig calibration: the number of sub-poses, then for each one a
/// row major 3x3 rotation followed by the camera center in the main
/// camera frame.
pub fn load_rig_calibration(path: &Path) -> Result<Vec<Pose3>, ConfigurationError> {
    let values = read_numbers(path, "rig calibration")?;
    let malformed = |reason: String| ConfigurationError::Malformed {
        what: "rig calibration",
        path: path.to_path_buf(),
        reason,
    };
    let (&count, rest) = values
        .split_first()
        .ok_or_else(|| malformed("empty file".to_string()))?;
    if count < 0.0 || count.fract() != 0.0 {
        return Err(malformed(format!("invalid pose count {}", count)));
    }
    // compared in floating point, the count may exceed any usize
    let found = rest.len() / VALUES_PER_POSE;
    if rest.len() % VALUES_PER_POSE != 0 || count != found as f64 {
        return Err(malformed(format!(
            "{} poses need {} values each, found {} values",
            count,
            VALUES_PER_POSE,
            rest.len()
        )));
    }
    rest.chunks_exact(VALUES_PER_POSE)
        .enumerate()
        .map(|(i, v)| {
            let rotation = na::Matrix3::from_row_slice(&v[..9]);
            let orthogonality = (rotation * rotation.transpose() - na::Matrix3::identity()).norm();
            if orthogonality > 1e-3 || rotation.determinant() <= 0.0 {
                return Err(malformed(format!("pose {} is not a rotation", i)));
            }
            Ok(Pose3::new(rotation, na::Vector3::new(v[9], v[10], v[11])))
        })
        .collect()
}

/// Input slots currently connected, in order. The first one is the main
/// camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigTopology {
    pub connected_inputs: Vec<usize>,
}

impl RigTopology {
    pub fn is_rig(&self) -> bool {
        self.connected_inputs.len() > 1
    }
}

/// Assigns parsed sub-poses to the secondary connected inputs.
///
/// A file describing at least `MAX_INPUTS` sub-poses is truncated with a
/// warning. Otherwise the count must equal the number of secondary inputs
/// or the whole import is rejected. Accepted poses are returned with the
/// input slot they belong to.
pub fn import_relative_poses(
    parsed: &[Pose3],
    topology: &RigTopology,
) -> (Vec<(usize, Pose3)>, Vec<String>) {
    let mut warnings = Vec::new();
    let secondary = topology.connected_inputs.len().saturating_sub(1);
    if parsed.len() >= MAX_INPUTS {
        let msg = format!(
            "rig file describes {} cameras, more than the {} supported",
            parsed.len() + 1,
            MAX_INPUTS
        );
        log::warn!("{}", msg);
        warnings.push(msg);
    } else if parsed.len() != secondary {
        let msg = format!(
            "rig file describes {} sub-poses but {} secondary inputs are connected",
            parsed.len(),
            secondary
        );
        log::warn!("{}", msg);
        warnings.push(msg);
        return (Vec::new(), warnings);
    }
    let accepted = parsed
        .iter()
        .take(MAX_INPUTS - 1)
        .zip(topology.connected_inputs.iter().skip(1))
        .filter(|(_, input)| **input != 0)
        .map(|(pose, input)| (*input, *pose))
        .collect();
    (accepted, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose(x: f64) -> Pose3 {
        Pose3::new(na::Matrix3::identity(), na::Vector3::new(x, 0.0, 0.0))
    }

    #[test]
    fn matching_count_is_accepted() {
        let topology = RigTopology {
            connected_inputs: vec![0, 2, 3],
        };
        let (accepted, warnings) = import_relative_poses(&[pose(1.0), pose(2.0)], &topology);
        assert!(warnings.is_empty());
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0].0, 2);
        assert_eq!(accepted[1].0, 3);
        assert_eq!(accepted[1].1.center.x, 2.0);
    }

    #[test]
    fn count_mismatch_rejects_import() {
        let topology = RigTopology {
            connected_inputs: vec![0, 1, 2],
        };
        let (accepted, warnings) = import_relative_poses(&[pose(1.0)], &topology);
        assert!(accepted.is_empty());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn overflow_warns_and_truncates() {
        let topology = RigTopology {
            connected_inputs: (0..MAX_INPUTS).collect(),
        };
        let parsed: Vec<_> = (0..7).map(|i| pose(i as f64)).collect();
        let (accepted, warnings) = import_relative_poses(&parsed, &topology);
        assert_eq!(warnings.len(), 1);
        assert_eq!(accepted.len(), MAX_INPUTS - 1);
    }
}
