use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use camera_localizer::camera::{IntrinsicsMode, IntrinsicsSeed};
use camera_localizer::config::LocalizerConfig;
use camera_localizer::data_loader::{list_frames, load_gray};
use camera_localizer::engine::{CameraInput, FrameRequest, LocalizerEngine, NeverAbort};
use camera_localizer::features::FeaturePreset;
use camera_localizer::io::{object_from_json, read_lens_calibration, write_track};
use camera_localizer::rig_calibration::{RigTopology, import_relative_poses, load_rig_calibration};
use camera_localizer::types::Pose3;
use camera_localizer::undistort::output_image;
use clap::Parser;
use indicatif::ParallelProgressIterator;
use rayon::prelude::*;

#[derive(Parser)]
#[command(version, about, author)]
struct CamlocCli {
    /// localizer configuration json
    config: PathBuf,

    /// path to image folder, with cam0, cam1, ... sub folders for a rig
    path: PathBuf,

    /// number of cameras
    #[arg(long, default_value_t = 1)]
    cam_num: usize,

    /// lens calibration file, once per camera in input order
    #[arg(long)]
    lens: Vec<PathBuf>,

    /// how far the lens calibrations are trusted
    #[arg(long, value_enum, default_value = "known")]
    intrinsics_mode: IntrinsicsMode,

    /// rig calibration file with the sub-poses of cam1, cam2, ...
    #[arg(long)]
    rig: Option<PathBuf>,

    /// camera whose pose is written to the track
    #[arg(long, default_value_t = 0)]
    output_index: usize,

    /// overrides the feature preset of the configuration
    #[arg(long, value_enum)]
    preset: Option<FeaturePreset>,

    #[arg(long, default_value_t = 0)]
    start_idx: usize,

    #[arg(long, default_value_t = 1)]
    step: usize,

    #[arg(short, long, default_value = "track.json")]
    output: PathBuf,

    /// writes the undistorted output image of every localized frame here
    #[arg(long)]
    undistort_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = CamlocCli::parse();

    let mut config: LocalizerConfig = object_from_json(&cli.config)?;
    if let Some(preset) = cli.preset {
        config.params.preset = preset;
    }
    let now = Instant::now();
    let engine = LocalizerEngine::new(config).context("failed to configure the localizer")?;
    println!("loading database took {:.3} sec", now.elapsed().as_secs_f64());

    let mut lenses = Vec::new();
    for path in &cli.lens {
        let (intrinsics, _warnings) = read_lens_calibration(path)?;
        lenses.push(intrinsics);
    }

    let mut relative_poses: HashMap<usize, Pose3> = HashMap::new();
    if let Some(rig_path) = &cli.rig {
        let parsed = load_rig_calibration(rig_path)?;
        let topology = RigTopology {
            connected_inputs: (0..cli.cam_num).collect(),
        };
        let (accepted, warnings) = import_relative_poses(&parsed, &topology);
        if !warnings.is_empty() && accepted.is_empty() {
            anyhow::bail!("rig calibration rejected: {}", warnings.join("; "));
        }
        relative_poses.extend(accepted);
    }

    let frames = list_frames(&cli.path, cli.cam_num, cli.start_idx, cli.step)?;
    let now = Instant::now();
    let localized = frames
        .par_iter()
        .progress_count(frames.len() as u64)
        .filter(|frame| {
            let images = match frame.paths.iter().map(|p| load_gray(p)).collect::<Result<Vec<_>, _>>() {
                Ok(images) => images,
                Err(e) => {
                    log::warn!("skipping frame {}: {}", frame.time, e);
                    return false;
                }
            };
            let inputs: Vec<CameraInput> = images
                .iter()
                .enumerate()
                .map(|(i, img)| {
                    let seed = match lenses.get(i) {
                        Some(intrinsics) => IntrinsicsSeed {
                            mode: cli.intrinsics_mode,
                            intrinsics: intrinsics.clone(),
                        },
                        None => IntrinsicsSeed::unknown(img.width(), img.height()),
                    };
                    let input = CameraInput::new(img, seed);
                    match relative_poses.get(&i) {
                        Some(pose) => input.with_relative_pose(*pose),
                        None => input,
                    }
                })
                .collect();
            let request = FrameRequest {
                time: frame.time,
                inputs: &inputs,
                output_index: cli.output_index,
                force: false,
            };
            engine.process_frame(&request, &NeverAbort).is_localized()
        })
        .count();
    let duration_sec = now.elapsed().as_secs_f64();
    println!("localized {} / {} frames in {:.3} sec", localized, frames.len(), duration_sec);

    let written = write_track(&cli.output, engine.cache())?;
    println!("wrote {} poses to {}", written, cli.output.display());

    if let Some(dir) = &cli.undistort_dir {
        std::fs::create_dir_all(dir)?;
        for frame in &frames {
            let Some(result) = engine.get_cached_result(frame.time) else {
                continue;
            };
            let Some(path) = frame.paths.get(result.output_index) else {
                continue;
            };
            let img = image::open(path).with_context(|| format!("failed to read {}", path.display()))?;
            let out = output_image(&img, Some(result.as_ref()));
            out.save(dir.join(format!("{}.png", frame.time)))?;
        }
    }
    Ok(())
}
