//! Request orchestration: configuration lifecycle, per-frame solves and
//! the result cache.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use image::GrayImage;
use rayon::prelude::*;

use crate::cache::{FailureReason, LocalizationCache, LocalizationOutcome, LocalizationResult, SolveMode};
use crate::camera::IntrinsicsSeed;
use crate::config::{ConfigurationError, DatabaseConfig, LocalizerConfig, LocalizerParams};
use crate::features::Regions;
use crate::localizer::{Localizer, MatchedFrame, build_localizer};
use crate::matching::merge_correspondences;
use crate::optimization::{RigCamera, RigFailure, solve_pose, solve_rig};
use crate::rig_calibration::MAX_INPUTS;
use crate::types::{FrameTime, Pose3};

/// Polled between processing stages; returning true cancels the request.
pub trait AbortCheck: Sync {
    fn aborted(&self) -> bool;
}

impl<F: Fn() -> bool + Sync> AbortCheck for F {
    fn aborted(&self) -> bool {
        self()
    }
}

pub struct NeverAbort;

impl AbortCheck for NeverAbort {
    fn aborted(&self) -> bool {
        false
    }
}

/// One camera of a request.
#[derive(Debug, Clone)]
pub struct CameraInput<'a> {
    pub image: &'a GrayImage,
    pub seed: IntrinsicsSeed,
    /// Main to this camera transform. Ignored for the main camera; a
    /// secondary input without it disables rig mode.
    pub relative_pose: Option<Pose3>,
}

impl<'a> CameraInput<'a> {
    pub fn new(image: &'a GrayImage, seed: IntrinsicsSeed) -> CameraInput<'a> {
        CameraInput {
            image,
            seed,
            relative_pose: None,
        }
    }

    pub fn with_relative_pose(mut self, pose: Pose3) -> CameraInput<'a> {
        self.relative_pose = Some(pose);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FrameRequest<'a> {
    pub time: FrameTime,
    /// Connected inputs, the main camera first.
    pub inputs: &'a [CameraInput<'a>],
    /// Camera whose pose and intrinsics are reported.
    pub output_index: usize,
    /// Solve even when a result is cached.
    pub force: bool,
}

impl FrameRequest<'_> {
    /// Rig mode needs more than one input and a relative pose for every
    /// secondary one.
    pub fn is_rig(&self) -> bool {
        self.inputs.len() > 1 && self.inputs[1..].iter().all(|i| i.relative_pose.is_some())
    }
}

struct EngineState {
    config: LocalizerConfig,
    /// Bumped whenever the database or its index is swapped.
    database_version: u64,
    localizer: Option<Arc<dyn Localizer>>,
}

/// What a request works with, copied out under the state lock so that
/// parameter changes never wait on a running solve.
struct Snapshot {
    params: LocalizerParams,
    database_version: u64,
    localizer: Arc<dyn Localizer>,
}

pub struct LocalizerEngine {
    state: RwLock<EngineState>,
    /// Held shared by every request from snapshot to cache publication and
    /// exclusively by a database swap, so a swap waits for in-flight
    /// solves and no request starts until the cache is invalidated.
    in_flight: RwLock<()>,
    cache: LocalizationCache,
}

impl LocalizerEngine {
    /// An engine without database. Every request fails with
    /// `FailureReason::NotInitialized` until `reconfigure` succeeds.
    pub fn uninitialized() -> LocalizerEngine {
        LocalizerEngine {
            state: RwLock::new(EngineState {
                config: LocalizerConfig::default(),
                database_version: 0,
                localizer: None,
            }),
            in_flight: RwLock::new(()),
            cache: LocalizationCache::new(),
        }
    }

    /// Builds an engine and loads the database named by `config`.
    pub fn new(config: LocalizerConfig) -> Result<LocalizerEngine, ConfigurationError> {
        let engine = LocalizerEngine::uninitialized();
        engine.reconfigure(config)?;
        Ok(engine)
    }

    /// Engine over an already built localizer.
    pub fn with_localizer(
        localizer: Arc<dyn Localizer>,
        params: LocalizerParams,
    ) -> Result<LocalizerEngine, ConfigurationError> {
        params.validate()?;
        let engine = LocalizerEngine::uninitialized();
        engine.swap_localizer(localizer, None, Some(params));
        Ok(engine)
    }

    fn snapshot(&self) -> Option<Snapshot> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Some(Snapshot {
            params: state.config.params.clone(),
            database_version: state.database_version,
            localizer: state.localizer.clone()?,
        })
    }

    fn swap_localizer(
        &self,
        localizer: Arc<dyn Localizer>,
        database: Option<DatabaseConfig>,
        params: Option<LocalizerParams>,
    ) -> u64 {
        let _exclusive = self.in_flight.write().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(database) = database {
            state.config.database = database;
        }
        if let Some(params) = params {
            state.config.params = params;
        }
        state.localizer = Some(localizer);
        state.database_version += 1;
        self.cache.clear_all();
        state.database_version
    }

    /// Swaps in a localizer built elsewhere, as a database reload does.
    ///
    /// Blocks until every in-flight request has finished, then drops all
    /// cached results. Returns the new database version.
    pub fn install_localizer(&self, localizer: Arc<dyn Localizer>) -> u64 {
        self.swap_localizer(localizer, None, None)
    }

    pub fn config(&self) -> LocalizerConfig {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .clone()
    }

    /// Counter bumped by every database swap, starting at 1 for the first.
    pub fn database_version(&self) -> u64 {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .database_version
    }

    pub fn is_initialized(&self) -> bool {
        self.snapshot()
            .is_some_and(|s| s.localizer.is_initialized())
    }

    /// Applies a new configuration. The database and index are rebuilt
    /// only when their part of the configuration changed, in which case
    /// every cached result is dropped. On error the previous
    /// configuration stays in place.
    pub fn reconfigure(&self, config: LocalizerConfig) -> Result<(), ConfigurationError> {
        config.validate()?;
        let unchanged = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state.localizer.is_some() && state.config.database == config.database
        };
        if unchanged {
            self.set_parameters(config.params)?;
            return Ok(());
        }
        let start = Instant::now();
        let localizer = build_localizer(&config.database)?;
        let version = self.swap_localizer(localizer, Some(config.database), Some(config.params));
        log::info!(
            "database version {} ready in {:.2?}",
            version,
            start.elapsed()
        );
        Ok(())
    }

    /// Replaces the per-request parameters. Cached results are kept.
    pub fn set_parameters(&self, params: LocalizerParams) -> Result<(), ConfigurationError> {
        params.validate()?;
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .config
            .params = params;
        Ok(())
    }

    pub fn cache(&self) -> &LocalizationCache {
        &self.cache
    }

    /// Cached result at `time` computed on the current database.
    pub fn get_cached_result(&self, time: FrameTime) -> Option<Arc<LocalizationResult>> {
        let version = self.database_version();
        self.cache
            .get(time)
            .filter(|r| r.database_version == version)
    }

    pub fn has_cached_result(&self, time: FrameTime) -> bool {
        self.get_cached_result(time).is_some()
    }

    /// Forgets the result at `time`, as when the host deletes a keyframe.
    pub fn clear_result(&self, time: FrameTime) {
        self.cache.clear(time);
    }

    pub fn clear_all_results(&self) {
        self.cache.clear_all();
    }

    /// Single camera localization.
    ///
    /// # Arguments
    /// * `time` - Frame time used as the cache key.
    /// * `input` - Image and intrinsics seed of the camera.
    /// * `force` - Solve again even when a result is cached.
    /// * `abort` - Polled between stages; cancellation leaves the cache untouched.
    pub fn localize(
        &self,
        time: FrameTime,
        input: &CameraInput,
        force: bool,
        abort: &dyn AbortCheck,
    ) -> LocalizationOutcome {
        let inputs = std::slice::from_ref(input);
        self.process_frame(
            &FrameRequest {
                time,
                inputs,
                output_index: 0,
                force,
            },
            abort,
        )
    }

    /// Rig localization. Every secondary input needs a relative pose.
    ///
    /// # Arguments
    /// * `time` - Frame time used as the cache key.
    /// * `inputs` - Connected cameras, the main camera first.
    /// * `output_index` - Camera whose pose and intrinsics are reported.
    /// * `force` - Solve again even when a result is cached.
    /// * `abort` - Polled between stages.
    pub fn localize_rig(
        &self,
        time: FrameTime,
        inputs: &[CameraInput],
        output_index: usize,
        force: bool,
        abort: &dyn AbortCheck,
    ) -> LocalizationOutcome {
        let request = FrameRequest {
            time,
            inputs,
            output_index,
            force,
        };
        if !request.is_rig() {
            log::info!("frame {}: rig request without relative poses", time);
            return LocalizationOutcome::Failed(FailureReason::InvalidInput);
        }
        self.process_frame(&request, abort)
    }

    /// Serves a request from the cache or solves it, choosing single or rig
    /// mode from the request topology.
    ///
    /// A cached result is reused only when it was computed in the same mode,
    /// for the same output camera and on the current database version.
    /// Concurrent requests for one time solve once; distinct times solve in
    /// parallel. Failures are returned as values and never cached.
    pub fn process_frame(&self, request: &FrameRequest, abort: &dyn AbortCheck) -> LocalizationOutcome {
        let _in_flight = self.in_flight.read().unwrap_or_else(PoisonError::into_inner);
        let Some(snapshot) = self.snapshot() else {
            return LocalizationOutcome::Failed(FailureReason::NotInitialized);
        };
        if !snapshot.localizer.is_initialized() {
            return LocalizationOutcome::Failed(FailureReason::NotInitialized);
        }
        if request.inputs.is_empty()
            || request.inputs.len() > MAX_INPUTS
            || request.output_index >= request.inputs.len()
        {
            return LocalizationOutcome::Failed(FailureReason::InvalidInput);
        }
        let mode = if request.is_rig() {
            SolveMode::Rig {
                cameras: request.inputs.len(),
            }
        } else if request.output_index != 0 {
            log::info!(
                "frame {}: output camera {} has no relative pose",
                request.time,
                request.output_index
            );
            return LocalizationOutcome::Failed(FailureReason::InvalidInput);
        } else {
            SolveMode::Single
        };

        let reusable = |r: &LocalizationResult| {
            r.mode == mode
                && r.database_version == snapshot.database_version
                && r.output_index == request.output_index
        };
        let outcome = self.cache.get_or_solve(request.time, request.force, reusable, || {
            let start = Instant::now();
            let outcome = match mode {
                SolveMode::Single => solve_single(&snapshot, request, abort),
                SolveMode::Rig { .. } => solve_multi(&snapshot, request, abort),
            };
            log::debug!("frame {}: solved in {:.2?}", request.time, start.elapsed());
            outcome
        });
        match &outcome {
            LocalizationOutcome::Localized(r) => log::debug!(
                "frame {}: localized with {} inliers, mean error {:.3} px",
                request.time,
                r.num_inliers(),
                r.stats.mean
            ),
            LocalizationOutcome::Failed(reason) => {
                log::info!("frame {}: localization failed ({:?})", request.time, reason)
            }
            LocalizationOutcome::Cancelled => log::debug!("frame {}: cancelled", request.time),
        }
        outcome
    }
}

fn match_frame(
    localizer: &dyn Localizer,
    image: &GrayImage,
    params: &LocalizerParams,
) -> (Regions, MatchedFrame) {
    let start = Instant::now();
    let regions = localizer.extract(image, params.preset);
    log::debug!(
        "{} features, {} marker corners in {:.2?}",
        regions.len(),
        regions.markers.len(),
        start.elapsed()
    );
    let start = Instant::now();
    let frame = localizer.build_correspondences(&regions, params);
    log::debug!(
        "{} correspondences from {} views in {:.2?}",
        frame.correspondences.len(),
        frame.views.len(),
        start.elapsed()
    );
    (regions, frame)
}

fn solve_single(snapshot: &Snapshot, request: &FrameRequest, abort: &dyn AbortCheck) -> LocalizationOutcome {
    let input = &request.inputs[0];
    let params = &snapshot.params;
    let localizer = snapshot.localizer.as_ref();
    if abort.aborted() {
        return LocalizationOutcome::Cancelled;
    }
    let (regions, frame) = match_frame(localizer, input.image, params);
    if abort.aborted() {
        return LocalizationOutcome::Cancelled;
    }
    if frame.correspondences.is_empty() {
        return LocalizationOutcome::Failed(FailureReason::InsufficientCorrespondences);
    }

    let opts = params.solver_options();
    let Some(mut estimate) = solve_pose(&frame.correspondences, &input.seed, &opts) else {
        return LocalizationOutcome::Failed(FailureReason::InsufficientInliers);
    };
    let mut correspondences = frame.correspondences.clone();

    if params.use_guided_matching {
        if abort.aborted() {
            return LocalizationOutcome::Cancelled;
        }
        let guided = localizer.guided_correspondences(
            &regions,
            &frame,
            &estimate.pose,
            &estimate.intrinsics,
            params,
        );
        let merged = merge_correspondences(&correspondences, &guided);
        let seed = IntrinsicsSeed {
            mode: input.seed.mode,
            intrinsics: estimate.intrinsics.clone(),
        };
        match solve_pose(&merged, &seed, &opts) {
            Some(second) if second.inliers.len() >= estimate.inliers.len() => {
                log::debug!(
                    "guided matching: {} -> {} inliers",
                    estimate.inliers.len(),
                    second.inliers.len()
                );
                estimate = second;
                correspondences = merged;
            }
            _ => log::debug!("guided matching kept the first estimate"),
        }
    }

    if abort.aborted() {
        return LocalizationOutcome::Cancelled;
    }
    LocalizationOutcome::Localized(Arc::new(LocalizationResult {
        time: request.time,
        pose: estimate.pose,
        output_pose: estimate.pose,
        intrinsics: estimate.intrinsics,
        inliers: estimate.inliers,
        camera_inliers: Vec::new(),
        num_correspondences: correspondences.len(),
        stats: estimate.stats,
        mode: SolveMode::Single,
        output_index: 0,
        database_version: snapshot.database_version,
    }))
}

fn solve_multi(snapshot: &Snapshot, request: &FrameRequest, abort: &dyn AbortCheck) -> LocalizationOutcome {
    let params = &snapshot.params;
    let localizer = snapshot.localizer.as_ref();
    if abort.aborted() {
        return LocalizationOutcome::Cancelled;
    }
    let frames: Vec<MatchedFrame> = request
        .inputs
        .par_iter()
        .map(|input| match_frame(localizer, input.image, params).1)
        .collect();
    if abort.aborted() {
        return LocalizationOutcome::Cancelled;
    }

    let sub_poses: Vec<Pose3> = request
        .inputs
        .iter()
        .enumerate()
        .map(|(i, input)| match (i, input.relative_pose) {
            (0, _) | (_, None) => Pose3::identity(),
            (_, Some(pose)) => pose,
        })
        .collect();
    let cameras: Vec<RigCamera> = frames
        .iter()
        .zip(request.inputs)
        .zip(&sub_poses)
        .map(|((frame, input), sub_pose)| RigCamera {
            correspondences: &frame.correspondences,
            intrinsics: input.seed.intrinsics.clone(),
            sub_pose: *sub_pose,
        })
        .collect();
    let estimate = match solve_rig(&cameras, &params.solver_options()) {
        Ok(estimate) => estimate,
        Err(RigFailure::Degenerate) => return LocalizationOutcome::Failed(FailureReason::DegenerateRig),
        Err(RigFailure::InsufficientInliers) => {
            return LocalizationOutcome::Failed(FailureReason::InsufficientInliers);
        }
    };
    if abort.aborted() {
        return LocalizationOutcome::Cancelled;
    }

    let output = request.output_index;
    LocalizationOutcome::Localized(Arc::new(LocalizationResult {
        time: request.time,
        pose: estimate.main_pose,
        output_pose: sub_poses[output].compose(&estimate.main_pose),
        intrinsics: request.inputs[output].seed.intrinsics.clone(),
        inliers: estimate.inliers[0].clone(),
        num_correspondences: frames.iter().map(|f| f.correspondences.len()).sum(),
        camera_inliers: estimate.inliers,
        stats: estimate.stats,
        mode: SolveMode::Rig {
            cameras: request.inputs.len(),
        },
        output_index: output,
        database_version: snapshot.database_version,
    }))
}
