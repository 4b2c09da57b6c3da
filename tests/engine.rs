mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use camera_localizer::cache::SolveMode;
use camera_localizer::camera::IntrinsicsSeed;
use camera_localizer::config::{DatabaseConfig, FeatureType, LocalizerConfig, LocalizerParams};
use camera_localizer::features::{FeatureExtractor, FeaturePreset, Regions};
use camera_localizer::io::object_to_json;
use camera_localizer::{
    CameraInput, ConfigurationError, FailureReason, FrameRequest, LocalizationOutcome, LocalizerEngine,
    NeverAbort,
};
use common::*;

fn engine_with(scene: &SyntheticScene, extractor: ScriptedExtractor, params: LocalizerParams) -> LocalizerEngine {
    LocalizerEngine::with_localizer(Arc::new(scene.localizer(extractor)), params).unwrap()
}

#[test]
fn localizes_with_known_intrinsics_and_caches() {
    let scene = SyntheticScene::new(300, 1);
    let gt = pose([0.2, -0.1, 0.3], [0.03, -0.02, 0.01]);
    let extractor = ScriptedExtractor::default().with(1, scene.observe(&gt, &intrinsics(), 0.2, 7));
    let engine = engine_with(&scene, extractor.clone(), LocalizerParams::default());

    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
    let outcome = engine.localize(100, &input, false, &NeverAbort);
    let result = outcome.result().expect("frame should localize").clone();
    assert!(result.pose.rotation_angle_to(&gt) < 1e-4);
    assert!(result.pose.center_distance_to(&gt) < 1e-3);
    assert_eq!(result.mode, SolveMode::Single);
    assert!(result.stats.max <= LocalizerParams::default().reprojection_error);
    assert!(engine.has_cached_result(100));
    assert_eq!(extractor.call_count(), 1);

    // cached requests do not solve again
    let again = engine.localize(100, &input, false, &NeverAbort);
    assert!(Arc::ptr_eq(again.result().unwrap(), &result));
    assert_eq!(extractor.call_count(), 1);

    let forced = engine.localize(100, &input, true, &NeverAbort);
    assert!(forced.is_localized());
    assert_eq!(extractor.call_count(), 2);
}

#[test]
fn unknown_intrinsics_recover_focal() {
    let scene = SyntheticScene::new(300, 2);
    let gt = pose([0.1, 0.1, -0.2], [-0.02, 0.04, 0.0]);
    let extractor = ScriptedExtractor::default().with(1, scene.observe(&gt, &intrinsics(), 0.1, 3));
    let engine = engine_with(&scene, extractor, LocalizerParams::default());

    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::unknown(WIDTH, HEIGHT));
    let result = engine.localize(1, &input, false, &NeverAbort);
    let result = result.result().expect("frame should localize");
    assert!((result.intrinsics.focal - 500.0).abs() < 1.0, "focal {}", result.intrinsics.focal);
    assert!(result.pose.center_distance_to(&gt) < 1e-2);
}

#[test]
fn repeated_solves_are_identical() {
    let scene = SyntheticScene::new(250, 3);
    let gt = pose([0.0, 0.2, 0.1], [0.01, 0.02, -0.03]);
    let regions = scene.observe(&gt, &intrinsics(), 0.3, 11);
    let img = keyed_image(4);
    let input = CameraInput::new(&img, IntrinsicsSeed::approximate(intrinsics()));

    let solve = || {
        let engine = engine_with(
            &scene,
            ScriptedExtractor::default().with(4, regions.clone()),
            LocalizerParams::default(),
        );
        engine.localize(7, &input, false, &NeverAbort).result().unwrap().clone()
    };
    let (a, b) = (solve(), solve());
    assert_eq!(a.pose.rotation, b.pose.rotation);
    assert_eq!(a.pose.center, b.pose.center);
    assert_eq!(a.inliers, b.inliers);
    assert_eq!(a.intrinsics, b.intrinsics);
}

#[test]
fn failures_are_not_cached() {
    let scene = SyntheticScene::new(200, 4);
    let engine = engine_with(&scene, ScriptedExtractor::default(), LocalizerParams::default());
    let img = keyed_image(9);
    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
    let outcome = engine.localize(5, &input, false, &NeverAbort);
    assert!(matches!(
        outcome,
        LocalizationOutcome::Failed(FailureReason::InsufficientCorrespondences)
    ));
    assert!(!engine.has_cached_result(5));
    assert!(engine.cache().is_empty());
}

#[test]
fn uninitialized_engine_reports_failure() {
    let engine = LocalizerEngine::uninitialized();
    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::unknown(WIDTH, HEIGHT));
    assert!(matches!(
        engine.localize(0, &input, false, &NeverAbort),
        LocalizationOutcome::Failed(FailureReason::NotInitialized)
    ));
}

#[test]
fn clearing_results() {
    let scene = SyntheticScene::new(250, 5);
    let extractor = ScriptedExtractor::default()
        .with(1, scene.observe(&pose([0.1, 0.0, 0.0], [0.0, 0.0, 0.0]), &intrinsics(), 0.0, 1))
        .with(2, scene.observe(&pose([-0.1, 0.0, 0.0], [0.0, 0.01, 0.0]), &intrinsics(), 0.0, 2));
    let engine = engine_with(&scene, extractor, LocalizerParams::default());
    let (img1, img2) = (keyed_image(1), keyed_image(2));
    let seed = IntrinsicsSeed::known(intrinsics());
    assert!(engine.localize(10, &CameraInput::new(&img1, seed.clone()), false, &NeverAbort).is_localized());
    assert!(engine.localize(20, &CameraInput::new(&img2, seed), false, &NeverAbort).is_localized());
    assert_eq!(engine.cache().keyframes(), vec![10, 20]);

    engine.clear_result(10);
    assert!(!engine.has_cached_result(10));
    assert!(engine.has_cached_result(20));
    engine.clear_all_results();
    assert!(!engine.has_cached_result(20));
}

#[test]
fn installing_a_database_invalidates_the_cache() {
    let scene = SyntheticScene::new(250, 6);
    let gt = pose([0.0, 0.0, 0.2], [0.0, 0.0, 0.0]);
    let extractor = ScriptedExtractor::default().with(1, scene.observe(&gt, &intrinsics(), 0.0, 1));
    let engine = engine_with(&scene, extractor.clone(), LocalizerParams::default());
    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
    assert!(engine.localize(3, &input, false, &NeverAbort).is_localized());
    let version = engine.database_version();

    let next = engine.install_localizer(Arc::new(scene.localizer(extractor)));
    assert_eq!(next, version + 1);
    assert!(!engine.has_cached_result(3));
    assert!(engine.cache().is_empty());
    let result = engine.localize(3, &input, false, &NeverAbort);
    assert_eq!(result.result().unwrap().database_version, next);
}

/// Reports that extraction started, then waits to be released.
struct HeldExtractor {
    inner: ScriptedExtractor,
    started: Mutex<mpsc::Sender<()>>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl FeatureExtractor for HeldExtractor {
    fn extract(&self, image: &image::GrayImage, preset: FeaturePreset) -> Regions {
        self.started.lock().unwrap().send(()).unwrap();
        self.release.lock().unwrap().recv().unwrap();
        self.inner.extract(image, preset)
    }

    fn descriptor_len(&self) -> usize {
        self.inner.descriptor_len()
    }
}

#[test]
fn database_swap_waits_for_in_flight_solves() {
    let scene = SyntheticScene::new(250, 16);
    let gt = pose([0.1, 0.0, 0.1], [0.0, 0.02, 0.0]);
    let scripted = ScriptedExtractor::default().with(1, scene.observe(&gt, &intrinsics(), 0.0, 1));
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let held = HeldExtractor {
        inner: scripted.clone(),
        started: Mutex::new(started_tx),
        release: Mutex::new(release_rx),
    };
    let localizer = camera_localizer::localizer::VoctreeLocalizer::new(
        scene.database.clone(),
        scene.tree.clone(),
        None,
        Box::new(held),
    )
    .unwrap();
    let engine = LocalizerEngine::with_localizer(Arc::new(localizer), LocalizerParams::default()).unwrap();
    let img = keyed_image(1);

    std::thread::scope(|s| {
        let solver = s.spawn(|| {
            let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
            engine.localize(8, &input, false, &NeverAbort)
        });
        started_rx.recv().unwrap();
        let installer = s.spawn(|| engine.install_localizer(Arc::new(scene.localizer(scripted.clone()))));
        std::thread::sleep(Duration::from_millis(100));
        assert!(!installer.is_finished(), "swap must wait for the running solve");
        release_tx.send(()).unwrap();
        let outcome = solver.join().unwrap();
        assert_eq!(outcome.result().unwrap().database_version, 1);
        assert_eq!(installer.join().unwrap(), 2);
    });
    // the old version result was invalidated by the swap
    assert!(!engine.has_cached_result(8));
    assert!(engine.cache().keyframes().is_empty());

    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
    let fresh = engine.localize(8, &input, false, &NeverAbort);
    assert_eq!(fresh.result().unwrap().database_version, 2);
    assert_eq!(engine.cache().keyframes(), vec![8]);
}

#[test]
fn failed_reconfiguration_keeps_the_previous_state() {
    let scene = SyntheticScene::new(250, 7);
    let extractor = ScriptedExtractor::default().with(
        1,
        scene.observe(&pose([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]), &intrinsics(), 0.0, 1),
    );
    let engine = engine_with(&scene, extractor, LocalizerParams::default());
    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
    assert!(engine.localize(1, &input, false, &NeverAbort).is_localized());
    let version = engine.database_version();

    let dir = tempfile::tempdir().unwrap();
    let missing = LocalizerConfig {
        database: DatabaseConfig {
            reconstruction_path: Some(dir.path().join("missing.json")),
            voctree_path: Some(dir.path().join("tree.json")),
            ..Default::default()
        },
        ..Default::default()
    };
    let err = engine.reconfigure(missing).unwrap_err();
    assert!(matches!(err, ConfigurationError::NotFound { .. }));
    assert_eq!(engine.database_version(), version);
    assert!(engine.has_cached_result(1));
    assert!(engine.is_initialized());
}

#[test]
fn reconfiguration_from_files_swaps_the_database() {
    let scene = SyntheticScene::new(200, 8);
    let extractor = ScriptedExtractor::default().with(
        1,
        scene.observe(&pose([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]), &intrinsics(), 0.0, 1),
    );
    let engine = engine_with(&scene, extractor, LocalizerParams::default());
    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
    assert!(engine.localize(1, &input, false, &NeverAbort).is_localized());

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("scene.json");
    let tree_path = dir.path().join("tree.json");
    scene.database.save(&db_path).unwrap();
    object_to_json(&tree_path, &scene.tree).unwrap();
    let config = LocalizerConfig {
        database: DatabaseConfig {
            reconstruction_path: Some(db_path),
            voctree_path: Some(tree_path),
            feature_type: FeatureType::Sift,
            ..Default::default()
        },
        params: LocalizerParams {
            reprojection_error: 2.0,
            ..Default::default()
        },
    };
    let version = engine.database_version();
    engine.reconfigure(config.clone()).unwrap();
    assert_eq!(engine.database_version(), version + 1);
    assert!(!engine.has_cached_result(1));
    assert!(engine.is_initialized());
    assert_eq!(engine.config(), config);

    // same database, new parameters: nothing is rebuilt
    let tuned = LocalizerConfig {
        params: LocalizerParams {
            reprojection_error: 3.0,
            ..Default::default()
        },
        ..config
    };
    engine.reconfigure(tuned).unwrap();
    assert_eq!(engine.database_version(), version + 1);
    assert_eq!(engine.config().params.reprojection_error, 3.0);
}

#[test]
fn abort_leaves_the_cache_untouched() {
    let scene = SyntheticScene::new(250, 9);
    let extractor = ScriptedExtractor::default().with(
        1,
        scene.observe(&pose([0.1, 0.1, 0.1], [0.0, 0.02, 0.0]), &intrinsics(), 0.1, 1),
    );
    let engine = engine_with(&scene, extractor, LocalizerParams::default());
    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
    let abort = || true;

    assert!(matches!(
        engine.localize(1, &input, false, &abort),
        LocalizationOutcome::Cancelled
    ));
    assert!(!engine.has_cached_result(1));

    let first = engine.localize(1, &input, false, &NeverAbort);
    assert!(first.is_localized());
    // a cancelled forced solve keeps the earlier result
    let cancel_later = AtomicBool::new(false);
    let flag = || cancel_later.swap(true, Ordering::SeqCst);
    assert!(matches!(
        engine.localize(1, &input, true, &flag),
        LocalizationOutcome::Cancelled
    ));
    assert!(Arc::ptr_eq(
        &engine.get_cached_result(1).unwrap(),
        first.result().unwrap()
    ));
}

#[test]
fn guided_matching_never_loses_inliers() {
    let scene = SyntheticScene::new(300, 10);
    let gt = pose([0.1, -0.1, 0.2], [0.02, 0.03, 0.0]);
    let regions = scene.observe_ambiguous(&gt, &intrinsics(), 3);
    let img = keyed_image(1);
    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));

    let inliers = |guided: bool| {
        let params = LocalizerParams {
            use_guided_matching: guided,
            ..Default::default()
        };
        let engine = engine_with(&scene, ScriptedExtractor::default().with(1, regions.clone()), params);
        engine.localize(1, &input, false, &NeverAbort).result().unwrap().inliers.len()
    };
    let (blind, guided) = (inliers(false), inliers(true));
    assert!(guided >= blind, "guided {} blind {}", guided, blind);
    assert!(guided > blind, "ambiguous features should be recovered");
}

#[test]
fn same_time_requests_solve_once() {
    let scene = SyntheticScene::new(250, 11);
    let extractor = ScriptedExtractor::default().with(
        1,
        scene.observe(&pose([0.0, 0.1, 0.0], [0.0, 0.0, 0.02]), &intrinsics(), 0.1, 1),
    );
    let engine = engine_with(&scene, extractor.clone(), LocalizerParams::default());
    let img = keyed_image(1);

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    let input = CameraInput::new(&img, IntrinsicsSeed::known(intrinsics()));
                    engine.localize(42, &input, false, &NeverAbort)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(extractor.call_count(), 1);
    let first = results[0].result().unwrap();
    assert!(results.iter().all(|r| Arc::ptr_eq(r.result().unwrap(), first)));
}

#[test]
fn distinct_times_solve_concurrently() {
    let scene = SyntheticScene::new(250, 12);
    let mut extractor = ScriptedExtractor::default();
    for key in 1..=6u8 {
        let x = key as f64 * 0.05;
        extractor = extractor.with(key, scene.observe(&pose([x, 0.0, 0.0], [0.0, 0.0, 0.0]), &intrinsics(), 0.1, key as u64));
    }
    let engine = engine_with(&scene, extractor, LocalizerParams::default());
    let images: Vec<_> = (1..=6u8).map(keyed_image).collect();

    std::thread::scope(|s| {
        for (i, img) in images.iter().enumerate() {
            let engine = &engine;
            s.spawn(move || {
                let input = CameraInput::new(img, IntrinsicsSeed::known(intrinsics()));
                assert!(engine.localize(i as i64, &input, false, &NeverAbort).is_localized());
            });
        }
    });
    assert_eq!(engine.cache().keyframes(), (0..6).collect::<Vec<i64>>());
    for (i, key) in (1..=6u8).enumerate() {
        let expected_x = key as f64 * 0.05;
        let result = engine.get_cached_result(i as i64).unwrap();
        let gt = pose([expected_x, 0.0, 0.0], [0.0, 0.0, 0.0]);
        assert!(result.pose.center_distance_to(&gt) < 1e-3);
    }
}

#[test]
fn rig_requests_do_not_reuse_single_results() {
    let scene = SyntheticScene::new(300, 13);
    let main = pose([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]);
    let sub = pose([-0.3, 0.0, 0.0], [0.0, 0.05, 0.0]);
    let secondary = sub.compose(&main);
    let extractor = ScriptedExtractor::default()
        .with(1, scene.observe(&main, &intrinsics(), 0.1, 1))
        .with(2, scene.observe(&secondary, &intrinsics(), 0.1, 2));
    let engine = engine_with(&scene, extractor, LocalizerParams::default());
    let (img1, img2) = (keyed_image(1), keyed_image(2));

    let single = CameraInput::new(&img1, IntrinsicsSeed::known(intrinsics()));
    let single_result = engine.localize(1, &single, false, &NeverAbort);
    assert_eq!(single_result.result().unwrap().mode, SolveMode::Single);

    let inputs = [
        CameraInput::new(&img1, IntrinsicsSeed::known(intrinsics())),
        CameraInput::new(&img2, IntrinsicsSeed::known(intrinsics())).with_relative_pose(sub),
    ];
    let rig = engine.localize_rig(1, &inputs, 1, false, &NeverAbort);
    let rig = rig.result().expect("rig should localize");
    assert_eq!(rig.mode, SolveMode::Rig { cameras: 2 });
    assert_eq!(rig.output_index, 1);
    assert_eq!(rig.camera_inliers.len(), 2);
    assert!(rig.pose.center_distance_to(&main) < 1e-3);
    assert!(rig.output_pose.center_distance_to(&secondary) < 1e-3);
    assert_eq!(engine.get_cached_result(1).unwrap().mode, SolveMode::Rig { cameras: 2 });
}

#[test]
fn rig_with_one_contributing_camera_is_degenerate() {
    let scene = SyntheticScene::new(250, 14);
    let extractor = ScriptedExtractor::default().with(
        1,
        scene.observe(&pose([0.0, 0.0, 0.0], [0.0, 0.0, 0.0]), &intrinsics(), 0.0, 1),
    );
    let engine = engine_with(&scene, extractor, LocalizerParams::default());
    let (img1, img2) = (keyed_image(1), keyed_image(2));
    let inputs = [
        CameraInput::new(&img1, IntrinsicsSeed::known(intrinsics())),
        CameraInput::new(&img2, IntrinsicsSeed::known(intrinsics()))
            .with_relative_pose(pose([0.2, 0.0, 0.0], [0.0, 0.0, 0.0])),
    ];
    let request = FrameRequest {
        time: 9,
        inputs: &inputs,
        output_index: 0,
        force: false,
    };
    assert!(request.is_rig());
    assert!(matches!(
        engine.process_frame(&request, &NeverAbort),
        LocalizationOutcome::Failed(FailureReason::DegenerateRig)
    ));
    assert!(!engine.has_cached_result(9));
}

#[test]
fn secondary_output_needs_a_rig() {
    let scene = SyntheticScene::new(200, 15);
    let engine = engine_with(&scene, ScriptedExtractor::default(), LocalizerParams::default());
    let (img1, img2) = (keyed_image(1), keyed_image(2));
    let inputs = [
        CameraInput::new(&img1, IntrinsicsSeed::known(intrinsics())),
        CameraInput::new(&img2, IntrinsicsSeed::known(intrinsics())),
    ];
    let request = FrameRequest {
        time: 0,
        inputs: &inputs,
        output_index: 1,
        force: false,
    };
    assert!(matches!(
        engine.process_frame(&request, &NeverAbort),
        LocalizationOutcome::Failed(FailureReason::InvalidInput)
    ));
}
