//! Per frame-time localization results.
//!
//! Every frame time owns a slot. Solving a slot holds its solve lock so
//! that at most one solve per time is in flight; published results live
//! behind a separate lock and readers of a finished result never wait on
//! a solve.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::camera::Intrinsics;
use crate::optimization::ReprojectionStats;
use crate::types::{FrameTime, Pose3};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SolveMode {
    Single,
    Rig { cameras: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalizationResult {
    pub time: FrameTime,
    /// Pose of the main camera.
    pub pose: Pose3,
    /// Pose of the requested output camera; equals `pose` unless a
    /// secondary rig camera was requested.
    pub output_pose: Pose3,
    /// Intrinsics of the requested output camera.
    pub intrinsics: Intrinsics,
    /// Inlier indices of the main camera correspondences.
    pub inliers: Vec<usize>,
    /// Inlier indices per camera in rig mode, empty otherwise.
    pub camera_inliers: Vec<Vec<usize>>,
    pub num_correspondences: usize,
    pub stats: ReprojectionStats,
    pub mode: SolveMode,
    pub output_index: usize,
    /// Configuration version of the database the result was computed on.
    pub database_version: u64,
}

impl LocalizationResult {
    pub fn num_inliers(&self) -> usize {
        if self.camera_inliers.is_empty() {
            self.inliers.len()
        } else {
            self.camera_inliers.iter().map(Vec::len).sum()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    /// No usable database is configured.
    NotInitialized,
    /// Missing images or a topology the engine cannot solve.
    InvalidInput,
    InsufficientCorrespondences,
    InsufficientInliers,
    /// Fewer than two rig cameras produced correspondences.
    DegenerateRig,
}

/// What a localization request produced. Failures are values, never
/// errors.
#[derive(Debug, Clone)]
pub enum LocalizationOutcome {
    Localized(Arc<LocalizationResult>),
    Failed(FailureReason),
    /// Aborted between stages; nothing was written to the cache.
    Cancelled,
}

impl LocalizationOutcome {
    pub fn result(&self) -> Option<&Arc<LocalizationResult>> {
        match self {
            LocalizationOutcome::Localized(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_localized(&self) -> bool {
        matches!(self, LocalizationOutcome::Localized(_))
    }
}

#[derive(Default)]
struct Slot {
    solve_lock: Mutex<()>,
    result: RwLock<Option<Arc<LocalizationResult>>>,
}

impl Slot {
    fn read(&self) -> Option<Arc<LocalizationResult>> {
        self.result
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, result: Option<Arc<LocalizationResult>>) {
        *self.result.write().unwrap_or_else(PoisonError::into_inner) = result;
    }
}

#[derive(Default)]
pub struct LocalizationCache {
    slots: RwLock<BTreeMap<FrameTime, Arc<Slot>>>,
}

impl LocalizationCache {
    pub fn new() -> LocalizationCache {
        LocalizationCache::default()
    }

    fn slots(&self) -> RwLockReadGuard<'_, BTreeMap<FrameTime, Arc<Slot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<FrameTime, Arc<Slot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, time: FrameTime) -> Option<Arc<Slot>> {
        self.slots().get(&time).cloned()
    }

    /// Returns the cached result for `time` when `reusable` accepts it,
    /// otherwise runs `solve` with the slot's solve lock held.
    ///
    /// `force` skips the lookup. A localized outcome is published, a
    /// failure removes the slot and a cancelled one leaves it untouched.
    pub fn get_or_solve<A, S>(
        &self,
        time: FrameTime,
        force: bool,
        reusable: A,
        solve: S,
    ) -> LocalizationOutcome
    where
        A: Fn(&LocalizationResult) -> bool,
        S: FnOnce() -> LocalizationOutcome,
    {
        if !force {
            if let Some(r) = self.get(time).filter(|r| reusable(r)) {
                log::trace!("cache hit at {}", time);
                return LocalizationOutcome::Localized(r);
            }
        }
        let slot = self.slots_mut().entry(time).or_default().clone();
        let _solving = slot.solve_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !force {
            // another request may have solved this time while we waited
            if let Some(r) = slot.read().filter(|r| reusable(r)) {
                return LocalizationOutcome::Localized(r);
            }
        }
        let outcome = solve();
        match &outcome {
            LocalizationOutcome::Localized(r) => slot.publish(Some(r.clone())),
            LocalizationOutcome::Failed(_) => {
                slot.publish(None);
                self.remove_slot(time, &slot);
            }
            LocalizationOutcome::Cancelled => {}
        }
        outcome
    }

    /// Removes `slot` unless the time was cleared and refilled meanwhile or
    /// another request is waiting to solve it.
    fn remove_slot(&self, time: FrameTime, slot: &Arc<Slot>) {
        let mut slots = self.slots_mut();
        // the map and the caller hold the only references
        if slots.get(&time).is_some_and(|s| Arc::ptr_eq(s, slot)) && Arc::strong_count(slot) == 2 {
            slots.remove(&time);
        }
    }

    pub fn get(&self, time: FrameTime) -> Option<Arc<LocalizationResult>> {
        self.slot(time)?.read()
    }

    pub fn contains(&self, time: FrameTime) -> bool {
        self.get(time).is_some()
    }

    /// Forgets the result at `time`. A solve still running for that time
    /// completes into a detached slot and is not cached.
    pub fn clear(&self, time: FrameTime) {
        if self.slots_mut().remove(&time).is_some() {
            log::debug!("cleared cached result at {}", time);
        }
    }

    pub fn clear_all(&self) {
        let mut slots = self.slots_mut();
        log::debug!("cleared {} cached frame(s)", slots.len());
        slots.clear();
    }

    /// Cached results in time order.
    pub fn entries(&self) -> Vec<(FrameTime, Arc<LocalizationResult>)> {
        self.slots()
            .iter()
            .filter_map(|(t, slot)| Some((*t, slot.read()?)))
            .collect()
    }

    /// Frame times holding a result, the keyframes shown to the host.
    pub fn keyframes(&self) -> Vec<FrameTime> {
        self.entries().into_iter().map(|(t, _)| t).collect()
    }

    pub fn len(&self) -> usize {
        self.keyframes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The host deleted a keyframe on its timeline.
    pub fn on_keyframe_deleted(&self, time: FrameTime) {
        self.clear(time);
    }

    /// Drops every cached time that is no longer a keyframe of the host.
    pub fn sync_with_keyframes(&self, keyframes: &[FrameTime]) {
        let keep: BTreeSet<FrameTime> = keyframes.iter().copied().collect();
        let mut slots = self.slots_mut();
        let before = slots.len();
        slots.retain(|t, _| keep.contains(t));
        if slots.len() != before {
            log::debug!("dropped {} frame(s) missing from the track", before - slots.len());
        }
    }
}
