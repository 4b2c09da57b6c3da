//! Model-agnostic consensus loop.
//!
//! Implement [`Estimator`] for a model and call [`ransac`]. Sampling uses a
//! seeded `ChaCha8Rng` so repeated runs on the same data agree bit for bit.

use rand::SeedableRng;
use rand::seq::index::sample;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone)]
pub struct RansacOptions {
    pub max_iters: usize,
    /// Inlier residual threshold, same unit as [`Estimator::residual`].
    pub thresh: f64,
    pub min_inliers: usize,
    /// Confidence in `[0, 1)` used to shrink the iteration budget.
    pub confidence: f64,
    pub seed: u64,
    pub refit_on_inliers: bool,
}

impl Default for RansacOptions {
    fn default() -> Self {
        Self {
            max_iters: 1000,
            thresh: 4.0,
            min_inliers: 7,
            confidence: 0.999,
            seed: 42,
            refit_on_inliers: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RansacResult<M> {
    pub model: Option<M>,
    pub inliers: Vec<usize>,
    pub inlier_rms: f64,
    pub iters: usize,
}

impl<M> Default for RansacResult<M> {
    fn default() -> Self {
        Self {
            model: None,
            inliers: Vec::new(),
            inlier_rms: f64::INFINITY,
            iters: 0,
        }
    }
}

impl<M> RansacResult<M> {
    pub fn success(&self) -> bool {
        self.model.is_some()
    }
}

pub trait Estimator {
    type Datum;
    type Model: Clone;

    const MIN_SAMPLES: usize;

    /// Candidate models for a minimal sample. Minimal solvers may return
    /// several solutions, all of which get scored.
    fn fit(&self, data: &[Self::Datum], sample: &[usize]) -> Vec<Self::Model>;

    /// Non-negative residual in the unit of `RansacOptions::thresh`.
    fn residual(&self, model: &Self::Model, datum: &Self::Datum) -> f64;

    fn is_degenerate(&self, _data: &[Self::Datum], _sample: &[usize]) -> bool {
        false
    }

    /// Least squares model from a consensus set.
    fn refit(&self, _data: &[Self::Datum], _inliers: &[usize]) -> Option<Self::Model> {
        None
    }

    /// Draws a minimal sample. Estimators whose data is partitioned (one set
    /// per rig camera) override this to sample within one partition.
    fn sample(&self, data: &[Self::Datum], rng: &mut ChaCha8Rng) -> Option<Vec<usize>> {
        if data.len() < Self::MIN_SAMPLES {
            return None;
        }
        Some(sample(rng, data.len(), Self::MIN_SAMPLES).into_vec())
    }
}

fn rms(vals: &[f64]) -> f64 {
    if vals.is_empty() {
        return f64::INFINITY;
    }
    let ss: f64 = vals.iter().map(|&v| v * v).sum();
    (ss / vals.len() as f64).sqrt()
}

fn calculate_iterations(
    confidence: f64,
    inlier_ratio: f64,
    min_samples: usize,
    iters_so_far: usize,
    max_iters: usize,
) -> usize {
    if confidence <= 0.0 || inlier_ratio <= 0.0 {
        return max_iters;
    }
    let denom = (1.0 - inlier_ratio.powi(min_samples as i32)).max(1e-12).ln();
    if denom >= 0.0 {
        return max_iters;
    }
    let n = ((1.0 - confidence).ln() / denom).ceil();
    if !n.is_finite() {
        return max_iters;
    }
    (n as usize).clamp(iters_so_far, max_iters)
}

fn is_better(count: usize, rms: f64, best_count: usize, best_rms: f64) -> bool {
    count > best_count || (count == best_count && rms < best_rms)
}

/// Collects inliers of `model` over `data`.
pub fn score<E: Estimator>(
    estimator: &E,
    model: &E::Model,
    data: &[E::Datum],
    thresh: f64,
) -> (Vec<usize>, f64) {
    let mut inliers = Vec::new();
    let mut residuals = Vec::new();
    for (i, datum) in data.iter().enumerate() {
        let r = estimator.residual(model, datum);
        if r <= thresh {
            inliers.push(i);
            residuals.push(r);
        }
    }
    let rms = rms(&residuals);
    (inliers, rms)
}

pub fn ransac<E: Estimator>(
    estimator: &E,
    data: &[E::Datum],
    opts: &RansacOptions,
) -> RansacResult<E::Model> {
    let mut best = RansacResult::default();
    if data.len() < E::MIN_SAMPLES {
        return best;
    }
    let mut rng = ChaCha8Rng::seed_from_u64(opts.seed);
    let mut dynamic_max_iters = opts.max_iters;
    let mut iters = 0;

    while iters < dynamic_max_iters {
        iters += 1;
        let Some(sample_idxs) = estimator.sample(data, &mut rng) else {
            break;
        };
        if estimator.is_degenerate(data, &sample_idxs) {
            continue;
        }
        for model in estimator.fit(data, &sample_idxs) {
            let (inliers, inlier_rms) = score(estimator, &model, data, opts.thresh);
            if inliers.len() < opts.min_inliers {
                continue;
            }
            let (model, inliers, inlier_rms) = if opts.refit_on_inliers {
                match estimator.refit(data, &inliers) {
                    Some(refined) => {
                        let (refined_inliers, refined_rms) =
                            score(estimator, &refined, data, opts.thresh);
                        if is_better(refined_inliers.len(), refined_rms, inliers.len(), inlier_rms)
                        {
                            (refined, refined_inliers, refined_rms)
                        } else {
                            (model, inliers, inlier_rms)
                        }
                    }
                    None => (model, inliers, inlier_rms),
                }
            } else {
                (model, inliers, inlier_rms)
            };

            if best.model.is_none()
                || is_better(inliers.len(), inlier_rms, best.inliers.len(), best.inlier_rms)
            {
                let ratio = inliers.len() as f64 / data.len() as f64;
                dynamic_max_iters = calculate_iterations(
                    opts.confidence,
                    ratio,
                    E::MIN_SAMPLES,
                    iters,
                    opts.max_iters,
                );
                best.model = Some(model);
                best.inliers = inliers;
                best.inlier_rms = inlier_rms;
            }
        }
    }
    best.iters = iters;
    log::trace!(
        "ransac: {} iterations, {} / {} inliers",
        iters,
        best.inliers.len(),
        data.len()
    );
    best
}
