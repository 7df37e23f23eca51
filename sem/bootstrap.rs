//! # Bootstrap Resampling of Path Coefficients
//!
//! Draws N respondent-level resamples with replacement, refits the outer and
//! inner models on each, and turns the per-edge coefficient distributions
//! into standard errors, t-statistics, two-tailed p-values and percentile
//! intervals.
//!
//! Determinism: replicate r draws its indices from a `StdRng` seeded with
//! `seed + r`, and replicate outcomes are collected in replicate order before
//! any statistic is computed. The same seed and input matrix therefore
//! reproduce bit-for-bit identical output regardless of how rayon schedules
//! the workers. Each worker reads the shared matrix view and owns everything
//! else; results are merged by the coordinator, never accumulated in place.
//!
//! p-values use the normal approximation on the t-statistic; intervals use
//! the percentile method. Both choices are fixed here because estimates are
//! not numerically comparable across methods.
//!
//! A replicate in which any construct's outer model fails to converge is
//! excluded and counted. The run only fails when exclusions exceed the
//! configured fraction. An optional wall-clock budget skips replicates that
//! have not started in time and tags the result incomplete instead of
//! blocking.

use crate::config::ModelSpec;
use crate::inner::{InnerModel, fit_inner};
use crate::outer::{EstimationError, OuterSettings, fit_outer};
use ndarray::{ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, Normal};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Controls for one bootstrap run.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapSettings {
    pub n_resamples: usize,
    pub seed: u64,
    /// The run fails when the excluded fraction of attempted replicates
    /// exceeds this.
    pub max_failure_fraction: f64,
    /// Wall-clock budget; replicates not started before it are skipped and
    /// the result is tagged incomplete.
    pub time_budget: Option<Duration>,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            n_resamples: 5000,
            seed: 0x5eed,
            max_failure_fraction: 0.10,
            time_budget: None,
        }
    }
}

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("{excluded} of {attempted} bootstrap replicates failed to converge, exceeding the allowed fraction {max_failure_fraction}. Path significance cannot be trusted.")]
    TooManyFailures {
        excluded: usize,
        attempted: usize,
        max_failure_fraction: f64,
    },
    #[error("Bootstrap requested with zero resamples.")]
    NoResamples,
}

/// Significance summary for one path-diagram edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSummary {
    pub source: String,
    pub target: String,
    /// Coefficient fit on the full sample.
    pub baseline: f64,
    /// Mean of the bootstrap distribution.
    pub mean: f64,
    /// Sample standard deviation of the bootstrap distribution.
    pub std_error: f64,
    /// baseline / std_error.
    pub t_statistic: f64,
    /// Two-tailed, normal approximation.
    pub p_value: f64,
    /// Percentile 95% interval.
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// All bootstrap output. `replicates` keeps the successful coefficient sets
/// (edge order matches `ModelSpec::paths`) so the simulation engine can
/// propagate coefficient uncertainty without refitting.
#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub summaries: Vec<EdgeSummary>,
    pub replicates: Vec<Vec<f64>>,
    /// Replicates excluded for non-convergence.
    pub excluded: usize,
    /// Replicates skipped because the time budget ran out.
    pub skipped: usize,
    /// False when any replicate was skipped on the time budget.
    pub complete: bool,
}

enum ReplicateOutcome {
    Fitted(Vec<f64>),
    NonConvergent,
    Skipped,
}

/// Runs the bootstrap. `baseline` is the inner model fit on the full sample;
/// its coefficients anchor the t-statistics.
pub fn run_bootstrap(
    matrix: ArrayView2<'_, f64>,
    spec: &ModelSpec,
    outer_settings: &OuterSettings,
    settings: &BootstrapSettings,
    baseline: &InnerModel,
) -> Result<BootstrapResult, BootstrapError> {
    if settings.n_resamples == 0 {
        return Err(BootstrapError::NoResamples);
    }
    let n_respondents = matrix.nrows();
    let deadline = settings.time_budget.map(|budget| Instant::now() + budget);

    log::info!(
        "Bootstrapping {} resamples of {} respondents (seed {}).",
        settings.n_resamples,
        n_respondents,
        settings.seed
    );

    // Each worker owns its RNG, its index vector and its resampled copy;
    // collect() preserves replicate order, so scheduling cannot leak into
    // the statistics.
    let outcomes: Vec<ReplicateOutcome> = (0..settings.n_resamples)
        .into_par_iter()
        .map(|replicate| {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return ReplicateOutcome::Skipped;
                }
            }
            let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(replicate as u64));
            let indices: Vec<usize> = (0..n_respondents)
                .map(|_| rng.gen_range(0..n_respondents))
                .collect();
            let resample = matrix.select(Axis(0), &indices);
            refit(resample.view(), spec, outer_settings)
                .map(ReplicateOutcome::Fitted)
                .unwrap_or(ReplicateOutcome::NonConvergent)
        })
        .collect();

    let mut replicates = Vec::new();
    let mut excluded = 0usize;
    let mut skipped = 0usize;
    for outcome in outcomes {
        match outcome {
            ReplicateOutcome::Fitted(coefficients) => replicates.push(coefficients),
            ReplicateOutcome::NonConvergent => excluded += 1,
            ReplicateOutcome::Skipped => skipped += 1,
        }
    }

    let attempted = settings.n_resamples - skipped;
    if attempted > 0 && excluded as f64 / attempted as f64 > settings.max_failure_fraction {
        return Err(BootstrapError::TooManyFailures {
            excluded,
            attempted,
            max_failure_fraction: settings.max_failure_fraction,
        });
    }
    if excluded > 0 {
        log::warn!("Excluded {excluded} non-convergent bootstrap replicates.");
    }
    if skipped > 0 {
        log::warn!("Time budget exhausted: skipped {skipped} replicates; result is incomplete.");
    }

    let summaries = summarize(baseline, &replicates, spec);
    Ok(BootstrapResult {
        summaries,
        replicates,
        excluded,
        skipped,
        complete: skipped == 0,
    })
}

/// Refits outer and inner models on one resample. A replicate counts only if
/// every construct's outer model converged.
fn refit(
    resample: ArrayView2<'_, f64>,
    spec: &ModelSpec,
    outer_settings: &OuterSettings,
) -> Result<Vec<f64>, EstimationError> {
    let outer = fit_outer(resample, spec, outer_settings)?;
    if !outer.non_convergent().is_empty() {
        return Err(EstimationError::AllConstructsNonConvergent {
            max_iterations: outer_settings.max_iterations,
            tolerance: outer_settings.tolerance,
        });
    }
    let inner = fit_inner(outer.scores.view(), spec)?;
    Ok(inner.coefficient_vector())
}

fn summarize(
    baseline: &InnerModel,
    replicates: &[Vec<f64>],
    spec: &ModelSpec,
) -> Vec<EdgeSummary> {
    spec.paths
        .iter()
        .enumerate()
        .map(|(edge, &(source, target))| {
            let samples: Vec<f64> = replicates.iter().map(|r| r[edge]).collect();
            let baseline_coef = baseline.paths[edge].coefficient;

            let (mean, std_error) = mean_and_sample_std(&samples);
            let t_statistic = if std_error > 0.0 {
                baseline_coef / std_error
            } else {
                f64::NAN
            };
            let p_value = if t_statistic.is_finite() {
                2.0 * (1.0 - standard_normal_cdf(t_statistic.abs()))
            } else {
                f64::NAN
            };

            let mut sorted = samples;
            sorted.sort_by(|a, b| a.total_cmp(b));
            EdgeSummary {
                source: spec.constructs[source].code.clone(),
                target: spec.constructs[target].code.clone(),
                baseline: baseline_coef,
                mean,
                std_error,
                t_statistic,
                p_value,
                ci_lower: percentile(&sorted, 2.5),
                ci_upper: percentile(&sorted, 97.5),
            }
        })
        .collect()
}

fn mean_and_sample_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    if samples.len() < 2 {
        return (mean, f64::NAN);
    }
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

/// Linear-interpolation percentile of an already-sorted slice.
pub(crate) fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}

/// Phi(z).
pub(crate) fn standard_normal_cdf(z: f64) -> f64 {
    Normal::standard().cdf(z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConstructSpec, LikertScale, ModelSpec, PathSpec, RawSpec};
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand_distr::{Distribution, StandardNormal};

    fn two_construct_spec() -> ModelSpec {
        let mk = |code: &str, k: usize| ConstructSpec {
            code: code.to_string(),
            name: code.to_string(),
            indicators: (1..=k).map(|j| format!("{code}_{j}")).collect(),
            reverse_coded: vec![],
            single_item: false,
        };
        ModelSpec::validate(RawSpec {
            likert: LikertScale { min: -1e9, max: 1e9 },
            thresholds: Default::default(),
            policy: Default::default(),
            constructs: vec![mk("A", 3), mk("B", 3)],
            paths: vec![PathSpec {
                source: "A".to_string(),
                target: "B".to_string(),
            }],
        })
        .unwrap()
    }

    /// Survey-like data where construct A drives construct B.
    fn driven_data(seed: u64, n: usize, effect: f64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut matrix = Array2::zeros((n, 6));
        for i in 0..n {
            let a: f64 = StandardNormal.sample(&mut rng);
            let b = effect * a + (1.0 - effect * effect).sqrt() * {
                let e: f64 = StandardNormal.sample(&mut rng);
                e
            };
            for j in 0..3 {
                let e: f64 = StandardNormal.sample(&mut rng);
                matrix[[i, j]] = 0.85 * a + 0.53 * e;
            }
            for j in 3..6 {
                let e: f64 = StandardNormal.sample(&mut rng);
                matrix[[i, j]] = 0.85 * b + 0.53 * e;
            }
        }
        matrix
    }

    fn run(
        matrix: &Array2<f64>,
        spec: &ModelSpec,
        settings: &BootstrapSettings,
    ) -> Result<BootstrapResult, BootstrapError> {
        let outer_settings = OuterSettings::default();
        let outer = fit_outer(matrix.view(), spec, &outer_settings).unwrap();
        let baseline = fit_inner(outer.scores.view(), spec).unwrap();
        run_bootstrap(matrix.view(), spec, &outer_settings, settings, &baseline)
    }

    #[test]
    fn identical_seeds_give_bit_identical_results() {
        let spec = two_construct_spec();
        let matrix = driven_data(77, 120, 0.6);
        let settings = BootstrapSettings {
            n_resamples: 60,
            seed: 424242,
            ..BootstrapSettings::default()
        };
        let first = run(&matrix, &spec, &settings).unwrap();
        let second = run(&matrix, &spec, &settings).unwrap();

        assert_eq!(first.summaries, second.summaries);
        assert_eq!(first.replicates, second.replicates);
        assert_eq!(first.excluded, second.excluded);
    }

    #[test]
    fn different_seeds_give_different_distributions() {
        let spec = two_construct_spec();
        let matrix = driven_data(77, 120, 0.6);
        let a = run(
            &matrix,
            &spec,
            &BootstrapSettings {
                n_resamples: 40,
                seed: 1,
                ..BootstrapSettings::default()
            },
        )
        .unwrap();
        let b = run(
            &matrix,
            &spec,
            &BootstrapSettings {
                n_resamples: 40,
                seed: 2,
                ..BootstrapSettings::default()
            },
        )
        .unwrap();
        assert_ne!(a.replicates, b.replicates);
    }

    #[test]
    fn strong_effect_is_significant() {
        let spec = two_construct_spec();
        let matrix = driven_data(99, 200, 0.7);
        let result = run(
            &matrix,
            &spec,
            &BootstrapSettings {
                n_resamples: 200,
                seed: 7,
                ..BootstrapSettings::default()
            },
        )
        .unwrap();

        let edge = &result.summaries[0];
        assert_eq!(edge.source, "A");
        assert_eq!(edge.target, "B");
        assert!(edge.baseline > 0.4);
        assert!(edge.p_value < 0.01, "p = {}", edge.p_value);
        assert!(edge.ci_lower <= edge.mean && edge.mean <= edge.ci_upper);
        assert!(edge.std_error > 0.0);
        assert!(result.complete);
        assert_eq!(result.replicates.len(), 200 - result.excluded);
    }

    #[test]
    fn hopeless_convergence_settings_fail_the_run() {
        let spec = two_construct_spec();
        let matrix = driven_data(5, 80, 0.5);
        let outer_settings = OuterSettings::default();
        let outer = fit_outer(matrix.view(), &spec, &outer_settings).unwrap();
        let baseline = fit_inner(outer.scores.view(), &spec).unwrap();
        // Refits get a cap no data can meet; every replicate is excluded.
        let strangled = OuterSettings {
            tolerance: 0.0,
            max_iterations: 1,
        };
        let err = run_bootstrap(
            matrix.view(),
            &spec,
            &strangled,
            &BootstrapSettings {
                n_resamples: 20,
                seed: 3,
                ..BootstrapSettings::default()
            },
            &baseline,
        )
        .unwrap_err();
        match err {
            BootstrapError::TooManyFailures {
                excluded, attempted, ..
            } => {
                assert_eq!(excluded, 20);
                assert_eq!(attempted, 20);
            }
            other => panic!("expected TooManyFailures, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_time_budget_tags_the_result_incomplete() {
        let spec = two_construct_spec();
        let matrix = driven_data(13, 60, 0.5);
        let result = run(
            &matrix,
            &spec,
            &BootstrapSettings {
                n_resamples: 30,
                seed: 11,
                time_budget: Some(Duration::ZERO),
                ..BootstrapSettings::default()
            },
        )
        .unwrap();
        assert!(!result.complete);
        assert_eq!(result.skipped, 30);
        assert!(result.replicates.is_empty());
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(percentile(&sorted, 0.0), 1.0);
        assert_abs_diff_eq!(percentile(&sorted, 50.0), 3.0);
        assert_abs_diff_eq!(percentile(&sorted, 100.0), 5.0);
        assert_abs_diff_eq!(percentile(&sorted, 25.0), 2.0);
    }

    #[test]
    fn normal_cdf_matches_known_values() {
        assert_abs_diff_eq!(standard_normal_cdf(0.0), 0.5, epsilon = 1e-7);
        assert_abs_diff_eq!(standard_normal_cdf(1.96), 0.975, epsilon = 1e-4);
        assert_abs_diff_eq!(standard_normal_cdf(-1.96), 0.025, epsilon = 1e-4);
    }
}
