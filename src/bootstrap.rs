//! Crash-level bootstrap of the fitted relative risks.
//!
//! Replicate 0 is the unresampled sample. Every other replicate draws `n` crashes
//! with replacement from the `n` eligible crashes, re-aggregates the resulting
//! multiset, and refits from the replicate-0 estimate. Each replicate owns a
//! generator seeded from `(seed, imputation stream, replicate, attempt)`, so the
//! draws do not depend on scheduling.

use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, LogNormal};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::{aggregate, aggregate_resampled, EstimationMatrix, StratificationKey};
use crate::error::{LpError, ReplicateContext, Result};
use crate::likelihood::ParameterVector;
use crate::options::{BootstrapOptions, FailurePolicy, FitOptions};
use crate::sample::AnalyticSample;
use crate::solving::{fit_from, FitResult};

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Seed for one `(stream, replicate, attempt)` coordinate under a base seed.
pub fn replicate_seed(seed: u64, stream: u64, replicate: u64, attempt: u64) -> u64 {
    [stream, replicate, attempt]
        .into_iter()
        .fold(splitmix64(seed), |state, part| splitmix64(state ^ splitmix64(part)))
}

/// Crash indices drawn with replacement for bootstrap replicate `replicate`.
pub fn resample_indices(population: usize, seed: u64, stream: u64, replicate: u64) -> Vec<usize> {
    let mut rng = SmallRng::seed_from_u64(replicate_seed(seed, stream, replicate, 0));
    (0..population)
        .map(|_| rng.gen_range(0..population))
        .collect()
}

/// Estimates across bootstrap replicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BootstrapDistribution {
    /// Fit of the unresampled sample.
    pub point: FitResult,
    /// One row per surviving replicate, row 0 being `point`; columns follow
    /// [`FitResult::estimates`].
    pub estimates: DMatrix<f64>,
    /// Replicate index of each row of `estimates`.
    pub replicate_indices: Vec<usize>,
    /// Replicates dropped under [`FailurePolicy::Exclude`].
    pub excluded: Vec<usize>,
    /// Refits started from jittered values under [`FailurePolicy::Restart`].
    pub restarts: usize,
}

impl BootstrapDistribution {
    pub fn replicates(&self) -> usize {
        self.estimates.nrows()
    }

    /// Sample variance (denominator `n - 1`) of each estimate across all rows.
    pub fn variances(&self) -> DVector<f64> {
        let rows = self.estimates.nrows();
        let means = self.estimates.row_mean();
        DVector::from_iterator(
            self.estimates.ncols(),
            self.estimates
                .column_iter()
                .zip(means.iter())
                .map(|(column, mean)| {
                    column.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                        / (rows.saturating_sub(1)).max(1) as f64
                }),
        )
    }

    pub fn standard_errors(&self) -> DVector<f64> {
        self.variances().map(f64::sqrt)
    }
}

/// Outcome of one resampled replicate.
enum ReplicateOutcome {
    Fitted(DVector<f64>, usize),
    Excluded,
}

/// Bootstrap standard errors for classification replicate `mi_index` (or the reported
/// measurements when `None`).
pub fn bootstrap(
    sample: &AnalyticSample,
    key: &StratificationKey,
    mi_index: Option<usize>,
    fit_options: &FitOptions,
    options: &BootstrapOptions,
) -> Result<BootstrapDistribution> {
    options.validate()?;
    let replicate = mi_index.unwrap_or(0);

    let stream = mi_index.map_or(0, |index| index as u64 + 1);
    let real = aggregate(sample, key, replicate)?;
    let (point, point_restarts) =
        ParameterVector::uniform(real.num_types(), fit_options.initial_relative_risk)
            .and_then(|start| fit_with_policy(&real, fit_options, &start, options, stream, 0))
            .map_err(|err| err.in_replicate(mi_index, Some(0)))?;
    info!(
        "bootstrap point estimate on {} strata; running {} resampled replicates",
        real.rows(),
        options.replicates - 1
    );

    let refit = fit_options.clone().with_hessian(false);
    let run = |index: usize| -> Result<ReplicateOutcome> {
        let indices = resample_indices(sample.len(), options.seed, stream, index as u64);
        let outcome = aggregate_resampled(sample, key, replicate, &indices).and_then(|matrix| {
            fit_with_policy(&matrix, &refit, &point.params, options, stream, index)
        });
        match outcome {
            Ok((fitted, restarts)) => Ok(ReplicateOutcome::Fitted(fitted.estimates(), restarts)),
            Err(err) if is_fit_failure(&err) && excludes(options.failure_policy) => {
                warn!("excluding bootstrap replicate {index}: {err}");
                Ok(ReplicateOutcome::Excluded)
            }
            Err(err) => Err(err.in_replicate(mi_index, Some(index))),
        }
    };

    let outcomes: Vec<Result<ReplicateOutcome>> = if options.parallel {
        (1..options.replicates).into_par_iter().map(run).collect()
    } else {
        (1..options.replicates).map(run).collect()
    };

    let mut rows = vec![point.estimates()];
    let mut replicate_indices = vec![0];
    let mut excluded = Vec::new();
    let mut restarts = point_restarts;
    for (index, outcome) in (1..options.replicates).zip(outcomes) {
        match outcome? {
            ReplicateOutcome::Fitted(estimates, used) => {
                rows.push(estimates);
                replicate_indices.push(index);
                restarts += used;
            }
            ReplicateOutcome::Excluded => excluded.push(index),
        }
    }

    let context = ReplicateContext {
        mi_replicate: mi_index,
        bootstrap_replicate: None,
        strata: real.rows(),
    };
    if let FailurePolicy::Exclude { max_failures } = options.failure_policy {
        if excluded.len() > max_failures {
            return Err(LpError::DegenerateSample {
                reason: "bootstrap failures exceeded the exclusion limit",
                context,
            });
        }
    }
    if rows.len() < 2 {
        return Err(LpError::DegenerateSample {
            reason: "fewer than two bootstrap replicates survived",
            context,
        });
    }

    let columns = rows[0].len();
    let estimates = DMatrix::from_fn(rows.len(), columns, |row, column| rows[row][column]);
    debug!(
        "bootstrap finished: {} replicates kept, {} excluded, {} restarts",
        estimates.nrows(),
        excluded.len(),
        restarts
    );
    Ok(BootstrapDistribution {
        point,
        estimates,
        replicate_indices,
        excluded,
        restarts,
    })
}

fn excludes(policy: FailurePolicy) -> bool {
    matches!(policy, FailurePolicy::Exclude { .. })
}

/// Failures that belong to one resample rather than to the configuration.
fn is_fit_failure(err: &LpError) -> bool {
    matches!(
        err,
        LpError::Convergence { .. }
            | LpError::DegenerateSample { .. }
            | LpError::NumericalError { .. }
    )
}

/// Fits one replicate, restarting from jittered values when the policy allows.
///
/// Restart `attempt` multiplies every start value by a log-normal factor and
/// doubles the iteration cap once per attempt.
fn fit_with_policy(
    matrix: &EstimationMatrix,
    options: &FitOptions,
    warm_start: &ParameterVector,
    bootstrap: &BootstrapOptions,
    stream: u64,
    index: usize,
) -> Result<(FitResult, usize)> {
    let first = fit_from(matrix, options, warm_start);
    let FailurePolicy::Restart {
        attempts,
        log_scale,
    } = bootstrap.failure_policy
    else {
        return first.map(|fitted| (fitted, 0));
    };

    let mut last = match first {
        Ok(fitted) => return Ok((fitted, 0)),
        Err(err) if err.is_convergence() => err,
        Err(err) => return Err(err),
    };
    let jitter = LogNormal::new(0.0, log_scale).map_err(|err| {
        LpError::configuration("bootstrap.failure_policy", err.to_string())
    })?;
    for attempt in 1..=attempts {
        let mut rng = SmallRng::seed_from_u64(replicate_seed(
            bootstrap.seed,
            stream,
            index as u64,
            attempt as u64,
        ));
        let start = ParameterVector::new(
            warm_start.thetas().map(|value| value * jitter.sample(&mut rng)),
            warm_start.lambdas().map(|value| value * jitter.sample(&mut rng)),
        )?;
        let max_iterations = options
            .max_iterations
            .saturating_mul(2u64.saturating_pow(attempt as u32));
        warn!(
            "restarting bootstrap replicate {index} (attempt {attempt}) from jittered values \
             with at most {max_iterations} iterations"
        );
        let capped = options.clone().with_max_iterations(max_iterations);
        match fit_from(matrix, &capped, &start) {
            Ok(fitted) => return Ok((fitted, attempt)),
            Err(err) if err.is_convergence() => last = err,
            Err(err) => return Err(err),
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DriverType;
    use crate::data::CaseKey;
    use crate::sample::EligibleCrash;
    use approx::assert_relative_eq;

    /// Builds a pooled two-type sample from crash tallies.
    fn tallied_sample(one: [usize; 2], two: [usize; 3]) -> AnalyticSample {
        let mut crashes = Vec::new();
        let mut next = 0u32;
        let mut push = |types: Vec<u8>| {
            next += 1;
            let types = types.into_iter().map(|t| DriverType::new(t).unwrap()).collect();
            crashes.push(
                EligibleCrash::new(CaseKey::new(1990, next), 1, 7, 23, vec![types]).unwrap(),
            );
        };
        for (label, &count) in [1u8, 2].iter().zip(one.iter()) {
            (0..count).for_each(|_| push(vec![*label]));
        }
        for (pair, &count) in [[1u8, 1], [1, 2], [2, 2]].iter().zip(two.iter()) {
            (0..count).for_each(|_| push(pair.to_vec()));
        }
        AnalyticSample::from_crashes(2, crashes).unwrap()
    }

    fn options(seed: u64) -> BootstrapOptions {
        BootstrapOptions::default()
            .with_replicates(12)
            .with_seed(seed)
    }

    fn fit_options() -> FitOptions {
        FitOptions::default().with_hessian(false)
    }

    #[test]
    fn seeds_are_distinct_per_coordinate() {
        let base = replicate_seed(7, 0, 1, 0);
        assert_ne!(base, replicate_seed(7, 0, 2, 0));
        assert_ne!(base, replicate_seed(7, 1, 1, 0));
        assert_ne!(base, replicate_seed(7, 0, 1, 1));
        assert_ne!(base, replicate_seed(8, 0, 1, 0));
        assert_eq!(base, replicate_seed(7, 0, 1, 0));
        let indices = resample_indices(50, 7, 0, 3);
        assert_eq!(indices.len(), 50);
        assert!(indices.iter().all(|&i| i < 50));
    }

    #[test]
    fn fixed_seed_reproduces_distribution_across_scheduling() {
        let sample = tallied_sample([60, 30], [80, 45, 15]);
        let key = StratificationKey::all();
        let parallel =
            bootstrap(&sample, &key, None, &fit_options(), &options(11)).unwrap();
        let again = bootstrap(&sample, &key, None, &fit_options(), &options(11)).unwrap();
        let sequential = bootstrap(
            &sample,
            &key,
            None,
            &fit_options(),
            &options(11).with_parallel(false),
        )
        .unwrap();
        assert_eq!(parallel, again);
        assert_eq!(parallel, sequential);
        assert_eq!(parallel.replicates(), 12);
        assert_eq!(parallel.replicate_indices, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn changing_seed_moves_resamples_but_not_replicate_zero() {
        let sample = tallied_sample([60, 30], [80, 45, 15]);
        let key = StratificationKey::all();
        let first = bootstrap(&sample, &key, None, &fit_options(), &options(1)).unwrap();
        let second = bootstrap(&sample, &key, None, &fit_options(), &options(2)).unwrap();
        assert_eq!(first.estimates.row(0), second.estimates.row(0));
        assert_eq!(first.point, second.point);
        assert!((1..12).any(|row| first.estimates.row(row) != second.estimates.row(row)));
    }

    #[test]
    fn standard_errors_use_sample_variance_over_all_rows() {
        let sample = tallied_sample([60, 30], [80, 45, 15]);
        let dist = bootstrap(
            &sample,
            &StratificationKey::all(),
            None,
            &fit_options(),
            &options(5),
        )
        .unwrap();
        let column: Vec<f64> = dist.estimates.column(0).iter().copied().collect();
        let mean = column.iter().sum::<f64>() / column.len() as f64;
        let variance =
            column.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (column.len() - 1) as f64;
        assert_relative_eq!(dist.standard_errors()[0], variance.sqrt(), epsilon = 1e-12);
        assert_eq!(dist.estimates.ncols(), 4);
    }

    #[test]
    fn degenerate_resamples_follow_the_failure_policy() {
        // A single type-2 one-vehicle crash is missing from about a third of resamples.
        let sample = tallied_sample([10, 1], [8, 3, 1]);
        let key = StratificationKey::all();
        let many = |policy| options(3).with_replicates(30).with_failure_policy(policy);

        let err = bootstrap(&sample, &key, None, &fit_options(), &many(FailurePolicy::Propagate))
            .unwrap_err();
        assert!(matches!(err, LpError::DegenerateSample { .. }));
        let context = err.context().expect("context attached");
        assert!(context.bootstrap_replicate.is_some_and(|index| index >= 1));
        assert_eq!(context.mi_replicate, None);

        let tolerant = bootstrap(
            &sample,
            &key,
            None,
            &fit_options(),
            &many(FailurePolicy::Exclude { max_failures: 30 }),
        )
        .unwrap();
        assert!(!tolerant.excluded.is_empty());
        assert_eq!(tolerant.replicates() + tolerant.excluded.len(), 30);

        let strict = bootstrap(
            &sample,
            &key,
            None,
            &fit_options(),
            &many(FailurePolicy::Exclude { max_failures: 0 }),
        );
        assert!(matches!(strict, Err(LpError::DegenerateSample { .. })));
    }

    #[test]
    fn restart_policy_recovers_from_iteration_cap() {
        let sample = tallied_sample([60, 30], [80, 45, 15]);
        let key = StratificationKey::all();
        let reference = bootstrap(&sample, &key, None, &fit_options(), &options(9)).unwrap();

        // Three iterations never meet the tolerance, so every first attempt fails.
        let capped = fit_options().with_max_iterations(3);
        let propagated = bootstrap(&sample, &key, None, &capped, &options(9)).unwrap_err();
        assert!(propagated.is_convergence());
        assert_eq!(propagated.context().and_then(|c| c.bootstrap_replicate), Some(0));

        let restarting = options(9).with_failure_policy(FailurePolicy::Restart {
            attempts: 12,
            log_scale: 0.05,
        });
        let recovered = bootstrap(&sample, &key, None, &capped, &restarting).unwrap();
        assert!(recovered.restarts >= 12);
        assert_eq!(recovered.replicates(), 12);
        assert!(recovered.excluded.is_empty());
        assert!(recovered.estimates.iter().all(|value| value.is_finite() && *value > 0.0));
        assert_relative_eq!(
            recovered.point.params.thetas()[0],
            reference.point.params.thetas()[0],
            epsilon = 1e-3
        );

        // Too few attempts to outgrow a one-iteration cap: the last failure surfaces.
        let matrix = aggregate(&sample, &key, 0).unwrap();
        let short = options(9).with_failure_policy(FailurePolicy::Restart {
            attempts: 2,
            log_scale: 0.05,
        });
        let exhausted = fit_with_policy(
            &matrix,
            &fit_options().with_max_iterations(1),
            &reference.point.params,
            &short,
            0,
            1,
        )
        .unwrap_err();
        assert!(exhausted.is_convergence());
    }
}
