//! Configuration structures for sample construction, fitting, bootstrap, and pooling.
//!
//! Every option struct has a `Default` matching the conventions of the published
//! analyses and can be deserialized from JSON by an orchestration layer. Nothing here
//! reads from the environment.

use serde::{Deserialize, Serialize};

use crate::aggregate::StratificationKey;
use crate::classify::{ClassificationRule, DriverTypeScheme};
use crate::error::{LpError, Result};

/// Filters and classification policy applied by the [`SampleBuilder`](crate::sample::SampleBuilder).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleOptions {
    pub first_year: i32,
    pub last_year: i32,
    /// First hour of the inclusive window.
    pub earliest_hour: u8,
    /// Last hour of the inclusive window; smaller than `earliest_hour` wraps past midnight.
    pub latest_hour: u8,
    pub classification: ClassificationRule,
    pub scheme: DriverTypeScheme,
    /// Drop a (year, state) cell whose share of flagged crashes exceeds this value.
    pub state_year_missing_threshold: f64,
    /// Drop a (year, state) cell where fewer than this share of drivers with officer
    /// evidence of drinking carry a reported test result.
    pub testing_rate_threshold: Option<f64>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            first_year: 1983,
            last_year: 1993,
            earliest_hour: 20,
            latest_hour: 4,
            classification: ClassificationRule::default(),
            scheme: DriverTypeScheme::Drinking,
            state_year_missing_threshold: 0.13,
            testing_rate_threshold: None,
        }
    }
}

impl SampleOptions {
    pub fn with_years(mut self, first: i32, last: i32) -> Self {
        self.first_year = first;
        self.last_year = last;
        self
    }

    pub fn with_hours(mut self, earliest: u8, latest: u8) -> Self {
        self.earliest_hour = earliest;
        self.latest_hour = latest;
        self
    }

    pub fn with_classification(mut self, classification: ClassificationRule) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_scheme(mut self, scheme: DriverTypeScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_missing_threshold(mut self, threshold: f64) -> Self {
        self.state_year_missing_threshold = threshold;
        self
    }

    pub fn with_testing_rate_threshold(mut self, threshold: f64) -> Self {
        self.testing_rate_threshold = Some(threshold);
        self
    }

    /// Whether `hour` lies inside the inclusive, possibly wrapping window.
    pub fn hour_in_window(&self, hour: u8) -> bool {
        if self.earliest_hour <= self.latest_hour {
            (self.earliest_hour..=self.latest_hour).contains(&hour)
        } else {
            hour >= self.earliest_hour || hour <= self.latest_hour
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.first_year > self.last_year {
            return Err(LpError::configuration(
                "first_year",
                format!(
                    "year range {}..={} is reversed",
                    self.first_year, self.last_year
                ),
            ));
        }
        if self.earliest_hour > 23 || self.latest_hour > 23 {
            return Err(LpError::configuration(
                "hour window",
                "hours must lie in 0..=23",
            ));
        }
        if self.earliest_hour == self.latest_hour {
            return Err(LpError::configuration(
                "hour window",
                "earliest and latest hour must differ",
            ));
        }
        self.classification.validate()?;
        check_share("state_year_missing_threshold", self.state_year_missing_threshold)?;
        if let Some(rate) = self.testing_rate_threshold {
            check_share("testing_rate_threshold", rate)?;
        }
        Ok(())
    }
}

fn check_share(field: &'static str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(LpError::configuration(
            field,
            format!("must lie in [0, 1], got {value}"),
        ));
    }
    Ok(())
}

/// Controls the likelihood maximization for one estimation matrix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitOptions {
    /// Fit each non-base type against the base type separately.
    pub pairwise: bool,
    /// Starting value for every free θ and λ.
    ///
    /// With two types the likelihood has two modes of equal height, at θ and 1/θ
    /// with matching λ. The default of 20 starts the search on the high-θ side.
    pub initial_relative_risk: f64,
    /// Iteration cap for the simplex search.
    pub max_iterations: u64,
    /// Simplex cost spread at which the search is declared converged, relative to
    /// the starting negative log-likelihood.
    pub tolerance: f64,
    /// Compute the finite-difference Hessian and its inverse at the optimum.
    pub compute_hessian: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            pairwise: false,
            initial_relative_risk: 20.0,
            max_iterations: 10_000,
            tolerance: 1e-10,
            compute_hessian: true,
        }
    }
}

impl FitOptions {
    pub fn with_pairwise(mut self, pairwise: bool) -> Self {
        self.pairwise = pairwise;
        self
    }

    pub fn with_initial_relative_risk(mut self, start: f64) -> Self {
        self.initial_relative_risk = start;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_hessian(mut self, compute: bool) -> Self {
        self.compute_hessian = compute;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.initial_relative_risk.is_finite() && self.initial_relative_risk > 0.0) {
            return Err(LpError::configuration(
                "initial_relative_risk",
                "must be finite and positive",
            ));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(LpError::configuration(
                "tolerance",
                "must be finite and positive",
            ));
        }
        if self.max_iterations == 0 {
            return Err(LpError::configuration("max_iterations", "must be positive"));
        }
        Ok(())
    }
}

/// What the bootstrap does when a resampled replicate fails to fit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any failed replicate fails the whole configuration.
    #[default]
    Propagate,
    /// Drop failed replicates, up to `max_failures` of them.
    Exclude { max_failures: usize },
    /// Refit non-converged fits, replicate 0 included, from start values jittered by
    /// a log-normal factor with scale `log_scale`. Each attempt doubles the
    /// iteration cap.
    Restart { attempts: usize, log_scale: f64 },
}

/// Crash-level bootstrap configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapOptions {
    /// Total replicates including replicate 0, the unresampled sample.
    pub replicates: usize,
    pub seed: u64,
    pub failure_policy: FailurePolicy,
    /// Fit resampled replicates on the rayon thread pool.
    pub parallel: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            replicates: 100,
            seed: 0x5EED,
            failure_policy: FailurePolicy::Propagate,
            parallel: true,
        }
    }
}

impl BootstrapOptions {
    pub fn with_replicates(mut self, replicates: usize) -> Self {
        self.replicates = replicates;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.replicates < 2 {
            return Err(LpError::configuration(
                "bootstrap.replicates",
                "at least two replicates are needed for a standard error",
            ));
        }
        if let FailurePolicy::Restart {
            attempts,
            log_scale,
        } = self.failure_policy
        {
            if attempts == 0 {
                return Err(LpError::configuration(
                    "bootstrap.failure_policy",
                    "restart policy needs at least one attempt",
                ));
            }
            if !(log_scale.is_finite() && log_scale > 0.0) {
                return Err(LpError::configuration(
                    "bootstrap.failure_policy",
                    "restart jitter scale must be positive",
                ));
            }
        }
        Ok(())
    }
}

/// Which replicate's residual degrees of freedom a pooled result reports.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DofConvention {
    #[default]
    Last,
    Mean,
}

/// Multiple-imputation configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImputationOptions {
    /// Number of imputed BAC replicates to run; must not exceed what the tables carry.
    pub replicates: usize,
    pub dof: DofConvention,
    /// Run imputation replicates on the rayon thread pool.
    pub parallel: bool,
}

impl Default for ImputationOptions {
    fn default() -> Self {
        Self {
            replicates: 10,
            dof: DofConvention::Last,
            parallel: true,
        }
    }
}

impl ImputationOptions {
    pub fn with_replicates(mut self, replicates: usize) -> Self {
        self.replicates = replicates;
        self
    }

    pub fn with_dof(mut self, dof: DofConvention) -> Self {
        self.dof = dof;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.replicates == 0 {
            return Err(LpError::configuration(
                "imputation.replicates",
                "must be positive",
            ));
        }
        Ok(())
    }
}

/// Aggregated configuration for one estimation run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationOptions {
    pub sample: SampleOptions,
    pub stratification: StratificationKey,
    pub fit: FitOptions,
    /// Bootstrap standard errors; `None` reports the point estimate only.
    pub bootstrap: Option<BootstrapOptions>,
    pub imputation: ImputationOptions,
}

impl EstimationOptions {
    pub fn with_sample(mut self, sample: SampleOptions) -> Self {
        self.sample = sample;
        self
    }

    pub fn with_stratification(mut self, key: StratificationKey) -> Self {
        self.stratification = key;
        self
    }

    pub fn with_fit(mut self, fit: FitOptions) -> Self {
        self.fit = fit;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapOptions) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn with_imputation(mut self, imputation: ImputationOptions) -> Self {
        self.imputation = imputation;
        self
    }

    /// Number of driver types implied by the configured scheme.
    pub fn num_types(&self) -> usize {
        self.sample.scheme.num_types()
    }

    /// Fails fast on structurally invalid settings before any data is touched.
    pub fn validate(&self) -> Result<()> {
        self.sample.validate()?;
        self.fit.validate()?;
        if let Some(bootstrap) = &self.bootstrap {
            bootstrap.validate()?;
        }
        self.imputation.validate()
    }
}
