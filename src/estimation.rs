//! High-level relative-risk estimation pipeline.
//!
//! [`LpProblem`] owns the canonical crash tables and runs sample construction,
//! aggregation, fitting, and optionally the bootstrap for one configuration.
//! [`LpProblem::estimate_imputed`] repeats the fit for every imputation replicate
//! and pools the results with Rubin's rules.

use log::{debug, info};
use nalgebra::DVector;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::aggregate::{aggregate, StratificationKey};
use crate::bootstrap::{bootstrap, BootstrapDistribution};
use crate::data::CrashTables;
use crate::error::{LpError, Result};
use crate::imputation::{pool, PooledResult, ReplicateEstimate};
use crate::options::EstimationOptions;
use crate::sample::{AnalyticSample, SampleBuilder, SampleSummary};
use crate::solving::{estimate_labels, fit, FitResult};

/// Estimation problem over one set of canonical crash tables.
#[derive(Clone, Debug)]
pub struct LpProblem {
    tables: CrashTables,
}

impl LpProblem {
    pub fn new(tables: CrashTables) -> Self {
        Self { tables }
    }

    /// Accessor for the canonical tables.
    pub fn tables(&self) -> &CrashTables {
        &self.tables
    }

    /// Builds the analytic sample classified with reported test results.
    pub fn analytic_sample(&self, options: &EstimationOptions) -> Result<AnalyticSample> {
        options.validate()?;
        SampleBuilder::new(&self.tables, &options.sample).build()
    }

    /// Fits one configuration on reported test results.
    pub fn estimate(&self, options: &EstimationOptions) -> Result<EstimationResult> {
        let sample = self.analytic_sample(options)?;
        estimate_sample(&sample, options, None)
    }

    /// Fits every imputation replicate and pools them.
    ///
    /// Each replicate is bootstrapped; pooling needs a within-replicate variance
    /// for every estimate, so bootstrap options are required.
    pub fn estimate_imputed(&self, options: &EstimationOptions) -> Result<ImputedEstimationResult> {
        options.validate()?;
        if options.bootstrap.is_none() {
            return Err(LpError::configuration(
                "bootstrap",
                "imputed estimation pools bootstrap variances and needs bootstrap options",
            ));
        }
        let replicates = options.imputation.replicates;
        let sample = SampleBuilder::new(&self.tables, &options.sample)
            .imputations(replicates)
            .build()?;

        let run = |mi: usize| estimate_sample(&sample, options, Some(mi));
        let results: Vec<Result<EstimationResult>> = if options.imputation.parallel {
            (0..replicates).into_par_iter().map(run).collect()
        } else {
            (0..replicates).map(run).collect()
        };
        let results = results.into_iter().collect::<Result<Vec<_>>>()?;

        let estimates: Vec<ReplicateEstimate> = results
            .iter()
            .map(EstimationResult::replicate_estimate)
            .collect::<Result<_>>()?;
        let pooled = pool(&estimates, options.imputation.dof)?;
        info!(
            "pooled estimates over {replicates} imputations: {}",
            describe(&results[0].labels, &pooled.estimates)
        );

        Ok(ImputedEstimationResult {
            labels: estimate_labels(options.num_types()),
            stratification: options.stratification.clone(),
            pooled,
            replicates: results,
            summary: sample.summary().clone(),
        })
    }
}

/// Fits one classification replicate of an analytic sample.
pub fn estimate_sample(
    sample: &AnalyticSample,
    options: &EstimationOptions,
    mi_index: Option<usize>,
) -> Result<EstimationResult> {
    let key = &options.stratification;
    let (fit, bootstrap) = match &options.bootstrap {
        Some(bootstrap_options) => {
            let distribution = bootstrap(sample, key, mi_index, &options.fit, bootstrap_options)?;
            (distribution.point.clone(), Some(distribution))
        }
        None => {
            let replicate = mi_index.unwrap_or(0);
            let matrix = aggregate(sample, key, replicate)?;
            debug!(
                "estimation matrix for {key}: {} strata, columns {:?}",
                matrix.rows(),
                matrix.column_names()
            );
            let fitted = fit(&matrix, &options.fit).map_err(|err| err.in_replicate(mi_index, None))?;
            (fitted, None)
        }
    };

    let labels = estimate_labels(sample.num_types());
    info!(
        "fitted {key} ({}): {}, log-likelihood {:.4}, df {}",
        mi_index.map_or_else(|| "reported".to_string(), |mi| format!("imputation {mi}")),
        describe(&labels, &fit.estimates()),
        fit.log_likelihood,
        fit.df_resid
    );
    Ok(EstimationResult {
        labels,
        stratification: key.clone(),
        mi_index,
        fit,
        bootstrap,
        summary: sample.summary().clone(),
    })
}

fn describe(labels: &[String], values: &DVector<f64>) -> String {
    labels
        .iter()
        .zip(values.iter())
        .map(|(label, value)| format!("{label}={value:.4}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Result of fitting one configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    /// Names of [`EstimationResult::estimates`], `theta_2 .. P_K`.
    pub labels: Vec<String>,
    pub stratification: StratificationKey,
    /// Imputation replicate, `None` for reported test results.
    pub mi_index: Option<usize>,
    pub fit: FitResult,
    pub bootstrap: Option<BootstrapDistribution>,
    pub summary: SampleSummary,
}

impl EstimationResult {
    pub fn estimates(&self) -> DVector<f64> {
        self.fit.estimates()
    }

    /// Bootstrap standard errors for every estimate, when bootstrapped.
    pub fn standard_errors(&self) -> Option<DVector<f64>> {
        self.bootstrap
            .as_ref()
            .map(BootstrapDistribution::standard_errors)
    }

    /// This replicate's contribution to Rubin pooling.
    pub fn replicate_estimate(&self) -> Result<ReplicateEstimate> {
        let distribution = self.bootstrap.as_ref().ok_or_else(|| {
            LpError::configuration("bootstrap", "pooling needs bootstrap variances")
        })?;
        Ok(ReplicateEstimate {
            estimates: self.estimates(),
            variances: distribution.variances(),
            log_likelihood: self.fit.log_likelihood,
            df_resid: self.fit.df_resid,
        })
    }
}

/// Result of pooling imputation replicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImputedEstimationResult {
    pub labels: Vec<String>,
    pub stratification: StratificationKey,
    pub pooled: PooledResult,
    /// Per-replicate results in imputation order.
    pub replicates: Vec<EstimationResult>,
    pub summary: SampleSummary,
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::aggregate::StratumField;
    use crate::classify::{ClassificationRule, DrinkingDefinition};
    use crate::data::{CrashRecord, CrashTablesBuilder, PersonRecord, PoliceJudgment, VehicleRecord};
    use crate::options::{BootstrapOptions, FitOptions, ImputationOptions, SampleOptions};

    use PoliceJudgment::{Drinking, NotDrinking};

    /// Tables holding one crash per entry of `crashes`, each a list of judgments.
    fn tables(crashes: &[(i32, &[PoliceJudgment])]) -> CrashTables {
        let mut records = Vec::new();
        let mut vehicles = Vec::new();
        let mut persons = Vec::new();
        for (index, (year, judgments)) in crashes.iter().enumerate() {
            let crash = CrashRecord::new(*year, index as u32 + 1)
                .with_state(6)
                .with_time(7, 23);
            for (position, &judgment) in judgments.iter().enumerate() {
                let vehicle_no = position as u16 + 1;
                vehicles.push(VehicleRecord::new(crash.key, vehicle_no, judgment == Drinking));
                persons.push(
                    PersonRecord::driver(crash.key, vehicle_no, 1).with_police_judgment(judgment),
                );
            }
            records.push(crash);
        }
        CrashTablesBuilder::new(records)
            .vehicles(vehicles)
            .persons(persons)
            .build()
            .unwrap()
    }

    fn toy_crashes(year: i32) -> Vec<(i32, &'static [PoliceJudgment])> {
        let mut crashes: Vec<(i32, &'static [PoliceJudgment])> = Vec::new();
        crashes.extend(std::iter::repeat((year, &[NotDrinking][..])).take(10));
        crashes.extend(std::iter::repeat((year, &[Drinking][..])).take(5));
        crashes.extend(std::iter::repeat((year, &[NotDrinking, NotDrinking][..])).take(20));
        crashes.extend(std::iter::repeat((year, &[NotDrinking, Drinking][..])).take(10));
        crashes.extend(std::iter::repeat((year, &[Drinking, Drinking][..])).take(5));
        crashes
    }

    fn police_options() -> EstimationOptions {
        EstimationOptions::default().with_sample(
            SampleOptions::default()
                .with_years(1990, 1991)
                .with_classification(ClassificationRule::new(
                    DrinkingDefinition::PoliceReportOnly,
                    0.0,
                )),
        )
    }

    #[test]
    fn estimate_matches_direct_fit_on_toy_counts() {
        let problem = LpProblem::new(tables(&toy_crashes(1990)));
        let result = problem.estimate(&police_options()).unwrap();

        assert_eq!(result.labels, vec!["theta_2", "lambda_2", "N_2", "P_2"]);
        assert!(result.bootstrap.is_none());
        assert!(result.standard_errors().is_none());
        assert_eq!(result.fit.strata, 1);
        assert_eq!(result.summary.one_vehicle_crashes, 15);
        assert_eq!(result.summary.two_vehicle_crashes, 35);
        assert_relative_eq!(result.fit.params.thetas()[0], 1.0, epsilon = 1e-3);
        assert_relative_eq!(result.fit.params.lambdas()[0], 1.25, epsilon = 1e-3);
        assert!(result.fit.classical_standard_errors().is_some());
    }

    #[test]
    fn stratified_estimate_drops_unidentified_years() {
        let mut crashes = toy_crashes(1990);
        // 1991 has no type-2 one-vehicle crash and cannot be identified.
        crashes.extend(std::iter::repeat((1991, &[NotDrinking][..])).take(4));
        crashes.extend(std::iter::repeat((1991, &[Drinking, Drinking][..])).take(3));
        let problem = LpProblem::new(tables(&crashes));
        let options = police_options().with_stratification(StratificationKey::by([StratumField::Year]));
        let result = problem.estimate(&options).unwrap();
        assert_eq!(result.fit.strata, 1);
        assert_relative_eq!(result.fit.params.lambdas()[0], 1.25, epsilon = 1e-3);
    }

    #[test]
    fn empty_sample_is_degenerate() {
        let problem = LpProblem::new(tables(&toy_crashes(1985)));
        let err = problem.estimate(&police_options()).unwrap_err();
        assert!(matches!(err, LpError::DegenerateSample { .. }));
        assert_eq!(err.context().map(|c| c.mi_replicate), Some(None));
    }

    #[test]
    fn bootstrap_attaches_standard_errors() {
        let problem = LpProblem::new(tables(&toy_crashes(1990)));
        let options = police_options()
            .with_fit(FitOptions::default().with_hessian(false))
            .with_bootstrap(
                BootstrapOptions::default()
                    .with_replicates(8)
                    .with_failure_policy(crate::options::FailurePolicy::Exclude {
                        max_failures: 8,
                    }),
            );
        let result = problem.estimate(&options).unwrap();
        let errors = result.standard_errors().unwrap();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().all(|se| se.is_finite() && *se >= 0.0));
        assert_eq!(result.fit, result.bootstrap.as_ref().unwrap().point);
    }

    #[test]
    fn imputed_estimation_requires_bootstrap() {
        let problem = LpProblem::new(tables(&toy_crashes(1990)));
        let options = police_options().with_imputation(ImputationOptions::default().with_replicates(1));
        let err = problem.estimate_imputed(&options).unwrap_err();
        assert!(matches!(err, LpError::Configuration { field: "bootstrap", .. }));
    }
}
