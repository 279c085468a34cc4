use approx::assert_relative_eq;
use lprs::aggregate::{aggregate, StratificationKey, StratumField};
use lprs::classify::{ClassificationRule, DrinkingDefinition};
use lprs::data::{
    CaseKey, CrashRecord, CrashTables, CrashTablesBuilder, PersonRecord, PoliceJudgment,
    VehicleRecord,
};
use lprs::likelihood::pair_probabilities;
use lprs::options::{
    BootstrapOptions, DofConvention, FailurePolicy, FitOptions, ImputationOptions, SampleOptions,
};
use lprs::sample::SampleStep;
use lprs::{EstimationOptions, LpError, LpProblem};

use PoliceJudgment::{Drinking, NotDrinking};

/// Accumulates synthetic crashes with one driver per vehicle.
#[derive(Default)]
struct Tables {
    crashes: Vec<CrashRecord>,
    vehicles: Vec<VehicleRecord>,
    persons: Vec<PersonRecord>,
}

impl Tables {
    fn add(&mut self, year: i32, state: u16, judgments: &[PoliceJudgment]) -> CaseKey {
        let crash = CrashRecord::new(year, self.crashes.len() as u32 + 1)
            .with_state(state)
            .with_time(7, 23)
            .with_vehicle_count(judgments.len() as u16);
        for (position, &judgment) in judgments.iter().enumerate() {
            let vehicle_no = position as u16 + 1;
            self.vehicles
                .push(VehicleRecord::new(crash.key, vehicle_no, judgment == Drinking));
            self.persons
                .push(PersonRecord::driver(crash.key, vehicle_no, 1).with_police_judgment(judgment));
        }
        let key = crash.key;
        self.crashes.push(crash);
        key
    }

    fn repeat(&mut self, count: usize, year: i32, state: u16, judgments: &[PoliceJudgment]) {
        for _ in 0..count {
            self.add(year, state, judgments);
        }
    }

    /// Adds `one` one-vehicle and `two` two-vehicle tallies for a single stratum.
    fn tallies(&mut self, year: i32, state: u16, one: [usize; 2], two: [usize; 3]) {
        self.repeat(one[0], year, state, &[NotDrinking]);
        self.repeat(one[1], year, state, &[Drinking]);
        self.repeat(two[0], year, state, &[NotDrinking, NotDrinking]);
        self.repeat(two[1], year, state, &[NotDrinking, Drinking]);
        self.repeat(two[2], year, state, &[Drinking, Drinking]);
    }

    fn build(self) -> CrashTables {
        CrashTablesBuilder::new(self.crashes)
            .vehicles(self.vehicles)
            .persons(self.persons)
            .build()
            .expect("synthetic tables are consistent")
    }
}

fn police_options() -> EstimationOptions {
    EstimationOptions::default().with_sample(
        SampleOptions::default()
            .with_years(1990, 1992)
            .with_classification(ClassificationRule::new(
                DrinkingDefinition::PoliceReportOnly,
                0.0,
            )),
    )
}

#[test]
fn toy_sample_converges_to_a_unique_pair() {
    let mut tables = Tables::default();
    tables.tallies(1990, 6, [10, 5], [20, 10, 5]);
    let problem = LpProblem::new(tables.build());

    let from_twenty = problem.estimate(&police_options()).unwrap();
    let from_five = problem
        .estimate(&police_options().with_fit(FitOptions::default().with_initial_relative_risk(5.0)))
        .unwrap();

    assert_eq!(from_twenty.fit.strata, 1);
    assert_relative_eq!(
        from_twenty.fit.params.thetas()[0],
        from_five.fit.params.thetas()[0],
        epsilon = 1e-3
    );
    assert_relative_eq!(
        from_twenty.fit.params.lambdas()[0],
        from_five.fit.params.lambdas()[0],
        epsilon = 1e-3
    );
    assert_relative_eq!(from_twenty.fit.params.lambdas()[0], 1.25, epsilon = 1e-3);
}

#[test]
fn fitted_probabilities_reproduce_consistent_counts() {
    let mut tables = Tables::default();
    tables.tallies(1990, 6, [10, 10], [20, 30, 10]);
    let problem = LpProblem::new(tables.build());
    let options = police_options();

    let result = problem.estimate(&options).unwrap();
    let sample = problem.analytic_sample(&options).unwrap();
    let matrix = aggregate(&sample, &options.stratification, 0).unwrap();
    let p = pair_probabilities(&matrix, &result.fit.params).unwrap();
    assert_relative_eq!(p[(0, 0)], 1.0 / 3.0, epsilon = 1e-3);
    assert_relative_eq!(p[(0, 1)], 1.0 / 2.0, epsilon = 1e-3);
    assert_relative_eq!(p[(0, 2)], 1.0 / 6.0, epsilon = 1e-3);
}

#[test]
fn stratum_without_type_one_singles_is_absent() {
    let mut tables = Tables::default();
    tables.tallies(1990, 6, [10, 5], [20, 10, 5]);
    tables.tallies(1991, 6, [0, 4], [12, 6, 3]);
    let problem = LpProblem::new(tables.build());
    let options = police_options().with_stratification(StratificationKey::by([StratumField::Year]));

    let sample = problem.analytic_sample(&options).unwrap();
    let matrix = aggregate(&sample, &options.stratification, 0).unwrap();
    assert_eq!(matrix.strata().to_vec(), vec![vec![1990i64]]);
    assert_eq!(matrix.two_vehicle().row(0).iter().copied().collect::<Vec<_>>(), vec![20, 10, 5]);

    let result = problem.estimate(&options).unwrap();
    assert_eq!(result.fit.strata, 1);
}

#[test]
fn missingness_threshold_bounds_cell_exclusion() {
    let mut tables = Tables::default();
    tables.tallies(1990, 6, [10, 5], [20, 10, 5]);
    tables.tallies(1990, 7, [10, 5], [20, 10, 5]);
    let flagged = tables.add(1990, 6, &[NotDrinking]);
    for person in tables.persons.iter_mut().filter(|p| p.key == flagged) {
        person.sex = None;
    }
    let problem = LpProblem::new(tables.build());

    let with_threshold = |threshold: f64| {
        let mut options = police_options();
        options.sample = options.sample.with_missing_threshold(threshold);
        problem.analytic_sample(&options).unwrap()
    };

    let strict = with_threshold(0.0);
    assert_eq!(strict.summary().count_after(SampleStep::StateYearMissingness), Some(50));
    assert_eq!(strict.len(), 50);
    assert!(strict.crashes().iter().all(|crash| crash.state == 7));

    let lenient = with_threshold(1.0);
    assert_eq!(lenient.summary().count_after(SampleStep::StateYearMissingness), Some(101));
    assert_eq!(lenient.len(), 100);
    assert_eq!(lenient.summary().dropped_cells, 0);
}

#[test]
fn bootstrap_is_reproducible_end_to_end() {
    let mut tables = Tables::default();
    tables.tallies(1990, 6, [60, 30], [80, 45, 15]);
    let problem = LpProblem::new(tables.build());
    let with_seed = |seed: u64| {
        police_options()
            .with_fit(FitOptions::default().with_hessian(false))
            .with_bootstrap(BootstrapOptions::default().with_replicates(10).with_seed(seed))
    };

    let first = problem.estimate(&with_seed(42)).unwrap();
    let second = problem.estimate(&with_seed(42)).unwrap();
    let other = problem.estimate(&with_seed(43)).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.fit, other.fit);
    assert_ne!(first.standard_errors(), other.standard_errors());
    assert!(first
        .standard_errors()
        .unwrap()
        .iter()
        .all(|se| se.is_finite() && *se > 0.0));
}

#[test]
fn imputed_estimates_pool_across_replicates() {
    let mut tables = Tables::default();
    tables.tallies(1990, 6, [30, 15], [60, 30, 15]);
    let replicates = 3;
    let mut seen = 0usize;
    let mut previous = None;
    for person in tables.persons.iter_mut() {
        if previous != Some(person.key) {
            seen += 1;
            previous = Some(person.key);
        }
        let drinking = person.police_judgment == Some(Drinking);
        // Each replicate reclassifies a different seventh of the crashes.
        person.imputed_bac = (0..replicates)
            .map(|r| {
                let flipped = seen % 7 == r;
                if drinking != flipped {
                    12.0
                } else {
                    0.0
                }
            })
            .collect();
    }
    let tables = CrashTablesBuilder::new(tables.crashes)
        .vehicles(tables.vehicles)
        .persons(tables.persons)
        .imputation_replicates(replicates)
        .build()
        .unwrap();
    let problem = LpProblem::new(tables);

    let mut options = police_options()
        .with_fit(FitOptions::default().with_hessian(false))
        .with_imputation(
            ImputationOptions::default()
                .with_replicates(replicates)
                .with_dof(DofConvention::Mean),
        )
        .with_bootstrap(
            BootstrapOptions::default()
                .with_replicates(6)
                .with_failure_policy(FailurePolicy::Exclude { max_failures: 6 }),
        );
    options.sample = options.sample.with_classification(ClassificationRule::new(
        DrinkingDefinition::BacTestOnly,
        0.08,
    ));

    let result = problem.estimate_imputed(&options).unwrap();
    assert_eq!(result.pooled.replicates, replicates);
    assert_eq!(result.replicates.len(), replicates);
    assert_eq!(
        result.replicates.iter().map(|r| r.mi_index).collect::<Vec<_>>(),
        vec![Some(0), Some(1), Some(2)]
    );
    assert_ne!(result.replicates[0].fit, result.replicates[1].fit);

    let mean_theta = result
        .replicates
        .iter()
        .map(|r| r.estimates()[0])
        .sum::<f64>()
        / replicates as f64;
    assert_relative_eq!(result.pooled.estimates[0], mean_theta, epsilon = 1e-12);
    let mean_within = result
        .replicates
        .iter()
        .map(|r| r.bootstrap.as_ref().unwrap().variances()[0])
        .sum::<f64>()
        / replicates as f64;
    assert!(result.pooled.variances[0] >= mean_within);
    // One pooled stratum and two free parameters in every replicate.
    assert_eq!(result.pooled.df_resid, -1.0);
    assert_eq!(result.labels, vec!["theta_2", "lambda_2", "N_2", "P_2"]);
}

#[test]
fn invalid_configuration_fails_before_touching_data() {
    let problem = LpProblem::new(Tables::default().build());
    let mut options = police_options();
    options.sample = options.sample.with_years(1995, 1990);
    assert!(matches!(
        problem.estimate(&options),
        Err(LpError::Configuration { .. })
    ));
}
