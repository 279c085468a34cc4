//! Maximum-likelihood fitting of relative risks for one estimation matrix.
//!
//! The negative log-likelihood is minimized with argmin's Nelder–Mead simplex over
//! `ln θ` and `ln λ`, which keeps every relative risk positive without box
//! constraints.

use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::neldermead::NelderMead;
use finitediff::FiniteDiff;
use log::{debug, warn};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::aggregate::EstimationMatrix;
use crate::error::{LpError, ReplicateContext, Result};
use crate::likelihood::{neg_log_likelihood, road_proportions, ParameterVector};
use crate::options::FitOptions;

/// Offset of each extra simplex vertex from the start, in log units.
const SIMPLEX_STEP: f64 = 0.5;
/// Coordinate scale applied before finite differencing the Hessian.
const HESSIAN_STEP_SCALE: f64 = 1e4;

/// Estimates and diagnostics from one fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    pub params: ParameterVector,
    /// Road prevalence `N_2..N_K` relative to type 1.
    pub prevalence: DVector<f64>,
    /// Road proportions `P_2..P_K`.
    pub proportions: DVector<f64>,
    /// Joint log-likelihood at `params`.
    pub log_likelihood: f64,
    /// Strata minus free parameters; negative when over-parameterized.
    pub df_resid: i64,
    /// Strata in the fitted matrix.
    pub strata: usize,
    /// Simplex iterations, summed over sub-fits in pairwise mode.
    pub iterations: u64,
    /// Inverse finite-difference Hessian of `(θ_2..θ_K, λ_2..λ_K)`.
    pub covariance: Option<DMatrix<f64>>,
}

impl FitResult {
    pub fn num_types(&self) -> usize {
        self.params.num_types()
    }

    /// Flattened `[θ_2..θ_K, λ_2..λ_K, N_2..N_K, P_2..P_K]`.
    pub fn estimates(&self) -> DVector<f64> {
        let blocks = [
            self.params.thetas(),
            self.params.lambdas(),
            &self.prevalence,
            &self.proportions,
        ];
        DVector::from_iterator(
            blocks.iter().map(|block| block.len()).sum(),
            blocks.iter().flat_map(|block| block.iter().copied()),
        )
    }

    /// Classical standard errors of `(θ, λ)` from the covariance, when available.
    pub fn classical_standard_errors(&self) -> Option<DVector<f64>> {
        self.covariance
            .as_ref()
            .map(|covariance| covariance.diagonal().map(f64::sqrt))
    }
}

/// Labels for [`FitResult::estimates`]: `theta_2 .. P_K`.
pub fn estimate_labels(num_types: usize) -> Vec<String> {
    ["theta", "lambda", "N", "P"]
        .iter()
        .flat_map(|name| (2..=num_types).map(move |t| format!("{name}_{t}")))
        .collect()
}

/// Exposes the negative log-likelihood in log-parameter space to argmin.
struct LogSpaceCost<'a> {
    matrix: &'a EstimationMatrix,
}

impl CostFunction for LogSpaceCost<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(
        &self,
        log_params: &Self::Param,
    ) -> std::result::Result<Self::Output, argmin::core::Error> {
        // Points where the model is undefined are simply worse than any valid point.
        let cost = ParameterVector::from_log(log_params)
            .and_then(|params| neg_log_likelihood(self.matrix, &params))
            .ok()
            .filter(|cost| cost.is_finite());
        Ok(cost.unwrap_or(f64::INFINITY))
    }
}

fn optimizer_error(err: argmin::core::Error) -> LpError {
    LpError::Optimizer {
        message: err.to_string(),
    }
}

/// Fits from the configured uniform starting value.
pub fn fit(matrix: &EstimationMatrix, options: &FitOptions) -> Result<FitResult> {
    let start = ParameterVector::uniform(matrix.num_types(), options.initial_relative_risk)?;
    fit_from(matrix, options, &start)
}

/// Fits from an explicit starting point.
///
/// Fails with [`LpError::DegenerateSample`] when the matrix has no strata and with
/// [`LpError::Convergence`] when the simplex does not meet its tolerance in time.
pub fn fit_from(
    matrix: &EstimationMatrix,
    options: &FitOptions,
    start: &ParameterVector,
) -> Result<FitResult> {
    if matrix.is_empty() {
        return Err(LpError::degenerate(
            "no strata survived the identification guard",
        ));
    }
    if start.num_types() != matrix.num_types() {
        return Err(LpError::dimension_mismatch(
            "driver types in start values",
            matrix.num_types(),
            start.num_types(),
        ));
    }
    let k = matrix.num_types();

    let (params, iterations, covariance) = if options.pairwise && k > 2 {
        fit_pairwise(matrix, options, start)?
    } else {
        let (params, iterations) = minimize(matrix, options, start)?;
        let covariance = if options.compute_hessian {
            inverse_hessian(matrix, &params)?
        } else {
            None
        };
        (params, iterations, covariance)
    };

    let prevalence = params.prevalence(matrix)?;
    let proportions = road_proportions(&prevalence);
    let log_likelihood = -neg_log_likelihood(matrix, &params)?;
    let free = 2 * (k - 1);
    let result = FitResult {
        params,
        prevalence,
        proportions,
        log_likelihood,
        df_resid: matrix.rows() as i64 - free as i64,
        strata: matrix.rows(),
        iterations,
        covariance,
    };
    debug!(
        "fit {} strata in {} iterations: theta {:?}, lambda {:?}, llf {:.6}",
        result.strata,
        result.iterations,
        result.params.thetas().as_slice(),
        result.params.lambdas().as_slice(),
        result.log_likelihood
    );
    Ok(result)
}

/// Fits each non-base type against the base type on its own two-type table.
fn fit_pairwise(
    matrix: &EstimationMatrix,
    options: &FitOptions,
    start: &ParameterVector,
) -> Result<(ParameterVector, u64, Option<DMatrix<f64>>)> {
    let k = matrix.num_types();
    let free = k - 1;
    let mut thetas = DVector::zeros(free);
    let mut lambdas = DVector::zeros(free);
    let mut covariance: Option<DMatrix<f64>> = options
        .compute_hessian
        .then(|| DMatrix::zeros(2 * free, 2 * free));
    let mut iterations = 0;

    for other in 1..k {
        let pair = matrix.restrict_to_pair(other)?;
        let pair_start = ParameterVector::new(
            DVector::from_element(1, start.thetas()[other - 1]),
            DVector::from_element(1, start.lambdas()[other - 1]),
        )?;
        let (pair_params, pair_iterations) = minimize(&pair, options, &pair_start)?;
        iterations += pair_iterations;
        thetas[other - 1] = pair_params.thetas()[0];
        lambdas[other - 1] = pair_params.lambdas()[0];

        if options.compute_hessian {
            covariance = match (covariance.take(), inverse_hessian(&pair, &pair_params)?) {
                (Some(mut block), Some(pair_cov)) => {
                    let (t, l) = (other - 1, free + other - 1);
                    block[(t, t)] = pair_cov[(0, 0)];
                    block[(t, l)] = pair_cov[(0, 1)];
                    block[(l, t)] = pair_cov[(1, 0)];
                    block[(l, l)] = pair_cov[(1, 1)];
                    Some(block)
                }
                _ => None,
            };
        }
    }

    Ok((ParameterVector::new(thetas, lambdas)?, iterations, covariance))
}

fn minimize(
    matrix: &EstimationMatrix,
    options: &FitOptions,
    start: &ParameterVector,
) -> Result<(ParameterVector, u64)> {
    let problem = LogSpaceCost { matrix };
    let x0 = start.to_log();
    let cost0 = problem.cost(&x0).map_err(optimizer_error)?;
    if !cost0.is_finite() {
        return Err(LpError::NumericalError {
            context: "likelihood at starting values",
        });
    }

    let mut simplex = Vec::with_capacity(x0.len() + 1);
    simplex.push(x0.clone());
    for coordinate in 0..x0.len() {
        let mut vertex = x0.clone();
        vertex[coordinate] -= SIMPLEX_STEP;
        simplex.push(vertex);
    }

    let tolerance = options.tolerance * cost0.abs().max(1.0);
    let solver = NelderMead::new(simplex)
        .with_sd_tolerance(tolerance)
        .map_err(optimizer_error)?;
    let result = Executor::new(problem, solver)
        .configure(|state| state.max_iters(options.max_iterations))
        .run()
        .map_err(optimizer_error)?;

    let state = result.state();
    let iterations = state.get_iter();
    let converged = matches!(
        state.get_termination_status(),
        TerminationStatus::Terminated(TerminationReason::SolverConverged)
    );
    if !converged {
        return Err(LpError::Convergence {
            iterations,
            best_cost: state.get_best_cost(),
            context: ReplicateContext {
                strata: matrix.rows(),
                ..ReplicateContext::default()
            },
        });
    }
    let best = state.get_best_param().ok_or_else(|| LpError::Optimizer {
        message: "solver finished without a best parameter".to_string(),
    })?;
    Ok((ParameterVector::from_log(best)?, iterations))
}

/// Central finite-difference Hessian of the negative log-likelihood in `(θ, λ)`.
///
/// The differences run on coordinates scaled by each parameter, so finitediff's
/// fixed step becomes a relative step of about `HESSIAN_STEP_SCALE * sqrt(ε)`.
pub fn hessian(matrix: &EstimationMatrix, params: &ParameterVector) -> Result<DMatrix<f64>> {
    let free = params.thetas().len();
    let scales: Vec<f64> = params
        .thetas()
        .iter()
        .chain(params.lambdas().iter())
        .map(|value| value * HESSIAN_STEP_SCALE)
        .collect();
    let n = scales.len();

    let cost = |scaled: &Vec<f64>| -> f64 {
        let point: Vec<f64> = scaled.iter().zip(&scales).map(|(y, s)| y * s).collect();
        ParameterVector::new(
            DVector::from_row_slice(&point[..free]),
            DVector::from_row_slice(&point[free..]),
        )
        .and_then(|shifted| neg_log_likelihood(matrix, &shifted))
        .unwrap_or(f64::NAN)
    };
    let gradient = |scaled: &Vec<f64>| scaled.central_diff(&cost);
    let origin = vec![1.0 / HESSIAN_STEP_SCALE; n];
    let scaled = origin.central_hessian(&gradient);

    let hessian = DMatrix::from_fn(n, n, |i, j| {
        0.5 * (scaled[i][j] + scaled[j][i]) / (scales[i] * scales[j])
    });
    if hessian.iter().any(|value| !value.is_finite()) {
        return Err(LpError::NumericalError {
            context: "finite-difference Hessian",
        });
    }
    Ok(hessian)
}

/// Inverse Hessian, or `None` when the Hessian is not positive definite.
fn inverse_hessian(
    matrix: &EstimationMatrix,
    params: &ParameterVector,
) -> Result<Option<DMatrix<f64>>> {
    let hessian = hessian(matrix, params)?;
    match nalgebra::linalg::Cholesky::new(hessian) {
        Some(cholesky) => Ok(Some(cholesky.inverse())),
        None => {
            warn!("Hessian is not positive definite at the optimum; no classical covariance");
            Ok(None)
        }
    }
}
