//! The Levitt–Porter multinomial likelihood for two-vehicle crash counts.
//!
//! Within each stratum the relative prevalence of type `i` is read off the
//! one-vehicle counts, `N_i = (a_i / a_1) / λ_i`, and two-vehicle crashes of the
//! unordered type pair `{i, j}` occur with probability
//! `p_ij = N_i N_j (θ_i + θ_j) / D`, doubled for `i ≠ j`, where
//! `D = Σ_i Σ_j N_i N_j (θ_i + θ_j)`. Type 1 is the reference with `θ_1 = λ_1 = 1`.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::aggregate::{pair_count, pair_index, EstimationMatrix};
use crate::error::{LpError, Result};

/// `ln(n!)` summed exactly over the integers `2..=n`.
pub fn ln_factorial(n: u64) -> f64 {
    (2..=n).map(|i| (i as f64).ln()).sum()
}

/// Relative risks `(θ_2..θ_K, λ_2..λ_K)` of each non-base type against type 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterVector {
    thetas: DVector<f64>,
    lambdas: DVector<f64>,
}

impl ParameterVector {
    /// Creates a parameter vector, rejecting mismatched lengths and non-positive risks.
    pub fn new(thetas: DVector<f64>, lambdas: DVector<f64>) -> Result<Self> {
        if thetas.is_empty() {
            return Err(LpError::configuration(
                "thetas",
                "at least one non-base type is required",
            ));
        }
        if thetas.len() != lambdas.len() {
            return Err(LpError::dimension_mismatch(
                "lambda length",
                thetas.len(),
                lambdas.len(),
            ));
        }
        if thetas
            .iter()
            .chain(lambdas.iter())
            .any(|value| !(value.is_finite() && *value > 0.0))
        {
            return Err(LpError::NumericalError {
                context: "relative risk domain",
            });
        }
        Ok(Self { thetas, lambdas })
    }

    /// Every free θ and λ set to `value`.
    pub fn uniform(num_types: usize, value: f64) -> Result<Self> {
        let free = num_types.saturating_sub(1);
        Self::new(
            DVector::from_element(free, value),
            DVector::from_element(free, value),
        )
    }

    /// Inverse of [`ParameterVector::to_log`]: `[ln θ.., ln λ..]`.
    pub fn from_log(values: &[f64]) -> Result<Self> {
        if values.is_empty() || values.len() % 2 != 0 {
            return Err(LpError::dimension_mismatch(
                "log parameter length (even)",
                values.len() + values.len() % 2,
                values.len(),
            ));
        }
        let free = values.len() / 2;
        Self::new(
            DVector::from_iterator(free, values[..free].iter().map(|v| v.exp())),
            DVector::from_iterator(free, values[free..].iter().map(|v| v.exp())),
        )
    }

    /// Flattened log parameters, thetas first.
    pub fn to_log(&self) -> Vec<f64> {
        self.thetas
            .iter()
            .chain(self.lambdas.iter())
            .map(|value| value.ln())
            .collect()
    }

    pub fn num_types(&self) -> usize {
        self.thetas.len() + 1
    }

    pub fn thetas(&self) -> &DVector<f64> {
        &self.thetas
    }

    pub fn lambdas(&self) -> &DVector<f64> {
        &self.lambdas
    }

    /// θ for all K types, with the base type's 1 prepended.
    pub fn full_thetas(&self) -> DVector<f64> {
        prepend_one(&self.thetas)
    }

    /// λ for all K types, with the base type's 1 prepended.
    pub fn full_lambdas(&self) -> DVector<f64> {
        prepend_one(&self.lambdas)
    }

    /// Road prevalence `N_2..N_K` relative to type 1, from one-vehicle totals across strata.
    pub fn prevalence(&self, matrix: &EstimationMatrix) -> Result<DVector<f64>> {
        check_types(matrix, self)?;
        let totals = matrix.one_vehicle_totals();
        let base = totals[0] as f64;
        if base == 0.0 {
            return Err(LpError::degenerate("no one-vehicle crashes of the base type"));
        }
        Ok(DVector::from_iterator(
            self.lambdas.len(),
            self.lambdas
                .iter()
                .zip(&totals[1..])
                .map(|(lambda, &total)| (total as f64 / base) / lambda),
        ))
    }
}

/// Share of drivers of each non-base type on the road, `P_i = N_i / (1 + Σ N)`.
pub fn road_proportions(prevalence: &DVector<f64>) -> DVector<f64> {
    let denominator = 1.0 + prevalence.sum();
    prevalence / denominator
}

fn prepend_one(values: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(
        values.len() + 1,
        std::iter::once(1.0).chain(values.iter().copied()),
    )
}

fn check_types(matrix: &EstimationMatrix, params: &ParameterVector) -> Result<()> {
    if params.num_types() != matrix.num_types() {
        return Err(LpError::dimension_mismatch(
            "driver types in parameters",
            matrix.num_types(),
            params.num_types(),
        ));
    }
    Ok(())
}

/// Stratum-level prevalence `N`, rows × K, with the base column equal to one.
fn stratum_prevalence(matrix: &EstimationMatrix, lambdas: &DVector<f64>) -> DMatrix<f64> {
    let one = matrix.one_vehicle().map(|count| count as f64);
    let base = one.column(0).into_owned();
    let mut prevalence = one;
    for (type_index, lambda) in lambdas.iter().enumerate() {
        let mut column = prevalence.column_mut(type_index);
        column.component_div_assign(&base);
        column /= *lambda;
    }
    prevalence
}

/// Two-vehicle pair probabilities, rows × K(K+1)/2, in [`pair_index`] column order.
pub fn pair_probabilities(
    matrix: &EstimationMatrix,
    params: &ParameterVector,
) -> Result<DMatrix<f64>> {
    check_types(matrix, params)?;
    let k = matrix.num_types();
    let thetas = params.full_thetas();
    let prevalence = stratum_prevalence(matrix, &params.full_lambdas());

    // Σ_i Σ_j N_i N_j (θ_i + θ_j) = 2 (Σ_i N_i θ_i)(Σ_j N_j)
    let weighted = &prevalence * &thetas;
    let totals = prevalence.column_sum();
    let denominator = weighted.component_mul(&totals) * 2.0;

    let mut probabilities = DMatrix::zeros(matrix.rows(), pair_count(k));
    for i in 0..k {
        for j in i..k {
            let multiplicity = if i == j { 1.0 } else { 2.0 };
            let mut column = prevalence
                .column(i)
                .component_mul(&prevalence.column(j))
                * (multiplicity * (thetas[i] + thetas[j]));
            column.component_div_assign(&denominator);
            probabilities.set_column(pair_index(i, j, k), &column);
        }
    }

    if probabilities.iter().any(|p| !p.is_finite()) {
        return Err(LpError::NumericalError {
            context: "pair probabilities",
        });
    }
    Ok(probabilities)
}

/// Per-stratum multinomial log-likelihood of the two-vehicle counts.
pub fn row_log_likelihoods(
    matrix: &EstimationMatrix,
    params: &ParameterVector,
) -> Result<DVector<f64>> {
    let probabilities = pair_probabilities(matrix, params)?;
    let counts = matrix.two_vehicle().map(|count| count as f64);
    let log_terms = counts.zip_map(&probabilities, |count, p| {
        if count == 0.0 {
            0.0
        } else {
            count * p.ln()
        }
    });
    let rows = DVector::from_iterator(
        matrix.rows(),
        log_terms.row_iter().map(|row| row.sum()),
    ) + matrix.ln_coefficients();

    if rows.iter().any(|value| !value.is_finite()) {
        return Err(LpError::NumericalError {
            context: "log-likelihood evaluation",
        });
    }
    Ok(rows)
}

/// Negative log-likelihood summed over strata, for direct use by a minimizer.
pub fn neg_log_likelihood(matrix: &EstimationMatrix, params: &ParameterVector) -> Result<f64> {
    Ok(-row_log_likelihoods(matrix, params)?.sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params(thetas: &[f64], lambdas: &[f64]) -> ParameterVector {
        ParameterVector::new(
            DVector::from_row_slice(thetas),
            DVector::from_row_slice(lambdas),
        )
        .unwrap()
    }

    #[test]
    fn ln_factorial_matches_small_values() {
        assert_eq!(ln_factorial(0), 0.0);
        assert_eq!(ln_factorial(1), 0.0);
        assert_relative_eq!(ln_factorial(5), 120f64.ln(), epsilon = 1e-12);
        assert_relative_eq!(ln_factorial(10), 3_628_800f64.ln(), epsilon = 1e-10);
    }

    #[test]
    fn probabilities_sum_to_one_in_every_stratum() {
        let cases: Vec<(EstimationMatrix, ParameterVector)> = vec![
            (
                EstimationMatrix::pooled(2, &[10, 5], &[20, 10, 5]).unwrap(),
                params(&[3.0], &[0.7]),
            ),
            (
                EstimationMatrix::new(
                    3,
                    vec![vec![1], vec![2]],
                    DMatrix::from_row_slice(2, 3, &[12, 3, 7, 4, 9, 2]),
                    DMatrix::from_row_slice(2, 6, &[5, 1, 2, 0, 3, 8, 1, 1, 1, 1, 1, 1]),
                )
                .unwrap(),
                params(&[0.4, 11.0], &[2.5, 0.9]),
            ),
            (
                EstimationMatrix::pooled(4, &[3, 8, 2, 5], &[1; 10]).unwrap(),
                params(&[1.5, 7.0, 0.2], &[3.0, 0.5, 12.0]),
            ),
        ];
        for (matrix, params) in cases {
            let p = pair_probabilities(&matrix, &params).unwrap();
            for row in p.row_iter() {
                assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn probabilities_at_known_point() {
        let matrix = EstimationMatrix::pooled(2, &[10, 5], &[20, 10, 5]).unwrap();
        let p = pair_probabilities(&matrix, &params(&[1.0], &[1.25])).unwrap();
        // N_2 = 0.5 / 1.25 = 0.4, D = 2 * 1.4 * 1.4
        assert_relative_eq!(p[(0, 0)], 2.0 / 3.92, epsilon = 1e-12);
        assert_relative_eq!(p[(0, 1)], 1.6 / 3.92, epsilon = 1e-12);
        assert_relative_eq!(p[(0, 2)], 0.32 / 3.92, epsilon = 1e-12);
    }

    #[test]
    fn likelihood_is_invariant_to_relabeling_non_base_types() {
        let one = DMatrix::from_row_slice(2, 3, &[12, 3, 7, 4, 9, 2]);
        let two = DMatrix::from_row_slice(2, 6, &[5, 1, 2, 4, 3, 8, 6, 2, 1, 7, 1, 3]);
        let matrix = EstimationMatrix::new(3, vec![vec![1], vec![2]], one.clone(), two.clone())
            .unwrap();

        // Swap types 2 and 3: one-vehicle columns 1 <-> 2 and the matching pair cells.
        let one_swapped = one.select_columns([0usize, 2, 1].iter());
        let pair_order = [
            pair_index(0, 0, 3),
            pair_index(0, 2, 3),
            pair_index(0, 1, 3),
            pair_index(2, 2, 3),
            pair_index(1, 2, 3),
            pair_index(1, 1, 3),
        ];
        let two_swapped = two.select_columns(pair_order.iter());
        let swapped =
            EstimationMatrix::new(3, vec![vec![1], vec![2]], one_swapped, two_swapped).unwrap();

        let original = neg_log_likelihood(&matrix, &params(&[0.6, 4.0], &[1.8, 0.3])).unwrap();
        let relabeled = neg_log_likelihood(&swapped, &params(&[4.0, 0.6], &[0.3, 1.8])).unwrap();
        assert_relative_eq!(original, relabeled, epsilon = 1e-10);
    }

    #[test]
    fn derived_prevalence_uses_totals_across_strata() {
        let matrix = EstimationMatrix::new(
            2,
            vec![vec![1], vec![2]],
            DMatrix::from_row_slice(2, 2, &[10, 5, 30, 15]),
            DMatrix::from_row_slice(2, 3, &[1, 1, 1, 1, 1, 1]),
        )
        .unwrap();
        let n = params(&[2.0], &[4.0]).prevalence(&matrix).unwrap();
        assert_relative_eq!(n[0], 0.125, epsilon = 1e-12);
        let p = road_proportions(&n);
        assert_relative_eq!(p[0], 0.125 / 1.125, epsilon = 1e-12);
    }

    #[test]
    fn log_round_trip_and_domain() {
        let original = params(&[2.0, 0.5], &[3.0, 1.0]);
        let restored = ParameterVector::from_log(&original.to_log()).unwrap();
        assert_relative_eq!(restored.thetas()[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(restored.lambdas()[1], 1.0, epsilon = 1e-12);
        assert!(ParameterVector::new(DVector::from_row_slice(&[-1.0]), DVector::from_row_slice(&[1.0])).is_err());
        assert!(ParameterVector::from_log(&[0.0, 0.0, 0.0]).is_err());
    }

    #[test]
    fn mismatched_type_count_is_rejected() {
        let matrix = EstimationMatrix::pooled(2, &[10, 5], &[20, 10, 5]).unwrap();
        let wrong = params(&[1.0, 1.0], &[1.0, 1.0]);
        assert!(matches!(
            neg_log_likelihood(&matrix, &wrong),
            Err(LpError::DimensionMismatch { .. })
        ));
    }
}
