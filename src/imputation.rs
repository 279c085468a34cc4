//! Rubin's rules for combining multiple-imputation replicates.

use log::info;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{LpError, Result};
use crate::options::DofConvention;

/// Point estimates and sampling variances from one imputation replicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicateEstimate {
    pub estimates: DVector<f64>,
    /// Within-replicate variances, typically bootstrap variances.
    pub variances: DVector<f64>,
    pub log_likelihood: f64,
    pub df_resid: i64,
}

/// Estimates pooled across imputation replicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PooledResult {
    pub estimates: DVector<f64>,
    pub variances: DVector<f64>,
    pub standard_errors: DVector<f64>,
    /// Mean log-likelihood across replicates.
    pub log_likelihood: f64,
    /// Residual degrees of freedom under the configured [`DofConvention`].
    pub df_resid: f64,
    pub replicates: usize,
}

/// Pools replicate estimates with Rubin's rules.
///
/// The pooled estimate is the mean of the replicate estimates. The pooled variance
/// is the mean within-replicate variance plus `(1 + 1/m) / (m - 1)` times the sum
/// of squared deviations from that mean. A single replicate is returned unchanged.
pub fn pool(replicates: &[ReplicateEstimate], dof: DofConvention) -> Result<PooledResult> {
    let Some(first) = replicates.first() else {
        return Err(LpError::degenerate("no imputation replicates to pool"));
    };
    let width = first.estimates.len();
    for replicate in replicates {
        if replicate.estimates.len() != width {
            return Err(LpError::dimension_mismatch(
                "pooled estimates",
                width,
                replicate.estimates.len(),
            ));
        }
        if replicate.variances.len() != width {
            return Err(LpError::dimension_mismatch(
                "pooled variances",
                width,
                replicate.variances.len(),
            ));
        }
    }

    let m = replicates.len();
    let count = m as f64;
    let log_likelihood = replicates.iter().map(|r| r.log_likelihood).sum::<f64>() / count;
    let df_resid = match dof {
        DofConvention::Last => replicates[m - 1].df_resid as f64,
        DofConvention::Mean => replicates.iter().map(|r| r.df_resid as f64).sum::<f64>() / count,
    };

    let (estimates, variances) = if m == 1 {
        (first.estimates.clone(), first.variances.clone())
    } else {
        let mean = replicates
            .iter()
            .fold(DVector::<f64>::zeros(width), |acc, r| acc + &r.estimates)
            / count;
        let between_weight = (1.0 + 1.0 / count) / (count - 1.0);
        let variance = replicates.iter().fold(DVector::<f64>::zeros(width), |acc, r| {
            let deviation = &r.estimates - &mean;
            acc + &r.variances / count + deviation.component_mul(&deviation) * between_weight
        });
        (mean, variance)
    };

    if variances.iter().any(|v| !v.is_finite() || *v < 0.0) {
        return Err(LpError::NumericalError {
            context: "pooled variance",
        });
    }
    let standard_errors = variances.map(f64::sqrt);
    info!("pooled {m} imputation replicates; mean log-likelihood {log_likelihood:.4}");
    Ok(PooledResult {
        estimates,
        variances,
        standard_errors,
        log_likelihood,
        df_resid,
        replicates: m,
    })
}
