use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifies which replicate of a run produced a failure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateContext {
    /// Multiple-imputation replicate index, when the run is imputed.
    pub mi_replicate: Option<usize>,
    /// Bootstrap replicate index; `Some(0)` is the unresampled sample.
    pub bootstrap_replicate: Option<usize>,
    /// Number of strata that survived the identification guard.
    pub strata: usize,
}

impl fmt::Display for ReplicateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mi_replicate {
            Some(index) => write!(f, "mi replicate {index}, ")?,
            None => write!(f, "no imputation, ")?,
        }
        match self.bootstrap_replicate {
            Some(index) => write!(f, "bootstrap replicate {index}, ")?,
            None => write!(f, "no bootstrap, ")?,
        }
        write!(f, "{} strata", self.strata)
    }
}

/// Unified error type for `lprs` operations.
#[derive(Debug, Error)]
pub enum LpError {
    /// Raised when crash, vehicle, or person records violate a structural invariant.
    #[error("data integrity violation for crash {year}/{case_id}: {reason}")]
    DataIntegrity {
        year: i32,
        case_id: u32,
        reason: String,
    },

    /// Raised when an estimation matrix has no identified strata, or every replicate is degenerate.
    #[error("degenerate sample ({context}): {reason}")]
    DegenerateSample {
        reason: &'static str,
        context: ReplicateContext,
    },

    /// Raised when the optimizer exhausts its iteration budget before meeting tolerance.
    #[error(
        "likelihood maximization did not converge after {iterations} iterations ({context}); best negative log-likelihood {best_cost}"
    )]
    Convergence {
        iterations: u64,
        best_cost: f64,
        context: ReplicateContext,
    },

    /// Raised when caller-supplied options are structurally invalid.
    #[error("invalid configuration for `{field}`: {reason}")]
    Configuration {
        field: &'static str,
        reason: String,
    },

    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, often the model-implied value.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when numerical routines produce NaN or leave the parameter domain.
    #[error("encountered invalid numeric value during {context}")]
    NumericalError { context: &'static str },

    /// Raised when the optimization backend itself fails.
    #[error("optimizer failure: {message}")]
    Optimizer { message: String },
}

impl LpError {
    /// Helper to format a [`DimensionMismatch`](LpError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper for configuration failures detected before any data is touched.
    pub fn configuration(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field,
            reason: reason.into(),
        }
    }

    /// Helper for structural violations in the canonical tables.
    pub fn integrity(year: i32, case_id: u32, reason: impl Into<String>) -> Self {
        Self::DataIntegrity {
            year,
            case_id,
            reason: reason.into(),
        }
    }

    /// Helper for an estimation matrix with nothing left to fit.
    pub fn degenerate(reason: &'static str) -> Self {
        Self::DegenerateSample {
            reason,
            context: ReplicateContext::default(),
        }
    }

    /// Attaches replicate indices to errors that carry a [`ReplicateContext`].
    ///
    /// Indices already recorded deeper in the call stack are kept.
    pub fn in_replicate(mut self, mi: Option<usize>, bootstrap: Option<usize>) -> Self {
        if let Self::DegenerateSample { context, .. } | Self::Convergence { context, .. } =
            &mut self
        {
            context.mi_replicate = context.mi_replicate.or(mi);
            context.bootstrap_replicate = context.bootstrap_replicate.or(bootstrap);
        }
        self
    }

    /// Returns the replicate context for failures that carry one.
    pub fn context(&self) -> Option<&ReplicateContext> {
        match self {
            Self::DegenerateSample { context, .. } | Self::Convergence { context, .. } => {
                Some(context)
            }
            _ => None,
        }
    }

    /// Whether the failure is a non-converged fit rather than a structural problem.
    pub fn is_convergence(&self) -> bool {
        matches!(self, Self::Convergence { .. })
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, LpError>;
