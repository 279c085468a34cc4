//! Collapsing an analytic sample into stratified crash-count tables.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{LpError, Result};
use crate::likelihood::ln_factorial;
use crate::sample::{AnalyticSample, EligibleCrash};

/// A crash attribute that can take part in a stratification key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StratumField {
    Year,
    State,
    Weekend,
    Hour,
    DayOfWeek,
}

impl StratumField {
    fn value(self, crash: &EligibleCrash) -> i64 {
        match self {
            Self::Year => i64::from(crash.key.year),
            Self::State => i64::from(crash.state),
            Self::Weekend => i64::from(crash.weekend),
            Self::Hour => i64::from(crash.hour),
            Self::DayOfWeek => i64::from(crash.day_of_week),
        }
    }
}

/// The attributes within which the model's equal-mixing assumption is applied.
///
/// An empty key pools every crash into a single stratum.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StratificationKey {
    fields: Vec<StratumField>,
}

impl StratificationKey {
    /// Pool all strata together.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by(fields: impl IntoIterator<Item = StratumField>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn fields(&self) -> &[StratumField] {
        &self.fields
    }

    pub fn is_pooled(&self) -> bool {
        self.fields.is_empty()
    }

    /// The stratum a crash belongs to, one value per field.
    pub fn stratum_of(&self, crash: &EligibleCrash) -> Vec<i64> {
        self.fields.iter().map(|field| field.value(crash)).collect()
    }
}

impl fmt::Display for StratificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return f.write_str("all");
        }
        let names: Vec<String> = self
            .fields
            .iter()
            .map(|field| format!("{field:?}").to_lowercase())
            .collect();
        f.write_str(&names.join(","))
    }
}

/// Number of unordered type pairs `(i, j)` with `i <= j`.
pub fn pair_count(num_types: usize) -> usize {
    num_types * (num_types + 1) / 2
}

/// Column of the unordered pair `{i, j}` (zero-based types) in the two-vehicle table.
///
/// Columns run `(0,0), (0,1), .., (0,K-1), (1,1), ..`.
pub fn pair_index(i: usize, j: usize, num_types: usize) -> usize {
    let (i, j) = if i <= j { (i, j) } else { (j, i) };
    i * num_types - i * i.saturating_sub(1) / 2 + (j - i)
}

/// Stratified one- and two-vehicle crash counts.
///
/// Every row satisfies the identification guard: each driver type appears in at
/// least one one-vehicle crash of that stratum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimationMatrix {
    num_types: usize,
    strata: Vec<Vec<i64>>,
    one_vehicle: DMatrix<u64>,
    two_vehicle: DMatrix<u64>,
    ln_coefficients: DVector<f64>,
}

impl EstimationMatrix {
    /// Validates shapes and drops rows that fail the identification guard.
    pub fn new(
        num_types: usize,
        strata: Vec<Vec<i64>>,
        one_vehicle: DMatrix<u64>,
        two_vehicle: DMatrix<u64>,
    ) -> Result<Self> {
        if num_types < 2 {
            return Err(LpError::configuration(
                "num_types",
                format!("at least two driver types are required, got {num_types}"),
            ));
        }
        if one_vehicle.ncols() != num_types {
            return Err(LpError::dimension_mismatch(
                "one-vehicle columns",
                num_types,
                one_vehicle.ncols(),
            ));
        }
        if two_vehicle.ncols() != pair_count(num_types) {
            return Err(LpError::dimension_mismatch(
                "two-vehicle columns",
                pair_count(num_types),
                two_vehicle.ncols(),
            ));
        }
        if two_vehicle.nrows() != one_vehicle.nrows() {
            return Err(LpError::dimension_mismatch(
                "two-vehicle rows",
                one_vehicle.nrows(),
                two_vehicle.nrows(),
            ));
        }
        if strata.len() != one_vehicle.nrows() {
            return Err(LpError::dimension_mismatch(
                "stratum labels",
                one_vehicle.nrows(),
                strata.len(),
            ));
        }

        let keep: Vec<usize> = (0..one_vehicle.nrows())
            .filter(|&row| one_vehicle.row(row).iter().all(|&count| count > 0))
            .collect();
        if keep.len() < one_vehicle.nrows() {
            debug!(
                "identification guard dropped {} of {} strata",
                one_vehicle.nrows() - keep.len(),
                one_vehicle.nrows()
            );
        }

        let one_vehicle = one_vehicle.select_rows(keep.iter());
        let two_vehicle = two_vehicle.select_rows(keep.iter());
        let strata = keep.iter().map(|&row| strata[row].clone()).collect();
        let ln_coefficients = DVector::from_iterator(
            two_vehicle.nrows(),
            two_vehicle.row_iter().map(|row| {
                let total: u64 = row.iter().sum();
                ln_factorial(total) - row.iter().map(|&count| ln_factorial(count)).sum::<f64>()
            }),
        );

        Ok(Self {
            num_types,
            strata,
            one_vehicle,
            two_vehicle,
            ln_coefficients,
        })
    }

    /// A single pooled stratum from flat count vectors.
    pub fn pooled(num_types: usize, one_vehicle: &[u64], two_vehicle: &[u64]) -> Result<Self> {
        if one_vehicle.len() != num_types {
            return Err(LpError::dimension_mismatch(
                "one-vehicle counts",
                num_types,
                one_vehicle.len(),
            ));
        }
        if two_vehicle.len() != pair_count(num_types) {
            return Err(LpError::dimension_mismatch(
                "two-vehicle counts",
                pair_count(num_types),
                two_vehicle.len(),
            ));
        }
        Self::new(
            num_types,
            vec![Vec::new()],
            DMatrix::from_row_slice(1, num_types, one_vehicle),
            DMatrix::from_row_slice(1, pair_count(num_types), two_vehicle),
        )
    }

    pub fn num_types(&self) -> usize {
        self.num_types
    }

    /// Number of strata that survived the identification guard.
    pub fn rows(&self) -> usize {
        self.one_vehicle.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Stratum values for each row, in the order of the stratification key's fields.
    pub fn strata(&self) -> &[Vec<i64>] {
        &self.strata
    }

    /// One-vehicle counts `a_i`, rows × K.
    pub fn one_vehicle(&self) -> &DMatrix<u64> {
        &self.one_vehicle
    }

    /// Two-vehicle counts `a_{i,j}`, rows × K(K+1)/2, columns ordered by [`pair_index`].
    pub fn two_vehicle(&self) -> &DMatrix<u64> {
        &self.two_vehicle
    }

    /// Per-row multinomial coefficient `ln((ΣA₂)! / Π A₂!)`.
    pub fn ln_coefficients(&self) -> &DVector<f64> {
        &self.ln_coefficients
    }

    /// One-vehicle count of each type summed over strata.
    pub fn one_vehicle_totals(&self) -> Vec<u64> {
        self.one_vehicle
            .column_iter()
            .map(|column| column.iter().sum())
            .collect()
    }

    /// Column names: `a_1 .. a_K` followed by `a_1_1, a_1_2, ..` (one-based types).
    pub fn column_names(&self) -> Vec<String> {
        let k = self.num_types;
        let mut names: Vec<String> = (1..=k).map(|i| format!("a_{i}")).collect();
        for i in 1..=k {
            for j in i..=k {
                names.push(format!("a_{i}_{j}"));
            }
        }
        names
    }

    /// The two-type table for the base type and zero-based type `other`.
    ///
    /// Two-vehicle crashes involving any third type are left out.
    pub fn restrict_to_pair(&self, other: usize) -> Result<Self> {
        let k = self.num_types;
        if other == 0 || other >= k {
            return Err(LpError::configuration(
                "pairwise type",
                format!("type index {other} is not a non-base type of {k}"),
            ));
        }
        let one_columns = [0, other];
        let two_columns = [
            pair_index(0, 0, k),
            pair_index(0, other, k),
            pair_index(other, other, k),
        ];
        Self::new(
            2,
            self.strata.clone(),
            self.one_vehicle.select_columns(one_columns.iter()),
            self.two_vehicle.select_columns(two_columns.iter()),
        )
    }
}

/// Aggregates classification replicate `replicate` of the sample by `key`.
pub fn aggregate(
    sample: &AnalyticSample,
    key: &StratificationKey,
    replicate: usize,
) -> Result<EstimationMatrix> {
    check_replicate(sample, replicate)?;
    aggregate_crashes(sample.crashes().iter(), key, sample.num_types(), replicate)
}

/// Aggregates a resampled multiset of the sample's crashes, given by index.
pub fn aggregate_resampled(
    sample: &AnalyticSample,
    key: &StratificationKey,
    replicate: usize,
    indices: &[usize],
) -> Result<EstimationMatrix> {
    check_replicate(sample, replicate)?;
    let crashes = sample.crashes();
    if let Some(&bad) = indices.iter().find(|&&index| index >= crashes.len()) {
        return Err(LpError::dimension_mismatch(
            "resampled crash index bound",
            crashes.len(),
            bad + 1,
        ));
    }
    aggregate_crashes(
        indices.iter().map(|&index| &crashes[index]),
        key,
        sample.num_types(),
        replicate,
    )
}

fn check_replicate(sample: &AnalyticSample, replicate: usize) -> Result<()> {
    if replicate >= sample.replicates() {
        return Err(LpError::dimension_mismatch(
            "classification replicate bound",
            sample.replicates(),
            replicate + 1,
        ));
    }
    Ok(())
}

fn aggregate_crashes<'a>(
    crashes: impl Iterator<Item = &'a EligibleCrash>,
    key: &StratificationKey,
    num_types: usize,
    replicate: usize,
) -> Result<EstimationMatrix> {
    let pairs = pair_count(num_types);
    let mut cells: BTreeMap<Vec<i64>, (Vec<u64>, Vec<u64>)> = BTreeMap::new();
    if key.is_pooled() {
        cells.insert(Vec::new(), (vec![0; num_types], vec![0; pairs]));
    }

    for crash in crashes {
        let types = crash.driver_types(replicate);
        if let Some(bad) = types.iter().find(|t| t.index() >= num_types) {
            return Err(LpError::dimension_mismatch(
                "driver type label",
                num_types,
                usize::from(bad.label()),
            ));
        }
        let (one, two) = cells
            .entry(key.stratum_of(crash))
            .or_insert_with(|| (vec![0; num_types], vec![0; pairs]));
        match types {
            [only] => one[only.index()] += 1,
            [first, second] => two[pair_index(first.index(), second.index(), num_types)] += 1,
            _ => {}
        }
    }

    let rows = cells.len();
    let mut strata = Vec::with_capacity(rows);
    let mut one_counts = Vec::with_capacity(rows * num_types);
    let mut two_counts = Vec::with_capacity(rows * pairs);
    for (stratum, (one, two)) in cells {
        strata.push(stratum);
        one_counts.extend(one);
        two_counts.extend(two);
    }
    debug!("aggregated {rows} strata by {key} for replicate {replicate}");

    EstimationMatrix::new(
        num_types,
        strata,
        DMatrix::from_row_slice(rows, num_types, &one_counts),
        DMatrix::from_row_slice(rows, pairs, &two_counts),
    )
}
