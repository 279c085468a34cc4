//! Construction of the analytic crash sample.
//!
//! [`SampleBuilder`] narrows the canonical tables to crashes the model can use and
//! attaches one driver type per vehicle. Under multiple imputation every driver is
//! classified once per imputed measurement; a crash is flagged as missing its
//! drinking status when any replicate leaves a driver unclassified, so all
//! replicates share a single set of eligible crashes.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::classify::{DriverEvidence, DriverType};
use crate::data::{BacSelection, CaseKey, CrashTables, DriverResolution, PersonRecord, Sex};
use crate::error::{LpError, Result};
use crate::options::SampleOptions;

/// Drivers younger than this are treated as having a missing age.
pub const MINIMUM_DRIVER_AGE: u16 = 13;

/// Drivers younger than this count as young in [`DriverCharacteristics`].
pub const YOUNG_DRIVER_AGE: u16 = 25;

/// Whether a crash falls in the weekend late-night window.
///
/// The window opens at 20:00 on day code 6, covers all of day 7, and closes at 04:00
/// on day code 1, the same wrap-around convention as the default hour filter.
pub fn is_weekend(day_of_week: u8, hour: u8) -> bool {
    (day_of_week == 6 && hour >= 20) || day_of_week == 7 || (day_of_week == 1 && hour <= 4)
}

/// A crash that passed every filter, with its driver types attached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EligibleCrash {
    pub key: CaseKey,
    pub state: u16,
    pub hour: u8,
    pub day_of_week: u8,
    pub weekend: bool,
    vehicles: usize,
    /// Replicate-major: `types[r * vehicles + v]`, vehicles ordered by vehicle number.
    types: Vec<DriverType>,
}

impl EligibleCrash {
    /// Builds an eligible crash from per-replicate driver types, each in vehicle order.
    pub fn new(
        key: CaseKey,
        state: u16,
        day_of_week: u8,
        hour: u8,
        replicate_types: Vec<Vec<DriverType>>,
    ) -> Result<Self> {
        let vehicles = replicate_types.first().map_or(0, Vec::len);
        if !(1..=2).contains(&vehicles) {
            return Err(LpError::integrity(
                key.year,
                key.case_id,
                format!("eligible crashes have one or two vehicles, got {vehicles}"),
            ));
        }
        if let Some(ragged) = replicate_types.iter().find(|types| types.len() != vehicles) {
            return Err(LpError::dimension_mismatch(
                "driver types per replicate",
                vehicles,
                ragged.len(),
            ));
        }
        Ok(Self {
            key,
            state,
            hour,
            day_of_week,
            weekend: is_weekend(day_of_week, hour),
            vehicles,
            types: replicate_types.into_iter().flatten().collect(),
        })
    }

    /// Number of classification replicates carried.
    pub fn replicates(&self) -> usize {
        self.types.len() / self.vehicles
    }

    /// Number of vehicles, always 1 or 2.
    pub fn vehicle_count(&self) -> usize {
        self.vehicles
    }

    /// Driver types for classification replicate `replicate`, in vehicle order.
    pub fn driver_types(&self, replicate: usize) -> &[DriverType] {
        let start = replicate * self.vehicles;
        &self.types[start..start + self.vehicles]
    }
}

/// Steps of the sample pipeline, in application order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStep {
    Loaded,
    YearRange,
    ResolvedDrivers,
    HourWindow,
    VehicleCount,
    TestingRate,
    StateYearMissingness,
    CompleteRecords,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCount {
    pub step: SampleStep,
    pub crashes: usize,
}

/// Per-crash missing-data flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingFlags {
    pub driver_age: bool,
    pub driver_sex: bool,
    pub violation_history: bool,
    pub drinking_status: bool,
    pub hour: bool,
    pub day_of_week: bool,
    pub state: bool,
}

impl MissingFlags {
    pub fn any(&self) -> bool {
        self.driver_age
            || self.driver_sex
            || self.violation_history
            || self.drinking_status
            || self.hour
            || self.day_of_week
            || self.state
    }
}

/// Share of crashes carrying each missing-data flag, measured before the missingness filters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MissingShares {
    pub driver_age: f64,
    pub driver_sex: f64,
    pub violation_history: f64,
    pub drinking_status: f64,
    pub hour: f64,
    pub day_of_week: f64,
    pub state: f64,
    pub any: f64,
}

impl MissingShares {
    fn from_flags<'a>(flags: impl ExactSizeIterator<Item = &'a MissingFlags>) -> Self {
        let total = flags.len();
        if total == 0 {
            return Self::default();
        }
        let mut counts = [0usize; 8];
        for flag in flags {
            let values = [
                flag.driver_age,
                flag.driver_sex,
                flag.violation_history,
                flag.drinking_status,
                flag.hour,
                flag.day_of_week,
                flag.state,
                flag.any(),
            ];
            for (count, value) in counts.iter_mut().zip(values) {
                *count += usize::from(value);
            }
        }
        let share = |count: usize| count as f64 / total as f64;
        Self {
            driver_age: share(counts[0]),
            driver_sex: share(counts[1]),
            violation_history: share(counts[2]),
            drinking_status: share(counts[3]),
            hour: share(counts[4]),
            day_of_week: share(counts[5]),
            state: share(counts[6]),
            any: share(counts[7]),
        }
    }
}

/// Shares of eligible drivers with each characteristic.
///
/// Drinking and the drinking interactions are averaged over classification
/// replicates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverCharacteristics {
    pub drivers: usize,
    pub drinking: f64,
    pub male: f64,
    pub under_25: f64,
    /// Two or more minor prior violations or at least one major one.
    pub bad_record: f64,
    pub male_and_drinking: f64,
    pub under_25_and_drinking: f64,
    pub bad_record_and_drinking: f64,
}

/// Descriptive statistics gathered while building the sample.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub steps: Vec<StepCount>,
    pub missing: MissingShares,
    /// (year, state) cells removed wholesale by the missingness threshold.
    pub dropped_cells: usize,
    pub one_vehicle_crashes: usize,
    pub two_vehicle_crashes: usize,
    /// Share of eligible drivers of each type, averaged over classification replicates.
    pub type_shares: Vec<f64>,
    pub drivers: DriverCharacteristics,
}

impl SampleSummary {
    /// Crash count remaining after `step`, if the step ran.
    pub fn count_after(&self, step: SampleStep) -> Option<usize> {
        self.steps
            .iter()
            .find(|entry| entry.step == step)
            .map(|entry| entry.crashes)
    }

    fn record(&mut self, step: SampleStep, crashes: usize) {
        info!("{step:?}: {crashes} crashes remain");
        self.steps.push(StepCount { step, crashes });
    }
}

/// The eligible crashes and their driver types for every classification replicate.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalyticSample {
    crashes: Vec<EligibleCrash>,
    num_types: usize,
    replicates: usize,
    summary: SampleSummary,
}

impl AnalyticSample {
    /// Assembles a sample from crashes classified elsewhere.
    pub fn from_crashes(num_types: usize, crashes: Vec<EligibleCrash>) -> Result<Self> {
        let replicates = crashes.first().map_or(1, EligibleCrash::replicates);
        if let Some(crash) = crashes.iter().find(|c| c.replicates() != replicates) {
            return Err(LpError::dimension_mismatch(
                "classification replicates per crash",
                replicates,
                crash.replicates(),
            ));
        }
        if let Some(crash) = crashes
            .iter()
            .find(|c| c.types.iter().any(|t| t.index() >= num_types))
        {
            return Err(LpError::integrity(
                crash.key.year,
                crash.key.case_id,
                format!("driver type outside 1..={num_types}"),
            ));
        }
        let one_vehicle_crashes = crashes.iter().filter(|c| c.vehicles == 1).count();
        let summary = SampleSummary {
            one_vehicle_crashes,
            two_vehicle_crashes: crashes.len() - one_vehicle_crashes,
            ..SampleSummary::default()
        };
        Ok(Self {
            crashes,
            num_types,
            replicates,
            summary,
        })
    }

    pub fn crashes(&self) -> &[EligibleCrash] {
        &self.crashes
    }

    pub fn len(&self) -> usize {
        self.crashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crashes.is_empty()
    }

    /// Number of driver types K.
    pub fn num_types(&self) -> usize {
        self.num_types
    }

    /// Number of classification replicates (1 without imputation).
    pub fn replicates(&self) -> usize {
        self.replicates
    }

    pub fn summary(&self) -> &SampleSummary {
        &self.summary
    }
}

/// Per-crash state carried between pipeline steps.
struct Candidate {
    crash: usize,
    flags: MissingFlags,
    types: Vec<DriverType>,
}

/// Filters canonical tables into an [`AnalyticSample`].
#[derive(Clone, Copy, Debug)]
pub struct SampleBuilder<'a> {
    tables: &'a CrashTables,
    options: &'a SampleOptions,
    imputations: usize,
}

impl<'a> SampleBuilder<'a> {
    pub fn new(tables: &'a CrashTables, options: &'a SampleOptions) -> Self {
        Self {
            tables,
            options,
            imputations: 0,
        }
    }

    /// Classify drivers with the first `replicates` imputed measurements instead of
    /// the reported test result.
    pub fn imputations(mut self, replicates: usize) -> Self {
        self.imputations = replicates;
        self
    }

    fn selections(&self) -> Vec<BacSelection> {
        if self.imputations == 0 {
            vec![BacSelection::Reported]
        } else {
            (0..self.imputations).map(BacSelection::Imputed).collect()
        }
    }

    /// Runs the pipeline. An empty sample is a valid result.
    pub fn build(&self) -> Result<AnalyticSample> {
        self.options.validate()?;
        if self.imputations > self.tables.imputation_replicates() {
            return Err(LpError::dimension_mismatch(
                "imputation replicates available in tables",
                self.imputations,
                self.tables.imputation_replicates(),
            ));
        }
        let tables = self.tables;
        let options = self.options;
        let definition = options.classification.definition;
        if self.imputations > 0 && !definition.uses_test_results() {
            warn!(
                "{definition} ignores test results; all {} imputations classify alike",
                self.imputations
            );
        }
        let mut summary = SampleSummary::default();

        let mut kept: Vec<usize> = (0..tables.crash_count()).collect();
        summary.record(SampleStep::Loaded, kept.len());

        kept.retain(|&crash| {
            let year = tables.crash(crash).key.year;
            (options.first_year..=options.last_year).contains(&year)
        });
        summary.record(SampleStep::YearRange, kept.len());

        kept.retain(|&crash| {
            tables
                .vehicle_range(crash)
                .all(|vehicle| matches!(tables.driver(vehicle), DriverResolution::Unique(_)))
        });
        summary.record(SampleStep::ResolvedDrivers, kept.len());

        kept.retain(|&crash| {
            tables
                .crash(crash)
                .hour
                .is_some_and(|hour| options.hour_in_window(hour))
        });
        summary.record(SampleStep::HourWindow, kept.len());

        kept.retain(|&crash| (1..=2).contains(&tables.vehicle_range(crash).len()));
        summary.record(SampleStep::VehicleCount, kept.len());

        if let Some(rate) = options.testing_rate_threshold {
            self.retain_tested_cells(&mut kept, rate);
            summary.record(SampleStep::TestingRate, kept.len());
        }

        let selections = self.selections();
        let mut candidates: Vec<Candidate> = kept
            .into_iter()
            .map(|crash| self.classify_crash(crash, &selections))
            .collect();
        summary.missing = MissingShares::from_flags(candidates.iter().map(|c| &c.flags));
        debug!("missing-data shares: {:?}", summary.missing);

        let mut cells: BTreeMap<(i32, Option<u16>), (usize, usize)> = BTreeMap::new();
        for candidate in &candidates {
            let crash = tables.crash(candidate.crash);
            let cell = cells.entry((crash.key.year, crash.state)).or_default();
            cell.0 += usize::from(candidate.flags.any());
            cell.1 += 1;
        }
        let threshold = options.state_year_missing_threshold;
        let before = cells.len();
        cells.retain(|_, (flagged, total)| *flagged as f64 / *total as f64 <= threshold);
        summary.dropped_cells = before - cells.len();
        candidates.retain(|candidate| {
            let crash = tables.crash(candidate.crash);
            cells.contains_key(&(crash.key.year, crash.state))
        });
        summary.record(SampleStep::StateYearMissingness, candidates.len());

        candidates.retain(|candidate| !candidate.flags.any());
        summary.record(SampleStep::CompleteRecords, candidates.len());
        summary.drivers = self.characteristics(&candidates, selections.len());
        debug!("driver characteristics: {:?}", summary.drivers);

        let crashes: Vec<EligibleCrash> = candidates
            .into_iter()
            .filter_map(|candidate| self.eligible(candidate))
            .collect();

        let num_types = options.scheme.num_types();
        let replicates = selections.len();
        let mut type_counts = vec![0usize; num_types];
        let mut drivers = 0usize;
        for crash in &crashes {
            match crash.vehicle_count() {
                1 => summary.one_vehicle_crashes += 1,
                _ => summary.two_vehicle_crashes += 1,
            }
            for driver_type in &crash.types {
                type_counts[driver_type.index()] += 1;
                drivers += 1;
            }
        }
        summary.type_shares = type_counts
            .iter()
            .map(|&count| {
                if drivers == 0 {
                    0.0
                } else {
                    count as f64 / drivers as f64
                }
            })
            .collect();
        info!(
            "analytic sample: {} one-vehicle and {} two-vehicle crashes, driver type shares {:?}",
            summary.one_vehicle_crashes, summary.two_vehicle_crashes, summary.type_shares
        );

        Ok(AnalyticSample {
            crashes,
            num_types,
            replicates,
            summary,
        })
    }

    /// Keeps crashes in (year, state) cells that test enough drivers the officer
    /// judged to show drinking evidence. Cells with no such drivers are dropped.
    fn retain_tested_cells(&self, kept: &mut Vec<usize>, rate: f64) {
        let tables = self.tables;
        let mut cells: BTreeMap<(i32, Option<u16>), (usize, usize)> = BTreeMap::new();
        for &crash in kept.iter() {
            let record = tables.crash(crash);
            for vehicle in tables.vehicle_range(crash) {
                if !tables.vehicle(vehicle).any_drinking_evidence {
                    continue;
                }
                if let DriverResolution::Unique(driver) = tables.driver(vehicle) {
                    let cell = cells.entry((record.key.year, record.state)).or_default();
                    cell.0 += usize::from(driver.alcohol_test_result.is_some());
                    cell.1 += 1;
                }
            }
        }
        kept.retain(|&crash| {
            let record = tables.crash(crash);
            cells
                .get(&(record.key.year, record.state))
                .is_some_and(|&(tested, total)| tested as f64 / total as f64 >= rate)
        });
    }

    fn characteristics(&self, candidates: &[Candidate], replicates: usize) -> DriverCharacteristics {
        let tables = self.tables;
        let scheme = self.options.scheme;
        // drinking, male, under 25, bad record, then the three drinking interactions
        let mut totals = [0.0f64; 7];
        let mut drivers = 0usize;
        for candidate in candidates {
            let range = tables.vehicle_range(candidate.crash);
            let vehicles = range.len();
            for (position, vehicle) in range.enumerate() {
                let DriverResolution::Unique(driver) = tables.driver(vehicle) else {
                    continue;
                };
                let drinking = (0..replicates)
                    .filter(|&r| scheme.is_drinking(candidate.types[r * vehicles + position]))
                    .count() as f64
                    / replicates as f64;
                let male = indicator(driver.sex == Some(Sex::Male));
                let young = indicator(driver.age.is_some_and(|age| age < YOUNG_DRIVER_AGE));
                let bad = indicator(
                    tables.vehicle(vehicle).prior_violations.is_bad_record() == Some(true),
                );
                let values = [
                    drinking,
                    male,
                    young,
                    bad,
                    male * drinking,
                    young * drinking,
                    bad * drinking,
                ];
                for (total, value) in totals.iter_mut().zip(values) {
                    *total += value;
                }
                drivers += 1;
            }
        }
        let share = |total: f64| {
            if drivers == 0 {
                0.0
            } else {
                total / drivers as f64
            }
        };
        DriverCharacteristics {
            drivers,
            drinking: share(totals[0]),
            male: share(totals[1]),
            under_25: share(totals[2]),
            bad_record: share(totals[3]),
            male_and_drinking: share(totals[4]),
            under_25_and_drinking: share(totals[5]),
            bad_record_and_drinking: share(totals[6]),
        }
    }

    fn classify_crash(&self, crash: usize, selections: &[BacSelection]) -> Candidate {
        let tables = self.tables;
        let record = tables.crash(crash);
        let range = tables.vehicle_range(crash);
        let vehicles = range.len();
        let mut flags = MissingFlags {
            hour: record.hour.is_none(),
            day_of_week: record.day_of_week.is_none(),
            state: record.state.is_none(),
            ..MissingFlags::default()
        };
        let mut types = vec![DriverType::BASE; vehicles * selections.len()];

        for (position, vehicle) in range.enumerate() {
            let vehicle_record = tables.vehicle(vehicle);
            flags.violation_history |= !vehicle_record.prior_violations.is_complete();
            let DriverResolution::Unique(driver) = tables.driver(vehicle) else {
                flags.drinking_status = true;
                continue;
            };
            flags.driver_age |= missing_age(driver);
            flags.driver_sex |= driver.sex.is_none();

            let child = self.options.scheme.needs_passengers() && tables.has_child_passenger(vehicle);
            for (replicate, &selection) in selections.iter().enumerate() {
                let evidence = DriverEvidence {
                    police_judgment: driver.police_judgment,
                    any_drinking_evidence: vehicle_record.any_drinking_evidence,
                    bac: driver.bac(selection),
                };
                match self.options.classification.classify(&evidence) {
                    Some(status) => {
                        types[replicate * vehicles + position] =
                            self.options.scheme.driver_type(status, child);
                    }
                    None => flags.drinking_status = true,
                }
            }
        }

        Candidate {
            crash,
            flags,
            types,
        }
    }

    fn eligible(&self, candidate: Candidate) -> Option<EligibleCrash> {
        let record = self.tables.crash(candidate.crash);
        let (state, hour, day_of_week) = (record.state?, record.hour?, record.day_of_week?);
        Some(EligibleCrash {
            key: record.key,
            state,
            hour,
            day_of_week,
            weekend: is_weekend(day_of_week, hour),
            vehicles: self.tables.vehicle_range(candidate.crash).len(),
            types: candidate.types,
        })
    }
}

fn indicator(flag: bool) -> f64 {
    if flag {
        1.0
    } else {
        0.0
    }
}

fn missing_age(driver: &PersonRecord) -> bool {
    driver.age.map_or(true, |age| age < MINIMUM_DRIVER_AGE)
}
