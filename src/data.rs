//! Canonical crash, vehicle, and person tables consumed by the sample builder.
//!
//! Records arrive already harmonized (one schema across years). The builder sorts
//! them, checks the structural invariants the estimator relies on, and records the
//! contiguous block of vehicles belonging to each crash and of persons belonging to
//! each vehicle, so later stages can walk a crash without any lookups.

use std::collections::HashSet;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{LpError, Result};

/// Persons younger than this are counted as child passengers.
pub const CHILD_PASSENGER_AGE: u16 = 15;

/// Identity of a crash: the data year plus the case number within that year.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CaseKey {
    pub year: i32,
    pub case_id: u32,
}

impl CaseKey {
    pub fn new(year: i32, case_id: u32) -> Self {
        Self { year, case_id }
    }
}

/// Officer judgment of alcohol involvement, as coded in the person table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoliceJudgment {
    NotDrinking,
    Drinking,
    NotReported,
    Unknown,
}

impl PoliceJudgment {
    /// Decodes the numeric judgment code (0, 1, 8, 9); any other code is treated as absent.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::NotDrinking),
            1 => Some(Self::Drinking),
            8 => Some(Self::NotReported),
            9 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the officer actually reached a yes/no judgment.
    pub fn is_determinate(self) -> bool {
        matches!(self, Self::NotDrinking | Self::Drinking)
    }
}

/// Crash-level attributes used for filtering and stratification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub key: CaseKey,
    pub state: Option<u16>,
    /// Hour of the crash, 0..=23.
    pub hour: Option<u8>,
    /// Day code, 1 = Sunday through 7 = Saturday.
    pub day_of_week: Option<u8>,
    /// Vehicle count as labelled in the crash file, checked against the vehicle join.
    pub vehicle_count: Option<u16>,
}

impl CrashRecord {
    pub fn new(year: i32, case_id: u32) -> Self {
        Self {
            key: CaseKey::new(year, case_id),
            state: None,
            hour: None,
            day_of_week: None,
            vehicle_count: None,
        }
    }

    pub fn with_state(mut self, state: u16) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_time(mut self, day_of_week: u8, hour: u8) -> Self {
        self.day_of_week = Some(day_of_week);
        self.hour = Some(hour);
        self
    }

    pub fn with_vehicle_count(mut self, count: u16) -> Self {
        self.vehicle_count = Some(count);
        self
    }
}

/// Counts of the driver's previous violations recorded on the vehicle file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorViolations {
    pub accidents: Option<u16>,
    pub suspensions: Option<u16>,
    pub dwi: Option<u16>,
    pub speeding: Option<u16>,
    pub other: Option<u16>,
}

impl PriorViolations {
    /// A clean record with every history field present.
    pub fn none() -> Self {
        Self {
            accidents: Some(0),
            suspensions: Some(0),
            dwi: Some(0),
            speeding: Some(0),
            other: Some(0),
        }
    }

    /// Accidents, speeding, and other moving violations.
    pub fn minor(&self) -> Option<u32> {
        Some(u32::from(self.accidents?) + u32::from(self.speeding?) + u32::from(self.other?))
    }

    /// Suspensions and drunk-driving convictions.
    pub fn major(&self) -> Option<u32> {
        Some(u32::from(self.suspensions?) + u32::from(self.dwi?))
    }

    /// Two or more minor violations or any major one; `None` when the history is incomplete.
    pub fn is_bad_record(&self) -> Option<bool> {
        Some(self.minor()? >= 2 || self.major()? >= 1)
    }

    pub fn is_complete(&self) -> bool {
        self.accidents.is_some()
            && self.suspensions.is_some()
            && self.dwi.is_some()
            && self.speeding.is_some()
            && self.other.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub key: CaseKey,
    pub vehicle_no: u16,
    pub prior_violations: PriorViolations,
    /// Officer flag for any evidence of alcohol involvement by this vehicle's driver.
    pub any_drinking_evidence: bool,
}

impl VehicleRecord {
    pub fn new(key: CaseKey, vehicle_no: u16, any_drinking_evidence: bool) -> Self {
        Self {
            key,
            vehicle_no,
            prior_violations: PriorViolations::none(),
            any_drinking_evidence,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatRole {
    Driver,
    Passenger,
    NonOccupant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sex {
    Male,
    Female,
}

/// Which blood-alcohol measurement to read from a person record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacSelection {
    /// The single reported test result (may be absent).
    Reported,
    /// The zero-based multiple-imputation replicate (always present).
    Imputed(usize),
}


/// Person-level record; drivers carry the drinking evidence used for classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub key: CaseKey,
    pub vehicle_no: u16,
    pub person_no: u16,
    pub role: SeatRole,
    pub age: Option<u16>,
    pub sex: Option<Sex>,
    pub police_judgment: Option<PoliceJudgment>,
    /// Reported test result in stored units (hundredths of g/dL).
    pub alcohol_test_result: Option<f64>,
    /// Imputed test results, one per imputation replicate, in stored units.
    pub imputed_bac: Vec<f64>,
}

impl PersonRecord {
    /// A driver with complete demographics and no drinking evidence attached yet.
    pub fn driver(key: CaseKey, vehicle_no: u16, person_no: u16) -> Self {
        Self {
            key,
            vehicle_no,
            person_no,
            role: SeatRole::Driver,
            age: Some(40),
            sex: Some(Sex::Male),
            police_judgment: None,
            alcohol_test_result: None,
            imputed_bac: Vec::new(),
        }
    }

    pub fn passenger(key: CaseKey, vehicle_no: u16, person_no: u16, age: Option<u16>) -> Self {
        Self {
            role: SeatRole::Passenger,
            age,
            ..Self::driver(key, vehicle_no, person_no)
        }
    }

    pub fn with_police_judgment(mut self, judgment: PoliceJudgment) -> Self {
        self.police_judgment = Some(judgment);
        self
    }

    pub fn with_test_result(mut self, bac: f64) -> Self {
        self.alcohol_test_result = Some(bac);
        self
    }

    pub fn with_imputed_bac(mut self, values: Vec<f64>) -> Self {
        self.imputed_bac = values;
        self
    }

    /// Reads the measurement selected by `selection`.
    pub fn bac(&self, selection: BacSelection) -> Option<f64> {
        match selection {
            BacSelection::Reported => self.alcohol_test_result,
            BacSelection::Imputed(index) => self.imputed_bac.get(index).copied(),
        }
    }
}

/// Outcome of resolving the single driver of a vehicle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DriverResolution<'a> {
    Unique(&'a PersonRecord),
    Missing,
    /// More than one person sits in the driver seat; none of them is kept.
    Duplicated,
}

/// Validated, sorted canonical tables.
#[derive(Clone, Debug)]
pub struct CrashTables {
    crashes: Vec<CrashRecord>,
    vehicles: Vec<VehicleRecord>,
    persons: Vec<PersonRecord>,
    vehicle_ranges: Vec<Range<usize>>,
    person_ranges: Vec<Range<usize>>,
    imputation_replicates: usize,
}

impl CrashTables {
    /// Number of crash records.
    pub fn crash_count(&self) -> usize {
        self.crashes.len()
    }

    /// Number of vehicle records.
    pub fn vehicle_count(&self) -> usize {
        self.vehicles.len()
    }

    /// Crash records in key order.
    pub fn crashes(&self) -> &[CrashRecord] {
        &self.crashes
    }

    pub fn crash(&self, index: usize) -> &CrashRecord {
        &self.crashes[index]
    }

    /// Global indices of the vehicles in crash `crash_index`, ordered by vehicle number.
    pub fn vehicle_range(&self, crash_index: usize) -> Range<usize> {
        self.vehicle_ranges[crash_index].clone()
    }

    pub fn vehicle(&self, vehicle_index: usize) -> &VehicleRecord {
        &self.vehicles[vehicle_index]
    }

    /// Persons recorded in vehicle `vehicle_index`.
    pub fn occupants(&self, vehicle_index: usize) -> &[PersonRecord] {
        &self.persons[self.person_ranges[vehicle_index].clone()]
    }

    /// Number of imputed BAC values carried by every person (0 when not imputed).
    pub fn imputation_replicates(&self) -> usize {
        self.imputation_replicates
    }

    /// Resolves the driver of a vehicle, dropping duplicated driver seats.
    pub fn driver(&self, vehicle_index: usize) -> DriverResolution<'_> {
        let mut drivers = self
            .occupants(vehicle_index)
            .iter()
            .filter(|person| person.role == SeatRole::Driver);
        match (drivers.next(), drivers.next()) {
            (Some(driver), None) => DriverResolution::Unique(driver),
            (None, _) => DriverResolution::Missing,
            (Some(_), Some(_)) => DriverResolution::Duplicated,
        }
    }

    /// Whether any passenger of the vehicle is younger than [`CHILD_PASSENGER_AGE`].
    pub fn has_child_passenger(&self, vehicle_index: usize) -> bool {
        self.occupants(vehicle_index).iter().any(|person| {
            person.role == SeatRole::Passenger
                && person.age.is_some_and(|age| age < CHILD_PASSENGER_AGE)
        })
    }
}

/// Builder that validates keys and cardinalities before constructing [`CrashTables`].
#[derive(Debug)]
pub struct CrashTablesBuilder {
    crashes: Vec<CrashRecord>,
    vehicles: Vec<VehicleRecord>,
    persons: Vec<PersonRecord>,
    imputation_replicates: usize,
}

impl CrashTablesBuilder {
    /// Start building tables from the crash-level records.
    pub fn new(crashes: Vec<CrashRecord>) -> Self {
        Self {
            crashes,
            vehicles: Vec::new(),
            persons: Vec::new(),
            imputation_replicates: 0,
        }
    }

    pub fn vehicles(mut self, vehicles: Vec<VehicleRecord>) -> Self {
        self.vehicles = vehicles;
        self
    }

    pub fn persons(mut self, persons: Vec<PersonRecord>) -> Self {
        self.persons = persons;
        self
    }

    /// Declares how many imputed BAC values each person record carries.
    pub fn imputation_replicates(mut self, replicates: usize) -> Self {
        self.imputation_replicates = replicates;
        self
    }

    /// Finalizes construction after validating keys and cardinalities.
    pub fn build(self) -> Result<CrashTables> {
        let Self {
            mut crashes,
            mut vehicles,
            persons,
            imputation_replicates,
        } = self;

        crashes.sort_by_key(|crash| crash.key);
        for pair in crashes.windows(2) {
            if pair[0].key == pair[1].key {
                return Err(integrity(pair[1].key, "duplicate crash record"));
            }
        }

        vehicles.sort_by_key(|vehicle| (vehicle.key, vehicle.vehicle_no));
        let mut seen = HashSet::with_capacity(vehicles.len());
        for vehicle in &vehicles {
            if !seen.insert((vehicle.key, vehicle.vehicle_no)) {
                return Err(integrity(
                    vehicle.key,
                    format!("duplicate vehicle number {}", vehicle.vehicle_no),
                ));
            }
        }

        let vehicle_ranges = partition(&crashes, &vehicles, |c| c.key, |v| v.key)
            .map_err(|key| integrity(key, "vehicle references an unknown crash"))?;

        for (crash, range) in crashes.iter().zip(&vehicle_ranges) {
            if let Some(label) = crash.vehicle_count {
                if usize::from(label) != range.len() {
                    return Err(integrity(
                        crash.key,
                        format!(
                            "vehicle count label {label} disagrees with {} joined vehicles",
                            range.len()
                        ),
                    ));
                }
            }
        }

        // Non-occupants are not attached to a vehicle and play no part in estimation.
        let mut persons: Vec<PersonRecord> = persons
            .into_iter()
            .filter(|person| person.role != SeatRole::NonOccupant)
            .collect();
        persons.sort_by_key(|person| (person.key, person.vehicle_no, person.person_no));

        for person in &persons {
            if !person.imputed_bac.is_empty() && person.imputed_bac.len() != imputation_replicates
            {
                return Err(LpError::dimension_mismatch(
                    "imputed BAC replicates",
                    imputation_replicates,
                    person.imputed_bac.len(),
                ));
            }
            if person.role == SeatRole::Driver
                && imputation_replicates > 0
                && person.imputed_bac.len() != imputation_replicates
            {
                return Err(LpError::dimension_mismatch(
                    "imputed BAC replicates for driver",
                    imputation_replicates,
                    person.imputed_bac.len(),
                ));
            }
            if person.imputed_bac.iter().any(|value| !value.is_finite()) {
                return Err(LpError::NumericalError {
                    context: "imputed BAC validation",
                });
            }
        }

        let person_ranges = partition(
            &vehicles,
            &persons,
            |v| (v.key, v.vehicle_no),
            |p| (p.key, p.vehicle_no),
        )
        .map_err(|(key, _)| integrity(key, "person references an unknown vehicle"))?;

        Ok(CrashTables {
            crashes,
            vehicles,
            persons,
            vehicle_ranges,
            person_ranges,
            imputation_replicates,
        })
    }
}

fn integrity(key: CaseKey, reason: impl Into<String>) -> LpError {
    LpError::integrity(key.year, key.case_id, reason)
}

/// Assigns each parent the contiguous block of sorted children sharing its key.
///
/// Both slices must be sorted by key. Returns the first orphaned child key on failure.
fn partition<P, C, K: Ord + Copy>(
    parents: &[P],
    children: &[C],
    parent_key: impl Fn(&P) -> K,
    child_key: impl Fn(&C) -> K,
) -> std::result::Result<Vec<Range<usize>>, K> {
    let mut ranges = Vec::with_capacity(parents.len());
    let mut position = 0usize;
    for parent in parents {
        let key = parent_key(parent);
        if position < children.len() && child_key(&children[position]) < key {
            return Err(child_key(&children[position]));
        }
        let start = position;
        while position < children.len() && child_key(&children[position]) == key {
            position += 1;
        }
        ranges.push(start..position);
    }
    match children.get(position) {
        Some(orphan) => Err(child_key(orphan)),
        None => Ok(ranges),
    }
}
