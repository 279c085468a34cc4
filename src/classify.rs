//! Driver-type classification from officer judgment and blood-alcohol evidence.
//!
//! Classification is a pure function of one driver's evidence. A `None` result
//! means the driver is unclassifiable under the chosen definition; the sample
//! builder turns that into a missing-data flag on the crash.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::PoliceJudgment;
use crate::error::{LpError, Result};

/// Drinking-status definitions supported by [`ClassificationRule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrinkingDefinition {
    /// Officer judgment only; "not reported" and "unknown" are missing.
    PoliceReportOnly,
    /// Officer flag for any alcohol evidence; never missing.
    AnyEvidence,
    /// Officer judgment, with the test result substituted when the judgment is missing.
    PoliceReportPrimary,
    /// Test result, with the officer judgment substituted when no test was reported.
    BacTestPrimary,
    /// Test result only, intended for imputed measurements.
    BacTestOnly,
    /// Clearly sober versus tested impaired with officer evidence; everything in between is missing.
    ImpairedVsSober,
}

impl DrinkingDefinition {
    pub const ALL: [DrinkingDefinition; 6] = [
        Self::PoliceReportOnly,
        Self::AnyEvidence,
        Self::PoliceReportPrimary,
        Self::BacTestPrimary,
        Self::BacTestOnly,
        Self::ImpairedVsSober,
    ];

    /// Whether the definition reads blood-alcohol measurements at all.
    pub fn uses_test_results(self) -> bool {
        !matches!(self, Self::PoliceReportOnly | Self::AnyEvidence)
    }
}

impl fmt::Display for DrinkingDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PoliceReportOnly => "police_report_only",
            Self::AnyEvidence => "any_evidence",
            Self::PoliceReportPrimary => "police_report_primary",
            Self::BacTestPrimary => "bac_test_primary",
            Self::BacTestOnly => "bac_test_only",
            Self::ImpairedVsSober => "impaired_vs_sober",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrinkingStatus {
    Sober,
    Drinking,
}

/// Evidence about one driver, with the blood-alcohol value already selected.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DriverEvidence {
    pub police_judgment: Option<PoliceJudgment>,
    pub any_drinking_evidence: bool,
    /// Test result in stored units (hundredths of g/dL).
    pub bac: Option<f64>,
}

/// A drinking definition together with its threshold policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub definition: DrinkingDefinition,
    /// Threshold in g/dL; compared against stored values after scaling by 100.
    pub bac_threshold: f64,
    /// When set, only an exact zero test result counts as sober; results in
    /// `(0, threshold]` are missing.
    pub drop_below_threshold: bool,
}

impl Default for ClassificationRule {
    fn default() -> Self {
        Self {
            definition: DrinkingDefinition::PoliceReportPrimary,
            bac_threshold: 0.0,
            drop_below_threshold: true,
        }
    }
}

impl ClassificationRule {
    pub fn new(definition: DrinkingDefinition, bac_threshold: f64) -> Self {
        Self {
            definition,
            bac_threshold,
            ..Self::default()
        }
    }

    pub fn with_drop_below_threshold(mut self, drop: bool) -> Self {
        self.drop_below_threshold = drop;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.bac_threshold.is_finite() || self.bac_threshold < 0.0 {
            return Err(LpError::configuration(
                "bac_threshold",
                format!("must be finite and non-negative, got {}", self.bac_threshold),
            ));
        }
        Ok(())
    }

    fn scaled_threshold(&self) -> f64 {
        self.bac_threshold * 100.0
    }

    /// Classifies one driver, returning `None` when the status is missing.
    pub fn classify(&self, evidence: &DriverEvidence) -> Option<DrinkingStatus> {
        match self.definition {
            DrinkingDefinition::PoliceReportOnly => from_police(evidence.police_judgment),
            DrinkingDefinition::AnyEvidence => Some(if evidence.any_drinking_evidence {
                DrinkingStatus::Drinking
            } else {
                DrinkingStatus::Sober
            }),
            DrinkingDefinition::PoliceReportPrimary => from_police(evidence.police_judgment)
                .or_else(|| evidence.bac.and_then(|bac| self.from_test(bac))),
            DrinkingDefinition::BacTestPrimary => match evidence.bac {
                Some(bac) => self.from_test(bac),
                None => from_police(evidence.police_judgment),
            },
            DrinkingDefinition::BacTestOnly => evidence.bac.and_then(|bac| self.from_test(bac)),
            DrinkingDefinition::ImpairedVsSober => self.impaired_vs_sober(evidence),
        }
    }

    fn from_test(&self, bac: f64) -> Option<DrinkingStatus> {
        let threshold = self.scaled_threshold();
        if bac > threshold {
            Some(DrinkingStatus::Drinking)
        } else if !self.drop_below_threshold || bac == 0.0 {
            Some(DrinkingStatus::Sober)
        } else {
            None
        }
    }

    fn impaired_vs_sober(&self, evidence: &DriverEvidence) -> Option<DrinkingStatus> {
        if !evidence.any_drinking_evidence || evidence.bac == Some(0.0) {
            return Some(DrinkingStatus::Sober);
        }
        match evidence.bac {
            Some(bac) if bac > 0.0 && bac >= self.scaled_threshold() => {
                Some(DrinkingStatus::Drinking)
            }
            _ => None,
        }
    }
}

fn from_police(judgment: Option<PoliceJudgment>) -> Option<DrinkingStatus> {
    let judgment = judgment.filter(|j| j.is_determinate())?;
    Some(if judgment == PoliceJudgment::Drinking {
        DrinkingStatus::Drinking
    } else {
        DrinkingStatus::Sober
    })
}

/// One-based driver type in `1..=K`; type 1 is the reference type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DriverType(u8);

impl DriverType {
    /// The reference type.
    pub const BASE: DriverType = DriverType(1);

    /// Creates a type label, rejecting zero.
    pub fn new(label: u8) -> Result<Self> {
        if label == 0 {
            return Err(LpError::configuration(
                "driver_type",
                "driver types are numbered from 1",
            ));
        }
        Ok(Self(label))
    }

    pub fn label(self) -> u8 {
        self.0
    }

    /// Zero-based column index.
    pub fn index(self) -> usize {
        usize::from(self.0) - 1
    }
}

impl fmt::Display for DriverType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How drinking status (and optionally a second attribute) maps onto driver types.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverTypeScheme {
    /// K = 2: 1 sober, 2 drinking.
    #[default]
    Drinking,
    /// K = 4: 1 sober without child passenger, 2 drinking without, 3 sober with, 4 drinking with.
    ///
    /// Drinking is the low bit so even types are drinking in both schemes. Tables
    /// that number child passenger first (1 sober with, 2 sober without, 3 drinking
    /// with, 4 drinking without) correspond to types 3, 1, 4, 2 here.
    DrinkingByChildPassenger,
}

impl DriverTypeScheme {
    pub fn num_types(self) -> usize {
        match self {
            Self::Drinking => 2,
            Self::DrinkingByChildPassenger => 4,
        }
    }

    pub fn needs_passengers(self) -> bool {
        matches!(self, Self::DrinkingByChildPassenger)
    }

    pub fn driver_type(self, status: DrinkingStatus, child_passenger: bool) -> DriverType {
        let drinking = u8::from(status == DrinkingStatus::Drinking);
        match self {
            Self::Drinking => DriverType(1 + drinking),
            Self::DrinkingByChildPassenger => {
                DriverType(1 + drinking + 2 * u8::from(child_passenger))
            }
        }
    }

    /// Whether drivers of type `driver_type` are drinking under this scheme.
    pub fn is_drinking(self, driver_type: DriverType) -> bool {
        match self {
            Self::Drinking => driver_type.0 == 2,
            Self::DrinkingByChildPassenger => matches!(driver_type.0, 2 | 4),
        }
    }

    /// Human-readable label for each type, in type order.
    pub fn labels(self) -> &'static [&'static str] {
        match self {
            Self::Drinking => &["sober", "drinking"],
            Self::DrinkingByChildPassenger => &[
                "sober, no child passenger",
                "drinking, no child passenger",
                "sober, child passenger",
                "drinking, child passenger",
            ],
        }
    }
}
