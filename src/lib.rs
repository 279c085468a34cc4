//! Relative crash risk of drinking drivers from crash counts alone.
//!
//! This crate estimates the Levitt–Porter model: within each stratum, the counts
//! of one-vehicle crashes by driver type and of two-vehicle crashes by unordered
//! pair of driver types identify how much more likely a drinking driver is to
//! crash than a sober one, without any exposure data. It offers tools to
//!
//! - hold validated crash, vehicle, and person records (`data` module),
//! - classify drivers into types (`classify` module),
//! - build the analytic crash sample (`sample` module),
//! - aggregate crashes into per-stratum count matrices (`aggregate` module),
//! - evaluate and maximize the multinomial likelihood (`likelihood`, `solving`),
//! - bootstrap standard errors at the crash level (`bootstrap` module), and
//! - pool multiple-imputation replicates with Rubin's rules (`imputation` module).
//!
//! # Quick start
//!
//! ```no_run
//! use lprs::aggregate::{StratificationKey, StratumField};
//! use lprs::data::{CrashRecord, CrashTablesBuilder, PersonRecord, PoliceJudgment, VehicleRecord};
//! use lprs::estimation::LpProblem;
//! use lprs::options::{BootstrapOptions, EstimationOptions};
//!
//! let crash = CrashRecord::new(1990, 1).with_state(6).with_time(7, 23);
//! let vehicle = VehicleRecord::new(crash.key, 1, true);
//! let driver = PersonRecord::driver(crash.key, 1, 1).with_police_judgment(PoliceJudgment::Drinking);
//!
//! let tables = CrashTablesBuilder::new(vec![crash])
//!     .vehicles(vec![vehicle])
//!     .persons(vec![driver])
//!     .build()
//!     .expect("validated tables");
//!
//! let options = EstimationOptions::default()
//!     .with_stratification(StratificationKey::by([StratumField::Year]))
//!     .with_bootstrap(BootstrapOptions::default().with_replicates(100));
//!
//! let result = LpProblem::new(tables).estimate(&options).expect("identified sample");
//! println!("{:?}", result.labels.iter().zip(result.estimates().iter()).collect::<Vec<_>>());
//! ```

pub mod aggregate;
pub mod bootstrap;
pub mod classify;
pub mod data;
pub mod error;
pub mod estimation;
pub mod imputation;
pub mod likelihood;
pub mod options;
pub mod sample;
pub mod solving;

pub use error::{LpError, Result};
pub use estimation::{EstimationResult, ImputedEstimationResult, LpProblem};
pub use options::EstimationOptions;
pub use solving::{fit, FitResult};
