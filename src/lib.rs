#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
// #![warn(clippy::cargo)]

pub mod chain;
pub mod combine;
pub mod config;
pub mod descriptor;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod export;
pub mod hierarchy;
pub mod ingest;
pub mod margin;
pub mod math;
pub mod paths;
pub mod set;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::EngineConfig;
pub use engine::{CalibrationEngine, CalibrationResult, Status};
pub use error::{Error, Result};
pub use hierarchy::HierarchyOptions;
pub use margin::Measurement;
pub use set::{SensorId, SetId};
