//! Fatal errors.
//!
//! Anything here aborts ingestion or engine construction. Recoverable conditions
//! are reported through [`crate::diagnostics::Diagnostic`] instead.

use thiserror::Error;

use crate::set::{SensorId, SetId};

/// Main error type for the calibration chain
#[derive(Error, Debug)]
pub enum Error {
    /// Zero or ambiguous root sets, or no usable absolute reference sensor
    #[error("No reference: {0}")]
    NoReference(String),

    /// A set key in the hierarchy descriptor is not an integral number
    #[error("Invalid set id: {0:?}")]
    InvalidSetId(String),

    /// Two descriptor keys normalise to the same set id
    #[error("Duplicate set id {id}: keys {first:?} and {second:?}")]
    DuplicateSetId {
        id: SetId,
        first: String,
        second: String,
    },

    /// A set with this id is already stored or excluded
    #[error("Set {0} is already stored")]
    SetAlreadyStored(SetId),

    /// Rounds start at 1
    #[error("Set {0} was given round 0")]
    ZeroRound(SetId),

    /// A bridge, discarded or reference id is not a member of its set
    #[error("Sensor {sensor} is declared as {role} of set {set} but is not a member")]
    NotAMember {
        set: SetId,
        sensor: SensorId,
        role: &'static str,
    },

    /// Malformed offset or error table
    #[error("Invalid table for set {set}: {reason}")]
    InvalidTable { set: SetId, reason: String },

    /// `offset[a][b] != -offset[b][a]` or `error[a][b] != error[b][a]`
    #[error("Table for set {set} breaks {kind} between sensors {a} and {b}")]
    AsymmetricTable {
        set: SetId,
        a: SensorId,
        b: SensorId,
        kind: &'static str,
    },

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Descriptor parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = ::std::result::Result<T, Error>;
