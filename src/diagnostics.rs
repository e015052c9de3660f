//! Non-fatal conditions.
//!
//! None of these stop a run. Each is logged when recorded and kept in emission order so callers
//! can audit what was excluded and why.
use std::fmt;

use log::warn;
use thiserror::Error;

use crate::set::{SensorId, SetId};

/// Why a set was pruned from the hierarchy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No bridge connects the set to any set one round above
    NoUpwardBridge,
    /// The set has bridges, but only into sets that are themselves cut off from the root
    ThroughPrunedSets,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoUpwardBridge => write!(f, "not yet connected to a higher-round set"),
            Self::ThroughPrunedSets => write!(f, "only connected through pruned sets"),
        }
    }
}

#[derive(Error, Clone, Debug, PartialEq)]
pub enum Diagnostic {
    #[error("set {set} excluded: round {raw} is not a positive integer")]
    InvalidRound { set: SetId, raw: String },

    #[error("set {set} (round {round}) pruned: {reason}")]
    DisconnectedSet {
        set: SetId,
        round: u32,
        reason: DisconnectReason,
    },

    #[error("no edge from set {lower} to set {}: ambiguous bridge candidates {candidates:?}", display_upper(.upper))]
    AmbiguousBridge {
        lower: SetId,
        upper: Option<SetId>,
        candidates: Vec<SensorId>,
    },

    #[error("set {set} has {count} bridges, above the limit of {limit}")]
    ExcessiveBridges { set: SetId, count: usize, limit: usize },

    #[error("bridge {sensor} of set {set} is not a member of any set one round above")]
    DanglingBridge { set: SetId, sensor: SensorId },

    #[error("set {set} names parent {parent}, which is not a set one round above")]
    ParentMismatch { set: SetId, parent: SetId },

    #[error("set {set} has no offset/error tables; every lookup in it is undefined")]
    MissingTables { set: SetId },

    #[error("sensor {sensor} in set {set}: spread across paths {std:.6} exceeds {threshold}")]
    SpreadExceeded {
        set: SetId,
        sensor: SensorId,
        std: f64,
        threshold: f64,
    },
}

fn display_upper(upper: &Option<SetId>) -> String {
    upper.map_or_else(|| "any higher-round set".to_owned(), |set| set.to_string())
}

/// A lookup that resolved to no measured value; the path containing it is dropped
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
#[error("no measured offset between {from} and {to} in set {set}")]
pub struct MissingOffset {
    pub set: SetId,
    pub from: SensorId,
    pub to: SensorId,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    missing_offsets: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        warn!("{diagnostic}");
        self.entries.push(diagnostic);
    }

    pub fn count_missing_offsets(&mut self, count: usize) {
        self.missing_offsets += count;
    }

    pub fn extend(&mut self, other: Self) {
        self.entries.extend(other.entries);
        self.missing_offsets += other.missing_offsets;
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub const fn missing_offsets(&self) -> usize {
        self.missing_offsets
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.missing_offsets == 0
    }

    /// Sets pruned as disconnected, in emission order
    pub fn pruned_sets(&self) -> impl Iterator<Item = SetId> + '_ {
        self.entries.iter().filter_map(|entry| match entry {
            Diagnostic::DisconnectedSet { set, .. } => Some(*set),
            _ => None,
        })
    }
}
