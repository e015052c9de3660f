//! The hierarchy descriptor.
//!
//! One TOML document describes every set: its round, members, bridges, discards and monitoring
//! references. Set ids are normalised to [`SetId`] here, once, so nothing downstream has to
//! guess whether `3`, `"3"` and `3.0` name the same set.
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{Error, Result};
use crate::hierarchy::HierarchyOptions;
use crate::set::{CalibrationSet, CalibrationSetBuilder, ExcludedSet, PairTable, SensorId, SetId};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Descriptor {
    /// Absolute reference; the root set's first bridge when absent
    pub reference_sensor: Option<SensorId>,
    /// Monitoring sensors excluded from bridge auto-detection in every set
    pub general_references: Vec<SensorId>,
    pub engine: EngineConfig,
    pub sets: BTreeMap<String, SetEntry>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SetEntry {
    pub round: Option<toml::Value>,
    pub sensors: Vec<SensorId>,
    #[serde(alias = "bridges")]
    pub raised: Vec<SensorId>,
    pub discarded: Vec<SensorId>,
    #[serde(alias = "general_references")]
    pub reference: Vec<SensorId>,
    pub parent: Option<toml::Value>,
}

/// A descriptor entry with canonical ids and a validated round
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedSet {
    pub id: SetId,
    pub round: u32,
    pub sensors: Vec<SensorId>,
    pub bridges: Vec<SensorId>,
    pub discarded: Vec<SensorId>,
    pub general_references: Vec<SensorId>,
    pub parent: Option<SetId>,
}

impl NormalizedSet {
    /// Attach measured tables, or an all-undefined table when none were found.
    ///
    /// # Errors
    /// Returns an error if membership validation fails.
    pub fn into_calibration_set(self, table: Option<PairTable>) -> Result<CalibrationSet> {
        let table =
            table.unwrap_or_else(|| PairTable::empty(self.id, self.sensors.iter().copied()));
        CalibrationSetBuilder::new(self.id, self.round)
            .with_sensors(self.sensors)
            .with_bridges(self.bridges)
            .with_discarded(self.discarded)
            .with_general_references(self.general_references)
            .with_parent(self.parent)
            .with_table(table)
            .build()
    }
}

#[derive(Debug)]
pub struct Normalized {
    pub sets: Vec<NormalizedSet>,
    pub excluded: Vec<ExcludedSet>,
    pub options: HierarchyOptions,
    pub engine: EngineConfig,
}

impl Descriptor {
    /// # Errors
    /// Returns an error if `source` is not a valid descriptor.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let source = fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Canonicalise ids and split off sets whose round is unusable.
    ///
    /// # Errors
    /// Returns an error if a set key or parent is not an integral number, or two keys name the
    /// same set.
    pub fn normalize(self, diagnostics: &mut Diagnostics) -> Result<Normalized> {
        let mut keys: BTreeMap<SetId, String> = BTreeMap::new();
        let mut sets = vec![];
        let mut excluded = vec![];

        for (key, entry) in self.sets {
            let id = parse_set_id(&key)?;
            if let Some(first) = keys.insert(id, key.clone()) {
                return Err(Error::DuplicateSetId {
                    id,
                    first,
                    second: key,
                });
            }

            match parse_round(entry.round.as_ref()) {
                Ok(round) => sets.push(NormalizedSet {
                    id,
                    round,
                    sensors: entry.sensors,
                    bridges: entry.raised,
                    discarded: entry.discarded,
                    general_references: entry.reference,
                    parent: entry.parent.as_ref().map(parse_set_id_value).transpose()?,
                }),
                Err(raw) => {
                    diagnostics.push(Diagnostic::InvalidRound { set: id, raw });
                    excluded.push(ExcludedSet {
                        id,
                        sensors: entry.sensors.into_iter().collect(),
                        discarded: entry.discarded.into_iter().collect(),
                    });
                }
            }
        }

        sets.sort_by_key(|set| set.id);
        excluded.sort_by_key(|set| set.id);

        Ok(Normalized {
            sets,
            excluded,
            options: HierarchyOptions {
                reference_sensor: self.reference_sensor,
                general_references: self.general_references.into_iter().collect::<BTreeSet<_>>(),
            },
            engine: self.engine,
        })
    }
}

/// Parse a set key such as `"3"` or `"3.0"`
///
/// # Errors
/// Returns an error unless the key is a non-negative integral number that fits a `u32`.
pub fn parse_set_id(raw: &str) -> Result<SetId> {
    let trimmed = raw.trim();
    if let Ok(id) = trimmed.parse::<u32>() {
        return Ok(SetId(id));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(integral_u32)
        .map(SetId)
        .ok_or_else(|| Error::InvalidSetId(raw.to_owned()))
}

fn parse_set_id_value(value: &toml::Value) -> Result<SetId> {
    match value {
        toml::Value::Integer(id) => u32::try_from(*id)
            .map(SetId)
            .map_err(|_| Error::InvalidSetId(value.to_string())),
        toml::Value::Float(id) => integral_u32(*id)
            .map(SetId)
            .ok_or_else(|| Error::InvalidSetId(value.to_string())),
        toml::Value::String(id) => parse_set_id(id),
        _ => Err(Error::InvalidSetId(value.to_string())),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn integral_u32(value: f64) -> Option<u32> {
    (value.is_finite() && value.fract() == 0.0 && (0.0..=f64::from(u32::MAX)).contains(&value))
        .then_some(value as u32)
}

/// A round is usable only if it is a positive integer; the raw text is returned otherwise
fn parse_round(value: Option<&toml::Value>) -> ::std::result::Result<u32, String> {
    let round = match value {
        None => return Err("<missing>".to_owned()),
        Some(toml::Value::Integer(round)) => u32::try_from(*round).ok(),
        Some(toml::Value::Float(round)) => integral_u32(*round),
        Some(toml::Value::String(round)) => round.trim().parse::<u32>().ok(),
        Some(_) => None,
    };
    match round {
        Some(round) if round >= 1 => Ok(round),
        _ => Err(value.map_or_else(String::new, ToString::to_string)),
    }
}
