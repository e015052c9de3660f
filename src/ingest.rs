//! Loading a calibration campaign from disk.
//!
//! The working directory holds `hierarchy.toml` and, per set, `tables/<set>/offsets.csv` and
//! `tables/<set>/errors.csv`. Each table is a square matrix: the first header cell is a label and
//! the remaining cells are sensor ids, followed by one row per sensor. Empty and `nan` cells are
//! undefined.
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use log::{debug, info};
use ndarray::Array2;

use crate::config::EngineConfig;
use crate::descriptor::{integral_u32, Descriptor, NormalizedSet};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::engine::CalibrationEngine;
use crate::error::{Error, Result};
use crate::hierarchy::HierarchyOptions;
use crate::set::{PairTable, SensorId, SetId, SetStore};

pub const DESCRIPTOR_FILE: &str = "hierarchy.toml";
pub const TABLES_DIR: &str = "tables";
pub const OFFSETS_FILE: &str = "offsets.csv";
pub const ERRORS_FILE: &str = "errors.csv";

/// A loaded campaign, ready to be calibrated
#[derive(Debug)]
pub struct Workspace {
    pub store: SetStore,
    pub options: HierarchyOptions,
    pub config: EngineConfig,
    /// Conditions met while loading
    pub diagnostics: Diagnostics,
}

impl Workspace {
    /// An engine whose diagnostics start with those raised while loading
    ///
    /// # Errors
    /// Returns an error if the absolute reference cannot be resolved.
    pub fn engine(&self) -> Result<CalibrationEngine<'_>> {
        Ok(
            CalibrationEngine::new(&self.store, &self.options, self.config.clone())?
                .with_prior_diagnostics(self.diagnostics.clone()),
        )
    }
}

/// Build the set store from a working directory
///
/// # Errors
/// Returns an error if the descriptor is missing or malformed, a table cannot be parsed, or a
/// set's declared membership is inconsistent.
pub fn build(working_directory: &Path) -> Result<Workspace> {
    let descriptor = Descriptor::from_file(&working_directory.join(DESCRIPTOR_FILE))?;
    let mut diagnostics = Diagnostics::new();
    let normalized = descriptor.normalize(&mut diagnostics)?;
    info!(
        "read {} sets ({} excluded) from {}",
        normalized.sets.len() + normalized.excluded.len(),
        normalized.excluded.len(),
        working_directory.display()
    );

    let mut store = SetStore::new();
    for set in normalized.sets {
        let table = process(working_directory, &set, normalized.engine.symmetry_tolerance)?;
        if table.is_none() {
            diagnostics.push(Diagnostic::MissingTables { set: set.id });
        }
        store.insert(set.into_calibration_set(table)?)?;
    }
    for mut excluded in normalized.excluded {
        if excluded.sensors.is_empty() {
            excluded.sensors = table_sensors(working_directory, excluded.id)?;
        }
        store.exclude(excluded)?;
    }

    Ok(Workspace {
        store,
        options: normalized.options,
        config: normalized.engine,
        diagnostics,
    })
}

/// The measured table of one set, if both of its files exist
fn process(
    working_directory: &Path,
    set: &NormalizedSet,
    tolerance: f64,
) -> Result<Option<PairTable>> {
    let directory = table_directory(working_directory, set.id);
    let offsets_path = directory.join(OFFSETS_FILE);
    let errors_path = directory.join(ERRORS_FILE);
    if !offsets_path.exists() || !errors_path.exists() {
        return Ok(None);
    }

    debug!("reading tables for set {} from {}", set.id, directory.display());
    let offsets = Matrix::from_file(&offsets_path, set.id)?;
    let errors = Matrix::from_file(&errors_path, set.id)?.reordered(&offsets.sensors, set.id)?;
    PairTable::from_matrices(set.id, offsets.sensors, offsets.values, errors.values, tolerance)
        .map(Some)
}

/// Sensors named in a set's offset table header; empty when the table is absent
fn table_sensors(working_directory: &Path, set: SetId) -> Result<BTreeSet<SensorId>> {
    let path = table_directory(working_directory, set).join(OFFSETS_FILE);
    if !path.exists() {
        return Ok(BTreeSet::new());
    }
    Ok(Matrix::from_file(&path, set)?.sensors.into_iter().collect())
}

pub fn table_directory(working_directory: &Path, set: SetId) -> PathBuf {
    working_directory.join(TABLES_DIR).join(set.to_string())
}

/// A labelled square matrix as read from disk
struct Matrix {
    sensors: Vec<SensorId>,
    values: Array2<f64>,
}

impl Matrix {
    fn from_file(path: &Path, set: SetId) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidTable { set, reason };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)?;

        let sensors = rdr
            .headers()?
            .iter()
            .skip(1)
            .map(|cell| parse_sensor(cell, set))
            .collect::<Result<Vec<_>>>()?;
        let index = sensors
            .iter()
            .enumerate()
            .map(|(ii, sensor)| (*sensor, ii))
            .collect::<HashMap<_, _>>();

        let n = sensors.len();
        let mut values = Array2::from_elem((n, n), f64::NAN);
        let mut seen = vec![false; n];
        for record in rdr.records() {
            let record = record?;
            let row = parse_sensor(record.get(0).unwrap_or_default(), set)?;
            let ii = *index.get(&row).ok_or_else(|| {
                invalid(format!("row {row} in {} has no matching column", path.display()))
            })?;
            if std::mem::replace(&mut seen[ii], true) {
                return Err(invalid(format!("row {row} appears twice in {}", path.display())));
            }
            for (jj, cell) in record.iter().skip(1).enumerate() {
                values[[ii, jj]] = parse_cell(cell).ok_or_else(|| {
                    invalid(format!("cell ({row}, {}) is not a number: {cell:?}", sensors[jj]))
                })?;
            }
        }

        Ok(Self { sensors, values })
    }

    /// Permute rows and columns into the order of `sensors`
    fn reordered(self, sensors: &[SensorId], set: SetId) -> Result<Self> {
        if self.sensors == sensors {
            return Ok(self);
        }
        let index = self
            .sensors
            .iter()
            .enumerate()
            .map(|(ii, sensor)| (*sensor, ii))
            .collect::<HashMap<_, _>>();
        let positions = sensors
            .iter()
            .map(|sensor| index.get(sensor).copied())
            .collect::<Option<Vec<_>>>()
            .filter(|positions| positions.len() == self.sensors.len())
            .ok_or_else(|| Error::InvalidTable {
                set,
                reason: "offset and error tables list different sensors".into(),
            })?;

        let n = positions.len();
        let values = Array2::from_shape_fn((n, n), |(ii, jj)| {
            self.values[[positions[ii], positions[jj]]]
        });
        Ok(Self {
            sensors: sensors.to_vec(),
            values,
        })
    }
}

fn parse_sensor(cell: &str, set: SetId) -> Result<SensorId> {
    let cell = cell.trim();
    cell.parse::<u32>()
        .ok()
        .or_else(|| cell.parse::<f64>().ok().and_then(integral_u32))
        .map(SensorId)
        .ok_or_else(|| Error::InvalidTable {
            set,
            reason: format!("{cell:?} is not a sensor id"),
        })
}

/// Undefined cells become NaN; `None` if the cell is not a number at all
fn parse_cell(cell: &str) -> Option<f64> {
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") {
        return Some(f64::NAN);
    }
    cell.parse::<f64>().ok()
}
