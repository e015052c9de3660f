//! CSV output for results, per-path details and per-set summaries.
use std::fs::File;
use std::io;
use std::path::Path;

use serde::Serialize;

use crate::engine::{CalibrationResult, PathRecord, SetSummary, Status};
use crate::error::Result;

#[derive(Serialize)]
struct ResultRow {
    #[serde(rename = "Sensor")]
    sensor: u32,
    #[serde(rename = "Set")]
    set: u32,
    #[serde(rename = "Round")]
    round: Option<u32>,
    #[serde(rename = "Constant")]
    constant: f64,
    #[serde(rename = "Error")]
    error: f64,
    #[serde(rename = "N_Paths")]
    n_paths: usize,
    #[serde(rename = "Status")]
    status: Status,
}

impl From<&CalibrationResult> for ResultRow {
    fn from(result: &CalibrationResult) -> Self {
        Self {
            sensor: result.sensor.0,
            set: result.set.0,
            round: result.round,
            constant: result.constant,
            error: result.error,
            n_paths: result.n_paths,
            status: result.status,
        }
    }
}

/// Write one row per `(set, sensor)`; unresolved constants are written as `NaN`.
///
/// # Errors
/// Returns an error if a row cannot be written.
pub fn write_results<W: io::Write>(writer: W, results: &[CalibrationResult]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for result in results {
        writer.serialize(ResultRow::from(result))?;
    }
    writer.flush()?;
    Ok(())
}

/// Write one row per path plus a path-0 row holding each sensor's weighted combination.
///
/// Hop columns are padded to the longest path in `details`.
///
/// # Errors
/// Returns an error if a row cannot be written.
pub fn write_details<W: io::Write>(writer: W, details: &[PathRecord]) -> Result<()> {
    let width = details
        .iter()
        .map(|record| record.hops.len())
        .max()
        .unwrap_or(0);

    let mut header = vec![
        "Sensor".to_owned(),
        "Set".to_owned(),
        "Round".to_owned(),
        "Path_Number".to_owned(),
    ];
    for ii in 1..=width {
        header.extend(
            ["From", "To", "Set", "Offset", "Error"]
                .map(|column| format!("Hop{ii}_{column}")),
        );
    }
    header.extend(["Total_Offset".to_owned(), "Total_Error".to_owned()]);

    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(&header)?;
    for record in details {
        let mut row = vec![
            record.sensor.to_string(),
            record.set.to_string(),
            record.round.map_or_else(String::new, |round| round.to_string()),
            record.path_number.to_string(),
        ];
        for ii in 0..width {
            match record.hops.get(ii) {
                Some(hop) => row.extend([
                    hop.from.to_string(),
                    hop.to.to_string(),
                    hop.set.to_string(),
                    hop.offset.to_string(),
                    hop.error.map_or_else(String::new, |error| error.to_string()),
                ]),
                None => row.extend(std::iter::repeat(String::new()).take(5)),
            }
        }
        row.push(record.estimate.value.to_string());
        row.push(record.estimate.uncertainty.to_string());
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct SummaryRow {
    #[serde(rename = "Set")]
    set: u32,
    #[serde(rename = "Round")]
    round: Option<u32>,
    #[serde(rename = "Sensors")]
    sensors: usize,
    #[serde(rename = "Calculated")]
    calculated: usize,
    #[serde(rename = "Reference")]
    reference: usize,
    #[serde(rename = "NoConnection")]
    no_connection: usize,
    #[serde(rename = "Discarded")]
    discarded: usize,
    #[serde(rename = "Mean_Error")]
    mean_error: Option<f64>,
    #[serde(rename = "Mean_Paths")]
    mean_paths: Option<f64>,
    #[serde(rename = "Flagged")]
    flagged: usize,
}

/// # Errors
/// Returns an error if a row cannot be written.
pub fn write_summary<W: io::Write>(writer: W, summaries: &[SetSummary]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for summary in summaries {
        writer.serialize(SummaryRow {
            set: summary.set.0,
            round: summary.round,
            sensors: summary.sensors,
            calculated: summary.calculated,
            reference: summary.reference,
            no_connection: summary.no_connection,
            discarded: summary.discarded,
            mean_error: summary.mean_error,
            mean_paths: summary.mean_paths,
            flagged: summary.flagged,
        })?;
    }
    writer.flush()?;
    Ok(())
}

/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_results_to_path(path: &Path, results: &[CalibrationResult]) -> Result<()> {
    write_results(File::create(path)?, results)
}

/// # Errors
/// Returns an error if the file cannot be created or written.
pub fn write_details_to_path(path: &Path, details: &[PathRecord]) -> Result<()> {
    write_details(File::create(path)?, details)
}

#[cfg(test)]
mod tests {
    use super::{write_details, write_results, write_summary};
    use crate::config::EngineConfig;
    use crate::engine::CalibrationEngine;
    use crate::hierarchy::HierarchyOptions;
    use crate::test_utils::fixture_store;

    fn exported() -> (String, String) {
        let store = fixture_store(0.01);
        let calibration =
            CalibrationEngine::new(&store, &HierarchyOptions::default(), EngineConfig::default())
                .unwrap()
                .run();

        let mut results = vec![];
        write_results(&mut results, &calibration.results).unwrap();
        let mut details = vec![];
        write_details(&mut details, &calibration.details).unwrap();
        (
            String::from_utf8(results).unwrap(),
            String::from_utf8(details).unwrap(),
        )
    }

    #[test]
    fn result_table_has_fixed_columns_and_nan_sentinels() {
        let (results, _) = exported();
        let mut lines = results.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Sensor,Set,Round,Constant,Error,N_Paths,Status"
        );
        assert!(results.contains("301,30,3,0.0,0.0,0,Reference"));
        assert!(results.contains("3,10,1,NaN,NaN,0,Discarded"));
        assert!(results.contains("6,12,1,NaN,NaN,0,NoConnection"));
    }

    #[test]
    fn detail_rows_are_padded_to_the_longest_path() {
        let (_, details) = exported();
        let mut reader = csv::Reader::from_reader(details.as_bytes());
        let header = reader.headers().unwrap().clone();
        // three hops of five columns, plus identity and totals
        assert_eq!(header.len(), 4 + 3 * 5 + 2);
        for record in reader.records() {
            assert_eq!(record.unwrap().len(), header.len());
        }
    }

    #[test]
    fn summary_has_one_row_per_set() {
        let store = fixture_store(0.01);
        let calibration =
            CalibrationEngine::new(&store, &HierarchyOptions::default(), EngineConfig::default())
                .unwrap()
                .run();
        let mut summary = vec![];
        write_summary(&mut summary, &calibration.summarize_by_set()).unwrap();
        let summary = String::from_utf8(summary).unwrap();

        assert_eq!(summary.lines().count(), 1 + store.len());
        // set 12 was pruned, so it has no mean error
        assert!(summary.contains("\n12,1,3,0,0,3,0,,,0\n"));
    }

    #[test]
    fn export_is_byte_identical_across_runs() {
        assert_eq!(exported(), exported());
    }
}
