//! Per-sensor calibration against the absolute reference.
//!
//! The engine owns a validated [`Hierarchy`] over a read-only [`SetStore`]. Each sensor is an
//! independent job: enumerate its paths, chain them, combine them. Jobs fan out over rayon and
//! the results are collected back into `(set, sensor)` order, so a run is reproducible whatever
//! the scheduling.
use std::collections::BTreeMap;
use std::fmt;

use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;

use crate::chain::chain_all;
use crate::combine::{Combination, WeightedCombiner};
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::Result;
use crate::hierarchy::{Hierarchy, HierarchyBuilder, HierarchyOptions};
use crate::margin::Measurement;
use crate::paths::{Hop, PathEnumerator};
use crate::set::{SensorId, SetId, SetStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Status {
    /// Excluded by the experimenter; overrides every other status
    Discarded,
    /// The absolute reference, zero by definition
    Reference,
    /// No valid path reaches the reference
    NoConnection,
    Calculated,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Discarded => "Discarded",
            Self::Reference => "Reference",
            Self::NoConnection => "NoConnection",
            Self::Calculated => "Calculated",
        };
        f.write_str(label)
    }
}

/// A sensor's constant relative to the absolute reference
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CalibrationResult {
    pub sensor: SensorId,
    pub set: SetId,
    /// `None` for sets excluded for an unusable round
    pub round: Option<u32>,
    /// NaN unless the status is `Calculated` or `Reference`
    pub constant: f64,
    pub error: f64,
    pub n_paths: usize,
    pub status: Status,
    pub needs_review: bool,
}

impl CalibrationResult {
    fn unresolved(job: &Job, status: Status) -> Self {
        let undefined = Measurement::undefined();
        Self {
            sensor: job.sensor,
            set: job.set,
            round: job.round,
            constant: undefined.value,
            error: undefined.uncertainty,
            n_paths: 0,
            status,
            needs_review: false,
        }
    }
}

/// One row of the per-path detail table; path number 0 is the weighted combination
#[derive(Clone, Debug, PartialEq)]
pub struct PathRecord {
    pub sensor: SensorId,
    pub set: SetId,
    pub round: Option<u32>,
    pub path_number: usize,
    pub hops: Vec<Hop>,
    pub estimate: Measurement,
}

/// Per-set counts over a run's results
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SetSummary {
    pub set: SetId,
    pub round: Option<u32>,
    pub sensors: usize,
    pub calculated: usize,
    pub reference: usize,
    pub no_connection: usize,
    pub discarded: usize,
    /// Mean error over calculated sensors
    pub mean_error: Option<f64>,
    /// Mean number of valid paths over calculated sensors
    pub mean_paths: Option<f64>,
    pub flagged: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Calibration {
    pub results: Vec<CalibrationResult>,
    pub details: Vec<PathRecord>,
    pub diagnostics: Diagnostics,
}

impl Calibration {
    pub fn result(&self, set: SetId, sensor: SensorId) -> Option<&CalibrationResult> {
        self.results
            .binary_search_by_key(&(set, sensor), |result| (result.set, result.sensor))
            .ok()
            .map(|ii| &self.results[ii])
    }

    pub fn count(&self, status: Status) -> usize {
        self.results
            .iter()
            .filter(|result| result.status == status)
            .count()
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn summarize_by_set(&self) -> Vec<SetSummary> {
        let mut grouped: BTreeMap<SetId, Vec<&CalibrationResult>> = BTreeMap::new();
        for result in &self.results {
            grouped.entry(result.set).or_default().push(result);
        }

        grouped
            .into_iter()
            .map(|(set, results)| {
                let count = |status: Status| results.iter().filter(|r| r.status == status).count();
                let calculated = results
                    .iter()
                    .filter(|r| r.status == Status::Calculated)
                    .collect::<Vec<_>>();
                let mean = |values: Vec<f64>| {
                    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
                };
                SetSummary {
                    set,
                    round: results.first().and_then(|r| r.round),
                    sensors: results.len(),
                    calculated: calculated.len(),
                    reference: count(Status::Reference),
                    no_connection: count(Status::NoConnection),
                    discarded: count(Status::Discarded),
                    mean_error: mean(calculated.iter().map(|r| r.error).collect()),
                    mean_paths: mean(calculated.iter().map(|r| r.n_paths as f64).collect()),
                    flagged: results.iter().filter(|r| r.needs_review).count(),
                }
            })
            .collect()
    }
}

struct Job {
    set: SetId,
    round: Option<u32>,
    sensor: SensorId,
    /// The set was dropped before the hierarchy was built
    excluded: bool,
    discarded: bool,
}

struct Outcome {
    result: CalibrationResult,
    details: Vec<PathRecord>,
    missing_offsets: usize,
    flag: Option<Diagnostic>,
}

impl Outcome {
    const fn unresolved(result: CalibrationResult) -> Self {
        Self {
            result,
            details: vec![],
            missing_offsets: 0,
            flag: None,
        }
    }
}

pub struct CalibrationEngine<'a> {
    store: &'a SetStore,
    hierarchy: Hierarchy,
    combiner: WeightedCombiner,
    config: EngineConfig,
    diagnostics: Diagnostics,
}

impl<'a> CalibrationEngine<'a> {
    /// Validate and prune the hierarchy over `store`.
    ///
    /// # Errors
    /// Returns an error if the absolute reference cannot be resolved.
    pub fn new(
        store: &'a SetStore,
        options: &HierarchyOptions,
        config: EngineConfig,
    ) -> Result<Self> {
        let mut diagnostics = Diagnostics::new();
        let hierarchy = HierarchyBuilder::new(store, options)
            .with_max_bridges(config.max_bridges_per_set)
            .build(&mut diagnostics)?;
        Ok(Self {
            store,
            hierarchy,
            combiner: WeightedCombiner::from_config(&config),
            config,
            diagnostics,
        })
    }

    /// Put `prior` ahead of the diagnostics raised while building the hierarchy
    #[must_use]
    pub fn with_prior_diagnostics(mut self, prior: Diagnostics) -> Self {
        let mut diagnostics = prior;
        diagnostics.extend(std::mem::take(&mut self.diagnostics));
        self.diagnostics = diagnostics;
        self
    }

    pub const fn hierarchy(&self) -> &Hierarchy {
        &self.hierarchy
    }

    /// Diagnostics raised while building the hierarchy
    pub const fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Calibrate every sensor of every set, including sets pruned or excluded.
    pub fn run(&self) -> Calibration {
        let jobs = self.jobs();
        let outcomes: Vec<Outcome> = if self.config.parallel {
            jobs.par_iter().map(|job| self.calibrate(job)).collect()
        } else {
            jobs.iter().map(|job| self.calibrate(job)).collect()
        };

        let mut diagnostics = self.diagnostics.clone();
        let mut results = Vec::with_capacity(outcomes.len());
        let mut details = vec![];
        for outcome in outcomes {
            diagnostics.count_missing_offsets(outcome.missing_offsets);
            if let Some(flag) = outcome.flag {
                diagnostics.push(flag);
            }
            results.push(outcome.result);
            details.extend(outcome.details);
        }
        results.sort_by_key(|result| (result.set, result.sensor));
        details.sort_by_key(|record| (record.set, record.sensor, record.path_number));

        let calibration = Calibration {
            results,
            details,
            diagnostics,
        };
        info!(
            "calibrated {} sensors: {} calculated, {} without connection, {} discarded, {} missing offsets",
            calibration.results.len(),
            calibration.count(Status::Calculated),
            calibration.count(Status::NoConnection),
            calibration.count(Status::Discarded),
            calibration.diagnostics.missing_offsets()
        );
        calibration
    }

    /// Calibrate one sensor of one set; `None` if `sensor` is not a member of `set`.
    pub fn calibrate_sensor(&self, set: SetId, sensor: SensorId) -> Option<CalibrationResult> {
        self.jobs()
            .into_iter()
            .find(|job| job.set == set && job.sensor == sensor)
            .map(|job| self.calibrate(&job).result)
    }

    fn jobs(&self) -> Vec<Job> {
        let stored = self.store.iter().flat_map(|set| {
            set.sensors().iter().map(move |&sensor| Job {
                set: set.id(),
                round: Some(set.round()),
                sensor,
                excluded: false,
                discarded: set.is_discarded(sensor),
            })
        });
        let excluded = self.store.excluded().flat_map(|set| {
            set.sensors.iter().map(move |&sensor| Job {
                set: set.id,
                round: None,
                sensor,
                excluded: true,
                discarded: set.discarded.contains(&sensor),
            })
        });
        stored.chain(excluded).collect()
    }

    fn calibrate(&self, job: &Job) -> Outcome {
        if job.discarded {
            return Outcome::unresolved(CalibrationResult::unresolved(job, Status::Discarded));
        }

        let root = self.hierarchy.root();
        if job.set == root.set && job.sensor == root.reference {
            return Outcome::unresolved(CalibrationResult {
                constant: 0.0,
                error: 0.0,
                ..CalibrationResult::unresolved(job, Status::Reference)
            });
        }

        if job.excluded || self.hierarchy.is_pruned(job.set) {
            return Outcome::unresolved(CalibrationResult::unresolved(job, Status::NoConnection));
        }

        let enumeration =
            PathEnumerator::new(self.store, &self.hierarchy).enumerate(job.sensor, job.set);
        let (chained, rejected) = chain_all(enumeration.paths);
        let missing_offsets = enumeration.missing_offsets + rejected;
        let estimates = chained.iter().map(|path| path.estimate).collect::<Vec<_>>();

        let Some(combination) = self.combiner.combine(&estimates) else {
            debug!("sensor {} in set {}: no valid path", job.sensor, job.set);
            return Outcome {
                missing_offsets,
                ..Outcome::unresolved(CalibrationResult::unresolved(job, Status::NoConnection))
            };
        };
        debug!(
            "sensor {} in set {}: {} paths, {:.6} +/- {:.6}",
            job.sensor,
            job.set,
            combination.n_paths,
            combination.estimate.value,
            combination.estimate.uncertainty
        );

        let record = |path_number, hops, estimate| PathRecord {
            sensor: job.sensor,
            set: job.set,
            round: job.round,
            path_number,
            hops,
            estimate,
        };
        let mut details = vec![record(0, vec![], combination.estimate)];
        details.extend(
            chained
                .into_iter()
                .enumerate()
                .map(|(ii, path)| record(ii + 1, path.hops, path.estimate)),
        );

        Outcome {
            flag: self.spread_flag(job, &combination),
            result: CalibrationResult {
                sensor: job.sensor,
                set: job.set,
                round: job.round,
                constant: combination.estimate.value,
                error: combination.estimate.uncertainty,
                n_paths: combination.n_paths,
                status: Status::Calculated,
                needs_review: combination.needs_review,
            },
            details,
            missing_offsets,
        }
    }

    fn spread_flag(&self, job: &Job, combination: &Combination) -> Option<Diagnostic> {
        combination.needs_review.then(|| Diagnostic::SpreadExceeded {
            set: job.set,
            sensor: job.sensor,
            std: combination.spread_std,
            threshold: self.config.spread_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{CalibrationEngine, Status};
    use crate::config::EngineConfig;
    use crate::diagnostics::Diagnostic;
    use crate::hierarchy::{Edge, HierarchyOptions};
    use crate::set::{PairTable, SensorId, SetId, SetStore};
    use crate::test_utils::{consistent_set, fixture_store, true_temperature, SetSpec};

    fn run(store: &SetStore, config: EngineConfig) -> super::Calibration {
        CalibrationEngine::new(store, &HierarchyOptions::default(), config)
            .unwrap()
            .run()
    }

    #[test]
    fn consistent_offsets_recover_true_temperature_differences() {
        let store = fixture_store(0.01);
        let calibration = run(&store, EngineConfig::default());
        let reference = true_temperature(SensorId(301));

        for result in calibration
            .results
            .iter()
            .filter(|r| r.status == Status::Calculated)
        {
            approx::assert_relative_eq!(
                result.constant,
                true_temperature(result.sensor) - reference,
                epsilon = 1e-12
            );
            assert!(!result.needs_review);
        }
        assert_eq!(calibration.result(SetId(10), SensorId(1)).unwrap().n_paths, 4);
    }

    #[test]
    fn statuses_follow_precedence() {
        let store = fixture_store(0.01);
        let calibration = run(&store, EngineConfig::default());
        let status = |set, sensor| {
            calibration
                .result(SetId(set), SensorId(sensor))
                .unwrap()
                .status
        };

        assert_eq!(status(30, 301), Status::Reference);
        assert_eq!(status(10, 3), Status::Discarded);
        assert_eq!(status(12, 6), Status::NoConnection);
        assert_eq!(status(30, 203), Status::Calculated);

        let reference = calibration.result(SetId(30), SensorId(301)).unwrap();
        approx::assert_relative_eq!(reference.constant, 0.0);
        approx::assert_relative_eq!(reference.error, 0.0);

        let unresolved = calibration.result(SetId(12), SensorId(6)).unwrap();
        assert!(unresolved.constant.is_nan() && unresolved.error.is_nan());
        assert_eq!(unresolved.n_paths, 0);
    }

    #[test]
    fn every_member_appears_exactly_once() {
        let store = fixture_store(0.01);
        let calibration = run(&store, EngineConfig::default());
        let members = store.iter().map(|set| set.sensors().len()).sum::<usize>();
        assert_eq!(calibration.results.len(), members);
    }

    #[test]
    fn equal_paths_shrink_the_combined_error() {
        let store = fixture_store(0.01);
        let calibration = run(&store, EngineConfig::default());
        // four three-hop paths of 0.01 per hop
        let lowest = calibration.result(SetId(10), SensorId(1)).unwrap().error;
        approx::assert_relative_eq!(lowest, 3f64.sqrt() * 0.01 / 2.0, epsilon = 1e-12);
        // a single closing hop
        let top = calibration.result(SetId(30), SensorId(203)).unwrap().error;
        approx::assert_relative_eq!(top, 0.01, epsilon = 1e-12);
    }

    #[test]
    fn parallel_and_serial_runs_agree() {
        let store = fixture_store(0.01);
        let parallel = run(&store, EngineConfig::default());
        let serial = run(
            &store,
            EngineConfig {
                parallel: false,
                ..EngineConfig::default()
            },
        );
        assert_eq!(parallel.details, serial.details);
        assert_eq!(parallel.diagnostics, serial.diagnostics);
        for (a, b) in parallel.results.iter().zip(&serial.results) {
            assert_eq!((a.set, a.sensor, a.status), (b.set, b.sensor, b.status));
            assert_eq!(a.constant.to_bits(), b.constant.to_bits());
        }
    }

    #[test]
    fn combination_row_precedes_paths_in_details() {
        let store = fixture_store(0.01);
        let calibration = run(&store, EngineConfig::default());
        let rows = calibration
            .details
            .iter()
            .filter(|record| record.set == SetId(10) && record.sensor == SensorId(1))
            .map(|record| (record.path_number, record.hops.len()))
            .collect::<Vec<_>>();
        assert_eq!(rows, vec![(0, 0), (1, 3), (2, 3), (3, 3), (4, 3)]);
    }

    #[test]
    fn inconsistent_paths_are_flagged_for_review() {
        let mut store = SetStore::new();
        store
            .insert(consistent_set(&SetSpec::new(20, 2, &[201, 202, 203], &[201]), 0.01))
            .unwrap();

        let mut table = PairTable::empty(SetId(10), [1, 202, 203].map(SensorId));
        table.insert(SensorId(1), SensorId(202), 0.10, Some(0.01)).unwrap();
        table.insert(SensorId(1), SensorId(203), 0.30, Some(0.01)).unwrap();
        store
            .insert(
                crate::set::CalibrationSetBuilder::new(SetId(10), 1)
                    .with_bridges([SensorId(202), SensorId(203)])
                    .with_table(table)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let calibration = run(&store, EngineConfig::default());
        let result = calibration.result(SetId(10), SensorId(1)).unwrap();
        assert_eq!(result.status, Status::Calculated);
        assert!(result.needs_review);
        assert!(calibration.diagnostics.entries().iter().any(|entry| matches!(
            entry,
            Diagnostic::SpreadExceeded { sensor: SensorId(1), .. }
        )));

        let summary = calibration.summarize_by_set();
        let lower = summary.iter().find(|s| s.set == SetId(10)).unwrap();
        // 202 and 203 were never measured against each other
        assert_eq!(lower.flagged, 1);
        assert_eq!((lower.calculated, lower.no_connection), (1, 2));
        assert!(calibration.diagnostics.missing_offsets() >= 2);
    }

    #[test]
    fn single_sensor_matches_the_full_run() {
        let store = fixture_store(0.01);
        let engine =
            CalibrationEngine::new(&store, &HierarchyOptions::default(), EngineConfig::default())
                .unwrap();
        let calibration = engine.run();
        for (set, sensor) in [(10, 1), (20, 205), (30, 301)] {
            assert_eq!(
                engine.calibrate_sensor(SetId(set), SensorId(sensor)).as_ref(),
                calibration.result(SetId(set), SensorId(sensor))
            );
        }
        let discarded = engine.calibrate_sensor(SetId(10), SensorId(3)).unwrap();
        assert_eq!(discarded.status, Status::Discarded);
        assert_eq!(engine.calibrate_sensor(SetId(10), SensorId(301)), None);
    }

    #[test]
    fn auto_detected_bridge_carries_sensors_upward() {
        let mut store = SetStore::new();
        store
            .insert(consistent_set(&SetSpec::new(20, 2, &[201, 101, 900], &[201]), 0.01))
            .unwrap();
        store
            .insert(consistent_set(&SetSpec::new(10, 1, &[1, 101, 900], &[]), 0.01))
            .unwrap();
        let options = HierarchyOptions {
            general_references: [SensorId(900)].into(),
            ..HierarchyOptions::default()
        };

        let engine = CalibrationEngine::new(&store, &options, EngineConfig::default()).unwrap();
        assert_eq!(
            engine.hierarchy().edges(),
            [Edge {
                lower: SetId(10),
                upper: SetId(20),
                bridges: vec![SensorId(101)],
            }]
        );

        let calibration = engine.run();
        let result = calibration.result(SetId(10), SensorId(1)).unwrap();
        assert_eq!(result.status, Status::Calculated);
        assert_eq!(result.n_paths, 1);
        approx::assert_relative_eq!(
            result.constant,
            true_temperature(SensorId(1)) - true_temperature(SensorId(201)),
            epsilon = 1e-12
        );
    }

    #[test]
    fn summary_counts_statuses_per_set() {
        let store = fixture_store(0.01);
        let summary = run(&store, EngineConfig::default()).summarize_by_set();

        let lower = summary.iter().find(|s| s.set == SetId(10)).unwrap();
        assert_eq!((lower.sensors, lower.discarded, lower.calculated), (5, 1, 4));
        let pruned = summary.iter().find(|s| s.set == SetId(12)).unwrap();
        assert_eq!(pruned.no_connection, 3);
        assert_eq!(pruned.mean_error, None);
        let root = summary.iter().find(|s| s.set == SetId(30)).unwrap();
        assert_eq!(root.reference, 1);
    }
}
