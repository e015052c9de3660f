//! The calibration-set store.
//!
//! A [`CalibrationSet`] is everything measured in one calibration session: which sensors took
//! part, which of them are carried up to the next round as bridges, which were discarded, and the
//! pairwise offset/error tables produced by aggregating the session's runs.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Opaque sensor identity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensorId(pub u32);

/// Canonical set identity, normalised once at ingestion
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SetId(pub u32);

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pairwise offsets and their uncertainties within one set.
///
/// `offset(a, b)` is the mean temperature difference `a - b`, and `error(a, b)` its uncertainty.
/// Undefined entries are stored as NaN and surface as `None`; they are never read as zero.
#[derive(Clone, Debug)]
pub struct PairTable {
    set: SetId,
    sensors: Vec<SensorId>,
    index: HashMap<SensorId, usize>,
    offsets: Array2<f64>,
    errors: Array2<f64>,
}

impl PairTable {
    /// A table in which every off-diagonal pair is undefined
    pub fn empty(set: SetId, sensors: impl IntoIterator<Item = SensorId>) -> Self {
        let mut ordered = vec![];
        let mut index = HashMap::new();
        for sensor in sensors {
            if !index.contains_key(&sensor) {
                index.insert(sensor, ordered.len());
                ordered.push(sensor);
            }
        }

        let n = ordered.len();
        let mut offsets = Array2::from_elem((n, n), f64::NAN);
        let mut errors = Array2::from_elem((n, n), f64::NAN);
        for ii in 0..n {
            offsets[[ii, ii]] = 0.0;
            errors[[ii, ii]] = 0.0;
        }

        Self {
            set,
            sensors: ordered,
            index,
            offsets,
            errors,
        }
    }

    /// Build a table from square matrices indexed in the order of `sensors`.
    ///
    /// A pair defined in only one direction is mirrored. Pairs defined in both directions must
    /// agree to within `tolerance`: offsets antisymmetric, errors symmetric.
    ///
    /// # Errors
    /// Returns an error on shape mismatch, duplicate sensors, a non-zero diagonal, negative or
    /// infinite values, or a broken symmetry invariant.
    pub fn from_matrices(
        set: SetId,
        sensors: Vec<SensorId>,
        mut offsets: Array2<f64>,
        mut errors: Array2<f64>,
        tolerance: f64,
    ) -> Result<Self> {
        let n = sensors.len();
        let invalid = |reason: String| Error::InvalidTable { set, reason };

        if offsets.dim() != (n, n) || errors.dim() != (n, n) {
            return Err(invalid(format!(
                "expected {n}x{n} matrices, found offsets {:?} and errors {:?}",
                offsets.dim(),
                errors.dim()
            )));
        }

        let mut index = HashMap::new();
        for (ii, sensor) in sensors.iter().enumerate() {
            if index.insert(*sensor, ii).is_some() {
                return Err(invalid(format!("sensor {sensor} appears twice")));
            }
        }

        for ii in 0..n {
            for matrix in [&mut offsets, &mut errors] {
                let diagonal = matrix[[ii, ii]];
                if !diagonal.is_nan() && diagonal != 0.0 {
                    return Err(invalid(format!(
                        "diagonal entry for sensor {} is {diagonal}",
                        sensors[ii]
                    )));
                }
                matrix[[ii, ii]] = 0.0;
            }
        }

        for ii in 0..n {
            for jj in (ii + 1)..n {
                let (a, b) = (sensors[ii], sensors[jj]);

                let forward = offsets[[ii, jj]];
                let backward = offsets[[jj, ii]];
                check_finite(set, forward, a, b)?;
                check_finite(set, backward, b, a)?;
                match (forward.is_nan(), backward.is_nan()) {
                    (false, false) if (forward + backward).abs() > tolerance => {
                        return Err(Error::AsymmetricTable {
                            set,
                            a,
                            b,
                            kind: "offset antisymmetry",
                        });
                    }
                    (false, true) => offsets[[jj, ii]] = -forward,
                    (true, false) => offsets[[ii, jj]] = -backward,
                    _ => {}
                }

                let forward = errors[[ii, jj]];
                let backward = errors[[jj, ii]];
                check_finite(set, forward, a, b)?;
                check_finite(set, backward, b, a)?;
                if forward < 0.0 || backward < 0.0 {
                    return Err(invalid(format!("negative error between {a} and {b}")));
                }
                match (forward.is_nan(), backward.is_nan()) {
                    (false, false) if (forward - backward).abs() > tolerance => {
                        return Err(Error::AsymmetricTable {
                            set,
                            a,
                            b,
                            kind: "error symmetry",
                        });
                    }
                    (false, true) => errors[[jj, ii]] = forward,
                    (true, false) => errors[[ii, jj]] = backward,
                    _ => {}
                }
            }
        }

        Ok(Self {
            set,
            sensors,
            index,
            offsets,
            errors,
        })
    }

    /// Record `offset(from, to)` and its error, writing the mirrored entry as well.
    ///
    /// # Errors
    /// Returns an error if either sensor is unknown, the pair is a self pair, or a value is not
    /// finite or the error is negative.
    pub fn insert(
        &mut self,
        from: SensorId,
        to: SensorId,
        offset: f64,
        error: Option<f64>,
    ) -> Result<()> {
        let set = self.set;
        let ii = self.position(from)?;
        let jj = self.position(to)?;
        if ii == jj {
            return Err(Error::InvalidTable {
                set,
                reason: format!("self pair for sensor {from}"),
            });
        }
        if !offset.is_finite() || error.is_some_and(|e| !e.is_finite() || e < 0.0) {
            return Err(Error::InvalidTable {
                set,
                reason: format!("non-finite or negative entry between {from} and {to}"),
            });
        }

        let error = error.unwrap_or(f64::NAN);
        self.offsets[[ii, jj]] = offset;
        self.offsets[[jj, ii]] = -offset;
        self.errors[[ii, jj]] = error;
        self.errors[[jj, ii]] = error;
        Ok(())
    }

    fn position(&self, sensor: SensorId) -> Result<usize> {
        self.index
            .get(&sensor)
            .copied()
            .ok_or(Error::NotAMember {
                set: self.set,
                sensor,
                role: "table entry",
            })
    }

    fn lookup(&self, matrix: &Array2<f64>, from: SensorId, to: SensorId) -> Option<f64> {
        let ii = *self.index.get(&from)?;
        let jj = *self.index.get(&to)?;
        let value = matrix[[ii, jj]];
        value.is_finite().then_some(value)
    }

    /// The mean difference `from - to`, if it was measured
    pub fn offset(&self, from: SensorId, to: SensorId) -> Option<f64> {
        self.lookup(&self.offsets, from, to)
    }

    /// The uncertainty of `offset(from, to)`, if known
    pub fn error(&self, from: SensorId, to: SensorId) -> Option<f64> {
        self.lookup(&self.errors, from, to)
    }

    pub const fn set(&self) -> SetId {
        self.set
    }

    pub fn sensors(&self) -> &[SensorId] {
        &self.sensors
    }

    pub fn contains(&self, sensor: SensorId) -> bool {
        self.index.contains_key(&sensor)
    }
}

fn check_finite(set: SetId, value: f64, a: SensorId, b: SensorId) -> Result<()> {
    if value.is_infinite() {
        return Err(Error::InvalidTable {
            set,
            reason: format!("infinite entry between {a} and {b}"),
        });
    }
    Ok(())
}

/// One calibration session and its measured tables
#[derive(Clone, Debug)]
pub struct CalibrationSet {
    id: SetId,
    round: u32,
    sensors: BTreeSet<SensorId>,
    /// Declared bridge ("raised") sensors in declaration order
    bridges: Vec<SensorId>,
    discarded: BTreeSet<SensorId>,
    /// Monitoring sensors repeated across sets, never auto-detected as bridges
    general_references: BTreeSet<SensorId>,
    parent: Option<SetId>,
    table: PairTable,
}

impl CalibrationSet {
    pub const fn id(&self) -> SetId {
        self.id
    }

    pub const fn round(&self) -> u32 {
        self.round
    }

    pub const fn sensors(&self) -> &BTreeSet<SensorId> {
        &self.sensors
    }

    pub fn bridges(&self) -> &[SensorId] {
        &self.bridges
    }

    pub const fn general_references(&self) -> &BTreeSet<SensorId> {
        &self.general_references
    }

    pub const fn parent(&self) -> Option<SetId> {
        self.parent
    }

    pub const fn table(&self) -> &PairTable {
        &self.table
    }

    pub fn contains(&self, sensor: SensorId) -> bool {
        self.sensors.contains(&sensor)
    }

    pub fn is_discarded(&self, sensor: SensorId) -> bool {
        self.discarded.contains(&sensor)
    }

    pub fn has_explicit_bridges(&self) -> bool {
        !self.bridges.is_empty()
    }
}

pub enum Tabled {}
pub enum Untabled {}

/// Builds a [`CalibrationSet`]; a table must be attached before the set can be built.
pub struct CalibrationSetBuilder<T> {
    id: SetId,
    round: u32,
    sensors: Vec<SensorId>,
    bridges: Vec<SensorId>,
    discarded: Vec<SensorId>,
    general_references: Vec<SensorId>,
    parent: Option<SetId>,
    table: Option<PairTable>,
    phantom_data: PhantomData<T>,
}

impl<T> CalibrationSetBuilder<T> {
    #[must_use]
    pub fn with_sensors(mut self, sensors: impl IntoIterator<Item = SensorId>) -> Self {
        self.sensors.extend(sensors);
        self
    }

    #[must_use]
    pub fn with_bridges(mut self, bridges: impl IntoIterator<Item = SensorId>) -> Self {
        for bridge in bridges {
            if !self.bridges.contains(&bridge) {
                self.bridges.push(bridge);
            }
        }
        self
    }

    #[must_use]
    pub fn with_discarded(mut self, discarded: impl IntoIterator<Item = SensorId>) -> Self {
        self.discarded.extend(discarded);
        self
    }

    #[must_use]
    pub fn with_general_references(
        mut self,
        references: impl IntoIterator<Item = SensorId>,
    ) -> Self {
        self.general_references.extend(references);
        self
    }

    #[must_use]
    pub const fn with_parent(mut self, parent: Option<SetId>) -> Self {
        self.parent = parent;
        self
    }
}

impl CalibrationSetBuilder<Untabled> {
    pub const fn new(id: SetId, round: u32) -> Self {
        Self {
            id,
            round,
            sensors: vec![],
            bridges: vec![],
            discarded: vec![],
            general_references: vec![],
            parent: None,
            table: None,
            phantom_data: PhantomData,
        }
    }

    pub fn with_table(self, table: PairTable) -> CalibrationSetBuilder<Tabled> {
        CalibrationSetBuilder {
            id: self.id,
            round: self.round,
            sensors: self.sensors,
            bridges: self.bridges,
            discarded: self.discarded,
            general_references: self.general_references,
            parent: self.parent,
            table: Some(table),
            phantom_data: PhantomData,
        }
    }
}

impl CalibrationSetBuilder<Tabled> {
    /// Validate membership and produce the set.
    ///
    /// Membership is the declared sensor list, or the table's sensors when none were declared.
    ///
    /// # Errors
    /// Returns an error if the round is zero, the table belongs to another set, or a bridge,
    /// discarded or general-reference id is not a member.
    pub fn build(self) -> Result<CalibrationSet> {
        let table = self.table.ok_or_else(|| Error::InvalidTable {
            set: self.id,
            reason: "no table attached".into(),
        })?;
        if self.round == 0 {
            return Err(Error::ZeroRound(self.id));
        }
        if table.set() != self.id {
            return Err(Error::InvalidTable {
                set: self.id,
                reason: format!("table was built for set {}", table.set()),
            });
        }

        let sensors: BTreeSet<SensorId> = if self.sensors.is_empty() {
            table.sensors().iter().copied().collect()
        } else {
            self.sensors.into_iter().collect()
        };

        for (ids, role) in [
            (&self.bridges, "bridge"),
            (&self.discarded, "discarded sensor"),
            (&self.general_references, "general reference"),
        ] {
            if let Some(sensor) = ids.iter().find(|sensor| !sensors.contains(sensor)) {
                return Err(Error::NotAMember {
                    set: self.id,
                    sensor: *sensor,
                    role,
                });
            }
        }

        Ok(CalibrationSet {
            id: self.id,
            round: self.round,
            sensors,
            bridges: self.bridges,
            discarded: self.discarded.into_iter().collect(),
            general_references: self.general_references.into_iter().collect(),
            parent: self.parent,
            table,
        })
    }
}

/// A set dropped before hierarchy construction because its round was unusable.
///
/// Its sensors are still reported by the engine so that no sensor disappears silently.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExcludedSet {
    pub id: SetId,
    pub sensors: BTreeSet<SensorId>,
    pub discarded: BTreeSet<SensorId>,
}

/// Owns every set; read-only once the hierarchy has been built
#[derive(Clone, Debug, Default)]
pub struct SetStore {
    sets: BTreeMap<SetId, CalibrationSet>,
    excluded: BTreeMap<SetId, ExcludedSet>,
}

impl SetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error if a set with the same id is already stored or excluded.
    pub fn insert(&mut self, set: CalibrationSet) -> Result<()> {
        self.check_unused(set.id)?;
        self.sets.insert(set.id, set);
        Ok(())
    }

    /// # Errors
    /// Returns an error if a set with the same id is already stored or excluded.
    pub fn exclude(&mut self, set: ExcludedSet) -> Result<()> {
        self.check_unused(set.id)?;
        self.excluded.insert(set.id, set);
        Ok(())
    }

    fn check_unused(&self, id: SetId) -> Result<()> {
        if self.sets.contains_key(&id) || self.excluded.contains_key(&id) {
            return Err(Error::SetAlreadyStored(id));
        }
        Ok(())
    }

    pub fn get(&self, id: SetId) -> Option<&CalibrationSet> {
        self.sets.get(&id)
    }

    /// Sets in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = &CalibrationSet> {
        self.sets.values()
    }

    pub fn excluded(&self) -> impl Iterator<Item = &ExcludedSet> {
        self.excluded.values()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn max_round(&self) -> Option<u32> {
        self.sets.values().map(CalibrationSet::round).max()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;
    use proptest::prelude::*;

    use super::{CalibrationSetBuilder, PairTable, SensorId, SetId, SetStore};
    use crate::error::Error;

    fn ids(raw: &[u32]) -> Vec<SensorId> {
        raw.iter().copied().map(SensorId).collect()
    }

    #[test]
    fn missing_entries_are_undefined_not_zero() {
        let table = PairTable::empty(SetId(1), ids(&[1, 2]));
        assert_eq!(table.offset(SensorId(1), SensorId(2)), None);
        assert_eq!(table.error(SensorId(1), SensorId(2)), None);
        assert_eq!(table.offset(SensorId(1), SensorId(1)), Some(0.0));
    }

    #[test]
    fn one_directional_entries_are_mirrored() {
        let nan = f64::NAN;
        let table = PairTable::from_matrices(
            SetId(3),
            ids(&[10, 20]),
            arr2(&[[0.0, 0.25], [nan, 0.0]]),
            arr2(&[[nan, nan], [0.01, nan]]),
            1e-9,
        )
        .unwrap();

        approx::assert_relative_eq!(table.offset(SensorId(20), SensorId(10)).unwrap(), -0.25);
        approx::assert_relative_eq!(table.error(SensorId(10), SensorId(20)).unwrap(), 0.01);
    }

    #[test]
    fn broken_antisymmetry_is_rejected() {
        let result = PairTable::from_matrices(
            SetId(3),
            ids(&[10, 20]),
            arr2(&[[0.0, 0.25], [0.25, 0.0]]),
            arr2(&[[0.0, 0.01], [0.01, 0.0]]),
            1e-9,
        );
        assert!(matches!(result, Err(Error::AsymmetricTable { .. })));
    }

    #[test]
    fn nonzero_diagonal_is_rejected() {
        let result = PairTable::from_matrices(
            SetId(3),
            ids(&[10]),
            arr2(&[[0.5]]),
            arr2(&[[0.0]]),
            1e-9,
        );
        assert!(matches!(result, Err(Error::InvalidTable { .. })));
    }

    #[test]
    fn bridges_must_be_members() {
        let table = PairTable::empty(SetId(1), ids(&[1, 2]));
        let result = CalibrationSetBuilder::new(SetId(1), 1)
            .with_bridges(ids(&[3]))
            .with_table(table)
            .build();
        assert!(matches!(
            result,
            Err(Error::NotAMember {
                sensor: SensorId(3),
                ..
            })
        ));
    }

    #[test]
    fn membership_defaults_to_table_sensors() {
        let table = PairTable::empty(SetId(1), ids(&[4, 5, 6]));
        let set = CalibrationSetBuilder::new(SetId(1), 2)
            .with_table(table)
            .build()
            .unwrap();
        assert_eq!(set.sensors().len(), 3);
        assert!(set.contains(SensorId(5)));
    }

    #[test]
    fn round_zero_is_rejected() {
        let result = CalibrationSetBuilder::new(SetId(3), 0)
            .with_table(PairTable::empty(SetId(3), ids(&[1, 2])))
            .build();
        assert!(matches!(result, Err(Error::ZeroRound(SetId(3)))));
    }

    #[test]
    fn duplicate_set_ids_are_rejected() {
        let build = || {
            CalibrationSetBuilder::new(SetId(7), 1)
                .with_table(PairTable::empty(SetId(7), ids(&[1])))
                .build()
                .unwrap()
        };
        let mut store = SetStore::new();
        store.insert(build()).unwrap();
        assert!(matches!(
            store.insert(build()),
            Err(Error::SetAlreadyStored(SetId(7)))
        ));
    }

    proptest! {
        #[test]
        fn inserted_offsets_are_antisymmetric_and_errors_symmetric(
            offset in -5.0..5.0f64,
            error in 0.0..1.0f64,
        ) {
            let mut table = PairTable::empty(SetId(1), ids(&[1, 2]));
            table.insert(SensorId(1), SensorId(2), offset, Some(error)).unwrap();

            let forward = table.offset(SensorId(1), SensorId(2)).unwrap();
            let backward = table.offset(SensorId(2), SensorId(1)).unwrap();
            prop_assert_eq!(forward, -backward);
            prop_assert_eq!(
                table.error(SensorId(1), SensorId(2)),
                table.error(SensorId(2), SensorId(1))
            );
        }
    }
}
