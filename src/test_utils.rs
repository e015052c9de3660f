//! Synthetic hierarchies whose offsets all derive from one set of true temperatures, so every
//! path through them must agree exactly.
use crate::set::{CalibrationSet, CalibrationSetBuilder, PairTable, SensorId, SetId, SetStore};

pub(crate) struct SetSpec {
    id: u32,
    round: u32,
    sensors: Vec<u32>,
    bridges: Vec<u32>,
    discarded: Vec<u32>,
    parent: Option<u32>,
}

impl SetSpec {
    pub(crate) fn new(id: u32, round: u32, sensors: &[u32], bridges: &[u32]) -> Self {
        Self {
            id,
            round,
            sensors: sensors.to_vec(),
            bridges: bridges.to_vec(),
            discarded: vec![],
            parent: None,
        }
    }

    pub(crate) fn discarding(mut self, discarded: &[u32]) -> Self {
        self.discarded = discarded.to_vec();
        self
    }

    pub(crate) const fn with_parent(mut self, parent: u32) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// The temperature sensor `sensor` actually read during every session
pub(crate) fn true_temperature(sensor: SensorId) -> f64 {
    (f64::from(sensor.0) * 0.0137).sin() * 0.25
}

/// A set whose table holds `T(a) - T(b)` for every pair, each with the same `error`
pub(crate) fn consistent_set(spec: &SetSpec, error: f64) -> CalibrationSet {
    let id = SetId(spec.id);
    let sensors = spec.sensors.iter().copied().map(SensorId).collect::<Vec<_>>();
    let mut table = PairTable::empty(id, sensors.iter().copied());
    for (ii, &a) in sensors.iter().enumerate() {
        for &b in &sensors[ii + 1..] {
            table
                .insert(a, b, true_temperature(a) - true_temperature(b), Some(error))
                .unwrap();
        }
    }

    CalibrationSetBuilder::new(id, spec.round)
        .with_sensors(sensors)
        .with_bridges(spec.bridges.iter().copied().map(SensorId))
        .with_discarded(spec.discarded.iter().copied().map(SensorId))
        .with_parent(spec.parent.map(SetId))
        .with_table(table)
        .build()
        .unwrap()
}

/// Three rounds: root 30 over sets 20 and 21, which carry sets 10 and 11. Set 12 bridges into
/// nothing and is pruned; sensor 3 is discarded in set 10.
pub(crate) fn fixture_store(error: f64) -> SetStore {
    let specs = [
        SetSpec::new(30, 3, &[301, 201, 202, 203, 204], &[301]),
        SetSpec::new(20, 2, &[201, 202, 205, 101, 102], &[201, 202]),
        SetSpec::new(21, 2, &[203, 204, 111, 112], &[203, 204]),
        SetSpec::new(10, 1, &[1, 2, 3, 101, 102], &[101, 102]).discarding(&[3]),
        SetSpec::new(11, 1, &[4, 5, 111, 112], &[111, 112]),
        SetSpec::new(12, 1, &[6, 7, 121], &[121]),
    ];

    let mut store = SetStore::new();
    for spec in &specs {
        store.insert(consistent_set(spec, error)).unwrap();
    }
    store
}
