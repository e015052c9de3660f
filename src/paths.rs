//! Enumeration of every bridge chain from a sensor to the absolute reference.
//!
//! A path starts at a sensor in its home set, hops inside that set to one of its bridges, rises
//! with that bridge into a set one round above, and repeats until it reaches the root, where a
//! final hop lands on the reference. Every edge climbs exactly one round, so the walk is bounded
//! by the number of rounds and cannot revisit a set.
use serde::Serialize;

use crate::hierarchy::{Hierarchy, Root};
use crate::set::{SensorId, SetId, SetStore};

/// One table lookup along a path
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Hop {
    pub from: SensorId,
    pub to: SensorId,
    pub set: SetId,
    /// `offset(from, to)` in `set`
    pub offset: f64,
    /// Its uncertainty; `None` when the table holds no error for a measured offset
    pub error: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnumeratedPath {
    pub total_offset: f64,
    pub hops: Vec<Hop>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Enumeration {
    pub paths: Vec<EnumeratedPath>,
    /// Branches abandoned because an offset was never measured
    pub missing_offsets: usize,
}

impl Enumeration {
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

struct Frame {
    set: SetId,
    current: SensorId,
    offset: f64,
    hops: Vec<Hop>,
}

pub struct PathEnumerator<'a> {
    store: &'a SetStore,
    hierarchy: &'a Hierarchy,
}

impl<'a> PathEnumerator<'a> {
    pub const fn new(store: &'a SetStore, hierarchy: &'a Hierarchy) -> Self {
        Self { store, hierarchy }
    }

    /// All paths from `sensor` in `home` to the reference, in bridge declaration order.
    ///
    /// Nothing is enumerated for a sensor discarded in `home`, a non-member, or a pruned set. The
    /// reference itself, started in the root, yields the single zero hop.
    pub fn enumerate(&self, sensor: SensorId, home: SetId) -> Enumeration {
        let mut enumeration = Enumeration::default();
        let Some(set) = self.store.get(home) else {
            return enumeration;
        };
        if !set.contains(sensor) || set.is_discarded(sensor) || !self.hierarchy.contains(home) {
            return enumeration;
        }

        let root = self.hierarchy.root();
        let mut stack = vec![Frame {
            set: home,
            current: sensor,
            offset: 0.0,
            hops: vec![],
        }];
        while let Some(frame) = stack.pop() {
            if frame.set == root.set {
                match self.close(frame, root) {
                    Some(path) => enumeration.paths.push(path),
                    None => enumeration.missing_offsets += 1,
                }
                continue;
            }
            let children = self.branch(&frame, &mut enumeration.missing_offsets);
            stack.extend(children.into_iter().rev());
        }
        enumeration
    }

    /// The closing hop onto the reference inside the root
    fn close(&self, mut frame: Frame, root: Root) -> Option<EnumeratedPath> {
        let hop = if frame.current == root.reference {
            Hop {
                from: frame.current,
                to: root.reference,
                set: root.set,
                offset: 0.0,
                error: Some(0.0),
            }
        } else {
            let table = self.store.get(root.set)?.table();
            Hop {
                from: frame.current,
                to: root.reference,
                set: root.set,
                offset: table.offset(frame.current, root.reference)?,
                error: table.error(frame.current, root.reference),
            }
        };
        frame.hops.push(hop);
        Some(EnumeratedPath {
            total_offset: frame.offset + hop.offset,
            hops: frame.hops,
        })
    }

    /// Frames one round up, one per usable (bridge, upper set) pair
    fn branch(&self, frame: &Frame, missing_offsets: &mut usize) -> Vec<Frame> {
        let Some(set) = self.store.get(frame.set) else {
            return vec![];
        };
        let table = set.table();

        let mut children = vec![];
        for &bridge in self.hierarchy.bridges(frame.set) {
            if bridge == frame.current || set.is_discarded(bridge) {
                continue;
            }
            let Some(offset) = table.offset(frame.current, bridge) else {
                *missing_offsets += 1;
                continue;
            };
            let hop = Hop {
                from: frame.current,
                to: bridge,
                set: frame.set,
                offset,
                error: table.error(frame.current, bridge),
            };

            for edge in self
                .hierarchy
                .edges_above(frame.set)
                .filter(|edge| edge.bridges.contains(&bridge))
            {
                let usable_above = self
                    .store
                    .get(edge.upper)
                    .is_some_and(|upper| !upper.is_discarded(bridge));
                if !usable_above {
                    continue;
                }
                let mut hops = frame.hops.clone();
                hops.push(hop);
                children.push(Frame {
                    set: edge.upper,
                    current: bridge,
                    offset: frame.offset + offset,
                    hops,
                });
            }
        }
        children
    }
}
