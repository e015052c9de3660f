//! Round-layered connectivity between sets.
//!
//! Sets are layered by round. An edge joins a set to a set exactly one round above through the
//! bridge sensors the two share. The single set of the highest round is the root and holds the
//! absolute reference sensor. Anything not connected to the root is pruned before a single path is
//! enumerated.
//!
//! Nodes and edges live in an arena: edges are stored once and nodes refer to them by index, so
//! the graph can be shared read-only across worker threads.
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use log::{debug, info};

use crate::diagnostics::{Diagnostic, Diagnostics, DisconnectReason};
use crate::error::{Error, Result};
use crate::set::{CalibrationSet, SensorId, SetId, SetStore};

/// Hierarchy-wide settings that are not properties of any one set
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HierarchyOptions {
    /// Overrides the root set's first declared bridge as the absolute reference
    pub reference_sensor: Option<SensorId>,
    /// Monitoring sensors shared by many sets; never auto-detected as bridges
    pub general_references: BTreeSet<SensorId>,
}

/// Bridges carrying a set's sensors one round up into `upper`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    pub lower: SetId,
    pub upper: SetId,
    pub bridges: Vec<SensorId>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Root {
    pub set: SetId,
    pub round: u32,
    pub reference: SensorId,
}

#[derive(Clone, Debug, Default)]
struct Node {
    round: u32,
    /// Declared bridges, or the union of auto-detected ones
    bridges: Vec<SensorId>,
    above: Vec<usize>,
    below: Vec<usize>,
}

/// The validated, pruned hierarchy
#[derive(Clone, Debug)]
pub struct Hierarchy {
    root: Root,
    nodes: BTreeMap<SetId, Node>,
    edges: Vec<Edge>,
    pruned: BTreeMap<SetId, DisconnectReason>,
}

impl Hierarchy {
    pub const fn root(&self) -> Root {
        self.root
    }

    /// Whether `set` survived pruning
    pub fn contains(&self, set: SetId) -> bool {
        self.nodes.contains_key(&set)
    }

    pub fn is_pruned(&self, set: SetId) -> bool {
        self.pruned.contains_key(&set)
    }

    pub fn pruned(&self) -> impl Iterator<Item = (SetId, DisconnectReason)> + '_ {
        self.pruned.iter().map(|(set, reason)| (*set, *reason))
    }

    pub fn round(&self, set: SetId) -> Option<u32> {
        self.nodes.get(&set).map(|node| node.round)
    }

    /// Bridges through which sensors of `set` leave it; empty for pruned sets and the root
    pub fn bridges(&self, set: SetId) -> &[SensorId] {
        self.nodes
            .get(&set)
            .map(|node| node.bridges.as_slice())
            .unwrap_or_default()
    }

    pub fn edges_above(&self, set: SetId) -> impl Iterator<Item = &Edge> + '_ {
        self.edge_refs(set, |node| &node.above)
    }

    pub fn edges_below(&self, set: SetId) -> impl Iterator<Item = &Edge> + '_ {
        self.edge_refs(set, |node| &node.below)
    }

    fn edge_refs<'a>(
        &'a self,
        set: SetId,
        select: impl Fn(&'a Node) -> &'a Vec<usize>,
    ) -> impl Iterator<Item = &'a Edge> + 'a {
        self.nodes
            .get(&set)
            .map(select)
            .into_iter()
            .flatten()
            .map(move |&ii| &self.edges[ii])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }
}

pub struct HierarchyBuilder<'a> {
    store: &'a SetStore,
    options: &'a HierarchyOptions,
    max_bridges: usize,
}

impl<'a> HierarchyBuilder<'a> {
    pub const fn new(store: &'a SetStore, options: &'a HierarchyOptions) -> Self {
        Self {
            store,
            options,
            max_bridges: 8,
        }
    }

    #[must_use]
    pub const fn with_max_bridges(mut self, max_bridges: usize) -> Self {
        self.max_bridges = max_bridges;
        self
    }

    /// Resolve the root, derive every edge and prune what cannot reach the root.
    ///
    /// # Errors
    /// Returns [`Error::NoReference`] if no single top-round set exists or the absolute
    /// reference cannot be resolved inside it.
    pub fn build(&self, diagnostics: &mut Diagnostics) -> Result<Hierarchy> {
        let root = self.resolve_root()?;

        let mut nodes: BTreeMap<SetId, Node> = BTreeMap::new();
        let mut edges = vec![];
        for lower in self.store.iter() {
            let mut node = Node {
                round: lower.round(),
                ..Node::default()
            };
            if lower.id() != root.set {
                let found = self.upward_edges(lower, diagnostics);
                node.bridges = if lower.has_explicit_bridges() {
                    lower.bridges().to_vec()
                } else {
                    found
                        .iter()
                        .flat_map(|edge| edge.bridges.iter().copied())
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect()
                };
                if node.bridges.len() > self.max_bridges {
                    diagnostics.push(Diagnostic::ExcessiveBridges {
                        set: lower.id(),
                        count: node.bridges.len(),
                        limit: self.max_bridges,
                    });
                }
                edges.extend(found);
            }
            nodes.insert(lower.id(), node);
        }

        let connected = connected_to(root.set, &edges);
        let mut pruned = BTreeMap::new();
        for (id, node) in &nodes {
            if connected.contains(id) {
                continue;
            }
            let reason = if edges.iter().any(|edge| edge.lower == *id) {
                DisconnectReason::ThroughPrunedSets
            } else {
                DisconnectReason::NoUpwardBridge
            };
            diagnostics.push(Diagnostic::DisconnectedSet {
                set: *id,
                round: node.round,
                reason,
            });
            pruned.insert(*id, reason);
        }

        nodes.retain(|id, _| connected.contains(id));
        edges.retain(|edge| connected.contains(&edge.lower) && connected.contains(&edge.upper));
        for (ii, edge) in edges.iter().enumerate() {
            if let Some(node) = nodes.get_mut(&edge.lower) {
                node.above.push(ii);
            }
            if let Some(node) = nodes.get_mut(&edge.upper) {
                node.below.push(ii);
            }
        }

        info!(
            "hierarchy rooted at set {} (round {}), reference sensor {}: {} sets kept, {} pruned, {} edges",
            root.set,
            root.round,
            root.reference,
            nodes.len(),
            pruned.len(),
            edges.len()
        );

        Ok(Hierarchy {
            root,
            nodes,
            edges,
            pruned,
        })
    }

    fn resolve_root(&self) -> Result<Root> {
        let round = self
            .store
            .max_round()
            .ok_or_else(|| Error::NoReference("no set has a usable round".into()))?;

        let top = self
            .store
            .iter()
            .filter(|set| set.round() == round)
            .collect::<Vec<_>>();
        let [set] = top.as_slice() else {
            let ids = top.iter().map(|set| set.id().0).collect::<Vec<_>>();
            return Err(Error::NoReference(format!(
                "{} sets share the top round {round}: {ids:?}",
                ids.len()
            )));
        };

        let reference = self
            .options
            .reference_sensor
            .or_else(|| set.bridges().first().copied())
            .ok_or_else(|| {
                Error::NoReference(format!("root set {} names no reference sensor", set.id()))
            })?;
        if !set.contains(reference) {
            return Err(Error::NoReference(format!(
                "reference sensor {reference} is not a member of root set {}",
                set.id()
            )));
        }
        if set.is_discarded(reference) {
            return Err(Error::NoReference(format!(
                "reference sensor {reference} is discarded in root set {}",
                set.id()
            )));
        }

        Ok(Root {
            set: set.id(),
            round,
            reference,
        })
    }

    /// Sets `lower` may be connected to: its declared parent, or every set one round above
    fn upper_candidates(
        &self,
        lower: &CalibrationSet,
        diagnostics: &mut Diagnostics,
    ) -> Vec<&'a CalibrationSet> {
        let next = self
            .store
            .iter()
            .filter(|upper| upper.round() == lower.round() + 1);
        match lower.parent() {
            Some(parent) => {
                let found = next.filter(|upper| upper.id() == parent).collect::<Vec<_>>();
                if found.is_empty() {
                    diagnostics.push(Diagnostic::ParentMismatch {
                        set: lower.id(),
                        parent,
                    });
                }
                found
            }
            None => next.collect(),
        }
    }

    fn upward_edges(&self, lower: &CalibrationSet, diagnostics: &mut Diagnostics) -> Vec<Edge> {
        let uppers = self.upper_candidates(lower, diagnostics);
        let mut edges = vec![];

        if lower.has_explicit_bridges() {
            for upper in &uppers {
                let bridges = lower
                    .bridges()
                    .iter()
                    .copied()
                    .filter(|bridge| upper.contains(*bridge))
                    .collect::<Vec<_>>();
                if !bridges.is_empty() {
                    edges.push(Edge {
                        lower: lower.id(),
                        upper: upper.id(),
                        bridges,
                    });
                }
            }
            for &bridge in lower.bridges() {
                if !uppers.iter().any(|upper| upper.contains(bridge)) {
                    diagnostics.push(Diagnostic::DanglingBridge {
                        set: lower.id(),
                        sensor: bridge,
                    });
                }
            }
        } else {
            let mut conflicted = false;
            for upper in &uppers {
                let (usable, conflicting): (Vec<_>, Vec<_>) =
                    shared_candidates(lower, upper, &self.options.general_references)
                        .into_iter()
                        .partition(|sensor| {
                            !lower.is_discarded(*sensor) && !upper.is_discarded(*sensor)
                        });
                if usable.is_empty() {
                    if !conflicting.is_empty() {
                        conflicted = true;
                        diagnostics.push(Diagnostic::AmbiguousBridge {
                            lower: lower.id(),
                            upper: Some(upper.id()),
                            candidates: conflicting,
                        });
                    }
                } else {
                    debug!(
                        "set {} auto-detected bridges {usable:?} into set {}",
                        lower.id(),
                        upper.id()
                    );
                    edges.push(Edge {
                        lower: lower.id(),
                        upper: upper.id(),
                        bridges: usable,
                    });
                }
            }
            if edges.is_empty() && !conflicted {
                diagnostics.push(Diagnostic::AmbiguousBridge {
                    lower: lower.id(),
                    upper: None,
                    candidates: vec![],
                });
            }
        }

        edges
    }
}

/// Sensors two sets share, minus every monitoring reference either side knows about
fn shared_candidates(
    lower: &CalibrationSet,
    upper: &CalibrationSet,
    general_references: &BTreeSet<SensorId>,
) -> Vec<SensorId> {
    lower
        .sensors()
        .intersection(upper.sensors())
        .copied()
        .filter(|sensor| {
            !general_references.contains(sensor)
                && !lower.general_references().contains(sensor)
                && !upper.general_references().contains(sensor)
        })
        .collect()
}

/// Sets in the undirected component containing `root`
fn connected_to(root: SetId, edges: &[Edge]) -> BTreeSet<SetId> {
    let mut seen = BTreeSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(set) = queue.pop_front() {
        for edge in edges {
            let next = if edge.lower == set {
                edge.upper
            } else if edge.upper == set {
                edge.lower
            } else {
                continue;
            };
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

/// Disagreement between declared bridges and the sensors a set shares with the round above
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeAudit {
    /// No bridges declared, although shared sensors exist
    Missing { set: SetId, detected: Vec<SensorId> },
    /// Declared and shared sensors differ
    Mismatched {
        set: SetId,
        declared: Vec<SensorId>,
        detected: Vec<SensorId>,
    },
    /// Bridges declared, but none is shared with the round above
    Invalid { set: SetId, declared: Vec<SensorId> },
}

/// Compare every non-root set's declared bridges against the sensors it shares with the next
/// round, ignoring monitoring references.
///
/// Sets whose declaration already matches are not reported.
pub fn audit_bridges(store: &SetStore, options: &HierarchyOptions) -> Vec<BridgeAudit> {
    let Some(top) = store.max_round() else {
        return vec![];
    };

    let mut audits = vec![];
    for lower in store.iter().filter(|set| set.round() < top) {
        let detected = store
            .iter()
            .filter(|upper| upper.round() == lower.round() + 1)
            .flat_map(|upper| shared_candidates(lower, upper, &options.general_references))
            .collect::<BTreeSet<_>>();
        let declared = lower.bridges().iter().copied().collect::<BTreeSet<_>>();

        let audit = match (declared.is_empty(), detected.is_empty()) {
            (true, true) => None,
            (true, false) => Some(BridgeAudit::Missing {
                set: lower.id(),
                detected: detected.into_iter().collect(),
            }),
            (false, true) => Some(BridgeAudit::Invalid {
                set: lower.id(),
                declared: lower.bridges().to_vec(),
            }),
            (false, false) if declared != detected => Some(BridgeAudit::Mismatched {
                set: lower.id(),
                declared: lower.bridges().to_vec(),
                detected: detected.into_iter().collect(),
            }),
            (false, false) => None,
        };
        audits.extend(audit);
    }
    audits
}
