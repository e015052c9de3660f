use serde::{Deserialize, Serialize};

use crate::Result;

/// Tunables for hierarchy validation and path combination
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Standard deviation across path estimates, in kelvin, above which a sensor is flagged for
    /// manual review
    pub spread_threshold: f64,
    /// Stand-in uncertainty for a path whose propagated error is exactly zero
    pub zero_error_epsilon: f64,
    /// Sets with more effective bridges than this raise a warning, since the path count grows
    /// multiplicatively with every hop
    pub max_bridges_per_set: usize,
    /// Tolerance for the offset antisymmetry and error symmetry checks on ingestion
    pub symmetry_tolerance: f64,
    /// Fan sensors out over the rayon thread pool
    pub parallel: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            spread_threshold: 0.01,
            zero_error_epsilon: 1e-10,
            max_bridges_per_set: 8,
            symmetry_tolerance: 1e-9,
            parallel: true,
        }
    }
}

impl EngineConfig {
    /// # Errors
    /// Returns an error if `source` is not valid TOML for this structure.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }
}
