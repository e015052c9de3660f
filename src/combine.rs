//! Inverse-variance combination of independent path estimates.
use serde::Serialize;

use crate::config::EngineConfig;
use crate::margin::Measurement;
use crate::math::{max_spread, population_std};

/// A sensor's combined constant together with the per-path diagnostics
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Combination {
    pub estimate: Measurement,
    pub n_paths: usize,
    /// The first enumerated path
    pub first: Measurement,
    /// The path with the smallest uncertainty, earliest on ties
    pub best: Measurement,
    /// Population standard deviation of the path values
    pub spread_std: f64,
    pub max_spread: f64,
    /// Normalised weights, in path order
    pub weights: Vec<f64>,
    pub needs_review: bool,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeightedCombiner {
    epsilon: f64,
    spread_threshold: f64,
}

impl WeightedCombiner {
    pub const fn new(epsilon: f64, spread_threshold: f64) -> Self {
        Self {
            epsilon,
            spread_threshold,
        }
    }

    pub const fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.zero_error_epsilon, config.spread_threshold)
    }

    /// Combine path estimates with weights `1 / sigma^2`.
    ///
    /// The combined value is the weighted mean and its uncertainty `1 / sqrt(sum w)`. A single
    /// path passes through unchanged and no paths combine to nothing.
    pub fn combine(&self, paths: &[Measurement]) -> Option<Combination> {
        let (&first, rest) = paths.split_first()?;
        if rest.is_empty() {
            return Some(Combination {
                estimate: first,
                n_paths: 1,
                first,
                best: first,
                spread_std: 0.0,
                max_spread: 0.0,
                weights: vec![1.0],
                needs_review: false,
            });
        }

        let weights = paths
            .iter()
            .map(|path| path.weight(self.epsilon))
            .collect::<Vec<_>>();
        let total = weights.iter().sum::<f64>();
        let value = paths
            .iter()
            .zip(&weights)
            .map(|(path, weight)| path.value * weight)
            .sum::<f64>()
            / total;

        let best = paths
            .iter()
            .copied()
            .reduce(|best, path| {
                if path.uncertainty < best.uncertainty {
                    path
                } else {
                    best
                }
            })
            .unwrap_or(first);

        let values = paths.iter().map(|path| path.value).collect::<Vec<_>>();
        let spread_std = population_std(&values).unwrap_or(0.0);

        Some(Combination {
            estimate: Measurement::new(value, total.sqrt().recip()),
            n_paths: paths.len(),
            first,
            best,
            spread_std,
            max_spread: max_spread(&values),
            weights: weights.iter().map(|weight| weight / total).collect(),
            needs_review: spread_std > self.spread_threshold,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::WeightedCombiner;
    use crate::margin::Measurement;

    fn combiner() -> WeightedCombiner {
        WeightedCombiner::new(1e-10, 0.01)
    }

    #[test]
    fn two_paths_weight_towards_the_tighter_one() {
        let combination = combiner()
            .combine(&[Measurement::new(0.100, 0.010), Measurement::new(0.120, 0.020)])
            .unwrap();
        approx::assert_relative_eq!(combination.estimate.value, 0.104, epsilon = 1e-12);
        approx::assert_relative_eq!(
            combination.estimate.uncertainty,
            12_500f64.sqrt().recip(),
            epsilon = 1e-12
        );
        approx::assert_relative_eq!(combination.weights[0], 0.8, epsilon = 1e-12);
        assert_eq!(combination.best, Measurement::new(0.100, 0.010));
        approx::assert_relative_eq!(combination.max_spread, 0.02, epsilon = 1e-12);
        assert!(!combination.needs_review);
    }

    #[test]
    fn single_path_passes_through() {
        let only = Measurement::new(-0.031, 0.004);
        let combination = combiner().combine(&[only]).unwrap();
        assert_eq!(combination.estimate, only);
        assert_eq!(combination.n_paths, 1);
    }

    #[test]
    fn no_paths_is_no_constant() {
        assert!(combiner().combine(&[]).is_none());
    }

    #[test]
    fn zero_error_path_dominates_without_overflow() {
        let combination = combiner()
            .combine(&[Measurement::exact(0.2), Measurement::new(0.5, 0.01)])
            .unwrap();
        assert!(combination.estimate.is_defined());
        approx::assert_relative_eq!(combination.estimate.value, 0.2, epsilon = 1e-9);
    }

    #[test]
    fn wide_spread_is_flagged() {
        let combination = combiner()
            .combine(&[Measurement::new(0.0, 0.01), Measurement::new(0.05, 0.01)])
            .unwrap();
        approx::assert_relative_eq!(combination.spread_std, 0.025, epsilon = 1e-12);
        assert!(combination.needs_review);
    }

    proptest! {
        #[test]
        fn one_path_is_returned_unchanged(value in -1.0..1.0f64, error in 0.0..0.1f64) {
            let only = Measurement::new(value, error);
            let combination = combiner().combine(&[only]).unwrap();
            prop_assert_eq!(combination.estimate, only);
            prop_assert_eq!(combination.best, only);
            prop_assert!(!combination.needs_review);
        }

        #[test]
        fn combined_error_never_exceeds_the_best_path(
            paths in prop::collection::vec((-1.0..1.0f64, 0.001..0.1f64), 2..12),
        ) {
            let paths = paths
                .into_iter()
                .map(|(value, error)| Measurement::new(value, error))
                .collect::<Vec<_>>();
            let combination = combiner().combine(&paths).unwrap();

            let min = paths.iter().map(|p| p.value).fold(f64::INFINITY, f64::min);
            let max = paths.iter().map(|p| p.value).fold(f64::NEG_INFINITY, f64::max);
            prop_assert!(combination.estimate.uncertainty <= combination.best.uncertainty + 1e-15);
            prop_assert!(combination.estimate.value >= min - 1e-12);
            prop_assert!(combination.estimate.value <= max + 1e-12);
            let total: f64 = combination.weights.iter().sum();
            prop_assert!((total - 1.0).abs() < 1e-9);
        }
    }
}
