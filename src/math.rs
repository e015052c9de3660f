use itertools::{Itertools, MinMaxResult};

/// Root-sum-of-squares of independent uncertainties
///
/// The combined uncertainty of a sum of independent quantities is the square root of the sum of
/// their variances. An empty input combines to zero.
///
/// # Examples
///
/// ```
/// use calibration_chain::math::quadrature_sum;
///
/// let total = quadrature_sum(&[0.3, 0.4]);
/// approx::assert_relative_eq!(total, 0.5);
/// ```
pub fn quadrature_sum(errors: &[f64]) -> f64 {
    errors.iter().map(|e| e.powi(2)).sum::<f64>().sqrt()
}

/// Population standard deviation of `values`
///
/// The spread is computed about the arithmetic mean with denominator `n`, so a single value has
/// zero spread. Returns `None` for an empty slice.
///
/// # Examples
///
/// ```
/// use calibration_chain::math::population_std;
///
/// let std = population_std(&[1., 3.]).unwrap();
/// approx::assert_relative_eq!(std, 1.0);
/// assert_eq!(population_std(&[]), None);
/// ```
#[allow(clippy::cast_precision_loss)]
pub fn population_std(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    Some(variance.sqrt())
}

/// Largest difference between any two of `values`
///
/// # Examples
///
/// ```
/// use calibration_chain::math::max_spread;
///
/// approx::assert_relative_eq!(max_spread(&[0.10, 0.14, 0.12]), 0.04, epsilon = 1e-12);
/// approx::assert_relative_eq!(max_spread(&[0.10]), 0.0);
/// ```
pub fn max_spread(values: &[f64]) -> f64 {
    match values.iter().minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::NoElements | MinMaxResult::OneElement(_) => 0.0,
        MinMaxResult::MinMax(min, max) => max - min,
    }
}
