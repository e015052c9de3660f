use serde::Serialize;

/// A value with its one-sigma uncertainty
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Measurement {
    pub value: f64,
    pub uncertainty: f64,
}

impl Measurement {
    pub const fn new(value: f64, uncertainty: f64) -> Self {
        Self { value, uncertainty }
    }

    /// A value known by definition, such as the reference sensor against itself
    pub const fn exact(value: f64) -> Self {
        Self {
            value,
            uncertainty: 0.0,
        }
    }

    /// The not-a-number sentinel reported for sensors with no constant
    pub const fn undefined() -> Self {
        Self {
            value: f64::NAN,
            uncertainty: f64::NAN,
        }
    }

    pub fn is_defined(&self) -> bool {
        self.value.is_finite() && self.uncertainty.is_finite()
    }

    /// The inverse-variance weight `1 / sigma^2`.
    ///
    /// An exactly-zero uncertainty is replaced by `epsilon`, so such a measurement dominates a
    /// combination without producing an infinite weight.
    pub fn weight(&self, epsilon: f64) -> f64 {
        let sigma = if self.uncertainty == 0.0 {
            epsilon
        } else {
            self.uncertainty
        };
        sigma.powi(2).recip()
    }
}
