//! Calibration point and polynomial coefficient types

use serde::{Deserialize, Serialize};

/// One operator-contributed reference pair collected during a calibration session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Raw reading averaged over the collection window
    pub raw_average: f64,
    /// Value reported by the reference standard
    pub standard_value: f64,
}

impl CalibrationPoint {
    pub const fn new(raw_average: f64, standard_value: f64) -> Self {
        Self {
            raw_average,
            standard_value,
        }
    }
}

/// Cubic correction polynomial `y = a·x³ + b·x² + c·x + d`.
///
/// The default value is the identity transform (a=0, b=0, c=1, d=0).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
}

impl CalibrationParams {
    pub const IDENTITY: Self = Self {
        a: 0.0,
        b: 0.0,
        c: 1.0,
        d: 0.0,
    };

    pub const fn new(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self { a, b, c, d }
    }

    /// Evaluate the polynomial at `x` (Horner form).
    pub fn apply(&self, x: f64) -> f64 {
        ((self.a * x + self.b) * x + self.c) * x + self.d
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    pub fn is_finite(&self) -> bool {
        self.a.is_finite() && self.b.is_finite() && self.c.is_finite() && self.d.is_finite()
    }

    /// Coefficients in file order `[a, b, c, d]`.
    pub fn to_array(&self) -> [f64; 4] {
        [self.a, self.b, self.c, self.d]
    }
}

impl Default for CalibrationParams {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<[f64; 4]> for CalibrationParams {
    fn from(c: [f64; 4]) -> Self {
        Self::new(c[0], c[1], c[2], c[3])
    }
}
