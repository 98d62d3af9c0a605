use serde::{Deserialize, Serialize};

/// Whether a field file stores one value per cell or a 3-component vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Scalar,
    Vector,
}

/// Parsed internal-field value of one field file.
///
/// `Unresolvable` marks values the reader cannot evaluate (e.g. `#calc`
/// expressions); consumers treat it as zero when assembling series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Scalar(f64),
    Vector(f64, f64, f64),
    Unresolvable,
}

impl FieldValue {
    /// Scalar view; vector and unresolvable values have none.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            FieldValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }

    /// Component view of a vector value.
    pub fn as_vector(&self) -> Option<(f64, f64, f64)> {
        match self {
            FieldValue::Vector(x, y, z) => Some((*x, *y, *z)),
            _ => None,
        }
    }

    /// Scalar value with the zero fallback consumers apply to
    /// unparseable fields.
    pub fn scalar_or_zero(&self) -> f64 {
        self.as_scalar().unwrap_or(0.0)
    }

    /// Vector components with the zero fallback.
    pub fn vector_or_zero(&self) -> (f64, f64, f64) {
        self.as_vector().unwrap_or((0.0, 0.0, 0.0))
    }

    pub fn kind(&self) -> Option<FieldKind> {
        match self {
            FieldValue::Scalar(_) => Some(FieldKind::Scalar),
            FieldValue::Vector(..) => Some(FieldKind::Vector),
            FieldValue::Unresolvable => None,
        }
    }
}

/// Magnitude of a velocity sample, `sqrt(x^2 + y^2 + z^2)`.
pub fn vector_magnitude(x: f64, y: f64, z: f64) -> f64 {
    (x * x + y * y + z * z).sqrt()
}
