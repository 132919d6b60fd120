//! Error types for state-space estimation

use thiserror::Error;

/// State-space estimation error type.
///
/// `ShapeMismatch`, `NumericalInstability` and `InsufficientData` abort the
/// current filter, smoother or EM run; no partially-filled result is returned.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A matrix or vector does not agree with the declared `(nx, nu, ny)`.
    #[error("shape mismatch: {what} expected {expected}, got {got}")]
    ShapeMismatch {
        /// Offending matrix/vector name (e.g. `"B"`, `"y[3]"`).
        what: String,
        /// Expected shape, rendered as `rows x cols` or a length.
        expected: String,
        /// Actual shape.
        got: String,
    },

    /// A covariance or innovation matrix is not positive definite where a
    /// factorization or solve requires it.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    /// Too few timesteps for a well-posed regression.
    #[error("insufficient data: got {n} timesteps, need at least {min}")]
    InsufficientData {
        /// Number of timesteps provided.
        n: usize,
        /// Minimum number of timesteps required.
        min: usize,
    },

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Build a [`Error::ShapeMismatch`] for a matrix.
    pub fn matrix_shape(what: &str, rows: usize, cols: usize, got: (usize, usize)) -> Self {
        Error::ShapeMismatch {
            what: what.to_string(),
            expected: format!("{rows} x {cols}"),
            got: format!("{} x {}", got.0, got.1),
        }
    }

    /// Build a [`Error::ShapeMismatch`] for a vector.
    pub fn vector_len(what: &str, len: usize, got: usize) -> Self {
        Error::ShapeMismatch {
            what: what.to_string(),
            expected: format!("length {len}"),
            got: format!("length {got}"),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
