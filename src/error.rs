//! Error taxonomy for the weighting pipeline.

/// Errors raised while validating inputs or running a weighting.
///
/// Every validation variant is reported before any weight is computed; only
/// [`WeightingError::WeightCollapse`] can occur once iteration has started.
#[derive(Debug, thiserror::Error)]
pub enum WeightingError {
    #[error("target ratios exceed 1 for variable '{variable}': sum is {sum}")]
    RatiosExceedOne { variable: String, sum: f64 },

    #[error("invalid target ratio {ratio} for category '{category}' of variable '{variable}'")]
    InvalidRatio {
        variable: String,
        category: String,
        ratio: f64,
    },

    #[error("category '{category}' listed more than once for variable '{variable}'")]
    DuplicateCategory { variable: String, category: String },

    #[error("category '{category}' is reserved for the catch-all bucket (variable '{variable}')")]
    ReservedCategory { variable: String, category: String },

    #[error("variable '{variable}' is specified more than once")]
    DuplicateVariable { variable: String },

    #[error("variable column name must not be empty")]
    EmptyColumnName,

    #[error("invalid base weights: {reason}")]
    InvalidBaseWeights { reason: String },

    #[error("invalid options: {reason}")]
    InvalidOptions { reason: String },

    #[error("column length mismatch for '{column}': expected {expected} values, got {actual}")]
    LengthMismatch {
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("total weight became zero or non-finite while fitting '{variable}' (pass {pass})")]
    WeightCollapse { variable: String, pass: usize },

    #[error("cannot normalize weights: total weight is {total}")]
    DegenerateTotal { total: f64 },

    #[error("column '{column}' not found")]
    ColumnNotFound { column: String },

    #[error("column '{column}' has unsupported type {data_type}")]
    UnsupportedColumnType { column: String, data_type: String },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("malformed weighting scheme: {0}")]
    Scheme(#[from] serde_json::Error),
}

impl WeightingError {
    /// Whether the caller can fix the input and retry.
    ///
    /// Weight collapse is fatal for the run that produced it.
    pub fn is_validation(&self) -> bool {
        !matches!(
            self,
            WeightingError::WeightCollapse { .. } | WeightingError::DegenerateTotal { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, WeightingError>;
