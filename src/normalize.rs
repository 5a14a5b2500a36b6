//! Final rescaling of a weight vector to a fixed total mass.

use crate::error::{Result, WeightingError};

/// Rescale so the weights sum to `original_count`, the number of records
/// that were weighted.
pub fn normalize(weights: &mut [f64], original_count: usize) -> Result<()> {
    normalize_to_total(weights, original_count as f64)
}

/// Rescale so the weights sum to `total`. Empty input is a no-op.
///
/// A zero or non-finite current sum means every weight collapsed; that is
/// reported instead of dividing into NaN.
pub fn normalize_to_total(weights: &mut [f64], total: f64) -> Result<()> {
    if weights.is_empty() {
        return Ok(());
    }

    let current: f64 = weights.iter().sum();
    if !(current > 0.0 && current.is_finite()) {
        return Err(WeightingError::DegenerateTotal { total: current });
    }

    let factor = total / current;
    for w in weights.iter_mut() {
        *w *= factor;
    }
    Ok(())
}
