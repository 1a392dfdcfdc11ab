//! Integer helpers for element shapes.

use num_traits::PrimInt;

use crate::error::{GridworkError, Result};

/// Raise `base` to a non-negative integer `exponent` by repeated multiplication.
///
/// Fails with [`GridworkError::NegativeExponent`] for negative exponents.
pub fn ipow<T: PrimInt>(base: T, exponent: T) -> Result<T> {
    if exponent < T::zero() {
        return Err(GridworkError::NegativeExponent {
            exponent: exponent.to_i64().unwrap_or(i64::MIN),
        });
    }

    let mut result = T::one();
    let mut i = T::zero();
    while i < exponent {
        result = result * base;
        i = i + T::one();
    }
    Ok(result)
}

/// Number of scalars in a geometric element shape: `dim` to the power `rank`.
pub const fn geometric_span(rank: usize, dim: usize) -> usize {
    let mut span = 1;
    let mut i = 0;
    while i < rank {
        span *= dim;
        i += 1;
    }
    span
}
