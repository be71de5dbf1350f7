//! Utilities for working with `num_rational::BigRational`.

use num_bigint::BigInt;
use num_integer::Integer;
use num_rational::BigRational;
use num_traits::{ToPrimitive, Zero};

/// Extension trait adding convenience constructors for [`BigRational`].
pub trait BigRationalExt {
    /// Creates a [`BigRational`] from a `u64` numerator with denominator `1`.
    fn from_u64(value: u64) -> Self;

    /// Creates a [`BigRational`] from a `u64` numerator and denominator.
    fn from_frac_u64(numerator: u64, denominator: u64) -> Self;

    /// Creates a [`BigRational`] from a `u128` numerator with denominator `1`.
    fn from_u128(value: u128) -> Self;

    /// Creates a [`BigRational`] from a `u128` numerator and denominator.
    fn from_frac_u128(numerator: u128, denominator: u128) -> Self;

    /// Creates a [`BigRational`] from a `usize` numerator with denominator `1`.
    fn from_usize(value: usize) -> Self;

    /// Returns the ceiling of the rational value as `u128`, saturating and treating negative values as zero.
    fn ceil_to_u128(&self) -> Option<u128>;
}

impl BigRationalExt for BigRational {
    fn from_u64(value: u64) -> Self {
        BigRational::from_integer(BigInt::from(value))
    }

    fn from_frac_u64(numerator: u64, denominator: u64) -> Self {
        BigRational::new(BigInt::from(numerator), BigInt::from(denominator))
    }

    fn from_u128(value: u128) -> Self {
        BigRational::from_integer(BigInt::from(value))
    }

    fn from_frac_u128(numerator: u128, denominator: u128) -> Self {
        BigRational::new(BigInt::from(numerator), BigInt::from(denominator))
    }

    fn from_usize(value: usize) -> Self {
        BigRational::from_integer(BigInt::from(value))
    }

    fn ceil_to_u128(&self) -> Option<u128> {
        if self < &BigRational::zero() {
            return Some(0);
        }

        let den = self.denom();
        if den.is_zero() {
            return None;
        }

        let (quot, rem) = self.numer().div_rem(den);
        let mut result = quot.to_u128().unwrap_or(u128::MAX);
        if !rem.is_zero() {
            result = result.saturating_add(1);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_helpers() {
        assert_eq!(BigRational::from_u64(7), BigRational::from_usize(7));
        assert_eq!(
            BigRational::from_frac_u64(6, 4),
            BigRational::from_frac_u128(3, 2)
        );
        assert_eq!(BigRational::from_u128(u64::MAX as u128 + 1).numer().bits(), 65);
    }

    #[test]
    fn test_ceil_to_u128() {
        assert_eq!(BigRational::from_frac_u64(7, 2).ceil_to_u128(), Some(4));
        assert_eq!(BigRational::from_u64(3).ceil_to_u128(), Some(3));
        assert_eq!(
            (BigRational::zero() - BigRational::from_u64(3)).ceil_to_u128(),
            Some(0)
        );
    }

    #[test]
    fn test_ceil_saturates() {
        let huge = BigRational::from_u128(u128::MAX) * BigRational::from_u64(4);
        assert_eq!(huge.ceil_to_u128(), Some(u128::MAX));
    }
}
