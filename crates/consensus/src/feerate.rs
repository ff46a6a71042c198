//! Fee rate expressed in satoshi per 1000 bytes.

use std::cmp::Ordering;
use std::fmt;

use crate::money::Amount;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FeeRate {
    sats_per_kb: Amount,
}

impl FeeRate {
    pub const ZERO: FeeRate = FeeRate { sats_per_kb: 0 };

    pub fn from_sats_per_kb(sats_per_kb: Amount) -> Self {
        Self { sats_per_kb }
    }

    /// Rate implied by paying `fee` for `size` bytes. Zero size gives a zero rate.
    pub fn from_fee_and_size(fee: Amount, size: usize) -> Self {
        if size == 0 {
            return Self::ZERO;
        }
        let rate = (fee as i128 * 1000 / size as i128).clamp(i64::MIN as i128, i64::MAX as i128);
        Self {
            sats_per_kb: rate as Amount,
        }
    }

    pub fn sats_per_kb(self) -> Amount {
        self.sats_per_kb
    }

    /// Fee owed for `size` bytes at this rate, rounded down, never below
    /// one satoshi for a nonzero rate.
    pub fn fee_for_size(self, size: usize) -> Amount {
        let fee = (self.sats_per_kb as i128 * size as i128 / 1000)
            .clamp(i64::MIN as i128, i64::MAX as i128) as Amount;
        if fee == 0 && size != 0 && self.sats_per_kb > 0 {
            1
        } else {
            fee
        }
    }
}

impl Ord for FeeRate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sats_per_kb.cmp(&other.sats_per_kb)
    }
}

impl PartialOrd for FeeRate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FeeRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat/kB", self.sats_per_kb)
    }
}

/// Orders `(fee_a, size_a)` against `(fee_b, size_b)` as fee rates without
/// dividing, so equal rates compare equal regardless of rounding.
pub fn compare_fee_rates(fee_a: Amount, size_a: usize, fee_b: Amount, size_b: usize) -> Ordering {
    let lhs = fee_a as i128 * size_b as i128;
    let rhs = fee_b as i128 * size_a as i128;
    lhs.cmp(&rhs)
}
