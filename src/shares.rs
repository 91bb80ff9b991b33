//! Fixed-point equity shares.
//!
//! Shares are integer basis points (10 000 = 100 %). Every rescale floors each
//! member's exact share and hands the leftover basis points to a single
//! designated member, so active shares always sum to exactly [`BasisPoints::FULL`].

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct BasisPoints(pub u32);

impl BasisPoints {
    pub const ZERO: BasisPoints = BasisPoints(0);
    pub const FULL: BasisPoints = BasisPoints(10_000);

    /// Share as a percentage (0.0 - 100.0)
    pub fn as_percent(self) -> f64 {
        self.0 as f64 / 100.0
    }

    /// Share as a fraction (0.0 - 1.0)
    pub fn as_fraction(self) -> f64 {
        self.0 as f64 / Self::FULL.0 as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.as_percent())
    }
}

/// Total of a set of shares, widened so overflow is impossible.
pub fn total<I: IntoIterator<Item = BasisPoints>>(shares: I) -> u64 {
    shares.into_iter().map(|s| s.0 as u64).sum()
}

/// Split 100 % across `weights` in proportion, flooring each part.
///
/// Leftover basis points go to `remainder_to`. Returns `None` when every
/// weight is zero or `remainder_to` is out of range.
pub fn apportion(weights: &[u128], remainder_to: usize) -> Option<Vec<BasisPoints>> {
    let weight_sum: u128 = weights.iter().sum();
    if weight_sum == 0 || remainder_to >= weights.len() {
        return None;
    }

    let full = BasisPoints::FULL.0 as u128;
    let mut parts: Vec<BasisPoints> = weights
        .iter()
        .map(|w| BasisPoints((full * w / weight_sum) as u32))
        .collect();

    let assigned = total(parts.iter().copied());
    let remainder = BasisPoints::FULL.0 as u64 - assigned;
    parts[remainder_to].0 += remainder as u32;
    Some(parts)
}

/// Rescale existing shares for a new contribution joining `pooled` funds.
///
/// Returns the diluted existing shares followed by the joiner's share. The
/// exact share of each existing member is `old * pooled / (pooled + contribution)`
/// and the joiner's is `contribution / (pooled + contribution)`.
pub fn dilute(
    existing: &[BasisPoints],
    pooled: u64,
    contribution: u64,
    remainder_to: usize,
) -> Option<Vec<BasisPoints>> {
    let full = BasisPoints::FULL.0 as u128;
    let mut weights: Vec<u128> = existing
        .iter()
        .map(|s| s.0 as u128 * pooled as u128)
        .collect();
    weights.push(full * contribution as u128);
    apportion(&weights, remainder_to)
}
