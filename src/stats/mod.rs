//! Incremental, mergeable power-sum statistics.
//!
//! [`RunStats`] keeps the zeroth, first and second power sums of a stream of
//! execution times. Two accumulators built from disjoint sample sets merge by
//! componentwise addition into the accumulator of the union, which is what
//! lets every rank fold its own samples and the parameter server combine them
//! in any arrival order.

use std::fmt;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

/// Scaling factor applied to the zeroth-order sum.
///
/// Each sample adds `1 / SCALE` to `s0`, so the sample count is `s0 * SCALE`.
pub const SCALE: f64 = 1_000_000.0;

/// Wire representation: `[s0, s1, s2, n_abnormal]`.
type StatTuple = (f64, f64, f64, u64);

/// Power sums of order 0, 1 and 2 plus a running anomaly count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "StatTuple", into = "StatTuple")]
pub struct RunStats {
    s0: f64,
    s1: f64,
    s2: f64,
    n_abnormal: u64,
}

impl From<StatTuple> for RunStats {
    fn from((s0, s1, s2, n_abnormal): StatTuple) -> Self {
        Self {
            s0,
            s1,
            s2,
            n_abnormal,
        }
    }
}

impl From<RunStats> for StatTuple {
    fn from(s: RunStats) -> Self {
        (s.s0, s.s1, s.s2, s.n_abnormal)
    }
}

impl RunStats {
    /// Creates an empty accumulator.
    pub const fn new() -> Self {
        Self {
            s0: 0.0,
            s1: 0.0,
            s2: 0.0,
            n_abnormal: 0,
        }
    }

    /// Builds an accumulator from raw power sums.
    pub const fn from_raw(s0: f64, s1: f64, s2: f64, n_abnormal: u64) -> Self {
        Self {
            s0,
            s1,
            s2,
            n_abnormal,
        }
    }

    /// Builds an accumulator holding every value of `samples`.
    pub fn from_samples(samples: impl IntoIterator<Item = f64>) -> Self {
        let mut stats = Self::new();
        for x in samples {
            stats.push(x);
        }
        stats
    }

    /// Folds one sample into the power sums.
    #[inline]
    pub fn push(&mut self, x: f64) {
        self.s0 += 1.0 / SCALE;
        self.s1 += x;
        self.s2 += x * x;
    }

    /// Zeroth-order sum (scaled count).
    pub fn s0(&self) -> f64 {
        self.s0
    }

    /// First-order sum.
    pub fn s1(&self) -> f64 {
        self.s1
    }

    /// Second-order sum.
    pub fn s2(&self) -> f64 {
        self.s2
    }

    /// Number of samples that were labelled anomalous.
    pub fn n_abnormal(&self) -> u64 {
        self.n_abnormal
    }

    /// Reconstructed sample count.
    ///
    /// `s0` only ever grows in whole multiples of `1 / SCALE`, so rounding
    /// removes the drift accumulated by repeated float addition.
    fn n(&self) -> f64 {
        (self.s0 * SCALE).round()
    }

    /// Returns `(sample_count, n_abnormal)`.
    pub fn count(&self) -> (u64, u64) {
        (self.n().max(0.0) as u64, self.n_abnormal)
    }

    /// Whether no samples have been folded in.
    pub fn is_empty(&self) -> bool {
        self.n() <= 0.0
    }

    /// Sample mean; `0` for an empty accumulator.
    pub fn mean(&self) -> f64 {
        let n = self.n();
        if n <= 0.0 {
            return 0.0;
        }
        self.s1 / n
    }

    /// Population variance; `+inf` for an empty accumulator.
    pub fn variance(&self) -> f64 {
        let n = self.n();
        if n <= 0.0 {
            return f64::INFINITY;
        }
        (n * self.s2 - self.s1 * self.s1) / (n * n)
    }

    /// Population standard deviation; `+inf` for an empty accumulator.
    pub fn stddev(&self) -> f64 {
        let var = self.variance();
        if var.is_infinite() {
            return var;
        }
        var.max(0.0).sqrt()
    }

    /// Adds `n` to the anomaly counter.
    pub fn add_abnormal(&mut self, n: u64) {
        self.n_abnormal += n;
    }

    /// Overwrites the anomaly counter.
    pub fn reset_abnormal(&mut self, n: u64) {
        self.n_abnormal = n;
    }

    /// Clears both the power sums and the anomaly counter.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Returns the accumulator of the union of both sample sets.
pub fn merge(a: &RunStats, b: &RunStats) -> RunStats {
    *a + *b
}

impl Add for RunStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            s0: self.s0 + rhs.s0,
            s1: self.s1 + rhs.s1,
            s2: self.s2 + rhs.s2,
            n_abnormal: self.n_abnormal + rhs.n_abnormal,
        }
    }
}

impl AddAssign for RunStats {
    fn add_assign(&mut self, rhs: Self) {
        self.s0 += rhs.s0;
        self.s1 += rhs.s1;
        self.s2 += rhs.s2;
        self.n_abnormal += rhs.n_abnormal;
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (n, abnormal) = self.count();
        write!(
            f,
            "n={n} mean={:.6} stddev={:.6} abnormal={abnormal}",
            self.mean(),
            self.stddev()
        )
    }
}
