// SPDX-License-Identifier: AGPL-3.0-only

//! Per-dimension descriptor scaling.
//!
//! Each device reduces its descriptor rows to per-dimension extrema; the
//! host merges the extrema of all devices and lowers the scale to
//! `min(prior, 1/(max − min))`. Scale values never increase until `reset`.

use crate::tolerances::{DIVISION_GUARD, SCALER_SENTINEL};
use rayon::prelude::*;

/// Per-dimension minimum and maximum over a set of descriptor rows.
#[derive(Clone, Debug, PartialEq)]
pub struct DescriptorExtrema {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl DescriptorExtrema {
    /// Extrema of nothing: `+∞` minima, `−∞` maxima.
    #[must_use]
    pub fn empty(dim: usize) -> Self {
        Self {
            min: vec![f64::INFINITY; dim],
            max: vec![f64::NEG_INFINITY; dim],
        }
    }

    /// Parallel reduction over `N × dim` rows.
    #[must_use]
    pub fn from_rows(q: &[f64], dim: usize) -> Self {
        q.par_chunks(dim)
            .fold(
                || Self::empty(dim),
                |mut acc, row| {
                    for (d, &v) in row.iter().enumerate() {
                        acc.min[d] = acc.min[d].min(v);
                        acc.max[d] = acc.max[d].max(v);
                    }
                    acc
                },
            )
            .reduce(
                || Self::empty(dim),
                |mut a, b| {
                    a.merge(&b);
                    a
                },
            )
    }

    pub fn merge(&mut self, other: &Self) {
        for (a, b) in self.min.iter_mut().zip(&other.min) {
            *a = a.min(*b);
        }
        for (a, b) in self.max.iter_mut().zip(&other.max) {
            *a = a.max(*b);
        }
    }
}

/// Monotone reciprocal-range scale factors.
///
/// `values` holds the running minimum of `1/(max − min)` and starts at the
/// sentinel. A dimension that has not yet shown a usable range (constant
/// across every batch so far) is read through `factors` with the fallback
/// `min(1, 1/max|q|)` instead, so a constant input reaches the network with
/// magnitude at most one.
#[derive(Clone, Debug, PartialEq)]
pub struct Scaler {
    values: Vec<f64>,
    fallback: Vec<f64>,
    factors: Vec<f64>,
    initialized: bool,
}

impl Scaler {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self {
            values: vec![SCALER_SENTINEL; dim],
            fallback: vec![1.0; dim],
            factors: vec![1.0; dim],
            initialized: false,
        }
    }

    /// Raw running minimum; unset dimensions hold `SCALER_SENTINEL`.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Scale the network applies to each descriptor dimension.
    #[must_use]
    pub fn factors(&self) -> &[f64] {
        &self.factors
    }

    /// Whether batch statistics have been folded in since the last reset.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Lower each scale to `1/(max − min)` where that is smaller.
    ///
    /// Dimensions with a vanishing or empty range keep their prior value and
    /// only tighten their fallback.
    pub fn update(&mut self, extrema: &DescriptorExtrema) {
        let dims = self
            .values
            .iter_mut()
            .zip(&mut self.fallback)
            .zip(&mut self.factors)
            .zip(extrema.min.iter().zip(&extrema.max));
        for (((value, fallback), factor), (&lo, &hi)) in dims {
            let range = hi - lo;
            if range > DIVISION_GUARD {
                *value = value.min(1.0 / range);
            }
            let magnitude = lo.abs().max(hi.abs());
            if magnitude.is_finite() && magnitude > DIVISION_GUARD {
                *fallback = fallback.min(1.0 / magnitude);
            }
            *factor = if *value < SCALER_SENTINEL { *value } else { *fallback };
        }
        self.initialized = true;
    }

    pub fn reset(&mut self) {
        self.values.fill(SCALER_SENTINEL);
        self.fallback.fill(1.0);
        self.factors.fill(1.0);
        self.initialized = false;
    }
}
