// SPDX-License-Identifier: AGPL-3.0-only

//! Flat trainable parameter buffer and its structured views.
//!
//! The optimizer sees one contiguous `Vec<f64>`. Kernels never slice it by
//! hand; they ask the `ParameterLayout` for a per-type `TypeNetwork` view or
//! for the coefficient arrays. Forward evaluation and gradient accumulation
//! use the same layout, so offsets cannot drift between them.
//!
//! | Block | Length |
//! |-------|--------|
//! | head 0, per type: `w0` (H×D, row-major), `b0` (H), `w1` (H) | `T·(H·D + 2H)` |
//! | head 0 output bias `b1` | 1 |
//! | head 1 (polarizability mode only) | same as head 0 |
//! | radial coefficients `c[n, k, t1, t2]` | `T²·(n_r+1)·(k_r+1)` |
//! | angular coefficients | `T²·(n_a+1)·(k_a+1)` |

use crate::error::NepError;
use crate::nep::config::ParameterBlock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::ops::Range;

/// Offsets of every parameter group inside the flat buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterLayout {
    pub num_types: usize,
    pub dim: usize,
    pub num_neurons: usize,
    pub num_heads: usize,
    /// `H·D + 2H`: one type's network record.
    pub per_type: usize,
    /// One head: every type's record plus the shared output bias.
    pub per_head: usize,
    pub c_radial: Range<usize>,
    pub c_angular: Range<usize>,
    pub total: usize,
}

impl ParameterLayout {
    #[must_use]
    pub fn new(block: &ParameterBlock) -> Self {
        let (h, d) = (block.num_neurons, block.dim);
        let per_type = h * d + 2 * h;
        let per_head = block.num_types * per_type + 1;
        let num_heads = if block.has_polarizability_head() { 2 } else { 1 };
        let network = num_heads * per_head;
        let c_radial = network..network + block.num_c_radial;
        let c_angular = c_radial.end..c_radial.end + block.num_c_angular;
        Self {
            num_types: block.num_types,
            dim: d,
            num_neurons: h,
            num_heads,
            per_type,
            per_head,
            total: c_angular.end,
            c_radial,
            c_angular,
        }
    }

    /// Start of `(head, type)`'s `w0` block.
    #[must_use]
    pub fn type_offset(&self, head: usize, t: usize) -> usize {
        head * self.per_head + t * self.per_type
    }

    #[must_use]
    pub fn w0(&self, head: usize, t: usize) -> Range<usize> {
        let start = self.type_offset(head, t);
        start..start + self.num_neurons * self.dim
    }

    #[must_use]
    pub fn b0(&self, head: usize, t: usize) -> Range<usize> {
        let start = self.w0(head, t).end;
        start..start + self.num_neurons
    }

    #[must_use]
    pub fn w1(&self, head: usize, t: usize) -> Range<usize> {
        let start = self.b0(head, t).end;
        start..start + self.num_neurons
    }

    #[must_use]
    pub fn b1(&self, head: usize) -> usize {
        head * self.per_head + self.num_types * self.per_type
    }
}

/// Network weights of one head for one chemical type.
#[derive(Clone, Copy, Debug)]
pub struct TypeNetwork<'a> {
    /// `H×D`, row-major: `w0[h * dim + d]`.
    pub w0: &'a [f64],
    pub b0: &'a [f64],
    pub w1: &'a [f64],
    pub b1: f64,
}

/// Radial and angular basis coefficients.
#[derive(Clone, Copy, Debug)]
pub struct Coefficients<'a> {
    pub radial: &'a [f64],
    pub angular: &'a [f64],
}

/// The trainable buffer together with its layout.
#[derive(Clone, Debug)]
pub struct NetworkParameters {
    layout: ParameterLayout,
    values: Vec<f64>,
}

impl NetworkParameters {
    /// Wrap an existing buffer; its length must match the layout exactly.
    pub fn new(layout: ParameterLayout, values: Vec<f64>) -> Result<Self, NepError> {
        if values.len() != layout.total {
            return Err(NepError::ParameterSize {
                expected: layout.total,
                found: values.len(),
            });
        }
        Ok(Self { layout, values })
    }

    /// Deterministic random initialization.
    ///
    /// Weights are uniform in ±1/√D so hidden pre-activations start O(1);
    /// coefficients are uniform in ±1.
    #[must_use]
    pub fn random(layout: ParameterLayout, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (layout.dim.max(1) as f64).sqrt();
        let network_end = layout.c_radial.start;
        let values = (0..layout.total)
            .map(|i| {
                if i < network_end {
                    rng.random_range(-bound..bound)
                } else {
                    rng.random_range(-1.0..1.0)
                }
            })
            .collect();
        Self { layout, values }
    }

    #[must_use]
    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Mutable access for the external optimizer; the length is fixed.
    pub fn values_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn network(&self, head: usize, t: usize) -> TypeNetwork<'_> {
        let l = &self.layout;
        TypeNetwork {
            w0: &self.values[l.w0(head, t)],
            b0: &self.values[l.b0(head, t)],
            w1: &self.values[l.w1(head, t)],
            b1: self.values[l.b1(head)],
        }
    }

    #[must_use]
    pub fn coefficients(&self) -> Coefficients<'_> {
        Coefficients {
            radial: &self.values[self.layout.c_radial.clone()],
            angular: &self.values[self.layout.c_angular.clone()],
        }
    }
}
