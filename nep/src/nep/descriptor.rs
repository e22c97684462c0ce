// SPDX-License-Identifier: AGPL-3.0-only

//! Per-atom descriptor: radial block, angular block, optional temperature.
//!
//! Row layout (length `dim`):
//!
//! | Slots | Content |
//! |-------|---------|
//! | `0..=n_max_radial` | `q_n = Σ_j g_n(r_ij)` over the radial list |
//! | `dim_radial + e·(n_max_angular+1) + n` | invariant `e` of the order-`n` moments |
//! | `dim − 1` (temperature mode) | reference temperature of the configuration |
//!
//! The Cartesian moments are kept per atom and order; force assembly and the
//! gradient passes differentiate the invariants at these values.

use crate::nep::angular::{AngularInvariants, MAX_DEGREE, MAX_MOMENTS};
use crate::nep::basis::{PairBasis, BASIS_CAPACITY};
use crate::nep::config::ParameterBlock;
use crate::nep::neighbor::NeighborLists;
use crate::nep::parameters::Coefficients;
use crate::nep::structure::PackedBatch;
use rayon::prelude::*;

/// Descriptor rows and retained angular moments for one batch.
#[derive(Clone, Debug, Default)]
pub struct DescriptorBuffers {
    pub dim: usize,
    /// Radial orders of the angular block, `n_max_angular + 1`.
    pub num_orders: usize,
    pub num_moments: usize,
    /// `N × dim`.
    pub q: Vec<f64>,
    /// `N × num_orders × num_moments`.
    pub moments: Vec<f64>,
}

impl DescriptorBuffers {
    #[must_use]
    pub fn row(&self, atom: usize) -> &[f64] {
        &self.q[atom * self.dim..(atom + 1) * self.dim]
    }

    /// Moments of order `n` for `atom`.
    #[must_use]
    pub fn moments_of(&self, atom: usize, n: usize) -> &[f64] {
        let start = (atom * self.num_orders + n) * self.num_moments;
        &self.moments[start..start + self.num_moments]
    }

    fn resize(&mut self, num_atoms: usize, dim: usize, num_orders: usize, num_moments: usize) {
        self.dim = dim;
        self.num_orders = num_orders;
        self.num_moments = num_moments;
        self.q.clear();
        self.q.resize(num_atoms * dim, 0.0);
        self.moments.clear();
        self.moments.resize(num_atoms * num_orders * num_moments, 0.0);
    }
}

pub struct DescriptorEngine<'a> {
    block: &'a ParameterBlock,
    invariants: &'a AngularInvariants,
}

impl<'a> DescriptorEngine<'a> {
    #[must_use]
    pub const fn new(block: &'a ParameterBlock, invariants: &'a AngularInvariants) -> Self {
        Self { block, invariants }
    }

    /// Fill `out` for every atom of `batch`. One task per atom.
    pub fn compute(
        &self,
        batch: &PackedBatch,
        lists: &NeighborLists,
        coefficients: Coefficients<'_>,
        out: &mut DescriptorBuffers,
    ) {
        let block = self.block;
        let num_orders = block.n_max_angular + 1;
        let num_moments = self.invariants.num_moments();
        out.resize(batch.num_atoms, block.dim, num_orders, num_moments);
        let temperature_slot = block.temperature_slot();

        out.q
            .par_chunks_mut(block.dim)
            .zip(out.moments.par_chunks_mut(num_orders * num_moments))
            .enumerate()
            .for_each(|(i, (q, s))| {
                let ti = batch.types[i];
                let mut g = [0.0; BASIS_CAPACITY];
                let mut gp = [0.0; BASIS_CAPACITY];

                let (idx, disp) = lists.radial.row(i);
                for (&j, d) in idx.iter().zip(disp) {
                    let tj = batch.types[j];
                    let r = norm(d);
                    let basis =
                        PairBasis::new(block.rc_radial_pair(ti, tj), r, block.basis_size_radial);
                    basis.radial_functions(
                        block.n_max_radial,
                        |n, k| coefficients.radial[block.radial_coefficient(n, k, ti, tj)],
                        &mut g,
                        &mut gp,
                    );
                    for (qn, gn) in q[..block.dim_radial].iter_mut().zip(&g) {
                        *qn += gn;
                    }
                }

                let mut values = [0.0; MAX_MOMENTS];
                let mut gradients = [[0.0; 3]; MAX_MOMENTS];
                let (idx, disp) = lists.angular.row(i);
                for (&j, d) in idx.iter().zip(disp) {
                    let tj = batch.types[j];
                    let r = norm(d);
                    let basis =
                        PairBasis::new(block.rc_angular_pair(ti, tj), r, block.basis_size_angular);
                    basis.radial_functions(
                        block.n_max_angular,
                        |n, k| coefficients.angular[block.angular_coefficient(n, k, ti, tj)],
                        &mut g,
                        &mut gp,
                    );
                    let u = [d[0] / r, d[1] / r, d[2] / r];
                    self.invariants.basis().monomials(u, &mut values, &mut gradients);
                    for (n, s_n) in s.chunks_exact_mut(num_moments).enumerate() {
                        for (slot, v) in s_n.iter_mut().enumerate() {
                            *v += g[n] * values[slot];
                        }
                    }
                }

                let mut q_n = [0.0; MAX_DEGREE + 2];
                for (n, s_n) in s.chunks_exact(num_moments).enumerate() {
                    self.invariants.evaluate(s_n, &mut q_n);
                    for (e, &value) in q_n[..block.num_invariants].iter().enumerate() {
                        q[block.angular_index(e, n)] = value;
                    }
                }

                if let Some(slot) = temperature_slot {
                    q[slot] = batch.reference.temperature[batch.config_of_atom[i]];
                }
            });
        log::debug!("descriptors: {} atoms × {} slots", batch.num_atoms, block.dim);
    }
}

pub(crate) fn norm(d: &[f64; 3]) -> f64 {
    (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt()
}
