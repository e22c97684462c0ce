// SPDX-License-Identifier: AGPL-3.0-only

//! Chain rule from `∂U/∂q` to Cartesian forces and per-atom virials.
//!
//! For an ordered pair (i, j) with `d = r_j − r_i`, the owner's descriptor
//! depends on `d`, giving the pair force `f_ij = Σ_d ∂U_i/∂q_d · ∂q_d/∂d`.
//! The owner receives `+f_ij`, the neighbor `−f_ij`, and the owner's virial
//! `W_ab −= d_a·f_b`. In dipole mode the virial diagonal instead collects
//! `−|d|²·f_a`.
//!
//! Radial pair force: `f = u·Σ_n F_n·g'_n(r)`. Angular pair force, with
//! `P_n = vjp(s_n, F)` the moment-space adjoint of the owner:
//!
//! ```text
//! f = u·Σ_{n,α} P_nα·(g'_n − |α|·g_n/r)·u^α + (1/r)·Σ_n g_n·Σ_α P_nα·∇u^α
//! ```

use crate::nep::angular::{AngularInvariants, MAX_DEGREE, MAX_MOMENTS};
use crate::nep::atomic::AtomicBuffer;
use crate::nep::basis::{PairBasis, BASIS_CAPACITY};
use crate::nep::config::{ModelMode, ParameterBlock};
use crate::nep::descriptor::{norm, DescriptorBuffers};
use crate::nep::neighbor::NeighborLists;
use crate::nep::network::NetworkBuffers;
use crate::nep::parameters::Coefficients;
use crate::nep::structure::PackedBatch;
use rayon::prelude::*;

/// Cartesian index pairs of the six virial components (xx, yy, zz, xy, yz, zx).
pub const VIRIAL_PAIRS: [(usize, usize); 6] = [(0, 0), (1, 1), (2, 2), (0, 1), (1, 2), (2, 0)];

/// Per-atom energies, forces and virials of one batch.
#[derive(Debug, Default)]
pub struct ForceBuffers {
    pub energy: Vec<f64>,
    /// `N × 3`.
    pub forces: AtomicBuffer,
    /// `N × 6`.
    pub virial: AtomicBuffer,
}

impl ForceBuffers {
    pub fn reset(&mut self, energy: &[f64]) {
        let n = energy.len();
        self.energy.clear();
        self.energy.extend_from_slice(energy);
        self.forces.reset(3 * n);
        self.virial.reset(6 * n);
    }

    #[must_use]
    pub fn force(&self, atom: usize) -> [f64; 3] {
        [0, 1, 2].map(|a| self.forces.load(3 * atom + a))
    }

    #[must_use]
    pub fn atom_virial(&self, atom: usize) -> [f64; 6] {
        [0, 1, 2, 3, 4, 5].map(|c| self.virial.load(6 * atom + c))
    }

    #[must_use]
    pub fn forces_vec(&self) -> Vec<[f64; 3]> {
        (0..self.energy.len()).map(|i| self.force(i)).collect()
    }

    #[must_use]
    pub fn virials_vec(&self) -> Vec<[f64; 6]> {
        (0..self.energy.len()).map(|i| self.atom_virial(i)).collect()
    }
}

/// Scatter one pair force into the owner, the neighbor and the owner's virial.
pub fn accumulate_pair(
    forces: &AtomicBuffer,
    virial: &AtomicBuffer,
    mode: ModelMode,
    i: usize,
    j: usize,
    d: [f64; 3],
    f: [f64; 3],
) {
    for a in 0..3 {
        forces.add(3 * i + a, f[a]);
        forces.add(3 * j + a, -f[a]);
    }
    if mode == ModelMode::Dipole {
        let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
        for a in 0..3 {
            virial.add(6 * i + a, -r2 * f[a]);
        }
    } else {
        for (c, &(p, q)) in VIRIAL_PAIRS.iter().enumerate() {
            virial.add(6 * i + c, -d[p] * f[q]);
        }
    }
}

/// `out[n] = vjp(s_n, weights restricted to order n)` for every angular order.
///
/// `weights` is a full descriptor-length vector (a network derivative or an
/// adjoint); `out` is `num_orders × num_moments`.
pub(crate) fn moment_adjoint(
    block: &ParameterBlock,
    invariants: &AngularInvariants,
    descriptors: &DescriptorBuffers,
    atom: usize,
    weights: &[f64],
    out: &mut [f64],
) {
    let m = descriptors.num_moments;
    let mut w = [0.0; MAX_DEGREE + 2];
    for (n, p_n) in out.chunks_exact_mut(m).enumerate() {
        for (e, w_e) in w[..block.num_invariants].iter_mut().enumerate() {
            *w_e = weights[block.angular_index(e, n)];
        }
        invariants.vjp(descriptors.moments_of(atom, n), &w, p_n);
    }
}

pub struct ForceAssembler<'a> {
    block: &'a ParameterBlock,
    invariants: &'a AngularInvariants,
}

impl<'a> ForceAssembler<'a> {
    #[must_use]
    pub const fn new(block: &'a ParameterBlock, invariants: &'a AngularInvariants) -> Self {
        Self { block, invariants }
    }

    /// Energies from the network, then radial and angular force passes.
    pub fn assemble(
        &self,
        batch: &PackedBatch,
        lists: &NeighborLists,
        coefficients: Coefficients<'_>,
        descriptors: &DescriptorBuffers,
        network: &NetworkBuffers,
        out: &mut ForceBuffers,
    ) {
        out.reset(&network.heads[0].output);
        self.radial_pass(batch, lists, coefficients, network, out);
        self.angular_pass(batch, lists, coefficients, descriptors, network, out);
        if self.block.has_polarizability_head() {
            let isotropic = &network.heads[1].output;
            for (i, &scalar) in isotropic.iter().enumerate() {
                for a in 0..3 {
                    out.virial.add(6 * i + a, scalar);
                }
            }
        }
        log::debug!("forces: {} atoms", batch.num_atoms);
    }

    fn radial_pass(
        &self,
        batch: &PackedBatch,
        lists: &NeighborLists,
        coefficients: Coefficients<'_>,
        network: &NetworkBuffers,
        out: &ForceBuffers,
    ) {
        let block = self.block;
        (0..batch.num_atoms).into_par_iter().for_each(|i| {
            let ti = batch.types[i];
            let fp = network.fp(0, i);
            let mut g = [0.0; BASIS_CAPACITY];
            let mut gp = [0.0; BASIS_CAPACITY];
            let (idx, disp) = lists.radial.row(i);
            for (&j, d) in idx.iter().zip(disp) {
                let tj = batch.types[j];
                let r = norm(d);
                PairBasis::new(block.rc_radial_pair(ti, tj), r, block.basis_size_radial)
                    .radial_functions(
                        block.n_max_radial,
                        |n, k| coefficients.radial[block.radial_coefficient(n, k, ti, tj)],
                        &mut g,
                        &mut gp,
                    );
                let slope: f64 = fp[..block.dim_radial].iter().zip(&gp).map(|(a, b)| a * b).sum();
                let f = [slope * d[0] / r, slope * d[1] / r, slope * d[2] / r];
                accumulate_pair(&out.forces, &out.virial, block.mode, i, j, *d, f);
            }
        });
    }

    fn angular_pass(
        &self,
        batch: &PackedBatch,
        lists: &NeighborLists,
        coefficients: Coefficients<'_>,
        descriptors: &DescriptorBuffers,
        network: &NetworkBuffers,
        out: &ForceBuffers,
    ) {
        let block = self.block;
        let moments = self.invariants.basis();
        let m = descriptors.num_moments;
        let orders = descriptors.num_orders;
        let degrees: Vec<f64> = (0..m).map(|slot| moments.degree(slot) as f64).collect();

        (0..batch.num_atoms).into_par_iter().for_each(|i| {
            let (idx, disp) = lists.angular.row(i);
            if idx.is_empty() {
                return;
            }
            let ti = batch.types[i];
            let mut p = vec![0.0; orders * m];
            moment_adjoint(block, self.invariants, descriptors, i, network.fp(0, i), &mut p);

            let mut g = [0.0; BASIS_CAPACITY];
            let mut gp = [0.0; BASIS_CAPACITY];
            let mut values = [0.0; MAX_MOMENTS];
            let mut gradients = [[0.0; 3]; MAX_MOMENTS];
            for (&j, d) in idx.iter().zip(disp) {
                let tj = batch.types[j];
                let r = norm(d);
                PairBasis::new(block.rc_angular_pair(ti, tj), r, block.basis_size_angular)
                    .radial_functions(
                        block.n_max_angular,
                        |n, k| coefficients.angular[block.angular_coefficient(n, k, ti, tj)],
                        &mut g,
                        &mut gp,
                    );
                let u = [d[0] / r, d[1] / r, d[2] / r];
                moments.monomials(u, &mut values, &mut gradients);

                let mut along = 0.0;
                let mut across = [0.0; 3];
                for (n, p_n) in p.chunks_exact(m).enumerate() {
                    for slot in 0..m {
                        let weight = p_n[slot];
                        along += weight * (gp[n] - degrees[slot] * g[n] / r) * values[slot];
                        for a in 0..3 {
                            across[a] += g[n] * weight * gradients[slot][a];
                        }
                    }
                }
                let f = [0, 1, 2].map(|a| along * u[a] + across[a] / r);
                accumulate_pair(&out.forces, &out.virial, block.mode, i, j, *d, f);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_scatter_is_equal_and_opposite() {
        let forces = AtomicBuffer::zeros(6);
        let virial = AtomicBuffer::zeros(12);
        let d = [1.0, 2.0, -1.0];
        let f = [0.5, -0.25, 2.0];
        accumulate_pair(&forces, &virial, ModelMode::Potential, 0, 1, d, f);
        let all = forces.to_vec();
        for a in 0..3 {
            assert_eq!(all[a], -all[3 + a]);
        }
        assert_eq!(virial.load(0), -0.5);
        assert_eq!(virial.load(3), -d[0] * f[1]);
        assert_eq!(virial.load(5), -d[2] * f[0]);
        assert!(virial.to_vec()[6..].iter().all(|&v| v == 0.0), "neighbor virial untouched");
    }

    #[test]
    fn dipole_virial_uses_squared_distance() {
        let forces = AtomicBuffer::zeros(6);
        let virial = AtomicBuffer::zeros(12);
        accumulate_pair(
            &forces,
            &virial,
            ModelMode::Dipole,
            0,
            1,
            [1.0, 1.0, 0.0],
            [1.0, 2.0, 3.0],
        );
        assert_eq!(&virial.to_vec()[..6], &[-2.0, -4.0, -6.0, 0.0, 0.0, 0.0]);
    }
}
