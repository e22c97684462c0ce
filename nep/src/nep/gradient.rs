// SPDX-License-Identifier: AGPL-3.0-only

//! Exact gradient of the weighted energy/force/virial loss.
//!
//! # Loss
//!
//! ```text
//! L_E = λ_e/N_cfg · Σ_c w_c·ε_c²                  ε_c = (E_c − E_ref)/N_c
//! L_F = λ_f/(3N_F) · Σ_i w_c·|κ_i(F_i − F_ref)|²   κ_i = τ_t·δ/(δ + |F_ref|)  (δ > 0)
//! L_V = λ_v/(K·N_V) · Σ_c w_c·Σ_a η_ca²            η_ca = (W_ca − W_ref)/N_c
//! ```
//!
//! Normalizers count the whole dataset, so per-device losses and gradients
//! add up to the full-batch values.
//!
//! # Stages
//!
//! 1. **Residuals.** Per configuration `e_c = ∂L/∂U_i` and `v_c = ∂L/∂W_i`;
//!    per atom `R_i = ∂L/∂F_i`. A pair force `f_ij` then carries the adjoint
//!    `Ω_ij = R_i − R_j + Λ_ij`, where `Λ` is the virial term.
//! 2. **Descriptor adjoint** (one task per atom). `Ψ = Σ_j (∂q/∂d_ij)ᵀ·Ω_ij`
//!    is the force/virial residual pulled back to descriptor space. With it,
//!    `A = e_c·F + H·Ψ` (+ `p_c·F₂` for polarizability) is the total adjoint
//!    of `q`. In moment space `P = vjp(s, F)` and
//!    `C = vjp(s, A) + hvp(s, F, Z)`, where `Z` is the moment-space form of Ψ.
//! 3. **Radial pass** (one task per atom × neighbor slot). Each pair adds
//!    `A_n·f_k + F_n·f'_k·(Ω·u)` to `c_r[n, k, t_i, t_j]`. Slot 0 also adds
//!    the atom's network-parameter gradient.
//! 4. **Angular pass** (one task per atom × angular slot). Each pair adds
//!    `f_k·Σ_α C_α·u^α + f'_k·Σ_α P_α·u^α(Ω·u) + f_k·Σ_α P_α·b_α`, where
//!    `b_α = (Ω·∇u^α − |α|·u^α(Ω·u))/r`.
//!
//! Every stage reads only buffers completed by earlier stages; all writes to
//! the shared gradient are atomic adds.

use crate::nep::angular::{AngularInvariants, MAX_DEGREE, MAX_MOMENTS};
use crate::nep::atomic::AtomicBuffer;
use crate::nep::basis::{PairBasis, BASIS_CAPACITY};
use crate::nep::config::{ModelMode, ParameterBlock};
use crate::nep::descriptor::{norm, DescriptorBuffers};
use crate::nep::force::{moment_adjoint, ForceBuffers, VIRIAL_PAIRS};
use crate::nep::neighbor::NeighborLists;
use crate::nep::network::{NetworkBuffers, NetworkEvaluator};
use crate::nep::parameters::NetworkParameters;
use crate::nep::structure::{Dataset, PackedBatch};
use rayon::prelude::*;
use std::ops::AddAssign;

/// Dataset-wide loss denominators.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LossNormalization {
    pub num_configs: usize,
    /// Atoms belonging to configurations with force targets.
    pub num_force_atoms: usize,
    pub num_virial_configs: usize,
}

impl LossNormalization {
    #[must_use]
    pub fn from_dataset(dataset: &dyn Dataset) -> Self {
        let mut norm = Self {
            num_configs: dataset.len(),
            num_force_atoms: 0,
            num_virial_configs: 0,
        };
        for c in 0..dataset.len() {
            let s = dataset.structure(c);
            if !s.forces.is_empty() {
                norm.num_force_atoms += s.num_atoms();
            }
            if s.virial.is_some() {
                norm.num_virial_configs += 1;
            }
        }
        norm
    }
}

/// Loss split by term.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LossBreakdown {
    pub energy: f64,
    pub force: f64,
    pub virial: f64,
}

impl LossBreakdown {
    #[must_use]
    pub fn total(&self) -> f64 {
        self.energy + self.force + self.virial
    }
}

impl AddAssign for LossBreakdown {
    fn add_assign(&mut self, other: Self) {
        self.energy += other.energy;
        self.force += other.force;
        self.virial += other.virial;
    }
}

/// Loss derivatives with respect to predicted outputs.
#[derive(Clone, Debug, Default)]
pub struct ResidualScalars {
    /// `∂L/∂U_i`, shared by every atom of the configuration.
    pub energy: Vec<f64>,
    /// `∂L/∂W_i` per virial component, shared by every atom of the configuration.
    pub virial: Vec<[f64; 6]>,
    /// `∂L/∂F_i` per atom.
    pub force: Vec<[f64; 3]>,
}

impl ResidualScalars {
    /// `∂L/∂U₂` for the polarizability head: it enters all three diagonal slots.
    #[must_use]
    pub fn isotropic(&self, config: usize) -> f64 {
        let v = &self.virial[config];
        v[0] + v[1] + v[2]
    }
}

/// Per-atom adjoints and the shared gradient accumulator.
#[derive(Debug, Default)]
pub struct TrainingBuffers {
    pub residuals: ResidualScalars,
    /// Ψ, `N × D`.
    pub psi: Vec<f64>,
    /// A, `N × D`.
    pub adjoint: Vec<f64>,
    /// `P = vjp(s, F)`, `N × orders × moments`.
    pub force_moments: Vec<f64>,
    /// `C = vjp(s, A) + hvp(s, F, Z)`, `N × orders × moments`.
    pub curvature_moments: Vec<f64>,
    pub gradient: AtomicBuffer,
}

/// Forward-pass results the gradient stages read.
#[derive(Clone, Copy)]
pub struct ForwardState<'b> {
    pub batch: &'b PackedBatch,
    pub lists: &'b NeighborLists,
    pub descriptors: &'b DescriptorBuffers,
    pub network: &'b NetworkBuffers,
    pub forces: &'b ForceBuffers,
}

pub struct TrainingGradientEngine<'a> {
    block: &'a ParameterBlock,
    invariants: &'a AngularInvariants,
    normalization: LossNormalization,
    scale: &'a [f64],
}

impl<'a> TrainingGradientEngine<'a> {
    #[must_use]
    pub const fn new(
        block: &'a ParameterBlock,
        invariants: &'a AngularInvariants,
        normalization: LossNormalization,
        scale: &'a [f64],
    ) -> Self {
        Self {
            block,
            invariants,
            normalization,
            scale,
        }
    }

    /// Stage 1: loss and output residuals. Cheap; also used without gradients.
    #[must_use]
    pub fn residuals(
        &self,
        batch: &PackedBatch,
        forces: &ForceBuffers,
    ) -> (ResidualScalars, LossBreakdown) {
        let block = self.block;
        let loss = &block.loss;
        let n_cfg = self.normalization.num_configs.max(1) as f64;
        let n_force = (3 * self.normalization.num_force_atoms).max(1) as f64;
        let k = block.num_virial_components();
        let n_virial = (k * self.normalization.num_virial_configs).max(1) as f64;
        let reference = &batch.reference;

        type ConfigResidual = (f64, [f64; 6], LossBreakdown, Vec<[f64; 3]>);
        let per_config: Vec<ConfigResidual> = (0..batch.num_configs())
            .into_par_iter()
            .map(|c| {
                let atoms = batch.atoms_of(c);
                let nc = atoms.len() as f64;
                let w = reference.weight[c];
                let mut part = LossBreakdown::default();

                let predicted: f64 = forces.energy[atoms.clone()].iter().sum();
                let eps = (predicted - reference.energy[c]) / nc;
                part.energy = loss.energy / n_cfg * w * eps * eps;
                let e_c = 2.0 * loss.energy * w * eps / (n_cfg * nc);

                let mut v_c = [0.0; 6];
                if let Some(target) = reference.virial[c] {
                    let mut total = [0.0; 6];
                    for i in atoms.clone() {
                        for (t, v) in total.iter_mut().zip(forces.atom_virial(i)) {
                            *t += v;
                        }
                    }
                    for a in 0..k {
                        let eta = (total[a] - target[a]) / nc;
                        part.virial += loss.virial / n_virial * w * eta * eta;
                        v_c[a] = 2.0 * loss.virial * w * eta / (n_virial * nc);
                    }
                }

                let residual: Vec<[f64; 3]> = atoms
                    .map(|i| {
                        if !reference.has_forces[c] {
                            return [0.0; 3];
                        }
                        let target = reference.forces[i];
                        let predicted = forces.force(i);
                        let mut kappa = block.type_weight(batch.types[i]);
                        if loss.force_delta > 0.0 {
                            let magnitude = norm(&target);
                            kappa *= loss.force_delta / (loss.force_delta + magnitude);
                        }
                        let diff = [0, 1, 2].map(|a| predicted[a] - target[a]);
                        let sq = diff[0] * diff[0] + diff[1] * diff[1] + diff[2] * diff[2];
                        part.force += loss.force / n_force * w * kappa * kappa * sq;
                        diff.map(|x| 2.0 * loss.force * w * kappa * kappa * x / n_force)
                    })
                    .collect();
                (e_c, v_c, part, residual)
            })
            .collect();

        let mut scalars = ResidualScalars {
            energy: Vec::with_capacity(per_config.len()),
            virial: Vec::with_capacity(per_config.len()),
            force: Vec::with_capacity(batch.num_atoms),
        };
        let mut total = LossBreakdown::default();
        for (e_c, v_c, part, residual) in per_config {
            scalars.energy.push(e_c);
            scalars.virial.push(v_c);
            scalars.force.extend(residual);
            total += part;
        }
        (scalars, total)
    }

    /// `Ω_ij = R_i − R_j + Λ_ij`: adjoint of the pair force owned by `i`.
    fn pair_adjoint(
        &self,
        residuals: &ResidualScalars,
        batch: &PackedBatch,
        i: usize,
        j: usize,
        d: &[f64; 3],
    ) -> [f64; 3] {
        let (ri, rj) = (residuals.force[i], residuals.force[j]);
        let mut omega = [ri[0] - rj[0], ri[1] - rj[1], ri[2] - rj[2]];
        let v = &residuals.virial[batch.config_of_atom[i]];
        if self.block.mode == ModelMode::Dipole {
            let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
            for a in 0..3 {
                omega[a] -= v[a] * r2;
            }
        } else {
            for (c, &(p, q)) in VIRIAL_PAIRS.iter().enumerate() {
                omega[q] -= v[c] * d[p];
            }
        }
        omega
    }

    /// Run every stage and return this batch's gradient and loss.
    pub fn run(
        &self,
        params: &NetworkParameters,
        state: ForwardState<'_>,
        buffers: &mut TrainingBuffers,
    ) -> (Vec<f64>, LossBreakdown) {
        let (residuals, loss) = self.residuals(state.batch, state.forces);
        buffers.residuals = residuals;
        self.descriptor_adjoint(params, state, buffers);
        buffers.gradient.reset(params.len());
        self.radial_pass(params, state, buffers);
        self.angular_pass(params, state, buffers);
        log::debug!(
            "gradient: {} atoms, loss {:.6e}",
            state.batch.num_atoms,
            loss.total()
        );
        (buffers.gradient.to_vec(), loss)
    }

    /// Stage 2: Ψ, A, P and C for every atom.
    pub fn descriptor_adjoint(
        &self,
        params: &NetworkParameters,
        state: ForwardState<'_>,
        buffers: &mut TrainingBuffers,
    ) {
        let block = self.block;
        let coefficients = params.coefficients();
        let ForwardState {
            batch,
            lists,
            descriptors,
            network,
            ..
        } = state;
        let n = batch.num_atoms;
        let d = block.dim;
        let m = descriptors.num_moments;
        let orders = descriptors.num_orders;
        let moments = self.invariants.basis();
        let degrees: Vec<f64> = (0..m).map(|slot| moments.degree(slot) as f64).collect();

        for v in [&mut buffers.psi, &mut buffers.adjoint] {
            v.clear();
            v.resize(n * d, 0.0);
        }
        for v in [&mut buffers.force_moments, &mut buffers.curvature_moments] {
            v.clear();
            v.resize(n * orders * m, 0.0);
        }
        let residuals = &buffers.residuals;

        buffers
            .psi
            .par_chunks_mut(d)
            .zip(buffers.adjoint.par_chunks_mut(d))
            .zip(buffers.force_moments.par_chunks_mut(orders * m))
            .zip(buffers.curvature_moments.par_chunks_mut(orders * m))
            .enumerate()
            .for_each(|(i, (((psi, adjoint), p_force), curvature))| {
                let ti = batch.types[i];
                let c = batch.config_of_atom[i];
                let mut g = [0.0; BASIS_CAPACITY];
                let mut gp = [0.0; BASIS_CAPACITY];

                let (idx, disp) = lists.radial.row(i);
                for (&j, dv) in idx.iter().zip(disp) {
                    let tj = batch.types[j];
                    let r = norm(dv);
                    PairBasis::new(block.rc_radial_pair(ti, tj), r, block.basis_size_radial)
                        .radial_functions(
                            block.n_max_radial,
                            |n, k| coefficients.radial[block.radial_coefficient(n, k, ti, tj)],
                            &mut g,
                            &mut gp,
                        );
                    let omega = self.pair_adjoint(residuals, batch, i, j, dv);
                    let ou = (omega[0] * dv[0] + omega[1] * dv[1] + omega[2] * dv[2]) / r;
                    for (psi_n, gp_n) in psi[..block.dim_radial].iter_mut().zip(&gp) {
                        *psi_n += gp_n * ou;
                    }
                }

                let mut z = vec![0.0; orders * m];
                let mut values = [0.0; MAX_MOMENTS];
                let mut gradients = [[0.0; 3]; MAX_MOMENTS];
                let (idx, disp) = lists.angular.row(i);
                for (&j, dv) in idx.iter().zip(disp) {
                    let tj = batch.types[j];
                    let r = norm(dv);
                    PairBasis::new(block.rc_angular_pair(ti, tj), r, block.basis_size_angular)
                        .radial_functions(
                            block.n_max_angular,
                            |n, k| coefficients.angular[block.angular_coefficient(n, k, ti, tj)],
                            &mut g,
                            &mut gp,
                        );
                    let u = [dv[0] / r, dv[1] / r, dv[2] / r];
                    moments.monomials(u, &mut values, &mut gradients);
                    let omega = self.pair_adjoint(residuals, batch, i, j, dv);
                    let ou = omega[0] * u[0] + omega[1] * u[1] + omega[2] * u[2];
                    for (n, z_n) in z.chunks_exact_mut(m).enumerate() {
                        for (slot, z_slot) in z_n.iter_mut().enumerate() {
                            let og = omega[0] * gradients[slot][0]
                                + omega[1] * gradients[slot][1]
                                + omega[2] * gradients[slot][2];
                            *z_slot += gp[n] * values[slot] * ou
                                + g[n] / r * (og - degrees[slot] * values[slot] * ou);
                        }
                    }
                }
                let mut dq = [0.0; MAX_DEGREE + 2];
                for (n, z_n) in z.chunks_exact(m).enumerate() {
                    self.invariants.jvp(descriptors.moments_of(i, n), z_n, &mut dq);
                    for (e, &value) in dq[..block.num_invariants].iter().enumerate() {
                        psi[block.angular_index(e, n)] = value;
                    }
                }

                let fp = network.fp(0, i);
                let hessian = network.hessian(i);
                let e_c = residuals.energy[c];
                let rows = adjoint.iter_mut().zip(hessian.chunks_exact(d));
                for (a, (adjoint_d, row)) in rows.enumerate() {
                    let curvature_term: f64 = row.iter().zip(psi.iter()).map(|(h, p)| h * p).sum();
                    *adjoint_d = e_c * fp[a] + curvature_term;
                }
                if block.has_polarizability_head() {
                    let p_c = residuals.isotropic(c);
                    for (adjoint_d, fp2) in adjoint.iter_mut().zip(network.fp(1, i)) {
                        *adjoint_d += p_c * fp2;
                    }
                }

                moment_adjoint(block, self.invariants, descriptors, i, fp, p_force);
                moment_adjoint(block, self.invariants, descriptors, i, adjoint, curvature);
                let mut hz = vec![0.0; m];
                let mut w = [0.0; MAX_DEGREE + 2];
                let orders = curvature.chunks_exact_mut(m).zip(z.chunks_exact(m));
                for (n, (c_n, z_n)) in orders.enumerate() {
                    for (e, w_e) in w[..block.num_invariants].iter_mut().enumerate() {
                        *w_e = fp[block.angular_index(e, n)];
                    }
                    self.invariants.hvp(descriptors.moments_of(i, n), &w, z_n, &mut hz);
                    for (c_slot, h) in c_n.iter_mut().zip(&hz) {
                        *c_slot += h;
                    }
                }
            });
    }

    /// Stage 3: radial coefficients, plus network parameters from slot 0.
    pub fn radial_pass(
        &self,
        params: &NetworkParameters,
        state: ForwardState<'_>,
        buffers: &TrainingBuffers,
    ) {
        let block = self.block;
        let layout = params.layout();
        let coefficients = params.coefficients();
        let evaluator = NetworkEvaluator::new(block, self.scale);
        let ForwardState {
            batch,
            lists,
            descriptors,
            network,
            ..
        } = state;
        let d = block.dim;
        let residuals = &buffers.residuals;
        let grad = &buffers.gradient;
        let offset = layout.c_radial.start;

        (0..batch.num_atoms)
            .into_par_iter()
            .flat_map_iter(|i| (0..lists.radial.count(i).max(1)).map(move |slot| (i, slot)))
            .for_each(|(i, slot)| {
                let ti = batch.types[i];
                let c = batch.config_of_atom[i];
                let psi = &buffers.psi[i * d..(i + 1) * d];
                if slot == 0 {
                    let q = descriptors.row(i);
                    evaluator.accumulate_parameter_gradient(
                        layout,
                        0,
                        ti,
                        &params.network(0, ti),
                        q,
                        network.activations(0, i),
                        residuals.energy[c],
                        Some(psi),
                        grad,
                    );
                    if block.has_polarizability_head() {
                        evaluator.accumulate_parameter_gradient(
                            layout,
                            1,
                            ti,
                            &params.network(1, ti),
                            q,
                            network.activations(1, i),
                            residuals.isotropic(c),
                            None,
                            grad,
                        );
                    }
                }
                if slot >= lists.radial.count(i) {
                    return;
                }

                let (j, dv) = lists.radial.pair(i, slot);
                let tj = batch.types[j];
                let r = norm(&dv);
                let basis =
                    PairBasis::new(block.rc_radial_pair(ti, tj), r, block.basis_size_radial);
                let omega = self.pair_adjoint(residuals, batch, i, j, &dv);
                let ou = (omega[0] * dv[0] + omega[1] * dv[1] + omega[2] * dv[2]) / r;
                let adjoint = &buffers.adjoint[i * d..(i + 1) * d];
                let fp = network.fp(0, i);
                for n in 0..block.dim_radial {
                    for k in 0..=block.basis_size_radial {
                        let value = adjoint[n] * basis.f[k] + fp[n] * basis.fp[k] * ou;
                        grad.add(offset + block.radial_coefficient(n, k, ti, tj), value);
                    }
                }
            });
    }

    /// Stage 4: angular coefficients.
    pub fn angular_pass(
        &self,
        params: &NetworkParameters,
        state: ForwardState<'_>,
        buffers: &TrainingBuffers,
    ) {
        let block = self.block;
        let offset = params.layout().c_angular.start;
        let ForwardState { batch, lists, descriptors, .. } = state;
        let m = descriptors.num_moments;
        let orders = descriptors.num_orders;
        let moments = self.invariants.basis();
        let degrees: Vec<f64> = (0..m).map(|slot| moments.degree(slot) as f64).collect();
        let residuals = &buffers.residuals;
        let grad = &buffers.gradient;

        (0..batch.num_atoms)
            .into_par_iter()
            .flat_map_iter(|i| (0..lists.angular.count(i)).map(move |slot| (i, slot)))
            .for_each(|(i, slot)| {
                let ti = batch.types[i];
                let (j, dv) = lists.angular.pair(i, slot);
                let tj = batch.types[j];
                let r = norm(&dv);
                let basis =
                    PairBasis::new(block.rc_angular_pair(ti, tj), r, block.basis_size_angular);
                let u = [dv[0] / r, dv[1] / r, dv[2] / r];
                let mut values = [0.0; MAX_MOMENTS];
                let mut gradients = [[0.0; 3]; MAX_MOMENTS];
                moments.monomials(u, &mut values, &mut gradients);
                let omega = self.pair_adjoint(residuals, batch, i, j, &dv);
                let ou = omega[0] * u[0] + omega[1] * u[1] + omega[2] * u[2];

                let rows = i * orders * m..(i + 1) * orders * m;
                let p_force = &buffers.force_moments[rows.clone()];
                let curvature = &buffers.curvature_moments[rows];
                for n in 0..orders {
                    let p_n = &p_force[n * m..(n + 1) * m];
                    let c_n = &curvature[n * m..(n + 1) * m];
                    let mut value_term = 0.0;
                    let mut slope_term = 0.0;
                    for slot in 0..m {
                        let og = omega[0] * gradients[slot][0]
                            + omega[1] * gradients[slot][1]
                            + omega[2] * gradients[slot][2];
                        value_term += c_n[slot] * values[slot]
                            + p_n[slot] * (og - degrees[slot] * values[slot] * ou) / r;
                        slope_term += p_n[slot] * values[slot] * ou;
                    }
                    for k in 0..=block.basis_size_angular {
                        let value = basis.f[k] * value_term + basis.fp[k] * slope_term;
                        grad.add(offset + block.angular_coefficient(n, k, ti, tj), value);
                    }
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nep::structure::Structure;

    fn cubic(side: f64) -> [[f64; 3]; 3] {
        [[side, 0.0, 0.0], [0.0, side, 0.0], [0.0, 0.0, side]]
    }

    #[test]
    fn normalization_counts_targets() {
        let data = vec![
            Structure::new(cubic(10.0), vec![[0.0; 3]; 2], vec![0, 0])
                .with_forces(vec![[0.0; 3]; 2]),
            Structure::new(cubic(10.0), vec![[0.0; 3]; 3], vec![0, 0, 0]).with_virial([0.0; 6]),
            Structure::new(cubic(10.0), vec![[0.0; 3]; 4], vec![0; 4]),
        ];
        let norm = LossNormalization::from_dataset(&data);
        assert_eq!(
            norm,
            LossNormalization {
                num_configs: 3,
                num_force_atoms: 2,
                num_virial_configs: 1,
            }
        );
    }

    #[test]
    fn breakdown_adds_componentwise() {
        let mut a = LossBreakdown {
            energy: 1.0,
            force: 2.0,
            virial: 3.0,
        };
        a += LossBreakdown {
            energy: 0.5,
            force: 0.5,
            virial: 0.5,
        };
        assert!((a.total() - 7.5).abs() < f64::EPSILON);
    }

    #[test]
    fn isotropic_residual_sums_the_diagonal() {
        let scalars = ResidualScalars {
            energy: vec![0.0],
            virial: vec![[1.0, 2.0, 3.0, 10.0, 10.0, 10.0]],
            force: Vec::new(),
        };
        assert!((scalars.isotropic(0) - 6.0).abs() < f64::EPSILON);
    }
}
