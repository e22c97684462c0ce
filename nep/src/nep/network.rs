// SPDX-License-Identifier: AGPL-3.0-only

//! Single-hidden-layer network per chemical type, with analytic derivatives.
//!
//! ```text
//! x_d = q_d·σ_d
//! z_h = Σ_d W_hd·x_d − b0_h,   a_h = tanh(z_h)
//! U   = Σ_h w1_h·a_h − b1
//! ∂U/∂q_d       = σ_d·Σ_h w1_h(1 − a_h²)·W_hd
//! ∂²U/∂q_d∂q_e  = σ_d·σ_e·Σ_h w1_h·(−2a_h(1 − a_h²))·W_hd·W_he
//! ```
//!
//! Inference stores `U`, `∂U/∂q` and the activations. Training adds the
//! descriptor Hessian of head 0. Parameter derivatives are never stored as
//! matrices: `accumulate_parameter_gradient` rebuilds them from the retained
//! activations and contracts them on the fly.

use crate::nep::atomic::AtomicBuffer;
use crate::nep::config::ParameterBlock;
use crate::nep::descriptor::DescriptorBuffers;
use crate::nep::parameters::{NetworkParameters, ParameterLayout, TypeNetwork};
use rayon::prelude::*;

/// What a network launch produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Output and first derivative.
    Inference,
    /// Also the descriptor Hessian, for the force-residual gradient.
    Training,
}

/// Outputs of one head for every atom.
#[derive(Clone, Debug, Default)]
pub struct HeadOutput {
    /// `U` per atom.
    pub output: Vec<f64>,
    /// `∂U/∂q`, `N × D`.
    pub fp: Vec<f64>,
    /// `tanh(z)`, `N × H`.
    pub activations: Vec<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct NetworkBuffers {
    pub dim: usize,
    pub num_neurons: usize,
    pub heads: Vec<HeadOutput>,
    /// `∂²U/∂q∂q` of head 0, `N × D × D`; empty after an inference launch.
    pub hessian: Vec<f64>,
}

impl NetworkBuffers {
    #[must_use]
    pub fn fp(&self, head: usize, atom: usize) -> &[f64] {
        &self.heads[head].fp[atom * self.dim..(atom + 1) * self.dim]
    }

    #[must_use]
    pub fn activations(&self, head: usize, atom: usize) -> &[f64] {
        let h = self.num_neurons;
        &self.heads[head].activations[atom * h..(atom + 1) * h]
    }

    #[must_use]
    pub fn hessian(&self, atom: usize) -> &[f64] {
        let d2 = self.dim * self.dim;
        &self.hessian[atom * d2..(atom + 1) * d2]
    }
}

pub struct NetworkEvaluator<'a> {
    block: &'a ParameterBlock,
    scale: &'a [f64],
}

impl<'a> NetworkEvaluator<'a> {
    #[must_use]
    pub const fn new(block: &'a ParameterBlock, scale: &'a [f64]) -> Self {
        Self { block, scale }
    }

    /// Evaluate every head for every atom. One task per atom.
    pub fn evaluate(
        &self,
        types: &[usize],
        descriptors: &DescriptorBuffers,
        params: &NetworkParameters,
        mode: EvaluationMode,
        out: &mut NetworkBuffers,
    ) {
        let layout = params.layout();
        let (n, d, h) = (types.len(), layout.dim, layout.num_neurons);
        out.dim = d;
        out.num_neurons = h;
        out.heads.resize_with(layout.num_heads, HeadOutput::default);

        for (head, buffers) in out.heads.iter_mut().enumerate() {
            buffers.output.clear();
            buffers.output.resize(n, 0.0);
            buffers.fp.clear();
            buffers.fp.resize(n * d, 0.0);
            buffers.activations.clear();
            buffers.activations.resize(n * h, 0.0);
            buffers
                .output
                .par_iter_mut()
                .zip(buffers.fp.par_chunks_mut(d))
                .zip(buffers.activations.par_chunks_mut(h))
                .enumerate()
                .for_each(|(i, ((u, fp), a))| {
                    let net = params.network(head, types[i]);
                    *u = self.forward(&net, descriptors.row(i), fp, a);
                });
        }

        out.hessian.clear();
        if mode == EvaluationMode::Training {
            out.hessian.resize(n * d * d, 0.0);
            let activations = &out.heads[0].activations;
            out.hessian
                .par_chunks_mut(d * d)
                .enumerate()
                .for_each(|(i, hess)| {
                    let net = params.network(0, types[i]);
                    self.hessian(&net, &activations[i * h..(i + 1) * h], hess);
                });
        }
        log::debug!(
            "network: {n} atoms, {} head(s), {mode:?}",
            layout.num_heads
        );
    }

    /// Returns `U`; writes `∂U/∂q` and the activations.
    fn forward(&self, net: &TypeNetwork<'_>, q: &[f64], fp: &mut [f64], a: &mut [f64]) -> f64 {
        let d = q.len();
        let mut u = -net.b1;
        for (hidden, a_h) in a.iter_mut().enumerate() {
            let w = &net.w0[hidden * d..(hidden + 1) * d];
            let z: f64 = w
                .iter()
                .zip(q)
                .zip(self.scale)
                .map(|((w, q), s)| w * q * s)
                .sum::<f64>()
                - net.b0[hidden];
            *a_h = z.tanh();
            u += net.w1[hidden] * *a_h;
            let slope = net.w1[hidden] * (1.0 - *a_h * *a_h);
            for ((fp_d, w), s) in fp.iter_mut().zip(w).zip(self.scale) {
                *fp_d += slope * w * s;
            }
        }
        u
    }

    fn hessian(&self, net: &TypeNetwork<'_>, a: &[f64], hess: &mut [f64]) {
        let d = self.block.dim;
        for (hidden, &a_h) in a.iter().enumerate() {
            let curvature = net.w1[hidden] * (-2.0 * a_h * (1.0 - a_h * a_h));
            let w = &net.w0[hidden * d..(hidden + 1) * d];
            for (row, (w_d, s_d)) in hess.chunks_exact_mut(d).zip(w.iter().zip(self.scale)) {
                let left = curvature * w_d * s_d;
                for ((h_de, w_e), s_e) in row.iter_mut().zip(w).zip(self.scale) {
                    *h_de += left * w_e * s_e;
                }
            }
        }
    }

    /// `grad += weight·∂U/∂θ + ∂/∂θ (Σ_d ψ_d·∂U/∂q_d)` for one atom of type `t`.
    ///
    /// The first term is the parameter Jacobian; the second contracts the
    /// mixed derivative against the descriptor adjoint `psi`. With
    /// `ψ̃ = σ⊙ψ`, `ρ_h = Σ_d W_hd·ψ̃_d` and `a' = 1 − a²`:
    ///
    /// | Parameter | Jacobian | Mixed |
    /// |-----------|----------|-------|
    /// | `W_hd` | `v·a'·x_d` | `v·a'·ψ̃_d − 2v·a·a'·x_d·ρ_h` |
    /// | `b0_h` | `−v·a'` | `2a·a'·v·ρ_h` |
    /// | `w1_h` | `a` | `a'·ρ_h` |
    /// | `b1` | `−1` | 0 |
    #[allow(clippy::too_many_arguments)]
    pub fn accumulate_parameter_gradient(
        &self,
        layout: &ParameterLayout,
        head: usize,
        t: usize,
        net: &TypeNetwork<'_>,
        q: &[f64],
        a: &[f64],
        weight: f64,
        psi: Option<&[f64]>,
        grad: &AtomicBuffer,
    ) {
        let d = q.len();
        let x: Vec<f64> = q.iter().zip(self.scale).map(|(q, s)| q * s).collect();
        let psi_scaled: Option<Vec<f64>> =
            psi.map(|p| p.iter().zip(self.scale).map(|(p, s)| p * s).collect());
        let w0 = layout.w0(head, t).start;
        let b0 = layout.b0(head, t).start;
        let w1 = layout.w1(head, t).start;

        for (hidden, &a_h) in a.iter().enumerate() {
            let v = net.w1[hidden];
            let da = 1.0 - a_h * a_h;
            let row = &net.w0[hidden * d..(hidden + 1) * d];
            let rho = psi_scaled
                .as_ref()
                .map_or(0.0, |p| row.iter().zip(p).map(|(w, p)| w * p).sum());
            let row_offset = w0 + hidden * d;
            for (k, &x_k) in x.iter().enumerate() {
                let mut g = weight * v * da * x_k;
                if let Some(p) = &psi_scaled {
                    g += v * da * p[k] - 2.0 * v * a_h * da * x_k * rho;
                }
                grad.add(row_offset + k, g);
            }
            grad.add(b0 + hidden, -weight * v * da + 2.0 * a_h * da * v * rho);
            grad.add(w1 + hidden, weight * a_h + da * rho);
        }
        grad.add(layout.b1(head), -weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nep::config::quick_test_config;
    use crate::nep::parameters::ParameterLayout;
    use crate::tolerances::{fd_agrees, FD_STEP};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    struct Fixture {
        block: ParameterBlock,
        params: NetworkParameters,
        scale: Vec<f64>,
        q: Vec<f64>,
    }

    fn fixture() -> Fixture {
        let block = ParameterBlock::new(&quick_test_config(&[6, 8]), None).unwrap();
        let params = NetworkParameters::random(ParameterLayout::new(&block), 17);
        let mut rng = StdRng::seed_from_u64(3);
        let scale = (0..block.dim).map(|_| rng.random_range(0.2..1.5)).collect();
        let q = (0..block.dim).map(|_| rng.random_range(-1.0..1.0)).collect();
        Fixture {
            block,
            params,
            scale,
            q,
        }
    }

    fn run(fx: &Fixture, q: &[f64], params: &NetworkParameters) -> NetworkBuffers {
        let descriptors = DescriptorBuffers {
            dim: fx.block.dim,
            num_orders: 0,
            num_moments: 0,
            q: q.to_vec(),
            moments: Vec::new(),
        };
        let mut out = NetworkBuffers::default();
        NetworkEvaluator::new(&fx.block, &fx.scale).evaluate(
            &[1],
            &descriptors,
            params,
            EvaluationMode::Training,
            &mut out,
        );
        out
    }

    #[test]
    fn first_and_second_derivatives_match_finite_differences() {
        let fx = fixture();
        let base = run(&fx, &fx.q, &fx.params);
        for d in 0..fx.block.dim {
            let mut plus = fx.q.clone();
            let mut minus = fx.q.clone();
            plus[d] += FD_STEP;
            minus[d] -= FD_STEP;
            let (p, m) = (run(&fx, &plus, &fx.params), run(&fx, &minus, &fx.params));
            let numeric = (p.heads[0].output[0] - m.heads[0].output[0]) / (2.0 * FD_STEP);
            assert!(fd_agrees(base.fp(0, 0)[d], numeric), "fp d={d}");
            for e in 0..fx.block.dim {
                let numeric = (p.fp(0, 0)[e] - m.fp(0, 0)[e]) / (2.0 * FD_STEP);
                let analytic = base.hessian(0)[d * fx.block.dim + e];
                assert!(fd_agrees(analytic, numeric), "hessian ({d},{e})");
            }
        }
    }

    #[test]
    fn parameter_gradient_matches_finite_differences() {
        let fx = fixture();
        let layout = fx.params.layout().clone();
        let mut rng = StdRng::seed_from_u64(8);
        let psi: Vec<f64> = (0..fx.block.dim).map(|_| rng.random_range(-1.0..1.0)).collect();
        let weight = 0.7;
        // Objective: weight·U + ψ·∂U/∂q for the atom of type 1.
        let objective = |params: &NetworkParameters| {
            let out = run(&fx, &fx.q, params);
            weight * out.heads[0].output[0]
                + out.fp(0, 0).iter().zip(&psi).map(|(a, b)| a * b).sum::<f64>()
        };

        let base = run(&fx, &fx.q, &fx.params);
        let grad = AtomicBuffer::zeros(layout.total);
        NetworkEvaluator::new(&fx.block, &fx.scale).accumulate_parameter_gradient(
            &layout,
            0,
            1,
            &fx.params.network(0, 1),
            &fx.q,
            base.activations(0, 0),
            weight,
            Some(&psi),
            &grad,
        );

        let network_end = layout.c_radial.start;
        for p in 0..network_end {
            let mut plus = fx.params.clone();
            let mut minus = fx.params.clone();
            plus.values_mut()[p] += FD_STEP;
            minus.values_mut()[p] -= FD_STEP;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * FD_STEP);
            assert!(fd_agrees(grad.load(p), numeric), "parameter {p}");
        }
    }

    #[test]
    fn inference_skips_hessian() {
        let fx = fixture();
        let descriptors = DescriptorBuffers {
            dim: fx.block.dim,
            num_orders: 0,
            num_moments: 0,
            q: fx.q.clone(),
            moments: Vec::new(),
        };
        let mut out = NetworkBuffers::default();
        NetworkEvaluator::new(&fx.block, &fx.scale).evaluate(
            &[0],
            &descriptors,
            &fx.params,
            EvaluationMode::Inference,
            &mut out,
        );
        assert!(out.hessian.is_empty());
        assert_eq!(out.heads[0].fp.len(), fx.block.dim);
    }

    #[test]
    fn zero_descriptor_gives_bias_only_output() {
        let fx = fixture();
        let zeros = vec![0.0; fx.block.dim];
        let out = run(&fx, &zeros, &fx.params);
        let net = fx.params.network(0, 1);
        let expected: f64 = net
            .w1
            .iter()
            .zip(net.b0)
            .map(|(v, b)| v * (-b).tanh())
            .sum::<f64>()
            - net.b1;
        assert!((out.heads[0].output[0] - expected).abs() < 1e-12);
    }
}
