// SPDX-License-Identifier: AGPL-3.0-only

//! Short-range ZBL repulsion, smoothly switched off between two radii.
//!
//! ```text
//! V(r) = K·Z_i·Z_j/r · Σ_m c_m·exp(−e_m·r/a),   a = 0.46848/(Z_i^0.23 + Z_j^0.23)
//! S(r) = 1 (r < r_in),  ½cos(π(r − r_in)/(r_out − r_in)) + ½,  0 (r > r_out)
//! ```
//!
//! Each ordered pair of the radial list assigns `½·V·S` to its owner, so
//! every unordered pair is counted once. Forces and virials use the same
//! accumulation as the learned part. Per-type-pair tables may override the
//! screening coefficients, exponents and radii.

use crate::error::NepError;
use crate::nep::config::ParameterBlock;
use crate::nep::force::{accumulate_pair, ForceBuffers};
use crate::nep::neighbor::NeighborSet;
use crate::nep::structure::PackedBatch;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Coulomb constant e²/(4πε₀) in eV·Å.
pub const COULOMB_EV_ANGSTROM: f64 = 14.399_645;

/// Universal screening function coefficients.
pub const UNIVERSAL_COEFFICIENTS: [f64; 4] = [0.181_75, 0.509_86, 0.280_22, 0.028_17];

/// Universal screening function exponents.
pub const UNIVERSAL_EXPONENTS: [f64; 4] = [3.1998, 0.942_29, 0.4029, 0.201_62];

/// Override for one unordered type pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZblPairTable {
    pub types: [usize; 2],
    pub inner: f64,
    pub outer: f64,
    pub coefficients: [f64; 4],
    pub exponents: [f64; 4],
}

/// Serializable ZBL settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZblConfig {
    pub inner: f64,
    pub outer: f64,
    /// Flexible per-pair tables; pairs not listed use the universal form.
    #[serde(default)]
    pub pairs: Vec<ZblPairTable>,
}

/// Resolved parameters for one type pair.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ZblPair {
    /// `K·Z_i·Z_j`.
    pub charge: f64,
    /// `1/a`.
    pub inv_screening: f64,
    pub inner: f64,
    pub outer: f64,
    pub coefficients: [f64; 4],
    pub exponents: [f64; 4],
}

impl ZblPair {
    /// Switched pair energy and its radial derivative.
    #[must_use]
    pub fn energy(&self, r: f64) -> (f64, f64) {
        if r >= self.outer {
            return (0.0, 0.0);
        }
        let x = r * self.inv_screening;
        let mut phi = 0.0;
        let mut dphi = 0.0;
        for (c, e) in self.coefficients.iter().zip(&self.exponents) {
            let term = c * (-e * x).exp();
            phi += term;
            dphi -= e * self.inv_screening * term;
        }
        let v = self.charge * phi / r;
        let dv = self.charge * (dphi / r - phi / (r * r));
        let (s, ds) = if r <= self.inner {
            (1.0, 0.0)
        } else {
            let width = self.outer - self.inner;
            let arg = PI * (r - self.inner) / width;
            (0.5f64.mul_add(arg.cos(), 0.5), -0.5 * PI / width * arg.sin())
        };
        (v * s, dv * s + v * ds)
    }
}

/// Per-type-pair ZBL parameters, `T × T`, symmetric.
#[derive(Clone, Debug)]
pub struct ZblTable {
    num_types: usize,
    pairs: Vec<ZblPair>,
}

impl ZblTable {
    /// Resolve `config` against the block's types and typewise rule.
    pub fn resolve(config: &ZblConfig, block: &ParameterBlock) -> Result<Self, NepError> {
        if !(config.inner >= 0.0 && config.inner < config.outer) {
            return Err(NepError::Config(format!(
                "ZBL radii must satisfy 0 <= inner < outer, got {} and {}",
                config.inner, config.outer
            )));
        }
        let t = block.num_types;
        let mut pairs = Vec::with_capacity(t * t);
        for t1 in 0..t {
            for t2 in 0..t {
                let z1 = f64::from(block.atomic_numbers[t1]);
                let z2 = f64::from(block.atomic_numbers[t2]);
                let table = config
                    .pairs
                    .iter()
                    .find(|p| p.types == [t1, t2] || p.types == [t2, t1]);
                let (mut inner, mut outer, coefficients, exponents) = match table {
                    Some(p) => (p.inner, p.outer, p.coefficients, p.exponents),
                    None => (
                        config.inner,
                        config.outer,
                        UNIVERSAL_COEFFICIENTS,
                        UNIVERSAL_EXPONENTS,
                    ),
                };
                if let (Some(tw), None) = (&block.typewise, table) {
                    let sum = tw.covalent_radii[t1] + tw.covalent_radii[t2];
                    outer = outer.min(tw.factors.zbl_factor * sum);
                    inner = 0.5 * outer;
                }
                if !(inner >= 0.0 && inner < outer) {
                    return Err(NepError::Config(format!(
                        "ZBL radii for types ({t1}, {t2}) must satisfy 0 <= inner < outer"
                    )));
                }
                if outer > block.rc_radial_pair(t1, t2) {
                    return Err(NepError::Config(format!(
                        "ZBL outer radius {outer} exceeds the radial cutoff for types ({t1}, {t2})"
                    )));
                }
                pairs.push(ZblPair {
                    charge: COULOMB_EV_ANGSTROM * (z1 * z2),
                    inv_screening: (z1.powf(0.23) + z2.powf(0.23)) / 0.468_48,
                    inner,
                    outer,
                    coefficients,
                    exponents,
                });
            }
        }
        Ok(Self {
            num_types: t,
            pairs,
        })
    }

    #[must_use]
    pub fn pair(&self, t1: usize, t2: usize) -> &ZblPair {
        &self.pairs[t1 * self.num_types + t2]
    }
}

/// Adds the ZBL term to energies, forces and virials already assembled.
pub struct ZblCorrection<'a> {
    block: &'a ParameterBlock,
    table: &'a ZblTable,
}

impl<'a> ZblCorrection<'a> {
    #[must_use]
    pub const fn new(block: &'a ParameterBlock, table: &'a ZblTable) -> Self {
        Self { block, table }
    }

    pub fn apply(&self, batch: &PackedBatch, radial: &NeighborSet, out: &mut ForceBuffers) {
        let mode = self.block.mode;
        let forces = &out.forces;
        let virial = &out.virial;
        out.energy.par_iter_mut().enumerate().for_each(|(i, energy)| {
            let ti = batch.types[i];
            let (idx, disp) = radial.row(i);
            for (&j, &d) in idx.iter().zip(disp) {
                let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                let (e, de) = self.table.pair(ti, batch.types[j]).energy(r);
                if e == 0.0 && de == 0.0 {
                    continue;
                }
                *energy += 0.5 * e;
                let scale = 0.5 * de / r;
                let f = [scale * d[0], scale * d[1], scale * d[2]];
                accumulate_pair(forces, virial, mode, i, j, d, f);
            }
        });
    }
}
