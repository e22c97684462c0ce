// SPDX-License-Identifier: AGPL-3.0-only

//! Cartesian moments and the rotation invariants built from them.
//!
//! For each radial order `n` an atom accumulates moments
//! `s[α] = Σ_j g_n(r_ij)·û_ij^α` over every multi-index `α = (a, b, c)` with
//! `|α| ≤ L`. The multinomial theorem turns these into Legendre invariants
//!
//! ```text
//! q_l = Σ_{|α| ≤ l} a_{l,|α|} · |α|!/(a! b! c!) · s[α]²
//!     = Σ_{j,k} g_n(r_ij) g_n(r_ik) P_l(cos θ_jik)
//! ```
//!
//! where `a_{l,m}` are the monomial coefficients of `P_l`. Two optional
//! many-body composites use the low-degree moments directly:
//!
//! | Invariant | Moments | Formula |
//! |-----------|---------|---------|
//! | four-body | degree 2 (tensor `M`) | `tr(T³)`, `T = M − tr(M)/3·I` |
//! | five-body | degree 1 (vector `v`) | `(v·v)²` |
//!
//! Every invariant exposes its value, directional derivative (JVP),
//! weighted gradient (VJP) and weighted Hessian-vector product (HVP); the
//! force and gradient kernels are written entirely in these terms.

/// Highest supported Legendre degree.
pub const MAX_DEGREE: usize = 8;

/// Number of multi-indices with `|α| ≤ MAX_DEGREE`.
pub const MAX_MOMENTS: usize = (MAX_DEGREE + 1) * (MAX_DEGREE + 2) * (MAX_DEGREE + 3) / 6;

/// Fixed-capacity scratch for one moment row.
pub type MomentRow = [f64; MAX_MOMENTS];

type Matrix3 = [[f64; 3]; 3];

/// Multi-indices up to a maximum degree, ordered by degree.
#[derive(Clone, Debug)]
pub struct MomentBasis {
    exponents: Vec<[usize; 3]>,
    multinomial: Vec<f64>,
    max_degree: usize,
    /// Slots of the degree-1 moments (x, y, z).
    degree1: [usize; 3],
    /// Slots of the degree-2 moments (xx, yy, zz, xy, yz, zx).
    degree2: [usize; 6],
}

impl MomentBasis {
    #[must_use]
    pub fn new(max_degree: usize) -> Self {
        let max_degree = max_degree.clamp(2, MAX_DEGREE);
        let mut exponents = Vec::new();
        for degree in 0..=max_degree {
            for a in (0..=degree).rev() {
                for b in (0..=degree - a).rev() {
                    exponents.push([a, b, degree - a - b]);
                }
            }
        }
        let factorial = |k: usize| (1..=k).map(|v| v as f64).product::<f64>();
        let multinomial = exponents
            .iter()
            .map(|&[a, b, c]| factorial(a + b + c) / (factorial(a) * factorial(b) * factorial(c)))
            .collect();
        let find = |e: [usize; 3]| exponents.iter().position(|&x| x == e).unwrap_or(0);
        let degree1 = [find([1, 0, 0]), find([0, 1, 0]), find([0, 0, 1])];
        let degree2 = [
            find([2, 0, 0]),
            find([0, 2, 0]),
            find([0, 0, 2]),
            find([1, 1, 0]),
            find([0, 1, 1]),
            find([1, 0, 1]),
        ];
        Self {
            exponents,
            multinomial,
            max_degree,
            degree1,
            degree2,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.exponents.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exponents.is_empty()
    }

    #[must_use]
    pub fn degree(&self, slot: usize) -> usize {
        let [a, b, c] = self.exponents[slot];
        a + b + c
    }

    #[must_use]
    pub fn exponents(&self, slot: usize) -> [usize; 3] {
        self.exponents[slot]
    }

    /// Monomials `u^α` and their gradients `∇_u u^α` at a unit vector.
    pub fn monomials(
        &self,
        u: [f64; 3],
        values: &mut MomentRow,
        gradients: &mut [[f64; 3]; MAX_MOMENTS],
    ) {
        let mut powers = [[1.0; MAX_DEGREE + 1]; 3];
        for axis in 0..3 {
            for p in 1..=self.max_degree {
                powers[axis][p] = powers[axis][p - 1] * u[axis];
            }
        }
        for (slot, &[a, b, c]) in self.exponents.iter().enumerate() {
            let (pa, pb, pc) = (powers[0][a], powers[1][b], powers[2][c]);
            values[slot] = pa * pb * pc;
            gradients[slot] = [
                if a > 0 { a as f64 * powers[0][a - 1] * pb * pc } else { 0.0 },
                if b > 0 { b as f64 * pa * powers[1][b - 1] * pc } else { 0.0 },
                if c > 0 { c as f64 * pa * pb * powers[2][c - 1] } else { 0.0 },
            ];
        }
    }

    fn tensor(&self, s: &[f64]) -> Matrix3 {
        let [xx, yy, zz, xy, yz, zx] = self.degree2.map(|i| s[i]);
        [[xx, xy, zx], [xy, yy, yz], [zx, yz, zz]]
    }

    /// Adds `scale·∂/∂s` of `tr(G·M(s))` for a symmetric `G`.
    fn scatter_tensor(&self, g: &Matrix3, scale: f64, out: &mut [f64]) {
        let [xx, yy, zz, xy, yz, zx] = self.degree2;
        out[xx] += scale * g[0][0];
        out[yy] += scale * g[1][1];
        out[zz] += scale * g[2][2];
        out[xy] += scale * 2.0 * g[0][1];
        out[yz] += scale * 2.0 * g[1][2];
        out[zx] += scale * 2.0 * g[2][0];
    }

    fn vector(&self, s: &[f64]) -> [f64; 3] {
        self.degree1.map(|i| s[i])
    }
}

/// Monomial coefficients `a[l][m]` of the Legendre polynomials `P_l`.
#[must_use]
pub fn legendre_coefficients(max_degree: usize) -> Vec<Vec<f64>> {
    let mut table = vec![vec![0.0; max_degree + 1]; max_degree + 1];
    table[0][0] = 1.0;
    if max_degree >= 1 {
        table[1][1] = 1.0;
    }
    for l in 1..max_degree {
        let lf = l as f64;
        for m in 0..=max_degree {
            let shifted = if m > 0 { table[l][m - 1] } else { 0.0 };
            table[l + 1][m] = ((2.0 * lf + 1.0) * shifted - lf * table[l - 1][m]) / (lf + 1.0);
        }
    }
    table
}

/// One rotation invariant of a moment row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invariant {
    Legendre(usize),
    FourBody,
    FiveBody,
}

/// The ordered list of invariants in the angular block.
#[derive(Clone, Debug)]
pub struct AngularInvariants {
    basis: MomentBasis,
    kinds: Vec<Invariant>,
    /// For `Legendre(l)`: `a_{l,|α|}·multinomial(α)` per moment slot.
    legendre_weights: Vec<Vec<f64>>,
}

impl AngularInvariants {
    #[must_use]
    pub fn new(l_max: usize, four_body: bool, five_body: bool) -> Self {
        let basis = MomentBasis::new(l_max);
        let legendre = legendre_coefficients(basis.max_degree);
        let mut kinds: Vec<Invariant> = (1..=l_max).map(Invariant::Legendre).collect();
        if four_body {
            kinds.push(Invariant::FourBody);
        }
        if five_body {
            kinds.push(Invariant::FiveBody);
        }
        let legendre_weights = (1..=l_max)
            .map(|l| {
                (0..basis.len())
                    .map(|slot| {
                        let m = basis.degree(slot);
                        if m <= l {
                            legendre[l][m] * basis.multinomial[slot]
                        } else {
                            0.0
                        }
                    })
                    .collect()
            })
            .collect();
        Self {
            basis,
            kinds,
            legendre_weights,
        }
    }

    #[must_use]
    pub fn basis(&self) -> &MomentBasis {
        &self.basis
    }

    #[must_use]
    pub fn num_moments(&self) -> usize {
        self.basis.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    #[must_use]
    pub fn kinds(&self) -> &[Invariant] {
        &self.kinds
    }

    /// Invariant values of one moment row.
    pub fn evaluate(&self, s: &[f64], q: &mut [f64]) {
        for (e, kind) in self.kinds.iter().enumerate() {
            q[e] = match *kind {
                Invariant::Legendre(l) => self.legendre_weights[l - 1]
                    .iter()
                    .zip(s)
                    .map(|(w, v)| w * v * v)
                    .sum(),
                Invariant::FourBody => {
                    let t = traceless(&self.basis.tensor(s));
                    trace(&mul(&mul(&t, &t), &t))
                }
                Invariant::FiveBody => {
                    let v = self.basis.vector(s);
                    let vv = dot(v, v);
                    vv * vv
                }
            };
        }
    }

    /// Directional derivative of every invariant along `w`.
    pub fn jvp(&self, s: &[f64], w: &[f64], dq: &mut [f64]) {
        for (e, kind) in self.kinds.iter().enumerate() {
            dq[e] = match *kind {
                Invariant::Legendre(l) => self.legendre_weights[l - 1]
                    .iter()
                    .zip(s.iter().zip(w))
                    .map(|(c, (v, dv))| 2.0 * c * v * dv)
                    .sum(),
                Invariant::FourBody => {
                    let g = four_body_gradient(&self.basis.tensor(s));
                    let dm = self.basis.tensor(w);
                    trace(&mul(&g, &dm))
                }
                Invariant::FiveBody => {
                    let v = self.basis.vector(s);
                    let dv = self.basis.vector(w);
                    4.0 * dot(v, v) * dot(v, dv)
                }
            };
        }
    }

    /// `out = Σ_e weights[e]·∂q_e/∂s` (overwrites `out`).
    pub fn vjp(&self, s: &[f64], weights: &[f64], out: &mut [f64]) {
        let len = self.num_moments();
        out[..len].fill(0.0);
        for (e, kind) in self.kinds.iter().enumerate() {
            let lambda = weights[e];
            if lambda == 0.0 {
                continue;
            }
            match *kind {
                Invariant::Legendre(l) => {
                    for (slot, c) in self.legendre_weights[l - 1].iter().enumerate() {
                        out[slot] += lambda * 2.0 * c * s[slot];
                    }
                }
                Invariant::FourBody => {
                    let g = four_body_gradient(&self.basis.tensor(s));
                    self.basis.scatter_tensor(&g, lambda, out);
                }
                Invariant::FiveBody => {
                    let v = self.basis.vector(s);
                    let scale = lambda * 4.0 * dot(v, v);
                    for (axis, &slot) in self.basis.degree1.iter().enumerate() {
                        out[slot] += scale * v[axis];
                    }
                }
            }
        }
    }

    /// `out = Σ_e weights[e]·(∇²q_e)·z` (overwrites `out`).
    pub fn hvp(&self, s: &[f64], weights: &[f64], z: &[f64], out: &mut [f64]) {
        let len = self.num_moments();
        out[..len].fill(0.0);
        for (e, kind) in self.kinds.iter().enumerate() {
            let lambda = weights[e];
            if lambda == 0.0 {
                continue;
            }
            match *kind {
                Invariant::Legendre(l) => {
                    for (slot, c) in self.legendre_weights[l - 1].iter().enumerate() {
                        out[slot] += lambda * 2.0 * c * z[slot];
                    }
                }
                Invariant::FourBody => {
                    let t = traceless(&self.basis.tensor(s));
                    let tz = traceless(&self.basis.tensor(z));
                    let t_tz = mul(&t, &tz);
                    let tz_t = mul(&tz, &t);
                    let tr = trace(&t_tz);
                    let mut dg = [[0.0; 3]; 3];
                    for a in 0..3 {
                        for b in 0..3 {
                            dg[a][b] = 3.0 * (t_tz[a][b] + tz_t[a][b]);
                        }
                        dg[a][a] -= 2.0 * tr;
                    }
                    self.basis.scatter_tensor(&dg, lambda, out);
                }
                Invariant::FiveBody => {
                    let v = self.basis.vector(s);
                    let dz = self.basis.vector(z);
                    let vv = dot(v, v);
                    let vz = dot(v, dz);
                    for (axis, &slot) in self.basis.degree1.iter().enumerate() {
                        out[slot] += lambda * 4.0 * (2.0 * vz * v[axis] + vv * dz[axis]);
                    }
                }
            }
        }
    }
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn mul(a: &Matrix3, b: &Matrix3) -> Matrix3 {
    let mut c = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            c[i][j] = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    c
}

fn trace(a: &Matrix3) -> f64 {
    a[0][0] + a[1][1] + a[2][2]
}

fn traceless(m: &Matrix3) -> Matrix3 {
    let third = trace(m) / 3.0;
    let mut t = *m;
    for (a, row) in t.iter_mut().enumerate() {
        row[a] -= third;
    }
    t
}

/// `∂ tr(T³)/∂M = 3T² − tr(T²)·I`.
fn four_body_gradient(m: &Matrix3) -> Matrix3 {
    let t = traceless(m);
    let t2 = mul(&t, &t);
    let tr2 = trace(&t2);
    let mut g = t2.map(|row| row.map(|v| 3.0 * v));
    for (a, row) in g.iter_mut().enumerate() {
        row[a] -= tr2;
    }
    g
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tolerances::{fd_agrees, EXACT_F64, FD_STEP};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn unit(v: [f64; 3]) -> [f64; 3] {
        let r = dot(v, v).sqrt();
        v.map(|x| x / r)
    }

    fn moments(inv: &AngularInvariants, neighbors: &[([f64; 3], f64)]) -> Vec<f64> {
        let mut s = vec![0.0; inv.num_moments()];
        let mut vals = [0.0; MAX_MOMENTS];
        let mut grads = [[0.0; 3]; MAX_MOMENTS];
        for &(u, g) in neighbors {
            inv.basis().monomials(unit(u), &mut vals, &mut grads);
            for (slot, v) in s.iter_mut().enumerate() {
                *v += g * vals[slot];
            }
        }
        s
    }

    #[test]
    fn moment_counts() {
        assert_eq!(MomentBasis::new(4).len(), 35);
        assert_eq!(MomentBasis::new(MAX_DEGREE).len(), MAX_MOMENTS);
        assert_eq!(MomentBasis::new(1).len(), 10, "degree-2 moments are always kept");
    }

    #[test]
    fn legendre_table_matches_closed_forms() {
        let a = legendre_coefficients(4);
        assert_eq!(a[2], vec![-0.5, 0.0, 1.5, 0.0, 0.0]);
        assert!((a[3][3] - 2.5).abs() < EXACT_F64);
        assert!((a[3][1] + 1.5).abs() < EXACT_F64);
        assert!((a[4][4] - 35.0 / 8.0).abs() < EXACT_F64);
        assert!((a[4][0] - 3.0 / 8.0).abs() < EXACT_F64);
    }

    #[test]
    fn legendre_invariant_equals_pair_sum() {
        let inv = AngularInvariants::new(4, false, false);
        let neighbors = [
            ([1.0, 0.2, -0.3], 0.7),
            ([-0.4, 1.0, 0.5], 1.3),
            ([0.1, -0.6, 1.0], -0.4),
        ];
        let s = moments(&inv, &neighbors);
        let mut q = vec![0.0; inv.len()];
        inv.evaluate(&s, &mut q);
        let p = legendre_coefficients(4);
        for l in 1..=4 {
            let mut expected = 0.0;
            for &(uj, gj) in &neighbors {
                for &(uk, gk) in &neighbors {
                    let c = dot(unit(uj), unit(uk));
                    let pl: f64 = (0..=l).map(|m| p[l][m] * c.powi(m as i32)).sum();
                    expected += gj * gk * pl;
                }
            }
            assert!((q[l - 1] - expected).abs() < 1e-9, "l={l}");
        }
    }

    #[test]
    fn invariants_are_rotation_invariant() {
        let inv = AngularInvariants::new(4, true, true);
        let neighbors = [
            ([1.0, 0.2, -0.3], 0.7),
            ([-0.4, 1.0, 0.5], 1.3),
            ([0.1, -0.6, 1.0], 0.9),
            ([0.3, 0.3, 0.3], 0.2),
        ];
        let (c, s) = (0.6f64.cos(), 0.6f64.sin());
        let rotate = |v: [f64; 3]| [c * v[0] - s * v[1], s * v[0] + c * v[1], v[2]];
        let rotated: Vec<_> = neighbors.iter().map(|&(u, g)| (rotate(u), g)).collect();
        let mut q = vec![0.0; inv.len()];
        let mut qr = vec![0.0; inv.len()];
        inv.evaluate(&moments(&inv, &neighbors), &mut q);
        inv.evaluate(&moments(&inv, &rotated), &mut qr);
        for (a, b) in q.iter().zip(&qr) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn jvp_vjp_hvp_match_finite_differences() {
        let inv = AngularInvariants::new(4, true, true);
        let mut rng = StdRng::seed_from_u64(7);
        let n = inv.num_moments();
        let s: Vec<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
        let w: Vec<f64> = (0..n).map(|_| rng.random_range(-1.0..1.0)).collect();
        let weights: Vec<f64> = (0..inv.len()).map(|_| rng.random_range(-1.0..1.0)).collect();

        let shifted = |sign: f64, dir: &[f64]| -> Vec<f64> {
            s.iter().zip(dir).map(|(a, b)| a + sign * FD_STEP * b).collect()
        };
        let mut q_plus = vec![0.0; inv.len()];
        let mut q_minus = vec![0.0; inv.len()];
        inv.evaluate(&shifted(1.0, &w), &mut q_plus);
        inv.evaluate(&shifted(-1.0, &w), &mut q_minus);
        let mut dq = vec![0.0; inv.len()];
        inv.jvp(&s, &w, &mut dq);
        for e in 0..inv.len() {
            let numeric = (q_plus[e] - q_minus[e]) / (2.0 * FD_STEP);
            assert!(fd_agrees(dq[e], numeric), "jvp e={e}");
        }

        let mut grad = vec![0.0; n];
        inv.vjp(&s, &weights, &mut grad);
        let along: f64 = grad.iter().zip(&w).map(|(a, b)| a * b).sum();
        let numeric: f64 = (0..inv.len())
            .map(|e| weights[e] * (q_plus[e] - q_minus[e]) / (2.0 * FD_STEP))
            .sum();
        assert!(fd_agrees(along, numeric), "vjp");

        let mut hz = vec![0.0; n];
        inv.hvp(&s, &weights, &w, &mut hz);
        let mut g_plus = vec![0.0; n];
        let mut g_minus = vec![0.0; n];
        inv.vjp(&shifted(1.0, &w), &weights, &mut g_plus);
        inv.vjp(&shifted(-1.0, &w), &weights, &mut g_minus);
        for slot in 0..n {
            let numeric = (g_plus[slot] - g_minus[slot]) / (2.0 * FD_STEP);
            assert!(fd_agrees(hz[slot], numeric), "hvp slot={slot}");
        }
    }

    #[test]
    fn degree_zero_moment_is_isotropic_sum() {
        let inv = AngularInvariants::new(2, false, false);
        let neighbors = [([1.0, 0.0, 0.0], 0.5), ([0.0, 0.0, -1.0], 0.25)];
        let s = moments(&inv, &neighbors);
        assert!((s[0] - 0.75).abs() < EXACT_F64);
    }
}
