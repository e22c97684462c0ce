// SPDX-License-Identifier: AGPL-3.0-only

//! Smooth cutoff envelope and Chebyshev radial basis.
//!
//! `fc(r) = ½cos(πr/rc) + ½` vanishes with zero slope at `rc`.
//! With `x = 2(r/rc − 1)² − 1`, the basis is `f_k(r) = ½(T_k(x) + 1)·fc(r)`,
//! so `f_0` is the bare envelope. Radial functions of order `n` are
//! `g_n(r) = Σ_k c[n,k,t_i,t_j]·f_k(r)`; the coefficients are trainable.
//!
//! Every kernel that needs basis values (descriptor, force, gradient)
//! evaluates them through `PairBasis` so the three passes see identical
//! numbers.

use std::f64::consts::PI;

/// Largest basis size (`k` runs over `0..=MAX_BASIS_SIZE`).
pub const MAX_BASIS_SIZE: usize = 19;

/// Fixed-capacity scratch width for basis and order arrays.
pub const BASIS_CAPACITY: usize = MAX_BASIS_SIZE + 1;

/// Cutoff envelope and its radial derivative; both zero at and beyond `rc`.
#[must_use]
pub fn cutoff(rc: f64, r: f64) -> (f64, f64) {
    if r >= rc {
        return (0.0, 0.0);
    }
    let arg = PI * r / rc;
    (0.5f64.mul_add(arg.cos(), 0.5), -0.5 * PI / rc * arg.sin())
}

/// Basis values `f_k` and derivatives `f'_k` at one distance.
#[derive(Clone, Copy, Debug)]
pub struct PairBasis {
    pub size: usize,
    pub f: [f64; BASIS_CAPACITY],
    pub fp: [f64; BASIS_CAPACITY],
}

impl PairBasis {
    /// Evaluate `f_k(r)` and `f'_k(r)` for `k` in `0..=basis_size`.
    #[must_use]
    pub fn new(rc: f64, r: f64, basis_size: usize) -> Self {
        let mut basis = Self {
            size: basis_size,
            f: [0.0; BASIS_CAPACITY],
            fp: [0.0; BASIS_CAPACITY],
        };
        let (fc, fcp) = cutoff(rc, r);
        let t = r / rc - 1.0;
        let x = 2.0 * t * t - 1.0;
        let dx = 4.0 * t / rc;

        let mut t_prev = 1.0;
        let mut dt_prev = 0.0;
        let mut t_cur = x;
        let mut dt_cur = 1.0;
        for k in 0..=basis_size {
            let (tk, dtk) = match k {
                0 => (1.0, 0.0),
                1 => (x, 1.0),
                _ => {
                    let t_next = 2.0 * x * t_cur - t_prev;
                    let dt_next = 2.0 * t_cur + 2.0 * x * dt_cur - dt_prev;
                    t_prev = t_cur;
                    dt_prev = dt_cur;
                    t_cur = t_next;
                    dt_cur = dt_next;
                    (t_next, dt_next)
                }
            };
            basis.f[k] = 0.5 * (tk + 1.0) * fc;
            basis.fp[k] = 0.5 * dtk * dx * fc + 0.5 * (tk + 1.0) * fcp;
        }
        basis
    }

    /// Radial functions `g_n` and `g'_n` for `n` in `0..=n_max`, with the
    /// coefficient for `(n, k)` supplied by `coefficient`.
    pub fn radial_functions(
        &self,
        n_max: usize,
        coefficient: impl Fn(usize, usize) -> f64,
        g: &mut [f64; BASIS_CAPACITY],
        gp: &mut [f64; BASIS_CAPACITY],
    ) {
        for n in 0..=n_max {
            let mut value = 0.0;
            let mut slope = 0.0;
            for k in 0..=self.size {
                let c = coefficient(n, k);
                value += c * self.f[k];
                slope += c * self.fp[k];
            }
            g[n] = value;
            gp[n] = slope;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tolerances::{fd_agrees, EXACT_F64, FD_STEP};

    #[test]
    fn envelope_vanishes_with_slope_at_cutoff() {
        let rc = 4.0;
        let (f, fp) = cutoff(rc, rc - 1e-9);
        assert!(f < 1e-12);
        assert!(fp.abs() < 1e-8);
        assert_eq!(cutoff(rc, rc + 0.1), (0.0, 0.0));
        let (f0, fp0) = cutoff(rc, 0.0);
        assert!((f0 - 1.0).abs() < EXACT_F64);
        assert!(fp0.abs() < EXACT_F64);
    }

    #[test]
    fn order_zero_is_the_bare_envelope() {
        let basis = PairBasis::new(5.0, 2.3, 6);
        let (fc, fcp) = cutoff(5.0, 2.3);
        assert!((basis.f[0] - fc).abs() < EXACT_F64);
        assert!((basis.fp[0] - fcp).abs() < EXACT_F64);
    }

    #[test]
    fn chebyshev_values_match_closed_form() {
        let rc = 5.0;
        let r = 1.7;
        let basis = PairBasis::new(rc, r, 4);
        let t = r / rc - 1.0;
        let x = 2.0 * t * t - 1.0;
        let (fc, _) = cutoff(rc, r);
        let t3 = 4.0 * x * x * x - 3.0 * x;
        assert!((basis.f[3] - 0.5 * (t3 + 1.0) * fc).abs() < EXACT_F64);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let rc = 5.0;
        for &r in &[0.8, 2.0, 3.9, 4.95] {
            let plus = PairBasis::new(rc, r + FD_STEP, 8);
            let minus = PairBasis::new(rc, r - FD_STEP, 8);
            let here = PairBasis::new(rc, r, 8);
            for k in 0..=8 {
                let numeric = (plus.f[k] - minus.f[k]) / (2.0 * FD_STEP);
                assert!(fd_agrees(here.fp[k], numeric), "k={k} r={r}");
            }
        }
    }

    #[test]
    fn radial_functions_are_linear_in_coefficients() {
        let basis = PairBasis::new(5.0, 2.0, 3);
        let mut g = [0.0; BASIS_CAPACITY];
        let mut gp = [0.0; BASIS_CAPACITY];
        basis.radial_functions(1, |n, k| if n == 1 && k == 2 { 2.0 } else { 0.0 }, &mut g, &mut gp);
        assert!(g[0].abs() < EXACT_F64);
        assert!((g[1] - 2.0 * basis.f[2]).abs() < EXACT_F64);
        assert!((gp[1] - 2.0 * basis.fp[2]).abs() < EXACT_F64);
    }
}
