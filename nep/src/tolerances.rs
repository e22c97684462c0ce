// SPDX-License-Identifier: AGPL-3.0-only

//! Centralized numerical thresholds with justification.
//!
//! Every tolerance used by tests and by the `validate_nep` binary is defined
//! here next to the reasoning behind its size. No ad-hoc magic numbers.
//!
//! | Category | Basis | Example |
//! |----------|-------|---------|
//! | Machine precision | IEEE 754 f64 | 1e-10 for exact arithmetic |
//! | Finite difference | Truncation vs. cancellation | 1e-5 central difference |
//! | Accumulation order | Atomic f64 adds | 1e-9 for force sums |

// ═══════════════════════════════════════════════════════════════════
// Machine-precision tolerances (IEEE 754 f64)
// ═══════════════════════════════════════════════════════════════════

/// Tolerance for quantities that should agree to rounding.
///
/// f64 carries ~15.9 digits; 1e-10 leaves five digits for accumulated
/// rounding across a few hundred fused multiply-adds.
pub const EXACT_F64: f64 = 1e-10;

/// Net force on an unconstrained configuration.
///
/// Every ordered pair adds `f` to the owner and `-f` to the neighbor, so the
/// sum cancels exactly up to the order in which atomic adds land. With forces
/// of O(10) eV/Å and O(10³) adds per cell the residual stays below 1e-9.
pub const NEWTON_3RD_LAW_ABS: f64 = 1e-9;

/// Atomic accumulation order: two launches on identical inputs may differ in
/// the last bits because float addition is not associative.
pub const ATOMIC_REORDER_REL: f64 = 1e-12;

// ═══════════════════════════════════════════════════════════════════
// Finite-difference tolerances
// ═══════════════════════════════════════════════════════════════════

/// Central-difference step for parameter, position and strain perturbations.
///
/// Truncation error is O(h²·f''') ≈ 1e-12 while cancellation error is
/// O(ε_mach·|f|/h) ≈ 1e-10·|f|. 1e-6 balances both for O(1)–O(100) losses.
pub const FD_STEP: f64 = 1e-6;

/// Relative agreement between an analytic derivative and its central difference.
///
/// Measured agreement is ~1e-8 for well-scaled components; 1e-4 leaves four
/// orders of margin for components dominated by cancellation.
pub const FD_REL: f64 = 1e-4;

/// Absolute floor for derivatives whose true value is near zero.
///
/// Cancellation noise on a loss of O(10) with h = 1e-6 is ~1e-9; the floor
/// sits three orders above it.
pub const FD_ABS_FLOOR: f64 = 1e-6;

// ═══════════════════════════════════════════════════════════════════
// Model constants
// ═══════════════════════════════════════════════════════════════════

/// Initial descriptor scale before any batch statistics exist.
///
/// The scaler only ever lowers a value (elementwise minimum), so the
/// sentinel must exceed any realistic reciprocal descriptor range.
pub const SCALER_SENTINEL: f64 = 1e10;

/// Guard against dividing by a vanishing descriptor range.
pub const DIVISION_GUARD: f64 = 1e-12;

/// Combined finite-difference acceptance used by tests and the validation binary.
///
/// Passes when `|analytic - numeric| <= FD_REL * max(|analytic|, |numeric|) + FD_ABS_FLOOR`.
#[must_use]
pub fn fd_agrees(analytic: f64, numeric: f64) -> bool {
    let scale = analytic.abs().max(numeric.abs());
    (analytic - numeric).abs() <= FD_REL.mul_add(scale, FD_ABS_FLOOR)
}
