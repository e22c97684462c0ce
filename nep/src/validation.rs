// SPDX-License-Identifier: AGPL-3.0-only

//! Pass/fail harness for the NEP validation binary.
//!
//! Every check records what was observed, what was expected and which
//! tolerance rule decided the outcome. `finish` prints one line per check
//! and exits 0 only if every check passed, so the binary can gate CI.

use crate::tolerances::{fd_agrees, FD_ABS_FLOOR, FD_REL};
use std::fmt::Write as _;
use std::process;

/// One recorded comparison.
#[derive(Debug, Clone)]
pub struct Check {
    pub label: String,
    pub passed: bool,
    pub observed: f64,
    pub expected: f64,
    pub tolerance: f64,
    pub mode: ToleranceMode,
}

/// Which acceptance rule a check used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToleranceMode {
    /// `|observed − expected| < tol`
    Absolute,
    /// `|observed − expected| / |expected| < tol`
    Relative,
    /// Analytic derivative against a central difference (`fd_agrees`).
    FiniteDifference,
    /// `observed < tol`
    UpperBound,
}

impl std::fmt::Display for ToleranceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absolute => write!(f, "abs"),
            Self::Relative => write!(f, "rel"),
            Self::FiniteDifference => write!(f, "fd"),
            Self::UpperBound => write!(f, "<"),
        }
    }
}

/// Collects checks and reports them.
#[derive(Debug, Default)]
#[must_use]
pub struct ValidationHarness {
    pub name: String,
    pub checks: Vec<Check>,
}

impl ValidationHarness {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            checks: Vec::new(),
        }
    }

    fn push(
        &mut self,
        label: &str,
        passed: bool,
        observed: f64,
        expected: f64,
        tolerance: f64,
        mode: ToleranceMode,
    ) {
        self.checks.push(Check {
            label: label.to_string(),
            passed,
            observed,
            expected,
            tolerance,
            mode,
        });
    }

    pub fn check_abs(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let passed = (observed - expected).abs() < tolerance;
        self.push(label, passed, observed, expected, tolerance, ToleranceMode::Absolute);
    }

    /// Relative check; falls back to `|observed| < tol` when `expected` is zero.
    pub fn check_rel(&mut self, label: &str, observed: f64, expected: f64, tolerance: f64) {
        let passed = if expected.abs() > f64::EPSILON {
            ((observed - expected) / expected).abs() < tolerance
        } else {
            observed.abs() < tolerance
        };
        self.push(label, passed, observed, expected, tolerance, ToleranceMode::Relative);
    }

    pub fn check_upper(&mut self, label: &str, observed: f64, threshold: f64) {
        let passed = observed < threshold;
        self.push(label, passed, observed, threshold, threshold, ToleranceMode::UpperBound);
    }

    /// One analytic derivative against its central-difference estimate.
    pub fn check_fd(&mut self, label: &str, analytic: f64, numeric: f64) {
        let passed = fd_agrees(analytic, numeric);
        self.push(label, passed, analytic, numeric, FD_REL, ToleranceMode::FiniteDifference);
    }

    /// Whole derivative vectors; records the worst component.
    ///
    /// The check passes only if every component satisfies `fd_agrees`. The
    /// reported pair is the component with the largest excess over its
    /// allowance, so a failure shows exactly where the gradient is wrong.
    pub fn check_fd_vector(&mut self, label: &str, analytic: &[f64], numeric: &[f64]) {
        let mut worst = (f64::NEG_INFINITY, 0.0, 0.0);
        let mut passed = analytic.len() == numeric.len();
        for (&a, &n) in analytic.iter().zip(numeric) {
            passed &= fd_agrees(a, n);
            let allowance = FD_REL.mul_add(a.abs().max(n.abs()), FD_ABS_FLOOR);
            let excess = (a - n).abs() - allowance;
            if excess > worst.0 {
                worst = (excess, a, n);
            }
        }
        self.push(label, passed, worst.1, worst.2, FD_REL, ToleranceMode::FiniteDifference);
    }

    pub fn check_bool(&mut self, label: &str, passed: bool) {
        self.push(label, passed, f64::from(u8::from(passed)), 1.0, 0.0, ToleranceMode::Absolute);
    }

    #[must_use]
    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.checks.len()
    }

    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    #[must_use]
    pub fn format_summary(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            s,
            "═══ {} validation: {}/{} checks passed ═══",
            self.name,
            self.passed_count(),
            self.total_count()
        );
        for check in &self.checks {
            let icon = if check.passed { "✓" } else { "✗" };
            let _ = writeln!(
                s,
                "  {icon} {}: observed={:.6e}, expected={:.6e}, tol={:.2e} ({})",
                check.label, check.observed, check.expected, check.tolerance, check.mode
            );
        }
        s
    }

    /// Print the summary and exit: 0 if every check passed, 1 otherwise.
    pub fn finish(&self) -> ! {
        println!();
        print!("{}", self.format_summary());
        if self.all_passed() {
            println!("ALL CHECKS PASSED");
            process::exit(0);
        }
        let failed: Vec<&str> = self
            .checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.label.as_str())
            .collect();
        println!("FAILED CHECKS: {}", failed.join(", "));
        process::exit(1);
    }
}
