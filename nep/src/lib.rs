// SPDX-License-Identifier: AGPL-3.0-only

#![deny(clippy::expect_used, clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

//! hotSpring NEP: machine-learned interatomic potential on data-parallel kernels
//!
//! Evaluates and trains a neuroevolution-style potential: a per-atom
//! single-hidden-layer network conditioned on a rotation-, translation- and
//! permutation-invariant descriptor built from local neighbor geometry.
//! For a batch of packed configurations it produces energies, forces,
//! virials and, when training, the exact analytic gradient of the weighted
//! energy/force/virial loss with respect to every trainable parameter.
//!
//! ## Active modules
//!   - `nep`: neighbor lists, descriptors, network, forces, ZBL, gradients,
//!     and the batch orchestrator that sequences them per device
//!   - `tolerances`: documented numerical thresholds for validation
//!   - `validation`: pass/fail harness used by the validation binary
//!
//! ## Validation binaries
//!   - `validate_nep`: finite-difference checks of forces, virial and
//!     parameter gradients on a synthetic two-species crystal

pub mod error;
pub mod nep;
pub mod tolerances;
pub mod validation;

pub use error::NepError;
