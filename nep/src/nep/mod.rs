// SPDX-License-Identifier: AGPL-3.0-only

//! Neuroevolution potential: descriptor, network, forces and training gradient.
//!
//! | Module | Role |
//! |--------|------|
//! | `config` | run configuration, validated `ParameterBlock` |
//! | `structure` | configurations, `Dataset`, periodic box, batch packing |
//! | `parameters` | flat trainable buffer and per-type views |
//! | `neighbor` | periodic radial/angular neighbor lists |
//! | `basis` | cutoff envelope and Chebyshev radial basis |
//! | `angular` | Cartesian moments and rotation invariants |
//! | `descriptor` | per-atom descriptor rows |
//! | `scaler` | per-dimension descriptor scaling |
//! | `network` | per-type network with first/second derivatives |
//! | `force` | forces and virials by chain rule |
//! | `zbl` | short-range repulsive correction |
//! | `gradient` | loss and exact parameter gradient |
//! | `orchestrator` | device sharding and kernel sequencing |
//! | `atomic` | atomic f64 accumulation |
//!
//! Kernels run in this order: neighbors → descriptors → scaler → network →
//! forces → ZBL → residuals → adjoint → radial gradient → angular gradient.

pub mod angular;
pub mod atomic;
pub mod basis;
pub mod config;
pub mod descriptor;
pub mod force;
pub mod gradient;
pub mod neighbor;
pub mod network;
pub mod orchestrator;
pub mod parameters;
pub mod scaler;
pub mod structure;
pub mod zbl;

pub use config::{quick_test_config, ModelMode, NepConfig, ParameterBlock};
pub use orchestrator::{BatchOrchestrator, EvaluateOptions, EvaluationOutput};
pub use parameters::{NetworkParameters, ParameterLayout};
pub use structure::{Dataset, Structure};
