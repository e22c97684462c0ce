// SPDX-License-Identifier: AGPL-3.0-only

//! Typed errors for NEP evaluation and training.
//!
//! Callers pattern-match on the failure mode (bad configuration, neighbor
//! capacity, parameter buffer mismatch) instead of parsing strings. Capacity
//! errors carry the width that would have been sufficient so the
//! orchestrator can grow its workspace and retry.

use crate::nep::neighbor::ListKind;
use thiserror::Error;

/// Errors arising from configuration, dataset packing, or kernel execution.
#[derive(Debug, Error)]
pub enum NepError {
    /// Inconsistent run configuration, rejected before any kernel runs.
    #[error("Invalid NEP configuration: {0}")]
    Config(String),

    /// An atom has more neighbors than its preallocated row can hold.
    #[error("{list} neighbor list needs {required} slots per atom but capacity is {capacity}")]
    NeighborCapacity {
        list: ListKind,
        required: usize,
        capacity: usize,
    },

    /// Flat parameter buffer does not match the layout derived from the run configuration.
    #[error("Parameter buffer has {found} values, layout expects {expected}")]
    ParameterSize { expected: usize, found: usize },

    /// A structure supplied by the dataset is malformed.
    #[error("Malformed dataset: {0}")]
    Dataset(String),

    /// A compute device (thread pool) could not be created or a worker failed.
    #[error("Compute device failure: {0}")]
    Device(String),

    /// JSON run configuration could not be parsed.
    #[error("Configuration parse failed: {0}")]
    ConfigParse(#[from] serde_json::Error),
}
