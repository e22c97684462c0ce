// SPDX-License-Identifier: AGPL-3.0-only

//! Run configuration: descriptor hyperparameters, model mode, cutoffs, ZBL
//! and loss weights.
//!
//! `NepConfig` is the serializable input (JSON). `ParameterBlock` is the
//! validated, immutable form every kernel reads; it also carries the derived
//! sizes (descriptor dimension, coefficient counts) that the parameter
//! layout and the scratch buffers are built from.

use crate::error::NepError;
use crate::nep::basis::MAX_BASIS_SIZE;
use crate::nep::angular::MAX_DEGREE;
use crate::nep::zbl::{ZblConfig, ZblTable};
use serde::{Deserialize, Serialize};

/// Largest radial/angular order `n_max` a block may request.
pub const MAX_ORDER: usize = 19;

/// What the network output means and how the virial slot is filled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    /// Energy model: forces and virial from the energy gradient.
    #[default]
    Potential,
    /// Dipole model: xx/yy/zz virial slots hold −Σ r² f per atom.
    Dipole,
    /// Polarizability model: second head adds an isotropic scalar to the diagonal.
    Polarizability,
    /// Energy model with the last descriptor slot set to the reference temperature.
    Temperature,
}

/// Typewise cutoff factors applied to covalent-radius sums.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypewiseCutoffConfig {
    pub radial_factor: f64,
    pub angular_factor: f64,
    pub zbl_factor: f64,
    /// Covalent radius by atomic number, for self-contained run files. A
    /// table passed to `ParameterBlock::new` takes precedence.
    pub covalent_radii: Vec<f64>,
}

impl Default for TypewiseCutoffConfig {
    fn default() -> Self {
        Self {
            radial_factor: 2.5,
            angular_factor: 2.0,
            zbl_factor: 0.65,
            covalent_radii: Vec::new(),
        }
    }
}

/// Loss weights (λ) and per-type force weighting.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LossWeights {
    pub energy: f64,
    pub force: f64,
    pub virial: f64,
    /// Force-magnitude smoothing δ: residuals scale by δ/(δ+|F_ref|). Zero disables.
    pub force_delta: f64,
    /// Per-type multiplier on force residuals. Empty means all ones.
    pub type_weights: Vec<f64>,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            energy: 1.0,
            force: 1.0,
            virial: 0.1,
            force_delta: 0.0,
            type_weights: Vec::new(),
        }
    }
}

/// Preallocated neighbor row widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeighborCapacity {
    pub radial: usize,
    pub angular: usize,
    /// Grow the rows and rebuild instead of failing on overflow.
    pub grow_on_overflow: bool,
}

impl Default for NeighborCapacity {
    fn default() -> Self {
        Self {
            radial: 200,
            angular: 100,
            grow_on_overflow: true,
        }
    }
}

/// Serializable run configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NepConfig {
    /// Atomic number of each chemical type, in type-index order.
    pub atomic_numbers: Vec<u32>,
    pub mode: ModelMode,
    pub rc_radial: f64,
    pub rc_angular: f64,
    pub n_max_radial: usize,
    pub n_max_angular: usize,
    pub basis_size_radial: usize,
    pub basis_size_angular: usize,
    /// Highest Legendre degree in the angular block (1..=8).
    pub l_max: usize,
    /// Include the cubic invariant of the degree-2 moment tensor.
    pub four_body: bool,
    /// Include the squared norm of the degree-1 moment vector, squared.
    pub five_body: bool,
    pub num_neurons: usize,
    pub typewise_cutoff: Option<TypewiseCutoffConfig>,
    pub zbl: Option<ZblConfig>,
    pub loss: LossWeights,
    pub neighbor_capacity: NeighborCapacity,
}

impl Default for NepConfig {
    fn default() -> Self {
        Self {
            atomic_numbers: Vec::new(),
            mode: ModelMode::Potential,
            rc_radial: 8.0,
            rc_angular: 4.0,
            n_max_radial: 4,
            n_max_angular: 4,
            basis_size_radial: 8,
            basis_size_angular: 8,
            l_max: 4,
            four_body: true,
            five_body: false,
            num_neurons: 30,
            typewise_cutoff: None,
            zbl: None,
            loss: LossWeights::default(),
            neighbor_capacity: NeighborCapacity::default(),
        }
    }
}

impl NepConfig {
    /// Parse a JSON run configuration; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, NepError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String, NepError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Small but complete configuration for tests and quick validation.
///
/// Every descriptor feature is on (four- and five-body composites, l up to 4)
/// so a single evaluation exercises every code path.
#[must_use]
pub fn quick_test_config(atomic_numbers: &[u32]) -> NepConfig {
    NepConfig {
        atomic_numbers: atomic_numbers.to_vec(),
        rc_radial: 5.0,
        rc_angular: 4.0,
        n_max_radial: 3,
        n_max_angular: 2,
        basis_size_radial: 4,
        basis_size_angular: 3,
        l_max: 4,
        four_body: true,
        five_body: true,
        num_neurons: 6,
        neighbor_capacity: NeighborCapacity {
            radial: 64,
            angular: 48,
            grow_on_overflow: true,
        },
        ..NepConfig::default()
    }
}

/// Typewise cutoff resolved to per-type covalent radii.
#[derive(Clone, Debug, PartialEq)]
pub struct TypewiseCutoff {
    pub factors: TypewiseCutoffConfig,
    /// Covalent radius of each type (looked up by atomic number).
    pub covalent_radii: Vec<f64>,
}

/// Validated, immutable run configuration plus derived sizes.
#[derive(Clone, Debug)]
pub struct ParameterBlock {
    pub mode: ModelMode,
    pub num_types: usize,
    pub atomic_numbers: Vec<u32>,
    pub rc_radial: f64,
    pub rc_angular: f64,
    pub n_max_radial: usize,
    pub n_max_angular: usize,
    pub basis_size_radial: usize,
    pub basis_size_angular: usize,
    pub l_max: usize,
    pub four_body: bool,
    pub five_body: bool,
    pub num_neurons: usize,
    pub typewise: Option<TypewiseCutoff>,
    pub zbl: Option<ZblTable>,
    pub loss: LossWeights,
    pub capacity: NeighborCapacity,
    /// Radial block length, `n_max_radial + 1`.
    pub dim_radial: usize,
    /// Angular invariants per radial order: `l_max + four_body + five_body`.
    pub num_invariants: usize,
    /// Angular block length.
    pub dim_angular: usize,
    /// Full descriptor length (plus one temperature slot in temperature mode).
    pub dim: usize,
    /// `types² × (n_max_radial+1) × (basis_size_radial+1)`.
    pub num_c_radial: usize,
    /// `types² × (n_max_angular+1) × (basis_size_angular+1)`.
    pub num_c_angular: usize,
}

impl ParameterBlock {
    /// Validate `config` and derive sizes.
    ///
    /// `covalent_radii` is indexed by atomic number and is required only when
    /// typewise cutoffs are enabled.
    pub fn new(config: &NepConfig, covalent_radii: Option<&[f64]>) -> Result<Self, NepError> {
        let num_types = config.atomic_numbers.len();
        if num_types == 0 {
            return Err(NepError::Config("at least one atom type is required".into()));
        }
        if !(config.rc_radial > 0.0 && config.rc_angular > 0.0) {
            return Err(NepError::Config("cutoffs must be positive".into()));
        }
        if config.rc_angular > config.rc_radial {
            return Err(NepError::Config(format!(
                "angular cutoff {} exceeds radial cutoff {}",
                config.rc_angular, config.rc_radial
            )));
        }
        if config.n_max_radial > MAX_ORDER || config.n_max_angular > MAX_ORDER {
            return Err(NepError::Config(format!("n_max must be at most {MAX_ORDER}")));
        }
        if config.basis_size_radial > MAX_BASIS_SIZE || config.basis_size_angular > MAX_BASIS_SIZE {
            return Err(NepError::Config(format!(
                "basis size must be at most {MAX_BASIS_SIZE}"
            )));
        }
        if config.l_max == 0 || config.l_max > MAX_DEGREE {
            return Err(NepError::Config(format!("l_max must be in 1..={MAX_DEGREE}")));
        }
        if config.four_body && config.l_max < 2 {
            return Err(NepError::Config("four-body invariant needs l_max >= 2".into()));
        }
        if config.num_neurons == 0 {
            return Err(NepError::Config("num_neurons must be positive".into()));
        }
        if !config.loss.type_weights.is_empty() && config.loss.type_weights.len() != num_types {
            return Err(NepError::Config(format!(
                "{} type weights for {num_types} types",
                config.loss.type_weights.len()
            )));
        }
        if config.loss.force_delta < 0.0 {
            return Err(NepError::Config("force_delta must be non-negative".into()));
        }
        if config.neighbor_capacity.radial == 0 || config.neighbor_capacity.angular == 0 {
            return Err(NepError::Config("neighbor capacity must be positive".into()));
        }

        let typewise = match &config.typewise_cutoff {
            None => None,
            Some(factors) => {
                let table = match covalent_radii {
                    Some(table) => table,
                    None if !factors.covalent_radii.is_empty() => &factors.covalent_radii[..],
                    None => {
                        return Err(NepError::Config(
                            "typewise cutoff needs a covalent radius table".into(),
                        ))
                    }
                };
                if factors.radial_factor <= 0.0
                    || factors.angular_factor <= 0.0
                    || factors.zbl_factor <= 0.0
                {
                    return Err(NepError::Config("typewise factors must be positive".into()));
                }
                let covalent = config
                    .atomic_numbers
                    .iter()
                    .map(|&z| {
                        table.get(z as usize).copied().ok_or_else(|| {
                            NepError::Config(format!("no covalent radius for Z = {z}"))
                        })
                    })
                    .collect::<Result<Vec<f64>, NepError>>()?;
                Some(TypewiseCutoff {
                    factors: factors.clone(),
                    covalent_radii: covalent,
                })
            }
        };

        let four = usize::from(config.four_body);
        let five = usize::from(config.five_body);
        let dim_radial = config.n_max_radial + 1;
        let num_invariants = config.l_max + four + five;
        let dim_angular = (config.n_max_angular + 1) * num_invariants;
        let temperature_slot = usize::from(config.mode == ModelMode::Temperature);
        let types_sq = num_types * num_types;

        let mut block = Self {
            mode: config.mode,
            num_types,
            atomic_numbers: config.atomic_numbers.clone(),
            rc_radial: config.rc_radial,
            rc_angular: config.rc_angular,
            n_max_radial: config.n_max_radial,
            n_max_angular: config.n_max_angular,
            basis_size_radial: config.basis_size_radial,
            basis_size_angular: config.basis_size_angular,
            l_max: config.l_max,
            four_body: config.four_body,
            five_body: config.five_body,
            num_neurons: config.num_neurons,
            typewise,
            zbl: None,
            loss: config.loss.clone(),
            capacity: config.neighbor_capacity,
            dim_radial,
            num_invariants,
            dim_angular,
            dim: dim_radial + dim_angular + temperature_slot,
            num_c_radial: types_sq * (config.n_max_radial + 1) * (config.basis_size_radial + 1),
            num_c_angular: types_sq * (config.n_max_angular + 1) * (config.basis_size_angular + 1),
        };

        if let Some(zbl) = &config.zbl {
            if matches!(block.mode, ModelMode::Dipole | ModelMode::Polarizability) {
                return Err(NepError::Config(
                    "ZBL applies to energy models only".into(),
                ));
            }
            block.zbl = Some(ZblTable::resolve(zbl, &block)?);
        }
        Ok(block)
    }

    /// Radial cutoff for a type pair, reduced by the typewise rule when enabled.
    #[must_use]
    pub fn rc_radial_pair(&self, t1: usize, t2: usize) -> f64 {
        match &self.typewise {
            Some(tw) => self
                .rc_radial
                .min(tw.factors.radial_factor * (tw.covalent_radii[t1] + tw.covalent_radii[t2])),
            None => self.rc_radial,
        }
    }

    /// Angular cutoff for a type pair, reduced by the typewise rule when enabled.
    #[must_use]
    pub fn rc_angular_pair(&self, t1: usize, t2: usize) -> f64 {
        match &self.typewise {
            Some(tw) => self
                .rc_angular
                .min(tw.factors.angular_factor * (tw.covalent_radii[t1] + tw.covalent_radii[t2])),
            None => self.rc_angular,
        }
    }

    /// Neighbor search radius: the larger static cutoff.
    #[must_use]
    pub fn max_cutoff(&self) -> f64 {
        self.rc_radial.max(self.rc_angular)
    }

    /// Index of the angular invariant `e` of order `n` inside a descriptor row.
    #[must_use]
    pub const fn angular_index(&self, invariant: usize, n: usize) -> usize {
        self.dim_radial + invariant * (self.n_max_angular + 1) + n
    }

    /// Descriptor slot overwritten by the reference temperature.
    #[must_use]
    pub fn temperature_slot(&self) -> Option<usize> {
        (self.mode == ModelMode::Temperature).then(|| self.dim - 1)
    }

    /// Whether a second network head is trained.
    #[must_use]
    pub fn has_polarizability_head(&self) -> bool {
        self.mode == ModelMode::Polarizability
    }

    /// Virial components that enter the loss (3 for dipoles, 6 otherwise).
    #[must_use]
    pub fn num_virial_components(&self) -> usize {
        if self.mode == ModelMode::Dipole {
            3
        } else {
            6
        }
    }

    /// Offset of `c[n, k, t1, t2]` inside the radial coefficient array.
    #[must_use]
    pub const fn radial_coefficient(&self, n: usize, k: usize, t1: usize, t2: usize) -> usize {
        (n * (self.basis_size_radial + 1) + k) * self.num_types * self.num_types
            + t1 * self.num_types
            + t2
    }

    /// Offset of `c[n, k, t1, t2]` inside the angular coefficient array.
    #[must_use]
    pub const fn angular_coefficient(&self, n: usize, k: usize, t1: usize, t2: usize) -> usize {
        (n * (self.basis_size_angular + 1) + k) * self.num_types * self.num_types
            + t1 * self.num_types
            + t2
    }

    /// Force-residual weight for a type: the per-type multiplier or one.
    #[must_use]
    pub fn type_weight(&self, t: usize) -> f64 {
        self.loss.type_weights.get(t).copied().unwrap_or(1.0)
    }
}
