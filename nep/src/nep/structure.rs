// SPDX-License-Identifier: AGPL-3.0-only

//! Configurations, the dataset collaborator, and flat batch packing.
//!
//! A `Structure` is one periodic configuration with optional reference data.
//! `PackedBatch` lays a contiguous range of structures out as flat per-atom
//! arrays with per-configuration offsets, which is what every kernel reads.

use crate::error::NepError;
use crate::nep::config::ParameterBlock;

/// Three lattice vectors; `cell[k]` is the k-th vector (a, b, c).
pub type Cell = [[f64; 3]; 3];

/// One atomic configuration with its training targets.
#[derive(Clone, Debug)]
pub struct Structure {
    pub cell: Cell,
    pub positions: Vec<[f64; 3]>,
    pub types: Vec<usize>,
    /// Reference total energy.
    pub energy: f64,
    /// Reference forces; empty when the configuration has no force targets.
    pub forces: Vec<[f64; 3]>,
    /// Reference total virial (xx, yy, zz, xy, yz, zx), if any.
    pub virial: Option<[f64; 6]>,
    /// Per-configuration loss weight.
    pub weight: f64,
    /// Reference temperature (temperature mode only).
    pub temperature: f64,
}

impl Structure {
    #[must_use]
    pub fn new(cell: Cell, positions: Vec<[f64; 3]>, types: Vec<usize>) -> Self {
        Self {
            cell,
            positions,
            types,
            energy: 0.0,
            forces: Vec::new(),
            virial: None,
            weight: 1.0,
            temperature: 0.0,
        }
    }

    #[must_use]
    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = energy;
        self
    }

    #[must_use]
    pub fn with_forces(mut self, forces: Vec<[f64; 3]>) -> Self {
        self.forces = forces;
        self
    }

    #[must_use]
    pub const fn with_virial(mut self, virial: [f64; 6]) -> Self {
        self.virial = Some(virial);
        self
    }

    #[must_use]
    pub const fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    #[must_use]
    pub const fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn num_atoms(&self) -> usize {
        self.positions.len()
    }
}

/// Source of configurations for evaluation and training.
pub trait Dataset: Sync {
    fn len(&self) -> usize;
    fn structure(&self, index: usize) -> &Structure;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_atoms(&self, index: usize) -> usize {
        self.structure(index).num_atoms()
    }
}

impl Dataset for [Structure] {
    fn len(&self) -> usize {
        <[Structure]>::len(self)
    }

    fn structure(&self, index: usize) -> &Structure {
        &self[index]
    }
}

impl Dataset for Vec<Structure> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn structure(&self, index: usize) -> &Structure {
        &self[index]
    }
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Periodic cell replicated so that every thickness exceeds twice the cutoff.
///
/// Neighbor search loops over the replica offsets and applies the
/// minimum-image convention in the replicated cell, which makes each image
/// within the cutoff appear exactly once.
#[derive(Clone, Debug)]
pub struct PeriodicBox {
    pub cell: Cell,
    pub replicas: [usize; 3],
    /// Columns are the replicated lattice vectors.
    expanded: [[f64; 3]; 3],
    expanded_inverse: [[f64; 3]; 3],
}

impl PeriodicBox {
    pub fn new(cell: Cell, cutoff: f64) -> Result<Self, NepError> {
        let volume = dot(cell[0], cross(cell[1], cell[2]));
        if !(volume.abs() > f64::EPSILON) {
            return Err(NepError::Dataset("cell volume is zero".into()));
        }
        let mut replicas = [1usize; 3];
        for (k, rep) in replicas.iter_mut().enumerate() {
            let area = cross(cell[(k + 1) % 3], cell[(k + 2) % 3]);
            let thickness = volume.abs() / dot(area, area).sqrt();
            *rep = ((2.0 * cutoff / thickness).ceil() as usize).max(1);
        }
        let mut expanded = [[0.0; 3]; 3];
        for row in 0..3 {
            for k in 0..3 {
                expanded[row][k] = cell[k][row] * replicas[k] as f64;
            }
        }
        let expanded_inverse = invert(&expanded)
            .ok_or_else(|| NepError::Dataset("replicated cell is singular".into()))?;
        Ok(Self {
            cell,
            replicas,
            expanded,
            expanded_inverse,
        })
    }

    /// Translation by `ia·a + ib·b + ic·c`.
    #[must_use]
    pub fn replica_shift(&self, ia: usize, ib: usize, ic: usize) -> [f64; 3] {
        let m = [ia as f64, ib as f64, ic as f64];
        let mut shift = [0.0; 3];
        for (d, s) in shift.iter_mut().enumerate() {
            *s = m[0] * self.cell[0][d] + m[1] * self.cell[1][d] + m[2] * self.cell[2][d];
        }
        shift
    }

    /// Wrap a displacement to its nearest image in the replicated cell.
    #[must_use]
    pub fn minimum_image(&self, x: [f64; 3]) -> [f64; 3] {
        let h = &self.expanded;
        let g = &self.expanded_inverse;
        let mut s = [0.0; 3];
        for (r, sr) in s.iter_mut().enumerate() {
            let v = g[r][0] * x[0] + g[r][1] * x[1] + g[r][2] * x[2];
            *sr = v - v.round();
        }
        [
            h[0][0] * s[0] + h[0][1] * s[1] + h[0][2] * s[2],
            h[1][0] * s[0] + h[1][1] * s[1] + h[1][2] * s[2],
            h[2][0] * s[0] + h[2][1] * s[1] + h[2][2] * s[2],
        ]
    }

    #[must_use]
    pub fn volume(&self) -> f64 {
        dot(self.cell[0], cross(self.cell[1], self.cell[2])).abs()
    }
}

fn invert(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0]);
    if det.abs() < f64::EPSILON {
        return None;
    }
    let inv = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv,
        ],
    ])
}

/// Reference targets aligned with a packed batch.
#[derive(Clone, Debug, Default)]
pub struct ReferenceData {
    /// Per configuration.
    pub energy: Vec<f64>,
    pub virial: Vec<Option<[f64; 6]>>,
    pub weight: Vec<f64>,
    pub temperature: Vec<f64>,
    pub has_forces: Vec<bool>,
    /// Per atom (zeros where the configuration has no force targets).
    pub forces: Vec<[f64; 3]>,
}

/// A contiguous range of structures laid out as flat arrays.
#[derive(Clone, Debug)]
pub struct PackedBatch {
    /// Dataset index of the first packed configuration.
    pub first_config: usize,
    pub num_atoms: usize,
    pub positions: Vec<[f64; 3]>,
    pub types: Vec<usize>,
    /// Local configuration index of each atom.
    pub config_of_atom: Vec<usize>,
    /// `atom_offsets[c]..atom_offsets[c + 1]` are the atoms of configuration `c`.
    pub atom_offsets: Vec<usize>,
    pub boxes: Vec<PeriodicBox>,
    pub reference: ReferenceData,
}

impl PackedBatch {
    /// Pack `dataset[range]`, validating shapes and types against `block`.
    pub fn pack(
        dataset: &dyn Dataset,
        range: std::ops::Range<usize>,
        block: &ParameterBlock,
    ) -> Result<Self, NepError> {
        let first_config = range.start;
        let num_configs = range.len();
        let num_atoms: usize = range.clone().map(|c| dataset.num_atoms(c)).sum();

        let mut batch = Self {
            first_config,
            num_atoms,
            positions: Vec::with_capacity(num_atoms),
            types: Vec::with_capacity(num_atoms),
            config_of_atom: Vec::with_capacity(num_atoms),
            atom_offsets: Vec::with_capacity(num_configs + 1),
            boxes: Vec::with_capacity(num_configs),
            reference: ReferenceData {
                energy: Vec::with_capacity(num_configs),
                virial: Vec::with_capacity(num_configs),
                weight: Vec::with_capacity(num_configs),
                temperature: Vec::with_capacity(num_configs),
                has_forces: Vec::with_capacity(num_configs),
                forces: Vec::with_capacity(num_atoms),
            },
        };
        batch.atom_offsets.push(0);

        for (local, index) in range.enumerate() {
            let s = dataset.structure(index);
            let n = s.num_atoms();
            if n == 0 {
                return Err(NepError::Dataset(format!("structure {index} has no atoms")));
            }
            if s.types.len() != n {
                return Err(NepError::Dataset(format!(
                    "structure {index}: {} types for {n} positions",
                    s.types.len()
                )));
            }
            if let Some(&t) = s.types.iter().find(|&&t| t >= block.num_types) {
                return Err(NepError::Dataset(format!(
                    "structure {index}: type {t} outside 0..{}",
                    block.num_types
                )));
            }
            let has_forces = !s.forces.is_empty();
            if has_forces && s.forces.len() != n {
                return Err(NepError::Dataset(format!(
                    "structure {index}: {} reference forces for {n} atoms",
                    s.forces.len()
                )));
            }
            batch.boxes.push(PeriodicBox::new(s.cell, block.max_cutoff())?);
            batch.positions.extend_from_slice(&s.positions);
            batch.types.extend_from_slice(&s.types);
            batch.config_of_atom.extend(std::iter::repeat(local).take(n));
            if has_forces {
                batch.reference.forces.extend_from_slice(&s.forces);
            } else {
                batch.reference.forces.extend(std::iter::repeat([0.0; 3]).take(n));
            }
            batch.reference.energy.push(s.energy);
            batch.reference.virial.push(s.virial);
            batch.reference.weight.push(s.weight);
            batch.reference.temperature.push(s.temperature);
            batch.reference.has_forces.push(has_forces);
            batch
                .atom_offsets
                .push(batch.atom_offsets[local] + n);
        }
        Ok(batch)
    }

    #[must_use]
    pub fn num_configs(&self) -> usize {
        self.boxes.len()
    }

    /// Atom indices of local configuration `c`.
    #[must_use]
    pub fn atoms_of(&self, c: usize) -> std::ops::Range<usize> {
        self.atom_offsets[c]..self.atom_offsets[c + 1]
    }

    #[must_use]
    pub fn config_size(&self, c: usize) -> usize {
        self.atom_offsets[c + 1] - self.atom_offsets[c]
    }
}
