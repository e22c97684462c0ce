// SPDX-License-Identifier: AGPL-3.0-only

//! Periodic neighbor lists with bounded row capacity.
//!
//! Each atom is scanned against every atom of its own configuration and
//! every replica offset of the periodic box; the minimum-image convention in
//! the replicated cell picks the nearest image. Rows are atom-major with a
//! fixed width, so each rayon task writes only its own row. An atom with
//! more neighbors than its row can hold makes the build fail with
//! `NepError::NeighborCapacity` carrying the width that would have sufficed.

use crate::error::NepError;
use crate::nep::config::ParameterBlock;
use crate::nep::structure::PackedBatch;
use rayon::prelude::*;
use std::fmt;

/// Which of the two lists a capacity error refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListKind {
    Radial,
    Angular,
}

impl fmt::Display for ListKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Radial => write!(f, "radial"),
            Self::Angular => write!(f, "angular"),
        }
    }
}

/// Fixed-width neighbor rows: index plus displacement `r_j − r_i`.
#[derive(Clone, Debug, Default)]
pub struct NeighborSet {
    pub capacity: usize,
    pub counts: Vec<usize>,
    pub indices: Vec<usize>,
    pub displacements: Vec<[f64; 3]>,
}

impl NeighborSet {
    fn zeroed(num_atoms: usize, capacity: usize) -> Self {
        Self {
            capacity,
            counts: vec![0; num_atoms],
            indices: vec![0; num_atoms * capacity],
            displacements: vec![[0.0; 3]; num_atoms * capacity],
        }
    }

    #[must_use]
    pub fn count(&self, atom: usize) -> usize {
        self.counts[atom]
    }

    /// Neighbor indices and displacements of `atom`.
    #[must_use]
    pub fn row(&self, atom: usize) -> (&[usize], &[[f64; 3]]) {
        let start = atom * self.capacity;
        let end = start + self.counts[atom];
        (&self.indices[start..end], &self.displacements[start..end])
    }

    /// `(neighbor, displacement)` of one slot.
    #[must_use]
    pub fn pair(&self, atom: usize, slot: usize) -> (usize, [f64; 3]) {
        let at = atom * self.capacity + slot;
        (self.indices[at], self.displacements[at])
    }

    #[must_use]
    pub fn max_count(&self) -> usize {
        self.counts.iter().copied().max().unwrap_or(0)
    }
}

/// Radial and angular lists of one packed batch.
#[derive(Clone, Debug, Default)]
pub struct NeighborLists {
    pub radial: NeighborSet,
    pub angular: NeighborSet,
}

/// Builds `NeighborLists` for a packed batch.
pub struct NeighborListBuilder<'a> {
    block: &'a ParameterBlock,
}

impl<'a> NeighborListBuilder<'a> {
    #[must_use]
    pub const fn new(block: &'a ParameterBlock) -> Self {
        Self { block }
    }

    /// Scan every atom of `batch` with rows of the given widths.
    pub fn build(
        &self,
        batch: &PackedBatch,
        radial_capacity: usize,
        angular_capacity: usize,
    ) -> Result<NeighborLists, NepError> {
        let n = batch.num_atoms;
        let mut radial = NeighborSet::zeroed(n, radial_capacity);
        let mut angular = NeighborSet::zeroed(n, angular_capacity);

        let required: Vec<(usize, usize)> = radial
            .indices
            .par_chunks_mut(radial_capacity)
            .zip(radial.displacements.par_chunks_mut(radial_capacity))
            .zip(angular.indices.par_chunks_mut(angular_capacity))
            .zip(angular.displacements.par_chunks_mut(angular_capacity))
            .enumerate()
            .map(|(i, (((r_idx, r_disp), a_idx), a_disp))| {
                self.scan_atom(batch, i, (r_idx, r_disp), (a_idx, a_disp))
            })
            .collect();

        let max_radial = required.iter().map(|r| r.0).max().unwrap_or(0);
        let max_angular = required.iter().map(|r| r.1).max().unwrap_or(0);
        if max_radial > radial_capacity {
            return Err(NepError::NeighborCapacity {
                list: ListKind::Radial,
                required: max_radial,
                capacity: radial_capacity,
            });
        }
        if max_angular > angular_capacity {
            return Err(NepError::NeighborCapacity {
                list: ListKind::Angular,
                required: max_angular,
                capacity: angular_capacity,
            });
        }
        for (i, &(nr, na)) in required.iter().enumerate() {
            radial.counts[i] = nr;
            angular.counts[i] = na;
        }
        log::debug!(
            "neighbor lists: {n} atoms, max radial {max_radial}, max angular {max_angular}"
        );
        Ok(NeighborLists { radial, angular })
    }

    /// Fill one atom's rows; returns the counts it needed (may exceed the rows).
    fn scan_atom(
        &self,
        batch: &PackedBatch,
        i: usize,
        radial: (&mut [usize], &mut [[f64; 3]]),
        angular: (&mut [usize], &mut [[f64; 3]]),
    ) -> (usize, usize) {
        let c = batch.config_of_atom[i];
        let pbox = &batch.boxes[c];
        let ti = batch.types[i];
        let ri = batch.positions[i];
        let (r_idx, r_disp) = radial;
        let (a_idx, a_disp) = angular;
        let mut nr = 0;
        let mut na = 0;

        for j in batch.atoms_of(c) {
            let tj = batch.types[j];
            let rc_r = self.block.rc_radial_pair(ti, tj);
            let rc_a = self.block.rc_angular_pair(ti, tj);
            let rj = batch.positions[j];
            for ia in 0..pbox.replicas[0] {
                for ib in 0..pbox.replicas[1] {
                    for ic in 0..pbox.replicas[2] {
                        if i == j && ia == 0 && ib == 0 && ic == 0 {
                            continue;
                        }
                        let shift = pbox.replica_shift(ia, ib, ic);
                        let d = pbox.minimum_image([
                            rj[0] + shift[0] - ri[0],
                            rj[1] + shift[1] - ri[1],
                            rj[2] + shift[2] - ri[2],
                        ]);
                        let r2 = d[0] * d[0] + d[1] * d[1] + d[2] * d[2];
                        if r2 < rc_r * rc_r {
                            if nr < r_idx.len() {
                                r_idx[nr] = j;
                                r_disp[nr] = d;
                            }
                            nr += 1;
                        }
                        if r2 < rc_a * rc_a {
                            if na < a_idx.len() {
                                a_idx[na] = j;
                                a_disp[na] = d;
                            }
                            na += 1;
                        }
                    }
                }
            }
        }
        (nr, na)
    }
}
