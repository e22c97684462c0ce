// SPDX-License-Identifier: AGPL-3.0-only

//! Shared f64 accumulator for scatter-style kernels.
//!
//! Force and gradient passes add into slots owned by other work items
//! (neighbor forces, shared coefficient gradients). Each slot is an
//! `AtomicU64` holding f64 bits; `add` is a compare-and-swap loop, so
//! results are exact up to summation order.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct AtomicBuffer {
    slots: Vec<AtomicU64>,
}

impl AtomicBuffer {
    #[must_use]
    pub fn zeros(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| AtomicU64::new(0.0f64.to_bits())).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Resize (if needed) and zero every slot.
    pub fn reset(&mut self, len: usize) {
        if self.slots.len() == len {
            for slot in &self.slots {
                slot.store(0.0f64.to_bits(), Ordering::Relaxed);
            }
        } else {
            *self = Self::zeros(len);
        }
    }

    pub fn add(&self, index: usize, value: f64) {
        if value == 0.0 {
            return;
        }
        let _ = self.slots[index].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
            Some((f64::from_bits(bits) + value).to_bits())
        });
    }

    /// `self[offset + i] += values[i]`.
    pub fn add_slice(&self, offset: usize, values: &[f64]) {
        for (i, &v) in values.iter().enumerate() {
            self.add(offset + i, v);
        }
    }

    #[must_use]
    pub fn load(&self, index: usize) -> f64 {
        f64::from_bits(self.slots[index].load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        self.slots
            .iter()
            .map(|s| f64::from_bits(s.load(Ordering::Relaxed)))
            .collect()
    }
}
