// SPDX-License-Identifier: AGPL-3.0-only

//! Batch orchestration across compute devices.
//!
//! A device is a private rayon thread pool plus a workspace sized to its
//! shard. Configurations are split contiguously across devices and every
//! device runs the same fixed kernel sequence:
//!
//! | Phase | Kernels |
//! |-------|---------|
//! | A (per device) | pack, neighbor lists, descriptors, descriptor extrema |
//! | host | merge extrema, update scaler (when requested) |
//! | B (per device) | network, forces, ZBL, residuals, adjoint, radial and angular gradient |
//!
//! Devices run on scoped threads and do not communicate; the scaler merge
//! between the two phases is the only cross-device step. Outputs are
//! concatenated in device order, which is dataset order.

use crate::error::NepError;
use crate::nep::angular::AngularInvariants;
use crate::nep::config::{NepConfig, ParameterBlock};
use crate::nep::descriptor::{DescriptorBuffers, DescriptorEngine};
use crate::nep::force::{ForceAssembler, ForceBuffers};
use crate::nep::gradient::{
    ForwardState, LossBreakdown, LossNormalization, TrainingBuffers, TrainingGradientEngine,
};
use crate::nep::neighbor::{ListKind, NeighborListBuilder, NeighborLists};
use crate::nep::network::{EvaluationMode, NetworkBuffers, NetworkEvaluator};
use crate::nep::parameters::{NetworkParameters, ParameterLayout};
use crate::nep::scaler::{DescriptorExtrema, Scaler};
use crate::nep::structure::{Dataset, PackedBatch};
use crate::nep::zbl::ZblCorrection;
use std::ops::Range;
use std::time::{Duration, Instant};

/// Per-call switches of `BatchOrchestrator::evaluate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EvaluateOptions {
    pub require_gradient: bool,
    /// Fold this batch's descriptor range into the scaler.
    pub recompute_scaler: bool,
    /// Repack and rebuild neighbor lists instead of reusing the cached ones.
    pub recompute_neighbors: bool,
}

impl EvaluateOptions {
    /// Energies, forces and virials only.
    #[must_use]
    pub const fn inference() -> Self {
        Self {
            require_gradient: false,
            recompute_scaler: false,
            recompute_neighbors: true,
        }
    }

    /// One training step on a fresh batch.
    #[must_use]
    pub const fn training() -> Self {
        Self {
            require_gradient: true,
            recompute_scaler: false,
            recompute_neighbors: true,
        }
    }
}

impl Default for EvaluateOptions {
    fn default() -> Self {
        Self::inference()
    }
}

/// Gradient of one device's shard.
#[derive(Clone, Debug)]
pub struct ShardGradient {
    pub configs: Range<usize>,
    pub values: Vec<f64>,
}

/// Summary statistics of one evaluation.
#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    pub loss: LossBreakdown,
    /// Per-atom energy RMSE over all configurations.
    pub energy_rmse: f64,
    /// Force-component RMSE over configurations with force targets.
    pub force_rmse: Option<f64>,
    /// Per-atom virial RMSE over configurations with virial targets.
    pub virial_rmse: Option<f64>,
    pub max_radial_neighbors: usize,
    pub max_angular_neighbors: usize,
    /// Atoms whose energy or force is NaN or infinite.
    pub non_finite: usize,
    pub elapsed: Duration,
}

/// Everything `evaluate` returns, in dataset order.
#[derive(Clone, Debug, Default)]
pub struct EvaluationOutput {
    pub energies: Vec<f64>,
    pub forces: Vec<[f64; 3]>,
    pub virials: Vec<[f64; 6]>,
    pub config_energies: Vec<f64>,
    pub config_virials: Vec<[f64; 6]>,
    pub diagnostics: Diagnostics,
    pub gradients: Option<Vec<ShardGradient>>,
}

impl EvaluationOutput {
    /// Sum of the shard gradients: the full-batch gradient.
    #[must_use]
    pub fn summed_gradient(&self) -> Option<Vec<f64>> {
        let shards = self.gradients.as_ref()?;
        let len = shards.first().map_or(0, |s| s.values.len());
        let mut total = vec![0.0; len];
        for shard in shards {
            for (t, v) in total.iter_mut().zip(&shard.values) {
                *t += v;
            }
        }
        Some(total)
    }
}

/// Buffers of one device, sized to its shard and overwritten every call.
#[derive(Debug, Default)]
struct Workspace {
    batch: Option<PackedBatch>,
    lists: NeighborLists,
    radial_capacity: usize,
    angular_capacity: usize,
    descriptors: DescriptorBuffers,
    extrema: Option<DescriptorExtrema>,
    network: NetworkBuffers,
    forces: ForceBuffers,
    training: TrainingBuffers,
}

/// One compute device: a private thread pool and its workspace.
pub struct Device {
    index: usize,
    pool: rayon::ThreadPool,
    workspace: Workspace,
}

impl Device {
    fn new(index: usize, threads: usize, block: &ParameterBlock) -> Result<Self, NepError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |t| format!("nep-device{index}-{t}"))
            .build()
            .map_err(|e| NepError::Device(e.to_string()))?;
        Ok(Self {
            index,
            pool,
            workspace: Workspace {
                radial_capacity: block.capacity.radial,
                angular_capacity: block.capacity.angular,
                ..Workspace::default()
            },
        })
    }

    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }
}

/// Inputs shared by every device during one call.
struct StepContext<'a> {
    block: &'a ParameterBlock,
    invariants: &'a AngularInvariants,
    params: &'a NetworkParameters,
    dataset: &'a dyn Dataset,
    options: EvaluateOptions,
}

struct PhaseBResult {
    loss: LossBreakdown,
    gradient: Option<Vec<f64>>,
}

/// Owns the run configuration, scaler and devices; sequences every kernel.
pub struct BatchOrchestrator {
    block: ParameterBlock,
    layout: ParameterLayout,
    invariants: AngularInvariants,
    scaler: Scaler,
    devices: Vec<Device>,
}

impl BatchOrchestrator {
    /// `num_devices` pools of `threads_per_device` workers each.
    pub fn new(
        block: ParameterBlock,
        num_devices: usize,
        threads_per_device: usize,
    ) -> Result<Self, NepError> {
        if num_devices == 0 || threads_per_device == 0 {
            return Err(NepError::Device(
                "at least one device with one thread is required".into(),
            ));
        }
        let devices = (0..num_devices)
            .map(|index| Device::new(index, threads_per_device, &block))
            .collect::<Result<Vec<_>, _>>()?;
        let layout = ParameterLayout::new(&block);
        let invariants = AngularInvariants::new(block.l_max, block.four_body, block.five_body);
        log::info!(
            "NEP orchestrator: {} type(s), dim {}, {} params, {}×{} threads",
            block.num_types,
            block.dim,
            layout.total,
            num_devices,
            threads_per_device
        );
        Ok(Self {
            scaler: Scaler::new(block.dim),
            block,
            layout,
            invariants,
            devices,
        })
    }

    pub fn from_config(
        config: &NepConfig,
        covalent_radii: Option<&[f64]>,
        num_devices: usize,
        threads_per_device: usize,
    ) -> Result<Self, NepError> {
        Self::new(
            ParameterBlock::new(config, covalent_radii)?,
            num_devices,
            threads_per_device,
        )
    }

    #[must_use]
    pub fn block(&self) -> &ParameterBlock {
        &self.block
    }

    #[must_use]
    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    #[must_use]
    pub fn scaler(&self) -> &Scaler {
        &self.scaler
    }

    /// Forget all batch statistics; the next call recomputes the scale.
    pub fn reset_scaler(&mut self) {
        self.scaler.reset();
    }

    #[must_use]
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Evaluate `params` on every configuration of `dataset`.
    pub fn evaluate(
        &mut self,
        params: &NetworkParameters,
        dataset: &dyn Dataset,
        options: EvaluateOptions,
    ) -> Result<EvaluationOutput, NepError> {
        let start = Instant::now();
        if params.layout() != &self.layout {
            return Err(NepError::ParameterSize {
                expected: self.layout.total,
                found: params.len(),
            });
        }
        let shards = shard_ranges(dataset.len(), self.devices.len());
        let normalization = LossNormalization::from_dataset(dataset);
        let recompute_scaler = options.recompute_scaler || !self.scaler.is_initialized();

        let Self {
            block,
            invariants,
            scaler,
            devices,
            ..
        } = self;
        let ctx = StepContext {
            block,
            invariants,
            params,
            dataset,
            options,
        };

        let extrema = run_on_devices(devices, &shards, |workspace, range| {
            phase_a(&ctx, workspace, range, recompute_scaler)
        })?;
        if recompute_scaler {
            let mut merged = DescriptorExtrema::empty(block.dim);
            for e in extrema.iter().flatten() {
                merged.merge(e);
            }
            scaler.update(&merged);
            log::debug!("scaler updated from {} device(s)", extrema.len());
        }

        let scale = scaler.factors();
        let results = run_on_devices(devices, &shards, |workspace, _| {
            phase_b(&ctx, workspace, scale, normalization)
        })?;

        let output = collect_output(devices, &shards, results, start);
        let d = &output.diagnostics;
        if d.non_finite > 0 {
            log::warn!("{} atom(s) with non-finite energy or force", d.non_finite);
        }
        log::info!(
            "{} configs / {} atoms: loss {:.6e} (E {:.3e}, F {:.3e}, V {:.3e}), RMSE {:.4e}, {:?}",
            dataset.len(),
            output.energies.len(),
            d.loss.total(),
            d.loss.energy,
            d.loss.force,
            d.loss.virial,
            d.energy_rmse,
            d.elapsed
        );
        Ok(output)
    }
}

/// Contiguous, balanced split of `0..num_configs` into `num_devices` ranges.
#[must_use]
pub fn shard_ranges(num_configs: usize, num_devices: usize) -> Vec<Range<usize>> {
    let base = num_configs / num_devices;
    let extra = num_configs % num_devices;
    let mut start = 0;
    (0..num_devices)
        .map(|k| {
            let len = base + usize::from(k < extra);
            let range = start..start + len;
            start += len;
            range
        })
        .collect()
}

/// Run `f` on every device concurrently, inside that device's pool.
fn run_on_devices<T, F>(
    devices: &mut [Device],
    shards: &[Range<usize>],
    f: F,
) -> Result<Vec<T>, NepError>
where
    T: Send,
    F: Fn(&mut Workspace, Range<usize>) -> Result<T, NepError> + Sync,
{
    let f = &f;
    std::thread::scope(|scope| {
        let handles: Vec<_> = devices
            .iter_mut()
            .zip(shards)
            .map(|(device, range)| {
                let range = range.clone();
                scope.spawn(move || {
                    let Device {
                        pool, workspace, ..
                    } = device;
                    pool.install(|| f(workspace, range))
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| NepError::Device("device worker panicked".into()))
                    .and_then(|r| r)
            })
            .collect()
    })
}

/// Pack, neighbor lists, descriptors and (optionally) extrema.
fn phase_a(
    ctx: &StepContext<'_>,
    ws: &mut Workspace,
    range: Range<usize>,
    want_extrema: bool,
) -> Result<Option<DescriptorExtrema>, NepError> {
    let reuse = !ctx.options.recompute_neighbors
        && ws.batch.as_ref().is_some_and(|b| {
            b.first_config == range.start && b.num_configs() == range.len()
        });
    if !reuse {
        let batch = PackedBatch::pack(ctx.dataset, range, ctx.block)?;
        ws.lists = build_lists(ctx.block, &batch, ws)?;
        ws.batch = Some(batch);
    }
    let Some(batch) = ws.batch.as_ref() else {
        return Ok(None);
    };

    DescriptorEngine::new(ctx.block, ctx.invariants).compute(
        batch,
        &ws.lists,
        ctx.params.coefficients(),
        &mut ws.descriptors,
    );
    Ok(want_extrema.then(|| DescriptorExtrema::from_rows(&ws.descriptors.q, ctx.block.dim)))
}

/// Build lists, growing the row widths on overflow when allowed.
fn build_lists(
    block: &ParameterBlock,
    batch: &PackedBatch,
    ws: &mut Workspace,
) -> Result<NeighborLists, NepError> {
    let builder = NeighborListBuilder::new(block);
    loop {
        match builder.build(batch, ws.radial_capacity, ws.angular_capacity) {
            Err(NepError::NeighborCapacity {
                list,
                required,
                capacity,
            }) if block.capacity.grow_on_overflow => {
                log::warn!("{list} neighbor capacity {capacity} too small, growing to {required}");
                match list {
                    ListKind::Radial => ws.radial_capacity = required,
                    ListKind::Angular => ws.angular_capacity = required,
                }
            }
            other => return other,
        }
    }
}

/// Network, forces, ZBL, residuals and (optionally) the gradient passes.
fn phase_b(
    ctx: &StepContext<'_>,
    ws: &mut Workspace,
    scale: &[f64],
    normalization: LossNormalization,
) -> Result<PhaseBResult, NepError> {
    let Some(batch) = ws.batch.as_ref() else {
        return Err(NepError::Device("workspace has no packed batch".into()));
    };
    let mode = if ctx.options.require_gradient {
        EvaluationMode::Training
    } else {
        EvaluationMode::Inference
    };
    NetworkEvaluator::new(ctx.block, scale).evaluate(
        &batch.types,
        &ws.descriptors,
        ctx.params,
        mode,
        &mut ws.network,
    );
    ForceAssembler::new(ctx.block, ctx.invariants).assemble(
        batch,
        &ws.lists,
        ctx.params.coefficients(),
        &ws.descriptors,
        &ws.network,
        &mut ws.forces,
    );
    if let Some(table) = &ctx.block.zbl {
        ZblCorrection::new(ctx.block, table).apply(batch, &ws.lists.radial, &mut ws.forces);
    }

    let engine = TrainingGradientEngine::new(ctx.block, ctx.invariants, normalization, scale);
    if ctx.options.require_gradient {
        let state = ForwardState {
            batch,
            lists: &ws.lists,
            descriptors: &ws.descriptors,
            network: &ws.network,
            forces: &ws.forces,
        };
        let (gradient, loss) = engine.run(ctx.params, state, &mut ws.training);
        Ok(PhaseBResult {
            loss,
            gradient: Some(gradient),
        })
    } else {
        let (_, loss) = engine.residuals(batch, &ws.forces);
        Ok(PhaseBResult {
            loss,
            gradient: None,
        })
    }
}

fn collect_output(
    devices: &[Device],
    shards: &[Range<usize>],
    results: Vec<PhaseBResult>,
    start: Instant,
) -> EvaluationOutput {
    let mut out = EvaluationOutput::default();
    let mut gradients = Vec::new();
    let mut energy_sq = 0.0;
    let mut num_configs = 0usize;
    let (mut force_sq, mut force_count) = (0.0, 0usize);
    let (mut virial_sq, mut virial_count) = (0.0, 0usize);

    for ((device, range), result) in devices.iter().zip(shards).zip(results) {
        out.diagnostics.loss += result.loss;
        if let Some(values) = result.gradient {
            gradients.push(ShardGradient {
                configs: range.clone(),
                values,
            });
        }
        let ws = &device.workspace;
        let Some(batch) = ws.batch.as_ref() else {
            continue;
        };
        let forces = ws.forces.forces_vec();
        let virials = ws.forces.virials_vec();
        out.diagnostics.max_radial_neighbors =
            out.diagnostics.max_radial_neighbors.max(ws.lists.radial.max_count());
        out.diagnostics.max_angular_neighbors =
            out.diagnostics.max_angular_neighbors.max(ws.lists.angular.max_count());

        for c in 0..batch.num_configs() {
            let atoms = batch.atoms_of(c);
            let nc = atoms.len() as f64;
            let energy: f64 = ws.forces.energy[atoms.clone()].iter().sum();
            let mut virial = [0.0; 6];
            for v in &virials[atoms.clone()] {
                for (t, x) in virial.iter_mut().zip(v) {
                    *t += x;
                }
            }
            let de = (energy - batch.reference.energy[c]) / nc;
            energy_sq += de * de;
            num_configs += 1;
            if batch.reference.has_forces[c] {
                for i in atoms.clone() {
                    for a in 0..3 {
                        let diff = forces[i][a] - batch.reference.forces[i][a];
                        force_sq += diff * diff;
                    }
                    force_count += 3;
                }
            }
            if let Some(target) = batch.reference.virial[c] {
                for (v, t) in virial.iter().zip(&target) {
                    let diff = (v - t) / nc;
                    virial_sq += diff * diff;
                }
                virial_count += 6;
            }
            out.config_energies.push(energy);
            out.config_virials.push(virial);
        }

        out.diagnostics.non_finite += ws
            .forces
            .energy
            .iter()
            .zip(&forces)
            .filter(|(e, f)| !e.is_finite() || f.iter().any(|x| !x.is_finite()))
            .count();
        out.energies.extend_from_slice(&ws.forces.energy);
        out.forces.extend(forces);
        out.virials.extend(virials);
    }

    let rmse = |sum: f64, count: usize| (count > 0).then(|| (sum / count as f64).sqrt());
    out.diagnostics.energy_rmse = rmse(energy_sq, num_configs).unwrap_or(0.0);
    out.diagnostics.force_rmse = rmse(force_sq, force_count);
    out.diagnostics.virial_rmse = rmse(virial_sq, virial_count);
    out.gradients = (!gradients.is_empty()).then_some(gradients);
    out.diagnostics.elapsed = start.elapsed();
    out
}
