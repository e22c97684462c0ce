// SPDX-License-Identifier: AGPL-3.0-only

//! NEP validation: analytic derivatives against finite differences.
//!
//! Builds a jittered two-species crystal, evaluates a randomly initialized
//! potential, and checks:
//!
//! 1. forces equal the negative position gradient of the total energy
//! 2. the virial equals the negative strain derivative of the total energy
//! 3. per-configuration forces sum to zero
//! 4. the training gradient matches central differences of the loss
//! 5. splitting the batch across devices leaves loss and gradient unchanged
//!
//! Usage: `validate_nep [config.json]`. Without an argument the quick test
//! configuration (Si/O, every descriptor feature on) is used. A config with
//! typewise cutoffs carries its covalent radii (indexed by atomic number) in
//! `typewise_cutoff.covalent_radii`. Set `RUST_LOG=debug` to trace kernel
//! sequencing.

use hotspring_nep::nep::config::ParameterBlock;
use hotspring_nep::nep::{
    quick_test_config, BatchOrchestrator, EvaluateOptions, NepConfig, NetworkParameters, Structure,
};
use hotspring_nep::tolerances::{self, FD_STEP};
use hotspring_nep::validation::ValidationHarness;
use hotspring_nep::NepError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEED: u64 = 42;
const LATTICE: f64 = 4.2;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  NEP potential: forces, virials and training gradients      ║");
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    let mut harness = ValidationHarness::new("nep");
    if let Err(e) = run(&mut harness) {
        eprintln!("validation aborted: {e}");
        harness.check_bool("evaluation completed", false);
    }
    println!();
    harness.finish();
}

fn run(harness: &mut ValidationHarness) -> Result<(), NepError> {
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| NepError::Config(format!("{path}: {e}")))?;
            NepConfig::from_json_str(&text)?
        }
        None => quick_test_config(&[14, 8]),
    };
    let block = ParameterBlock::new(&config, None)?;
    let num_types = block.num_types;
    let mut orch = BatchOrchestrator::new(block, 1, 2)?;
    let params = NetworkParameters::random(orch.layout().clone(), SEED);
    println!(
        "  {} type(s), descriptor dim {}, {} parameters",
        num_types,
        orch.block().dim,
        params.len()
    );
    println!();

    let crystal = jittered_crystal(SEED, num_types);
    check_forces(harness, &mut orch, &params, &crystal)?;
    check_virial(harness, &mut orch, &params, &crystal)?;
    check_newton(harness, &mut orch, &params)?;

    let data: Vec<Structure> = (0..3).map(|k| labelled(SEED + k, num_types)).collect();
    check_gradient(harness, &config, &data)?;
    check_sharding(harness, &config, &data)?;
    Ok(())
}

/// Eight atoms on a jittered simple-cubic grid, types assigned round-robin.
fn jittered_crystal(seed: u64, num_types: usize) -> Structure {
    let mut rng = StdRng::seed_from_u64(seed);
    let h = 0.5 * LATTICE;
    let mut positions = Vec::with_capacity(8);
    for ix in 0..2 {
        for iy in 0..2 {
            for iz in 0..2 {
                positions.push([f64::from(ix), f64::from(iy), f64::from(iz)].map(|x| {
                    h.mul_add(x, rng.random_range(-0.2..0.2))
                }));
            }
        }
    }
    let types = (0..positions.len()).map(|i| i % num_types).collect();
    let cell = [[LATTICE, 0.0, 0.0], [0.0, LATTICE, 0.0], [0.0, 0.0, LATTICE]];
    Structure::new(cell, positions, types)
}

fn labelled(seed: u64, num_types: usize) -> Structure {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_mul(7919));
    let s = jittered_crystal(seed, num_types);
    let forces = (0..s.num_atoms())
        .map(|_| [0, 1, 2].map(|_| rng.random_range(-0.5..0.5)))
        .collect();
    let virial = [0, 1, 2, 3, 4, 5].map(|_| rng.random_range(-1.0..1.0));
    s.with_energy(rng.random_range(-4.0..4.0))
        .with_forces(forces)
        .with_virial(virial)
}

fn energy_of(
    orch: &mut BatchOrchestrator,
    params: &NetworkParameters,
    s: Structure,
) -> Result<f64, NepError> {
    let out = orch.evaluate(params, &vec![s], EvaluateOptions::inference())?;
    Ok(out.config_energies[0])
}

/// [1] F = −∂E/∂r for every atom and component.
fn check_forces(
    harness: &mut ValidationHarness,
    orch: &mut BatchOrchestrator,
    params: &NetworkParameters,
    s: &Structure,
) -> Result<(), NepError> {
    println!("[1] Forces vs −∂E/∂r");
    let out = orch.evaluate(params, &vec![s.clone()], EvaluateOptions::inference())?;
    let mut analytic = Vec::new();
    let mut numeric = Vec::new();
    for atom in 0..s.num_atoms() {
        for a in 0..3 {
            let mut plus = s.clone();
            plus.positions[atom][a] += FD_STEP;
            let mut minus = s.clone();
            minus.positions[atom][a] -= FD_STEP;
            let de = energy_of(orch, params, plus)? - energy_of(orch, params, minus)?;
            analytic.push(out.forces[atom][a]);
            numeric.push(-de / (2.0 * FD_STEP));
        }
    }
    println!("  {} components, E = {:.6} eV", analytic.len(), out.config_energies[0]);
    harness.check_fd_vector("forces = -dE/dr", &analytic, &numeric);
    Ok(())
}

/// [2] W_ab = −∂E/∂ε_ba under homogeneous strain of cell and positions.
fn check_virial(
    harness: &mut ValidationHarness,
    orch: &mut BatchOrchestrator,
    params: &NetworkParameters,
    s: &Structure,
) -> Result<(), NepError> {
    println!("[2] Virial vs −∂E/∂ε");
    let out = orch.evaluate(params, &vec![s.clone()], EvaluateOptions::inference())?;
    let strain = |a: usize, b: usize, e: f64| {
        let mut t = s.clone();
        for v in t.cell.iter_mut().chain(t.positions.iter_mut()) {
            v[a] += e * v[b];
        }
        t
    };
    let mut numeric = Vec::with_capacity(6);
    for (a, b) in [(0, 0), (1, 1), (2, 2), (0, 1), (1, 2), (2, 0)] {
        let de = energy_of(orch, params, strain(a, b, FD_STEP))?
            - energy_of(orch, params, strain(a, b, -FD_STEP))?;
        numeric.push(-de / (2.0 * FD_STEP));
    }
    println!("  W = {:?}", out.config_virials[0]);
    harness.check_fd_vector("virial = -dE/dstrain", &out.config_virials[0], &numeric);
    Ok(())
}

/// [3] Σ_i F_i = 0 within each configuration.
fn check_newton(
    harness: &mut ValidationHarness,
    orch: &mut BatchOrchestrator,
    params: &NetworkParameters,
) -> Result<(), NepError> {
    println!("[3] Newton's third law");
    let num_types = orch.block().num_types;
    let data: Vec<Structure> = (10..13).map(|k| jittered_crystal(k, num_types)).collect();
    let out = orch.evaluate(params, &data, EvaluateOptions::inference())?;
    let mut worst: f64 = 0.0;
    let mut offset = 0;
    for s in &data {
        let atoms = &out.forces[offset..offset + s.num_atoms()];
        for a in 0..3 {
            worst = worst.max(atoms.iter().map(|f| f[a]).sum::<f64>().abs());
        }
        offset += s.num_atoms();
    }
    println!("  max |Σ F| = {worst:.3e}");
    harness.check_upper("net force", worst, tolerances::NEWTON_3RD_LAW_ABS);
    harness.check_bool("all outputs finite", out.diagnostics.non_finite == 0);
    Ok(())
}

/// [4] ∂L/∂θ against central differences on a stride of parameters.
fn check_gradient(
    harness: &mut ValidationHarness,
    config: &NepConfig,
    data: &Vec<Structure>,
) -> Result<(), NepError> {
    println!("[4] Training gradient vs finite differences");
    let mut orch = BatchOrchestrator::from_config(config, None, 2, 2)?;
    let mut params = NetworkParameters::random(orch.layout().clone(), SEED + 1);
    let out = orch.evaluate(&params, data, EvaluateOptions::training())?;
    let analytic = out
        .summed_gradient()
        .ok_or_else(|| NepError::Device("training step returned no gradient".into()))?;

    let stride = (params.len() / 40).max(1);
    let mut sampled = Vec::new();
    let mut numeric = Vec::new();
    for k in (0..params.len()).step_by(stride) {
        let original = params.values()[k];
        params.values_mut()[k] = original + FD_STEP;
        let plus = orch.evaluate(&params, data, EvaluateOptions::inference())?;
        params.values_mut()[k] = original - FD_STEP;
        let minus = orch.evaluate(&params, data, EvaluateOptions::inference())?;
        params.values_mut()[k] = original;
        sampled.push(analytic[k]);
        numeric.push(
            (plus.diagnostics.loss.total() - minus.diagnostics.loss.total()) / (2.0 * FD_STEP),
        );
    }
    println!(
        "  loss {:.6e}, {} of {} parameters probed",
        out.diagnostics.loss.total(),
        sampled.len(),
        params.len()
    );
    harness.check_fd_vector("dL/dtheta", &sampled, &numeric);
    Ok(())
}

/// [5] One device and three devices agree.
fn check_sharding(
    harness: &mut ValidationHarness,
    config: &NepConfig,
    data: &Vec<Structure>,
) -> Result<(), NepError> {
    println!("[5] Device sharding");
    let mut single = BatchOrchestrator::from_config(config, None, 1, 2)?;
    let mut split = BatchOrchestrator::from_config(config, None, 3, 1)?;
    let params = NetworkParameters::random(single.layout().clone(), SEED + 2);
    let a = single.evaluate(&params, data, EvaluateOptions::training())?;
    let b = split.evaluate(&params, data, EvaluateOptions::training())?;
    harness.check_rel(
        "loss independent of sharding",
        b.diagnostics.loss.total(),
        a.diagnostics.loss.total(),
        1e-12,
    );
    let (ga, gb) = (a.summed_gradient(), b.summed_gradient());
    let worst = ga
        .iter()
        .flatten()
        .zip(gb.iter().flatten())
        .map(|(x, y)| (x - y).abs() / x.abs().max(1.0))
        .fold(0.0, f64::max);
    harness.check_upper("gradient independent of sharding", worst, 1e-10);
    Ok(())
}
