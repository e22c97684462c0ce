// SPDX-License-Identifier: AGPL-3.0-only

//! Integration tests: forces, virials and training gradients end-to-end.
//!
//! Every analytic derivative the orchestrator returns is compared against a
//! central difference of the quantity it differentiates, through the public
//! `BatchOrchestrator::evaluate` API only.

use hotspring_nep::nep::config::{NepConfig, ParameterBlock, TypewiseCutoffConfig};
use hotspring_nep::nep::zbl::ZblConfig;
use hotspring_nep::nep::{
    quick_test_config, BatchOrchestrator, EvaluateOptions, ModelMode, NetworkParameters, Structure,
};
use hotspring_nep::tolerances::{self, fd_agrees, FD_STEP};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LATTICE: f64 = 4.2;

/// Eight atoms on a jittered simple-cubic grid, two species alternating.
fn crystal(seed: u64, jitter: f64) -> Structure {
    let mut rng = StdRng::seed_from_u64(seed);
    let h = 0.5 * LATTICE;
    let mut positions = Vec::new();
    let mut types = Vec::new();
    for ix in 0..2 {
        for iy in 0..2 {
            for iz in 0..2 {
                positions.push([
                    h * f64::from(ix) + rng.random_range(-jitter..jitter),
                    h * f64::from(iy) + rng.random_range(-jitter..jitter),
                    h * f64::from(iz) + rng.random_range(-jitter..jitter),
                ]);
                types.push(((ix + iy + iz) % 2) as usize);
            }
        }
    }
    let cell = [[LATTICE, 0.0, 0.0], [0.0, LATTICE, 0.0], [0.0, 0.0, LATTICE]];
    Structure::new(cell, positions, types)
}

/// Crystal with random energy, force and virial targets.
fn labelled_crystal(seed: u64) -> Structure {
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
    let s = crystal(seed, 0.15);
    let forces = (0..s.num_atoms())
        .map(|_| [0, 1, 2].map(|_| rng.random_range(-0.5..0.5)))
        .collect();
    let virial = [0, 1, 2, 3, 4, 5].map(|_| rng.random_range(-1.0..1.0));
    s.with_energy(rng.random_range(-4.0..4.0))
        .with_forces(forces)
        .with_virial(virial)
        .with_weight(rng.random_range(0.5..1.5))
}

fn orchestrator(config: &NepConfig, devices: usize) -> BatchOrchestrator {
    orchestrator_with_radii(config, None, devices)
}

fn orchestrator_with_radii(
    config: &NepConfig,
    covalent_radii: Option<&[f64]>,
    devices: usize,
) -> BatchOrchestrator {
    let block = ParameterBlock::new(config, covalent_radii).expect("valid config");
    BatchOrchestrator::new(block, devices, 2).expect("thread pools")
}

/// Covalent radii (Å) indexed by atomic number, O and Si filled in.
fn si_o_radii() -> Vec<f64> {
    let mut radii = vec![0.0; 15];
    radii[8] = 0.66;
    radii[14] = 1.11;
    radii
}

/// Shear the cell and positions into a general triclinic box.
fn triclinic(s: &Structure) -> Structure {
    strained(&strained(&strained(s, 0, 1, 0.21), 1, 2, -0.13), 2, 0, 0.08)
}

fn random_params(orch: &BatchOrchestrator, seed: u64) -> NetworkParameters {
    NetworkParameters::random(orch.layout().clone(), seed)
}

fn total_energy(orch: &mut BatchOrchestrator, params: &NetworkParameters, s: &Structure) -> f64 {
    let out = orch
        .evaluate(params, &vec![s.clone()], EvaluateOptions::inference())
        .expect("evaluate");
    out.config_energies[0]
}

fn total_loss(
    orch: &mut BatchOrchestrator,
    params: &NetworkParameters,
    data: &Vec<Structure>,
) -> f64 {
    orch.evaluate(params, data, EvaluateOptions::inference())
        .expect("evaluate")
        .diagnostics
        .loss
        .total()
}

/// Apply `x_a += e·x_b` to the cell and every position.
fn strained(s: &Structure, a: usize, b: usize, e: f64) -> Structure {
    let mut out = s.clone();
    for v in out.cell.iter_mut().chain(out.positions.iter_mut()) {
        v[a] += e * v[b];
    }
    out
}

/// Compare the analytic gradient against central differences on a stride of
/// parameters that covers every block of the layout.
fn check_parameter_gradient(config: &NepConfig, data: &Vec<Structure>, seed: u64) {
    check_parameter_gradient_with(config, None, data, seed);
}

fn check_parameter_gradient_with(
    config: &NepConfig,
    covalent_radii: Option<&[f64]>,
    data: &Vec<Structure>,
    seed: u64,
) {
    let mut orch = orchestrator_with_radii(config, covalent_radii, 2);
    let mut params = random_params(&orch, seed);

    let analytic = orch
        .evaluate(&params, data, EvaluateOptions::training())
        .expect("training step")
        .summed_gradient()
        .expect("gradient requested");
    assert_eq!(analytic.len(), params.len());

    let layout = orch.layout().clone();
    let mut probes: Vec<usize> = (0..layout.total).step_by(7).collect();
    for head in 0..layout.num_heads {
        probes.push(layout.b1(head));
        probes.push(layout.w0(head, 1).start);
        probes.push(layout.b0(head, 0).start);
    }
    probes.push(layout.c_radial.start);
    probes.push(layout.c_radial.end - 1);
    probes.push(layout.c_angular.start);
    probes.push(layout.c_angular.end - 1);

    for &k in &probes {
        let original = params.values()[k];
        params.values_mut()[k] = original + FD_STEP;
        let plus = total_loss(&mut orch, &params, data);
        params.values_mut()[k] = original - FD_STEP;
        let minus = total_loss(&mut orch, &params, data);
        params.values_mut()[k] = original;
        let numeric = (plus - minus) / (2.0 * FD_STEP);
        assert!(
            fd_agrees(analytic[k], numeric),
            "parameter {k}: analytic {:.10e} vs numeric {:.10e}",
            analytic[k],
            numeric
        );
    }
}

#[test]
fn forces_are_negative_energy_gradient() {
    let config = quick_test_config(&[14, 8]);
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 11);
    let s = crystal(3, 0.2);

    let out = orch
        .evaluate(&params, &vec![s.clone()], EvaluateOptions::inference())
        .expect("evaluate");
    for atom in [0, 3, 6] {
        for a in 0..3 {
            let mut plus = s.clone();
            plus.positions[atom][a] += FD_STEP;
            let mut minus = s.clone();
            minus.positions[atom][a] -= FD_STEP;
            let numeric = -(total_energy(&mut orch, &params, &plus)
                - total_energy(&mut orch, &params, &minus))
                / (2.0 * FD_STEP);
            assert!(
                fd_agrees(out.forces[atom][a], numeric),
                "F[{atom}][{a}]: analytic {} vs numeric {numeric}",
                out.forces[atom][a]
            );
        }
    }
}

#[test]
fn virial_is_negative_strain_derivative() {
    let config = quick_test_config(&[14, 8]);
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 12);
    let s = crystal(4, 0.2);

    let out = orch
        .evaluate(&params, &vec![s.clone()], EvaluateOptions::inference())
        .expect("evaluate");
    let virial = out.config_virials[0];
    for (c, (a, b)) in [(0, 0), (1, 1), (2, 2), (0, 1), (1, 2), (2, 0)].into_iter().enumerate() {
        let plus = total_energy(&mut orch, &params, &strained(&s, a, b, FD_STEP));
        let minus = total_energy(&mut orch, &params, &strained(&s, a, b, -FD_STEP));
        let numeric = -(plus - minus) / (2.0 * FD_STEP);
        assert!(
            fd_agrees(virial[c], numeric),
            "virial component {c}: analytic {} vs numeric {numeric}",
            virial[c]
        );
    }
}

#[test]
fn forces_sum_to_zero_per_configuration() {
    let config = quick_test_config(&[14, 8]);
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 13);
    let data = vec![crystal(5, 0.2), crystal(6, 0.2)];

    let out = orch
        .evaluate(&params, &data, EvaluateOptions::inference())
        .expect("evaluate");
    for chunk in out.forces.chunks(8) {
        for a in 0..3 {
            let net: f64 = chunk.iter().map(|f| f[a]).sum();
            assert!(
                net.abs() < tolerances::NEWTON_3RD_LAW_ABS,
                "net force component {a} = {net:e}"
            );
        }
    }
    assert_eq!(out.diagnostics.non_finite, 0);
}

#[test]
fn parameter_gradient_matches_finite_difference() {
    let mut config = quick_test_config(&[14, 8]);
    config.loss.force_delta = 0.8;
    config.loss.type_weights = vec![1.0, 2.0];
    let data = vec![labelled_crystal(21), labelled_crystal(22), labelled_crystal(23)];
    check_parameter_gradient(&config, &data, 31);
}

#[test]
fn parameter_gradient_with_partial_targets() {
    let config = quick_test_config(&[14, 8]);
    let mut bare = labelled_crystal(24);
    bare.forces.clear();
    bare.virial = None;
    let data = vec![labelled_crystal(25), bare];
    check_parameter_gradient(&config, &data, 32);
}

#[test]
fn parameter_gradient_with_zbl() {
    let mut config = quick_test_config(&[14, 8]);
    config.zbl = Some(ZblConfig {
        inner: 1.0,
        outer: 2.2,
        pairs: Vec::new(),
    });
    let data = vec![labelled_crystal(26), labelled_crystal(27)];
    check_parameter_gradient(&config, &data, 33);
}

#[test]
fn parameter_gradient_in_triclinic_cells() {
    let config = quick_test_config(&[14, 8]);
    let data = vec![triclinic(&labelled_crystal(60)), triclinic(&labelled_crystal(61))];
    check_parameter_gradient(&config, &data, 38);
}

#[test]
fn parameter_gradient_at_highest_angular_degree() {
    let mut config = quick_test_config(&[14, 8]);
    config.l_max = 8;
    let data = vec![labelled_crystal(62), triclinic(&labelled_crystal(63))];
    check_parameter_gradient(&config, &data, 39);
}

#[test]
fn parameter_gradient_with_typewise_cutoffs() {
    let mut config = quick_test_config(&[14, 8]);
    config.typewise_cutoff = Some(TypewiseCutoffConfig::default());
    let radii = si_o_radii();
    let data = vec![labelled_crystal(64), triclinic(&labelled_crystal(65))];
    check_parameter_gradient_with(&config, Some(&radii), &data, 40);
}

#[test]
fn triclinic_forces_and_virial_match_energy_derivatives() {
    let mut config = quick_test_config(&[14, 8]);
    config.l_max = 8;
    config.typewise_cutoff = Some(TypewiseCutoffConfig::default());
    let radii = si_o_radii();
    let mut orch = orchestrator_with_radii(&config, Some(&radii), 1);
    let params = random_params(&orch, 41);
    let s = triclinic(&crystal(66, 0.2));

    let out = orch
        .evaluate(&params, &vec![s.clone()], EvaluateOptions::inference())
        .expect("evaluate");
    for a in 0..3 {
        let mut plus = s.clone();
        plus.positions[5][a] += FD_STEP;
        let mut minus = s.clone();
        minus.positions[5][a] -= FD_STEP;
        let numeric = -(total_energy(&mut orch, &params, &plus)
            - total_energy(&mut orch, &params, &minus))
            / (2.0 * FD_STEP);
        assert!(fd_agrees(out.forces[5][a], numeric), "{} vs {numeric}", out.forces[5][a]);
    }
    let virial = out.config_virials[0];
    for (c, (a, b)) in [(0, 0), (1, 1), (2, 2), (0, 1), (1, 2), (2, 0)].into_iter().enumerate() {
        let plus = total_energy(&mut orch, &params, &strained(&s, a, b, FD_STEP));
        let minus = total_energy(&mut orch, &params, &strained(&s, a, b, -FD_STEP));
        let numeric = -(plus - minus) / (2.0 * FD_STEP);
        assert!(fd_agrees(virial[c], numeric), "virial {c}: {} vs {numeric}", virial[c]);
    }
}

#[test]
fn dipole_parameter_gradient_matches_finite_difference() {
    let mut config = quick_test_config(&[14, 8]);
    config.mode = ModelMode::Dipole;
    config.loss.energy = 0.0;
    config.loss.force = 0.0;
    config.loss.virial = 1.0;
    let data = vec![labelled_crystal(28), labelled_crystal(29)];
    check_parameter_gradient(&config, &data, 34);
}

#[test]
fn polarizability_parameter_gradient_matches_finite_difference() {
    let mut config = quick_test_config(&[14, 8]);
    config.mode = ModelMode::Polarizability;
    config.loss.energy = 0.0;
    config.loss.force = 0.0;
    config.loss.virial = 1.0;
    let data = vec![labelled_crystal(30), labelled_crystal(31)];
    check_parameter_gradient(&config, &data, 35);
}

#[test]
fn temperature_parameter_gradient_matches_finite_difference() {
    let mut config = quick_test_config(&[14, 8]);
    config.mode = ModelMode::Temperature;
    let data = vec![
        labelled_crystal(32).with_temperature(300.0),
        labelled_crystal(33).with_temperature(900.0),
    ];
    check_parameter_gradient(&config, &data, 36);
}

#[test]
fn dipole_virial_is_diagonal() {
    let mut config = quick_test_config(&[14, 8]);
    config.mode = ModelMode::Dipole;
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 14);
    let out = orch
        .evaluate(&params, &vec![crystal(7, 0.2)], EvaluateOptions::inference())
        .expect("evaluate");
    for w in &out.virials {
        assert!(w[3..].iter().all(|&x| x == 0.0), "off-diagonal slots stay empty: {w:?}");
    }
    assert!(out.virials.iter().any(|w| w[0] != 0.0));
}

#[test]
fn polarizability_head_shifts_diagonal_only() {
    let potential = quick_test_config(&[14, 8]);
    let mut polar = potential.clone();
    polar.mode = ModelMode::Polarizability;

    let mut orch_polar = orchestrator(&polar, 1);
    let params_polar = random_params(&orch_polar, 15);
    let s = crystal(8, 0.2);
    let out_polar = orch_polar
        .evaluate(&params_polar, &vec![s.clone()], EvaluateOptions::inference())
        .expect("evaluate");

    // Head 0 of the polarizability buffer is exactly a potential network.
    let mut orch_pot = orchestrator(&potential, 1);
    let pot_layout = orch_pot.layout().clone();
    let head0_len = pot_layout.c_radial.start;
    let polar_layout = orch_polar.layout();
    let mut values = params_polar.values()[..head0_len].to_vec();
    values.extend_from_slice(&params_polar.values()[polar_layout.c_radial.start..]);
    let params_pot = NetworkParameters::new(pot_layout, values).expect("layout");
    let out_pot = orch_pot
        .evaluate(&params_pot, &vec![s], EvaluateOptions::inference())
        .expect("evaluate");

    for (wp, w0) in out_polar.virials.iter().zip(&out_pot.virials) {
        let shift = wp[0] - w0[0];
        for c in 1..3 {
            assert!((wp[c] - w0[c] - shift).abs() < 1e-9, "isotropic shift: {wp:?} vs {w0:?}");
        }
        for c in 3..6 {
            assert!((wp[c] - w0[c]).abs() < 1e-9);
        }
    }
    for (a, b) in out_polar.energies.iter().zip(&out_pot.energies) {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn isolated_atom_has_bias_only_energy() {
    let config = quick_test_config(&[14, 8]);
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 16);
    let big = 20.0;
    let s = Structure::new(
        [[big, 0.0, 0.0], [0.0, big, 0.0], [0.0, 0.0, big]],
        vec![[1.0, 2.0, 3.0]],
        vec![1],
    );
    let out = orch
        .evaluate(&params, &vec![s], EvaluateOptions::inference())
        .expect("evaluate");

    let net = params.network(0, 1);
    let expected: f64 = net
        .w1
        .iter()
        .zip(net.b0)
        .map(|(w, b)| w * (-b).tanh())
        .sum::<f64>()
        - net.b1;
    assert!((out.energies[0] - expected).abs() < tolerances::EXACT_F64);
    assert_eq!(out.forces[0], [0.0; 3]);
    assert_eq!(out.virials[0], [0.0; 6]);
    assert!(orch.scaler().is_initialized());
    assert!(orch.scaler().factors().iter().all(|&f| f == 1.0), "no range, unit scale");
}

#[test]
fn radial_only_dimer_has_no_angular_gradient() {
    let mut config = quick_test_config(&[14]);
    config.loss.virial = 0.0;
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 17);
    let big = 20.0;
    // 4.5 Å: inside the radial cutoff (5) and outside the angular cutoff (4).
    let s = Structure::new(
        [[big, 0.0, 0.0], [0.0, big, 0.0], [0.0, 0.0, big]],
        vec![[5.0, 5.0, 5.0], [9.5, 5.0, 5.0]],
        vec![0, 0],
    )
    .with_energy(-1.0)
    .with_forces(vec![[0.1, 0.0, 0.0], [-0.1, 0.0, 0.0]]);

    let out = orch
        .evaluate(&params, &vec![s], EvaluateOptions::training())
        .expect("evaluate");
    let f = out.forces[0];
    assert!(f[0].abs() > 1e-8, "bonded atoms feel a force: {f:?}");
    assert!(f[1].abs() < 1e-14 && f[2].abs() < 1e-14, "force lies on the bond: {f:?}");
    assert!((out.forces[0][0] + out.forces[1][0]).abs() < 1e-12);
    assert!(out.energies.iter().all(|e| e.is_finite()));
    assert!((out.energies[0] - out.energies[1]).abs() < 1e-12);
    assert_eq!(out.diagnostics.max_angular_neighbors, 0);
    assert_eq!(out.diagnostics.max_radial_neighbors, 1);

    let grad = out.summed_gradient().expect("gradient");
    let layout = orch.layout();
    assert!(grad[layout.c_angular.clone()].iter().all(|&g| g == 0.0));
    assert!(grad[layout.c_radial.clone()].iter().any(|&g| g != 0.0));
}

/// Every atom of a one-species simple-cubic crystal sees the same
/// environment, so each descriptor dimension is constant over the batch.
#[test]
fn constant_descriptors_keep_the_network_responsive() {
    let mut config = quick_test_config(&[14]);
    config.loss.force = 0.0;
    config.loss.virial = 0.0;
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 25);
    let h = 0.5 * LATTICE;
    let mut positions = Vec::new();
    for ix in 0..2 {
        for iy in 0..2 {
            for iz in 0..2 {
                positions.push([h * f64::from(ix), h * f64::from(iy), h * f64::from(iz)]);
            }
        }
    }
    let cell = [[LATTICE, 0.0, 0.0], [0.0, LATTICE, 0.0], [0.0, 0.0, LATTICE]];
    let s = Structure::new(cell, positions, vec![0; 8]).with_energy(-30.0);

    let out = orch
        .evaluate(&params, &vec![s], EvaluateOptions::training())
        .expect("evaluate");
    assert!(orch.scaler().factors().iter().all(|&f| f.is_finite() && f > 0.0));
    assert!(out.energies.iter().all(|e| e.is_finite()));
    for e in &out.energies {
        assert!((e - out.energies[0]).abs() < 1e-10, "identical sites: {e} vs {}", out.energies[0]);
    }

    // A saturated tanh layer has zero slope, which would zero these blocks.
    let grad = out.summed_gradient().expect("gradient");
    let layout = orch.layout();
    assert!(grad[layout.w0(0, 0)].iter().any(|&g| g != 0.0));
    assert!(grad[layout.c_radial.clone()].iter().any(|&g| g != 0.0));
    assert!(grad[layout.c_angular.clone()].iter().any(|&g| g != 0.0));
}

/// A single reference temperature leaves the temperature slot constant.
#[test]
fn single_temperature_batch_stays_finite_and_trainable() {
    let mut config = quick_test_config(&[14, 8]);
    config.mode = ModelMode::Temperature;
    let data = vec![
        labelled_crystal(34).with_temperature(600.0),
        labelled_crystal(35).with_temperature(600.0),
    ];
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 26);
    let out = orch
        .evaluate(&params, &data, EvaluateOptions::training())
        .expect("evaluate");
    let slot = orch.block().dim - 1;
    assert_eq!(orch.scaler().factors()[slot], 1.0 / 600.0);
    assert_eq!(out.diagnostics.non_finite, 0);
    check_parameter_gradient(&config, &data, 37);
}

#[test]
fn zbl_outside_its_range_changes_nothing() {
    let base = quick_test_config(&[14, 8]);
    let mut with_zbl = base.clone();
    // Nearest neighbors sit near 2.1 Å; jitter 0.05 keeps every pair beyond 1.9.
    with_zbl.zbl = Some(ZblConfig {
        inner: 0.5,
        outer: 1.0,
        pairs: Vec::new(),
    });
    let s = crystal(9, 0.05);

    let mut orch_a = orchestrator(&base, 1);
    let params = random_params(&orch_a, 18);
    let a = orch_a
        .evaluate(&params, &vec![s.clone()], EvaluateOptions::inference())
        .expect("evaluate");
    let mut orch_b = orchestrator(&with_zbl, 1);
    let b = orch_b
        .evaluate(&params, &vec![s], EvaluateOptions::inference())
        .expect("evaluate");
    assert_eq!(a.energies, b.energies);
    for (fa, fb) in a.forces.iter().zip(&b.forces) {
        for c in 0..3 {
            assert!((fa[c] - fb[c]).abs() < 1e-12, "{fa:?} vs {fb:?}");
        }
    }
    for (wa, wb) in a.virials.iter().zip(&b.virials) {
        for c in 0..6 {
            assert!((wa[c] - wb[c]).abs() < 1e-12, "{wa:?} vs {wb:?}");
        }
    }
}

#[test]
fn zbl_forces_match_energy_gradient() {
    let mut config = quick_test_config(&[14, 8]);
    config.zbl = Some(ZblConfig {
        inner: 1.2,
        outer: 2.4,
        pairs: Vec::new(),
    });
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 19);
    let s = crystal(10, 0.2);
    let out = orch
        .evaluate(&params, &vec![s.clone()], EvaluateOptions::inference())
        .expect("evaluate");
    for a in 0..3 {
        let mut plus = s.clone();
        plus.positions[2][a] += FD_STEP;
        let mut minus = s.clone();
        minus.positions[2][a] -= FD_STEP;
        let numeric = -(total_energy(&mut orch, &params, &plus)
            - total_energy(&mut orch, &params, &minus))
            / (2.0 * FD_STEP);
        assert!(fd_agrees(out.forces[2][a], numeric), "{} vs {numeric}", out.forces[2][a]);
    }
}

#[test]
fn sharding_does_not_change_results() {
    let config = quick_test_config(&[14, 8]);
    let data: Vec<Structure> = (40..45).map(labelled_crystal).collect();

    let mut single = orchestrator(&config, 1);
    let params = random_params(&single, 20);
    let reference = single
        .evaluate(&params, &data, EvaluateOptions::training())
        .expect("evaluate");
    let reference_grad = reference.summed_gradient().expect("gradient");

    for devices in [2, 3, 7] {
        let mut orch = orchestrator(&config, devices);
        let out = orch
            .evaluate(&params, &data, EvaluateOptions::training())
            .expect("evaluate");
        assert_eq!(out.gradients.as_ref().map(Vec::len), Some(devices));
        for (a, b) in out.energies.iter().zip(&reference.energies) {
            assert!((a - b).abs() <= tolerances::ATOMIC_REORDER_REL * b.abs().max(1.0));
        }
        let loss = out.diagnostics.loss.total();
        let ref_loss = reference.diagnostics.loss.total();
        assert!((loss - ref_loss).abs() <= 1e-12 * ref_loss.abs().max(1.0));
        let grad = out.summed_gradient().expect("gradient");
        for (k, (g, r)) in grad.iter().zip(&reference_grad).enumerate() {
            assert!(
                (g - r).abs() <= 1e-10 * r.abs().max(1.0),
                "{devices} devices, parameter {k}: {g} vs {r}"
            );
        }
    }
}

#[test]
fn scaler_only_tightens_until_reset() {
    let config = quick_test_config(&[14, 8]);
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 22);
    assert!(!orch.scaler().is_initialized());

    orch.evaluate(&params, &vec![crystal(11, 0.05)], EvaluateOptions::inference())
        .expect("evaluate");
    assert!(orch.scaler().is_initialized());
    let first = orch.scaler().values().to_vec();

    let options = EvaluateOptions {
        recompute_scaler: true,
        ..EvaluateOptions::inference()
    };
    orch.evaluate(&params, &vec![crystal(12, 0.3)], options)
        .expect("evaluate");
    let second = orch.scaler().values().to_vec();
    assert!(second.iter().zip(&first).all(|(s, f)| s <= f));
    assert!(second.iter().zip(&first).any(|(s, f)| s < f));

    // Without the flag the scale is frozen.
    orch.evaluate(&params, &vec![crystal(13, 0.5)], EvaluateOptions::inference())
        .expect("evaluate");
    assert_eq!(orch.scaler().values(), second.as_slice());

    orch.reset_scaler();
    assert!(!orch.scaler().is_initialized());
}

#[test]
fn cached_neighbors_reproduce_fresh_evaluation() {
    let config = quick_test_config(&[14, 8]);
    let mut orch = orchestrator(&config, 2);
    let mut params = random_params(&orch, 23);
    let data: Vec<Structure> = (50..53).map(labelled_crystal).collect();

    orch.evaluate(&params, &data, EvaluateOptions::training())
        .expect("evaluate");
    params.values_mut()[0] += 0.1;
    let fresh = orch
        .evaluate(&params, &data, EvaluateOptions::training())
        .expect("evaluate");
    let cached = orch
        .evaluate(
            &params,
            &data,
            EvaluateOptions {
                recompute_neighbors: false,
                ..EvaluateOptions::training()
            },
        )
        .expect("evaluate");
    assert_eq!(fresh.energies, cached.energies);
    let (a, b) = (fresh.diagnostics.loss.total(), cached.diagnostics.loss.total());
    assert!((a - b).abs() <= 1e-12 * a.abs().max(1.0), "{a} vs {b}");
}

#[test]
fn diagnostics_report_rmse_only_for_present_targets() {
    let config = quick_test_config(&[14, 8]);
    let mut orch = orchestrator(&config, 1);
    let params = random_params(&orch, 24);

    let bare = vec![crystal(14, 0.1).with_energy(1.0)];
    let out = orch
        .evaluate(&params, &bare, EvaluateOptions::inference())
        .expect("evaluate");
    assert!(out.diagnostics.force_rmse.is_none());
    assert!(out.diagnostics.virial_rmse.is_none());
    assert!(out.diagnostics.energy_rmse > 0.0);

    let labelled = vec![labelled_crystal(15)];
    let out = orch
        .evaluate(&params, &labelled, EvaluateOptions::inference())
        .expect("evaluate");
    assert!(out.diagnostics.force_rmse.is_some_and(|r| r > 0.0));
    assert!(out.diagnostics.virial_rmse.is_some_and(|r| r > 0.0));
    assert!(out.diagnostics.max_radial_neighbors > 0);
}
