//! End-to-end tests: the master side drives the real `bd-worker` binary
//! over the FIFO command channel, exactly as the front-end does.

use brownian_lib::channel::WorkerChannel;
use brownian_lib::constants::{NM, R_PARTICLE};
use brownian_lib::forcefield::PairPotential;
use brownian_lib::master::Simulator;
use brownian_lib::state::{Configuration, Parameters};
use brownian_lib::vector::Vec3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;

fn worker_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_bd-worker"))
}

fn spawn(nproc: u32) -> WorkerChannel {
    WorkerChannel::spawn(&worker_binary(), nproc).expect("failed to spawn bd-worker")
}

fn random_configuration(n: usize, box_length: f64, seed: u64) -> Configuration {
    let mut rng = StdRng::seed_from_u64(seed);
    let positions = (0..n)
        .map(|_| {
            Vec3::new(
                rng.random::<f64>() * box_length,
                rng.random::<f64>() * box_length,
                rng.random::<f64>() * box_length,
            )
        })
        .collect();
    Configuration {
        time: 0.0,
        wall_time: 0.0,
        positions,
    }
}

#[test]
fn test_channel_reports_worker_count() {
    let mut channel = spawn(4);
    assert_eq!(channel.size().unwrap(), 4);
    channel.shutdown();
}

#[test]
fn test_single_worker_run() {
    let parameters = Parameters::default();
    let configuration = Configuration::cubic_lattice(27, &parameters.box_vec());

    let mut sim = Simulator::create(spawn(1), parameters.clone(), &configuration, None, Some(42))
        .expect("initialization failed");

    // chunking: 100 cycles in bursts of at most 40
    sim.simulate(100, 40).unwrap();
    assert!((sim.time() - 100.0 * parameters.time_step).abs() < 1e-18);

    let snapshot = sim.configuration().unwrap();
    assert_eq!(snapshot.positions.len(), 27);
    snapshot.validate(&parameters.box_vec()).unwrap();

    // free diffusion barely moves a particle relative to the lattice pitch
    for (before, after) in configuration.positions.iter().zip(&snapshot.positions) {
        let moved = (after - before).min_image(&parameters.box_vec()).norm();
        assert!(moved < 50.0 * NM, "particle jumped {moved:.3e} m");
    }
    sim.shutdown();
}

#[test]
fn test_multi_worker_tags_preserved() {
    // 2x2x2 decomposition with particles placed uniformly at random, so
    // some sit right against cell boundaries and migrate as they diffuse.
    let parameters = Parameters::default();
    let configuration = random_configuration(216, parameters.box_size[0], 7);

    let mut sim = Simulator::create(spawn(8), parameters.clone(), &configuration, None, Some(1234))
        .expect("initialization failed");

    for checkpoint in 0..3 {
        sim.simulate(60, 25).unwrap();
        // positions() verifies the tag multiset and box bounds internally
        let positions = sim.positions().unwrap();
        assert_eq!(positions.len(), 216, "checkpoint {checkpoint}");
        for (i, a) in positions.iter().enumerate() {
            for b in &positions[i + 1..] {
                assert!(
                    (a - b).min_image(&parameters.box_vec()).norm() > 0.0,
                    "checkpoint {checkpoint}: coincident particles"
                );
            }
        }
    }
    sim.shutdown();
}

#[test]
fn test_multi_worker_repulsive_lattice() {
    // A 6^3 lattice in a micron box leaves ~31 nm surface gaps, inside the
    // repulsive tail; the run must keep every pair separated.
    let mut parameters = Parameters::default();
    parameters.pair_potential = PairPotential::Repulsive;
    let configuration = Configuration::cubic_lattice(216, &parameters.box_vec());

    let mut sim = Simulator::create(spawn(8), parameters.clone(), &configuration, None, Some(99))
        .expect("initialization failed");
    sim.simulate(50, 50).unwrap();

    let positions = sim.positions().unwrap();
    assert_eq!(positions.len(), 216);
    let mut min_separation = f64::INFINITY;
    for (i, a) in positions.iter().enumerate() {
        for b in &positions[i + 1..] {
            min_separation = min_separation.min((a - b).min_image(&parameters.box_vec()).norm());
        }
    }
    assert!(
        min_separation > 2.0 * R_PARTICLE - 20.0 * NM,
        "particles collapsed to {min_separation:.3e} m"
    );
    sim.shutdown();
}

#[test]
fn test_thread_state_dump() {
    let parameters = Parameters::default();
    let configuration = random_configuration(32, parameters.box_size[0], 21);

    let mut sim = Simulator::create(spawn(2), parameters.clone(), &configuration, None, Some(5))
        .expect("initialization failed");
    sim.simulate(10, 10).unwrap();
    sim.update_neighbors().unwrap();

    let state = sim.state().unwrap();
    assert_eq!(state.threads.len(), 2);
    assert!((state.time - 10.0 * parameters.time_step).abs() < 1e-18);

    let mut all_tags: Vec<i64> = state
        .threads
        .iter()
        .flat_map(|t| t.tags.iter().copied())
        .collect();
    all_tags.sort_unstable();
    assert_eq!(all_tags, (0..32).collect::<Vec<i64>>());

    for thread in &state.threads {
        // positions cover owned particles plus ghosts
        assert!(thread.positions.len() >= thread.tags.len());
        let n_known = thread.positions.len() as i64;
        let n_owned = thread.tags.len() as i64;
        for pair in &thread.internal_neighbors {
            assert!(pair[0] < n_owned && pair[1] < n_owned);
        }
        for pair in &thread.external_neighbors {
            assert!(pair[0] < n_owned);
            assert!(pair[1] >= n_owned && pair[1] < n_known);
        }
    }
    sim.shutdown();
}

#[test]
fn test_infeasible_worker_count_fails_cleanly() {
    let parameters = Parameters::default();
    let configuration = Configuration::cubic_lattice(8, &parameters.box_vec());

    // 11 workers cannot be arranged as a division triple
    let result = Simulator::create(spawn(11), parameters, &configuration, None, Some(1));
    assert!(result.is_err());
}
