//! Unit tests for the worker kernel: command dispatch, Brownian motion
//! statistics, the energy budget, ghost forces, and migration.

#[cfg(test)]
mod units {
    use crate::constants::{KB, NM, NS, R_PARTICLE};
    use crate::forcefield::{scale_force_table, PairPotential};
    use crate::master::init;
    use crate::state::{Configuration, Parameters};
    use crate::vector::Vec3;
    use crate::wire::{ReadMessage, WriteMessage};
    use crate::worker::cell::{worker_thread, Reply, SystemParams, Worker};
    use crate::worker::comm::build_mesh;
    use crate::worker::Request;
    use std::sync::mpsc;
    use std::sync::Arc;

    /// Runs one command against a worker and returns the reply as a
    /// reading message.
    fn command(worker: &mut Worker, msg: &WriteMessage) -> ReadMessage {
        match worker.handle(msg.as_bytes()).expect("command failed") {
            Reply::Message(reply) | Reply::Exit(reply) => ReadMessage::new(reply.into_bytes()),
        }
    }

    fn single_worker() -> Worker {
        let links = build_mesh(1).pop().unwrap();
        Worker::new(0, 1, links)
    }

    /// Initializes a lone worker from the master's real message builders.
    fn initialized_worker(parameters: &Parameters, configuration: &Configuration) -> Worker {
        let mut worker = single_worker();
        command(&mut worker, &init::thread_name_message(0));
        command(&mut worker, &init::system_message(parameters));
        command(&mut worker, &init::random_message(0x5eed));
        let plan = init::plan_cells(parameters, configuration, [1, 1, 1]).unwrap();
        command(&mut worker, &init::cell_state_message(&plan.cells[0]));
        command(&mut worker, &init::cell_comm_message(&plan, 0));
        command(&mut worker, &init::cell_junctions_message(&plan, 0));
        worker
    }

    fn simulate(worker: &mut Worker, cycles: i64) {
        let mut msg = WriteMessage::command("master_simulate_cycles");
        msg.write_int(cycles);
        command(worker, &msg);
    }

    fn collect_positions(worker: &mut Worker) -> (Vec<Vec3>, Vec<i64>) {
        let mut reply = command(
            worker,
            &WriteMessage::command("collect_thread_positions_and_tags"),
        );
        let positions = reply.read_vec_array().unwrap();
        let tags = reply.read_int_array().unwrap();
        reply.require_end().unwrap();
        (positions, tags)
    }

    #[test]
    fn test_poll_size_and_exit() {
        let mut worker = single_worker();
        let mut reply = command(&mut worker, &WriteMessage::command("poll_size"));
        assert_eq!(reply.read_uint().unwrap(), 1);
        reply.require_end().unwrap();

        match worker.handle(WriteMessage::command("exit").as_bytes()) {
            Ok(Reply::Exit(reply)) => assert!(reply.is_empty()),
            other => panic!("exit must produce an exit reply, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        let mut worker = single_worker();
        let msg = WriteMessage::command("transmogrify");
        assert!(worker.handle(msg.as_bytes()).is_err());
    }

    #[test]
    fn test_zero_force_zero_noise_particle_returns_to_itself() {
        // At zero temperature the noise amplitude and the (kT-scaled)
        // potential both vanish, so a particle must stay exactly where it
        // started, wherever it sits in the box.
        let mut parameters = Parameters::default();
        parameters.temperature = 0.0;
        let start = Vec3::new(1e-8, 9.9e-7, 5e-7);
        let configuration = Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: vec![start],
        };
        let mut worker = initialized_worker(&parameters, &configuration);

        simulate(&mut worker, 250);
        let (positions, tags) = collect_positions(&mut worker);
        assert_eq!(tags, vec![0]);
        assert_eq!(positions, vec![start]);
    }

    #[test]
    fn test_zero_potential_diffusion_statistics() {
        // A free particle performs a random walk with per-axis step
        // variance 2·D·dt. The sampled variance over 900 step increments
        // (2700 axis samples) must land close to the theory value.
        let parameters = Parameters::default();
        let start = Vec3::splat(5e-7);
        let configuration = Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: vec![start],
        };
        let mut worker = initialized_worker(&parameters, &configuration);
        let box_size = parameters.box_vec();

        let n_steps = 900;
        let mut previous = start;
        let mut sum_sq = 0.0;
        let mut samples = 0usize;
        for _ in 0..n_steps {
            simulate(&mut worker, 1);
            let (positions, _) = collect_positions(&mut worker);
            let step = (positions[0] - previous).min_image(&box_size);
            for a in 0..3 {
                sum_sq += step.axis(a) * step.axis(a);
                samples += 1;
            }
            previous = positions[0];
        }

        let expected = 2.0 * parameters.diffusion() * parameters.time_step;
        let measured = sum_sq / samples as f64;
        let ratio = measured / expected;
        assert!(
            (0.85..1.15).contains(&ratio),
            "step variance off: measured {measured:.3e}, expected {expected:.3e}"
        );

        // And over a longer window: after 100 more steps the particle
        // stays within a few standard deviations of where it was.
        let (before, _) = collect_positions(&mut worker);
        simulate(&mut worker, 100);
        let (after, _) = collect_positions(&mut worker);
        let sigma = (2.0 * parameters.diffusion() * 100.0 * parameters.time_step).sqrt();
        let displacement = (after[0] - before[0]).min_image(&box_size);
        for a in 0..3 {
            assert!(
                displacement.axis(a).abs() < 4.0 * sigma,
                "axis {a} drifted {:.3e} with sigma {sigma:.3e}",
                displacement.axis(a)
            );
        }
    }

    #[test]
    fn test_deterministic_given_seed() {
        let parameters = Parameters::default();
        let configuration = Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: vec![Vec3::splat(4e-7), Vec3::splat(6e-7)],
        };
        let run = || {
            let mut worker = initialized_worker(&parameters, &configuration);
            simulate(&mut worker, 50);
            collect_positions(&mut worker).0
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_repulsive_particles_push_apart() {
        // Two particles at 1 nm surface separation feel a ~20 kT barrier;
        // the deterministic drift dominates the noise there, so the
        // separation must grow.
        let mut parameters = Parameters::default();
        parameters.pair_potential = PairPotential::Repulsive;
        let box_size = parameters.box_vec();
        let gap = 2.0 * R_PARTICLE + 1.0 * NM;
        let a = Vec3::new(5e-7 - gap / 2.0, 5e-7, 5e-7);
        let b = Vec3::new(5e-7 + gap / 2.0, 5e-7, 5e-7);
        let configuration = Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: vec![a, b],
        };
        let mut worker = initialized_worker(&parameters, &configuration);

        // over 2000 steps the repulsive drift (several nm) dominates the
        // relative diffusion (about 1.7 nm standard deviation)
        simulate(&mut worker, 2000);
        let (positions, tags) = collect_positions(&mut worker);
        assert_eq!(tags, vec![0, 1]);
        let separation = (positions[1] - positions[0]).min_image(&box_size).norm();
        assert!(
            separation > gap + 1.0 * NM,
            "separation {separation:.3e} did not grow from {gap:.3e}"
        );
        assert!(
            separation < gap + 30.0 * NM,
            "separation {separation:.3e} grew implausibly"
        );
    }

    #[test]
    fn test_energy_budget_bounds_accepted_substeps() {
        // With a steep repulsion and a tight budget, raw steps would blow
        // far past dU_max; the integrator must subdivide until every
        // accepted sub-step fits.
        let mut parameters = Parameters::default();
        parameters.pair_potential = PairPotential::Repulsive;
        parameters.du_max = 0.1;
        parameters.time_step = 10.0 * NS;
        let gap = 2.0 * R_PARTICLE + 1.0 * NM;
        let configuration = Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: vec![
                Vec3::new(5e-7 - gap / 2.0, 5e-7, 5e-7),
                Vec3::new(5e-7 + gap / 2.0, 5e-7, 5e-7),
            ],
        };
        let mut worker = initialized_worker(&parameters, &configuration);

        simulate(&mut worker, 25);
        let budget = parameters.du_max * parameters.kt();
        assert!(
            worker.max_accepted_du > 0.0,
            "instrumentation saw no accepted sub-steps"
        );
        // the broadcast budget passed through the 10-digit double encoding
        assert!(
            worker.max_accepted_du <= budget * (1.0 + 1e-9),
            "accepted |dU| {:.3e} J exceeds budget {budget:.3e} J",
            worker.max_accepted_du
        );
    }

    #[test]
    fn test_forces_respect_periodic_images() {
        // Two particles interacting through the box face: the force must
        // push them apart through the boundary, not across the box.
        let kt = KB * 300.0;
        let cutoff = 2.0 * R_PARTICLE + 20.0 * NM;
        let pot = PairPotential::Repulsive;
        let mut potential = pot.make_potential_table(0.0, cutoff * 1.05, 1000);
        potential.scale(kt);
        let mut force = pot.make_force_table(0.0, cutoff * 1.05, 1000);
        force.scale(kt);
        let force = scale_force_table(force);

        let sys = SystemParams {
            box_size: Vec3::splat(1e-6),
            temperature: 300.0,
            dt: 0.1 * NS,
            du_max: 0.5 * kt,
            fric_gamma: 1.14e-9,
            force_update: 1,
            r_pair_cutoff: cutoff,
            pair_potential: potential,
            pair_force: force,
            r_neighbor: cutoff + 30.0 * NM,
        };

        let mut worker = single_worker();
        worker.system = Some(Arc::new(sys.clone()));
        worker.min_extent = Vec3::zero();
        worker.max_extent = Vec3::splat(1e-6);
        // separation through the wrap: 145 nm, inside the cutoff
        let half = (2.0 * R_PARTICLE + 10.0 * NM) / 2.0;
        worker.positions = vec![
            Vec3::new(1e-6 - half, 5e-7, 5e-7),
            Vec3::new(half, 5e-7, 5e-7),
        ];
        worker.tags = vec![0, 1];
        worker.rebuild_neighbor_lists(&sys);
        assert_eq!(worker.internal_pairs, vec![(0, 1)]);

        let forces = worker.eval_forces(&sys);
        // particle 0 sits below the top face; repulsion through the wrap
        // pushes it downward (-x), and particle 1 upward (+x)
        assert!(forces[0].x < 0.0, "force {:?} not through the wrap", forces[0]);
        assert!(forces[1].x > 0.0);
        assert!((forces[0].x + forces[1].x).abs() < forces[1].x.abs() * 1e-9);

        let r = 2.0 * R_PARTICLE + 10.0 * NM;
        let expected = kt * pot.force(r);
        let measured = forces[1].x;
        let relative = (measured - expected).abs() / expected;
        assert!(
            relative < 1e-2,
            "wrapped force {measured:.4e} vs analytic {expected:.4e}"
        );
    }

    #[test]
    fn test_migration_preserves_tags_across_workers() {
        // Two ranks split the box along x. Rank 0 starts with a particle
        // that actually lies in rank 1's extent; the first collective
        // exchange must hand it over, tag intact.
        let parameters = Parameters::default();
        let configuration = Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: vec![
                Vec3::new(2.5e-7, 5e-7, 5e-7),
                Vec3::new(7.5e-7, 5e-7, 5e-7),
            ],
        };
        let plan = init::plan_cells(&parameters, &configuration, [2, 1, 1]).unwrap();

        let mut mailboxes = Vec::new();
        let mut threads = Vec::new();
        for links in build_mesh(2) {
            let rank = links.rank;
            let (tx, rx) = mpsc::channel::<Request>();
            mailboxes.push(tx);
            threads.push(std::thread::spawn(move || {
                worker_thread(rank, 2, rx, links)
            }));
        }

        let send = |rank: usize, msg: &WriteMessage| -> mpsc::Receiver<Vec<u8>> {
            let (tx, rx) = mpsc::channel();
            mailboxes[rank]
                .send(Request {
                    bytes: msg.as_bytes().to_vec(),
                    reply: tx,
                })
                .unwrap();
            rx
        };
        let call = |rank: usize, msg: &WriteMessage| -> ReadMessage {
            ReadMessage::new(send(rank, msg).recv().unwrap())
        };

        for rank in 0..2 {
            call(rank, &init::thread_name_message(rank));
            call(rank, &init::system_message(&parameters));
            call(rank, &init::random_message(rank as u32 + 7));
        }
        // swap the two cells' particle payloads so each rank starts with
        // the other cell's particle
        let mut swapped = plan.cells.clone();
        swapped[0].positions = plan.cells[1].positions.clone();
        swapped[0].tags = plan.cells[1].tags.clone();
        swapped[1].positions = plan.cells[0].positions.clone();
        swapped[1].tags = plan.cells[0].tags.clone();
        for rank in 0..2 {
            call(rank, &init::cell_state_message(&swapped[rank]));
            call(rank, &init::cell_comm_message(&plan, rank));
            call(rank, &init::cell_junctions_message(&plan, rank));
        }

        // the exchange is collective: post to both ranks, then await both
        let update = WriteMessage::command("thread_update_neighbors");
        let pending: Vec<_> = (0..2).map(|rank| send(rank, &update)).collect();
        for rx in pending {
            ReadMessage::new(rx.recv().unwrap()).require_end().unwrap();
        }

        for rank in 0..2 {
            let mut reply = call(rank, &WriteMessage::command("collect_thread_positions_and_tags"));
            let positions = reply.read_vec_array().unwrap();
            let tags = reply.read_int_array().unwrap();
            reply.require_end().unwrap();
            assert_eq!(positions.len(), 1, "rank {rank} owns one particle");
            assert_eq!(
                tags,
                vec![plan.cells[rank].tags[0]],
                "rank {rank} received the migrant with its original tag"
            );
            assert!(plan.cells[rank].extent.contains(&positions[0]));
        }

        for rank in 0..2 {
            call(rank, &WriteMessage::command("exit"));
        }
        drop(mailboxes);
        for handle in threads {
            handle.join().unwrap();
        }
    }

    #[test]
    fn test_ghost_exchange_builds_external_neighbors() {
        // Two particles on either side of the rank boundary, within the
        // neighbor range: after an exchange both ranks must hold one ghost
        // and one external pair.
        let mut parameters = Parameters::default();
        parameters.pair_potential = PairPotential::Repulsive;
        let near = 60.0 * NM;
        let configuration = Configuration {
            time: 0.0,
            wall_time: 0.0,
            positions: vec![
                Vec3::new(5e-7 - near, 5e-7, 5e-7),
                Vec3::new(5e-7 + near, 5e-7, 5e-7),
            ],
        };
        let plan = init::plan_cells(&parameters, &configuration, [2, 1, 1]).unwrap();

        let mut mailboxes = Vec::new();
        let mut threads = Vec::new();
        for links in build_mesh(2) {
            let rank = links.rank;
            let (tx, rx) = mpsc::channel::<Request>();
            mailboxes.push(tx);
            threads.push(std::thread::spawn(move || {
                worker_thread(rank, 2, rx, links)
            }));
        }
        let send = |rank: usize, msg: &WriteMessage| -> mpsc::Receiver<Vec<u8>> {
            let (tx, rx) = mpsc::channel();
            mailboxes[rank]
                .send(Request {
                    bytes: msg.as_bytes().to_vec(),
                    reply: tx,
                })
                .unwrap();
            rx
        };
        let call = |rank: usize, msg: &WriteMessage| -> ReadMessage {
            ReadMessage::new(send(rank, msg).recv().unwrap())
        };

        for rank in 0..2 {
            call(rank, &init::thread_name_message(rank));
            call(rank, &init::system_message(&parameters));
            call(rank, &init::random_message(11 + rank as u32));
            call(rank, &init::cell_state_message(&plan.cells[rank]));
            call(rank, &init::cell_comm_message(&plan, rank));
            call(rank, &init::cell_junctions_message(&plan, rank));
        }

        let update = WriteMessage::command("thread_update_neighbors");
        let pending: Vec<_> = (0..2).map(|rank| send(rank, &update)).collect();
        for rx in pending {
            ReadMessage::new(rx.recv().unwrap()).require_end().unwrap();
        }

        for rank in 0..2 {
            let mut reply = call(rank, &WriteMessage::command("collect_thread_state"));
            let positions = reply.read_vec_array().unwrap();
            let tags = reply.read_int_array().unwrap();
            let internal = reply.read_int_array().unwrap();
            let external = reply.read_int_array().unwrap();
            reply.require_end().unwrap();

            assert_eq!(tags.len(), 1);
            assert!(
                positions.len() >= 2,
                "rank {rank} holds its particle plus at least one ghost"
            );
            assert!(internal.is_empty());
            assert_eq!(
                external,
                vec![0, 1],
                "rank {rank} pairs its particle with the first ghost"
            );
        }

        for rank in 0..2 {
            call(rank, &WriteMessage::command("exit"));
        }
        drop(mailboxes);
        for handle in threads {
            handle.join().unwrap();
        }
    }
}
