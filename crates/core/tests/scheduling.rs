//! Scheduling policies reach the same solution
//!
//! Pruning, causality freezing and the in-place discipline only change the
//! order in which blocks are visited. For a causal scheme the converged
//! values do not depend on it.

use hfm_core::{
    Discipline, Freeze, Isotropic, Order2, Problem, Solver, SolverConfig, SolverError, Tolerance,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[ctor::ctor]
fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

const N: usize = 40;

/// Random costs in `[1, 2)`, a seed at each end of the diagonal
fn random_problem(seed: u64) -> Problem {
    let mut rng = StdRng::seed_from_u64(seed);
    let cost: Vec<f32> = (0..N * N).map(|_| rng.random_range(1.0..2.0)).collect();
    let mut problem = Problem::new(&[N, N]);
    problem.add_seed(&[2, 3], 0.0).unwrap();
    problem.add_seed(&[N as i64 - 3, N as i64 - 2], 20.0).unwrap();
    problem.set_cost(&cost, 1.0).unwrap();
    problem
}

fn exact_config() -> SolverConfig {
    let mut config = SolverConfig::isotropic(2);
    config.shape_i = vec![4, 4];
    config.tolerance = Tolerance::exact();
    config.max_rounds = 100_000;
    config
}

fn solve(problem: &Problem, config: SolverConfig) -> Vec<f32> {
    let mut solver = Solver::new(problem, config, Isotropic).unwrap();
    let report = solver.solve().unwrap();
    assert!(report.converged);
    solver.values()
}

#[test]
fn test_freeze_does_not_change_solution() {
    let problem = random_problem(11);
    let plain = solve(&problem, exact_config());

    let mut config = exact_config();
    config.scheduling.freeze = Some(Freeze { delta: 0.5 });
    let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
    let first = solver.step();
    // The block of the late seed waits for the front
    assert!(first.frozen > 0, "{first:?}");
    assert_eq!(first.front, 0.0);
    solver.solve().unwrap();
    assert!(solver.is_converged());

    assert_eq!(solver.values(), plain);
}

/// Largest difference between two solves, relative above 1
fn max_difference(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs() / x.abs().max(1.0))
        .fold(0.0, f32::max)
}

#[test]
fn test_freeze_with_second_order() {
    // Second order updates are not causal: frozen blocks may be revisited
    let problem = random_problem(21);
    let mut config = SolverConfig::isotropic(2);
    config.shape_i = vec![4, 4];
    config.order2 = Some(Order2::default());
    config.max_rounds = 100_000;
    let plain = solve(&problem, config.clone());

    config.scheduling.freeze = Some(Freeze { delta: 0.5 });
    let frozen = solve(&problem, config);
    let diff = max_difference(&plain, &frozen);
    assert!(diff < 1e-3, "max difference {diff}");
}

#[test]
fn test_freeze_with_drift() {
    let mut problem = random_problem(22);
    let mut drift = vec![0.3_f32; N * N];
    drift.extend(std::iter::repeat(-0.2_f32).take(N * N));
    problem.set_drift(drift).unwrap();

    let mut config = SolverConfig::isotropic(2);
    config.shape_i = vec![4, 4];
    config.drift = true;
    config.max_rounds = 100_000;
    let plain = solve(&problem, config.clone());
    assert!(plain.iter().all(|v| v.is_finite()));

    config.scheduling.freeze = Some(Freeze { delta: 0.5 });
    let frozen = solve(&problem, config);
    let diff = max_difference(&plain, &frozen);
    assert!(diff < 1e-3, "max difference {diff}");
}

#[test]
fn test_global_iteration_matches_pruned_list() {
    let problem = random_problem(12);
    let pruned = solve(&problem, exact_config());

    let config = exact_config().global_iteration();
    let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
    let size_o = solver.grid().size_o();
    let report = solver.step();
    assert_eq!(report.launched, size_o);
    assert!(report.processed < size_o);
    solver.solve().unwrap();

    assert_eq!(solver.values(), pruned);
}

#[test]
fn test_in_place_matches_strict() {
    let problem = random_problem(13);
    let strict = solve(&problem, exact_config());

    let mut config = exact_config();
    config.scheduling.discipline = Discipline::InPlace;
    config.niter_i = 2;
    let in_place = solve(&problem, config);

    for (n, (a, b)) in strict.iter().zip(&in_place).enumerate() {
        assert!((a - b).abs() <= 1e-5 * a.abs().max(1.0), "node {n}: {a} vs {b}");
    }
}

#[test]
fn test_values_decrease_round_by_round() {
    let problem = random_problem(14);
    let mut config = exact_config();
    config.niter_i = 2;
    let mut solver = Solver::new(&problem, config, Isotropic).unwrap();

    let mut previous = solver.values();
    let mut rounds = 0;
    while !solver.is_converged() {
        solver.step();
        rounds += 1;
        let current = solver.values();
        for (n, (&new, &old)) in current.iter().zip(&previous).enumerate() {
            // Rounding may move a value by an ulp
            assert!(
                new <= old + 1e-6 * old.abs().max(1.0),
                "round {rounds}, node {n}: {old} -> {new}"
            );
        }
        previous = current;
    }
    assert!(rounds > 1);
}

#[test]
fn test_inner_sweeps_reduce_rounds() {
    let problem = random_problem(15);
    let rounds = |niter_i: usize| {
        let mut config = exact_config();
        config.niter_i = niter_i;
        let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
        solver.solve().unwrap().rounds
    };
    assert!(rounds(4) < rounds(1));
}

#[test]
fn test_round_cap() {
    let problem = random_problem(16);
    let mut config = exact_config();
    config.max_rounds = 3;

    let mut solver = Solver::new(&problem, config.clone(), Isotropic).unwrap();
    let report = solver.solve().unwrap();
    assert_eq!(report.rounds, 3);
    assert!(!report.converged);

    config.raise_on_non_convergence = true;
    let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
    assert!(matches!(
        solver.solve(),
        Err(SolverError::NonConvergence { rounds: 3, .. })
    ));
}

#[test]
fn test_solve_resumes_after_steps() {
    let problem = random_problem(17);
    let expected = solve(&problem, exact_config());

    let mut solver = Solver::new(&problem, exact_config(), Isotropic).unwrap();
    for _ in 0..5 {
        solver.step();
    }
    assert_eq!(solver.rounds(), 5);
    let report = solver.solve().unwrap();
    assert!(report.converged);
    assert_eq!(solver.rounds(), 5 + report.rounds);
    assert_eq!(solver.values(), expected);
}
