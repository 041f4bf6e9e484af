//! Upwind flow of converged solutions

use approx::assert_relative_eq;
use hfm_core::grid::INVALID_INDEX;
use hfm_core::{FlowExports, Isotropic, Problem, Solver, SolverConfig, Stencil};

#[ctor::ctor]
fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

fn point_source(n: usize, c: i64) -> Solver<Isotropic> {
    let mut problem = Problem::new(&[n, n]);
    problem.add_seed(&[c, c], 0.0).unwrap();
    let mut config = SolverConfig::isotropic(2);
    config.shape_i = vec![4, 4];
    config.flow = FlowExports::all();
    let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
    assert!(solver.solve().unwrap().converged);
    solver
}

#[test]
fn test_line_flow_points_back_to_seed() {
    let mut problem = Problem::new(&[5]);
    problem.add_seed(&[0], 0.0).unwrap();
    let mut config = SolverConfig::isotropic(1);
    config.shape_i = vec![2];
    let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
    solver.solve().unwrap();

    let flow = solver.extract_flow(FlowExports::all());
    assert_eq!(flow.nact(), 1);
    assert_eq!(flow.weights(), Some(vec![0.0, 1.0, 1.0, 1.0, 1.0]));
    assert_eq!(flow.vector(), Some(vec![0.0, -1.0, -1.0, -1.0, -1.0]));
    assert_eq!(flow.geodesic_flow(), Some(vec![0.0, 1.0, 1.0, 1.0, 1.0]));

    let offsets = flow.offsets().unwrap();
    let indices = flow.indices().unwrap();
    assert_eq!(indices[0], INVALID_INDEX);
    for n in 1..5 {
        assert_eq!(offsets[n], -1);
        assert_eq!(indices[n], n - 1);
    }
    // Values are not touched by the extraction pass
    assert_eq!(solver.values(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_weightsum_adds_weights() {
    let n = 16_usize;
    let solver = point_source(n, 8);
    let flow = solver.flow();
    let weights = flow.weights().unwrap();
    let weightsum = flow.weightsum().unwrap();
    let size = n * n;

    for node in 0..size {
        let total: f32 = (0..flow.nact()).map(|k| weights[node + size * k]).sum();
        assert_relative_eq!(weightsum[node], total, max_relative = 1e-6);
        if node == 8 * n + 8 {
            assert_eq!(weightsum[node], 0.0);
        } else {
            assert!(weightsum[node] > 0.0, "node {node}");
        }
    }
}

#[test]
fn test_geodesic_flow_radial_on_axes() {
    let n = 16_usize;
    let solver = point_source(n, 8);
    let geodesic = solver.flow().geodesic_flow().unwrap();
    let size = n * n;

    // Node (8, 12): straight along axis 1 away from the seed
    let node = 8 * n + 12;
    assert_eq!(geodesic[node], 0.0);
    assert_eq!(geodesic[node + size], 1.0);
    // Node (3, 8): along axis 0 toward smaller rows
    let node = 3 * n + 8;
    assert_eq!(geodesic[node], -1.0);
    assert_eq!(geodesic[node + size], 0.0);
    // Off-axis nodes point into the quadrant away from the seed
    let node = 12 * n + 13;
    assert!(geodesic[node] > 0.0 && geodesic[node + size] > 0.0);
    let norm = geodesic[node].hypot(geodesic[node + size]);
    assert_relative_eq!(norm, 1.0, max_relative = 1e-5);
}

#[test]
fn test_flow_follows_winning_copy() {
    fn two_speeds(_: &[f32], _: &[i64], s: &mut Stencil) {
        s.set(0, 1.0, &[1]);
        s.set(1, 4.0, &[1]);
        s.mix_is_min = true;
    }
    let mut problem = Problem::new(&[4]);
    problem.add_seed(&[3], 0.0).unwrap();
    let mut config = SolverConfig::isotropic(1);
    config.shape_i = vec![2];
    config.nmix = 2;
    let mut solver = Solver::new(&problem, config, two_speeds).unwrap();
    solver.solve().unwrap();

    let flow = solver.extract_flow(FlowExports::all());
    // The heavier copy wins: weight 4 * (u - v) = 4 * 0.5
    assert_eq!(flow.weightsum(), Some(vec![2.0, 2.0, 2.0, 0.0]));
    assert_eq!(&flow.offsets().unwrap()[..3], &[1, 1, 1]);
}

#[test]
fn test_unrequested_exports_absent() {
    let mut problem = Problem::new(&[4]);
    problem.add_seed(&[0], 0.0).unwrap();
    let mut config = SolverConfig::isotropic(1);
    config.shape_i = vec![2];
    let mut solver = Solver::new(&problem, config, Isotropic).unwrap();
    solver.solve().unwrap();

    let flow = solver.flow();
    assert!(!flow.exports().any());
    assert!(flow.weights().is_none());
    assert!(flow.geodesic_flow().is_none());
}
