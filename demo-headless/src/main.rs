use std::process::ExitCode;

use clap::Parser;
use hfm_core::{
    Factorization, Freeze, Isotropic, MultiPrecision, Order2, Problem, RoundReport, Solver,
    SolverConfig,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::EnvFilter;

/// Distance map on a square grid with random obstacles and costs
#[derive(Parser, Debug)]
#[command(name = "hfm-demo")]
#[command(about = "Block-parallel eikonal solver demo", long_about = None)]
struct Args {
    /// Grid side in nodes
    #[arg(short, long, default_value_t = 256)]
    size: usize,

    /// Block side in nodes
    #[arg(short, long, default_value_t = 8)]
    block: usize,

    /// Local sweeps per block visit
    #[arg(long, default_value_t = 1)]
    niter: usize,

    /// Fraction of nodes turned into obstacles (0 = none)
    #[arg(short, long, default_value_t = 0.0)]
    obstacles: f32,

    /// Relative cost variation, costs are drawn in [1, 1 + variation)
    #[arg(short, long, default_value_t = 0.0)]
    cost_variation: f32,

    /// Causality freezing margin (off when absent)
    #[arg(short, long)]
    freeze: Option<f32>,

    /// Launch every block each round instead of the active list
    #[arg(long)]
    global: bool,

    /// Second order differences
    #[arg(long)]
    order2: bool,

    /// Factor out the distance to the source within this radius
    #[arg(long)]
    factor_radius: Option<f32>,

    /// Multi-precision quantum (off when absent)
    #[arg(long)]
    multiprecision: Option<f32>,

    /// Random seed
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Print one line per round every this many rounds (0 = never)
    #[arg(short, long, default_value_t = 0)]
    report_interval: usize,

    /// Run the GPU backend instead of the CPU solver
    #[cfg(feature = "gpu")]
    #[arg(long)]
    gpu: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    println!("=== Eikonal Solver Demo ===\n");

    let (problem, source) = build_problem(&args);
    let config = build_config(&args, source);
    println!(
        "Grid {}x{}, blocks {}x{}, obstacles {:.1}%, cost variation {:.2}",
        args.size,
        args.size,
        args.block,
        args.block,
        args.obstacles * 100.0,
        args.cost_variation
    );

    #[cfg(feature = "gpu")]
    if args.gpu {
        if let Some(code) = run_gpu(&problem, config.clone(), &args) {
            return code;
        }
    }

    let mut solver = match Solver::new(&problem, config, Isotropic) {
        Ok(solver) => solver,
        Err(e) => {
            eprintln!("Invalid setup: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("\nRound   | Launched | Processed | Changed | Frozen | Active | Front");
    println!("--------|----------|-----------|---------|--------|--------|---------");
    let mut last = None;
    while !solver.is_converged() && solver.rounds() < solver.config().max_rounds {
        let report = solver.step();
        if args.report_interval > 0 && report.round % args.report_interval == 0 {
            print_round(&report);
        }
        last = Some(report);
    }
    if let Some(report) = last {
        print_round(&report);
    }

    let report = match solver.solve() {
        Ok(report) => report,
        Err(e) => {
            eprintln!("Solve failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("\n=== Solve Complete ===");
    println!("Rounds: {}", solver.rounds());
    println!("Converged: {}", report.converged);

    let exact = args.obstacles == 0.0 && args.cost_variation == 0.0;
    summarize(&problem, &solver.values(), source, exact);
    ExitCode::SUCCESS
}

/// Square domain with the source at the center
fn build_problem(args: &Args) -> (Problem, [i64; 2]) {
    let n = args.size;
    let center = (n / 2) as i64;
    let source = [center, center];
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut problem = Problem::new(&[n, n]);

    if args.cost_variation > 0.0 {
        let cost: Vec<f32> = (0..n * n)
            .map(|_| 1.0 + args.cost_variation * rng.random::<f32>())
            .collect();
        if let Err(e) = problem.set_cost(&cost, 1.0) {
            eprintln!("Cost ignored: {e}");
        }
    }
    if args.obstacles > 0.0 {
        let source_index = center as usize * n + center as usize;
        let walls: Vec<bool> = (0..n * n)
            .map(|i| i != source_index && rng.random::<f32>() < args.obstacles)
            .collect();
        println!("Placed {} obstacles", walls.iter().filter(|&&w| w).count());
        if let Err(e) = problem.set_walls(walls) {
            eprintln!("Obstacles ignored: {e}");
        }
    }
    if let Err(e) = problem.add_seed(&source, 0.0) {
        eprintln!("Source ignored: {e}");
    }
    (problem, source)
}

fn build_config(args: &Args, source: [i64; 2]) -> SolverConfig {
    let mut config = SolverConfig::isotropic(2);
    config.shape_i = vec![args.block, args.block];
    config.niter_i = args.niter;
    config.walls = args.obstacles > 0.0;
    config.max_rounds = 100_000;
    if args.global {
        config = config.global_iteration();
    } else if let Some(delta) = args.freeze {
        config.scheduling.freeze = Some(Freeze { delta });
    }
    if args.order2 {
        config.order2 = Some(Order2::default());
    }
    if let Some(radius) = args.factor_radius {
        let origin = source.iter().map(|&c| c as f32).collect();
        config.factorization = Some(Factorization::isotropic(origin, 1.0, radius));
    }
    if let Some(step) = args.multiprecision {
        config.multiprecision = Some(MultiPrecision::new(step));
    }
    config
}

fn print_round(report: &RoundReport) {
    println!(
        "{:7} | {:8} | {:9} | {:7} | {:6} | {:6} | {:8.2}",
        report.round,
        report.launched,
        report.processed,
        report.changed,
        report.frozen,
        report.active,
        report.front
    );
}

/// Reach statistics, and the error against the Euclidean distance when exact
fn summarize(problem: &Problem, values: &[f32], source: [i64; 2], compare: bool) {
    let n = problem.shape()[1];
    let reached: Vec<f32> = values.iter().copied().filter(|v| v.is_finite()).collect();
    let max = reached.iter().copied().fold(0.0_f32, f32::max);
    println!("Reached nodes: {} of {}", reached.len(), values.len());
    println!("Largest arrival time: {:.3}", max);

    if !compare {
        return;
    }
    let mut worst = 0.0_f32;
    let mut total = 0.0_f64;
    for (idx, &u) in values.iter().enumerate() {
        let di = (idx / n) as f32 - source[0] as f32;
        let dj = (idx % n) as f32 - source[1] as f32;
        let err = (u - di.hypot(dj)).abs();
        worst = worst.max(err);
        total += f64::from(err);
    }
    println!("Euclidean error: max {:.4}, mean {:.4}", worst, total / values.len() as f64);
}

/// Solve on the GPU, `None` when the CPU should run instead
///
/// That is the case without a usable device, or when the configuration
/// needs a capability the GPU kernel lacks.
#[cfg(feature = "gpu")]
fn run_gpu(problem: &Problem, config: SolverConfig, args: &Args) -> Option<ExitCode> {
    use hfm_core::{GpuContext, GpuInitResult, GpuSolver};

    let ctx = match GpuContext::new() {
        GpuInitResult::Success(ctx) => ctx,
        GpuInitResult::NoGpuFound => {
            tracing::warn!("No GPU adapter found, falling back to the CPU solver");
            return None;
        }
        GpuInitResult::InitFailed {
            adapter_name,
            error,
        } => {
            tracing::warn!(
                "GPU {} failed to initialize ({}), falling back to the CPU solver",
                adapter_name,
                error
            );
            return None;
        }
    };
    println!("GPU: {}", ctx.adapter_name());

    let mut solver = match GpuSolver::new(ctx, problem, config, &Isotropic) {
        Ok(solver) => solver,
        Err(e) => {
            if let Some(what) = unsupported_on_gpu(&e) {
                tracing::warn!(
                    "GPU backend does not support {}, falling back to the CPU solver",
                    what
                );
                return None;
            }
            eprintln!("GPU setup failed: {e}");
            return Some(ExitCode::FAILURE);
        }
    };

    let source = [(args.size / 2) as i64; 2];
    let result = solver.solve().and_then(|report| {
        println!("\nRounds: {}, converged: {}", report.rounds, report.converged);
        solver.values()
    });
    Some(match result {
        Ok(values) => {
            summarize(problem, &values, source, args.cost_variation == 0.0);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("GPU solve failed: {e}");
            ExitCode::FAILURE
        }
    })
}

/// Capability the GPU kernel lacks, when that is why setup failed
#[cfg(feature = "gpu")]
fn unsupported_on_gpu(error: &hfm_core::SolverError) -> Option<&'static str> {
    use hfm_core::{ConfigError, SolverError};

    match error {
        SolverError::Config(ConfigError::Unsupported(what)) => Some(*what),
        _ => None,
    }
}
