use anyhow::Context;
use clap::Parser;
use ringforge::device;
use ringforge::distributed::env::EnvSnapshot;
use ringforge::harness::{Harness, HarnessConfig};
use ringforge::logging::init_logging_default;
use ringforge::RingForgeError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "ringforge-check", version)]
#[command(about = "Verify flash attention and ring attention numerics", long_about = None)]
struct Cli {
    /// Number of in-process ring participants (1 skips the distributed checks
    /// unless launched by torchrun, mpiexec or srun)
    #[arg(long)]
    world_size: Option<usize>,

    /// Base seed for all random inputs
    #[arg(long)]
    seed: Option<u64>,

    /// JSON harness configuration; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write per-test results as JSON to this path
    #[arg(long)]
    report: Option<PathBuf>,

    /// Seconds allowed for the ring forward + backward
    #[arg(long)]
    ring_timeout: Option<f64>,

    /// Seconds allowed for the trailing barrier
    #[arg(long)]
    barrier_timeout: Option<f64>,

    /// Skip the timing sweep
    #[arg(long)]
    skip_perf: bool,
}

fn build_config(cli: &Cli, env: &EnvSnapshot) -> anyhow::Result<HarnessConfig> {
    let mut config = match &cli.config {
        Some(path) => HarnessConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => HarnessConfig::default(),
    };
    config = config.apply_env(env)?;

    if let Some(world_size) = cli.world_size {
        config = config.with_world_size(world_size);
    }
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }
    if let Some(path) = &cli.report {
        config = config.with_report_path(path);
    }
    if let Some(secs) = cli.ring_timeout {
        config = config.with_ring_timeout(
            Duration::try_from_secs_f64(secs).context("--ring-timeout must be a non-negative number")?,
        );
    }
    if let Some(secs) = cli.barrier_timeout {
        config = config.with_barrier_timeout(
            Duration::try_from_secs_f64(secs).context("--barrier-timeout must be a non-negative number")?,
        );
    }
    if cli.skip_perf {
        config = config.with_skip_perf(true);
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    init_logging_default();
    let cli = Cli::parse();
    let env = EnvSnapshot::capture();
    let config = build_config(&cli, &env)?;

    println!("RingForge attention verification suite");
    println!("{}", device::probe());

    let harness = Harness::new(config.clone()).with_env(env);
    let report = match harness.run() {
        Ok(report) => report,
        Err(RingForgeError::AcceleratorUnavailable(reason)) => {
            eprintln!("Accelerator not available: {}", reason);
            std::process::exit(1);
        }
        Err(err) => return Err(err.into()),
    };

    print!("{}", report.render_summary());

    if let Some(path) = &config.report_path {
        report
            .write_json(path)
            .with_context(|| format!("writing report to {}", path.display()))?;
        println!("Report written to {}", path.display());
    }

    std::process::exit(report.exit_code());
}
