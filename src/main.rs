use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use speedbump::cli::{Cli, Command};
use speedbump::{calibration, patterns, spin};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber for debug output
fn init_tracing(debug: bool) {
    if debug {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into()),
            )
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Run a fresh calibration and print it
fn run_calibrate(json: bool) -> Result<()> {
    let state = calibration::calibrate().context("monotonic clock unavailable")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
    } else {
        println!("clock_gettime overhead: {} ns", state.overhead_ns);
        println!("minimum achievable delay: {} ns", state.min_delay_ns());
    }
    Ok(())
}

/// Validate a targets file, optionally matching one call site
fn run_check(targets: &Path, module: Option<&str>, name: Option<&str>) -> Result<()> {
    let patterns = patterns::load_targets(targets)?;
    if patterns.is_empty() {
        bail!("no patterns found in {}", targets.display());
    }

    println!("{}: {} pattern(s)", targets.display(), patterns.len());
    for pattern in &patterns {
        println!("  {}", pattern);
    }

    if let (Some(module), Some(name)) = (module, name) {
        let matched: Vec<_> = patterns.iter().filter(|p| p.matches(module, name)).collect();
        if matched.is_empty() {
            println!("{}:{} -> no match", module, name);
        } else {
            for pattern in matched {
                println!("{}:{} -> match ({})", module, name, pattern);
            }
        }
    }
    Ok(())
}

/// Spin from `threads` threads and report achieved delays
fn run_spin(delay_ns: u64, iterations: u32, threads: usize) -> Result<()> {
    if iterations == 0 || threads == 0 {
        bail!("--iterations and --threads must be at least 1");
    }
    let state = speedbump::init().context("monotonic clock unavailable")?;

    let per_thread = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(move || {
                    let mut min = u64::MAX;
                    let mut max = 0;
                    let mut total = 0u64;
                    for _ in 0..iterations {
                        let elapsed = spin::measure_spin(delay_ns);
                        min = min.min(elapsed);
                        max = max.max(elapsed);
                        total = total.saturating_add(elapsed);
                    }
                    (min, max, total)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().map_err(|_| anyhow!("spin thread panicked")))
            .collect::<Result<Vec<(u64, u64, u64)>>>()
    })?;

    println!(
        "requested: {} ns x {} iterations x {} thread(s) (minimum achievable {} ns)",
        delay_ns,
        iterations,
        threads,
        state.min_delay_ns()
    );
    for (idx, (min, max, total)) in per_thread.iter().enumerate() {
        let mean = total / u64::from(iterations);
        println!(
            "thread {:>3}: mean {:>10} ns  min {:>10} ns  max {:>10} ns  overshoot {:>8} ns",
            idx,
            mean,
            min,
            max,
            mean.saturating_sub(delay_ns)
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Cli::parse();

    // Initialize tracing if --debug flag is set
    init_tracing(args.debug);

    match args.command {
        Command::Calibrate { json } => run_calibrate(json),
        Command::Check {
            targets,
            module,
            name,
        } => run_check(&targets, module.as_deref(), name.as_deref()),
        Command::Spin {
            delay_ns,
            iterations,
            threads,
        } => run_spin(delay_ns, iterations, threads),
    }
}
