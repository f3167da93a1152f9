//! CLI argument parsing for Speedbump

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "speedbump")]
#[command(version)]
#[command(about = "Calibrated spin-delay injection for latency chaos testing", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output on stderr
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Measure clock-read overhead and the minimum achievable delay
    Calibrate {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a targets file and optionally test one call site against it
    Check {
        /// Targets file (one module_glob:name_glob pattern per line)
        #[arg(value_name = "TARGETS")]
        targets: PathBuf,

        /// Module of the call site to test (requires --name)
        #[arg(long, requires = "name")]
        module: Option<String>,

        /// Qualified name of the call site to test (requires --module)
        #[arg(long, requires = "module")]
        name: Option<String>,
    },

    /// Spin for a duration and report the achieved delay
    Spin {
        /// Requested delay in nanoseconds
        #[arg(value_name = "NS")]
        delay_ns: u64,

        /// Delays per thread
        #[arg(short = 'n', long, default_value = "100")]
        iterations: u32,

        /// Concurrent spinning threads
        #[arg(short = 't', long, default_value = "1")]
        threads: usize,
    },
}
