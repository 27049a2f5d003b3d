//! CLI command definitions and subcommands

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Loadflow - distributed workflow and load-test execution engine
#[derive(Parser)]
#[command(
    name = "lf",
    about = "Distributed workflow and load-test execution engine",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run the master control plane
    Master {
        /// Listen address for slave connections
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Run a slave worker
    Slave {
        /// Master transport address
        #[arg(short, long)]
        master_addr: Option<String>,

        /// Hard VU cap for this worker
        #[arg(long)]
        max_vus: Option<u32>,

        /// Stable slave id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Execute a workflow document locally and print the report
    Run {
        /// Workflow file (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,

        /// Output format for the final report
        #[arg(short = 'o', long, default_value = "text")]
        format: OutputFormat,
    },
}

/// Report output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}
