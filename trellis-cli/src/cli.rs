//! Command-line surface of the `trellis` binary

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use trellis_config::PoolKind;

#[derive(Parser)]
#[command(name = "trellis", author, version, about, long_about = None)]
pub struct Cli {
    /// YAML run configuration; defaults to ./trellis.yaml when present
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Orchestrator log verbosity, overriding the configured level
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Serve one process context over stdin/stdout
    #[arg(long, hide = true)]
    pub worker: bool,

    /// Identity the orchestrator assigned to this context
    #[arg(long, value_name = "ID", hide = true)]
    pub worker_id: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run spec files
    Run(RunArgs),

    /// Inspect or produce run configurations
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Spec files, or directories searched for `*.yaml` specs
    #[arg(required = true, value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Execution context kind: process, thread, sandboxed
    #[arg(long, value_name = "KIND")]
    pub pool: Option<PoolKind>,

    /// Maximum number of contexts running at once
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Run every file in a single context
    #[arg(long)]
    pub single_worker: bool,

    /// Reuse contexts across files
    #[arg(long)]
    pub no_isolate: bool,

    /// Stop after this many failed tests
    #[arg(long, value_name = "N")]
    pub bail: Option<u32>,

    /// Default test timeout in milliseconds
    #[arg(long, value_name = "MS")]
    pub test_timeout_ms: Option<u64>,

    /// Only run tests whose full name matches this regex
    #[arg(long, short = 't', value_name = "PATTERN")]
    pub test_name_pattern: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value = "console")]
    pub reporter: ReporterKind,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReporterKind {
    /// Coloured human-readable output
    Console,
    /// One JSON event per line
    Json,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Check that a run configuration parses and passes validation
    Validate {
        /// File to check
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Write the default run configuration
    Generate {
        /// Destination; stdout when omitted
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,

        /// Replace the destination if it exists
        #[arg(long)]
        force: bool,
    },

    /// Show the configuration a run would use
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
