use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use std::process::ExitCode;
use tracing::info;
use trellis_config::LogLevel;
use trellis_logging::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
use uuid::Uuid;

mod cli;
mod commands;
mod reporters;

use cli::{Cli, Commands, ConfigCommands};
use commands::{
    handle_config_generate, handle_config_show, handle_config_validate, load_config,
    run_command, run_worker_process,
};

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Handle worker mode first (before any logging setup to avoid conflicts)
    if cli.worker {
        let worker_id = cli
            .worker_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // stdout carries the IPC stream
        init_worker_tracing(cli.log_level.as_deref().unwrap_or("warn"), &worker_id)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to start execution context runtime")?;
        let served = runtime.block_on(run_worker_process(worker_id));
        // The stdin reader sits in a blocking read that only ends at EOF
        runtime.shutdown_background();
        served?;
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start runtime")?;
    runtime.block_on(run_cli(cli))
}

async fn run_cli(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        Some(Commands::Run(args)) => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(level) = &cli.log_level {
                config.logging.level = level
                    .parse::<LogLevel>()
                    .map_err(|e| anyhow::anyhow!(e))?;
            }
            init_logging_from_config(&config.logging)?;
            info!("Trellis starting");
            run_command(config, args).await
        }
        Some(Commands::Config { config_cmd }) => {
            init_simple_tracing(cli.log_level.as_deref().unwrap_or("warn"))?;
            match config_cmd {
                ConfigCommands::Validate { config_file } => handle_config_validate(config_file)?,
                ConfigCommands::Generate { output, force } => {
                    handle_config_generate(output.as_deref(), *force)?
                }
                ConfigCommands::Show { format } => {
                    let config = load_config(cli.config.as_ref())?;
                    handle_config_show(&config, format)?
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        None => {
            // If no subcommand is provided, print help
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(ExitCode::SUCCESS)
        }
    }
}
