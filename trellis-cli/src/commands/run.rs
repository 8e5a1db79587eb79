use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use trellis_config::RunConfig;
use trellis_execution::{spawner_for, Orchestrator, Reporter};
use trellis_runtime::{ModuleLoader, ScriptLoader};
use walkdir::WalkDir;

use crate::cli::{ReporterKind, RunArgs};
use crate::reporters::{ConsoleReporter, JsonReporter};

fn is_spec_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Expand `paths` into spec files; directories are searched recursively
pub fn discover_files(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();

    for path in paths {
        if path.is_dir() {
            let mut found: Vec<String> = WalkDir::new(path)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Skipping unreadable entry: {}", e);
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file() && is_spec_file(entry.path()))
                .map(|entry| entry.path().display().to_string())
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.display().to_string());
        } else {
            return Err(anyhow::anyhow!("No such file or directory: {:?}", path));
        }
    }

    files.retain(|file| seen.insert(file.clone()));
    Ok(files)
}

/// Fold command-line flags over the loaded configuration
pub fn apply_overrides(config: &mut RunConfig, args: &RunArgs) -> Result<()> {
    if let Some(kind) = args.pool {
        config.pool.kind = kind;
    }
    if let Some(max_workers) = args.max_workers {
        config.pool.max_workers = max_workers;
    }
    if args.single_worker {
        config.pool.single_worker = true;
    }
    if args.no_isolate {
        config.pool.isolate = false;
    }
    if let Some(bail) = args.bail {
        config.execution.bail = bail;
    }
    if let Some(ms) = args.test_timeout_ms {
        config.execution.test_timeout = Duration::from_millis(ms);
    }
    if let Some(pattern) = &args.test_name_pattern {
        config.execution.test_name_pattern = Some(pattern.clone());
    }
    config
        .validate_all()
        .context("Invalid configuration after command-line overrides")
}

/// Run spec files and report; exit code 1 when anything failed
pub async fn run_command(mut config: RunConfig, args: &RunArgs) -> Result<ExitCode> {
    apply_overrides(&mut config, args)?;

    let files = discover_files(&args.paths)?;
    if files.is_empty() {
        return Err(anyhow::anyhow!("No spec files found in {:?}", args.paths));
    }
    info!("Discovered {} spec files", files.len());

    let loader: Arc<dyn ModuleLoader> = Arc::new(ScriptLoader::new());
    let spawner = spawner_for(&config.pool, loader).context("Failed to set up execution contexts")?;
    let reporter: Arc<dyn Reporter> = match args.reporter {
        ReporterKind::Console => Arc::new(ConsoleReporter::new()),
        ReporterKind::Json => Arc::new(JsonReporter::new()),
    };
    let orchestrator = Orchestrator::new(config, spawner).with_reporter(reporter);

    let cancel = orchestrator.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            cancel.cancel();
        }
    });

    let summary = orchestrator.run(files).await;
    interrupt.abort();
    let summary = summary.context("Run failed")?;

    Ok(if summary.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
