use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use trellis_config::{ConfigLoader, RunConfig};

/// Configuration picked up when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "trellis.yaml";

/// Resolve the run configuration: an explicit file, then `./trellis.yaml`,
/// then environment overrides on top of the defaults
pub fn load_config(config_path: Option<&PathBuf>) -> Result<RunConfig> {
    let loader = ConfigLoader::new();

    let path = match config_path {
        Some(path) if path.exists() => Some(path.clone()),
        Some(path) => {
            warn!("No configuration at {:?}, falling back to defaults", path);
            None
        }
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
    };

    match path {
        Some(path) => {
            info!("Reading run configuration from {:?}", path);
            loader
                .from_file(&path)
                .with_context(|| format!("Could not load {:?}", path))
        }
        None => {
            debug!("Using default run configuration with environment overrides");
            loader
                .from_env()
                .context("Could not apply environment overrides")
        }
    }
}

/// Handle configuration validation
pub fn handle_config_validate(config_file: &Path) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match ConfigLoader::new().from_file(config_file) {
        Ok(_) => {
            println!("✅ Configuration file is valid");
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed: {}", e);
            error!("Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// Handle configuration generation
pub fn handle_config_generate(output: Option<&Path>, force: bool) -> Result<()> {
    let content = RunConfig::generate_sample();

    let Some(output) = output else {
        print!("{}", content);
        return Ok(());
    };

    if output.exists() && !force {
        return Err(anyhow::anyhow!(
            "Output file already exists: {:?}. Use --force to overwrite.",
            output
        ));
    }

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create output directory")?;
    }
    fs::write(output, content).context("Failed to write configuration file")?;

    println!("✅ Configuration generated at: {:?}", output);
    println!(
        "🔧 Validate with: trellis config validate --config-file {:?}",
        output
    );
    Ok(())
}

/// Handle configuration display
pub fn handle_config_show(config: &RunConfig, format: &str) -> Result<()> {
    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml = serde_yaml::to_string(config).context("Failed to serialize to YAML")?;
            print!("{}", yaml);
        }
        "json" => {
            let json =
                serde_json::to_string_pretty(config).context("Failed to serialize to JSON")?;
            println!("{}", json);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }
    Ok(())
}
