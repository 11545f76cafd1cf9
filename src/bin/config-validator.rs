//! # Engine Configuration Validator
//!
//! Command-line tool for validating execution engine configuration across
//! environments. Catches layout and threshold mistakes before an engine is
//! started with them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tasker_engine::config::{ConfigManager, EngineConfig};
use tasker_engine::models::Priority;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "engine-config-validator")]
#[command(about = "Validate execution engine configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment to validate (development, test, production, ...)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory (default: $TASKER_ENGINE_CONFIG_DIR or ./config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Output format (table, json)
    #[arg(long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the whole configuration
    All,

    /// Show one configuration section
    Component {
        /// Section name (partitions, scoring, selection, pools, coordinator,
        /// backpressure, event_store, consistency, maintenance, recovery)
        name: String,
    },

    /// List environments that have an override file
    Environments,
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let result = match &cli.command {
        Some(Commands::All) | None => validate_all_config(&cli),
        Some(Commands::Component { name }) => show_component(&cli, name),
        Some(Commands::Environments) => list_environments(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {e:#}");
            eprintln!("❌ {e:#}");
            process::exit(1);
        }
    }
}

fn load(cli: &Cli) -> Result<EngineConfig> {
    let manager = ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &cli.environment)
        .with_context(|| format!("loading configuration for environment '{}'", cli.environment))?;
    Ok(manager.config().clone())
}

fn validate_all_config(cli: &Cli) -> Result<()> {
    let config = load(cli)?;

    if cli.format == "json" {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    println!("🔧 Validating Engine Configuration");
    println!("Environment: {}", cli.environment);
    if let Some(dir) = &cli.config_dir {
        println!("Config Directory: {}", dir.display());
    }
    println!();

    println!("✅ Configuration loaded and validated");
    print_summary(&config);

    println!("\n🎉 All configuration validation checks passed!");
    Ok(())
}

fn print_summary(config: &EngineConfig) {
    let partitions = &config.partitions;
    println!("\n📦 Partitions");
    println!("  count:               {}", partitions.count);
    println!("  max_capacity:        {}", partitions.max_capacity);
    println!("  connection_pool:     {}", partitions.connection_pool_size);
    println!("  worker_pool:         {}", partitions.worker_pool_size);
    println!(
        "  breaker:             {} failures, {}ms recovery",
        partitions.circuit_breaker.failure_threshold, partitions.circuit_breaker.recovery_timeout_ms
    );
    println!(
        "  total capacity:      {}",
        partitions.count * partitions.max_capacity
    );

    println!("\n🏊 Execution Pools");
    for priority in Priority::ALL {
        let pool = config.pools.for_priority(priority);
        println!(
            "  {:<9} concurrency={:<5} timeout={}s retries={}",
            priority.to_string(),
            pool.max_concurrency,
            pool.timeout_secs,
            pool.retry_count
        );
    }

    println!("\n🚦 Backpressure");
    println!(
        "  acceptance:          {:.2} (reduced {:.2})",
        config.backpressure.default_acceptance_rate, config.backpressure.reduced_acceptance_rate
    );
    println!(
        "  timeout multiplier:  {:.2}",
        config.backpressure.timeout_multiplier
    );

    println!("\n📼 Event Store");
    println!(
        "  replication:         {} (quorum {})",
        config.event_store.replication_factor,
        config.event_store.replication_factor / 2 + 1
    );
    println!("  retention:           {}s", config.event_store.retention_secs);
}

fn show_component(cli: &Cli, name: &str) -> Result<()> {
    let config = load(cli)?;
    let section = match name.to_lowercase().replace('-', "_").as_str() {
        "partitions" => serde_json::to_value(&config.partitions)?,
        "scoring" => serde_json::to_value(&config.scoring)?,
        "selection" => serde_json::to_value(&config.selection)?,
        "pools" => serde_json::to_value(&config.pools)?,
        "coordinator" => serde_json::to_value(&config.coordinator)?,
        "backpressure" => serde_json::to_value(&config.backpressure)?,
        "event_store" => serde_json::to_value(&config.event_store)?,
        "consistency" => serde_json::to_value(&config.consistency)?,
        "maintenance" => serde_json::to_value(&config.maintenance)?,
        "recovery" => serde_json::to_value(&config.recovery)?,
        other => bail!("Unknown component: {other}"),
    };

    println!("{}", serde_json::to_string_pretty(&section)?);
    Ok(())
}

fn list_environments(cli: &Cli) -> Result<()> {
    let dir = cli
        .config_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("config"));
    let environments = environments_in(&dir)?;

    println!("📋 Available Environments ({}):", dir.display());
    if environments.is_empty() {
        println!("  (none; only built-in defaults apply)");
    }
    for env in environments {
        println!("  • {env}");
    }
    Ok(())
}

/// Environment names taken from `engine.<env>.<ext>` files
fn environments_in(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut environments = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let name = entry?.file_name().to_string_lossy().to_string();
        let mut parts = name.split('.');
        if let (Some("engine"), Some(env), Some(_ext), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        {
            environments.push(env.to_string());
        }
    }
    environments.sort();
    environments.dedup();
    Ok(environments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_environments_in_reads_override_files() {
        let dir = TempDir::new().unwrap();
        for file in ["engine.yaml", "engine.test.yaml", "engine.production.toml", "notes.txt"] {
            std::fs::write(dir.path().join(file), "").unwrap();
        }

        let environments = environments_in(dir.path()).unwrap();
        assert_eq!(environments, vec!["production".to_string(), "test".to_string()]);
    }

    #[test]
    fn test_environments_in_missing_directory() {
        let environments = environments_in(Path::new("/definitely/not/here")).unwrap();
        assert!(environments.is_empty());
    }
}
