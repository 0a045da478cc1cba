//! # Engine Configuration Validator
//!
//! Command-line tool for validating engine configuration files across environments.
//! Helps identify configuration issues before an engine is started on them.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hatchery_core::config::{ConfigManager, EngineConfig};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate hatchery engine configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Environment overlay to merge (engine.<environment>.yaml)
    #[arg(short, long, default_value = "development")]
    environment: String,

    /// Configuration directory path (default: config)
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// Verbose output level (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load, merge and validate the configuration
    Validate,

    /// Print the merged configuration as YAML
    Show,

    /// List environment overlays found in the directory
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
        Some(Commands::Validate) | None => validate(&cli).map(|_| ()),
        Some(Commands::Show) => show(&cli),
        Some(Commands::Environments) => list_environments(&cli),
    };

    match result {
        Ok(()) => {
            info!("Configuration validation completed successfully");
            process::exit(0);
        }
        Err(e) => {
            error!("Configuration validation failed: {}", e);
            process::exit(1);
        }
    }
}

fn config_dir(cli: &Cli) -> PathBuf {
    cli.config_dir.clone().unwrap_or_else(|| PathBuf::from("config"))
}

fn validate(cli: &Cli) -> anyhow::Result<EngineConfig> {
    let dir = config_dir(cli);
    println!("🔧 Validating engine configuration");
    println!("Environment: {}", cli.environment);
    println!("Config Directory: {}", dir.display());
    println!();

    let manager = match ConfigManager::load_from_directory_with_env(Some(dir), &cli.environment) {
        Ok(manager) => manager,
        Err(e) => {
            println!("❌ {e}");
            return Err(e.into());
        }
    };
    let config = manager.config().clone();

    println!("✅ Crafting");
    match &config.crafting.default_region {
        Some(region) => println!("   default region: {region}"),
        None => println!("   ℹ️  no default region, jobs must declare one"),
    }
    println!(
        "   vcs timeout: {}ms, store timeout: {}ms, action depth: {}",
        config.crafting.vcs_timeout_ms,
        config.crafting.store_timeout_ms,
        config.crafting.max_action_depth
    );
    println!("   builtin actions: {}", config.crafting.builtin_actions.join(", "));

    println!("✅ Queue");
    println!(
        "   orphan timeout: {}s, event channel capacity: {}",
        config.queue.orphan_timeout_secs, config.queue.event_channel_capacity
    );

    println!("✅ Spawn");
    match config.spawn.max_attempts {
        Some(max) => println!("   max attempts: {max}"),
        None => println!("   max attempts: unlimited"),
    }
    println!("   token leeway: {}s", config.spawn.token_leeway_secs);

    println!("✅ Database");
    println!("   max connections: {}", config.database.max_connections);

    println!("\n🎉 All configuration validation checks passed!");
    Ok(config)
}

fn show(cli: &Cli) -> anyhow::Result<()> {
    let manager = ConfigManager::load_from_directory_with_env(Some(config_dir(cli)), &cli.environment)?;
    println!("{}", serde_yaml::to_string(manager.config())?);
    Ok(())
}

fn list_environments(cli: &Cli) -> anyhow::Result<()> {
    let dir = config_dir(cli);
    println!("📋 Available Environments in {}:", dir.display());

    let mut environments = Vec::new();
    let entries = std::fs::read_dir(&dir)
        .with_context(|| format!("cannot read config directory {}", dir.display()))?;
    for entry in entries {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if let Some(env) = name
            .strip_prefix("engine.")
            .and_then(|rest| rest.strip_suffix(".yaml"))
        {
            environments.push(env.to_string());
        }
    }
    environments.sort();

    for env in environments {
        println!("  • {env}");
    }
    Ok(())
}
