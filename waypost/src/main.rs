//! Waypost CLI.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use waypost::config::{IssueLevel, config_path, init_config, load_config};
use waypost::gateway::Gateway;
use waypost::server;

/// Waypost - message gateway with routing, scheduling and rollups
#[derive(Parser)]
#[command(name = "waypost")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, env = "WAYPOST_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration
    Init(InitArgs),

    /// Run the gateway and its HTTP server
    Serve,

    /// Show configuration summary
    Status,

    /// Manage configuration
    Config(ConfigArgs),
}

/// Arguments for the init command
#[derive(Args)]
struct InitArgs {
    /// Force overwrite existing configuration
    #[arg(short, long)]
    force: bool,
}

/// Arguments for the config command
#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommands,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show current configuration with secrets masked
    Show,
    /// Show configuration file path
    Path,
    /// Validate configuration
    Validate,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to create tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "waypost={level},{}",
            if verbosity >= 2 { "debug" } else { "warn" }
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_file = cli.config.unwrap_or_else(config_path);
    match cli.command {
        Commands::Init(args) => cmd_init(&config_file, args).await,
        Commands::Serve => cmd_serve(&config_file).await,
        Commands::Status => cmd_status(&config_file).await,
        Commands::Config(args) => cmd_config(&config_file, args).await,
    }
}

async fn cmd_init(config_file: &Path, args: InitArgs) -> anyhow::Result<()> {
    if config_file.exists() && !args.force {
        println!("Configuration already exists at: {}", config_file.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    init_config(config_file)
        .await
        .context("failed to initialize config")?;

    println!("Configuration created: {}", config_file.display());
    println!();
    println!("Next steps:");
    println!("  1. edit channels and groups in the file above");
    println!("  2. waypost serve");
    Ok(())
}

async fn cmd_serve(config_file: &Path) -> anyhow::Result<()> {
    if !config_file.exists() {
        bail!(
            "no configuration at {}; run 'waypost init' first",
            config_file.display()
        );
    }

    let gateway = Gateway::from_path(config_file)
        .await
        .with_context(|| format!("failed to start gateway from {}", config_file.display()))?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    let served = server::serve(gateway.clone(), shutdown).await;
    gateway.shutdown().await;
    served.context("server failed")?;
    Ok(())
}

async fn cmd_status(config_file: &Path) -> anyhow::Result<()> {
    println!("Waypost Status\n");
    println!("Configuration:");
    println!("  Path:   {}", config_file.display());
    println!("  Exists: {}", if config_file.exists() { "yes" } else { "no" });
    if !config_file.exists() {
        return Ok(());
    }

    match load_config(config_file).await {
        Ok(config) => {
            println!("  Valid:  yes");
            println!("  Listen: {}:{}", config.server.bind, config.server.port);
            println!("  Workspace: {}", config.workspace_dir().display());
            println!();
            println!("Channels:");
            for (id, channel) in &config.channels {
                let state = if channel.should_run() {
                    "enabled"
                } else if channel.enabled {
                    "missing url"
                } else {
                    "disabled"
                };
                println!("  {id}: {state}");
            }
            println!();
            println!("Groups:");
            for (id, group) in &config.groups {
                let rollup = if group.active_rollup().is_some() { " (rollup)" } else { "" };
                println!("  {id}: {} source(s){rollup}", group.sources.len());
            }
            println!();
            println!(
                "Backend:   {}",
                if config.backend.enabled { "enabled" } else { "disabled" }
            );
            println!(
                "Heartbeat: {}",
                if config.heartbeat.enabled { "enabled" } else { "disabled" }
            );
        }
        Err(e) => println!("  Valid:  no ({e})"),
    }
    Ok(())
}

async fn cmd_config(config_file: &Path, args: ConfigArgs) -> anyhow::Result<()> {
    match args.command {
        ConfigCommands::Path => println!("{}", config_file.display()),
        ConfigCommands::Show => {
            if !config_file.exists() {
                println!("Configuration file does not exist.");
                println!("Run 'waypost init' to create one.");
                return Ok(());
            }
            let content = tokio::fs::read_to_string(config_file)
                .await
                .context("failed to read config")?;
            let config: waypost::config::GatewayConfig =
                serde_json::from_str(&content).context("failed to parse config")?;
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        }
        ConfigCommands::Validate => {
            if !config_file.exists() {
                bail!("configuration file does not exist");
            }
            let content = tokio::fs::read_to_string(config_file)
                .await
                .context("failed to read config")?;
            let config: waypost::config::GatewayConfig =
                serde_json::from_str(&content).context("failed to parse config")?;
            let issues = config.validate();
            for issue in &issues {
                println!("{issue}");
            }
            if issues.iter().any(|i| i.level == IssueLevel::Error) {
                bail!("configuration is invalid");
            }
            println!("Configuration is valid");
        }
    }
    Ok(())
}
