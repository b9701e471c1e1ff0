// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # modman
//!
//! The `modman` binary runs the module host and talks to it.
//!
//! - `modman serve` - run the HTTP API in the foreground
//! - `modman install|list|status|stop|start|uninstall|audit|health` - delegate to a running host
//! - `modman config show|validate|generate` - configuration management

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use modman_cli::commands::{self, ConfigCommand, ModuleCommand};
use modman_cli::daemon;
use modman_core::domain::config::{ApiConfig, ModuleHostConfigManifest};

/// modman - install and run Docker-packaged modules
#[derive(Parser)]
#[command(name = "modman")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "MODMAN_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// HTTP API port (default: from config, 8700)
    #[arg(long, global = true, env = "MODMAN_PORT")]
    port: Option<u16>,

    /// HTTP API host the client commands talk to
    #[arg(long, global = true, env = "MODMAN_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "MODMAN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (compact or json)
    #[arg(long, global = true, env = "MODMAN_LOG_FORMAT")]
    log_format: Option<String>,

    /// Actor recorded on audit entries for mutating commands
    #[arg(long, global = true, env = "MODMAN_ACTOR")]
    actor: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the module host API in the foreground
    #[command(name = "serve")]
    Serve {
        /// Address to bind (default: spec.api.bind_address)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    #[command(flatten)]
    Module(ModuleCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { bind }) => {
            let config = ModuleHostConfigManifest::load_or_default(cli.config.clone())
                .context("Failed to load configuration")?;
            let level = cli
                .log_level
                .unwrap_or_else(|| config.spec.observability.log_level.clone());
            let format = cli
                .log_format
                .unwrap_or_else(|| config.spec.observability.log_format.clone());
            init_logging(&level, &format)?;

            daemon::server::run_server(config, bind, cli.port).await
        }
        Some(Commands::Config { command }) => {
            init_logging(cli.log_level.as_deref().unwrap_or("warn"), "compact")?;
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Module(command)) => {
            init_logging(
                cli.log_level.as_deref().unwrap_or("warn"),
                cli.log_format.as_deref().unwrap_or("compact"),
            )?;
            let port = cli.port.unwrap_or_else(|| ApiConfig::default().port);
            commands::module::handle_command(command, &cli.host, port, cli.actor.as_deref()).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().init(),
        _ => builder.compact().init(),
    }

    Ok(())
}
