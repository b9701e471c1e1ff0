// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use modman_core::domain::config::ModuleHostConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file populated with defaults
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./modman-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, force } => generate(&output, force),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ModuleHostConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. MODMAN_CONFIG_PATH: {}",
            std::env::var("MODMAN_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./modman-config.yaml");
        println!("  4. ~/.modman/config.yaml");
        println!("  5. /etc/modman/config.yaml");
        println!();
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!("  Environment:  {:?}", spec.environment);
    println!("  Port range:   {}-{}", spec.ports.start, spec.ports.end);
    println!("  Registries:   {}", spec.registries.trusted.join(", "));
    println!(
        "  Quotas:       {} modules, {} per actor",
        spec.quotas.max_modules, spec.quotas.max_modules_per_actor
    );
    println!("  Proxy dir:    {}", spec.proxy.config_dir.display());
    println!("  Storage:      {:?}", spec.storage.backend);
    println!("  API:          {}:{}", spec.api.bind_address, spec.api.port);
    println!();

    // Secrets stay out of terminal scrollback.
    let mut redacted = config.clone();
    if redacted.spec.license.sealing_key.is_some() {
        redacted.spec.license.sealing_key = Some("<redacted>".to_string());
    }
    if redacted.spec.storage.database_url.is_some() {
        redacted.spec.storage.database_url = Some("<redacted>".to_string());
    }
    println!("{}", serde_yaml::to_string(&redacted).context("Failed to render configuration")?);

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ModuleHostConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    ModuleHostConfigManifest::default()
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_config_loads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modman-config.yaml");

        generate(&path, false).unwrap();
        let config = ModuleHostConfigManifest::from_yaml_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.spec.api.port, 8700);
    }

    #[test]
    fn test_generate_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modman-config.yaml");
        std::fs::write(&path, "keep me").unwrap();

        assert!(generate(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");

        generate(&path, true).unwrap();
        assert!(ModuleHostConfigManifest::from_yaml_file(&path).is_ok());
    }
}
