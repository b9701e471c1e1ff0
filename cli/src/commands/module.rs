// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Module lifecycle commands
//!
//! Commands: install, list, status, stop, start, uninstall, audit, health.
//! Every command delegates to a running `modman serve`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::daemon::client::AuditFilter;
use crate::daemon::{check_daemon_running, DaemonClient, DaemonStatus};
use modman_core::application::module_orchestrator::ComponentHealth;
use modman_core::domain::audit::AuditOutcome;
use modman_core::domain::module::{Module, ModuleDescriptor, ModuleHealth, ModuleState};

const DEFAULT_ACTOR: &str = "cli";

#[derive(Subcommand)]
pub enum ModuleCommand {
    /// Install a module from a descriptor file (YAML or JSON)
    Install {
        #[arg(value_name = "DESCRIPTOR")]
        descriptor: PathBuf,
    },

    /// List installed modules
    List {
        #[arg(long, default_value = "1")]
        page: usize,

        #[arg(long, default_value = "20")]
        per_page: usize,
    },

    /// Show live status of a module
    Status { name: String },

    /// Stop a running module (ports and route are kept)
    Stop { name: String },

    /// Start a stopped module
    Start { name: String },

    /// Uninstall a module
    Uninstall { name: String },

    /// Query the audit log
    Audit {
        #[arg(long)]
        module: Option<String>,

        /// install, uninstall, status-check, stop, start
        #[arg(long)]
        operation: Option<String>,

        /// success or failure
        #[arg(long)]
        outcome: Option<String>,

        #[arg(long)]
        actor: Option<String>,

        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        #[arg(long, default_value = "50")]
        limit: usize,
    },

    /// Check host and subsystem health
    Health,
}

pub async fn handle_command(command: ModuleCommand, host: &str, port: u16, actor: Option<&str>) -> Result<()> {
    let client = DaemonClient::new(host, port, actor.unwrap_or(DEFAULT_ACTOR))?;

    match command {
        ModuleCommand::Install { descriptor } => install(&client, &descriptor).await,
        ModuleCommand::List { page, per_page } => list(&client, page, per_page).await,
        ModuleCommand::Status { name } => status(&client, &name).await,
        ModuleCommand::Stop { name } => {
            let module = client.stop(&name).await?;
            println!("{}", format!("✓ Module '{}' stopped", module.name).green());
            Ok(())
        }
        ModuleCommand::Start { name } => {
            let module = client.start(&name).await?;
            println!("{}", format!("✓ Module '{}' started", module.name).green());
            Ok(())
        }
        ModuleCommand::Uninstall { name } => uninstall(&client, &name).await,
        ModuleCommand::Audit {
            module,
            operation,
            outcome,
            actor,
            since,
            until,
            limit,
        } => {
            let filter = AuditFilter {
                module,
                operation,
                outcome,
                actor,
                since,
                until,
                limit: Some(limit),
            };
            audit(&client, &filter).await
        }
        ModuleCommand::Health => health(&client, host, port).await,
    }
}

/// Read a descriptor, choosing the format by extension.
pub fn load_descriptor(path: &Path) -> Result<ModuleDescriptor> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read descriptor {:?}", path))?;

    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid descriptor {:?}", path))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid descriptor {:?}", path))
    }
}

async fn install(client: &DaemonClient, path: &Path) -> Result<()> {
    let descriptor = load_descriptor(path)?;
    println!("Installing {} ({})...", descriptor.name.bold(), descriptor.image);

    let module = client.install(&descriptor).await?;

    println!("{}", format!("✓ Module '{}' installed", module.name).green());
    print_module(&module);
    Ok(())
}

async fn list(client: &DaemonClient, page: usize, per_page: usize) -> Result<()> {
    let result = client.list(page, per_page).await?;

    if result.items.is_empty() {
        println!("{}", "No modules installed".dimmed());
        return Ok(());
    }

    println!(
        "{:<24} {:<10} {:<10} {:<12} {}",
        "NAME".bold(),
        "VERSION".bold(),
        "STATE".bold(),
        "HEALTH".bold(),
        "ROUTE".bold()
    );
    for module in &result.items {
        println!(
            "{:<24} {:<10} {:<10} {:<12} {}",
            module.name.as_str(),
            module.version,
            paint_state(module.state),
            paint_health(module.health),
            module.proxy_route.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!(
        "{}",
        format!("page {} ({} per page), {} total", result.page, result.per_page, result.total).dimmed()
    );
    Ok(())
}

async fn status(client: &DaemonClient, name: &str) -> Result<()> {
    let report = client.status(name).await?;

    println!("{} ({})", report.name.bold(), report.display_name);
    println!("  State:    {}", paint_state(report.state));
    println!("  Health:   {}", paint_health(report.health));
    if let Some(profile) = report.security_profile {
        println!("  Profile:  {}", profile);
    }
    if let Some(route) = &report.proxy_route {
        println!("  Route:    {}", route);
    }
    for (internal, external) in &report.allocated_ports {
        println!("  Port:     {} -> {}", internal, external);
    }
    if let Some(container) = &report.container {
        println!("  Container: {} ({})", container.name, container.status);
    }
    if let Some(metrics) = &report.metrics {
        println!("  CPU:      {:.1}%", metrics.cpu_percent);
        println!(
            "  Memory:   {} / {} MiB",
            metrics.memory_usage_bytes / (1024 * 1024),
            metrics.memory_limit_bytes / (1024 * 1024)
        );
        println!("  Uptime:   {}s", metrics.uptime_seconds);
    }
    if let Some(detail) = &report.detail {
        println!("  {}", detail.yellow());
    }
    Ok(())
}

async fn uninstall(client: &DaemonClient, name: &str) -> Result<()> {
    let summary = client.uninstall(name).await?;

    if summary.already_removed {
        println!("{}", format!("Module '{}' was already removed", summary.module).yellow());
        return Ok(());
    }

    println!("{}", format!("✓ Module '{}' uninstalled", summary.module).green());
    println!("  Container removed: {}", summary.container_removed);
    println!("  Route removed:     {}", summary.route_removed);
    println!("  Ports released:    {}", summary.ports_released);
    Ok(())
}

async fn audit(client: &DaemonClient, filter: &AuditFilter) -> Result<()> {
    let entries = client.audit_log(filter).await?;

    if entries.is_empty() {
        println!("{}", "No matching audit entries".dimmed());
        return Ok(());
    }

    for entry in entries {
        let outcome = match entry.outcome {
            AuditOutcome::Success => "success".green(),
            AuditOutcome::Failure => "failure".red(),
        };
        println!(
            "{} {:<12} {:<20} {:<8} {:>6}ms  {} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.operation.as_str(),
            entry.module,
            outcome,
            entry.duration_ms,
            entry.actor.dimmed(),
            entry.detail
        );
        if let Some(step) = &entry.failed_step {
            println!("    failed step: {}, rolled back: [{}]", step, entry.rolled_back.join(", "));
        }
    }
    Ok(())
}

async fn health(client: &DaemonClient, host: &str, port: u16) -> Result<()> {
    match check_daemon_running(host, port).await? {
        DaemonStatus::Running { uptime } => {
            let uptime = uptime.map(|s| format!(" (uptime {}s)", s)).unwrap_or_default();
            println!("{}", format!("✓ modman is running at {}{}", client.base_url(), uptime).green());
        }
        DaemonStatus::Unhealthy { error } => {
            anyhow::bail!("modman at {} is unhealthy: {}", client.base_url(), error);
        }
        DaemonStatus::Stopped => {
            anyhow::bail!("modman is not running at {}", client.base_url());
        }
    }

    let report = client.health().await?;
    print_component("Port registry", &report.registry);
    print_component("Container runtime", &report.runtime);
    print_component("Reverse proxy", &report.proxy);
    if let Some(ports) = &report.ports {
        println!("  Ports in use: {} / {}", ports.range_used, ports.range_total);
    }

    if !report.healthy {
        anyhow::bail!("one or more subsystems are unhealthy");
    }
    Ok(())
}

fn print_component(label: &str, component: &ComponentHealth) {
    if component.healthy {
        println!("  {:<18} {}", label, "ok".green());
    } else {
        println!(
            "  {:<18} {} {}",
            label,
            "unhealthy".red(),
            component.detail.as_deref().unwrap_or_default()
        );
    }
}

fn print_module(module: &Module) {
    println!("  Image:   {}", module.image);
    println!("  State:   {}", paint_state(module.state));
    if let Some(profile) = module.security_profile {
        println!("  Profile: {}", profile);
    }
    if let Some(route) = &module.proxy_route {
        println!("  Route:   {}", route);
    }
    for (internal, external) in &module.allocated_ports {
        println!("  Port:    {} -> {}", internal, external);
    }
}

fn paint_state(state: ModuleState) -> colored::ColoredString {
    match state {
        ModuleState::Running => state.as_str().green(),
        ModuleState::Stopped | ModuleState::Removed => state.as_str().dimmed(),
        ModuleState::Error => state.as_str().red(),
        _ => state.as_str().yellow(),
    }
}

fn paint_health(health: ModuleHealth) -> colored::ColoredString {
    match health {
        ModuleHealth::Healthy => health.as_str().green(),
        ModuleHealth::Unhealthy => health.as_str().red(),
        ModuleHealth::Unknown => health.as_str().dimmed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_yaml_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crm.yaml");
        std::fs::write(
            &path,
            "name: crm\n\
             displayName: CRM\n\
             image: registry.example.com/acme/crm:2.1.0\n\
             version: 2.1.0\n\
             licenseKey: LIC-ACME-0001\n\
             ports: [8069]\n\
             env:\n  DB_HOST: postgres\n",
        )
        .unwrap();

        let descriptor = load_descriptor(&path).unwrap();
        assert_eq!(descriptor.name, "crm");
        assert_eq!(descriptor.internal_ports, vec![8069]);
        assert!(descriptor.proxy_enabled);
        assert_eq!(descriptor.env.get("DB_HOST").map(String::as_str), Some("postgres"));
    }

    #[test]
    fn test_load_json_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{"name":"worker","displayName":"Worker","image":"localhost/worker:0.1.0","version":"0.1.0","licenseKey":"LIC-ACME-0002","proxyEnabled":false}"#,
        )
        .unwrap();

        let descriptor = load_descriptor(&path).unwrap();
        assert!(!descriptor.proxy_enabled);
        assert!(descriptor.internal_ports.is_empty());
    }

    #[test]
    fn test_load_descriptor_reports_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "name: broken\n").unwrap();
        assert!(load_descriptor(&path).is_err());
    }
}
