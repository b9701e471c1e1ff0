// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Module host server
//!
//! Builds every collaborator from the configuration manifest, repairs any
//! leftovers from a previous run, then serves the HTTP API until SIGINT or
//! SIGTERM.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use modman_core::application::module_orchestrator::{Collaborators, ModuleOrchestrator, OrchestratorSettings};
use modman_core::application::repository_factory::{
    create_audit_repository, create_module_repository, create_port_registry,
};
use modman_core::domain::config::ModuleHostConfigManifest;
use modman_core::domain::events::ModuleEvent;
use modman_core::domain::repository::StorageBackend;
use modman_core::domain::runtime::ContainerRuntime;
use modman_core::domain::security::SecurityProfileResolver;
use modman_core::infrastructure::db::Database;
use modman_core::infrastructure::event_bus::{EventBus, EventBusError};
use modman_core::infrastructure::{
    CommandProxyController, DockerContainerRuntime, LicenseSealer, NginxProxyConfigurator,
    RevocationListValidator,
};
use modman_core::presentation::api;

pub async fn run_server(
    config: ModuleHostConfigManifest,
    bind: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    config.validate().context("Configuration validation failed")?;
    let spec = &config.spec;
    info!(
        name = %config.metadata.name,
        environment = ?spec.environment,
        "modman starting (PID: {})",
        std::process::id()
    );

    // Storage
    let backend = config.storage_backend();
    let database = match &backend {
        StorageBackend::PostgreSQL(pg) => {
            let database = Database::new(pg).await?;
            database.migrate().await?;
            info!("PostgreSQL storage ready");
            Some(database)
        }
        StorageBackend::InMemory => {
            warn!("Using in-memory storage; module records and audit entries are lost on restart");
            None
        }
    };
    let pool = database.as_ref().map(Database::get_pool);
    let range = config.port_range()?;
    let modules = create_module_repository(&backend, pool)?;
    let audit = create_audit_repository(&backend, pool)?;
    let ports = create_port_registry(&backend, pool, range)?;

    // Container runtime
    let runtime = Arc::new(
        DockerContainerRuntime::new(spec.runtime.docker_socket.clone())
            .context("Failed to initialize Docker runtime")?,
    );
    if let Err(e) = runtime.ping().await {
        warn!("Docker is not reachable yet, installs will fail until it is: {}", e);
    }

    // Reverse proxy
    let controller = Arc::new(CommandProxyController::from_config(&spec.proxy));
    let proxy = Arc::new(NginxProxyConfigurator::new(spec.proxy.config_dir.clone(), controller));

    // Licensing
    let license = Arc::new(RevocationListValidator::new(spec.license.revoked.clone()));
    let sealer = match spec.license.sealing_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => LicenseSealer::new(key),
        None => {
            warn!("No license sealing key configured; sealed keys will not survive a restart");
            LicenseSealer::ephemeral()
        }
    };

    let event_bus = Arc::new(EventBus::with_default_capacity());
    spawn_event_logger(&event_bus);

    let orchestrator = Arc::new(ModuleOrchestrator::new(
        Collaborators {
            modules,
            audit,
            ports,
            runtime,
            proxy,
            license,
            sealer: Arc::new(sealer),
            resolver: SecurityProfileResolver::new(
                spec.runtime.strict_user.clone(),
                spec.runtime.resource_ceilings(),
            ),
            event_bus,
        },
        OrchestratorSettings::from_manifest(&config),
    ));

    match orchestrator.reconcile().await {
        Ok(report) if !report.failures.is_empty() => {
            warn!(failures = ?report.failures, "Startup reconciliation left resources behind");
        }
        Ok(_) => {}
        Err(e) => error!("Startup reconciliation failed: {}", e),
    }

    if let Some(metrics_port) = spec.observability.metrics_port {
        let addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics exposed on {}", addr);
    }

    let app = api::app(orchestrator);

    let addr = format!(
        "{}:{}",
        bind.unwrap_or_else(|| spec.api.bind_address.clone()),
        port.unwrap_or(spec.api.port)
    );
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("modman listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("modman shutting down");

    Ok(())
}

/// Mirror lifecycle events into the log stream.
fn spawn_event_logger(event_bus: &EventBus) {
    let mut receiver = event_bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => log_event(&event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    });
}

fn log_event(event: &ModuleEvent) {
    match event {
        ModuleEvent::InstallStarted { module, actor, .. } => {
            info!(module = %module, actor = %actor, "event: install started")
        }
        ModuleEvent::PortsAllocated { module, ports, .. } => {
            info!(module = %module, ports = ?ports, "event: ports allocated")
        }
        ModuleEvent::ContainerStarted {
            module,
            container_id,
            profile,
            ..
        } => info!(module = %module, container = %container_id, profile = %profile, "event: container started"),
        ModuleEvent::RouteApplied { module, path_prefix, .. } => {
            info!(module = %module, path_prefix = %path_prefix, "event: route applied")
        }
        ModuleEvent::ModuleInstalled { module, duration_ms, .. } => {
            info!(module = %module, duration_ms, "event: module installed")
        }
        ModuleEvent::InstallRolledBack {
            module,
            failed_step,
            compensations,
            complete,
            ..
        } => warn!(
            module = %module,
            failed_step = %failed_step,
            compensations = ?compensations,
            complete,
            "event: install rolled back"
        ),
        ModuleEvent::StateChanged { module, from, to, .. } => {
            info!(module = %module, from = %from, to = %to, "event: state changed")
        }
        ModuleEvent::ModuleUninstalled {
            module, released_ports, ..
        } => info!(module = %module, released_ports, "event: module uninstalled"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
