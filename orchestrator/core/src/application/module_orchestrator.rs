// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Module Orchestrator Application Service
//!
//! Sequences the lifecycle of a module:
//! - Install: validate, license, quota, resolve profile, allocate ports,
//!   start container, apply route, finalize. Every committed step pushes a
//!   compensation; a later failure unwinds them newest-first.
//! - Uninstall: tolerant teardown of container, route and ports.
//! - Status: live metrics plus health reconciliation (never touches `state`).
//! - Stop/Start: the `running <-> stopped` edge.
//!
//! Operations on one module name are serialized by an in-flight guard;
//! a second operation on the same name is rejected, not queued.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::application::compensation::{
    Compensation, CompensationStack, Deadline, InstallStep, RollbackOutcome,
};
use crate::application::error::OrchestratorError;
use crate::domain::audit::{AuditLogEntry, AuditOperation, AuditOutcome, AuditQuery};
use crate::domain::config::{ModuleHostConfigManifest, OperationTimeouts};
use crate::domain::events::ModuleEvent;
use crate::domain::license::LicenseValidator;
use crate::domain::module::{
    Module, ModuleDescriptor, ModuleHealth, ModuleName, ModuleState, ValidatedDescriptor,
};
use crate::domain::port::{PortRegistry, PortStats};
use crate::domain::proxy::{ProxyConfigurator, ProxyRoute};
use crate::domain::repository::{AuditLogRepository, ModulePage, ModuleRepository};
use crate::domain::runtime::{
    ContainerHealth, ContainerInspection, ContainerRuntime, ContainerSpec, ContainerStats,
    RuntimeError, MANAGED_LABEL, MODULE_LABEL,
};
use crate::domain::security::{
    DeploymentEnvironment, ImagePolicy, SecurityProfile, SecurityProfileResolver,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::license::LicenseSealer;

// ============================================================================
// Service Trait
// ============================================================================

#[async_trait]
pub trait ModuleService: Send + Sync {
    /// Install a module from its descriptor. Returns the running record.
    async fn install(&self, descriptor: ModuleDescriptor, actor: &str) -> Result<Module, OrchestratorError>;

    /// Tear a module down. Idempotent for modules already removed.
    async fn uninstall(&self, name: &str, actor: &str) -> Result<UninstallSummary, OrchestratorError>;

    /// Live view of a module. Persists reconciled health only.
    async fn status(&self, name: &str, actor: &str) -> Result<ModuleStatusReport, OrchestratorError>;

    async fn stop(&self, name: &str, actor: &str) -> Result<Module, OrchestratorError>;

    async fn start(&self, name: &str, actor: &str) -> Result<Module, OrchestratorError>;

    async fn list(&self, page: usize, per_page: usize) -> Result<ModulePage, OrchestratorError>;

    async fn audit_log(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>, OrchestratorError>;

    async fn health(&self) -> SubsystemHealth;
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallSummary {
    pub module: String,
    /// The record was already `removed`; nothing was touched
    pub already_removed: bool,
    pub container_removed: bool,
    pub route_removed: bool,
    pub ports_released: usize,
    /// internal -> external ports the module held before teardown
    pub released_ports: BTreeMap<u16, u16>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleStatusReport {
    pub name: String,
    pub display_name: String,
    pub state: ModuleState,
    pub health: ModuleHealth,
    pub allocated_ports: BTreeMap<u16, u16>,
    pub proxy_route: Option<String>,
    pub security_profile: Option<SecurityProfile>,
    pub container: Option<ContainerInspection>,
    pub metrics: Option<ContainerStats>,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn from_result<T, E: std::fmt::Display>(result: &Result<T, E>) -> Self {
        match result {
            Ok(_) => Self { healthy: true, detail: None },
            Err(e) => Self {
                healthy: false,
                detail: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsystemHealth {
    pub healthy: bool,
    pub registry: ComponentHealth,
    pub runtime: ComponentHealth,
    pub proxy: ComponentHealth,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<PortStats>,
}

// ============================================================================
// Settings & collaborators
// ============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub environment: DeploymentEnvironment,
    pub image_policy: ImagePolicy,
    pub max_modules: usize,
    pub max_modules_per_actor: usize,
    pub timeouts: OperationTimeouts,
    pub network: Option<String>,
    pub host_ip: String,
    pub stop_grace_secs: i64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_manifest(&ModuleHostConfigManifest::default())
    }
}

impl OrchestratorSettings {
    pub fn from_manifest(manifest: &ModuleHostConfigManifest) -> Self {
        let spec = &manifest.spec;
        Self {
            environment: spec.environment,
            image_policy: ImagePolicy::new(spec.registries.trusted.clone()),
            max_modules: spec.quotas.max_modules,
            max_modules_per_actor: spec.quotas.max_modules_per_actor,
            timeouts: spec.timeouts.resolve(),
            network: spec.runtime.network.clone(),
            host_ip: spec.runtime.host_ip.clone(),
            stop_grace_secs: spec.runtime.stop_grace_secs,
        }
    }
}

/// Everything the orchestrator drives, passed in explicitly.
pub struct Collaborators {
    pub modules: Arc<dyn ModuleRepository>,
    pub audit: Arc<dyn AuditLogRepository>,
    pub ports: Arc<dyn PortRegistry>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub proxy: Arc<dyn ProxyConfigurator>,
    pub license: Arc<dyn LicenseValidator>,
    pub sealer: Arc<LicenseSealer>,
    pub resolver: SecurityProfileResolver,
    pub event_bus: Arc<EventBus>,
}

// ============================================================================
// Standard Implementation
// ============================================================================

pub struct ModuleOrchestrator {
    pub(super) modules: Arc<dyn ModuleRepository>,
    pub(super) audit: Arc<dyn AuditLogRepository>,
    pub(super) ports: Arc<dyn PortRegistry>,
    pub(super) runtime: Arc<dyn ContainerRuntime>,
    pub(super) proxy: Arc<dyn ProxyConfigurator>,
    license: Arc<dyn LicenseValidator>,
    sealer: Arc<LicenseSealer>,
    resolver: SecurityProfileResolver,
    event_bus: Arc<EventBus>,
    pub(super) settings: OrchestratorSettings,
    pub(super) in_flight: DashMap<String, &'static str>,
    admission: tokio::sync::Mutex<()>,
}

/// Holds a module name in the in-flight set until dropped.
pub(super) struct OperationGuard<'a> {
    in_flight: &'a DashMap<String, &'static str>,
    module: String,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.module);
    }
}

/// Run `fut` under `limit`; expiry maps to [`OrchestratorError::Timeout`].
pub(super) async fn timed<T, E, F>(operation: &str, limit: Duration, fut: F) -> Result<T, OrchestratorError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<OrchestratorError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(OrchestratorError::Timeout {
            operation: operation.to_string(),
            after: limit,
        }),
    }
}

/// Metric outcome for an error raised before the saga touched anything.
/// Infrastructure faults (repository, license service timeouts) count as failures.
fn pre_flight_outcome(err: &OrchestratorError) -> &'static str {
    if err.is_rejection() {
        "rejected"
    } else {
        "failure"
    }
}

fn observe(operation: AuditOperation, outcome: &'static str, elapsed_ms: u64) {
    metrics::counter!("modman_operations_total", "operation" => operation.as_str(), "outcome" => outcome)
        .increment(1);
    metrics::histogram!("modman_operation_duration_seconds", "operation" => operation.as_str())
        .record(elapsed_ms as f64 / 1000.0);
}

impl ModuleOrchestrator {
    pub fn new(collaborators: Collaborators, settings: OrchestratorSettings) -> Self {
        Self {
            modules: collaborators.modules,
            audit: collaborators.audit,
            ports: collaborators.ports,
            runtime: collaborators.runtime,
            proxy: collaborators.proxy,
            license: collaborators.license,
            sealer: collaborators.sealer,
            resolver: collaborators.resolver,
            event_bus: collaborators.event_bus,
            settings,
            in_flight: DashMap::new(),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub(super) fn begin_operation(
        &self,
        name: &ModuleName,
        operation: &'static str,
    ) -> Result<OperationGuard<'_>, OrchestratorError> {
        match self.in_flight.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                debug!(module = %name, running = *entry.get(), requested = operation, "Rejecting reentrant operation");
                Err(OrchestratorError::InProgress(name.to_string()))
            }
            Entry::Vacant(entry) => {
                entry.insert(operation);
                Ok(OperationGuard {
                    in_flight: &self.in_flight,
                    module: name.to_string(),
                })
            }
        }
    }

    fn rejected(&self, operation: AuditOperation, module: &str, actor: &str, err: OrchestratorError) -> OrchestratorError {
        let outcome = pre_flight_outcome(&err);
        if err.is_rejection() {
            warn!(module, actor, operation = %operation, kind = err.kind(), "Rejected {}: {}", operation, err);
        } else {
            error!(module, actor, operation = %operation, kind = err.kind(), "{} failed before any side effect: {}", operation, err);
        }
        metrics::counter!("modman_operations_total", "operation" => operation.as_str(), "outcome" => outcome)
            .increment(1);
        err
    }

    fn parse_name(&self, name: &str, operation: AuditOperation, actor: &str) -> Result<ModuleName, OrchestratorError> {
        ModuleName::parse(name).map_err(|e| self.rejected(operation, name, actor, e.into()))
    }

    async fn find(&self, name: &ModuleName, operation: AuditOperation, actor: &str) -> Result<Module, OrchestratorError> {
        match self.modules.find_by_name(name).await? {
            Some(module) => Ok(module),
            None => Err(self.rejected(
                operation,
                name.as_str(),
                actor,
                OrchestratorError::NotFound(name.to_string()),
            )),
        }
    }

    /// Append to the audit trail. A failed append is logged, never dropped silently.
    pub(super) async fn record(&self, entry: AuditLogEntry) {
        if let Err(e) = self.audit.append(&entry).await {
            error!(
                module = %entry.module,
                operation = %entry.operation,
                outcome = entry.outcome.as_str(),
                "Failed to append audit entry: {}", e
            );
        }
    }

    /// Quota check and `installing` persist, serialized across all installs so
    /// concurrent requests cannot both squeeze under a limit.
    async fn admit(
        &self,
        validated: &ValidatedDescriptor,
        sealed_license: String,
        actor: &str,
    ) -> Result<Module, OrchestratorError> {
        let _admission = self.admission.lock().await;
        let name = &validated.name;

        let mut module = match self.modules.find_by_name(name).await? {
            Some(mut existing) if existing.state == ModuleState::Removed => {
                info!(module = %name, "Reinstalling previously removed module");
                existing.prepare_reinstall(validated, sealed_license, actor)?;
                existing
            }
            Some(_) => return Err(OrchestratorError::AlreadyInstalled(name.to_string())),
            None => Module::new(validated, sealed_license, actor),
        };

        let total = self.modules.count_live().await?;
        if total >= self.settings.max_modules {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "{} of {} modules already installed",
                total, self.settings.max_modules
            )));
        }

        let owned = self.modules.count_live_by_owner(actor).await?;
        if owned >= self.settings.max_modules_per_actor {
            return Err(OrchestratorError::QuotaExceeded(format!(
                "actor '{}' already owns {} of {} allowed modules",
                actor, owned, self.settings.max_modules_per_actor
            )));
        }

        module.begin_install()?;
        self.modules.save(&module).await?;
        Ok(module)
    }

    /// Steps 5-9 of an install. On error, returns the failing step; committed
    /// work is described by `stack`.
    async fn run_install_steps(
        &self,
        module: &mut Module,
        validated: &ValidatedDescriptor,
        deadline: &Deadline,
        stack: &mut CompensationStack,
    ) -> Result<(), (InstallStep, OrchestratorError)> {
        let t = self.settings.timeouts;
        let name = validated.name.clone();
        let descriptor = &validated.descriptor;
        let image = validated.image.to_string();

        // Pulling happens here: image labels are only readable once the image is local.
        let step = InstallStep::ResolveProfile;
        timed("image pull", deadline.bound(t.image_pull), self.runtime.pull_image(&image))
            .await
            .map_err(|e| (step, e))?;
        let labels = timed("image inspect", deadline.bound(t.health_probe), self.runtime.image_labels(&image))
            .await
            .map_err(|e| (step, e))?;
        let profile = self.resolver.resolve(&labels, self.settings.environment);
        let policy = self.resolver.policy_for(profile);
        module.security_profile = Some(profile);
        debug!(module = %name, profile = %profile, "Resolved security profile");

        let step = InstallStep::AllocatePorts;
        if !descriptor.internal_ports.is_empty() {
            stack.push(Compensation::ReleasePorts { module: name.clone() });
            let ports = timed(
                "port allocation",
                deadline.remaining(),
                self.ports.allocate(&name, &descriptor.internal_ports),
            )
            .await
            .map_err(|e| (step, e))?;
            metrics::counter!("modman_ports_allocated_total").increment(ports.len() as u64);
            info!(module = %name, ports = ?ports, "Allocated external ports");
            self.event_bus.publish(ModuleEvent::PortsAllocated {
                module: name.clone(),
                ports: ports.clone(),
                allocated_at: Utc::now(),
            });
            module.allocated_ports = ports;
        }

        let step = InstallStep::StartContainer;
        let container_name = name.container_name();
        let spec = ContainerSpec {
            name: container_name.clone(),
            image: image.clone(),
            env: descriptor.env.clone(),
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (MODULE_LABEL.to_string(), name.to_string()),
                ("modman.security.profile".to_string(), profile.to_string()),
            ]),
            port_bindings: module.allocated_ports.clone(),
            network: self.settings.network.clone(),
            host_ip: self.settings.host_ip.clone(),
            policy,
        };
        // Registered before the call: a create that times out may still have produced a container.
        stack.push(Compensation::RemoveContainer {
            container_id: container_name.clone(),
        });
        let container_id = timed("container create", deadline.bound(t.container_start), self.runtime.create(&spec))
            .await
            .map_err(|e| (step, e))?;
        module.container_id = Some(container_id.clone());
        stack.push(Compensation::StopContainer {
            container_id: container_id.clone(),
        });
        timed("container start", deadline.bound(t.container_start), self.runtime.start(&container_id))
            .await
            .map_err(|e| (step, e))?;
        self.event_bus.publish(ModuleEvent::ContainerStarted {
            module: name.clone(),
            container_id,
            profile,
            started_at: Utc::now(),
        });

        if descriptor.proxy_enabled {
            if let Some(&upstream_port) = descriptor.internal_ports.first() {
                let step = InstallStep::ApplyRoute;
                let route = ProxyRoute::for_module(&name, upstream_port, descriptor.websocket_enabled);
                stack.push(Compensation::RemoveRoute { module: name.clone() });
                timed("proxy reload", deadline.bound(t.proxy_reload), self.proxy.apply(&route))
                    .await
                    .map_err(|e| (step, e))?;
                self.event_bus.publish(ModuleEvent::RouteApplied {
                    module: name.clone(),
                    path_prefix: route.path_prefix.clone(),
                    applied_at: Utc::now(),
                });
                module.proxy_route = Some(route.path_prefix);
            }
        }

        let step = InstallStep::Finalize;
        if !module.allocated_ports.is_empty() {
            timed("port activation", deadline.remaining(), self.ports.activate(&name))
                .await
                .map_err(|e| (step, e))?;
        }
        module.mark_running().map_err(|e| (step, e.into()))?;
        self.modules.save(module).await.map_err(|e| (step, e.into()))?;

        Ok(())
    }

    /// Unwind committed steps, leave the record in `error`, write the single
    /// failure audit entry and build the aggregated error.
    async fn roll_back_install(
        &self,
        module: &mut Module,
        actor: &str,
        step: InstallStep,
        cause: OrchestratorError,
        stack: CompensationStack,
        deadline: &Deadline,
    ) -> OrchestratorError {
        warn!(
            module = %module.name,
            step = %step,
            compensations = stack.len(),
            "Install step failed, rolling back: {}", cause
        );

        let outcome = self.compensate(stack).await;
        let reason = format!("install step '{}' failed: {}", step, cause);
        module.mark_failed(reason.clone());
        if outcome.is_complete() {
            module.allocated_ports.clear();
            module.container_id = None;
            module.proxy_route = None;
        }
        if let Err(e) = self.modules.save(module).await {
            error!(module = %module.name, "Failed to persist error state after rollback: {}", e);
        }

        let detail = if outcome.is_complete() {
            reason
        } else {
            format!("{}; rollback incomplete: {}", reason, outcome.failures.join("; "))
        };
        self.record(
            AuditLogEntry::new(
                module.name.as_str(),
                AuditOperation::Install,
                actor,
                AuditOutcome::Failure,
                deadline.elapsed_ms(),
                detail,
            )
            .with_rollback(step.as_str(), outcome.executed.clone()),
        )
        .await;

        let rollback_outcome = if outcome.is_complete() { "complete" } else { "incomplete" };
        metrics::counter!("modman_rollbacks_total", "outcome" => rollback_outcome).increment(1);
        observe(AuditOperation::Install, "failure", deadline.elapsed_ms());
        self.event_bus.publish(ModuleEvent::InstallRolledBack {
            module: module.name.clone(),
            failed_step: step.as_str().to_string(),
            compensations: outcome.executed.clone(),
            complete: outcome.is_complete(),
            rolled_back_at: Utc::now(),
        });

        if outcome.is_complete() {
            OrchestratorError::StepFailed {
                step: step.as_str().to_string(),
                cause: Box::new(cause),
                rolled_back: outcome.executed,
            }
        } else {
            error!(
                module = %module.name,
                step = %step,
                rollback_incomplete = true,
                failures = ?outcome.failures,
                "Rollback incomplete, operator attention required"
            );
            OrchestratorError::RollbackIncomplete {
                step: step.as_str().to_string(),
                cause: Box::new(cause),
                rolled_back: outcome.executed,
                failures: outcome.failures,
            }
        }
    }

    /// Execute compensations newest-first. Every action runs even if an earlier one failed.
    async fn compensate(&self, stack: CompensationStack) -> RollbackOutcome {
        let t = self.settings.timeouts;
        let mut outcome = RollbackOutcome::default();

        for action in stack.unwind() {
            let result = match &action {
                Compensation::ReleasePorts { module } => {
                    timed("port release", t.operation_budget, self.ports.release(module))
                        .await
                        .map(|_| ())
                }
                Compensation::StopContainer { container_id } => {
                    timed(
                        "container stop",
                        t.container_stop,
                        self.runtime.stop(container_id, self.settings.stop_grace_secs),
                    )
                    .await
                }
                Compensation::RemoveContainer { container_id } => {
                    timed("container remove", t.container_stop, self.runtime.remove(container_id))
                        .await
                        .map(|_| ())
                }
                Compensation::RemoveRoute { module } => {
                    timed("proxy reload", t.proxy_reload, self.proxy.remove(module))
                        .await
                        .map(|_| ())
                }
            };

            match result {
                Ok(()) => {
                    debug!(compensation = action.name(), "Compensation applied");
                    outcome.executed.push(action.name().to_string());
                }
                Err(e) => {
                    error!(compensation = action.name(), rollback_incomplete = true, "Compensation failed: {}", e);
                    outcome.failures.push(format!("{}: {}", action.name(), e));
                }
            }
        }

        outcome
    }

    async fn probe(&self, container_id: &str, state: ModuleState) -> Probe {
        let limit = self.settings.timeouts.health_probe;
        match tokio::time::timeout(limit, self.runtime.inspect(container_id)).await {
            Ok(Ok(inspection)) => {
                let health = if !inspection.running {
                    if state == ModuleState::Stopped {
                        ModuleHealth::Unknown
                    } else {
                        ModuleHealth::Unhealthy
                    }
                } else {
                    match inspection.health {
                        ContainerHealth::Healthy | ContainerHealth::None => ModuleHealth::Healthy,
                        ContainerHealth::Unhealthy => ModuleHealth::Unhealthy,
                        ContainerHealth::Starting => ModuleHealth::Unknown,
                    }
                };

                let metrics = if inspection.running {
                    match tokio::time::timeout(limit, self.runtime.stats(container_id)).await {
                        Ok(Ok(stats)) => Some(stats),
                        Ok(Err(e)) => {
                            warn!(container = container_id, "Failed to read container stats: {}", e);
                            None
                        }
                        Err(_) => {
                            warn!(container = container_id, "Container stats timed out after {:?}", limit);
                            None
                        }
                    }
                } else {
                    None
                };

                Probe {
                    health,
                    container: Some(inspection),
                    metrics,
                    outcome: AuditOutcome::Success,
                    detail: None,
                }
            }
            Ok(Err(RuntimeError::NotFound(_))) => Probe {
                health: ModuleHealth::Unhealthy,
                container: None,
                metrics: None,
                outcome: AuditOutcome::Success,
                detail: Some("container not found".to_string()),
            },
            Ok(Err(e)) => Probe {
                health: ModuleHealth::Unknown,
                container: None,
                metrics: None,
                outcome: AuditOutcome::Failure,
                detail: Some(e.to_string()),
            },
            Err(_) => Probe {
                health: ModuleHealth::Unknown,
                container: None,
                metrics: None,
                outcome: AuditOutcome::Failure,
                detail: Some(format!("health probe timed out after {:?}", limit)),
            },
        }
    }

    /// Shared body of stop/start: run the runtime call, apply the transition, audit.
    async fn toggle(
        &self,
        name: &str,
        actor: &str,
        operation: AuditOperation,
    ) -> Result<Module, OrchestratorError> {
        let deadline = Deadline::new(self.settings.timeouts.operation_budget);
        let name = self.parse_name(name, operation, actor)?;
        let _guard = self
            .begin_operation(&name, operation.as_str())
            .map_err(|e| self.rejected(operation, name.as_str(), actor, e))?;
        let mut module = self.find(&name, operation, actor).await?;

        let required = match operation {
            AuditOperation::Stop => ModuleState::Running,
            _ => ModuleState::Stopped,
        };
        if module.state != required {
            return Err(self.rejected(
                operation,
                name.as_str(),
                actor,
                OrchestratorError::InvalidState(format!(
                    "cannot {} module '{}' in state {}",
                    operation, name, module.state
                )),
            ));
        }

        let target = module.container_id.clone().unwrap_or_else(|| name.container_name());
        let t = self.settings.timeouts;
        let result = match operation {
            AuditOperation::Stop => {
                timed(
                    "container stop",
                    deadline.bound(t.container_stop),
                    self.runtime.stop(&target, self.settings.stop_grace_secs),
                )
                .await
            }
            _ => timed("container start", deadline.bound(t.container_start), self.runtime.start(&target)).await,
        };

        if let Err(e) = result {
            self.record(AuditLogEntry::new(
                name.as_str(),
                operation,
                actor,
                AuditOutcome::Failure,
                deadline.elapsed_ms(),
                e.to_string(),
            ))
            .await;
            observe(operation, "failure", deadline.elapsed_ms());
            return Err(e);
        }

        let from = module.state;
        match operation {
            AuditOperation::Stop => module.mark_stopped()?,
            _ => module.mark_running()?,
        }
        self.modules.save(&module).await?;

        self.record(AuditLogEntry::new(
            name.as_str(),
            operation,
            actor,
            AuditOutcome::Success,
            deadline.elapsed_ms(),
            format!("{} -> {}", from, module.state),
        ))
        .await;
        observe(operation, "success", deadline.elapsed_ms());
        self.event_bus.publish(ModuleEvent::StateChanged {
            module: name.clone(),
            from,
            to: module.state,
            changed_at: Utc::now(),
        });
        info!(module = %name, actor, "Module {} -> {}", from, module.state);

        Ok(module)
    }
}

struct Probe {
    health: ModuleHealth,
    container: Option<ContainerInspection>,
    metrics: Option<ContainerStats>,
    outcome: AuditOutcome,
    detail: Option<String>,
}

#[async_trait]
impl ModuleService for ModuleOrchestrator {
    async fn install(&self, descriptor: ModuleDescriptor, actor: &str) -> Result<Module, OrchestratorError> {
        let deadline = Deadline::new(self.settings.timeouts.operation_budget);
        let op = AuditOperation::Install;

        let validated = descriptor
            .validate(&self.settings.image_policy)
            .map_err(|e| self.rejected(op, &descriptor.name, actor, e.into()))?;
        let name = validated.name.clone();

        // Taken before the first await so a concurrent install of the same name sees it.
        let _guard = self
            .begin_operation(&name, "install")
            .map_err(|e| self.rejected(op, name.as_str(), actor, e))?;

        info!(module = %name, actor, image = %validated.image, "Installing module");

        let grant = timed(
            "license check",
            deadline.bound(self.settings.timeouts.license_check),
            self.license.validate(&descriptor.license_key),
        )
        .await
        .map_err(|e| self.rejected(op, name.as_str(), actor, e))?;
        debug!(module = %name, license = %grant.fingerprint, "License accepted");

        let sealed = self
            .sealer
            .seal(&descriptor.license_key)
            .map_err(|e| self.rejected(op, name.as_str(), actor, e.into()))?;

        let mut module = self
            .admit(&validated, sealed, actor)
            .await
            .map_err(|e| self.rejected(op, name.as_str(), actor, e))?;

        self.event_bus.publish(ModuleEvent::InstallStarted {
            module: name.clone(),
            actor: actor.to_string(),
            started_at: Utc::now(),
        });

        let mut stack = CompensationStack::new();
        if let Err((step, cause)) = self
            .run_install_steps(&mut module, &validated, &deadline, &mut stack)
            .await
        {
            return Err(self
                .roll_back_install(&mut module, actor, step, cause, stack, &deadline)
                .await);
        }

        let duration_ms = deadline.elapsed_ms();
        let profile = module
            .security_profile
            .map(|p| p.to_string())
            .unwrap_or_else(|| "none".to_string());
        self.record(AuditLogEntry::new(
            name.as_str(),
            op,
            actor,
            AuditOutcome::Success,
            duration_ms,
            format!(
                "installed {} (profile {}, ports {:?}, route {})",
                module.image,
                profile,
                module.allocated_ports,
                module.proxy_route.as_deref().unwrap_or("none")
            ),
        ))
        .await;
        observe(op, "success", duration_ms);
        self.event_bus.publish(ModuleEvent::ModuleInstalled {
            module: name.clone(),
            duration_ms,
            installed_at: Utc::now(),
        });
        info!(module = %name, duration_ms, "Module installed and running");

        Ok(module)
    }

    async fn uninstall(&self, name: &str, actor: &str) -> Result<UninstallSummary, OrchestratorError> {
        let deadline = Deadline::new(self.settings.timeouts.operation_budget);
        let op = AuditOperation::Uninstall;
        let name = self.parse_name(name, op, actor)?;
        let _guard = self
            .begin_operation(&name, "uninstall")
            .map_err(|e| self.rejected(op, name.as_str(), actor, e))?;
        let mut module = self.find(&name, op, actor).await?;

        match module.state {
            ModuleState::Removed => {
                info!(module = %name, "Module already removed, nothing to tear down");
                self.record(AuditLogEntry::new(
                    name.as_str(),
                    op,
                    actor,
                    AuditOutcome::Success,
                    deadline.elapsed_ms(),
                    "already removed; nothing to tear down",
                ))
                .await;
                observe(op, "success", deadline.elapsed_ms());
                return Ok(UninstallSummary {
                    module: name.to_string(),
                    already_removed: true,
                    container_removed: false,
                    route_removed: false,
                    ports_released: 0,
                    released_ports: BTreeMap::new(),
                    duration_ms: deadline.elapsed_ms(),
                });
            }
            ModuleState::Uninstalling => {
                return Err(self.rejected(op, name.as_str(), actor, OrchestratorError::InProgress(name.to_string())));
            }
            ModuleState::Pending | ModuleState::Installing => {
                return Err(self.rejected(
                    op,
                    name.as_str(),
                    actor,
                    OrchestratorError::InvalidState(format!(
                        "module '{}' is {}; it can be uninstalled once it is running, stopped or in error",
                        name, module.state
                    )),
                ));
            }
            ModuleState::Running | ModuleState::Stopped | ModuleState::Error => {}
        }

        info!(module = %name, actor, from = %module.state, "Uninstalling module");
        let released_ports = module.allocated_ports.clone();
        module.begin_uninstall()?;
        self.modules.save(&module).await?;

        let t = self.settings.timeouts;
        let target = module.container_id.clone().unwrap_or_else(|| name.container_name());
        let mut failures = Vec::new();

        if let Err(e) = timed(
            "container stop",
            deadline.bound(t.container_stop),
            self.runtime.stop(&target, self.settings.stop_grace_secs),
        )
        .await
        {
            failures.push(format!("stop-container: {}", e));
        }

        let container_removed = match timed("container remove", deadline.bound(t.container_stop), self.runtime.remove(&target)).await {
            Ok(removed) => removed,
            Err(e) => {
                failures.push(format!("remove-container: {}", e));
                false
            }
        };

        let route_removed = match timed("proxy reload", deadline.bound(t.proxy_reload), self.proxy.remove(&name)).await {
            Ok(removed) => removed,
            Err(e) => {
                failures.push(format!("remove-route: {}", e));
                false
            }
        };

        let ports_released = match timed("port release", deadline.remaining(), self.ports.release(&name)).await {
            Ok(count) => count,
            Err(e) => {
                failures.push(format!("release-ports: {}", e));
                0
            }
        };

        if !failures.is_empty() {
            module.mark_failed(format!("teardown incomplete: {}", failures.join("; ")));
            if let Err(e) = self.modules.save(&module).await {
                error!(module = %name, "Failed to persist error state after teardown: {}", e);
            }
            self.record(AuditLogEntry::new(
                name.as_str(),
                op,
                actor,
                AuditOutcome::Failure,
                deadline.elapsed_ms(),
                format!("teardown incomplete: {}", failures.join("; ")),
            ))
            .await;
            observe(op, "failure", deadline.elapsed_ms());
            error!(module = %name, failures = ?failures, "Teardown incomplete, module left in error state");
            return Err(OrchestratorError::TeardownIncomplete {
                module: name.to_string(),
                failures,
            });
        }

        module.mark_removed()?;
        self.modules.save(&module).await?;

        let duration_ms = deadline.elapsed_ms();
        self.record(AuditLogEntry::new(
            name.as_str(),
            op,
            actor,
            AuditOutcome::Success,
            duration_ms,
            format!(
                "container {}, route {}, {} port(s) released",
                if container_removed { "removed" } else { "already absent" },
                if route_removed { "removed" } else { "already absent" },
                ports_released
            ),
        ))
        .await;
        observe(op, "success", duration_ms);
        self.event_bus.publish(ModuleEvent::ModuleUninstalled {
            module: name.clone(),
            released_ports: ports_released,
            uninstalled_at: Utc::now(),
        });
        info!(module = %name, duration_ms, "Module uninstalled");

        Ok(UninstallSummary {
            module: name.to_string(),
            already_removed: false,
            container_removed,
            route_removed,
            ports_released,
            released_ports,
            duration_ms,
        })
    }

    async fn status(&self, name: &str, actor: &str) -> Result<ModuleStatusReport, OrchestratorError> {
        let deadline = Deadline::new(self.settings.timeouts.operation_budget);
        let op = AuditOperation::StatusCheck;
        let name = self.parse_name(name, op, actor)?;
        let module = self.find(&name, op, actor).await?;

        let probe = match (&module.container_id, module.state) {
            (Some(id), ModuleState::Running | ModuleState::Stopped | ModuleState::Error) => {
                self.probe(id, module.state).await
            }
            _ => Probe {
                health: ModuleHealth::Unknown,
                container: None,
                metrics: None,
                outcome: AuditOutcome::Success,
                detail: Some(format!("no container in state {}", module.state)),
            },
        };

        if probe.health != module.health {
            debug!(module = %name, from = module.health.as_str(), to = probe.health.as_str(), "Reconciling health");
            self.modules.update_health(&name, probe.health).await?;
        }

        self.record(AuditLogEntry::new(
            name.as_str(),
            op,
            actor,
            probe.outcome,
            deadline.elapsed_ms(),
            probe
                .detail
                .clone()
                .unwrap_or_else(|| format!("health {}", probe.health.as_str())),
        ))
        .await;
        observe(op, probe.outcome.as_str(), deadline.elapsed_ms());

        Ok(ModuleStatusReport {
            name: module.name.to_string(),
            display_name: module.display_name,
            state: module.state,
            health: probe.health,
            allocated_ports: module.allocated_ports,
            proxy_route: module.proxy_route,
            security_profile: module.security_profile,
            container: probe.container,
            metrics: probe.metrics,
            detail: probe.detail,
            checked_at: Utc::now(),
        })
    }

    async fn stop(&self, name: &str, actor: &str) -> Result<Module, OrchestratorError> {
        self.toggle(name, actor, AuditOperation::Stop).await
    }

    async fn start(&self, name: &str, actor: &str) -> Result<Module, OrchestratorError> {
        self.toggle(name, actor, AuditOperation::Start).await
    }

    async fn list(&self, page: usize, per_page: usize) -> Result<ModulePage, OrchestratorError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, 100);
        Ok(self.modules.list(page, per_page).await?)
    }

    async fn audit_log(&self, query: AuditQuery) -> Result<Vec<AuditLogEntry>, OrchestratorError> {
        Ok(self.audit.query(&query).await?)
    }

    async fn health(&self) -> SubsystemHealth {
        let limit = self.settings.timeouts.health_probe;

        let registry = timed("port registry ping", limit, self.ports.ping()).await;
        let runtime = timed("runtime ping", limit, self.runtime.ping()).await;
        let proxy = timed("proxy health", limit, self.proxy.health()).await;

        let registry = ComponentHealth::from_result(&registry);
        let runtime = ComponentHealth::from_result(&runtime);
        let proxy = ComponentHealth::from_result(&proxy);

        let ports = if registry.healthy {
            timed("port registry", limit, self.ports.stats()).await.ok()
        } else {
            None
        };

        SubsystemHealth {
            healthy: registry.healthy && runtime.healthy && proxy.healthy,
            registry,
            runtime,
            proxy,
            ports,
        }
    }
}
