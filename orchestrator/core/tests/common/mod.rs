// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the orchestrator integration tests: a scriptable
//! container runtime, a proxy controller that lints fragments the way
//! `nginx -t` would, and a harness wiring them to in-memory repositories.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use modman_core::application::module_orchestrator::{Collaborators, ModuleOrchestrator, OrchestratorSettings};
use modman_core::domain::module::{ModuleDescriptor, ModuleName};
use modman_core::domain::port::{PortAllocation, PortError, PortRange, PortRegistry, PortStats};
use modman_core::domain::proxy::{ProxyController, ProxyError};
use modman_core::domain::runtime::{
    ContainerHealth, ContainerInspection, ContainerRuntime, ContainerSpec, ContainerStats, ManagedContainer,
    RuntimeError, MANAGED_LABEL, MODULE_LABEL,
};
use modman_core::domain::security::{ImagePolicy, SecurityProfileResolver};
use modman_core::infrastructure::event_bus::EventBus;
use modman_core::infrastructure::license::{fingerprint, LicenseSealer, RevocationListValidator};
use modman_core::infrastructure::port_registry::InMemoryPortRegistry;
use modman_core::infrastructure::proxy::NginxProxyConfigurator;
use modman_core::infrastructure::repositories::{InMemoryAuditLogRepository, InMemoryModuleRepository};

pub const REGISTRY: &str = "registry.example.com";
pub const VALID_LICENSE: &str = "LIC-ACME-0001";
pub const REVOKED_LICENSE: &str = "LIC-REVOKED-0001";

// ============================================================================
// Fake container runtime
// ============================================================================

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub spec: Option<ContainerSpec>,
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<BTreeMap<String, FakeContainer>>,
    image_labels: Mutex<HashMap<String, HashMap<String, String>>>,
    next_id: AtomicUsize,

    pub pulls: AtomicUsize,
    pub creates: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub removes: AtomicUsize,

    pub fail_pull: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_remove: AtomicBool,
    pub unreachable: AtomicBool,
    pull_delay: Mutex<Duration>,
    start_delay: Mutex<Duration>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock() = delay;
    }

    pub fn set_start_delay(&self, delay: Duration) {
        *self.start_delay.lock() = delay;
    }

    pub fn set_image_labels(&self, image: &str, labels: HashMap<String, String>) {
        self.image_labels.lock().insert(image.to_string(), labels);
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.containers.lock().values().cloned().collect()
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().values().find(|c| c.name == name).cloned()
    }

    /// Plant a managed container the orchestrator has no record of.
    pub fn plant_container(&self, name: &str, module: &str, running: bool) -> String {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let labels = HashMap::from([
            (MANAGED_LABEL.to_string(), "true".to_string()),
            (MODULE_LABEL.to_string(), module.to_string()),
        ]);
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                image: format!("{}/acme/{}:1.0.0", REGISTRY, module),
                labels,
                running,
                spec: None,
            },
        );
        id
    }

    fn resolve_id(&self, id_or_name: &str) -> Option<String> {
        let containers = self.containers.lock();
        if containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        containers
            .values()
            .find(|c| c.name == id_or_name)
            .map(|c| c.id.clone())
    }

    fn check_reachable(&self) -> Result<(), RuntimeError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("docker daemon not responding".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.check_reachable()
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        self.pulls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.pull_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_pull.load(Ordering::SeqCst) {
            return Err(RuntimeError::PullFailed(format!("{}: manifest unknown", image)));
        }
        Ok(())
    }

    async fn image_labels(&self, image: &str) -> Result<HashMap<String, String>, RuntimeError> {
        Ok(self.image_labels.lock().get(image).cloned().unwrap_or_default())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.check_reachable()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.resolve_id(&spec.name).is_some() {
            return Err(RuntimeError::CreateFailed(format!("name {} already in use", spec.name)));
        }
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                labels: spec.labels.clone(),
                running: false,
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        self.starts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::StartFailed(format!("{}: exec format error", id)));
        }
        let id = self
            .resolve_id(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(container) = self.containers.lock().get_mut(&id) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _grace_secs: i64) -> Result<(), RuntimeError> {
        self.check_reachable()?;
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(id) = self.resolve_id(id) {
            if let Some(container) = self.containers.lock().get_mut(&id) {
                container.running = false;
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, RuntimeError> {
        self.check_reachable()?;
        self.removes.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(RuntimeError::RemoveFailed(format!("{}: device or resource busy", id)));
        }
        match self.resolve_id(id) {
            Some(id) => Ok(self.containers.lock().remove(&id).is_some()),
            None => Ok(false),
        }
    }

    async fn inspect(&self, id: &str) -> Result<ContainerInspection, RuntimeError> {
        self.check_reachable()?;
        let id = self
            .resolve_id(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let containers = self.containers.lock();
        let container = containers
            .get(&id)
            .ok_or_else(|| RuntimeError::NotFound(id.clone()))?;
        Ok(ContainerInspection {
            id: container.id.clone(),
            name: container.name.clone(),
            running: container.running,
            status: if container.running { "running" } else { "exited" }.to_string(),
            health: ContainerHealth::None,
            restart_count: 0,
            started_at: None,
        })
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError> {
        self.check_reachable()?;
        self.resolve_id(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(ContainerStats {
            cpu_percent: 1.5,
            memory_usage_bytes: 64 * 1024 * 1024,
            memory_limit_bytes: 512 * 1024 * 1024,
            network_rx_bytes: 1024,
            network_tx_bytes: 2048,
            uptime_seconds: 42,
            restart_count: 0,
        })
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError> {
        self.check_reachable()?;
        Ok(self
            .containers
            .lock()
            .values()
            .filter(|c| c.labels.get(MANAGED_LABEL).map(String::as_str) == Some("true"))
            .map(|c| ManagedContainer {
                id: c.id.clone(),
                name: c.name.clone(),
                module: c.labels.get(MODULE_LABEL).cloned(),
                running: c.running,
            })
            .collect())
    }
}

// ============================================================================
// Fake proxy controller
// ============================================================================

/// Lints every fragment in the directory: balanced braces, and every
/// directive line terminated by `;`.
pub struct LintingProxyController {
    dir: PathBuf,
    pub fail_validate: AtomicBool,
    pub fail_reload: AtomicBool,
    pub validations: AtomicUsize,
    pub reloads: AtomicUsize,
}

impl LintingProxyController {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            fail_validate: AtomicBool::new(false),
            fail_reload: AtomicBool::new(false),
            validations: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
        }
    }

    fn lint(path: &Path) -> Result<(), String> {
        let contents = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let mut depth: i32 = 0;
        for (n, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            depth += line.matches('{').count() as i32;
            depth -= line.matches('}').count() as i32;
            if depth < 0 {
                return Err(format!("{}:{} unexpected \"}}\"", path.display(), n + 1));
            }
            if !(line.ends_with('{') || line.ends_with('}') || line.ends_with(';')) {
                return Err(format!("{}:{} directive is not terminated by \";\"", path.display(), n + 1));
            }
        }
        if depth != 0 {
            return Err(format!("{} unexpected end of file, expecting \"}}\"", path.display()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyController for LintingProxyController {
    async fn validate(&self) -> Result<(), ProxyError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.fail_validate.load(Ordering::SeqCst) {
            return Err(ProxyError::ConfigInvalid("nginx: [emerg] injected failure".to_string()));
        }
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("conf") {
                Self::lint(&path).map_err(ProxyError::ConfigInvalid)?;
            }
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(ProxyError::Reload("nginx: [alert] kill(1234, 1) failed".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Port registry with a switchable liveness check
// ============================================================================

/// In-memory registry whose `ping` can be made to fail while the table stays readable.
pub struct FakePortRegistry {
    inner: InMemoryPortRegistry,
    pub unreachable: AtomicBool,
}

impl FakePortRegistry {
    pub fn new(range: PortRange) -> Self {
        Self {
            inner: InMemoryPortRegistry::new(range),
            unreachable: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PortRegistry for FakePortRegistry {
    async fn allocate(&self, module: &ModuleName, internal_ports: &[u16]) -> Result<BTreeMap<u16, u16>, PortError> {
        self.inner.allocate(module, internal_ports).await
    }

    async fn activate(&self, module: &ModuleName) -> Result<(), PortError> {
        self.inner.activate(module).await
    }

    async fn release(&self, module: &ModuleName) -> Result<usize, PortError> {
        self.inner.release(module).await
    }

    async fn stats(&self) -> Result<PortStats, PortError> {
        self.inner.stats().await
    }

    async fn allocations_for(&self, module: &ModuleName) -> Result<Vec<PortAllocation>, PortError> {
        self.inner.allocations_for(module).await
    }

    async fn holders(&self) -> Result<Vec<ModuleName>, PortError> {
        self.inner.holders().await
    }

    async fn ping(&self) -> Result<(), PortError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(PortError::Storage("connection refused".to_string()));
        }
        self.inner.ping().await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub orchestrator: Arc<ModuleOrchestrator>,
    pub runtime: Arc<FakeRuntime>,
    pub controller: Arc<LintingProxyController>,
    pub proxy: Arc<NginxProxyConfigurator>,
    pub ports: Arc<FakePortRegistry>,
    pub modules: Arc<InMemoryModuleRepository>,
    pub audit: Arc<InMemoryAuditLogRepository>,
    pub events: EventBus,
    pub routes_dir: PathBuf,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(PortRange::default(), |_| {})
    }

    pub fn with_range(range: PortRange) -> Self {
        Self::with(range, |_| {})
    }

    pub fn with(range: PortRange, configure: impl FnOnce(&mut OrchestratorSettings)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let routes_dir = dir.path().join("modman.d");

        let runtime = Arc::new(FakeRuntime::new());
        let controller = Arc::new(LintingProxyController::new(routes_dir.clone()));
        let proxy = Arc::new(NginxProxyConfigurator::new(routes_dir.clone(), controller.clone()));
        let ports = Arc::new(FakePortRegistry::new(range));
        let modules = Arc::new(InMemoryModuleRepository::new());
        let audit = Arc::new(InMemoryAuditLogRepository::new());
        let events = EventBus::new(256);

        let mut settings = OrchestratorSettings::default();
        settings.image_policy = ImagePolicy::new(vec![REGISTRY.to_string(), "localhost".to_string()]);
        configure(&mut settings);

        let orchestrator = Arc::new(ModuleOrchestrator::new(
            Collaborators {
                modules: modules.clone(),
                audit: audit.clone(),
                ports: ports.clone(),
                runtime: runtime.clone(),
                proxy: proxy.clone(),
                license: Arc::new(RevocationListValidator::new(vec![fingerprint(REVOKED_LICENSE)])),
                sealer: Arc::new(LicenseSealer::new("integration-test-secret")),
                resolver: SecurityProfileResolver::default(),
                event_bus: Arc::new(events.clone()),
            },
            settings,
        ));

        Self {
            orchestrator,
            runtime,
            controller,
            proxy,
            ports,
            modules,
            audit,
            events,
            routes_dir,
            _dir: dir,
        }
    }

    pub fn fragment(&self, module: &str) -> Option<String> {
        std::fs::read_to_string(self.routes_dir.join(format!("{}.conf", module))).ok()
    }
}

pub fn image_for(name: &str) -> String {
    format!("{}/acme/{}:1.2.0", REGISTRY, name)
}

pub fn descriptor(name: &str, ports: &[u16]) -> ModuleDescriptor {
    ModuleDescriptor {
        name: name.to_string(),
        display_name: format!("{} module", name),
        image: image_for(name),
        version: "1.2.0".to_string(),
        license_key: VALID_LICENSE.to_string(),
        internal_ports: ports.to_vec(),
        proxy_enabled: !ports.is_empty(),
        websocket_enabled: false,
        env: BTreeMap::new(),
    }
}
