// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Module Host Configuration
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) consumed by the
// daemon. Covers:
// - Port range, registry allow-list and install quotas
// - Deployment environment (drives the default security profile)
// - Proxy fragment directory and control commands
// - Container runtime connection, network and resource ceilings
// - Per-step timeouts and the total operation budget
// - Storage backend, API listener and observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::port::PortRange;
use crate::domain::repository::{PostgresConfig, StorageBackend};
use crate::domain::security::{DeploymentEnvironment, ResourceCeilings};

pub const API_VERSION: &str = "modman/v1";
pub const KIND: &str = "ModuleHostConfig";

/// Top-level module host configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleHostConfigManifest {
    /// API version (must be "modman/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ModuleHostConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    #[serde(default)]
    pub spec: ModuleHostSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleHostSpec {
    pub environment: DeploymentEnvironment,
    pub ports: PortsConfig,
    pub registries: RegistriesConfig,
    pub quotas: QuotasConfig,
    pub proxy: ProxyConfig,
    pub runtime: RuntimeConfig,
    pub timeouts: TimeoutsConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
    pub license: LicenseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub start: u16,
    pub end: u16,
}

impl Default for PortsConfig {
    fn default() -> Self {
        let range = PortRange::default();
        Self {
            start: range.start,
            end: range.end,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistriesConfig {
    /// Registries images may be pulled from (host[:port])
    pub trusted: Vec<String>,
}

impl Default for RegistriesConfig {
    fn default() -> Self {
        Self {
            trusted: vec!["localhost".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotasConfig {
    pub max_modules: usize,
    pub max_modules_per_actor: usize,
}

impl Default for QuotasConfig {
    fn default() -> Self {
        Self {
            max_modules: 50,
            max_modules_per_actor: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Directory holding one `<module>.conf` fragment per module
    pub config_dir: PathBuf,
    pub validate_command: Vec<String>,
    pub reload_command: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/nginx/modman.d"),
            validate_command: vec!["nginx".to_string(), "-t".to_string()],
            reload_command: vec!["nginx".to_string(), "-s".to_string(), "reload".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker socket path; local defaults when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket: Option<String>,
    /// Network shared by module containers and the proxy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Host address external ports are bound on
    pub host_ip: String,
    /// `uid:gid` used by the strict profile
    pub strict_user: String,
    pub memory_mb: i64,
    pub cpus: f64,
    pub pids_limit: i64,
    /// Seconds a container gets to exit on stop before it is killed
    pub stop_grace_secs: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_socket: None,
            network: Some("modman".to_string()),
            host_ip: "127.0.0.1".to_string(),
            strict_user: "10001:10001".to_string(),
            memory_mb: 512,
            cpus: 1.0,
            pids_limit: 256,
            stop_grace_secs: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn resource_ceilings(&self) -> ResourceCeilings {
        ResourceCeilings {
            memory_bytes: self.memory_mb * 1024 * 1024,
            nano_cpus: (self.cpus * 1_000_000_000.0) as i64,
            pids_limit: self.pids_limit,
        }
    }
}

/// Timeouts in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub image_pull_secs: u64,
    pub container_start_secs: u64,
    pub container_stop_secs: u64,
    pub health_probe_secs: u64,
    pub proxy_reload_secs: u64,
    pub license_check_secs: u64,
    /// Wall-clock budget for a whole lifecycle operation
    pub operation_budget_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            image_pull_secs: 300,
            container_start_secs: 60,
            container_stop_secs: 30,
            health_probe_secs: 10,
            proxy_reload_secs: 15,
            license_check_secs: 10,
            operation_budget_secs: 600,
        }
    }
}

/// Timeouts resolved to durations, as consumed by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub image_pull: Duration,
    pub container_start: Duration,
    pub container_stop: Duration,
    pub health_probe: Duration,
    pub proxy_reload: Duration,
    pub license_check: Duration,
    pub operation_budget: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        TimeoutsConfig::default().resolve()
    }
}

impl TimeoutsConfig {
    pub fn resolve(&self) -> OperationTimeouts {
        OperationTimeouts {
            image_pull: Duration::from_secs(self.image_pull_secs),
            container_start: Duration::from_secs(self.container_start_secs),
            container_stop: Duration::from_secs(self.container_stop_secs),
            health_probe: Duration::from_secs(self.health_probe_secs),
            proxy_reload: Duration::from_secs(self.proxy_reload_secs),
            license_check: Duration::from_secs(self.license_check_secs),
            operation_budget: Duration::from_secs(self.operation_budget_secs),
        }
    }

    fn all(&self) -> [(&'static str, u64); 7] {
        [
            ("image_pull_secs", self.image_pull_secs),
            ("container_start_secs", self.container_start_secs),
            ("container_stop_secs", self.container_stop_secs),
            ("health_probe_secs", self.health_probe_secs),
            ("proxy_reload_secs", self.proxy_reload_secs),
            ("license_check_secs", self.license_check_secs),
            ("operation_budget_secs", self.operation_budget_secs),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageKind::Memory,
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8700,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,
    /// Output format ("compact" or "json")
    pub log_format: String,
    /// Prometheus exporter port; disabled when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            metrics_port: Some(9464),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LicenseConfig {
    /// SHA-256 fingerprints (hex) of revoked license keys
    pub revoked: Vec<String>,
    /// Secret used to seal license keys at rest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sealing_key: Option<String>,
}

impl Default for ModuleHostConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "modman".to_string(),
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ModuleHostSpec::default(),
        }
    }
}

impl ModuleHostConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. MODMAN_CONFIG_PATH environment variable
    /// 2. ./modman-config.yaml (working directory)
    /// 3. ~/.modman/config.yaml (user home)
    /// 4. /etc/modman/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("MODMAN_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./modman-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".modman").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/modman/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        let mut config = match Self::discover_config() {
            Some(config_path) => {
                tracing::info!("Loading configuration from discovered path: {:?}", config_path);
                Self::from_yaml_file(config_path)?
            }
            None => {
                tracing::warn!("No configuration file found in standard locations. Using defaults.");
                Self::default()
            }
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides so container deployments can
    /// adjust the manifest without editing it.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("MODMAN_ENVIRONMENT") {
            match val.parse::<DeploymentEnvironment>() {
                Ok(env) => {
                    tracing::info!("Environment override: MODMAN_ENVIRONMENT={}", val);
                    self.spec.environment = env;
                }
                Err(e) => tracing::warn!("Invalid value for MODMAN_ENVIRONMENT: {}. Ignoring.", e),
            }
        }

        if let Some(url) = lookup("MODMAN_DATABASE_URL") {
            tracing::info!("Environment override: MODMAN_DATABASE_URL (postgres backend)");
            self.spec.storage.backend = StorageKind::Postgres;
            self.spec.storage.database_url = Some(url);
        }

        if let Some(dir) = lookup("MODMAN_PROXY_CONFIG_DIR") {
            tracing::info!("Environment override: MODMAN_PROXY_CONFIG_DIR={}", dir);
            self.spec.proxy.config_dir = PathBuf::from(dir);
        }

        if let Some(key) = lookup("MODMAN_LICENSE_SEALING_KEY") {
            tracing::info!("Environment override: MODMAN_LICENSE_SEALING_KEY");
            self.spec.license.sealing_key = Some(key);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        self.port_range()?;

        if self.spec.registries.trusted.is_empty() {
            anyhow::bail!("spec.registries.trusted must list at least one registry");
        }
        if self.spec.registries.trusted.iter().any(|r| r.trim().is_empty()) {
            anyhow::bail!("spec.registries.trusted contains an empty entry");
        }

        if self.spec.quotas.max_modules == 0 || self.spec.quotas.max_modules_per_actor == 0 {
            anyhow::bail!("spec.quotas limits must be greater than zero");
        }

        for (name, secs) in self.spec.timeouts.all() {
            if secs == 0 {
                anyhow::bail!("spec.timeouts.{} must be greater than zero", name);
            }
        }

        let ceilings = self.spec.runtime.resource_ceilings();
        if ceilings.memory_bytes <= 0 || ceilings.nano_cpus <= 0 || ceilings.pids_limit <= 0 {
            anyhow::bail!("spec.runtime resource ceilings must be greater than zero");
        }

        if self.spec.proxy.validate_command.is_empty() || self.spec.proxy.reload_command.is_empty() {
            anyhow::bail!("spec.proxy validate and reload commands cannot be empty");
        }

        if self.spec.storage.backend == StorageKind::Postgres
            && self.spec.storage.database_url.as_deref().is_none_or(str::is_empty)
        {
            anyhow::bail!("spec.storage.database_url is required for the postgres backend");
        }

        Ok(())
    }

    pub fn port_range(&self) -> anyhow::Result<PortRange> {
        PortRange::new(self.spec.ports.start, self.spec.ports.end)
            .map_err(|e| anyhow::anyhow!("spec.ports: {}", e))
    }

    pub fn storage_backend(&self) -> StorageBackend {
        match (&self.spec.storage.backend, &self.spec.storage.database_url) {
            (StorageKind::Postgres, Some(url)) => StorageBackend::PostgreSQL(PostgresConfig {
                connection_string: url.clone(),
                max_connections: self.spec.storage.max_connections,
            }),
            _ => StorageBackend::InMemory,
        }
    }
}
