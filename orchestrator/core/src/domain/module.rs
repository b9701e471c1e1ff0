// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::security::{ImagePolicy, SecurityProfile};

static MODULE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("valid regex"));

static SEMVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^v?(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(-[0-9A-Za-z.-]+)?(\+[0-9A-Za-z.-]+)?$",
    )
    .expect("valid regex")
});

static REPOSITORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]+([._-][a-z0-9]+)*(/[a-z0-9]+([._-][a-z0-9]+)*)*$").expect("valid regex")
});

static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Returns true when `value` is a semantic version, optionally `v`-prefixed.
pub fn is_semver(value: &str) -> bool {
    SEMVER_RE.is_match(value)
}

// ============================================================================
// Value Objects
// ============================================================================

/// Unique identifier for a module record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleId(pub Uuid);

impl ModuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ModuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Module name: lowercase alphanumerics and hyphens, usable as a DNS label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModuleName(String);

impl ModuleName {
    pub fn parse(value: impl Into<String>) -> Result<Self, ModuleError> {
        let value = value.into();
        if !MODULE_NAME_RE.is_match(&value) {
            return Err(ModuleError::InvalidName(format!(
                "'{}' must be 1-63 lowercase alphanumerics or hyphens, starting and ending alphanumeric",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the container backing this module (also its DNS name on the module network).
    pub fn container_name(&self) -> String {
        format!("modman-{}", self.0)
    }

    /// Public path prefix routed to this module.
    pub fn route_prefix(&self) -> String {
        format!("/{}/", self.0)
    }
}

impl TryFrom<String> for ModuleName {
    type Error = ModuleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<ModuleName> for String {
    fn from(name: ModuleName) -> Self {
        name.0
    }
}

impl std::fmt::Display for ModuleName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fully qualified image reference: `registry/repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Parse an image reference. The registry and an explicit semantic-version
    /// tag are mandatory; `latest` and digest references are rejected.
    pub fn parse(image: &str) -> Result<Self, ModuleError> {
        if image.is_empty() || image.chars().any(char::is_whitespace) {
            return Err(ModuleError::InvalidImage(format!("'{}' is not a valid image reference", image)));
        }
        if image.contains('@') {
            return Err(ModuleError::InvalidImage(format!(
                "'{}': digest references are not accepted, use an explicit version tag",
                image
            )));
        }

        let (name, tag) = match image.rfind(':') {
            Some(idx) if !image[idx + 1..].contains('/') => (&image[..idx], &image[idx + 1..]),
            _ => {
                return Err(ModuleError::InvalidImage(format!(
                    "'{}' has no tag; an explicit version tag is required",
                    image
                )))
            }
        };

        let (registry, repository) = match name.split_once('/') {
            Some((registry, repository)) if looks_like_registry(registry) => (registry, repository),
            _ => {
                return Err(ModuleError::InvalidImage(format!(
                    "'{}' must name its registry explicitly (e.g. registry.example.com/app:1.0.0)",
                    image
                )))
            }
        };

        if !REPOSITORY_RE.is_match(repository) {
            return Err(ModuleError::InvalidImage(format!(
                "'{}' is not a valid repository path",
                repository
            )));
        }

        if tag.eq_ignore_ascii_case("latest") {
            return Err(ModuleError::InvalidImage(format!(
                "'{}': the 'latest' tag is forbidden",
                image
            )));
        }

        if !is_semver(tag) {
            return Err(ModuleError::InvalidImage(format!(
                "'{}': tag '{}' is not a semantic version",
                image, tag
            )));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

fn looks_like_registry(component: &str) -> bool {
    component == "localhost" || component.contains('.') || component.contains(':')
}

/// Module lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Record created, nothing provisioned yet
    Pending,
    /// Install in progress
    Installing,
    /// Container up and routed
    Running,
    /// Manually stopped; ports and route are retained
    Stopped,
    /// Teardown in progress
    Uninstalling,
    /// Torn down; record retained for history
    Removed,
    /// Unrecoverable failure, requires uninstall
    Error,
}

impl ModuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Uninstalling => "uninstalling",
            Self::Removed => "removed",
            Self::Error => "error",
        }
    }

    pub fn can_transition_to(&self, next: ModuleState) -> bool {
        use ModuleState::*;
        match (self, next) {
            (Pending, Installing) => true,
            (Installing, Running) => true,
            (Running, Stopped) | (Stopped, Running) => true,
            (Running | Stopped | Error, Uninstalling) => true,
            (Uninstalling, Removed) => true,
            (Removed, Pending) => true,
            (Removed, Error) | (Error, Error) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// States that count against quotas and hold resources.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Removed)
    }
}

impl std::fmt::Display for ModuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModuleState {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "installing" => Ok(Self::Installing),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "uninstalling" => Ok(Self::Uninstalling),
            "removed" => Ok(Self::Removed),
            "error" => Ok(Self::Error),
            other => Err(ModuleError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleHealth {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

impl ModuleHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for ModuleHealth {
    type Err = ModuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "unhealthy" => Ok(Self::Unhealthy),
            "unknown" => Ok(Self::Unknown),
            other => Err(ModuleError::InvalidState(other.to_string())),
        }
    }
}

// ============================================================================
// Install descriptor
// ============================================================================

fn default_true() -> bool {
    true
}

/// Install request body submitted by a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDescriptor {
    pub name: String,
    pub display_name: String,
    pub image: String,
    pub version: String,
    pub license_key: String,
    #[serde(default, alias = "ports")]
    pub internal_ports: Vec<u16>,
    #[serde(default = "default_true")]
    pub proxy_enabled: bool,
    #[serde(default)]
    pub websocket_enabled: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Descriptor that passed validation; carries the parsed identity.
#[derive(Debug, Clone)]
pub struct ValidatedDescriptor {
    pub name: ModuleName,
    pub image: ImageReference,
    pub descriptor: ModuleDescriptor,
}

impl ModuleDescriptor {
    /// Validate every field without touching any resource.
    pub fn validate(&self, policy: &ImagePolicy) -> Result<ValidatedDescriptor, ModuleError> {
        let name = ModuleName::parse(self.name.clone())?;

        if self.display_name.trim().is_empty() {
            return Err(ModuleError::InvalidDescriptor("displayName cannot be empty".to_string()));
        }

        if !is_semver(&self.version) {
            return Err(ModuleError::InvalidVersion(self.version.clone()));
        }

        let image = ImageReference::parse(&self.image)?;
        policy.check(&image)?;

        if self.license_key.trim().is_empty() {
            return Err(ModuleError::InvalidDescriptor("licenseKey cannot be empty".to_string()));
        }

        let mut seen = BTreeSet::new();
        for port in &self.internal_ports {
            if *port == 0 {
                return Err(ModuleError::InvalidDescriptor("internal port 0 is not allowed".to_string()));
            }
            if !seen.insert(*port) {
                return Err(ModuleError::InvalidDescriptor(format!(
                    "internal port {} declared twice",
                    port
                )));
            }
        }
        if self.proxy_enabled && self.internal_ports.is_empty() {
            return Err(ModuleError::InvalidDescriptor(
                "proxy routing requires at least one internal port".to_string(),
            ));
        }

        for key in self.env.keys() {
            if !ENV_KEY_RE.is_match(key) {
                return Err(ModuleError::InvalidDescriptor(format!(
                    "invalid environment variable name '{}'",
                    key
                )));
            }
        }

        Ok(ValidatedDescriptor {
            name,
            image,
            descriptor: self.clone(),
        })
    }
}

// ============================================================================
// Aggregate Root: Module
// ============================================================================

/// Installed module record. Retained after uninstall with state `removed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: ModuleId,
    pub name: ModuleName,
    pub display_name: String,
    pub image: String,
    pub version: String,
    pub state: ModuleState,
    pub health: ModuleHealth,
    /// internal port -> external port
    pub allocated_ports: BTreeMap<u16, u16>,
    pub proxy_route: Option<String>,
    pub websocket_enabled: bool,
    pub security_profile: Option<SecurityProfile>,
    pub container_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub encrypted_license: String,
    pub created_by: String,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub installed_at: Option<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl Module {
    /// Create a fresh `pending` record for a validated descriptor.
    pub fn new(validated: &ValidatedDescriptor, encrypted_license: String, created_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ModuleId::new(),
            name: validated.name.clone(),
            display_name: validated.descriptor.display_name.clone(),
            image: validated.image.to_string(),
            version: validated.descriptor.version.clone(),
            state: ModuleState::Pending,
            health: ModuleHealth::Unknown,
            allocated_ports: BTreeMap::new(),
            proxy_route: None,
            websocket_enabled: validated.descriptor.websocket_enabled,
            security_profile: None,
            container_id: None,
            encrypted_license,
            created_by: created_by.into(),
            last_error: None,
            created_at: now,
            updated_at: now,
            installed_at: None,
            removed_at: None,
        }
    }

    /// Reuse a `removed` record for a new install; identity and creation time are kept.
    pub fn prepare_reinstall(
        &mut self,
        validated: &ValidatedDescriptor,
        encrypted_license: String,
        created_by: impl Into<String>,
    ) -> Result<(), ModuleError> {
        self.transition(ModuleState::Pending)?;
        self.display_name = validated.descriptor.display_name.clone();
        self.image = validated.image.to_string();
        self.version = validated.descriptor.version.clone();
        self.websocket_enabled = validated.descriptor.websocket_enabled;
        self.health = ModuleHealth::Unknown;
        self.allocated_ports.clear();
        self.proxy_route = None;
        self.security_profile = None;
        self.container_id = None;
        self.encrypted_license = encrypted_license;
        self.created_by = created_by.into();
        self.last_error = None;
        self.installed_at = None;
        self.removed_at = None;
        Ok(())
    }

    fn transition(&mut self, next: ModuleState) -> Result<(), ModuleError> {
        if !self.state.can_transition_to(next) {
            return Err(ModuleError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn begin_install(&mut self) -> Result<(), ModuleError> {
        self.transition(ModuleState::Installing)
    }

    pub fn mark_running(&mut self) -> Result<(), ModuleError> {
        let first_install = self.state == ModuleState::Installing;
        self.transition(ModuleState::Running)?;
        if first_install {
            self.installed_at = Some(self.updated_at);
        }
        self.last_error = None;
        Ok(())
    }

    pub fn mark_stopped(&mut self) -> Result<(), ModuleError> {
        self.transition(ModuleState::Stopped)?;
        self.health = ModuleHealth::Unknown;
        Ok(())
    }

    pub fn begin_uninstall(&mut self) -> Result<(), ModuleError> {
        self.transition(ModuleState::Uninstalling)
    }

    /// Finish teardown. Resource bindings are cleared; the record itself stays.
    pub fn mark_removed(&mut self) -> Result<(), ModuleError> {
        self.transition(ModuleState::Removed)?;
        self.allocated_ports.clear();
        self.proxy_route = None;
        self.container_id = None;
        self.health = ModuleHealth::Unknown;
        self.removed_at = Some(self.updated_at);
        Ok(())
    }

    /// Move to `error` from any state except `removed`.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.state != ModuleState::Error && self.transition(ModuleState::Error).is_err() {
            return;
        }
        self.health = ModuleHealth::Unknown;
        self.last_error = Some(reason);
        self.updated_at = Utc::now();
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Invalid module name: {0}")]
    InvalidName(String),

    #[error("Invalid version '{0}': expected a semantic version")]
    InvalidVersion(String),

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Registry '{0}' is not on the trusted registry allow-list")]
    UntrustedRegistry(String),

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: ModuleState, to: ModuleState },
}
