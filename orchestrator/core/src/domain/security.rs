// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Container sandboxing
//!
//! Resolves a module's [`SecurityProfile`] from image labels or the
//! deployment environment, and expands it into the concrete
//! [`SandboxPolicy`] handed to the container runtime. The always-on
//! constraints (no privileged mode, `no-new-privileges`, resource
//! ceilings, trusted registry) live here too and are not label-controlled.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::domain::module::{ImageReference, ModuleError};

/// Image label a module author uses to declare the profile it needs.
pub const SECURITY_PROFILE_LABEL: &str = "security.profile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityProfile {
    /// Fixed non-root UID, all capabilities dropped, read-only root filesystem
    Strict,
    /// Root allowed, writable filesystem, default capability set
    Relaxed,
}

impl SecurityProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Relaxed => "relaxed",
        }
    }
}

impl std::fmt::Display for SecurityProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SecurityProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "relaxed" => Ok(Self::Relaxed),
            other => Err(format!("unknown security profile '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentEnvironment {
    #[default]
    Development,
    Staging,
    Production,
}

impl DeploymentEnvironment {
    pub fn default_profile(&self) -> SecurityProfile {
        match self {
            Self::Production => SecurityProfile::Strict,
            Self::Development | Self::Staging => SecurityProfile::Relaxed,
        }
    }
}

impl std::str::FromStr for DeploymentEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// CPU, memory and process-count ceilings applied to every module container.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceCeilings {
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
}

impl Default for ResourceCeilings {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            pids_limit: 256,
        }
    }
}

/// Concrete container flags derived from a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxPolicy {
    pub profile: SecurityProfile,
    /// `uid:gid` to run as; `None` keeps the image default (may be root)
    pub user: Option<String>,
    pub cap_drop: Vec<String>,
    pub read_only_rootfs: bool,
    pub privileged: bool,
    pub security_opt: Vec<String>,
    pub ceilings: ResourceCeilings,
}

impl SandboxPolicy {
    /// True when the policy still carries every constraint no label may lift.
    pub fn enforces_baseline(&self) -> bool {
        !self.privileged
            && self.security_opt.iter().any(|o| o == "no-new-privileges:true")
            && self.ceilings.memory_bytes > 0
            && self.ceilings.nano_cpus > 0
            && self.ceilings.pids_limit > 0
    }
}

/// Picks the sandbox profile for an image and expands it into flags.
#[derive(Debug, Clone)]
pub struct SecurityProfileResolver {
    strict_user: String,
    ceilings: ResourceCeilings,
}

impl Default for SecurityProfileResolver {
    fn default() -> Self {
        Self::new("10001:10001", ResourceCeilings::default())
    }
}

impl SecurityProfileResolver {
    pub fn new(strict_user: impl Into<String>, ceilings: ResourceCeilings) -> Self {
        Self {
            strict_user: strict_user.into(),
            ceilings,
        }
    }

    /// A declared `security.profile` label wins; otherwise the environment decides.
    /// Unrecognised label values fall back to the environment default.
    pub fn resolve(
        &self,
        labels: &HashMap<String, String>,
        environment: DeploymentEnvironment,
    ) -> SecurityProfile {
        match labels.get(SECURITY_PROFILE_LABEL) {
            Some(value) => match value.parse() {
                Ok(profile) => profile,
                Err(e) => {
                    let fallback = environment.default_profile();
                    warn!(label = %value, fallback = %fallback, "Ignoring image security label: {}", e);
                    fallback
                }
            },
            None => environment.default_profile(),
        }
    }

    pub fn policy_for(&self, profile: SecurityProfile) -> SandboxPolicy {
        let (user, cap_drop, read_only_rootfs) = match profile {
            SecurityProfile::Strict => (Some(self.strict_user.clone()), vec!["ALL".to_string()], true),
            SecurityProfile::Relaxed => (None, Vec::new(), false),
        };

        SandboxPolicy {
            profile,
            user,
            cap_drop,
            read_only_rootfs,
            privileged: false,
            security_opt: vec!["no-new-privileges:true".to_string()],
            ceilings: self.ceilings,
        }
    }
}

/// Registry allow-list applied to every install.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImagePolicy {
    trusted_registries: Vec<String>,
}

impl ImagePolicy {
    pub fn new(trusted_registries: Vec<String>) -> Self {
        Self { trusted_registries }
    }

    pub fn trusted_registries(&self) -> &[String] {
        &self.trusted_registries
    }

    pub fn check(&self, image: &ImageReference) -> Result<(), ModuleError> {
        if self
            .trusted_registries
            .iter()
            .any(|r| r.eq_ignore_ascii_case(&image.registry))
        {
            Ok(())
        } else {
            Err(ModuleError::UntrustedRegistry(image.registry.clone()))
        }
    }
}
