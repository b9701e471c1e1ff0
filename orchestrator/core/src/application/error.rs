// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::time::Duration;
use thiserror::Error;

use crate::domain::license::LicenseError;
use crate::domain::module::ModuleError;
use crate::domain::port::PortError;
use crate::domain::proxy::ProxyError;
use crate::domain::repository::RepositoryError;
use crate::domain::runtime::RuntimeError;

/// Errors surfaced by lifecycle operations.
///
/// Validation, quota and license errors are raised before any resource is
/// touched. Failures after a resource was committed arrive wrapped in
/// [`OrchestratorError::StepFailed`] or, when cleanup itself failed,
/// [`OrchestratorError::RollbackIncomplete`].
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("License invalid: {0}")]
    LicenseInvalid(String),

    #[error("License revoked: {0}")]
    LicenseRevoked(String),

    #[error("License check unavailable: {0}")]
    LicenseUnavailable(String),

    #[error("Module not found: {0}")]
    NotFound(String),

    #[error("Module '{0}' already has an operation in progress")]
    InProgress(String),

    #[error("Module '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Port range exhausted: {0}")]
    PortRangeExhausted(String),

    #[error("Port registry error: {0}")]
    PortRegistry(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("Proxy configuration invalid: {0}")]
    ProxyConfigInvalid(String),

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Install step '{step}' failed: {cause}; rolled back [{}]", .rolled_back.join(", "))]
    StepFailed {
        step: String,
        cause: Box<OrchestratorError>,
        rolled_back: Vec<String>,
    },

    #[error(
        "Install step '{step}' failed: {cause}; rollback incomplete [{}], module left in error state",
        .failures.join("; ")
    )]
    RollbackIncomplete {
        step: String,
        cause: Box<OrchestratorError>,
        rolled_back: Vec<String>,
        failures: Vec<String>,
    },

    #[error("Teardown of '{module}' incomplete: {}", .failures.join("; "))]
    TeardownIncomplete { module: String, failures: Vec<String> },

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable machine-readable kind, used in API error bodies and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::LicenseInvalid(_) => "license_invalid",
            Self::LicenseRevoked(_) => "license_revoked",
            Self::LicenseUnavailable(_) => "license_unavailable",
            Self::NotFound(_) => "not_found",
            Self::InProgress(_) => "in_progress",
            Self::AlreadyInstalled(_) => "already_installed",
            Self::InvalidState(_) => "invalid_state",
            Self::PortRangeExhausted(_) => "port_range_exhausted",
            Self::PortRegistry(_) => "port_registry",
            Self::Runtime(_) => "runtime",
            Self::ProxyConfigInvalid(_) => "proxy_config_invalid",
            Self::Proxy(_) => "proxy",
            Self::Timeout { .. } => "timeout",
            Self::StepFailed { cause, .. } => cause.kind(),
            Self::RollbackIncomplete { .. } => "rollback_incomplete",
            Self::TeardownIncomplete { .. } => "teardown_incomplete",
            Self::Repository(_) => "repository",
            Self::Internal(_) => "internal",
        }
    }

    /// True for rejections raised before any side effect.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::QuotaExceeded(_)
                | Self::LicenseInvalid(_)
                | Self::LicenseRevoked(_)
                | Self::LicenseUnavailable(_)
                | Self::InProgress(_)
                | Self::AlreadyInstalled(_)
                | Self::NotFound(_)
                | Self::InvalidState(_)
        )
    }
}

impl From<ModuleError> for OrchestratorError {
    fn from(err: ModuleError) -> Self {
        match err {
            ModuleError::InvalidStateTransition { .. } | ModuleError::InvalidState(_) => {
                OrchestratorError::InvalidState(err.to_string())
            }
            other => OrchestratorError::Validation(other.to_string()),
        }
    }
}

impl From<LicenseError> for OrchestratorError {
    fn from(err: LicenseError) -> Self {
        match err {
            LicenseError::Invalid(msg) => OrchestratorError::LicenseInvalid(msg),
            LicenseError::Revoked(msg) => OrchestratorError::LicenseRevoked(msg),
            LicenseError::Unavailable(msg) => OrchestratorError::LicenseUnavailable(msg),
        }
    }
}

impl From<PortError> for OrchestratorError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::RangeExhausted { .. } => OrchestratorError::PortRangeExhausted(err.to_string()),
            other => OrchestratorError::PortRegistry(other.to_string()),
        }
    }
}

impl From<RuntimeError> for OrchestratorError {
    fn from(err: RuntimeError) -> Self {
        OrchestratorError::Runtime(err.to_string())
    }
}

impl From<ProxyError> for OrchestratorError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::ConfigInvalid(msg) => OrchestratorError::ProxyConfigInvalid(msg),
            other => OrchestratorError::Proxy(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::port::PortRange;

    #[test]
    fn test_step_failed_reports_cause_kind() {
        let err = OrchestratorError::StepFailed {
            step: "apply-route".to_string(),
            cause: Box::new(ProxyError::ConfigInvalid("unexpected '}'".to_string()).into()),
            rolled_back: vec!["stop-container".to_string(), "remove-container".to_string()],
        };
        assert_eq!(err.kind(), "proxy_config_invalid");
        let msg = err.to_string();
        assert!(msg.contains("apply-route"));
        assert!(msg.contains("stop-container, remove-container"));
    }

    #[test]
    fn test_port_error_mapping() {
        let exhausted = PortError::RangeExhausted {
            range: PortRange::default(),
            requested: 2,
        };
        assert!(matches!(
            OrchestratorError::from(exhausted),
            OrchestratorError::PortRangeExhausted(_)
        ));
        assert!(matches!(
            OrchestratorError::from(PortError::AlreadyAllocated { external_port: 9000 }),
            OrchestratorError::PortRegistry(_)
        ));
    }

    #[test]
    fn test_rejections() {
        assert!(OrchestratorError::Validation("x".into()).is_rejection());
        assert!(OrchestratorError::InProgress("demo".into()).is_rejection());
        assert!(!OrchestratorError::Runtime("x".into()).is_rejection());
    }
}
