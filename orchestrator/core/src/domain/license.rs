// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result of a successful license check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseGrant {
    /// Stable, non-reversible identifier of the key (safe to log)
    pub fingerprint: String,
}

/// Black-box license check consumed by the orchestrator.
#[async_trait]
pub trait LicenseValidator: Send + Sync {
    async fn validate(&self, key: &str) -> Result<LicenseGrant, LicenseError>;
}

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("License invalid: {0}")]
    Invalid(String),
    #[error("License revoked: {0}")]
    Revoked(String),
    #[error("License service unavailable: {0}")]
    Unavailable(String),
}
