// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::domain::security::SandboxPolicy;

/// Label marking every container this host created.
pub const MANAGED_LABEL: &str = "modman.managed";
/// Label carrying the owning module name.
pub const MODULE_LABEL: &str = "modman.module";

/// Everything the runtime needs to create a module container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: HashMap<String, String>,
    /// internal port -> external (host) port
    pub port_bindings: BTreeMap<u16, u16>,
    pub network: Option<String>,
    pub host_ip: String,
    pub policy: SandboxPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerHealth {
    Healthy,
    Unhealthy,
    Starting,
    /// Image declares no health check
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspection {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub status: String,
    pub health: ContainerHealth,
    pub restart_count: i64,
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub uptime_seconds: u64,
    pub restart_count: i64,
}

/// A container carrying the managed label, as listed by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub module: Option<String>,
    pub running: bool,
}

/// Narrow capability interface over the container engine.
///
/// `stop` and `remove` treat an absent container as success so teardown can
/// tolerate partial manual cleanup. `inspect` and `stats` report absence as
/// [`RuntimeError::NotFound`].
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Labels declared by a locally available image.
    async fn image_labels(&self, image: &str) -> Result<HashMap<String, String>, RuntimeError>;

    /// Returns the container id.
    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, id: &str, grace_secs: i64) -> Result<(), RuntimeError>;

    /// Force-remove the container and its anonymous volumes. Returns false when
    /// it was already gone.
    async fn remove(&self, id: &str) -> Result<bool, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<ContainerInspection, RuntimeError>;

    async fn stats(&self, id: &str) -> Result<ContainerStats, RuntimeError>;

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, RuntimeError>;
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("Image pull failed: {0}")]
    PullFailed(String),
    #[error("Container create failed: {0}")]
    CreateFailed(String),
    #[error("Container start failed: {0}")]
    StartFailed(String),
    #[error("Container stop failed: {0}")]
    StopFailed(String),
    #[error("Container remove failed: {0}")]
    RemoveFailed(String),
    #[error("Container not found: {0}")]
    NotFound(String),
    #[error("Runtime call failed: {0}")]
    Other(String),
}
