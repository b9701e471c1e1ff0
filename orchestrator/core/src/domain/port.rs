// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Port registry
//!
//! Authoritative mapping of `(module, internal port) -> external port`.
//! An external port is held by at most one non-released allocation across
//! the whole host. Allocation scans forward from the last-issued cursor
//! and wraps at the end of the range.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

use crate::domain::module::ModuleName;

/// Inclusive external port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self { start: 9000, end: 19999 }
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, PortError> {
        if start == 0 || start > end {
            return Err(PortError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// First free port strictly after `cursor`, wrapping once around the range.
    /// With no cursor (or one outside the range) the scan starts at `start`.
    pub fn scan(&self, cursor: Option<u16>, taken: &HashSet<u16>) -> Option<u16> {
        let first = match cursor {
            Some(c) if self.contains(c) && c < self.end => c + 1,
            _ => self.start,
        };
        let span = self.len() as u32;
        let offset = (first - self.start) as u32;

        (0..span)
            .map(|i| self.start as u32 + (offset + i) % span)
            .map(|p| p as u16)
            .find(|p| !taken.contains(p))
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Recorded, container not yet confirmed running
    Reserved,
    /// Bound by a running module
    Active,
    Released,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Active => "active",
            Self::Released => "released",
        }
    }
}

impl std::str::FromStr for AllocationStatus {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserved" => Ok(Self::Reserved),
            "active" => Ok(Self::Active),
            "released" => Ok(Self::Released),
            other => Err(PortError::Storage(format!("unknown allocation status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortAllocation {
    pub module: ModuleName,
    pub internal_port: u16,
    pub external_port: u16,
    pub status: AllocationStatus,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl PortAllocation {
    pub fn is_held(&self) -> bool {
        self.status != AllocationStatus::Released
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStats {
    pub range_used: usize,
    pub range_total: usize,
    pub per_module_counts: BTreeMap<String, usize>,
}

#[async_trait]
pub trait PortRegistry: Send + Sync {
    /// Reserve one external port per internal port. All-or-nothing: on error no
    /// reservation from this call remains. Records are committed before returning.
    async fn allocate(
        &self,
        module: &ModuleName,
        internal_ports: &[u16],
    ) -> Result<BTreeMap<u16, u16>, PortError>;

    /// Promote a module's reservations to active.
    async fn activate(&self, module: &ModuleName) -> Result<(), PortError>;

    /// Release every held allocation of the module. Idempotent; returns how many
    /// allocations changed state.
    async fn release(&self, module: &ModuleName) -> Result<usize, PortError>;

    async fn stats(&self) -> Result<PortStats, PortError>;

    async fn allocations_for(&self, module: &ModuleName) -> Result<Vec<PortAllocation>, PortError>;

    /// Modules currently holding at least one non-released allocation.
    async fn holders(&self) -> Result<Vec<ModuleName>, PortError>;

    async fn ping(&self) -> Result<(), PortError> {
        self.stats().await.map(|_| ())
    }
}

#[derive(Debug, Error)]
pub enum PortError {
    #[error("Port range {range} exhausted: {requested} port(s) requested")]
    RangeExhausted { range: PortRange, requested: usize },

    #[error("External port {external_port} is already allocated (integrity violation)")]
    AlreadyAllocated { external_port: u16 },

    #[error("Invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },

    #[error("Port registry storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for PortError {
    fn from(err: sqlx::Error) -> Self {
        PortError::Storage(err.to_string())
    }
}
