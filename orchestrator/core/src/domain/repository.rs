// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Domain Repository Interfaces
//!
//! Persistence contracts, defined in the domain layer and implemented in
//! `crate::infrastructure::repositories`.
//!
//! | Trait | Aggregate | Implementations |
//! |-------|-----------|----------------|
//! | `ModuleRepository` | `Module` | `InMemoryModuleRepository`, `PostgresModuleRepository` |
//! | `AuditLogRepository` | `AuditLogEntry` | `InMemoryAuditLogRepository`, `PostgresAuditLogRepository` |
//! | `PortRegistry` (see `domain::port`) | `PortAllocation` | `InMemoryPortRegistry`, `PostgresPortRegistry` |
//!
//! In-memory implementations are used for development and tests;
//! PostgreSQL implementations for production. The backend is selected at
//! daemon startup from `spec.storage` in the host configuration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::audit::{AuditLogEntry, AuditQuery};
use crate::domain::module::{Module, ModuleHealth, ModuleName};

/// Storage backend enum for pluggable persistence
#[derive(Debug, Clone)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL(PostgresConfig),
}

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub connection_string: String,
    pub max_connections: u32,
}

/// One page of module records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModulePage {
    pub items: Vec<Module>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

#[async_trait]
pub trait ModuleRepository: Send + Sync {
    /// Save module (create or update, keyed by name)
    async fn save(&self, module: &Module) -> Result<(), RepositoryError>;

    async fn find_by_name(&self, name: &ModuleName) -> Result<Option<Module>, RepositoryError>;

    /// Records ordered by name; `page` is 1-based.
    async fn list(&self, page: usize, per_page: usize) -> Result<ModulePage, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<Module>, RepositoryError>;

    /// Records not in `removed` state.
    async fn count_live(&self) -> Result<usize, RepositoryError>;

    async fn count_live_by_owner(&self, actor: &str) -> Result<usize, RepositoryError>;

    /// Update only the health column; state is never touched.
    async fn update_health(&self, name: &ModuleName, health: ModuleHealth) -> Result<(), RepositoryError>;
}

/// Append-only audit store. There is deliberately no update or delete.
#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), RepositoryError>;

    /// Matching entries, newest first, with the query's limit and offset applied.
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, RepositoryError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for RepositoryError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => RepositoryError::NotFound("row not found".to_string()),
            other => RepositoryError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for RepositoryError {
    fn from(err: serde_json::Error) -> Self {
        RepositoryError::Serialization(err.to_string())
    }
}
