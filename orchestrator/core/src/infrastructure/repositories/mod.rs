// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository Implementations
//!
//! Infrastructure implementations of the persistence contracts defined in
//! `crate::domain::repository` and `crate::domain::port`.
//!
//! # Available Implementations
//!
//! ## PostgreSQL
//!
//! - **PostgresModuleRepository** - module records
//! - **PostgresAuditLogRepository** - append-only audit trail
//! - **PostgresPortRegistry** - transactional port allocation
//!
//! ## In-Memory
//!
//! Lock-guarded maps for development and tests. State is lost on restart.
//! The in-memory port registry lives in `infrastructure::port_registry`.

pub mod postgres_audit;
pub mod postgres_module;
pub mod postgres_port;

pub use postgres_audit::PostgresAuditLogRepository;
pub use postgres_module::PostgresModuleRepository;
pub use postgres_port::PostgresPortRegistry;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::audit::{AuditLogEntry, AuditQuery};
use crate::domain::module::{Module, ModuleHealth, ModuleName};
use crate::domain::repository::{AuditLogRepository, ModulePage, ModuleRepository, RepositoryError};

/// Module records keyed by name; a `BTreeMap` keeps listing order stable.
#[derive(Clone, Default)]
pub struct InMemoryModuleRepository {
    modules: Arc<RwLock<BTreeMap<String, Module>>>,
}

impl InMemoryModuleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModuleRepository for InMemoryModuleRepository {
    async fn save(&self, module: &Module) -> Result<(), RepositoryError> {
        self.modules
            .write()
            .insert(module.name.to_string(), module.clone());
        Ok(())
    }

    async fn find_by_name(&self, name: &ModuleName) -> Result<Option<Module>, RepositoryError> {
        Ok(self.modules.read().get(name.as_str()).cloned())
    }

    async fn list(&self, page: usize, per_page: usize) -> Result<ModulePage, RepositoryError> {
        let modules = self.modules.read();
        let page = page.max(1);
        let per_page = per_page.max(1);
        let items = modules
            .values()
            .skip((page - 1).saturating_mul(per_page))
            .take(per_page)
            .cloned()
            .collect();

        Ok(ModulePage {
            items,
            page,
            per_page,
            total: modules.len(),
        })
    }

    async fn list_all(&self) -> Result<Vec<Module>, RepositoryError> {
        Ok(self.modules.read().values().cloned().collect())
    }

    async fn count_live(&self) -> Result<usize, RepositoryError> {
        Ok(self.modules.read().values().filter(|m| m.is_live()).count())
    }

    async fn count_live_by_owner(&self, actor: &str) -> Result<usize, RepositoryError> {
        Ok(self
            .modules
            .read()
            .values()
            .filter(|m| m.is_live() && m.created_by == actor)
            .count())
    }

    async fn update_health(&self, name: &ModuleName, health: ModuleHealth) -> Result<(), RepositoryError> {
        let mut modules = self.modules.write();
        let module = modules
            .get_mut(name.as_str())
            .ok_or_else(|| RepositoryError::NotFound(format!("module '{}'", name)))?;
        module.health = health;
        module.updated_at = Utc::now();
        Ok(())
    }
}

/// Append-only vector of entries, stored in insertion order.
#[derive(Clone, Default)]
pub struct InMemoryAuditLogRepository {
    entries: Arc<RwLock<Vec<AuditLogEntry>>>,
}

impl InMemoryAuditLogRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl AuditLogRepository for InMemoryAuditLogRepository {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), RepositoryError> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, RepositoryError> {
        let entries = self.entries.read();
        let mut matched: Vec<AuditLogEntry> = entries.iter().filter(|e| query.matches(e)).cloned().collect();
        // Stable sort keeps append order for entries sharing a timestamp.
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Ok(matched
            .into_iter()
            .skip(query.effective_offset())
            .take(query.effective_limit())
            .collect())
    }
}
