// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository Factory - Application Layer
//!
//! Creates concrete repository implementations for the configured storage
//! backend. The domain layer only knows the traits; the daemon calls these
//! functions once at startup and hands the results to the orchestrator.

use sqlx::PgPool;
use std::sync::Arc;

use crate::domain::port::{PortRange, PortRegistry};
use crate::domain::repository::{AuditLogRepository, ModuleRepository, RepositoryError, StorageBackend};
use crate::infrastructure::port_registry::InMemoryPortRegistry;
use crate::infrastructure::repositories::{
    InMemoryAuditLogRepository, InMemoryModuleRepository, PostgresAuditLogRepository,
    PostgresModuleRepository, PostgresPortRegistry,
};

fn require_pool(pool: Option<&PgPool>) -> Result<PgPool, RepositoryError> {
    pool.cloned().ok_or_else(|| {
        RepositoryError::Database("postgres backend selected but no connection pool was provided".to_string())
    })
}

/// Creates a ModuleRepository implementation based on the configured backend
pub fn create_module_repository(
    backend: &StorageBackend,
    pool: Option<&PgPool>,
) -> Result<Arc<dyn ModuleRepository>, RepositoryError> {
    Ok(match backend {
        StorageBackend::InMemory => Arc::new(InMemoryModuleRepository::new()),
        StorageBackend::PostgreSQL(_) => Arc::new(PostgresModuleRepository::new(require_pool(pool)?)),
    })
}

/// Creates an AuditLogRepository implementation based on the configured backend
pub fn create_audit_repository(
    backend: &StorageBackend,
    pool: Option<&PgPool>,
) -> Result<Arc<dyn AuditLogRepository>, RepositoryError> {
    Ok(match backend {
        StorageBackend::InMemory => Arc::new(InMemoryAuditLogRepository::new()),
        StorageBackend::PostgreSQL(_) => Arc::new(PostgresAuditLogRepository::new(require_pool(pool)?)),
    })
}

/// Creates a PortRegistry implementation based on the configured backend
pub fn create_port_registry(
    backend: &StorageBackend,
    pool: Option<&PgPool>,
    range: PortRange,
) -> Result<Arc<dyn PortRegistry>, RepositoryError> {
    Ok(match backend {
        StorageBackend::InMemory => Arc::new(InMemoryPortRegistry::new(range)),
        StorageBackend::PostgreSQL(_) => Arc::new(PostgresPortRegistry::new(require_pool(pool)?, range)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::repository::PostgresConfig;

    #[test]
    fn test_in_memory_backend_needs_no_pool() {
        let backend = StorageBackend::InMemory;
        assert!(create_module_repository(&backend, None).is_ok());
        assert!(create_audit_repository(&backend, None).is_ok());
        assert!(create_port_registry(&backend, None, PortRange::default()).is_ok());
    }

    #[test]
    fn test_postgres_backend_requires_pool() {
        let backend = StorageBackend::PostgreSQL(PostgresConfig {
            connection_string: "postgres://localhost/modman".to_string(),
            max_connections: 5,
        });
        assert!(create_module_repository(&backend, None).is_err());
        assert!(create_audit_repository(&backend, None).is_err());
        assert!(create_port_registry(&backend, None, PortRange::default()).is_err());
    }
}
