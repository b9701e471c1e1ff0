// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Module Repository
//!
//! Persists `Module` records in the `modules` table. Rows are keyed by the
//! unique module name; a reinstall reuses the row of the removed record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::module::{Module, ModuleHealth, ModuleId, ModuleName, ModuleState};
use crate::domain::repository::{ModulePage, ModuleRepository, RepositoryError};
use crate::domain::security::SecurityProfile;

const MODULE_COLUMNS: &str = r#"
    id, name, display_name, image, version, state, health,
    allocated_ports, proxy_route, websocket_enabled, security_profile,
    container_id, encrypted_license, created_by, last_error,
    created_at, updated_at, installed_at, removed_at
"#;

pub struct PostgresModuleRepository {
    pool: PgPool,
}

impl PostgresModuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ModuleRepository for PostgresModuleRepository {
    async fn save(&self, module: &Module) -> Result<(), RepositoryError> {
        // JSON object keys must be strings; internal ports are stored as "8080": 9000.
        let ports_json = serde_json::to_value(&module.allocated_ports)?;

        sqlx::query(
            r#"
            INSERT INTO modules (
                id, name, display_name, image, version, state, health,
                allocated_ports, proxy_route, websocket_enabled, security_profile,
                container_id, encrypted_license, created_by, last_error,
                created_at, updated_at, installed_at, removed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (name) DO UPDATE SET
                display_name = EXCLUDED.display_name,
                image = EXCLUDED.image,
                version = EXCLUDED.version,
                state = EXCLUDED.state,
                health = EXCLUDED.health,
                allocated_ports = EXCLUDED.allocated_ports,
                proxy_route = EXCLUDED.proxy_route,
                websocket_enabled = EXCLUDED.websocket_enabled,
                security_profile = EXCLUDED.security_profile,
                container_id = EXCLUDED.container_id,
                encrypted_license = EXCLUDED.encrypted_license,
                created_by = EXCLUDED.created_by,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at,
                installed_at = EXCLUDED.installed_at,
                removed_at = EXCLUDED.removed_at
            "#,
        )
        .bind(module.id.0)
        .bind(module.name.as_str())
        .bind(&module.display_name)
        .bind(&module.image)
        .bind(&module.version)
        .bind(module.state.as_str())
        .bind(module.health.as_str())
        .bind(ports_json)
        .bind(&module.proxy_route)
        .bind(module.websocket_enabled)
        .bind(module.security_profile.map(|p| p.as_str()))
        .bind(&module.container_id)
        .bind(&module.encrypted_license)
        .bind(&module.created_by)
        .bind(&module.last_error)
        .bind(module.created_at)
        .bind(module.updated_at)
        .bind(module.installed_at)
        .bind(module.removed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to save module: {}", e)))?;

        Ok(())
    }

    async fn find_by_name(&self, name: &ModuleName) -> Result<Option<Module>, RepositoryError> {
        let row = sqlx::query(&format!("SELECT {} FROM modules WHERE name = $1", MODULE_COLUMNS))
            .bind(name.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        row.map(parse_module_row).transpose()
    }

    async fn list(&self, page: usize, per_page: usize) -> Result<ModulePage, RepositoryError> {
        let page = page.max(1);
        let per_page = per_page.max(1);

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM modules")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM modules ORDER BY name ASC LIMIT $1 OFFSET $2",
            MODULE_COLUMNS
        ))
        .bind(i64::try_from(per_page).unwrap_or(i64::MAX))
        .bind(i64::try_from((page - 1).saturating_mul(per_page)).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        let items = rows
            .into_iter()
            .map(parse_module_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ModulePage {
            items,
            page,
            per_page,
            total: total as usize,
        })
    }

    async fn list_all(&self) -> Result<Vec<Module>, RepositoryError> {
        let rows = sqlx::query(&format!("SELECT {} FROM modules ORDER BY name ASC", MODULE_COLUMNS))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_module_row).collect()
    }

    async fn count_live(&self) -> Result<usize, RepositoryError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM modules WHERE state <> 'removed'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    async fn count_live_by_owner(&self, actor: &str) -> Result<usize, RepositoryError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM modules WHERE state <> 'removed' AND created_by = $1",
        )
        .bind(actor)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;
        Ok(count as usize)
    }

    async fn update_health(&self, name: &ModuleName, health: ModuleHealth) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE modules SET health = $2, updated_at = NOW() WHERE name = $1")
            .bind(name.as_str())
            .bind(health.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("module '{}'", name)));
        }
        Ok(())
    }
}

fn parse_module_row(row: PgRow) -> Result<Module, RepositoryError> {
    let id: Uuid = row.get("id");
    let name: String = row.get("name");
    let state: String = row.get("state");
    let health: String = row.get("health");
    let ports_json: serde_json::Value = row.get("allocated_ports");
    let profile: Option<String> = row.get("security_profile");

    let allocated_ports: BTreeMap<u16, u16> = serde_json::from_value(ports_json)?;
    let security_profile = profile
        .map(|p| p.parse::<SecurityProfile>())
        .transpose()
        .map_err(RepositoryError::Serialization)?;

    Ok(Module {
        id: ModuleId(id),
        name: ModuleName::parse(name).map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        display_name: row.get("display_name"),
        image: row.get("image"),
        version: row.get("version"),
        state: state
            .parse::<ModuleState>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        health: health
            .parse::<ModuleHealth>()
            .map_err(|e| RepositoryError::Serialization(e.to_string()))?,
        allocated_ports,
        proxy_route: row.get("proxy_route"),
        websocket_enabled: row.get("websocket_enabled"),
        security_profile,
        container_id: row.get("container_id"),
        encrypted_license: row.get("encrypted_license"),
        created_by: row.get("created_by"),
        last_error: row.get("last_error"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
        installed_at: row.get::<Option<DateTime<Utc>>, _>("installed_at"),
        removed_at: row.get::<Option<DateTime<Utc>>, _>("removed_at"),
    })
}
