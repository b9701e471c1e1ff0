// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Audit Log Repository
//!
//! Insert-only access to the `audit_log` table. Filters are pushed down as
//! optional predicates so a single statement serves every query shape.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;

use crate::domain::audit::{AuditLogEntry, AuditOperation, AuditOutcome, AuditQuery};
use crate::domain::repository::{AuditLogRepository, RepositoryError};

pub struct PostgresAuditLogRepository {
    pool: PgPool,
}

impl PostgresAuditLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLogRepository for PostgresAuditLogRepository {
    async fn append(&self, entry: &AuditLogEntry) -> Result<(), RepositoryError> {
        let rolled_back = serde_json::to_value(&entry.rolled_back)?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, module, operation, actor, outcome, duration_ms,
                detail, failed_step, rolled_back, timestamp
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.module)
        .bind(entry.operation.as_str())
        .bind(&entry.actor)
        .bind(entry.outcome.as_str())
        .bind(entry.duration_ms as i64)
        .bind(&entry.detail)
        .bind(&entry.failed_step)
        .bind(rolled_back)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(format!("Failed to append audit entry: {}", e)))?;

        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditLogEntry>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, module, operation, actor, outcome, duration_ms,
                   detail, failed_step, rolled_back, timestamp
            FROM audit_log
            WHERE ($1::TEXT IS NULL OR module = $1)
              AND ($2::TEXT IS NULL OR operation = $2)
              AND ($3::TEXT IS NULL OR outcome = $3)
              AND ($4::TEXT IS NULL OR actor = $4)
              AND ($5::TIMESTAMPTZ IS NULL OR timestamp >= $5)
              AND ($6::TIMESTAMPTZ IS NULL OR timestamp <= $6)
            ORDER BY timestamp DESC
            LIMIT $7 OFFSET $8
            "#,
        )
        .bind(&query.module)
        .bind(query.operation.map(|o| o.as_str()))
        .bind(query.outcome.map(|o| o.as_str()))
        .bind(&query.actor)
        .bind(query.since)
        .bind(query.until)
        .bind(query.effective_limit() as i64)
        .bind(query.effective_offset() as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryError::Database(e.to_string()))?;

        rows.into_iter().map(parse_audit_row).collect()
    }
}

fn parse_audit_row(row: PgRow) -> Result<AuditLogEntry, RepositoryError> {
    let operation: String = row.get("operation");
    let outcome: String = row.get("outcome");
    let duration_ms: i64 = row.get("duration_ms");
    let rolled_back: serde_json::Value = row.get("rolled_back");

    Ok(AuditLogEntry {
        id: row.get("id"),
        module: row.get("module"),
        operation: operation
            .parse::<AuditOperation>()
            .map_err(RepositoryError::Serialization)?,
        actor: row.get("actor"),
        outcome: outcome
            .parse::<AuditOutcome>()
            .map_err(RepositoryError::Serialization)?,
        duration_ms: duration_ms.max(0) as u64,
        detail: row.get("detail"),
        failed_step: row.get("failed_step"),
        rolled_back: serde_json::from_value(rolled_back)?,
        timestamp: row.get("timestamp"),
    })
}
