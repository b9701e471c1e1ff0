// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Postgres Port Registry
//!
//! Allocation runs in one transaction that locks the range's cursor row,
//! so concurrent allocators (even across daemon processes sharing the
//! database) are serialized. The partial unique index on `external_port`
//! is the last line of defence: a violation surfaces as
//! `PortError::AlreadyAllocated` and the transaction rolls back.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::domain::module::ModuleName;
use crate::domain::port::{AllocationStatus, PortAllocation, PortError, PortRange, PortRegistry, PortStats};

const UNIQUE_VIOLATION: &str = "23505";

pub struct PostgresPortRegistry {
    pool: PgPool,
    range: PortRange,
}

impl PostgresPortRegistry {
    pub fn new(pool: PgPool, range: PortRange) -> Self {
        Self { pool, range }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }
}

fn map_insert_error(err: sqlx::Error, external_port: u16) -> PortError {
    let unique_violation = err
        .as_database_error()
        .and_then(|d| d.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION);
    if unique_violation {
        PortError::AlreadyAllocated { external_port }
    } else {
        PortError::Storage(err.to_string())
    }
}

#[async_trait]
impl PortRegistry for PostgresPortRegistry {
    async fn allocate(
        &self,
        module: &ModuleName,
        internal_ports: &[u16],
    ) -> Result<BTreeMap<u16, u16>, PortError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO port_cursors (range_start, range_end, last_issued)
            VALUES ($1, $2, NULL)
            ON CONFLICT (range_start, range_end) DO NOTHING
            "#,
        )
        .bind(self.range.start as i32)
        .bind(self.range.end as i32)
        .execute(&mut *tx)
        .await?;

        let cursor: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT last_issued FROM port_cursors
            WHERE range_start = $1 AND range_end = $2
            FOR UPDATE
            "#,
        )
        .bind(self.range.start as i32)
        .bind(self.range.end as i32)
        .fetch_one(&mut *tx)
        .await?;

        let held = sqlx::query(
            "SELECT module, internal_port, external_port FROM port_allocations WHERE status <> 'released'",
        )
        .fetch_all(&mut *tx)
        .await?;

        let mut taken = HashSet::new();
        let mut existing = BTreeMap::new();
        for row in &held {
            let holder: String = row.get("module");
            let internal: i32 = row.get("internal_port");
            let external: i32 = row.get("external_port");
            taken.insert(external as u16);
            if holder == module.as_str() {
                existing.insert(internal as u16, external as u16);
            }
        }

        let mut cursor = cursor.map(|c| c as u16);
        let mut mapping = BTreeMap::new();
        for &internal in internal_ports {
            if let Some(&external) = existing.get(&internal) {
                mapping.insert(internal, external);
                continue;
            }

            let Some(external) = self.range.scan(cursor, &taken) else {
                // Dropping `tx` rolls back every reservation made so far.
                return Err(PortError::RangeExhausted {
                    range: self.range,
                    requested: internal_ports.len(),
                });
            };

            sqlx::query(
                r#"
                INSERT INTO port_allocations (module, internal_port, external_port, status, allocated_at)
                VALUES ($1, $2, $3, 'reserved', $4)
                "#,
            )
            .bind(module.as_str())
            .bind(internal as i32)
            .bind(external as i32)
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_insert_error(e, external))?;

            taken.insert(external);
            cursor = Some(external);
            mapping.insert(internal, external);
        }

        sqlx::query(
            "UPDATE port_cursors SET last_issued = $3 WHERE range_start = $1 AND range_end = $2",
        )
        .bind(self.range.start as i32)
        .bind(self.range.end as i32)
        .bind(cursor.map(|c| c as i32))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(module = %module, ports = ?mapping, "Reserved external ports");
        Ok(mapping)
    }

    async fn activate(&self, module: &ModuleName) -> Result<(), PortError> {
        sqlx::query("UPDATE port_allocations SET status = 'active' WHERE module = $1 AND status = 'reserved'")
            .bind(module.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, module: &ModuleName) -> Result<usize, PortError> {
        let result = sqlx::query(
            r#"
            UPDATE port_allocations
            SET status = 'released', released_at = NOW()
            WHERE module = $1 AND status <> 'released'
            "#,
        )
        .bind(module.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<PortStats, PortError> {
        let rows = sqlx::query(
            r#"
            SELECT module, COUNT(*) AS held
            FROM port_allocations
            WHERE status <> 'released' AND external_port BETWEEN $1 AND $2
            GROUP BY module
            "#,
        )
        .bind(self.range.start as i32)
        .bind(self.range.end as i32)
        .fetch_all(&self.pool)
        .await?;

        let mut per_module_counts = BTreeMap::new();
        for row in rows {
            let module: String = row.get("module");
            let held: i64 = row.get("held");
            per_module_counts.insert(module, held as usize);
        }

        Ok(PortStats {
            range_used: per_module_counts.values().sum(),
            range_total: self.range.len(),
            per_module_counts,
        })
    }

    async fn allocations_for(&self, module: &ModuleName) -> Result<Vec<PortAllocation>, PortError> {
        let rows = sqlx::query(
            r#"
            SELECT module, internal_port, external_port, status, allocated_at, released_at
            FROM port_allocations
            WHERE module = $1
            ORDER BY allocated_at ASC, internal_port ASC
            "#,
        )
        .bind(module.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_allocation_row).collect()
    }

    async fn holders(&self) -> Result<Vec<ModuleName>, PortError> {
        let names: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT module FROM port_allocations WHERE status <> 'released' ORDER BY module",
        )
        .fetch_all(&self.pool)
        .await?;

        names
            .into_iter()
            .map(|n| ModuleName::parse(n).map_err(|e| PortError::Storage(e.to_string())))
            .collect()
    }

    async fn ping(&self) -> Result<(), PortError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn parse_allocation_row(row: PgRow) -> Result<PortAllocation, PortError> {
    let module: String = row.get("module");
    let internal: i32 = row.get("internal_port");
    let external: i32 = row.get("external_port");
    let status: String = row.get("status");

    Ok(PortAllocation {
        module: ModuleName::parse(module).map_err(|e| PortError::Storage(e.to_string()))?,
        internal_port: internal as u16,
        external_port: external as u16,
        status: status.parse::<AllocationStatus>()?,
        allocated_at: row.get("allocated_at"),
        released_at: row.get("released_at"),
    })
}
