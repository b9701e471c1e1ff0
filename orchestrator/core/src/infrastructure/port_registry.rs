// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! In-memory port registry
//!
//! Single-process implementation of [`PortRegistry`]. The allocation table
//! and the last-issued cursor sit behind one mutex, so an allocation is
//! atomic with respect to every other registry call. Released rows are
//! kept for history.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::domain::module::ModuleName;
use crate::domain::port::{AllocationStatus, PortAllocation, PortError, PortRange, PortRegistry, PortStats};

#[derive(Default)]
struct Table {
    allocations: Vec<PortAllocation>,
    cursor: Option<u16>,
}

impl Table {
    fn held(&self) -> impl Iterator<Item = &PortAllocation> {
        self.allocations.iter().filter(|a| a.is_held())
    }
}

pub struct InMemoryPortRegistry {
    range: PortRange,
    table: Mutex<Table>,
}

impl InMemoryPortRegistry {
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            table: Mutex::new(Table::default()),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }
}

impl Default for InMemoryPortRegistry {
    fn default() -> Self {
        Self::new(PortRange::default())
    }
}

#[async_trait]
impl PortRegistry for InMemoryPortRegistry {
    async fn allocate(
        &self,
        module: &ModuleName,
        internal_ports: &[u16],
    ) -> Result<BTreeMap<u16, u16>, PortError> {
        let mut table = self.table.lock();

        let mut taken: HashSet<u16> = table.held().map(|a| a.external_port).collect();
        let existing: BTreeMap<u16, u16> = table
            .held()
            .filter(|a| &a.module == module)
            .map(|a| (a.internal_port, a.external_port))
            .collect();

        // Plan the whole request before touching the table.
        let mut cursor = table.cursor;
        let mut mapping = BTreeMap::new();
        let mut fresh = Vec::new();
        for &internal in internal_ports {
            if let Some(&external) = existing.get(&internal) {
                mapping.insert(internal, external);
                continue;
            }
            let external = self.range.scan(cursor, &taken).ok_or(PortError::RangeExhausted {
                range: self.range,
                requested: internal_ports.len(),
            })?;
            taken.insert(external);
            cursor = Some(external);
            mapping.insert(internal, external);
            fresh.push((internal, external));
        }

        let now = Utc::now();
        table.allocations.extend(fresh.into_iter().map(|(internal, external)| PortAllocation {
            module: module.clone(),
            internal_port: internal,
            external_port: external,
            status: AllocationStatus::Reserved,
            allocated_at: now,
            released_at: None,
        }));
        table.cursor = cursor;

        debug!(module = %module, ports = ?mapping, "Reserved external ports");
        Ok(mapping)
    }

    async fn activate(&self, module: &ModuleName) -> Result<(), PortError> {
        let mut table = self.table.lock();
        for allocation in table
            .allocations
            .iter_mut()
            .filter(|a| &a.module == module && a.status == AllocationStatus::Reserved)
        {
            allocation.status = AllocationStatus::Active;
        }
        Ok(())
    }

    async fn release(&self, module: &ModuleName) -> Result<usize, PortError> {
        let mut table = self.table.lock();
        let now = Utc::now();
        let mut released = 0;
        for allocation in table
            .allocations
            .iter_mut()
            .filter(|a| &a.module == module && a.is_held())
        {
            allocation.status = AllocationStatus::Released;
            allocation.released_at = Some(now);
            released += 1;
        }
        Ok(released)
    }

    async fn stats(&self) -> Result<PortStats, PortError> {
        let table = self.table.lock();
        let mut per_module_counts = BTreeMap::new();
        for allocation in table.held().filter(|a| self.range.contains(a.external_port)) {
            *per_module_counts.entry(allocation.module.to_string()).or_insert(0) += 1;
        }

        Ok(PortStats {
            range_used: per_module_counts.values().sum(),
            range_total: self.range.len(),
            per_module_counts,
        })
    }

    async fn allocations_for(&self, module: &ModuleName) -> Result<Vec<PortAllocation>, PortError> {
        let table = self.table.lock();
        Ok(table
            .allocations
            .iter()
            .filter(|a| &a.module == module)
            .cloned()
            .collect())
    }

    async fn holders(&self) -> Result<Vec<ModuleName>, PortError> {
        let table = self.table.lock();
        let mut holders: Vec<ModuleName> = table.held().map(|a| a.module.clone()).collect();
        holders.sort();
        holders.dedup();
        Ok(holders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn name(s: &str) -> ModuleName {
        ModuleName::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_first_allocation_starts_at_range_start() {
        let registry = InMemoryPortRegistry::default();
        let ports = registry.allocate(&name("demo-app"), &[8080, 8081]).await.unwrap();
        assert_eq!(ports, BTreeMap::from([(8080, 9000), (8081, 9001)]));

        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.range_used, 2);
        assert_eq!(stats.range_total, 11000);
        assert_eq!(stats.per_module_counts.get("demo-app"), Some(&2));
    }

    #[tokio::test]
    async fn test_exhaustion_is_all_or_nothing() {
        let registry = InMemoryPortRegistry::new(PortRange::new(9000, 9002).unwrap());
        registry.allocate(&name("a"), &[80, 81]).await.unwrap();

        let err = registry.allocate(&name("b"), &[80, 81]).await.unwrap_err();
        assert!(matches!(err, PortError::RangeExhausted { requested: 2, .. }));
        assert!(registry.allocations_for(&name("b")).await.unwrap().is_empty());
        assert_eq!(registry.stats().await.unwrap().range_used, 2);

        // The remaining port is still allocatable.
        let ports = registry.allocate(&name("b"), &[80]).await.unwrap();
        assert_eq!(ports.get(&80), Some(&9002));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let registry = InMemoryPortRegistry::default();
        let module = name("crm");
        registry.allocate(&module, &[8080]).await.unwrap();
        registry.activate(&module).await.unwrap();

        assert_eq!(registry.release(&module).await.unwrap(), 1);
        assert_eq!(registry.release(&module).await.unwrap(), 0);
        assert_eq!(registry.release(&name("never-allocated")).await.unwrap(), 0);

        let history = registry.allocations_for(&module).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AllocationStatus::Released);
        assert!(history[0].released_at.is_some());
        assert!(registry.holders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_drops_module_from_stats() {
        let registry = InMemoryPortRegistry::default();
        registry.allocate(&name("crm"), &[8080, 8081]).await.unwrap();
        registry.allocate(&name("wiki"), &[80]).await.unwrap();
        assert_eq!(registry.stats().await.unwrap().range_used, 3);

        registry.release(&name("crm")).await.unwrap();
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.range_used, 1);
        assert_eq!(stats.per_module_counts.get("crm"), None);
        assert_eq!(stats.per_module_counts.get("wiki"), Some(&1));

        registry.allocate(&name("crm"), &[8080]).await.unwrap();
        let stats = registry.stats().await.unwrap();
        assert_eq!(stats.range_used, 2);
        assert_eq!(stats.per_module_counts.get("crm"), Some(&1));
    }

    #[tokio::test]
    async fn test_released_ports_reused_after_wrap() {
        let registry = InMemoryPortRegistry::new(PortRange::new(9000, 9001).unwrap());
        let a = name("a");
        registry.allocate(&a, &[80]).await.unwrap();
        registry.allocate(&name("b"), &[80]).await.unwrap();
        registry.release(&a).await.unwrap();

        let ports = registry.allocate(&name("c"), &[80]).await.unwrap();
        assert_eq!(ports.get(&80), Some(&9000));
    }

    #[tokio::test]
    async fn test_cursor_skips_recently_released_port() {
        let registry = InMemoryPortRegistry::default();
        let a = name("a");
        registry.allocate(&a, &[80]).await.unwrap();
        registry.release(&a).await.unwrap();

        let ports = registry.allocate(&name("b"), &[80]).await.unwrap();
        assert_eq!(ports.get(&80), Some(&9001));
    }

    #[tokio::test]
    async fn test_activate_promotes_reservations() {
        let registry = InMemoryPortRegistry::default();
        let module = name("crm");
        registry.allocate(&module, &[8080]).await.unwrap();
        assert_eq!(
            registry.allocations_for(&module).await.unwrap()[0].status,
            AllocationStatus::Reserved
        );

        registry.activate(&module).await.unwrap();
        assert_eq!(
            registry.allocations_for(&module).await.unwrap()[0].status,
            AllocationStatus::Active
        );
        assert_eq!(registry.holders().await.unwrap(), vec![module]);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_collide() {
        let registry = Arc::new(InMemoryPortRegistry::default());
        let mut handles = Vec::new();
        for i in 0..20 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .allocate(&ModuleName::parse(format!("m{}", i)).unwrap(), &[8080, 8081])
                    .await
                    .unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for external in handle.await.unwrap().into_values() {
                assert!(seen.insert(external), "port {} issued twice", external);
            }
        }
        assert_eq!(seen.len(), 40);
    }
}
