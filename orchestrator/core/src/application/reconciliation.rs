// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Startup reconciliation
//!
//! A crash between install steps can leave a record stuck mid-operation, or
//! resources (containers, route fragments, port allocations) with no live
//! record behind them. `reconcile` runs once before the API starts serving
//! and brings the host back to a state every other operation understands.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

use crate::application::error::OrchestratorError;
use crate::application::module_orchestrator::{timed, ModuleOrchestrator};
use crate::domain::module::{ModuleName, ModuleState};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    /// Records found in `installing`/`uninstalling` and moved to `error`
    pub interrupted: Vec<String>,
    pub orphan_containers_removed: Vec<String>,
    pub orphan_routes_removed: Vec<String>,
    pub orphan_ports_released: Vec<String>,
    pub failures: Vec<String>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.interrupted.is_empty()
            && self.orphan_containers_removed.is_empty()
            && self.orphan_routes_removed.is_empty()
            && self.orphan_ports_released.is_empty()
            && self.failures.is_empty()
    }
}

impl ModuleOrchestrator {
    pub async fn reconcile(&self) -> Result<ReconciliationReport, OrchestratorError> {
        let t = self.settings.timeouts;
        let mut report = ReconciliationReport::default();
        let mut records = self.modules.list_all().await?;

        for module in records.iter_mut() {
            let stuck = matches!(module.state, ModuleState::Installing | ModuleState::Uninstalling);
            if stuck && !self.in_flight.contains_key(module.name.as_str()) {
                warn!(module = %module.name, state = %module.state, "Interrupted operation found, marking module as error");
                module.mark_failed(format!("{} interrupted before completion", module.state));
                self.modules.save(module).await?;
                report.interrupted.push(module.name.to_string());
            }
        }

        let live: HashSet<String> = records
            .iter()
            .filter(|m| m.is_live())
            .map(|m| m.name.to_string())
            .chain(self.in_flight.iter().map(|e| e.key().clone()))
            .collect();

        match timed("list containers", t.health_probe, self.runtime.list_managed()).await {
            Ok(containers) => {
                for container in containers {
                    let owner = container
                        .module
                        .clone()
                        .or_else(|| container.name.strip_prefix("modman-").map(str::to_string));
                    if owner.as_ref().is_some_and(|o| live.contains(o)) {
                        continue;
                    }
                    warn!(container = %container.name, "Removing orphaned module container");
                    if container.running {
                        if let Err(e) = timed(
                            "container stop",
                            t.container_stop,
                            self.runtime.stop(&container.id, self.settings.stop_grace_secs),
                        )
                        .await
                        {
                            report.failures.push(format!("stop {}: {}", container.name, e));
                        }
                    }
                    match timed("container remove", t.container_stop, self.runtime.remove(&container.id)).await {
                        Ok(_) => report.orphan_containers_removed.push(container.name),
                        Err(e) => report.failures.push(format!("remove {}: {}", container.name, e)),
                    }
                }
            }
            Err(e) => report.failures.push(format!("list containers: {}", e)),
        }

        match timed("list routes", t.proxy_reload, self.proxy.list_routes()).await {
            Ok(routes) => {
                for route in routes.into_iter().filter(|r| !live.contains(r)) {
                    let Ok(module) = ModuleName::parse(route.clone()) else {
                        report.failures.push(format!("route fragment '{}' has an invalid module name", route));
                        continue;
                    };
                    warn!(module = %module, "Removing orphaned proxy route");
                    match timed("proxy reload", t.proxy_reload, self.proxy.remove(&module)).await {
                        Ok(_) => report.orphan_routes_removed.push(route),
                        Err(e) => report.failures.push(format!("remove route {}: {}", route, e)),
                    }
                }
            }
            Err(e) => report.failures.push(format!("list routes: {}", e)),
        }

        match timed("port holders", t.health_probe, self.ports.holders()).await {
            Ok(holders) => {
                for holder in holders.into_iter().filter(|h| !live.contains(h.as_str())) {
                    warn!(module = %holder, "Releasing ports held by a module with no live record");
                    match timed("port release", t.health_probe, self.ports.release(&holder)).await {
                        Ok(_) => report.orphan_ports_released.push(holder.to_string()),
                        Err(e) => report.failures.push(format!("release ports of {}: {}", holder, e)),
                    }
                }
            }
            Err(e) => report.failures.push(format!("port holders: {}", e)),
        }

        if report.is_clean() {
            info!("Reconciliation found nothing to repair");
        } else {
            info!(
                interrupted = report.interrupted.len(),
                containers = report.orphan_containers_removed.len(),
                routes = report.orphan_routes_removed.len(),
                ports = report.orphan_ports_released.len(),
                failures = report.failures.len(),
                "Reconciliation complete"
            );
        }

        Ok(report)
    }
}
