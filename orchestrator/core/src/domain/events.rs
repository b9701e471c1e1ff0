// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::module::{ModuleName, ModuleState};
use crate::domain::security::SecurityProfile;

/// Module lifecycle events published for in-process observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModuleEvent {
    InstallStarted {
        module: ModuleName,
        actor: String,
        started_at: DateTime<Utc>,
    },
    PortsAllocated {
        module: ModuleName,
        ports: BTreeMap<u16, u16>,
        allocated_at: DateTime<Utc>,
    },
    ContainerStarted {
        module: ModuleName,
        container_id: String,
        profile: SecurityProfile,
        started_at: DateTime<Utc>,
    },
    RouteApplied {
        module: ModuleName,
        path_prefix: String,
        applied_at: DateTime<Utc>,
    },
    ModuleInstalled {
        module: ModuleName,
        duration_ms: u64,
        installed_at: DateTime<Utc>,
    },
    InstallRolledBack {
        module: ModuleName,
        failed_step: String,
        compensations: Vec<String>,
        complete: bool,
        rolled_back_at: DateTime<Utc>,
    },
    StateChanged {
        module: ModuleName,
        from: ModuleState,
        to: ModuleState,
        changed_at: DateTime<Utc>,
    },
    ModuleUninstalled {
        module: ModuleName,
        released_ports: usize,
        uninstalled_at: DateTime<Utc>,
    },
}

impl ModuleEvent {
    pub fn module(&self) -> &ModuleName {
        match self {
            Self::InstallStarted { module, .. }
            | Self::PortsAllocated { module, .. }
            | Self::ContainerStarted { module, .. }
            | Self::RouteApplied { module, .. }
            | Self::ModuleInstalled { module, .. }
            | Self::InstallRolledBack { module, .. }
            | Self::StateChanged { module, .. }
            | Self::ModuleUninstalled { module, .. } => module,
        }
    }
}
