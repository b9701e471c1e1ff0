// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod compensation;
pub mod error;
pub mod module_orchestrator;
pub mod reconciliation;
pub mod repository_factory;

// Re-export use cases for convenience
pub use error::OrchestratorError;
pub use module_orchestrator::{
    Collaborators, ComponentHealth, ModuleOrchestrator, ModuleService, ModuleStatusReport,
    OrchestratorSettings, SubsystemHealth, UninstallSummary,
};
pub use reconciliation::ReconciliationReport;
