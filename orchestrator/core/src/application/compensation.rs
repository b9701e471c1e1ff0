// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Install compensation stack
//!
//! Each install step that commits a resource pushes the action that undoes
//! it. On a later failure the stack is unwound newest-first. Execution lives
//! in the orchestrator, which owns the collaborators.

use std::time::{Duration, Instant};

use crate::domain::module::ModuleName;

/// Install steps in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    ResolveProfile,
    AllocatePorts,
    StartContainer,
    ApplyRoute,
    Finalize,
}

impl InstallStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ResolveProfile => "resolve-profile",
            Self::AllocatePorts => "allocate-ports",
            Self::StartContainer => "start-container",
            Self::ApplyRoute => "apply-route",
            Self::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for InstallStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compensation {
    ReleasePorts { module: ModuleName },
    RemoveContainer { container_id: String },
    StopContainer { container_id: String },
    RemoveRoute { module: ModuleName },
}

impl Compensation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReleasePorts { .. } => "release-ports",
            Self::RemoveContainer { .. } => "remove-container",
            Self::StopContainer { .. } => "stop-container",
            Self::RemoveRoute { .. } => "remove-route",
        }
    }
}

#[derive(Debug, Default)]
pub struct CompensationStack {
    actions: Vec<Compensation>,
}

impl CompensationStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Compensation) {
        self.actions.push(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Consume the stack in undo order (most recent commit first).
    pub fn unwind(self) -> impl Iterator<Item = Compensation> {
        self.actions.into_iter().rev()
    }
}

/// Result of unwinding a compensation stack.
#[derive(Debug, Default, Clone)]
pub struct RollbackOutcome {
    /// Compensations that succeeded, in execution order
    pub executed: Vec<String>,
    /// `"<compensation>: <error>"` for every compensation that failed
    pub failures: Vec<String>,
}

impl RollbackOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Wall-clock budget shared by every external call in one lifecycle operation.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn new(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.started.elapsed())
    }

    /// Limit for a single call: the step timeout capped by what is left of the budget.
    pub fn bound(&self, step_timeout: Duration) -> Duration {
        step_timeout.min(self.remaining())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
