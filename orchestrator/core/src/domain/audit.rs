// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Audit trail
//!
//! Entries are immutable once appended. The application never updates or
//! deletes them; retention is enforced by an external janitor sweeping on
//! `timestamp`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditOperation {
    Install,
    Uninstall,
    StatusCheck,
    Stop,
    Start,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::StatusCheck => "status-check",
            Self::Stop => "stop",
            Self::Start => "start",
        }
    }
}

impl std::str::FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "install" => Ok(Self::Install),
            "uninstall" => Ok(Self::Uninstall),
            "status-check" | "status" => Ok(Self::StatusCheck),
            "stop" => Ok(Self::Stop),
            "start" => Ok(Self::Start),
            other => Err(format!("unknown audit operation '{}'", other)),
        }
    }
}

impl std::fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::str::FromStr for AuditOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(format!("unknown audit outcome '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub module: String,
    pub operation: AuditOperation,
    pub actor: String,
    pub outcome: AuditOutcome,
    pub duration_ms: u64,
    pub detail: String,
    /// Step that failed, for post-commit failures
    pub failed_step: Option<String>,
    /// Compensations executed, in execution order
    #[serde(default)]
    pub rolled_back: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        module: impl Into<String>,
        operation: AuditOperation,
        actor: impl Into<String>,
        outcome: AuditOutcome,
        duration_ms: u64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            module: module.into(),
            operation,
            actor: actor.into(),
            outcome,
            duration_ms,
            detail: detail.into(),
            failed_step: None,
            rolled_back: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_rollback(mut self, failed_step: impl Into<String>, rolled_back: Vec<String>) -> Self {
        self.failed_step = Some(failed_step.into());
        self.rolled_back = rolled_back;
        self
    }
}

/// Filter over the audit trail. Results are newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditQuery {
    pub module: Option<String>,
    pub operation: Option<AuditOperation>,
    pub outcome: Option<AuditOutcome>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl AuditQuery {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 1000;

    pub fn for_module(module: impl Into<String>) -> Self {
        Self {
            module: Some(module.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.module.as_ref().is_none_or(|m| &entry.module == m)
            && self.operation.is_none_or(|o| entry.operation == o)
            && self.outcome.is_none_or(|o| entry.outcome == o)
            && self.actor.as_ref().is_none_or(|a| &entry.actor == a)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }

    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(module: &str, operation: AuditOperation, outcome: AuditOutcome) -> AuditLogEntry {
        AuditLogEntry::new(module, operation, "alice", outcome, 12, "ok")
    }

    #[test]
    fn test_query_filters() {
        let e = entry("demo-app", AuditOperation::Install, AuditOutcome::Success);

        assert!(AuditQuery::default().matches(&e));
        assert!(AuditQuery::for_module("demo-app").matches(&e));
        assert!(!AuditQuery::for_module("other").matches(&e));

        let q = AuditQuery {
            operation: Some(AuditOperation::Uninstall),
            ..Default::default()
        };
        assert!(!q.matches(&e));

        let q = AuditQuery {
            outcome: Some(AuditOutcome::Success),
            actor: Some("alice".to_string()),
            ..Default::default()
        };
        assert!(q.matches(&e));
    }

    #[test]
    fn test_query_time_range() {
        let e = entry("demo-app", AuditOperation::StatusCheck, AuditOutcome::Success);
        let q = AuditQuery {
            since: Some(e.timestamp - Duration::minutes(1)),
            until: Some(e.timestamp + Duration::minutes(1)),
            ..Default::default()
        };
        assert!(q.matches(&e));

        let q = AuditQuery {
            since: Some(e.timestamp + Duration::seconds(1)),
            ..Default::default()
        };
        assert!(!q.matches(&e));
    }

    #[test]
    fn test_limit_clamped() {
        let q = AuditQuery {
            limit: Some(1_000_000),
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), AuditQuery::MAX_LIMIT);
        assert_eq!(AuditQuery::default().effective_limit(), AuditQuery::DEFAULT_LIMIT);
    }

    #[test]
    fn test_operation_serialization() {
        assert_eq!(
            serde_json::to_string(&AuditOperation::StatusCheck).unwrap(),
            "\"status-check\""
        );
        assert_eq!("status-check".parse::<AuditOperation>().unwrap(), AuditOperation::StatusCheck);
    }
}
