// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Install failures at each step, and the compensations they trigger.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{descriptor, Harness};
use modman_core::application::error::OrchestratorError;
use modman_core::application::module_orchestrator::ModuleService;
use modman_core::domain::audit::{AuditOutcome, AuditQuery};
use modman_core::domain::events::ModuleEvent;
use modman_core::domain::module::{ModuleName, ModuleState};
use modman_core::domain::port::{PortRange, PortRegistry};
use modman_core::domain::repository::ModuleRepository;

fn name(s: &str) -> ModuleName {
    ModuleName::parse(s).unwrap()
}

fn rolled_back(err: &OrchestratorError) -> (&str, Vec<&str>) {
    match err {
        OrchestratorError::StepFailed { step, rolled_back, .. } => {
            (step.as_str(), rolled_back.iter().map(String::as_str).collect())
        }
        other => panic!("expected StepFailed, got {:?}", other),
    }
}

async fn assert_nothing_left(h: &Harness, module: &str) {
    assert!(h.runtime.containers().is_empty(), "containers left behind");
    assert!(h.fragment(module).is_none(), "route fragment left behind");
    assert!(h.ports.holders().await.unwrap().is_empty(), "ports left allocated");

    let record = h.modules.find_by_name(&name(module)).await.unwrap().unwrap();
    assert_eq!(record.state, ModuleState::Error);
    assert!(record.last_error.is_some());
    assert!(record.allocated_ports.is_empty());
    assert!(record.container_id.is_none());
}

#[tokio::test]
async fn test_proxy_rejection_unwinds_every_step() {
    let h = Harness::new();
    h.controller.fail_validate.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "proxy_config_invalid");
    let (step, compensations) = rolled_back(&err);
    assert_eq!(step, "apply-route");
    assert_eq!(
        compensations,
        vec!["remove-route", "stop-container", "remove-container", "release-ports"]
    );
    assert_nothing_left(&h, "demo-app").await;

    let entries = h
        .orchestrator
        .audit_log(AuditQuery::for_module("demo-app"))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failure);
    assert_eq!(entries[0].failed_step.as_deref(), Some("apply-route"));
    assert_eq!(
        entries[0].rolled_back,
        vec!["remove-route", "stop-container", "remove-container", "release-ports"]
    );
}

#[tokio::test]
async fn test_start_failure_unwinds_container_and_ports() {
    let h = Harness::new();
    h.runtime.fail_start.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[8080, 8081]), "alice")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "runtime");
    let (step, compensations) = rolled_back(&err);
    assert_eq!(step, "start-container");
    assert_eq!(compensations, vec!["stop-container", "remove-container", "release-ports"]);
    assert_nothing_left(&h, "demo-app").await;
    assert_eq!(h.controller.reloads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_pull_failure_has_nothing_to_undo() {
    let h = Harness::new();
    h.runtime.fail_pull.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();

    let (step, compensations) = rolled_back(&err);
    assert_eq!(step, "resolve-profile");
    assert!(compensations.is_empty());
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);
    assert_nothing_left(&h, "demo-app").await;
}

#[tokio::test]
async fn test_port_exhaustion_allocates_nothing() {
    let h = Harness::with_range(PortRange::new(9000, 9001).unwrap());

    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[80, 81, 82]), "alice")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "port_range_exhausted");
    let (step, compensations) = rolled_back(&err);
    assert_eq!(step, "allocate-ports");
    assert_eq!(compensations, vec!["release-ports"]);
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 0);
    assert_nothing_left(&h, "demo-app").await;
}

#[tokio::test]
async fn test_failed_compensation_reports_incomplete_rollback() {
    let h = Harness::new();
    h.controller.fail_validate.store(true, Ordering::SeqCst);
    h.runtime.fail_remove.store(true, Ordering::SeqCst);

    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "rollback_incomplete");
    match &err {
        OrchestratorError::RollbackIncomplete {
            step,
            rolled_back,
            failures,
            ..
        } => {
            assert_eq!(step, "apply-route");
            assert_eq!(rolled_back, &vec!["remove-route", "stop-container", "release-ports"]);
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("remove-container"));
        }
        other => panic!("expected RollbackIncomplete, got {:?}", other),
    }

    // Later compensations still ran.
    assert!(h.ports.holders().await.unwrap().is_empty());

    let record = h.modules.find_by_name(&name("demo-app")).await.unwrap().unwrap();
    assert_eq!(record.state, ModuleState::Error);
    // Bindings are kept so an operator can see what is left behind.
    assert!(record.container_id.is_some());

    let entries = h
        .orchestrator
        .audit_log(AuditQuery::for_module("demo-app"))
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].detail.contains("rollback incomplete"));
}

#[tokio::test]
async fn test_step_timeout_is_reported_and_rolled_back() {
    let h = Harness::with(PortRange::default(), |s| {
        s.timeouts.container_start = Duration::from_millis(50);
    });
    h.runtime.set_start_delay(Duration::from_millis(500));

    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "timeout");
    let (step, compensations) = rolled_back(&err);
    assert_eq!(step, "start-container");
    assert_eq!(compensations, vec!["stop-container", "remove-container", "release-ports"]);
    assert_nothing_left(&h, "demo-app").await;
}

#[tokio::test]
async fn test_failed_module_can_be_uninstalled_and_reinstalled() {
    let h = Harness::new();
    h.runtime.fail_start.store(true, Ordering::SeqCst);
    h.orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();

    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyInstalled(_)));

    h.orchestrator.uninstall("demo-app", "alice").await.unwrap();
    h.runtime.fail_start.store(false, Ordering::SeqCst);

    let module = h
        .orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap();
    assert_eq!(module.state, ModuleState::Running);
}

#[tokio::test]
async fn test_incomplete_teardown_leaves_module_in_error() {
    let h = Harness::new();
    h.orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap();
    h.runtime.fail_remove.store(true, Ordering::SeqCst);

    let err = h.orchestrator.uninstall("demo-app", "alice").await.unwrap_err();
    match &err {
        OrchestratorError::TeardownIncomplete { failures, .. } => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("remove-container"));
        }
        other => panic!("expected TeardownIncomplete, got {:?}", other),
    }

    // Remaining teardown steps still ran.
    assert!(h.fragment("demo-app").is_none());
    assert!(h.ports.holders().await.unwrap().is_empty());
    let record = h.modules.find_by_name(&name("demo-app")).await.unwrap().unwrap();
    assert_eq!(record.state, ModuleState::Error);

    h.runtime.fail_remove.store(false, Ordering::SeqCst);
    h.orchestrator.uninstall("demo-app", "alice").await.unwrap();
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_rollback_event_is_published() {
    let h = Harness::new();
    let mut events = h.events.subscribe_module(name("demo-app"));
    h.runtime.fail_start.store(true, Ordering::SeqCst);

    h.orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();

    loop {
        match events.recv().await.unwrap() {
            ModuleEvent::InstallRolledBack {
                failed_step,
                compensations,
                complete,
                ..
            } => {
                assert_eq!(failed_step, "start-container");
                assert_eq!(compensations.len(), 3);
                assert!(complete);
                break;
            }
            ModuleEvent::ModuleInstalled { .. } => panic!("install must not complete"),
            _ => continue,
        }
    }
}
