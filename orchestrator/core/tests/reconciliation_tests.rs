// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Startup repair of interrupted operations and orphaned resources.

mod common;

use std::sync::atomic::Ordering;

use common::{descriptor, Harness};
use modman_core::application::module_orchestrator::ModuleService;
use modman_core::domain::module::{Module, ModuleName, ModuleState};
use modman_core::domain::port::PortRegistry;
use modman_core::domain::repository::ModuleRepository;
use modman_core::domain::security::ImagePolicy;

fn name(s: &str) -> ModuleName {
    ModuleName::parse(s).unwrap()
}

#[tokio::test]
async fn test_reconcile_repairs_crash_leftovers() {
    let h = Harness::new();
    h.orchestrator.install(descriptor("demo-app", &[8080]), "alice").await.unwrap();

    // A module record stuck mid-install.
    let policy = ImagePolicy::new(vec![common::REGISTRY.to_string()]);
    let validated = descriptor("stuck", &[]).validate(&policy).unwrap();
    let mut stuck = Module::new(&validated, String::new(), "alice");
    stuck.begin_install().unwrap();
    h.modules.save(&stuck).await.unwrap();

    // Resources nobody owns.
    h.runtime.plant_container("modman-ghost", "ghost", true);
    std::fs::write(
        h.routes_dir.join("ghost.conf"),
        "location /ghost/ {\n    proxy_pass http://modman-ghost:80/;\n}\n",
    )
    .unwrap();
    h.ports.allocate(&name("ghost"), &[80]).await.unwrap();

    let report = h.orchestrator.reconcile().await.unwrap();
    assert_eq!(report.interrupted, vec!["stuck"]);
    assert_eq!(report.orphan_containers_removed, vec!["modman-ghost"]);
    assert_eq!(report.orphan_routes_removed, vec!["ghost"]);
    assert_eq!(report.orphan_ports_released, vec!["ghost"]);
    assert!(report.failures.is_empty());

    let stuck = h.modules.find_by_name(&name("stuck")).await.unwrap().unwrap();
    assert_eq!(stuck.state, ModuleState::Error);

    // The healthy module is untouched.
    assert!(h.runtime.container_named("modman-demo-app").unwrap().running);
    assert!(h.fragment("demo-app").is_some());
    assert_eq!(h.ports.holders().await.unwrap(), vec![name("demo-app")]);

    let again = h.orchestrator.reconcile().await.unwrap();
    assert!(again.is_clean());

    // The repaired record can be cleaned up normally.
    h.orchestrator.uninstall("stuck", "alice").await.unwrap();
}

#[tokio::test]
async fn test_reconcile_keeps_resources_of_removed_modules_clean() {
    let h = Harness::new();
    h.orchestrator.install(descriptor("demo-app", &[8080]), "alice").await.unwrap();
    h.orchestrator.uninstall("demo-app", "alice").await.unwrap();

    // A container reappeared for a module whose record is removed.
    h.runtime.plant_container("modman-demo-app", "demo-app", false);

    let report = h.orchestrator.reconcile().await.unwrap();
    assert_eq!(report.orphan_containers_removed, vec!["modman-demo-app"]);
    assert!(report.interrupted.is_empty());
    assert!(h.runtime.containers().is_empty());
}

#[tokio::test]
async fn test_reconcile_reports_unreachable_runtime() {
    let h = Harness::new();
    h.runtime.unreachable.store(true, Ordering::SeqCst);

    let report = h.orchestrator.reconcile().await.unwrap();
    assert!(!report.is_clean());
    assert!(report.failures.iter().any(|f| f.starts_with("list containers")));
}
