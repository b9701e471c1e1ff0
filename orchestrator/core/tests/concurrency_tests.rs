// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Concurrent operations, port reuse and route isolation.

mod common;

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{descriptor, Harness};
use modman_core::application::error::OrchestratorError;
use modman_core::application::module_orchestrator::ModuleService;
use modman_core::domain::port::PortRange;
use modman_core::domain::proxy::ProxyConfigurator;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_installs_get_distinct_ports() {
    let h = Harness::new();
    h.runtime.set_pull_delay(Duration::from_millis(20));

    let mut handles = Vec::new();
    for i in 0..10 {
        let orchestrator = h.orchestrator.clone();
        handles.push(tokio::spawn(async move {
            orchestrator
                .install(descriptor(&format!("module-{}", i), &[8080]), &format!("actor-{}", i))
                .await
        }));
    }

    let mut external = HashSet::new();
    for handle in handles {
        let module = handle.await.unwrap().expect("install succeeds");
        for port in module.allocated_ports.values() {
            assert!(external.insert(*port), "port {} handed out twice", port);
        }
    }
    assert_eq!(external.len(), 10);
    assert_eq!(h.proxy.list_routes().await.unwrap().len(), 10);
    assert_eq!(h.runtime.containers().len(), 10);
}

#[tokio::test]
async fn test_same_name_install_is_rejected_while_in_flight() {
    let h = Harness::new();
    h.runtime.set_pull_delay(Duration::from_millis(200));

    let (first, second) = tokio::join!(
        h.orchestrator.install(descriptor("demo-app", &[8080]), "alice"),
        h.orchestrator.install(descriptor("demo-app", &[8080]), "bob"),
    );

    let first = first.expect("first install wins");
    assert_eq!(first.created_by, "alice");
    assert!(matches!(second, Err(OrchestratorError::InProgress(_))));
    assert_eq!(h.runtime.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_uninstall_during_install_is_rejected() {
    let h = Harness::new();
    h.runtime.set_pull_delay(Duration::from_millis(200));

    let (install, uninstall) = tokio::join!(
        h.orchestrator.install(descriptor("demo-app", &[8080]), "alice"),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            h.orchestrator.uninstall("demo-app", "alice").await
        },
    );

    assert!(install.is_ok());
    assert!(matches!(uninstall, Err(OrchestratorError::InProgress(_))));

    // Guard is released once the install returns.
    h.orchestrator.uninstall("demo-app", "alice").await.unwrap();
}

#[tokio::test]
async fn test_released_ports_are_reused_after_wrap() {
    let h = Harness::with_range(PortRange::new(9000, 9002).unwrap());

    let a = h.orchestrator.install(descriptor("a", &[80]), "alice").await.unwrap();
    let b = h.orchestrator.install(descriptor("b", &[80]), "alice").await.unwrap();
    let c = h.orchestrator.install(descriptor("c", &[80]), "bob").await.unwrap();
    assert_eq!(a.allocated_ports.get(&80), Some(&9000));
    assert_eq!(b.allocated_ports.get(&80), Some(&9001));
    assert_eq!(c.allocated_ports.get(&80), Some(&9002));

    h.orchestrator.uninstall("a", "alice").await.unwrap();
    let d = h.orchestrator.install(descriptor("d", &[80]), "alice").await.unwrap();
    assert_eq!(d.allocated_ports.get(&80), Some(&9000));

    h.orchestrator.uninstall("b", "alice").await.unwrap();
    let e = h.orchestrator.install(descriptor("e", &[80]), "carol").await.unwrap();
    assert_eq!(e.allocated_ports.get(&80), Some(&9001));

    let err = h.orchestrator.install(descriptor("f", &[80]), "carol").await.unwrap_err();
    assert_eq!(err.kind(), "port_range_exhausted");
}

#[tokio::test]
async fn test_failed_route_leaves_other_routes_untouched() {
    let h = Harness::new();
    h.orchestrator.install(descriptor("wiki", &[3000]), "alice").await.unwrap();
    h.orchestrator.install(descriptor("crm", &[8069]), "alice").await.unwrap();
    let wiki = h.fragment("wiki").unwrap();
    let crm = h.fragment("crm").unwrap();

    h.controller.fail_validate.store(true, Ordering::SeqCst);
    let err = h
        .orchestrator
        .install(descriptor("demo-app", &[8080]), "alice")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "proxy_config_invalid");

    assert_eq!(h.fragment("wiki").as_deref(), Some(wiki.as_str()));
    assert_eq!(h.fragment("crm").as_deref(), Some(crm.as_str()));
    assert!(h.fragment("demo-app").is_none());
    assert_eq!(h.proxy.list_routes().await.unwrap(), vec!["crm", "wiki"]);

    // The surviving modules keep running.
    assert!(h.runtime.container_named("modman-wiki").unwrap().running);
    assert!(h.runtime.container_named("modman-crm").unwrap().running);
}

#[tokio::test]
async fn test_websocket_route_carries_upgrade_headers() {
    let h = Harness::new();
    let mut request = descriptor("chat", &[4000]);
    request.websocket_enabled = true;
    h.orchestrator.install(request, "alice").await.unwrap();

    let fragment = h.fragment("chat").unwrap();
    assert!(fragment.contains("proxy_set_header Upgrade $http_upgrade;"));
    assert!(fragment.contains("proxy_read_timeout 3600s;"));
}
