// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Module host process
//!
//! - `server`: wires the core services together and serves the HTTP API
//! - `client`: typed HTTP client the CLI commands delegate to
//! - liveness probing of a running host

use anyhow::Result;
use std::time::Duration;

pub mod client;
pub mod server;

pub use client::DaemonClient;
pub use server::run_server;

#[derive(Debug, Clone, PartialEq)]
pub enum DaemonStatus {
    Running { uptime: Option<u64> },
    Stopped,
    Unhealthy { error: String },
}

/// `http://host:port`, leaving an explicit scheme alone.
pub fn base_url(host: &str, port: u16) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        format!("{}:{}", host.trim_end_matches('/'), port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Probe the liveness endpoint of a host.
pub async fn check_daemon_running(host: &str, port: u16) -> Result<DaemonStatus> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(500))
        .build()?;

    let health_url = format!("{}/health", base_url(host, port));

    match client.get(&health_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            let uptime = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v["uptimeSeconds"].as_u64());
            Ok(DaemonStatus::Running { uptime })
        }
        Ok(resp) => Ok(DaemonStatus::Unhealthy {
            error: format!("HTTP {}", resp.status()),
        }),
        Err(e) if e.is_connect() || e.is_timeout() => Ok(DaemonStatus::Stopped),
        Err(e) => Ok(DaemonStatus::Unhealthy { error: e.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(base_url("127.0.0.1", 8700), "http://127.0.0.1:8700");
        assert_eq!(base_url("https://modman.internal", 443), "https://modman.internal:443");
        assert_eq!(base_url("http://host/", 80), "http://host:80");
    }
}
