// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reverse-proxy routing
//!
//! One route per module, rendered into its own fragment so a bad render
//! can only affect the module it belongs to.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use thiserror::Error;

use crate::domain::module::ModuleName;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRoute {
    pub module: ModuleName,
    pub path_prefix: String,
    pub upstream_host: String,
    pub upstream_port: u16,
    pub websocket_enabled: bool,
}

impl ProxyRoute {
    /// Route `/{name}/` to the module container's DNS name on its first internal port.
    pub fn for_module(module: &ModuleName, internal_port: u16, websocket_enabled: bool) -> Self {
        Self {
            module: module.clone(),
            path_prefix: module.route_prefix(),
            upstream_host: module.container_name(),
            upstream_port: internal_port,
            websocket_enabled,
        }
    }

    pub fn upstream_target(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    /// nginx `location` block for this route.
    pub fn render_fragment(&self) -> String {
        let mut out = String::new();
        let prefix = self.path_prefix.trim_end_matches('/');

        let _ = writeln!(out, "# managed by modman, module {}", self.module);
        let _ = writeln!(out, "location {} {{", self.path_prefix);
        let _ = writeln!(out, "    proxy_pass http://{}/;", self.upstream_target());
        let _ = writeln!(out, "    proxy_http_version 1.1;");
        let _ = writeln!(out, "    proxy_set_header Host $host;");
        let _ = writeln!(out, "    proxy_set_header X-Real-IP $remote_addr;");
        let _ = writeln!(out, "    proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;");
        let _ = writeln!(out, "    proxy_set_header X-Forwarded-Proto $scheme;");
        let _ = writeln!(out, "    proxy_set_header X-Forwarded-Prefix {};", prefix);
        let _ = writeln!(out, "    proxy_connect_timeout 5s;");
        if self.websocket_enabled {
            let _ = writeln!(out, "    proxy_set_header Upgrade $http_upgrade;");
            let _ = writeln!(out, "    proxy_set_header Connection \"upgrade\";");
            let _ = writeln!(out, "    proxy_read_timeout 3600s;");
        } else {
            let _ = writeln!(out, "    proxy_read_timeout 60s;");
        }
        let _ = writeln!(out, "}}");
        out
    }
}

/// Writes, validates and activates per-module routes.
///
/// Both operations leave every other module's route untouched. A route that
/// fails validation is never activated and the previous configuration stays live.
#[async_trait]
pub trait ProxyConfigurator: Send + Sync {
    /// Create or replace the module's route in a single reload cycle.
    async fn apply(&self, route: &ProxyRoute) -> Result<(), ProxyError>;

    /// Remove the module's route. Returns false when it was already absent.
    async fn remove(&self, module: &ModuleName) -> Result<bool, ProxyError>;

    /// Modules that currently have a route fragment.
    async fn list_routes(&self) -> Result<Vec<String>, ProxyError>;

    async fn health(&self) -> Result<(), ProxyError>;
}

/// Drives the proxy process itself: syntax check and graceful reload.
#[async_trait]
pub trait ProxyController: Send + Sync {
    async fn validate(&self) -> Result<(), ProxyError>;
    async fn reload(&self) -> Result<(), ProxyError>;
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Proxy configuration invalid: {0}")]
    ConfigInvalid(String),
    #[error("Proxy reload failed: {0}")]
    Reload(String),
    #[error("Proxy configuration I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Proxy unavailable: {0}")]
    Unavailable(String),
}
