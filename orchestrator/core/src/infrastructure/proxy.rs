// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Reverse proxy configuration
//!
//! Each module owns exactly one fragment, `{config_dir}/{module}.conf`, which
//! the proxy's main configuration pulls in with `include {config_dir}/*.conf`.
//! Touching one module therefore never rewrites another module's route.
//!
//! Every change is: write to a hidden temp file, rename into place, run the
//! proxy's syntax check, then reload. A failed check or reload puts the
//! previous fragment back (or deletes the new one), so a broken route is
//! never the live configuration. Operations are serialized by a mutex since
//! the proxy's reload is not safe to run concurrently with itself.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::config::ProxyConfig;
use crate::domain::module::ModuleName;
use crate::domain::proxy::{ProxyConfigurator, ProxyController, ProxyError, ProxyRoute};

const FRAGMENT_EXTENSION: &str = "conf";

pub struct NginxProxyConfigurator {
    config_dir: PathBuf,
    controller: Arc<dyn ProxyController>,
    lock: Mutex<()>,
}

impl NginxProxyConfigurator {
    pub fn new(config_dir: impl Into<PathBuf>, controller: Arc<dyn ProxyController>) -> Self {
        Self {
            config_dir: config_dir.into(),
            controller,
            lock: Mutex::new(()),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    fn fragment_path(&self, module: &ModuleName) -> PathBuf {
        self.config_dir.join(format!("{}.{}", module, FRAGMENT_EXTENSION))
    }

    /// Hidden and without the `.conf` suffix, so a wildcard include never picks it up.
    fn temp_path(&self, module: &ModuleName) -> PathBuf {
        self.config_dir.join(format!(".{}.{}.tmp", module, FRAGMENT_EXTENSION))
    }

    async fn read_existing(path: &Path) -> Result<Option<String>, ProxyError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, module: &ModuleName, contents: &str) -> Result<(), ProxyError> {
        let temp = self.temp_path(module);
        tokio::fs::write(&temp, contents).await?;
        tokio::fs::rename(&temp, self.fragment_path(module)).await?;
        Ok(())
    }

    /// Put the fragment back to `previous` (or remove it when there was none).
    async fn restore(&self, module: &ModuleName, previous: Option<&str>) {
        let result = match previous {
            Some(contents) => self.write_atomic(module, contents).await,
            None => match tokio::fs::remove_file(self.fragment_path(module)).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        };
        if let Err(e) = result {
            error!(module = %module, "Failed to restore previous proxy fragment: {}", e);
        }
    }

    /// Validate then reload; on failure restore `previous` and leave the proxy
    /// running its last good configuration.
    async fn activate(&self, module: &ModuleName, previous: Option<&str>) -> Result<(), ProxyError> {
        if let Err(e) = self.controller.validate().await {
            warn!(module = %module, "Proxy configuration rejected, restoring previous fragment: {}", e);
            self.restore(module, previous).await;
            return Err(match e {
                ProxyError::ConfigInvalid(_) => e,
                other => ProxyError::ConfigInvalid(other.to_string()),
            });
        }

        if let Err(e) = self.controller.reload().await {
            warn!(module = %module, "Proxy reload failed, restoring previous fragment: {}", e);
            self.restore(module, previous).await;
            if let Err(again) = self.controller.reload().await {
                error!(module = %module, "Proxy reload after restore also failed: {}", again);
            }
            return Err(e);
        }

        Ok(())
    }
}

#[async_trait]
impl ProxyConfigurator for NginxProxyConfigurator {
    async fn apply(&self, route: &ProxyRoute) -> Result<(), ProxyError> {
        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.config_dir).await?;

        let path = self.fragment_path(&route.module);
        let previous = Self::read_existing(&path).await?;
        self.write_atomic(&route.module, &route.render_fragment()).await?;
        self.activate(&route.module, previous.as_deref()).await?;

        info!(
            module = %route.module,
            path_prefix = %route.path_prefix,
            upstream = %route.upstream_target(),
            "Proxy route applied"
        );
        Ok(())
    }

    async fn remove(&self, module: &ModuleName) -> Result<bool, ProxyError> {
        let _guard = self.lock.lock().await;

        let path = self.fragment_path(module);
        let Some(previous) = Self::read_existing(&path).await? else {
            debug!(module = %module, "No proxy fragment to remove");
            return Ok(false);
        };

        tokio::fs::remove_file(&path).await?;
        self.activate(module, Some(&previous)).await?;

        info!(module = %module, "Proxy route removed");
        Ok(true)
    }

    async fn list_routes(&self) -> Result<Vec<String>, ProxyError> {
        let mut entries = match tokio::fs::read_dir(&self.config_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut routes = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FRAGMENT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    routes.push(stem.to_string());
                }
            }
        }
        routes.sort();
        Ok(routes)
    }

    async fn health(&self) -> Result<(), ProxyError> {
        self.controller.validate().await
    }
}

/// Drives the proxy through external commands (`nginx -t`, `nginx -s reload`).
/// An empty command is a no-op, for hosts where the proxy watches its config directory.
pub struct CommandProxyController {
    validate_command: Vec<String>,
    reload_command: Vec<String>,
}

impl CommandProxyController {
    pub fn new(validate_command: Vec<String>, reload_command: Vec<String>) -> Self {
        Self {
            validate_command,
            reload_command,
        }
    }

    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::new(config.validate_command.clone(), config.reload_command.clone())
    }

    /// Run `command`; `Err` carries stderr (or stdout) of a non-zero exit.
    async fn run(command: &[String]) -> Result<Result<(), String>, ProxyError> {
        let Some((program, args)) = command.split_first() else {
            return Ok(Ok(()));
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| ProxyError::Unavailable(format!("failed to run '{}': {}", program, e)))?;

        if output.status.success() {
            return Ok(Ok(()));
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let detail = if stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr
        };
        Ok(Err(format!("'{}' exited with {}: {}", command.join(" "), output.status, detail)))
    }
}

#[async_trait]
impl ProxyController for CommandProxyController {
    async fn validate(&self) -> Result<(), ProxyError> {
        Self::run(&self.validate_command).await?.map_err(ProxyError::ConfigInvalid)
    }

    async fn reload(&self) -> Result<(), ProxyError> {
        Self::run(&self.reload_command).await?.map_err(ProxyError::Reload)
    }
}
