// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! HTTP client for communicating with the module host API

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use modman_core::application::module_orchestrator::{ModuleStatusReport, SubsystemHealth, UninstallSummary};
use modman_core::domain::audit::AuditLogEntry;
use modman_core::domain::module::{Module, ModuleDescriptor};
use modman_core::domain::repository::ModulePage;
use modman_core::presentation::api::ACTOR_HEADER;

use super::base_url;

/// Audit-log filter as sent to `GET /modules/audit-log`.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub module: Option<String>,
    pub operation: Option<String>,
    pub outcome: Option<String>,
    pub actor: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(v) = &self.module {
            params.push(("module", v.clone()));
        }
        if let Some(v) = &self.operation {
            params.push(("operation", v.clone()));
        }
        if let Some(v) = &self.outcome {
            params.push(("outcome", v.clone()));
        }
        if let Some(v) = &self.actor {
            params.push(("actor", v.clone()));
        }
        if let Some(v) = &self.since {
            params.push(("since", v.to_rfc3339()));
        }
        if let Some(v) = &self.until {
            params.push(("until", v.to_rfc3339()));
        }
        if let Some(v) = self.limit {
            params.push(("limit", v.to_string()));
        }
        params
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(default, rename = "failedStep")]
    failed_step: Option<String>,
    #[serde(default, rename = "rolledBack")]
    rolled_back: Vec<String>,
    #[serde(default)]
    failures: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonClient {
    client: Client,
    base_url: String,
    actor: String,
}

impl DaemonClient {
    pub fn new(host: &str, port: u16, actor: impl Into<String>) -> Result<Self> {
        // Installs pull images; the host enforces its own operation budget.
        let client = Client::builder()
            .timeout(Duration::from_secs(900))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url(host, port),
            actor: actor.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn with_actor(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(ACTOR_HEADER, &self.actor)
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        request
            .send()
            .await
            .with_context(|| format!("Failed to {} (is `modman serve` running at {}?)", what, self.base_url))
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Failed to {}: {}", what, describe_error(status, &text));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }

    pub async fn install(&self, descriptor: &ModuleDescriptor) -> Result<Module> {
        let request = self.with_actor(self.client.post(self.url("/modules/install")).json(descriptor));
        let response = self.send(request, "install module").await?;
        Self::parse(response, "install module").await
    }

    pub async fn list(&self, page: usize, per_page: usize) -> Result<ModulePage> {
        let url = format!("{}?page={}&perPage={}", self.url("/modules/installed"), page, per_page);
        let response = self.send(self.client.get(url), "list modules").await?;
        Self::parse(response, "list modules").await
    }

    pub async fn status(&self, name: &str) -> Result<ModuleStatusReport> {
        let request = self.with_actor(self.client.get(self.url(&format!("/modules/{}/status", name))));
        let response = self.send(request, "get module status").await?;
        Self::parse(response, "get module status").await
    }

    pub async fn uninstall(&self, name: &str) -> Result<UninstallSummary> {
        let request = self.with_actor(self.client.delete(self.url(&format!("/modules/{}", name))));
        let response = self.send(request, "uninstall module").await?;
        Self::parse(response, "uninstall module").await
    }

    pub async fn stop(&self, name: &str) -> Result<Module> {
        let request = self.with_actor(self.client.post(self.url(&format!("/modules/{}/stop", name))));
        let response = self.send(request, "stop module").await?;
        Self::parse(response, "stop module").await
    }

    pub async fn start(&self, name: &str) -> Result<Module> {
        let request = self.with_actor(self.client.post(self.url(&format!("/modules/{}/start", name))));
        let response = self.send(request, "start module").await?;
        Self::parse(response, "start module").await
    }

    pub async fn audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditLogEntry>> {
        let url = Url::parse_with_params(&self.url("/modules/audit-log"), filter.params())
            .context("Failed to build audit-log URL")?;
        let response = self.send(self.client.get(url), "query audit log").await?;
        Self::parse(response, "query audit log").await
    }

    /// Subsystem health. A 503 still carries the per-component report.
    pub async fn health(&self) -> Result<SubsystemHealth> {
        let response = self.send(self.client.get(self.url("/modules/health")), "check health").await?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return response
                .json()
                .await
                .context("Failed to parse health response");
        }
        Self::parse(response, "check health").await
    }
}

/// Render an API error body for humans; falls back to the raw text.
fn describe_error(status: StatusCode, text: &str) -> String {
    let Ok(body) = serde_json::from_str::<ErrorBody>(text) else {
        return format!("HTTP {}: {}", status, text);
    };

    let mut out = format!("{} ({})", body.message, body.error);
    if let Some(step) = body.failed_step {
        out.push_str(&format!("\n  failed step: {}", step));
    }
    if !body.rolled_back.is_empty() {
        out.push_str(&format!("\n  rolled back: {}", body.rolled_back.join(", ")));
    }
    for failure in body.failures {
        out.push_str(&format!("\n  failure: {}", failure));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_error_with_rollback() {
        let text = r#"{"error":"proxy_config_invalid","message":"Install step 'apply-route' failed","failedStep":"apply-route","rolledBack":["remove-route","release-ports"]}"#;
        let rendered = describe_error(StatusCode::BAD_GATEWAY, text);
        assert!(rendered.starts_with("Install step 'apply-route' failed (proxy_config_invalid)"));
        assert!(rendered.contains("failed step: apply-route"));
        assert!(rendered.contains("rolled back: remove-route, release-ports"));
    }

    #[test]
    fn test_describe_error_falls_back_to_raw_text() {
        let rendered = describe_error(StatusCode::BAD_GATEWAY, "upstream went away");
        assert_eq!(rendered, "HTTP 502 Bad Gateway: upstream went away");
    }

    #[test]
    fn test_audit_filter_params() {
        let filter = AuditFilter {
            module: Some("demo-app".to_string()),
            outcome: Some("failure".to_string()),
            limit: Some(10),
            ..Default::default()
        };
        let url = Url::parse_with_params("http://127.0.0.1:8700/modules/audit-log", filter.params()).unwrap();
        assert_eq!(url.query(), Some("module=demo-app&outcome=failure&limit=10"));
    }
}
