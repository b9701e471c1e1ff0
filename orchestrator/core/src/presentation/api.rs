// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! REST surface
//!
//! | Method | Path | Operation |
//! |--------|------|-----------|
//! | `POST` | `/modules/install` | install a module from its descriptor |
//! | `GET` | `/modules/installed` | paginated module records |
//! | `GET` | `/modules/{name}/status` | live status and metrics |
//! | `DELETE` | `/modules/{name}` | uninstall |
//! | `POST` | `/modules/{name}/stop` | stop a running module |
//! | `POST` | `/modules/{name}/start` | start a stopped module |
//! | `GET` | `/modules/audit-log` | filtered audit trail |
//! | `GET` | `/modules/health` | subsystem health |
//! | `GET` | `/health` | liveness |
//!
//! Authentication happens in front of this router. The authenticated caller
//! is passed in the `X-Actor` header and recorded on every audit entry.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use crate::application::error::OrchestratorError;
use crate::application::module_orchestrator::ModuleService;
use crate::domain::audit::{AuditOperation, AuditOutcome, AuditQuery};
use crate::domain::module::ModuleDescriptor;
use crate::domain::repository::RepositoryError;

pub const ACTOR_HEADER: &str = "x-actor";
const ANONYMOUS_ACTOR: &str = "anonymous";

pub struct AppState {
    pub modules: Arc<dyn ModuleService>,
    pub started_at: Instant,
}

pub fn app(service: Arc<dyn ModuleService>) -> Router {
    let state = Arc::new(AppState {
        modules: service,
        started_at: Instant::now(),
    });

    Router::new()
        .route("/health", get(liveness))
        .route("/modules/install", post(install_module))
        .route("/modules/installed", get(list_modules))
        .route("/modules/audit-log", get(audit_log))
        .route("/modules/health", get(subsystem_health))
        .route("/modules/{name}", delete(uninstall_module))
        .route("/modules/{name}/status", get(module_status))
        .route("/modules/{name}/stop", post(stop_module))
        .route("/modules/{name}/start", post(start_module))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Operation(OrchestratorError),
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        ApiError::Operation(err)
    }
}

/// HTTP status for an operation error. Aggregated install failures take the
/// status of the step error that caused them.
pub fn status_for(err: &OrchestratorError) -> StatusCode {
    match err {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::NotFound(_) | OrchestratorError::Repository(RepositoryError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        OrchestratorError::InProgress(_)
        | OrchestratorError::AlreadyInstalled(_)
        | OrchestratorError::InvalidState(_) => StatusCode::CONFLICT,
        OrchestratorError::LicenseInvalid(_) | OrchestratorError::LicenseRevoked(_) => {
            StatusCode::PAYMENT_REQUIRED
        }
        OrchestratorError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::PortRangeExhausted(_) | OrchestratorError::LicenseUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        OrchestratorError::Runtime(_)
        | OrchestratorError::ProxyConfigInvalid(_)
        | OrchestratorError::Proxy(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::StepFailed { cause, .. } => status_for(cause),
        OrchestratorError::RollbackIncomplete { .. }
        | OrchestratorError::TeardownIncomplete { .. }
        | OrchestratorError::PortRegistry(_)
        | OrchestratorError::Repository(_)
        | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "validation", "message": message })),
            )
                .into_response(),
            ApiError::Operation(err) => {
                let status = status_for(&err);
                let mut body = json!({ "error": err.kind(), "message": err.to_string() });
                match &err {
                    OrchestratorError::StepFailed { step, rolled_back, .. } => {
                        body["failedStep"] = json!(step);
                        body["rolledBack"] = json!(rolled_back);
                    }
                    OrchestratorError::RollbackIncomplete {
                        step,
                        rolled_back,
                        failures,
                        ..
                    } => {
                        body["failedStep"] = json!(step);
                        body["rolledBack"] = json!(rolled_back);
                        body["failures"] = json!(failures);
                    }
                    OrchestratorError::TeardownIncomplete { failures, .. } => {
                        body["failures"] = json!(failures);
                    }
                    _ => {}
                }
                (status, Json(body)).into_response()
            }
        }
    }
}

fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_ACTOR)
        .to_string()
}

// ============================================================================
// Handlers
// ============================================================================

async fn liveness(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Runs a mutating operation on its own task. Dropping the connection
/// abandons the response, never a half-applied saga.
async fn detached<T, F>(operation: &'static str, fut: F) -> Result<T, ApiError>
where
    F: Future<Output = Result<T, OrchestratorError>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => Ok(result?),
        Err(e) => Err(ApiError::Operation(OrchestratorError::Internal(format!(
            "{} task aborted: {}",
            operation, e
        )))),
    }
}

async fn install_module(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<ModuleDescriptor>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(descriptor) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let (modules, actor) = (state.modules.clone(), actor(&headers));
    let module = detached("install", async move { modules.install(descriptor, &actor).await }).await?;
    Ok((StatusCode::CREATED, Json(module)).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    page: Option<usize>,
    #[serde(alias = "per_page")]
    per_page: Option<usize>,
}

async fn list_modules(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let page = state
        .modules
        .list(params.page.unwrap_or(1), params.per_page.unwrap_or(20))
        .await?;
    Ok(Json(page).into_response())
}

async fn module_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let report = state.modules.status(&name, &actor(&headers)).await?;
    Ok(Json(report).into_response())
}

async fn uninstall_module(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (modules, actor) = (state.modules.clone(), actor(&headers));
    let summary = detached("uninstall", async move { modules.uninstall(&name, &actor).await }).await?;
    Ok(Json(summary).into_response())
}

async fn stop_module(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (modules, actor) = (state.modules.clone(), actor(&headers));
    let module = detached("stop", async move { modules.stop(&name, &actor).await }).await?;
    Ok(Json(module).into_response())
}

async fn start_module(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (modules, actor) = (state.modules.clone(), actor(&headers));
    let module = detached("start", async move { modules.start(&name, &actor).await }).await?;
    Ok(Json(module).into_response())
}

/// Raw audit-log filter. `status` is accepted as an alias of `outcome`.
#[derive(Debug, Default, Deserialize)]
struct AuditParams {
    module: Option<String>,
    operation: Option<String>,
    #[serde(alias = "status")]
    outcome: Option<String>,
    actor: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl AuditParams {
    fn into_query(self) -> Result<AuditQuery, ApiError> {
        let operation = self
            .operation
            .map(|o| o.parse::<AuditOperation>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        let outcome = self
            .outcome
            .map(|o| o.parse::<AuditOutcome>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        if let (Some(since), Some(until)) = (self.since, self.until) {
            if since > until {
                return Err(ApiError::BadRequest("'since' must not be after 'until'".to_string()));
            }
        }

        Ok(AuditQuery {
            module: self.module,
            operation,
            outcome,
            actor: self.actor,
            since: self.since,
            until: self.until,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

async fn audit_log(
    State(state): State<Arc<AppState>>,
    params: Result<Query<AuditParams>, axum::extract::rejection::QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = params.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let query = params.into_query()?;
    let entries = state.modules.audit_log(query).await?;
    Ok(Json(entries).into_response())
}

async fn subsystem_health(State(state): State<Arc<AppState>>) -> Response {
    let health = state.modules.health().await;
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&OrchestratorError::Validation("x".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&OrchestratorError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(status_for(&OrchestratorError::InProgress("x".into())), StatusCode::CONFLICT);
        assert_eq!(
            status_for(&OrchestratorError::LicenseRevoked("x".into())),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(&OrchestratorError::QuotaExceeded("x".into())),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status_for(&OrchestratorError::PortRangeExhausted("x".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&OrchestratorError::Timeout {
                operation: "image pull".into(),
                after: Duration::from_secs(1)
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_step_failure_takes_cause_status() {
        let err = OrchestratorError::StepFailed {
            step: "apply-route".into(),
            cause: Box::new(OrchestratorError::ProxyConfigInvalid("bad".into())),
            rolled_back: vec!["remove-route".into()],
        };
        assert_eq!(status_for(&err), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_actor_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor(&headers), "anonymous");
        headers.insert(ACTOR_HEADER, "alice".parse().unwrap());
        assert_eq!(actor(&headers), "alice");
    }

    #[test]
    fn test_audit_params_reject_unknown_operation() {
        let params = AuditParams {
            operation: Some("explode".into()),
            ..Default::default()
        };
        assert!(params.into_query().is_err());

        let params = AuditParams {
            operation: Some("status-check".into()),
            outcome: Some("failure".into()),
            ..Default::default()
        };
        let query = params.into_query().unwrap();
        assert_eq!(query.operation, Some(AuditOperation::StatusCheck));
        assert_eq!(query.outcome, Some(AuditOutcome::Failure));
    }
}
