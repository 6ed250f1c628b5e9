/**
 * HTTP VIEW - Read-only window onto a sync context, plus command entry point
 *
 * ROUTES:
 * - GET  /health               liveness, never behind the api key
 * - GET  /view                 full SyncView (connection, totals, rates, labels, logs)
 * - GET  /units                per-unit rows with display labels
 * - GET  /automations          dosing automation catalogue from the leader
 * - GET  /experiments          experiments, newest first
 * - POST /dosing/{unit}        set the dosing automation of one unit
 * - POST /export               dataset export, returns the public download url
 *
 * SECURITY:
 * When an api key is configured every route except /health requires a
 * matching x-api-key header.
 */

use crate::api::{AutomationDefinition, Experiment, ExportRequest, ExportedDataset};
use crate::context::{SyncContext, SyncView, UnitRow};
use crate::dispatch::{DispatchReceipt, DosingAutomation};
use crate::error::{FetchError, PublishError};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub context: Arc<SyncContext>,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DosingRequest {
    pub automation_key: String,
    #[serde(default)]
    pub skip_first_run: bool,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl DosingRequest {
    fn into_automation(self) -> DosingAutomation {
        self.fields.into_iter().fold(
            DosingAutomation::new(self.automation_key).skip_first_run(self.skip_first_run),
            |automation, (key, value)| automation.with_field(key, value),
        )
    }
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!(path = %req.uri().path(), "rejected request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/view", get(get_view))
        .route("/units", get(get_units))
        .route("/automations", get(get_automations))
        .route("/experiments", get(get_experiments))
        .route("/dosing/{unit}", post(set_dosing))
        .route("/export", post(export))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn get_view(State(app): State<AppState>) -> Json<SyncView> {
    Json(app.context.view())
}

async fn get_units(State(app): State<AppState>) -> Json<Vec<UnitRow>> {
    Json(app.context.view().units())
}

fn fetch_failure(e: FetchError) -> Response {
    warn!(error = %e, "leader request failed");
    (StatusCode::BAD_GATEWAY, Json(json!({ "ok": false, "msg": e.to_string() }))).into_response()
}

async fn get_automations(State(app): State<AppState>) -> Result<Json<Vec<AutomationDefinition>>, Response> {
    app.context
        .backend()
        .dosing_automations()
        .await
        .map(Json)
        .map_err(fetch_failure)
}

async fn get_experiments(State(app): State<AppState>) -> Result<Json<Vec<Experiment>>, Response> {
    app.context
        .backend()
        .experiments()
        .await
        .map(Json)
        .map_err(fetch_failure)
}

// POST /dosing/{unit}
async fn set_dosing(
    State(app): State<AppState>,
    Path(unit): Path<String>,
    Json(req): Json<DosingRequest>,
) -> Result<(StatusCode, Json<DispatchReceipt>), Response> {
    match app.context.dispatch_dosing(&unit, req.into_automation()).await {
        Ok(receipt) => Ok((StatusCode::ACCEPTED, Json(receipt))),
        Err(e) => {
            let code = match e {
                PublishError::NotConnected { .. } => StatusCode::SERVICE_UNAVAILABLE,
                PublishError::Topic(_) => StatusCode::BAD_REQUEST,
                PublishError::Rejected(_) | PublishError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err((code, Json(json!({ "ok": false, "msg": e.to_string() }))).into_response())
        }
    }
}

async fn export(
    State(app): State<AppState>,
    Json(req): Json<ExportRequest>,
) -> Result<Json<ExportedDataset>, Response> {
    app.context
        .backend()
        .export_datasets(&req)
        .await
        .map(Json)
        .map_err(fetch_failure)
}
