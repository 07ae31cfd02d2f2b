use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use tracing::debug;

use super::AppState;
use crate::catalog;
use crate::db::{EventFilter, TriggerFilter};
use crate::error::OrchestrateError;
use crate::model::{App, EventStatus, NewTrigger, TriggerStatus};
use crate::orchestrator::TriggerPatch;

/// Thin CRUD surface over the orchestrator. Authentication and project
/// scoping belong to the layer in front of this process; these handlers
/// translate HTTP to orchestrator calls and back.

pub async fn create_trigger(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewTrigger>,
) -> Result<Response, OrchestrateError> {
    let trigger = state.orchestrator.create(request).await?;
    Ok((StatusCode::CREATED, Json(trigger)).into_response())
}

pub async fn get_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestrateError> {
    let trigger = state.orchestrator.get(&id)?;
    Ok(Json(trigger).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListTriggersQuery {
    pub project_id: String,
    pub status: Option<TriggerStatus>,
    pub app: Option<App>,
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

fn default_per_page() -> u32 {
    50
}

pub async fn list_triggers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTriggersQuery>,
) -> Result<Response, OrchestrateError> {
    let triggers = state.db.list_triggers(
        &query.project_id,
        &TriggerFilter { status: query.status, app: query.app },
        query.page,
        query.per_page,
    )?;
    Ok(Json(triggers).into_response())
}

pub async fn update_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<TriggerPatch>,
) -> Result<Response, OrchestrateError> {
    let trigger = state.orchestrator.update(&id, patch).await?;
    Ok(Json(trigger).into_response())
}

pub async fn delete_trigger(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, OrchestrateError> {
    state.orchestrator.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Debug, Deserialize)]
pub struct BulkStatusRequest {
    pub ids: Vec<String>,
    pub status: TriggerStatus,
}

pub async fn bulk_update_status(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkStatusRequest>,
) -> Response {
    let outcomes = state.orchestrator.bulk_update_status(&request.ids, request.status).await;
    Json(outcomes).into_response()
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    pub ids: Vec<String>,
}

pub async fn bulk_delete(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BulkDeleteRequest>,
) -> Response {
    let outcomes = state.orchestrator.bulk_delete(&request.ids).await;
    Json(outcomes).into_response()
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<EventStatus>,
    pub received_after: Option<chrono::DateTime<chrono::Utc>>,
    pub received_before: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub page: u32,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
}

pub async fn list_trigger_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Response, OrchestrateError> {
    // 404 for unknown triggers rather than an empty list
    state.orchestrator.get(&id)?;
    let events = state.db.list_events(
        &EventFilter {
            trigger_id: Some(id),
            status: query.status,
            received_after: query.received_after,
            received_before: query.received_before,
        },
        query.page,
        query.per_page,
    )?;
    Ok(Json(events).into_response())
}

/// Read-only trigger catalog for one app: available trigger types with
/// their config schemas.
pub async fn app_catalog(Path(app_name): Path<String>) -> Response {
    let Some(app) = App::parse(&app_name) else {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": format!("unknown app: {app_name}") })),
        )
            .into_response();
    };
    debug!(app = %app, "Serving trigger catalog");
    let entries: Vec<_> = catalog::catalog_for(app)
        .iter()
        .map(|t| {
            serde_json::json!({
                "name": t.name,
                "description": t.description,
                "config_schema": (t.config_schema)(),
            })
        })
        .collect();
    Json(serde_json::json!({ "app": app.as_str(), "trigger_types": entries })).into_response()
}
