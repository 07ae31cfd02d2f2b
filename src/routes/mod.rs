pub mod admin;
pub mod webhooks;

pub use webhooks::{handle_webhook, handle_webhook_challenge};

use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Json};

use crate::config::Config;
use crate::connector::ConnectorRegistry;
use crate::db::Database;
use crate::metrics::Metrics;
use crate::model::{EventStatus, TriggerStatus};
use crate::orchestrator::Orchestrator;
use crate::ratelimit::AdmissionController;

/// Application state shared across handlers
pub struct AppState {
    pub db: Arc<Database>,
    pub registry: Arc<ConnectorRegistry>,
    pub limiter: AdmissionController,
    pub metrics: Arc<Metrics>,
    pub orchestrator: Orchestrator,
    pub config: Arc<Config>,
}

/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let triggers = state.db.count_triggers().unwrap_or(0);
    let active = state.db.count_triggers_by_status(TriggerStatus::Active).unwrap_or(0);
    let pending_events = state.db.count_events_by_status(EventStatus::Pending).unwrap_or(0);
    Json(serde_json::json!({
        "status": "healthy",
        "triggers": triggers,
        "active_triggers": active,
        "pending_events": pending_events,
    }))
}

/// Prometheus exposition endpoint
pub async fn metrics_export(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}
