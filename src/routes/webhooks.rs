use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};
use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::AppState;
use crate::error::IngestError;
use crate::model::{App, Trigger, TriggerStatus};

enum Ingested {
    /// Provider URL-verification probe; echo the connector's response body.
    Challenge(Value),
    /// Delivery persisted: how many events were new vs. already known.
    Stored { app: App, inserted: usize, duplicates: usize },
}

/// `POST /webhooks/{app}/{trigger_id}` — the ingestion hot path.
///
/// Admission, trigger lookup, signature verification, parsing and the
/// deduplicating insert all happen here; everything downstream of the
/// event row (dispatch, normalisation) is asynchronous. No outbound
/// provider I/O ever happens in this handler.
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Path((app_name, trigger_id)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let ip = client_ip(&headers, &addr);

    match ingest(&state, &app_name, &trigger_id, &ip, &headers, &body).await {
        Ok(Ingested::Challenge(response)) => Json(response).into_response(),
        Ok(Ingested::Stored { app, inserted, duplicates }) => {
            if inserted > 0 {
                state
                    .metrics
                    .processing_duration
                    .with_label_values(&[app.as_str()])
                    .observe(started.elapsed().as_secs_f64());
            }
            debug!(
                trigger_id = %trigger_id,
                inserted = inserted,
                duplicates = duplicates,
                "Webhook delivery processed"
            );
            if inserted == 0 {
                Json(serde_json::json!({ "status": "duplicate" })).into_response()
            } else {
                Json(serde_json::json!({ "status": "ok" })).into_response()
            }
        }
        Err(error) => {
            record_failure(&state, &app_name, &error);
            error.into_response()
        }
    }
}

/// `GET /webhooks/{app}/{trigger_id}` — URL-verification responder for
/// providers that probe with a GET challenge parameter.
pub async fn handle_webhook_challenge(
    State(state): State<Arc<AppState>>,
    Path((_app_name, trigger_id)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let ip = client_ip(&headers, &addr);
    if let Err(exceeded) = state.limiter.admit(&ip, &trigger_id) {
        state.metrics.rate_limit_hit.with_label_values(&[exceeded.scope]).inc();
        return IngestError::RateLimited {
            scope: exceeded.scope,
            retry_after_secs: exceeded.retry_after_secs,
        }
        .into_response();
    }

    // Echo whichever challenge parameter the provider sent.
    for key in ["challenge", "hub.challenge", "validationToken"] {
        if let Some(value) = params.get(key) {
            info!(trigger_id = %trigger_id, param = key, "Answering GET challenge probe");
            return value.clone().into_response();
        }
    }
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn ingest(
    state: &AppState,
    app_name: &str,
    trigger_id: &str,
    ip: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Ingested, IngestError> {
    // 1. Admission: one token from the IP bucket and one from the trigger
    //    bucket, or the request is turned away before any work happens.
    if let Err(exceeded) = state.limiter.admit(ip, trigger_id) {
        return Err(IngestError::RateLimited {
            scope: exceeded.scope,
            retry_after_secs: exceeded.retry_after_secs,
        });
    }

    let app = App::parse(app_name).ok_or(IngestError::UnknownTrigger)?;
    let connector = state.registry.get(app);

    // 2. Challenge probes are answered before trigger lookup: providers
    //    send them before activation is confirmed. Signatures are still
    //    checked where the provider signs them.
    if let Some(response) = connector.handle_challenge(body, headers)? {
        return Ok(Ingested::Challenge(response));
    }

    // 3. Lookup
    let trigger = state.db.get_trigger(trigger_id)?.ok_or(IngestError::UnknownTrigger)?;
    if trigger.app != app {
        return Err(IngestError::AppMismatch);
    }
    if trigger.status != TriggerStatus::Active {
        return Err(IngestError::TriggerNotActive(trigger.status.reason().to_string()));
    }

    // 4. Verify against the raw bytes, exactly as received.
    connector.verify(body, headers, &trigger)?;

    // 5. Parse
    let events = connector.parse(body, headers, &trigger).map_err(IngestError::MalformedPayload)?;

    // 6. Persist with insert-or-ignore dedup; a batch may mix new and
    //    already-seen events.
    let retention = Duration::days(state.config.event_retention_days);
    let mut inserted = 0usize;
    let mut duplicates = 0usize;
    for event in &events {
        let (_, was_inserted) = state.db.create_trigger_event(
            &trigger.id,
            &event.event_type,
            &event.event_data,
            event.external_event_id.as_deref(),
            retention,
        )?;
        // Every event lands in exactly one of these two counters.
        if was_inserted {
            inserted += 1;
            state.metrics.webhook_received.with_label_values(&[app.as_str()]).inc();
        } else {
            duplicates += 1;
            state.metrics.dedup.with_label_values(&[app.as_str()]).inc();
        }
    }

    // 7. Post-conditions, best-effort: a bookkeeping failure must not fail
    //    a delivery that is already persisted.
    if inserted > 0 {
        touch_last_triggered(state, &trigger);
    }

    Ok(Ingested::Stored { app, inserted, duplicates })
}

fn touch_last_triggered(state: &AppState, trigger: &Trigger) {
    if let Err(e) = state.db.set_last_triggered(&trigger.id, Utc::now()) {
        warn!(trigger_id = %trigger.id, error = %e, "Failed to update last_triggered_at");
    }
}

fn record_failure(state: &AppState, app_name: &str, error: &IngestError) {
    match error {
        IngestError::InvalidSignature | IngestError::StaleTimestamp => {
            let app = App::parse(app_name).map(|a| a.as_str()).unwrap_or("unknown");
            state.metrics.verification_failed.with_label_values(&[app]).inc();
        }
        IngestError::RateLimited { scope, .. } => {
            state.metrics.rate_limit_hit.with_label_values(&[*scope]).inc();
        }
        _ => {}
    }
}

/// Source address for rate limiting: the first X-Forwarded-For hop when a
/// proxy fronts us, the socket peer otherwise.
fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| addr.ip().to_string())
}
