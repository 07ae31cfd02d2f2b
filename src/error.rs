use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use thiserror::Error;

/// Signature verification failures, produced by connectors on the hot path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerifyError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("provider timestamp outside the replay window")]
    StaleTimestamp,
}

/// Failures of outbound provider calls (register / unregister / renew).
///
/// Transient errors are retried by the orchestrator and scheduler within
/// bounded attempts; permanent errors are surfaced to the caller and leave
/// the trigger in ERROR with a reason.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// Returned by `renew` for providers whose subscriptions never expire.
    /// Callers treat this as a no-op.
    #[error("operation not supported by this provider")]
    NotSupported,
}

impl From<reqwest::Error> for ConnectorError {
    fn from(e: reqwest::Error) -> Self {
        // Transport-level failures (DNS, connect, timeout) are worth retrying.
        ConnectorError::Transient(e.to_string())
    }
}

/// Everything that can go wrong while ingesting one webhook delivery.
///
/// Each variant maps onto exactly one HTTP status; the ingestion handler
/// increments the matching counters before converting to a response.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("provider timestamp outside the replay window")]
    StaleTimestamp,

    #[error("unknown trigger")]
    UnknownTrigger,

    /// The trigger exists but is not accepting deliveries; the reason string
    /// ("paused", "expired", ...) is echoed in the response body.
    #[error("trigger is {0}")]
    TriggerNotActive(String),

    /// Path `app` does not match the trigger's app.
    #[error("app does not match trigger")]
    AppMismatch,

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("rate limited ({scope})")]
    RateLimited { scope: &'static str, retry_after_secs: u64 },

    #[error("storage error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl From<VerifyError> for IngestError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::InvalidSignature => IngestError::InvalidSignature,
            VerifyError::StaleTimestamp => IngestError::StaleTimestamp,
        }
    }
}

impl IngestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::InvalidSignature | IngestError::StaleTimestamp => StatusCode::UNAUTHORIZED,
            IngestError::UnknownTrigger => StatusCode::NOT_FOUND,
            IngestError::TriggerNotActive(_) => StatusCode::GONE,
            IngestError::AppMismatch | IngestError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
            IngestError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            IngestError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Persistence details stay in the logs; the provider only needs to
        // know it should retry.
        let message = match &self {
            IngestError::Persistence(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        let mut response = (status, Json(serde_json::json!({ "error": message }))).into_response();
        if let IngestError::RateLimited { retry_after_secs, .. } = &self
            && let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
        response
    }
}

/// Errors surfaced by the registration orchestrator to the admin layer.
#[derive(Debug, Error)]
pub enum OrchestrateError {
    /// The (project, app, linked account, trigger_name) tuple already exists.
    #[error("a trigger with this name already exists for this account")]
    Conflict,

    #[error("trigger not found")]
    NotFound,

    #[error("unknown app: {0}")]
    UnknownApp(String),

    #[error("linked account not found: {0}")]
    UnknownAccount(String),

    #[error("invalid trigger configuration: {0}")]
    InvalidConfig(String),

    #[error("status transition {from} -> {to} is not allowed here")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Provider(#[from] ConnectorError),

    #[error("storage error: {0}")]
    Persistence(#[from] rusqlite::Error),
}

impl OrchestrateError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestrateError::Conflict => StatusCode::CONFLICT,
            OrchestrateError::NotFound => StatusCode::NOT_FOUND,
            OrchestrateError::UnknownApp(_)
            | OrchestrateError::UnknownAccount(_)
            | OrchestrateError::InvalidConfig(_)
            | OrchestrateError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            OrchestrateError::Provider(ConnectorError::Transient(_)) => StatusCode::BAD_GATEWAY,
            OrchestrateError::Provider(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestrateError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for OrchestrateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            OrchestrateError::Persistence(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_error_status_codes() {
        assert_eq!(IngestError::InvalidSignature.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(IngestError::StaleTimestamp.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(IngestError::UnknownTrigger.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            IngestError::TriggerNotActive("paused".to_string()).status_code(),
            StatusCode::GONE
        );
        assert_eq!(
            IngestError::MalformedPayload("bad json".to_string()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            IngestError::RateLimited { scope: "ip", retry_after_secs: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_rate_limited_response_carries_retry_after() {
        let response =
            IngestError::RateLimited { scope: "trigger", retry_after_secs: 3 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).and_then(|v| v.to_str().ok()),
            Some("3")
        );
    }

    #[test]
    fn test_verify_error_converts_to_ingest_error() {
        assert!(matches!(
            IngestError::from(VerifyError::InvalidSignature),
            IngestError::InvalidSignature
        ));
        assert!(matches!(
            IngestError::from(VerifyError::StaleTimestamp),
            IngestError::StaleTimestamp
        ));
    }
}
