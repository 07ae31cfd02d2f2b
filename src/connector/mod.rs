pub mod github;
pub mod gmail;
pub mod hubspot;
pub mod shopify;
pub mod slack;

pub use github::GitHubConnector;
pub use gmail::{GmailConnector, GoogleKeySet};
pub use hubspot::HubSpotConnector;
pub use shopify::ShopifyConnector;
pub use slack::SlackConnector;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::accounts::LinkedAccount;
use crate::config::Config;
use crate::error::{ConnectorError, VerifyError};
use crate::model::{App, ParsedEvent, Registration, Trigger};

/// Provider capability set: everything the platform needs from one SaaS
/// provider, keyed by app.
///
/// `verify` and `parse` are pure over the request (plus trigger and
/// app-level secrets) and run on the ingestion hot path; they never perform
/// I/O. `register`/`unregister`/`renew` call the provider under the linked
/// account's credentials, which are read at call time so a refreshed token
/// is picked up without rebuilding the connector.
#[async_trait]
pub trait Connector: Send + Sync {
    fn app(&self) -> App;

    /// Create the remote subscription. Idempotent per linked account:
    /// registering the same event with the same callback URL twice must not
    /// create a duplicate remote hook.
    async fn register(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<Registration, ConnectorError>;

    /// Remove the remote subscription; a provider-side "not found" counts
    /// as success.
    async fn unregister(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<(), ConnectorError>;

    /// Authenticate one delivery against the raw body bytes. Comparisons
    /// are constant-time and provider timestamps outside the replay window
    /// are rejected even when the signature itself is valid.
    fn verify(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<(), VerifyError>;

    /// Extract the events carried by a verified delivery. HubSpot batches
    /// several events per request; everyone else returns a single element.
    fn parse(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<Vec<ParsedEvent>, String>;

    /// Extend an expiring subscription, returning the new expiry. Providers
    /// with unbounded subscriptions return `NotSupported`, which callers
    /// treat as a no-op.
    async fn renew(
        &self,
        _trigger: &Trigger,
        _account: &LinkedAccount,
    ) -> Result<DateTime<Utc>, ConnectorError> {
        Err(ConnectorError::NotSupported)
    }

    /// Recognize a provider URL-verification probe and produce its
    /// response body. Runs before trigger lookup (providers probe before
    /// activation is confirmed) but still verifies the signature where the
    /// provider sends one.
    fn handle_challenge(
        &self,
        _raw_body: &[u8],
        _headers: &HeaderMap,
    ) -> Result<Option<Value>, VerifyError> {
        Ok(None)
    }
}

/// Static app -> connector mapping, built once at start-up.
pub struct ConnectorRegistry {
    connectors: HashMap<App, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn new(config: &Config, http: reqwest::Client, google_keys: Arc<GoogleKeySet>) -> Self {
        let mut connectors: HashMap<App, Arc<dyn Connector>> = HashMap::new();
        connectors.insert(App::HubSpot, Arc::new(HubSpotConnector::new(config, http.clone())));
        connectors.insert(App::Shopify, Arc::new(ShopifyConnector::new(config, http.clone())));
        connectors.insert(App::Slack, Arc::new(SlackConnector::new(config)));
        connectors.insert(App::GitHub, Arc::new(GitHubConnector::new(config, http.clone())));
        connectors.insert(App::Gmail, Arc::new(GmailConnector::new(config, http, google_keys)));
        Self { connectors }
    }

    pub fn get(&self, app: App) -> Arc<dyn Connector> {
        Arc::clone(&self.connectors[&app])
    }
}

// ── Shared helpers ──────────────────────────────────────────────────────

/// Read a header as UTF-8, treating absence and garbage alike.
pub(crate) fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Reject provider timestamps further than `skew_secs` from server time.
pub(crate) fn ensure_fresh_timestamp(ts_secs: i64, skew_secs: i64) -> Result<(), VerifyError> {
    if (Utc::now().timestamp() - ts_secs).abs() > skew_secs {
        return Err(VerifyError::StaleTimestamp);
    }
    Ok(())
}

/// Run one outbound provider call under the configured per-call timeout.
/// A timeout is transient: the remote state is unknown and a later retry
/// may succeed.
pub(crate) async fn with_timeout<T>(
    timeout: std::time::Duration,
    fut: impl Future<Output = Result<T, ConnectorError>> + Send,
) -> Result<T, ConnectorError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectorError::Transient(format!(
            "provider call timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Map a non-2xx provider response onto the retryability taxonomy: 429 and
/// server errors are worth retrying, other client errors are not.
pub(crate) fn status_error(context: &str, status: reqwest::StatusCode, body: &str) -> ConnectorError {
    let detail = format!("{context}: HTTP {status}: {}", body.chars().take(200).collect::<String>());
    if status.as_u16() == 429 || status.is_server_error() {
        ConnectorError::Transient(detail)
    } else {
        ConnectorError::Permanent(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;

    #[test]
    fn test_registry_serves_every_app() {
        let config = test_config();
        let registry = ConnectorRegistry::new(
            &config,
            reqwest::Client::new(),
            Arc::new(GoogleKeySet::empty()),
        );
        for app in App::ALL {
            assert_eq!(registry.get(app).app(), app);
        }
    }

    #[test]
    fn test_timestamp_skew_window() {
        let now = Utc::now().timestamp();
        assert!(ensure_fresh_timestamp(now, 300).is_ok());
        assert!(ensure_fresh_timestamp(now - 299, 300).is_ok());
        assert_eq!(
            ensure_fresh_timestamp(now - 600, 300),
            Err(VerifyError::StaleTimestamp)
        );
        // Timestamps from the future are just as suspect.
        assert_eq!(
            ensure_fresh_timestamp(now + 600, 300),
            Err(VerifyError::StaleTimestamp)
        );
    }

    #[test]
    fn test_status_error_classification() {
        let transient = status_error("x", reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(matches!(transient, ConnectorError::Transient(_)));
        let transient = status_error("x", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(transient, ConnectorError::Transient(_)));
        let permanent = status_error("x", reqwest::StatusCode::FORBIDDEN, "");
        assert!(matches!(permanent, ConnectorError::Permanent(_)));
    }
}
