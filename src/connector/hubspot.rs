use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{Connector, ensure_fresh_timestamp, header_str, status_error};
use crate::accounts::LinkedAccount;
use crate::config::Config;
use crate::crypto::{constant_time_eq, hmac_sha256_base64};
use crate::error::{ConnectorError, VerifyError};
use crate::model::{App, ParsedEvent, Registration, Trigger};

const SIGNATURE_V3_HEADER: &str = "x-hubspot-signature-v3";
const TIMESTAMP_HEADER: &str = "x-hubspot-request-timestamp";
const SIGNATURE_V1_HEADER: &str = "x-hubspot-signature";
const SIGNATURE_VERSION_HEADER: &str = "x-hubspot-signature-version";

/// HubSpot app webhooks.
///
/// Subscriptions live at the developer-app level; deliveries batch several
/// events into one JSON array and sign the request with the v3 scheme
/// (HMAC over method + URI + body + millisecond timestamp, base64). The
/// legacy v1 scheme is accepted only when configuration opts in.
pub struct HubSpotConnector {
    app_secret: Option<String>,
    app_id: Option<String>,
    allow_v1: bool,
    skew_secs: i64,
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Subscription {
    id: Value,
    #[serde(rename = "eventType", default)]
    event_type: String,
}

impl HubSpotConnector {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self {
            app_secret: config.hubspot_app_secret.clone(),
            app_id: config.hubspot_app_id.clone(),
            allow_v1: config.hubspot_allow_v1_signature,
            skew_secs: config.replay_skew_secs,
            api_base: config.hubspot_api_base.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn app_id(&self) -> Result<&str, ConnectorError> {
        self.app_id.as_deref().ok_or_else(|| {
            ConnectorError::Permanent("HUBSPOT_APP_ID is not configured".to_string())
        })
    }

    fn verify_v3(
        &self,
        secret: &str,
        raw_body: &[u8],
        headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<(), VerifyError> {
        let timestamp_ms = header_str(headers, TIMESTAMP_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(VerifyError::InvalidSignature)?;
        ensure_fresh_timestamp(timestamp_ms / 1000, self.skew_secs)?;

        let signature =
            header_str(headers, SIGNATURE_V3_HEADER).ok_or(VerifyError::InvalidSignature)?;
        // Canonical string: requestMethod + requestUri + requestBody + timestamp
        let expected = hmac_sha256_base64(
            secret.as_bytes(),
            &[
                b"POST",
                trigger.webhook_url.as_bytes(),
                raw_body,
                timestamp_ms.to_string().as_bytes(),
            ],
        );
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(VerifyError::InvalidSignature);
        }
        Ok(())
    }

    /// Legacy v1: SHA-256 of app secret concatenated with the body, hex.
    fn verify_v1(&self, secret: &str, raw_body: &[u8], headers: &HeaderMap) -> Result<(), VerifyError> {
        let signature =
            header_str(headers, SIGNATURE_V1_HEADER).ok_or(VerifyError::InvalidSignature)?;
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hasher.update(raw_body);
        let expected = hex::encode(hasher.finalize());
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(VerifyError::InvalidSignature);
        }
        Ok(())
    }

    async fn list_subscriptions(&self, api_key: &str) -> Result<Vec<Subscription>, ConnectorError> {
        let app_id = self.app_id()?;
        let response = self
            .http
            .get(format!("{}/webhooks/v3/{app_id}/subscriptions", self.api_base))
            .query(&[("hapikey", api_key)])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("listing subscriptions", status, &body));
        }
        #[derive(Deserialize)]
        struct Results {
            #[serde(default)]
            results: Vec<Subscription>,
        }
        let results: Results = response.json().await?;
        Ok(results.results)
    }
}

#[async_trait]
impl Connector for HubSpotConnector {
    fn app(&self) -> App {
        App::HubSpot
    }

    async fn register(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<Registration, ConnectorError> {
        let api_key = account.credential("developer_api_key")?;

        // Webhook subscriptions are app-level: one subscription per event
        // type feeds every trigger of that type, so an existing one is
        // simply adopted.
        let existing = self.list_subscriptions(api_key).await?;
        if let Some(subscription) =
            existing.into_iter().find(|s| s.event_type == trigger.trigger_type)
        {
            debug!(trigger_id = %trigger.id, subscription_id = %subscription.id, "Reusing HubSpot subscription");
            return Ok(Registration {
                external_webhook_id: Some(subscription.id.to_string()),
                ..Default::default()
            });
        }

        let app_id = self.app_id()?;
        let response = self
            .http
            .post(format!("{}/webhooks/v3/{app_id}/subscriptions", self.api_base))
            .query(&[("hapikey", api_key)])
            .json(&json!({ "eventType": trigger.trigger_type, "active": true }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("creating subscription", status, &body));
        }
        let subscription: Subscription = response.json().await?;
        info!(trigger_id = %trigger.id, subscription_id = %subscription.id, event_type = %trigger.trigger_type, "Registered HubSpot subscription");
        Ok(Registration {
            external_webhook_id: Some(subscription.id.to_string()),
            ..Default::default()
        })
    }

    async fn unregister(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<(), ConnectorError> {
        let Some(subscription_id) = trigger.external_webhook_id.as_deref() else {
            return Ok(());
        };
        let api_key = account.credential("developer_api_key")?;
        let app_id = self.app_id()?;

        let response = self
            .http
            .delete(format!(
                "{}/webhooks/v3/{app_id}/subscriptions/{subscription_id}",
                self.api_base
            ))
            .query(&[("hapikey", api_key)])
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() == 404 || status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error("deleting subscription", status, &body))
    }

    fn verify(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<(), VerifyError> {
        let secret = self.app_secret.as_deref().ok_or(VerifyError::InvalidSignature)?;

        if headers.contains_key(SIGNATURE_V3_HEADER) {
            return self.verify_v3(secret, raw_body, headers, trigger);
        }
        // v1/v2 are rejected unless configuration explicitly opts in to v1.
        if self.allow_v1
            && header_str(headers, SIGNATURE_VERSION_HEADER).is_none_or(|v| v == "v1")
        {
            return self.verify_v1(secret, raw_body, headers);
        }
        Err(VerifyError::InvalidSignature)
    }

    fn parse(
        &self,
        raw_body: &[u8],
        _headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<Vec<ParsedEvent>, String> {
        let body: Value =
            serde_json::from_slice(raw_body).map_err(|e| format!("invalid JSON body: {e}"))?;
        // Deliveries are arrays of event objects sharing one HTTP request;
        // a bare object is tolerated and treated as a batch of one.
        let items: Vec<Value> = match body {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            other => return Err(format!("expected object or array, got {other}")),
        };

        let mut events = Vec::with_capacity(items.len());
        for item in items {
            let event_type = item
                .get("subscriptionType")
                .and_then(|v| v.as_str())
                .unwrap_or(trigger.trigger_type.as_str())
                .to_string();
            let external_event_id = item.get("eventId").map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
            events.push(ParsedEvent { event_type, event_data: item, external_event_id });
        }
        Ok(events)
    }
}
