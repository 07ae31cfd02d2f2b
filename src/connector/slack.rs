use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{Connector, ensure_fresh_timestamp, header_str};
use crate::accounts::LinkedAccount;
use crate::config::Config;
use crate::crypto::{constant_time_eq, hmac_sha256_hex};
use crate::error::{ConnectorError, VerifyError};
use crate::model::{App, ParsedEvent, Registration, Trigger};

const SIGNATURE_HEADER: &str = "x-slack-signature";
const TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// The outer envelope for all Slack Events API payloads: either a
/// URL-verification challenge or an event callback.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum EventsPayload {
    #[serde(rename = "url_verification")]
    UrlVerification { challenge: String },

    #[serde(rename = "event_callback")]
    EventCallback(EventCallback),
}

#[derive(Debug, Deserialize)]
struct EventCallback {
    /// Unique event ID for deduplication
    event_id: String,
    event: SlackEvent,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    event_type: String,
}

/// Slack Events API.
///
/// Events API subscriptions are configured at the app level in Slack's
/// dashboard, so `register` hands back setup instructions instead of
/// calling an API; inbound requests are authenticated with the app's
/// signing secret over `v0:{timestamp}:{body}` and replay-guarded by the
/// timestamp header.
pub struct SlackConnector {
    signing_secret: Option<String>,
    skew_secs: i64,
}

impl SlackConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            signing_secret: config.slack_signing_secret.clone(),
            skew_secs: config.replay_skew_secs,
        }
    }

    /// Signature check shared by `verify` and the challenge handler; the
    /// challenge arrives before any trigger exists but is still signed.
    fn verify_signature(&self, raw_body: &[u8], headers: &HeaderMap) -> Result<(), VerifyError> {
        let secret = self.signing_secret.as_deref().ok_or(VerifyError::InvalidSignature)?;
        let timestamp = header_str(headers, TIMESTAMP_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(VerifyError::InvalidSignature)?;
        ensure_fresh_timestamp(timestamp, self.skew_secs)?;

        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or(VerifyError::InvalidSignature)?;
        let expected = format!(
            "v0={}",
            hmac_sha256_hex(
                secret.as_bytes(),
                &[b"v0:", timestamp.to_string().as_bytes(), b":", raw_body],
            )
        );
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(VerifyError::InvalidSignature);
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for SlackConnector {
    fn app(&self) -> App {
        App::Slack
    }

    /// The Events API cannot be registered per trigger programmatically;
    /// the returned instructions point the operator at the app dashboard
    /// with this trigger's request URL.
    async fn register(
        &self,
        trigger: &Trigger,
        _account: &LinkedAccount,
    ) -> Result<Registration, ConnectorError> {
        info!(trigger_id = %trigger.id, "Slack trigger registered; Events API needs app-level setup");
        Ok(Registration {
            external_webhook_id: None,
            expires_at: None,
            setup_instructions: Some(format!(
                "Open your Slack app's Event Subscriptions page, enable events, set the \
                 Request URL to {} and subscribe to the `{}` bot event. Slack will send a \
                 url_verification challenge which this endpoint answers automatically.",
                trigger.webhook_url, trigger.trigger_type
            )),
        })
    }

    async fn unregister(
        &self,
        _trigger: &Trigger,
        _account: &LinkedAccount,
    ) -> Result<(), ConnectorError> {
        // Nothing registered remotely; the app-level subscription outlives
        // any one trigger.
        Ok(())
    }

    fn verify(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        _trigger: &Trigger,
    ) -> Result<(), VerifyError> {
        self.verify_signature(raw_body, headers)
    }

    fn parse(
        &self,
        raw_body: &[u8],
        _headers: &HeaderMap,
        _trigger: &Trigger,
    ) -> Result<Vec<ParsedEvent>, String> {
        let event_data: Value =
            serde_json::from_slice(raw_body).map_err(|e| format!("invalid JSON body: {e}"))?;
        let payload: EventsPayload = serde_json::from_value(event_data.clone())
            .map_err(|e| format!("unrecognized Slack payload: {e}"))?;
        match payload {
            EventsPayload::UrlVerification { .. } => {
                Err("url_verification carries no event".to_string())
            }
            EventsPayload::EventCallback(callback) => Ok(vec![ParsedEvent {
                event_type: callback.event.event_type,
                event_data,
                external_event_id: Some(callback.event_id),
            }]),
        }
    }

    fn handle_challenge(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
    ) -> Result<Option<Value>, VerifyError> {
        let Ok(EventsPayload::UrlVerification { challenge }) =
            serde_json::from_slice::<EventsPayload>(raw_body)
        else {
            return Ok(None);
        };
        // Slack signs challenge requests like any other; echoing without
        // checking would let anyone confirm arbitrary URLs through us.
        self.verify_signature(raw_body, headers)?;
        info!("Answering Slack url_verification challenge");
        Ok(Some(json!({ "challenge": challenge })))
    }
}
