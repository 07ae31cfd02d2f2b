use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Connector, header_str, status_error};
use crate::accounts::LinkedAccount;
use crate::config::Config;
use crate::error::{ConnectorError, VerifyError};
use crate::model::{App, ParsedEvent, Registration, Trigger};

const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];

/// Google's OIDC signing keys, cached so that token verification on the
/// ingestion hot path never fetches anything. The scheduler refreshes the
/// cache periodically; keys rotate on the order of days.
pub struct GoogleKeySet {
    keys: RwLock<HashMap<String, (Algorithm, DecodingKey)>>,
}

impl GoogleKeySet {
    pub fn empty() -> Self {
        Self { keys: RwLock::new(HashMap::new()) }
    }

    /// Seed a key directly; verification tests use this instead of a JWKS
    /// fetch.
    #[cfg(test)]
    pub fn insert(&self, kid: &str, algorithm: Algorithm, key: DecodingKey) {
        self.keys.write().insert(kid.to_string(), (algorithm, key));
    }

    fn get(&self, kid: &str) -> Option<(Algorithm, DecodingKey)> {
        self.keys.read().get(kid).cloned()
    }

    /// Replace the cache with the JWKS document at `url`.
    pub async fn refresh(
        &self,
        http: &reqwest::Client,
        url: &str,
    ) -> Result<usize, ConnectorError> {
        let response = http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("fetching JWKS", status, &body));
        }
        let jwks: JwkSet = response.json().await?;

        let mut fresh = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else { continue };
            let algorithm = jwk
                .common
                .key_algorithm
                .and_then(|a| Algorithm::from_str(&a.to_string()).ok())
                .unwrap_or(Algorithm::RS256);
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    fresh.insert(kid, (algorithm, key));
                }
                Err(e) => warn!(kid = %kid, error = %e, "Skipping unusable JWK"),
            }
        }
        let count = fresh.len();
        *self.keys.write() = fresh;
        info!(count = count, "Refreshed Google OIDC key cache");
        Ok(count)
    }
}

/// Claims we read off the Pub/Sub push token; audience, issuer and expiry
/// are checked by the validator itself.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct PushClaims {
    #[serde(default)]
    email: Option<String>,
}

/// Gmail via Cloud Pub/Sub push.
///
/// `users.watch` subscriptions last about a week and must be renewed; the
/// push envelope is authenticated with a Google-signed OIDC token whose
/// audience is the trigger's push URL.
pub struct GmailConnector {
    api_base: String,
    http: reqwest::Client,
    keys: Arc<GoogleKeySet>,
}

#[derive(Debug, Deserialize)]
struct WatchResponse {
    #[serde(rename = "historyId")]
    history_id: Option<Value>,
    /// Millisecond epoch, serialized as a string by the Gmail API.
    expiration: Option<Value>,
}

impl GmailConnector {
    pub fn new(config: &Config, http: reqwest::Client, keys: Arc<GoogleKeySet>) -> Self {
        Self { api_base: config.gmail_api_base.trim_end_matches('/').to_string(), http, keys }
    }

    fn topic_name<'t>(trigger: &'t Trigger) -> Result<&'t str, ConnectorError> {
        trigger.config_str("topic_name").filter(|t| !t.is_empty()).ok_or_else(|| {
            ConnectorError::Permanent("trigger config must set `topic_name`".to_string())
        })
    }

    async fn watch(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<DateTime<Utc>, ConnectorError> {
        let token = account.credential("access_token")?;
        let topic = Self::topic_name(trigger)?;

        let mut body = json!({ "topicName": topic, "labelFilterBehavior": "INCLUDE" });
        if let Some(labels) = trigger.config.get("label_ids").and_then(|v| v.as_array()) {
            body["labelIds"] = Value::Array(labels.clone());
        }

        let response = self
            .http
            .post(format!("{}/gmail/v1/users/me/watch", self.api_base))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error("users.watch", status, &text));
        }
        let watch: WatchResponse = response.json().await?;
        debug!(trigger_id = %trigger.id, history_id = ?watch.history_id, "Gmail watch established");

        let expiration_ms = watch
            .expiration
            .as_ref()
            .and_then(|v| match v {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            })
            .ok_or_else(|| {
                ConnectorError::Transient("watch response missing expiration".to_string())
            })?;
        Utc.timestamp_millis_opt(expiration_ms).single().ok_or_else(|| {
            ConnectorError::Transient(format!("watch expiration out of range: {expiration_ms}"))
        })
    }
}

#[async_trait]
impl Connector for GmailConnector {
    fn app(&self) -> App {
        App::Gmail
    }

    async fn register(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<Registration, ConnectorError> {
        // watch() is idempotent on the provider side: re-watching the same
        // topic replaces the previous watch rather than stacking a second.
        let expires_at = self.watch(trigger, account).await?;
        Ok(Registration {
            external_webhook_id: Some(Self::topic_name(trigger)?.to_string()),
            expires_at: Some(expires_at),
            setup_instructions: None,
        })
    }

    async fn unregister(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<(), ConnectorError> {
        let token = account.credential("access_token")?;
        let response = self
            .http
            .post(format!("{}/gmail/v1/users/me/stop", self.api_base))
            .bearer_auth(token)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() || status.as_u16() == 404 {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        warn!(trigger_id = %trigger.id, status = %status, "Gmail users.stop failed");
        Err(status_error("users.stop", status, &body))
    }

    async fn renew(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<DateTime<Utc>, ConnectorError> {
        self.watch(trigger, account).await
    }

    fn verify(
        &self,
        _raw_body: &[u8],
        headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<(), VerifyError> {
        let bearer = header_str(headers, "authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(VerifyError::InvalidSignature)?;

        let header = decode_header(bearer).map_err(|_| VerifyError::InvalidSignature)?;
        let kid = header.kid.ok_or(VerifyError::InvalidSignature)?;
        let (algorithm, key) = self.keys.get(&kid).ok_or(VerifyError::InvalidSignature)?;

        let mut validation = Validation::new(algorithm);
        validation.set_audience(&[trigger.webhook_url.as_str()]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);

        match decode::<PushClaims>(bearer, &key, &validation) {
            Ok(_) => Ok(()),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature
                | jsonwebtoken::errors::ErrorKind::ImmatureSignature => {
                    Err(VerifyError::StaleTimestamp)
                }
                _ => Err(VerifyError::InvalidSignature),
            },
        }
    }

    fn parse(
        &self,
        raw_body: &[u8],
        _headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<Vec<ParsedEvent>, String> {
        let envelope: Value =
            serde_json::from_slice(raw_body).map_err(|e| format!("invalid JSON body: {e}"))?;
        let message = envelope.get("message").ok_or("envelope missing `message`")?;
        let message_id = message
            .get("messageId")
            .and_then(|v| v.as_str())
            .ok_or("message missing `messageId`")?
            .to_string();
        let data = message
            .get("data")
            .and_then(|v| v.as_str())
            .ok_or("message missing `data`")?;

        // Pub/Sub encodes the payload in base64; tolerate both alphabets.
        let decoded = STANDARD
            .decode(data)
            .or_else(|_| URL_SAFE_NO_PAD.decode(data))
            .map_err(|e| format!("message data is not base64: {e}"))?;
        let notification: Value = serde_json::from_slice(&decoded)
            .map_err(|e| format!("message data is not JSON: {e}"))?;

        let event_data = json!({
            "notification": notification,
            "message_id": message_id,
            "publish_time": message.get("publishTime").cloned().unwrap_or(Value::Null),
            "subscription": envelope.get("subscription").cloned().unwrap_or(Value::Null),
        });
        Ok(vec![ParsedEvent {
            event_type: trigger.trigger_type.clone(),
            event_data,
            external_event_id: Some(message_id),
        }])
    }
}
