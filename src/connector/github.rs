use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Connector, header_str, status_error};
use crate::accounts::LinkedAccount;
use crate::config::Config;
use crate::crypto::{constant_time_eq, hmac_sha256_hex};
use crate::error::{ConnectorError, VerifyError};
use crate::model::{App, ParsedEvent, Registration, Trigger};

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const EVENT_HEADER: &str = "x-github-event";
const DELIVERY_HEADER: &str = "x-github-delivery";

/// GitHub repository webhooks.
///
/// Each trigger gets its own repo hook, created with the trigger's
/// verification token as the hook secret; GitHub signs every delivery with
/// `sha256=` + hex HMAC of the raw body.
pub struct GitHubConnector {
    api_base: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct Hook {
    id: i64,
    #[serde(default)]
    config: HookConfig,
}

#[derive(Debug, Default, Deserialize)]
struct HookConfig {
    #[serde(default)]
    url: String,
}

impl GitHubConnector {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self { api_base: config.github_api_base.trim_end_matches('/').to_string(), http }
    }

    fn repo_binding<'t>(trigger: &'t Trigger) -> Result<(&'t str, &'t str), ConnectorError> {
        let owner = trigger.config_str("owner");
        let repository = trigger.config_str("repository");
        match (owner, repository) {
            (Some(o), Some(r)) if !o.is_empty() && !r.is_empty() => Ok((o, r)),
            _ => Err(ConnectorError::Permanent(
                "trigger config must bind `owner` and `repository`".to_string(),
            )),
        }
    }

    async fn list_hooks(
        &self,
        owner: &str,
        repo: &str,
        token: &str,
    ) -> Result<Vec<Hook>, ConnectorError> {
        let response = self
            .http
            .get(format!("{}/repos/{owner}/{repo}/hooks", self.api_base))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("listing hooks", status, &body));
        }
        Ok(response.json().await?)
    }

    /// Find an existing hook pointing at this trigger's callback URL.
    async fn find_existing(
        &self,
        owner: &str,
        repo: &str,
        token: &str,
        callback_url: &str,
    ) -> Result<Option<i64>, ConnectorError> {
        let hooks = self.list_hooks(owner, repo, token).await?;
        Ok(hooks.into_iter().find(|h| h.config.url == callback_url).map(|h| h.id))
    }
}

#[async_trait]
impl Connector for GitHubConnector {
    fn app(&self) -> App {
        App::GitHub
    }

    async fn register(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<Registration, ConnectorError> {
        let (owner, repo) = Self::repo_binding(trigger)?;
        let token = account.credential("access_token")?;

        // Registering twice must not create a second hook: the repo's hook
        // list is checked for our callback URL first.
        if let Some(id) = self.find_existing(owner, repo, token, &trigger.webhook_url).await? {
            debug!(trigger_id = %trigger.id, hook_id = id, "Reusing existing GitHub hook");
            return Ok(Registration {
                external_webhook_id: Some(id.to_string()),
                ..Default::default()
            });
        }

        let response = self
            .http
            .post(format!("{}/repos/{owner}/{repo}/hooks", self.api_base))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .json(&json!({
                "name": "web",
                "active": true,
                "events": [trigger.trigger_type],
                "config": {
                    "url": trigger.webhook_url,
                    "content_type": "json",
                    "secret": trigger.verification_token,
                },
            }))
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 422 {
            // "Hook already exists on this repository" — treat as success
            // and recover the id from the list API.
            if let Some(id) = self.find_existing(owner, repo, token, &trigger.webhook_url).await? {
                return Ok(Registration {
                    external_webhook_id: Some(id.to_string()),
                    ..Default::default()
                });
            }
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("creating hook", status, &body));
        }

        let hook: Hook = response.json().await?;
        info!(trigger_id = %trigger.id, hook_id = hook.id, owner = %owner, repo = %repo, "Registered GitHub hook");
        Ok(Registration { external_webhook_id: Some(hook.id.to_string()), ..Default::default() })
    }

    async fn unregister(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<(), ConnectorError> {
        let Some(hook_id) = trigger.external_webhook_id.as_deref() else {
            // Never registered remotely; nothing to remove.
            return Ok(());
        };
        let (owner, repo) = Self::repo_binding(trigger)?;
        let token = account.credential("access_token")?;

        let response = self
            .http
            .delete(format!("{}/repos/{owner}/{repo}/hooks/{hook_id}", self.api_base))
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 404 {
            warn!(trigger_id = %trigger.id, hook_id = %hook_id, "GitHub hook already gone");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("deleting hook", status, &body));
        }
        Ok(())
    }

    fn verify(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<(), VerifyError> {
        let signature =
            header_str(headers, SIGNATURE_HEADER).ok_or(VerifyError::InvalidSignature)?;
        let expected = format!(
            "sha256={}",
            hmac_sha256_hex(trigger.verification_token.as_bytes(), &[raw_body])
        );
        if !constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
            return Err(VerifyError::InvalidSignature);
        }
        Ok(())
    }

    fn parse(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        trigger: &Trigger,
    ) -> Result<Vec<ParsedEvent>, String> {
        let event_data: Value =
            serde_json::from_slice(raw_body).map_err(|e| format!("invalid JSON body: {e}"))?;
        let event_type = header_str(headers, EVENT_HEADER)
            .unwrap_or(trigger.trigger_type.as_str())
            .to_string();
        let external_event_id = header_str(headers, DELIVERY_HEADER).map(str::to_string);
        Ok(vec![ParsedEvent { event_type, event_data, external_event_id }])
    }
}
