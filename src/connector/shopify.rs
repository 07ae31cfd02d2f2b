use async_trait::async_trait;
use axum::http::HeaderMap;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Connector, header_str, status_error};
use crate::accounts::LinkedAccount;
use crate::config::Config;
use crate::crypto::{constant_time_eq, hmac_sha256_base64};
use crate::error::{ConnectorError, VerifyError};
use crate::model::{App, ParsedEvent, Registration, Trigger};

const HMAC_HEADER: &str = "x-shopify-hmac-sha256";
const TOPIC_HEADER: &str = "x-shopify-topic";
const WEBHOOK_ID_HEADER: &str = "x-shopify-webhook-id";

const API_VERSION: &str = "2024-07";

/// Shopify webhook subscriptions over the GraphQL Admin API.
///
/// Shopify signs the raw body with the app's API secret (base64 HMAC); the
/// delivery id arrives in `X-Shopify-Webhook-Id` and serves as the dedup
/// key.
pub struct ShopifyConnector {
    api_secret: Option<String>,
    http: reqwest::Client,
}

impl ShopifyConnector {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        Self { api_secret: config.shopify_api_secret.clone(), http }
    }

    fn graphql_endpoint(shop_domain: &str) -> String {
        if shop_domain.starts_with("http://") || shop_domain.starts_with("https://") {
            format!("{}/admin/api/{API_VERSION}/graphql.json", shop_domain.trim_end_matches('/'))
        } else {
            format!("https://{shop_domain}/admin/api/{API_VERSION}/graphql.json")
        }
    }

    async fn graphql(
        &self,
        account: &LinkedAccount,
        query: &str,
        variables: Value,
    ) -> Result<Value, ConnectorError> {
        let shop_domain = account.credential("shop_domain")?;
        let access_token = account.credential("access_token")?;

        let response = self
            .http
            .post(Self::graphql_endpoint(shop_domain))
            .header("X-Shopify-Access-Token", access_token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error("Shopify GraphQL", status, &body));
        }
        let body: Value = response.json().await?;
        if let Some(errors) = body.get("errors").filter(|e| !e.is_null()) {
            return Err(ConnectorError::Transient(format!("Shopify GraphQL errors: {errors}")));
        }
        Ok(body)
    }

    /// Look for an existing subscription on this topic pointing at our
    /// callback URL.
    async fn find_existing(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<Option<String>, ConnectorError> {
        let body = self
            .graphql(
                account,
                "query($topics: [WebhookSubscriptionTopic!]) { \
                   webhookSubscriptions(first: 50, topics: $topics) { \
                     edges { node { id endpoint { __typename \
                       ... on WebhookHttpEndpoint { callbackUrl } } } } } }",
                json!({ "topics": [trigger.trigger_type] }),
            )
            .await?;

        let edges = body
            .pointer("/data/webhookSubscriptions/edges")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for edge in edges {
            let callback = edge.pointer("/node/endpoint/callbackUrl").and_then(|v| v.as_str());
            if callback == Some(trigger.webhook_url.as_str())
                && let Some(id) = edge.pointer("/node/id").and_then(|v| v.as_str())
            {
                return Ok(Some(id.to_string()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Connector for ShopifyConnector {
    fn app(&self) -> App {
        App::Shopify
    }

    async fn register(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<Registration, ConnectorError> {
        if let Some(id) = self.find_existing(trigger, account).await? {
            debug!(trigger_id = %trigger.id, subscription_id = %id, "Reusing existing Shopify subscription");
            return Ok(Registration { external_webhook_id: Some(id), ..Default::default() });
        }

        let body = self
            .graphql(
                account,
                "mutation($topic: WebhookSubscriptionTopic!, $webhookSubscription: WebhookSubscriptionInput!) { \
                   webhookSubscriptionCreate(topic: $topic, webhookSubscription: $webhookSubscription) { \
                     webhookSubscription { id } \
                     userErrors { field message } } }",
                json!({
                    "topic": trigger.trigger_type,
                    "webhookSubscription": { "callbackUrl": trigger.webhook_url, "format": "JSON" },
                }),
            )
            .await?;

        let user_errors = body
            .pointer("/data/webhookSubscriptionCreate/userErrors")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if !user_errors.is_empty() {
            let messages: Vec<&str> =
                user_errors.iter().filter_map(|e| e["message"].as_str()).collect();
            // "Address for this topic has already been taken" means another
            // call of ours won the race; recover the existing id.
            if messages.iter().any(|m| m.contains("already been taken")) {
                if let Some(id) = self.find_existing(trigger, account).await? {
                    return Ok(Registration { external_webhook_id: Some(id), ..Default::default() });
                }
            }
            return Err(ConnectorError::Permanent(format!(
                "Shopify rejected subscription: {}",
                messages.join("; ")
            )));
        }

        let id = body
            .pointer("/data/webhookSubscriptionCreate/webhookSubscription/id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ConnectorError::Transient("Shopify response missing subscription id".to_string())
            })?;
        info!(trigger_id = %trigger.id, subscription_id = %id, topic = %trigger.trigger_type, "Registered Shopify subscription");
        Ok(Registration { external_webhook_id: Some(id.to_string()), ..Default::default() })
    }

    async fn unregister(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<(), ConnectorError> {
        let Some(subscription_id) = trigger.external_webhook_id.as_deref() else {
            return Ok(());
        };

        let body = self
            .graphql(
                account,
                "mutation($id: ID!) { webhookSubscriptionDelete(id: $id) { \
                   deletedWebhookSubscriptionId userErrors { field message } } }",
                json!({ "id": subscription_id }),
            )
            .await?;

        let user_errors = body
            .pointer("/data/webhookSubscriptionDelete/userErrors")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if !user_errors.is_empty() {
            let messages: Vec<&str> =
                user_errors.iter().filter_map(|e| e["message"].as_str()).collect();
            let joined = messages.join("; ");
            if joined.contains("not found") || joined.contains("does not exist") {
                warn!(trigger_id = %trigger.id, subscription_id = %subscription_id, "Shopify subscription already gone");
                return Ok(());
            }
            return Err(ConnectorError::Permanent(format!("Shopify delete failed: {joined}")));
        }
        Ok(())
    }

    fn verify(
        &self,
        raw_body: &[u8],
        headers: &HeaderMap,
        _trigger: &Trigger,
    ) -> Result<(), VerifyError> {
        let secret = self.api_secret.as_deref().ok_or(VerifyError::InvalidSignature)?;
        let signature = header_str(headers, HMAC_HEADER).ok_or(VerifyError::InvalidSignature)?;
        let expected = hmac_sha256_base64(secret.as_bytes(), &[raw_body]);
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
        let event_type = header_str(headers, TOPIC_HEADER)
            .unwrap_or(trigger.trigger_type.as_str())
            .to_string();
        let external_event_id = header_str(headers, WEBHOOK_ID_HEADER).map(str::to_string);
        Ok(vec![ParsedEvent { event_type, event_data, external_event_id }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use crate::db::tests::sample_trigger;
    use axum::http::HeaderValue;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector_with_secret(secret: &str) -> ShopifyConnector {
        let mut config = test_config();
        config.shopify_api_secret = Some(secret.to_string());
        ShopifyConnector::new(&config, reqwest::Client::new())
    }

    fn shopify_trigger() -> Trigger {
        let mut trigger = sample_trigger("t-shop", App::Shopify);
        trigger.trigger_type = "ORDERS_CREATE".to_string();
        trigger
    }

    fn account_for(server_uri: &str) -> LinkedAccount {
        LinkedAccount::new("acct-1", "p-1", App::Shopify)
            .with_credential("shop_domain", server_uri)
            .with_credential("access_token", "shpat_test")
    }

    // ── verify ──────────────────────────────────────────────────────────

    #[test]
    fn test_verify_accepts_matching_hmac() {
        let connector = connector_with_secret("hush");
        let body = br#"{"id":1}"#;
        let mut headers = HeaderMap::new();
        let signature = hmac_sha256_base64(b"hush", &[body.as_slice()]);
        headers.insert(HMAC_HEADER, HeaderValue::from_str(&signature).unwrap());

        assert!(connector.verify(body, &headers, &shopify_trigger()).is_ok());
    }

    #[test]
    fn test_verify_rejects_single_byte_change() {
        let connector = connector_with_secret("hush");
        let mut headers = HeaderMap::new();
        let signature = hmac_sha256_base64(b"hush", &[br#"{"id":1}"#.as_slice()]);
        headers.insert(HMAC_HEADER, HeaderValue::from_str(&signature).unwrap());

        assert_eq!(
            connector.verify(br#"{"id":2}"#, &headers, &shopify_trigger()),
            Err(VerifyError::InvalidSignature)
        );
    }

    #[test]
    fn test_verify_without_configured_secret_rejects() {
        let connector = ShopifyConnector::new(&test_config(), reqwest::Client::new());
        assert_eq!(
            connector.verify(b"{}", &HeaderMap::new(), &shopify_trigger()),
            Err(VerifyError::InvalidSignature)
        );
    }

    // ── parse ───────────────────────────────────────────────────────────

    #[test]
    fn test_parse_uses_topic_and_webhook_id_headers() {
        let connector = connector_with_secret("hush");
        let mut headers = HeaderMap::new();
        headers.insert(TOPIC_HEADER, HeaderValue::from_static("orders/create"));
        headers.insert(WEBHOOK_ID_HEADER, HeaderValue::from_static("wh-123"));

        let events =
            connector.parse(br#"{"id":1001}"#, &headers, &shopify_trigger()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "orders/create");
        assert_eq!(events[0].external_event_id.as_deref(), Some("wh-123"));
    }

    // ── register / unregister ───────────────────────────────────────────

    #[tokio::test]
    async fn test_register_creates_subscription() {
        let server = MockServer::start().await;
        let connector = connector_with_secret("hush");
        let trigger = shopify_trigger();

        Mock::given(method("POST"))
            .and(path(format!("/admin/api/{API_VERSION}/graphql.json")))
            .and(body_string_contains("webhookSubscriptions(first"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "webhookSubscriptions": { "edges": [] } }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/admin/api/{API_VERSION}/graphql.json")))
            .and(body_string_contains("webhookSubscriptionCreate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "webhookSubscriptionCreate": {
                    "webhookSubscription": { "id": "gid://shopify/WebhookSubscription/42" },
                    "userErrors": []
                } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let registration =
            connector.register(&trigger, &account_for(&server.uri())).await.unwrap();
        assert_eq!(
            registration.external_webhook_id.as_deref(),
            Some("gid://shopify/WebhookSubscription/42")
        );
    }

    #[tokio::test]
    async fn test_register_reuses_existing_subscription() {
        let server = MockServer::start().await;
        let connector = connector_with_secret("hush");
        let trigger = shopify_trigger();

        Mock::given(method("POST"))
            .and(path(format!("/admin/api/{API_VERSION}/graphql.json")))
            .and(body_string_contains("webhookSubscriptions(first"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "webhookSubscriptions": { "edges": [
                    { "node": {
                        "id": "gid://shopify/WebhookSubscription/7",
                        "endpoint": {
                            "__typename": "WebhookHttpEndpoint",
                            "callbackUrl": trigger.webhook_url
                        }
                    } }
                ] } }
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/admin/api/{API_VERSION}/graphql.json")))
            .and(body_string_contains("webhookSubscriptionCreate"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let registration =
            connector.register(&trigger, &account_for(&server.uri())).await.unwrap();
        assert_eq!(
            registration.external_webhook_id.as_deref(),
            Some("gid://shopify/WebhookSubscription/7")
        );
    }

    #[tokio::test]
    async fn test_register_surfaces_user_errors() {
        let server = MockServer::start().await;
        let connector = connector_with_secret("hush");

        Mock::given(method("POST"))
            .and(path(format!("/admin/api/{API_VERSION}/graphql.json")))
            .and(body_string_contains("webhookSubscriptions(first"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "webhookSubscriptions": { "edges": [] } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/admin/api/{API_VERSION}/graphql.json")))
            .and(body_string_contains("webhookSubscriptionCreate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "webhookSubscriptionCreate": {
                    "webhookSubscription": null,
                    "userErrors": [ { "field": "topic", "message": "Invalid topic" } ]
                } }
            })))
            .mount(&server)
            .await;

        let err = connector
            .register(&shopify_trigger(), &account_for(&server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_unregister_treats_not_found_as_success() {
        let server = MockServer::start().await;
        let connector = connector_with_secret("hush");
        let mut trigger = shopify_trigger();
        trigger.external_webhook_id = Some("gid://shopify/WebhookSubscription/7".to_string());

        Mock::given(method("POST"))
            .and(path(format!("/admin/api/{API_VERSION}/graphql.json")))
            .and(body_string_contains("webhookSubscriptionDelete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "webhookSubscriptionDelete": {
                    "deletedWebhookSubscriptionId": null,
                    "userErrors": [ { "message": "Webhook subscription not found" } ]
                } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        assert!(connector.unregister(&trigger, &account_for(&server.uri())).await.is_ok());
    }
}
