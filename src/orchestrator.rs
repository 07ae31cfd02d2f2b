use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::accounts::{AccountStore, LinkedAccount};
use crate::catalog;
use crate::config::Config;
use crate::connector::{ConnectorRegistry, with_timeout};
use crate::crypto::generate_verification_token;
use crate::db::{Database, is_unique_violation};
use crate::error::{ConnectorError, OrchestrateError};
use crate::metrics::Metrics;
use crate::model::{
    CONFIG_LAST_ATTEMPT_AT, CONFIG_LAST_ERROR, CONFIG_RETRY_COUNT, CONFIG_SETUP_INSTRUCTIONS,
    NewTrigger, Trigger, TriggerStatus,
};

/// Patch applied by `update`: a pause/resume transition, a new config map,
/// or both. Config changes affect the remote subscription and are applied
/// as unregister-then-register.
#[derive(Debug, Default, Deserialize)]
pub struct TriggerPatch {
    pub status: Option<TriggerStatus>,
    pub config: Option<Map<String, Value>>,
}

/// Per-item result of a bulk operation.
#[derive(Debug, Serialize)]
pub struct BulkOutcome {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Drives the trigger lifecycle: creation, pause/resume, config changes,
/// deletion, and the provider calls each of those implies. Together with
/// the scheduler it is the only writer of trigger status.
pub struct Orchestrator {
    db: Arc<Database>,
    registry: Arc<ConnectorRegistry>,
    accounts: Arc<dyn AccountStore>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,
}

impl Orchestrator {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ConnectorRegistry>,
        accounts: Arc<dyn AccountStore>,
        metrics: Arc<Metrics>,
        config: Arc<Config>,
    ) -> Self {
        Self { db, registry, accounts, metrics, config }
    }

    fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.config.provider_timeout_secs)
    }

    fn account_for(&self, trigger: &Trigger) -> Result<LinkedAccount, OrchestrateError> {
        let account = self
            .accounts
            .get(&trigger.linked_account_id)
            .ok_or_else(|| OrchestrateError::UnknownAccount(trigger.linked_account_id.clone()))?;
        if account.app != trigger.app {
            return Err(OrchestrateError::InvalidConfig(format!(
                "linked account {} belongs to {}, not {}",
                account.id, account.app, trigger.app
            )));
        }
        Ok(account)
    }

    /// Create a trigger: persist it PENDING, register with the provider,
    /// then transition to ACTIVE. A transient provider failure leaves the
    /// row in ERROR for the scheduler to retry; a permanent one rolls the
    /// row back entirely.
    pub async fn create(&self, request: NewTrigger) -> Result<Trigger, OrchestrateError> {
        catalog::validate_config(request.app, &request.trigger_type, &request.config)
            .map_err(OrchestrateError::InvalidConfig)?;

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let trigger = Trigger {
            webhook_url: self.config.webhook_url(request.app.as_str(), &id),
            id,
            project_id: request.project_id,
            app: request.app,
            linked_account_id: request.linked_account_id,
            trigger_name: request.trigger_name,
            trigger_type: request.trigger_type,
            verification_token: generate_verification_token(),
            external_webhook_id: None,
            config: request.config,
            status: TriggerStatus::Pending,
            created_at: now,
            updated_at: now,
            last_triggered_at: None,
            expires_at: None,
        };
        let account = self.account_for(&trigger)?;

        self.db.create_trigger(&trigger).map_err(|e| {
            if is_unique_violation(&e) { OrchestrateError::Conflict } else { e.into() }
        })?;

        match self.register(&trigger, &account).await {
            Ok(()) => {}
            Err(ConnectorError::Transient(message)) => {
                warn!(trigger_id = %trigger.id, error = %message, "Registration failed; will retry");
                self.record_registration_failure(&trigger, &message)?;
            }
            Err(e) => {
                // Unretryable (bad config, revoked credentials): leave no
                // trace of the trigger behind.
                error!(trigger_id = %trigger.id, error = %e, "Registration rejected; rolling back");
                self.db.delete_trigger(&trigger.id)?;
                return Err(OrchestrateError::Provider(e));
            }
        }

        self.db.get_trigger(&trigger.id)?.ok_or(OrchestrateError::NotFound)
    }

    /// One registration attempt plus the persistence it implies; shared by
    /// `create` and config-changing updates.
    async fn register(
        &self,
        trigger: &Trigger,
        account: &LinkedAccount,
    ) -> Result<(), ConnectorError> {
        let connector = self.registry.get(trigger.app);
        let result =
            with_timeout(self.provider_timeout(), connector.register(trigger, account)).await;

        match result {
            Ok(registration) => {
                self.metrics
                    .registration
                    .with_label_values(&[trigger.app.as_str(), "success"])
                    .inc();
                let _ = self.db.update_trigger_external_id(
                    &trigger.id,
                    registration.external_webhook_id.as_deref(),
                    registration.expires_at,
                );
                if let Some(instructions) = registration.setup_instructions {
                    let mut config = trigger.config.clone();
                    config.insert(CONFIG_SETUP_INSTRUCTIONS.to_string(), json!(instructions));
                    let _ = self.db.update_trigger_config(&trigger.id, &config);
                }
                let _ = self.db.update_trigger_status(&trigger.id, TriggerStatus::Active, None);
                info!(trigger_id = %trigger.id, app = %trigger.app, "Trigger active");
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .registration
                    .with_label_values(&[trigger.app.as_str(), "failure"])
                    .inc();
                Err(e)
            }
        }
    }

    fn record_registration_failure(
        &self,
        trigger: &Trigger,
        message: &str,
    ) -> Result<(), OrchestrateError> {
        let mut config = trigger.config.clone();
        config.insert(CONFIG_RETRY_COUNT.to_string(), json!(trigger.retry_count() + 1));
        config.insert(CONFIG_LAST_ATTEMPT_AT.to_string(), json!(Utc::now().to_rfc3339()));
        config.insert(CONFIG_LAST_ERROR.to_string(), json!(message));
        self.db.update_trigger_config(&trigger.id, &config)?;
        self.db.update_trigger_status(&trigger.id, TriggerStatus::Error, None)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Trigger, OrchestrateError> {
        self.db.get_trigger(id)?.ok_or(OrchestrateError::NotFound)
    }

    /// Apply a patch. Pause/resume touches only our row; a config change
    /// re-provisions the remote subscription.
    pub async fn update(&self, id: &str, patch: TriggerPatch) -> Result<Trigger, OrchestrateError> {
        let trigger = self.get(id)?;

        if let Some(target) = patch.status {
            let allowed = matches!(
                (trigger.status, target),
                (TriggerStatus::Active, TriggerStatus::Paused)
                    | (TriggerStatus::Paused, TriggerStatus::Active)
            );
            if !allowed {
                return Err(OrchestrateError::InvalidTransition {
                    from: trigger.status.to_string(),
                    to: target.to_string(),
                });
            }
            self.db.update_trigger_status(id, target, None)?;
            info!(trigger_id = %id, status = %target, "Trigger status changed");
        }

        if let Some(new_config) = patch.config {
            catalog::validate_config(trigger.app, &trigger.trigger_type, &new_config)
                .map_err(OrchestrateError::InvalidConfig)?;
            let account = self.account_for(&trigger)?;
            let connector = self.registry.get(trigger.app);

            // The remote subscription reflects the old config; replace it.
            if let Err(e) =
                with_timeout(self.provider_timeout(), connector.unregister(&trigger, &account))
                    .await
            {
                warn!(trigger_id = %id, error = %e, "Unregister before re-register failed");
            }
            self.db.update_trigger_config(id, &new_config)?;

            let mut updated = trigger.clone();
            updated.config = new_config;
            if let Err(e) = self.register(&updated, &account).await {
                warn!(trigger_id = %id, error = %e, "Re-registration failed");
                self.record_registration_failure(&updated, &e.to_string())?;
            }
        }

        self.get(id)
    }

    /// Delete a trigger. Unregistering with the provider is best-effort: a
    /// dangling remote hook is preferable to a trigger that cannot be
    /// removed.
    pub async fn delete(&self, id: &str) -> Result<(), OrchestrateError> {
        let trigger = self.get(id)?;

        match self.account_for(&trigger) {
            Ok(account) => {
                let connector = self.registry.get(trigger.app);
                if let Err(e) =
                    with_timeout(self.provider_timeout(), connector.unregister(&trigger, &account))
                        .await
                {
                    warn!(trigger_id = %id, error = %e, "Unregister failed; deleting anyway");
                }
            }
            Err(e) => {
                warn!(trigger_id = %id, error = %e, "No usable linked account; skipping unregister");
            }
        }

        self.db.delete_trigger(id)?;
        info!(trigger_id = %id, "Trigger deleted");
        Ok(())
    }

    /// Per-item bulk pause/resume; one bad id never aborts the batch.
    pub async fn bulk_update_status(
        &self,
        ids: &[String],
        status: TriggerStatus,
    ) -> Vec<BulkOutcome> {
        join_all(ids.iter().map(|id| async move {
            match self.update(id, TriggerPatch { status: Some(status), config: None }).await {
                Ok(_) => BulkOutcome { id: id.clone(), ok: true, error: None },
                Err(e) => BulkOutcome { id: id.clone(), ok: false, error: Some(e.to_string()) },
            }
        }))
        .await
    }

    /// Per-item bulk delete with the same reporting shape.
    pub async fn bulk_delete(&self, ids: &[String]) -> Vec<BulkOutcome> {
        join_all(ids.iter().map(|id| async move {
            match self.delete(id).await {
                Ok(()) => BulkOutcome { id: id.clone(), ok: true, error: None },
                Err(e) => BulkOutcome { id: id.clone(), ok: false, error: Some(e.to_string()) },
            }
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::MemoryAccountStore;
    use crate::config::tests::test_config;
    use crate::connector::GoogleKeySet;
    use crate::crypto::TokenCipher;
    use crate::db::tests::sample_trigger;
    use crate::model::App;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn orchestrator_for(github_base: &str) -> (Orchestrator, Arc<Database>) {
        let mut config = test_config();
        config.github_api_base = github_base.to_string();
        let config = Arc::new(config);
        let db = Arc::new(Database::open(":memory:", TokenCipher::generate()).unwrap());
        let registry = Arc::new(ConnectorRegistry::new(
            &config,
            reqwest::Client::new(),
            Arc::new(GoogleKeySet::empty()),
        ));
        let accounts = MemoryAccountStore::new();
        accounts.insert(
            LinkedAccount::new("acct-gh", "p-1", App::GitHub)
                .with_credential("access_token", "gho_test"),
        );
        accounts.insert(LinkedAccount::new("acct-slack", "p-1", App::Slack));
        let orchestrator = Orchestrator::new(
            db.clone(),
            registry,
            Arc::new(accounts),
            Arc::new(Metrics::new()),
            config,
        );
        (orchestrator, db)
    }

    fn github_request() -> NewTrigger {
        let mut config = Map::new();
        config.insert("owner".to_string(), json!("octocat"));
        config.insert("repository".to_string(), json!("hello-world"));
        NewTrigger {
            project_id: "p-1".to_string(),
            app: App::GitHub,
            linked_account_id: "acct-gh".to_string(),
            trigger_name: "ci-pushes".to_string(),
            trigger_type: "push".to_string(),
            config,
        }
    }

    async fn mount_github_success(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 42, "config": { "url": "ignored" }
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_create_registers_and_activates() {
        let server = MockServer::start().await;
        let (orchestrator, _db) = orchestrator_for(&server.uri());
        mount_github_success(&server).await;

        let trigger = orchestrator.create(github_request()).await.unwrap();
        assert_eq!(trigger.status, TriggerStatus::Active);
        assert_eq!(trigger.external_webhook_id.as_deref(), Some("42"));
        assert!(trigger.webhook_url.ends_with(&format!("/webhooks/github/{}", trigger.id)));
        // 256-bit hex token, generated server-side
        assert_eq!(trigger.verification_token.len(), 64);
    }

    #[tokio::test]
    async fn test_create_conflict_on_duplicate_name() {
        let server = MockServer::start().await;
        let (orchestrator, _db) = orchestrator_for(&server.uri());
        mount_github_success(&server).await;

        orchestrator.create(github_request()).await.unwrap();
        let err = orchestrator.create(github_request()).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::Conflict));
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_trigger_type() {
        let (orchestrator, db) = orchestrator_for("http://unused");
        let mut request = github_request();
        request.trigger_type = "made_up".to_string();
        let err = orchestrator.create(request).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::InvalidConfig(_)));
        assert_eq!(db.count_triggers().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_account() {
        let (orchestrator, _db) = orchestrator_for("http://unused");
        let mut request = github_request();
        request.linked_account_id = "acct-missing".to_string();
        let err = orchestrator.create(request).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::UnknownAccount(_)));
    }

    #[tokio::test]
    async fn test_create_transient_failure_leaves_error_row() {
        let server = MockServer::start().await;
        let (orchestrator, _db) = orchestrator_for(&server.uri());

        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let trigger = orchestrator.create(github_request()).await.unwrap();
        assert_eq!(trigger.status, TriggerStatus::Error);
        assert_eq!(trigger.retry_count(), 1);
        assert!(trigger.last_attempt_at().is_some());
        assert!(trigger.config_str(CONFIG_LAST_ERROR).is_some());
    }

    #[tokio::test]
    async fn test_create_permanent_failure_rolls_back() {
        let server = MockServer::start().await;
        let (orchestrator, db) = orchestrator_for(&server.uri());

        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(403).set_body_string("bad credentials"))
            .mount(&server)
            .await;

        let err = orchestrator.create(github_request()).await.unwrap_err();
        assert!(matches!(err, OrchestrateError::Provider(ConnectorError::Permanent(_))));
        assert_eq!(db.count_triggers().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_slack_stores_setup_instructions() {
        let (orchestrator, _db) = orchestrator_for("http://unused");
        let request = NewTrigger {
            project_id: "p-1".to_string(),
            app: App::Slack,
            linked_account_id: "acct-slack".to_string(),
            trigger_name: "mentions".to_string(),
            trigger_type: "app_mention".to_string(),
            config: Map::new(),
        };

        let trigger = orchestrator.create(request).await.unwrap();
        assert_eq!(trigger.status, TriggerStatus::Active);
        assert!(trigger.external_webhook_id.is_none());
        assert!(
            trigger.config_str(CONFIG_SETUP_INSTRUCTIONS).unwrap().contains(&trigger.webhook_url)
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (orchestrator, db) = orchestrator_for("http://unused");
        db.create_trigger(&sample_trigger("t1", App::GitHub)).unwrap();

        let paused = orchestrator
            .update("t1", TriggerPatch { status: Some(TriggerStatus::Paused), config: None })
            .await
            .unwrap();
        assert_eq!(paused.status, TriggerStatus::Paused);

        let resumed = orchestrator
            .update("t1", TriggerPatch { status: Some(TriggerStatus::Active), config: None })
            .await
            .unwrap();
        assert_eq!(resumed.status, TriggerStatus::Active);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_transition() {
        let (orchestrator, db) = orchestrator_for("http://unused");
        let mut trigger = sample_trigger("t1", App::GitHub);
        trigger.status = TriggerStatus::Error;
        db.create_trigger(&trigger).unwrap();

        let err = orchestrator
            .update("t1", TriggerPatch { status: Some(TriggerStatus::Active), config: None })
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_config_change_reregisters() {
        let server = MockServer::start().await;
        let (orchestrator, db) = orchestrator_for(&server.uri());

        let mut trigger = sample_trigger("t1", App::GitHub);
        trigger.config.insert("owner".to_string(), json!("octocat"));
        trigger.config.insert("repository".to_string(), json!("hello-world"));
        trigger.external_webhook_id = Some("41".to_string());
        trigger.linked_account_id = "acct-gh".to_string();
        db.create_trigger(&trigger).unwrap();

        // unregister of hook 41, then list + create of the replacement
        Mock::given(method("DELETE"))
            .and(path("/repos/octocat/hello-world/hooks/41"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        mount_github_success(&server).await;

        let mut new_config = Map::new();
        new_config.insert("owner".to_string(), json!("octocat"));
        new_config.insert("repository".to_string(), json!("hello-world"));
        new_config.insert("note".to_string(), json!("tightened"));

        let updated = orchestrator
            .update("t1", TriggerPatch { status: None, config: Some(new_config) })
            .await
            .unwrap();
        assert_eq!(updated.status, TriggerStatus::Active);
        assert_eq!(updated.external_webhook_id.as_deref(), Some("42"));
        assert_eq!(updated.config_str("note"), Some("tightened"));
    }

    #[tokio::test]
    async fn test_delete_proceeds_when_unregister_fails() {
        let server = MockServer::start().await;
        let (orchestrator, db) = orchestrator_for(&server.uri());

        let mut trigger = sample_trigger("t1", App::GitHub);
        trigger.config.insert("owner".to_string(), json!("octocat"));
        trigger.config.insert("repository".to_string(), json!("hello-world"));
        trigger.external_webhook_id = Some("42".to_string());
        trigger.linked_account_id = "acct-gh".to_string();
        db.create_trigger(&trigger).unwrap();

        Mock::given(method("DELETE"))
            .and(path("/repos/octocat/hello-world/hooks/42"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        orchestrator.delete("t1").await.unwrap();
        assert!(db.get_trigger("t1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bulk_update_reports_per_item() {
        let (orchestrator, db) = orchestrator_for("http://unused");
        db.create_trigger(&sample_trigger("t1", App::GitHub)).unwrap();
        db.create_trigger(&sample_trigger("t2", App::GitHub)).unwrap();

        let outcomes = orchestrator
            .bulk_update_status(
                &["t1".to_string(), "missing".to_string(), "t2".to_string()],
                TriggerStatus::Paused,
            )
            .await;
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert!(outcomes[2].ok);
        assert_eq!(db.get_trigger("t1").unwrap().unwrap().status, TriggerStatus::Paused);
    }

    #[tokio::test]
    async fn test_bulk_delete_reports_per_item() {
        let (orchestrator, db) = orchestrator_for("http://unused");
        let mut trigger = sample_trigger("t1", App::Slack);
        trigger.linked_account_id = "acct-slack".to_string();
        db.create_trigger(&trigger).unwrap();

        let outcomes =
            orchestrator.bulk_delete(&["t1".to_string(), "missing".to_string()]).await;
        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert_eq!(db.count_triggers().unwrap(), 0);
    }
}
