use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::accounts::AccountStore;
use crate::config::Config;
use crate::connector::{ConnectorRegistry, GoogleKeySet, with_timeout};
use crate::db::Database;
use crate::error::ConnectorError;
use crate::metrics::Metrics;
use crate::model::{
    CONFIG_LAST_ATTEMPT_AT, CONFIG_LAST_ERROR, CONFIG_RENEWAL_FAILURES, CONFIG_RETRY_COUNT,
    EventStatus, Trigger, TriggerStatus,
};

/// Renew anything expiring within this window on each renewal pass.
const RENEWAL_WINDOW_HOURS: i64 = 24;
/// Consecutive renewal failures before a trigger is parked in ERROR.
const MAX_RENEWAL_FAILURES: u64 = 3;
/// Registration retry bounds: at most this many attempts, spaced at least
/// this far apart.
const MAX_REGISTRATION_ATTEMPTS: u64 = 3;
const RETRY_MIN_WAIT_MINUTES: i64 = 5;

/// Reliability loops: subscription renewal, expiration marking, bounded
/// registration retries, event retention cleanup, plus gauge and JWKS
/// refresh ticks.
///
/// Each task type runs as exactly one tokio loop in this process, so two
/// passes of the same task never overlap; none of them ever runs on the
/// ingestion path.
pub struct Scheduler {
    db: Arc<Database>,
    registry: Arc<ConnectorRegistry>,
    accounts: Arc<dyn AccountStore>,
    metrics: Arc<Metrics>,
    config: Arc<Config>,
    google_keys: Arc<GoogleKeySet>,
    http: reqwest::Client,
}

impl Scheduler {
    pub fn new(
        db: Arc<Database>,
        registry: Arc<ConnectorRegistry>,
        accounts: Arc<dyn AccountStore>,
        metrics: Arc<Metrics>,
        config: Arc<Config>,
        google_keys: Arc<GoogleKeySet>,
        http: reqwest::Client,
    ) -> Self {
        Self { db, registry, accounts, metrics, config, google_keys, http }
    }

    /// Start every background loop. The first tick of each loop fires
    /// immediately, which doubles as the initial load.
    pub fn start(self: Arc<Self>) {
        {
            let scheduler = self.clone();
            let period = self.config.renewal_interval_secs;
            tokio::spawn(async move {
                let mut ticker = interval(StdDuration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler.run_renewal_pass().await {
                        warn!(error = %e, "Renewal pass failed");
                    }
                }
            });
        }
        {
            let scheduler = self.clone();
            let period = self.config.expiry_check_interval_secs;
            tokio::spawn(async move {
                let mut ticker = interval(StdDuration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler.run_expiry_pass() {
                        warn!(error = %e, "Expiry pass failed");
                    }
                }
            });
        }
        {
            let scheduler = self.clone();
            let period = self.config.retry_interval_secs;
            tokio::spawn(async move {
                let mut ticker = interval(StdDuration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler.run_retry_pass().await {
                        warn!(error = %e, "Registration retry pass failed");
                    }
                }
            });
        }
        {
            let scheduler = self.clone();
            let period = self.config.cleanup_interval_secs;
            tokio::spawn(async move {
                let mut ticker = interval(StdDuration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler.run_cleanup_pass() {
                        warn!(error = %e, "Event cleanup pass failed");
                    }
                }
            });
        }
        {
            let scheduler = self.clone();
            let period = self.config.gauge_interval_secs;
            tokio::spawn(async move {
                let mut ticker = interval(StdDuration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler.run_gauge_pass() {
                        warn!(error = %e, "Gauge refresh failed");
                    }
                }
            });
        }
        {
            let scheduler = self.clone();
            let period = self.config.jwks_refresh_interval_secs;
            tokio::spawn(async move {
                let mut ticker = interval(StdDuration::from_secs(period));
                loop {
                    ticker.tick().await;
                    if let Err(e) = scheduler
                        .google_keys
                        .refresh(&scheduler.http, &scheduler.config.google_jwks_url)
                        .await
                    {
                        warn!(error = %e, "Google JWKS refresh failed");
                    }
                }
            });
        }
        info!("Scheduler started");
    }

    fn provider_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.config.provider_timeout_secs)
    }

    /// Renew every ACTIVE trigger expiring within the next 24 h. A failing
    /// renewal leaves the trigger ACTIVE until it has failed
    /// MAX_RENEWAL_FAILURES times in a row, then parks it in ERROR.
    pub async fn run_renewal_pass(&self) -> Result<(), rusqlite::Error> {
        let expiring = self.db.find_expiring_triggers(Duration::hours(RENEWAL_WINDOW_HOURS))?;
        if expiring.is_empty() {
            return Ok(());
        }
        info!(count = expiring.len(), "Renewing expiring subscriptions");

        for trigger in expiring {
            let Some(account) = self.accounts.get(&trigger.linked_account_id) else {
                warn!(trigger_id = %trigger.id, "Linked account missing; cannot renew");
                continue;
            };
            let connector = self.registry.get(trigger.app);
            match with_timeout(self.provider_timeout(), connector.renew(&trigger, &account)).await
            {
                Ok(expires_at) => {
                    self.metrics
                        .renewal
                        .with_label_values(&[trigger.app.as_str(), "success"])
                        .inc();
                    self.db.update_trigger_expiry(&trigger.id, Some(expires_at))?;
                    if trigger.renewal_failures() > 0 {
                        let mut config = trigger.config.clone();
                        config.remove(CONFIG_RENEWAL_FAILURES);
                        self.db.update_trigger_config(&trigger.id, &config)?;
                    }
                    debug!(trigger_id = %trigger.id, expires_at = %expires_at, "Subscription renewed");
                }
                Err(ConnectorError::NotSupported) => {
                    debug!(trigger_id = %trigger.id, app = %trigger.app, "Provider does not renew");
                }
                Err(e) => {
                    self.metrics
                        .renewal
                        .with_label_values(&[trigger.app.as_str(), "failure"])
                        .inc();
                    let failures = trigger.renewal_failures() + 1;
                    let mut config = trigger.config.clone();
                    config.insert(CONFIG_RENEWAL_FAILURES.to_string(), json!(failures));
                    config.insert(CONFIG_LAST_ERROR.to_string(), json!(e.to_string()));
                    self.db.update_trigger_config(&trigger.id, &config)?;
                    if failures >= MAX_RENEWAL_FAILURES {
                        warn!(trigger_id = %trigger.id, failures = failures, "Renewal given up; trigger parked in ERROR");
                        self.db.update_trigger_status(&trigger.id, TriggerStatus::Error, None)?;
                    } else {
                        warn!(trigger_id = %trigger.id, failures = failures, error = %e, "Renewal failed; will retry next pass");
                    }
                }
            }
        }
        Ok(())
    }

    /// ACTIVE triggers whose expiry has passed become EXPIRED.
    pub fn run_expiry_pass(&self) -> Result<usize, rusqlite::Error> {
        let expired = self.db.find_expired_triggers()?;
        for trigger in &expired {
            self.db.update_trigger_status(&trigger.id, TriggerStatus::Expired, None)?;
            info!(trigger_id = %trigger.id, app = %trigger.app, "Trigger expired");
        }
        Ok(expired.len())
    }

    /// Retry registrations for ERROR triggers, bounded by attempt count
    /// and a minimum wait between attempts.
    pub async fn run_retry_pass(&self) -> Result<(), rusqlite::Error> {
        let failed = self.db.find_failed_registrations(
            Duration::minutes(RETRY_MIN_WAIT_MINUTES),
            MAX_REGISTRATION_ATTEMPTS,
        )?;
        if failed.is_empty() {
            return Ok(());
        }
        info!(count = failed.len(), "Retrying failed registrations");

        for trigger in failed {
            let Some(account) = self.accounts.get(&trigger.linked_account_id) else {
                warn!(trigger_id = %trigger.id, "Linked account missing; cannot retry registration");
                continue;
            };
            let connector = self.registry.get(trigger.app);
            match with_timeout(self.provider_timeout(), connector.register(&trigger, &account))
                .await
            {
                Ok(registration) => {
                    self.metrics
                        .registration
                        .with_label_values(&[trigger.app.as_str(), "success"])
                        .inc();
                    self.db.update_trigger_external_id(
                        &trigger.id,
                        registration.external_webhook_id.as_deref(),
                        registration.expires_at,
                    )?;
                    let mut config = trigger.config.clone();
                    config.remove(CONFIG_RETRY_COUNT);
                    config.remove(CONFIG_LAST_ATTEMPT_AT);
                    config.remove(CONFIG_LAST_ERROR);
                    self.db.update_trigger_config(&trigger.id, &config)?;
                    self.db.update_trigger_status(&trigger.id, TriggerStatus::Active, None)?;
                    info!(trigger_id = %trigger.id, "Registration retry succeeded");
                }
                Err(e) => {
                    self.metrics
                        .registration
                        .with_label_values(&[trigger.app.as_str(), "failure"])
                        .inc();
                    self.record_retry_failure(&trigger, &e.to_string())?;
                    warn!(trigger_id = %trigger.id, attempts = trigger.retry_count() + 1, error = %e, "Registration retry failed");
                }
            }
        }
        Ok(())
    }

    fn record_retry_failure(&self, trigger: &Trigger, message: &str) -> Result<(), rusqlite::Error> {
        let mut config = trigger.config.clone();
        config.insert(CONFIG_RETRY_COUNT.to_string(), json!(trigger.retry_count() + 1));
        config.insert(CONFIG_LAST_ATTEMPT_AT.to_string(), json!(Utc::now().to_rfc3339()));
        config.insert(CONFIG_LAST_ERROR.to_string(), json!(message));
        self.db.update_trigger_config(&trigger.id, &config)?;
        Ok(())
    }

    /// Drop events past their retention expiry.
    pub fn run_cleanup_pass(&self) -> Result<usize, rusqlite::Error> {
        let removed = self.db.cleanup_events_past_expiry()?;
        if removed > 0 {
            info!(count = removed, "Cleaned up events past retention");
        }
        Ok(removed)
    }

    /// Refresh the active-trigger and pending-event gauges.
    pub fn run_gauge_pass(&self) -> Result<(), rusqlite::Error> {
        self.metrics
            .active_triggers
            .set(self.db.count_triggers_by_status(TriggerStatus::Active)?);
        self.metrics
            .pending_events
            .set(self.db.count_events_by_status(EventStatus::Pending)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{LinkedAccount, MemoryAccountStore};
    use crate::config::tests::test_config;
    use crate::crypto::TokenCipher;
    use crate::db::tests::sample_trigger;
    use crate::model::App;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scheduler_for(api_base: &str) -> (Scheduler, Arc<Database>, Arc<Metrics>) {
        let mut config = test_config();
        config.gmail_api_base = api_base.to_string();
        config.github_api_base = api_base.to_string();
        let config = Arc::new(config);
        let db = Arc::new(Database::open(":memory:", TokenCipher::generate()).unwrap());
        let metrics = Arc::new(Metrics::new());
        let google_keys = Arc::new(GoogleKeySet::empty());
        let registry = Arc::new(ConnectorRegistry::new(
            &config,
            reqwest::Client::new(),
            google_keys.clone(),
        ));
        let accounts = MemoryAccountStore::new();
        accounts.insert(
            LinkedAccount::new("acct-1", "p-1", App::Gmail)
                .with_credential("access_token", "ya29.test"),
        );
        accounts.insert(
            LinkedAccount::new("acct-gh", "p-1", App::GitHub)
                .with_credential("access_token", "gho_test"),
        );
        let scheduler = Scheduler::new(
            db.clone(),
            registry,
            Arc::new(accounts),
            metrics.clone(),
            config,
            google_keys,
            reqwest::Client::new(),
        );
        (scheduler, db, metrics)
    }

    fn gmail_trigger_expiring(id: &str, hours: i64) -> Trigger {
        let mut trigger = sample_trigger(id, App::Gmail);
        trigger.trigger_type = "new_email".to_string();
        trigger.config.insert("topic_name".to_string(), json!("projects/p/topics/gmail"));
        trigger.expires_at = Some(Utc::now() + Duration::hours(hours));
        trigger
    }

    #[tokio::test]
    async fn test_renewal_extends_expiring_subscription() {
        let server = MockServer::start().await;
        let (scheduler, db, metrics) = scheduler_for(&server.uri());
        db.create_trigger(&gmail_trigger_expiring("t1", 12)).unwrap();

        let expiration_ms = (Utc::now().timestamp() + 7 * 24 * 3600) * 1000;
        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "historyId": "1", "expiration": expiration_ms.to_string()
            })))
            .expect(1)
            .mount(&server)
            .await;

        scheduler.run_renewal_pass().await.unwrap();

        let trigger = db.get_trigger("t1").unwrap().unwrap();
        assert_eq!(trigger.status, TriggerStatus::Active);
        assert!(trigger.expires_at.unwrap() > Utc::now() + Duration::days(6));
        assert!(metrics.encode().contains("renewal_total{app=\"GMAIL\",result=\"success\"} 1"));
    }

    #[tokio::test]
    async fn test_renewal_skips_triggers_far_from_expiry() {
        let server = MockServer::start().await;
        let (scheduler, db, _metrics) = scheduler_for(&server.uri());
        db.create_trigger(&gmail_trigger_expiring("t1", 100)).unwrap();

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/watch"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        scheduler.run_renewal_pass().await.unwrap();
    }

    #[tokio::test]
    async fn test_renewal_failures_park_trigger_after_threshold() {
        let server = MockServer::start().await;
        let (scheduler, db, _metrics) = scheduler_for(&server.uri());
        db.create_trigger(&gmail_trigger_expiring("t1", 6)).unwrap();

        Mock::given(method("POST"))
            .and(path("/gmail/v1/users/me/watch"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        // Failures 1 and 2 leave the trigger ACTIVE
        scheduler.run_renewal_pass().await.unwrap();
        let trigger = db.get_trigger("t1").unwrap().unwrap();
        assert_eq!(trigger.status, TriggerStatus::Active);
        assert_eq!(trigger.renewal_failures(), 1);

        scheduler.run_renewal_pass().await.unwrap();
        assert_eq!(db.get_trigger("t1").unwrap().unwrap().status, TriggerStatus::Active);

        // The third strike parks it
        scheduler.run_renewal_pass().await.unwrap();
        let trigger = db.get_trigger("t1").unwrap().unwrap();
        assert_eq!(trigger.status, TriggerStatus::Error);
        assert_eq!(trigger.renewal_failures(), 3);
    }

    #[tokio::test]
    async fn test_expiry_pass_marks_overdue_triggers() {
        let (scheduler, db, _metrics) = scheduler_for("http://unused");
        db.create_trigger(&gmail_trigger_expiring("t-past", -1)).unwrap();
        db.create_trigger(&gmail_trigger_expiring("t-future", 48)).unwrap();

        assert_eq!(scheduler.run_expiry_pass().unwrap(), 1);
        assert_eq!(db.get_trigger("t-past").unwrap().unwrap().status, TriggerStatus::Expired);
        assert_eq!(db.get_trigger("t-future").unwrap().unwrap().status, TriggerStatus::Active);
    }

    #[tokio::test]
    async fn test_retry_pass_reactivates_on_success() {
        let server = MockServer::start().await;
        let (scheduler, db, _metrics) = scheduler_for(&server.uri());

        let mut trigger = sample_trigger("t1", App::GitHub);
        trigger.status = TriggerStatus::Error;
        trigger.linked_account_id = "acct-gh".to_string();
        trigger.config.insert("owner".to_string(), json!("octocat"));
        trigger.config.insert("repository".to_string(), json!("hello-world"));
        trigger.config.insert(CONFIG_RETRY_COUNT.to_string(), json!(1));
        trigger.config.insert(
            CONFIG_LAST_ATTEMPT_AT.to_string(),
            json!((Utc::now() - Duration::minutes(10)).to_rfc3339()),
        );
        db.create_trigger(&trigger).unwrap();

        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": 7, "config": { "url": trigger.webhook_url }
            })))
            .expect(1)
            .mount(&server)
            .await;

        scheduler.run_retry_pass().await.unwrap();

        let reloaded = db.get_trigger("t1").unwrap().unwrap();
        assert_eq!(reloaded.status, TriggerStatus::Active);
        assert_eq!(reloaded.external_webhook_id.as_deref(), Some("7"));
        assert_eq!(reloaded.retry_count(), 0);
    }

    #[tokio::test]
    async fn test_retry_pass_increments_attempts_on_failure() {
        let server = MockServer::start().await;
        let (scheduler, db, _metrics) = scheduler_for(&server.uri());

        let mut trigger = sample_trigger("t1", App::GitHub);
        trigger.status = TriggerStatus::Error;
        trigger.linked_account_id = "acct-gh".to_string();
        trigger.config.insert("owner".to_string(), json!("octocat"));
        trigger.config.insert("repository".to_string(), json!("hello-world"));
        trigger.config.insert(CONFIG_RETRY_COUNT.to_string(), json!(1));
        trigger.config.insert(
            CONFIG_LAST_ATTEMPT_AT.to_string(),
            json!((Utc::now() - Duration::minutes(10)).to_rfc3339()),
        );
        db.create_trigger(&trigger).unwrap();

        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        scheduler.run_retry_pass().await.unwrap();

        let reloaded = db.get_trigger("t1").unwrap().unwrap();
        assert_eq!(reloaded.status, TriggerStatus::Error);
        assert_eq!(reloaded.retry_count(), 2);
    }

    #[tokio::test]
    async fn test_retry_pass_leaves_exhausted_triggers_alone() {
        let server = MockServer::start().await;
        let (scheduler, db, _metrics) = scheduler_for(&server.uri());

        let mut trigger = sample_trigger("t1", App::GitHub);
        trigger.status = TriggerStatus::Error;
        trigger.linked_account_id = "acct-gh".to_string();
        trigger.config.insert(CONFIG_RETRY_COUNT.to_string(), json!(3));
        db.create_trigger(&trigger).unwrap();

        Mock::given(method("GET"))
            .and(path("/repos/octocat/hello-world/hooks"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        scheduler.run_retry_pass().await.unwrap();
        assert_eq!(db.get_trigger("t1").unwrap().unwrap().retry_count(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_and_gauge_passes() {
        let (scheduler, db, metrics) = scheduler_for("http://unused");
        db.create_trigger(&sample_trigger("t1", App::GitHub)).unwrap();
        db.create_trigger_event("t1", "push", &json!({}), Some("old"), Duration::seconds(-5))
            .unwrap();
        db.create_trigger_event("t1", "push", &json!({}), Some("new"), Duration::days(30))
            .unwrap();

        assert_eq!(scheduler.run_cleanup_pass().unwrap(), 1);

        scheduler.run_gauge_pass().unwrap();
        let text = metrics.encode();
        assert!(text.contains("active_triggers_count 1"));
        assert!(text.contains("pending_events_count 1"));
    }
}
