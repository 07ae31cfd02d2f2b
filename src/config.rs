use serde::Deserialize;

/// Process-wide configuration, loaded from environment variables.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address to bind the HTTP server (default: "0.0.0.0:3000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Path to the SQLite database (default: "inhook.db"; ":memory:" for tests)
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// External base URL under which providers reach this process.
    /// Per-trigger callback URLs are `{public_base_url}/webhooks/{app}/{id}`.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,

    /// Optional path to a JSON file of linked accounts to load at startup.
    /// The linked-account store is an external collaborator in production;
    /// this file stands in for it in single-process deployments.
    #[serde(default)]
    pub linked_accounts_path: Option<String>,

    /// Hex-encoded 32-byte key for encrypting verification tokens at rest.
    /// When unset a random per-process key is generated (tokens become
    /// unreadable after a restart) and a warning is logged.
    #[serde(default)]
    pub token_encryption_key: Option<String>,

    // ── Admission control ───────────────────────────────────────────────
    /// Per-source-IP token bucket capacity (default: 200)
    #[serde(default = "default_global_rate_capacity")]
    pub global_rate_capacity: f64,

    /// Per-source-IP bucket refill rate, tokens per second (default: 100)
    #[serde(default = "default_global_rate_refill")]
    pub global_rate_refill_per_sec: f64,

    /// Per-trigger token bucket capacity (default: 20)
    #[serde(default = "default_trigger_rate_capacity")]
    pub trigger_rate_capacity: f64,

    /// Per-trigger bucket refill rate, tokens per second (default: 10)
    #[serde(default = "default_trigger_rate_refill")]
    pub trigger_rate_refill_per_sec: f64,

    /// Evict a bucket after it has been continuously full and idle for this
    /// long, in seconds (default: 600)
    #[serde(default = "default_bucket_eviction_secs")]
    pub bucket_eviction_secs: u64,

    // ── Ingestion ───────────────────────────────────────────────────────
    /// Maximum tolerated age of a provider-signed timestamp, in seconds
    /// (default: 300)
    #[serde(default = "default_replay_skew_secs")]
    pub replay_skew_secs: i64,

    /// How long ingested events are retained, in days (default: 30)
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,

    // ── Outbound provider calls ─────────────────────────────────────────
    /// Timeout for each outbound provider call, in seconds (default: 10)
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    // ── Scheduler cadences (seconds) ────────────────────────────────────
    /// Renew-expiring-subscriptions task (default: 6 h)
    #[serde(default = "default_renewal_interval_secs")]
    pub renewal_interval_secs: u64,

    /// Mark-expired task (default: 1 h)
    #[serde(default = "default_expiry_check_interval_secs")]
    pub expiry_check_interval_secs: u64,

    /// Retry-failed-registrations task (default: 30 min)
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Event cleanup task (default: daily)
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Gauge refresh task (default: 60 s)
    #[serde(default = "default_gauge_interval_secs")]
    pub gauge_interval_secs: u64,

    /// Google JWKS refresh task (default: 12 h)
    #[serde(default = "default_jwks_refresh_interval_secs")]
    pub jwks_refresh_interval_secs: u64,

    // ── Provider secrets and endpoints ──────────────────────────────────
    /// HubSpot app secret used for v3 request signatures
    #[serde(default)]
    pub hubspot_app_secret: Option<String>,

    /// HubSpot developer app id (webhook subscriptions are app-level)
    #[serde(default)]
    pub hubspot_app_id: Option<String>,

    /// Accept legacy HubSpot v1 signatures alongside v3 (default: false)
    #[serde(default)]
    pub hubspot_allow_v1_signature: bool,

    #[serde(default = "default_hubspot_api_base")]
    pub hubspot_api_base: String,

    /// Slack app signing secret for Events API request signatures
    #[serde(default)]
    pub slack_signing_secret: Option<String>,

    /// Shopify app API secret; Shopify signs webhook bodies with it
    #[serde(default)]
    pub shopify_api_secret: Option<String>,

    #[serde(default = "default_github_api_base")]
    pub github_api_base: String,

    #[serde(default = "default_gmail_api_base")]
    pub gmail_api_base: String,

    /// URL of Google's OIDC signing keys for Pub/Sub push tokens
    #[serde(default = "default_google_jwks_url")]
    pub google_jwks_url: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_database_path() -> String {
    "inhook.db".to_string()
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_global_rate_capacity() -> f64 {
    200.0
}

fn default_global_rate_refill() -> f64 {
    100.0
}

fn default_trigger_rate_capacity() -> f64 {
    20.0
}

fn default_trigger_rate_refill() -> f64 {
    10.0
}

fn default_bucket_eviction_secs() -> u64 {
    600
}

fn default_replay_skew_secs() -> i64 {
    300
}

fn default_event_retention_days() -> i64 {
    30
}

fn default_provider_timeout_secs() -> u64 {
    10
}

fn default_renewal_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_expiry_check_interval_secs() -> u64 {
    60 * 60
}

fn default_retry_interval_secs() -> u64 {
    30 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_gauge_interval_secs() -> u64 {
    60
}

fn default_jwks_refresh_interval_secs() -> u64 {
    12 * 60 * 60
}

fn default_hubspot_api_base() -> String {
    "https://api.hubapi.com".to_string()
}

fn default_github_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_gmail_api_base() -> String {
    "https://gmail.googleapis.com".to_string()
}

fn default_google_jwks_url() -> String {
    "https://www.googleapis.com/oauth2/v3/certs".to_string()
}

impl Config {
    /// Load configuration from environment variables (e.g. LISTEN_ADDR,
    /// PUBLIC_BASE_URL, SLACK_SIGNING_SECRET).
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env::<Config>()
    }

    /// The callback URL this system exposes for one trigger.
    pub fn webhook_url(&self, app: &str, trigger_id: &str) -> String {
        let base = self.public_base_url.trim_end_matches('/');
        format!("{base}/webhooks/{}/{trigger_id}", app.to_lowercase())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a Config with every default; tests override fields as needed.
    pub(crate) fn test_config() -> Config {
        envy::from_iter::<_, Config>(std::iter::empty::<(String, String)>())
            .expect("defaults are complete")
    }

    #[test]
    fn test_defaults() {
        let config = test_config();
        assert_eq!(config.listen_addr, "0.0.0.0:3000");
        assert_eq!(config.global_rate_capacity, 200.0);
        assert_eq!(config.trigger_rate_refill_per_sec, 10.0);
        assert_eq!(config.replay_skew_secs, 300);
        assert_eq!(config.event_retention_days, 30);
        assert_eq!(config.renewal_interval_secs, 21_600);
        assert!(!config.hubspot_allow_v1_signature);
        assert!(config.slack_signing_secret.is_none());
    }

    #[test]
    fn test_from_iter_overrides() {
        let config = envy::from_iter::<_, Config>(vec![
            ("PUBLIC_BASE_URL".to_string(), "https://hooks.example.com/".to_string()),
            ("TRIGGER_RATE_CAPACITY".to_string(), "2".to_string()),
            ("TRIGGER_RATE_REFILL_PER_SEC".to_string(), "1".to_string()),
        ])
        .unwrap();
        assert_eq!(config.trigger_rate_capacity, 2.0);
        assert_eq!(config.trigger_rate_refill_per_sec, 1.0);
        assert_eq!(
            config.webhook_url("GITHUB", "t-1"),
            "https://hooks.example.com/webhooks/github/t-1"
        );
    }
}
