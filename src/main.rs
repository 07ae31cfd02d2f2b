mod accounts;
mod catalog;
mod config;
mod connector;
mod crypto;
mod db;
mod error;
mod metrics;
mod model;
mod orchestrator;
mod ratelimit;
mod routes;
mod scheduler;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router as AxumRouter;
use axum::routing::{get, post};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::accounts::MemoryAccountStore;
use crate::config::Config;
use crate::connector::{ConnectorRegistry, GoogleKeySet};
use crate::crypto::TokenCipher;
use crate::db::Database;
use crate::metrics::Metrics;
use crate::orchestrator::Orchestrator;
use crate::ratelimit::{AdmissionController, RateSettings};
use crate::routes::{
    AppState, admin, handle_webhook, handle_webhook_challenge, health_check, metrics_export,
};
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inhook=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            eprintln!("Error: Failed to load configuration: {}", e);
            eprintln!("\nCommonly set environment variables:");
            eprintln!("  LISTEN_ADDR              - Address to bind (default: 0.0.0.0:3000)");
            eprintln!("  DATABASE_PATH            - Path to SQLite database (default: inhook.db)");
            eprintln!("  PUBLIC_BASE_URL          - Base URL providers deliver to");
            eprintln!("  TOKEN_ENCRYPTION_KEY     - Hex 32-byte key for token encryption at rest");
            eprintln!("  LINKED_ACCOUNTS_PATH     - JSON file of linked provider accounts");
            eprintln!("  HUBSPOT_APP_SECRET / HUBSPOT_APP_ID");
            eprintln!("  SLACK_SIGNING_SECRET");
            eprintln!("  SHOPIFY_API_SECRET");
            std::process::exit(1);
        }
    };

    info!(
        listen_addr = %config.listen_addr,
        public_base_url = %config.public_base_url,
        database_path = %config.database_path,
        "Starting inhook"
    );

    // Verification tokens are encrypted at rest; without a configured key
    // they survive only until the process exits.
    let cipher = match config.token_encryption_key.as_deref() {
        Some(key_hex) => match TokenCipher::from_hex(key_hex) {
            Ok(cipher) => cipher,
            Err(e) => {
                error!(error = %e, "Invalid TOKEN_ENCRYPTION_KEY");
                eprintln!("Error: TOKEN_ENCRYPTION_KEY must be 32 hex-encoded bytes");
                std::process::exit(1);
            }
        },
        None => {
            warn!(
                "No TOKEN_ENCRYPTION_KEY configured; using a random per-process key. \
                 Stored verification tokens will be unreadable after a restart."
            );
            TokenCipher::generate()
        }
    };

    // Open the SQLite database
    let db = match Database::open(&config.database_path, cipher) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            error!(error = %e, path = %config.database_path, "Failed to open database");
            eprintln!("Error: Failed to open database at {}: {}", config.database_path, e);
            std::process::exit(1);
        }
    };

    // Linked accounts: an external store in production, a JSON file here
    let accounts = match config.linked_accounts_path.as_deref() {
        Some(path) => match MemoryAccountStore::from_json_file(path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to load linked accounts");
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
        },
        None => {
            warn!("LINKED_ACCOUNTS_PATH not set; starting with no linked accounts");
            Arc::new(MemoryAccountStore::new())
        }
    };

    // Shared outbound client for provider calls
    let http = match reqwest::Client::builder()
        .user_agent(concat!("inhook/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(config.provider_timeout_secs))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(Metrics::new());
    let google_keys = Arc::new(GoogleKeySet::empty());
    let registry =
        Arc::new(ConnectorRegistry::new(&config, http.clone(), google_keys.clone()));

    let limiter = AdmissionController::new(
        RateSettings {
            capacity: config.global_rate_capacity,
            refill_per_sec: config.global_rate_refill_per_sec,
        },
        RateSettings {
            capacity: config.trigger_rate_capacity,
            refill_per_sec: config.trigger_rate_refill_per_sec,
        },
        Duration::from_secs(config.bucket_eviction_secs),
    );

    let orchestrator = Orchestrator::new(
        db.clone(),
        registry.clone(),
        accounts.clone(),
        metrics.clone(),
        config.clone(),
    );

    // Start the reliability loops (renewal, expiry, retries, cleanup)
    Arc::new(Scheduler::new(
        db.clone(),
        registry.clone(),
        accounts.clone(),
        metrics.clone(),
        config.clone(),
        google_keys,
        http,
    ))
    .start();

    // Create application state
    let app_state = Arc::new(AppState {
        db,
        registry,
        limiter,
        metrics,
        orchestrator,
        config: config.clone(),
    });

    // Build the HTTP router
    let app = AxumRouter::new()
        // ── Inbound webhook deliveries from providers ────────────────────
        .route(
            "/webhooks/{app}/{trigger_id}",
            post(handle_webhook).get(handle_webhook_challenge),
        )
        // ── Trigger lifecycle (consumed by the admin layer) ──────────────
        .route("/v1/triggers", post(admin::create_trigger).get(admin::list_triggers))
        .route(
            "/v1/triggers/{id}",
            get(admin::get_trigger)
                .patch(admin::update_trigger)
                .delete(admin::delete_trigger),
        )
        .route("/v1/triggers/{id}/events", get(admin::list_trigger_events))
        .route("/v1/triggers/bulk/status", post(admin::bulk_update_status))
        .route("/v1/triggers/bulk/delete", post(admin::bulk_delete))
        .route("/v1/catalog/{app}", get(admin::app_catalog))
        // ── Operational endpoints ────────────────────────────────────────
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_export))
        .with_state(app_state);

    // Start the server
    let listener = match tokio::net::TcpListener::bind(&config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, address = %config.listen_addr, "Failed to bind");
            eprintln!("Error: failed to bind {}: {e}", config.listen_addr);
            std::process::exit(1);
        }
    };

    info!(address = %config.listen_addr, "Server listening");
    info!("Webhook URL pattern: {}/webhooks/{{app}}/{{trigger_id}}", config.public_base_url);

    if let Err(e) =
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
    {
        error!(error = %e, "Server exited with error");
        std::process::exit(1);
    }
}
