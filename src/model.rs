use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The SaaS providers this platform can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum App {
    HubSpot,
    Shopify,
    Slack,
    GitHub,
    Gmail,
}

impl App {
    pub const ALL: [App; 5] = [App::HubSpot, App::Shopify, App::Slack, App::GitHub, App::Gmail];

    /// Canonical storage form ("HUBSPOT", "SHOPIFY", ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            App::HubSpot => "HUBSPOT",
            App::Shopify => "SHOPIFY",
            App::Slack => "SLACK",
            App::GitHub => "GITHUB",
            App::Gmail => "GMAIL",
        }
    }

    /// Parse an app name case-insensitively ("github", "GITHUB", "GitHub").
    pub fn parse(s: &str) -> Option<App> {
        match s.to_ascii_uppercase().as_str() {
            "HUBSPOT" => Some(App::HubSpot),
            "SHOPIFY" => Some(App::Shopify),
            "SLACK" => Some(App::Slack),
            "GITHUB" => Some(App::GitHub),
            "GMAIL" => Some(App::Gmail),
            _ => None,
        }
    }
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for App {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for App {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        App::parse(&s).ok_or_else(|| serde::de::Error::custom(format!("unknown app: {s}")))
    }
}

/// Lifecycle state of a webhook subscription.
///
/// Only the orchestrator and the scheduler write this field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerStatus {
    /// Row created, provider registration not yet confirmed.
    Pending,
    Active,
    Paused,
    Error,
    Expired,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Pending => "PENDING",
            TriggerStatus::Active => "ACTIVE",
            TriggerStatus::Paused => "PAUSED",
            TriggerStatus::Error => "ERROR",
            TriggerStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<TriggerStatus> {
        match s {
            "PENDING" => Some(TriggerStatus::Pending),
            "ACTIVE" => Some(TriggerStatus::Active),
            "PAUSED" => Some(TriggerStatus::Paused),
            "ERROR" => Some(TriggerStatus::Error),
            "EXPIRED" => Some(TriggerStatus::Expired),
            _ => None,
        }
    }

    /// Reason string used in 410 responses ("paused", "expired", ...).
    pub fn reason(&self) -> &'static str {
        match self {
            TriggerStatus::Pending => "pending",
            TriggerStatus::Active => "active",
            TriggerStatus::Paused => "paused",
            TriggerStatus::Error => "errored",
            TriggerStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TriggerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TriggerStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TriggerStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TriggerStatus::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown trigger status: {s}")))
    }
}

/// Lifecycle state of one persisted delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Delivered => "DELIVERED",
            EventStatus::Failed => "FAILED",
            EventStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<EventStatus> {
        match s {
            "PENDING" => Some(EventStatus::Pending),
            "DELIVERED" => Some(EventStatus::Delivered),
            "FAILED" => Some(EventStatus::Failed),
            "EXPIRED" => Some(EventStatus::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventStatus::parse(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown event status: {s}")))
    }
}

// Keys the system itself writes into a trigger's config map.
pub const CONFIG_RETRY_COUNT: &str = "retry_count";
pub const CONFIG_LAST_ATTEMPT_AT: &str = "last_attempt_at";
pub const CONFIG_RENEWAL_FAILURES: &str = "renewal_failures";
pub const CONFIG_LAST_ERROR: &str = "last_error";
pub const CONFIG_SETUP_INSTRUCTIONS: &str = "setup_instructions";

/// One webhook subscription, bound to a project and a linked account.
#[derive(Debug, Clone, Serialize)]
pub struct Trigger {
    pub id: String,
    pub project_id: String,
    pub app: App,
    pub linked_account_id: String,
    /// Unique per (project, app, linked account); chosen by the caller.
    pub trigger_name: String,
    /// Provider-specific event name from the app's trigger catalog.
    pub trigger_type: String,
    /// Callback URL this system exposes for the trigger (embeds the id).
    pub webhook_url: String,
    /// Shared secret with the provider. Encrypted at rest, plaintext in
    /// memory, never serialized outward.
    #[serde(skip_serializing)]
    pub verification_token: String,
    pub external_webhook_id: Option<String>,
    pub config: Map<String, Value>,
    pub status: TriggerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Trigger {
    /// Read a string value from the config map.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }

    pub fn retry_count(&self) -> u64 {
        self.config.get(CONFIG_RETRY_COUNT).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn renewal_failures(&self) -> u64 {
        self.config.get(CONFIG_RENEWAL_FAILURES).and_then(|v| v.as_u64()).unwrap_or(0)
    }

    pub fn last_attempt_at(&self) -> Option<DateTime<Utc>> {
        self.config
            .get(CONFIG_LAST_ATTEMPT_AT)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
    }
}

/// Fields supplied when creating a trigger; everything else is generated.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTrigger {
    pub project_id: String,
    pub app: App,
    pub linked_account_id: String,
    pub trigger_name: String,
    pub trigger_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// One received webhook delivery, persisted for downstream consumers.
#[derive(Debug, Clone, Serialize)]
pub struct TriggerEvent {
    pub id: String,
    pub trigger_id: String,
    pub event_type: String,
    pub event_data: Value,
    /// Provider-supplied delivery id; dedup key together with trigger_id.
    pub external_event_id: Option<String>,
    pub status: EventStatus,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

/// A single event extracted from a verified delivery. HubSpot batches
/// several of these into one HTTP request; most providers send one.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    pub event_type: String,
    pub event_data: Value,
    pub external_event_id: Option<String>,
}

/// Result of registering a subscription with a provider.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    /// Provider-side subscription id; absent for providers configured
    /// outside their API (Slack Events API).
    pub external_webhook_id: Option<String>,
    /// Set for providers whose subscriptions expire (Gmail watch).
    pub expires_at: Option<DateTime<Utc>>,
    /// Human instructions for providers that cannot be registered
    /// programmatically.
    pub setup_instructions: Option<String>,
}
