use serde_json::{Value, json};

use crate::model::App;

/// One entry in an app's static trigger catalog.
#[derive(Debug, Clone)]
pub struct TriggerType {
    pub name: &'static str,
    pub description: &'static str,
    /// JSON schema for the trigger's `config` map.
    pub config_schema: fn() -> Value,
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {}, "required": [] })
}

fn github_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "owner": { "type": "string", "description": "Repository owner or organization" },
            "repository": { "type": "string", "description": "Repository name" }
        },
        "required": ["owner", "repository"]
    })
}

fn gmail_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "topic_name": {
                "type": "string",
                "description": "Pub/Sub topic receiving Gmail notifications, e.g. projects/p/topics/t"
            },
            "label_ids": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Restrict the watch to these Gmail labels"
            }
        },
        "required": ["topic_name"]
    })
}

fn slack_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "channels": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Only store events from these channel ids"
            }
        },
        "required": []
    })
}

static HUBSPOT_TRIGGERS: &[TriggerType] = &[
    TriggerType {
        name: "contact.creation",
        description: "A contact was created in the CRM",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "contact.propertyChange",
        description: "A contact property changed",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "deal.creation",
        description: "A deal was created",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "deal.propertyChange",
        description: "A deal property changed",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "company.creation",
        description: "A company was created",
        config_schema: empty_schema,
    },
];

static SHOPIFY_TRIGGERS: &[TriggerType] = &[
    TriggerType {
        name: "ORDERS_CREATE",
        description: "An order was placed",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "ORDERS_UPDATED",
        description: "An order was updated",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "PRODUCTS_CREATE",
        description: "A product was created",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "CUSTOMERS_CREATE",
        description: "A customer signed up",
        config_schema: empty_schema,
    },
    TriggerType {
        name: "APP_UNINSTALLED",
        description: "The app was uninstalled from the shop",
        config_schema: empty_schema,
    },
];

static SLACK_TRIGGERS: &[TriggerType] = &[
    TriggerType {
        name: "message",
        description: "A message was posted to a channel",
        config_schema: slack_schema,
    },
    TriggerType {
        name: "app_mention",
        description: "The app was mentioned",
        config_schema: slack_schema,
    },
    TriggerType {
        name: "reaction_added",
        description: "A reaction was added to a message",
        config_schema: slack_schema,
    },
    TriggerType {
        name: "channel_created",
        description: "A channel was created",
        config_schema: empty_schema,
    },
];

static GITHUB_TRIGGERS: &[TriggerType] = &[
    TriggerType {
        name: "push",
        description: "Commits were pushed to a repository",
        config_schema: github_schema,
    },
    TriggerType {
        name: "issues",
        description: "An issue was opened, edited or closed",
        config_schema: github_schema,
    },
    TriggerType {
        name: "pull_request",
        description: "A pull request was opened or updated",
        config_schema: github_schema,
    },
    TriggerType {
        name: "release",
        description: "A release was published",
        config_schema: github_schema,
    },
    TriggerType {
        name: "star",
        description: "The repository was starred",
        config_schema: github_schema,
    },
];

static GMAIL_TRIGGERS: &[TriggerType] = &[TriggerType {
    name: "new_email",
    description: "New mail arrived in the watched mailbox",
    config_schema: gmail_schema,
}];

/// The static list of trigger types an app supports. Read-only at runtime;
/// consumed by connectors and the orchestrator for validation and served to
/// the admin layer.
pub fn catalog_for(app: App) -> &'static [TriggerType] {
    match app {
        App::HubSpot => HUBSPOT_TRIGGERS,
        App::Shopify => SHOPIFY_TRIGGERS,
        App::Slack => SLACK_TRIGGERS,
        App::GitHub => GITHUB_TRIGGERS,
        App::Gmail => GMAIL_TRIGGERS,
    }
}

/// Validate a trigger_type and its config against the app's catalog.
///
/// Checks that the trigger type exists and that every key the schema marks
/// as required is present in the config map.
pub fn validate_config(
    app: App,
    trigger_type: &str,
    config: &serde_json::Map<String, Value>,
) -> Result<(), String> {
    let entry = catalog_for(app)
        .iter()
        .find(|t| t.name == trigger_type)
        .ok_or_else(|| format!("unknown trigger type `{trigger_type}` for app {app}"))?;

    let schema = (entry.config_schema)();
    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for key in required.iter().filter_map(|v| v.as_str()) {
            match config.get(key) {
                Some(Value::String(s)) if !s.is_empty() => {}
                Some(v) if !v.is_null() && !v.is_string() => {}
                _ => return Err(format!("config key `{key}` is required for {trigger_type}")),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    #[test]
    fn test_every_app_has_a_catalog() {
        for app in App::ALL {
            assert!(!catalog_for(app).is_empty(), "{app} has no trigger types");
        }
    }

    #[test]
    fn test_validate_unknown_trigger_type() {
        let err = validate_config(App::GitHub, "gollum_spam", &Map::new()).unwrap_err();
        assert!(err.contains("unknown trigger type"));
    }

    #[test]
    fn test_validate_requires_github_repo_binding() {
        let mut config = Map::new();
        assert!(validate_config(App::GitHub, "push", &config).is_err());

        config.insert("owner".to_string(), json!("octocat"));
        assert!(validate_config(App::GitHub, "push", &config).is_err());

        config.insert("repository".to_string(), json!("hello-world"));
        assert!(validate_config(App::GitHub, "push", &config).is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_required_string() {
        let mut config = Map::new();
        config.insert("topic_name".to_string(), json!(""));
        assert!(validate_config(App::Gmail, "new_email", &config).is_err());

        config.insert("topic_name".to_string(), json!("projects/p/topics/gmail"));
        assert!(validate_config(App::Gmail, "new_email", &config).is_ok());
    }

    #[test]
    fn test_validate_accepts_optional_config() {
        assert!(validate_config(App::Slack, "message", &Map::new()).is_ok());
        assert!(validate_config(App::Shopify, "ORDERS_CREATE", &Map::new()).is_ok());
    }
}
