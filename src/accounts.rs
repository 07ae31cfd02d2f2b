use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::error::ConnectorError;
use crate::model::App;

/// External credential bundle for one provider account (OAuth token, API
/// key, shop domain, ...). Opaque to the core; connectors read individual
/// credentials at call time so token refresh between calls just works.
#[derive(Debug, Clone, Deserialize)]
pub struct LinkedAccount {
    pub id: String,
    pub project_id: String,
    pub app: App,
    #[serde(default)]
    credentials: HashMap<String, String>,
}

impl LinkedAccount {
    pub fn new(id: &str, project_id: &str, app: App) -> Self {
        Self {
            id: id.to_string(),
            project_id: project_id.to_string(),
            app,
            credentials: HashMap::new(),
        }
    }

    pub fn with_credential(mut self, key: &str, value: &str) -> Self {
        self.credentials.insert(key.to_string(), value.to_string());
        self
    }

    /// Fetch a required credential. A missing credential is a permanent
    /// error: retrying will not make it appear.
    pub fn credential(&self, key: &str) -> Result<&str, ConnectorError> {
        self.credentials
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| {
                ConnectorError::Permanent(format!(
                    "linked account {} has no credential `{key}`",
                    self.id
                ))
            })
    }
}

/// Read-side interface of the linked-account store. The real store lives
/// outside this system; the in-memory implementation below backs tests and
/// single-process deployments.
pub trait AccountStore: Send + Sync {
    fn get(&self, id: &str) -> Option<LinkedAccount>;
}

#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: RwLock<HashMap<String, LinkedAccount>>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load accounts from a JSON array file (id, project_id, app,
    /// credentials map per entry).
    pub fn from_json_file(path: &str) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {path}: {e}"))?;
        let accounts: Vec<LinkedAccount> =
            serde_json::from_str(&raw).map_err(|e| format!("invalid accounts file {path}: {e}"))?;
        info!(count = accounts.len(), path = %path, "Loaded linked accounts");
        let store = Self::new();
        for account in accounts {
            store.insert(account);
        }
        Ok(store)
    }

    pub fn insert(&self, account: LinkedAccount) {
        self.accounts.write().insert(account.id.clone(), account);
    }
}

impl AccountStore for MemoryAccountStore {
    fn get(&self, id: &str) -> Option<LinkedAccount> {
        self.accounts.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_lookup() {
        let account = LinkedAccount::new("acct-1", "p-1", App::GitHub)
            .with_credential("access_token", "gho_abc");
        assert_eq!(account.credential("access_token").unwrap(), "gho_abc");
        assert!(matches!(
            account.credential("refresh_token"),
            Err(ConnectorError::Permanent(_))
        ));
    }

    #[test]
    fn test_memory_store_insert_and_get() {
        let store = MemoryAccountStore::new();
        store.insert(LinkedAccount::new("acct-1", "p-1", App::Shopify));
        assert!(store.get("acct-1").is_some());
        assert!(store.get("acct-2").is_none());
    }

    #[test]
    fn test_accounts_deserialize_from_json() {
        let accounts: Vec<LinkedAccount> = serde_json::from_str(
            r#"[{
                "id": "acct-1",
                "project_id": "p-1",
                "app": "SHOPIFY",
                "credentials": {"access_token": "shpat_x", "shop_domain": "demo.myshopify.com"}
            }]"#,
        )
        .unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0].app, App::Shopify);
        assert_eq!(accounts[0].credential("shop_domain").unwrap(), "demo.myshopify.com");
    }
}
