//! OAuth client registry
//!
//! Clients live in the external store under a per-API prefix; issued
//! tokens are indexed per client in a sorted set scored by expiry.
//! Secret rotation regenerates the credential; a policy change on update
//! or rotation cascades into token invalidation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{GatewayError, Result};
use crate::headers::{oauth_prefix, OAUTH_CLIENT_PREFIX, OAUTH_CLIENT_TOKENS_PREFIX};
use crate::keys;
use crate::session::now_unix;
use crate::storage::KeyValueStore;

/// Tokens per listing page.
pub const TOKENS_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OAuthClient {
    pub client_id: String,
    pub secret: String,
    pub redirect_uri: String,
    pub policy_id: String,
    pub meta_data: serde_json::Value,
    pub description: String,
}

/// One issued token with its expiry (unix seconds; 0 = never).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientToken {
    pub token: String,
    pub expires: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPagination {
    pub page_size: usize,
    pub page_num: usize,
    pub page_total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedTokens {
    pub pagination: TokenPagination,
    pub tokens: Vec<ClientToken>,
}

/// Per-API OAuth client storage over the store handle.
pub struct OAuthClientRegistry {
    store: Arc<dyn KeyValueStore>,
    retain_period: i64,
}

impl OAuthClientRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, retain_period: i64) -> Self {
        Self {
            store,
            retain_period,
        }
    }

    fn client_key(api_id: &str, client_id: &str) -> String {
        format!("{}{}{}", oauth_prefix(api_id), OAUTH_CLIENT_PREFIX, client_id)
    }

    fn tokens_key(api_id: &str, client_id: &str) -> String {
        format!(
            "{}{}{}",
            oauth_prefix(api_id),
            OAUTH_CLIENT_TOKENS_PREFIX,
            client_id
        )
    }

    /// Persist a client under its API prefix.
    pub fn set_client(&self, api_id: &str, client: &OAuthClient) -> Result<()> {
        let raw = serde_json::to_string(client)?;
        self.store
            .set_key(&Self::client_key(api_id, &client.client_id), &raw, 0)
            .map_err(|e| GatewayError::PersistenceFailure(e.to_string()))
    }

    pub fn get_client(&self, api_id: &str, client_id: &str) -> Result<OAuthClient> {
        let raw = self
            .store
            .get_key(&Self::client_key(api_id, client_id))
            .map_err(|_| GatewayError::NotFound("OAuth Client ID not found".to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn list_clients(&self, api_id: &str) -> Result<Vec<OAuthClient>> {
        let prefix = format!("{}{}", oauth_prefix(api_id), OAUTH_CLIENT_PREFIX);
        let mut clients = Vec::new();
        for key in self.store.get_keys(&prefix) {
            if let Ok(raw) = self.store.get_key(&key) {
                if let Ok(client) = serde_json::from_str(&raw) {
                    clients.push(client);
                }
            }
        }
        Ok(clients)
    }

    /// Delete a client and its token index.
    pub fn delete_client(&self, api_id: &str, client_id: &str) -> Result<()> {
        if !self.store.delete_key(&Self::client_key(api_id, client_id)) {
            return Err(GatewayError::NotFound("OAuth Client ID not found".to_string()));
        }
        let tokens_key = Self::tokens_key(api_id, client_id);
        self.store
            .remove_sorted_set_range(&tokens_key, f64::MIN, f64::MAX);
        Ok(())
    }

    /// Record an issued token against its client.
    pub fn store_token(&self, api_id: &str, client_id: &str, token: &str, expires: i64) {
        self.store
            .add_to_sorted_set(&Self::tokens_key(api_id, client_id), token, expires as f64);
    }

    /// Tokens still live for a client (expired entries are retained for
    /// `retain_period` seconds but not listed).
    pub fn get_client_tokens(&self, api_id: &str, client_id: &str) -> Vec<ClientToken> {
        let (tokens, scores) = self.store.sorted_set_range(
            &Self::tokens_key(api_id, client_id),
            now_unix() as f64,
            f64::MAX,
        );
        tokens
            .into_iter()
            .zip(scores)
            .map(|(token, score)| ClientToken {
                token,
                expires: score as i64,
            })
            .collect()
    }

    /// Paginated token listing; pages are 1-based and clamp to range.
    pub fn get_paginated_client_tokens(
        &self,
        api_id: &str,
        client_id: &str,
        page: usize,
    ) -> PaginatedTokens {
        let all = self.get_client_tokens(api_id, client_id);
        let page_total = all.len().div_ceil(TOKENS_PAGE_SIZE).max(1);
        let page_num = page.clamp(1, page_total);
        let start = (page_num - 1) * TOKENS_PAGE_SIZE;
        let tokens = all
            .into_iter()
            .skip(start)
            .take(TOKENS_PAGE_SIZE)
            .collect();
        PaginatedTokens {
            pagination: TokenPagination {
                page_size: TOKENS_PAGE_SIZE,
                page_num,
                page_total,
            },
            tokens,
        }
    }

    /// Remove one token's access.
    pub fn remove_access(&self, api_id: &str, client_id: &str, token: &str) -> bool {
        let tokens_key = Self::tokens_key(api_id, client_id);
        let (tokens, scores) = self.store.sorted_set_range(&tokens_key, f64::MIN, f64::MAX);
        let mut removed = false;
        for (member, score) in tokens.iter().zip(scores) {
            if member == token {
                self.store
                    .remove_sorted_set_range(&tokens_key, score, score);
                removed = true;
            }
        }
        removed
    }

    /// Revoke a single token by value, searching the API's clients.
    pub fn revoke_token(&self, api_id: &str, token: &str) -> bool {
        let clients = self.list_clients(api_id).unwrap_or_default();
        clients
            .iter()
            .any(|client| self.remove_access(api_id, &client.client_id, token))
    }

    /// Revoke every token of a client; the caller must present the
    /// client secret.
    pub fn revoke_all_tokens(&self, api_id: &str, client_id: &str, secret: &str) -> Result<usize> {
        let client = self.get_client(api_id, client_id)?;
        if client.secret != secret {
            return Err(GatewayError::ValidationFailed(
                "Client secret doesn't match".to_string(),
            ));
        }
        let removed = self
            .store
            .remove_sorted_set_range(&Self::tokens_key(api_id, client_id), f64::MIN, f64::MAX);
        Ok(removed)
    }

    /// Purge token records that lapsed before the retain window.
    pub fn purge_lapsed_tokens(&self, api_ids: &[String]) -> usize {
        let cutoff = (now_unix() - self.retain_period) as f64;
        let mut purged = 0;
        for api_id in api_ids {
            let prefix = format!("{}{}", oauth_prefix(api_id), OAUTH_CLIENT_PREFIX);
            for key in self.store.get_keys(&prefix) {
                let client_id = key
                    .rsplit(OAUTH_CLIENT_PREFIX)
                    .next()
                    .unwrap_or_default()
                    .to_string();
                purged += self.store.remove_sorted_set_range(
                    &Self::tokens_key(api_id, &client_id),
                    f64::MIN,
                    cutoff,
                );
            }
        }
        purged
    }

    /// Generate a new secret for a client, keeping every other field.
    /// A policy change cascades into token invalidation.
    pub fn rotate_client(&self, api_id: &str, client_id: &str) -> Result<OAuthClient> {
        let previous = self.get_client(api_id, client_id)?;
        let updated = OAuthClient {
            secret: keys::generate_client_secret(),
            ..previous.clone()
        };
        self.set_client(api_id, &updated)?;
        self.invalidate_tokens_on_policy_change(api_id, &previous, &updated);
        Ok(updated)
    }

    /// Update a client's mutable fields; secret and ID are kept.
    pub fn update_client(
        &self,
        api_id: &str,
        client_id: &str,
        redirect_uri: String,
        policy_id: String,
        meta_data: serde_json::Value,
        description: String,
    ) -> Result<OAuthClient> {
        let previous = self.get_client(api_id, client_id)?;
        let updated = OAuthClient {
            client_id: previous.client_id.clone(),
            secret: previous.secret.clone(),
            redirect_uri,
            policy_id,
            meta_data,
            description,
        };
        self.set_client(api_id, &updated)?;
        self.invalidate_tokens_on_policy_change(api_id, &previous, &updated);
        Ok(updated)
    }

    fn invalidate_tokens_on_policy_change(
        &self,
        api_id: &str,
        previous: &OAuthClient,
        updated: &OAuthClient,
    ) {
        if previous.policy_id.is_empty() || previous.policy_id == updated.policy_id {
            return;
        }
        for token in self.get_client_tokens(api_id, &updated.client_id) {
            if !self.remove_access(api_id, &updated.client_id, &token.token) {
                tracing::warn!(
                    client_id = updated.client_id,
                    "Could not remove token for updated OAuth client policy"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    fn registry() -> OAuthClientRegistry {
        OAuthClientRegistry::new(Arc::new(InMemoryStore::new()), 0)
    }

    fn client(id: &str, policy: &str) -> OAuthClient {
        OAuthClient {
            client_id: id.to_string(),
            secret: "s3cret".to_string(),
            redirect_uri: "https://app.example.com/cb".to_string(),
            policy_id: policy.to_string(),
            meta_data: serde_json::json!({"team": "payments"}),
            description: "test client".to_string(),
        }
    }

    // --- CRUD ---

    #[test]
    fn test_client_crud() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();

        let fetched = reg.get_client("api", "c1").unwrap();
        assert_eq!(fetched, client("c1", "pol"));

        // per-API isolation
        assert!(reg.get_client("other-api", "c1").is_err());

        reg.set_client("api", &client("c2", "pol")).unwrap();
        assert_eq!(reg.list_clients("api").unwrap().len(), 2);

        reg.delete_client("api", "c1").unwrap();
        assert!(reg.get_client("api", "c1").is_err());
        assert!(reg.delete_client("api", "c1").is_err());
    }

    // --- Tokens ---

    #[test]
    fn test_token_listing_skips_expired() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();
        reg.store_token("api", "c1", "live", now_unix() + 600);
        reg.store_token("api", "c1", "dead", now_unix() - 600);

        let tokens = reg.get_client_tokens("api", "c1");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token, "live");
    }

    #[test]
    fn test_paginated_tokens() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();
        for i in 0..250 {
            reg.store_token("api", "c1", &format!("t{:03}", i), now_unix() + 600 + i);
        }

        let page1 = reg.get_paginated_client_tokens("api", "c1", 1);
        assert_eq!(page1.pagination.page_size, 100);
        assert_eq!(page1.pagination.page_total, 3);
        assert_eq!(page1.tokens.len(), 100);

        let page3 = reg.get_paginated_client_tokens("api", "c1", 3);
        assert_eq!(page3.tokens.len(), 50);

        // out-of-range pages clamp
        let clamped = reg.get_paginated_client_tokens("api", "c1", 99);
        assert_eq!(clamped.pagination.page_num, 3);

        let empty = registry().get_paginated_client_tokens("api", "none", 1);
        assert_eq!(empty.pagination.page_total, 1);
        assert!(empty.tokens.is_empty());
    }

    // --- Rotation ---

    #[test]
    fn test_rotation_without_policy_change_keeps_tokens() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();
        reg.store_token("api", "c1", "tok", now_unix() + 600);

        let rotated = reg.rotate_client("api", "c1").unwrap();
        assert_ne!(rotated.secret, "s3cret");
        assert_eq!(rotated.policy_id, "pol");
        assert_eq!(reg.get_client_tokens("api", "c1").len(), 1);
    }

    #[test]
    fn test_policy_change_invalidates_tokens() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol-a")).unwrap();
        reg.store_token("api", "c1", "tok1", now_unix() + 600);
        reg.store_token("api", "c1", "tok2", now_unix() + 700);

        reg.update_client(
            "api",
            "c1",
            "https://app.example.com/cb".to_string(),
            "pol-b".to_string(),
            serde_json::Value::Null,
            String::new(),
        )
        .unwrap();

        assert!(reg.get_client_tokens("api", "c1").is_empty());
        let updated = reg.get_client("api", "c1").unwrap();
        assert_eq!(updated.policy_id, "pol-b");
        assert_eq!(updated.secret, "s3cret");
    }

    #[test]
    fn test_update_same_policy_keeps_tokens() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();
        reg.store_token("api", "c1", "tok1", now_unix() + 600);

        reg.update_client(
            "api",
            "c1",
            "https://new.example.com/cb".to_string(),
            "pol".to_string(),
            serde_json::Value::Null,
            "updated".to_string(),
        )
        .unwrap();

        assert_eq!(reg.get_client_tokens("api", "c1").len(), 1);
        assert_eq!(
            reg.get_client("api", "c1").unwrap().redirect_uri,
            "https://new.example.com/cb"
        );
    }

    // --- Revocation ---

    #[test]
    fn test_revoke_single_token() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();
        reg.store_token("api", "c1", "tok1", now_unix() + 600);
        reg.store_token("api", "c1", "tok2", now_unix() + 600);

        assert!(reg.revoke_token("api", "tok1"));
        assert!(!reg.revoke_token("api", "tok1"));
        assert_eq!(reg.get_client_tokens("api", "c1").len(), 1);
    }

    #[test]
    fn test_revoke_all_requires_secret() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();
        reg.store_token("api", "c1", "tok1", now_unix() + 600);

        assert!(reg.revoke_all_tokens("api", "c1", "wrong").is_err());
        assert_eq!(reg.revoke_all_tokens("api", "c1", "s3cret").unwrap(), 1);
        assert!(reg.get_client_tokens("api", "c1").is_empty());
    }

    #[test]
    fn test_purge_lapsed_tokens() {
        let reg = registry();
        reg.set_client("api", &client("c1", "pol")).unwrap();
        reg.store_token("api", "c1", "old", now_unix() - 1000);
        reg.store_token("api", "c1", "new", now_unix() + 1000);

        let purged = reg.purge_lapsed_tokens(&["api".to_string()]);
        assert_eq!(purged, 1);
        assert_eq!(reg.get_client_tokens("api", "c1").len(), 1);
    }
}
