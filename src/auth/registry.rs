//! Registered clients and their one-time authorization codes.

use super::storage::{KeyValueStore, StorageError};
use super::traits::{CodeChallengeMethod, GrantType};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

const CLIENTS: &str = "clients";
const CODES: &str = "codes";

/// boot out codes older than 10 mins unless told otherwise
pub const DEFAULT_CODE_TTL_SECS: i64 = 600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub client_id: String,
    pub client_secret: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<GrantType>,
    pub registration_access_token: String,
    pub created_at: DateTime<Utc>,
}

impl Client {
    /// exact string match, no normalisation of trailing slashes etc
    pub fn allows_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// None means the client didn't use PKCE for this request
    pub code_challenge: Option<String>,
    pub code_challenge_method: CodeChallengeMethod,
    pub scope: String,
    pub created_at: DateTime<Utc>,
    pub used: bool,
}

impl AuthorizationCode {
    fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at >= ttl
    }
}

/// Everything needed to mint a code once the user approves.
#[derive(Debug, Clone)]
pub struct CodeGrant {
    pub client_id: String,
    pub redirect_uri: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: CodeChallengeMethod,
    pub scope: String,
}

/// 32 bytes of randomness, base64url encoded
pub fn generate_secret() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

pub struct ClientRegistry {
    store: Arc<dyn KeyValueStore>,
    code_ttl: Duration,
}

impl ClientRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, code_ttl: Duration) -> Self {
        Self { store, code_ttl }
    }

    pub fn register(
        &self,
        client_name: String,
        redirect_uris: Vec<String>,
        grant_types: Vec<GrantType>,
    ) -> Result<Client, StorageError> {
        let client = Client {
            client_id: Uuid::new_v4().to_string(),
            client_secret: generate_secret(),
            client_name,
            redirect_uris,
            grant_types,
            registration_access_token: generate_secret(),
            created_at: Utc::now(),
        };

        self.store
            .put(CLIENTS, &client.client_id, serde_json::to_value(&client)?)?;

        tracing::info!(
            "Registered client '{}' ({})",
            client.client_name,
            client.client_id
        );
        Ok(client)
    }

    pub fn lookup(&self, client_id: &str) -> Option<Client> {
        let value = self.store.get(CLIENTS, client_id)?;
        decode(value, "client", client_id)
    }

    /// false for unknown clients too, callers can't tell the difference
    pub fn validate_credentials(&self, client_id: &str, client_secret: &str) -> bool {
        let Some(client) = self.lookup(client_id) else {
            tracing::warn!("Credentials presented for unknown client_id: {}", client_id);
            return false;
        };

        // Constant-time comparison to prevent timing attacks
        let matches: bool = client_secret
            .as_bytes()
            .ct_eq(client.client_secret.as_bytes())
            .into();
        if !matches {
            tracing::warn!("Invalid client secret for client_id: {}", client_id);
        }
        matches
    }

    pub fn delete(&self, client_id: &str) -> Result<bool, StorageError> {
        let removed = self.store.delete(CLIENTS, client_id)?;
        if removed {
            tracing::info!("Deleted client {}", client_id);
        }
        Ok(removed)
    }

    pub fn store_code(&self, code: &str, grant: CodeGrant) -> Result<AuthorizationCode, StorageError> {
        // opportunistic cleanup keeps the store from growing unbounded
        self.purge_expired_codes()?;

        let auth_code = AuthorizationCode {
            code: code.to_string(),
            client_id: grant.client_id,
            redirect_uri: grant.redirect_uri,
            code_challenge: grant.code_challenge,
            code_challenge_method: grant.code_challenge_method,
            scope: grant.scope,
            created_at: Utc::now(),
            used: false,
        };
        self.store.put(CODES, code, serde_json::to_value(&auth_code)?)?;
        Ok(auth_code)
    }

    /// Marks the code used and hands it back, at most once per code. Unknown,
    /// used and expired codes all come back as `None`.
    pub fn consume_code(&self, code: &str) -> Result<Option<AuthorizationCode>, StorageError> {
        let Some(current) = self.store.get(CODES, code) else {
            return Ok(None);
        };
        let Some(auth_code) = decode::<AuthorizationCode>(current.clone(), "code", code) else {
            return Ok(None);
        };

        if auth_code.used {
            tracing::warn!("Authorization code replayed for client {}", auth_code.client_id);
            return Ok(None);
        }
        if auth_code.is_expired(self.code_ttl, Utc::now()) {
            tracing::warn!("Authorization code expired for client {}", auth_code.client_id);
            return Ok(None);
        }

        let consumed = AuthorizationCode {
            used: true,
            ..auth_code
        };
        // lost the race if somebody flipped `used` between our read and now
        if self
            .store
            .compare_and_swap(CODES, code, &current, serde_json::to_value(&consumed)?)?
        {
            Ok(Some(consumed))
        } else {
            Ok(None)
        }
    }

    pub fn purge_expired_codes(&self) -> Result<usize, StorageError> {
        let ttl = self.code_ttl;
        let now = Utc::now();
        let dropped = self.store.retain(CODES, &|value| {
            serde_json::from_value::<AuthorizationCode>(value.clone())
                .is_ok_and(|c| !c.used && !c.is_expired(ttl, now))
        })?;
        if dropped > 0 {
            tracing::debug!("cleaned up {} used or expired authorization codes", dropped);
        }
        Ok(dropped)
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, kind: &str, key: &str) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::error!("Stored {} '{}' is unreadable: {}", kind, key, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::storage::JsonFileStore;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn registry() -> ClientRegistry {
        ClientRegistry::new(
            Arc::new(JsonFileStore::in_memory()),
            Duration::seconds(DEFAULT_CODE_TTL_SECS),
        )
    }

    fn grant(client_id: &str) -> CodeGrant {
        CodeGrant {
            client_id: client_id.to_string(),
            redirect_uri: "http://x/cb".to_string(),
            code_challenge: None,
            code_challenge_method: CodeChallengeMethod::Plain,
            scope: "mcp:tools".to_string(),
        }
    }

    #[test]
    fn test_register_generates_unique_ids() {
        let registry = registry();
        let mut ids = HashSet::new();

        for i in 0..20 {
            let client = registry
                .register(format!("client {i}"), vec![], vec![GrantType::ClientCredentials])
                .unwrap();
            assert!(ids.insert(client.client_id.clone()));
            assert_ne!(client.client_secret, client.registration_access_token);
            assert_eq!(registry.lookup(&client.client_id), Some(client));
        }
    }

    #[test]
    fn test_lookup_unknown_client() {
        assert!(registry().lookup("nope").is_none());
    }

    #[test]
    fn test_validate_credentials() {
        let registry = registry();
        let client = registry
            .register("c".into(), vec![], vec![GrantType::ClientCredentials])
            .unwrap();

        assert!(registry.validate_credentials(&client.client_id, &client.client_secret));
        assert!(!registry.validate_credentials(&client.client_id, "wrong"));
        assert!(!registry.validate_credentials(&client.client_id, ""));
        assert!(!registry.validate_credentials("unknown", &client.client_secret));
    }

    #[test]
    fn test_redirect_uri_is_exact_match() {
        let registry = registry();
        let client = registry
            .register(
                "c".into(),
                vec!["http://x/cb".into()],
                vec![GrantType::AuthorizationCode],
            )
            .unwrap();

        assert!(client.allows_redirect_uri("http://x/cb"));
        assert!(!client.allows_redirect_uri("http://x/cb/"));
        assert!(!client.allows_redirect_uri("http://X/cb"));
        assert!(!client.allows_redirect_uri("http://x/cb?extra=1"));
    }

    #[test]
    fn test_code_consumed_once() {
        let registry = registry();
        registry.store_code("abc", grant("client")).unwrap();

        let first = registry.consume_code("abc").unwrap().unwrap();
        assert!(first.used);
        assert_eq!(first.client_id, "client");
        assert!(registry.consume_code("abc").unwrap().is_none());
        assert!(registry.consume_code("abc").unwrap().is_none());
    }

    #[test]
    fn test_unknown_code() {
        assert!(registry().consume_code("missing").unwrap().is_none());
    }

    #[test]
    fn test_expired_code_rejected() {
        let registry = ClientRegistry::new(Arc::new(JsonFileStore::in_memory()), Duration::zero());
        registry.store_code("abc", grant("client")).unwrap();
        assert!(registry.consume_code("abc").unwrap().is_none());
    }

    #[test]
    fn test_concurrent_consume_has_single_winner() {
        let registry = Arc::new(registry());

        for round in 0..10 {
            let code = format!("code-{round}");
            registry.store_code(&code, grant("client")).unwrap();

            let winners: usize = std::thread::scope(|s| {
                let handles: Vec<_> = (0..8)
                    .map(|_| s.spawn(|| registry.consume_code(&code).unwrap().is_some()))
                    .collect();
                handles
                    .into_iter()
                    .map(|h| usize::from(h.join().unwrap()))
                    .sum()
            });
            assert_eq!(winners, 1);
        }
    }

    #[test]
    fn test_purge_drops_used_codes() {
        let registry = registry();
        registry.store_code("a", grant("client")).unwrap();
        registry.store_code("b", grant("client")).unwrap();
        registry.consume_code("a").unwrap();

        assert_eq!(registry.purge_expired_codes().unwrap(), 1);
        assert!(registry.consume_code("b").unwrap().is_some());
    }

    #[test]
    fn test_delete_client() {
        let registry = registry();
        let client = registry
            .register("c".into(), vec![], vec![GrantType::ClientCredentials])
            .unwrap();

        assert!(registry.delete(&client.client_id).unwrap());
        assert!(registry.lookup(&client.client_id).is_none());
        assert!(!registry.delete(&client.client_id).unwrap());
    }

    #[test]
    fn test_clients_and_codes_survive_restart() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("oauth_clients.json");
        let ttl = Duration::seconds(DEFAULT_CODE_TTL_SECS);

        let client = {
            let registry =
                ClientRegistry::new(Arc::new(JsonFileStore::open(&path).unwrap()), ttl);
            registry.store_code("abc", grant("client")).unwrap();
            registry
                .register("c".into(), vec![], vec![GrantType::ClientCredentials])
                .unwrap()
        };

        let registry = ClientRegistry::new(Arc::new(JsonFileStore::open(&path).unwrap()), ttl);
        assert_eq!(registry.lookup(&client.client_id), Some(client));
        assert!(registry.consume_code("abc").unwrap().is_some());
    }
}
