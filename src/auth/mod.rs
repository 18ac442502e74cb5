mod authorize;
mod error;
mod handlers;
mod keys;
mod middleware;
mod pkce;
mod registry;
mod storage;
mod token;
mod traits;

pub use handlers::OAuthAppState;
pub use keys::{DEFAULT_KEY_BITS, DEFAULT_KID};
pub use middleware::{AuthMiddlewareConfig, jwt_auth_middleware};
pub use pkce::generate_pair as generate_pkce_pair;
pub use registry::DEFAULT_CODE_TTL_SECS;
pub use token::JwksTokenValidator;
pub use traits::{Claims, TokenValidator};

use authorize::{authorize_approval_handler, authorize_handler};
use error::OAuthError;
use handlers::{
    client_configuration_handler, delete_client_handler, jwks_handler, metadata_handler,
    oauth_token_handler, protected_resource_metadata_handler, register_handler,
};
use keys::KeyManager;
use registry::ClientRegistry;
use storage::{JsonFileStore, KeyValueStore};
use token::{JwtTokenIssuer, TokenError};
use traits::{TokenIssuer, TokenResponse};

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use chrono::Duration;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_SCOPE: &str = "mcp:tools";

/// Configuration for the authorization server
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// Public base URL, used as `iss` and to build endpoint URLs
    pub issuer: String,
    pub audience: String,
    pub token_ttl: Duration,
    pub code_ttl: Duration,
    pub default_scope: String,
    /// None keeps clients and codes in memory only
    pub storage_path: Option<PathBuf>,
    pub key_dir: PathBuf,
    pub key_id: String,
    pub key_bits: usize,
}

/// Registry, keys and token issuing wired together. Built once at startup and
/// shared by every handler.
pub struct OAuthService {
    config: AuthConfig,
    registry: ClientRegistry,
    keys: Arc<KeyManager>,
    tokens: Arc<JwtTokenIssuer>,
}

impl OAuthService {
    /// Fails if the client store can't be opened or no signing key can be
    /// loaded or persisted. Either way the server shouldn't start.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = match &config.storage_path {
            Some(path) => Arc::new(
                JsonFileStore::open(path)
                    .with_context(|| format!("Failed to open client store {}", path.display()))?,
            ),
            None => {
                tracing::warn!("No storage path configured, registered clients won't survive a restart");
                Arc::new(JsonFileStore::in_memory())
            }
        };

        let keys = Arc::new(
            KeyManager::load_or_create(&config.key_dir, &config.key_id, config.key_bits)
                .context("Failed to load or create the signing key")?,
        );
        tracing::info!("Signing tokens with key '{}'", keys.active_kid());

        Ok(Self {
            registry: ClientRegistry::new(store, config.code_ttl),
            tokens: Arc::new(JwtTokenIssuer::new(keys.clone())),
            keys,
            config,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    /// Validator backed by our own key ring
    pub fn local_validator(&self) -> Arc<JwtTokenIssuer> {
        self.tokens.clone()
    }

    pub fn issue_token(&self, client_id: &str, scope: &str) -> Result<TokenResponse, OAuthError> {
        let access_token = self
            .tokens
            .issue(
                client_id,
                &self.config.issuer,
                &self.config.audience,
                scope,
                self.config.token_ttl,
            )
            .map_err(|e| {
                tracing::error!("Failed to issue token: {}", e);
                OAuthError::ServerError("Failed to issue token".to_string())
            })?;

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.token_ttl.num_seconds().max(0) as u64,
            scope: scope.to_string(),
        })
    }

    /// Swaps in a fresh signing key. RSA keygen is CPU bound, so it runs on
    /// the blocking pool rather than an async worker.
    pub async fn rotate_signing_key(&self, kid: &str) -> Result<()> {
        let keys = self.keys.clone();
        let new_kid = kid.to_string();
        tokio::task::spawn_blocking(move || keys.rotate(&new_kid))
            .await
            .context("Key rotation task panicked")?
            .with_context(|| format!("Failed to rotate to key '{}'", kid))?;
        tracing::info!("Rotated signing key, new kid {}", kid);
        Ok(())
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, TokenError> {
        self.tokens
            .verify(token, &self.config.issuer, &self.config.audience)
    }
}

/// `/token` and `/register*`, the endpoints that take credentials and deserve
/// the stricter rate limit.
pub fn credential_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route("/token", post(oauth_token_handler))
        .route("/register", post(register_handler))
        .route(
            "/register/{client_id}",
            get(client_configuration_handler).delete(delete_client_handler),
        )
        .with_state(state)
}

/// Discovery documents, the JWKS and the interactive authorize endpoint.
pub fn discovery_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata_handler),
        )
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata_handler),
        )
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route(
            "/authorize",
            get(authorize_handler).post(authorize_approval_handler),
        )
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use std::path::Path;
    use tower::ServiceExt;

    pub const BASE_URL: &str = "http://localhost:8000";

    pub fn test_config(dir: &Path) -> AuthConfig {
        AuthConfig {
            issuer: BASE_URL.to_string(),
            audience: "mcp-greeting-server".to_string(),
            token_ttl: Duration::hours(1),
            code_ttl: Duration::seconds(DEFAULT_CODE_TTL_SECS),
            default_scope: DEFAULT_SCOPE.to_string(),
            storage_path: Some(dir.join("oauth_clients.json")),
            key_dir: dir.join("keys"),
            key_id: DEFAULT_KID.to_string(),
            key_bits: DEFAULT_KEY_BITS,
        }
    }

    pub fn test_state(dir: &Path) -> OAuthAppState {
        OAuthAppState {
            oauth_service: Arc::new(OAuthService::new(test_config(dir)).unwrap()),
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn app(state: &OAuthAppState) -> Router {
        credential_routes(state.clone()).merge(discovery_routes(state.clone()))
    }

    pub async fn send(app: &Router, request: Request<Body>) -> Response {
        app.clone().oneshot(request).await.unwrap()
    }

    pub async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    pub async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    pub fn form_post(uri: &str, params: &[(&str, &str)]) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(serde_urlencoded::to_string(params).unwrap()))
            .unwrap()
    }

    pub fn json_post(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    pub fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }
}
