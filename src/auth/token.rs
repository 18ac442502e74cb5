use super::keys::{JsonWebKeySet, KeyManager};
use super::traits::{Claims, TokenIssuer, TokenValidator};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode, decode_header, encode};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// seconds of clock drift tolerated on exp
const CLOCK_SKEW_LEEWAY_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("failed to sign token: {0}")]
    Signing(#[source] jsonwebtoken::errors::Error),

    /// Deliberately carries no detail. Bad signature, wrong audience, expiry
    /// and unknown kid all look the same to callers.
    #[error("unauthenticated")]
    Unauthenticated,

    #[error("failed to load key set: {0}")]
    KeySet(String),
}

pub struct JwtTokenIssuer {
    keys: Arc<KeyManager>,
}

impl JwtTokenIssuer {
    pub fn new(keys: Arc<KeyManager>) -> Self {
        Self { keys }
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(
        &self,
        client_id: &str,
        issuer: &str,
        audience: &str,
        scope: &str,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            iss: issuer.to_string(),
            sub: client_id.to_string(),
            aud: audience.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            scope: scope.to_string(),
            jti: Uuid::new_v4().to_string(),
        };

        self.keys.with_signing_key(|pair| {
            let mut header = Header::new(Algorithm::RS256);
            header.kid = Some(pair.kid().to_string());
            encode(&header, &claims, pair.encoding_key()).map_err(TokenError::Signing)
        })
    }
}

impl TokenValidator for JwtTokenIssuer {
    fn verify(&self, token: &str, issuer: &str, audience: &str) -> Result<Claims, TokenError> {
        verify_with(token, issuer, audience, |kid| self.keys.decoding_key(kid))
    }
}

/// Verifies tokens against a published JWKS document, rebuilding each key from
/// its `n`/`e` components. This is the resource server's view of the keys.
pub struct JwksTokenValidator {
    keys: HashMap<String, DecodingKey>,
}

impl JwksTokenValidator {
    pub fn from_key_set(set: &JsonWebKeySet) -> Result<Self, TokenError> {
        let mut keys = HashMap::new();
        for jwk in &set.keys {
            if jwk.kty != "RSA" {
                tracing::debug!("skipping non-RSA key '{}'", jwk.kid);
                continue;
            }
            let key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)
                .map_err(|e| TokenError::KeySet(format!("key '{}': {}", jwk.kid, e)))?;
            keys.insert(jwk.kid.clone(), key);
        }

        if keys.is_empty() {
            return Err(TokenError::KeySet("no usable RSA keys".to_string()));
        }
        Ok(Self { keys })
    }

    pub async fn fetch(jwks_uri: &str) -> Result<Self, TokenError> {
        let set: JsonWebKeySet = reqwest::get(jwks_uri)
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| TokenError::KeySet(e.to_string()))?
            .json()
            .await
            .map_err(|e| TokenError::KeySet(e.to_string()))?;

        tracing::info!("Fetched {} key(s) from {}", set.keys.len(), jwks_uri);
        Self::from_key_set(&set)
    }
}

impl TokenValidator for JwksTokenValidator {
    fn verify(&self, token: &str, issuer: &str, audience: &str) -> Result<Claims, TokenError> {
        verify_with(token, issuer, audience, |kid| self.keys.get(kid).cloned())
    }
}

fn verify_with(
    token: &str,
    issuer: &str,
    audience: &str,
    key_for: impl FnOnce(&str) -> Option<DecodingKey>,
) -> Result<Claims, TokenError> {
    let header = decode_header(token).map_err(|e| {
        tracing::debug!("malformed token header: {}", e);
        TokenError::Unauthenticated
    })?;

    let Some(kid) = header.kid else {
        tracing::debug!("token has no kid");
        return Err(TokenError::Unauthenticated);
    };
    let Some(key) = key_for(&kid) else {
        tracing::debug!("token signed with unknown kid '{}'", kid);
        return Err(TokenError::Unauthenticated);
    };

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
    validation.leeway = CLOCK_SKEW_LEEWAY_SECS;

    let token_data = decode::<Claims>(token, &key, &validation).map_err(|e| {
        tracing::debug!("token rejected: {}", e);
        TokenError::Unauthenticated
    })?;

    // leeway must not revive a token that was minted without any lifetime
    if token_data.claims.exp <= token_data.claims.iat {
        tracing::debug!("token has no lifetime (exp <= iat)");
        return Err(TokenError::Unauthenticated);
    }

    Ok(token_data.claims)
}
