use super::token::TokenError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    ClientCredentials,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::ClientCredentials => "client_credentials",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "client_credentials" => Ok(GrantType::ClientCredentials),
            other => Err(format!("unsupported grant type '{}'", other)),
        }
    }
}

/// PKCE challenge method. Defaults to `plain` when a challenge arrives
/// without a method (RFC 7636 section 4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    S256,
    #[default]
    #[serde(rename = "plain")]
    Plain,
}

impl CodeChallengeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodeChallengeMethod::S256 => "S256",
            CodeChallengeMethod::Plain => "plain",
        }
    }
}

impl FromStr for CodeChallengeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "S256" => Ok(CodeChallengeMethod::S256),
            "plain" => Ok(CodeChallengeMethod::Plain),
            other => Err(format!("unsupported code_challenge_method '{}'", other)),
        }
    }
}

pub trait TokenIssuer {
    fn issue(
        &self,
        client_id: &str,
        issuer: &str,
        audience: &str,
        scope: &str,
        ttl: Duration,
    ) -> Result<String, TokenError>;
}

pub trait TokenValidator {
    /// Any failure is reported as the same opaque error.
    fn verify(&self, token: &str, issuer: &str, audience: &str) -> Result<Claims, TokenError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64, // seconds
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,   // Issuer
    pub sub: String,   // Subject (client_id)
    pub aud: String,   // Audience
    pub iat: i64,      // Issued at
    pub exp: i64,      // Expiration time
    pub scope: String, // Space separated scopes
    pub jti: String,   // JWT ID (unique identifier)
}
