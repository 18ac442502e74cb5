use super::storage::StorageError;
use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OAuth 2.0 error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

/// Everything an endpoint can fail with, already mapped onto the OAuth error
/// codes. Descriptions are safe to show to the client.
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    InvalidClient(String),

    #[error("{0}")]
    InvalidGrant(String),

    #[error("{0}")]
    UnsupportedGrantType(String),

    #[error("{0}")]
    InvalidToken(String),

    #[error("{0}")]
    ServerError(String),
}

impl OAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            OAuthError::InvalidRequest(_) => "invalid_request",
            OAuthError::InvalidClient(_) => "invalid_client",
            OAuthError::InvalidGrant(_) => "invalid_grant",
            OAuthError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthError::InvalidToken(_) => "invalid_token",
            OAuthError::ServerError(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            OAuthError::InvalidRequest(_)
            | OAuthError::InvalidGrant(_)
            | OAuthError::UnsupportedGrantType(_) => StatusCode::BAD_REQUEST,
            OAuthError::InvalidClient(_) | OAuthError::InvalidToken(_) => StatusCode::UNAUTHORIZED,
            OAuthError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn missing(param: &str) -> Self {
        OAuthError::InvalidRequest(format!("Missing required parameter: {}", param))
    }
}

impl From<StorageError> for OAuthError {
    fn from(e: StorageError) -> Self {
        // the detail stays in the logs
        tracing::error!("storage failure: {}", e);
        OAuthError::ServerError("Failed to persist authorization state".to_string())
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.code().to_string(),
            error_description: Some(self.to_string()),
        };

        let mut response = (status, Json(body)).into_response();
        let headers = response.headers_mut();
        // token responses (errors included) must not be cached, RFC 6749 5.1
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        if let OAuthError::InvalidClient(_) = self {
            headers.insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"oauth\", error=\"invalid_client\""),
            );
        }
        response
    }
}
