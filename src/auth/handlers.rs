use super::error::OAuthError;
use super::pkce;
use super::registry::Client;
use super::traits::{GrantType, TokenResponse};
use super::{DEFAULT_SCOPE, OAuthService};
use axum::{
    Form,
    extract::{
        Path, State,
        rejection::{FormRejection, JsonRejection},
    },
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use url::Url;

/// Combined OAuth state for all handlers
#[derive(Clone)]
pub struct OAuthAppState {
    pub oauth_service: Arc<OAuthService>,
    pub base_url: String,
}

/// OAuth 2.0 token request (supports both grant types)
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    /// Kept as a string so unknown values become `unsupported_grant_type`
    /// rather than a form rejection
    pub grant_type: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    /// Authorization code (authorization_code grant)
    pub code: Option<String>,
    /// PKCE code verifier (authorization_code grant, if a challenge was sent)
    pub code_verifier: Option<String>,
    /// Must match the one from the authorization request
    pub redirect_uri: Option<String>,
    /// Requested scope (client_credentials grant)
    pub scope: Option<String>,
}

/// Empty form fields count as missing
fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, OAuthError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::missing(name))
}

/// Handler for POST /token
pub async fn oauth_token_handler(
    State(state): State<OAuthAppState>,
    form: Result<Form<TokenRequest>, FormRejection>,
) -> Response {
    let Form(req) = match form {
        Ok(form) => form,
        Err(e) => {
            return OAuthError::InvalidRequest(format!("Malformed token request: {}", e))
                .into_response();
        }
    };

    tracing::info!("Token request: grant_type={:?}", req.grant_type);

    let result = required(&req.grant_type, "grant_type").and_then(|grant_type| {
        match grant_type.parse::<GrantType>() {
            Ok(GrantType::AuthorizationCode) => handle_authorization_code_grant(&state, &req),
            Ok(GrantType::ClientCredentials) => handle_client_credentials_grant(&state, &req),
            Err(e) => Err(OAuthError::UnsupportedGrantType(e)),
        }
    });

    match result {
        Ok(token_response) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, HeaderValue::from_static("no-store"))],
            Json(token_response),
        )
            .into_response(),
        Err(e) => {
            tracing::warn!("Token request rejected: {} ({})", e.code(), e);
            e.into_response()
        }
    }
}

fn authenticate_client<'a>(
    service: &OAuthService,
    req: &'a TokenRequest,
) -> Result<&'a str, OAuthError> {
    let client_id = required(&req.client_id, "client_id")?;
    let client_secret = required(&req.client_secret, "client_secret")?;

    if service
        .registry()
        .validate_credentials(client_id, client_secret)
    {
        Ok(client_id)
    } else {
        // Don't leak information about why validation failed
        Err(OAuthError::InvalidClient(
            "Client authentication failed".to_string(),
        ))
    }
}

fn handle_authorization_code_grant(
    state: &OAuthAppState,
    req: &TokenRequest,
) -> Result<TokenResponse, OAuthError> {
    let service = &state.oauth_service;

    let code = required(&req.code, "code")?;
    let redirect_uri = required(&req.redirect_uri, "redirect_uri")?;
    let client_id = authenticate_client(service, req)?;

    // consumed before the remaining checks, so a bad verifier still burns the code
    let auth_code = service.registry().consume_code(code)?.ok_or_else(|| {
        OAuthError::InvalidGrant("Invalid or expired authorization code".to_string())
    })?;

    if auth_code.client_id != client_id {
        tracing::warn!(
            "client {} tried to redeem a code issued to {}",
            client_id,
            auth_code.client_id
        );
        return Err(OAuthError::InvalidGrant(
            "Invalid or expired authorization code".to_string(),
        ));
    }

    if redirect_uri != auth_code.redirect_uri {
        tracing::warn!(
            "redirect_uri mismatch for client {}: expected '{}', got '{}'",
            client_id,
            auth_code.redirect_uri,
            redirect_uri
        );
        return Err(OAuthError::InvalidGrant("redirect_uri mismatch".to_string()));
    }

    // no challenge stored means the client opted out of PKCE for this code;
    // it has still authenticated with its secret above
    if let Some(challenge) = &auth_code.code_challenge {
        let verifier = required(&req.code_verifier, "code_verifier")
            .map_err(|_| OAuthError::InvalidGrant("code_verifier required".to_string()))?;
        if !pkce::verify(verifier, challenge, auth_code.code_challenge_method) {
            tracing::warn!("PKCE verification failed for client {}", client_id);
            return Err(OAuthError::InvalidGrant(
                "PKCE verification failed".to_string(),
            ));
        }
    }

    let token = service.issue_token(client_id, &auth_code.scope)?;
    tracing::info!(
        "Issued OAuth token via authorization_code for client: {}",
        client_id
    );
    Ok(token)
}

fn handle_client_credentials_grant(
    state: &OAuthAppState,
    req: &TokenRequest,
) -> Result<TokenResponse, OAuthError> {
    let service = &state.oauth_service;
    let client_id = authenticate_client(service, req)?;

    let scope = req
        .scope
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(service.config().default_scope.as_str());

    let token = service.issue_token(client_id, scope)?;
    tracing::info!(
        "Issued OAuth token via client_credentials for client: {}",
        client_id
    );
    Ok(token)
}

/// JSON Web Key Set - what resource servers use to check our signatures
pub async fn jwks_handler(State(state): State<OAuthAppState>) -> Response {
    (StatusCode::OK, Json(state.oauth_service.keys().jwks())).into_response()
}

/// Protected resource metadata (RFC 9728) - tells clients where to authenticate
#[derive(Debug, Serialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
}

/// First thing MCP clients hit to figure out how to auth
pub async fn protected_resource_metadata_handler(State(state): State<OAuthAppState>) -> Response {
    let metadata = ProtectedResourceMetadata {
        resource: state.base_url.clone(),
        authorization_servers: vec![state.base_url], // we're our own auth server
    };
    (StatusCode::OK, Json(metadata)).into_response()
}

/// Auth server metadata (RFC 8414)
#[derive(Debug, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub registration_endpoint: String,
    pub jwks_uri: String,
    pub response_types_supported: Vec<String>,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub code_challenge_methods_supported: Vec<String>,
}

/// Tells clients what auth methods we support
pub async fn metadata_handler(State(state): State<OAuthAppState>) -> Response {
    let base_url = &state.base_url;
    let metadata = AuthorizationServerMetadata {
        issuer: state.oauth_service.config().issuer.clone(),
        authorization_endpoint: format!("{}/authorize", base_url),
        token_endpoint: format!("{}/token", base_url),
        registration_endpoint: format!("{}/register", base_url),
        jwks_uri: format!("{}/.well-known/jwks.json", base_url),
        response_types_supported: vec!["code".to_string()],
        grant_types_supported: vec![
            GrantType::AuthorizationCode.to_string(),
            GrantType::ClientCredentials.to_string(),
        ],
        token_endpoint_auth_methods_supported: vec![CLIENT_SECRET_POST.to_string()],
        scopes_supported: vec![DEFAULT_SCOPE.to_string()],
        code_challenge_methods_supported: vec!["S256".to_string(), "plain".to_string()],
    };

    tracing::debug!("Serving authorization server metadata");

    let mut headers = HeaderMap::new();
    headers.insert("mcp-protocol-version", HeaderValue::from_static("2025-06-18"));

    (StatusCode::OK, headers, Json(metadata)).into_response()
}

const CLIENT_SECRET_POST: &str = "client_secret_post";

/// Dynamic Client Registration Request (RFC 7591)
#[derive(Debug, Deserialize)]
pub struct ClientRegistrationRequest {
    pub client_name: String,
    pub redirect_uris: Option<Vec<String>>,
    pub grant_types: Option<Vec<String>>,
    pub token_endpoint_auth_method: Option<String>,
    /// accepted for compatibility, every client gets the default scope set
    pub scope: Option<String>,
}

/// Dynamic Client Registration Response (RFC 7591)
#[derive(Debug, Serialize)]
pub struct ClientRegistrationResponse {
    pub client_id: String,
    pub client_secret: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<GrantType>,
    pub token_endpoint_auth_method: String,
    pub registration_access_token: String,
    pub registration_client_uri: String,
    pub client_id_issued_at: i64,
    pub client_secret_expires_at: i64,
}

/// Client configuration (RFC 7592 read), secrets left out
#[derive(Debug, Serialize)]
pub struct ClientConfigurationResponse {
    pub client_id: String,
    pub client_name: String,
    pub redirect_uris: Vec<String>,
    pub grant_types: Vec<GrantType>,
    pub token_endpoint_auth_method: String,
    pub registration_client_uri: String,
    pub client_id_issued_at: i64,
}

fn registration_client_uri(base_url: &str, client_id: &str) -> String {
    format!("{}/register/{}", base_url, client_id)
}

/// reject anything that isn't an absolute URL, plus script-y schemes
fn validate_redirect_uri(uri: &str) -> Result<(), String> {
    let parsed =
        Url::parse(uri).map_err(|_| format!("invalid redirect_uri '{}': not an absolute URL", uri))?;

    match parsed.scheme() {
        scheme @ ("javascript" | "data" | "vbscript") => Err(format!(
            "invalid redirect_uri '{}': {} scheme not allowed",
            uri, scheme
        )),
        _ => Ok(()),
    }
}

fn validate_registration(
    req: &ClientRegistrationRequest,
) -> Result<(Vec<String>, Vec<GrantType>), OAuthError> {
    if req.client_name.trim().is_empty() {
        return Err(OAuthError::InvalidRequest(
            "client_name must not be empty".to_string(),
        ));
    }

    let redirect_uris = req.redirect_uris.clone().unwrap_or_default();
    for uri in &redirect_uris {
        validate_redirect_uri(uri).map_err(OAuthError::InvalidRequest)?;
    }

    let grant_types = match &req.grant_types {
        Some(types) if !types.is_empty() => types
            .iter()
            .map(|t| t.parse::<GrantType>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(OAuthError::InvalidRequest)?,
        _ => vec![GrantType::ClientCredentials],
    };

    if grant_types.contains(&GrantType::AuthorizationCode) && redirect_uris.is_empty() {
        return Err(OAuthError::InvalidRequest(
            "authorization_code clients must register at least one redirect_uri".to_string(),
        ));
    }

    if let Some(method) = &req.token_endpoint_auth_method {
        if method != CLIENT_SECRET_POST {
            return Err(OAuthError::InvalidRequest(format!(
                "unsupported token_endpoint_auth_method '{}'",
                method
            )));
        }
    }

    Ok((redirect_uris, grant_types))
}

/// Dynamic client registration (RFC 7591)
pub async fn register_handler(
    State(state): State<OAuthAppState>,
    body: Result<Json<ClientRegistrationRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => {
            return OAuthError::InvalidRequest(format!("Malformed registration request: {}", e))
                .into_response();
        }
    };

    tracing::info!(
        "dynamic client registration request: client_name={:?}, grant_types={:?}, redirect_uris={:?}, scope={:?}",
        req.client_name,
        req.grant_types,
        req.redirect_uris,
        req.scope
    );

    let (redirect_uris, grant_types) = match validate_registration(&req) {
        Ok(validated) => validated,
        Err(e) => return e.into_response(),
    };

    let client = match state.oauth_service.registry().register(
        req.client_name,
        redirect_uris,
        grant_types,
    ) {
        Ok(client) => client,
        Err(e) => return OAuthError::from(e).into_response(),
    };

    let response = ClientRegistrationResponse {
        registration_client_uri: registration_client_uri(&state.base_url, &client.client_id),
        client_id: client.client_id,
        client_secret: client.client_secret,
        client_name: client.client_name,
        redirect_uris: client.redirect_uris,
        grant_types: client.grant_types,
        token_endpoint_auth_method: CLIENT_SECRET_POST.to_string(),
        registration_access_token: client.registration_access_token,
        client_id_issued_at: client.created_at.timestamp(),
        client_secret_expires_at: 0, // Never expires in this implementation
    };

    (StatusCode::CREATED, Json(response)).into_response()
}

/// Looks up the client and checks the bearer registration access token.
/// Unknown clients and bad tokens get the same answer.
fn authorize_management(
    service: &OAuthService,
    client_id: &str,
    headers: &HeaderMap,
) -> Result<Client, OAuthError> {
    let rejected = || OAuthError::InvalidToken("Invalid registration access token".to_string());

    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .ok_or_else(rejected)?;
    let client = service.registry().lookup(client_id).ok_or_else(rejected)?;

    let matches: bool = token
        .as_bytes()
        .ct_eq(client.registration_access_token.as_bytes())
        .into();
    if matches { Ok(client) } else { Err(rejected()) }
}

/// GET /register/{client_id} (RFC 7592)
pub async fn client_configuration_handler(
    State(state): State<OAuthAppState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    let client = match authorize_management(&state.oauth_service, &client_id, &headers) {
        Ok(client) => client,
        Err(e) => return e.into_response(),
    };

    let response = ClientConfigurationResponse {
        registration_client_uri: registration_client_uri(&state.base_url, &client.client_id),
        client_id: client.client_id,
        client_name: client.client_name,
        redirect_uris: client.redirect_uris,
        grant_types: client.grant_types,
        token_endpoint_auth_method: CLIENT_SECRET_POST.to_string(),
        client_id_issued_at: client.created_at.timestamp(),
    };
    (StatusCode::OK, Json(response)).into_response()
}

/// DELETE /register/{client_id} (RFC 7592)
pub async fn delete_client_handler(
    State(state): State<OAuthAppState>,
    Path(client_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = authorize_management(&state.oauth_service, &client_id, &headers) {
        return e.into_response();
    }

    match state.oauth_service.registry().delete(&client_id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => OAuthError::from(e).into_response(),
    }
}
