use super::OAuthService;
use super::error::OAuthError;
use super::handlers::OAuthAppState;
use super::registry::{Client, CodeGrant, generate_secret};
use super::traits::CodeChallengeMethod;
use axum::{
    body::Bytes,
    extract::{Query, RawQuery, State, rejection::QueryRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use serde::Deserialize;

/// Parameters of an authorization request. Everything is optional here so
/// that missing values turn into proper OAuth errors instead of rejections.
#[derive(Debug, Default, Deserialize)]
pub struct AuthorizationRequest {
    pub response_type: Option<String>,
    pub client_id: Option<String>,
    pub redirect_uri: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub scope: Option<String>,
    /// "approve" or "deny", set by the consent form buttons
    pub decision: Option<String>,
}

impl AuthorizationRequest {
    /// Values present in `other` win
    fn merge(self, other: AuthorizationRequest) -> Self {
        Self {
            response_type: other.response_type.or(self.response_type),
            client_id: other.client_id.or(self.client_id),
            redirect_uri: other.redirect_uri.or(self.redirect_uri),
            state: other.state.or(self.state),
            code_challenge: other.code_challenge.or(self.code_challenge),
            code_challenge_method: other.code_challenge_method.or(self.code_challenge_method),
            scope: other.scope.or(self.scope),
            decision: other.decision.or(self.decision),
        }
    }
}

/// An authorization request whose client and redirect_uri checked out
struct ValidatedRequest {
    client: Client,
    grant: CodeGrant,
    state: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Same checks for the consent page and the approval, and nothing in here
/// ever redirects: an unvalidated redirect_uri is exactly what an attacker
/// would hand us.
fn validate_request(
    service: &OAuthService,
    req: &AuthorizationRequest,
) -> Result<ValidatedRequest, OAuthError> {
    let client_id = non_empty(&req.client_id).ok_or_else(|| OAuthError::missing("client_id"))?;
    let redirect_uri =
        non_empty(&req.redirect_uri).ok_or_else(|| OAuthError::missing("redirect_uri"))?;

    let client = service
        .registry()
        .lookup(client_id)
        .ok_or_else(|| OAuthError::InvalidClient(format!("Client {} not found", client_id)))?;

    if !client.allows_redirect_uri(redirect_uri) {
        tracing::warn!(
            "rejected unregistered redirect_uri '{}' for client '{}'",
            redirect_uri,
            client_id
        );
        return Err(OAuthError::InvalidRequest(
            "redirect_uri is not registered for this client".to_string(),
        ));
    }

    if let Some(response_type) = non_empty(&req.response_type) {
        if response_type != "code" {
            return Err(OAuthError::InvalidRequest(format!(
                "unsupported response_type '{}'",
                response_type
            )));
        }
    }

    let code_challenge_method = match non_empty(&req.code_challenge_method) {
        Some(method) => method
            .parse::<CodeChallengeMethod>()
            .map_err(OAuthError::InvalidRequest)?,
        None => CodeChallengeMethod::default(),
    };

    let scope = non_empty(&req.scope)
        .unwrap_or(service.config().default_scope.as_str())
        .to_string();

    Ok(ValidatedRequest {
        grant: CodeGrant {
            client_id: client_id.to_string(),
            redirect_uri: redirect_uri.to_string(),
            code_challenge: non_empty(&req.code_challenge).map(str::to_string),
            code_challenge_method,
            scope,
        },
        state: non_empty(&req.state).map(str::to_string),
        client,
    })
}

/// Shows consent page - user clicks approve/deny
pub async fn authorize_handler(
    State(state): State<OAuthAppState>,
    query: Result<Query<AuthorizationRequest>, QueryRejection>,
) -> Response {
    let req = match query {
        Ok(Query(req)) => req,
        Err(e) => {
            return OAuthError::InvalidRequest(format!("Malformed authorization request: {}", e))
                .into_response();
        }
    };

    tracing::info!(
        "Authorization request from client_id={:?}, redirect_uri={:?}",
        req.client_id,
        req.redirect_uri
    );

    let validated = match validate_request(&state.oauth_service, &req) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };

    // Show consent page with security headers
    let html = consent_page(&validated);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'; style-src 'unsafe-inline'; form-action 'self'"),
    );
    headers.insert(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    (headers, Html(html)).into_response()
}

/// Handles the approve/deny button click. Parameters may come from the query
/// string, the form body or both; the body wins.
pub async fn authorize_approval_handler(
    State(state): State<OAuthAppState>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> Response {
    let from_query = serde_urlencoded::from_str::<AuthorizationRequest>(query.as_deref().unwrap_or(""));
    let from_body = serde_urlencoded::from_bytes::<AuthorizationRequest>(&body);
    let req = match (from_query, from_body) {
        (Ok(q), Ok(b)) => q.merge(b),
        (Err(e), _) | (_, Err(e)) => {
            return OAuthError::InvalidRequest(format!("Malformed authorization request: {}", e))
                .into_response();
        }
    };

    let validated = match validate_request(&state.oauth_service, &req) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let redirect_uri = validated.grant.redirect_uri.clone();

    // no decision at all counts as approval, anything unrecognised is refused
    match req.decision.as_deref() {
        None | Some("approve") => {}
        Some("deny") => {
            tracing::info!("Authorization denied for client_id={}", validated.grant.client_id);
            return redirect_with(
                &redirect_uri,
                &[
                    ("error", Some("access_denied")),
                    ("error_description", Some("User denied the authorization request")),
                    ("state", validated.state.as_deref()),
                ],
            );
        }
        Some(other) => {
            tracing::warn!(
                "Unrecognised consent decision '{}' for client_id={}",
                other,
                validated.grant.client_id
            );
            return OAuthError::InvalidRequest(format!("unsupported decision '{}'", other))
                .into_response();
        }
    }

    // Generate the actual authorization code
    let code = generate_secret();
    let client_id = validated.grant.client_id.clone();
    if let Err(e) = state
        .oauth_service
        .registry()
        .store_code(&code, validated.grant)
    {
        return OAuthError::from(e).into_response();
    }

    tracing::info!(
        "Authorization approved for client_id={}, redirecting to {}",
        client_id,
        redirect_uri
    );

    redirect_with(
        &redirect_uri,
        &[("code", Some(code.as_str())), ("state", validated.state.as_deref())],
    )
}

/// 302 back to the client, params with no value are left out
fn redirect_with(redirect_uri: &str, params: &[(&str, Option<&str>)]) -> Response {
    let mut url = redirect_uri.to_string();
    let mut separator = if url.contains('?') { '&' } else { '?' };
    for (name, value) in params {
        if let Some(value) = value {
            url.push(separator);
            url.push_str(&format!("{}={}", name, urlencoding::encode(value)));
            separator = '&';
        }
    }

    match HeaderValue::from_str(&url) {
        Ok(location) => (StatusCode::FOUND, [(header::LOCATION, location)]).into_response(),
        Err(_) => {
            tracing::error!("redirect target is not a valid header value: {}", url);
            OAuthError::ServerError("Unable to redirect to the registered redirect_uri".to_string())
                .into_response()
        }
    }
}

fn hidden_field(name: &str, value: Option<&str>) -> String {
    match value {
        Some(v) => format!(
            r#"<input type="hidden" name="{}" value="{}">"#,
            name,
            html_escape(v)
        ),
        None => String::new(),
    }
}

fn consent_page(req: &ValidatedRequest) -> String {
    let grant = &req.grant;
    let fields = [
        hidden_field("response_type", Some("code")),
        hidden_field("client_id", Some(&grant.client_id)),
        hidden_field("redirect_uri", Some(&grant.redirect_uri)),
        hidden_field("scope", Some(&grant.scope)),
        hidden_field("state", req.state.as_deref()),
        hidden_field("code_challenge", grant.code_challenge.as_deref()),
        hidden_field(
            "code_challenge_method",
            grant
                .code_challenge
                .as_ref()
                .map(|_| grant.code_challenge_method.as_str()),
        ),
    ]
    .join("\n        ");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Authorize Application</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            max-width: 400px;
            margin: 100px auto;
            padding: 20px;
            text-align: center;
        }}
        h1 {{ color: #333; }}
        .info {{
            background: #f5f5f5;
            padding: 10px;
            border-radius: 4px;
            text-align: left;
            word-break: break-all;
        }}
        .scope {{
            background: #0066cc;
            color: white;
            padding: 2px 6px;
            border-radius: 4px;
            font-family: monospace;
        }}
        .buttons {{ margin-top: 30px; }}
        button {{
            padding: 12px 24px;
            margin: 5px;
            border: none;
            border-radius: 4px;
            cursor: pointer;
            font-size: 16px;
            color: white;
        }}
        .approve {{ background: #0066cc; }}
        .deny {{ background: #666; }}
    </style>
</head>
<body>
    <h1>Authorize Application</h1>
    <p>The following application is requesting access to your MCP server tools:</p>
    <div class="info">
        <p><strong>Application:</strong> {}</p>
        <p><strong>Client ID:</strong> {}</p>
        <p><strong>Requested scope:</strong> <span class="scope">{}</span></p>
    </div>
    <form method="POST" action="/authorize">
        {}
        <div class="buttons">
            <button class="approve" type="submit" name="decision" value="approve">Approve</button>
            <button class="deny" type="submit" name="decision" value="deny">Deny</button>
        </div>
    </form>
</body>
</html>"#,
        html_escape(&req.client.client_name),
        html_escape(&grant.client_id),
        html_escape(&grant.scope),
        fields
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#x27;")
}
