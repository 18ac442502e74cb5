use super::traits::TokenValidator;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AuthMiddlewareConfig {
    /// Our own key ring, or a JWKS fetched from a separate authorization server
    pub validator: Arc<dyn TokenValidator + Send + Sync>,
    pub issuer: String,
    pub audience: String,
    pub base_url: String,
}

/// JWT authentication middleware - validates Bearer tokens as JWTs.
/// On success the verified claims are attached to the request extensions.
/// Returns WWW-Authenticate header on 401 as required by RFC 9728
pub async fn jwt_auth_middleware(
    State(config): State<AuthMiddlewareConfig>,
    mut req: Request,
    next: Next,
) -> Response {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let Some(token) = auth_header.and_then(|h| h.strip_prefix("Bearer ")) else {
        tracing::warn!(
            "Missing or invalid Authorization header for {} {}",
            req.method(),
            req.uri()
        );
        return unauthorized_response(&config.base_url, None);
    };

    match config
        .validator
        .verify(token.trim(), &config.issuer, &config.audience)
    {
        Ok(claims) => {
            tracing::debug!("Valid JWT token for client: {}", claims.sub);
            req.extensions_mut().insert(claims);
            next.run(req).await
        }
        Err(e) => {
            tracing::warn!("Invalid JWT token: {}", e);
            unauthorized_response(&config.base_url, Some("invalid_token"))
        }
    }
}

/// 401 pointing clients at the protected resource metadata, RFC 9728
fn unauthorized_response(base_url: &str, error: Option<&str>) -> Response {
    let mut www_auth = format!(
        "Bearer realm=\"{}\", resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
        base_url, base_url
    );
    if let Some(err) = error {
        www_auth.push_str(&format!(", error=\"{}\"", err));
    }

    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&www_auth) {
        Ok(value) => {
            headers.insert(header::WWW_AUTHENTICATE, value);
        }
        Err(_) => tracing::error!("base URL is not a valid header value: {}", base_url),
    }

    (StatusCode::UNAUTHORIZED, headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{BASE_URL, get, send, test_state};
    use crate::auth::{Claims, JwksTokenValidator};
    use axum::body::Body;
    use axum::{Extension, Router, middleware, routing::get as get_route};
    use tempfile::TempDir;

    fn protected(validator: Arc<dyn TokenValidator + Send + Sync>) -> Router {
        let config = AuthMiddlewareConfig {
            validator,
            issuer: BASE_URL.to_string(),
            audience: "mcp-greeting-server".to_string(),
            base_url: BASE_URL.to_string(),
        };
        Router::new()
            .route(
                "/mcp",
                get_route(|Extension(claims): Extension<Claims>| async move { claims.sub }),
            )
            .layer(middleware::from_fn_with_state(config, jwt_auth_middleware))
    }

    fn with_bearer(token: &str) -> axum::http::Request<Body> {
        axum::http::Request::get("/mcp")
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_valid_token_passes_claims_through() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        let service = &state.oauth_service;
        let token = service.issue_token("client-1", "mcp:tools").unwrap();

        let app = protected(service.local_validator());
        let response = send(&app, with_bearer(&token.access_token)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"client-1");
    }

    #[tokio::test]
    async fn test_missing_token_points_at_metadata() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        let app = protected(state.oauth_service.local_validator());

        let response = send(&app, get("/mcp")).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
        assert!(challenge.contains(
            "resource_metadata=\"http://localhost:8000/.well-known/oauth-protected-resource\""
        ));
        assert!(!challenge.contains("error="));
    }

    #[tokio::test]
    async fn test_bad_tokens_rejected() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        let app = protected(state.oauth_service.local_validator());

        for token in ["garbage", "a.b.c", ""] {
            let response = send(&app, with_bearer(token)).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let challenge = response.headers()[header::WWW_AUTHENTICATE].to_str().unwrap();
            assert!(challenge.contains("error=\"invalid_token\""), "{token}");
        }

        let basic = axum::http::Request::get("/mcp")
            .header("authorization", "Basic Zm9vOmJhcg==")
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, basic).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_jwks_validator_accepts_issued_tokens() {
        let dir = TempDir::new().unwrap();
        let state = test_state(dir.path());
        let service = &state.oauth_service;
        let validator = JwksTokenValidator::from_key_set(&service.keys().jwks()).unwrap();
        let app = protected(Arc::new(validator));

        let token = service.issue_token("client-2", "mcp:tools").unwrap();
        let response = send(&app, with_bearer(&token.access_token)).await;
        assert_eq!(response.status(), StatusCode::OK);

        let other_dir = TempDir::new().unwrap();
        let foreign = test_state(other_dir.path())
            .oauth_service
            .issue_token("client-2", "mcp:tools")
            .unwrap();
        let response = send(&app, with_bearer(&foreign.access_token)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
