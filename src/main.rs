mod auth;
mod server;

use anyhow::{Context, Result, anyhow};
use auth::TokenValidator;
use clap::{Parser, Subcommand, ValueEnum};
use rmcp::ServiceExt;
use server::GreetingServer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportMode {
    Stdio,
    Http,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a fresh PKCE verifier/challenge pair and exit
    Pkce,
}

// the OAuth flags are ignored in stdio mode
#[derive(Parser, Debug)]
#[command(name = "mcp-oauth-server")]
#[command(about = "OAuth 2.1 authorization server guarding a small MCP tool server")]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Transport mode to use
    #[arg(short, long, value_enum, env = "MCP_TRANSPORT", default_value = "http")]
    transport: TransportMode,

    /// Host to bind to (HTTP mode only)
    #[arg(long, env = "MCP_HOST", default_value = "localhost")]
    host: String,

    /// Port to bind to (HTTP mode only)
    #[arg(short, long, env = "MCP_PORT", default_value = "8000")]
    port: u16,

    /// Public base URL, used as the token issuer and in metadata documents.
    /// If not set, defaults to http://HOST:PORT
    #[arg(long, env = "PUBLIC_URL")]
    public_url: Option<String>,

    /// JSON file holding registered clients and pending authorization codes
    #[arg(long, env = "OAUTH_STORAGE_PATH", default_value = "oauth_clients.json")]
    storage_path: PathBuf,

    /// Keep clients and codes in memory only
    #[arg(long, env = "OAUTH_EPHEMERAL", default_value = "false")]
    ephemeral: bool,

    /// Directory holding the PEM signing keypair
    #[arg(long, env = "OAUTH_KEY_DIR", default_value = "keys")]
    key_dir: PathBuf,

    /// kid used when a new signing key has to be generated
    #[arg(long, env = "OAUTH_KEY_ID", default_value = auth::DEFAULT_KID)]
    key_id: String,

    /// `aud` claim of issued tokens, and the audience bearer tokens must carry
    #[arg(long, env = "OAUTH_AUDIENCE", default_value = "mcp-greeting-server")]
    audience: String,

    /// Access token lifetime in seconds
    #[arg(long, env = "OAUTH_TOKEN_TTL", default_value = "3600", value_parser = clap::value_parser!(i64).range(1..))]
    token_ttl: i64,

    /// Authorization code lifetime in seconds
    #[arg(long, env = "OAUTH_CODE_TTL", default_value_t = auth::DEFAULT_CODE_TTL_SECS, value_parser = clap::value_parser!(i64).range(1..))]
    code_ttl: i64,

    /// Rotate the signing key every N seconds (disabled if unset)
    #[arg(long, env = "OAUTH_KEY_ROTATION_INTERVAL")]
    key_rotation_interval: Option<u64>,

    /// Verify bearer tokens against this JWKS instead of our own keys,
    /// for when tokens come from a separate authorization server
    #[arg(long, env = "OAUTH_JWKS_URI")]
    jwks_uri: Option<String>,

    /// Expected `iss` of bearer tokens (defaults to the public URL)
    #[arg(long, env = "OAUTH_TOKEN_ISSUER")]
    token_issuer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    // Initialise logging to stderr (so it doesn't interfere with stdio transport)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_oauth_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Some(Command::Pkce) = args.command {
        let (verifier, challenge) = auth::generate_pkce_pair();
        println!("code_verifier={}", verifier);
        println!("code_challenge={}", challenge);
        println!("code_challenge_method=S256");
        return Ok(());
    }

    match args.transport {
        TransportMode::Stdio => {
            tracing::info!("Starting in stdio mode (no authentication)");
            let service = GreetingServer::new(false)
                .serve(rmcp::transport::stdio())
                .await?;
            service.waiting().await?;
        }
        TransportMode::Http => {
            tracing::info!("Starting in HTTP mode on {}:{}", args.host, args.port);
            run_http_server(&args).await?;
        }
    }

    Ok(())
}

async fn run_http_server(args: &Args) -> Result<()> {
    use axum::{Router, middleware};
    use rmcp::transport::streamable_http_server::session::local::LocalSessionManager;
    use rmcp::transport::streamable_http_server::tower::{
        StreamableHttpServerConfig, StreamableHttpService,
    };
    use std::net::SocketAddr;
    use tower_governor::{
        GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
    };
    use tower_http::cors::CorsLayer;

    // we pass this to TcpListener::bind() which accepts ToSocketAddrs,
    // so hostnames like "localhost" get resolved properly (unlike SocketAddr::parse)
    let bind_addr = format!("{}:{}", args.host, args.port);

    // Use public URL if provided, otherwise use local address
    let base_url = args
        .public_url
        .as_deref()
        .map(|url| url.trim_end_matches('/').to_string())
        .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port));

    let config = auth::AuthConfig {
        issuer: base_url.clone(),
        audience: args.audience.clone(),
        token_ttl: chrono::Duration::seconds(args.token_ttl),
        code_ttl: chrono::Duration::seconds(args.code_ttl),
        default_scope: auth::DEFAULT_SCOPE.to_string(),
        storage_path: (!args.ephemeral).then(|| args.storage_path.clone()),
        key_dir: args.key_dir.clone(),
        key_id: args.key_id.clone(),
        key_bits: auth::DEFAULT_KEY_BITS,
    };
    let oauth_service = Arc::new(auth::OAuthService::new(config)?);

    tracing::info!("MCP endpoint: {}/mcp", base_url);
    tracing::info!(
        "Authorization server metadata: {}/.well-known/oauth-authorization-server",
        base_url
    );
    tracing::info!("JWKS: {}/.well-known/jwks.json", base_url);
    tracing::info!("Token endpoint: {}/token", base_url);
    tracing::info!("Registration endpoint: {}/register", base_url);

    let validator: Arc<dyn TokenValidator + Send + Sync> = match &args.jwks_uri {
        Some(uri) => Arc::new(
            auth::JwksTokenValidator::fetch(uri)
                .await
                .with_context(|| format!("Failed to load JWKS from {}", uri))?,
        ),
        None => oauth_service.local_validator(),
    };

    let oauth_state = auth::OAuthAppState {
        oauth_service: oauth_service.clone(),
        base_url: base_url.clone(),
    };

    // Rate limiting: 10 requests per second per IP, burst of 30
    // SmartIpKeyExtractor checks x-forwarded-for and friends before falling back to peer ip,
    // so this works both behind a reverse proxy and when running locally
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(10)
            .burst_size(30)
            .finish()
            .ok_or_else(|| anyhow!("Failed to build rate limiter config"))?,
    );
    let governor_limiter = governor_conf.limiter().clone();

    // Stricter rate limiting for credential endpoints: 5 requests per second, burst of 10
    let auth_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(SmartIpKeyExtractor)
            .per_second(5)
            .burst_size(10)
            .finish()
            .ok_or_else(|| anyhow!("Failed to build auth rate limiter config"))?,
    );
    let auth_governor_limiter = auth_governor_conf.limiter().clone();

    // Start background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
            auth_governor_limiter.retain_recent();
        }
    });

    if let Some(secs) = args.key_rotation_interval.filter(|s| *s > 0) {
        tracing::info!("Signing key rotation every {}s", secs);
        let oauth_service = oauth_service.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
                let kid = chrono::Utc::now().format("key-%Y%m%d%H%M%S").to_string();
                if let Err(e) = oauth_service.rotate_signing_key(&kid).await {
                    tracing::error!("Key rotation failed, keeping current key: {:#}", e);
                }
            }
        });
    }

    let session_manager = Arc::new(LocalSessionManager::default());
    let http_service = StreamableHttpService::new(
        || Ok(GreetingServer::new(true)),
        session_manager,
        StreamableHttpServerConfig::default(),
    );

    let auth_config = auth::AuthMiddlewareConfig {
        validator,
        issuer: args.token_issuer.clone().unwrap_or_else(|| base_url.clone()),
        audience: args.audience.clone(),
        base_url: base_url.clone(),
    };

    // protected routes - jwt required
    let protected_routes = Router::new()
        .route_service("/mcp", http_service)
        .layer(middleware::from_fn_with_state(
            auth_config,
            auth::jwt_auth_middleware,
        ))
        .layer(GovernorLayer::new(governor_conf.clone()));

    // public oauth endpoints - no auth required (that's the whole point)
    let app = auth::discovery_routes(oauth_state.clone())
        .layer(GovernorLayer::new(governor_conf))
        .merge(auth::credential_routes(oauth_state).layer(GovernorLayer::new(auth_governor_conf)))
        .merge(protected_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    tracing::info!("Server ready at {}", base_url);

    // into_make_service_with_connect_info gives us the peer ip for rate limiting fallback
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
