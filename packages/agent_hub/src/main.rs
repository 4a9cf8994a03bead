use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use pty_manager::NativePtyBackend;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod error;
mod front_door;
mod handlers;
mod metrics;
mod params;
mod protocol;
mod relay;
mod session_actor;
mod session_registry;
#[cfg(test)]
mod test_helpers;

use crate::auth::{AllowAll, IdentityValidator, TokenListValidator};
use crate::config::{AuthConfig, HubConfig, SessionConfig};
use crate::metrics::ServerMetrics;
use crate::session_registry::SessionRegistry;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "agent-hub")]
#[command(about = "Keeps interactive agent CLIs alive on PTYs and shares them over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Data directory (defaults to ~/.agent-hub)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Config file (defaults to <data-dir>/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub server (default)
    Serve(ServeArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Port to listen on (overrides [server].port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides [server].host)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Decides which identity tokens are accepted
    pub validator: Arc<dyn IdentityValidator>,
    /// Server metrics for observability
    pub metrics: Arc<ServerMetrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = HubConfig::new(cli.data_dir, cli.config)?;

    match cli.command {
        None => run_server(ServeArgs::default(), config).await,
        Some(Commands::Serve(args)) => run_server(args, config).await,
        Some(Commands::Config) => {
            let file_config = config.load()?;
            println!("{}", serde_json::to_string_pretty(&file_config)?);
            Ok(())
        }
    }
}

/// All routes. `/api/*` goes through the identity check when auth is enabled;
/// `/ws` checks identity itself, before the upgrade.
pub(crate) fn build_router(state: AppState, auth_enabled: bool) -> Router {
    let mut api = Router::new()
        .route("/api/sessions", get(handlers::list_sessions))
        .route(
            "/api/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/api/sessions/{id}/start", post(handlers::start_session))
        .route("/api/sessions/{id}/stop", post(handlers::stop_session))
        .route("/api/sessions/{id}/restart", post(handlers::restart_session))
        .route("/api/events", get(handlers::events_websocket_handler));

    if auth_enabled {
        api = api.route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_identity,
        ));
    }

    Router::new()
        .merge(api)
        .route("/ws", get(handlers::session_websocket_handler))
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServeArgs, config: HubConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "agent_hub=debug,pty_manager=debug,tower_http=debug,info"
    } else {
        "agent_hub=info,pty_manager=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting agent hub");

    let file_config = config.load()?;
    let auth_config = AuthConfig::from_file(&file_config.auth)?;
    let session_config = SessionConfig::from_file(&file_config.sessions)?;
    info!(
        buffer_bytes = session_config.buffer_bytes,
        attach_policy = ?session_config.attach_policy,
        default_command = %session_config.default_command,
        "Session settings loaded"
    );

    let validator: Arc<dyn IdentityValidator> = if auth_config.enabled {
        info!(tokens = auth_config.tokens.len(), "Identity checks enabled");
        Arc::new(TokenListValidator::new(auth_config.tokens))
    } else {
        warn!("Identity checks disabled; any non-empty token is accepted");
        Arc::new(AllowAll)
    };

    let metrics = Arc::new(ServerMetrics::new());
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(NativePtyBackend::new()),
        session_config,
        metrics.clone(),
    ));

    let app_state = AppState {
        registry: registry.clone(),
        validator,
        metrics,
    };
    let app = build_router(app_state, auth_config.enabled);

    let host = args.host.unwrap_or(file_config.server.host);
    let port = args.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Agent hub listening on http://{}", actual_addr);
    info!("  GET    /ws?sessionId=...          - Attach to a session");
    info!("  GET    /api/sessions              - List sessions");
    info!("  POST   /api/sessions/:id/start    - Start a session");
    info!("  POST   /api/sessions/:id/stop     - Stop a session");
    info!("  DELETE /api/sessions/:id          - Remove a stopped session");
    info!("  GET    /api/events                - Session status stream");

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    info!("Stopping running sessions...");
    registry.shutdown().await;

    info!("Shutdown complete");
    server_result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Received shutdown signal, cleaning up...");
}
