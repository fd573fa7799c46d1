use axum::Router;
use secrecy::ExposeSecret;
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vendorvault::api::middleware::session::{create_session_layer, AppState};
use vendorvault::config::Config;
use vendorvault::db::{self, PgStore};
use vendorvault::jobs::retention_sweeper::start_retention_scheduler;
use vendorvault::services::encryption::TokenCipher;
use vendorvault::services::oauth::{OAuthProvider, OAuthProviderConfig, ProviderAdapter};
use vendorvault::services::{Governance, GovernanceSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vendorvault=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting VendorVault server...");

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!("Configuration loaded successfully");

    // Create database pool
    let pool = db::create_pool(&config.database_url).await?;
    tracing::info!("Database pool created");

    // Run migrations
    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    // Wire the governance core
    let cipher = TokenCipher::from_root_secret(config.root_secret.expose_secret())?;
    let provider = OAuthProvider::new(OAuthProviderConfig {
        name: config.provider_name.clone(),
        client_id: config.provider_client_id.clone(),
        client_secret: config.provider_client_secret.clone(),
        auth_url: config.provider_auth_url.clone(),
        token_url: config.provider_token_url.clone(),
    })?;
    let providers: Vec<Arc<dyn ProviderAdapter>> = vec![Arc::new(provider)];

    let governance = Governance::new(
        Arc::new(PgStore::new(pool.clone())),
        cipher,
        providers,
        GovernanceSettings {
            refresh_margin: config.refresh_margin(),
            retention_default_days: config.retention_default_days,
        },
    );
    tracing::info!(provider = %config.provider_name, "Governance services initialized");

    // Retention sweep
    let shutdown = CancellationToken::new();
    let mut scheduler = start_retention_scheduler(
        governance.clone(),
        &config.retention_schedule,
        shutdown.clone(),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to start retention scheduler: {:?}", e))?;

    // Create session layer
    let session_layer = create_session_layer(pool.clone()).await?;
    tracing::info!("Session layer initialized");

    // Build application state
    let state = AppState {
        pool: pool.clone(),
        governance,
        shutdown: shutdown.clone(),
    };

    // Build router
    let app = Router::new()
        .merge(vendorvault::api::router())
        .layer(session_layer)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = ?e, "Retention scheduler did not shut down cleanly");
    }

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received, cleaning up...");
    shutdown.cancel();
}
