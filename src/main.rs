//! Turretd - Sentry Turret Control Server
//!
//! Main entry point for the turret daemon.

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turretd::state::{AppConfig, AppState};
use turretd::web_api;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "turretd=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting turretd v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::default();
    tracing::info!(
        host = %config.host,
        port = config.port,
        camera_cmd = %config.camera_cmd,
        servo_cmd = %config.servo_cmd,
        detector_cmd = %config.detector_cmd,
        position_path = %config.position_path.display(),
        "Configuration loaded"
    );

    // Wire components
    let state = AppState::new(config.clone());

    // Bring up the servo daemon; the supervisor keeps it alive from
    // here on. The camera producer stays down until a viewer arrives.
    state.servo.start().await;

    // CORS (dashboard is served from another origin during development)
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = web_api::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(addr = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
