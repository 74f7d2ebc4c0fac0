use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use shared_config::{AppConfig, NegotiationMode};
use video_call_cell::handlers::CallAgentState;
use video_call_cell::services::{CallRegistry, ConfiguredDependencies};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug,webrtc=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting call agent");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Loopback calls run both participants in this process
    let registry = match config.negotiation_mode {
        NegotiationMode::WebRtc => CallRegistry::new(),
        NegotiationMode::Loopback => CallRegistry::with_independent_media(),
    };
    let provider = Arc::new(ConfiguredDependencies::from_config(config.clone()));
    let state = Arc::new(CallAgentState::new(config.clone(), registry.clone(), provider));

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.agent_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    Ok(())
}

async fn shutdown_signal(registry: CallRegistry) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested, ending active calls");
    registry.end_all().await;
}
