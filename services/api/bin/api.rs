//! Main Entrypoint for the Parley Credential Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Selecting the realtime token minter.
//! 3. Constructing the Axum router and applying middleware.
//! 4. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use parley_api::{
    config::{Config, MinterKind},
    minter::{MockTokenMinter, OpenAiTokenMinter, TokenMinter},
    router::create_router,
    state::AppState,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    info!("Received shutdown signal. Shutting down gracefully...");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Select the Token Minter ---
    let minter: Arc<dyn TokenMinter> = match &config.minter {
        MinterKind::OpenAI => {
            info!("Using OpenAI token minter.");
            let api_key = config
                .openai_api_key
                .clone()
                .context("OPENAI_API_KEY is required for the openai minter")?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("Failed to build HTTP client")?;
            Arc::new(OpenAiTokenMinter::new(
                client,
                &config.openai_api_base,
                api_key,
            ))
        }
        MinterKind::Mock => {
            info!("Using mock token minter.");
            Arc::new(MockTokenMinter)
        }
    };

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        minter,
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        minter = ?config.minter,
        model = %config.realtime_model,
        ice_servers = config.ice_server_urls.len(),
        bind_address = %config.bind_address,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Server has shut down.");
    Ok(())
}
