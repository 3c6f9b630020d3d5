//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, FcmPushChannel, TwilioClient, TwilioSmsChannel, TwilioVoiceChannel},
    config::Config,
    error::ApiError,
    web::{build_router, state::AppState},
};
use guardian_core::{DatabaseService, MemoryStore, NotificationChannel};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    let db: Arc<dyn DatabaseService> = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
            let db_adapter = DbAdapter::new(db_pool);
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            Arc::new(db_adapter)
        }
        None => {
            warn!("DATABASE_URL is not set; using the in-memory store. Data will not survive a restart.");
            Arc::new(MemoryStore::new())
        }
    };

    // --- 3. Initialize Notification Channels ---
    let http = reqwest::Client::builder()
        .timeout(config.notify_timeout)
        .build()?;
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    match &config.fcm_server_key {
        Some(key) => channels.push(Arc::new(FcmPushChannel::new(http.clone(), key.clone()))),
        None => warn!("FCM_SERVER_KEY is not set; push notifications are disabled."),
    }
    match &config.twilio {
        Some(twilio) => {
            let client = TwilioClient::new(http.clone(), twilio.clone());
            channels.push(Arc::new(TwilioSmsChannel::new(client.clone())));
            channels.push(Arc::new(TwilioVoiceChannel::new(client)));
        }
        None => warn!("Twilio is not fully configured; SMS and voice calls are disabled."),
    }
    info!("{} notification channel(s) enabled.", channels.len());

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState::new(db.clone(), config.clone(), channels));

    // --- 5. Start the Retention Sweep ---
    let shutdown = CancellationToken::new();
    let sweep = tokio::spawn(retention_sweep(db, config.clone(), shutdown.clone()));

    // --- 6. Start the Server ---
    let app = build_router(app_state);
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweep.await {
        error!("Retention sweep task ended abnormally: {:?}", e);
    }
    info!("Server stopped.");
    Ok(())
}

/// Deletes location samples older than the retention window, once per interval.
async fn retention_sweep(
    db: Arc<dyn DatabaseService>,
    config: Arc<Config>,
    token: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.retention_sweep_interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {
                let cutoff = chrono::Utc::now() - config.location_retention;
                match db.purge_location_updates_before(cutoff).await {
                    Ok(0) => {}
                    Ok(removed) => info!("Purged {} location updates older than {}", removed, cutoff),
                    Err(e) => warn!("Location retention sweep failed: {}", e),
                }
            }
        }
    }
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for the shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
            token.cancel();
        }
        _ = token.cancelled() => {}
    }
}
