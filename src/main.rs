use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use marketplace_auth::cleanup::CleanupJob;
use marketplace_auth::{health_check, AppError, AppState, Settings};
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> marketplace_auth::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new()?;
    info!(environment = %config.environment, "Configuration loaded");

    let state = AppState::new(config.clone()).await?;
    state.store.migrate().await?;
    info!("Database migrations applied");

    let cleanup = Arc::new(CleanupJob::new(&state.auth));
    cleanup.spawn(Duration::from_secs(config.cleanup.interval_hours.max(1) * 3600));

    let listener = TcpListener::bind(format!("{}:{}", config.server.host, config.server.port))?;
    info!("Listening on {}:{}", config.server.host, config.server.port);

    let data = web::Data::new(state.clone());
    HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/health", web::get().to(health_check))
    })
    .listen(listener)?
    .workers(config.server.workers.max(1) as usize)
    .run()
    .await
    .map_err(|e| AppError::InternalError(e.to_string()))?;

    state.shutdown().await
}
