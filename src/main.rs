//! Nyx uploader server binary.
//!
//! Accepts single-file multipart uploads on `POST /upload`, validates size
//! and content type, stores files under generated names and serves them back
//! from `/uploads/`. Every request passes through a per-IP token bucket.

mod app;
mod atomic;
mod background;
mod config;
mod error;
mod expiring;
mod http;
mod limiter;
mod logging;
mod response;
mod sniff;
mod storage;
mod upload;

use axum_server::Handle;
use clap::Parser;
use hyper_util::rt::TokioTimer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use crate::background::spawn_background_tasks;
use crate::config::{AppConfig, Args};
use crate::limiter::RateLimiter;
use crate::storage::UploadStore;

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    // A missing .env file is fine; real environment variables take precedence.
    let _ = dotenvy::dotenv();
    let config = AppConfig::try_from(Args::parse())?;
    logging::init_logging(config.log_format);

    info!("🚀 Starting Nyx Uploader server");

    let store = UploadStore::new(config.upload.upload_dir.clone());
    store.ensure_root().await?;
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit,
        config.server.trust_proxy,
    ));
    let app = app::build_router(&config, limiter.clone());

    let handle = Handle::new();
    let mut server = axum_server::bind(config.server.addr).handle(handle.clone());
    server
        .http_builder()
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(config.server.idle_timeout);

    spawn_background_tasks(limiter.clone());
    tokio::spawn(shutdown_signal(handle, config.server.shutdown_grace));

    info!(
        addr = %config.server.addr,
        url = config.upload.base_url,
        upload_dir = ?store.root_path(),
        max_upload_mb = config.upload.max_upload_size_mb(),
        visitor_ttl = ?limiter.visitor_ttl(),
        "✅ Server running"
    );
    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("👋 Server shut down");
    Ok(())
}

async fn shutdown_signal(handle: Handle, grace: Duration) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!(grace = ?grace, "🛑 Received termination signal, shutting down");
    handle.graceful_shutdown(Some(grace));
}
