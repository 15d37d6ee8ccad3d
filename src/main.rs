mod artifact;
mod config;
mod error;
mod executor;
mod extractor;
mod model;
mod pages;
mod planner;
mod routes;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    artifact::sweep_stale_jobs,
    config::Config,
    error::DownloadError,
    extractor::YtDlp,
    pages::Pages,
    routes::AppState,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "fetchtube=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DownloadError> {
    let config = Config::from_env();

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .map_err(DownloadError::io("Could not create the work directory"))?;
    sweep_stale_jobs(&config.work_dir, config.stale_job_age).await;

    if config.no_check_certificates {
        warn!("yt-dlp will run with --no-check-certificates");
    }

    let extractor = Arc::new(YtDlp::new(
        config.yt_dlp_bin.clone(),
        config.no_check_certificates,
    ));
    let state = AppState::new(
        extractor,
        Pages::new()?,
        config.work_dir.clone(),
        config.timeouts,
        config.no_check_certificates,
    );
    let app = routes::router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(DownloadError::io("Could not bind the listening address"))?;

    info!(
        work_dir = ?config.work_dir,
        yt_dlp = ?config.yt_dlp_bin,
        "Server running on http://{}",
        config.bind_addr
    );

    axum::serve(listener, app)
        .await
        .map_err(DownloadError::io("HTTP server error"))
}
