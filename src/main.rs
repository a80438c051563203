//! Upload server binary.
//!
//! Accepts multipart uploads on `POST /upload`, stores them under the
//! configured upload root and serves both the upload tree and a public
//! directory as static files. The main entry point loads configuration,
//! builds the Axum router and runs the HTTP listener until shutdown.

mod app;
mod background;
mod config;
mod error;
mod finalize;
mod http;
mod ingest;
mod logging;
mod naming;
mod storage;
mod upload;

use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info};

use crate::background::spawn_background_tasks;
use crate::config::{Args, Environment, UploadConfig};
use crate::http::build_cors_layer;
use crate::logging::Category;
use crate::storage::Storage;

shadow!(build);

/// Starts the upload server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    let environment = Environment::detect();
    let env_file = dotenvy::from_filename(environment.env_file());

    let args = Args::parse();
    let _log_guard = logging::init_logging(args.environment, args.log_directory());
    match env_file {
        Ok(path) => info!(category = %Category::Config, path = ?path, "env file loaded"),
        Err(err) => debug!(category = %Category::Config, error = %err, "env file skipped"),
    }

    info!(
        category = %Category::Config,
        environment = %args.environment,
        "checking for required config keys"
    );
    let cwd = std::env::current_dir()?;
    let upload_config = match UploadConfig::from_args(&args, &cwd) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(category = %Category::Config, error = %err, "invalid configuration");
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                err.to_string(),
            ));
        }
    };
    info!(category = %Category::Config, "all required config keys are set");

    let storage = Arc::new(Storage::new(upload_config.upload_root.clone()));
    storage.ensure_root().await?;
    tokio::fs::create_dir_all(&upload_config.temp_dir).await?;
    info!(
        category = %Category::Uploader,
        root = ?storage.root_path(),
        temp = ?upload_config.temp_dir,
        "upload storage ready"
    );

    let public_dir = cwd.join(PathBuf::from(&args.public_directory));
    let mut app = app::build_router(
        upload_config.clone(),
        storage,
        &public_dir,
        Duration::from_secs(args.request_body_timeout_secs),
    );
    if let Some(cors_layer) = build_cors_layer(&args.cors_origin, &args.cors_headers) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!(category = %Category::Server, "listening on {}", http_addr);

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(upload_config);
    tokio::select! {
        result = http_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
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

    info!(category = %Category::Server, "received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
