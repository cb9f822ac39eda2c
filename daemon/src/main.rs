mod capacity;
mod config;
mod error;
mod http;
mod manager;
mod security;
mod types;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use config::ConfigStore;
use http::AppState;
use manager::SandboxManager;
use security::{ApiKeyValidator, RateLimiter};

/// microVM workspace control plane daemon. Configuration is env-var driven
/// (see `config.rs`); these flags exist only to override the bind address
/// for local runs.
#[derive(Parser)]
#[command(name = "daemon", version)]
struct Cli {
    /// Overrides the HOST environment variable.
    #[arg(long)]
    host: Option<String>,
    /// Overrides the PORT environment variable.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
            |_| tracing_subscriber::EnvFilter::new("info"),
        ))
        .init();

    let cli = Cli::parse();
    let mut config = ConfigStore::from_env();
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            tracing::error!("configuration error: {e}");
        }
        return ExitCode::FAILURE;
    }

    let config = Arc::new(config);
    let manager = Arc::new(SandboxManager::new(config.clone()));
    if let Err(e) = manager.reload().await {
        tracing::error!("failed to reload sandbox state: {e}");
        return ExitCode::FAILURE;
    }

    let state = Arc::new(AppState {
        manager: manager.clone(),
        api_keys: ApiKeyValidator::new(&config.security),
        rate_limiter: RateLimiter::new(&config.security),
    });

    let router = http::build_router(
        state,
        &config.security.cors_origins,
        config.security.max_request_size_bytes,
    );
    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("failed to bind {addr}: {e}");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!("listening on {addr}");
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!("server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Waits for SIGTERM or SIGINT (Ctrl-C). In-flight requests get to finish;
/// no attempt is made to pause or destroy live sandboxes on shutdown.
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => tracing::info!("received SIGTERM, shutting down"),
        _ = recv_signal(&mut sigint) => tracing::info!("received SIGINT, shutting down"),
    }
}

/// Awaits a signal if registration succeeded, or pends forever otherwise
/// (so a missing signal still loses the `select!` race instead of firing).
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending().await,
    }
}
