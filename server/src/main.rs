use std::future::IntoFuture;
use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};
use tokio::signal::unix::{signal, SignalKind};

use meeting_server::config::Config;
use meeting_server::routes;
use meeting_server::state::AppState;
use meeting_server::ws::ClientAddr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "meeting_server=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "meeting_server=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("meeting server v{} starting", env!("CARGO_PKG_VERSION"));

    if config.origin.is_empty() {
        eprintln!("Must specify a value for origin verification (--origin, or \"*\" to allow all)");
        std::process::exit(2);
    }

    let config = Arc::new(config);
    let state = AppState::new(config.clone());
    let app = routes::build_router(state);

    // Optional second listener for diagnostics.
    if let Some(addr) = config.profile_listen.clone() {
        let profile_app = app.clone();
        tokio::spawn(async move {
            match TcpListener::bind(&addr).await {
                Ok(listener) => {
                    tracing::info!("diagnostic listener on {addr}");
                    let serve = axum::serve(
                        listener,
                        profile_app.into_make_service_with_connect_info::<ClientAddr>(),
                    );
                    if let Err(err) = serve.await {
                        tracing::error!(error = %err, "diagnostic listener failed");
                    }
                }
                Err(err) => {
                    tracing::error!(error = %err, "could not bind diagnostic listener on {addr}")
                }
            }
        });
    }

    if config.listens_on_unix_socket() {
        let path = config.listen.clone();
        // A stale socket file from a previous run would fail the bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        tracing::info!("listening on unix socket {path}");

        let serve = axum::serve(listener, app.into_make_service_with_connect_info::<ClientAddr>());
        tokio::select! {
            result = serve.into_future() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "could not serve on unix socket {path}");
                    std::process::exit(1);
                }
            }
            caught = shutdown_signal() => {
                tracing::info!("caught signal {caught}: shutting down");
            }
        }
        // Dropping the serve future closed the listener; clean up the file.
        let _ = std::fs::remove_file(&path);
    } else {
        let listener = TcpListener::bind(&config.listen).await?;
        tracing::info!("listening on {}", config.listen);

        let serve = axum::serve(listener, app.into_make_service_with_connect_info::<ClientAddr>());
        tokio::select! {
            result = serve.into_future() => {
                if let Err(err) = result {
                    tracing::error!(error = %err, "could not serve on {}", config.listen);
                    std::process::exit(1);
                }
            }
            caught = shutdown_signal() => {
                tracing::info!("caught signal {caught}: shutting down");
            }
        }
    }

    Ok(())
}

/// Resolve when SIGINT or SIGTERM arrives. The caller drops the serve
/// future afterwards, which closes the listener, so shutting down this way
/// is never reported as a serve error.
async fn shutdown_signal() -> &'static str {
    let mut interrupt = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
    }
}
