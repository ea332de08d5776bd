//! HTTP server: router, middleware and graceful shutdown.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::http::{HeaderValue, header};
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::routes;
use super::state::ServerState;

/// Builds the application router.
pub fn create_app(state: ServerState) -> Router {
    Router::new()
        .route("/api/image", get(routes::serve_image))
        .route("/version", get(routes::version))
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::SERVER,
            HeaderValue::from_static(crate::NAME),
        ))
        .with_state(state)
}

/// Serves until SIGINT/SIGTERM, then gives in-flight requests `grace` to
/// finish.
///
/// # Errors
/// Returns an I/O error if the address cannot be bound or the server fails.
pub async fn start_server(addr: SocketAddr, state: ServerState, grace: Duration) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "Listening");

    let (stopped_tx, stopped_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, create_app(state)).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = stopped_tx.send(());
    })
    .into_future();

    tokio::select! {
        result = server => result,
        () = async {
            if stopped_rx.await.is_ok() {
                tokio::time::sleep(grace).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => {
            warn!(grace_secs = grace.as_secs(), "Grace period elapsed, dropping open connections");
            Ok(())
        }
    }
}

/// Completes on SIGTERM or SIGINT.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        warn!("Failed to install signal handlers, falling back to Ctrl+C");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}

/// Completes on Ctrl+C.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C");
}
