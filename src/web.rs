// src/web.rs
use crate::broad::{Broad, Routed};
use crate::config::AppConfig;
use crate::serve::FileServer;
use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::Method,
    response::{IntoResponse, Response},
    Router,
};
use serde_json::Map;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch::Receiver as WatchReceiver;
use tracing::{error, info};

/// Shared state of the web server.
#[derive(Clone)]
struct AppState {
    broad: Broad,
    files: Option<Arc<FileServer>>,
}

/// Builds the router: hub routes first, then files (GET only), then 404.
pub fn router(broad: Broad, files: Option<Arc<FileServer>>) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(AppState { broad, files })
}

async fn handle(State(state): State<AppState>, req: Request) -> Response {
    let req = match state.broad.route(req).await {
        Routed::Handled(res) => return res,
        Routed::Unhandled(req) => req,
    };

    if req.method() == Method::GET {
        if let Some(files) = &state.files {
            match files.respond(req.uri().path()).await {
                Ok(Some(res)) => return res,
                Ok(None) => {}
                Err(err) => {
                    if !err.is_cancel() {
                        error!("Failed to serve {}: {}", req.uri().path(), err);
                    }
                    return err.into_response();
                }
            }
        }
    }
    state.broad.not_found()
}

/// Starts the HTTP server.
///
/// On shutdown the hub is shut down first, so open event streams receive a
/// `deinit` message and end before the server stops waiting on them.
pub async fn start_server(
    app_config: Arc<AppConfig>,
    broad: Broad,
    files: Option<Arc<FileServer>>,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let listener =
        tokio::net::TcpListener::bind((app_config.hostname.as_str(), app_config.port)).await?;
    serve(listener, broad, files, shutdown_signal).await
}

/// Like [`start_server`], for an already bound listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    broad: Broad,
    files: Option<Arc<FileServer>>,
    shutdown_signal: WatchReceiver<bool>,
) -> Result<()> {
    let app = router(broad.clone(), files);
    info!(
        "Web server listening on http://{}{}",
        listener.local_addr()?,
        broad.namespace()
    );

    let mut shutdown = shutdown_signal.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.changed().await.ok();
        info!("Web server shutting down gracefully.");
        if let Err(err) = broad.shutdown(Map::new()) {
            error!("Failed to deinit clients: {}", err);
        }
    })
    .await?;

    info!("Web server stopped.");
    Ok(())
}
