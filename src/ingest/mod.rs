//! Stateless HTTP ingestion front-end.
//!
//! Accepts ballot submissions, rejects malformed input synchronously, and
//! hands well-formed envelopes to the bus with durable-publish semantics.
//! Holds no voting state: requests share nothing but connection pools and
//! the read-mostly election-window cache.

mod handlers;
mod router;
mod state;
mod windows;

use std::net::SocketAddr;

use tokio::sync::watch;
use tracing::info;

pub use handlers::VoteAccepted;
pub use router::build_router;
pub use state::AppState;
pub use windows::WindowCache;

/// Serve the ingestion API until shutdown flips.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "ingestion API listening");
    let router = build_router(&state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}
