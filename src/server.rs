//! HTTP gateway startup.

use crate::{config::ServeConfig, routes, services::url_mux::UrlMux};
use anyhow::{Context, Result};
use axum::Router;
use std::io::ErrorKind;
use tokio::net::TcpListener;

/// Open the configured bucket and serve it until the process is stopped.
pub async fn run(cfg: ServeConfig, mux: &UrlMux) -> Result<()> {
    tracing::info!("Starting blobport gateway with config: {:?}", cfg);

    let bucket = mux
        .open_bucket(&cfg.bucket_url)
        .with_context(|| format!("opening bucket {}", cfg.bucket_url))?;

    // --- Build router ---
    let app: Router = routes::routes().with_state(bucket);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Serving {} on http://{}", cfg.bucket_url, listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
}
