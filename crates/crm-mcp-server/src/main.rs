//! CRM MCP gateway server.
//!
//! Run with: cargo run -p crm-mcp-server -- --api-token <token>
//!
//! The MCP endpoint is served at http://127.0.0.1:3000/mcp by default.

mod cli;

use std::sync::Arc;

use clap::Parser;
use crm_mcp_executor::{HttpCapability, catalog::catalog_for};
use crm_mcp_session::SessionTable;
use crm_mcp_transport::{McpRouter, McpServer, ServerSingleton, create_router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if cli.api_token.is_none() {
        tracing::warn!("CRM_API_TOKEN is not set; sessions will fail until it is configured");
    }

    let sessions = Arc::new(SessionTable::new(cli.session_config()));
    sessions.start_reaper();

    // Built on the first initialize, retried on the next one if it fails.
    let crm = cli.crm_config();
    let domains = cli.domains.clone();
    let servers = ServerSingleton::new(Box::new(move || {
        let capability = HttpCapability::from_config(&crm)?;
        tracing::info!(base_url = capability.base_url(), "CRM capability ready");
        McpServer::with_catalog(Arc::new(capability), catalog_for(&domains))
    }));

    let router = Arc::new(McpRouter::new(Arc::clone(&sessions), Arc::new(servers)));
    let app = create_router(router, &cli.path)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(cli.bind).await?;
    tracing::info!("Server listening on http://{}{}", cli.bind, cli.path);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let grace = cli.shutdown_grace();
    tracing::info!(grace_secs = grace.as_secs(), "Closing sessions");
    if tokio::time::timeout(grace, sessions.shutdown()).await.is_err() {
        tracing::warn!("Session shutdown timed out after {grace:?}");
    }
    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl-C, shutting down gracefully"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down gracefully"),
    }
}
