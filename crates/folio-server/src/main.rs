use anyhow::Context;
use clap::Parser;
use folio_logging::FolioSubscriberBuilder;
use folio_session::{DocumentEvent, ExecutionStrategies, SessionConfig, SessionManager};
use folio_server::{build_manager, router, AppState, ServerConfig};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    let _log_guard = FolioSubscriberBuilder::new()
        .with_config(config.log_config()?)
        .init();

    let manager = build_manager(&config, SessionConfig::default(), ExecutionStrategies::default())
        .await
        .context("Failed to start session manager")?;
    tokio::spawn(log_events(manager.clone()));

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(addr = %config.listen, in_memory = config.in_memory, "Listening");

    let app = router(AppState {
        manager: manager.clone(),
    });
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(manager.clone()))
        .await?;
    info!("Server stopped");
    Ok(())
}

/// Resolves on ctrl-c, after the manager stopped accepting and closed every connection
async fn shutdown_signal(manager: Arc<SessionManager>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
    manager.shutdown().await;
}

async fn log_events(manager: Arc<SessionManager>) {
    let mut events = manager.subscribe_events();
    loop {
        match events.recv().await {
            Ok(DocumentEvent::ResyncRequired { key, user }) => {
                info!(key = %key, user = %user, "Client must refetch the document");
            }
            Ok(DocumentEvent::Reset { key, clock }) => {
                info!(key = %key, clock, "Session reset");
            }
            Ok(DocumentEvent::TitleChanged { document_id, title }) => {
                info!(document_id = %document_id, title = %title, "Title changed");
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped document events"),
            Err(RecvError::Closed) => break,
        }
    }
}
