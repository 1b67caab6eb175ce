use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::AppState;
use crate::api::identity::identity_middleware;
use crate::api::routes::build_router;
use crate::config::AppConfig;
use crate::persistence::providers::memory::MemoryProvider;
use crate::persistence::providers::postgres::PostgresProvider;
use crate::persistence::{EventLog, MetadataStore};
use crate::streaming::StreamCoordinator;
use crate::streaming::source::GraphRegistry;

/// Start the Axum server with the provided configuration.
pub async fn start_server(config: Arc<AppConfig>) -> anyhow::Result<()> {
    let (store, log): (Arc<dyn MetadataStore>, Arc<dyn EventLog>) =
        match config.persistence.provider.as_str() {
            "postgres" => {
                let provider =
                    Arc::new(PostgresProvider::new(&config.persistence.database_url).await?);
                let store: Arc<dyn MetadataStore> = provider.clone();
                (store, provider)
            }
            _ => {
                let provider = Arc::new(MemoryProvider::new());
                let store: Arc<dyn MetadataStore> = provider.clone();
                (store, provider)
            }
        };

    info!(
        name: "persistence.initialized",
        provider = %config.persistence.provider,
        "Persistence initialized"
    );

    let graphs = Arc::new(GraphRegistry::with_defaults());
    for assistant in graphs.list() {
        info!(name: "assistant.registered", assistant = %assistant, "Assistant registered");
    }

    let coordinator = StreamCoordinator::new(store, log, graphs, config.streaming.settings());
    coordinator.start();

    let state = AppState {
        coordinator: Arc::clone(&coordinator),
        config: Arc::clone(&config),
    };

    let app: Router = build_router()
        .layer(axum::middleware::from_fn(identity_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    coordinator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}
