mod api;
mod config;

use std::sync::Arc;

use axum::{Router, routing::get};
use metrics_exporter_prometheus::PrometheusBuilder;
use quark_bus::{EventBus, MemoryBroker, StreamConfig};
use quark_core::{KeyValueStore, SystemClock};
use quark_db::{MemoryStore, SqliteStore};
use quark_registry::{HealthMonitor, HttpProber, Registry};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::{ApiDoc, AppState};
use crate::config::HubConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).ok();

    let config = HubConfig::from_env()?;

    let store: Arc<dyn KeyValueStore> = match &config.database_url {
        Some(path) => {
            tracing::info!(path = %path, "using sqlite store");
            Arc::new(SqliteStore::new(path)?)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, registry state will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let bus = Arc::new(EventBus::new(
        Arc::new(MemoryBroker::new(StreamConfig::default())),
        config.bus.clone(),
    ));
    bus.connect().await?;

    let registry = Arc::new(Registry::new(
        store,
        bus.clone(),
        Arc::new(SystemClock),
        config.registry.clone(),
    ));
    let prober = Arc::new(HttpProber::new(
        config.monitor.probe_timeout,
        config.monitor.probe_path.clone(),
    )?);
    let monitor = Arc::new(HealthMonitor::new(registry.clone(), prober, config.monitor.clone()));
    if config.monitoring_enabled {
        monitor.start();
    } else {
        tracing::info!("health monitoring disabled");
    }

    if let Err(e) = bus
        .publish_system_event("started", json!({ "version": env!("CARGO_PKG_VERSION") }))
        .await
    {
        tracing::warn!("could not announce startup: {}", e);
    }

    let state = AppState {
        registry,
        monitor: monitor.clone(),
        bus: bus.clone(),
    };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/metrics",
            get(move || {
                let rendered = handle.render();
                async move { rendered }
            }),
        )
        .merge(api::router(state))
        .layer(TraceLayer::new_for_http());

    let addr = config.addr();
    tracing::info!("hub listening on {}", addr);

    let server = axum::Server::try_bind(&addr)?
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    let served = server.await;

    monitor.stop().await;
    bus.disconnect().await;
    tracing::info!("hub stopped");

    served.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
