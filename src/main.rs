use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use slotlease::clock::SystemClock;
use slotlease::config::{Config, StoreBackend};
use slotlease::http::{AppState, build_router};
use slotlease::lease::LeaseManager;
use slotlease::store::{self, MemoryStore, PgStore, SlotStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    slotlease::observability::init(config.metrics_port)?;

    let store: Arc<dyn SlotStore> = match &config.backend {
        StoreBackend::Journal { data_dir } => {
            std::fs::create_dir_all(data_dir)?;
            let memory = Arc::new(MemoryStore::open(data_dir.join("slots.wal"))?);
            let compactor = memory.clone();
            let threshold = config.compact_threshold;
            tokio::spawn(async move {
                store::run_compactor(compactor, threshold).await;
            });
            memory as Arc<dyn SlotStore>
        }
        StoreBackend::Postgres { url } => {
            let pg = PgStore::connect(url).await?;
            pg.ensure_schema().await?;
            Arc::new(pg) as Arc<dyn SlotStore>
        }
    };

    let leases = Arc::new(LeaseManager::new(
        store.clone(),
        Arc::new(SystemClock),
        config.release_policy,
    ));
    let app = build_router(AppState {
        leases,
        store,
        identity_header: config.identity_header.clone(),
        expose_errors: config.expose_errors,
    });

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("slotlease listening on {addr}");
    match &config.backend {
        StoreBackend::Journal { data_dir } => info!("  store: journal in {}", data_dir.display()),
        StoreBackend::Postgres { .. } => info!("  store: postgres"),
    }
    info!("  identity header: {}", config.identity_header);
    info!("  release policy: {:?}", config.release_policy);
    info!("  error detail: {}", if config.expose_errors { "exposed" } else { "suppressed" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("slotlease stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM. In-flight requests drain before serve returns.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}");
                ctrl_c.await;
            }
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;

    info!("shutdown signal received, draining requests");
}
