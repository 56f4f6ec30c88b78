use std::sync::Arc;

use anyhow::Context;
use tablesync_relay::app::{build_router, shutdown_signal};
use tablesync_relay::collab::CollaborationService;
use tablesync_relay::config::{LogFormat, PubSubBackend, RelayConfig};
use tablesync_relay::db::{migrations::run_migrations, pool::create_pg_pool, pool::PoolConfig};
use tablesync_relay::metrics::{set_global_metrics, RelayMetrics};
use tablesync_relay::permissions::PermissionChecker;
use tablesync_relay::pubsub::Broker;
use tablesync_relay::store::OpLogStore;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);
    set_global_metrics(Arc::new(RelayMetrics::default()));

    let (store, permissions) = match &config.database_url {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
            run_migrations(&pool).await?;
            (OpLogStore::Postgres(pool.clone()), PermissionChecker::Postgres(pool))
        }
        None => (OpLogStore::memory(), PermissionChecker::AllowAll),
    };

    let broker = match &config.pubsub {
        PubSubBackend::Redis { url, .. } => {
            Some(Broker::redis(url).await.context("failed to connect to the redis broker")?)
        }
        PubSubBackend::Local => None,
    };

    let service = CollaborationService::new(&config, store, permissions, broker);
    service.start().await;

    let app = build_router(Arc::clone(&service), config.cors_origins.as_deref());
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        pubsub = config.pubsub.name(),
        store = service.pipeline().store().backend_name(),
        "starting relay server"
    );

    let served = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;
    service.shutdown().await;
    served.context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
