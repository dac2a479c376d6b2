use std::sync::Arc;

use anyhow::Context;
use burnchat::{
    AppState, Config, Rooms,
    config::StoreBackend,
    events::BroadcastChannels,
    ids::RandomIds,
    store::{self, KvStore, MemoryStore, SqliteStore},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let config = Config::from_env()?;

    let store: Arc<dyn KvStore> = match &config.store {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Sqlite(url) => Arc::new(
            SqliteStore::connect(url)
                .await
                .with_context(|| format!("opening {url}"))?,
        ),
    };
    let sweeper = store::spawn_sweeper(&store, config.sweep_interval);

    let rooms = Rooms::new(
        store,
        Arc::new(BroadcastChannels::new(config.event_buffer)),
        Arc::new(RandomIds),
        config.policy,
    );
    let app = burnchat::app(AppState { rooms }, &config);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, store = ?config.store, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "could not listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
