use anyhow::Context;
use clap::Parser;
use pawchat::{
    AppState,
    config::ServerConfig,
    history::{HistoryStore, JsonFile},
    rooms::{self, Relay},
};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let config = ServerConfig::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tokio::fs::create_dir_all(&config.upload_dir)
        .await
        .with_context(|| format!("creating upload dir {}", config.upload_dir.display()))?;

    let history_file = JsonFile::new(&config.history_file);
    let history_path = history_file.path().to_path_buf();
    let mut store = HistoryStore::new(history_file);
    let report = store
        .load()
        .with_context(|| format!("loading chat history from {}", history_path.display()))?;
    info!(
        "loaded {} message(s) in {} conversation(s) from {}",
        report.messages,
        report.conversations,
        history_path.display()
    );

    let (relay, relay_task) = rooms::spawn(Relay::new(store));
    let app = pawchat::app(AppState {
        relay,
        uploads: config.uploads(),
    });

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    info!("chat server running on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    relay_task.abort();
    info!("chat server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
