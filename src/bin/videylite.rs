#![forbid(unsafe_code)]

//! VideyLite HTTP server: media streaming plus the public catalog feeds.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use videylite::{
    catalog::{CatalogStore, open_database},
    config::{RuntimeOverrides, resolve_runtime_settings},
    routes::{AppState, router},
    security::ensure_not_root,
    views::ViewLedger,
};

const DEFAULT_LOG_FILTER: &str = "videylite=info";

#[derive(Parser, Debug)]
#[command(name = "videylite", version, about = "Serve published videos over HTTP")]
struct ServerArgs {
    /// Directory holding `videos/` and `catalog.db` (env: MEDIA_ROOT).
    #[arg(long)]
    media_root: Option<PathBuf>,
    /// Listen address (env: VIDEYLITE_HOST).
    #[arg(long)]
    host: Option<String>,
    /// Listen port (env: VIDEYLITE_PORT).
    #[arg(long)]
    port: Option<u16>,
    /// Absolute URL prefix used in feeds (env: BASE_URL).
    #[arg(long)]
    base_url: Option<String>,
    /// Alternate `.env` file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl From<ServerArgs> for RuntimeOverrides {
    fn from(args: ServerArgs) -> Self {
        Self {
            media_root: args.media_root,
            host: args.host,
            port: args.port,
            base_url: args.base_url,
            env_path: args.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let args = ServerArgs::parse();
    ensure_not_root("videylite")?;

    let settings = resolve_runtime_settings(args.into())?;
    if settings.view_salt.is_empty() {
        warn!("VIEW_SALT is empty; viewer fingerprints are unsalted hashes of client addresses");
    }

    let videos_dir = settings.videos_dir();
    std::fs::create_dir_all(&videos_dir)
        .with_context(|| format!("creating {}", videos_dir.display()))?;
    let conn = open_database(&settings.catalog_path()).await?;
    let state = AppState::new(&settings, CatalogStore::new(conn.clone()), ViewLedger::new(conn));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind((settings.host.as_str(), settings.port))
        .await
        .with_context(|| format!("binding to {}:{}", settings.host, settings.port))?;
    let addr = listener.local_addr().context("reading listener address")?;
    info!(
        %addr,
        media_root = %settings.media_root.display(),
        base_url = %settings.base_url,
        trust_proxy = settings.trust_proxy,
        "server listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running server")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}
