use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use thumbnail_cache::{ThumbnailConfig, ThumbnailService};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod error;
mod payloads;
mod routes;

/// Local HTTP backend for Image Viewer Pro
#[derive(Debug, Parser)]
#[command(name = "image-viewer-server", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(env = "PORT", default_value_t = 8000)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Thumbnail cache directory (defaults to the per-user cache dir)
    #[arg(long, env = "IMAGE_VIEWER_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// Worker pool size (defaults to min(32, cores + 4))
    #[arg(long)]
    workers: Option<usize>,

    /// In-memory thumbnail budget in MiB, 0 disables the hot tier
    #[arg(long, default_value_t = 64)]
    memory_budget_mb: usize,

    /// Evict cached thumbnails by last access beyond this many MiB on disk
    #[arg(long)]
    disk_budget_mb: Option<u64>,

    /// Refuse to open OpenEXR sources
    #[arg(long)]
    disable_exr: bool,

    /// Stop pool work for requests whose client has disconnected
    #[arg(long)]
    cancel_on_disconnect: bool,
}

impl Cli {
    fn thumbnail_config(&self) -> ThumbnailConfig {
        ThumbnailConfig {
            cache_dir: self.cache_dir.clone(),
            workers: self.workers,
            memory_budget: self.memory_budget_mb * 1024 * 1024,
            disk_budget: self.disk_budget_mb.map(|mb| mb * 1024 * 1024),
            open_exr: !self.disable_exr,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let service = ThumbnailService::new(cli.thumbnail_config()).context("Failed to start thumbnail service")?;
    let app = routes::router(routes::AppState::new(Arc::new(service), cli.cancel_on_disconnect));

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", cli.host, cli.port))?;
    info!("Listening on http://{}", listener.local_addr()?);

    // The desktop shell waits for this line before talking to us
    println!("Server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}
