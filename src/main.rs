//! sfc-dev-server CLI: serves a project directory through the content pipeline.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use sfc_dev_server::{server, ContentDispatcher, PipelineConfig};
use tracing::info;

#[derive(Parser)]
#[command(
    name = "sfc-dev-server",
    about = "On-demand single-file component dev server",
    version
)]
struct Cli {
    /// Project root to serve
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Recompute every request instead of caching
    #[arg(long)]
    no_cache: bool,

    /// Embed source maps in compiled components
    #[arg(long)]
    source_maps: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("sfc_dev_server=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("sfc_dev_server=info")
            .init();
    }

    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("project root {} does not exist", cli.root.display()))?;

    let mut config = PipelineConfig::load(&root)?;
    if cli.no_cache {
        config = config.with_cache(false);
    }
    if cli.source_maps {
        config = config.with_source_maps(true);
    }
    config.validate()?;

    let dispatcher = Arc::new(ContentDispatcher::new(&root, config));
    let app = server::router(dispatcher);

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .with_context(|| format!("invalid listen address {}:{}", cli.host, cli.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(root = %root.display(), "serving project");
    info!("listening on http://{addr}");

    axum::serve(listener, app).await.context("server failed")?;
    Ok(())
}
