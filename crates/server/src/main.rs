//! The morph cache server binary.

use anyhow::{Context, Result};
use clap::Parser;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use morph_cache::LocalArtifactCache;
use morph_cache_server::{AppState, create_router};
use morph_core::Config;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve a morph artifact cache over HTTP.
#[derive(Parser, Debug)]
#[command(name = "morph-cache-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "MORPH_CONFIG", default_value = "morph.toml")]
    config: String,

    /// Accept POST uploads and server-side fetches
    #[arg(long)]
    enable_writes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("morph-cache-server v{}", env!("CARGO_PKG_VERSION"));

    let mut figment = Figment::new();
    if std::path::Path::new(&args.config).exists() {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    }
    let config: Config = figment
        .merge(Env::prefixed("MORPH_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;

    let cache = Arc::new(
        LocalArtifactCache::new(config.artifact_dir()).context("failed to open artifact cache")?,
    );
    let enable_writes = args.enable_writes || config.server.enable_writes;
    if enable_writes {
        tracing::info!("writes enabled");
    }
    let state = AppState::new(cache, enable_writes);
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}
