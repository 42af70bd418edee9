//! The morph command line tool.

mod gitcli;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use gitcli::GitCliRepoCache;
use morph_builder::{LocalBuilder, PlanExecutor};
use morph_cache::{
    ArtifactMeta, ClaimOutcome, LocalArtifactCache, RemoteArtifactCache, artifact_filename,
    build_log_filename, meta_filename,
};
use morph_core::graph::BuildGraph;
use morph_core::{CacheKey, Config, GitRepoCache, GraphBuilder, SourceResolver};
use morph_distbuild::protocol::{Message, StreamKind};
use morph_distbuild::{ControllerDaemon, InitiatorClient, WorkerDaemon};
use std::io::Read;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build Linux system images from morphology definitions.
#[derive(Parser)]
#[command(name = "morph")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "MORPH_CONFIG", default_value = "morph.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a system morphology locally
    Build {
        /// Path of the system morphology in the definitions repo
        morphology: String,
        /// Definitions repository URL or path
        #[arg(long, default_value = ".")]
        repo: String,
        /// Ref to build from
        #[arg(long = "ref", default_value = "HEAD")]
        ref_: String,
    },
    /// Build one unit by cache key; the build graph arrives on stdin
    BuildArtifact {
        /// 64-hex cache key of the unit to build
        cache_key: String,
        /// Read the graph from a file instead of stdin
        #[arg(long)]
        graph: Option<String>,
    },
    /// Resolve a system into its build graph and print it as JSON
    CalculateBuildGraph {
        morphology: String,
        #[arg(long, default_value = ".")]
        repo: String,
        #[arg(long = "ref", default_value = "HEAD")]
        ref_: String,
    },
    /// Build a system on the distributed build network
    Distbuild {
        morphology: String,
        #[arg(long, default_value = ".")]
        repo: String,
        #[arg(long = "ref", default_value = "HEAD")]
        ref_: String,
        /// Controller address; defaults to the configured bind address
        #[arg(long)]
        controller: Option<String>,
    },
    /// Run the distbuild controller daemon
    ControllerDaemon,
    /// Run the distbuild worker daemon
    WorkerDaemon,
}

fn load_config(path: &str) -> Result<Config> {
    let mut figment = Figment::new();
    if std::path::Path::new(path).exists() {
        figment = figment.merge(Toml::file(path));
    }
    let config: Config = figment
        .merge(Env::prefixed("MORPH_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("morph: internal error: {err:#}");
            ExitCode::from(127)
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = load_config(&cli.config)?;
    match cli.command {
        Commands::Build {
            morphology,
            repo,
            ref_,
        } => cmd_build(config, &repo, &ref_, &morphology).await,
        Commands::BuildArtifact { cache_key, graph } => {
            cmd_build_artifact(config, &cache_key, graph.as_deref()).await
        }
        Commands::CalculateBuildGraph {
            morphology,
            repo,
            ref_,
        } => cmd_calculate_build_graph(config, &repo, &ref_, &morphology).await,
        Commands::Distbuild {
            morphology,
            repo,
            ref_,
            controller,
        } => cmd_distbuild(config, &repo, &ref_, &morphology, controller.as_deref()).await,
        Commands::ControllerDaemon => {
            let git: Arc<dyn GitRepoCache> =
                Arc::new(GitCliRepoCache::new(config.git_dir()).context("open git cache")?);
            let daemon = ControllerDaemon::bind(config, git)
                .await
                .context("bind controller")?;
            daemon.run().await.context("controller daemon")?;
            Ok(0)
        }
        Commands::WorkerDaemon => {
            let daemon = WorkerDaemon::bind(&config.distbuild.worker_bind)
                .await
                .context("bind worker")?;
            daemon.run().await.context("worker daemon")?;
            Ok(0)
        }
    }
}

/// Resolve the graph for `(repo, ref, morphology)`.
async fn resolve(
    config: &Config,
    git: Arc<dyn GitRepoCache>,
    repo: &str,
    ref_: &str,
    morphology: &str,
) -> Result<BuildGraph> {
    let resolver = SourceResolver::new(git);
    GraphBuilder::new(&resolver, config)
        .build(repo, ref_, morphology)
        .await
        .with_context(|| format!("resolving {morphology}"))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            token.cancel();
        }
    });
    cancel
}

async fn cmd_build(config: Config, repo: &str, ref_: &str, morphology: &str) -> Result<u8> {
    let git: Arc<dyn GitRepoCache> =
        Arc::new(GitCliRepoCache::new(config.git_dir()).context("open git cache")?);
    let graph = match resolve(&config, git.clone(), repo, ref_, morphology).await {
        Ok(graph) => Arc::new(graph),
        Err(err) => {
            eprintln!("morph: {err:#}");
            return Ok(1);
        }
    };

    let cache = Arc::new(LocalArtifactCache::new(config.artifact_dir())?);
    std::fs::create_dir_all(&config.work_dir)?;
    let width = config.build_width;
    let builder = Arc::new(LocalBuilder::new(config, cache, git));

    let report = PlanExecutor::new(width)
        .execute(graph.clone(), builder, cancel_on_ctrl_c())
        .await;

    if report.succeeded() {
        if let Some(root) = graph.root() {
            println!("{}.{}.{}", root.cache_key, root.kind, root.name);
        }
        Ok(0)
    } else {
        eprintln!(
            "morph: build failed: {}",
            report.first_failure().unwrap_or("cancelled")
        );
        Ok(1)
    }
}

async fn cmd_calculate_build_graph(
    config: Config,
    repo: &str,
    ref_: &str,
    morphology: &str,
) -> Result<u8> {
    let git: Arc<dyn GitRepoCache> =
        Arc::new(GitCliRepoCache::new(config.git_dir()).context("open git cache")?);
    match resolve(&config, git, repo, ref_, morphology).await {
        Ok(graph) => {
            println!("{}", graph.to_json()?);
            Ok(0)
        }
        Err(err) => {
            eprintln!("morph: {err:#}");
            Ok(1)
        }
    }
}

async fn cmd_build_artifact(
    config: Config,
    cache_key: &str,
    graph_path: Option<&str>,
) -> Result<u8> {
    let key = CacheKey::from_hex(cache_key).context("invalid cache key argument")?;
    let graph_text = match graph_path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading graph from {path}"))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("reading graph from stdin")?;
            text
        }
    };
    let graph = Arc::new(BuildGraph::from_json(&graph_text).context("parsing build graph")?);
    let Some(index) = graph.find_by_key(&key) else {
        eprintln!("morph: cache key {key} is not in the build graph");
        return Ok(1);
    };

    let cache = Arc::new(LocalArtifactCache::new(config.artifact_dir())?);
    std::fs::create_dir_all(&config.work_dir)?;
    let shared = match &config.shared_cache {
        Some(url) => Some(RemoteArtifactCache::new(url)?),
        None => None,
    };

    // Pull any dependency artifacts the local cache is missing.
    let mut dep_keys: Vec<CacheKey> = graph
        .units
        .iter()
        .filter(|u| u.cache_key == key)
        .flat_map(|u| u.dependencies.iter().map(|&i| graph.units[i].cache_key))
        .collect();
    dep_keys.sort_unstable();
    dep_keys.dedup();
    for dep_key in dep_keys {
        if cache.is_built(&dep_key) {
            continue;
        }
        let Some(shared) = &shared else {
            eprintln!("morph: dependency {dep_key} not cached and no shared cache configured");
            return Ok(1);
        };
        if let Err(err) = fetch_group(&cache, shared, &graph, &dep_key).await {
            eprintln!("morph: fetching {dep_key}: {err:#}");
            return Ok(1);
        }
    }

    let git: Arc<dyn GitRepoCache> =
        Arc::new(GitCliRepoCache::new(config.git_dir()).context("open git cache")?);
    let builder = LocalBuilder::new(config, cache.clone(), git);
    use morph_builder::UnitBuilder;
    match builder.build(graph.clone(), index, cancel_on_ctrl_c()).await {
        Ok(outcome) => {
            tracing::info!(key = %key, outcome = ?outcome, "unit terminal");
        }
        Err(err) => {
            eprintln!("morph: build failed: {err}");
            return Ok(1);
        }
    }

    if let Some(shared) = &shared {
        if let Err(err) = upload_group(&cache, shared, &key).await {
            eprintln!("morph: uploading {key}: {err:#}");
            return Ok(1);
        }
    }
    Ok(0)
}

/// Download one key group (sidecars first) from the shared cache into the
/// local store. Sidecars are small and buffered; artifact tarballs stream
/// straight into their partial files.
async fn fetch_group(
    cache: &LocalArtifactCache,
    shared: &RemoteArtifactCache,
    graph: &BuildGraph,
    key: &CacheKey,
) -> Result<()> {
    let mut meta_sink = std::io::Cursor::new(Vec::new());
    shared.get(&meta_filename(key), &mut meta_sink).await?;
    let meta: ArtifactMeta =
        serde_json::from_slice(meta_sink.get_ref()).context("parsing remote metadata")?;
    let mut log_sink = std::io::Cursor::new(Vec::new());
    shared.get(&build_log_filename(key), &mut log_sink).await?;

    let mut claim = match cache.claim(key)? {
        ClaimOutcome::Done => return Ok(()),
        ClaimOutcome::Busy => anyhow::bail!("local cache busy for {key}"),
        ClaimOutcome::Claimed(claim) => claim,
    };
    std::fs::write(claim.build_log_partial(), log_sink.get_ref())?;

    let kind = graph
        .units
        .iter()
        .find(|u| &u.cache_key == key)
        .map(|u| u.kind)
        .unwrap_or(meta.kind);
    for artifact in &meta.artifacts {
        let partial = claim.artifact_partial(kind, artifact);
        let mut file = tokio::fs::File::create(&partial)
            .await
            .with_context(|| format!("creating {}", partial.display()))?;
        shared
            .get(&artifact_filename(key, kind, artifact), &mut file)
            .await?;
    }
    claim.write_meta(&meta)?;
    claim.commit()?;
    tracing::info!(key = %key, "fetched dependency group from shared cache");
    Ok(())
}

/// Upload one key group to the shared cache.
async fn upload_group(
    cache: &LocalArtifactCache,
    shared: &RemoteArtifactCache,
    key: &CacheKey,
) -> Result<()> {
    let meta = cache.read_meta(key)?;
    let mut files = Vec::new();
    files.push((
        build_log_filename(key),
        cache.read_build_log(key)?.into_bytes(),
    ));
    for artifact in &meta.artifacts {
        let filename = artifact_filename(key, meta.kind, artifact);
        let bytes = std::fs::read(cache.dir().join(&filename))
            .with_context(|| format!("reading {filename}"))?;
        files.push((filename, bytes));
    }
    files.push((meta_filename(key), serde_json::to_vec(&meta)?));
    shared.upload(files).await?;
    tracing::info!(key = %key, "uploaded group to shared cache");
    Ok(())
}

async fn cmd_distbuild(
    config: Config,
    repo: &str,
    ref_: &str,
    morphology: &str,
    controller: Option<&str>,
) -> Result<u8> {
    let addr = controller
        .map(|s| s.to_string())
        .unwrap_or_else(|| config.distbuild.controller_bind.clone());
    let mut client = InitiatorClient::connect(&addr)
        .await
        .with_context(|| format!("connecting to controller at {addr}"))?;
    let id = client.send_build_request(repo, ref_, morphology).await?;
    println!("build request {id} submitted to {addr}");

    let cancel = cancel_on_ctrl_c();
    let mut cancelled = false;
    loop {
        if cancel.is_cancelled() && !cancelled {
            client.send_cancel(&id).await?;
            cancelled = true;
        }
        let message = tokio::select! {
            _ = cancel.cancelled(), if !cancelled => continue,
            message = client.next() => message?,
        };
        let Some(message) = message else {
            eprintln!("morph: controller hung up");
            return Ok(1);
        };
        if message.id() != id {
            continue;
        }
        match message {
            Message::BuildProgress {
                step,
                n,
                total,
                message,
                ..
            } => {
                println!("[{n}/{total}] {step}: {message}");
            }
            Message::BuildOutput { stream, text, .. } => match stream {
                StreamKind::Stdout => println!("{text}"),
                StreamKind::Stderr => eprintln!("{text}"),
            },
            Message::BuildFinished { .. } => {
                println!("build finished");
                return Ok(0);
            }
            Message::BuildFailed { reason, .. } => {
                eprintln!("morph: build failed: {reason}");
                return Ok(1);
            }
            _ => {}
        }
    }
}
