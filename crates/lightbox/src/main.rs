//! Lightbox thumbnail cache manager.
//!
//! Indexes a media library into SQLite and keeps a disk cache of thumbnails
//! converged with it. One-shot scans and generation passes for scripting, a
//! long-lived watch mode for servers, and single-item generation for
//! debugging a specific file.
//!
//! # Example
//!
//! ```bash
//! # Index the library and generate everything missing
//! lightbox run ~/Pictures
//!
//! # Keep converging until interrupted
//! lightbox watch ~/Pictures
//!
//! # One thumbnail, written to a file
//! lightbox thumb ~/Pictures trips/a.jpg -o preview.jpg
//!
//! # Cache state for scripting
//! lightbox status ~/Pictures --json
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use media_index::SqliteIndex;
use thumbnail_engine::{CacheKey, EngineConfig, MediaIndex, MediaKind, Orchestrator};

#[derive(Debug, Parser)]
#[command(name = "lightbox")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Index the library without generating thumbnails
    Scan(LibraryArgs),
    /// Scan, then run one generation pass
    Run(RunArgs),
    /// Scan and generate on an interval until interrupted
    Watch(WatchArgs),
    /// Generate (or fetch) a single thumbnail
    Thumb(ThumbArgs),
    /// Print cache and run state
    Status(StatusArgs),
}

#[derive(Debug, Args)]
struct LibraryArgs {
    /// Library root directory
    #[arg(value_name = "LIBRARY")]
    library: PathBuf,

    /// Data directory for the index and cache (default: per-library dir
    /// under the user cache directory)
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Batch workers; 0 picks a count from the CPU
    #[arg(long, value_name = "N", default_value = "0")]
    workers: usize,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[command(flatten)]
    library: LibraryArgs,

    /// Regenerate everything missing instead of only recent changes
    #[arg(long)]
    full: bool,
}

#[derive(Debug, Args)]
struct WatchArgs {
    #[command(flatten)]
    library: LibraryArgs,

    /// Seconds between library rescans
    #[arg(long, value_name = "SECS", default_value = "600")]
    scan_interval: u64,

    /// Seconds between scheduled generation passes
    #[arg(long, value_name = "SECS", default_value = "3600")]
    run_interval: u64,
}

#[derive(Debug, Args)]
struct ThumbArgs {
    #[command(flatten)]
    library: LibraryArgs,

    /// File or folder to thumbnail, absolute or relative to the library
    #[arg(value_name = "PATH")]
    path: PathBuf,

    /// Write the thumbnail here instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct StatusArgs {
    #[command(flatten)]
    library: LibraryArgs,

    /// Machine-readable output
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Scan(args) => cmd_scan(args),
        Commands::Run(args) => cmd_run(args).await,
        Commands::Watch(args) => cmd_watch(args).await,
        Commands::Thumb(args) => cmd_thumb(args).await,
        Commands::Status(args) => cmd_status(args).await,
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Index/cache layout for one library: a per-library directory keyed by the
/// library path, holding `index.db` and a `thumbnails/` cache.
struct Workspace {
    config: EngineConfig,
    index_path: PathBuf,
}

fn workspace_for(args: &LibraryArgs) -> Result<Workspace> {
    let library_root = args
        .library
        .canonicalize()
        .with_context(|| format!("library not found: {}", args.library.display()))?;
    if !library_root.is_dir() {
        bail!("library is not a directory: {}", library_root.display());
    }

    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => {
            let slug = CacheKey::for_source(&library_root, MediaKind::Folder);
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("lightbox")
                .join(slug.stem())
        }
    };

    let config = EngineConfig {
        library_root,
        cache_dir: data_dir.join("thumbnails"),
        worker_count: args.workers,
        ..EngineConfig::default()
    };
    Ok(Workspace {
        config,
        index_path: data_dir.join("index.db"),
    })
}

fn open_and_scan(workspace: &Workspace) -> Result<Arc<SqliteIndex>> {
    let index = Arc::new(SqliteIndex::open(&workspace.index_path)?);
    let summary = index.scan_library(&workspace.config.library_root)?;
    println!(
        "indexed {} files and {} folders ({} removed)",
        summary.files, summary.folders, summary.removed
    );
    Ok(index)
}

fn cmd_scan(args: LibraryArgs) -> Result<()> {
    let workspace = workspace_for(&args)?;
    open_and_scan(&workspace)?;
    Ok(())
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let workspace = workspace_for(&args.library)?;
    let index = open_and_scan(&workspace)?;

    thumbnail_engine::init_native_backend()?;
    let orch = Orchestrator::new(&workspace.config, index as Arc<dyn MediaIndex>);
    orch.run_once(args.full).await;

    let status = orch.status().await;
    if let Some(run) = status.run {
        println!(
            "{} run: {} generated, {} skipped, {} failed, {} orphans removed",
            run.mode, run.generated, run.skipped, run.failed, run.orphans_removed
        );
    }
    println!(
        "cache: {} entries, {} at {}",
        status.cached_count,
        status.cached_size_human,
        status.cache_dir.display()
    );
    thumbnail_engine::shutdown_native_backend();
    Ok(())
}

async fn cmd_watch(args: WatchArgs) -> Result<()> {
    let workspace = {
        let mut workspace = workspace_for(&args.library)?;
        workspace.config.run_interval_secs = args.run_interval.max(1);
        workspace
    };
    let index = open_and_scan(&workspace)?;

    thumbnail_engine::init_native_backend()?;
    let orch = Arc::new(Orchestrator::new(
        &workspace.config,
        Arc::clone(&index) as Arc<dyn MediaIndex>,
    ));
    // The initial scan above seeds the first pass.
    orch.notify_index_complete();

    let looper = Arc::clone(&orch);
    let loop_task = tokio::spawn(async move { looper.run_loop().await });

    let scan_index = Arc::clone(&index);
    let scan_orch = Arc::clone(&orch);
    let scan_root = workspace.config.library_root.clone();
    let scan_interval = std::time::Duration::from_secs(args.scan_interval.max(1));
    let scan_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scan_interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let index = Arc::clone(&scan_index);
            let root = scan_root.clone();
            match tokio::task::spawn_blocking(move || index.scan_library(&root)).await {
                Ok(Ok(summary)) => {
                    info!(
                        "rescan: {} files, {} folders, {} removed",
                        summary.files, summary.folders, summary.removed
                    );
                    scan_orch.notify_index_complete();
                }
                Ok(Err(e)) => tracing::warn!("rescan failed: {e:#}"),
                Err(e) => tracing::warn!("rescan task failed: {e}"),
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for interrupt")?;
    info!("interrupt received, shutting down");
    orch.stop();
    scan_task.abort();
    let _ = loop_task.await;
    thumbnail_engine::shutdown_native_backend();
    Ok(())
}

async fn cmd_thumb(args: ThumbArgs) -> Result<()> {
    let workspace = workspace_for(&args.library)?;
    let index = Arc::new(SqliteIndex::open(&workspace.index_path)?);

    let (rel, kind) = resolve_target(&workspace.config.library_root, &args.path)?;
    thumbnail_engine::init_native_backend()?;
    let orch = Orchestrator::new(&workspace.config, index as Arc<dyn MediaIndex>);
    let bytes = orch.thumbnail(&rel, kind).await?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &bytes)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("wrote {} bytes to {}", bytes.len(), path.display());
        }
        None => std::io::stdout().write_all(&bytes)?,
    }
    thumbnail_engine::shutdown_native_backend();
    Ok(())
}

async fn cmd_status(args: StatusArgs) -> Result<()> {
    let workspace = workspace_for(&args.library)?;
    let index = Arc::new(SqliteIndex::open(&workspace.index_path)?);
    let indexed = index.count()?;
    let last_run = index.last_run().await.map_err(anyhow::Error::new)?;

    let orch = Orchestrator::new(&workspace.config, index as Arc<dyn MediaIndex>);
    let status = orch.status().await;

    if args.json {
        let mut value = serde_json::to_value(&status)?;
        value["indexed_count"] = serde_json::json!(indexed);
        value["last_run"] = serde_json::json!(last_run.map(|t| t.to_rfc3339()));
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("library:  {}", workspace.config.library_root.display());
    println!("indexed:  {indexed} items");
    println!(
        "cache:    {} entries, {} at {}",
        status.cached_count,
        status.cached_size_human,
        status.cache_dir.display()
    );
    match last_run {
        Some(at) => println!("last run: {}", at.to_rfc3339()),
        None => println!("last run: never"),
    }
    Ok(())
}

/// Map a user-supplied path to a library-relative path and media kind.
/// Directories become folder composites.
fn resolve_target(library_root: &Path, path: &Path) -> Result<(String, MediaKind)> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        library_root.join(path)
    };
    let rel = abs
        .strip_prefix(library_root)
        .map_err(|_| anyhow::anyhow!("{} is outside the library", abs.display()))?;
    let rel = rel
        .to_str()
        .context("path is not valid UTF-8")?
        .to_string();
    let kind = if abs.is_dir() {
        MediaKind::Folder
    } else {
        MediaKind::from_path(&abs)
    };
    Ok((rel, kind))
}
