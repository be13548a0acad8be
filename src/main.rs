use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use rust_media_delivery::config::Configuration;
use rust_media_delivery::events::{AssetId, Displayed};
use rust_media_delivery::library::LocalLibrary;
use rust_media_delivery::tasks::prefetch::PrefetchHandle;
use rust_media_delivery::tasks::slideshow::{self, Coordinator, PipelineId};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "media-delivery",
    version,
    about = "Prefetching slideshow over a local media library"
)]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Asset id (path relative to the library) to start the slideshow at
    #[arg(long, value_name = "ASSET_ID")]
    start: Option<String>,
    /// Sample the library randomly instead of paging through it in order
    #[arg(long)]
    shuffle: bool,
    /// Exit after this many slides have been displayed
    #[arg(long, value_name = "N")]
    slides: Option<usize>,
    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "rust_media_delivery=debug,media_delivery=debug,info",
        _ => "trace",
    };
    // RUST_LOG wins over -v
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        start,
        shuffle,
        slides,
        verbose,
    } = Args::parse();
    init_tracing(verbose);

    let mut cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    if shuffle {
        cfg.prefetch.shuffle = true;
    }
    tracing::debug!("Loaded configuration from {}:\n{:#?}", config.display(), cfg);

    let library = LocalLibrary::scan(&cfg.library_path, cfg.library_seed).with_context(|| {
        format!("failed to scan library at {}", cfg.library_path.display())
    })?;
    let library = Arc::new(library);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let (handle, prefetch_task) = PrefetchHandle::spawn(
        library.clone(),
        library.clone(),
        cfg.prefetch.clone(),
        cancel.clone(),
    );
    handle
        .start(start.map(AssetId))
        .await
        .context("failed to start prefetching")?;

    tracing::info!(
        assets = library.assets().len(),
        interval = %humantime::format_duration(cfg.prefetch.slideshow_interval),
        shuffle = cfg.prefetch.shuffle,
        "starting slideshow"
    );

    let (displayed_tx, mut displayed_rx) = mpsc::channel::<Displayed>(16);
    let mut tasks = JoinSet::new();

    tasks.spawn(async move {
        prefetch_task
            .await
            .context("prefetch task panicked")?
            .context("prefetch task failed")
    });

    tasks.spawn({
        let handle = handle.clone();
        let interval = cfg.prefetch.slideshow_interval;
        let cancel = cancel.clone();
        async move {
            slideshow::run(
                handle,
                interval,
                PipelineId(0),
                Coordinator::new(),
                displayed_tx,
                cancel,
            )
            .await
            .context("slideshow task failed")
        }
    });

    let mut shown = 0usize;
    while let Some(Displayed(id)) = displayed_rx.recv().await {
        shown += 1;
        tracing::info!(slide = shown, asset = %id, queued = handle.queue_depth(), "displayed");
        if slides.is_some_and(|limit| shown >= limit) {
            tracing::info!("slide limit reached; shutting down");
            break;
        }
    }
    // Ensure other tasks are asked to stop
    cancel.cancel();
    drop(displayed_rx);

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
    }

    Ok(())
}
