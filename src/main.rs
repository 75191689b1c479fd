//! Comic Offline - chapter downloader
//!
//! Downloads the chapters of a comic for offline reading and resumes
//! interrupted downloads on the next start.

use comic_offline::core::config::{CliArgs, Config};
use comic_offline::core::{
    self, DownloadJobInput, DownloadLibrary, Downloader, HostProbe, JobQueue, RetryPolicy,
    StorageService, TracingNotifier,
};
use comic_offline::remote::{ComicRemote, HttpComicRemote};
use comic_offline::{db, VERSION};

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Load configuration (CLI args > env vars > config file > defaults)
    let config = match Config::from_args(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Print error to stderr since logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match core::Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting comic-offline v{}", VERSION);
    info!(path = ?config.database.path, "Database configuration");
    info!(
        root_dir = ?config.storage.root_dir,
        base_url = %config.remote.base_url,
        "Storage and remote configuration"
    );

    std::fs::create_dir_all(&config.storage.root_dir)
        .map_err(|e| anyhow!("Failed to create directory {:?}: {}", config.storage.root_dir, e))?;

    info!("Initializing database...");
    let db = Arc::new(db::DatabaseManager::new(
        &config.database.path,
        config.database.connection_pool_size,
        Duration::from_millis(config.database.busy_timeout),
    )?);
    info!("Database initialized successfully");

    let storage = StorageService::new(&config.storage.root_dir);
    let remote: Arc<dyn ComicRemote> = Arc::new(HttpComicRemote::new(&config.remote)?);
    let retry = config.retry.policy();

    let downloader = Arc::new(Downloader::new(remote.clone(), db.clone(), storage.clone(), retry.clone()));
    let queue = Arc::new(JobQueue::new(
        downloader,
        db.clone(),
        Arc::new(HostProbe::new(&config.remote, &config.storage)?),
        Arc::new(TracingNotifier),
        &config.jobs,
    ));
    let library = DownloadLibrary::new(db.clone(), storage, queue.clone());

    queue.prune_finished_jobs(config.jobs.finished_job_retention_days).await?;
    let recovered = queue.recover_jobs().await?;

    if args.reclaim_orphans {
        library.reclaim_orphans().await?;
    }

    let mut enqueued = 0;
    if let Some(comic_link) = &args.comic {
        enqueued = enqueue_comic(&queue, remote.as_ref(), &retry, comic_link, &args.chapters).await?;
    }

    if recovered + enqueued == 0 {
        info!("Nothing to download");
        return Ok(());
    }

    let runner = tokio::spawn(Arc::clone(&queue).start());

    tokio::select! {
        _ = queue.wait_until_idle() => info!("All download jobs finished"),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; unfinished jobs resume on the next start");
        }
    }

    queue.shutdown();
    if let Err(e) = runner.await {
        warn!(error = %e, "Job runner ended abnormally");
    }

    let comics = library.comics().await?;
    let chapters: usize = comics.iter().map(|c| c.chapters.len()).sum();
    info!(comics = comics.len(), chapters, "Offline library");

    Ok(())
}

/// Enqueue the requested chapters of a comic, or all of them when none are named.
/// Oldest chapters go first.
async fn enqueue_comic(
    queue: &JobQueue,
    remote: &dyn ComicRemote,
    retry: &RetryPolicy,
    comic_link: &str,
    chapter_links: &[String],
) -> Result<usize> {
    let comic = retry.retry("comic_detail", || remote.comic_detail(comic_link)).await?;

    let selected = if chapter_links.is_empty() {
        comic.chapters.iter().rev().collect::<Vec<_>>()
    } else {
        chapter_links
            .iter()
            .map(|link| {
                comic
                    .chapters
                    .iter()
                    .find(|c| &c.chapter_link == link)
                    .ok_or_else(|| anyhow!("chapter {} is not listed by comic {}", link, comic_link))
            })
            .collect::<Result<Vec<_>>>()?
    };

    for chapter in &selected {
        queue
            .enqueue_download(DownloadJobInput {
                chapter: (*chapter).clone(),
                comic_link: comic.link.clone(),
                comic_name: comic.title.clone(),
            })
            .await?;
    }

    info!(comic_link = %comic_link, count = selected.len(), "Chapters enqueued");
    Ok(selected.len())
}
