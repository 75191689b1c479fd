//! Chapter download orchestrator
//!
//! One run fetches the chapter metadata, every image in order, the comic
//! metadata and its thumbnail, and then persists the result in a single
//! transaction. Progress is reported at fixed checkpoints and after each
//! image. Every network and disk step is retried on its own budget, and
//! every wait gives way to the cancellation token.

use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::error::{ComicError, Result};
use crate::core::paths;
use crate::core::persistence::{ChapterPersistence, CompletedDownload};
use crate::core::progress::{DownloadProgress, ProgressTracker};
use crate::core::retry::RetryPolicy;
use crate::core::storage::StorageService;
use crate::db::models::DownloadedChapter;
use crate::db::DatabaseManager;
use crate::remote::{ChapterDetail, ComicDetail, ComicRemote};

/// Await `fut` unless the token fires first
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ComicError::Cancelled),
        result = fut => result,
    }
}

pub struct Downloader {
    remote: Arc<dyn ComicRemote>,
    storage: StorageService,
    persistence: ChapterPersistence,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(
        remote: Arc<dyn ComicRemote>,
        db: Arc<DatabaseManager>,
        storage: StorageService,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            remote,
            storage,
            persistence: ChapterPersistence::new(db),
            retry,
        }
    }

    /// Start a download in the background and observe it as a stream.
    ///
    /// The stream yields progress values and ends after 100 on success. On
    /// failure it yields one final `Err` and ends. Dropping the stream cancels
    /// the download.
    pub fn download_chapter(
        self: &Arc<Self>,
        chapter_link: impl Into<String>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<DownloadProgress>> + Send + 'static {
        let chapter_link = chapter_link.into();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = oneshot::channel();
        let run_cancel = cancel.child_token();
        let on_drop = run_cancel.clone().drop_guard();
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let result = this.run(&chapter_link, &run_cancel, progress_tx).await;
            let _ = result_tx.send(result);
        });

        stream::unfold(
            (progress_rx, Some(result_rx), on_drop),
            |(mut progress_rx, mut result_rx, on_drop)| async move {
                if let Some(progress) = progress_rx.recv().await {
                    return Some((Ok(progress), (progress_rx, result_rx, on_drop)));
                }
                // The sender is dropped when the run returns, so the outcome is ready
                match result_rx.take()?.await {
                    Ok(Ok(_)) => None,
                    Ok(Err(e)) => Some((Err(e), (progress_rx, None, on_drop))),
                    Err(_) => Some((
                        Err(ComicError::TaskError("download task ended without a result".to_string())),
                        (progress_rx, None, on_drop),
                    )),
                }
            },
        )
    }

    /// Run one download to completion, sending progress to `progress`
    pub async fn run(
        &self,
        chapter_link: &str,
        cancel: &CancellationToken,
        progress: mpsc::UnboundedSender<DownloadProgress>,
    ) -> Result<DownloadedChapter> {
        info!(chapter_link = %chapter_link, "Starting chapter download");
        let mut tracker = ProgressTracker::new(move |p| {
            let _ = progress.send(p);
        });

        let result = self.run_stages(chapter_link, cancel, &mut tracker).await;
        match &result {
            Ok(chapter) => info!(
                chapter_link = %chapter_link,
                order = chapter.order,
                images = chapter.images.len(),
                "Chapter download finished"
            ),
            Err(ComicError::Cancelled) => info!(chapter_link = %chapter_link, "Chapter download cancelled"),
            Err(e) => warn!(chapter_link = %chapter_link, error = %e, "Chapter download failed"),
        }
        result
    }

    async fn run_stages<F>(
        &self,
        chapter_link: &str,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker<F>,
    ) -> Result<DownloadedChapter>
    where
        F: FnMut(DownloadProgress),
    {
        tracker.report(DownloadProgress::START);

        let chapter = until_cancelled(cancel, self.fetch_chapter(chapter_link)).await?;
        tracker.report(DownloadProgress::METADATA_FETCHED);

        let images = self.fetch_images(&chapter, cancel, tracker).await?;
        tracker.report(DownloadProgress::IMAGES_DONE);

        let comic = until_cancelled(cancel, self.fetch_comic(&chapter.comic_link)).await?;
        let thumbnail = paths::thumbnail_path(&chapter.comic_name);
        until_cancelled(cancel, self.fetch_to_file("thumbnail", &comic.thumbnail, &thumbnail)).await?;
        tracker.report(DownloadProgress::COMIC_METADATA_FETCHED);

        // Not raced against the token: the transaction checks it itself and
        // must be allowed to finish either committing or rolling back.
        let persisted = self
            .persistence
            .persist(
                CompletedDownload {
                    chapter,
                    comic,
                    images,
                    thumbnail,
                },
                cancel,
            )
            .await?;
        tracker.report(DownloadProgress::PERSISTED);

        Ok(persisted)
    }

    async fn fetch_chapter(&self, chapter_link: &str) -> Result<ChapterDetail> {
        Ok(self
            .retry
            .retry("chapter_detail", || self.remote.chapter_detail(chapter_link))
            .await?)
    }

    async fn fetch_comic(&self, comic_link: &str) -> Result<ComicDetail> {
        Ok(self
            .retry
            .retry("comic_detail", || self.remote.comic_detail(comic_link))
            .await?)
    }

    /// Images are fetched one at a time, in order
    async fn fetch_images<F>(
        &self,
        chapter: &ChapterDetail,
        cancel: &CancellationToken,
        tracker: &mut ProgressTracker<F>,
    ) -> Result<Vec<String>>
    where
        F: FnMut(DownloadProgress),
    {
        let total = chapter.images.len();
        let mut stored = Vec::with_capacity(total);

        for (index, url) in chapter.images.iter().enumerate() {
            let path = paths::chapter_image_path(&chapter.comic_name, &chapter.chapter_name, index);
            until_cancelled(cancel, self.fetch_to_file("image", url, &path)).await?;
            stored.push(path);
            tracker.report(DownloadProgress::for_images(stored.len(), total));
        }

        Ok(stored)
    }

    /// Retried fetch-and-write of one remote file
    async fn fetch_to_file(&self, what: &str, url: &str, path: &str) -> Result<u64> {
        let bytes = self
            .retry
            .retry(what, || async {
                let body = self.remote.fetch_bytes(url).await.map_err(ComicError::from)?;
                self.storage.write_stream(path, body).await
            })
            .await?;
        debug!(url = %url, path = %path, bytes, "Fetched {}", what);
        Ok(bytes)
    }
}
