//! Durable persistence of a finished chapter download
//!
//! The comic row and the chapter row are written in one transaction. A
//! cancelled job, a chapter missing from the comic's list, or any database
//! error leaves both tables exactly as they were.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::error::{ComicError, Result};
use crate::db::models::{DownloadedChapter, DownloadedComic};
use crate::db::repository::{upsert_chapter, upsert_comic};
use crate::db::DatabaseManager;
use crate::remote::{ChapterDetail, ComicDetail};

/// Everything the pipeline gathered for one chapter
#[derive(Debug, Clone)]
pub struct CompletedDownload {
    pub chapter: ChapterDetail,
    pub comic: ComicDetail,
    /// Relative image paths in reading order
    pub images: Vec<String>,
    /// Relative path of the stored thumbnail
    pub thumbnail: String,
}

#[derive(Clone)]
pub struct ChapterPersistence {
    db: Arc<DatabaseManager>,
}

fn ensure_active(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ComicError::Cancelled)
    } else {
        Ok(())
    }
}

impl ChapterPersistence {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn persist(&self, download: CompletedDownload, cancel: &CancellationToken) -> Result<DownloadedChapter> {
        let cancel = cancel.clone();
        let chapter_link = download.chapter.chapter_link.clone();

        let chapter = self.db.immediate_transaction(move |tx| {
            let CompletedDownload { chapter, comic, images, thumbnail } = download;

            ensure_active(&cancel)?;

            let comic_row = DownloadedComic {
                link: comic.link.clone(),
                title: comic.title.clone(),
                thumbnail,
                remote_thumbnail: comic.thumbnail.clone(),
                view: comic.view.clone(),
                last_updated: comic.last_updated.clone(),
                synopsis: comic.shortened_content.clone(),
                authors: comic.authors.clone(),
                categories: comic.categories.clone(),
            };
            upsert_comic(tx, &comic_row)?;

            ensure_active(&cancel)?;

            let (order, summary) = comic.chapter_order(&chapter.chapter_link).ok_or_else(|| {
                ComicError::ValidationError(format!(
                    "chapter {} is not listed by comic {}",
                    chapter.chapter_link, comic.link
                ))
            })?;

            let chapter_row = DownloadedChapter {
                chapter_link: chapter.chapter_link.clone(),
                chapter_name: summary.chapter_name.clone(),
                view: summary.view.clone(),
                time: summary.time.clone(),
                images,
                comic_link: comic.link.clone(),
                order,
                downloaded_at: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            };
            upsert_chapter(tx, &chapter_row)?;

            ensure_active(&cancel)?;
            Ok(chapter_row)
        }).await?;

        info!(chapter_link = %chapter_link, order = chapter.order, images = chapter.images.len(), "Chapter persisted");
        Ok(chapter)
    }
}
