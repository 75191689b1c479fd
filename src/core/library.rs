//! Offline library service
//!
//! Reads over downloaded comics and chapters, and the deletions that keep
//! the database, the job queue and the image files in step.

use crate::core::error::{ComicError, Result};
use crate::core::job_queue::JobQueue;
use crate::core::paths;
use crate::core::storage::StorageService;
use crate::db::manager::DatabaseManager;
use crate::db::models::{ChapterDeletion, ComicDeletion, DownloadedChapter, DownloadedComic};
use crate::db::repository::{ChapterRepository, ComicRepository, Repository};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// A downloaded comic with its chapters, highest order first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComicWithChapters {
    pub comic: DownloadedComic,
    pub chapters: Vec<DownloadedChapter>,
}

/// A downloaded chapter with its downloaded neighbours
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChapterForReading {
    pub chapter: DownloadedChapter,
    pub comic: DownloadedComic,
    /// Nearest downloaded chapter with a lower order
    pub prev_chapter_link: Option<String>,
    /// Nearest downloaded chapter with a higher order
    pub next_chapter_link: Option<String>,
}

fn require_link(link: &str, what: &str) -> Result<()> {
    if link.trim().is_empty() {
        return Err(ComicError::ValidationError(format!("{} link cannot be empty", what)));
    }
    Ok(())
}

pub struct DownloadLibrary {
    comics: ComicRepository,
    chapters: ChapterRepository,
    storage: StorageService,
    queue: Arc<JobQueue>,
}

impl DownloadLibrary {
    pub fn new(db: Arc<DatabaseManager>, storage: StorageService, queue: Arc<JobQueue>) -> Self {
        Self {
            comics: ComicRepository::new(db.clone()),
            chapters: ChapterRepository::new(db),
            storage,
            queue,
        }
    }

    /// Get all downloaded comics, most recently downloaded first
    pub async fn comics(&self) -> Result<Vec<ComicWithChapters>> {
        let comics = self.comics.find_all().await?;
        let mut result = Vec::with_capacity(comics.len());
        for comic in comics {
            let chapters = self.chapters.find_by_comic(&comic.link).await?;
            result.push(ComicWithChapters { comic, chapters });
        }
        Ok(result)
    }

    /// Get one downloaded comic
    pub async fn comic(&self, link: &str) -> Result<Option<ComicWithChapters>> {
        require_link(link, "Comic")?;

        let comic = match self.comics.find_by_id(link).await? {
            Some(comic) => comic,
            None => return Ok(None),
        };
        let chapters = self.chapters.find_by_comic(link).await?;
        Ok(Some(ComicWithChapters { comic, chapters }))
    }

    /// Get one downloaded chapter for reading
    pub async fn chapter(&self, link: &str) -> Result<Option<ChapterForReading>> {
        require_link(link, "Chapter")?;

        let chapter = match self.chapters.find_by_id(link).await? {
            Some(chapter) => chapter,
            None => return Ok(None),
        };
        let comic = self
            .comics
            .find_by_id(&chapter.comic_link)
            .await?
            .ok_or_else(|| ComicError::NotFound(format!("comic {} of chapter {}", chapter.comic_link, link)))?;

        // highest order first
        let siblings = self.chapters.find_by_comic(&chapter.comic_link).await?;
        let next_chapter_link = siblings
            .iter()
            .filter(|c| c.order > chapter.order)
            .last()
            .map(|c| c.chapter_link.clone());
        let prev_chapter_link = siblings
            .iter()
            .find(|c| c.order < chapter.order)
            .map(|c| c.chapter_link.clone());

        Ok(Some(ChapterForReading {
            chapter,
            comic,
            prev_chapter_link,
            next_chapter_link,
        }))
    }

    /// Delete a downloaded chapter: cancel its jobs, remove the row (and the
    /// comic if this was its last chapter), then remove the files.
    ///
    /// Steps already done are not undone when a later one fails. Calling it
    /// again is safe.
    pub async fn delete_chapter(&self, link: &str) -> Result<Option<ChapterDeletion>> {
        require_link(link, "Chapter")?;

        let cancelled = self.queue.cancel_by_tag_and_wait(link).await?;
        if cancelled > 0 {
            debug!(chapter_link = %link, cancelled, "Cancelled jobs before deleting chapter");
        }

        let deletion = match self.chapters.delete_with_comic_check(link).await? {
            Some(deletion) => deletion,
            None => return Ok(None),
        };

        let mut files: Vec<&str> = deletion.chapter.images.iter().map(String::as_str).collect();
        if let Some(comic) = &deletion.comic {
            files.push(&comic.thumbnail);
        }
        self.storage.delete_files(files).await?;

        info!(
            chapter_link = %link,
            comic_deleted = deletion.comic.is_some(),
            "Deleted downloaded chapter"
        );
        Ok(Some(deletion))
    }

    /// Delete a downloaded comic with all of its chapters
    pub async fn delete_comic(&self, link: &str) -> Result<Option<ComicDeletion>> {
        require_link(link, "Comic")?;

        let cancelled = self.queue.cancel_by_tag_and_wait(link).await?;
        if cancelled > 0 {
            debug!(comic_link = %link, cancelled, "Cancelled jobs before deleting comic");
        }

        let deletion = match self.comics.delete_returning(link).await? {
            Some(deletion) => deletion,
            None => return Ok(None),
        };

        let files = deletion
            .chapters
            .iter()
            .flat_map(|chapter| chapter.images.iter().map(String::as_str))
            .chain(std::iter::once(deletion.comic.thumbnail.as_str()));
        self.storage.delete_files(files).await?;

        info!(comic_link = %link, chapters = deletion.chapters.len(), "Deleted downloaded comic");
        Ok(Some(deletion))
    }

    /// Delete image files that no row references. Comics with unfinished jobs
    /// are left alone. Returns how many files were removed.
    pub async fn reclaim_orphans(&self) -> Result<usize> {
        let mut referenced = HashSet::new();
        for comic in self.comics.find_all().await? {
            referenced.insert(comic.thumbnail);
        }
        for chapter in self.chapters.find_all().await? {
            referenced.extend(chapter.images);
        }

        let protected: Vec<String> = self
            .queue
            .active_inputs()
            .await
            .iter()
            .map(|input| format!("{}/", paths::comic_dir(&input.comic_name)))
            .collect();

        let orphans: Vec<String> = self
            .storage
            .list_files(paths::IMAGES_DIR)
            .await?
            .into_iter()
            .filter(|file| !referenced.contains(file))
            .filter(|file| !protected.iter().any(|dir| file.starts_with(dir)))
            .collect();

        self.storage.delete_files(orphans.iter().map(String::as_str)).await?;

        info!(removed = orphans.len(), "Reclaimed orphaned image files");
        Ok(orphans.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::JobsConfig;
    use crate::core::constraints::StaticProbe;
    use crate::core::downloader::Downloader;
    use crate::core::job_queue::DownloadJobInput;
    use crate::core::notifications::TracingNotifier;
    use crate::core::retry::RetryPolicy;
    use crate::db::repository::{upsert_chapter, upsert_comic};
    use crate::remote::{ChapterSummary, InMemoryRemote};
    use std::time::Duration;

    struct Fixture {
        db: Arc<DatabaseManager>,
        library: DownloadLibrary,
        queue: Arc<JobQueue>,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(&dir.path().join("lib.db"), 2, Duration::from_secs(5)).unwrap());
        let storage = StorageService::new(dir.path());
        let downloader = Arc::new(Downloader::new(
            Arc::new(InMemoryRemote::new()),
            db.clone(),
            storage.clone(),
            RetryPolicy::default(),
        ));
        let config = JobsConfig {
            max_concurrent_jobs: 1,
            constraint_poll_interval_ms: 10,
            requires_network: false,
            requires_storage_not_low: false,
            finished_job_retention_days: 7,
        };
        let queue = Arc::new(JobQueue::new(
            downloader,
            db.clone(),
            Arc::new(StaticProbe::available()),
            Arc::new(TracingNotifier),
            &config,
        ));
        let library = DownloadLibrary::new(db.clone(), storage, queue.clone());
        Fixture { db, library, queue, dir }
    }

    fn comic(link: &str, name: &str) -> DownloadedComic {
        DownloadedComic {
            link: link.to_string(),
            title: name.to_string(),
            thumbnail: paths::thumbnail_path(name),
            remote_thumbnail: String::new(),
            view: String::new(),
            last_updated: String::new(),
            synopsis: String::new(),
            authors: vec![],
            categories: vec![],
        }
    }

    fn chapter(link: &str, comic_link: &str, comic_name: &str, order: i64) -> DownloadedChapter {
        DownloadedChapter {
            chapter_link: link.to_string(),
            chapter_name: link.to_string(),
            view: String::new(),
            time: String::new(),
            images: vec![paths::chapter_image_path(comic_name, link, 0)],
            comic_link: comic_link.to_string(),
            order,
            downloaded_at: format!("2024-02-0{}T00:00:00.000Z", order),
        }
    }

    /// Rows plus files on disk for one comic with the given chapter orders
    async fn seed(fx: &Fixture, link: &str, name: &str, orders: &[i64]) {
        let row = comic(link, name);
        fx.db.execute(move |conn| upsert_comic(conn, &row)).await.unwrap();
        write(fx, &paths::thumbnail_path(name));
        for order in orders {
            let ch = chapter(&format!("{}-c{}", link, order), link, name, *order);
            write(fx, &ch.images[0]);
            fx.db.execute(move |conn| upsert_chapter(conn, &ch)).await.unwrap();
        }
    }

    fn write(fx: &Fixture, relative: &str) {
        let path = fx.dir.path().join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    fn exists(fx: &Fixture, relative: &str) -> bool {
        fx.dir.path().join(relative).exists()
    }

    #[tokio::test]
    async fn test_chapter_neighbours() {
        let fx = fixture();
        seed(&fx, "m1", "One", &[1, 2, 4]).await;

        let middle = fx.library.chapter("m1-c2").await.unwrap().unwrap();
        assert_eq!(middle.prev_chapter_link.as_deref(), Some("m1-c1"));
        assert_eq!(middle.next_chapter_link.as_deref(), Some("m1-c4"));
        assert_eq!(middle.comic.title, "One");

        let last = fx.library.chapter("m1-c4").await.unwrap().unwrap();
        assert_eq!(last.next_chapter_link, None);

        assert!(fx.library.chapter("missing").await.unwrap().is_none());
        assert!(fx.library.chapter(" ").await.is_err());
    }

    #[tokio::test]
    async fn test_comics_listing_includes_chapters() {
        let fx = fixture();
        seed(&fx, "m1", "One", &[1, 2]).await;
        seed(&fx, "m2", "Two", &[5]).await;

        let comics = fx.library.comics().await.unwrap();
        assert_eq!(comics.len(), 2);
        assert_eq!(comics[0].comic.link, "m2");

        let one = fx.library.comic("m1").await.unwrap().unwrap();
        let links: Vec<_> = one.chapters.iter().map(|c| c.chapter_link.as_str()).collect();
        assert_eq!(links, vec!["m1-c2", "m1-c1"]);
    }

    #[tokio::test]
    async fn test_delete_chapter_keeps_comic_until_last() {
        let fx = fixture();
        seed(&fx, "m1", "One", &[1, 2]).await;

        let first = fx.library.delete_chapter("m1-c1").await.unwrap().unwrap();
        assert!(first.comic.is_none());
        assert!(!exists(&fx, "images/One/m1-c1/images_0.png"));
        assert!(exists(&fx, "images/One/thumbnail.png"));

        let last = fx.library.delete_chapter("m1-c2").await.unwrap().unwrap();
        assert!(last.comic.is_some());
        assert!(fx.library.comic("m1").await.unwrap().is_none());
        assert!(!exists(&fx, "images/One"));

        assert!(fx.library.delete_chapter("m1-c2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_comic_cancels_jobs_and_removes_files() {
        let fx = fixture();
        seed(&fx, "m1", "One", &[1, 2, 3]).await;
        let handle = fx
            .queue
            .enqueue_download(DownloadJobInput {
                chapter: ChapterSummary {
                    chapter_link: "m1-c4".into(),
                    chapter_name: "m1-c4".into(),
                    time: String::new(),
                    view: String::new(),
                },
                comic_link: "m1".into(),
                comic_name: "One".into(),
            })
            .await
            .unwrap();

        let deletion = fx.library.delete_comic("m1").await.unwrap().unwrap();

        assert_eq!(deletion.chapters.len(), 3);
        assert!(fx.queue.job(&handle.id).await.unwrap().unwrap().state.is_finished());
        assert!(ChapterRepository::new(fx.db.clone()).find_all().await.unwrap().is_empty());
        assert!(!exists(&fx, "images/One"));
    }

    #[tokio::test]
    async fn test_reclaim_orphans_skips_referenced_and_active() {
        let fx = fixture();
        seed(&fx, "m1", "One", &[1]).await;
        write(&fx, "images/One/stale/images_0.png");
        write(&fx, "images/Gone/c/images_0.png");
        write(&fx, "images/Busy/c/images_0.png");
        fx.queue
            .enqueue_download(DownloadJobInput {
                chapter: ChapterSummary {
                    chapter_link: "b1".into(),
                    chapter_name: "c".into(),
                    time: String::new(),
                    view: String::new(),
                },
                comic_link: "busy".into(),
                comic_name: "Busy".into(),
            })
            .await
            .unwrap();

        assert_eq!(fx.library.reclaim_orphans().await.unwrap(), 2);

        assert!(exists(&fx, "images/One/m1-c1/images_0.png"));
        assert!(exists(&fx, "images/One/thumbnail.png"));
        assert!(exists(&fx, "images/Busy/c/images_0.png"));
        assert!(!exists(&fx, "images/One/stale"));
        assert!(!exists(&fx, "images/Gone"));
    }
}
