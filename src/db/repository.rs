//! Repository pattern implementation for database access

use crate::core::error::Result;
use crate::db::manager::DatabaseManager;
use crate::db::models::{ChapterDeletion, ComicDeletion, DownloadedChapter, DownloadedComic, JobRecord};
use async_trait::async_trait;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Read access shared by the library repositories. Rows are only written by
/// chapter persistence and the aggregate deletes below.
#[async_trait]
pub trait Repository<T>: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<T>>;

    async fn find_all(&self) -> Result<Vec<T>>;
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

// ---------------------------------------------------------------------------
// Comics
// ---------------------------------------------------------------------------

const COMIC_COLUMNS: &str =
    "link, title, thumbnail, remote_thumbnail, view, last_updated, synopsis, authors, categories";

fn map_comic(row: &Row<'_>) -> rusqlite::Result<DownloadedComic> {
    Ok(DownloadedComic {
        link: row.get(0)?,
        title: row.get(1)?,
        thumbnail: row.get(2)?,
        remote_thumbnail: row.get(3)?,
        view: row.get(4)?,
        last_updated: row.get(5)?,
        synopsis: row.get(6)?,
        authors: json_column(row, 7)?,
        categories: json_column(row, 8)?,
    })
}

pub(crate) fn select_comic(conn: &Connection, link: &str) -> Result<Option<DownloadedComic>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM downloaded_comics WHERE link = ?", COMIC_COLUMNS),
            [link],
            map_comic,
        )
        .optional()?)
}

/// Insert or refresh a comic row, keyed by link
pub(crate) fn upsert_comic(conn: &Connection, comic: &DownloadedComic) -> Result<()> {
    conn.execute(
        "INSERT INTO downloaded_comics \
         (link, title, thumbnail, remote_thumbnail, view, last_updated, synopsis, authors, categories) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(link) DO UPDATE SET \
         title = excluded.title, thumbnail = excluded.thumbnail, \
         remote_thumbnail = excluded.remote_thumbnail, view = excluded.view, \
         last_updated = excluded.last_updated, synopsis = excluded.synopsis, \
         authors = excluded.authors, categories = excluded.categories",
        rusqlite::params![
            &comic.link,
            &comic.title,
            &comic.thumbnail,
            &comic.remote_thumbnail,
            &comic.view,
            &comic.last_updated,
            &comic.synopsis,
            to_json(&comic.authors)?,
            to_json(&comic.categories)?,
        ],
    )?;
    Ok(())
}

pub struct ComicRepository {
    db: Arc<DatabaseManager>,
}

impl ComicRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Delete a comic and, through the cascade, its chapters. Returns what was
    /// removed so the caller can clean up files.
    pub async fn delete_returning(&self, link: &str) -> Result<Option<ComicDeletion>> {
        let link = link.to_string();
        self.db.immediate_transaction(move |tx| {
            let comic = match select_comic(tx, &link)? {
                Some(comic) => comic,
                None => return Ok(None),
            };
            let chapters = select_chapters_by_comic(tx, &link)?;
            tx.execute("DELETE FROM downloaded_comics WHERE link = ?", [&link])?;
            Ok(Some(ComicDeletion { comic, chapters }))
        }).await
    }
}

#[async_trait]
impl Repository<DownloadedComic> for ComicRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<DownloadedComic>> {
        let id = id.to_string();
        self.db.execute(move |conn| select_comic(conn, &id)).await
    }

    /// Most recently downloaded first
    async fn find_all(&self) -> Result<Vec<DownloadedComic>> {
        self.db.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM downloaded_comics c \
                 ORDER BY (SELECT MAX(downloaded_at) FROM downloaded_chapters d WHERE d.comic_link = c.link) DESC, \
                 title ASC",
                COMIC_COLUMNS
            ))?;
            let comics = stmt
                .query_map([], map_comic)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(comics)
        }).await
    }
}

// ---------------------------------------------------------------------------
// Chapters
// ---------------------------------------------------------------------------

const CHAPTER_COLUMNS: &str =
    "chapter_link, chapter_name, view, time, images, comic_link, chapter_order, downloaded_at";

fn map_chapter(row: &Row<'_>) -> rusqlite::Result<DownloadedChapter> {
    Ok(DownloadedChapter {
        chapter_link: row.get(0)?,
        chapter_name: row.get(1)?,
        view: row.get(2)?,
        time: row.get(3)?,
        images: json_column(row, 4)?,
        comic_link: row.get(5)?,
        order: row.get(6)?,
        downloaded_at: row.get(7)?,
    })
}

pub(crate) fn select_chapter(conn: &Connection, link: &str) -> Result<Option<DownloadedChapter>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM downloaded_chapters WHERE chapter_link = ?", CHAPTER_COLUMNS),
            [link],
            map_chapter,
        )
        .optional()?)
}

fn select_chapters_by_comic(conn: &Connection, comic_link: &str) -> Result<Vec<DownloadedChapter>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM downloaded_chapters WHERE comic_link = ? ORDER BY chapter_order DESC",
        CHAPTER_COLUMNS
    ))?;
    let chapters = stmt
        .query_map([comic_link], map_chapter)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(chapters)
}

/// Insert or refresh a chapter row, keyed by chapter link
pub(crate) fn upsert_chapter(conn: &Connection, chapter: &DownloadedChapter) -> Result<()> {
    conn.execute(
        "INSERT INTO downloaded_chapters \
         (chapter_link, chapter_name, view, time, images, comic_link, chapter_order, downloaded_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(chapter_link) DO UPDATE SET \
         chapter_name = excluded.chapter_name, view = excluded.view, time = excluded.time, \
         images = excluded.images, comic_link = excluded.comic_link, \
         chapter_order = excluded.chapter_order, downloaded_at = excluded.downloaded_at",
        rusqlite::params![
            &chapter.chapter_link,
            &chapter.chapter_name,
            &chapter.view,
            &chapter.time,
            to_json(&chapter.images)?,
            &chapter.comic_link,
            &chapter.order,
            &chapter.downloaded_at,
        ],
    )?;
    Ok(())
}

pub struct ChapterRepository {
    db: Arc<DatabaseManager>,
}

impl ChapterRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    /// Chapters of a comic, highest order (newest) first
    pub async fn find_by_comic(&self, comic_link: &str) -> Result<Vec<DownloadedChapter>> {
        let comic_link = comic_link.to_string();
        self.db.execute(move |conn| select_chapters_by_comic(conn, &comic_link)).await
    }

    /// Delete a chapter and, if it was the comic's last one, the comic too.
    /// Both happen in one write transaction so a concurrent insert for the
    /// same comic cannot slip in between the count and the delete.
    pub async fn delete_with_comic_check(&self, chapter_link: &str) -> Result<Option<ChapterDeletion>> {
        let chapter_link = chapter_link.to_string();
        self.db.immediate_transaction(move |tx| {
            let chapter = match select_chapter(tx, &chapter_link)? {
                Some(chapter) => chapter,
                None => return Ok(None),
            };

            tx.execute("DELETE FROM downloaded_chapters WHERE chapter_link = ?", [&chapter_link])?;

            let remaining: i64 = tx.query_row(
                "SELECT COUNT(*) FROM downloaded_chapters WHERE comic_link = ?",
                [&chapter.comic_link],
                |row| row.get(0),
            )?;

            let comic = if remaining == 0 {
                let comic = select_comic(tx, &chapter.comic_link)?;
                tx.execute("DELETE FROM downloaded_comics WHERE link = ?", [&chapter.comic_link])?;
                comic
            } else {
                None
            };

            Ok(Some(ChapterDeletion { chapter, comic }))
        }).await
    }
}

#[async_trait]
impl Repository<DownloadedChapter> for ChapterRepository {
    async fn find_by_id(&self, id: &str) -> Result<Option<DownloadedChapter>> {
        let id = id.to_string();
        self.db.execute(move |conn| select_chapter(conn, &id)).await
    }

    async fn find_all(&self) -> Result<Vec<DownloadedChapter>> {
        self.db.execute(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM downloaded_chapters ORDER BY comic_link, chapter_order DESC",
                CHAPTER_COLUMNS
            ))?;
            let chapters = stmt
                .query_map([], map_chapter)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(chapters)
        }).await
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

const JOB_COLUMNS: &str =
    "id, chapter_link, comic_link, tags, input, constraints, state, progress, error, created_at, updated_at";

fn map_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    Ok(JobRecord {
        id: row.get(0)?,
        chapter_link: row.get(1)?,
        comic_link: row.get(2)?,
        tags: row.get(3)?,
        input: row.get(4)?,
        constraints: row.get(5)?,
        state: row.get(6)?,
        progress: row.get(7)?,
        error: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub struct JobRepository {
    db: Arc<DatabaseManager>,
}

impl JobRepository {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: &str) -> Result<Option<JobRecord>> {
        let id = id.to_string();
        self.db.execute(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM download_jobs WHERE id = ?", JOB_COLUMNS),
                    [&id],
                    map_job,
                )
                .optional()?)
        }).await
    }

    pub async fn create(&self, job: &JobRecord) -> Result<()> {
        let job = job.clone();
        self.db.execute(move |conn| {
            conn.execute(
                "INSERT INTO download_jobs \
                 (id, chapter_link, comic_link, tags, input, constraints, state, progress, error, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &job.id,
                    &job.chapter_link,
                    &job.comic_link,
                    &job.tags,
                    &job.input,
                    &job.constraints,
                    &job.state,
                    &job.progress,
                    &job.error,
                    &job.created_at,
                    &job.updated_at,
                ],
            )?;
            Ok(())
        }).await
    }

    pub async fn find_by_state(&self, state: &str) -> Result<Vec<JobRecord>> {
        let state = state.to_string();
        self.db.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM download_jobs WHERE state = ? ORDER BY created_at ASC, rowid ASC",
                JOB_COLUMNS
            ))?;
            let jobs = stmt
                .query_map([&state], map_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs)
        }).await
    }

    /// Jobs carrying `tag`, oldest first
    pub async fn find_by_tag(&self, tag: &str) -> Result<Vec<JobRecord>> {
        let tag = tag.to_string();
        self.db.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM download_jobs \
                 WHERE EXISTS (SELECT 1 FROM json_each(download_jobs.tags) WHERE value = ?) \
                 ORDER BY created_at ASC, rowid ASC",
                JOB_COLUMNS
            ))?;
            let jobs = stmt
                .query_map([&tag], map_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs)
        }).await
    }

    pub async fn update_state(&self, id: &str, state: &str, progress: i32, error: Option<String>) -> Result<()> {
        let id = id.to_string();
        let state = state.to_string();
        self.db.execute(move |conn| {
            conn.execute(
                "UPDATE download_jobs SET state = ?, progress = ?, error = ?, updated_at = ? WHERE id = ?",
                rusqlite::params![&state, progress, &error, now(), &id],
            )?;
            Ok(())
        }).await
    }

    /// Put jobs that were queued or running when the process died back in the queue
    pub async fn requeue_unfinished(&self) -> Result<usize> {
        self.db.execute(|conn| {
            let count = conn.execute(
                "UPDATE download_jobs SET state = 'enqueued', progress = 0, updated_at = ? \
                 WHERE state IN ('enqueued', 'running')",
                [now()],
            )?;
            Ok(count)
        }).await
    }

    /// Drop finished jobs last touched before `cutoff` (RFC 3339)
    pub async fn delete_finished_before(&self, cutoff: &str) -> Result<usize> {
        let cutoff = cutoff.to_string();
        self.db.execute(move |conn| {
            let count = conn.execute(
                "DELETE FROM download_jobs \
                 WHERE state IN ('succeeded', 'failed', 'cancelled') AND updated_at < ?",
                [&cutoff],
            )?;
            Ok(count)
        }).await
    }
}
