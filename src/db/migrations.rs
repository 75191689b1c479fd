//! Database migrations
//!
//! Versions are tracked in `schema_migrations`; each migration is applied in
//! its own transaction together with its version row.

use crate::core::error::Result;
use rusqlite::Connection;
use tracing::{info, warn};

const MIGRATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
)
"#;

/// Initial schema (version 1)
const MIGRATION_V1: &str = r#"
-- Comics with at least one downloaded chapter
CREATE TABLE IF NOT EXISTS downloaded_comics (
    link TEXT PRIMARY KEY NOT NULL,
    title TEXT NOT NULL,
    thumbnail TEXT NOT NULL,
    remote_thumbnail TEXT NOT NULL,
    view TEXT NOT NULL DEFAULT '',
    last_updated TEXT NOT NULL DEFAULT '',
    synopsis TEXT NOT NULL DEFAULT '',
    authors TEXT NOT NULL DEFAULT '[]',
    categories TEXT NOT NULL DEFAULT '[]',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Chapters stored on disk
CREATE TABLE IF NOT EXISTS downloaded_chapters (
    chapter_link TEXT PRIMARY KEY NOT NULL,
    chapter_name TEXT NOT NULL,
    view TEXT NOT NULL DEFAULT '',
    time TEXT NOT NULL DEFAULT '',
    images TEXT NOT NULL DEFAULT '[]',
    comic_link TEXT NOT NULL,
    chapter_order INTEGER NOT NULL,
    downloaded_at TEXT NOT NULL,
    FOREIGN KEY (comic_link) REFERENCES downloaded_comics(link) ON DELETE CASCADE
);

-- Background download jobs
CREATE TABLE IF NOT EXISTS download_jobs (
    id TEXT PRIMARY KEY NOT NULL,
    chapter_link TEXT NOT NULL,
    comic_link TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]',
    input TEXT NOT NULL,
    constraints TEXT NOT NULL DEFAULT '{}',
    state TEXT NOT NULL DEFAULT 'enqueued',
    progress INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chapters_comic_link ON downloaded_chapters(comic_link);
CREATE INDEX IF NOT EXISTS idx_chapters_order ON downloaded_chapters(comic_link, chapter_order);
CREATE INDEX IF NOT EXISTS idx_jobs_state ON download_jobs(state);
CREATE INDEX IF NOT EXISTS idx_jobs_chapter_link ON download_jobs(chapter_link);
CREATE INDEX IF NOT EXISTS idx_jobs_comic_link ON download_jobs(comic_link);
"#;

/// Run all pending database migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    info!("Running database migrations");

    conn.execute_batch(MIGRATION_TABLE)?;

    let current_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    info!("Current database schema version: {}", current_version);

    if current_version < 1 {
        info!("Applying migration v1: Offline download schema");
        apply_migration(conn, 1, MIGRATION_V1)?;
    }

    info!("Database migrations completed successfully");
    Ok(())
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute_batch(sql).map_err(|e| {
        warn!("Migration v{} failed: {}", version, e);
        e
    })?;

    tx.execute("INSERT INTO schema_migrations (version) VALUES (?)", [version])?;

    tx.commit()?;

    info!("Migration v{} applied successfully", version);
    Ok(())
}
