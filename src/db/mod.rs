//! Database module
//!
//! - Connection pool management
//! - Repositories for downloaded comics, chapters and download jobs
//! - Schema migrations

pub mod manager;
pub mod models;
pub mod repository;
pub mod migrations;

pub use manager::DatabaseManager;
pub use models::{ChapterDeletion, ComicDeletion, DownloadedChapter, DownloadedComic, JobRecord};
pub use repository::{ChapterRepository, ComicRepository, JobRepository, Repository};
