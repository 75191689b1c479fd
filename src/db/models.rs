//! Database models
//!
//! Data structures representing database tables

use serde::{Deserialize, Serialize};

use crate::remote::NamedLink;

/// Comic with at least one chapter on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedComic {
    pub link: String,
    pub title: String,
    /// Relative path of the local thumbnail
    pub thumbnail: String,
    pub remote_thumbnail: String,
    pub view: String,
    pub last_updated: String,
    pub synopsis: String,
    pub authors: Vec<NamedLink>,
    pub categories: Vec<NamedLink>,
}

/// Chapter stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadedChapter {
    pub chapter_link: String,
    pub chapter_name: String,
    pub view: String,
    pub time: String,
    /// Relative image paths in reading order
    pub images: Vec<String>,
    pub comic_link: String,
    /// `total - index` in the comic's remote chapter list at download time
    pub order: i64,
    pub downloaded_at: String,
}

/// Download job record in the database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub chapter_link: String,
    pub comic_link: String,
    pub tags: String,  // JSON array
    pub input: String, // JSON DownloadJobInput
    pub constraints: String, // JSON JobConstraints
    pub state: String,
    pub progress: i32,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// What a chapter deletion removed from the database
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterDeletion {
    pub chapter: DownloadedChapter,
    /// Set when the chapter was the comic's last one and the comic went with it
    pub comic: Option<DownloadedComic>,
}

/// What a comic deletion removed from the database
#[derive(Debug, Clone, PartialEq)]
pub struct ComicDeletion {
    pub comic: DownloadedComic,
    pub chapters: Vec<DownloadedChapter>,
}
