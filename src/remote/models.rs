//! Payloads returned by the remote comic API

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedLink {
    pub link: String,
    pub name: String,
}

/// One entry in a comic's chapter list, newest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub chapter_link: String,
    pub chapter_name: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub view: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterDetail {
    pub chapter_link: String,
    pub chapter_name: String,
    pub comic_link: String,
    pub comic_name: String,
    /// Image URLs in reading order
    #[serde(default)]
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComicDetail {
    pub link: String,
    pub title: String,
    pub thumbnail: String,
    #[serde(default)]
    pub view: String,
    #[serde(default)]
    pub last_updated: String,
    #[serde(default)]
    pub shortened_content: String,
    #[serde(default)]
    pub authors: Vec<NamedLink>,
    #[serde(default)]
    pub categories: Vec<NamedLink>,
    #[serde(default)]
    pub chapters: Vec<ChapterSummary>,
}

impl ComicDetail {
    /// Reading order of a chapter: `total - index`, so the newest chapter has
    /// the highest order and prepending new chapters leaves older orders alone
    pub fn chapter_order(&self, chapter_link: &str) -> Option<(i64, &ChapterSummary)> {
        let total = self.chapters.len() as i64;
        self.chapters
            .iter()
            .position(|c| c.chapter_link == chapter_link)
            .map(|index| (total - index as i64, &self.chapters[index]))
    }
}
