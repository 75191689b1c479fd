//! Scriptable in-process `ComicRemote`
//!
//! Content is registered up front. Individual keys (chapter links, comic
//! links or image URLs) can be told to fail a number of times or to hang
//! forever, and every call is counted per key.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};

use super::{ByteStream, ChapterDetail, ComicDetail, ComicRemote, RemoteError};

/// Size of the chunks `fetch_bytes` splits a blob into
const CHUNK_SIZE: usize = 8;

#[derive(Default)]
pub struct InMemoryRemote {
    chapters: Mutex<HashMap<String, ChapterDetail>>,
    comics: Mutex<HashMap<String, ComicDetail>>,
    blobs: Mutex<HashMap<String, Bytes>>,
    failures: Mutex<HashMap<String, VecDeque<RemoteError>>>,
    stalled: Mutex<HashSet<String>>,
    calls: Mutex<HashMap<String, u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chapter(&self, detail: ChapterDetail) {
        lock(&self.chapters).insert(detail.chapter_link.clone(), detail);
    }

    pub fn insert_comic(&self, detail: ComicDetail) {
        lock(&self.comics).insert(detail.link.clone(), detail);
    }

    pub fn insert_blob(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        lock(&self.blobs).insert(url.into(), data.into());
    }

    /// The next `times` calls for `key` fail with `error`
    pub fn fail_next(&self, key: impl Into<String>, times: usize, error: RemoteError) {
        let mut failures = lock(&self.failures);
        let queue = failures.entry(key.into()).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Calls for `key` never complete
    pub fn stall(&self, key: impl Into<String>) {
        lock(&self.stalled).insert(key.into());
    }

    pub fn release(&self, key: &str) {
        lock(&self.stalled).remove(key);
    }

    /// How many times `key` was requested
    pub fn calls(&self, key: &str) -> u32 {
        lock(&self.calls).get(key).copied().unwrap_or(0)
    }

    async fn enter(&self, key: &str) -> Result<(), RemoteError> {
        *lock(&self.calls).entry(key.to_string()).or_insert(0) += 1;

        let stalled = lock(&self.stalled).contains(key);
        if stalled {
            futures::future::pending::<()>().await;
        }

        let failure = lock(&self.failures).get_mut(key).and_then(|q| q.pop_front());
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn not_found(what: &str, key: &str) -> RemoteError {
    RemoteError::Server {
        status: 404,
        message: format!("{} not found: {}", what, key),
    }
}

#[async_trait]
impl ComicRemote for InMemoryRemote {
    async fn chapter_detail(&self, chapter_link: &str) -> Result<ChapterDetail, RemoteError> {
        self.enter(chapter_link).await?;
        lock(&self.chapters)
            .get(chapter_link)
            .cloned()
            .ok_or_else(|| not_found("chapter", chapter_link))
    }

    async fn comic_detail(&self, comic_link: &str) -> Result<ComicDetail, RemoteError> {
        self.enter(comic_link).await?;
        lock(&self.comics)
            .get(comic_link)
            .cloned()
            .ok_or_else(|| not_found("comic", comic_link))
    }

    async fn fetch_bytes(&self, url: &str) -> Result<ByteStream, RemoteError> {
        self.enter(url).await?;
        let data = lock(&self.blobs)
            .get(url)
            .cloned()
            .ok_or_else(|| not_found("blob", url))?;

        let chunks: Vec<Result<Bytes, RemoteError>> = (0..data.len())
            .step_by(CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + CHUNK_SIZE).min(data.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
