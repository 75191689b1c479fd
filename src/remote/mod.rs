//! Remote comic API
//!
//! `ComicRemote` is the seam between the download pipeline and the network.
//! `HttpComicRemote` talks to the real service. `InMemoryRemote` serves
//! scripted content to tests and is only built for them (or with the
//! `test-util` feature).

pub mod client;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod models;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::core::retry::Retryable;

pub use client::HttpComicRemote;
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryRemote;
pub use models::{ChapterDetail, ChapterSummary, ComicDetail, NamedLink};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Unreachable(_) | RemoteError::Timeout(_))
    }
}

impl Retryable for RemoteError {
    fn is_retryable(&self) -> bool {
        RemoteError::is_retryable(self)
    }
}

/// Response body delivered chunk by chunk
pub type ByteStream = BoxStream<'static, Result<Bytes, RemoteError>>;

#[async_trait]
pub trait ComicRemote: Send + Sync {
    async fn chapter_detail(&self, chapter_link: &str) -> Result<ChapterDetail, RemoteError>;

    async fn comic_detail(&self, comic_link: &str) -> Result<ComicDetail, RemoteError>;

    /// Open the body of an image (or any binary) URL
    async fn fetch_bytes(&self, url: &str) -> Result<ByteStream, RemoteError>;
}
