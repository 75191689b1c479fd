//! HTTP implementation of `ComicRemote` backed by reqwest

use async_trait::async_trait;
use futures::stream::{StreamExt, TryStreamExt};
use reqwest::{Client, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ByteStream, ChapterDetail, ComicDetail, ComicRemote, RemoteError};
use crate::core::config::RemoteConfig;
use crate::core::error::{ComicError, Result};

const MAX_ERROR_BODY: usize = 200;

#[derive(Clone)]
pub struct HttpComicRemote {
    client: Client,
    base_url: Url,
}

impl HttpComicRemote {
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ComicError::InitializationError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: normalize_base(&config.base_url)?,
        })
    }

    fn endpoint(&self, name: &str, link: &str) -> std::result::Result<Url, RemoteError> {
        let mut url = self
            .base_url
            .join(name)
            .map_err(|e| RemoteError::Malformed(format!("bad endpoint {}: {}", name, e)))?;
        url.query_pairs_mut().append_pair("link", link);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> std::result::Result<T, RemoteError> {
        debug!(url = %url, "GET");
        let response = self.client.get(url).send().await.map_err(map_reqwest_error)?;
        let response = check_status(response).await?;
        response.json::<T>().await.map_err(map_reqwest_error)
    }
}

/// Make sure the base ends in `/` so `join` appends instead of replacing the last segment
fn normalize_base(base_url: &str) -> Result<Url> {
    let mut base = base_url.to_string();
    if !base.ends_with('/') {
        base.push('/');
    }
    Url::parse(&base).map_err(|e| ComicError::ConfigError(format!("Invalid remote base_url: {}", e)))
}

fn map_reqwest_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout(err.to_string())
    } else if err.is_decode() {
        RemoteError::Malformed(err.to_string())
    } else if let Some(status) = err.status() {
        RemoteError::Server {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        RemoteError::Unreachable(err.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> std::result::Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY).rev().find(|i| message.is_char_boundary(*i)).unwrap_or(0);
        message.truncate(cut);
    }
    if message.is_empty() {
        message = status.canonical_reason().unwrap_or("unknown").to_string();
    }
    Err(RemoteError::Server {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl ComicRemote for HttpComicRemote {
    async fn chapter_detail(&self, chapter_link: &str) -> std::result::Result<ChapterDetail, RemoteError> {
        let url = self.endpoint("chapter_detail", chapter_link)?;
        self.get_json(url).await
    }

    async fn comic_detail(&self, comic_link: &str) -> std::result::Result<ComicDetail, RemoteError> {
        let url = self.endpoint("comic_detail", comic_link)?;
        self.get_json(url).await
    }

    async fn fetch_bytes(&self, url: &str) -> std::result::Result<ByteStream, RemoteError> {
        let url = Url::parse(url).map_err(|e| RemoteError::Malformed(format!("invalid image url {}: {}", url, e)))?;
        debug!(url = %url, "GET bytes");
        let response = self.client.get(url).send().await.map_err(map_reqwest_error)?;
        let response = check_status(response).await?;
        Ok(response.bytes_stream().map_err(map_reqwest_error).boxed())
    }
}
