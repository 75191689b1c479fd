//! Local file store for downloaded images
//!
//! Paths handed to this service are relative to the storage root and use `/`.

use crate::core::error::{ComicError, ErrorContext, Result};
use crate::remote::ByteStream;
use futures::stream::StreamExt;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Clone, Debug)]
pub struct StorageService {
    root: PathBuf,
}

impl StorageService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Absolute location of a relative storage path. Every segment must be a
    /// plain name, so the result never leaves the root.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        relative.split('/').try_fold(self.root.clone(), |path, segment| match segment {
            "" | "." | ".." => Err(ComicError::ValidationError(format!(
                "storage path {:?} must be relative and plain",
                relative
            ))),
            _ => Ok(path.join(segment)),
        })
    }

    /// Write a response body to `relative`, creating parent directories and
    /// replacing whatever was there. Returns the number of bytes written.
    pub async fn write_stream(&self, relative: &str, mut body: ByteStream) -> Result<u64> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(&path).await?;
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!(path = %relative, bytes = written, "Stored file");
        Ok(written)
    }

    /// Remove one file. A file that is already gone counts as deleted.
    pub async fn delete_file(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_parents(&path).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ComicError::DeleteFileError { path, source }),
        }
    }

    /// Try every path and report the first failure
    pub async fn delete_files<'a, I>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut first_error = None;
        for relative in paths {
            if let Err(e) = self.delete_file(relative).await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Every regular file below `relative_dir`, as relative storage paths
    pub async fn list_files(&self, relative_dir: &str) -> Result<Vec<String>> {
        let root = self.root.clone();
        let dir = self.resolve(relative_dir)?;
        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            if !dir.exists() {
                return Ok(Vec::new());
            }
            let mut files = Vec::new();
            for entry in WalkDir::new(&dir).follow_links(false) {
                let entry = entry.map_err(|e| ComicError::IoError(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&root) {
                    let parts: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    files.push(parts.join("/"));
                }
            }
            files.sort();
            Ok(files)
        })
        .await
        .context("File listing task failed")?
    }

    /// Remove now-empty directories between a deleted file and the storage root
    async fn prune_empty_parents(&self, file: &Path) {
        let mut current = file.parent();
        while let Some(dir) = current {
            if dir == self.root.as_path() || !dir.starts_with(&self.root) {
                break;
            }
            // remove_dir fails on non-empty directories, which ends the walk
            if fs::remove_dir(dir).await.is_err() {
                break;
            }
            current = dir.parent();
        }
    }
}
