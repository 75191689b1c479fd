//! Download progress values and checkpoints

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::ComicError;

/// Percentage in `0..=100`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct DownloadProgress(u8);

impl DownloadProgress {
    pub const START: DownloadProgress = DownloadProgress(0);
    pub const METADATA_FETCHED: DownloadProgress = DownloadProgress(10);
    pub const IMAGES_DONE: DownloadProgress = DownloadProgress(80);
    pub const COMIC_METADATA_FETCHED: DownloadProgress = DownloadProgress(90);
    pub const PERSISTED: DownloadProgress = DownloadProgress(100);

    pub fn new(value: i32) -> Result<Self, ComicError> {
        if (0..=100).contains(&value) {
            Ok(DownloadProgress(value as u8))
        } else {
            Err(ComicError::InvalidProgress(value))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// Progress after `completed` of `total` images: `10 + completed*70/total`,
    /// or 80 straight away when there are no images
    pub fn for_images(completed: usize, total: usize) -> Self {
        if total == 0 {
            return Self::IMAGES_DONE;
        }
        let completed = completed.min(total);
        let span = (Self::IMAGES_DONE.0 - Self::METADATA_FETCHED.0) as usize;
        DownloadProgress(Self::METADATA_FETCHED.0 + (completed * span / total) as u8)
    }
}

impl TryFrom<i32> for DownloadProgress {
    type Error = ComicError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        DownloadProgress::new(value)
    }
}

impl From<DownloadProgress> for i32 {
    fn from(progress: DownloadProgress) -> Self {
        progress.0 as i32
    }
}

impl fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}%", self.0)
    }
}

/// Forwards progress values to a sink, dropping anything that does not move
/// forward so observers see a strictly increasing sequence
#[derive(Debug)]
pub struct ProgressTracker<F: FnMut(DownloadProgress)> {
    last: Option<DownloadProgress>,
    sink: F,
}

impl<F: FnMut(DownloadProgress)> ProgressTracker<F> {
    pub fn new(sink: F) -> Self {
        Self { last: None, sink }
    }

    pub fn report(&mut self, progress: DownloadProgress) {
        if self.last.map_or(true, |last| progress > last) {
            self.last = Some(progress);
            (self.sink)(progress);
        }
    }
}
