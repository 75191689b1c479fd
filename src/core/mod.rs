//! Core download pipeline
//!
//! This module provides:
//! - Configuration management and structured logging
//! - Error types and the retry policy
//! - Progress accounting and on-disk path layout
//! - The chapter downloader and its transactional persistence
//! - The download job queue with constraints and notifications
//! - The offline library with aggregate deletion

pub mod config;
pub mod constraints;
pub mod downloader;
pub mod error;
pub mod job_queue;
pub mod library;
pub mod logging;
pub mod notifications;
pub mod paths;
pub mod persistence;
pub mod progress;
pub mod retry;
pub mod storage;

pub use config::Config;
pub use constraints::{EnvironmentProbe, HostProbe, JobConstraints, StaticProbe};
pub use downloader::Downloader;
pub use error::{ComicError, ErrorContext, Result};
pub use job_queue::{CancelDownloadCommand, DownloadJobInput, JobHandle, JobInfo, JobQueue, JobState, DOWNLOAD_TAG};
pub use library::{ChapterForReading, ComicWithChapters, DownloadLibrary};
pub use logging::Logger;
pub use notifications::{ChannelNotifier, Notice, Notifier, TracingNotifier};
pub use progress::DownloadProgress;
pub use retry::RetryPolicy;
pub use storage::StorageService;
