//! Comic Offline Library
//!
//! Downloads comic chapters for offline reading: a cancellable, observable
//! download pipeline backed by SQLite and a local image store, driven by a
//! persistent job queue.

pub mod core;
pub mod db;
pub mod remote;

// Re-export commonly used types
pub use crate::core::{Config, DownloadLibrary, Downloader, JobQueue};
pub use db::DatabaseManager;
pub use remote::{ComicRemote, HttpComicRemote};
#[cfg(any(test, feature = "test-util"))]
pub use remote::InMemoryRemote;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
