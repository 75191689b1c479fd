//! User-facing notices about download jobs

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    Progress {
        job_id: String,
        chapter_name: String,
        comic_name: String,
        progress: u8,
    },
    Completed {
        job_id: String,
        chapter_name: String,
        comic_name: String,
    },
    Failed {
        job_id: String,
        chapter_name: String,
        comic_name: String,
        message: String,
    },
    Cancelled {
        job_id: String,
        chapter_link: String,
        display_name: String,
    },
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Progress { job_id, chapter_name, comic_name, progress } => {
                debug!(job_id = %job_id, "{} - {}: {}%", comic_name, chapter_name, progress);
            }
            Notice::Completed { job_id, chapter_name, comic_name } => {
                info!(job_id = %job_id, "Downloaded {} - {}", comic_name, chapter_name);
            }
            Notice::Failed { job_id, chapter_name, comic_name, message } => {
                warn!(job_id = %job_id, "Download of {} - {} failed: {}", comic_name, chapter_name, message);
            }
            Notice::Cancelled { job_id, display_name, .. } => {
                info!(job_id = %job_id, "Cancelled download of {}", display_name);
            }
        }
    }
}

/// Forwards notices to a channel, e.g. for a UI layer to render
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notice: Notice) {
        // a dropped receiver only means nobody is listening
        let _ = self.tx.send(notice);
    }
}
