//! Download job queue
//!
//! Every chapter download runs as a job. Jobs are persisted, tagged with the
//! chapter link and the comic link, and executed by a runner that bounds
//! concurrency with a semaphore. At most one unfinished job exists per
//! chapter: enqueuing a chapter cancels the job already there, and the new
//! job waits for the old one to let go of the chapter before it starts.

use crate::core::config::JobsConfig;
use crate::core::constraints::{EnvironmentProbe, JobConstraints};
use crate::core::downloader::Downloader;
use crate::core::error::{ComicError, Result};
use crate::core::notifications::{Notice, Notifier};
use crate::core::progress::DownloadProgress;
use crate::db::manager::DatabaseManager;
use crate::db::models::JobRecord;
use crate::db::repository::JobRepository;
use crate::remote::ChapterSummary;

use chrono::SecondsFormat;
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, Notify, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tag carried by every download job
pub const DOWNLOAD_TAG: &str = "download_chapter";

const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Typed input of a download job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadJobInput {
    pub chapter: ChapterSummary,
    pub comic_link: String,
    pub comic_name: String,
}

impl DownloadJobInput {
    pub fn tags(&self) -> Vec<String> {
        vec![
            DOWNLOAD_TAG.to_string(),
            self.chapter.chapter_link.clone(),
            self.comic_link.clone(),
        ]
    }

    pub fn display_name(&self) -> String {
        format!("{} - {}", self.comic_name, self.chapter.chapter_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Enqueued => "enqueued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::Cancelled)
    }
}

impl FromStr for JobState {
    type Err = ComicError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enqueued" => Ok(JobState::Enqueued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(ComicError::ValidationError(format!("unknown job state: {}", other))),
        }
    }
}

/// Externally visible state of one job
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub tags: Vec<String>,
    pub state: JobState,
    pub progress: u8,
    /// `chapter_name` and `comic_name`, so a progress view needs no store lookup
    pub progress_data: BTreeMap<String, String>,
    pub error: Option<String>,
    pub input: DownloadJobInput,
    pub constraints: JobConstraints,
    pub created_at: String,
    pub updated_at: String,
}

impl JobInfo {
    fn new(input: DownloadJobInput, constraints: JobConstraints) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            tags: input.tags(),
            state: JobState::Enqueued,
            progress: 0,
            progress_data: progress_data(&input),
            error: None,
            input,
            constraints,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    pub fn chapter_link(&self) -> &str {
        &self.input.chapter.chapter_link
    }

    fn to_record(&self) -> Result<JobRecord> {
        Ok(JobRecord {
            id: self.id.clone(),
            chapter_link: self.input.chapter.chapter_link.clone(),
            comic_link: self.input.comic_link.clone(),
            tags: serde_json::to_string(&self.tags)?,
            input: serde_json::to_string(&self.input)?,
            constraints: serde_json::to_string(&self.constraints)?,
            state: self.state.as_str().to_string(),
            progress: i32::from(self.progress),
            error: self.error.clone(),
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        })
    }

    fn from_record(record: JobRecord) -> Result<Self> {
        let input: DownloadJobInput = serde_json::from_str(&record.input)?;
        Ok(Self {
            tags: serde_json::from_str(&record.tags)?,
            state: record.state.parse()?,
            progress: DownloadProgress::new(record.progress)?.value(),
            progress_data: progress_data(&input),
            constraints: serde_json::from_str(&record.constraints)?,
            input,
            id: record.id,
            error: record.error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Returned by [`JobQueue::enqueue`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub id: String,
}

/// Cancellation request delivered from outside the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelDownloadCommand {
    pub job_id: String,
    pub chapter_link: String,
    pub display_name: String,
}

struct JobEntry {
    seq: u64,
    info: JobInfo,
    cancel: CancellationToken,
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn progress_data(input: &DownloadJobInput) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("chapter_name".to_string(), input.chapter.chapter_name.clone()),
        ("comic_name".to_string(), input.comic_name.clone()),
    ])
}

/// Cancel an unfinished job in place, returning its new state
fn cancel_entry(entry: &mut JobEntry) -> Option<JobInfo> {
    if entry.info.state.is_finished() {
        return None;
    }
    entry.info.state = JobState::Cancelled;
    entry.info.updated_at = timestamp();
    entry.cancel.cancel();
    Some(entry.info.clone())
}

pub struct JobQueue {
    downloader: Arc<Downloader>,
    repo: JobRepository,
    probe: Arc<dyn EnvironmentProbe>,
    notifier: Arc<dyn Notifier>,
    default_constraints: JobConstraints,
    poll_interval: Duration,
    max_concurrent: usize,
    jobs: RwLock<HashMap<String, JobEntry>>,
    next_seq: AtomicU64,
    pending: Mutex<VecDeque<String>>,
    wakeup: Notify,
    semaphore: Arc<Semaphore>,
    chapter_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Serializes job row writes
    persist_lock: Mutex<()>,
    updates: broadcast::Sender<JobInfo>,
    shutdown: CancellationToken,
}

impl JobQueue {
    pub fn new(
        downloader: Arc<Downloader>,
        db: Arc<DatabaseManager>,
        probe: Arc<dyn EnvironmentProbe>,
        notifier: Arc<dyn Notifier>,
        config: &JobsConfig,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            downloader,
            repo: JobRepository::new(db),
            probe,
            notifier,
            default_constraints: JobConstraints::from(config),
            poll_interval: Duration::from_millis(config.constraint_poll_interval_ms),
            max_concurrent: config.max_concurrent_jobs,
            jobs: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            chapter_locks: Mutex::new(HashMap::new()),
            persist_lock: Mutex::new(()),
            updates,
            shutdown: CancellationToken::new(),
        }
    }

    /// Enqueue a chapter download with the configured constraints
    pub async fn enqueue_download(&self, input: DownloadJobInput) -> Result<JobHandle> {
        self.enqueue(input, self.default_constraints).await
    }

    /// Enqueue a chapter download. Any unfinished job for the same chapter is
    /// cancelled first.
    pub async fn enqueue(&self, input: DownloadJobInput, constraints: JobConstraints) -> Result<JobHandle> {
        let info = JobInfo::new(input, constraints);

        // The row has to exist before the job is visible to cancellation
        self.repo.create(&info.to_record()?).await?;

        let superseded = self.insert(info.clone()).await;
        self.pending.lock().await.push_back(info.id.clone());
        self.wakeup.notify_one();

        for old in superseded {
            info!(job_id = %old.id, chapter_link = %old.chapter_link(), "Superseded by a new download of the same chapter");
            self.record_state(old).await;
        }

        info!(
            job_id = %info.id,
            chapter_link = %info.chapter_link(),
            comic_link = %info.input.comic_link,
            "Download job enqueued: {}",
            info.input.display_name()
        );
        self.publish(info.clone());

        Ok(JobHandle { id: info.id })
    }

    /// Cancel one job. Returns false when it was unknown or already finished.
    pub async fn cancel_by_id(&self, id: &str) -> Result<bool> {
        let cancelled = {
            let mut jobs = self.jobs.write().await;
            jobs.get_mut(id).and_then(cancel_entry)
        };

        match cancelled {
            Some(info) => {
                info!(job_id = %id, "Download job cancelled");
                self.persist_state(&info.id).await?;
                self.publish(info);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Cancel every unfinished job carrying `tag`. Returns how many were cancelled.
    pub async fn cancel_by_tag(&self, tag: &str) -> Result<usize> {
        Ok(self.cancel_tagged(tag).await?.len())
    }

    /// Like [`cancel_by_tag`](JobQueue::cancel_by_tag), then wait until the
    /// cancelled jobs have stopped touching their chapters
    pub async fn cancel_by_tag_and_wait(&self, tag: &str) -> Result<usize> {
        let cancelled = self.cancel_tagged(tag).await?;
        let chapters: HashSet<String> = cancelled.iter().map(|info| info.chapter_link().to_string()).collect();

        for chapter_link in chapters {
            let lock = self.chapter_lock(&chapter_link).await;
            drop(lock.lock().await);
            self.release_chapter_lock(&chapter_link, lock).await;
        }
        Ok(cancelled.len())
    }

    async fn cancel_tagged(&self, tag: &str) -> Result<Vec<JobInfo>> {
        let cancelled: Vec<JobInfo> = {
            let mut jobs = self.jobs.write().await;
            jobs.values_mut()
                .filter(|entry| entry.info.has_tag(tag))
                .filter_map(cancel_entry)
                .collect()
        };

        for info in &cancelled {
            self.persist_state(&info.id).await?;
            self.publish(info.clone());
        }

        if !cancelled.is_empty() {
            info!(tag = %tag, count = cancelled.len(), "Cancelled download jobs by tag");
        }
        Ok(cancelled)
    }

    /// Cancel the job named by an external command and tell the user
    pub async fn handle_cancel_command(&self, command: CancelDownloadCommand) -> Result<bool> {
        debug!(job_id = %command.job_id, chapter_link = %command.chapter_link, "Cancel command received");
        let cancelled = self.cancel_by_id(&command.job_id).await?;

        self.notifier.notify(Notice::Cancelled {
            job_id: command.job_id,
            chapter_link: command.chapter_link,
            display_name: command.display_name,
        });
        Ok(cancelled)
    }

    /// Current state of one job. Finished jobs are read back from the database.
    pub async fn job(&self, id: &str) -> Result<Option<JobInfo>> {
        if let Some(entry) = self.jobs.read().await.get(id) {
            return Ok(Some(entry.info.clone()));
        }
        match self.repo.find_by_id(id).await? {
            Some(record) => Ok(Some(JobInfo::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Every job carrying `tag`, oldest first. Includes finished jobs from
    /// earlier runs that are still in the database.
    pub async fn query_by_tag(&self, tag: &str) -> Result<Vec<JobInfo>> {
        let (known, mut live) = {
            let jobs = self.jobs.read().await;
            let known: HashSet<String> = jobs.keys().cloned().collect();
            let live: Vec<(u64, JobInfo)> = jobs
                .values()
                .filter(|entry| entry.info.has_tag(tag))
                .map(|entry| (entry.seq, entry.info.clone()))
                .collect();
            (known, live)
        };

        let mut result = Vec::new();
        for record in self.repo.find_by_tag(tag).await? {
            if known.contains(&record.id) {
                continue;
            }
            let id = record.id.clone();
            match JobInfo::from_record(record) {
                Ok(info) => result.push(info),
                Err(e) => warn!(job_id = %id, error = %e, "Skipping unreadable job record"),
            }
        }

        live.sort_by_key(|(seq, _)| *seq);
        result.extend(live.into_iter().map(|(_, info)| info));
        Ok(result)
    }

    /// Snapshot of `tag`'s jobs now, and again after every change to one of them
    pub fn watch_by_tag(self: &Arc<Self>, tag: impl Into<String>) -> impl Stream<Item = Vec<JobInfo>> + Send + 'static {
        let rx = self.updates.subscribe();
        let queue = Arc::clone(self);
        let tag = tag.into();

        stream::unfold((queue, rx, tag, true), |(queue, mut rx, tag, first)| async move {
            if !first {
                loop {
                    match rx.recv().await {
                        Ok(info) if info.has_tag(&tag) => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Job watcher lagged");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }

            let snapshot = match queue.query_by_tag(&tag).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Failed to query jobs for watcher");
                    return None;
                }
            };
            Some((snapshot, (queue, rx, tag, false)))
        })
    }

    /// Inputs of jobs that have not finished yet
    pub async fn active_inputs(&self) -> Vec<DownloadJobInput> {
        self.jobs
            .read()
            .await
            .values()
            .filter(|entry| !entry.info.state.is_finished())
            .map(|entry| entry.info.input.clone())
            .collect()
    }

    /// Load jobs that were queued or running when the process last stopped
    pub async fn recover_jobs(&self) -> Result<usize> {
        let requeued = self.repo.requeue_unfinished().await?;
        let records = self.repo.find_by_state(JobState::Enqueued.as_str()).await?;

        let mut recovered = 0;
        for record in records {
            let id = record.id.clone();
            let info = match JobInfo::from_record(record) {
                Ok(info) => info,
                Err(e) => {
                    warn!(job_id = %id, error = %e, "Cannot recover job, marking it failed");
                    self.repo
                        .update_state(&id, JobState::Failed.as_str(), 0, Some(e.short_message()))
                        .await?;
                    continue;
                }
            };
            if self.jobs.read().await.contains_key(&info.id) {
                continue;
            }

            let superseded = self.insert(info.clone()).await;
            self.pending.lock().await.push_back(info.id.clone());
            for old in superseded {
                self.record_state(old).await;
            }
            recovered += 1;
        }

        if recovered > 0 {
            self.wakeup.notify_one();
        }
        info!(requeued, recovered, "Recovered download jobs");
        Ok(recovered)
    }

    /// Drop finished jobs older than `retention_days`
    pub async fn prune_finished_jobs(&self, retention_days: i64) -> Result<usize> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(retention_days))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        let removed = self.repo.delete_finished_before(&cutoff).await?;
        self.jobs
            .write()
            .await
            .retain(|_, entry| !(entry.info.state.is_finished() && entry.info.updated_at < cutoff));

        info!(removed, cutoff = %cutoff, "Pruned finished download jobs");
        Ok(removed)
    }

    /// Wait until no job is enqueued or running
    pub async fn wait_until_idle(&self) {
        let mut rx = self.updates.subscribe();
        loop {
            if !self.has_unfinished().await {
                return;
            }
            if let Err(broadcast::error::RecvError::Closed) = rx.recv().await {
                return;
            }
        }
    }

    /// Run jobs until [`shutdown`](JobQueue::shutdown) is called
    pub async fn start(self: Arc<Self>) {
        info!(max_concurrent = self.max_concurrent, "Download job runner started");

        loop {
            let id = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                id = self.next_pending() => id,
            };

            let constraints = match self.jobs.read().await.get(&id) {
                Some(entry) if entry.info.state == JobState::Enqueued => entry.info.constraints,
                _ => continue,
            };

            if !constraints.satisfied(self.probe.as_ref()).await {
                debug!(job_id = %id, "Constraints not met, deferring job");
                self.pending.lock().await.push_back(id);
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let queue = Arc::clone(&self);
            tokio::spawn(async move {
                queue.execute(id, permit).await;
            });
        }

        info!("Download job runner stopped");
    }

    /// Stop picking up jobs. Running and queued jobs stay unfinished in the
    /// database and are picked up again by [`recover_jobs`](JobQueue::recover_jobs).
    pub fn shutdown(&self) {
        info!("Shutting down download job runner");
        self.shutdown.cancel();
    }

    async fn execute(self: Arc<Self>, id: String, _permit: OwnedSemaphorePermit) {
        let (chapter_link, cancel) = match self.jobs.read().await.get(&id) {
            Some(entry) => (entry.info.chapter_link().to_string(), entry.cancel.clone()),
            None => return,
        };

        let chapter_lock = self.chapter_lock(&chapter_link).await;
        let guard = chapter_lock.lock().await;

        let running = self
            .update_job(&id, |info| {
                if info.state != JobState::Enqueued {
                    return false;
                }
                info.state = JobState::Running;
                true
            })
            .await;

        if let Some(info) = running {
            info!(job_id = %id, chapter_link = %chapter_link, "Download job started");
            self.record_state(info).await;

            let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
            let run = self.downloader.run(&chapter_link, &cancel, progress_tx);
            tokio::pin!(run);

            let result = loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(progress) = progress_rx.recv() => self.record_progress(&id, progress).await,
                }
            };
            while let Ok(progress) = progress_rx.try_recv() {
                self.record_progress(&id, progress).await;
            }

            self.finish(&id, result.map(|_| ()), &cancel).await;
        }

        drop(guard);
        self.release_chapter_lock(&chapter_link, chapter_lock).await;
    }

    async fn finish(&self, id: &str, result: Result<()>, cancel: &CancellationToken) {
        match result {
            Ok(()) => {
                let done = self
                    .update_job(id, |info| {
                        if info.state.is_finished() {
                            return false;
                        }
                        info.state = JobState::Succeeded;
                        info.progress = DownloadProgress::PERSISTED.value();
                        info.error = None;
                        true
                    })
                    .await;
                if let Some(info) = done {
                    info!(job_id = %id, "Download job succeeded");
                    self.notifier.notify(Notice::Completed {
                        job_id: info.id.clone(),
                        chapter_name: info.input.chapter.chapter_name.clone(),
                        comic_name: info.input.comic_name.clone(),
                    });
                    self.record_state(info).await;
                }
            }
            Err(e) if e.is_cancelled() || cancel.is_cancelled() => {
                let cancelled = self
                    .update_job(id, |info| {
                        if info.state.is_finished() {
                            return false;
                        }
                        info.state = JobState::Cancelled;
                        true
                    })
                    .await;
                if let Some(info) = cancelled {
                    self.record_state(info).await;
                }
                info!(job_id = %id, "Download job stopped after cancellation");
            }
            Err(e) => {
                let message = e.short_message();
                let failed = self
                    .update_job(id, |info| {
                        if info.state.is_finished() {
                            return false;
                        }
                        info.state = JobState::Failed;
                        info.error = Some(message.clone());
                        true
                    })
                    .await;
                if let Some(info) = failed {
                    warn!(job_id = %id, error = %e, "Download job failed");
                    self.notifier.notify(Notice::Failed {
                        job_id: info.id.clone(),
                        chapter_name: info.input.chapter.chapter_name.clone(),
                        comic_name: info.input.comic_name.clone(),
                        message,
                    });
                    self.record_state(info).await;
                }
            }
        }
    }

    async fn record_progress(&self, id: &str, progress: DownloadProgress) {
        let value = progress.value();
        let updated = self
            .update_job(id, |info| {
                if info.state != JobState::Running || value <= info.progress {
                    return false;
                }
                info.progress = value;
                true
            })
            .await;

        if let Some(info) = updated {
            if let Err(e) = self.persist_state(id).await {
                warn!(job_id = %id, error = %e, "Failed to persist job progress");
            }
            self.notifier.notify(Notice::Progress {
                job_id: info.id.clone(),
                chapter_name: info.input.chapter.chapter_name.clone(),
                comic_name: info.input.comic_name.clone(),
                progress: value,
            });
            self.publish(info);
        }
    }

    /// Persist and broadcast a state change made by the runner
    async fn record_state(&self, info: JobInfo) {
        if let Err(e) = self.persist_state(&info.id).await {
            warn!(job_id = %info.id, error = %e, "Failed to persist job state");
        }
        self.publish(info);
    }

    /// Write the job's current in-memory state to its row. Writers go one at
    /// a time and each writes the latest state, so an older state never lands
    /// after a newer one. Once a finished state is stored the job leaves
    /// memory; reads fall back to the database.
    async fn persist_state(&self, id: &str) -> Result<()> {
        let _writer = self.persist_lock.lock().await;
        let info = match self.jobs.read().await.get(id) {
            Some(entry) => entry.info.clone(),
            None => return Ok(()),
        };

        self.repo
            .update_state(&info.id, info.state.as_str(), i32::from(info.progress), info.error.clone())
            .await?;

        if info.state.is_finished() {
            self.jobs.write().await.remove(id);
        }
        Ok(())
    }

    fn publish(&self, info: JobInfo) {
        // no receivers is fine
        let _ = self.updates.send(info);
    }

    /// Add a job, cancelling unfinished jobs for the same chapter under the
    /// same lock so two enqueues cannot both end up active
    async fn insert(&self, info: JobInfo) -> Vec<JobInfo> {
        let mut jobs = self.jobs.write().await;
        let superseded: Vec<JobInfo> = jobs
            .values_mut()
            .filter(|entry| entry.info.chapter_link() == info.chapter_link())
            .filter_map(cancel_entry)
            .collect();

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        jobs.insert(
            info.id.clone(),
            JobEntry {
                seq,
                info,
                cancel: CancellationToken::new(),
            },
        );
        superseded
    }

    async fn update_job<F>(&self, id: &str, apply: F) -> Option<JobInfo>
    where
        F: FnOnce(&mut JobInfo) -> bool,
    {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(id)?;
        if !apply(&mut entry.info) {
            return None;
        }
        entry.info.updated_at = timestamp();
        Some(entry.info.clone())
    }

    async fn has_unfinished(&self) -> bool {
        self.jobs
            .read()
            .await
            .values()
            .any(|entry| !entry.info.state.is_finished())
    }

    async fn next_pending(&self) -> String {
        loop {
            if let Some(id) = self.pending.lock().await.pop_front() {
                return id;
            }
            self.wakeup.notified().await;
        }
    }

    async fn chapter_lock(&self, chapter_link: &str) -> Arc<Mutex<()>> {
        self.chapter_locks
            .lock()
            .await
            .entry(chapter_link.to_string())
            .or_default()
            .clone()
    }

    async fn release_chapter_lock(&self, chapter_link: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.chapter_locks.lock().await;
        drop(lock);
        if locks.get(chapter_link).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(chapter_link);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constraints::StaticProbe;
    use crate::core::notifications::ChannelNotifier;
    use crate::core::retry::RetryPolicy;
    use crate::core::storage::StorageService;
    use crate::remote::{ChapterDetail, ComicDetail, InMemoryRemote, RemoteError};
    use futures::StreamExt;

    struct Fixture {
        remote: Arc<InMemoryRemote>,
        db: Arc<DatabaseManager>,
        probe: Arc<StaticProbe>,
        queue: Arc<JobQueue>,
        notices: mpsc::UnboundedReceiver<Notice>,
        _dir: tempfile::TempDir,
    }

    fn jobs_config() -> JobsConfig {
        JobsConfig {
            max_concurrent_jobs: 2,
            constraint_poll_interval_ms: 10,
            requires_network: true,
            requires_storage_not_low: false,
            finished_job_retention_days: 7,
        }
    }

    fn summary(link: &str) -> ChapterSummary {
        ChapterSummary {
            chapter_link: link.to_string(),
            chapter_name: format!("Chapter {}", link),
            time: String::new(),
            view: String::new(),
        }
    }

    fn input(chapter: &str) -> DownloadJobInput {
        DownloadJobInput {
            chapter: summary(chapter),
            comic_link: "m1".to_string(),
            comic_name: "Comic".to_string(),
        }
    }

    fn build_queue(remote: Arc<InMemoryRemote>, db: Arc<DatabaseManager>, root: &std::path::Path)
        -> (Arc<JobQueue>, Arc<StaticProbe>, mpsc::UnboundedReceiver<Notice>)
    {
        let retry = RetryPolicy {
            times: 2,
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(2),
        };
        let downloader = Arc::new(Downloader::new(remote, db.clone(), StorageService::new(root), retry));
        let probe = Arc::new(StaticProbe::available());
        let (notifier, notices) = ChannelNotifier::new();
        let queue = Arc::new(JobQueue::new(
            downloader,
            db,
            probe.clone(),
            Arc::new(notifier),
            &jobs_config(),
        ));
        (queue, probe, notices)
    }

    fn fixture(chapters: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(DatabaseManager::new(&dir.path().join("jobs.db"), 4, Duration::from_secs(5)).unwrap());
        let remote = Arc::new(InMemoryRemote::new());

        for chapter in chapters {
            let images: Vec<String> = (0..2).map(|i| format!("http://img/{}/{}", chapter, i)).collect();
            for url in &images {
                remote.insert_blob(url.clone(), b"png".to_vec());
            }
            remote.insert_chapter(ChapterDetail {
                chapter_link: chapter.to_string(),
                chapter_name: format!("Chapter {}", chapter),
                comic_link: "m1".into(),
                comic_name: "Comic".into(),
                images,
            });
        }
        remote.insert_blob("http://thumb", b"t".to_vec());
        remote.insert_comic(ComicDetail {
            link: "m1".into(),
            title: "Comic".into(),
            thumbnail: "http://thumb".into(),
            view: String::new(),
            last_updated: String::new(),
            shortened_content: String::new(),
            authors: vec![],
            categories: vec![],
            chapters: chapters.iter().map(|c| summary(c)).collect(),
        });

        let (queue, probe, notices) = build_queue(remote.clone(), db.clone(), dir.path());
        Fixture { remote, db, probe, queue, notices, _dir: dir }
    }

    async fn wait_for_state(queue: &JobQueue, id: &str, state: JobState) -> JobInfo {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(info) = queue.job(id).await.unwrap() {
                    if info.state == state {
                        return info;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not reach expected state")
    }

    async fn wait_for_record(queue: &JobQueue, id: &str, state: JobState) -> JobRecord {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(record) = queue.repo.find_by_id(id).await.unwrap() {
                    if record.state == state.as_str() {
                        return record;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job record did not reach expected state")
    }

    fn drain(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Vec<Notice> {
        let mut all = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            all.push(notice);
        }
        all
    }

    #[tokio::test]
    async fn test_job_runs_to_success() {
        let mut fx = fixture(&["c1"]);
        tokio::spawn(Arc::clone(&fx.queue).start());

        let handle = fx.queue.enqueue_download(input("c1")).await.unwrap();
        let info = wait_for_state(&fx.queue, &handle.id, JobState::Succeeded).await;

        assert_eq!(info.progress, 100);
        assert_eq!(info.progress_data["chapter_name"], "Chapter c1");
        assert_eq!(info.progress_data["comic_name"], "Comic");
        assert_eq!(info.tags, vec![DOWNLOAD_TAG, "c1", "m1"]);

        let record = wait_for_record(&fx.queue, &handle.id, JobState::Succeeded).await;
        assert_eq!(record.progress, 100);

        let notices = drain(&mut fx.notices);
        assert!(notices.iter().any(|n| matches!(n, Notice::Progress { progress: 45, .. })));
        assert!(matches!(notices.last(), Some(Notice::Completed { .. })));
        fx.queue.shutdown();
    }

    #[tokio::test]
    async fn test_second_enqueue_supersedes_first() {
        let fx = fixture(&["c1"]);
        fx.remote.stall("http://img/c1/1");
        tokio::spawn(Arc::clone(&fx.queue).start());

        let first = fx.queue.enqueue_download(input("c1")).await.unwrap();
        wait_for_state(&fx.queue, &first.id, JobState::Running).await;

        let second = fx.queue.enqueue_download(input("c1")).await.unwrap();
        let jobs = fx.queue.query_by_tag("c1").await.unwrap();
        let active: Vec<_> = jobs.iter().filter(|j| !j.state.is_finished()).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, second.id);
        assert_eq!(fx.queue.job(&first.id).await.unwrap().unwrap().state, JobState::Cancelled);

        fx.remote.release("http://img/c1/1");
        wait_for_state(&fx.queue, &second.id, JobState::Succeeded).await;

        let states: Vec<JobState> = fx.queue.query_by_tag("c1").await.unwrap().iter().map(|j| j.state).collect();
        assert_eq!(states, vec![JobState::Cancelled, JobState::Succeeded]);
        fx.queue.shutdown();
    }

    #[tokio::test]
    async fn test_unmet_constraints_defer_job() {
        let fx = fixture(&["c1"]);
        fx.probe.set_network(false);
        tokio::spawn(Arc::clone(&fx.queue).start());

        let handle = fx.queue.enqueue_download(input("c1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fx.queue.job(&handle.id).await.unwrap().unwrap().state, JobState::Enqueued);
        assert_eq!(fx.remote.calls("c1"), 0);

        fx.probe.set_network(true);
        wait_for_state(&fx.queue, &handle.id, JobState::Succeeded).await;
        fx.queue.shutdown();
    }

    #[tokio::test]
    async fn test_failure_records_short_message() {
        let mut fx = fixture(&["c1"]);
        fx.remote.fail_next("c1", 1, RemoteError::Server { status: 500, message: "boom".into() });
        tokio::spawn(Arc::clone(&fx.queue).start());

        let handle = fx.queue.enqueue_download(input("c1")).await.unwrap();
        let info = wait_for_state(&fx.queue, &handle.id, JobState::Failed).await;

        assert_eq!(info.error.as_deref(), Some("Server error 500: boom"));
        let record = wait_for_record(&fx.queue, &handle.id, JobState::Failed).await;
        assert_eq!(record.error.as_deref(), Some("Server error 500: boom"));
        assert!(drain(&mut fx.notices).iter().any(|n| matches!(n, Notice::Failed { .. })));
        fx.queue.shutdown();
    }

    #[tokio::test]
    async fn test_cancel_command_cancels_and_notifies() {
        let mut fx = fixture(&["c1"]);
        let handle = fx.queue.enqueue_download(input("c1")).await.unwrap();

        let cancelled = fx
            .queue
            .handle_cancel_command(CancelDownloadCommand {
                job_id: handle.id.clone(),
                chapter_link: "c1".into(),
                display_name: "Comic - Chapter c1".into(),
            })
            .await
            .unwrap();

        assert!(cancelled);
        assert_eq!(fx.queue.job(&handle.id).await.unwrap().unwrap().state, JobState::Cancelled);
        assert_eq!(fx.queue.repo.find_by_id(&handle.id).await.unwrap().unwrap().state, "cancelled");
        assert_eq!(
            drain(&mut fx.notices),
            vec![Notice::Cancelled {
                job_id: handle.id.clone(),
                chapter_link: "c1".into(),
                display_name: "Comic - Chapter c1".into(),
            }]
        );

        assert!(!fx.queue.cancel_by_id(&handle.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_by_comic_tag_hits_every_chapter() {
        let fx = fixture(&["c1", "c2"]);
        fx.queue.enqueue_download(input("c1")).await.unwrap();
        fx.queue.enqueue_download(input("c2")).await.unwrap();

        assert_eq!(fx.queue.cancel_by_tag("m1").await.unwrap(), 2);
        assert_eq!(fx.queue.cancel_by_tag("m1").await.unwrap(), 0);
        assert!(fx.queue.active_inputs().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_and_wait_returns_after_job_exits() {
        let fx = fixture(&["c1"]);
        fx.remote.stall("http://img/c1/0");
        tokio::spawn(Arc::clone(&fx.queue).start());

        let handle = fx.queue.enqueue_download(input("c1")).await.unwrap();
        wait_for_state(&fx.queue, &handle.id, JobState::Running).await;

        assert_eq!(fx.queue.cancel_by_tag_and_wait("c1").await.unwrap(), 1);
        assert_eq!(fx.queue.job(&handle.id).await.unwrap().unwrap().state, JobState::Cancelled);
        let record = fx.queue.repo.find_by_id(&handle.id).await.unwrap().unwrap();
        assert_eq!(record.state, "cancelled");
        fx.queue.shutdown();
    }

    #[tokio::test]
    async fn test_recover_jobs_after_restart() {
        let fx = fixture(&["c1"]);
        let mut info = JobInfo::new(input("c1"), JobConstraints::default());
        info.state = JobState::Running;
        info.progress = 45;
        fx.queue.repo.create(&info.to_record().unwrap()).await.unwrap();

        let (restarted, _probe, _notices) = build_queue(fx.remote.clone(), fx.db.clone(), fx._dir.path());
        assert_eq!(restarted.recover_jobs().await.unwrap(), 1);
        assert_eq!(restarted.job(&info.id).await.unwrap().unwrap().progress, 0);

        tokio::spawn(Arc::clone(&restarted).start());
        wait_for_state(&restarted, &info.id, JobState::Succeeded).await;
        restarted.shutdown();
    }

    #[tokio::test]
    async fn test_watch_by_tag_emits_snapshots() {
        let fx = fixture(&["c1"]);
        let mut watch = Box::pin(fx.queue.watch_by_tag(DOWNLOAD_TAG));

        let initial = watch.next().await.unwrap();
        assert!(initial.is_empty());

        fx.queue.enqueue_download(input("c1")).await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(1), watch.next()).await.unwrap().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].state, JobState::Enqueued);
    }

    #[tokio::test]
    async fn test_cancel_during_enqueue_never_leaves_stale_record() {
        let fx = fixture(&["c1"]);

        let (handle, cancelled) = tokio::join!(
            fx.queue.enqueue_download(input("c1")),
            fx.queue.cancel_by_tag("m1"),
        );
        let handle = handle.unwrap();
        let cancelled = cancelled.unwrap();

        let info = fx.queue.job(&handle.id).await.unwrap().unwrap();
        let record = fx.queue.repo.find_by_id(&handle.id).await.unwrap().unwrap();
        assert_eq!(record.state, info.state.as_str());
        let expected = if cancelled == 1 { JobState::Cancelled } else { JobState::Enqueued };
        assert_eq!(info.state, expected);

        let (restarted, _probe, _notices) = build_queue(fx.remote.clone(), fx.db.clone(), fx._dir.path());
        assert_eq!(restarted.recover_jobs().await.unwrap(), 1 - cancelled);
    }

    #[tokio::test]
    async fn test_finished_jobs_leave_memory_but_stay_queryable() {
        let fx = fixture(&["c1"]);
        tokio::spawn(Arc::clone(&fx.queue).start());

        let handle = fx.queue.enqueue_download(input("c1")).await.unwrap();
        wait_for_record(&fx.queue, &handle.id, JobState::Succeeded).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while fx.queue.jobs.read().await.contains_key(&handle.id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("finished job stayed in memory");
        assert!(!fx.queue.has_unfinished().await);

        let info = fx.queue.job(&handle.id).await.unwrap().unwrap();
        assert_eq!(info.state, JobState::Succeeded);
        assert_eq!(info.progress_data["comic_name"], "Comic");

        let listed = fx.queue.query_by_tag("c1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, handle.id);
        fx.queue.shutdown();
    }

    #[tokio::test]
    async fn test_prune_removes_finished_jobs() {
        let fx = fixture(&["c1"]);
        let handle = fx.queue.enqueue_download(input("c1")).await.unwrap();
        fx.queue.cancel_by_id(&handle.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(fx.queue.prune_finished_jobs(0).await.unwrap(), 1);
        assert!(fx.queue.query_by_tag("c1").await.unwrap().is_empty());
    }
}
