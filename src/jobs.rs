#![forbid(unsafe_code)]

//! In-memory job table owned by a single actor task.
//!
//! Workers and request handlers talk to the actor through [`JobTracker`];
//! fire-and-forget updates never wait, queries get their answer over a
//! oneshot channel. Deferred cleanups are timer tasks keyed by job id that
//! post back into the mailbox when they fire.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
    time::{Instant, MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    artifacts,
    error::{FetchError, FetchResult},
    models::{DownloadResult, ProgressEvent, ProgressSink},
};

pub const DEFAULT_CLEANUP_DELAY: Duration = Duration::from_secs(300);
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(3600);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Downloading,
    Processing,
    Complete,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Downloading => "downloading",
            JobStatus::Processing => "processing",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }
}

/// Point-in-time copy of a job handed to pollers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    /// Base name of the produced file.
    pub filename: Option<String>,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
    pub error: Option<String>,
    pub quality_message: Option<String>,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Parent of the per-job work directories.
    pub work_root: PathBuf,
    pub job_ttl: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug)]
struct JobRecord {
    status: JobStatus,
    progress: f64,
    file: Option<PathBuf>,
    error: Option<String>,
    quality_message: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<Instant>,
}

impl JobRecord {
    fn new() -> Self {
        Self {
            status: JobStatus::Starting,
            progress: 0.0,
            file: None,
            error: None,
            quality_message: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn snapshot(&self, id: &str) -> JobSnapshot {
        let filename = self
            .file
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned());
        let download_url = (self.status == JobStatus::Complete && self.file.is_some())
            .then(|| format!("/api/downloads/{id}/file"));
        JobSnapshot {
            id: id.to_string(),
            status: self.status,
            progress: self.progress,
            filename,
            file_path: self.file.clone(),
            error: self.error.clone(),
            quality_message: self.quality_message.clone(),
            start_time: self.started_at,
            download_url,
        }
    }
}

#[derive(Debug)]
enum JobCommand {
    Create {
        reply: oneshot::Sender<String>,
    },
    UpdateProgress {
        id: String,
        percent: f64,
    },
    Transition {
        id: String,
        status: JobStatus,
    },
    Complete {
        id: String,
        result: DownloadResult,
    },
    Fail {
        id: String,
        message: String,
    },
    Snapshot {
        id: String,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    Remove {
        id: String,
        reply: oneshot::Sender<Option<JobSnapshot>>,
    },
    ScheduleCleanup {
        id: String,
        delay: Duration,
        reply: oneshot::Sender<bool>,
    },
    CleanupDue {
        id: String,
        generation: u64,
    },
}

struct JobActor {
    config: TrackerConfig,
    jobs: HashMap<String, JobRecord>,
    cleanups: HashMap<String, (u64, AbortHandle)>,
    counter: u64,
    generation: u64,
    mailbox: mpsc::WeakUnboundedSender<JobCommand>,
}

impl JobActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<JobCommand>) {
        let mut sweep = interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sweep.tick() => self.sweep_abandoned(),
            }
        }
        for (_, (_, timer)) in self.cleanups.drain() {
            timer.abort();
        }
        debug!("job tracker stopped");
    }

    fn handle(&mut self, command: JobCommand) {
        match command {
            JobCommand::Create { reply } => {
                let id = format!("{}-{}", Utc::now().timestamp_millis(), self.counter);
                self.counter += 1;
                self.jobs.insert(id.clone(), JobRecord::new());
                debug!(job_id = %id, "created job");
                let _ = reply.send(id);
            }
            JobCommand::UpdateProgress { id, percent } => {
                if let Some(record) = self.active_job(&id) {
                    record.progress = percent.clamp(0.0, 100.0);
                }
            }
            JobCommand::Transition { id, status } => {
                if let Some(record) = self.active_job(&id)
                    && !status.is_terminal()
                    && record.status != status
                {
                    debug!(job_id = %id, status = status.as_str(), "job transition");
                    record.status = status;
                }
            }
            JobCommand::Complete { id, result } => {
                if let Some(record) = self.active_job(&id) {
                    record.status = JobStatus::Complete;
                    record.progress = 100.0;
                    record.file = Some(result.file_path);
                    record.quality_message = result.quality_message;
                    record.finished_at = Some(Instant::now());
                    info!(job_id = %id, "job complete");
                }
            }
            JobCommand::Fail { id, message } => {
                if let Some(record) = self.active_job(&id) {
                    warn!(job_id = %id, error = %message, "job failed");
                    record.status = JobStatus::Error;
                    record.error = Some(message);
                    record.file = None;
                    record.finished_at = Some(Instant::now());
                }
            }
            JobCommand::Snapshot { id, reply } => {
                let _ = reply.send(self.jobs.get(&id).map(|record| record.snapshot(&id)));
            }
            JobCommand::Remove { id, reply } => {
                if let Some((_, timer)) = self.cleanups.remove(&id) {
                    timer.abort();
                }
                let _ = reply.send(self.discard(&id));
            }
            JobCommand::ScheduleCleanup { id, delay, reply } => {
                let _ = reply.send(self.schedule_cleanup(id, delay));
            }
            JobCommand::CleanupDue { id, generation } => {
                let current = self.cleanups.get(&id).map(|(pending, _)| *pending);
                if current == Some(generation) {
                    self.cleanups.remove(&id);
                    if self.discard(&id).is_some() {
                        info!(job_id = %id, "cleaned up served download");
                    }
                }
            }
        }
    }

    fn active_job(&mut self, id: &str) -> Option<&mut JobRecord> {
        self.jobs
            .get_mut(id)
            .filter(|record| !record.status.is_terminal())
    }

    fn schedule_cleanup(&mut self, id: String, delay: Duration) -> bool {
        if !self.jobs.contains_key(&id) {
            return false;
        }
        if let Some((_, previous)) = self.cleanups.remove(&id) {
            previous.abort();
        }
        self.generation += 1;
        let generation = self.generation;
        let mailbox = self.mailbox.clone();
        let job_id = id.clone();
        let timer = tokio::spawn(async move {
            sleep(delay).await;
            if let Some(mailbox) = mailbox.upgrade() {
                let _ = mailbox.send(JobCommand::CleanupDue {
                    id: job_id,
                    generation,
                });
            }
        });
        debug!(job_id = %id, delay_secs = delay.as_secs(), "scheduled cleanup");
        self.cleanups.insert(id, (generation, timer.abort_handle()));
        true
    }

    /// Drops the record and deletes its artifacts in the background.
    fn discard(&mut self, id: &str) -> Option<JobSnapshot> {
        let record = self.jobs.remove(id)?;
        let snapshot = record.snapshot(id);
        let file = record.file;
        let work_dir = self.config.work_root.join(id);
        tokio::spawn(async move {
            artifacts::discard(file.as_deref(), Some(&work_dir)).await;
        });
        Some(snapshot)
    }

    fn sweep_abandoned(&mut self) {
        let ttl = self.config.job_ttl;
        let expired: Vec<String> = self
            .jobs
            .iter()
            .filter(|(id, record)| {
                record.status.is_terminal()
                    && !self.cleanups.contains_key(id.as_str())
                    && record
                        .finished_at
                        .is_some_and(|finished| finished.elapsed() > ttl)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.discard(id);
        }
        if !expired.is_empty() {
            info!(removed = expired.len(), "swept abandoned jobs");
        }
    }
}

/// Cloneable handle to the job actor.
#[derive(Debug, Clone)]
pub struct JobTracker {
    mailbox: mpsc::UnboundedSender<JobCommand>,
}

impl JobTracker {
    /// Starts the actor on the current runtime. It stops once every handle
    /// is dropped.
    pub fn spawn(config: TrackerConfig) -> Self {
        let (mailbox, commands) = mpsc::unbounded_channel();
        let actor = JobActor {
            config,
            jobs: HashMap::new(),
            cleanups: HashMap::new(),
            counter: 0,
            generation: 0,
            mailbox: mailbox.downgrade(),
        };
        tokio::spawn(actor.run(commands));
        Self { mailbox }
    }

    fn send(&self, command: JobCommand) {
        if self.mailbox.send(command).is_err() {
            debug!("job tracker stopped, dropping update");
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> JobCommand,
    ) -> FetchResult<T> {
        let (reply, response) = oneshot::channel();
        self.mailbox
            .send(build(reply))
            .map_err(|_| FetchError::TrackerClosed)?;
        response.await.map_err(|_| FetchError::TrackerClosed)
    }

    /// Registers a new job in `starting` and returns its id.
    pub async fn create(&self) -> FetchResult<String> {
        self.request(|reply| JobCommand::Create { reply }).await
    }

    pub fn update_progress(&self, id: &str, percent: f64) {
        self.send(JobCommand::UpdateProgress {
            id: id.to_string(),
            percent,
        });
    }

    pub fn transition(&self, id: &str, status: JobStatus) {
        self.send(JobCommand::Transition {
            id: id.to_string(),
            status,
        });
    }

    pub fn complete(&self, id: &str, result: DownloadResult) {
        self.send(JobCommand::Complete {
            id: id.to_string(),
            result,
        });
    }

    pub fn fail(&self, id: &str, message: impl Into<String>) {
        self.send(JobCommand::Fail {
            id: id.to_string(),
            message: message.into(),
        });
    }

    pub async fn snapshot(&self, id: &str) -> FetchResult<JobSnapshot> {
        let id = id.to_string();
        let key = id.clone();
        self.request(|reply| JobCommand::Snapshot { id: key, reply })
            .await?
            .ok_or_else(|| FetchError::NotFound(format!("download {id}")))
    }

    /// Removes a job now, cancelling any pending cleanup. Removing an unknown
    /// job is not an error.
    pub async fn remove(&self, id: &str) -> FetchResult<Option<JobSnapshot>> {
        let id = id.to_string();
        self.request(|reply| JobCommand::Remove { id, reply }).await
    }

    /// (Re)arms the single cleanup timer for a job. Returns false for
    /// unknown jobs.
    pub async fn schedule_cleanup(&self, id: &str, delay: Duration) -> FetchResult<bool> {
        let id = id.to_string();
        self.request(|reply| JobCommand::ScheduleCleanup { id, delay, reply })
            .await
    }

    pub fn progress_sink(&self, id: &str) -> Arc<dyn ProgressSink> {
        Arc::new(JobProgress {
            tracker: self.clone(),
            id: id.to_string(),
        })
    }
}

/// Forwards engine progress for one job to the actor.
struct JobProgress {
    tracker: JobTracker,
    id: String,
}

impl ProgressSink for JobProgress {
    fn report(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Downloading { .. } => {
                // Playlists report Finished per entry; the next entry resumes downloading.
                self.tracker.transition(&self.id, JobStatus::Downloading);
                self.tracker.update_progress(&self.id, event.percent());
            }
            ProgressEvent::Finished => {
                self.tracker.transition(&self.id, JobStatus::Processing);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn tracker(root: &TempDir) -> JobTracker {
        JobTracker::spawn(TrackerConfig {
            work_root: root.path().to_path_buf(),
            job_ttl: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(10),
        })
    }

    fn result_for(path: PathBuf, message: Option<&str>) -> DownloadResult {
        DownloadResult {
            file_path: path,
            quality_downgraded: message.is_some(),
            requested_quality: "1080p".into(),
            actual_quality: if message.is_some() { "720p" } else { "1080p" }.into(),
            quality_message: message.map(str::to_string),
        }
    }

    fn produce_file(root: &TempDir, id: &str) -> PathBuf {
        let dir = root.path().join(id);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("Alpha Title.mp4");
        fs::write(&path, b"media").unwrap();
        path
    }

    async fn wait_until_gone(path: &Path) {
        for _ in 0..200 {
            tokio::task::yield_now().await;
            if !path.exists() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("{} was not removed", path.display());
    }

    #[tokio::test]
    async fn new_jobs_poll_as_starting() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let id = tracker.create().await.unwrap();
        let snapshot = tracker.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Starting);
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.filename, None);
        assert_eq!(snapshot.download_url, None);
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let first = tracker.create().await.unwrap();
        let second = tracker.create().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let err = tracker.snapshot("nope").await.unwrap_err();
        assert_eq!(err, FetchError::NotFound("download nope".into()));
        assert!(!tracker.schedule_cleanup("nope", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn lifecycle_reaches_complete_with_retrieval_handle() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let id = tracker.create().await.unwrap();
        let sink = tracker.progress_sink(&id);

        tracker.transition(&id, JobStatus::Downloading);
        sink.report(ProgressEvent::Downloading {
            bytes_downloaded: 25,
            bytes_total: Some(100),
        });
        let snapshot = tracker.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Downloading);
        assert_eq!(snapshot.progress, 25.0);

        sink.report(ProgressEvent::Finished);
        assert_eq!(
            tracker.snapshot(&id).await.unwrap().status,
            JobStatus::Processing
        );

        let path = produce_file(&root, &id);
        tracker.complete(&id, result_for(path.clone(), Some("downgraded")));
        let snapshot = tracker.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Complete);
        assert_eq!(snapshot.progress, 100.0);
        assert_eq!(snapshot.filename.as_deref(), Some("Alpha Title.mp4"));
        assert_eq!(snapshot.file_path, Some(path));
        assert_eq!(snapshot.quality_message.as_deref(), Some("downgraded"));
        assert_eq!(
            snapshot.download_url,
            Some(format!("/api/downloads/{id}/file"))
        );

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["downloadUrl"], format!("/api/downloads/{id}/file"));
        assert!(json.get("filePath").is_none());
    }

    #[tokio::test]
    async fn progress_after_an_entry_finishes_resumes_downloading() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let id = tracker.create().await.unwrap();
        let sink = tracker.progress_sink(&id);

        sink.report(ProgressEvent::Downloading {
            bytes_downloaded: 100,
            bytes_total: Some(100),
        });
        sink.report(ProgressEvent::Finished);
        assert_eq!(
            tracker.snapshot(&id).await.unwrap().status,
            JobStatus::Processing
        );

        sink.report(ProgressEvent::Downloading {
            bytes_downloaded: 10,
            bytes_total: Some(100),
        });
        let snapshot = tracker.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Downloading);
        assert_eq!(snapshot.progress, 10.0);

        sink.report(ProgressEvent::Finished);
        assert_eq!(
            tracker.snapshot(&id).await.unwrap().status,
            JobStatus::Processing
        );
    }

    #[tokio::test]
    async fn failures_keep_the_job_pollable_without_a_file() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let id = tracker.create().await.unwrap();
        tracker.transition(&id, JobStatus::Downloading);
        tracker.fail(&id, "video download failed");
        tracker.update_progress(&id, 50.0);
        tracker.transition(&id, JobStatus::Processing);

        let snapshot = tracker.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Error);
        assert_eq!(snapshot.error.as_deref(), Some("video download failed"));
        assert_eq!(snapshot.filename, None);
        assert_eq!(snapshot.progress, 0.0);
        assert_eq!(snapshot.download_url, None);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_removes_job_and_file_after_delay() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let id = tracker.create().await.unwrap();
        let path = produce_file(&root, &id);
        tracker.complete(&id, result_for(path.clone(), None));

        assert!(
            tracker
                .schedule_cleanup(&id, Duration::from_secs(300))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_secs(299)).await;
        assert!(tracker.snapshot(&id).await.is_ok());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(
            tracker.snapshot(&id).await,
            Err(FetchError::NotFound(_))
        ));
        wait_until_gone(&path).await;
        wait_until_gone(&root.path().join(&id)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_timer() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let id = tracker.create().await.unwrap();
        let path = produce_file(&root, &id);
        tracker.complete(&id, result_for(path, None));

        tracker
            .schedule_cleanup(&id, Duration::from_secs(300))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;
        tracker
            .schedule_cleanup(&id, Duration::from_secs(300))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(tracker.snapshot(&id).await.is_ok());

        tokio::time::sleep(Duration::from_secs(101)).await;
        assert!(tracker.snapshot(&id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn remove_cancels_cleanup_and_is_idempotent() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let id = tracker.create().await.unwrap();
        let path = produce_file(&root, &id);
        tracker.complete(&id, result_for(path.clone(), None));
        tracker
            .schedule_cleanup(&id, Duration::from_secs(5))
            .await
            .unwrap();

        let removed = tracker.remove(&id).await.unwrap();
        assert_eq!(removed.map(|snapshot| snapshot.status), Some(JobStatus::Complete));
        assert_eq!(tracker.remove(&id).await.unwrap(), None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(tracker.snapshot(&id).await.is_err());
        wait_until_gone(&path).await;
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_terminal_jobs_are_swept() {
        let root = tempdir().unwrap();
        let tracker = tracker(&root);
        let finished = tracker.create().await.unwrap();
        let running = tracker.create().await.unwrap();
        tracker.fail(&finished, "boom");
        tracker.transition(&running, JobStatus::Downloading);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert!(tracker.snapshot(&finished).await.is_ok());

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(tracker.snapshot(&finished).await.is_err());
        assert_eq!(
            tracker.snapshot(&running).await.unwrap().status,
            JobStatus::Downloading
        );
    }
}
