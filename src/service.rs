#![forbid(unsafe_code)]

//! Request-level operations: metadata lookups through the cache, accepting
//! downloads, polling, and serving finished files.

use serde::{Deserialize, Serialize};
use std::{
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::Semaphore, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    backend::MaterializeRequest,
    cache::MetadataCache,
    error::{FetchError, FetchResult},
    jobs::{JobSnapshot, JobStatus, JobTracker, TrackerConfig},
    models::{DownloadResult, MediaKind, VideoMetadata},
    orchestrator::Orchestrator,
    quality::{self, Resolution},
    source::SourceUrl,
    stats::{DownloadOutcome, NewDownload, StatsRecorder, StatsSummary, anonymize_ip},
};

const AUDIO_FALLBACK_SELECTOR: &str = "bestaudio/best";

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    /// Parent of the per-job work directories.
    pub download_root: PathBuf,
    pub max_concurrent_downloads: usize,
    pub cleanup_delay: Duration,
    pub cache_capacity: usize,
    pub cache_expiry: Duration,
    pub cache_sweep_interval: Duration,
    pub job_ttl: Duration,
    pub job_sweep_interval: Duration,
}

/// Body of a download submission.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default, rename = "type")]
    pub kind: MediaKind,
    #[serde(default)]
    pub playlist: bool,
}

fn default_format() -> String {
    "best".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedDownload {
    pub download_id: String,
    pub message: String,
}

/// A finished file ready to be streamed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct ServedFile {
    pub path: PathBuf,
    pub file_name: String,
}

/// Everything a worker needs, validated before the job is accepted.
#[derive(Debug, Clone)]
struct JobPlan {
    source: SourceUrl,
    kind: MediaKind,
    format: String,
    playlist: bool,
    client_prefix: Option<String>,
}

struct Inner {
    orchestrator: Orchestrator,
    cache: Arc<MetadataCache<Arc<VideoMetadata>>>,
    jobs: JobTracker,
    stats: Arc<dyn StatsRecorder>,
    permits: Arc<Semaphore>,
    download_root: PathBuf,
    cleanup_delay: Duration,
}

#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<Inner>,
}

impl DownloadService {
    /// Builds the service and starts its background tasks on the current
    /// runtime.
    pub fn new(
        orchestrator: Orchestrator,
        stats: Arc<dyn StatsRecorder>,
        settings: ServiceSettings,
    ) -> Self {
        let cache = Arc::new(MetadataCache::new(
            settings.cache_capacity,
            settings.cache_expiry,
        ));
        cache.spawn_sweeper(settings.cache_sweep_interval);
        let jobs = JobTracker::spawn(TrackerConfig {
            work_root: settings.download_root.clone(),
            job_ttl: settings.job_ttl,
            sweep_interval: settings.job_sweep_interval,
        });
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                cache,
                jobs,
                stats,
                permits: Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1))),
                download_root: settings.download_root,
                cleanup_delay: settings.cleanup_delay,
            }),
        }
    }

    /// Metadata for a source URL, served from the cache while fresh.
    pub async fn fetch_info(&self, url: &str) -> FetchResult<Arc<VideoMetadata>> {
        let source = SourceUrl::parse(url)?;
        self.inner.metadata_for(&source).await
    }

    /// Validates the request, registers a job, and starts its worker. The
    /// returned id is pollable immediately.
    pub async fn start_download(
        &self,
        request: DownloadRequest,
        client_ip: Option<IpAddr>,
    ) -> FetchResult<AcceptedDownload> {
        if request.url.trim().is_empty() {
            return Err(FetchError::InvalidInput("URL is required".into()));
        }
        let source = SourceUrl::parse(&request.url)?;
        let playlist = source.video_id().is_none() || (request.playlist && source.is_playlist());
        let format = match request.format.trim() {
            "" => default_format(),
            other => other.to_string(),
        };
        let plan = JobPlan {
            source,
            kind: request.kind,
            format,
            playlist,
            client_prefix: client_ip.map(anonymize_ip),
        };

        let job_id = self.inner.jobs.create().await?;
        info!(
            job_id = %job_id,
            url = %plan.source.canonical(),
            kind = plan.kind.as_str(),
            format = %plan.format,
            playlist = plan.playlist,
            "accepted download"
        );
        tokio::spawn(run_job(self.inner.clone(), job_id.clone(), plan));
        Ok(AcceptedDownload {
            download_id: job_id,
            message: "Download started".to_string(),
        })
    }

    pub async fn poll_status(&self, job_id: &str) -> FetchResult<JobSnapshot> {
        self.inner.jobs.snapshot(job_id).await
    }

    /// Hands out a completed job's file and (re)arms its deferred cleanup.
    pub async fn retrieve_file(&self, job_id: &str) -> FetchResult<ServedFile> {
        let snapshot = self.inner.jobs.snapshot(job_id).await?;
        let (JobStatus::Complete, Some(path)) = (snapshot.status, snapshot.file_path) else {
            return Err(FetchError::NotFound(format!("file for download {job_id}")));
        };
        if !tokio::fs::metadata(&path)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
        {
            return Err(FetchError::NotFound(format!("file for download {job_id}")));
        }
        self.inner
            .jobs
            .schedule_cleanup(job_id, self.inner.cleanup_delay)
            .await?;
        let file_name = snapshot
            .filename
            .unwrap_or_else(|| format!("{job_id}.bin"));
        Ok(ServedFile { path, file_name })
    }

    pub async fn record_visit(&self) {
        if let Err(err) = self.inner.stats.record_visit().await {
            warn!(error = %format!("{err:#}"), "failed to record visit");
        }
    }

    pub async fn stats_summary(&self) -> anyhow::Result<StatsSummary> {
        self.inner.stats.summary().await
    }
}

impl Inner {
    async fn metadata_for(&self, source: &SourceUrl) -> FetchResult<Arc<VideoMetadata>> {
        let key = source.canonical();
        if let Some(hit) = self.cache.get(&key) {
            debug!(url = %key, "metadata cache hit");
            return Ok(hit);
        }
        let metadata = Arc::new(self.orchestrator.fetch_metadata(&key).await?);
        self.cache.put(key, metadata.clone());
        Ok(metadata)
    }

    async fn resolve_quality(&self, plan: &JobPlan) -> FetchResult<Resolution> {
        match (plan.kind, plan.playlist) {
            (MediaKind::Audio, _) => {
                let selector = match plan.format.as_str() {
                    "best" => AUDIO_FALLBACK_SELECTOR,
                    other => other,
                };
                Ok(Resolution::passthrough(selector, plan.format.as_str()))
            }
            (MediaKind::Video, true) => Ok(Resolution::passthrough(
                quality::playlist_selector(&plan.format),
                plan.format.as_str(),
            )),
            (MediaKind::Video, false) => {
                let single = SourceUrl::parse(&plan.source.target(false))?;
                let metadata = self.metadata_for(&single).await?;
                Ok(quality::resolve(
                    &plan.format,
                    &metadata.formats,
                    &metadata.available_heights,
                ))
            }
        }
    }

    async fn execute(&self, job_id: &str, plan: &JobPlan) -> FetchResult<DownloadResult> {
        let resolution = self.resolve_quality(plan).await?;
        if let Some(message) = &resolution.message {
            info!(job_id, message = %message, "quality downgraded");
        }
        let request = MaterializeRequest {
            url: plan.source.target(plan.playlist),
            kind: plan.kind,
            selector: resolution.selector,
            playlist: plan.playlist,
            destination: self.download_root.join(job_id),
        };
        let file_path = self
            .orchestrator
            .materialize(&request, self.jobs.progress_sink(job_id))
            .await?;
        Ok(DownloadResult {
            file_path,
            quality_downgraded: resolution.downgraded,
            requested_quality: resolution.requested,
            actual_quality: resolution.actual,
            quality_message: resolution.message,
        })
    }

    async fn record_started(&self, plan: &JobPlan) -> Option<i64> {
        let title = self
            .cache
            .get(&plan.source.canonical())
            .map(|metadata| metadata.title.clone());
        let download = NewDownload {
            url: plan.source.canonical(),
            title,
            kind: plan.kind,
            quality: plan.format.clone(),
            client_prefix: plan.client_prefix.clone(),
        };
        match self.stats.record_download_started(&download).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "failed to record download start");
                None
            }
        }
    }

    async fn record_finished(
        &self,
        record_id: Option<i64>,
        kind: MediaKind,
        outcome: DownloadOutcome,
        file: Option<&Path>,
        started: Instant,
    ) {
        let Some(record_id) = record_id else {
            return;
        };
        let file_size = match file {
            Some(path) => tokio::fs::metadata(path).await.ok().map(|meta| meta.len()),
            None => None,
        };
        let elapsed = Some(started.elapsed().as_secs_f64());
        if let Err(err) = self
            .stats
            .update_download_status(record_id, outcome, file_size, elapsed)
            .await
        {
            warn!(record_id, error = %format!("{err:#}"), "failed to update download record");
        }
        if outcome == DownloadOutcome::Completed
            && let Err(err) = self.stats.record_download_completed(kind).await
        {
            warn!(error = %format!("{err:#}"), "failed to record completed download");
        }
    }
}

async fn run_job(inner: Arc<Inner>, job_id: String, plan: JobPlan) {
    let _permit = match inner.permits.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            inner.jobs.fail(&job_id, "download queue is closed");
            return;
        }
    };
    inner.jobs.transition(&job_id, JobStatus::Downloading);
    let started = Instant::now();
    let record_id = inner.record_started(&plan).await;

    match inner.execute(&job_id, &plan).await {
        Ok(result) => {
            info!(
                job_id = %job_id,
                file = %result.file_path.display(),
                elapsed_secs = started.elapsed().as_secs_f64(),
                "download finished"
            );
            inner
                .record_finished(
                    record_id,
                    plan.kind,
                    DownloadOutcome::Completed,
                    Some(&result.file_path),
                    started,
                )
                .await;
            inner.jobs.complete(&job_id, result);
        }
        Err(err) => {
            inner
                .record_finished(record_id, plan.kind, DownloadOutcome::Failed, None, started)
                .await;
            inner.jobs.fail(&job_id, err.to_string());
            crate::artifacts::discard(None, Some(&inner.download_root.join(&job_id))).await;
        }
    }
}
