#![forbid(unsafe_code)]

//! HTTP front end: metadata lookups, download jobs, file retrieval, and the
//! static web client.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{ConnectInfo, Path as AxumPath, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use tubefetch::{
    backend::{LuxBackend, YtDlpBackend, probe_tool},
    config::{RuntimeOverrides, Settings, resolve_settings},
    error::FetchError,
    jobs::{DEFAULT_SWEEP_INTERVAL as JOB_SWEEP_INTERVAL, JobSnapshot},
    models::VideoMetadata,
    orchestrator::{Orchestrator, RetryPolicy},
    rate_limit::RateLimiter,
    service::{AcceptedDownload, DownloadRequest, DownloadService, ServiceSettings},
    stats::{NoopStats, StatsRecorder, StatsStore, StatsSummary},
};

const DEFAULT_LOG_FILTER: &str = "tubefetch=info,server=info";

#[derive(Debug, Parser)]
#[command(name = "server", about = "Serve the tubefetch download API")]
struct Args {
    /// Address to listen on.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Directory holding the web client.
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Parent directory for job output instead of a temporary directory.
    #[arg(long)]
    download_root: Option<PathBuf>,
    /// SQLite database for download statistics.
    #[arg(long)]
    stats_db: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl Args {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            www_root: self.www_root,
            download_root: self.download_root,
            stats_db: self.stats_db,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    service: DownloadService,
    www_root: Option<Arc<PathBuf>>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::InvalidInput(message) => Self::bad_request(message),
            err @ FetchError::NotFound(_) => Self::not_found(err.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with(fmt::layer())
        .init();

    let settings = resolve_settings(Args::parse().into_overrides())?;
    let host: IpAddr = settings
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", settings.host))?;

    // Dropping the scratch directory at the end of main removes it.
    let (download_root, scratch) = match settings.download_root.clone() {
        Some(root) => {
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating download root {}", root.display()))?;
            (root, None)
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix("tubefetch-")
                .tempdir()
                .context("creating temporary download directory")?;
            (dir.path().to_path_buf(), Some(dir))
        }
    };

    let service = build_service(&settings, download_root).await?;
    let state = AppState {
        service,
        www_root: settings.www_root.clone().map(Arc::new),
    };

    let app = router(state);
    let addr = SocketAddr::new(host, settings.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("running API server")?;

    drop(scratch);
    info!("server stopped");
    Ok(())
}

async fn build_service(settings: &Settings, download_root: PathBuf) -> Result<DownloadService> {
    let ffmpeg = if probe_tool(&settings.ffmpeg_bin).await {
        info!(ffmpeg = %settings.ffmpeg_bin.display(), "ffmpeg available");
        Some(settings.ffmpeg_bin.clone())
    } else {
        warn!(
            ffmpeg = %settings.ffmpeg_bin.display(),
            "ffmpeg not found, audio stays in its native format"
        );
        None
    };

    let stats: Arc<dyn StatsRecorder> = match &settings.stats_db {
        Some(path) => Arc::new(
            StatsStore::open(path)
                .await
                .context("initializing statistics store")?,
        ),
        None => {
            info!("no statistics database configured");
            Arc::new(NoopStats)
        }
    };

    let orchestrator = Orchestrator::new(
        Arc::new(YtDlpBackend::new(&settings.ytdlp_bin, ffmpeg.clone())),
        Arc::new(LuxBackend::new(&settings.lux_bin, ffmpeg)),
        Arc::new(RateLimiter::new(settings.rate_limit_delay)),
        RetryPolicy {
            attempts: settings.retry_count,
            base_delay: settings.retry_delay,
        },
    );

    info!(download_root = %download_root.display(), "storing downloads");
    Ok(DownloadService::new(
        orchestrator,
        stats,
        ServiceSettings {
            download_root,
            max_concurrent_downloads: settings.max_concurrent_downloads,
            cleanup_delay: settings.cleanup_delay,
            cache_capacity: settings.cache_capacity,
            cache_expiry: settings.cache_expiry,
            cache_sweep_interval: settings.cache_sweep_interval,
            job_ttl: settings.job_ttl,
            job_sweep_interval: JOB_SWEEP_INTERVAL,
        },
    ))
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/info", post(get_info))
        .route("/api/downloads", post(start_download))
        .route("/api/downloads/{id}", get(get_download_status))
        .route("/api/downloads/{id}/file", get(download_file))
        .route("/api/stats", get(get_stats))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutting down");
}

async fn get_info(
    State(state): State<AppState>,
    Json(request): Json<InfoRequest>,
) -> ApiResult<Json<VideoMetadata>> {
    if request.url.trim().is_empty() {
        return Err(ApiError::bad_request("URL is required"));
    }
    let metadata = state.service.fetch_info(&request.url).await?;
    Ok(Json(metadata.as_ref().clone()))
}

async fn start_download(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(request): Json<DownloadRequest>,
) -> ApiResult<Json<AcceptedDownload>> {
    let accepted = state
        .service
        .start_download(request, Some(peer.ip()))
        .await?;
    Ok(Json(accepted))
}

async fn get_download_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobSnapshot>> {
    Ok(Json(state.service.poll_status(&id).await?))
}

async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let served = state.service.retrieve_file(&id).await?;
    let file = File::open(&served.path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let size = file
        .metadata()
        .await
        .map_err(|_| ApiError::not_found("file not found"))?
        .len();

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    insert_content_type(headers, &served.path);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&served.file_name)) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn get_stats(State(state): State<AppState>) -> ApiResult<Json<StatsSummary>> {
    state
        .service
        .stats_summary()
        .await
        .map(Json)
        .map_err(|err| ApiError::internal(format!("{err:#}")))
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }
    let Some(root) = state.www_root.as_deref() else {
        return ApiError::not_found("file not found").into_response();
    };
    if path == "/" || path == "/index.html" {
        state.service.record_visit().await;
    }
    match serve_www_path(root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(root.join("index.html")).await,
        Ok(_) => stream_file(target).await,
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

async fn stream_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    insert_content_type(response.headers_mut(), &path);
    Ok(response)
}

fn insert_content_type(headers: &mut HeaderMap, path: &Path) {
    if let Some(mime) = MimeGuess::from_path(path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
}

/// `attachment` header with an ASCII fallback name and the exact name in
/// RFC 5987 form.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|ch| match ch {
            '"' | '\\' => '_',
            ch if ch.is_ascii() && !ch.is_ascii_control() => ch,
            _ => '_',
        })
        .collect();
    let encoded: String = file_name
        .bytes()
        .map(|byte| match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                (byte as char).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect();
    format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}")
}
