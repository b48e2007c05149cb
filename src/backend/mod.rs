#![forbid(unsafe_code)]

//! Extraction engines behind one interface. `yt-dlp` is the primary engine;
//! `lux` is only reached after the primary has run out of attempts.

use async_trait::async_trait;
use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    error::{FetchError, FetchResult},
    models::{MediaKind, ProgressSink, VideoMetadata},
};

pub mod lux;
#[cfg(test)]
pub(crate) mod testing;
pub mod ytdlp;

pub use lux::LuxBackend;
pub use ytdlp::YtDlpBackend;

const ROTATED_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/94.0.4606.71 Safari/537.36";
const ROTATED_REFERER: &str = "https://www.youtube.com/";

/// Lines of engine stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 20;

/// Client-identifying headers sent with engine requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientIdentity {
    Default,
    Rotated,
}

impl ClientIdentity {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientIdentity::Default => "default",
            ClientIdentity::Rotated => "rotated",
        }
    }

    pub fn headers(self) -> &'static [(&'static str, &'static str)] {
        match self {
            ClientIdentity::Default => &[],
            ClientIdentity::Rotated => &[
                ("User-Agent", ROTATED_USER_AGENT),
                ("Referer", ROTATED_REFERER),
            ],
        }
    }
}

/// Everything an engine needs to put one piece of media on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializeRequest {
    pub url: String,
    pub kind: MediaKind,
    pub selector: String,
    pub playlist: bool,
    /// Directory owned by the job; the produced file lands inside it.
    pub destination: PathBuf,
}

#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_metadata(
        &self,
        url: &str,
        identity: ClientIdentity,
    ) -> FetchResult<VideoMetadata>;

    /// Downloads the requested media and returns the path of the stored file.
    async fn fetch_and_store(
        &self,
        request: &MaterializeRequest,
        identity: ClientIdentity,
        progress: Arc<dyn ProgressSink>,
    ) -> FetchResult<PathBuf>;
}

/// Checks whether `binary -version` runs, the way ffmpeg reports itself.
pub async fn probe_tool(binary: &Path) -> bool {
    let status = Command::new(binary)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => {
            info!(tool = %binary.display(), "found external tool");
            true
        }
        Ok(status) => {
            debug!(tool = %binary.display(), ?status, "tool probe exited unsuccessfully");
            false
        }
        Err(err) => {
            debug!(tool = %binary.display(), error = %err, "tool probe failed to start");
            false
        }
    }
}

/// Runs a command to completion and returns its stdout, classifying a
/// non-zero exit through the engine's stderr.
pub(crate) async fn run_captured(mut command: Command, tool: &str) -> FetchResult<Vec<u8>> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = command
        .output()
        .await
        .map_err(|err| FetchError::ExtractionFailed(format!("failed to launch {tool}: {err}")))?;
    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(engine_failure(tool, output.status.code(), stderr.lines()))
}

/// Collects the last lines an engine wrote to stderr while it runs.
pub(crate) fn spawn_stderr_tail<R>(stream: R) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Ok(Some(line)) = lines.next_line().await {
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail.into()
    })
}

/// Builds the error for a failed engine run from its exit code and stderr.
pub(crate) fn engine_failure<'a>(
    tool: &str,
    code: Option<i32>,
    stderr: impl IntoIterator<Item = &'a str>,
) -> FetchError {
    let lines: Vec<&str> = stderr
        .into_iter()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    let detail = lines
        .iter()
        .rev()
        .find(|line| line.starts_with("ERROR") || line.contains("error"))
        .or_else(|| lines.last())
        .map(|line| line.to_string());
    let message = match (detail, code) {
        (Some(detail), _) => format!("{tool}: {detail}"),
        (None, Some(code)) => format!("{tool} exited with status {code}"),
        (None, None) => format!("{tool} was terminated by a signal"),
    };
    // Challenge markers may appear on any line, not only the last error.
    if lines.iter().any(|line| crate::error::is_challenge(line)) {
        FetchError::ChallengeDetected(message)
    } else {
        FetchError::from_engine_message(message)
    }
}
