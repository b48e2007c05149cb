#![forbid(unsafe_code)]

use async_trait::async_trait;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
};
use tracing::{debug, info, trace};

use super::{
    ClientIdentity, ExtractionBackend, MaterializeRequest, engine_failure, run_captured,
    spawn_stderr_tail,
};
use crate::{
    artifacts,
    error::{FetchError, FetchResult},
    models::{
        FormatOption, MediaKind, PLAYLIST_PREVIEW_LIMIT, PlaylistEntry, ProgressEvent,
        ProgressSink, VideoMetadata, audio_formats, best_video_option, default_video_formats,
        playlist_video_formats,
    },
    source::SourceUrl,
};

const TOOL: &str = "yt-dlp";
const PROGRESS_MARKER: &str = "tubefetch-progress";
const FILE_MARKER: &str = "tubefetch-file";
const DEFAULT_AUDIO_SELECTOR: &str = "bestaudio/best";

/// Primary engine driving the `yt-dlp` CLI.
#[derive(Debug, Clone)]
pub struct YtDlpBackend {
    binary: PathBuf,
    ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct DownloadRun {
    files: Vec<PathBuf>,
    playlist_title: Option<String>,
}

#[derive(Debug, PartialEq)]
enum OutputLine {
    Progress(ProgressEvent),
    File {
        playlist_title: Option<String>,
        path: PathBuf,
    },
}

impl YtDlpBackend {
    /// `ffmpeg` is the binary used for merging and mp3 conversion, when one
    /// was found at startup.
    pub fn new(binary: impl Into<PathBuf>, ffmpeg: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg,
        }
    }

    fn command(&self, identity: ClientIdentity) -> Command {
        let mut command = Command::new(&self.binary);
        command.args(["--no-warnings", "--no-color", "--no-check-certificates"]);
        for (name, value) in identity.headers() {
            command.arg("--add-header").arg(format!("{name}:{value}"));
        }
        command
    }

    async fn run_download(
        &self,
        request: &MaterializeRequest,
        identity: ClientIdentity,
        output_dir: &Path,
        progress: &dyn ProgressSink,
    ) -> FetchResult<DownloadRun> {
        let mut command = self.command(identity);
        command
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(format!(
                "download:{PROGRESS_MARKER} %(progress.downloaded_bytes)s %(progress.total_bytes)s %(progress.total_bytes_estimate)s %(progress.status)s"
            ))
            .arg("--print")
            .arg(format!(
                "after_move:{FILE_MARKER}\t%(playlist_title|)s\t%(filepath)s"
            ))
            .arg("--output")
            .arg(output_dir.join("%(title)s.%(ext)s"))
            .arg(if request.playlist {
                "--yes-playlist"
            } else {
                "--no-playlist"
            });

        match request.kind {
            MediaKind::Video => {
                command.arg("--format").arg(&request.selector);
                if let Some(ffmpeg) = &self.ffmpeg {
                    command
                        .args(["--merge-output-format", "mp4", "--ffmpeg-location"])
                        .arg(ffmpeg);
                }
            }
            MediaKind::Audio => {
                let selector = if request.selector.trim().is_empty() {
                    DEFAULT_AUDIO_SELECTOR
                } else {
                    request.selector.as_str()
                };
                command.arg("--format").arg(selector);
                if let Some(ffmpeg) = &self.ffmpeg {
                    command
                        .args([
                            "--extract-audio",
                            "--audio-format",
                            "mp3",
                            "--audio-quality",
                            "192K",
                            "--ffmpeg-location",
                        ])
                        .arg(ffmpeg);
                }
            }
        }
        command
            .arg("--")
            .arg(&request.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(url = %request.url, kind = request.kind.as_str(), selector = %request.selector, "starting yt-dlp download");
        let mut child = command
            .spawn()
            .map_err(|err| FetchError::ExtractionFailed(format!("failed to launch {TOOL}: {err}")))?;
        let stderr = child.stderr.take().map(spawn_stderr_tail);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FetchError::ExtractionFailed(format!("{TOOL} stdout unavailable")))?;

        let mut run = DownloadRun::default();
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|err| FetchError::ExtractionFailed(format!("reading {TOOL} output: {err}")))?
        {
            match parse_output_line(&line) {
                Some(OutputLine::Progress(event)) => progress.report(event),
                Some(OutputLine::File {
                    playlist_title,
                    path,
                }) => {
                    if run.playlist_title.is_none() {
                        run.playlist_title = playlist_title;
                    }
                    run.files.push(path);
                }
                None => trace!(line = %line, "yt-dlp output"),
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| FetchError::ExtractionFailed(format!("waiting for {TOOL}: {err}")))?;
        let tail = match stderr {
            Some(handle) => handle.await.unwrap_or_default(),
            None => Vec::new(),
        };
        if !status.success() {
            return Err(engine_failure(
                TOOL,
                status.code(),
                tail.iter().map(String::as_str),
            ));
        }
        Ok(run)
    }
}

#[async_trait]
impl ExtractionBackend for YtDlpBackend {
    fn name(&self) -> &'static str {
        TOOL
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        identity: ClientIdentity,
    ) -> FetchResult<VideoMetadata> {
        let source = SourceUrl::parse(url)?;
        let mut command = self.command(identity);
        command.args(["--dump-single-json", "--skip-download", "--no-progress"]);
        if source.is_playlist() {
            command.args(["--yes-playlist", "--flat-playlist"]);
        } else {
            command.arg("--no-playlist");
        }
        command.arg("--").arg(url);

        let stdout = run_captured(command, TOOL).await?;
        let info: InfoJson = serde_json::from_slice(&stdout).map_err(|err| {
            FetchError::ExtractionFailed(format!("{TOOL} returned unreadable metadata: {err}"))
        })?;
        Ok(metadata_from_info(info))
    }

    async fn fetch_and_store(
        &self,
        request: &MaterializeRequest,
        identity: ClientIdentity,
        progress: Arc<dyn ProgressSink>,
    ) -> FetchResult<PathBuf> {
        tokio::fs::create_dir_all(&request.destination)
            .await
            .map_err(|err| {
                FetchError::ExtractionFailed(format!(
                    "creating {}: {err}",
                    request.destination.display()
                ))
            })?;

        if !request.playlist {
            let run = self
                .run_download(request, identity, &request.destination, progress.as_ref())
                .await?;
            return run
                .files
                .last()
                .filter(|path| path.is_file())
                .cloned()
                .or_else(|| artifacts::newest_media_file(&request.destination))
                .ok_or_else(|| {
                    FetchError::ExtractionFailed(format!("{TOOL} did not produce a file"))
                });
        }

        let scratch = tempfile::Builder::new()
            .prefix(".playlist-")
            .tempdir_in(&request.destination)
            .map_err(|err| FetchError::ExtractionFailed(format!("creating scratch dir: {err}")))?;
        let run = self
            .run_download(request, identity, scratch.path(), progress.as_ref())
            .await?;
        if artifacts::media_files(scratch.path()).is_empty() {
            return Err(FetchError::ExtractionFailed(format!(
                "{TOOL} produced no playlist entries"
            )));
        }
        let archive = request.destination.join(artifacts::archive_name(
            run.playlist_title.as_deref(),
            request.kind,
        ));
        let source_dir = scratch.path().to_path_buf();
        let target = archive.clone();
        let archived =
            tokio::task::spawn_blocking(move || artifacts::zip_directory(&source_dir, &target))
                .await
                .map_err(|err| FetchError::ExtractionFailed(format!("archive task failed: {err}")))?
                .map_err(|err| FetchError::ExtractionFailed(format!("{err:#}")))?;
        info!(archive = %archive.display(), files = archived, "archived playlist");
        Ok(archive)
    }
}

fn parse_output_line(line: &str) -> Option<OutputLine> {
    if let Some(rest) = line.strip_prefix(PROGRESS_MARKER) {
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let [downloaded, total, estimate, status] = fields.as_slice() else {
            return None;
        };
        if *status == "finished" {
            return Some(OutputLine::Progress(ProgressEvent::Finished));
        }
        let bytes_downloaded = parse_bytes(downloaded)?;
        let bytes_total = parse_bytes(total).or_else(|| parse_bytes(estimate));
        return Some(OutputLine::Progress(ProgressEvent::Downloading {
            bytes_downloaded,
            bytes_total,
        }));
    }
    let rest = line.strip_prefix(FILE_MARKER)?.strip_prefix('\t')?;
    let (title, path) = rest.split_once('\t')?;
    let title = title.trim();
    let playlist_title =
        (!title.is_empty() && title != "NA").then(|| title.to_string());
    Some(OutputLine::File {
        playlist_title,
        path: PathBuf::from(path.trim_end()),
    })
}

fn parse_bytes(value: &str) -> Option<u64> {
    value
        .parse::<f64>()
        .ok()
        .filter(|bytes| bytes.is_finite() && *bytes >= 0.0)
        .map(|bytes| bytes as u64)
}

#[derive(Debug, Deserialize)]
struct InfoJson {
    #[serde(rename = "_type")]
    kind: Option<String>,
    id: Option<String>,
    title: Option<String>,
    description: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailJson>,
    uploader: Option<String>,
    channel: Option<String>,
    view_count: Option<u64>,
    playlist_count: Option<usize>,
    #[serde(default)]
    formats: Vec<FormatJson>,
    #[serde(default)]
    entries: Vec<Option<EntryJson>>,
}

#[derive(Debug, Deserialize)]
struct FormatJson {
    format_id: Option<String>,
    ext: Option<String>,
    height: Option<u32>,
    vcodec: Option<String>,
    acodec: Option<String>,
    tbr: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct EntryJson {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<ThumbnailJson>,
}

#[derive(Debug, Deserialize)]
struct ThumbnailJson {
    url: Option<String>,
}

impl FormatJson {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref() != Some("none")
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref() != Some("none")
    }
}

fn pick_thumbnail(direct: Option<String>, list: &[ThumbnailJson]) -> String {
    direct
        .or_else(|| list.iter().rev().find_map(|thumb| thumb.url.clone()))
        .unwrap_or_default()
}

fn seconds(duration: Option<f64>) -> u64 {
    duration
        .filter(|value| value.is_finite() && *value > 0.0)
        .map(|value| value as u64)
        .unwrap_or(0)
}

fn metadata_from_info(info: InfoJson) -> VideoMetadata {
    let is_playlist = info.kind.as_deref() == Some("playlist");
    let thumbnail_url = pick_thumbnail(info.thumbnail, &info.thumbnails);
    let uploader = info.uploader.or(info.channel).unwrap_or_default();
    let mut metadata = VideoMetadata {
        id: info.id.unwrap_or_default(),
        title: info.title.unwrap_or_default(),
        description: info.description.unwrap_or_default(),
        duration_seconds: seconds(info.duration),
        thumbnail_url,
        uploader,
        view_count: info.view_count.unwrap_or(0),
        is_playlist,
        playlist_count: None,
        entries: Vec::new(),
        formats: Vec::new(),
        audio_formats: audio_formats(),
        available_heights: Vec::new(),
    };

    if is_playlist {
        let total = info.entries.iter().flatten().count();
        metadata.playlist_count = Some(info.playlist_count.unwrap_or(total));
        metadata.entries = info
            .entries
            .into_iter()
            .flatten()
            .take(PLAYLIST_PREVIEW_LIMIT)
            .map(|entry| PlaylistEntry {
                id: entry.id.unwrap_or_default(),
                title: entry.title.unwrap_or_default(),
                duration_seconds: seconds(entry.duration),
                thumbnail_url: pick_thumbnail(entry.thumbnail, &entry.thumbnails),
            })
            .collect();
        if metadata.thumbnail_url.is_empty()
            && let Some(first) = metadata.entries.first()
        {
            metadata.thumbnail_url = first.thumbnail_url.clone();
        }
        metadata.formats = playlist_video_formats();
        return metadata;
    }

    let (formats, heights) = video_formats(&info.formats);
    metadata.formats = formats;
    metadata.available_heights = heights;
    metadata
}

/// Builds the video option list and the distinct heights the source offers.
fn video_formats(formats: &[FormatJson]) -> (Vec<FormatOption>, Vec<u32>) {
    let mut heights: Vec<u32> = formats
        .iter()
        .filter(|format| format.has_video())
        .filter_map(|format| format.height)
        .filter(|height| *height > 0)
        .collect();
    heights.sort_unstable_by(|a, b| b.cmp(a));
    heights.dedup();

    let mut combined: Vec<(&FormatJson, &str, u32)> = formats
        .iter()
        .filter(|format| format.has_video() && format.has_audio())
        .filter_map(|format| {
            let id = format.format_id.as_deref()?;
            let height = format.height.filter(|height| *height > 0)?;
            Some((format, id, height))
        })
        .collect();
    if combined.is_empty() {
        return (default_video_formats(), heights);
    }
    combined.sort_by(|(a, _, a_height), (b, _, b_height)| {
        b_height
            .cmp(a_height)
            .then_with(|| b.tbr.unwrap_or(0.0).total_cmp(&a.tbr.unwrap_or(0.0)))
    });

    let options = std::iter::once(best_video_option())
        .chain(combined.into_iter().map(|(format, id, height)| FormatOption {
            format_selector: id.to_string(),
            display_label: format!(
                "{height}p ({}kbps) - {}",
                format.tbr.unwrap_or(0.0).round() as u64,
                format.ext.as_deref().unwrap_or("unknown").to_uppercase()
            ),
            height: Some(height),
        }))
        .collect();
    (options, heights)
}
