#![forbid(unsafe_code)]

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, LazyLock},
    time::Duration,
};
use tokio::{process::Command, time::interval};
use tracing::{debug, info, warn};

use super::{
    ClientIdentity, ExtractionBackend, MaterializeRequest, engine_failure, run_captured,
    spawn_stderr_tail,
};
use crate::{
    artifacts,
    error::{FetchError, FetchResult},
    models::{
        MediaKind, PLAYLIST_PREVIEW_LIMIT, PlaylistEntry, ProgressEvent, ProgressSink,
        VideoMetadata, audio_formats, playlist_video_formats,
    },
    quality::{RequestedQuality, parse_requested},
    source::SourceUrl,
};

const TOOL: &str = "lux";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

static STREAM_HEIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{3,4})p").expect("valid stream height regex"));

/// Fallback engine driving the `lux` CLI.
///
/// `lux` has no per-request header override, so the client identity is only
/// recorded in the logs.
#[derive(Debug, Clone)]
pub struct LuxBackend {
    binary: PathBuf,
    ffmpeg: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LuxOutput {
    Many(Vec<LuxInfo>),
    One(LuxInfo),
}

impl LuxOutput {
    fn into_vec(self) -> Vec<LuxInfo> {
        match self {
            LuxOutput::Many(items) => items,
            LuxOutput::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Deserialize)]
struct LuxInfo {
    url: Option<String>,
    title: Option<String>,
    #[serde(default)]
    streams: BTreeMap<String, LuxStream>,
    err: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LuxStream {
    id: Option<String>,
    #[serde(default)]
    quality: String,
    #[serde(default)]
    size: u64,
    #[serde(rename = "NeedMux", default)]
    need_mux: bool,
}

impl LuxStream {
    fn height(&self) -> Option<u32> {
        STREAM_HEIGHT
            .captures(&self.quality)
            .and_then(|caps| caps[1].parse().ok())
    }

    fn is_audio_only(&self) -> bool {
        let quality = self.quality.to_ascii_lowercase();
        quality.contains("audio") && !quality.contains("video") && self.height().is_none()
    }

    fn is_progressive(&self) -> bool {
        self.height().is_some() && !self.need_mux
    }
}

/// Picks one `lux` stream for a request: a progressive stream at the named
/// resolution, else the highest resolution. Audio takes the first audio-only
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFilter {
    kind: MediaKind,
    resolution: Option<u32>,
}

impl StreamFilter {
    pub fn for_request(request: &MaterializeRequest) -> Self {
        let resolution = match parse_requested(&request.selector, &[]) {
            RequestedQuality::Height(height) => Some(height),
            RequestedQuality::Best => None,
        };
        Self {
            kind: request.kind,
            resolution,
        }
    }

    fn select<'a>(&self, streams: &'a BTreeMap<String, LuxStream>) -> Option<(&'a str, &'a LuxStream)> {
        let mut candidates = streams.iter().map(|(key, stream)| {
            let id = stream.id.as_deref().unwrap_or(key.as_str());
            (id, stream)
        });
        if self.kind == MediaKind::Audio {
            return candidates.find(|(_, stream)| stream.is_audio_only());
        }

        let video: Vec<(&str, &LuxStream)> = candidates
            .filter(|(_, stream)| stream.height().is_some())
            .collect();
        let progressive: Vec<(&str, &LuxStream)> = video
            .iter()
            .copied()
            .filter(|(_, stream)| stream.is_progressive())
            .collect();
        let pool = if progressive.is_empty() {
            &video
        } else {
            &progressive
        };
        if let Some(height) = self.resolution
            && let Some(found) = pool
                .iter()
                .copied()
                .find(|(_, stream)| stream.height() == Some(height))
        {
            return Some(found);
        }
        pool.iter()
            .copied()
            .max_by_key(|(_, stream)| (stream.height().unwrap_or(0), stream.size))
    }
}

impl LuxBackend {
    pub fn new(binary: impl Into<PathBuf>, ffmpeg: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            ffmpeg,
        }
    }

    async fn inspect(&self, url: &str, playlist: bool) -> FetchResult<Vec<LuxInfo>> {
        let mut command = Command::new(&self.binary);
        command.args(["-i", "-j"]);
        if playlist {
            command.arg("-p");
        }
        command.arg(url);
        let stdout = run_captured(command, TOOL).await?;
        let items = serde_json::from_slice::<LuxOutput>(&stdout)
            .map_err(|err| {
                FetchError::ExtractionFailed(format!("{TOOL} returned unreadable info: {err}"))
            })?
            .into_vec();
        if let Some(message) = items.iter().find_map(|item| item.err.as_deref()) {
            if items.len() == 1 {
                return Err(FetchError::from_engine_message(format!("{TOOL}: {message}")));
            }
            warn!(url, error = message, "lux could not inspect some playlist entries");
        }
        Ok(items)
    }

    /// Downloads one stream into `dir`, reporting progress from the growing
    /// directory size.
    async fn download_stream(
        &self,
        url: &str,
        stream_id: &str,
        expected_size: u64,
        dir: &Path,
        progress: &dyn ProgressSink,
    ) -> FetchResult<PathBuf> {
        let baseline = artifacts::directory_size(dir);
        let mut command = Command::new(&self.binary);
        command
            .arg("-f")
            .arg(stream_id)
            .arg("-o")
            .arg(dir)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(url, stream = stream_id, "starting lux download");
        let mut child = command
            .spawn()
            .map_err(|err| FetchError::ExtractionFailed(format!("failed to launch {TOOL}: {err}")))?;
        let stderr = child.stderr.take().map(spawn_stderr_tail);

        let bytes_total = (expected_size > 0).then_some(expected_size);
        let mut ticker = interval(POLL_INTERVAL);
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = ticker.tick() => {
                    let bytes_downloaded = artifacts::directory_size(dir).saturating_sub(baseline);
                    progress.report(ProgressEvent::Downloading { bytes_downloaded, bytes_total });
                }
            }
        }
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
        progress.report(ProgressEvent::Finished);
        artifacts::newest_media_file(dir)
            .ok_or_else(|| FetchError::ExtractionFailed(format!("{TOOL} did not produce a file")))
    }

    /// Converts audio to mp3 when ffmpeg is around. A failed conversion keeps
    /// the original file.
    async fn finish_audio(&self, path: PathBuf) -> PathBuf {
        let Some(ffmpeg) = &self.ffmpeg else {
            return path;
        };
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"))
        {
            return path;
        }
        let output = path.with_extension("mp3");
        let mut command = Command::new(ffmpeg);
        command
            .args(["-y", "-loglevel", "error", "-i"])
            .arg(&path)
            .args(["-vn", "-ar", "44100", "-ac", "2", "-b:a", "192k"])
            .arg(&output);
        match run_captured(command, "ffmpeg").await {
            Ok(_) => {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %err, "failed to remove unconverted audio");
                }
                output
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "mp3 conversion failed, keeping original audio");
                path
            }
        }
    }

    async fn store_single(
        &self,
        request: &MaterializeRequest,
        progress: &dyn ProgressSink,
    ) -> FetchResult<PathBuf> {
        let info = self
            .inspect(&request.url, false)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::ExtractionFailed(format!("{TOOL} returned no media")))?;
        let (stream_id, stream) = StreamFilter::for_request(request)
            .select(&info.streams)
            .ok_or_else(|| {
                FetchError::ExtractionFailed(format!(
                    "{TOOL} offers no {} stream for {}",
                    request.kind.as_str(),
                    request.url
                ))
            })?;
        let path = self
            .download_stream(
                &request.url,
                stream_id,
                stream.size,
                &request.destination,
                progress,
            )
            .await?;
        Ok(match request.kind {
            MediaKind::Audio => self.finish_audio(path).await,
            MediaKind::Video => path,
        })
    }

    async fn store_playlist(
        &self,
        request: &MaterializeRequest,
        progress: &dyn ProgressSink,
    ) -> FetchResult<PathBuf> {
        let items = self.inspect(&request.url, true).await?;
        let scratch = tempfile::Builder::new()
            .prefix(".playlist-")
            .tempdir_in(&request.destination)
            .map_err(|err| FetchError::ExtractionFailed(format!("creating scratch dir: {err}")))?;
        let filter = StreamFilter::for_request(request);

        let mut stored = 0usize;
        for (index, item) in items.iter().enumerate() {
            let Some(entry_url) = item.url.as_deref() else {
                continue;
            };
            let Some((stream_id, stream)) = filter.select(&item.streams) else {
                warn!(url = entry_url, "skipping playlist entry without a matching stream");
                continue;
            };
            match self
                .download_stream(entry_url, stream_id, stream.size, scratch.path(), progress)
                .await
            {
                Ok(path) => {
                    if request.kind == MediaKind::Audio {
                        self.finish_audio(path).await;
                    }
                    stored += 1;
                }
                Err(err) => {
                    warn!(url = entry_url, entry = index + 1, error = %err, "skipping failed playlist entry");
                }
            }
        }
        if stored == 0 {
            return Err(FetchError::ExtractionFailed(format!(
                "{TOOL} downloaded no playlist entries"
            )));
        }

        let title = SourceUrl::parse(&request.url)
            .ok()
            .and_then(|source| source.list_id().map(str::to_string));
        let archive = request
            .destination
            .join(artifacts::archive_name(title.as_deref(), request.kind));
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

#[async_trait]
impl ExtractionBackend for LuxBackend {
    fn name(&self) -> &'static str {
        TOOL
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        identity: ClientIdentity,
    ) -> FetchResult<VideoMetadata> {
        let source = SourceUrl::parse(url)?;
        debug!(url, identity = identity.as_str(), "inspecting with lux");
        let items = self.inspect(url, source.is_playlist()).await?;
        if source.is_playlist() {
            return Ok(playlist_metadata(&source, items));
        }
        let info = items
            .into_iter()
            .next()
            .ok_or_else(|| FetchError::ExtractionFailed(format!("{TOOL} returned no media")))?;
        Ok(single_metadata(&source, info))
    }

    async fn fetch_and_store(
        &self,
        request: &MaterializeRequest,
        identity: ClientIdentity,
        progress: Arc<dyn ProgressSink>,
    ) -> FetchResult<PathBuf> {
        debug!(url = %request.url, identity = identity.as_str(), "materializing with lux");
        tokio::fs::create_dir_all(&request.destination)
            .await
            .map_err(|err| {
                FetchError::ExtractionFailed(format!(
                    "creating {}: {err}",
                    request.destination.display()
                ))
            })?;
        if request.playlist {
            self.store_playlist(request, progress.as_ref()).await
        } else {
            self.store_single(request, progress.as_ref()).await
        }
    }
}

fn single_metadata(source: &SourceUrl, info: LuxInfo) -> VideoMetadata {
    let mut heights: Vec<u32> = info.streams.values().filter_map(LuxStream::height).collect();
    heights.sort_unstable_by(|a, b| b.cmp(a));
    heights.dedup();
    VideoMetadata {
        id: source.video_id().unwrap_or_default().to_string(),
        title: info.title.unwrap_or_default(),
        description: String::new(),
        duration_seconds: 0,
        thumbnail_url: String::new(),
        uploader: String::new(),
        view_count: 0,
        is_playlist: false,
        playlist_count: None,
        entries: Vec::new(),
        formats: playlist_video_formats(),
        audio_formats: audio_formats(),
        available_heights: heights,
    }
}

fn playlist_metadata(source: &SourceUrl, items: Vec<LuxInfo>) -> VideoMetadata {
    let list_id = source.list_id().unwrap_or_default().to_string();
    let count = items.len();
    let entries = items
        .into_iter()
        .take(PLAYLIST_PREVIEW_LIMIT)
        .map(|item| PlaylistEntry {
            id: item
                .url
                .as_deref()
                .and_then(|url| SourceUrl::parse(url).ok())
                .and_then(|entry| entry.video_id().map(str::to_string))
                .unwrap_or_default(),
            title: item.title.unwrap_or_default(),
            duration_seconds: 0,
            thumbnail_url: String::new(),
        })
        .collect();
    VideoMetadata {
        title: format!("Playlist {list_id}"),
        id: list_id,
        description: String::new(),
        duration_seconds: 0,
        thumbnail_url: String::new(),
        uploader: String::new(),
        view_count: 0,
        is_playlist: true,
        playlist_count: Some(count),
        entries,
        formats: playlist_video_formats(),
        audio_formats: audio_formats(),
        available_heights: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs;
    use tempfile::tempdir;

    const SINGLE_JSON: &str = r#"[{
        "url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        "site": "YouTube youtube.com",
        "title": "Alpha Title",
        "type": "video",
        "streams": {
            "137": {"id": "137", "quality": "1080p video/mp4", "size": 4000, "NeedMux": true},
            "18": {"id": "18", "quality": "360p video/mp4; codecs=avc1, mp4a", "size": 900},
            "22": {"id": "22", "quality": "720p video/mp4; codecs=avc1, mp4a", "size": 2000},
            "140": {"id": "140", "quality": "audio/mp4; codecs=mp4a.40.2", "size": 300},
            "251": {"id": "251", "quality": "audio/webm; codecs=opus", "size": 350}
        }
    }]"#;

    fn streams() -> BTreeMap<String, LuxStream> {
        serde_json::from_str::<LuxOutput>(SINGLE_JSON)
            .unwrap()
            .into_vec()
            .remove(0)
            .streams
    }

    fn filter(kind: MediaKind, selector: &str) -> StreamFilter {
        StreamFilter::for_request(&MaterializeRequest {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            kind,
            selector: selector.into(),
            playlist: false,
            destination: PathBuf::from("/tmp"),
        })
    }

    #[test]
    fn selects_progressive_stream_at_named_resolution() {
        let streams = streams();
        let (id, _) = filter(MediaKind::Video, "360p").select(&streams).unwrap();
        assert_eq!(id, "18");
    }

    #[test]
    fn falls_back_to_highest_progressive_resolution() {
        let streams = streams();
        let (id, _) = filter(MediaKind::Video, "1080p").select(&streams).unwrap();
        assert_eq!(id, "22");
        let (id, _) = filter(MediaKind::Video, "best").select(&streams).unwrap();
        assert_eq!(id, "22");
    }

    #[test]
    fn audio_takes_first_audio_only_stream() {
        let streams = streams();
        let (id, stream) = filter(MediaKind::Audio, "bestaudio").select(&streams).unwrap();
        assert_eq!(id, "140");
        assert_eq!(stream.size, 300);
    }

    #[test]
    fn single_metadata_collects_heights() {
        let source = SourceUrl::parse("https://youtu.be/dQw4w9WgXcQ").unwrap();
        let info = serde_json::from_str::<LuxOutput>(SINGLE_JSON)
            .unwrap()
            .into_vec()
            .remove(0);
        let metadata = single_metadata(&source, info);
        assert_eq!(metadata.id, "dQw4w9WgXcQ");
        assert_eq!(metadata.title, "Alpha Title");
        assert!(!metadata.is_playlist);
        assert_eq!(metadata.available_heights, vec![1080, 720, 360]);
        assert!(!metadata.formats.is_empty());
        assert!(!metadata.audio_formats.is_empty());
    }

    #[cfg(unix)]
    fn install_lux_stub(dir: &Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("lux");
        let script = format!(
            r#"#!/usr/bin/env bash
set -eu
args=("$@")
output=""
stream=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    -o)
      shift
      output="$1"
      ;;
    -f)
      shift
      stream="$1"
      ;;
  esac
  shift
done

if printf '%s\n' "${{args[@]}}" | grep -qx -- '-p'; then
  cat <<'JSON'
[{{"url": "https://www.youtube.com/watch?v=aaaaaaaaaa1", "title": "One", "streams": {{"18": {{"quality": "360p video/mp4; codecs=avc1, mp4a", "size": 4}}}}}},
 {{"url": "https://www.youtube.com/watch?v=bbbbbbbbbb2", "title": "Two", "streams": {{}}}},
 {{"url": "https://www.youtube.com/watch?v=cccccccccc3", "title": "Three", "streams": {{"18": {{"quality": "360p video/mp4; codecs=avc1, mp4a", "size": 4}}}}}}]
JSON
  exit 0
fi

if printf '%s\n' "${{args[@]}}" | grep -qx -- '-j'; then
  cat <<'JSON'
{single}
JSON
  exit 0
fi

name="Alpha Title"
for arg in "${{args[@]}}"; do
  case "$arg" in
    *cccccccccc3*) name="Three" ;;
    *aaaaaaaaaa1*) name="One" ;;
  esac
done
printf 'media-%s' "$stream" > "$output/$name.mp4"
"#,
            single = SINGLE_JSON
        );
        fs::write(&script_path, script).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn downloads_selected_stream() {
        let dir = tempdir().unwrap();
        let backend = LuxBackend::new(install_lux_stub(dir.path()), None);
        let destination = dir.path().join("job-1");
        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = events.clone();
        let sink: Arc<dyn ProgressSink> =
            Arc::new(move |event: ProgressEvent| recorded.lock().push(event));

        let request = MaterializeRequest {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            kind: MediaKind::Video,
            selector: "720p".into(),
            playlist: false,
            destination: destination.clone(),
        };
        let path = backend
            .fetch_and_store(&request, ClientIdentity::Default, sink)
            .await
            .unwrap();
        assert_eq!(path, destination.join("Alpha Title.mp4"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "media-22");
        assert_eq!(events.lock().last(), Some(&ProgressEvent::Finished));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn playlist_skips_entries_without_streams() {
        let dir = tempdir().unwrap();
        let backend = LuxBackend::new(install_lux_stub(dir.path()), None);
        let destination = dir.path().join("job-2");
        let sink: Arc<dyn ProgressSink> = Arc::new(|_: ProgressEvent| {});

        let request = MaterializeRequest {
            url: "https://www.youtube.com/playlist?list=PL123abc".into(),
            kind: MediaKind::Video,
            selector: "360p".into(),
            playlist: true,
            destination: destination.clone(),
        };
        let path = backend
            .fetch_and_store(&request, ClientIdentity::Default, sink)
            .await
            .unwrap();
        assert_eq!(path, destination.join("PL123abc.zip"));
        let archive = zip::ZipArchive::new(fs::File::open(&path).unwrap()).unwrap();
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, ["One.mp4", "Three.mp4"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn playlist_metadata_lists_entries() {
        let dir = tempdir().unwrap();
        let backend = LuxBackend::new(install_lux_stub(dir.path()), None);
        let metadata = backend
            .fetch_metadata(
                "https://www.youtube.com/playlist?list=PL123abc",
                ClientIdentity::Default,
            )
            .await
            .unwrap();
        assert!(metadata.is_playlist);
        assert_eq!(metadata.playlist_count, Some(3));
        assert_eq!(metadata.entries[0].id, "aaaaaaaaaa1");
        assert_eq!(metadata.entries[2].title, "Three");
    }
}
