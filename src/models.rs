#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Number of playlist entries previewed in metadata responses.
pub const PLAYLIST_PREVIEW_LIMIT: usize = 10;

/// Heights offered when the source lists no combined formats.
const DEFAULT_VIDEO_HEIGHTS: [u32; 3] = [1080, 720, 480];
/// Heights offered for whole-playlist downloads.
const PLAYLIST_VIDEO_HEIGHTS: [u32; 4] = [1080, 720, 480, 360];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    #[default]
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatOption {
    pub format_selector: String,
    pub display_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

impl FormatOption {
    pub fn new(selector: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            format_selector: selector.into(),
            display_label: label.into(),
            height: None,
        }
    }

    fn capped_at(height: u32) -> Self {
        Self {
            format_selector: height_selector(height),
            display_label: format!("{height}p"),
            height: Some(height),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub duration_seconds: u64,
    pub thumbnail_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub duration_seconds: u64,
    pub thumbnail_url: String,
    pub uploader: String,
    pub view_count: u64,
    pub is_playlist: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub playlist_count: Option<usize>,
    #[serde(default)]
    pub entries: Vec<PlaylistEntry>,
    pub formats: Vec<FormatOption>,
    pub audio_formats: Vec<FormatOption>,
    #[serde(default)]
    pub available_heights: Vec<u32>,
}

/// Outcome of a finished download job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResult {
    pub file_path: PathBuf,
    pub quality_downgraded: bool,
    pub requested_quality: String,
    pub actual_quality: String,
    pub quality_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Downloading {
        bytes_downloaded: u64,
        bytes_total: Option<u64>,
    },
    Finished,
}

impl ProgressEvent {
    /// Percentage complete, 0 when the total size is unknown.
    pub fn percent(&self) -> f64 {
        match *self {
            ProgressEvent::Downloading {
                bytes_downloaded,
                bytes_total: Some(total),
            } if total > 0 => (bytes_downloaded as f64 / total as f64 * 100.0).clamp(0.0, 100.0),
            ProgressEvent::Downloading { .. } => 0.0,
            ProgressEvent::Finished => 100.0,
        }
    }
}

/// Receives progress events from a running engine.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Selector that caps both streams at `height` and falls back to the best
/// combined format under the same cap.
pub fn height_selector(height: u32) -> String {
    format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
}

pub fn best_video_option() -> FormatOption {
    FormatOption::new("best", "Best Quality")
}

pub fn default_video_formats() -> Vec<FormatOption> {
    std::iter::once(best_video_option())
        .chain(DEFAULT_VIDEO_HEIGHTS.into_iter().map(FormatOption::capped_at))
        .collect()
}

pub fn playlist_video_formats() -> Vec<FormatOption> {
    std::iter::once(best_video_option())
        .chain(PLAYLIST_VIDEO_HEIGHTS.into_iter().map(FormatOption::capped_at))
        .collect()
}

pub fn audio_formats() -> Vec<FormatOption> {
    vec![
        FormatOption::new("bestaudio", "Best Audio"),
        FormatOption::new("bestaudio[ext=m4a]/bestaudio", "M4A (High Quality)"),
        FormatOption::new("bestaudio[ext=mp3]/bestaudio", "MP3 (High Quality)"),
        FormatOption::new("bestaudio[abr>=128]/bestaudio", "MP3 (128kbps)"),
        FormatOption::new("bestaudio[abr>=96]/bestaudio", "MP3 (96kbps)"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_handles_unknown_total() {
        let event = ProgressEvent::Downloading {
            bytes_downloaded: 512,
            bytes_total: None,
        };
        assert_eq!(event.percent(), 0.0);
        let event = ProgressEvent::Downloading {
            bytes_downloaded: 512,
            bytes_total: Some(0),
        };
        assert_eq!(event.percent(), 0.0);
    }

    #[test]
    fn percent_is_clamped() {
        let half = ProgressEvent::Downloading {
            bytes_downloaded: 50,
            bytes_total: Some(200),
        };
        assert_eq!(half.percent(), 25.0);
        let over = ProgressEvent::Downloading {
            bytes_downloaded: 300,
            bytes_total: Some(200),
        };
        assert_eq!(over.percent(), 100.0);
    }

    #[test]
    fn playlist_formats_cover_named_heights() {
        let formats = playlist_video_formats();
        let labels: Vec<_> = formats.iter().map(|f| f.display_label.as_str()).collect();
        assert_eq!(labels, ["Best Quality", "1080p", "720p", "480p", "360p"]);
        assert_eq!(
            formats[2].format_selector,
            "bestvideo[height<=720]+bestaudio/best[height<=720]"
        );
    }

    #[test]
    fn metadata_serializes_camel_case() {
        let metadata = VideoMetadata {
            id: "dQw4w9WgXcQ".into(),
            title: "Clip".into(),
            description: String::new(),
            duration_seconds: 212,
            thumbnail_url: "https://i.ytimg.com/x.jpg".into(),
            uploader: "Someone".into(),
            view_count: 7,
            is_playlist: false,
            playlist_count: None,
            entries: Vec::new(),
            formats: default_video_formats(),
            audio_formats: audio_formats(),
            available_heights: vec![1080],
        };
        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["durationSeconds"], 212);
        assert_eq!(value["isPlaylist"], false);
        assert!(value.get("playlistCount").is_none());
        assert_eq!(value["formats"][0]["formatSelector"], "best");
        assert_eq!(value["audioFormats"].as_array().unwrap().len(), 5);
    }
}
