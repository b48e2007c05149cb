#![forbid(unsafe_code)]

//! Recognition and normalization of the video URLs the service accepts.

use url::Url;

use crate::error::{FetchError, FetchResult};

const WATCH_HOSTS: &[&str] = &["youtube.com", "www.youtube.com", "m.youtube.com"];
const SHORT_HOST: &str = "youtu.be";
const CANONICAL_BASE: &str = "https://www.youtube.com";

/// A validated source URL reduced to the ids that identify the media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    video_id: Option<String>,
    list_id: Option<String>,
}

impl SourceUrl {
    pub fn parse(raw: &str) -> FetchResult<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FetchError::InvalidInput("URL is required".into()));
        }
        let parsed = Url::parse(trimmed)
            .or_else(|_| Url::parse(&format!("https://{trimmed}")))
            .map_err(|err| FetchError::InvalidInput(format!("{trimmed}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(FetchError::InvalidInput(format!(
                "{trimmed}: unsupported scheme {}",
                parsed.scheme()
            )));
        }
        let host = parsed
            .host_str()
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let list_id = query_value(&parsed, "list");
        let video_id = if host == SHORT_HOST {
            first_segment(&parsed)
        } else if WATCH_HOSTS.contains(&host.as_str()) {
            match parsed.path() {
                "/watch" => query_value(&parsed, "v"),
                path => path
                    .strip_prefix("/shorts/")
                    .map(|rest| rest.trim_end_matches('/').to_string()),
            }
        } else {
            return Err(FetchError::InvalidInput(format!(
                "{trimmed}: unsupported host"
            )));
        };

        let video_id = video_id.filter(|id| is_valid_id(id));
        let list_id = list_id.filter(|id| is_valid_id(id));
        if video_id.is_none() && list_id.is_none() {
            return Err(FetchError::InvalidInput(format!(
                "{trimmed}: no video or playlist id"
            )));
        }
        Ok(Self { video_id, list_id })
    }

    pub fn video_id(&self) -> Option<&str> {
        self.video_id.as_deref()
    }

    pub fn list_id(&self) -> Option<&str> {
        self.list_id.as_deref()
    }

    pub fn is_playlist(&self) -> bool {
        self.list_id.is_some()
    }

    /// Canonical form used as the cache key.
    pub fn canonical(&self) -> String {
        match (&self.video_id, &self.list_id) {
            (Some(video), Some(list)) => format!("{CANONICAL_BASE}/watch?v={video}&list={list}"),
            (Some(video), None) => format!("{CANONICAL_BASE}/watch?v={video}"),
            (None, Some(list)) => format!("{CANONICAL_BASE}/playlist?list={list}"),
            (None, None) => CANONICAL_BASE.to_string(),
        }
    }

    /// URL handed to the engines. Single-video requests drop the list
    /// parameter so the engine does not expand the playlist.
    pub fn target(&self, playlist: bool) -> String {
        match (&self.video_id, playlist) {
            (Some(video), false) => format!("{CANONICAL_BASE}/watch?v={video}"),
            _ => self.canonical(),
        }
    }
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.into_owned())
}

fn first_segment(url: &Url) -> Option<String> {
    url.path_segments()
        .and_then(|mut segments| segments.next())
        .map(str::to_string)
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
