//! Scripted engine for exercising the orchestrator and service without
//! external tools.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::VecDeque, path::PathBuf, sync::Arc};

use super::{ClientIdentity, ExtractionBackend, MaterializeRequest};
use crate::{
    error::{FetchError, FetchResult},
    models::{
        PlaylistEntry, ProgressEvent, ProgressSink, VideoMetadata, audio_formats,
        default_video_formats, playlist_video_formats,
    },
};

/// What the next call should do.
#[derive(Debug, Clone)]
pub enum Step {
    Succeed,
    Fail(FetchError),
    /// Report success without writing the file.
    Phantom,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Metadata(String, ClientIdentity),
    Store(MaterializeRequest, ClientIdentity),
}

pub struct ScriptedBackend {
    name: &'static str,
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<Call>>,
    heights: Vec<u32>,
}

impl ScriptedBackend {
    /// Follows `steps` in order, then succeeds for every further call.
    pub fn new(name: &'static str, steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            name,
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
            heights: vec![1080, 720, 360],
        })
    }

    pub fn failing(name: &'static str, message: &str) -> Arc<Self> {
        Self::new(
            name,
            std::iter::repeat_n(
                Step::Fail(FetchError::ExtractionFailed(message.to_string())),
                64,
            ),
        )
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn identities(&self) -> Vec<ClientIdentity> {
        self.calls()
            .into_iter()
            .map(|call| match call {
                Call::Metadata(_, identity) | Call::Store(_, identity) => identity,
            })
            .collect()
    }

    pub fn store_requests(&self) -> Vec<MaterializeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Store(request, _) => Some(request),
                Call::Metadata(..) => None,
            })
            .collect()
    }

    fn next_step(&self) -> Step {
        self.steps.lock().pop_front().unwrap_or(Step::Succeed)
    }

    pub fn sample_metadata(&self, url: &str) -> VideoMetadata {
        let is_playlist = url.contains("list=");
        VideoMetadata {
            id: "dQw4w9WgXcQ".into(),
            title: "Alpha Title".into(),
            description: "Sample description".into(),
            duration_seconds: 212,
            thumbnail_url: "https://i.ytimg.com/vi/dQw4w9WgXcQ/hq.jpg".into(),
            uploader: "Channel".into(),
            view_count: 10,
            is_playlist,
            playlist_count: is_playlist.then_some(2),
            entries: if is_playlist {
                vec![PlaylistEntry {
                    id: "dQw4w9WgXcQ".into(),
                    title: "One".into(),
                    duration_seconds: 61,
                    thumbnail_url: String::new(),
                }]
            } else {
                Vec::new()
            },
            formats: if is_playlist {
                playlist_video_formats()
            } else {
                default_video_formats()
            },
            audio_formats: audio_formats(),
            available_heights: if is_playlist {
                Vec::new()
            } else {
                self.heights.clone()
            },
        }
    }
}

#[async_trait]
impl ExtractionBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch_metadata(
        &self,
        url: &str,
        identity: ClientIdentity,
    ) -> FetchResult<VideoMetadata> {
        self.calls
            .lock()
            .push(Call::Metadata(url.to_string(), identity));
        match self.next_step() {
            Step::Fail(err) => Err(err),
            Step::Succeed | Step::Phantom => Ok(self.sample_metadata(url)),
        }
    }

    async fn fetch_and_store(
        &self,
        request: &MaterializeRequest,
        identity: ClientIdentity,
        progress: Arc<dyn ProgressSink>,
    ) -> FetchResult<PathBuf> {
        self.calls
            .lock()
            .push(Call::Store(request.clone(), identity));
        let path = request
            .destination
            .join(format!("{}-{}.mp4", self.name, request.kind.as_str()));
        match self.next_step() {
            Step::Fail(err) => Err(err),
            Step::Phantom => Ok(path),
            Step::Succeed => {
                progress.report(ProgressEvent::Downloading {
                    bytes_downloaded: 5,
                    bytes_total: Some(10),
                });
                tokio::fs::create_dir_all(&request.destination)
                    .await
                    .map_err(|err| FetchError::ExtractionFailed(err.to_string()))?;
                tokio::fs::write(&path, b"media")
                    .await
                    .map_err(|err| FetchError::ExtractionFailed(err.to_string()))?;
                progress.report(ProgressEvent::Finished);
                Ok(path)
            }
        }
    }
}
