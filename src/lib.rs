#![forbid(unsafe_code)]

//! Download orchestration for the tubefetch web front-end.
//!
//! Requests flow through [`service::DownloadService`], which creates a job in
//! the [`jobs`] actor, resolves the requested quality, and drives the
//! [`orchestrator`] across the `yt-dlp` and `lux` [`backend`]s. Metadata
//! lookups are cached in [`cache`] and every outgoing request passes through
//! the shared [`rate_limit::RateLimiter`].

pub mod artifacts;
pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod orchestrator;
pub mod quality;
pub mod rate_limit;
pub mod service;
pub mod source;
pub mod stats;
