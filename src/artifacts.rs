#![forbid(unsafe_code)]

//! Filesystem helpers for produced media: locating engine output, bundling
//! playlists into a zip archive, and discarding job directories.

use anyhow::{Context, Result};
use regex::Regex;
use std::{
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::SystemTime,
};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

use crate::models::MediaKind;

static UNSAFE_TITLE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\w\-_\. ]").expect("valid title regex"));

/// Suffixes of engine scratch files that never count as finished media.
const PARTIAL_SUFFIXES: &[&str] = &[".part", ".ytdl", ".download", ".tmp", ".temp", ".json"];

/// Replaces every character outside word chars, dashes, dots, and spaces.
pub fn sanitize_title(title: &str) -> String {
    let cleaned = UNSAFE_TITLE_CHARS.replace_all(title.trim(), "_");
    if cleaned.trim().is_empty() {
        "playlist".to_string()
    } else {
        cleaned.into_owned()
    }
}

/// File name of the archive for a downloaded playlist.
pub fn archive_name(title: Option<&str>, kind: MediaKind) -> String {
    let base = sanitize_title(title.unwrap_or_default());
    match kind {
        MediaKind::Video => format!("{base}.zip"),
        MediaKind::Audio => format!("{base}_audio.zip"),
    }
}

/// Zips every regular file below `source` into `target`, flattened to base
/// names. Returns the number of archived files.
pub fn zip_directory(source: &Path, target: &Path) -> Result<usize> {
    let mut files: Vec<PathBuf> = WalkDir::new(source)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_finished_media(path) && path != target)
        .collect();
    files.sort();

    let output =
        File::create(target).with_context(|| format!("creating archive {}", target.display()))?;
    let mut writer = ZipWriter::new(output);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut archived = 0;
    for path in &files {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            warn!(path = %path.display(), "skipping file with non UTF-8 name");
            continue;
        };
        writer
            .start_file(name, options)
            .with_context(|| format!("adding {name} to {}", target.display()))?;
        let mut input =
            File::open(path).with_context(|| format!("opening {}", path.display()))?;
        io::copy(&mut input, &mut writer)
            .with_context(|| format!("compressing {}", path.display()))?;
        archived += 1;
    }
    writer
        .finish()
        .with_context(|| format!("finalizing {}", target.display()))?;
    debug!(archive = %target.display(), files = archived, "created playlist archive");
    Ok(archived)
}

/// Most recently modified finished media file directly inside `dir`.
pub fn newest_media_file(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|kind| kind.is_file()).unwrap_or(false))
        .map(|entry| entry.path())
        .filter(|path| is_finished_media(path))
        .max_by_key(|path| {
            fs::metadata(path)
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH)
        })
}

/// Every finished media file directly inside `dir`, sorted by name.
pub fn media_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_finished_media(path))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

/// Total size in bytes of the files below `dir`.
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Deletes a produced file and its job directory. Missing paths are fine;
/// other failures are logged.
pub async fn discard(file: Option<&Path>, work_dir: Option<&Path>) {
    if let Some(file) = file {
        match tokio::fs::remove_file(file).await {
            Ok(()) => debug!(path = %file.display(), "removed downloaded file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %file.display(), error = %err, "failed to remove downloaded file"),
        }
    }
    if let Some(dir) = work_dir {
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => debug!(path = %dir.display(), "removed job directory"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %dir.display(), error = %err, "failed to remove job directory"),
        }
    }
}

fn is_finished_media(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    !name.starts_with('.') && !PARTIAL_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
}
