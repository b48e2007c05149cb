#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use crate::{cache, jobs, orchestrator, rate_limit};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_LUX_BIN: &str = "lux";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub www_root: Option<PathBuf>,
    /// Parent of job directories; a process temp dir is used when unset.
    pub download_root: Option<PathBuf>,
    /// Statistics are disabled when unset.
    pub stats_db: Option<PathBuf>,
    pub ytdlp_bin: PathBuf,
    pub lux_bin: PathBuf,
    pub ffmpeg_bin: PathBuf,
    pub rate_limit_delay: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub cache_capacity: usize,
    pub cache_expiry: Duration,
    pub cache_sweep_interval: Duration,
    pub cleanup_delay: Duration,
    pub job_ttl: Duration,
    pub max_concurrent_downloads: usize,
}

pub fn load_settings() -> Result<Settings> {
    resolve_settings(RuntimeOverrides::default())
}

/// Values given on the command line; they win over every other source.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub www_root: Option<PathBuf>,
    pub download_root: Option<PathBuf>,
    pub stats_db: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: RuntimeOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    build_settings_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Settings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let path = |key: &str| lookup(key).map(PathBuf::from);
    let seconds = |key: &str, default: Duration| {
        lookup(key)
            .and_then(|value| parse_number::<u64>(&value))
            .map(Duration::from_secs)
            .unwrap_or(default)
    };

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBEFETCH_HOST"))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup("TUBEFETCH_PORT").and_then(|value| parse_number(&value)))
        .unwrap_or(DEFAULT_PORT);

    Settings {
        host,
        port,
        www_root: overrides.www_root.or_else(|| path("WWW_ROOT")),
        download_root: overrides.download_root.or_else(|| path("DOWNLOAD_ROOT")),
        stats_db: overrides.stats_db.or_else(|| path("STATS_DB")),
        ytdlp_bin: path("YTDLP_BIN").unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN)),
        lux_bin: path("LUX_BIN").unwrap_or_else(|| PathBuf::from(DEFAULT_LUX_BIN)),
        ffmpeg_bin: path("FFMPEG_BIN").unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN)),
        rate_limit_delay: seconds("RATE_LIMIT_DELAY_SECS", rate_limit::DEFAULT_DELAY),
        retry_count: lookup("RETRY_COUNT")
            .and_then(|value| parse_number(&value))
            .filter(|count| *count > 0)
            .unwrap_or(orchestrator::DEFAULT_ATTEMPTS),
        retry_delay: seconds("RETRY_DELAY_SECS", orchestrator::DEFAULT_RETRY_DELAY),
        cache_capacity: lookup("CACHE_CAPACITY")
            .and_then(|value| parse_number(&value))
            .filter(|capacity| *capacity > 0)
            .unwrap_or(cache::DEFAULT_CAPACITY),
        cache_expiry: seconds("CACHE_EXPIRY_SECS", cache::DEFAULT_EXPIRY),
        cache_sweep_interval: seconds("CACHE_SWEEP_SECS", cache::DEFAULT_SWEEP_INTERVAL)
            .max(Duration::from_secs(1)),
        cleanup_delay: seconds("CLEANUP_DELAY_SECS", jobs::DEFAULT_CLEANUP_DELAY),
        job_ttl: seconds("JOB_TTL_SECS", jobs::DEFAULT_JOB_TTL),
        max_concurrent_downloads: lookup("MAX_CONCURRENT_DOWNLOADS")
            .and_then(|value| parse_number(&value))
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_DOWNLOADS),
    }
}

fn parse_number<T: FromStr>(value: &str) -> Option<T> {
    value.trim().parse().ok()
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Reads `KEY=value` pairs. A missing file yields no values.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    Ok(content.lines().filter_map(parse_env_line).collect())
}

fn parse_env_line(line: &str) -> Option<(String, String)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let (key, value_raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let value = value_raw.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|value| value.strip_suffix('"'))
        .or_else(|| {
            value
                .strip_prefix('\'')
                .and_then(|value| value.strip_suffix('\''))
        })
        .unwrap_or(value);
    Some((key.to_string(), value.to_string()))
}
