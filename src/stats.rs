#![forbid(unsafe_code)]

//! Download history and daily usage counters.
//!
//! Recording is best effort: callers log failures and carry on, so nothing in
//! here can abort a download.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{Builder, Connection, params};
use serde::Serialize;
use std::{net::IpAddr, path::Path};

use crate::models::MediaKind;

pub const DEFAULT_POPULAR_LIMIT: u32 = 10;

/// Fields captured when a download is accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDownload {
    pub url: String,
    pub title: Option<String>,
    pub kind: MediaKind,
    pub quality: String,
    /// Already anonymized, see [`anonymize_ip`].
    pub client_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Failed,
}

impl DownloadOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadOutcome::Completed => "completed",
            DownloadOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopularDownload {
    pub title: String,
    pub downloads: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub visits: i64,
    pub downloads: i64,
    pub video_downloads: i64,
    pub audio_downloads: i64,
    pub popular: Vec<PopularDownload>,
}

#[async_trait]
pub trait StatsRecorder: Send + Sync {
    /// Returns the id later passed to [`StatsRecorder::update_download_status`].
    async fn record_download_started(&self, download: &NewDownload) -> Result<i64>;

    /// Size and elapsed time are only written when present.
    async fn update_download_status(
        &self,
        record_id: i64,
        outcome: DownloadOutcome,
        file_size: Option<u64>,
        elapsed_seconds: Option<f64>,
    ) -> Result<()>;

    async fn record_visit(&self) -> Result<()>;

    async fn record_download_completed(&self, kind: MediaKind) -> Result<()>;

    async fn summary(&self) -> Result<StatsSummary>;
}

/// Recorder used when no database is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

#[async_trait]
impl StatsRecorder for NoopStats {
    async fn record_download_started(&self, _download: &NewDownload) -> Result<i64> {
        Ok(0)
    }

    async fn update_download_status(
        &self,
        _record_id: i64,
        _outcome: DownloadOutcome,
        _file_size: Option<u64>,
        _elapsed_seconds: Option<f64>,
    ) -> Result<()> {
        Ok(())
    }

    async fn record_visit(&self) -> Result<()> {
        Ok(())
    }

    async fn record_download_completed(&self, _kind: MediaKind) -> Result<()> {
        Ok(())
    }

    async fn summary(&self) -> Result<StatsSummary> {
        Ok(StatsSummary::default())
    }
}

/// Keeps the network part of an address: three IPv4 octets or four IPv6
/// groups.
pub fn anonymize_ip(addr: IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}")
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => anonymize_ip(IpAddr::V4(v4)),
            None => {
                let groups = v6.segments();
                format!(
                    "{:x}:{:x}:{:x}:{:x}",
                    groups[0], groups[1], groups[2], groups[3]
                )
            }
        },
    }
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            video_title TEXT,
            format_type TEXT,
            quality TEXT,
            file_size INTEGER,
            download_time REAL,
            status TEXT NOT NULL DEFAULT 'started',
            created_at TEXT NOT NULL,
            ip_address TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);

        CREATE TABLE IF NOT EXISTS statistics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL UNIQUE,
            visits INTEGER NOT NULL DEFAULT 0,
            downloads INTEGER NOT NULL DEFAULT 0,
            video_downloads INTEGER NOT NULL DEFAULT 0,
            audio_downloads INTEGER NOT NULL DEFAULT 0
        );
        "#,
    )
    .await?;
    Ok(())
}

fn today() -> String {
    Utc::now().date_naive().to_string()
}

/// libsql-backed recorder.
#[derive(Debug)]
pub struct StatsStore {
    conn: Connection,
}

impl StatsStore {
    /// Opens (and if necessary creates) the database and its tables.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating stats directory {}", parent.display()))?;
        }
        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening stats DB {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Titles completed most often, busiest first.
    pub async fn popular_downloads(&self, limit: u32) -> Result<Vec<PopularDownload>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT video_title, COUNT(*) AS total
                FROM downloads
                WHERE status = 'completed' AND video_title IS NOT NULL
                GROUP BY video_title
                ORDER BY total DESC, video_title ASC
                LIMIT ?1
                "#,
                params![i64::from(limit)],
            )
            .await?;
        let mut popular = Vec::new();
        while let Some(row) = rows.next().await? {
            popular.push(PopularDownload {
                title: row.get(0)?,
                downloads: row.get(1)?,
            });
        }
        Ok(popular)
    }

    async fn bump_today(&self, column_updates: &str, initial: [i64; 4]) -> Result<()> {
        let [visits, downloads, video, audio] = initial;
        let sql = format!(
            r#"
            INSERT INTO statistics (date, visits, downloads, video_downloads, audio_downloads)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(date) DO UPDATE SET {column_updates}
            "#
        );
        self.conn
            .execute(&sql, params![today(), visits, downloads, video, audio])
            .await
            .context("updating daily statistics")?;
        Ok(())
    }
}

#[async_trait]
impl StatsRecorder for StatsStore {
    async fn record_download_started(&self, download: &NewDownload) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                r#"
                INSERT INTO downloads (url, video_title, format_type, quality, status, created_at, ip_address)
                VALUES (?1, ?2, ?3, ?4, 'started', ?5, ?6)
                RETURNING id
                "#,
                params![
                    download.url.as_str(),
                    download.title.as_deref(),
                    download.kind.as_str(),
                    download.quality.as_str(),
                    Utc::now().to_rfc3339(),
                    download.client_prefix.as_deref(),
                ],
            )
            .await
            .context("inserting download record")?;
        let row = rows
            .next()
            .await?
            .context("insert returned no download id")?;
        Ok(row.get(0)?)
    }

    async fn update_download_status(
        &self,
        record_id: i64,
        outcome: DownloadOutcome,
        file_size: Option<u64>,
        elapsed_seconds: Option<f64>,
    ) -> Result<()> {
        let file_size = file_size.and_then(|size| i64::try_from(size).ok());
        self.conn
            .execute(
                r#"
                UPDATE downloads
                SET status = ?2,
                    file_size = COALESCE(?3, file_size),
                    download_time = COALESCE(?4, download_time)
                WHERE id = ?1
                "#,
                params![record_id, outcome.as_str(), file_size, elapsed_seconds],
            )
            .await
            .with_context(|| format!("updating download record {record_id}"))?;
        Ok(())
    }

    async fn record_visit(&self) -> Result<()> {
        self.bump_today("visits = visits + 1", [1, 0, 0, 0]).await
    }

    async fn record_download_completed(&self, kind: MediaKind) -> Result<()> {
        match kind {
            MediaKind::Video => {
                self.bump_today(
                    "downloads = downloads + 1, video_downloads = video_downloads + 1",
                    [0, 1, 1, 0],
                )
                .await
            }
            MediaKind::Audio => {
                self.bump_today(
                    "downloads = downloads + 1, audio_downloads = audio_downloads + 1",
                    [0, 1, 0, 1],
                )
                .await
            }
        }
    }

    async fn summary(&self) -> Result<StatsSummary> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT COALESCE(SUM(visits), 0),
                       COALESCE(SUM(downloads), 0),
                       COALESCE(SUM(video_downloads), 0),
                       COALESCE(SUM(audio_downloads), 0)
                FROM statistics
                "#,
                params![],
            )
            .await?;
        let row = rows.next().await?.context("missing statistics totals")?;
        Ok(StatsSummary {
            visits: row.get(0)?,
            downloads: row.get(1)?,
            video_downloads: row.get(2)?,
            audio_downloads: row.get(3)?,
            popular: self.popular_downloads(DEFAULT_POPULAR_LIMIT).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tempfile::tempdir;

    async fn create_store() -> Result<(tempfile::TempDir, StatsStore)> {
        let dir = tempdir()?;
        let store = StatsStore::open(&dir.path().join("stats/test.db")).await?;
        Ok((dir, store))
    }

    fn sample(title: &str, kind: MediaKind) -> NewDownload {
        NewDownload {
            url: "https://www.youtube.com/watch?v=dQw4w9WgXcQ".into(),
            title: Some(title.into()),
            kind,
            quality: "720p".into(),
            client_prefix: Some("203.0.113".into()),
        }
    }

    #[test]
    fn anonymize_keeps_network_prefix() {
        assert_eq!(
            anonymize_ip(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 77))),
            "203.0.113"
        );
        assert_eq!(
            anonymize_ip("2001:db8:85a3:8d3:1319:8a2e:370:7348".parse().unwrap()),
            "2001:db8:85a3:8d3"
        );
        assert_eq!(
            anonymize_ip(IpAddr::V6(Ipv4Addr::new(10, 1, 2, 3).to_ipv6_mapped())),
            "10.1.2"
        );
        assert_eq!(anonymize_ip(IpAddr::V6(Ipv6Addr::LOCALHOST)), "0:0:0:0");
    }

    #[tokio::test]
    async fn opening_creates_tables() -> Result<()> {
        let (_dir, store) = create_store().await?;
        for table in ["downloads", "statistics"] {
            let mut rows = store
                .conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await?;
            let exists: Option<String> = rows
                .next()
                .await?
                .map(|row| row.get::<String>(0))
                .transpose()?;
            assert_eq!(exists.as_deref(), Some(table));
        }
        Ok(())
    }

    #[tokio::test]
    async fn status_updates_keep_unspecified_fields() -> Result<()> {
        let (_dir, store) = create_store().await?;
        let id = store
            .record_download_started(&sample("Alpha", MediaKind::Video))
            .await?;
        store
            .update_download_status(id, DownloadOutcome::Completed, Some(2048), Some(3.5))
            .await?;
        store
            .update_download_status(id, DownloadOutcome::Failed, None, None)
            .await?;

        let mut rows = store
            .conn
            .query(
                "SELECT status, file_size, download_time, ip_address FROM downloads WHERE id = ?1",
                params![id],
            )
            .await?;
        let row = rows.next().await?.context("missing download row")?;
        assert_eq!(row.get::<String>(0)?, "failed");
        assert_eq!(row.get::<i64>(1)?, 2048);
        assert_eq!(row.get::<f64>(2)?, 3.5);
        assert_eq!(row.get::<String>(3)?, "203.0.113");
        Ok(())
    }

    #[tokio::test]
    async fn daily_counters_accumulate() -> Result<()> {
        let (_dir, store) = create_store().await?;
        store.record_visit().await?;
        store.record_visit().await?;
        store.record_download_completed(MediaKind::Video).await?;
        store.record_download_completed(MediaKind::Audio).await?;
        store.record_download_completed(MediaKind::Audio).await?;

        let summary = store.summary().await?;
        assert_eq!(summary.visits, 2);
        assert_eq!(summary.downloads, 3);
        assert_eq!(summary.video_downloads, 1);
        assert_eq!(summary.audio_downloads, 2);
        Ok(())
    }

    #[tokio::test]
    async fn popular_downloads_count_completed_titles() -> Result<()> {
        let (_dir, store) = create_store().await?;
        for (title, outcome) in [
            ("Alpha", DownloadOutcome::Completed),
            ("Beta", DownloadOutcome::Completed),
            ("Beta", DownloadOutcome::Completed),
            ("Gamma", DownloadOutcome::Failed),
        ] {
            let id = store
                .record_download_started(&sample(title, MediaKind::Video))
                .await?;
            store.update_download_status(id, outcome, None, None).await?;
        }

        let popular = store.popular_downloads(10).await?;
        assert_eq!(
            popular,
            vec![
                PopularDownload {
                    title: "Beta".into(),
                    downloads: 2
                },
                PopularDownload {
                    title: "Alpha".into(),
                    downloads: 1
                },
            ]
        );
        assert_eq!(store.popular_downloads(1).await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn noop_recorder_accepts_everything() -> Result<()> {
        let stats = NoopStats;
        let id = stats
            .record_download_started(&sample("Alpha", MediaKind::Audio))
            .await?;
        stats
            .update_download_status(id, DownloadOutcome::Completed, Some(1), Some(1.0))
            .await?;
        stats.record_visit().await?;
        assert_eq!(stats.summary().await?, StatsSummary::default());
        Ok(())
    }
}
