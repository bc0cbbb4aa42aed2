//! Video catalog persistence.
//!
//! The catalog and the view ledger share one SQLite-compatible database file
//! under the media root. [`open_database`] prepares the connection and schema;
//! [`CatalogStore`] owns the `videos` table.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::Serialize;

/// A catalog entry. `filename` addresses the blob under the videos directory
/// and is never serialized into API payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Video {
    pub id: i64,
    pub title: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<String>,
    #[serde(skip_serializing)]
    pub filename: String,
    pub mime: String,
    pub size_bytes: i64,
    pub is_published: bool,
    pub views: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Video {
    pub fn tag_list(&self) -> Vec<&str> {
        self.tags
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .collect()
    }
}

/// Fields supplied when registering a new video.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub title: String,
    pub slug: String,
    pub description: Option<String>,
    pub tags: Option<String>,
    pub filename: String,
    pub mime: String,
    pub size_bytes: i64,
    pub is_published: bool,
}

/// One page of published videos, newest first.
#[derive(Debug, Clone)]
pub struct VideoPage {
    pub videos: Vec<Video>,
    pub page: u32,
    pub total_pages: u32,
    pub total: u64,
}

/// Catalog-wide totals for the operator dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogTotals {
    pub videos: u64,
    pub published: u64,
    pub views: u64,
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
        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            slug TEXT NOT NULL UNIQUE,
            description TEXT,
            tags TEXT,
            filename TEXT NOT NULL,
            mime TEXT NOT NULL,
            size_bytes INTEGER NOT NULL DEFAULT 0,
            is_published INTEGER NOT NULL DEFAULT 1,
            views INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_published_created
            ON videos(is_published, created_at);

        CREATE TABLE IF NOT EXISTS view_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            video_id INTEGER NOT NULL,
            ip_hash TEXT NOT NULL,
            ua TEXT,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_view_logs_lookup
            ON view_logs(video_id, ip_hash, created_at);
        "#,
    )
    .await?;
    Ok(())
}

/// Opens (and if necessary creates) the catalog database and its schema.
pub async fn open_database(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating catalog directory {}", parent.display()))?;
    }

    let db = Builder::new_local(path)
        .build()
        .await
        .with_context(|| format!("opening catalog DB {}", path.display()))?;
    let conn = db.connect()?;
    configure_connection(&conn).await?;
    ensure_schema(&conn).await?;
    Ok(conn)
}

const VIDEO_COLUMNS: &str = "id, title, slug, description, tags, filename, mime, size_bytes, \
                             is_published, views, created_at, updated_at";

#[derive(Clone)]
pub struct CatalogStore {
    conn: Connection,
}

impl CatalogStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Looks up a video that is visible to the public. Unpublished and missing
    /// rows are indistinguishable to callers.
    pub async fn find_published_video(&self, id: i64) -> Result<Option<Video>> {
        self.fetch_one(
            &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1 AND is_published = 1"),
            params![id],
        )
        .await
    }

    pub async fn find_published_by_slug(&self, slug: &str) -> Result<Option<Video>> {
        self.fetch_one(
            &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE slug = ?1 AND is_published = 1"),
            params![slug],
        )
        .await
    }

    /// Any video regardless of publication state; operator use only.
    pub async fn get_video(&self, id: i64) -> Result<Option<Video>> {
        self.fetch_one(
            &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"),
            params![id],
        )
        .await
    }

    /// Single-statement increment so concurrent viewers never lose an update.
    pub async fn increment_views(&self, id: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE videos SET views = views + 1 WHERE id = ?1",
                params![id],
            )
            .await
            .with_context(|| format!("incrementing views of video {id}"))?;
        Ok(())
    }

    /// Returns page `page` (1-based) of published videos, newest first.
    pub async fn list_published(&self, page: u32, per_page: u32) -> Result<VideoPage> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let total = self.count_published().await?;
        let offset = i64::from(page - 1) * i64::from(per_page);

        let videos = self
            .fetch_all(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}
                    FROM videos
                    WHERE is_published = 1
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?1 OFFSET ?2
                    "#
                ),
                params![i64::from(per_page), offset],
            )
            .await?;

        Ok(VideoPage {
            videos,
            page,
            total_pages: total.div_ceil(u64::from(per_page)) as u32,
            total,
        })
    }

    /// Published videos for the sitemap, most recently updated first.
    pub async fn list_published_by_update(&self) -> Result<Vec<Video>> {
        self.fetch_all(
            &format!(
                "SELECT {VIDEO_COLUMNS} FROM videos WHERE is_published = 1 \
                 ORDER BY updated_at DESC, id DESC"
            ),
            params![],
        )
        .await
    }

    /// Every video including unpublished ones, newest first.
    pub async fn list_all(&self) -> Result<Vec<Video>> {
        self.fetch_all(
            &format!("SELECT {VIDEO_COLUMNS} FROM videos ORDER BY created_at DESC, id DESC"),
            params![],
        )
        .await
    }

    pub async fn count_published(&self) -> Result<u64> {
        let mut rows = self
            .conn
            .query("SELECT COUNT(*) FROM videos WHERE is_published = 1", params![])
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        let count: i64 = row.get(0)?;
        Ok(count.max(0) as u64)
    }

    pub async fn totals(&self) -> Result<CatalogTotals> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*), COALESCE(SUM(is_published), 0), COALESCE(SUM(views), 0) FROM videos",
                params![],
            )
            .await
            .context("summing catalog")?;
        let row = rows.next().await?.context("missing totals row")?;
        let count = |idx: i32| -> Result<u64> { Ok(row.get::<i64>(idx)?.max(0) as u64) };
        Ok(CatalogTotals {
            videos: count(0)?,
            published: count(1)?,
            views: count(2)?,
        })
    }

    pub async fn slug_exists(&self, slug: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM videos WHERE slug = ?1", params![slug])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Identical uploads share one content-addressed blob.
    pub async fn filename_in_use(&self, filename: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM videos WHERE filename = ?1 LIMIT 1", params![filename])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Returns `base` if it is free, otherwise the first free `base-N`.
    pub async fn unique_slug(&self, base: &str) -> Result<String> {
        if !self.slug_exists(base).await? {
            return Ok(base.to_string());
        }
        let mut n = 2u32;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.slug_exists(&candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    pub async fn insert_video(&self, video: &NewVideo) -> Result<Video> {
        self.insert_video_at(video, Utc::now()).await
    }

    pub(crate) async fn insert_video_at(&self, video: &NewVideo, at: DateTime<Utc>) -> Result<Video> {
        let now = at.timestamp_millis();
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    title, slug, description, tags, filename, mime,
                    size_bytes, is_published, views, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)
                "#,
                params![
                    video.title.as_str(),
                    video.slug.as_str(),
                    video.description.as_deref(),
                    video.tags.as_deref(),
                    video.filename.as_str(),
                    video.mime.as_str(),
                    video.size_bytes,
                    video.is_published as i64,
                    now,
                ],
            )
            .await
            .with_context(|| format!("inserting video {}", video.slug))?;

        let id = self.conn.last_insert_rowid();
        self.get_video(id)
            .await?
            .with_context(|| format!("video {id} vanished after insert"))
    }

    /// Flips the published flag. Returns `false` when no such video exists.
    pub async fn set_published(&self, id: i64, published: bool) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE videos SET is_published = ?1, updated_at = ?2 WHERE id = ?3",
                params![published as i64, Utc::now().timestamp_millis(), id],
            )
            .await
            .with_context(|| format!("updating video {id}"))?;
        Ok(changed > 0)
    }

    /// Deletes a video row together with its view log. The blob is left to the
    /// caller.
    pub async fn delete_video(&self, id: i64) -> Result<Option<Video>> {
        let Some(video) = self.get_video(id).await? else {
            return Ok(None);
        };
        let tx = self.conn.transaction().await?;
        tx.execute("DELETE FROM view_logs WHERE video_id = ?1", params![id])
            .await?;
        tx.execute("DELETE FROM videos WHERE id = ?1", params![id])
            .await?;
        tx.commit().await?;
        Ok(Some(video))
    }

    async fn fetch_one(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Option<Video>> {
        let mut rows = self.conn.query(sql, params).await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    async fn fetch_all(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Video>> {
        let mut rows = self.conn.query(sql, params).await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }
        Ok(videos)
    }
}

/// Converts a row selected with [`VIDEO_COLUMNS`] into a [`Video`].
fn row_to_video(row: &Row) -> Result<Video> {
    Ok(Video {
        id: row.get(0)?,
        title: row.get(1)?,
        slug: row.get(2)?,
        description: row.get(3)?,
        tags: row.get(4)?,
        filename: row.get(5)?,
        mime: row.get(6)?,
        size_bytes: row.get(7)?,
        is_published: row.get::<i64>(8).map(|value| value != 0)?,
        views: row.get(9)?,
        created_at: millis_to_datetime(row.get(10)?),
        updated_at: millis_to_datetime(row.get(11)?),
    })
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// Lowercase ASCII slug of `title`: alphanumeric runs joined by `-`.
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    for word in title
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
    {
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word.to_ascii_lowercase());
    }
    if slug.is_empty() {
        slug.push_str("video");
    }
    slug
}
