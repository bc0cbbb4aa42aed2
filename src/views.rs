//! Deduplicated view counting.
//!
//! A view is counted at most once per viewer fingerprint and video inside a
//! trailing window. The check and the insert are separate statements, so two
//! racing requests from the same viewer may both count; view totals are
//! approximate analytics.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use libsql::{Connection, params};

use crate::catalog::CatalogStore;
use crate::security::{ViewerInputs, truncate_user_agent, viewer_fingerprint};

/// Trailing window inside which repeat views are suppressed.
pub const VIEW_DEDUP_WINDOW_HOURS: i64 = 6;

/// Append-only log of counted views (`view_logs`).
#[derive(Clone)]
pub struct ViewLedger {
    conn: Connection,
}

impl ViewLedger {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// True when an event for `(video_id, fingerprint)` exists at or after
    /// `window_start`. The window start is inclusive.
    pub async fn has_recent_event(
        &self,
        video_id: i64,
        fingerprint: &str,
        window_start: DateTime<Utc>,
    ) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT 1 FROM view_logs
                WHERE video_id = ?1 AND ip_hash = ?2 AND created_at >= ?3
                LIMIT 1
                "#,
                params![video_id, fingerprint, window_start.timestamp_millis()],
            )
            .await
            .context("querying view ledger")?;
        Ok(rows.next().await?.is_some())
    }

    pub async fn record_event(&self, video_id: i64, fingerprint: &str, user_agent: &str) -> Result<()> {
        self.record_event_at(video_id, fingerprint, user_agent, Utc::now())
            .await
    }

    pub async fn record_event_at(
        &self,
        video_id: i64,
        fingerprint: &str,
        user_agent: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let user_agent = truncate_user_agent(user_agent);
        self.conn
            .execute(
                "INSERT INTO view_logs (video_id, ip_hash, ua, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    video_id,
                    fingerprint,
                    (!user_agent.is_empty()).then_some(user_agent),
                    at.timestamp_millis()
                ],
            )
            .await
            .with_context(|| format!("recording view of video {video_id}"))?;
        Ok(())
    }

    /// Counted views across all videos at or after `since`.
    pub async fn count_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM view_logs WHERE created_at >= ?1",
                params![since.timestamp_millis()],
            )
            .await
            .context("counting recent views")?;
        let row = rows.next().await?.context("missing count row")?;
        let count: i64 = row.get(0)?;
        Ok(count.max(0) as u64)
    }

    #[cfg(test)]
    pub async fn count_events(&self, video_id: i64) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM view_logs WHERE video_id = ?1",
                params![video_id],
            )
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        let count: i64 = row.get(0)?;
        Ok(count.max(0) as u64)
    }
}

/// Ties the ledger to the catalog's view counter.
#[derive(Clone)]
pub struct ViewCounter {
    catalog: CatalogStore,
    ledger: ViewLedger,
    salt: String,
    window: Duration,
}

impl ViewCounter {
    pub fn new(catalog: CatalogStore, ledger: ViewLedger, salt: impl Into<String>) -> Self {
        Self {
            catalog,
            ledger,
            salt: salt.into(),
            window: Duration::hours(VIEW_DEDUP_WINDOW_HOURS),
        }
    }

    /// Counts a view of `video_id` unless this viewer was already counted
    /// inside the window. Returns whether the counter moved.
    pub async fn record_view(&self, video_id: i64, viewer: &ViewerInputs) -> Result<bool> {
        self.record_view_at(video_id, viewer, Utc::now()).await
    }

    pub async fn record_view_at(
        &self,
        video_id: i64,
        viewer: &ViewerInputs,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let fingerprint = viewer_fingerprint(&self.salt, &viewer.client_ip, video_id);
        if self
            .ledger
            .has_recent_event(video_id, &fingerprint, now - self.window)
            .await?
        {
            return Ok(false);
        }

        self.ledger
            .record_event_at(video_id, &fingerprint, &viewer.user_agent, now)
            .await?;
        self.catalog.increment_views(video_id).await?;
        Ok(true)
    }
}
