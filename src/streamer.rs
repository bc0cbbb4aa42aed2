//! Byte-range media streaming for published videos.
//!
//! A request resolves the catalog row, measures the blob on disk, picks the
//! byte window and hands back a streaming body. Counting the view runs on its
//! own task so analytics never hold up playback.

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{
    blobs::{BlobStore, BlobStream},
    catalog::{CatalogStore, Video},
    range::{RangeRequest, RangeWindow, resolve_range},
    security::ViewerInputs,
    views::ViewCounter,
};

/// Public caching allowed for a day.
pub const STREAM_CACHE_CONTROL: &str = "public, max-age=86400";

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Missing, unpublished, or missing blob. Deliberately indistinguishable.
    #[error("video not found")]
    NotFound,
    #[error("range not satisfiable for a {size} byte resource")]
    RangeNotSatisfiable { size: u64, mime: String },
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl IntoResponse for StreamError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND.into_response(),
            Self::RangeNotSatisfiable { size, mime } => {
                let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
                let headers = response.headers_mut();
                insert_common_headers(headers, &mime);
                headers.insert(
                    header::CONTENT_RANGE,
                    header_value(format!("bytes */{size}")),
                );
                response
            }
            Self::Storage(err) => {
                error!(error = %format!("{err:#}"), "stream failed before transfer");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

/// A resolved stream ready to be turned into a 200 or 206 response.
pub struct MediaStream {
    pub video: Video,
    pub total: u64,
    /// `None` for a full-content response.
    pub window: Option<RangeWindow>,
    body: BlobStream,
    /// Handle of the detached view-count task, `None` when no view is
    /// counted. Dropping it does not cancel the task.
    pub view_task: Option<JoinHandle<()>>,
}

impl MediaStream {
    pub fn status(&self) -> StatusCode {
        if self.window.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }

    pub fn content_length(&self) -> u64 {
        self.window.map_or(self.total, |window| window.length())
    }
}

impl IntoResponse for MediaStream {
    fn into_response(self) -> Response {
        let status = self.status();
        let length = self.content_length();
        let video_id = self.video.id;
        let stream = self.body.inspect_err(move |err| {
            warn!(video_id, error = %err, "transfer aborted");
        });

        let mut response = Body::from_stream(stream).into_response();
        *response.status_mut() = status;
        let headers = response.headers_mut();
        insert_common_headers(headers, &self.video.mime);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
        if let Some(window) = self.window {
            headers.insert(header::CONTENT_RANGE, header_value(window.content_range()));
        }
        response
    }
}

fn insert_common_headers(headers: &mut HeaderMap, mime: &str) {
    let content_type = HeaderValue::from_str(mime)
        .unwrap_or_else(|_| HeaderValue::from_static(FALLBACK_MIME));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(STREAM_CACHE_CONTROL),
    );
}

fn header_value(value: String) -> HeaderValue {
    // Only ever called with ASCII digits, spaces, '-', '/' and '*'.
    HeaderValue::try_from(value).unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[derive(Clone)]
pub struct MediaStreamer {
    catalog: CatalogStore,
    blobs: BlobStore,
    views: ViewCounter,
}

impl MediaStreamer {
    pub fn new(catalog: CatalogStore, blobs: BlobStore, views: ViewCounter) -> Self {
        Self {
            catalog,
            blobs,
            views,
        }
    }

    /// Resolves `video_id` and opens the requested byte window.
    ///
    /// The size always comes from the blob itself; the catalog's cached
    /// `size_bytes` may have drifted. A view is counted (at most once per
    /// viewer and window) whenever bytes are actually served; pass `None`
    /// for requests that send no body, such as HEAD.
    pub async fn stream_video(
        &self,
        video_id: i64,
        range_header: Option<&str>,
        viewer: Option<ViewerInputs>,
    ) -> Result<MediaStream, StreamError> {
        let video = self
            .catalog
            .find_published_video(video_id)
            .await?
            .ok_or(StreamError::NotFound)?;
        let total = self
            .blobs
            .stat_size(&video.filename)
            .await?
            .ok_or_else(|| {
                warn!(video_id, filename = %video.filename, "blob missing for published video");
                StreamError::NotFound
            })?;

        let (start, end, window) = match resolve_range(range_header, total) {
            RangeRequest::Unsatisfiable { total } => {
                return Err(StreamError::RangeNotSatisfiable {
                    size: total,
                    mime: video.mime,
                });
            }
            RangeRequest::Partial(window) => (window.start, window.end, Some(window)),
            RangeRequest::Full => (0, total.saturating_sub(1), None),
        };

        debug!(video_id, start, end, total, partial = window.is_some(), "streaming video");
        let body = if total == 0 {
            // Zero-length blob: an exhausted stream over an empty window.
            self.blobs.open_byte_range(&video.filename, 0, 0).await?
        } else {
            self.blobs.open_byte_range(&video.filename, start, end).await?
        };

        let view_task = viewer.map(|viewer| self.spawn_view_count(video.id, viewer));

        Ok(MediaStream {
            video,
            total,
            window,
            body,
            view_task,
        })
    }

    fn spawn_view_count(&self, video_id: i64, viewer: ViewerInputs) -> JoinHandle<()> {
        let views = self.views.clone();
        tokio::spawn(async move {
            match views.record_view(video_id, &viewer).await {
                Ok(true) => debug!(video_id, "view counted"),
                Ok(false) => {}
                Err(err) => warn!(video_id, error = %format!("{err:#}"), "failed to record view"),
            }
        })
    }
}
