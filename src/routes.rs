//! HTTP routes.
//!
//! `/stream/{id}` is the media endpoint; everything else is a read-only view
//! of the published catalog (JSON API and crawler feeds).

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path as AxumPath, Query, State},
    http::{Extensions, HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::{
    blobs::BlobStore,
    catalog::{CatalogStore, Video},
    config::RuntimeSettings,
    feeds::{RSS_ITEM_LIMIT, robots_txt, rss_xml, sitemap_xml},
    security::ViewerInputs,
    streamer::{MediaStream, MediaStreamer, StreamError},
    views::{ViewCounter, ViewLedger},
};

/// Videos per page of `/api/videos`.
pub const VIDEOS_PER_PAGE: u32 = 24;

/// Shared handles for every handler.
#[derive(Clone)]
pub struct AppState {
    catalog: CatalogStore,
    streamer: MediaStreamer,
    site: Arc<SiteInfo>,
}

struct SiteInfo {
    base_url: String,
    site_name: String,
    trust_proxy: bool,
}

impl AppState {
    pub fn new(settings: &RuntimeSettings, catalog: CatalogStore, ledger: ViewLedger) -> Self {
        let blobs = BlobStore::new(settings.videos_dir());
        let views = ViewCounter::new(catalog.clone(), ledger, settings.view_salt.clone());
        Self {
            streamer: MediaStreamer::new(catalog.clone(), blobs, views),
            catalog,
            site: Arc::new(SiteInfo {
                base_url: settings.base_url.clone(),
                site_name: settings.site_name.clone(),
                trust_proxy: settings.trust_proxy,
            }),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream/{id}", get(stream_video))
        .route("/api/videos", get(list_videos))
        .route("/api/videos/{slug}", get(get_video))
        .route("/robots.txt", get(robots))
        .route("/sitemap.xml", get(sitemap))
        .route("/rss.xml", get(rss))
        .fallback(not_found)
        .with_state(state)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// Logs the full error chain and hides it from the client.
    fn internal(err: anyhow::Error) -> Self {
        error!(error = %format!("{err:#}"), "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal server error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "Not Found")
}

/// HEAD is answered by the same route but sends no bytes, so it never
/// counts as a view.
async fn stream_video(
    State(state): State<AppState>,
    AxumPath(raw_id): AxumPath<String>,
    method: Method,
    headers: HeaderMap,
    extensions: Extensions,
) -> Result<MediaStream, StreamError> {
    let video_id = raw_id.parse::<i64>().map_err(|_| StreamError::NotFound)?;
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let viewer = (method != Method::HEAD)
        .then(|| ViewerInputs::from_request(&headers, peer, state.site.trust_proxy));
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok());
    state.streamer.stream_video(video_id, range, viewer).await
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    page: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoListPayload {
    videos: Vec<Video>,
    page: u32,
    total_pages: u32,
    total: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetailPayload {
    #[serde(flatten)]
    video: Video,
    stream_url: String,
}

fn requested_page(raw: Option<&str>) -> u32 {
    raw.and_then(|value| value.trim().parse::<u32>().ok())
        .filter(|page| *page >= 1)
        .unwrap_or(1)
}

async fn list_videos(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<VideoListPayload>> {
    let page = state
        .catalog
        .list_published(requested_page(query.page.as_deref()), VIDEOS_PER_PAGE)
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(VideoListPayload {
        videos: page.videos,
        page: page.page,
        total_pages: page.total_pages,
        total: page.total,
    }))
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(slug): AxumPath<String>,
) -> ApiResult<Json<VideoDetailPayload>> {
    let video = state
        .catalog
        .find_published_by_slug(&slug)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::not_found("video not found"))?;
    Ok(Json(VideoDetailPayload {
        stream_url: format!("/stream/{}", video.id),
        video,
    }))
}

async fn robots(State(state): State<AppState>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        robots_txt(&state.site.base_url),
    )
        .into_response()
}

async fn sitemap(State(state): State<AppState>) -> ApiResult<Response> {
    let videos = state
        .catalog
        .list_published_by_update()
        .await
        .map_err(ApiError::internal)?;
    Ok((
        [(header::CONTENT_TYPE, "application/xml; charset=utf-8")],
        sitemap_xml(&state.site.base_url, &videos),
    )
        .into_response())
}

async fn rss(State(state): State<AppState>) -> ApiResult<Response> {
    let latest = state
        .catalog
        .list_published(1, RSS_ITEM_LIMIT)
        .await
        .map_err(ApiError::internal)?;
    Ok((
        [(header::CONTENT_TYPE, "application/rss+xml; charset=utf-8")],
        rss_xml(&state.site.site_name, &state.site.base_url, &latest.videos),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{NewVideo, open_database};
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::tempdir;
    use tower::ServiceExt;

    struct RouterFixture {
        _temp: tempfile::TempDir,
        settings: RuntimeSettings,
        catalog: CatalogStore,
        app: Router,
    }

    impl RouterFixture {
        async fn new(trust_proxy: bool) -> Self {
            let temp = tempdir().unwrap();
            let settings = RuntimeSettings {
                media_root: temp.path().to_path_buf(),
                host: "127.0.0.1".into(),
                port: 3000,
                base_url: "https://videy.test".into(),
                site_name: "Videy & Co".into(),
                trust_proxy,
                view_salt: "salt".into(),
                max_upload_mb: 400,
            };
            std::fs::create_dir_all(settings.videos_dir()).unwrap();
            let conn = open_database(&settings.catalog_path()).await.unwrap();
            let catalog = CatalogStore::new(conn.clone());
            let app = router(AppState::new(&settings, catalog.clone(), ViewLedger::new(conn)));
            Self {
                _temp: temp,
                settings,
                catalog,
                app,
            }
        }

        async fn add_video(&self, slug: &str, bytes: &[u8], published: bool) -> Video {
            let filename = format!("{slug}.webm");
            std::fs::write(self.settings.videos_dir().join(&filename), bytes).unwrap();
            self.catalog
                .insert_video(&NewVideo {
                    title: format!("Title {slug}"),
                    slug: slug.to_string(),
                    description: Some("about <things>".into()),
                    tags: None,
                    filename,
                    mime: "video/webm".into(),
                    size_bytes: bytes.len() as i64,
                    is_published: published,
                })
                .await
                .unwrap()
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.app.clone().oneshot(request).await.unwrap()
        }

        async fn get(&self, uri: &str) -> Response {
            self.send(Request::get(uri).body(Body::empty()).unwrap())
                .await
        }

        async fn wait_for_views(&self, id: i64, expected: i64) -> i64 {
            let mut views = 0;
            for _ in 0..100 {
                views = self.catalog.get_video(id).await.unwrap().unwrap().views;
                if views == expected {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            views
        }
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn peer(ip: &str) -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::new(ip.parse().unwrap(), 40000))
    }

    #[tokio::test]
    async fn stream_route_serves_ranges() {
        let fx = RouterFixture::new(false).await;
        let video = fx.add_video("alpha", b"0123456789", true).await;

        let response = fx
            .send(
                Request::get(format!("/stream/{}", video.id))
                    .header(header::RANGE, "bytes=2-4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-4/10");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/webm");
        assert_eq!(body_bytes(response).await, b"234");

        let response = fx.get(&format!("/stream/{}", video.id)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, b"0123456789");
    }

    #[tokio::test]
    async fn head_on_stream_route_counts_no_view() {
        let fx = RouterFixture::new(false).await;
        let video = fx.add_video("alpha", b"0123456789", true).await;

        let mut request = Request::head(format!("/stream/{}", video.id))
            .body(Body::empty())
            .unwrap();
        request.extensions_mut().insert(peer("203.0.113.9"));
        let response = fx.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
        assert!(body_bytes(response).await.is_empty());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.catalog.get_video(video.id).await.unwrap().unwrap().views, 0);

        let response = fx.get(&format!("/stream/{}", video.id)).await;
        body_bytes(response).await;
        assert_eq!(fx.wait_for_views(video.id, 1).await, 1);
    }

    #[tokio::test]
    async fn stream_route_hides_unknown_ids() {
        let fx = RouterFixture::new(false).await;
        let draft = fx.add_video("draft", b"data", false).await;

        for uri in [
            format!("/stream/{}", draft.id),
            "/stream/424242".to_string(),
            "/stream/not-a-number".to_string(),
        ] {
            let response = fx.get(&uri).await;
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
            assert!(body_bytes(response).await.is_empty());
        }
    }

    #[tokio::test]
    async fn stream_route_rejects_range_past_end() {
        let fx = RouterFixture::new(false).await;
        let video = fx.add_video("alpha", b"0123456789", true).await;

        let response = fx
            .send(
                Request::get(format!("/stream/{}", video.id))
                    .header(header::RANGE, "bytes=10-")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
    }

    #[tokio::test]
    async fn forwarded_addresses_only_count_when_trusted() {
        for (trust_proxy, expected) in [(true, 2), (false, 1)] {
            let fx = RouterFixture::new(trust_proxy).await;
            let video = fx.add_video("alpha", b"0123456789", true).await;

            for forwarded in ["198.51.100.1", "198.51.100.2, 10.0.0.1"] {
                let mut request = Request::get(format!("/stream/{}", video.id))
                    .header("x-forwarded-for", forwarded)
                    .body(Body::empty())
                    .unwrap();
                request.extensions_mut().insert(peer("10.0.0.1"));
                let response = fx.send(request).await;
                assert_eq!(response.status(), StatusCode::OK);
                body_bytes(response).await;
                fx.wait_for_views(video.id, 1).await;
            }
            assert_eq!(
                fx.wait_for_views(video.id, expected).await,
                expected,
                "trust_proxy={trust_proxy}"
            );
        }
    }

    #[tokio::test]
    async fn list_videos_paginates_published_only() {
        let fx = RouterFixture::new(false).await;
        for n in 0..26 {
            fx.add_video(&format!("clip-{n}"), b"x", true).await;
        }
        fx.add_video("hidden", b"x", false).await;

        let first = body_json(fx.get("/api/videos").await).await;
        assert_eq!(first["page"], 1);
        assert_eq!(first["total"], 26);
        assert_eq!(first["totalPages"], 2);
        assert_eq!(first["videos"].as_array().unwrap().len(), 24);
        assert!(first["videos"][0].get("filename").is_none());

        let second = body_json(fx.get("/api/videos?page=2").await).await;
        assert_eq!(second["videos"].as_array().unwrap().len(), 2);

        let fallback = body_json(fx.get("/api/videos?page=zero").await).await;
        assert_eq!(fallback["page"], 1);
    }

    #[tokio::test]
    async fn get_video_by_slug_links_stream() {
        let fx = RouterFixture::new(false).await;
        let video = fx.add_video("alpha", b"0123", true).await;
        fx.add_video("draft", b"0123", false).await;

        let response = fx.get("/api/videos/alpha").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["slug"], "alpha");
        assert_eq!(json["streamUrl"], format!("/stream/{}", video.id));
        assert_eq!(json["views"], 0);

        let response = fx.get("/api/videos/draft").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "video not found");
        assert_eq!(fx.catalog.get_video(video.id).await.unwrap().unwrap().views, 0);
    }

    #[tokio::test]
    async fn feeds_use_configured_site() {
        let fx = RouterFixture::new(false).await;
        fx.add_video("alpha", b"0123", true).await;
        fx.add_video("draft", b"0123", false).await;

        let robots = String::from_utf8(body_bytes(fx.get("/robots.txt").await).await).unwrap();
        assert!(robots.contains("Sitemap: https://videy.test/sitemap.xml"));

        let response = fx.get("/sitemap.xml").await;
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/xml; charset=utf-8"
        );
        let sitemap = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(sitemap.contains("https://videy.test/v/alpha"));
        assert!(!sitemap.contains("draft"));

        let rss = String::from_utf8(body_bytes(fx.get("/rss.xml").await).await).unwrap();
        assert!(rss.contains("<title>Videy &amp; Co</title>"));
        assert!(rss.contains("about &lt;things&gt;"));
    }

    #[tokio::test]
    async fn unknown_paths_are_plain_404() {
        let fx = RouterFixture::new(false).await;
        let response = fx.get("/admin").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"Not Found");
    }

    #[test]
    fn page_parameter_falls_back_to_first_page() {
        assert_eq!(requested_page(None), 1);
        assert_eq!(requested_page(Some("0")), 1);
        assert_eq!(requested_page(Some("-3")), 1);
        assert_eq!(requested_page(Some("3")), 3);
    }
}
