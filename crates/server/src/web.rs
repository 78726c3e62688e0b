use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;

use crate::error::{RelayError, Result};
use crate::media::MediaPipeline;
use crate::room::PeerRoom;
use crate::storage::{BlobStore, DEFAULT_CONTENT_TYPE};
use reel_protocol::{ReelConfig, UploadInfo, UploadResponse};

/// Uploads are buffered in memory for probing; keep them bounded.
const UPLOAD_BODY_LIMIT: usize = 1024 * 1024 * 1024;

/// Shared application state.
pub struct AppState {
    pub config: ReelConfig,
    pub store: Arc<dyn BlobStore>,
    pub pipeline: Arc<MediaPipeline>,
    pub room: Arc<PeerRoom>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let web_root = state.config.server.web_root.clone();
    Router::new()
        .route("/upload", post(upload))
        .route("/delete", delete(delete_video))
        .route("/video-list", get(video_list))
        .route("/websocket", get(websocket_upgrade))
        .nest_service("/static", ServeDir::new(web_root))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(UPLOAD_BODY_LIMIT))
        .with_state(state)
}

/// POST /upload — multipart form with a `video` field.
///
/// Supported codecs are stored as-is; anything else is stored by the
/// background normalization task and reported with `isConverting=true`.
async fn upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>> {
    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| RelayError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        if field.name() == Some("video") {
            let filename = field.file_name().unwrap_or("video.mp4").to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| RelayError::BadRequest(format!("failed to read upload: {e}")))?;
            upload = Some((filename, data));
            break;
        }
    }

    let Some((filename, data)) = upload else {
        return Err(RelayError::BadRequest(
            "missing multipart field 'video'".to_string(),
        ));
    };
    if data.is_empty() {
        return Err(RelayError::BadRequest("empty upload".to_string()));
    }

    if state.pipeline.process_upload(data.clone(), &filename).await {
        return Ok(Json(UploadResponse::converting()));
    }

    let size = state
        .store
        .put(
            &filename,
            Box::new(std::io::Cursor::new(data)),
            DEFAULT_CONTENT_TYPE,
        )
        .await?;
    tracing::info!(video = %filename, size, "upload stored");
    Ok(Json(UploadResponse::stored(UploadInfo {
        key: filename,
        size,
    })))
}

#[derive(Deserialize)]
struct DeleteParams {
    video: Option<String>,
}

/// DELETE /delete?video=<name>
async fn delete_video(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<UploadResponse>> {
    let video = params
        .video
        .filter(|name| !name.is_empty())
        .ok_or_else(|| RelayError::BadRequest("missing 'video' query parameter".to_string()))?;

    state.store.remove(&video).await?;
    tracing::info!(%video, "video deleted");
    Ok(Json(UploadResponse::ok(format!(
        "video deleted successfully: {video}"
    ))))
}

/// GET /video-list — names of every stored video.
async fn video_list(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.store.list().await?))
}

/// GET /websocket — signaling upgrade into the peer room.
async fn websocket_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let room = Arc::clone(&state.room);
    ws.on_upgrade(move |socket| room.handle_socket(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsBlobStore;
    use crate::stream::StreamerService;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use reel_protocol::{FfmpegConfig, RtspConfig};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn test_app_state() -> Arc<AppState> {
        let root = std::env::temp_dir().join(format!("reel-web-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&root).unwrap();
        let store: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(root));
        let cancel = CancellationToken::new();
        let pipeline = Arc::new(MediaPipeline::new(
            Arc::clone(&store),
            FfmpegConfig::default(),
            cancel.clone(),
        ));
        let streamer = StreamerService::new(
            Arc::clone(&pipeline),
            RtspConfig::default(),
            cancel.clone(),
        );
        let room = PeerRoom::new(streamer, cancel);
        Arc::new(AppState {
            config: ReelConfig::default(),
            store,
            pipeline,
            room,
        })
    }

    async fn body_json(response: axum::response::Response<Body>) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("failed to read response body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("response body is not valid JSON")
    }

    fn multipart_request(field: &str, filename: &str, payload: &[u8]) -> Request<Body> {
        let boundary = "reel-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; \
                 name=\"{field}\"; filename=\"{filename}\"\r\n\
                 Content-Type: video/mp4\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn video_list_starts_empty() {
        let app = build_router(test_app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/video-list")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn upload_without_video_field_is_400() {
        let app = build_router(test_app_state());
        let response = app
            .oneshot(multipart_request("attachment", "clip.mp4", b"data"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["status"], 400);
        assert!(
            json["error"]
                .as_str()
                .unwrap()
                .contains("missing multipart field")
        );
    }

    #[tokio::test]
    async fn upload_with_empty_payload_is_400() {
        let app = build_router(test_app_state());
        let response = app
            .oneshot(multipart_request("video", "clip.mp4", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_of_unprobeable_data_reports_converting() {
        // Not a real video, so the probe finds no codec and the gateway
        // reports a background conversion.
        let app = build_router(test_app_state());
        let response = app
            .oneshot(multipart_request("video", "clip.mp4", b"definitely not mp4"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["isConverting"], true);
        assert_eq!(json["result"], "video uploaded successfully");
    }

    #[tokio::test]
    async fn delete_without_param_is_400() {
        let app = build_router(test_app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/delete")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_unknown_video_is_404() {
        let app = build_router(test_app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/delete?video=ghost.mp4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_removes_stored_video() {
        let state = test_app_state();
        state
            .store
            .put(
                "clip.mp4",
                Box::new(std::io::Cursor::new(b"payload".to_vec())),
                DEFAULT_CONTENT_TYPE,
            )
            .await
            .unwrap();

        let app = build_router(Arc::clone(&state));
        let response = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/delete?video=clip.mp4")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(
            json["result"]
                .as_str()
                .unwrap()
                .contains("deleted successfully")
        );

        assert!(state.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn websocket_route_rejects_plain_get() {
        // without the upgrade headers the handshake must not succeed
        let app = build_router(test_app_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/websocket")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(response.status(), StatusCode::OK);
    }
}
