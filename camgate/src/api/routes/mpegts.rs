//! MPEG-TS relay endpoints backed by the transcoder supervisor.

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::config::CameraEndpoint;
use crate::relay::RelaySink;

/// `GET /mpegts/{id}` — stream one camera's transcoded transport stream.
pub(crate) async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    let Ok(camera_id) = id.parse::<u8>() else {
        return ApiError::bad_request("Invalid camera ID").into_response();
    };
    let Ok(credentials) = state.config.camera.credentials() else {
        return ApiError::internal("Camera password not configured").into_response();
    };
    let endpoint = CameraEndpoint::new(&state.config.camera, camera_id);

    let (sink, body) = RelaySink::channel(32);
    tokio::spawn(async move {
        state
            .transcoder
            .stream_session(&endpoint, &credentials, sink)
            .await;
    });

    (
        [
            (header::CONTENT_TYPE, "video/mp2t"),
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::PRAGMA, "no-cache"),
            (header::EXPIRES, "0"),
        ],
        body,
    )
        .into_response()
}

/// `GET|POST /cleanup_mpegts` — terminate every live transcoder session.
pub(crate) async fn cleanup(State(state): State<AppState>) -> Response {
    state.transcoder.close_all_sessions().await;
    "MPEG-TS streams cleaned up".into_response()
}
