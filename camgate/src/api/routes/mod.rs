//! Gateway routes.
//!
//! The camera MJPEG endpoints live at `/video{id}` with the id glued to the
//! path segment, which the router's path grammar cannot express; those are
//! dispatched from the fallback handler, with everything else falling through
//! to static files.

pub mod mjpeg;
pub mod mpegts;
pub mod sse;

use axum::Router;
use axum::extract::{Query, Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower::ServiceExt;
use tower_http::services::ServeDir;

use crate::api::error::ApiError;
use crate::api::server::AppState;

/// Create the gateway router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/mpegts/{id}", get(mpegts::stream))
        .route("/cleanup_mpegts", get(mpegts::cleanup).post(mpegts::cleanup))
        .route("/api/v1/subscribe", get(sse::subscribe))
        .route("/api/v1/subscribe/{*rest}", get(sse::subscribe))
        .fallback(fallback)
        .with_state(state)
}

/// Dispatch `/video{id}` requests, serving everything else from the static
/// root.
async fn fallback(State(state): State<AppState>, request: Request) -> Response {
    if let Some(rest) = request.uri().path().strip_prefix("/video") {
        let Ok(camera_id) = rest.parse::<u8>() else {
            return ApiError::bad_request("Invalid camera ID").into_response();
        };
        let params = Query::<mjpeg::StreamParams>::try_from_uri(request.uri())
            .map(|Query(params)| params)
            .unwrap_or_default();
        return mjpeg::stream(&state, camera_id, params)
            .await
            .into_response();
    }

    match ServeDir::new(&state.config.static_root).oneshot(request).await {
        Ok(response) => response.into_response(),
        Err(infallible) => match infallible {},
    }
}
