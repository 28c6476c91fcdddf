//! MJPEG relay: digest handshake against the camera, then a verbatim
//! byte pump into the client response.

use std::io;
use std::time::Duration;

use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::TryStreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use digest_auth::{DigestChallenge, DigestResponse};

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::config::{CameraEndpoint, Credentials};
use crate::error::{Error, Result};
use crate::relay::{PumpMode, RelaySink, StreamPump};

/// Relay chunk size for MJPEG bytes.
const MJPEG_CHUNK_SIZE: usize = 1024;

/// Timeout for the unauthenticated challenge request.
const CHALLENGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Content type served when the camera omits one.
const FALLBACK_CONTENT_TYPE: &str = "multipart/x-mixed-replace";

/// Query parameters on `/video{id}`.
#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct StreamParams {
    pub format: Option<String>,
}

/// Serve one camera's MJPEG stream. The `format` query parameter is accepted
/// for compatibility but only MJPEG is ever served.
pub(crate) async fn stream(
    state: &AppState,
    camera_id: u8,
    params: StreamParams,
) -> std::result::Result<Response, ApiError> {
    if let Some(format) = params.format.as_deref()
        && !format.eq_ignore_ascii_case("mjpeg")
    {
        debug!(camera = camera_id, format, "unsupported format requested; serving mjpeg");
    }

    let credentials = state
        .config
        .camera
        .credentials()
        .map_err(|_| ApiError::internal("Camera password not configured"))?;
    let endpoint = CameraEndpoint::new(&state.config.camera, camera_id);

    let upstream = match open_camera_stream(
        &state.camera_client,
        &endpoint.base_url(),
        CameraEndpoint::MJPEG_PATH,
        &credentials,
    )
    .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(camera = camera_id, ip = %endpoint.ip, error = %e, "camera stream handshake failed");
            return Err(ApiError::bad_gateway(format!(
                "error contacting camera {} ({}): {e}",
                camera_id, endpoint.ip
            )));
        }
    };

    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or(FALLBACK_CONTENT_TYPE)
        .to_string();

    let (sink, body) = RelaySink::channel(32);
    tokio::spawn(async move {
        let reader = StreamReader::new(upstream.bytes_stream().map_err(io::Error::other));
        let end = StreamPump::new(PumpMode::Chunk {
            size: MJPEG_CHUNK_SIZE,
        })
        .run(reader, &sink)
        .await;
        debug!(camera = camera_id, ?end, "camera relay ended");
    });

    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// Perform the digest handshake and return the authenticated streaming
/// response.
///
/// The camera must answer the bare request with `401` and a `Digest`
/// challenge; any other answer is treated as a protocol failure. The
/// authenticated request is never retried.
pub(crate) async fn open_camera_stream(
    client: &reqwest::Client,
    base_url: &str,
    path: &str,
    credentials: &Credentials,
) -> Result<reqwest::Response> {
    let url = format!("{base_url}{path}");

    let challenge_response = client
        .get(&url)
        .timeout(CHALLENGE_TIMEOUT)
        .send()
        .await?;
    if challenge_response.status() != reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::NoDigestChallenge);
    }
    let challenge = challenge_response
        .headers()
        .get(header::WWW_AUTHENTICATE)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::NoDigestChallenge)
        .and_then(|header| Ok(DigestChallenge::parse(header)?))?;

    let authorization = DigestResponse::compute(
        &credentials.username,
        &credentials.password,
        "GET",
        path,
        &challenge,
    )
    .authorization();

    let response = client
        .get(&url)
        .header(header::AUTHORIZATION, authorization)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::UpstreamStatus {
            status: response.status(),
        });
    }
    Ok(response)
}
