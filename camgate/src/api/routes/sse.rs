//! Server-sent-events relay towards the event backend.
//!
//! The response is committed before the backend connection resolves, so a
//! slow or dead backend still yields a well-formed event stream. Failures
//! after commit are reported in-band as SSE comments.

use std::io;
use std::time::Duration;

use axum::extract::{OriginalUri, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::TryStreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::api::server::AppState;
use crate::relay::{KeepAlive, PumpMode, RelaySink, StreamPump};

/// Idle threshold before a keep-alive comment is injected.
const KEEPALIVE_IDLE: Duration = Duration::from_secs(15);

const KEEPALIVE_FRAME: &[u8] = b": keep-alive\n\n";
const CONNECTED_FRAME: &[u8] = b": connected\n\n";

/// `GET /api/v1/subscribe{,/*rest}` — relay the backend's event stream,
/// forwarding the original path and query.
pub(crate) async fn subscribe(
    State(state): State<AppState>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(uri.path());
    let target = format!(
        "{}{}",
        state.config.backend_url.trim_end_matches('/'),
        path_and_query
    );

    let (sink, body) = RelaySink::channel(32);
    tokio::spawn(relay_events(state.backend_client.clone(), target, sink));

    (
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache, no-transform"),
            (header::HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        body,
    )
        .into_response()
}

async fn relay_events(client: reqwest::Client, target: String, sink: RelaySink) {
    if sink
        .send(Bytes::from_static(CONNECTED_FRAME))
        .await
        .is_err()
    {
        return;
    }

    let upstream = client
        .get(&target)
        .header(header::ACCEPT, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .send()
        .await
        .and_then(|response| response.error_for_status());
    let upstream = match upstream {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(target, error = %e, "event backend connection failed");
            let _ = sink
                .send(Bytes::from(format!(
                    ": error connecting to event server: {e}\n\n"
                )))
                .await;
            return;
        }
    };

    debug!(target, "event relay connected");
    let reader = StreamReader::new(upstream.bytes_stream().map_err(io::Error::other));
    let end = StreamPump::new(PumpMode::Line)
        .with_keepalive(KeepAlive {
            idle: KEEPALIVE_IDLE,
            frame: Bytes::from_static(KEEPALIVE_FRAME),
        })
        .run(reader, &sink)
        .await;
    debug!(target, ?end, "event relay ended");
}
