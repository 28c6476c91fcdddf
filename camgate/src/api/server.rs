//! Gateway server setup: shared state, middleware, and the multi-port
//! listener fan-out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::{Method, header};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::routes;
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::transcoder::{FfmpegSpawner, TranscoderSupervisor};

/// Connect timeout towards the camera.
pub(crate) const CAMERA_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for the authenticated camera stream. Long enough for frame
/// gaps, short enough to notice a wedged camera.
pub(crate) const CAMERA_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Gateway configuration
    pub config: Arc<GatewayConfig>,
    /// Client for camera requests; cameras present self-signed certificates
    pub camera_client: reqwest::Client,
    /// Client for the event backend; no read timeout, SSE streams idle for long periods
    pub backend_client: reqwest::Client,
    /// Transcoder session registry
    pub transcoder: Arc<TranscoderSupervisor>,
}

impl AppState {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let transcoder = Arc::new(TranscoderSupervisor::new(Arc::new(FfmpegSpawner::new(
            &config.transcoder,
        ))));
        Self::with_transcoder(config, transcoder)
    }

    /// Build state around an existing supervisor (tests inject scripted ones).
    pub fn with_transcoder(
        config: GatewayConfig,
        transcoder: Arc<TranscoderSupervisor>,
    ) -> Result<Self> {
        let camera_client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .connect_timeout(CAMERA_CONNECT_TIMEOUT)
            .read_timeout(CAMERA_READ_TIMEOUT)
            .tcp_nodelay(true)
            .build()?;
        let backend_client = reqwest::Client::builder()
            .connect_timeout(CAMERA_CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            config: Arc::new(config),
            camera_client,
            backend_client,
            transcoder,
        })
    }
}

/// Gateway HTTP server: one listener per configured port, all sharing a
/// single router and state.
pub struct GatewayServer {
    state: AppState,
    cancel_token: CancellationToken,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Ok(Self {
            state: AppState::new(config)?,
            cancel_token: CancellationToken::new(),
        })
    }

    pub fn with_state(state: AppState) -> Self {
        Self {
            state,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Get the cancellation token for graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all middleware and routes.
    pub fn build_router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        routes::create_router(self.state.clone())
            .layer(cors)
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(
                        tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::DEBUG),
                    )
                    .on_response(
                        tower_http::trace::DefaultOnResponse::new().level(tracing::Level::DEBUG),
                    ),
            )
    }

    /// Bind every configured port and serve until cancelled.
    pub async fn run(&self) -> Result<()> {
        let router = self.build_router();
        let bind_address = self.state.config.bind_address.clone();

        let mut servers = JoinSet::new();
        for port in &self.state.config.ports {
            let addr: SocketAddr = format!("{bind_address}:{port}")
                .parse()
                .map_err(|e| Error::config(format!("invalid bind address: {e}")))?;
            let listener = TcpListener::bind(addr).await?;
            info!("gateway listening on http://{addr}");

            let router = router.clone();
            let cancel_token = self.cancel_token.clone();
            servers.spawn(async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        cancel_token.cancelled().await;
                    })
                    .await
            });
        }

        while let Some(result) = servers.join_next().await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "listener exited with error"),
                Err(e) => error!(error = %e, "listener task panicked"),
            }
        }

        info!("gateway shut down");
        Ok(())
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.camera.password = Some("secret".to_string());
        config
    }

    #[test]
    fn server_starts_with_live_cancel_token() {
        let server = GatewayServer::new(test_config()).unwrap();
        assert!(!server.cancel_token().is_cancelled());
        server.shutdown();
        assert!(server.cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn serves_on_every_configured_port() {
        let mut config = test_config();
        // Port 0 binds an ephemeral port; two entries mean two listeners.
        config.ports = vec![0, 0];
        let server = GatewayServer::new(config).unwrap();
        let cancel = server.cancel_token();

        let handle = tokio::spawn(async move { server.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
