use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use camgate::api::GatewayServer;
use camgate::config::GatewayConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camgate=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = GatewayConfig::from_env_or_default();
    config.validate()?;
    tracing::info!(
        ports = ?config.ports,
        camera_prefix = %config.camera.ip_prefix,
        backend = %config.backend_url,
        "camgate starting"
    );

    let server = GatewayServer::new(config)?;
    let cancel_token = server.cancel_token();
    let transcoder = server.state().transcoder.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            cancel_token.cancel();
        }
    });

    server.run().await?;

    // Listeners are down; reap any transcoders still running.
    transcoder.close_all_sessions().await;

    Ok(())
}
