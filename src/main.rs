use anyhow::Result;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chainhttp::config::Config;
use chainhttp::Server;

#[tokio::main]
async fn main() -> Result<()> {
    // Install default crypto provider for rustls
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config_path = std::env::args().nth(1);
    let config = Config::load_or_default(config_path.as_deref())?;

    let default_filter = if config.server.verbose {
        "chainhttp=debug"
    } else {
        "chainhttp=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server = Server::new(config.into_server_options());
    let addr = server.listen().await?;
    info!("chainhttp proxy ready on {}", addr);

    server.events().on_connection_closed(|event| {
        tracing::debug!(
            connection_id = event.connection_id,
            src_tx = event.stats.src_tx_bytes,
            src_rx = event.stats.src_rx_bytes,
            "connection closed"
        );
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.close(true).await?;
    Ok(())
}
