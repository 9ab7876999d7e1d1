use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ringleader::api;
use ringleader::cli;
use ringleader::node::ClusterNode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args and env vars
    let args = cli::Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_filter().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = args.into_settings();
    settings.validate()?;
    let http_address = settings.http_address();

    info!(
        "Starting ringleader on {} (broadcast port {})",
        settings.local_address(),
        settings.broadcast_port
    );
    let node = ClusterNode::start(settings).await?;
    let local = node.local();
    let _leader_log = node.handle().on_leader_changed(move |leader| match leader {
        Some(leader) if leader == local => info!("[{}] This node is now the leader", local.address),
        Some(leader) => info!("[{}] Following leader {}", local.address, leader),
        None => warn!("[{}] No leader known", local.address),
    });

    match http_address {
        Some(address) => {
            info!("Status API listening on {}", address);
            axum::Server::try_bind(&address)?
                .serve(api::api(node.handle()).into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        None => shutdown_signal().await,
    }

    info!("Shutting down");
    node.shutdown().await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
    }
}
