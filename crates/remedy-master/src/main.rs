use anyhow::Context;
use clap::Parser;
use remedy_master::api::create_rest_api;
use remedy_master::config::LogFormat;
use remedy_master::{Master, MasterConfig};
use remedy_queue::RedisBackend;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "remedy-master")]
#[command(about = "Worker authentication and queue recovery service", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "master.yaml", env = "REMEDY_MASTER_CONFIG")]
    config: String,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = MasterConfig::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?;

    // Override with CLI args
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }

    tracing::info!(
        addr = %config.listen_addr(),
        access_keys = config.access_keys.len(),
        prefix = %config.queue.prefix,
        "Starting master"
    );

    let redis_url = config.grant.redis.connection_url();
    let backend = RedisBackend::connect(&redis_url)
        .await
        .context("connecting to redis")?;
    let master = Arc::new(Master::new(config.clone(), Arc::new(backend))?);

    let shutdown = CancellationToken::new();

    let background = {
        let master = master.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { master.background_tasks(shutdown).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
            shutdown.cancel();
        });
    }

    start_rest_api(master, &config.listen_addr(), shutdown.clone()).await?;

    shutdown.cancel();
    background.await?;
    tracing::info!("Master stopped");

    Ok(())
}

async fn start_rest_api(master: Arc<Master>, addr: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let app = create_rest_api(master);

    tracing::info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
