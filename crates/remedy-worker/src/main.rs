use remedy_core::crypto::CredentialCipher;
use remedy_queue::{QueueConfig, RedisBackend, TaskQueueStore};
use remedy_worker::store::PgStore;
use remedy_worker::{
    logging, AuthClient, CredentialDecryptor, Executors, HostFactIngestor, HostResolver, LocalDecryptor,
    SystemRunner, Worker, WorkerConfig, WorkerDeps,
};

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "remedy-worker")]
#[command(about = "Distributed task worker", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Master base URL
    #[arg(long)]
    master_url: Option<String>,

    /// Number of concurrent tasks
    #[arg(long)]
    concurrency: Option<usize>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => WorkerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => WorkerConfig::default(),
    };
    config.apply_env()?;

    // Override with CLI args
    if let Some(url) = args.master_url {
        config.master.url = url;
    }
    if let Some(concurrency) = args.concurrency {
        config.worker.concurrency = concurrency;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }
    config.validate()?;

    let _log_guard = logging::init(&config.log);

    let client = Arc::new(AuthClient::from_config(&config)?);
    let grant = client
        .authenticate()
        .await
        .context("authentication with master failed")?;

    let store = Arc::new(
        PgStore::connect(&grant.database_config, config.worker.concurrency as u32 + 4)
            .await
            .context("connecting to database")?,
    );
    let backend = RedisBackend::connect(&grant.redis_config.connection_url())
        .await
        .context("connecting to redis")?;
    let queue = TaskQueueStore::new(Arc::new(backend), QueueConfig::with_prefix(&grant.redis_config.prefix));

    let decryptor: Arc<dyn CredentialDecryptor> = if config.credentials.encryption_key.is_empty() {
        tracing::info!("No local credential key, decrypting through master");
        client.clone()
    } else {
        Arc::new(LocalDecryptor::new(CredentialCipher::new(&config.credentials.encryption_key)))
    };

    let worker = Worker::new(
        config,
        WorkerDeps {
            queue,
            tasks: store.clone(),
            resolver: HostResolver::new(store.clone(), decryptor),
            executors: Executors::new(Arc::new(SystemRunner)),
            ingestor: HostFactIngestor::new(store.clone()),
            registry: store,
            control_plane: Some(client),
        },
    );
    worker.register().await.context("registering worker")?;

    // Handle shutdown signals
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal");
            shutdown.cancel();
        });
    }

    worker.run(shutdown).await?;

    Ok(())
}
