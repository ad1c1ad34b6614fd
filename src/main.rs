use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use device_pipeline::config::{Config, StorageBackend};
use device_pipeline::consumer::DeviceConsumer;
use device_pipeline::gateway::RegistrationGateway;
use device_pipeline::infra::HttpIngestionClient;
use device_pipeline::queue::{InMemoryQueue, MessageQueue, SqliteQueue};
use device_pipeline::registry::{DeviceRegistry, InMemoryRegistrationStore, SqliteRegistrationStore};
use device_pipeline::{logging, metrics, server};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "device_pipeline")]
#[command(about = "Asynchronous device registration pipeline")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file (default: device_pipeline.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registration API and in-process consumers
    Serve {
        /// Number of consumer workers to run
        #[arg(long, default_value_t = 1)]
        consumers: usize,
    },
    /// Run only the registration API
    Gateway,
    /// Run only a consumer worker (requires the sqlite back end)
    Consumer,
    /// Print the stored registration record for a device
    Status {
        device_id: String,
    },
}

/// Registry and queue for the configured back end.
fn open_backends(config: &Config) -> Result<(DeviceRegistry, Arc<dyn MessageQueue>)> {
    match config.storage.backend {
        StorageBackend::Memory => {
            let queue: Arc<dyn MessageQueue> = match config.queue.capacity {
                Some(cap) => Arc::new(InMemoryQueue::with_capacity(cap)),
                None => Arc::new(InMemoryQueue::new()),
            };
            Ok((
                DeviceRegistry::new(Arc::new(InMemoryRegistrationStore::new())),
                queue,
            ))
        }
        StorageBackend::Sqlite => {
            let root = &config.storage.data_root;
            let store = SqliteRegistrationStore::open_at_root(root)
                .with_context(|| format!("Failed to open registry under {}", root.display()))?;
            let queue = SqliteQueue::open_at_root(root, config.queue.capacity)
                .with_context(|| format!("Failed to open queue under {}", root.display()))?;
            Ok((DeviceRegistry::new(Arc::new(store)), Arc::new(queue)))
        }
    }
}

fn build_consumer(
    config: &Config,
    registry: DeviceRegistry,
    queue: Arc<dyn MessageQueue>,
) -> Result<DeviceConsumer> {
    let client = HttpIngestionClient::new(
        config.consumer.ingestion_endpoint.clone(),
        config.consumer.request_timeout(),
    )?;
    info!(endpoint = client.endpoint(), "Ingestion endpoint configured");
    Ok(DeviceConsumer::new(registry, queue, Arc::new(client)).with_config(&config.consumer))
}

fn server_addr(config: &Config) -> Result<SocketAddr> {
    format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "Invalid server address {}:{}",
                config.server.host, config.server.port
            )
        })
}

/// Flip the shutdown flag on Ctrl-C.
fn spawn_ctrl_c(tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = tx.send(true);
    });
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _log_guard = logging::init_logging();
    metrics::init_metrics();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match cli.command {
        Commands::Serve { consumers } => {
            let (registry, queue) = open_backends(&config)?;
            let mut workers = Vec::with_capacity(consumers.max(1));
            for _ in 0..consumers.max(1) {
                let worker = build_consumer(&config, registry.clone(), Arc::clone(&queue))?;
                let rx = shutdown_rx.clone();
                workers.push(tokio::spawn(async move { worker.run(rx).await }));
            }
            info!(consumers = workers.len(), "Consumers started");
            spawn_ctrl_c(shutdown_tx);

            let gateway = RegistrationGateway::new(registry, queue);
            server::start_server(gateway, server_addr(&config)?, wait_for_shutdown(shutdown_rx))
                .await?;
            for worker in workers {
                if let Err(e) = worker.await {
                    error!("Consumer task ended abnormally: {}", e);
                }
            }
        }
        Commands::Gateway => {
            if config.storage.backend == StorageBackend::Memory {
                warn!("Memory back end: registrations stay queued until a consumer runs in this process");
            }
            let (registry, queue) = open_backends(&config)?;
            spawn_ctrl_c(shutdown_tx);
            server::start_server(
                RegistrationGateway::new(registry, queue),
                server_addr(&config)?,
                wait_for_shutdown(shutdown_rx),
            )
            .await?;
        }
        Commands::Consumer => {
            if config.storage.backend != StorageBackend::Sqlite {
                bail!("the consumer subcommand needs storage.backend = \"sqlite\" to share state with a gateway");
            }
            let (registry, queue) = open_backends(&config)?;
            let consumer = build_consumer(&config, registry, queue)?;
            spawn_ctrl_c(shutdown_tx);
            consumer.run(shutdown_rx).await;
        }
        Commands::Status { device_id } => {
            let (registry, _) = open_backends(&config)?;
            let record = registry.get_registration(&device_id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
    }

    Ok(())
}
