//! AMQP worker command line tool
//!
//! Put, get and consume JSON tasks through a managed, self-reconnecting
//! broker connection.

use amqp_worker::config::WorkerConfig;
use amqp_worker::observability::init_default_logging;
use amqp_worker::{ConsumeOptions, GetOptions, HandlerError, QueueError, Worker, WorkerPool};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

/// Resilient AMQP worker
#[derive(Parser)]
#[command(name = "amqp-worker")]
#[command(about = "Put, get and consume JSON tasks on an AMQP broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, overrides the configuration file
    #[arg(short, long, env = "AMQP_URL")]
    url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enqueue one JSON task
    Put {
        #[arg(short, long)]
        queue: Option<String>,
        /// Task as a JSON document
        #[arg(short, long)]
        task: String,
    },
    /// Fetch and print one task
    Get {
        #[arg(short, long)]
        queue: Option<String>,
        /// Do not acknowledge; the broker drops the message on delivery
        #[arg(long)]
        no_ack: bool,
    },
    /// Print tasks as they arrive until Ctrl-C
    Consume {
        #[arg(short, long)]
        queue: Option<String>,
        #[arg(long)]
        no_ack: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_default_logging() {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run_command(config, cli.command).await {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<WorkerConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            WorkerConfig::load_from_file(path)?
        }
        None => {
            let default_path = PathBuf::from("amqp-worker.toml");
            if default_path.exists() {
                info!("Loading configuration from: {}", default_path.display());
                WorkerConfig::load_from_file(&default_path)?
            } else if let Some(url) = &cli.url {
                WorkerConfig::with_url(url.clone())
            } else {
                return Err("no configuration: pass --config, --url or set AMQP_URL".into());
            }
        }
    };

    if let Some(url) = &cli.url {
        config.broker.url = Some(url.clone());
    }
    config.validate()?;
    Ok(config)
}

fn queue_name(config: &WorkerConfig, queue: Option<String>) -> Result<String, String> {
    queue
        .or_else(|| config.worker.default_queue.clone())
        .ok_or_else(|| "no queue given and [worker] default_queue is unset".to_string())
}

async fn run_command(config: WorkerConfig, command: Commands) -> CliResult {
    let pool = WorkerPool::amqp(config.reconnect_config());

    let result = execute(&pool, &config, command).await;

    if let Err(e) = pool.kill_all().await {
        for (endpoint, failure) in &e.failures {
            warn!(endpoint = %endpoint, "Teardown failed: {}", failure);
        }
    }
    result
}

/// Pooled worker for the configured broker; connects on first use
async fn connect_worker(
    pool: &WorkerPool,
    config: &WorkerConfig,
) -> Result<Arc<Worker>, Box<dyn std::error::Error>> {
    let endpoint = config.broker_url()?;
    Ok(pool.get_client(&endpoint).await?)
}

async fn execute(
    pool: &WorkerPool,
    config: &WorkerConfig,
    command: Commands,
) -> CliResult {
    match command {
        Commands::Put { queue, task } => {
            let worker = connect_worker(pool, config).await?;
            let queue = queue_name(config, queue)?;
            let task: serde_json::Value = serde_json::from_str(&task)?;
            worker.put(&queue, &task).await?;
            info!(queue = %queue, "Task enqueued");
        }
        Commands::Get { queue, no_ack } => {
            let worker = connect_worker(pool, config).await?;
            let queue = queue_name(config, queue)?;
            let options = GetOptions {
                no_ack: no_ack || config.worker.no_ack,
            };
            match worker.get::<serde_json::Value>(&queue, options).await {
                Ok(delivery) => {
                    println!("{}", serde_json::to_string_pretty(&delivery.task)?);
                    delivery.ack().await?;
                }
                Err(QueueError::EmptyQueue { .. }) => {
                    info!(queue = %queue, "Queue is empty");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Consume { queue, no_ack } => {
            let worker = connect_worker(pool, config).await?;
            let queue = queue_name(config, queue)?;
            let options = ConsumeOptions {
                no_ack: no_ack || config.worker.no_ack,
            };
            info!(queue = %queue, "Consuming, press Ctrl-C to stop");

            let consumer = worker.consume(
                &queue,
                |task: serde_json::Value| async move {
                    println!("{}", serde_json::to_string(&task).map_err(HandlerError::from)?);
                    Ok::<(), HandlerError>(())
                },
                |e| warn!("Task failed: {}", e),
                options,
            );

            tokio::select! {
                result = consumer => result?,
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl-C, shutting down gracefully...");
                }
            }
        }
        Commands::Config { show } => handle_config_command(config, show)?,
    }
    Ok(())
}

fn handle_config_command(config: &WorkerConfig, show: bool) -> CliResult {
    if show {
        println!("Current configuration:");
        println!("{}", toml::to_string_pretty(config)?);
    }

    info!("Configuration validation complete");
    Ok(())
}
