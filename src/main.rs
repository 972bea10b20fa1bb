use clap::{Parser, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use pln_cluster::client;
use pln_cluster::config::{ManagerConfig, TransportSettings};
use pln_cluster::manager::{run_manager, StartupMode};
use pln_cluster::shutdown::install_shutdown_handler;
use pln_cluster::slavedriver::SlaveDriver;
use pln_cluster::worker::{run_worker, CommandProcessor, WorkerEndpoints};

#[derive(Parser, Debug)]
#[command(name = "pln-cluster")]
#[command(version)]
#[command(about = "Control plane of a distributed job-processing cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the Manager
    Manager(ManagerArgs),

    /// Start a SlaveDriver on this node
    Slavedriver(SlaveDriverArgs),

    /// Run a single worker (normally started by a SlaveDriver)
    Worker(WorkerArgs),

    /// Submit a job or a batch of jobs
    Submit {
        /// Job description (JSON object) or batch (JSON array)
        json: String,

        #[command(flatten)]
        client: ClientArgs,
    },

    /// Show cluster and job status
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

#[derive(Parser, Debug)]
struct ManagerArgs {
    /// Path to the configuration file
    #[arg(long, short = 'c')]
    config: PathBuf,

    /// Skip provisioning; the cluster topology is managed externally
    #[arg(long)]
    nosetup: bool,
}

#[derive(Parser, Debug)]
struct SlaveDriverArgs {
    /// Manager configuration endpoint (e.g. tcp://10.0.0.1:5559)
    manager: String,

    /// Node identity sent to the Manager (default: local address)
    #[arg(long)]
    name: Option<String>,

    #[command(flatten)]
    transport: TransportArgs,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Manager streaming endpoint
    #[arg(long)]
    streamer: String,

    /// Manager sink endpoint
    #[arg(long)]
    sink: String,

    /// Shell command run for every job
    #[arg(long, default_value = "cat")]
    command: String,

    /// Node identity attached to results
    #[arg(long)]
    node: Option<String>,

    #[command(flatten)]
    transport: TransportArgs,
}

/// Socket settings; a SlaveDriver passes its node's `[zeromq]` values.
#[derive(Parser, Debug)]
struct TransportArgs {
    /// Largest accepted message frame in bytes
    #[arg(long, default_value_t = 8 * 1024 * 1024)]
    max_frame_bytes: usize,

    #[arg(long, default_value_t = 5000)]
    connect_timeout_ms: u64,

    #[arg(long, default_value_t = 5000)]
    request_timeout_ms: u64,
}

impl TransportArgs {
    fn settings(&self) -> Result<TransportSettings, Box<dyn std::error::Error>> {
        if self.max_frame_bytes == 0 || self.connect_timeout_ms == 0 || self.request_timeout_ms == 0 {
            return Err("transport limits and timeouts must be positive".into());
        }
        Ok(TransportSettings {
            max_frame_bytes: self.max_frame_bytes,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        })
    }
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Manager endpoint (intake port for submit, status port for status)
    #[arg(long, short = 'a')]
    addr: Option<String>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    #[command(flatten)]
    transport: TransportArgs,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

async fn run_manager_command(args: ManagerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ManagerConfig::load(&args.config)?;
    let mode = if args.nosetup {
        StartupMode::NoSetup
    } else {
        StartupMode::Bootstrap
    };

    tracing::info!(
        config = %args.config.display(),
        mode = ?mode,
        nodes = ?config.document.node_ids(),
        "Starting manager"
    );

    let token = install_shutdown_handler();
    run_manager(config, mode, token).await?;
    Ok(())
}

async fn run_slavedriver_command(args: SlaveDriverArgs) -> Result<(), Box<dyn std::error::Error>> {
    let token = install_shutdown_handler();
    let transport = args.transport.settings()?;
    let driver = SlaveDriver::fetch(&args.manager, args.name, transport).await?;
    let spawner = Arc::new(driver.process_spawner()?);
    driver.run(spawner, token).await?;
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let transport = args.transport.settings()?;
    let token = install_shutdown_handler();
    let endpoints = WorkerEndpoints {
        streamer: args.streamer,
        sink: args.sink,
    };
    let processor = Arc::new(CommandProcessor::new(args.command));
    run_worker(
        &endpoints,
        processor,
        args.node,
        transport,
        token,
    )
    .await?;
    Ok(())
}

async fn handle_submit(json: String, args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let jobs: Value = serde_json::from_str(&json)?;
    let addr = args.addr.unwrap_or_else(|| "127.0.0.1:5557".to_string());
    let ack = client::submit(&addr, &jobs, args.transport.settings()?).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&ack)?),
        OutputFormat::Table => {
            if ack.is_error() {
                eprintln!(
                    "Error: submission rejected: {}",
                    ack.reason.as_deref().unwrap_or("unknown reason")
                );
                std::process::exit(1);
            }
            println!("{}", ack.ans);
        }
    }
    Ok(())
}

async fn handle_status(args: ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let addr = args.addr.unwrap_or_else(|| "127.0.0.1:5558".to_string());
    let status = client::status(&addr, args.transport.settings()?).await?;

    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => {
            println!("Cluster Status");
            println!("{}", "=".repeat(40));
            if status.cluster.is_empty() {
                println!("No nodes registered.");
            } else {
                println!(
                    "{:<24} {:<12} {:<6} {:<9} LAST HEARTBEAT",
                    "NODE", "STATUS", "LOAD", "CAPACITY"
                );
                println!("{}", "-".repeat(78));
                for (id, node) in &status.cluster {
                    println!(
                        "{:<24} {:<12} {:<6} {:<9} {}",
                        id,
                        node.status.to_string(),
                        node.load,
                        node.capacity,
                        node.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
                    );
                }
            }
            println!();
            println!(
                "Jobs: {} queued, {} dispatched, {} done, {} failed",
                status.jobs.queued, status.jobs.dispatched, status.jobs.done, status.jobs.failed
            );
            if !status.active_jobs.is_empty() {
                let ids: Vec<String> = status.active_jobs.iter().map(|id| id.to_string()).collect();
                println!("Active: {}", ids.join(", "));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Manager(manager_args) => {
            init_logging();
            run_manager_command(manager_args).await?;
        }
        Commands::Slavedriver(driver_args) => {
            init_logging();
            run_slavedriver_command(driver_args).await?;
        }
        Commands::Worker(worker_args) => {
            init_logging();
            run_worker_command(worker_args).await?;
        }
        Commands::Submit { json, client } => {
            handle_submit(json, client).await?;
        }
        Commands::Status { client } => {
            handle_status(client).await?;
        }
    }

    Ok(())
}
