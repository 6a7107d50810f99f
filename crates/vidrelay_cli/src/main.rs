mod chunks;
mod config;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vidrelay_backup::{BackupSettings, BackupWorker, SysinfoDiskProbe};
use vidrelay_contract::{BackupJobSpec, TransferDestination, TransferRequest, UploadDescriptor};
use vidrelay_negotiation::{ModeClient, ModeClientConfig, ModeNegotiator};
use vidrelay_receiver::{build_router, ReceiverState};
use vidrelay_storage::{BackupQueue, JobState, StorageConfig};
use vidrelay_transfer::{
    LogNotifier, TransferSettings, TransferWorkflow, UserNotifier, WebhookNotifier,
};

use crate::chunks::list_chunk_files;
use crate::config::RuntimeConfig;

#[derive(Debug, Parser)]
#[command(author, version, about = "Video transfer and backup orchestration daemon")]
struct Cli {
    #[arg(long, global = true, default_value = "config/node.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process queued backup jobs until interrupted.
    Worker,
    /// Submit a backup job.
    Enqueue(EnqueueArgs),
    #[command(subcommand)]
    Jobs(JobsCommand),
    #[command(subcommand)]
    Mode(ModeCommand),
    /// Push a staged chunk set to the receiving node.
    Transfer(TransferArgs),
    /// Serve the receiving side.
    Receive {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        storage_dir: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct EnqueueArgs {
    #[arg(long)]
    video_id: String,
    #[arg(long)]
    callback_url: String,
    /// Free space to require; defaults to `backup.required_free_bytes`.
    #[arg(long)]
    bytes: Option<u64>,
    #[command(flatten)]
    upload: UploadArgs,
}

#[derive(Debug, Args)]
struct UploadArgs {
    #[arg(long, requires_all = ["total_chunks", "filename", "chunk_directory"])]
    upload_id: Option<String>,
    #[arg(long)]
    total_chunks: Option<u32>,
    #[arg(long)]
    filename: Option<String>,
    #[arg(long)]
    chunk_directory: Option<String>,
}

impl UploadArgs {
    fn descriptor(self) -> Option<UploadDescriptor> {
        Some(UploadDescriptor {
            upload_id: self.upload_id?,
            total_chunks: self.total_chunks?,
            filename: self.filename?,
            chunk_directory: self.chunk_directory?,
        })
    }
}

#[derive(Debug, Subcommand)]
enum JobsCommand {
    /// List jobs, optionally in one state (waiting, active, completed, failed).
    List {
        #[arg(long)]
        state: Option<JobState>,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    Counts,
    /// Show one job with its attempt history.
    Show { job_id: String },
    RetryFailed,
    Retry { job_id: String },
}

#[derive(Debug, Subcommand)]
enum ModeCommand {
    Switch {
        #[arg(long)]
        upload_id: String,
        #[arg(long)]
        total_chunks: u32,
        #[arg(long)]
        filename: String,
        #[arg(long)]
        chunk_directory: String,
    },
    Status,
    Current,
}

#[derive(Debug, Args)]
struct TransferArgs {
    #[arg(long)]
    folder: PathBuf,
    #[arg(long)]
    video_id: String,
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    user_contact: String,
    /// Path reported to the metadata server.
    #[arg(long)]
    stored_path: String,
    /// Chunk file names in upload order; defaults to the folder's files
    /// sorted by name.
    #[arg(long = "chunk")]
    chunks: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = RuntimeConfig::load(&cli.config)?;
    match cli.command {
        Command::Worker => worker(config).await,
        Command::Enqueue(args) => enqueue(config, args).await,
        Command::Jobs(command) => jobs(config, command).await,
        Command::Mode(command) => mode(config, command).await,
        Command::Transfer(args) => transfer(config, args).await,
        Command::Receive { bind, storage_dir } => receive(config, bind, storage_dir).await,
    }
}

async fn open_queue(config: &RuntimeConfig) -> Result<BackupQueue> {
    BackupQueue::connect(&StorageConfig {
        sqlite_path: config.storage.sqlite_path.clone(),
    })
    .await
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")
}

fn mode_client(config: &RuntimeConfig, http: reqwest::Client) -> Result<Option<ModeClient>> {
    let Some(base_url) = config.nodes.laptop_url.clone() else {
        return Ok(None);
    };
    Ok(Some(ModeClient::new(
        http,
        ModeClientConfig {
            base_url,
            source: config.nodes.source.clone(),
            switch_timeout: Duration::from_millis(config.timeouts.mode_switch_ms),
            health_timeout: Duration::from_millis(config.timeouts.health_ms),
            policy: config.retry.policy()?,
        },
    )))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        cancel.cancel();
    });
    token
}

async fn worker(config: RuntimeConfig) -> Result<()> {
    let queue = open_queue(&config).await?;
    let http = http_client()?;
    let negotiator = mode_client(&config, http.clone())?
        .map(|client| Arc::new(client) as Arc<dyn ModeNegotiator>);
    if negotiator.is_none() {
        info!("no laptop_url configured: mode negotiation disabled");
    }

    let settings = BackupSettings {
        volume_path: config.backup.volume_path.clone(),
        receive_url: config.backup.receive_url.clone(),
        complete_url: config.backup.complete_url.clone(),
        notify_timeout: Duration::from_millis(config.timeouts.request_ms),
        concurrency: config.backup.concurrency,
        poll_interval: Duration::from_millis(config.backup.poll_interval_ms),
    };
    let worker = Arc::new(BackupWorker::new(
        queue,
        Arc::new(SysinfoDiskProbe),
        negotiator,
        http,
        settings,
    ));

    worker.run(shutdown_on_ctrl_c()).await
}

async fn enqueue(config: RuntimeConfig, args: EnqueueArgs) -> Result<()> {
    let queue = open_queue(&config).await?;
    let required_bytes = args.bytes.unwrap_or(config.backup.required_free_bytes);
    let mut spec = BackupJobSpec::new(
        args.video_id,
        required_bytes,
        args.callback_url,
        config.retry.policy()?,
    )
    .context("invalid backup job")?;
    if let Some(upload) = args.upload.descriptor() {
        spec = spec.with_upload(upload).context("invalid upload descriptor")?;
    }

    let job = queue.enqueue(&spec).await?;
    print_json(&job)
}

async fn jobs(config: RuntimeConfig, command: JobsCommand) -> Result<()> {
    let queue = open_queue(&config).await?;
    match command {
        JobsCommand::List { state, limit } => print_json(&queue.list_jobs(state, limit).await?),
        JobsCommand::Counts => print_json(&queue.count_by_state().await?),
        JobsCommand::Show { job_id } => {
            let job = queue
                .get_job(&job_id)
                .await?
                .ok_or_else(|| anyhow!("job {job_id} not found"))?;
            let attempts = queue.list_attempts(&job_id).await?;
            print_json(&serde_json::json!({ "job": job, "attempts": attempts }))
        }
        JobsCommand::RetryFailed => {
            let requeued = queue.retry_failed().await?;
            print_json(&serde_json::json!({ "requeued": requeued }))
        }
        JobsCommand::Retry { job_id } => {
            if !queue.retry_job(&job_id).await? {
                bail!("job {job_id} is not failed");
            }
            print_json(&serde_json::json!({ "requeued": 1, "jobId": job_id }))
        }
    }
}

async fn mode(config: RuntimeConfig, command: ModeCommand) -> Result<()> {
    let client = mode_client(&config, http_client()?)?
        .ok_or_else(|| anyhow!("nodes.laptop_url (or VIDRELAY_LAPTOP_URL) is required"))?;
    match command {
        ModeCommand::Switch {
            upload_id,
            total_chunks,
            filename,
            chunk_directory,
        } => {
            let outcome = client
                .switch_to_upload_mode(&upload_id, total_chunks, &filename, &chunk_directory)
                .await;
            print_json(&outcome)?;
            if !outcome.success {
                bail!("mode switch failed after {} attempts", outcome.attempts);
            }
            Ok(())
        }
        ModeCommand::Status => print_json(&client.check_status().await),
        ModeCommand::Current => print_json(&client.get_current_mode().await),
    }
}

async fn transfer(config: RuntimeConfig, args: TransferArgs) -> Result<()> {
    let chunks = if args.chunks.is_empty() {
        list_chunk_files(&args.folder)?
    } else {
        args.chunks
    };
    let destination = TransferDestination::new(
        config.nodes.receiver_url.clone(),
        config.nodes.metadata_url.clone(),
        args.stored_path,
    )
    .context("invalid destination")?;
    let request = TransferRequest::new(
        args.folder,
        args.user_contact,
        args.user_id,
        args.video_id,
        chunks,
        destination,
    )
    .context("invalid transfer request")?;

    let http = http_client()?;
    let request_timeout = Duration::from_millis(config.timeouts.request_ms);
    let notifier: Arc<dyn UserNotifier> = match &config.transfer.notify_url {
        Some(url) => Arc::new(WebhookNotifier::new(http.clone(), url, request_timeout)),
        None => Arc::new(LogNotifier),
    };
    let workflow = TransferWorkflow::new(
        http,
        notifier,
        TransferSettings {
            health_timeout: Duration::from_millis(config.timeouts.health_ms),
            request_timeout,
            chunk_buffer: config.transfer.chunk_size.max(1),
        },
    );

    let outcome = workflow.handle_transfer_workflow(&request).await;
    print_json(&outcome)?;
    if !outcome.is_complete() {
        bail!("transfer stopped: {}", outcome.message);
    }
    Ok(())
}

async fn receive(
    config: RuntimeConfig,
    bind: Option<String>,
    storage_dir: Option<PathBuf>,
) -> Result<()> {
    let bind = bind.unwrap_or(config.receiver.bind);
    let storage_dir = storage_dir.unwrap_or(config.receiver.storage_dir);
    std::fs::create_dir_all(&storage_dir)
        .with_context(|| format!("failed to create {}", storage_dir.display()))?;

    let socket: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid socket address {bind}"))?;
    let listener = tokio::net::TcpListener::bind(socket)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;

    let app = build_router(ReceiverState::new(storage_dir.clone()));
    let shutdown = shutdown_on_ctrl_c();
    info!(bind = %bind, storage_dir = %storage_dir.display(), "vidrelayd receiver listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("axum server failed")
}
