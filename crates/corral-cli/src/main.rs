use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use corral_cli::client::{ListQuery, QueueClient};
use corral_cli::commands::{self, parse_kind, parse_status, EnqueueArgs, Output};
use corral_cli::default_socket_path;
use corral_core::{JobKind, JobStatus};

/// Operate the corral job queue.
#[derive(Debug, Parser)]
#[command(name = "corral", version, about)]
struct Cli {
    /// Path of the daemon's Unix socket.
    #[arg(long, global = true, default_value_os_t = default_socket_path())]
    socket: PathBuf,

    /// Per-request timeout in seconds (clamped to 1..=120).
    #[arg(long, global = true, default_value_t = 10)]
    timeout_secs: u64,

    /// Print raw response JSON instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    /// Log filter (e.g. `warn`, `corral_cli=debug`).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check that the daemon is up and answering.
    Health,

    /// Enqueue a job.
    Enqueue {
        /// Job kind (`cattle.spawn` or `cattle.reap`).
        #[arg(value_parser = parse_kind)]
        kind: JobKind,

        /// Kind-specific payload as a JSON document.
        payload: String,

        /// Principal to enqueue as.
        #[arg(long)]
        requester: String,

        /// Dedup key; re-running with the same key returns the same job.
        #[arg(long, default_value = "")]
        idempotency_key: String,

        /// Earliest run time in ms since epoch.
        #[arg(long)]
        run_at: Option<i64>,

        /// Priority; higher runs first.
        #[arg(long)]
        priority: Option<i64>,
    },

    /// List jobs, newest first.
    List {
        /// Only jobs enqueued by this principal.
        #[arg(long)]
        requester: Option<String>,

        /// Only jobs in these statuses (repeatable).
        #[arg(long, value_parser = parse_status)]
        status: Vec<JobStatus>,

        /// Only jobs of these kinds (repeatable).
        #[arg(long, value_parser = parse_kind)]
        kind: Vec<JobKind>,

        /// Maximum number of rows.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show one job with payload and result.
    Show {
        /// Job id.
        job_id: String,
    },

    /// Cancel a queued or running job.
    Cancel {
        /// Job id.
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let client = QueueClient::new(&cli.socket)
        .with_timeout(Duration::from_secs(cli.timeout_secs));
    let output = if cli.json { Output::Json } else { Output::Text };

    match cli.command {
        Command::Health => commands::health(&client, output).await,
        Command::Enqueue {
            kind,
            payload,
            requester,
            idempotency_key,
            run_at,
            priority,
        } => {
            commands::enqueue(
                &client,
                EnqueueArgs {
                    kind,
                    payload,
                    requester,
                    idempotency_key,
                    run_at,
                    priority,
                },
                output,
            )
            .await
        }
        Command::List {
            requester,
            status,
            kind,
            limit,
        } => {
            commands::list(
                &client,
                ListQuery {
                    requester,
                    statuses: status,
                    kinds: kind,
                    limit,
                },
                output,
            )
            .await
        }
        Command::Show { job_id } => commands::show(&client, &job_id, output).await,
        Command::Cancel { job_id } => commands::cancel(&client, &job_id, output).await,
    }
}
