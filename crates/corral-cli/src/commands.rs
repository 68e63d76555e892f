//! Subcommand implementations: build the request, call the daemon, render.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde_json::Value;

use corral_core::protocol::{EnqueueRequest, JobSummary, PROTOCOL_VERSION};
use corral_core::{JobKind, JobStatus};

use crate::client::{ListQuery, QueueClient};

/// Render mode shared by all subcommands.
#[derive(Debug, Clone, Copy)]
pub enum Output {
    /// Human-readable lines.
    Text,
    /// Raw response JSON, one document per invocation.
    Json,
}

fn emit_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_ms(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map_or_else(|| ms.to_string(), |t| t.to_rfc3339())
}

pub async fn health(client: &QueueClient, output: Output) -> anyhow::Result<()> {
    let resp = client.health().await?;
    match output {
        Output::Json => emit_json(&resp),
        Output::Text => {
            println!("daemon: {}", resp.status);
            Ok(())
        }
    }
}

/// Arguments for `corral enqueue`.
#[derive(Debug)]
pub struct EnqueueArgs {
    pub kind: JobKind,
    pub payload: String,
    pub requester: String,
    pub idempotency_key: String,
    pub run_at: Option<i64>,
    pub priority: Option<i64>,
}

pub async fn enqueue(
    client: &QueueClient,
    args: EnqueueArgs,
    output: Output,
) -> anyhow::Result<()> {
    let payload: Value =
        serde_json::from_str(&args.payload).context("payload must be valid JSON")?;
    let req = EnqueueRequest {
        protocol_version: PROTOCOL_VERSION,
        requester: args.requester,
        idempotency_key: args.idempotency_key,
        kind: args.kind,
        payload,
        run_at: args.run_at,
        priority: args.priority,
    };
    req.validate()?;

    let resp = client.enqueue(&req).await?;
    match output {
        Output::Json => emit_json(&resp),
        Output::Text => {
            if resp.deduped {
                println!("{} (already enqueued)", resp.job_id);
            } else {
                println!("{}", resp.job_id);
            }
            Ok(())
        }
    }
}

pub async fn list(client: &QueueClient, query: ListQuery, output: Output) -> anyhow::Result<()> {
    let resp = client.list(&query).await?;
    match output {
        Output::Json => emit_json(&resp),
        Output::Text => {
            if resp.jobs.is_empty() {
                println!("no jobs");
                return Ok(());
            }
            println!(
                "{:<38} {:<13} {:<9} {:<12} {:>4}  {}",
                "JOB", "KIND", "STATUS", "REQUESTER", "TRY", "UPDATED"
            );
            for job in &resp.jobs {
                print_row(job);
            }
            Ok(())
        }
    }
}

fn print_row(job: &JobSummary) {
    println!(
        "{:<38} {:<13} {:<9} {:<12} {:>1}/{}  {}",
        job.job_id,
        job.kind.as_str(),
        job.status.as_str(),
        job.requester,
        job.attempt,
        job.max_attempts,
        format_ms(job.updated_at),
    );
}

pub async fn show(client: &QueueClient, job_id: &str, output: Output) -> anyhow::Result<()> {
    let resp = client.show(job_id).await?;
    match output {
        Output::Json => emit_json(&resp),
        Output::Text => {
            let job = &resp.job;
            println!("job:        {}", job.job_id);
            println!("kind:       {}", job.kind);
            println!("status:     {}", job.status);
            println!("requester:  {}", job.requester);
            println!("priority:   {}", job.priority);
            println!("attempt:    {}/{}", job.attempt, job.max_attempts);
            println!("run at:     {}", format_ms(job.run_at));
            println!("created:    {}", format_ms(job.created_at));
            println!("updated:    {}", format_ms(job.updated_at));
            if let Some(worker) = &job.locked_by {
                println!("locked by:  {worker}");
            }
            if let Some(lease) = job.lease_until {
                println!("lease till: {}", format_ms(lease));
            }
            if let Some(err) = &job.last_error {
                println!("last error: {err}");
            }
            println!("payload:    {}", resp.payload);
            if let Some(result) = &resp.result {
                println!("result:     {result}");
            }
            Ok(())
        }
    }
}

pub async fn cancel(client: &QueueClient, job_id: &str, output: Output) -> anyhow::Result<()> {
    let resp = client.cancel(job_id).await?;
    match output {
        Output::Json => emit_json(&resp),
        Output::Text => {
            if resp.ok {
                println!("canceled {job_id}");
            } else {
                println!("{job_id} already finished; nothing to cancel");
            }
            Ok(())
        }
    }
}

/// Parses a job kind for clap.
pub fn parse_kind(raw: &str) -> Result<JobKind, String> {
    raw.parse().map_err(|err| format!("{err}"))
}

/// Parses a job status for clap.
pub fn parse_status(raw: &str) -> Result<JobStatus, String> {
    raw.parse().map_err(|err| format!("{err}"))
}
