//! Command-line utility for managing a running courier daemon
//!
//! Everything goes through the daemon's control socket:
//! - Queue management (list, view, enqueue, retry, forward, cancel)
//! - Triggering a dispatch cycle
//! - Statistics, system status and health checks

#![allow(clippy::too_many_lines)]

use std::{
    fmt::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use courier_common::Attachment;
use courier_control::{
    ControlClient, DEFAULT_CONTROL_SOCKET, QueueCommand, Request, Response, ResponseData,
    ResponsePayload, SystemCommand,
};
use courier_queue::{BatchReport, JobId, JobStats, JobStatus, NewJob, RecipientRef, TemplateData};

/// A dispatch cycle may wait on several sends, each bounded by the daemon's
/// send timeout.
const PROCESS_NOW_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Command-line utility for managing the courier daemon
#[derive(Parser, Debug)]
#[command(name = "courierctl")]
#[command(about = "Manage the courier mail queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the control socket
    #[arg(short = 'c', long, default_value = DEFAULT_CONTROL_SOCKET)]
    control_socket: PathBuf,

    /// Seconds to wait for the daemon to answer
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue management commands
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// System status and health
    System {
        #[command(subcommand)]
        action: SystemAction,
    },
}

#[derive(Subcommand, Debug)]
enum SystemAction {
    /// Check if the daemon is responding
    Ping,
    /// Get system status and statistics
    Status,
}

#[derive(Subcommand, Debug)]
enum QueueAction {
    /// List jobs in creation order
    List {
        /// Only jobs with this status
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// View everything recorded about a job
    View { id: JobId },
    /// Queue a new email
    Enqueue(Box<EnqueueArgs>),
    /// Queue a sent, failed or cancelled job again
    Retry { id: JobId },
    /// Retry several jobs at once
    BulkRetry {
        #[arg(required = true)]
        ids: Vec<JobId>,
    },
    /// Send a copy of a job to a different recipient
    Forward {
        id: JobId,
        /// New recipient address
        email: String,
        /// New recipient display name
        #[arg(long)]
        name: Option<String>,
    },
    /// Cancel a pending job
    Cancel { id: JobId },
    /// Show queue statistics
    Stats {
        /// Watch mode - continuously update statistics
        #[arg(long)]
        watch: bool,

        /// Update interval in seconds (for watch mode)
        #[arg(long, default_value = "2")]
        interval: u64,
    },
    /// Run a dispatch cycle now
    ProcessNow,
}

#[derive(Args, Debug)]
struct EnqueueArgs {
    /// Recipient address
    #[arg(long)]
    to: String,

    /// Recipient display name
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    subject: String,

    /// HTML body
    #[arg(long, conflicts_with = "html_file")]
    html: Option<String>,

    /// Read the HTML body from a file
    #[arg(long)]
    html_file: Option<PathBuf>,

    /// Plain-text body
    #[arg(long, conflicts_with = "text_file")]
    text: Option<String>,

    /// Read the plain-text body from a file
    #[arg(long)]
    text_file: Option<PathBuf>,

    /// Higher is sent first
    #[arg(long, default_value = "0", allow_hyphen_values = true)]
    priority: i32,

    #[arg(long, default_value = "3")]
    max_attempts: u32,

    /// Template key recorded on the job
    #[arg(long)]
    template: Option<String>,

    /// `key=value` substituted for `{{key}}` in the subject and bodies
    #[arg(long = "data", value_parser = parse_key_value)]
    data: Vec<(String, String)>,

    /// `filename=url` of a linked file
    #[arg(long = "attachment", value_parser = parse_key_value)]
    attachments: Vec<(String, String)>,

    /// Entity the address is looked up from at send time, as `kind:id`
    #[arg(long = "ref")]
    recipient_ref: Option<RecipientRef>,

    /// Seconds to wait before the first attempt
    #[arg(long)]
    delay: Option<u64>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected 'key=value', got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn read_body(inline: Option<String>, file: Option<&Path>) -> anyhow::Result<Option<String>> {
    match (inline, file) {
        (Some(body), _) => Ok(Some(body)),
        (None, Some(path)) => std::fs::read_to_string(path)
            .map(Some)
            .with_context(|| format!("Failed to read {}", path.display())),
        (None, None) => Ok(None),
    }
}

impl EnqueueArgs {
    /// The job to submit, with `--data` already rendered into it.
    fn into_job(self) -> anyhow::Result<NewJob> {
        let mut job = NewJob::new(self.to, self.subject)
            .priority(self.priority)
            .max_attempts(self.max_attempts);

        job.recipient_name = self.name;
        job.html_body = read_body(self.html, self.html_file.as_deref())?;
        job.text_body = read_body(self.text, self.text_file.as_deref())?;
        job.recipient_ref = self.recipient_ref;
        job.template_key = self.template;
        job.template_data = self.data.into_iter().collect::<TemplateData>();
        job.attachments = self
            .attachments
            .into_iter()
            .map(|(filename, url)| Attachment::new(url, filename))
            .collect();

        if let Some(delay) = self.delay {
            let delay = chrono::TimeDelta::try_seconds(i64::try_from(delay)?)
                .context("--delay is out of range")?;
            job = job.scheduled_at(Utc::now() + delay);
        }

        Ok(job.render_template())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let client = ControlClient::new(&cli.control_socket)
        .with_timeout(Duration::from_secs(cli.timeout));
    client.check_socket_exists()?;

    match cli.command {
        Commands::Queue { action } => handle_queue_command(&client, action).await,
        Commands::System { action } => handle_system_command(&client, action).await,
    }
}

/// The data carried by a successful response.
fn into_data(response: Response) -> anyhow::Result<ResponseData> {
    match response.payload {
        ResponsePayload::Data(data) => Ok(*data),
        ResponsePayload::Ok => anyhow::bail!("Daemon returned no data"),
        ResponsePayload::Error(message) => anyhow::bail!(message),
    }
}

fn unexpected(data: &ResponseData) -> anyhow::Error {
    anyhow::anyhow!("Unexpected response from daemon: {data:?}")
}

async fn handle_queue_command(client: &ControlClient, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::List { status } => {
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::List { status }))
                    .await?,
            )?;
            let jobs = match data {
                ResponseData::Jobs(jobs) => jobs,
                other => return Err(unexpected(&other)),
            };

            if jobs.is_empty() {
                println!("No jobs");
                return Ok(());
            }

            for job in &jobs {
                println!("{job}");
            }
            println!("\nTotal: {} job(s)", jobs.len());
        }

        QueueAction::View { id } => {
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::View { id }))
                    .await?,
            )?;
            let details = match data {
                ResponseData::Job(details) => details,
                other => return Err(unexpected(&other)),
            };
            println!("{details}");
        }

        QueueAction::Enqueue(args) => {
            let job = args.into_job()?;
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::Enqueue(Box::new(job))))
                    .await?,
            )?;
            let id = match data {
                ResponseData::Created(id) => id,
                other => return Err(unexpected(&other)),
            };
            println!("✓ Enqueued {id}");
        }

        QueueAction::Retry { id } => {
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::Retry { id }))
                    .await?,
            )?;
            match data {
                ResponseData::Applied(true) => println!("✓ Job {id} queued for retry"),
                ResponseData::Applied(false) => {
                    println!("Job {id} is pending or being sent; nothing to retry");
                }
                other => return Err(unexpected(&other)),
            }
        }

        QueueAction::BulkRetry { ids } => {
            let total = ids.len();
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::BulkRetry { ids }))
                    .await?,
            )?;
            let count = match data {
                ResponseData::Count(count) => count,
                other => return Err(unexpected(&other)),
            };
            println!("✓ {count} of {total} job(s) queued for retry");
        }

        QueueAction::Forward { id, email, name } => {
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::Forward { id, email, name }))
                    .await?,
            )?;
            let new_id = match data {
                ResponseData::Created(new_id) => new_id,
                other => return Err(unexpected(&other)),
            };
            println!("✓ Job {id} forwarded as {new_id}");
        }

        QueueAction::Cancel { id } => {
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::Cancel { id }))
                    .await?,
            )?;
            match data {
                ResponseData::Applied(true) => println!("✓ Job {id} cancelled"),
                ResponseData::Applied(false) => println!("Job {id} is not pending; not cancelled"),
                other => return Err(unexpected(&other)),
            }
        }

        QueueAction::Stats { watch, interval } => {
            if watch {
                loop {
                    // Clear screen
                    print!("\x1B[2J\x1B[1;1H");

                    display_stats(client).await?;

                    println!("\nPress Ctrl+C to exit");

                    tokio::time::sleep(Duration::from_secs(interval)).await;
                }
            }

            display_stats(client).await?;
        }

        QueueAction::ProcessNow => {
            let client = client.clone().with_timeout(PROCESS_NOW_TIMEOUT);
            let data = into_data(
                client
                    .send_request(Request::queue(QueueCommand::ProcessNow))
                    .await?,
            )?;
            let report = match data {
                ResponseData::Batch(report) => report,
                other => return Err(unexpected(&other)),
            };
            println!("{}", format_report(&report));
        }
    }

    Ok(())
}

async fn display_stats(client: &ControlClient) -> anyhow::Result<()> {
    let data = into_data(client.send_request(Request::queue(QueueCommand::Stats)).await?)?;
    let stats = match data {
        ResponseData::Stats(stats) => stats,
        other => return Err(unexpected(&other)),
    };

    println!("=== Courier Queue Statistics ===\n");
    print!("{}", format_stats(&stats));
    Ok(())
}

fn format_stats(stats: &JobStats) -> String {
    let rows = [
        (JobStatus::Pending, stats.pending),
        (JobStatus::Sending, stats.sending),
        (JobStatus::Sent, stats.sent),
        (JobStatus::Failed, stats.failed),
        (JobStatus::Cancelled, stats.cancelled),
    ];

    let mut out = String::new();
    for (status, count) in rows {
        let _ = writeln!(out, "  {status:<10} {count:>6}");
    }
    let _ = writeln!(out, "  {:<10} {:>6}", "total", stats.total());
    out
}

fn format_report(report: &BatchReport) -> String {
    format!(
        "Processed {} job(s): {} sent, {} retried, {} failed, {} skipped",
        report.claimed, report.sent, report.retried, report.failed, report.skipped
    )
}

async fn handle_system_command(client: &ControlClient, action: SystemAction) -> anyhow::Result<()> {
    match action {
        SystemAction::Ping => {
            client
                .send_request(Request::system(SystemCommand::Ping))
                .await?;
            println!("✓ courier is responding");
        }

        SystemAction::Status => {
            let data = into_data(
                client
                    .send_request(Request::system(SystemCommand::Status))
                    .await?,
            )?;
            let status = match data {
                ResponseData::Status(status) => status,
                other => return Err(unexpected(&other)),
            };

            println!("=== Courier Status ===\n");
            println!("Version:    {}", status.version);
            println!("Uptime:     {}", format_uptime(status.uptime_secs));
            println!("Queue size: {}\n", status.queue_size);
            print!("{}", format_stats(&status.stats));
        }
    }

    Ok(())
}

fn format_uptime(secs: u64) -> String {
    let days = secs / 86400;
    let hours = (secs % 86400) / 3600;
    let mins = (secs % 3600) / 60;

    if days > 0 {
        format!("{days}d {hours}h {mins}m")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else if mins > 0 {
        format!("{mins}m {}s", secs % 60)
    } else {
        format!("{secs}s")
    }
}
