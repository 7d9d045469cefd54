use std::time::Duration;

use anyhow::bail;
use brand_audit_client::ClientContext;
use brand_audit_client::ProgressSnapshot;
use brand_audit_protocol::JobStatus;
use brand_audit_protocol::StatusResponse;
use clap::Parser;

use crate::DEFAULT_POLL_INTERVAL;
use crate::OutputArgs;

#[derive(Debug, Parser)]
pub struct AnalyzeArgs {
    /// Company to audit.
    #[arg(value_name = "COMPANY")]
    pub company: String,

    /// Follow progress by polling the status endpoint instead of the stream.
    #[arg(long = "poll")]
    pub poll: bool,

    /// Seconds between status polls.
    #[arg(long = "poll-interval", value_name = "SECS", default_value_t = DEFAULT_POLL_INTERVAL.as_secs())]
    pub poll_interval_secs: u64,

    #[command(flatten)]
    pub output: OutputArgs,
}

/// How a followed job ended.
#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    status: JobStatus,
    message: Option<String>,
}

pub(crate) async fn run(ctx: &ClientContext, args: &AnalyzeArgs) -> anyhow::Result<()> {
    let started = ctx.api().start_analysis(&args.company).await?;
    let job_id = started.analysis_id;
    eprintln!("analysis {job_id} started for {}", args.company.trim());

    let interval = Duration::from_secs(args.poll_interval_secs.max(1));
    let outcome = if args.poll {
        follow_by_polling(ctx, &job_id, interval).await?
    } else {
        follow_stream(ctx, &job_id, interval).await?
    };

    if outcome.status == JobStatus::Error {
        bail!(
            "analysis {job_id} failed: {}",
            outcome.message.as_deref().unwrap_or("no details reported")
        );
    }

    let results = ctx.api().results(&job_id).await?;
    args.output.print(&results)
}

/// Follows the job over the progress stream. If the stream gives up, the
/// remainder is followed by polling.
async fn follow_stream(
    ctx: &ClientContext,
    job_id: &str,
    interval: Duration,
) -> anyhow::Result<Outcome> {
    let tracker = ctx.track_job(job_id);
    let mut progress = tracker.watch();
    let mut connection = ctx.connection().watch();

    loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = progress.borrow_and_update().clone();
                print_snapshot(&snapshot);
                if snapshot.is_terminal() {
                    return Ok(Outcome {
                        status: snapshot.status,
                        message: snapshot.error_message,
                    });
                }
            }
            changed = connection.changed() => {
                if changed.is_err() || connection.borrow_and_update().failed {
                    break;
                }
            }
        }
    }

    tracing::warn!(job_id, "live progress unavailable, falling back to polling");
    drop(tracker);
    follow_by_polling(ctx, job_id, interval).await
}

async fn follow_by_polling(
    ctx: &ClientContext,
    job_id: &str,
    interval: Duration,
) -> anyhow::Result<Outcome> {
    let mut last_progress = None;
    let status = ctx
        .api()
        .wait_for_completion_with(job_id, interval, |status| {
            if last_progress != Some(status.progress) {
                last_progress = Some(status.progress);
                print_status(status);
            }
        })
        .await?;
    Ok(Outcome {
        status: status.status,
        message: status.message,
    })
}

fn print_snapshot(snapshot: &ProgressSnapshot) {
    eprintln!("{}", snapshot_line(snapshot));
}

fn snapshot_line(snapshot: &ProgressSnapshot) -> String {
    let stage_count = snapshot.stage_count.max(1);
    format!(
        "[stage {}/{}] {:>5.1}% {}",
        snapshot.current_stage_index.saturating_add(1).min(stage_count),
        stage_count,
        snapshot.overall_progress,
        snapshot.status
    )
}

fn print_status(status: &StatusResponse) {
    match &status.message {
        Some(message) => eprintln!("{:>5.1}% {} ({message})", status.progress, status.status),
        None => eprintln!("{:>5.1}% {}", status.progress, status.status),
    }
}
