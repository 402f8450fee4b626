use anyhow::{Context, Result};
use chrono::SecondsFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use verdict_core::{BusinessId, BusinessStats, ModerationPolicy, Plan, PlanTier, RecordId};
use verdict_server::clock::{Clock, SystemClock};
use verdict_server::jobs::JobState;
use verdict_server::reconciliation::{due_records, reconcile_due_records, SWEEP_BATCH_SIZE};
use verdict_server::state_machine::RecordStore;
use verdict_server::{AutoPublishScheduler, FeedbackService, SqliteRepository};

/// Verdict: operator tool for the feedback moderation engine
#[derive(Parser, Debug)]
#[command(name = "verdict")]
#[command(about = "Operator tool for the feedback moderation engine", long_about = None)]
struct Cli {
    /// Directory holding verdict-state.db
    #[arg(long, env = "STATE_DIR", default_value = ".", global = true)]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Auto-publish every pending feedback whose deadline has passed
    Sweep(SweepArgs),
    /// Mark pending feedback requests past their deadline as expired
    ExpireRequests,
    /// Show published-feedback statistics for a business
    Stats(StatsArgs),
    /// Assign a subscription plan to a business
    SetPlan(SetPlanArgs),
    /// List queued, running, done or buried jobs
    Jobs(JobsArgs),
    /// Re-arm the auto-publish job of a pending feedback record
    Rearm(RearmArgs),
}

#[derive(Parser, Debug)]
struct SweepArgs {
    /// List the overdue feedback without publishing anything
    #[arg(long)]
    dry_run: bool,

    /// Maximum number of records to process
    #[arg(long, default_value_t = SWEEP_BATCH_SIZE)]
    limit: usize,
}

#[derive(Parser, Debug)]
struct StatsArgs {
    business: String,
}

#[derive(Parser, Debug)]
struct SetPlanArgs {
    business: String,

    /// basic, standard or premium
    tier: PlanTier,

    /// Override the tier's default review limit
    #[arg(long)]
    limit: Option<u32>,
}

#[derive(Parser, Debug)]
struct JobsArgs {
    /// Only show jobs in this state (queued, running, done, buried)
    #[arg(long)]
    state: Option<JobState>,

    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(Parser, Debug)]
struct RearmArgs {
    record_id: RecordId,
}

fn open_repository(state_dir: &std::path::Path) -> Result<Arc<SqliteRepository>> {
    let db_path = state_dir.join("verdict-state.db");
    let repo = SqliteRepository::new(&db_path)
        .with_context(|| format!("Failed to open {}", db_path.display()))?;
    Ok(Arc::new(repo))
}

fn scheduler(repo: Arc<SqliteRepository>) -> AutoPublishScheduler {
    AutoPublishScheduler::new(RecordStore::new(repo), Arc::new(SystemClock))
}

async fn sweep(repo: Arc<SqliteRepository>, args: SweepArgs) -> Result<()> {
    let scheduler = scheduler(repo);
    let clock = scheduler.clock().clone();

    if args.dry_run {
        let due = due_records(&scheduler, clock.now(), args.limit).await?;
        if due.is_empty() {
            println!("No overdue feedback.");
        }
        for record in &due {
            println!(
                "would auto-publish {} ({}, due {})",
                record.id,
                record.business_id,
                record
                    .auto_publish_at
                    .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true))
                    .unwrap_or_default()
            );
        }
        return Ok(());
    }

    let report = reconcile_due_records(&scheduler, args.limit).await?;
    println!(
        "examined {}, auto-published {}, skipped {}, failed {}",
        report.examined, report.fired, report.skipped, report.failed
    );
    Ok(())
}

fn print_stats(business: &str, stats: &BusinessStats) -> Result<()> {
    let json = serde_json::json!({
        "business": business,
        "stats": stats,
    });
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

async fn rearm(repo: Arc<SqliteRepository>, args: RearmArgs) -> Result<()> {
    let scheduler = scheduler(repo);
    let record = scheduler
        .store()
        .get(args.record_id)
        .await?
        .with_context(|| format!("No feedback record {}", args.record_id))?;
    let Some(fire_at) = record.auto_publish_at else {
        anyhow::bail!("Feedback {} has no auto-publish deadline", record.id);
    };

    if scheduler.schedule(record.id, fire_at).await? {
        println!(
            "re-armed auto-publish of {} at {}",
            record.id,
            fire_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
    } else {
        println!("auto-publish of {} is already queued", record.id);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let repo = open_repository(&cli.state_dir)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let service = FeedbackService::new(
        repo.clone(),
        repo.clone(),
        clock,
        ModerationPolicy::default(),
    );

    match cli.command {
        Commands::Sweep(args) => sweep(repo, args).await?,
        Commands::Rearm(args) => rearm(repo, args).await?,
        Commands::ExpireRequests => {
            let expired = service.expire_requests().await?;
            println!("expired {} request(s)", expired);
        }
        Commands::Stats(args) => {
            let stats = service
                .business_stats(&BusinessId::from(args.business.as_str()))
                .await?;
            print_stats(&args.business, &stats)?;
        }
        Commands::SetPlan(args) => {
            let plan = match args.limit {
                Some(review_limit) => Plan {
                    tier: args.tier,
                    review_limit,
                },
                None => Plan::for_tier(args.tier),
            };
            service
                .set_plan(&BusinessId::from(args.business.as_str()), plan)
                .await?;
            println!(
                "{} is now on {} (limit {})",
                args.business, plan.tier, plan.review_limit
            );
        }
        Commands::Jobs(args) => {
            let repo = service.store().repository();
            let jobs = repo.list_jobs(args.state, args.limit).await?;
            let counts = repo.job_counts().await?;
            println!(
                "queued {}, running {}, done {}, buried {}",
                counts.queued, counts.running, counts.done, counts.buried
            );
            for job in jobs {
                println!(
                    "#{} {} {} run_at={} attempts={}{}",
                    job.id,
                    job.state.as_str(),
                    job.dedupe_key,
                    job.run_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    job.attempts,
                    job.last_error
                        .map(|e| format!(" last_error={}", e))
                        .unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
