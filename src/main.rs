use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;

use stashd::catalog::{self, import::CatalogFile};
use stashd::config::StashConfig;
use stashd::credentials::ConfigKind;
use stashd::engine::Engine;
use stashd::queue::JobQueue;
use stashd::scheduler::Scheduler;
use stashd::storage;
use stashd::tracker::{self, RunStatus, Trigger};

#[derive(Parser)]
#[command(
    name = "stashd",
    about = "Crash-safe backup execution engine for databases and object storage",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, env = "STASHD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (scheduler + job queue)
    Serve,

    /// Import jobs, destinations and credential providers from a TOML file
    Import {
        /// Catalog file
        file: PathBuf,
    },

    /// Run a job now and wait for it to finish
    Run {
        /// Job id
        job_id: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one run, or the most recent runs
    Status {
        /// Run id; omit to list recent runs
        run_id: Option<String>,

        /// Only runs of this job
        #[arg(long)]
        job: Option<i64>,

        /// Number of runs to list
        #[arg(long, default_value = "20")]
        limit: usize,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Aggregate run statistics for a job
    Stats {
        /// Job id
        job_id: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Fail runs orphaned by a crashed process
    Cleanup,

    /// Show a job with its secrets masked
    ShowJob {
        /// Job id
        job_id: i64,
    },

    /// Inspect schedules
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all scheduled jobs
    List,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

fn init_tracing(config: &StashConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_pool(config: &StashConfig) -> Result<storage::Pool> {
    storage::open_pool(&config.storage.db_path)
        .with_context(|| format!("failed to open database {}", config.storage.db_path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = StashConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting stashd daemon");
            stashd::serve(config).await?;
        }
        Commands::Import { file } => {
            let catalog_file = CatalogFile::load(&file)?;
            let engine = Engine::open(config)?;
            let summary = catalog_file.apply(&engine.pool, &engine.credentials)?;
            println!(
                "Imported {} credential provider(s), {} destination(s), {} job(s).",
                summary.providers, summary.destinations, summary.jobs
            );
        }
        Commands::Run { job_id, json } => {
            let engine = Engine::open(config)?;
            let queue = JobQueue::start(engine);
            let result = queue.enqueue_and_wait(job_id, Trigger::Manual).await;
            queue.shutdown().await;
            let outcome = result?;

            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("Run {} : {}", outcome.run_id, outcome.status);
                println!("Attempts : {}", outcome.attempts);
                if let Some(size) = outcome.size_bytes {
                    println!("Size     : {} bytes", size);
                }
                if let Some(err) = &outcome.error {
                    println!("Error    : {}", err);
                }
                for d in &outcome.destinations {
                    let detail = d.location.as_deref().or(d.error.as_deref()).unwrap_or("");
                    let mark = if d.succeeded { "OK" } else { "FAILED" };
                    println!(" - {:<20} {:<6} {}", d.name, mark, detail);
                }
            }
            if outcome.status != RunStatus::Completed {
                anyhow::bail!("run {} finished {}", outcome.run_id, outcome.status);
            }
        }
        Commands::Status {
            run_id,
            job,
            limit,
            json,
        } => {
            let pool = open_pool(&config)?;
            match run_id {
                Some(run_id) => {
                    let report = tracker::get_run_status(&pool, &run_id)?
                        .with_context(|| format!("run {run_id} not found"))?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&report)?);
                    } else {
                        println!("Run {} (job {}) : {}", report.run_id, report.job_id, report.status);
                        println!(
                            "{:<6} | {:<10} | {:<7} | {:<12} | Location / Error",
                            "Dest", "Status", "Attempt", "Size"
                        );
                        println!("{:-<6}-|-{:-<10}-|-{:-<7}-|-{:-<12}-|-{:-<30}", "", "", "", "", "");
                        for e in &report.entries {
                            let detail = e.file_path.as_deref().or(e.error_message.as_deref()).unwrap_or("");
                            println!(
                                "{:<6} | {:<10} | {:<7} | {:<12} | {}",
                                e.destination_id.map(|d| d.to_string()).unwrap_or_default(),
                                e.status,
                                e.attempt,
                                e.file_size.map(|s| s.to_string()).unwrap_or_default(),
                                detail
                            );
                        }
                    }
                }
                None => {
                    let runs = tracker::recent_runs(&pool, job, limit)?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&runs)?);
                    } else if runs.is_empty() {
                        println!("No runs found.");
                    } else {
                        println!("{:<36} | {:<5} | {:<9} | {:<9} | Created", "Run", "Job", "Trigger", "Status");
                        println!("{:-<36}-|-{:-<5}-|-{:-<9}-|-{:-<9}-|-{:-<24}", "", "", "", "", "");
                        for r in runs {
                            println!(
                                "{:<36} | {:<5} | {:<9} | {:<9} | {}",
                                r.run_id,
                                r.job_id,
                                r.trigger,
                                r.status,
                                storage::ts(r.created_at)
                            );
                        }
                    }
                }
            }
        }
        Commands::Stats { job_id, json } => {
            let pool = open_pool(&config)?;
            let stats = tracker::get_job_stats(&pool, job_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("Job {}", stats.job_id);
                println!("Runs         : {}", stats.total_runs);
                println!("  completed  : {}", stats.completed);
                println!("  partial    : {}", stats.partial);
                println!("  failed     : {}", stats.failed);
                println!("  running    : {}", stats.running);
                println!("  pending    : {}", stats.pending);
                println!("Total bytes  : {}", stats.total_bytes);
                let fmt = |t: Option<chrono::DateTime<Utc>>| t.map(storage::ts).unwrap_or_else(|| "never".into());
                println!("Last run     : {}", fmt(stats.last_run_at));
                println!("Last success : {}", fmt(stats.last_success_at));
            }
        }
        Commands::Cleanup => {
            let pool = open_pool(&config)?;
            let n = tracker::cleanup_stale_running_jobs(&pool, config.execution.stale_threshold(), Utc::now())?;
            println!("Marked {} stale entr{} as failed.", n, if n == 1 { "y" } else { "ies" });
        }
        Commands::ShowJob { job_id } => {
            let engine = Engine::open(config)?;
            let job = catalog::load_job(&engine.pool, job_id)?.with_context(|| format!("job {job_id} not found"))?;
            let masked = engine.credentials.mask(ConfigKind::Source(job.source_type), &job.source_config);
            let destinations: Vec<_> = catalog::destinations_for_job(&engine.pool, job_id)?
                .into_iter()
                .map(|d| json!({ "id": d.id, "name": d.name, "kind": d.kind }))
                .collect();
            let view = json!({
                "id": job.id,
                "name": job.name,
                "source_type": job.source_type,
                "source_config": masked,
                "schedule": job.schedule,
                "retention_days": job.retention_days,
                "retry_count": job.retry_count,
                "enabled": job.enabled,
                "credential_provider_id": job.credential_provider_id,
                "destinations": destinations,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Schedule { action } => {
            let pool = open_pool(&config)?;
            let scheduler = Scheduler::new();
            scheduler.register_all(&pool)?;

            match action {
                ScheduleAction::List => {
                    let list = scheduler.list();
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!("{:<5} | {:<20} | {:<15} | Next run", "Job", "Name", "Cron");
                        println!("{:-<5}-|-{:-<20}-|-{:-<15}-|-{:-<24}", "", "", "", "");
                        for s in list {
                            println!(
                                "{:<5} | {:<20} | {:<15} | {}",
                                s.job_id,
                                s.job_name,
                                s.expression,
                                s.next_fire.map(storage::ts).unwrap_or_else(|| "-".into())
                            );
                        }
                    }
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours, Utc::now());
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for due in preview {
                            println!("{} : {} (job {})", storage::ts(due.fire_time), due.job_name, due.job_id);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
