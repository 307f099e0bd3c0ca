use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use snapshot_relay::db::{self, NewSchedule};
use snapshot_relay::model::{Component, OperationKind};
use snapshot_relay::platform::RestPlatform;
use snapshot_relay::runner::{Services, Worker};
use snapshot_relay::{blob, config, export, restore};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process pending operations, schedules and retention until interrupted
    Worker,
    /// Request a backup of a project
    Backup {
        #[arg(long)]
        user: String,
        #[arg(long)]
        project: String,
        /// Comma-separated components; all when omitted
        #[arg(long, value_delimiter = ',', value_parser = parse_component)]
        components: Vec<Component>,
        /// Run in the foreground instead of leaving it to the worker
        #[arg(long)]
        now: bool,
    },
    /// Request a restore of a completed backup into a target project
    Restore {
        #[arg(long)]
        user: String,
        #[arg(long)]
        target: String,
        #[arg(long)]
        backup: String,
        #[arg(long)]
        now: bool,
    },
    /// Run one pending operation in the foreground
    Run { id: String },
    /// Continue an interrupted restore from its last completed phase
    Resume { id: String },
    /// Cancel a pending or running operation
    Cancel { id: String },
    /// Show one operation, or the most recent ones
    Status {
        id: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Store the management API token for a user
    SetToken {
        #[arg(long)]
        user: String,
        #[arg(long)]
        token: String,
    },
    /// Create a recurring backup schedule
    Schedule {
        #[arg(long)]
        user: String,
        #[arg(long)]
        project: String,
        #[arg(long, value_delimiter = ',', value_parser = parse_component)]
        components: Vec<Component>,
        #[arg(long, default_value_t = 24)]
        every_hours: i64,
        #[arg(long, default_value_t = 30)]
        retention_days: i64,
    },
    /// List backup schedules
    Schedules,
    /// Delete snapshots past their retention once
    Cleanup,
}

fn parse_component(s: &str) -> Result<Component, String> {
    Component::parse(s.trim()).ok_or_else(|| format!("unknown component {s:?}"))
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let on_signal = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/ledger.db", cfg.app.data_dir));
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let platform = Arc::new(RestPlatform::from_config(&cfg)?);
    let blobs = blob::open(&cfg)?;
    let svc = Services::new(pool, platform, blobs, cfg);

    match args.command {
        Command::Worker => {
            let shutdown = shutdown_on_ctrl_c();
            Worker::new(svc, shutdown).run().await?;
        }
        Command::Backup {
            user,
            project,
            components,
            now,
        } => {
            let components = if components.is_empty() {
                Component::ALL.to_vec()
            } else {
                components
            };
            let id = export::request(&svc, &user, &project, components).await?;
            println!("{id}");
            if now {
                run_now(&svc, &id).await?;
            }
        }
        Command::Restore {
            user,
            target,
            backup,
            now,
        } => {
            let id = restore::request(&svc, &user, &target, &backup).await?;
            println!("{id}");
            if now {
                run_now(&svc, &id).await?;
            }
        }
        Command::Run { id } => run_now(&svc, &id).await?,
        Command::Resume { id } => {
            let cancel = shutdown_on_ctrl_c();
            let summary = restore::resume(&svc, &id, &cancel).await?;
            for line in summary.log_lines() {
                println!("{line}");
            }
        }
        Command::Cancel { id } => {
            let op = db::get_operation(&svc.pool, &id)
                .await?
                .ok_or_else(|| anyhow!("operation {id} not found"))?;
            if !db::cancel_operation(&svc.pool, &id).await? {
                bail!("operation {id} is already {}", op.status.as_str());
            }
            db::insert_audit(
                &svc.pool,
                Some(&id),
                op.kind,
                &op.user_id,
                "cancel_requested",
                &serde_json::json!({ "previousStatus": op.status.as_str() }),
            )
            .await?;
            info!(%id, "operation cancelled");
        }
        Command::Status { id, limit } => match id {
            Some(id) => {
                let op = db::get_operation(&svc.pool, &id)
                    .await?
                    .ok_or_else(|| anyhow!("operation {id} not found"))?;
                println!("{}", serde_json::to_string_pretty(&op)?);
            }
            None => {
                for op in db::list_operations(&svc.pool, limit).await? {
                    println!(
                        "{}  {:<7}  {:<9}  {:>3}%  {}",
                        op.id,
                        op.kind.as_str(),
                        op.status.as_str(),
                        op.progress,
                        op.project_ref
                    );
                }
            }
        },
        Command::SetToken { user, token } => {
            db::set_management_token(&svc.pool, &user, &token).await?;
            info!(%user, "management token stored");
        }
        Command::Schedule {
            user,
            project,
            components,
            every_hours,
            retention_days,
        } => {
            if every_hours < 1 || retention_days < 1 {
                bail!("interval and retention must be at least 1");
            }
            let components = if components.is_empty() {
                Component::ALL.to_vec()
            } else {
                components
            };
            let new = NewSchedule {
                user_id: user,
                project_ref: project,
                components,
                interval_hours: every_hours,
                retention_days,
            };
            let id = db::create_schedule(&svc.pool, &new, Utc::now() + ChronoDuration::hours(every_hours)).await?;
            println!("{id}");
        }
        Command::Schedules => {
            for s in db::list_schedules(&svc.pool).await? {
                println!(
                    "{}  {}  every {}h  keep {}d  next {}  last {}",
                    s.id,
                    s.project_ref,
                    s.interval_hours,
                    s.retention_days,
                    s.next_run_at.to_rfc3339(),
                    s.last_status.as_deref().unwrap_or("-")
                );
            }
        }
        Command::Cleanup => {
            let removed = Worker::new(svc, CancellationToken::new())
                .sweep_retention(Utc::now())
                .await?;
            println!("{removed} expired snapshots deleted");
        }
    }
    Ok(())
}

async fn run_now(svc: &Services, id: &str) -> Result<()> {
    let op = db::get_operation(&svc.pool, id)
        .await?
        .with_context(|| format!("operation {id} not found"))?;
    let cancel = shutdown_on_ctrl_c();
    match op.kind {
        OperationKind::Backup => {
            let outcome = export::run(svc, id, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        OperationKind::Restore => {
            let summary = restore::run(svc, id, &cancel).await?;
            for line in summary.log_lines() {
                println!("{line}");
            }
        }
    }
    Ok(())
}
