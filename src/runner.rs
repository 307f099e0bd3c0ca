//! Background worker: claims pending operations, fires due schedules and
//! sweeps expired snapshots.

use crate::blob::BlobStore;
use crate::config::Config;
use crate::db::{self, NewOperation, Operation, Pool};
use crate::error::RunError;
use crate::model::{OperationKind, OperationStatus};
use crate::platform::Platform;
use crate::{export, restore};
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Shared handles every pipeline runs against.
#[derive(Clone)]
pub struct Services {
    pub pool: Pool,
    pub platform: Arc<dyn Platform>,
    pub blobs: Arc<dyn BlobStore>,
    pub config: Arc<Config>,
}

impl Services {
    pub fn new(pool: Pool, platform: Arc<dyn Platform>, blobs: Arc<dyn BlobStore>, config: Config) -> Self {
        Self {
            pool,
            platform,
            blobs,
            config: Arc::new(config),
        }
    }
}

/// Fails with [`RunError::Cancelled`] when the ledger says the operation was
/// cancelled, or with [`RunError::Interrupted`] once the shutdown token fires.
pub async fn ensure_active(pool: &Pool, id: &str, shutdown: &CancellationToken) -> Result<(), RunError> {
    if db::operation_status(pool, id).await? == Some(OperationStatus::Cancelled) {
        return Err(RunError::Cancelled);
    }
    if shutdown.is_cancelled() {
        return Err(RunError::Interrupted);
    }
    Ok(())
}

/// Drive one operation through the pipeline for its kind.
pub async fn execute(svc: &Services, op: &Operation, cancel: &CancellationToken) -> Result<(), RunError> {
    match op.kind {
        OperationKind::Backup => export::run(svc, &op.id, cancel).await.map(|_| ()),
        OperationKind::Restore => restore::run(svc, &op.id, cancel).await.map(|_| ()),
    }
}

pub struct Worker {
    svc: Services,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(svc: Services, shutdown: CancellationToken) -> Self {
        let permits = Arc::new(Semaphore::new(svc.config.app.max_concurrent_operations.max(1)));
        Self {
            svc,
            permits,
            shutdown,
        }
    }

    /// Claim the oldest pending operation and run it in the background.
    /// Returns false when nothing was started.
    #[instrument(skip_all)]
    pub async fn process_next(&self) -> Result<bool> {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return Ok(false);
        };
        let Some(op) = db::claim_next_pending(&self.svc.pool).await? else {
            return Ok(false);
        };
        info!(id = %op.id, kind = op.kind.as_str(), project_ref = %op.project_ref, "operation claimed");

        let svc = self.svc.clone();
        let cancel = self.shutdown.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            match execute(&svc, &op, &cancel).await {
                Ok(()) => info!(id = %op.id, "operation finished"),
                Err(RunError::Cancelled) => info!(id = %op.id, "operation cancelled"),
                Err(RunError::Interrupted) => info!(id = %op.id, "operation interrupted; left resumable"),
                Err(err) => warn!(id = %op.id, %err, "operation failed"),
            }
        });
        Ok(true)
    }

    /// Enqueue a backup for every schedule whose next run is due.
    #[instrument(skip_all)]
    pub async fn run_due_schedules(&self, now: DateTime<Utc>) -> Result<usize> {
        let pool = &self.svc.pool;
        let due = db::list_due_schedules(pool, now).await?;
        for schedule in &due {
            let mut new = NewOperation::backup(&schedule.user_id, &schedule.project_ref, schedule.components.clone());
            new.schedule_id = Some(schedule.id);
            let next = now + ChronoDuration::hours(schedule.interval_hours.max(1));
            let status = match db::create_operation(pool, &new).await {
                Ok(id) => {
                    info!(schedule = schedule.id, %id, "scheduled backup enqueued");
                    "enqueued".to_string()
                }
                Err(err) => {
                    warn!(schedule = schedule.id, ?err, "scheduled backup could not be enqueued");
                    format!("error: {err}")
                }
            };
            db::record_schedule_run(pool, schedule.id, now, next, &status).await?;
        }
        Ok(due.len())
    }

    /// Delete snapshot files past retention and clear their ledger paths.
    #[instrument(skip_all)]
    pub async fn sweep_retention(&self, now: DateTime<Utc>) -> Result<usize> {
        let pool = &self.svc.pool;
        let expired = db::backups_past_retention(pool, now, self.svc.config.retention.default_days).await?;
        let mut removed = 0;
        for backup in expired {
            if let Err(err) = self.svc.blobs.delete(&backup.file_path).await {
                warn!(id = %backup.id, path = %backup.file_path, ?err, "could not delete expired snapshot");
                continue;
            }
            db::clear_file_path(pool, &backup.id).await?;
            db::insert_audit(
                pool,
                Some(&backup.id),
                OperationKind::Backup,
                &backup.user_id,
                "snapshot_expired",
                &json!({ "filePath": backup.file_path }),
            )
            .await?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "expired snapshots deleted");
        }
        Ok(removed)
    }

    /// Requeue backups left running by a previous process. Restores keep their
    /// checkpoints and wait for an explicit resume. Returns the requeued count.
    #[instrument(skip_all)]
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut requeued = 0;
        for op in db::list_operations_with_status(&self.svc.pool, OperationStatus::Running).await? {
            match op.kind {
                OperationKind::Backup => {
                    if db::requeue_operation(&self.svc.pool, &op.id).await? {
                        info!(id = %op.id, "interrupted backup requeued");
                        requeued += 1;
                    }
                }
                OperationKind::Restore => {
                    warn!(id = %op.id, "restore was interrupted; resume it or cancel it");
                }
            }
        }
        Ok(requeued)
    }

    /// Poll until the shutdown token fires, then wait for in-flight operations.
    pub async fn run(self) -> Result<()> {
        self.recover_interrupted().await?;

        let poll = Duration::from_millis(self.svc.config.app.poll_interval_ms);
        let sweep_every = Duration::from_secs(self.svc.config.retention.sweep_interval_secs.max(1));
        let mut last_sweep: Option<tokio::time::Instant> = None;
        info!(
            max_concurrent = self.svc.config.app.max_concurrent_operations,
            "worker started"
        );

        while !self.shutdown.is_cancelled() {
            let now = Utc::now();
            if let Err(err) = self.run_due_schedules(now).await {
                error!(?err, "schedule tick failed");
            }
            if last_sweep.map_or(true, |t| t.elapsed() >= sweep_every) {
                if let Err(err) = self.sweep_retention(now).await {
                    error!(?err, "retention sweep failed");
                }
                last_sweep = Some(tokio::time::Instant::now());
            }

            let started = match self.process_next().await {
                Ok(started) => started,
                Err(err) => {
                    error!(?err, "worker error");
                    false
                }
            };
            if !started {
                tokio::select! {
                    _ = self.shutdown.cancelled() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }

        info!("worker stopping; waiting for in-flight operations");
        let all = self.svc.config.app.max_concurrent_operations.max(1) as u32;
        let _ = self.permits.acquire_many(all).await;
        Ok(())
    }
}
