use super::model::{
    AuditEntry, Checkpoint, ErrorRecord, ExpiredBackup, NewOperation, NewSchedule, Operation,
    Schedule,
};
use crate::model::{Component, OperationKind, OperationStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

const DAY_MS: i64 = 86_400_000;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {normalized}"))?
        .create_if_missing(true)
        // Enable WAL and stricter durability.
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(std::time::Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_json_list<T: serde::de::DeserializeOwned>(row: &SqliteRow, col: &str) -> Result<Vec<T>> {
    let raw: String = row.try_get(col)?;
    serde_json::from_str(&raw).with_context(|| format!("corrupt JSON in column {col}"))
}

fn parse_json_opt(row: &SqliteRow, col: &str) -> Result<Option<Value>> {
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .with_context(|| format!("corrupt JSON in column {col}"))
}

fn components_json(components: &[Component]) -> Result<String> {
    Ok(serde_json::to_string(components)?)
}

fn operation_from_row(row: &SqliteRow) -> Result<Operation> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    Ok(Operation {
        id: row.try_get("id")?,
        kind: OperationKind::parse(&kind).ok_or_else(|| anyhow!("unknown operation kind {kind}"))?,
        user_id: row.try_get("user_id")?,
        project_ref: row.try_get("project_ref")?,
        backup_id: row.try_get("backup_id")?,
        schedule_id: row.try_get("schedule_id")?,
        components: parse_json_list(row, "components")?,
        status: OperationStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown operation status {status}"))?,
        progress: row.try_get("progress")?,
        logs: parse_json_list(row, "logs")?,
        warnings: parse_json_list(row, "warnings")?,
        errors: parse_json_list(row, "errors")?,
        file_path: row.try_get("file_path")?,
        file_size: row.try_get("file_size")?,
        report: parse_json_opt(row, "report")?,
        summary: parse_json_opt(row, "summary")?,
        created_at: from_ms(row.try_get("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_ms),
        completed_at: row.try_get::<Option<i64>, _>("completed_at")?.map(from_ms),
        updated_at: from_ms(row.try_get("updated_at")?),
    })
}

#[instrument(skip_all)]
pub async fn create_operation(pool: &Pool, new: &NewOperation) -> Result<String> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = now_ms();
    sqlx::query(
        "INSERT INTO operations (id, kind, user_id, project_ref, backup_id, schedule_id, components, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(new.kind.as_str())
    .bind(&new.user_id)
    .bind(&new.project_ref)
    .bind(&new.backup_id)
    .bind(new.schedule_id)
    .bind(components_json(&new.components)?)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn get_operation(pool: &Pool, id: &str) -> Result<Option<Operation>> {
    let row = sqlx::query("SELECT * FROM operations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(operation_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn operation_status(pool: &Pool, id: &str) -> Result<Option<OperationStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM operations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(status.and_then(|s| OperationStatus::parse(&s)))
}

#[instrument(skip_all)]
pub async fn list_operations(pool: &Pool, limit: i64) -> Result<Vec<Operation>> {
    let rows = sqlx::query("SELECT * FROM operations ORDER BY created_at DESC, id LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(operation_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_operations_with_status(pool: &Pool, status: OperationStatus) -> Result<Vec<Operation>> {
    let rows = sqlx::query("SELECT * FROM operations WHERE status = ? ORDER BY created_at, id")
        .bind(status.as_str())
        .fetch_all(pool)
        .await?;
    rows.iter().map(operation_from_row).collect()
}

/// Atomically move the oldest pending operation to `running` and return it.
#[instrument(skip_all)]
pub async fn claim_next_pending(pool: &Pool) -> Result<Option<Operation>> {
    let now = now_ms();
    let id: Option<String> = sqlx::query_scalar(
        "UPDATE operations SET status = 'running', started_at = COALESCE(started_at, ?), updated_at = ?
         WHERE id = (SELECT id FROM operations WHERE status = 'pending' ORDER BY created_at, id LIMIT 1)
           AND status = 'pending'
         RETURNING id",
    )
    .bind(now)
    .bind(now)
    .fetch_optional(pool)
    .await?;
    match id {
        Some(id) => get_operation(pool, &id).await,
        None => Ok(None),
    }
}

/// Returns false when the operation is already terminal.
#[instrument(skip_all)]
pub async fn mark_running(pool: &Pool, id: &str, progress: i64) -> Result<bool> {
    let now = now_ms();
    let res = sqlx::query(
        "UPDATE operations SET status = 'running', started_at = COALESCE(started_at, ?),
             progress = MAX(progress, ?), updated_at = ?
         WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(now)
    .bind(progress.clamp(0, 100))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Progress never moves backwards.
#[instrument(skip_all)]
pub async fn set_progress(pool: &Pool, id: &str, progress: i64) -> Result<()> {
    sqlx::query("UPDATE operations SET progress = MAX(progress, ?), updated_at = ? WHERE id = ?")
        .bind(progress.clamp(0, 100))
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn append_log(pool: &Pool, id: &str, line: &str) -> Result<()> {
    sqlx::query("UPDATE operations SET logs = json_insert(logs, '$[#]', ?), updated_at = ? WHERE id = ?")
        .bind(line)
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn append_warning(pool: &Pool, id: &str, warning: &str) -> Result<()> {
    sqlx::query(
        "UPDATE operations SET warnings = json_insert(warnings, '$[#]', ?), updated_at = ? WHERE id = ?",
    )
    .bind(warning)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn append_error(pool: &Pool, id: &str, phase: &str, message: &str) -> Result<()> {
    let record = ErrorRecord {
        timestamp: Utc::now(),
        message: message.to_string(),
        phase: phase.to_string(),
    };
    sqlx::query(
        "UPDATE operations SET errors = json_insert(errors, '$[#]', json(?)), updated_at = ? WHERE id = ?",
    )
    .bind(serde_json::to_string(&record)?)
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Returns false when the operation was cancelled meanwhile.
#[instrument(skip_all)]
pub async fn complete_backup(
    pool: &Pool,
    id: &str,
    file_path: &str,
    file_size: i64,
    report: &Value,
) -> Result<bool> {
    let now = now_ms();
    let res = sqlx::query(
        "UPDATE operations SET status = 'completed', progress = 100, file_path = ?, file_size = ?,
             report = ?, completed_at = ?, updated_at = ?
         WHERE id = ? AND status != 'cancelled'",
    )
    .bind(file_path)
    .bind(file_size)
    .bind(serde_json::to_string(report)?)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Returns false when the operation was cancelled meanwhile.
#[instrument(skip_all)]
pub async fn complete_restore(pool: &Pool, id: &str, summary: &Value) -> Result<bool> {
    let now = now_ms();
    let res = sqlx::query(
        "UPDATE operations SET status = 'completed', progress = 100, summary = ?,
             completed_at = ?, updated_at = ?
         WHERE id = ? AND status != 'cancelled'",
    )
    .bind(serde_json::to_string(summary)?)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Record a terminal failure with one error entry. A cancelled operation is left untouched.
#[instrument(skip_all)]
pub async fn fail_operation(pool: &Pool, id: &str, phase: &str, message: &str) -> Result<bool> {
    let record = ErrorRecord {
        timestamp: Utc::now(),
        message: message.to_string(),
        phase: phase.to_string(),
    };
    let now = now_ms();
    let res = sqlx::query(
        "UPDATE operations SET status = 'failed', errors = json_insert(errors, '$[#]', json(?)),
             completed_at = ?, updated_at = ?
         WHERE id = ? AND status != 'cancelled'",
    )
    .bind(serde_json::to_string(&record)?)
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Put a running operation back in the queue so it starts over. Returns false
/// when it is no longer running.
#[instrument(skip_all)]
pub async fn requeue_operation(pool: &Pool, id: &str) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE operations SET status = 'pending', progress = 0, started_at = NULL, updated_at = ?
         WHERE id = ? AND status = 'running'",
    )
    .bind(now_ms())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Only pending or running operations can be cancelled.
#[instrument(skip_all)]
pub async fn cancel_operation(pool: &Pool, id: &str) -> Result<bool> {
    let now = now_ms();
    let res = sqlx::query(
        "UPDATE operations SET status = 'cancelled', completed_at = ?, updated_at = ?
         WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn insert_checkpoint(pool: &Pool, operation_id: &str, phase: &str, payload: &Value) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO checkpoints (operation_id, phase, payload, completed_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(operation_id)
    .bind(phase)
    .bind(serde_json::to_string(payload)?)
    .bind(now_ms())
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

#[instrument(skip_all)]
pub async fn list_checkpoints(pool: &Pool, operation_id: &str) -> Result<Vec<Checkpoint>> {
    let rows = sqlx::query(
        "SELECT id, operation_id, phase, payload, completed_at FROM checkpoints WHERE operation_id = ? ORDER BY id",
    )
    .bind(operation_id)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            let payload: String = row.try_get("payload")?;
            Ok(Checkpoint {
                id: row.try_get("id")?,
                operation_id: row.try_get("operation_id")?,
                phase: row.try_get("phase")?,
                payload: serde_json::from_str(&payload)?,
                completed_at: from_ms(row.try_get("completed_at")?),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn insert_audit(
    pool: &Pool,
    operation_id: Option<&str>,
    kind: OperationKind,
    user_id: &str,
    action: &str,
    details: &Value,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO audit_log (operation_id, operation_kind, user_id, action, details, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(operation_id)
    .bind(kind.as_str())
    .bind(user_id)
    .bind(action)
    .bind(serde_json::to_string(details)?)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn list_audit(pool: &Pool, operation_id: &str) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query("SELECT * FROM audit_log WHERE operation_id = ? ORDER BY id")
        .bind(operation_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            let kind: String = row.try_get("operation_kind")?;
            let details: String = row.try_get("details")?;
            Ok(AuditEntry {
                id: row.try_get("id")?,
                operation_id: row.try_get("operation_id")?,
                operation_kind: OperationKind::parse(&kind)
                    .ok_or_else(|| anyhow!("unknown operation kind {kind}"))?,
                user_id: row.try_get("user_id")?,
                action: row.try_get("action")?,
                details: serde_json::from_str(&details)?,
                created_at: from_ms(row.try_get("created_at")?),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn set_management_token(pool: &Pool, user_id: &str, token: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO credentials (user_id, management_token, updated_at) VALUES (?, ?, ?)
         ON CONFLICT(user_id) DO UPDATE SET management_token = excluded.management_token,
             updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(token)
    .bind(now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_management_token(pool: &Pool, user_id: &str) -> Result<Option<String>> {
    let token = sqlx::query_scalar("SELECT management_token FROM credentials WHERE user_id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    Ok(token)
}

/// Count one hit against `key` inside a fixed window. Returns whether the hit
/// is within `limit`.
#[instrument(skip_all)]
pub async fn hit_rate_limit(pool: &Pool, key: &str, limit: u32, window: Duration) -> Result<bool> {
    let now = now_ms();
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM rate_limits WHERE key = ? AND expires_at <= ?")
        .bind(key)
        .bind(now)
        .execute(&mut *tx)
        .await?;
    let count: i64 = sqlx::query_scalar(
        "INSERT INTO rate_limits (key, count, expires_at) VALUES (?, 1, ?)
         ON CONFLICT(key) DO UPDATE SET count = count + 1
         RETURNING count",
    )
    .bind(key)
    .bind(now + window.num_milliseconds())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(count <= i64::from(limit))
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule> {
    Ok(Schedule {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        project_ref: row.try_get("project_ref")?,
        components: parse_json_list(row, "components")?,
        interval_hours: row.try_get("interval_hours")?,
        retention_days: row.try_get("retention_days")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        next_run_at: from_ms(row.try_get("next_run_at")?),
        last_run_at: row.try_get::<Option<i64>, _>("last_run_at")?.map(from_ms),
        last_status: row.try_get("last_status")?,
    })
}

#[instrument(skip_all)]
pub async fn create_schedule(pool: &Pool, new: &NewSchedule, first_run: DateTime<Utc>) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO schedules (user_id, project_ref, components, interval_hours, retention_days, next_run_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&new.user_id)
    .bind(&new.project_ref)
    .bind(components_json(&new.components)?)
    .bind(new.interval_hours)
    .bind(new.retention_days)
    .bind(first_run.timestamp_millis())
    .bind(now_ms())
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

#[instrument(skip_all)]
pub async fn list_schedules(pool: &Pool) -> Result<Vec<Schedule>> {
    let rows = sqlx::query("SELECT * FROM schedules ORDER BY id")
        .fetch_all(pool)
        .await?;
    rows.iter().map(schedule_from_row).collect()
}

#[instrument(skip_all)]
pub async fn list_due_schedules(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<Schedule>> {
    let rows = sqlx::query(
        "SELECT * FROM schedules WHERE enabled = 1 AND next_run_at <= ? ORDER BY next_run_at, id",
    )
    .bind(now.timestamp_millis())
    .fetch_all(pool)
    .await?;
    rows.iter().map(schedule_from_row).collect()
}

#[instrument(skip_all)]
pub async fn record_schedule_run(
    pool: &Pool,
    schedule_id: i64,
    ran_at: DateTime<Utc>,
    next_run_at: DateTime<Utc>,
    status: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE schedules SET last_run_at = ?, next_run_at = ?, last_status = ? WHERE id = ?",
    )
    .bind(ran_at.timestamp_millis())
    .bind(next_run_at.timestamp_millis())
    .bind(status)
    .bind(schedule_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Completed backups whose snapshot is older than their schedule's retention,
/// or `default_days` for unscheduled backups.
#[instrument(skip_all)]
pub async fn backups_past_retention(
    pool: &Pool,
    now: DateTime<Utc>,
    default_days: u32,
) -> Result<Vec<ExpiredBackup>> {
    let rows = sqlx::query(
        "SELECT o.id, o.user_id, o.file_path FROM operations o
         LEFT JOIN schedules s ON s.id = o.schedule_id
         WHERE o.kind = 'backup' AND o.status = 'completed' AND o.file_path IS NOT NULL
           AND o.completed_at < ? - COALESCE(s.retention_days, ?) * ?
         ORDER BY o.completed_at",
    )
    .bind(now.timestamp_millis())
    .bind(i64::from(default_days))
    .bind(DAY_MS)
    .fetch_all(pool)
    .await?;
    rows.iter()
        .map(|row| {
            Ok(ExpiredBackup {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                file_path: row.try_get("file_path")?,
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn clear_file_path(pool: &Pool, id: &str) -> Result<()> {
    sqlx::query("UPDATE operations SET file_path = NULL, updated_at = ? WHERE id = ?")
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}
