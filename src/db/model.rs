//! Ledger entities returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in the pipelines.

use crate::model::{Component, OperationKind, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input for a new backup or restore request.
#[derive(Debug, Clone)]
pub struct NewOperation {
    pub kind: OperationKind,
    pub user_id: String,
    /// Source project for a backup, target project for a restore.
    pub project_ref: String,
    /// Backup whose snapshot a restore consumes.
    pub backup_id: Option<String>,
    pub schedule_id: Option<i64>,
    pub components: Vec<Component>,
}

impl NewOperation {
    pub fn backup(user_id: &str, project_ref: &str, components: Vec<Component>) -> Self {
        Self {
            kind: OperationKind::Backup,
            user_id: user_id.to_string(),
            project_ref: project_ref.to_string(),
            backup_id: None,
            schedule_id: None,
            components,
        }
    }

    pub fn restore(user_id: &str, target_ref: &str, backup_id: &str) -> Self {
        Self {
            kind: OperationKind::Restore,
            user_id: user_id.to_string(),
            project_ref: target_ref.to_string(),
            backup_id: Some(backup_id.to_string()),
            schedule_id: None,
            components: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub user_id: String,
    pub project_ref: String,
    pub backup_id: Option<String>,
    pub schedule_id: Option<i64>,
    pub components: Vec<Component>,
    pub status: OperationStatus,
    pub progress: i64,
    pub logs: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<ErrorRecord>,
    pub file_path: Option<String>,
    pub file_size: Option<i64>,
    pub report: Option<Value>,
    pub summary: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only phase marker written by the restore orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    pub id: i64,
    pub operation_id: String,
    pub phase: String,
    pub payload: Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub operation_id: Option<String>,
    pub operation_kind: OperationKind,
    pub user_id: String,
    pub action: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchedule {
    pub user_id: String,
    pub project_ref: String,
    pub components: Vec<Component>,
    pub interval_hours: i64,
    pub retention_days: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Schedule {
    pub id: i64,
    pub user_id: String,
    pub project_ref: String,
    pub components: Vec<Component>,
    pub interval_hours: i64,
    pub retention_days: i64,
    pub enabled: bool,
    pub next_run_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
}

/// Completed backup whose snapshot outlived its retention window.
#[derive(Debug, Clone)]
pub struct ExpiredBackup {
    pub id: String,
    pub user_id: String,
    pub file_path: String,
}
