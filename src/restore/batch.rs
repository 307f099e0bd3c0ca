//! Batched submission of DDL through the control-plane migration endpoint.

use super::phase::{Phase, PhaseReport};
use crate::config::BatchPolicy;
use crate::error::ApiError;
use crate::platform::ControlPlane;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One statement and the object it restores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub item: String,
    pub sql: String,
}

impl Statement {
    pub fn new(item: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            sql: sql.into(),
        }
    }
}

pub struct MigrationRunner<'a> {
    control: &'a dyn ControlPlane,
    project_ref: &'a str,
    statement_retries: u32,
    retry_delay: Duration,
}

fn migration_name(phase: Phase, unit: &str, n: usize) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "restore_{}_{unit}_{n}_{}_{}",
        phase.as_str(),
        Utc::now().timestamp_millis(),
        &suffix[..5]
    )
}

impl<'a> MigrationRunner<'a> {
    pub fn new(control: &'a dyn ControlPlane, project_ref: &'a str, statement_retries: u32, retry_delay: Duration) -> Self {
        Self {
            control,
            project_ref,
            statement_retries,
            retry_delay,
        }
    }

    /// Submit `statements` in batches, falling back to one call per statement
    /// when a batch fails. Outcomes are counted into `report`.
    pub async fn apply(&self, phase: Phase, policy: BatchPolicy, statements: &[Statement], report: &mut PhaseReport) {
        let size = policy.size.max(1);
        let mut stmt_seq = 0;
        for (n, chunk) in statements.chunks(size).enumerate() {
            if n > 0 && policy.delay_ms > 0 {
                tokio::time::sleep(policy.delay()).await;
            }
            report.attempted += chunk.len();

            if chunk.len() > 1 {
                let query = chunk
                    .iter()
                    .map(|s| s.sql.trim())
                    .collect::<Vec<_>>()
                    .join("\n\n");
                match self
                    .control
                    .run_migration(self.project_ref, &migration_name(phase, "batch", n), &query)
                    .await
                {
                    Ok(()) => {
                        report.created += chunk.len();
                        debug!(%phase, batch = n, size = chunk.len(), "batch applied");
                        continue;
                    }
                    Err(err) => {
                        // Not an error entry: each statement is retried on its own below.
                        warn!(%phase, batch = n, %err, "batch failed; applying statements one by one");
                    }
                }
            }

            for stmt in chunk {
                stmt_seq += 1;
                match self.apply_one(phase, stmt, stmt_seq).await {
                    Ok(()) => report.created += 1,
                    Err(err) => {
                        warn!(%phase, item = %stmt.item, %err, "statement failed");
                        report.error(&stmt.item, err);
                    }
                }
            }
        }
        info!(
            %phase,
            attempted = report.attempted,
            created = report.created,
            failed = report.failed(),
            "migrations applied"
        );
    }

    /// One statement, retried while the failure is transient.
    pub async fn apply_one(&self, phase: Phase, stmt: &Statement, n: usize) -> Result<(), ApiError> {
        let mut attempt = 0;
        loop {
            let res = self
                .control
                .run_migration(self.project_ref, &migration_name(phase, "stmt", n), &stmt.sql)
                .await;
            match res {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() && attempt < self.statement_retries => {
                    attempt += 1;
                    debug!(%phase, item = %stmt.item, attempt, %err, "transient failure; retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
