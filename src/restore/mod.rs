//! Phased replay of a snapshot into a target project.
//!
//! Phases run in a fixed order, each bracketed by checkpoints and preceded by
//! a cancellation check. DDL goes through the control-plane migration
//! endpoint in batches; row data and storage go through the target's data
//! plane. There is no transaction spanning the restore: a failure leaves the
//! phases already applied in place, and a resumed restore skips every phase
//! with an exit checkpoint.

use crate::db::{self, NewOperation, Operation};
use crate::error::RunError;
use crate::model::{OperationKind, OperationStatus};
use crate::platform::{ControlPlane, Instance};
use crate::runner::{ensure_active, Services};
use crate::snapshot::{captured, trigger_function, Section, Snapshot, TableData};
use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub mod batch;
pub mod phase;
pub mod sql;
pub mod summary;

pub use batch::{MigrationRunner, Statement};
pub use phase::{Phase, PhaseError, PhaseReport};
pub use summary::FinalSummary;

/// Errors copied into one audit entry.
const AUDIT_ERROR_LIMIT: usize = 20;

/// Create a pending restore of a completed backup into `target_ref`.
#[instrument(skip_all, fields(backup_id = %backup_id, target_ref = %target_ref))]
pub async fn request(svc: &Services, user_id: &str, target_ref: &str, backup_id: &str) -> Result<String> {
    let backup = db::get_operation(&svc.pool, backup_id)
        .await?
        .with_context(|| format!("backup {backup_id} not found"))?;
    if backup.kind != OperationKind::Backup {
        bail!("operation {backup_id} is not a backup");
    }
    if backup.status != OperationStatus::Completed || backup.file_path.is_none() {
        bail!("backup {backup_id} has no snapshot to restore (status {})", backup.status.as_str());
    }
    let id = db::create_operation(&svc.pool, &NewOperation::restore(user_id, target_ref, backup_id)).await?;
    info!(%id, "restore requested");
    Ok(id)
}

/// Re-run a restore interrupted while pending or running.
pub async fn resume(svc: &Services, operation_id: &str, cancel: &CancellationToken) -> Result<FinalSummary, RunError> {
    let op = load(svc, operation_id).await?;
    if !matches!(op.status, OperationStatus::Pending | OperationStatus::Running) {
        return Err(RunError::fatal(
            "setup",
            format!("restore {operation_id} is {} and cannot be resumed", op.status.as_str()),
        ));
    }
    info!(id = %operation_id, "resuming restore");
    run(svc, operation_id, cancel).await
}

async fn load(svc: &Services, operation_id: &str) -> Result<Operation, RunError> {
    let op = db::get_operation(&svc.pool, operation_id)
        .await?
        .ok_or_else(|| RunError::fatal("setup", format!("operation {operation_id} not found")))?;
    if op.kind != OperationKind::Restore {
        return Err(RunError::fatal("setup", format!("operation {operation_id} is not a restore")));
    }
    Ok(op)
}

/// Run a restore operation to a terminal state.
#[instrument(skip_all, fields(operation_id = %operation_id))]
pub async fn run(svc: &Services, operation_id: &str, cancel: &CancellationToken) -> Result<FinalSummary, RunError> {
    let op = load(svc, operation_id).await?;
    match op.status {
        OperationStatus::Pending | OperationStatus::Running => {}
        OperationStatus::Cancelled => return Err(RunError::Cancelled),
        status => {
            return Err(RunError::fatal(
                "setup",
                format!("restore {operation_id} is already {}", status.as_str()),
            ))
        }
    }
    let mut last_phase = "setup".to_string();
    match execute(svc, &op, cancel, &mut last_phase).await {
        Ok(summary) => Ok(summary),
        Err(err) => {
            finish_unsuccessful(svc, &op, &err, &last_phase).await;
            Err(err)
        }
    }
}

async fn finish_unsuccessful(svc: &Services, op: &Operation, err: &RunError, last_phase: &str) {
    let pool = &svc.pool;
    let ledger_cancelled = matches!(
        db::operation_status(pool, &op.id).await,
        Ok(Some(OperationStatus::Cancelled))
    );
    if matches!(err, RunError::Cancelled) || ledger_cancelled {
        if !ledger_cancelled {
            if let Err(e) = db::cancel_operation(pool, &op.id).await {
                warn!(?e, "could not mark restore cancelled");
            }
        }
        info!(id = %op.id, phase = last_phase, "restore cancelled");
        let _ = db::append_log(pool, &op.id, &format!("Restore cancelled before {last_phase}")).await;
        let details = json!({ "phase": last_phase });
        if let Err(e) = db::insert_audit(pool, Some(&op.id), op.kind, &op.user_id, "restore_cancelled", &details).await {
            warn!(?e, "could not write audit entry");
        }
        return;
    }
    if matches!(err, RunError::Interrupted) {
        info!(id = %op.id, phase = last_phase, "restore interrupted; left running for resume");
        let _ = db::append_log(pool, &op.id, &format!("Restore interrupted before {last_phase}; resume to continue")).await;
        let details = json!({ "phase": last_phase });
        if let Err(e) = db::insert_audit(pool, Some(&op.id), op.kind, &op.user_id, "restore_interrupted", &details).await {
            warn!(?e, "could not write audit entry");
        }
        return;
    }

    let phase = err.phase().unwrap_or(last_phase);
    let message = match err {
        RunError::Fatal { message, .. } => message.clone(),
        other => format!("{other:#}"),
    };
    warn!(id = %op.id, phase, %message, "restore failed");
    if let Err(e) = db::fail_operation(pool, &op.id, phase, &message).await {
        warn!(?e, "could not record restore failure");
    }
    let details = json!({ "phase": phase, "error": message });
    if let Err(e) = db::insert_audit(pool, Some(&op.id), op.kind, &op.user_id, "restore_failed", &details).await {
        warn!(?e, "could not write audit entry");
    }
}

async fn execute(
    svc: &Services,
    op: &Operation,
    cancel: &CancellationToken,
    last_phase: &mut String,
) -> Result<FinalSummary, RunError> {
    let pool = &svc.pool;
    let resumed = op.status == OperationStatus::Running;
    db::insert_audit(
        pool,
        Some(&op.id),
        op.kind,
        &op.user_id,
        "restore_started",
        &json!({ "targetProjectRef": op.project_ref, "backupId": op.backup_id, "resumed": resumed }),
    )
    .await?;
    if !db::mark_running(pool, &op.id, 5).await? {
        return Err(RunError::Cancelled);
    }

    let backup_id = op
        .backup_id
        .as_deref()
        .ok_or_else(|| RunError::fatal("setup", "restore has no source backup"))?;
    let backup = db::get_operation(pool, backup_id)
        .await?
        .ok_or_else(|| RunError::fatal("setup", format!("backup {backup_id} not found")))?;
    let path = backup
        .file_path
        .ok_or_else(|| RunError::fatal("setup", format!("backup {backup_id} has no snapshot file")))?;

    *last_phase = "download".to_string();
    db::insert_checkpoint(pool, &op.id, "download", &json!({ "stage": "started", "filePath": path })).await?;
    let bytes = svc
        .blobs
        .get(&path)
        .await
        .map_err(|e| RunError::fatal("download", format!("{e:#}")))?;
    let snap = Snapshot::from_slice(&bytes).map_err(|e| RunError::fatal("parse", format!("{e:#}")))?;
    db::append_log(
        pool,
        &op.id,
        &format!("Snapshot of {} loaded ({} bytes)", snap.project_id, bytes.len()),
    )
    .await?;

    *last_phase = "credentials".to_string();
    let token = db::get_management_token(pool, &op.user_id)
        .await?
        .ok_or_else(|| RunError::fatal("credentials", format!("no management token stored for user {}", op.user_id)))?;
    let control = svc.platform.control_plane(&token);
    let key = control
        .service_role_key(&op.project_ref)
        .await
        .map_err(|e| RunError::fatal("credentials", format!("target service key unavailable: {e}")))?;
    let instance = svc.platform.instance(&op.project_ref, &key);
    db::set_progress(pool, &op.id, 10).await?;

    let mut finished = finished_phases(svc, &op.id).await?;
    let restorer = Restorer {
        svc,
        op,
        control,
        instance,
        snap,
    };

    let mut reports: BTreeMap<Phase, PhaseReport> = BTreeMap::new();
    let mut warnings = restorer.snap.warnings.clone();
    for phase in Phase::ALL {
        *last_phase = phase.as_str().to_string();
        ensure_active(pool, &op.id, cancel).await?;
        if let Some(report) = finished.remove(&phase) {
            debug!(%phase, "phase already completed; skipping");
            reports.insert(phase, report);
            continue;
        }

        let (floor, ceiling) = phase.progress();
        db::insert_checkpoint(pool, &op.id, phase.as_str(), &json!({ "stage": "started" })).await?;
        db::set_progress(pool, &op.id, floor).await?;

        let report = restorer.run_phase(phase, &reports).await?;

        let input = report.attempted + report.skipped;
        if phase.is_hard_dependency() && report.attempted > 0 && report.created == 0 {
            let first = report
                .errors
                .first()
                .map(|e| format!("{}: {}", e.item, e.error))
                .unwrap_or_else(|| "nothing was created".to_string());
            return Err(RunError::fatal(
                phase.as_str(),
                format!("no {phase} restored out of {input}: {first}"),
            ));
        }
        if !report.errors.is_empty() {
            warnings.push(format!("{phase}: {} of {} failed", report.failed(), report.attempted));
            restorer.audit_errors(phase, &report).await?;
        }
        warnings.extend(report.warnings.iter().cloned());

        db::insert_checkpoint(
            pool,
            &op.id,
            phase.as_str(),
            &json!({ "stage": "completed", "report": report }),
        )
        .await?;
        db::append_log(
            pool,
            &op.id,
            &format!("{phase}: {} created, {} failed, {} skipped", report.created, report.failed(), report.skipped),
        )
        .await?;
        db::set_progress(pool, &op.id, ceiling).await?;
        reports.insert(phase, report);
    }

    *last_phase = "finalize".to_string();
    let summary = FinalSummary::build(&op.project_ref, &reports, warnings);
    let summary_json = serde_json::to_value(&summary).context("serialize restore summary")?;
    for warning in &summary.warnings {
        db::append_warning(pool, &op.id, warning).await?;
    }
    if !db::complete_restore(pool, &op.id, &summary_json).await? {
        return Err(RunError::Cancelled);
    }
    db::insert_checkpoint(
        pool,
        &op.id,
        "completed",
        &json!({ "stage": "completed", "tablesCreated": summary.tables_created, "totalRows": summary.total_rows }),
    )
    .await?;
    for line in summary.log_lines() {
        db::append_log(pool, &op.id, &line).await?;
    }
    db::insert_audit(
        pool,
        Some(&op.id),
        op.kind,
        &op.user_id,
        "restore_completed",
        &json!({ "tablesCreated": summary.tables_created, "totalRows": summary.total_rows, "warnings": summary.warnings.len() }),
    )
    .await?;
    info!(id = %op.id, tables = summary.tables_created, rows = summary.total_rows, "restore completed");
    Ok(summary)
}

/// Reports of phases with an exit checkpoint, for resuming.
async fn finished_phases(svc: &Services, operation_id: &str) -> Result<BTreeMap<Phase, PhaseReport>, RunError> {
    let mut out = BTreeMap::new();
    for cp in db::list_checkpoints(&svc.pool, operation_id).await? {
        if cp.payload.get("stage").and_then(Value::as_str) != Some("completed") {
            continue;
        }
        let Some(phase) = Phase::parse(&cp.phase) else {
            continue;
        };
        let report = cp
            .payload
            .get("report")
            .cloned()
            .and_then(|r| serde_json::from_value(r).ok())
            .unwrap_or_default();
        out.insert(phase, report);
    }
    Ok(out)
}

/// Borrow a captured list, or explain why the phase has nothing to do.
fn items<T>(section: &Option<Section<Vec<T>>>) -> Result<&[T], PhaseReport> {
    match section {
        None => Err(PhaseReport::skipped("not present in snapshot")),
        Some(Section::Failed(e)) => Err(PhaseReport::skipped(format!("capture failed: {}", e.error))),
        Some(Section::Captured(list)) => Ok(list),
    }
}

macro_rules! captured_or_skip {
    ($section:expr) => {
        match items($section) {
            Ok(list) => list,
            Err(report) => return Ok(report),
        }
    };
}

struct Restorer<'a> {
    svc: &'a Services,
    op: &'a Operation,
    control: Arc<dyn ControlPlane>,
    instance: Arc<dyn Instance>,
    snap: Snapshot,
}

impl<'a> Restorer<'a> {
    fn runner(&self) -> MigrationRunner<'_> {
        let cfg = &self.svc.config.restore;
        MigrationRunner::new(
            self.control.as_ref(),
            &self.op.project_ref,
            cfg.statement_retries,
            cfg.retry_delay(),
        )
    }

    async fn apply(&self, phase: Phase, statements: &[Statement], report: &mut PhaseReport) {
        let policy = phase.batch_policy(&self.svc.config.restore.batches);
        self.runner().apply(phase, policy, statements, report).await;
    }

    async fn audit_errors(&self, phase: Phase, report: &PhaseReport) -> Result<(), RunError> {
        let action = if phase == Phase::Data {
            "data_restore_error"
        } else {
            "schema_restore_error"
        };
        let errors: Vec<&PhaseError> = report.errors.iter().take(AUDIT_ERROR_LIMIT).collect();
        db::insert_audit(
            &self.svc.pool,
            Some(&self.op.id),
            self.op.kind,
            &self.op.user_id,
            action,
            &json!({ "phase": phase.as_str(), "count": report.errors.len(), "errors": errors }),
        )
        .await?;
        Ok(())
    }

    async fn run_phase(&self, phase: Phase, done: &BTreeMap<Phase, PhaseReport>) -> Result<PhaseReport, RunError> {
        info!(%phase, "restoring");
        match phase {
            Phase::Extensions => self.extensions().await,
            Phase::CustomTypes => self.custom_types().await,
            Phase::Tables => self.tables().await,
            Phase::Sequences => self.sequences().await,
            Phase::CheckConstraints => self.check_constraints().await,
            Phase::UniqueConstraints => self.unique_constraints().await,
            Phase::Indexes => self.indexes().await,
            Phase::Policies => self.policies().await,
            Phase::Functions => self.functions().await,
            Phase::Views => self.views(false).await,
            Phase::MaterializedViews => self.views(true).await,
            Phase::Triggers => self.triggers().await,
            Phase::Data => self.data(done).await,
            Phase::ForeignKeys => self.foreign_keys().await,
            Phase::Storage => self.storage().await,
            Phase::EdgeFunctions => self.edge_functions().await,
            Phase::AuthConfig => self.auth_config().await,
            Phase::ProjectConfig => self.project_config().await,
        }
    }

    /// Apply statements built per item; items without DDL count as skipped.
    async fn apply_built<T>(
        &self,
        phase: Phase,
        list: &[T],
        build: impl Fn(&T) -> Option<Statement>,
    ) -> Result<PhaseReport, RunError> {
        let mut report = PhaseReport::default();
        let mut statements = Vec::new();
        for item in list {
            match build(item) {
                Some(stmt) => statements.push(stmt),
                None => report.skipped += 1,
            }
        }
        if statements.is_empty() && report.skipped == 0 {
            return Ok(PhaseReport::skipped("nothing to restore"));
        }
        self.apply(phase, &statements, &mut report).await;
        Ok(report)
    }

    async fn extensions(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.extensions);
        self.apply_built(Phase::Extensions, list, |e| {
            (e.name != "plpgsql").then(|| Statement::new(&e.name, sql::create_extension(e)))
        })
        .await
    }

    async fn custom_types(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.custom_types);
        self.apply_built(Phase::CustomTypes, list, |t| {
            (!t.enums.is_empty()).then(|| Statement::new(format!("{}.{}", t.schema, t.name), sql::create_enum(t)))
        })
        .await
    }

    async fn tables(&self) -> Result<PhaseReport, RunError> {
        let Some(schema) = self.snap.schema() else {
            return Ok(PhaseReport::skipped("schema not captured"));
        };
        // Foreign keys are added after data; creating referenced tables first still keeps the order readable.
        let mut tables: Vec<_> = schema.tables.iter().collect();
        tables.sort_by_key(|t| t.has_foreign_keys());

        let mut report = PhaseReport::default();
        let mut statements = Vec::new();
        for table in tables {
            match sql::create_table(table) {
                Some(ddl) => statements.push(Statement::new(table.qualified(), ddl)),
                None => {
                    report.skipped += 1;
                    report
                        .warnings
                        .push(format!("table {} skipped: no usable columns", table.qualified()));
                }
            }
        }
        self.apply(Phase::Tables, &statements, &mut report).await;
        Ok(report)
    }

    async fn sequences(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.sequences);
        self.apply_built(Phase::Sequences, list, |s| {
            Some(Statement::new(format!("{}.{}", s.schema, s.name), sql::restore_sequence(s)))
        })
        .await
    }

    async fn check_constraints(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.check_constraints);
        self.apply_built(Phase::CheckConstraints, list, |c| {
            sql::add_check_constraint(c).map(|ddl| Statement::new(format!("{}.{}", c.table, c.name), ddl))
        })
        .await
    }

    async fn unique_constraints(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.unique_constraints);
        self.apply_built(Phase::UniqueConstraints, list, |c| {
            sql::add_unique_constraint(c).map(|ddl| Statement::new(format!("{}.{}", c.table, c.name), ddl))
        })
        .await
    }

    async fn indexes(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.indexes);
        let unique_names: Vec<&str> = captured(&self.snap.unique_constraints)
            .map(|u| u.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default();
        self.apply_built(Phase::Indexes, list, |i| {
            if sql::is_constraint_index(i, &unique_names) {
                return None;
            }
            sql::create_index(i).map(|ddl| Statement::new(format!("{}.{}", i.schema, i.name), ddl))
        })
        .await
    }

    async fn policies(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.policies);
        let mut targets: BTreeSet<(String, String)> = list.iter().map(|p| (p.schema.clone(), p.table.clone())).collect();
        if let Some(schema) = self.snap.schema() {
            for t in &schema.tables {
                if t.rls_status == crate::snapshot::RlsStatus::Enabled {
                    targets.insert((t.schema.clone(), t.name.clone()));
                }
            }
        }

        let enable: Vec<Statement> = targets
            .iter()
            .map(|(schema, table)| Statement::new(format!("rls:{schema}.{table}"), sql::enable_rls(schema, table)))
            .collect();
        let mut rls = PhaseReport::default();
        self.apply(Phase::Policies, &enable, &mut rls).await;

        let statements: Vec<Statement> = list
            .iter()
            .map(|p| Statement::new(format!("{}.{}.{}", p.schema, p.table, p.name), sql::create_policy(p)))
            .collect();
        let mut report = PhaseReport::default();
        self.apply(Phase::Policies, &statements, &mut report).await;
        report.attempted += rls.attempted;
        report.add("rls_enabled", rls.created as u64);
        report.errors.extend(rls.errors);
        Ok(report)
    }

    async fn functions(&self) -> Result<PhaseReport, RunError> {
        let Some(schema) = self.snap.schema() else {
            return Ok(PhaseReport::skipped("schema not captured"));
        };
        let list: Vec<_> = schema.functions.iter().filter(|f| !f.returns_trigger()).cloned().collect();
        self.apply_built(Phase::Functions, &list, |f| {
            sql::create_function(f).map(|ddl| Statement::new(format!("{}.{}", f.schema, f.name), ddl))
        })
        .await
    }

    async fn views(&self, materialized: bool) -> Result<PhaseReport, RunError> {
        let (phase, section) = if materialized {
            (Phase::MaterializedViews, &self.snap.materialized_views)
        } else {
            (Phase::Views, &self.snap.views)
        };
        let list = captured_or_skip!(section);
        self.apply_built(phase, list, |v| {
            let ddl = if materialized {
                sql::create_materialized_view(v)
            } else {
                sql::create_view(v)
            };
            ddl.map(|ddl| Statement::new(format!("{}.{}", v.schema, v.name), ddl))
        })
        .await
    }

    async fn triggers(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.triggers);
        let mut report = PhaseReport::default();

        // Trigger-only functions are held back from the functions phase.
        if let Some(schema) = self.snap.schema() {
            let fns: Vec<Statement> = schema
                .functions
                .iter()
                .filter(|f| f.returns_trigger())
                .filter_map(|f| sql::create_function(f).map(|ddl| Statement::new(format!("{}.{}", f.schema, f.name), ddl)))
                .collect();
            let mut fn_report = PhaseReport::default();
            self.apply(Phase::Triggers, &fns, &mut fn_report).await;
            report.attempted += fn_report.attempted;
            report.add("trigger_functions", fn_report.created as u64);
            report.errors.extend(fn_report.errors);
        }

        let mut known: HashMap<String, bool> = HashMap::new();
        let mut statements = Vec::new();
        for trigger in list {
            let item = format!("{}.{}.{}", trigger.schema, trigger.table, trigger.name);
            let Some(ddl) = sql::create_trigger(trigger) else {
                report.skipped += 1;
                continue;
            };
            let function = match (&trigger.function_name, trigger.definition.as_deref().and_then(trigger_function)) {
                (Some(name), _) => Some((trigger.function_schema.clone(), name.clone())),
                (None, Some(found)) => Some(found),
                (None, None) => None,
            };
            let Some((fn_schema, fn_name)) = function else {
                report.attempted += 1;
                report.error(item, "cannot determine the trigger's function");
                continue;
            };
            let key = format!("{}.{fn_name}", fn_schema.as_deref().unwrap_or("*"));
            let exists = match known.get(&key) {
                Some(exists) => *exists,
                None => {
                    let check = sql::function_exists_query(fn_schema.as_deref(), &fn_name);
                    let exists = match self.control.query(&self.op.project_ref, &check).await {
                        Ok(rows) => !rows.is_empty(),
                        Err(e) => {
                            // Unknown; let trigger creation report the real error.
                            debug!(function = %fn_name, %e, "function lookup failed");
                            true
                        }
                    };
                    known.insert(key, exists);
                    exists
                }
            };
            if !exists {
                report.attempted += 1;
                report.error(item, format!("function {fn_name} does not exist on target"));
                continue;
            }
            statements.push(Statement::new(item, ddl));
        }
        self.apply(Phase::Triggers, &statements, &mut report).await;
        Ok(report)
    }

    async fn data(&self, done: &BTreeMap<Phase, PhaseReport>) -> Result<PhaseReport, RunError> {
        if done.get(&Phase::Tables).map_or(0, |r| r.created) == 0 {
            return Ok(PhaseReport::skipped("no tables were created"));
        }
        let data = match &self.snap.data {
            None => return Ok(PhaseReport::skipped("not present in snapshot")),
            Some(Section::Failed(e)) => {
                let mut report = PhaseReport::skipped(format!("capture failed: {}", e.error));
                report.warnings.push(format!("table data was not exported: {}", e.error));
                return Ok(report);
            }
            Some(Section::Captured(data)) => data,
        };
        let Some(schema) = self.snap.schema() else {
            return Ok(PhaseReport::skipped("schema not captured"));
        };

        let pool = &self.svc.pool;
        let chunk_size = self.svc.config.restore.data_chunk_size.max(1);
        let (floor, ceiling) = Phase::Data.progress();
        let total = data.len().max(1) as i64;
        let mut report = PhaseReport::default();

        for (i, (table, entry)) in data.iter().enumerate() {
            let rows = match entry {
                TableData::Failed(e) => {
                    report.skipped += 1;
                    report
                        .warnings
                        .push(format!("table {table} skipped: export failed ({})", e.export_error));
                    continue;
                }
                TableData::Rows(rows) => rows,
            };
            if !schema.has_table(table) {
                report.skipped += 1;
                report.warnings.push(format!("table {table} skipped: not in captured schema"));
                continue;
            }
            if rows.is_empty() {
                report.skipped += 1;
                continue;
            }

            report.attempted += 1;
            match self.instance.table_exists(table).await {
                Ok(true) => {}
                Ok(false) => {
                    report.error(table.as_str(), "table does not exist on target");
                    continue;
                }
                Err(e) => {
                    report.error(table.as_str(), e);
                    continue;
                }
            }

            let mut inserted = 0u64;
            let mut failed = None;
            for (n, chunk) in rows.chunks(chunk_size).enumerate() {
                match self.instance.insert_rows(table, chunk).await {
                    Ok(()) => inserted += chunk.len() as u64,
                    Err(e) => {
                        failed = Some(format!("chunk {n}: {e}"));
                        break;
                    }
                }
            }
            report.add("rows", inserted);
            match failed {
                None => {
                    report.created += 1;
                    debug!(table = %table, rows = inserted, "table data restored");
                }
                Some(e) => {
                    warn!(table = %table, inserted, error = %e, "table data incomplete");
                    report.error(table.as_str(), e);
                }
            }
            let step = (ceiling - floor) * (i as i64 + 1) / total;
            db::set_progress(pool, &self.op.id, floor + step).await?;
        }
        info!(
            tables = report.created,
            rows = report.counter("rows"),
            failed = report.failed(),
            "table data restored"
        );
        Ok(report)
    }

    async fn foreign_keys(&self) -> Result<PhaseReport, RunError> {
        let Some(schema) = self.snap.schema() else {
            return Ok(PhaseReport::skipped("schema not captured"));
        };
        let statements: Vec<Statement> = schema
            .tables
            .iter()
            .flat_map(|t| {
                t.columns.iter().filter_map(move |c| {
                    sql::add_foreign_key(t, c).map(|ddl| Statement::new(format!("{}.{}", t.qualified(), c.name), ddl))
                })
            })
            .collect();
        if statements.is_empty() {
            return Ok(PhaseReport::skipped("no foreign keys"));
        }
        let mut report = PhaseReport::default();
        self.apply(Phase::ForeignKeys, &statements, &mut report).await;
        Ok(report)
    }

    async fn storage(&self) -> Result<PhaseReport, RunError> {
        let storage = match &self.snap.storage {
            None => return Ok(PhaseReport::skipped("not present in snapshot")),
            Some(Section::Failed(e)) => return Ok(PhaseReport::skipped(format!("capture failed: {}", e.error))),
            Some(Section::Captured(s)) => s,
        };
        let mut report = PhaseReport::default();
        let mut ready = BTreeSet::new();

        for bucket in &storage.buckets {
            report.attempted += 1;
            let body = json!({
                "id": bucket.id,
                "name": bucket.name,
                "public": bucket.public,
                "file_size_limit": bucket.file_size_limit,
                "allowed_mime_types": bucket.allowed_mime_types,
            });
            match self.instance.create_bucket(&body).await {
                Ok(()) => {
                    report.created += 1;
                    ready.insert(bucket.id.as_str());
                }
                Err(e) if e.is_conflict() => {
                    debug!(bucket = %bucket.id, "bucket already exists");
                    report.created += 1;
                    ready.insert(bucket.id.as_str());
                }
                Err(e) => report.error(format!("bucket:{}", bucket.id), e),
            }
        }

        let statements: Vec<Statement> = storage
            .policies
            .iter()
            .map(|p| Statement::new(format!("storage:{}", p.name), sql::create_policy(p)))
            .collect();
        let mut policies = PhaseReport::default();
        self.apply(Phase::Storage, &statements, &mut policies).await;
        report.add("policies", policies.created as u64);
        report.errors.extend(policies.errors);

        if self.svc.config.restore.copy_storage_objects {
            for bucket in storage.buckets.iter().filter(|b| ready.contains(b.id.as_str())) {
                for object in &bucket.objects {
                    let Some(url) = &object.download_url else {
                        report.add("objects_skipped", 1);
                        continue;
                    };
                    let copied = match self.instance.download(url).await {
                        Ok(body) => {
                            self.instance
                                .upload_object(&bucket.id, &object.path, object.content_type.as_deref(), body)
                                .await
                        }
                        Err(e) => Err(e),
                    };
                    match copied {
                        Ok(()) => report.add("objects", 1),
                        Err(e) => report.error(format!("object:{}/{}", bucket.id, object.path), e),
                    }
                }
            }
        } else {
            report.warnings.push("storage objects were not copied; copy them separately".to_string());
        }
        Ok(report)
    }

    async fn edge_functions(&self) -> Result<PhaseReport, RunError> {
        let list = captured_or_skip!(&self.snap.functions);
        let mut report = PhaseReport::default();
        for f in list {
            report.attempted += 1;
            let body = json!({
                "slug": f.slug,
                "name": f.name.as_deref().unwrap_or(&f.slug),
                "verify_jwt": f.verify_jwt.unwrap_or(true),
            });
            match self.control.create_function(&self.op.project_ref, &body).await {
                Ok(()) => report.created += 1,
                Err(e) if e.is_conflict() => report.created += 1,
                Err(e) => {
                    report.error(&f.slug, e);
                    continue;
                }
            }
            report.warnings.push(format!(
                "edge function {} registered without code; deploy it with `supabase functions deploy {}`",
                f.slug, f.slug
            ));
        }
        Ok(report)
    }

    async fn auth_config(&self) -> Result<PhaseReport, RunError> {
        let Some(config) = self.config_section(&self.snap.auth_config) else {
            return Ok(PhaseReport::skipped("auth config not captured"));
        };
        let res = self.control.update_auth_config(&self.op.project_ref, config).await;
        Ok(single("auth_config", res))
    }

    async fn project_config(&self) -> Result<PhaseReport, RunError> {
        let Some(config) = self.config_section(&self.snap.project_config) else {
            return Ok(PhaseReport::skipped("project config not captured"));
        };
        let res = self.control.update_project_config(&self.op.project_ref, config).await;
        Ok(single("project_config", res))
    }

    fn config_section<'s>(&self, section: &'s Option<Section<Value>>) -> Option<&'s Value> {
        captured(section).filter(|v| v.as_object().is_some_and(|o| !o.is_empty()))
    }
}

fn single(item: &str, res: Result<(), crate::error::ApiError>) -> PhaseReport {
    let mut report = PhaseReport {
        attempted: 1,
        ..Default::default()
    };
    match res {
        Ok(()) => report.created = 1,
        Err(e) => report.error(item, e),
    }
    report
}
