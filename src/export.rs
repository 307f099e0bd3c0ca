//! Snapshot export: introspect, extract, list storage, fetch configs, upload.

use crate::db::{self, NewOperation, Operation};
use crate::error::{ApiError, RunError};
use crate::introspect;
use crate::model::{Component, OperationKind};
use crate::paginate::fetch_all_rows;
use crate::platform::{ControlPlane, Instance};
use crate::runner::{ensure_active, Services};
use crate::snapshot::report::BackupReport;
use crate::snapshot::{Bucket, EdgeFunction, Policy, Section, Snapshot, StorageObject, StorageSection, TableData};
use anyhow::{anyhow, bail, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PHASE: &str = "export";
const MB: usize = 1024 * 1024;
/// Entries per storage listing request.
const LIST_PAGE: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    pub success: bool,
    pub backup_operation_id: String,
    pub file_path: String,
}

/// Create a pending backup after checking the per-user rate limit.
#[instrument(skip_all, fields(user_id = %user_id, project_ref = %project_ref))]
pub async fn request(svc: &Services, user_id: &str, project_ref: &str, components: Vec<Component>) -> Result<String> {
    if components.is_empty() {
        bail!("at least one component is required");
    }
    let limit = svc.config.export.rate_limit_per_hour;
    if limit > 0
        && !db::hit_rate_limit(&svc.pool, &format!("export:{user_id}"), limit, chrono::Duration::hours(1)).await?
    {
        bail!("export rate limit of {limit} per hour exceeded for user {user_id}");
    }
    let id = db::create_operation(&svc.pool, &NewOperation::backup(user_id, project_ref, components)).await?;
    info!(%id, "backup requested");
    Ok(id)
}

/// Run a backup operation to completion.
///
/// Section failures are recorded in the document; only missing credentials, an
/// oversized document, or an upload failure fail the operation.
#[instrument(skip_all, fields(operation_id = %operation_id))]
pub async fn run(svc: &Services, operation_id: &str, cancel: &CancellationToken) -> Result<ExportOutcome, RunError> {
    let op = db::get_operation(&svc.pool, operation_id)
        .await?
        .ok_or_else(|| RunError::fatal(PHASE, format!("operation {operation_id} not found")))?;
    if op.kind != OperationKind::Backup {
        return Err(RunError::fatal(PHASE, format!("operation {operation_id} is not a backup")));
    }

    match execute(svc, &op, cancel).await {
        Ok(outcome) => Ok(outcome),
        Err(err) => {
            record_failure(svc, &op, &err).await;
            Err(err)
        }
    }
}

async fn record_failure(svc: &Services, op: &Operation, err: &RunError) {
    let ledger_cancelled = matches!(
        db::operation_status(&svc.pool, &op.id).await,
        Ok(Some(crate::model::OperationStatus::Cancelled))
    );
    if matches!(err, RunError::Cancelled) || ledger_cancelled {
        if !ledger_cancelled {
            if let Err(e) = db::cancel_operation(&svc.pool, &op.id).await {
                warn!(?e, "could not mark backup cancelled");
            }
        }
        info!(id = %op.id, "backup cancelled");
        return;
    }
    if matches!(err, RunError::Interrupted) {
        // Captures are not checkpointed; the next worker starts the backup over.
        match db::requeue_operation(&svc.pool, &op.id).await {
            Ok(true) => info!(id = %op.id, "backup interrupted; requeued"),
            Ok(false) => {}
            Err(e) => warn!(?e, "could not requeue interrupted backup"),
        }
        let details = json!({ "requeued": true });
        if let Err(e) = db::insert_audit(&svc.pool, Some(&op.id), op.kind, &op.user_id, "export_interrupted", &details).await {
            warn!(?e, "could not write audit entry");
        }
        return;
    }
    let phase = err.phase().unwrap_or(PHASE);
    let message = match err {
        RunError::Fatal { message, .. } => message.clone(),
        other => format!("{other:#}"),
    };
    warn!(id = %op.id, phase, %message, "backup failed");
    if let Err(e) = db::fail_operation(&svc.pool, &op.id, phase, &message).await {
        warn!(?e, "could not record backup failure");
    }
    let details = json!({ "phase": phase, "error": message });
    if let Err(e) = db::insert_audit(&svc.pool, Some(&op.id), op.kind, &op.user_id, "export_failed", &details).await {
        warn!(?e, "could not write audit entry");
    }
}

async fn execute(svc: &Services, op: &Operation, cancel: &CancellationToken) -> Result<ExportOutcome, RunError> {
    let pool = &svc.pool;
    let cfg = &svc.config;
    if !db::mark_running(pool, &op.id, 5).await? {
        return Err(RunError::Cancelled);
    }
    db::insert_audit(
        pool,
        Some(&op.id),
        op.kind,
        &op.user_id,
        "export_started",
        &json!({ "projectRef": op.project_ref, "components": op.components }),
    )
    .await?;
    db::append_log(pool, &op.id, &format!("Backup started for project {}", op.project_ref)).await?;

    let token = db::get_management_token(pool, &op.user_id)
        .await?
        .ok_or_else(|| RunError::fatal("credentials", format!("no management token stored for user {}", op.user_id)))?;
    let control = svc.platform.control_plane(&token);

    let wants = |c: Component| op.components.contains(&c);
    let mut snap = Snapshot::new(&op.project_ref);

    let instance: Result<Arc<dyn Instance>, String> =
        if wants(Component::Schema) || wants(Component::Data) || wants(Component::Storage) {
            match control.service_role_key(&op.project_ref).await {
                Ok(key) => Ok(svc.platform.instance(&op.project_ref, &key)),
                Err(e) => {
                    warn!(%e, "service role key unavailable");
                    Err(format!("service role key unavailable: {e}"))
                }
            }
        } else {
            Err("not requested".to_string())
        };

    if wants(Component::Schema) {
        ensure_active(pool, &op.id, cancel).await?;
        db::append_log(pool, &op.id, "Capturing schema").await?;
        match &instance {
            Ok(inst) => match introspect::introspect(inst.as_ref(), &cfg.app.schema).await {
                Ok(found) => found.apply(&mut snap),
                Err(e) => {
                    warn!(%e, "schema capture failed");
                    snap.schema = Some(Section::failed(e.to_string()));
                }
            },
            Err(e) => snap.schema = Some(Section::failed(e.clone())),
        }
        db::set_progress(pool, &op.id, 15).await?;
    }

    if wants(Component::Data) {
        ensure_active(pool, &op.id, cancel).await?;
        db::append_log(pool, &op.id, "Extracting table data").await?;
        snap.data = Some(match &instance {
            Ok(inst) => capture_data(svc, op, inst.as_ref(), &mut snap).await?,
            Err(e) => Section::failed(e.clone()),
        });
        db::set_progress(pool, &op.id, 70).await?;
    }

    if wants(Component::Storage) {
        ensure_active(pool, &op.id, cancel).await?;
        db::append_log(pool, &op.id, "Listing storage").await?;
        snap.storage = Some(match &instance {
            Ok(inst) => match capture_storage(inst.as_ref(), cfg.export.signed_url_expiry_secs).await {
                Ok((section, warnings)) => {
                    snap.warnings.extend(warnings);
                    Section::Captured(section)
                }
                Err(e) => Section::failed(e.to_string()),
            },
            Err(e) => Section::failed(e.clone()),
        });
        db::set_progress(pool, &op.id, 80).await?;
    }

    if wants(Component::Functions) {
        ensure_active(pool, &op.id, cancel).await?;
        snap.functions = Some(match capture_functions(control.as_ref(), &op.project_ref).await {
            Ok(fns) => Section::Captured(fns),
            Err(e) => Section::failed(e.to_string()),
        });
        db::set_progress(pool, &op.id, 85).await?;
    }

    if wants(Component::AuthConfig) {
        ensure_active(pool, &op.id, cancel).await?;
        snap.auth_config = Some(match control.auth_config(&op.project_ref).await {
            Ok(v) => Section::Captured(v),
            Err(e) => Section::failed(e.to_string()),
        });
        db::set_progress(pool, &op.id, 90).await?;
    }

    if wants(Component::ProjectConfig) {
        ensure_active(pool, &op.id, cancel).await?;
        snap.project_config = Some(match control.project_config(&op.project_ref).await {
            Ok(v) => Section::Captured(v),
            Err(e) => Section::failed(e.to_string()),
        });
        db::set_progress(pool, &op.id, 95).await?;
    }

    ensure_active(pool, &op.id, cancel).await?;
    finalize(svc, op, snap).await
}

async fn capture_data(
    svc: &Services,
    op: &Operation,
    instance: &dyn Instance,
    snap: &mut Snapshot,
) -> Result<Section<BTreeMap<String, TableData>>, RunError> {
    let Some(schema) = snap.schema() else {
        return Ok(Section::failed("table data requires a captured schema"));
    };
    let tables: Vec<String> = schema.tables.iter().map(|t| t.name.clone()).collect();
    let cfg = &svc.config.export;
    let total = tables.len().max(1) as i64;
    let mut data = BTreeMap::new();

    for (i, table) in tables.iter().enumerate() {
        match fetch_all_rows(instance, table, cfg.page_size, cfg.max_rows_per_table).await {
            Ok(fetched) => {
                if fetched.truncated {
                    let reported = fetched.total.unwrap_or(fetched.rows.len() as u64);
                    snap.data_truncated.insert(table.clone(), reported);
                    snap.warnings.push(format!(
                        "table {table} truncated at {} of {reported} rows",
                        fetched.rows.len()
                    ));
                }
                data.insert(table.clone(), TableData::Rows(fetched.rows));
            }
            Err(e) => {
                warn!(table = %table, %e, "table extraction failed");
                data.insert(table.clone(), TableData::failed(e.to_string()));
            }
        }
        let done = i as i64 + 1;
        db::set_progress(&svc.pool, &op.id, 15 + 55 * done / total).await?;
    }
    info!(tables = tables.len(), truncated = snap.data_truncated.len(), "table data extracted");
    Ok(Section::Captured(data))
}

#[derive(Debug, Deserialize)]
struct BucketRow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    public: bool,
    #[serde(default)]
    file_size_limit: Option<i64>,
    #[serde(default)]
    allowed_mime_types: Option<Vec<String>>,
}

/// Buckets with their objects and signed retrieval URLs, plus storage policies.
pub async fn capture_storage(
    instance: &dyn Instance,
    expiry_secs: u64,
) -> Result<(StorageSection, Vec<String>), ApiError> {
    let mut section = StorageSection::default();
    let mut warnings = Vec::new();

    for row in instance.list_buckets().await? {
        let row: BucketRow = match serde_json::from_value(row) {
            Ok(row) => row,
            Err(e) => {
                debug!(%e, "skipping unreadable bucket");
                continue;
            }
        };
        let mut bucket = Bucket {
            name: row.name.unwrap_or_else(|| row.id.clone()),
            id: row.id,
            public: row.public,
            file_size_limit: row.file_size_limit,
            allowed_mime_types: row.allowed_mime_types,
            objects: Vec::new(),
            error: None,
        };
        match list_bucket(instance, &bucket.id).await {
            Ok(objects) => bucket.objects = objects,
            Err(e) => {
                warn!(bucket = %bucket.id, %e, "bucket listing failed");
                bucket.error = Some(e.to_string());
            }
        }
        for object in &mut bucket.objects {
            match instance.signed_url(&bucket.id, &object.path, expiry_secs).await {
                Ok(url) => object.download_url = Some(url),
                Err(e) => {
                    debug!(bucket = %bucket.id, path = %object.path, %e, "signing failed");
                    section.unsigned_objects += 1;
                }
            }
        }
        section.buckets.push(bucket);
    }
    if section.unsigned_objects > 0 {
        warnings.push(format!(
            "{} storage object(s) have no signed URL and cannot be copied on restore",
            section.unsigned_objects
        ));
    }

    match instance.sql(introspect::sources::storage_policies_sql()).await {
        Ok(rows) => {
            section.policies = rows
                .into_iter()
                .filter_map(|r| serde_json::from_value::<Policy>(r).ok())
                .collect();
        }
        Err(e) => warnings.push(format!("storage policies could not be captured: {e}")),
    }

    let objects: usize = section.buckets.iter().map(|b| b.objects.len()).sum();
    info!(buckets = section.buckets.len(), objects, "storage listed");
    Ok((section, warnings))
}

/// Walk a bucket depth-first. Entries without metadata are folders.
async fn list_bucket(instance: &dyn Instance, bucket: &str) -> Result<Vec<StorageObject>, ApiError> {
    let mut objects = Vec::new();
    let mut folders = vec![String::new()];
    while let Some(prefix) = folders.pop() {
        let mut offset = 0;
        loop {
            let page = instance.list_objects(bucket, &prefix, offset, LIST_PAGE).await?;
            let n = page.len() as u64;
            for entry in page {
                let Some(name) = entry.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let path = if prefix.is_empty() {
                    name.to_string()
                } else {
                    format!("{prefix}/{name}")
                };
                let metadata = entry.get("metadata").cloned().unwrap_or(Value::Null);
                if metadata.is_null() {
                    folders.push(path);
                    continue;
                }
                objects.push(StorageObject {
                    name: name.to_string(),
                    size: metadata.get("size").and_then(Value::as_i64),
                    content_type: metadata.get("mimetype").and_then(Value::as_str).map(str::to_string),
                    last_modified: entry
                        .get("updated_at")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    download_url: None,
                    path,
                    metadata,
                });
            }
            if n < LIST_PAGE {
                break;
            }
            offset += n;
        }
    }
    Ok(objects)
}

async fn capture_functions(control: &dyn ControlPlane, project_ref: &str) -> Result<Vec<EdgeFunction>, ApiError> {
    let rows = control.list_functions(project_ref).await?;
    Ok(rows
        .into_iter()
        .filter_map(|r| match serde_json::from_value(r) {
            Ok(f) => Some(f),
            Err(e) => {
                debug!(%e, "skipping unreadable function entry");
                None
            }
        })
        .collect())
}

/// Size checks, upload, report and completion.
async fn finalize(svc: &Services, op: &Operation, mut snap: Snapshot) -> Result<ExportOutcome, RunError> {
    let pool = &svc.pool;
    let cfg = &svc.config.export;

    if snap.schema().is_none() {
        snap.warnings.push(
            "schema section missing or failed; restores of this snapshot will skip structure and data".to_string(),
        );
    }

    let size = snap.to_vec_pretty()?.len();
    let max = cfg.max_snapshot_mb as usize * MB;
    if size > max {
        return Err(RunError::fatal(
            "finalize",
            format!("snapshot is {} MB, above the {} MB limit", size / MB, cfg.max_snapshot_mb),
        ));
    }
    if size > cfg.very_large_snapshot_mb as usize * MB {
        snap.warnings.push(format!(
            "very large snapshot ({} MB); restore will be slow and may hit request limits",
            size / MB
        ));
    } else if size > cfg.large_snapshot_mb as usize * MB {
        snap.warnings.push(format!("large snapshot ({} MB)", size / MB));
    }
    let bytes = snap.to_vec_pretty()?;
    let size = bytes.len();

    let path = format!(
        "{}/backup_{}_{}.json",
        op.user_id,
        op.id,
        Utc::now().timestamp_millis()
    );
    svc.blobs
        .put(&path, bytes)
        .await
        .map_err(|e| RunError::fatal("upload", format!("{e:#}")))?;

    let report = BackupReport::build(&snap, size);
    for warning in &snap.warnings {
        db::append_warning(pool, &op.id, warning).await?;
    }
    let report = serde_json::to_value(&report).map_err(|e| anyhow!(e))?;
    if !db::complete_backup(pool, &op.id, &path, size as i64, &report).await? {
        return Err(RunError::Cancelled);
    }
    db::append_log(pool, &op.id, &format!("Backup completed: {path}")).await?;
    db::insert_audit(
        pool,
        Some(&op.id),
        op.kind,
        &op.user_id,
        "export_completed",
        &json!({ "filePath": path, "sizeBytes": size, "warnings": snap.warnings.len() }),
    )
    .await?;
    info!(id = %op.id, %path, size, "backup completed");

    Ok(ExportOutcome {
        success: true,
        backup_operation_id: op.id.clone(),
        file_path: path,
    })
}
