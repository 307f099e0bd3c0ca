#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use snapshot_relay::blob::FsBlobStore;
use snapshot_relay::config::{self, Config};
use snapshot_relay::db::{self, Pool};
use snapshot_relay::error::{ApiError, ApiErrorKind};
use snapshot_relay::platform::{ControlPlane, Instance, Page, Platform};
use snapshot_relay::runner::Services;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const USER: &str = "user-1";
pub const TOKEN: &str = "mgmt-token";

static CREATE_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"CREATE TABLE IF NOT EXISTS "([^"]+)"\."([^"]+)""#).unwrap());

pub async fn setup_pool() -> Pool {
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

/// Example config with instant retries and no batch delays.
pub fn test_config() -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.platform.max_retries = 0;
    cfg.restore.retry_delay_ms = 0;
    cfg.restore.statement_retries = 1;
    for policy in [
        &mut cfg.restore.batches.extensions,
        &mut cfg.restore.batches.custom_types,
        &mut cfg.restore.batches.tables,
        &mut cfg.restore.batches.sequences,
        &mut cfg.restore.batches.check_constraints,
        &mut cfg.restore.batches.unique_constraints,
        &mut cfg.restore.batches.indexes,
        &mut cfg.restore.batches.policies,
        &mut cfg.restore.batches.functions,
        &mut cfg.restore.batches.views,
        &mut cfg.restore.batches.materialized_views,
        &mut cfg.restore.batches.triggers,
        &mut cfg.restore.batches.foreign_keys,
        &mut cfg.restore.batches.storage_policies,
    ] {
        policy.delay_ms = 0;
    }
    cfg
}

pub struct Harness {
    pub svc: Services,
    pub platform: FakePlatform,
    _blobs: TempDir,
}

impl Harness {
    pub async fn new(platform: FakePlatform, cfg: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = setup_pool().await;
        db::set_management_token(&pool, USER, TOKEN).await.unwrap();
        let svc = Services::new(
            pool,
            Arc::new(platform.clone()),
            Arc::new(FsBlobStore::new(dir.path())),
            cfg,
        );
        Self {
            svc,
            platform,
            _blobs: dir,
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.svc.pool
    }
}

fn not_found(what: &str) -> ApiError {
    ApiError::new(ApiErrorKind::NotFound, format!("{what} not found"))
}

/// Storage objects reachable by signed URL from any project.
type UrlRegistry = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Hook run when a migration containing `needle` is applied.
pub struct CancelOnMigration {
    pub needle: String,
    pub pool: Pool,
    pub operation_id: String,
}

/// An in-memory project: scripted metadata for discovery plus mutable tables,
/// storage and configuration that restores write into.
pub struct FakeProject {
    pub meta: Vec<(String, Value)>,
    pub sql: Vec<(String, Value)>,
    pub rows: Mutex<BTreeMap<String, Vec<Value>>>,
    /// Tables whose rows are generated on demand, `{"id": n}`.
    pub generated: BTreeMap<String, u64>,
    pub failing_tables: Vec<String>,
    pub migrations: Mutex<Vec<(String, String)>>,
    /// Migrations containing any of these fail with a validation error.
    pub reject: Vec<String>,
    pub cancel_on: Mutex<Option<CancelOnMigration>>,
    pub buckets: Mutex<Vec<Value>>,
    pub objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    pub storage_broken: bool,
    pub edge_functions: Mutex<Vec<Value>>,
    pub auth_config: Mutex<Value>,
    pub project_config: Mutex<Value>,
    urls: UrlRegistry,
}

impl FakeProject {
    fn new(urls: UrlRegistry) -> Self {
        Self {
            meta: Vec::new(),
            sql: Vec::new(),
            rows: Mutex::new(BTreeMap::new()),
            generated: BTreeMap::new(),
            failing_tables: Vec::new(),
            migrations: Mutex::new(Vec::new()),
            reject: Vec::new(),
            cancel_on: Mutex::new(None),
            buckets: Mutex::new(Vec::new()),
            objects: Mutex::new(BTreeMap::new()),
            storage_broken: false,
            edge_functions: Mutex::new(Vec::new()),
            auth_config: Mutex::new(Value::Null),
            project_config: Mutex::new(Value::Null),
            urls,
        }
    }

    pub fn migration_text(&self) -> Vec<String> {
        self.migrations.lock().unwrap().iter().map(|(_, q)| q.clone()).collect()
    }

    pub fn table_rows(&self, table: &str) -> Vec<Value> {
        self.rows.lock().unwrap().get(table).cloned().unwrap_or_default()
    }

    pub fn create_table(&self, table: &str) {
        self.rows.lock().unwrap().entry(table.to_string()).or_default();
    }

    async fn migrate(&self, name: &str, query: &str) -> Result<(), ApiError> {
        let hook = {
            let mut guard = self.cancel_on.lock().unwrap();
            match guard.as_ref() {
                Some(h) if query.contains(&h.needle) => guard.take(),
                _ => None,
            }
        };
        if let Some(h) = hook {
            db::cancel_operation(&h.pool, &h.operation_id).await.unwrap();
        }
        if let Some(bad) = self.reject.iter().find(|r| query.contains(r.as_str())) {
            return Err(ApiError::new(ApiErrorKind::Client(400), format!("rejected: {bad}")));
        }
        self.migrations
            .lock()
            .unwrap()
            .push((name.to_string(), query.to_string()));
        let mut rows = self.rows.lock().unwrap();
        for caps in CREATE_TABLE.captures_iter(query) {
            rows.entry(caps[2].to_string()).or_default();
        }
        Ok(())
    }
}

#[async_trait]
impl Instance for FakeProject {
    async fn meta(&self, endpoint: &str) -> Result<Value, ApiError> {
        self.meta
            .iter()
            .find(|(prefix, _)| endpoint.starts_with(prefix.as_str()))
            .map(|(_, v)| v.clone())
            .ok_or_else(|| not_found(endpoint))
    }

    async fn sql(&self, query: &str) -> Result<Vec<Value>, ApiError> {
        self.sql
            .iter()
            .find(|(needle, _)| query.contains(needle.as_str()))
            .map(|(_, v)| v.as_array().cloned().unwrap_or_default())
            .ok_or_else(|| ApiError::new(ApiErrorKind::Client(404), "exec_sql is not installed"))
    }

    async fn rpc(&self, function: &str, _: &Value) -> Result<Value, ApiError> {
        Err(not_found(function))
    }

    async fn rest_resources(&self) -> Result<Vec<String>, ApiError> {
        Err(not_found("openapi"))
    }

    async fn fetch_page(&self, table: &str, offset: u64, limit: u64) -> Result<Page, ApiError> {
        if self.failing_tables.iter().any(|t| t == table) {
            return Err(ApiError::new(ApiErrorKind::Client(403), "permission denied"));
        }
        if let Some(total) = self.generated.get(table) {
            let end = (offset + limit).min(*total);
            let rows = (offset..end).map(|i| json!({ "id": i })).collect();
            return Ok(Page {
                rows,
                total: Some(*total),
            });
        }
        let rows = self.rows.lock().unwrap();
        let all = rows.get(table).ok_or_else(|| not_found(table))?;
        let start = (offset as usize).min(all.len());
        let end = (start + limit as usize).min(all.len());
        Ok(Page {
            rows: all[start..end].to_vec(),
            total: Some(all.len() as u64),
        })
    }

    async fn table_exists(&self, table: &str) -> Result<bool, ApiError> {
        Ok(self.rows.lock().unwrap().contains_key(table))
    }

    async fn insert_rows(&self, table: &str, rows: &[Value]) -> Result<(), ApiError> {
        let mut tables = self.rows.lock().unwrap();
        let existing = tables.get_mut(table).ok_or_else(|| not_found(table))?;
        for row in rows {
            // Conflicting keys are ignored, like an upsert with ignore-duplicates.
            if !existing.iter().any(|r| r.get("id") == row.get("id")) {
                existing.push(row.clone());
            }
        }
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<Value>, ApiError> {
        if self.storage_broken {
            return Err(ApiError::new(ApiErrorKind::Server(502), "storage unavailable"));
        }
        Ok(self.buckets.lock().unwrap().clone())
    }

    async fn list_objects(&self, bucket: &str, prefix: &str, offset: u64, limit: u64) -> Result<Vec<Value>, ApiError> {
        let objects = self.objects.lock().unwrap();
        let mut entries: Vec<Value> = Vec::new();
        let mut folders: Vec<String> = Vec::new();
        for ((b, path), body) in objects.iter() {
            if b != bucket {
                continue;
            }
            let rest = if prefix.is_empty() {
                path.as_str()
            } else {
                match path.strip_prefix(&format!("{prefix}/")) {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            match rest.split_once('/') {
                Some((folder, _)) => {
                    if !folders.iter().any(|f| f == folder) {
                        folders.push(folder.to_string());
                        entries.push(json!({ "name": folder, "metadata": null }));
                    }
                }
                None => entries.push(json!({
                    "name": rest,
                    "metadata": { "size": body.len(), "mimetype": "text/plain" }
                })),
            }
        }
        Ok(entries
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn signed_url(&self, bucket: &str, path: &str, _: u64) -> Result<String, ApiError> {
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| not_found(path))?;
        let url = format!("https://signed.test/{bucket}/{path}");
        self.urls.lock().unwrap().insert(url.clone(), body);
        Ok(url)
    }

    async fn create_bucket(&self, bucket: &Value) -> Result<(), ApiError> {
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.iter().any(|b| b["id"] == bucket["id"]) {
            return Err(ApiError::new(ApiErrorKind::Conflict, "bucket already exists"));
        }
        buckets.push(bucket.clone());
        Ok(())
    }

    async fn upload_object(&self, bucket: &str, path: &str, _: Option<&str>, body: Vec<u8>) -> Result<(), ApiError> {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), path.to_string()), body);
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        self.urls
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| not_found(url))
    }
}

#[derive(Default)]
struct Inner {
    projects: HashMap<String, Arc<FakeProject>>,
    urls: UrlRegistry,
}

/// Projects addressed by ref; the control plane accepts only [`TOKEN`].
#[derive(Clone, Default)]
pub struct FakePlatform {
    inner: Arc<Inner>,
    token: Option<String>,
}

impl FakePlatform {
    pub fn project(&self, project_ref: &str) -> Arc<FakeProject> {
        self.inner.projects[project_ref].clone()
    }

    fn get(&self, project_ref: &str) -> Result<Arc<FakeProject>, ApiError> {
        if self.token.as_deref() != Some(TOKEN) {
            return Err(ApiError::new(ApiErrorKind::Client(401), "invalid management token"));
        }
        self.inner
            .projects
            .get(project_ref)
            .cloned()
            .ok_or_else(|| not_found(project_ref))
    }
}

pub struct PlatformBuilder {
    inner: Inner,
}

impl PlatformBuilder {
    pub fn new() -> Self {
        Self {
            inner: Inner::default(),
        }
    }

    /// Add a project configured by `setup`.
    pub fn project(mut self, project_ref: &str, setup: impl FnOnce(&mut FakeProject)) -> Self {
        let mut project = FakeProject::new(self.inner.urls.clone());
        setup(&mut project);
        self.inner
            .projects
            .insert(project_ref.to_string(), Arc::new(project));
        self
    }

    pub fn build(self) -> FakePlatform {
        FakePlatform {
            inner: Arc::new(self.inner),
            token: None,
        }
    }
}

impl Platform for FakePlatform {
    fn control_plane(&self, management_token: &str) -> Arc<dyn ControlPlane> {
        Arc::new(FakePlatform {
            inner: self.inner.clone(),
            token: Some(management_token.to_string()),
        })
    }

    fn instance(&self, project_ref: &str, _service_key: &str) -> Arc<dyn Instance> {
        self.inner.projects[project_ref].clone()
    }
}

#[async_trait]
impl ControlPlane for FakePlatform {
    async fn service_role_key(&self, project_ref: &str) -> Result<String, ApiError> {
        self.get(project_ref).map(|_| format!("service-key-{project_ref}"))
    }

    async fn run_migration(&self, project_ref: &str, name: &str, query: &str) -> Result<(), ApiError> {
        self.get(project_ref)?.migrate(name, query).await
    }

    async fn query(&self, project_ref: &str, sql: &str) -> Result<Vec<Value>, ApiError> {
        self.get(project_ref)?.sql(sql).await
    }

    async fn list_functions(&self, project_ref: &str) -> Result<Vec<Value>, ApiError> {
        Ok(self.get(project_ref)?.edge_functions.lock().unwrap().clone())
    }

    async fn create_function(&self, project_ref: &str, function: &Value) -> Result<(), ApiError> {
        let project = self.get(project_ref)?;
        let mut functions = project.edge_functions.lock().unwrap();
        if functions.iter().any(|f| f["slug"] == function["slug"]) {
            return Err(ApiError::new(ApiErrorKind::Conflict, "function exists"));
        }
        functions.push(function.clone());
        Ok(())
    }

    async fn auth_config(&self, project_ref: &str) -> Result<Value, ApiError> {
        Ok(self.get(project_ref)?.auth_config.lock().unwrap().clone())
    }

    async fn update_auth_config(&self, project_ref: &str, config: &Value) -> Result<(), ApiError> {
        *self.get(project_ref)?.auth_config.lock().unwrap() = config.clone();
        Ok(())
    }

    async fn project_config(&self, project_ref: &str) -> Result<Value, ApiError> {
        Ok(self.get(project_ref)?.project_config.lock().unwrap().clone())
    }

    async fn update_project_config(&self, project_ref: &str, config: &Value) -> Result<(), ApiError> {
        *self.get(project_ref)?.project_config.lock().unwrap() = config.clone();
        Ok(())
    }
}

/// Metadata for a `users` / `posts` schema with an id sequence.
pub fn blog_schema(project: &mut FakeProject) {
    project.meta.push((
        "tables?".to_string(),
        json!([
            {
                "schema": "public", "name": "users", "rls_enabled": true,
                "primary_keys": [{ "schema": "public", "table_name": "users", "name": "id" }],
                "relationships": [{
                    "constraint_name": "posts_author_id_fkey",
                    "source_schema": "public", "source_table_name": "posts", "source_column_name": "author_id",
                    "target_table_schema": "public", "target_table_name": "users", "target_column_name": "id"
                }]
            },
            {
                "schema": "public", "name": "posts", "rls_enabled": false,
                "primary_keys": [{ "schema": "public", "table_name": "posts", "name": "id" }],
                "relationships": []
            }
        ]),
    ));
    project.meta.push((
        "columns?".to_string(),
        json!([
            { "schema": "public", "table": "users", "name": "id", "data_type": "bigint", "format": "int8",
              "is_nullable": false, "ordinal_position": 1,
              "default_value": "nextval('users_id_seq'::regclass)" },
            { "schema": "public", "table": "users", "name": "email", "data_type": "text", "format": "text",
              "is_nullable": false, "ordinal_position": 2 },
            { "schema": "public", "table": "posts", "name": "id", "data_type": "bigint", "format": "int8",
              "is_nullable": false, "ordinal_position": 1, "is_identity": true, "identity_generation": "BY DEFAULT" },
            { "schema": "public", "table": "posts", "name": "author_id", "data_type": "bigint", "format": "int8",
              "is_nullable": true, "ordinal_position": 2 },
            { "schema": "public", "table": "posts", "name": "title", "data_type": "text", "format": "text",
              "is_nullable": true, "ordinal_position": 3, "default_value": "Untitled" }
        ]),
    ));
    project.meta.push((
        "policies?".to_string(),
        json!([{
            "schema": "public", "table": "users", "name": "own row",
            "action": "PERMISSIVE", "roles": ["authenticated"], "command": "SELECT",
            "definition": "(auth.uid() IS NOT NULL)"
        }]),
    ));
    project.sql.push((
        "pg_sequences".to_string(),
        json!([{
            "schemaname": "public", "sequencename": "users_id_seq", "data_type": "bigint",
            "start_value": 1, "min_value": 1, "max_value": 9223372036854775807_i64,
            "increment_by": 1, "cycle": false, "cache_size": 1, "last_value": 42, "is_called": true
        }]),
    ));
    project.rows.lock().unwrap().insert(
        "users".to_string(),
        vec![
            json!({ "id": 1, "email": "a@example.com" }),
            json!({ "id": 2, "email": "b@example.com" }),
            json!({ "id": 3, "email": "c@example.com" }),
        ],
    );
    project.rows.lock().unwrap().insert(
        "posts".to_string(),
        vec![
            json!({ "id": 10, "author_id": 1, "title": "hello" }),
            json!({ "id": 11, "author_id": 2, "title": "again" }),
        ],
    );
}

/// Minimal `tables` metadata listing `names` with an `id` column each.
pub fn plain_tables(project: &mut FakeProject, names: &[&str]) {
    let tables: Vec<Value> = names
        .iter()
        .map(|n| json!({ "schema": "public", "name": n, "primary_keys": [], "relationships": [] }))
        .collect();
    let columns: Vec<Value> = names
        .iter()
        .map(|n| json!({ "schema": "public", "table": n, "name": "id", "data_type": "bigint", "ordinal_position": 1 }))
        .collect();
    project.meta.push(("tables?".to_string(), Value::Array(tables)));
    project.meta.push(("columns?".to_string(), Value::Array(columns)));
}

pub fn with_storage(project: &mut FakeProject) {
    project
        .buckets
        .lock()
        .unwrap()
        .push(json!({ "id": "avatars", "name": "avatars", "public": true }));
    let mut objects = project.objects.lock().unwrap();
    objects.insert(("avatars".to_string(), "a.txt".to_string()), b"alpha".to_vec());
    objects.insert(("avatars".to_string(), "nested/b.txt".to_string()), b"beta".to_vec());
}

pub async fn snapshot_of(h: &Harness, backup_id: &str) -> Result<snapshot_relay::snapshot::Snapshot> {
    let op = db::get_operation(h.pool(), backup_id).await?.unwrap();
    let path = op.file_path.unwrap();
    let bytes = h.svc.blobs.get(&path).await?;
    snapshot_relay::snapshot::Snapshot::from_slice(&bytes)
}
