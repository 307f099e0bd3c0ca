//! Best-effort discovery of one schema's structure.
//!
//! Each object class is listed by every applicable discovery method in
//! priority order. The first method returning objects is recorded as
//! authoritative, but results from all methods are merged by natural key so a
//! table seen only through REST reflection still gains the columns another
//! method reported. A class is errored only when every method failed, and the
//! whole introspection fails only when no table was found at all.

use crate::error::ApiError;
use crate::platform::{rows_of, Instance};
use crate::snapshot::{
    CatalogObject, CheckConstraint, Column, ColumnRef, CustomGrant, CustomRole, CustomType, Extension,
    ForeignKey, Index, Policy, PrimaryKey, RealtimePublication, RlsStatus, SchemaSection, SchemaUsage, Section,
    Sequence, Snapshot, StoredFunction, Table, Trigger, UniqueConstraint, View,
};
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod sources;

pub use sources::{ObjectClass, Source, SYSTEM_ROLES, SYSTEM_SCHEMAS};

/// Merged objects of one class and the method that first returned any.
#[derive(Debug, Clone)]
pub struct Discovery<T> {
    pub items: Vec<T>,
    pub method: Option<String>,
}

/// Column row as reported by column-level discovery methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableColumn {
    #[serde(default = "crate::snapshot::public", alias = "table_schema")]
    schema: String,
    #[serde(alias = "table_name")]
    table: String,
    #[serde(flatten)]
    column: Column,
}

impl CatalogObject for TableColumn {
    fn natural_key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.column.name)
    }

    fn supplement(&mut self, other: Self) {
        self.column.supplement(other.column);
    }
}

/// Everything discovered for one schema.
#[derive(Debug, Clone)]
pub struct Introspection {
    pub schema: SchemaSection,
    pub extensions: Section<Vec<Extension>>,
    pub custom_types: Section<Vec<CustomType>>,
    pub sequences: Section<Vec<Sequence>>,
    pub check_constraints: Section<Vec<CheckConstraint>>,
    pub unique_constraints: Section<Vec<UniqueConstraint>>,
    pub indexes: Section<Vec<Index>>,
    pub views: Section<Vec<View>>,
    pub materialized_views: Section<Vec<View>>,
    pub triggers: Section<Vec<Trigger>>,
    pub policies: Section<Vec<Policy>>,
    pub realtime_publications: Section<Vec<RealtimePublication>>,
    pub custom_roles: Section<Vec<CustomRole>>,
    pub custom_grants: Section<Vec<CustomGrant>>,
    pub warnings: Vec<String>,
}

impl Introspection {
    /// Move every class into the document.
    pub fn apply(self, snapshot: &mut Snapshot) {
        snapshot.schema = Some(Section::Captured(self.schema));
        snapshot.extensions = Some(self.extensions);
        snapshot.custom_types = Some(self.custom_types);
        snapshot.sequences = Some(self.sequences);
        snapshot.check_constraints = Some(self.check_constraints);
        snapshot.unique_constraints = Some(self.unique_constraints);
        snapshot.indexes = Some(self.indexes);
        snapshot.views = Some(self.views);
        snapshot.materialized_views = Some(self.materialized_views);
        snapshot.triggers = Some(self.triggers);
        snapshot.policies = Some(self.policies);
        snapshot.realtime_publications = Some(self.realtime_publications);
        snapshot.custom_roles = Some(self.custom_roles);
        snapshot.custom_grants = Some(self.custom_grants);
        snapshot.warnings.extend(self.warnings);
    }
}

pub struct Introspector<'a> {
    instance: &'a dyn Instance,
    schema: String,
    meta_cache: Mutex<HashMap<String, Result<Value, ApiError>>>,
}

impl<'a> Introspector<'a> {
    pub fn new(instance: &'a dyn Instance, schema: &str) -> Self {
        Self {
            instance,
            schema: schema.to_string(),
            meta_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Several classes read the same metadata endpoint; fetch it once.
    async fn meta(&self, endpoint: &str) -> Result<Value, ApiError> {
        let mut cache = self.meta_cache.lock().await;
        if let Some(hit) = cache.get(endpoint) {
            return hit.clone();
        }
        let res = self.instance.meta(endpoint).await;
        cache.insert(endpoint.to_string(), res.clone());
        res
    }

    async fn fetch(&self, source: &Source) -> Result<Vec<Value>, ApiError> {
        match source {
            Source::Meta(endpoint) => Ok(rows_of(self.meta(endpoint).await?)),
            Source::MetaNested { endpoint, field } => Ok(rows_of(self.meta(endpoint).await?)
                .into_iter()
                .flat_map(|row| match row.get(*field) {
                    Some(Value::Array(items)) => items.clone(),
                    _ => Vec::new(),
                })
                .collect()),
            Source::Catalog(sql) => self.instance.sql(sql).await,
            Source::Rpc(name) => Ok(rows_of(self.instance.rpc(name, &json!({})).await?)),
            Source::OpenApi => Ok(self
                .instance
                .rest_resources()
                .await?
                .into_iter()
                .map(|name| json!({ "name": name, "schema": self.schema }))
                .collect()),
        }
    }

    /// Try every method for `class` and merge what they return.
    ///
    /// Returns the joined method failures when none succeeded.
    pub async fn discover<T, F>(&self, class: ObjectClass, keep: F) -> Result<Discovery<T>, String>
    where
        T: CatalogObject,
        F: Fn(&T) -> bool,
    {
        let mut items: Vec<T> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut method = None;
        let mut failures = Vec::new();
        let mut any_ok = false;

        for source in class.sources(&self.schema) {
            let label = source.label();
            let rows = match self.fetch(&source).await {
                Ok(rows) => rows,
                Err(err) => {
                    debug!(class = class.as_str(), method = %label, %err, "discovery method failed");
                    failures.push(format!("{label}: {err}"));
                    continue;
                }
            };
            any_ok = true;
            let mut found = 0usize;
            for row in rows {
                let mut item: T = match serde_json::from_value(row) {
                    Ok(item) => item,
                    Err(err) => {
                        debug!(class = class.as_str(), method = %label, %err, "skipping unreadable row");
                        continue;
                    }
                };
                item.normalize();
                if !keep(&item) {
                    continue;
                }
                found += 1;
                let key = item.natural_key();
                match by_key.get(&key) {
                    Some(&idx) => items[idx].supplement(item),
                    None => {
                        by_key.insert(key, items.len());
                        items.push(item);
                    }
                }
            }
            if found > 0 && method.is_none() {
                method = Some(label);
            }
        }

        if !any_ok {
            return Err(failures.join("; "));
        }
        debug!(class = class.as_str(), count = items.len(), method = ?method, "class discovered");
        Ok(Discovery { items, method })
    }

    fn in_schema(&self, schema: &str) -> bool {
        schema == self.schema
    }

    pub async fn run(&self) -> Result<Introspection> {
        let mut methods = BTreeMap::new();
        let mut warnings = Vec::new();

        let tables = self
            .discover::<Table, _>(ObjectClass::Tables, |t| self.in_schema(&t.schema))
            .await;
        let mut tables = match tables {
            Ok(d) if !d.items.is_empty() => record(&mut methods, ObjectClass::Tables, d),
            Ok(_) => bail!("no tables discovered in schema {}", self.schema),
            Err(failures) => bail!("no tables discovered in schema {}: {failures}", self.schema),
        };

        let columns = self
            .discover::<TableColumn, _>(ObjectClass::Columns, |c| self.in_schema(&c.schema))
            .await;
        let primary_keys = self
            .discover::<PrimaryKey, _>(ObjectClass::PrimaryKeys, |k| self.in_schema(&k.schema))
            .await;
        let foreign_keys = self
            .discover::<ForeignKey, _>(ObjectClass::ForeignKeys, |k| self.in_schema(&k.source_schema))
            .await;
        let policies = self
            .discover::<Policy, _>(ObjectClass::Policies, |p| self.in_schema(&p.schema))
            .await;
        let functions = self
            .discover::<StoredFunction, _>(ObjectClass::Functions, |f| self.in_schema(&f.schema))
            .await;
        let schema_usage = self
            .discover::<SchemaUsage, _>(ObjectClass::SchemaUsage, |s| {
                s.object_count.unwrap_or(0) > 0 && !SYSTEM_SCHEMAS.contains(&s.schema.as_str())
            })
            .await;

        let columns = optional(&mut methods, &mut warnings, ObjectClass::Columns, columns);
        let primary_keys = optional(&mut methods, &mut warnings, ObjectClass::PrimaryKeys, primary_keys);
        let relationships = optional(&mut methods, &mut warnings, ObjectClass::ForeignKeys, foreign_keys);
        let functions = optional(&mut methods, &mut warnings, ObjectClass::Functions, functions);
        let schemas = optional(&mut methods, &mut warnings, ObjectClass::SchemaUsage, schema_usage);

        attach_columns(&mut tables, columns);
        attach_primary_keys(&mut tables, &primary_keys);
        attach_references(&mut tables, &relationships);
        for table in &mut tables {
            table.normalize();
        }

        let policies = section(&mut methods, ObjectClass::Policies, policies);
        let unknown = detect_rls(&mut tables, policies.captured().map(Vec::as_slice).unwrap_or(&[]));
        if unknown > 0 {
            warnings.push(format!(
                "row level security status unknown for {unknown} table(s); review policies after restore"
            ));
        }

        let other_schemas: Vec<&str> = schemas
            .iter()
            .map(|s| s.schema.as_str())
            .filter(|s| *s != self.schema)
            .collect();
        if !other_schemas.is_empty() {
            warnings.push(format!(
                "objects found in other schemas ({}); only {} is fully captured",
                other_schemas.join(", "),
                self.schema
            ));
        }

        let schema_name = self.schema.clone();
        let extensions = self
            .discover::<Extension, _>(ObjectClass::Extensions, |e| {
                e.installed_version.is_some() && e.name != "plpgsql"
            })
            .await;
        let custom_types = self
            .discover::<CustomType, _>(ObjectClass::CustomTypes, |t| {
                t.schema == schema_name && !t.enums.is_empty()
            })
            .await;
        let sequences = self
            .discover::<Sequence, _>(ObjectClass::Sequences, |s| self.in_schema(&s.schema))
            .await;
        let check_constraints = self
            .discover::<CheckConstraint, _>(ObjectClass::CheckConstraints, |c| self.in_schema(&c.schema))
            .await;
        let unique_constraints = self
            .discover::<UniqueConstraint, _>(ObjectClass::UniqueConstraints, |c| self.in_schema(&c.schema))
            .await;
        let indexes = self
            .discover::<Index, _>(ObjectClass::Indexes, |i| self.in_schema(&i.schema) && !i.name.is_empty())
            .await;
        let views = self
            .discover::<View, _>(ObjectClass::Views, |v| self.in_schema(&v.schema))
            .await;
        let materialized_views = self
            .discover::<View, _>(ObjectClass::MaterializedViews, |v| self.in_schema(&v.schema))
            .await;
        let triggers = self
            .discover::<Trigger, _>(ObjectClass::Triggers, |t| self.in_schema(&t.schema))
            .await;
        let realtime_publications = self
            .discover::<RealtimePublication, _>(ObjectClass::RealtimePublications, |_| true)
            .await;
        let custom_roles = self
            .discover::<CustomRole, _>(ObjectClass::CustomRoles, |r| {
                !r.name.starts_with("pg_") && !SYSTEM_ROLES.contains(&r.name.as_str())
            })
            .await;
        let custom_grants = self
            .discover::<CustomGrant, _>(ObjectClass::CustomGrants, |g| {
                self.in_schema(&g.schema)
                    && !g.grantee.starts_with("pg_")
                    && !SYSTEM_ROLES.contains(&g.grantee.as_str())
            })
            .await;

        let custom_roles = section(&mut methods, ObjectClass::CustomRoles, custom_roles);
        if custom_roles.captured().is_some_and(|r| !r.is_empty()) {
            warnings.push("custom database roles were captured but are not recreated; create them on the target manually".to_string());
        }
        let realtime_publications =
            section(&mut methods, ObjectClass::RealtimePublications, realtime_publications);
        if realtime_publications
            .captured()
            .is_some_and(|p| p.iter().any(|p| !p.tables.is_empty()))
        {
            warnings.push("realtime publications were captured; re-enable realtime for these tables on the target".to_string());
        }

        let mut out = Introspection {
            extensions: section(&mut methods, ObjectClass::Extensions, extensions),
            custom_types: section(&mut methods, ObjectClass::CustomTypes, custom_types),
            sequences: section(&mut methods, ObjectClass::Sequences, sequences),
            check_constraints: section(&mut methods, ObjectClass::CheckConstraints, check_constraints),
            unique_constraints: section(&mut methods, ObjectClass::UniqueConstraints, unique_constraints),
            indexes: section(&mut methods, ObjectClass::Indexes, indexes),
            views: section(&mut methods, ObjectClass::Views, views),
            materialized_views: section(&mut methods, ObjectClass::MaterializedViews, materialized_views),
            triggers: section(&mut methods, ObjectClass::Triggers, triggers),
            custom_grants: section(&mut methods, ObjectClass::CustomGrants, custom_grants),
            policies,
            realtime_publications,
            custom_roles,
            schema: SchemaSection {
                tables,
                relationships,
                functions,
                schemas,
                methods: BTreeMap::new(),
            },
            warnings,
        };
        out.schema.methods = methods;

        info!(
            schema = %self.schema,
            tables = out.schema.tables.len(),
            functions = out.schema.functions.len(),
            method = out.schema.methods.get("tables").map(String::as_str).unwrap_or("-"),
            "schema introspected"
        );
        Ok(out)
    }
}

/// Introspect `schema` on `instance`.
pub async fn introspect(instance: &dyn Instance, schema: &str) -> Result<Introspection> {
    Introspector::new(instance, schema).run().await
}

fn record<T>(methods: &mut BTreeMap<String, String>, class: ObjectClass, d: Discovery<T>) -> Vec<T> {
    if let Some(method) = d.method {
        info!(class = class.as_str(), %method, count = d.items.len(), "authoritative method");
        methods.insert(class.as_str().to_string(), method);
    }
    d.items
}

fn section<T>(
    methods: &mut BTreeMap<String, String>,
    class: ObjectClass,
    res: Result<Discovery<T>, String>,
) -> Section<Vec<T>> {
    match res {
        Ok(d) => Section::Captured(record(methods, class, d)),
        Err(failures) => {
            warn!(class = class.as_str(), %failures, "every discovery method failed");
            Section::failed(failures)
        }
    }
}

/// Classes folded into the schema section; a failure becomes a warning.
fn optional<T>(
    methods: &mut BTreeMap<String, String>,
    warnings: &mut Vec<String>,
    class: ObjectClass,
    res: Result<Discovery<T>, String>,
) -> Vec<T> {
    match section(methods, class, res) {
        Section::Captured(items) => items,
        Section::Failed(e) => {
            warnings.push(format!("{} could not be discovered: {}", class.as_str(), e.error));
            Vec::new()
        }
    }
}

fn find_table<'t>(tables: &'t mut [Table], schema: &str, name: &str) -> Option<&'t mut Table> {
    tables.iter_mut().find(|t| t.schema == schema && t.name == name)
}

fn attach_columns(tables: &mut [Table], columns: Vec<TableColumn>) {
    for tc in columns {
        let Some(table) = find_table(tables, &tc.schema, &tc.table) else {
            continue;
        };
        match table.columns.iter_mut().find(|c| c.name == tc.column.name) {
            Some(existing) => existing.supplement(tc.column),
            None => table.columns.push(tc.column),
        }
    }
}

fn attach_primary_keys(tables: &mut [Table], keys: &[PrimaryKey]) {
    for key in keys {
        if let Some(table) = find_table(tables, &key.schema, &key.table_name) {
            if !table.primary_keys.contains(&key.name) {
                table.primary_keys.push(key.name.clone());
            }
        }
    }
}

fn attach_references(tables: &mut [Table], keys: &[ForeignKey]) {
    for key in keys {
        let Some(table) = find_table(tables, &key.source_schema, &key.source_table_name) else {
            continue;
        };
        if let Some(col) = table.columns.iter_mut().find(|c| c.name == key.source_column_name) {
            if col.references.is_none() {
                col.references = Some(ColumnRef {
                    constraint: Some(key.constraint_name.clone()),
                    schema: key.target_table_schema.clone(),
                    table: key.target_table_name.clone(),
                    column: key.target_column_name.clone(),
                });
            }
        }
    }
}

/// Resolve RLS status per table; returns how many stay unknown.
fn detect_rls(tables: &mut [Table], policies: &[Policy]) -> usize {
    let mut unknown = 0;
    for table in tables.iter_mut() {
        match table.rls_enabled {
            Some(enabled) => {
                table.rls_status = if enabled { RlsStatus::Enabled } else { RlsStatus::Disabled };
                table.rls_detection = Some("explicit".to_string());
            }
            None if policies
                .iter()
                .any(|p| p.schema == table.schema && p.table == table.name) =>
            {
                table.rls_status = RlsStatus::Enabled;
                table.rls_detection = Some("inferred".to_string());
            }
            None => {
                table.rls_status = RlsStatus::Unknown;
                table.rls_detection = Some("unknown".to_string());
                unknown += 1;
            }
        }
    }
    unknown
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiErrorKind;
    use crate::platform::Page;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers metadata endpoints by prefix and SQL by substring; everything else fails.
    #[derive(Default)]
    struct Scripted {
        meta: Vec<(&'static str, Value)>,
        sql: Vec<(&'static str, Value)>,
        rest: Option<Vec<String>>,
        meta_calls: AtomicUsize,
    }

    fn missing(what: &str) -> ApiError {
        ApiError::new(ApiErrorKind::NotFound, format!("{what} unavailable"))
    }

    #[async_trait]
    impl Instance for Scripted {
        async fn meta(&self, endpoint: &str) -> Result<Value, ApiError> {
            self.meta_calls.fetch_add(1, Ordering::SeqCst);
            self.meta
                .iter()
                .find(|(prefix, _)| endpoint.starts_with(prefix))
                .map(|(_, v)| v.clone())
                .ok_or_else(|| missing(endpoint))
        }
        async fn sql(&self, query: &str) -> Result<Vec<Value>, ApiError> {
            self.sql
                .iter()
                .find(|(needle, _)| query.contains(needle))
                .map(|(_, v)| rows_of(v.clone()))
                .ok_or_else(|| ApiError::new(ApiErrorKind::Client(400), "exec_sql missing"))
        }
        async fn rpc(&self, name: &str, _: &Value) -> Result<Value, ApiError> {
            Err(missing(name))
        }
        async fn rest_resources(&self) -> Result<Vec<String>, ApiError> {
            self.rest.clone().ok_or_else(|| missing("openapi"))
        }
        async fn fetch_page(&self, _: &str, _: u64, _: u64) -> Result<Page, ApiError> {
            unimplemented!()
        }
        async fn table_exists(&self, _: &str) -> Result<bool, ApiError> {
            unimplemented!()
        }
        async fn insert_rows(&self, _: &str, _: &[Value]) -> Result<(), ApiError> {
            unimplemented!()
        }
        async fn list_buckets(&self) -> Result<Vec<Value>, ApiError> {
            unimplemented!()
        }
        async fn list_objects(&self, _: &str, _: &str, _: u64, _: u64) -> Result<Vec<Value>, ApiError> {
            unimplemented!()
        }
        async fn signed_url(&self, _: &str, _: &str, _: u64) -> Result<String, ApiError> {
            unimplemented!()
        }
        async fn create_bucket(&self, _: &Value) -> Result<(), ApiError> {
            unimplemented!()
        }
        async fn upload_object(&self, _: &str, _: &str, _: Option<&str>, _: Vec<u8>) -> Result<(), ApiError> {
            unimplemented!()
        }
        async fn download(&self, _: &str) -> Result<Vec<u8>, ApiError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn rest_discovered_table_gains_catalog_columns() {
        let inst = Scripted {
            sql: vec![
                ("information_schema.tables", json!([])),
                (
                    "information_schema.columns",
                    json!([
                        {"table_schema": "public", "table_name": "notes", "column_name": "body",
                         "data_type": "text", "is_nullable": "YES", "ordinal_position": 2},
                        {"table_schema": "public", "table_name": "notes", "column_name": "id",
                         "data_type": "bigint", "is_nullable": "NO", "ordinal_position": 1}
                    ]),
                ),
            ],
            rest: Some(vec!["notes".to_string()]),
            ..Default::default()
        };
        let out = introspect(&inst, "public").await.unwrap();
        let table = &out.schema.tables[0];
        assert_eq!(table.qualified(), "public.notes");
        let names: Vec<_> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["id", "body"]);
        assert_eq!(out.schema.methods.get("tables").map(String::as_str), Some("openapi"));
        assert_eq!(out.schema.methods.get("columns").map(String::as_str), Some("catalog"));
        // views etc. had no working method
        assert!(out.views.error().is_some());
    }

    #[tokio::test]
    async fn merges_methods_and_keeps_first_authoritative() {
        let inst = Scripted {
            meta: vec![(
                "tables",
                json!([{
                    "schema": "public", "name": "users", "rls_enabled": true,
                    "primary_keys": [{"schema": "public", "table_name": "users", "name": "id"}],
                    "relationships": [{
                        "constraint_name": "posts_author_fkey",
                        "source_schema": "public", "source_table_name": "posts", "source_column_name": "author_id",
                        "target_table_schema": "public", "target_table_name": "users", "target_column_name": "id"
                    }]
                }]),
            )],
            sql: vec![
                (
                    "information_schema.tables",
                    json!([{"schema": "public", "name": "users"}, {"schema": "public", "name": "posts"}]),
                ),
                (
                    "information_schema.columns",
                    json!([
                        {"table_name": "users", "column_name": "id", "data_type": "uuid", "ordinal_position": 1},
                        {"table_name": "posts", "column_name": "author_id", "data_type": "uuid", "ordinal_position": 1}
                    ]),
                ),
            ],
            ..Default::default()
        };
        let out = introspect(&inst, "public").await.unwrap();
        assert_eq!(out.schema.tables.len(), 2);
        assert_eq!(out.schema.methods["tables"], "pg-meta");

        let users = out.schema.tables.iter().find(|t| t.name == "users").unwrap();
        assert_eq!(users.primary_keys, vec!["id".to_string()]);
        assert_eq!(users.rls_status, RlsStatus::Enabled);
        assert_eq!(users.rls_detection.as_deref(), Some("explicit"));

        let posts = out.schema.tables.iter().find(|t| t.name == "posts").unwrap();
        let fk = posts.columns[0].references.as_ref().unwrap();
        assert_eq!((fk.table.as_str(), fk.column.as_str()), ("users", "id"));
        assert_eq!(out.schema.relationships.len(), 1);
    }

    #[tokio::test]
    async fn metadata_endpoint_is_fetched_once() {
        let inst = Scripted {
            meta: vec![("tables", json!([{"schema": "public", "name": "t", "primary_keys": ["id"]}]))],
            ..Default::default()
        };
        let intro = Introspector::new(&inst, "public");
        intro.discover::<Table, _>(ObjectClass::Tables, |_| true).await.unwrap();
        let keys = intro
            .discover::<PrimaryKey, _>(ObjectClass::PrimaryKeys, |_| true)
            .await
            .unwrap();
        intro.discover::<ForeignKey, _>(ObjectClass::ForeignKeys, |_| true).await.unwrap();
        // plain strings carry no table identity
        assert!(keys.items.is_empty());
        assert_eq!(inst.meta_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rls_inferred_from_policies_or_unknown() {
        let inst = Scripted {
            sql: vec![
                (
                    "information_schema.tables",
                    json!([{"schema": "public", "name": "a"}, {"schema": "public", "name": "b"}]),
                ),
                (
                    "pg_policies WHERE schemaname = 'public'",
                    json!([{"schemaname": "public", "tablename": "a", "policyname": "own rows",
                            "cmd": "SELECT", "roles": "{authenticated}", "qual": "(auth.uid() = owner)"}]),
                ),
            ],
            ..Default::default()
        };
        let out = introspect(&inst, "public").await.unwrap();
        let a = out.schema.tables.iter().find(|t| t.name == "a").unwrap();
        let b = out.schema.tables.iter().find(|t| t.name == "b").unwrap();
        assert_eq!(a.rls_status, RlsStatus::Enabled);
        assert_eq!(a.rls_detection.as_deref(), Some("inferred"));
        assert_eq!(b.rls_status, RlsStatus::Unknown);
        assert!(out.warnings.iter().any(|w| w.contains("unknown for 1 table")));
        let policies = out.policies.captured().unwrap();
        assert_eq!(policies[0].roles, vec!["authenticated".to_string()]);
    }

    #[tokio::test]
    async fn no_tables_is_fatal() {
        let inst = Scripted::default();
        let err = introspect(&inst, "public").await.unwrap_err();
        assert!(err.to_string().contains("no tables discovered"));

        let empty = Scripted {
            sql: vec![("information_schema.tables", json!([]))],
            ..Default::default()
        };
        assert!(introspect(&empty, "public").await.is_err());
    }

    #[tokio::test]
    async fn filters_and_completeness_warnings() {
        let inst = Scripted {
            meta: vec![(
                "extensions",
                json!([
                    {"name": "pgcrypto", "schema": "extensions", "installed_version": "1.3"},
                    {"name": "postgis", "installed_version": null},
                    {"name": "plpgsql", "schema": "pg_catalog", "installed_version": "1.0"}
                ]),
            )],
            sql: vec![
                ("information_schema.tables", json!([{"schema": "public", "name": "t"}])),
                (
                    "FROM pg_roles",
                    json!([{"rolname": "reporting", "rolcanlogin": true}, {"rolname": "anon"}]),
                ),
                ("pg_publication_tables", json!([{"pubname": "supabase_realtime", "tables": ["public.t"]}])),
                (
                    "object_count",
                    json!([{"schema": "public", "object_count": 3}, {"schema": "billing", "object_count": "2"},
                           {"schema": "auth", "object_count": 9}]),
                ),
            ],
            ..Default::default()
        };
        let out = introspect(&inst, "public").await.unwrap();
        let ext: Vec<_> = out.extensions.captured().unwrap().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(ext, vec!["pgcrypto"]);
        let roles = out.custom_roles.captured().unwrap();
        assert_eq!(roles.len(), 1);
        assert!(out.warnings.iter().any(|w| w.contains("custom database roles")));
        assert!(out.warnings.iter().any(|w| w.contains("realtime")));
        assert!(out.warnings.iter().any(|w| w.contains("billing")));
    }
}
