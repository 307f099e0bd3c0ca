use super::{captured, Snapshot, TableData};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableReport {
    pub name: String,
    pub columns: usize,
    pub rows: Option<usize>,
    pub rls: String,
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatabaseReport {
    pub tables: usize,
    pub columns: usize,
    pub rows: usize,
    pub policies: usize,
    pub functions: usize,
    pub triggers: usize,
    pub views: usize,
    pub materialized_views: usize,
    pub sequences: usize,
    pub check_constraints: usize,
    pub unique_constraints: usize,
    pub indexes: usize,
    pub custom_types: usize,
    pub extensions: usize,
    pub table_details: Vec<TableReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageReport {
    pub buckets: usize,
    pub objects: usize,
    pub policies: usize,
    pub total_size: i64,
    pub objects_per_bucket: BTreeMap<String, usize>,
}

/// Structured summary stored on a completed backup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackupReport {
    pub database: DatabaseReport,
    pub storage: StorageReport,
    pub edge_functions: Vec<String>,
    pub auth_providers: Vec<String>,
    pub project_config_captured: bool,
    pub section_errors: BTreeMap<String, String>,
    pub warnings: Vec<String>,
    pub size_bytes: usize,
}

fn len<T>(v: Option<&Vec<T>>) -> usize {
    v.map_or(0, Vec::len)
}

impl BackupReport {
    pub fn build(snapshot: &Snapshot, size_bytes: usize) -> Self {
        let data = captured(&snapshot.data);
        let mut db = DatabaseReport {
            policies: len(captured(&snapshot.policies)),
            triggers: len(captured(&snapshot.triggers)),
            views: len(captured(&snapshot.views)),
            materialized_views: len(captured(&snapshot.materialized_views)),
            sequences: len(captured(&snapshot.sequences)),
            check_constraints: len(captured(&snapshot.check_constraints)),
            unique_constraints: len(captured(&snapshot.unique_constraints)),
            indexes: len(captured(&snapshot.indexes)),
            custom_types: len(captured(&snapshot.custom_types)),
            extensions: len(captured(&snapshot.extensions)),
            ..Default::default()
        };

        if let Some(schema) = snapshot.schema() {
            db.tables = schema.tables.len();
            db.functions = schema.functions.len();
            for table in &schema.tables {
                db.columns += table.columns.len();
                let entry = data.and_then(|d| d.get(&table.name));
                let (rows, error) = match entry {
                    Some(TableData::Rows(rows)) => (Some(rows.len()), None),
                    Some(TableData::Failed(e)) => (None, Some(e.export_error.clone())),
                    None => (None, None),
                };
                db.rows += rows.unwrap_or(0);
                db.table_details.push(TableReport {
                    name: table.name.clone(),
                    columns: table.columns.len(),
                    rows,
                    rls: format!("{:?}", table.rls_status).to_lowercase(),
                    truncated: snapshot.data_truncated.contains_key(&table.name),
                    error,
                });
            }
        }

        let mut storage = StorageReport::default();
        if let Some(section) = captured(&snapshot.storage) {
            storage.buckets = section.buckets.len();
            storage.policies = section.policies.len();
            for bucket in &section.buckets {
                storage.objects += bucket.objects.len();
                storage.total_size += bucket.objects.iter().filter_map(|o| o.size).sum::<i64>();
                storage
                    .objects_per_bucket
                    .insert(bucket.name.clone(), bucket.objects.len());
            }
        }

        let edge_functions = captured(&snapshot.functions)
            .map(|fns| fns.iter().map(|f| f.slug.clone()).collect())
            .unwrap_or_default();

        Self {
            database: db,
            storage,
            edge_functions,
            auth_providers: captured(&snapshot.auth_config)
                .map(enabled_providers)
                .unwrap_or_default(),
            project_config_captured: captured(&snapshot.project_config).is_some(),
            section_errors: snapshot
                .section_errors()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            warnings: snapshot.warnings.clone(),
            size_bytes,
        }
    }
}

/// Providers switched on in an auth config, from `external_<provider>_enabled` flags.
pub fn enabled_providers(auth: &serde_json::Value) -> Vec<String> {
    let Some(obj) = auth.as_object() else {
        return Vec::new();
    };
    obj.iter()
        .filter(|(_, v)| v.as_bool() == Some(true))
        .filter_map(|(k, _)| {
            k.strip_prefix("external_")
                .and_then(|rest| rest.strip_suffix("_enabled"))
                .map(str::to_string)
        })
        .collect()
}
