//! The versioned snapshot document produced by an export and consumed by a restore.
//!
//! Every section is independently optional: a missing field means the
//! component was not requested, `{"error": "..."}` means capture failed.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub mod catalog;
pub mod report;

pub use catalog::*;

pub const FORMAT_VERSION: &str = "2.0";
pub const CAPTURE_VERSION: &str = "2.1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectionError {
    pub error: String,
}

/// A captured section or the reason it could not be captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Section<T> {
    Failed(SectionError),
    Captured(T),
}

impl<T> Section<T> {
    pub fn failed(error: impl Into<String>) -> Self {
        Section::Failed(SectionError {
            error: error.into(),
        })
    }

    pub fn captured(&self) -> Option<&T> {
        match self {
            Section::Captured(v) => Some(v),
            Section::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Section::Failed(e) => Some(&e.error),
            Section::Captured(_) => None,
        }
    }
}

/// Borrow the captured value of an optional section.
pub fn captured<T>(section: &Option<Section<T>>) -> Option<&T> {
    section.as_ref().and_then(Section::captured)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportError {
    #[serde(rename = "_export_error")]
    pub export_error: String,
}

/// Rows of one table, or the reason extraction failed for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableData {
    Rows(Vec<Value>),
    Failed(ExportError),
}

impl TableData {
    pub fn failed(error: impl Into<String>) -> Self {
        TableData::Failed(ExportError {
            export_error: error.into(),
        })
    }

    pub fn rows(&self) -> Option<&[Value]> {
        match self {
            TableData::Rows(rows) => Some(rows),
            TableData::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSection {
    pub tables: Vec<Table>,
    #[serde(default)]
    pub relationships: Vec<ForeignKey>,
    #[serde(default)]
    pub functions: Vec<StoredFunction>,
    #[serde(default)]
    pub schemas: Vec<SchemaUsage>,
    /// Authoritative discovery method per object class.
    #[serde(default)]
    pub methods: BTreeMap<String, String>,
}

impl SchemaSection {
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.name == name || t.qualified() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageObject {
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bucket {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_mime_types: Option<Vec<String>>,
    #[serde(default)]
    pub objects: Vec<StorageObject>,
    /// Listing failure for this bucket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSection {
    pub buckets: Vec<Bucket>,
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub unsigned_objects: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub version: String,
    pub capture_version: String,
    pub timestamp: DateTime<Utc>,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<Section<SchemaSection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Section<Vec<Extension>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_types: Option<Section<Vec<CustomType>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequences: Option<Section<Vec<Sequence>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_constraints: Option<Section<Vec<CheckConstraint>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_constraints: Option<Section<Vec<UniqueConstraint>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub indexes: Option<Section<Vec<Index>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub views: Option<Section<Vec<View>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub materialized_views: Option<Section<Vec<View>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggers: Option<Section<Vec<Trigger>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policies: Option<Section<Vec<Policy>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realtime_publications: Option<Section<Vec<RealtimePublication>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_roles: Option<Section<Vec<CustomRole>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_grants: Option<Section<Vec<CustomGrant>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Section<BTreeMap<String, TableData>>>,
    /// Tables cut at the row ceiling, with their reported row count.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_truncated: BTreeMap<String, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<Section<StorageSection>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub functions: Option<Section<Vec<EdgeFunction>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_config: Option<Section<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_config: Option<Section<Value>>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Snapshot {
    pub fn new(project_id: &str) -> Self {
        Self {
            version: FORMAT_VERSION.to_string(),
            capture_version: CAPTURE_VERSION.to_string(),
            timestamp: Utc::now(),
            project_id: project_id.to_string(),
            schema: None,
            extensions: None,
            custom_types: None,
            sequences: None,
            check_constraints: None,
            unique_constraints: None,
            indexes: None,
            views: None,
            materialized_views: None,
            triggers: None,
            policies: None,
            realtime_publications: None,
            custom_roles: None,
            custom_grants: None,
            data: None,
            data_truncated: BTreeMap::new(),
            storage: None,
            functions: None,
            auth_config: None,
            project_config: None,
            warnings: Vec::new(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("snapshot document is not valid JSON")
    }

    pub fn to_vec_pretty(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn schema(&self) -> Option<&SchemaSection> {
        captured(&self.schema)
    }

    /// Errors of every section that failed, keyed by document field name.
    pub fn section_errors(&self) -> BTreeMap<&'static str, String> {
        let mut out = BTreeMap::new();
        let mut note = |name: &'static str, err: Option<&str>| {
            if let Some(e) = err {
                out.insert(name, e.to_string());
            }
        };
        note("schema", self.schema.as_ref().and_then(Section::error));
        note("extensions", self.extensions.as_ref().and_then(Section::error));
        note("customTypes", self.custom_types.as_ref().and_then(Section::error));
        note("sequences", self.sequences.as_ref().and_then(Section::error));
        note("checkConstraints", self.check_constraints.as_ref().and_then(Section::error));
        note("uniqueConstraints", self.unique_constraints.as_ref().and_then(Section::error));
        note("indexes", self.indexes.as_ref().and_then(Section::error));
        note("views", self.views.as_ref().and_then(Section::error));
        note("materializedViews", self.materialized_views.as_ref().and_then(Section::error));
        note("triggers", self.triggers.as_ref().and_then(Section::error));
        note("policies", self.policies.as_ref().and_then(Section::error));
        note("realtimePublications", self.realtime_publications.as_ref().and_then(Section::error));
        note("customRoles", self.custom_roles.as_ref().and_then(Section::error));
        note("customGrants", self.custom_grants.as_ref().and_then(Section::error));
        note("data", self.data.as_ref().and_then(Section::error));
        note("storage", self.storage.as_ref().and_then(Section::error));
        note("functions", self.functions.as_ref().and_then(Section::error));
        note("authConfig", self.auth_config.as_ref().and_then(Section::error));
        note("projectConfig", self.project_config.as_ref().and_then(Section::error));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sections_distinguish_absent_errored_and_captured() {
        let doc = json!({
            "version": "2.0",
            "captureVersion": "2.1.0",
            "timestamp": "2024-05-01T10:00:00Z",
            "projectId": "abc",
            "schema": {"tables": [{"name": "users"}]},
            "policies": {"error": "pg-meta unavailable"},
            "data": {
                "users": [{"id": 1}],
                "audit": {"_export_error": "permission denied"}
            },
            "authConfig": {"site_url": "https://x"}
        });
        let snap: Snapshot = serde_json::from_value(doc).unwrap();
        assert!(snap.schema().unwrap().has_table("users"));
        assert_eq!(
            snap.policies.as_ref().and_then(Section::error),
            Some("pg-meta unavailable")
        );
        assert!(snap.storage.is_none());
        let data = captured(&snap.data).unwrap();
        assert_eq!(data["users"].rows().unwrap().len(), 1);
        assert!(data["audit"].rows().is_none());
        assert!(captured(&snap.auth_config).is_some());
        assert_eq!(snap.section_errors().keys().collect::<Vec<_>>(), vec![&"policies"]);
    }

    #[test]
    fn errored_sections_serialize_as_error_objects() {
        let mut snap = Snapshot::new("abc");
        snap.storage = Some(Section::failed("list buckets: timeout"));
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["storage"], json!({"error": "list buckets: timeout"}));
        assert!(v.get("schema").is_none());
        assert_eq!(v["captureVersion"], "2.1.0");

        let back = Snapshot::from_slice(&snap.to_vec_pretty().unwrap()).unwrap();
        assert_eq!(back.storage, snap.storage);
    }

    #[test]
    fn empty_table_data_is_rows() {
        let d: TableData = serde_json::from_value(json!([])).unwrap();
        assert_eq!(d, TableData::Rows(vec![]));
    }
}
