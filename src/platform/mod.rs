//! Service traits for the hosted database platform.
//!
//! `ControlPlane` is the administrative API authenticated with a user's
//! management token. `Instance` is one project's data plane authenticated with
//! its service-role key. Pipelines only talk to these traits; `rest` holds the
//! reqwest implementations.

use crate::error::ApiError;
use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use std::sync::Arc;

pub mod rest;

pub use rest::RestPlatform;

/// One page of table rows plus the exact total when the server reported it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Value>,
    pub total: Option<u64>,
}

#[async_trait]
pub trait ControlPlane: Send + Sync + Any {
    /// Service-role key for a project.
    async fn service_role_key(&self, project_ref: &str) -> Result<String, ApiError>;

    /// Apply one named migration. The statement text may hold several statements.
    async fn run_migration(&self, project_ref: &str, name: &str, query: &str) -> Result<(), ApiError>;

    /// Run a read-only query and return its rows.
    async fn query(&self, project_ref: &str, sql: &str) -> Result<Vec<Value>, ApiError>;

    async fn list_functions(&self, project_ref: &str) -> Result<Vec<Value>, ApiError>;

    async fn create_function(&self, project_ref: &str, function: &Value) -> Result<(), ApiError>;

    async fn auth_config(&self, project_ref: &str) -> Result<Value, ApiError>;

    async fn update_auth_config(&self, project_ref: &str, config: &Value) -> Result<(), ApiError>;

    async fn project_config(&self, project_ref: &str) -> Result<Value, ApiError>;

    async fn update_project_config(&self, project_ref: &str, config: &Value) -> Result<(), ApiError>;
}

#[async_trait]
pub trait Instance: Send + Sync + Any {
    /// Structured metadata service endpoint, e.g. `tables` or `policies`.
    async fn meta(&self, endpoint: &str) -> Result<Value, ApiError>;

    /// Run SQL through the instance's SQL RPC and return result rows.
    async fn sql(&self, query: &str) -> Result<Vec<Value>, ApiError>;

    /// Call a named stored procedure.
    async fn rpc(&self, function: &str, args: &Value) -> Result<Value, ApiError>;

    /// Resource names exposed by the REST surface.
    async fn rest_resources(&self) -> Result<Vec<String>, ApiError>;

    /// Rows `[offset, offset + limit)` of `table` with an exact count.
    async fn fetch_page(&self, table: &str, offset: u64, limit: u64) -> Result<Page, ApiError>;

    async fn table_exists(&self, table: &str) -> Result<bool, ApiError>;

    /// Insert rows, skipping rows whose key already exists.
    async fn insert_rows(&self, table: &str, rows: &[Value]) -> Result<(), ApiError>;

    async fn list_buckets(&self) -> Result<Vec<Value>, ApiError>;

    /// One listing page of a bucket folder. Folders come back without metadata.
    async fn list_objects(&self, bucket: &str, prefix: &str, offset: u64, limit: u64) -> Result<Vec<Value>, ApiError>;

    async fn signed_url(&self, bucket: &str, path: &str, expires_in_secs: u64) -> Result<String, ApiError>;

    async fn create_bucket(&self, bucket: &Value) -> Result<(), ApiError>;

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), ApiError>;

    /// Fetch an absolute URL, such as a signed object URL.
    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError>;
}

/// Factory for clients bound to credentials.
pub trait Platform: Send + Sync {
    fn control_plane(&self, management_token: &str) -> Arc<dyn ControlPlane>;

    fn instance(&self, project_ref: &str, service_key: &str) -> Arc<dyn Instance>;
}

/// Normalize a JSON response into a row list.
pub fn rows_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    }
}

/// Quote an identifier for SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for SQL text.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
