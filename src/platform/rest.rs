use super::{rows_of, ControlPlane, Instance, Page, Platform};
use crate::config::Config;
use crate::error::{ApiError, ApiErrorKind};
use crate::http::{parse_content_range, send, send_json, with_retry, RetryPolicy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Builds reqwest-backed clients from configuration.
#[derive(Clone)]
pub struct RestPlatform {
    http: Client,
    api_url: Url,
    instance_template: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl fmt::Debug for RestPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestPlatform")
            .field("api_url", &self.api_url)
            .field("instance_template", &self.instance_template)
            .finish_non_exhaustive()
    }
}

impl RestPlatform {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let http = Client::builder()
            .user_agent("snapshot-relay/0.1")
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;
        let api_url = Url::parse(&cfg.platform.api_url).context("invalid platform.api_url")?;
        Ok(Self {
            http,
            api_url,
            instance_template: cfg.platform.instance_url_template.clone(),
            timeout: cfg.request_timeout(),
            retry: RetryPolicy::from_config(&cfg.platform),
        })
    }
}

impl Platform for RestPlatform {
    fn control_plane(&self, management_token: &str) -> Arc<dyn ControlPlane> {
        Arc::new(ManagementClient {
            http: self.http.clone(),
            base: self.api_url.clone(),
            token: management_token.to_string(),
            timeout: self.timeout,
            retry: self.retry,
        })
    }

    fn instance(&self, project_ref: &str, service_key: &str) -> Arc<dyn Instance> {
        let raw = self.instance_template.replace("{ref}", project_ref);
        let raw = if raw.ends_with('/') { raw } else { format!("{raw}/") };
        // The template is validated at load time; a bad ref surfaces on first call.
        let base = Url::parse(&raw).ok();
        Arc::new(InstanceClient {
            http: self.http.clone(),
            base,
            raw_base: raw,
            key: service_key.to_string(),
            timeout: self.timeout,
            retry: self.retry,
        })
    }
}

fn bad_url(what: &str, err: impl fmt::Display) -> ApiError {
    ApiError::new(ApiErrorKind::Client(400), format!("invalid URL for {what}: {err}"))
}

async fn call_json<T: DeserializeOwned>(
    retry: &RetryPolicy,
    timeout: Duration,
    what: &str,
    build: impl Fn() -> Result<RequestBuilder, ApiError>,
) -> Result<T, ApiError> {
    with_retry(retry, what, move || {
        let req = build();
        async move { send_json(req?, timeout, what).await }
    })
    .await
}

async fn call_unit(
    retry: &RetryPolicy,
    timeout: Duration,
    what: &str,
    build: impl Fn() -> Result<RequestBuilder, ApiError>,
) -> Result<(), ApiError> {
    with_retry(retry, what, move || {
        let req = build();
        async move { send(req?, timeout, what).await.map(|_| ()) }
    })
    .await
}

#[derive(Clone)]
pub struct ManagementClient {
    http: Client,
    base: Url,
    token: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl fmt::Debug for ManagementClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagementClient")
            .field("base", &self.base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ApiKey {
    name: String,
    api_key: Option<String>,
}

impl ManagementClient {
    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let url = self.base.join(path).map_err(|e| bad_url(path, e))?;
        Ok(self.http.request(method, url).bearer_auth(&self.token))
    }
}

#[async_trait]
impl ControlPlane for ManagementClient {
    async fn service_role_key(&self, project_ref: &str) -> Result<String, ApiError> {
        let path = format!("v1/projects/{project_ref}/api-keys?reveal=true");
        let keys: Vec<ApiKey> = call_json(&self.retry, self.timeout, "api-keys", || {
            self.request(Method::GET, &path)
        })
        .await?;
        keys.into_iter()
            .find(|k| k.name == "service_role")
            .and_then(|k| k.api_key)
            .ok_or_else(|| ApiError::new(ApiErrorKind::NotFound, "service_role key not found"))
    }

    async fn run_migration(&self, project_ref: &str, name: &str, query: &str) -> Result<(), ApiError> {
        // Statement-level retries are decided by the caller.
        let path = format!("v1/projects/{project_ref}/database/migrations");
        let req = self
            .request(Method::POST, &path)?
            .json(&json!({ "name": name, "query": query }));
        debug!(name, "submitting migration");
        send(req, self.timeout, "migration").await.map(|_| ())
    }

    async fn query(&self, project_ref: &str, sql: &str) -> Result<Vec<Value>, ApiError> {
        let path = format!("v1/projects/{project_ref}/database/query");
        let value: Value = call_json(&self.retry, self.timeout, "query", || {
            Ok(self.request(Method::POST, &path)?.json(&json!({ "query": sql })))
        })
        .await?;
        Ok(rows_of(value))
    }

    async fn list_functions(&self, project_ref: &str) -> Result<Vec<Value>, ApiError> {
        let path = format!("v1/projects/{project_ref}/functions");
        let value: Value = call_json(&self.retry, self.timeout, "functions", || {
            self.request(Method::GET, &path)
        })
        .await?;
        Ok(rows_of(value))
    }

    async fn create_function(&self, project_ref: &str, function: &Value) -> Result<(), ApiError> {
        let path = format!("v1/projects/{project_ref}/functions");
        call_unit(&self.retry, self.timeout, "create function", || {
            Ok(self.request(Method::POST, &path)?.json(function))
        })
        .await
    }

    async fn auth_config(&self, project_ref: &str) -> Result<Value, ApiError> {
        let path = format!("v1/projects/{project_ref}/config/auth");
        call_json(&self.retry, self.timeout, "auth config", || {
            self.request(Method::GET, &path)
        })
        .await
    }

    async fn update_auth_config(&self, project_ref: &str, config: &Value) -> Result<(), ApiError> {
        let path = format!("v1/projects/{project_ref}/config/auth");
        call_unit(&self.retry, self.timeout, "update auth config", || {
            Ok(self.request(Method::PATCH, &path)?.json(config))
        })
        .await
    }

    async fn project_config(&self, project_ref: &str) -> Result<Value, ApiError> {
        let path = format!("v1/projects/{project_ref}/config/database/postgres");
        call_json(&self.retry, self.timeout, "project config", || {
            self.request(Method::GET, &path)
        })
        .await
    }

    async fn update_project_config(&self, project_ref: &str, config: &Value) -> Result<(), ApiError> {
        let path = format!("v1/projects/{project_ref}/config/database/postgres");
        call_unit(&self.retry, self.timeout, "update project config", || {
            Ok(self.request(Method::PUT, &path)?.json(config))
        })
        .await
    }
}

#[derive(Clone)]
pub struct InstanceClient {
    http: Client,
    base: Option<Url>,
    raw_base: String,
    key: String,
    timeout: Duration,
    retry: RetryPolicy,
}

impl fmt::Debug for InstanceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceClient")
            .field("base", &self.raw_base)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SignedUrl {
    #[serde(alias = "signedURL", alias = "signedUrl")]
    signed_url: String,
}

impl InstanceClient {
    fn url(&self, path: &str) -> Result<Url, ApiError> {
        let base = self
            .base
            .as_ref()
            .ok_or_else(|| bad_url(&self.raw_base, "unparseable instance base"))?;
        base.join(path).map_err(|e| bad_url(path, e))
    }

    /// Base URL extended by `segments`, each encoded as one path segment.
    fn segment_url(&self, segments: &[&str], query: Option<&str>) -> Result<Url, ApiError> {
        let mut url = self.url("")?;
        url.path_segments_mut()
            .map_err(|_| bad_url(&self.raw_base, "cannot be a base"))?
            .pop_if_empty()
            .extend(segments);
        url.set_query(query);
        Ok(url)
    }

    /// URL of an object; `/` in `path` separates folders.
    fn object_url(&self, action: &[&str], bucket: &str, path: &str) -> Result<Url, ApiError> {
        let mut segments = vec!["storage", "v1", "object"];
        segments.extend_from_slice(action);
        segments.push(bucket);
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.segment_url(&segments, None)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        Ok(self.request_url(method, self.url(path)?))
    }

    fn request_url(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("apikey", &self.key)
            .bearer_auth(&self.key)
    }
}

#[async_trait]
impl Instance for InstanceClient {
    async fn meta(&self, endpoint: &str) -> Result<Value, ApiError> {
        let primary = format!("pg/meta/{endpoint}");
        match call_json(&self.retry, self.timeout, "pg-meta", || {
            self.request(Method::GET, &primary)
        })
        .await
        {
            Err(err) if err.is_not_found() => {
                debug!(endpoint, "metadata service not at pg/meta, trying legacy path");
                let legacy = format!("pg-meta/{endpoint}");
                call_json(&self.retry, self.timeout, "pg-meta", || {
                    self.request(Method::GET, &legacy)
                })
                .await
            }
            other => other,
        }
    }

    async fn sql(&self, query: &str) -> Result<Vec<Value>, ApiError> {
        let value: Value = call_json(&self.retry, self.timeout, "exec_sql", || {
            Ok(self
                .request(Method::POST, "rest/v1/rpc/exec_sql")?
                .json(&json!({ "query": query })))
        })
        .await?;
        Ok(rows_of(value))
    }

    async fn rpc(&self, function: &str, args: &Value) -> Result<Value, ApiError> {
        let url = self.segment_url(&["rest", "v1", "rpc", function], None)?;
        call_json(&self.retry, self.timeout, "rpc", || {
            Ok(self.request_url(Method::POST, url.clone()).json(args))
        })
        .await
    }

    async fn rest_resources(&self) -> Result<Vec<String>, ApiError> {
        let doc: Value = call_json(&self.retry, self.timeout, "openapi", || {
            self.request(Method::GET, "rest/v1/")
        })
        .await?;
        let mut names: Vec<String> = doc
            .get("paths")
            .and_then(Value::as_object)
            .map(|paths| {
                paths
                    .keys()
                    .filter_map(|p| p.strip_prefix('/'))
                    .filter(|p| !p.is_empty() && !p.starts_with("rpc/"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn fetch_page(&self, table: &str, offset: u64, limit: u64) -> Result<Page, ApiError> {
        let url = self.segment_url(&["rest", "v1", table], Some("select=*"))?;
        let range = format!("{}-{}", offset, offset + limit.max(1) - 1);
        let timeout = self.timeout;
        with_retry(&self.retry, "fetch page", || {
            let req = self
                .request_url(Method::GET, url.clone())
                .header("Range-Unit", "items")
                .header("Range", range.as_str())
                .header("Prefer", "count=exact");
            async move {
                let response = send(req, timeout, "fetch page").await?;
                let total = response
                    .headers()
                    .get("content-range")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range);
                let rows: Vec<Value> = response.json().await.map_err(ApiError::from_reqwest)?;
                Ok(Page { rows, total })
            }
        })
        .await
    }

    async fn table_exists(&self, table: &str) -> Result<bool, ApiError> {
        let url = self.segment_url(&["rest", "v1", table], Some("select=*&limit=0"))?;
        match call_unit(&self.retry, self.timeout, "table check", || {
            Ok(self.request_url(Method::GET, url.clone()))
        })
        .await
        {
            Ok(()) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }

    async fn insert_rows(&self, table: &str, rows: &[Value]) -> Result<(), ApiError> {
        let url = self.segment_url(&["rest", "v1", table], None)?;
        call_unit(&self.retry, self.timeout, "insert rows", || {
            Ok(self
                .request_url(Method::POST, url.clone())
                .header("Prefer", "resolution=ignore-duplicates,return=minimal")
                .json(rows))
        })
        .await
    }

    async fn list_buckets(&self) -> Result<Vec<Value>, ApiError> {
        let value: Value = call_json(&self.retry, self.timeout, "list buckets", || {
            self.request(Method::GET, "storage/v1/bucket")
        })
        .await?;
        Ok(rows_of(value))
    }

    async fn list_objects(&self, bucket: &str, prefix: &str, offset: u64, limit: u64) -> Result<Vec<Value>, ApiError> {
        let url = self.segment_url(&["storage", "v1", "object", "list", bucket], None)?;
        let body = json!({
            "prefix": prefix,
            "limit": limit,
            "offset": offset,
            "sortBy": { "column": "name", "order": "asc" },
        });
        let value: Value = call_json(&self.retry, self.timeout, "list objects", || {
            Ok(self.request_url(Method::POST, url.clone()).json(&body))
        })
        .await?;
        Ok(rows_of(value))
    }

    async fn signed_url(&self, bucket: &str, path: &str, expires_in_secs: u64) -> Result<String, ApiError> {
        let endpoint = self.object_url(&["sign"], bucket, path)?;
        let signed: SignedUrl = call_json(&self.retry, self.timeout, "sign object", || {
            Ok(self
                .request_url(Method::POST, endpoint.clone())
                .json(&json!({ "expiresIn": expires_in_secs })))
        })
        .await?;
        if signed.signed_url.starts_with("http") {
            return Ok(signed.signed_url);
        }
        let url = self.url(&format!(
            "storage/v1/{}",
            signed.signed_url.trim_start_matches('/')
        ))?;
        Ok(url.to_string())
    }

    async fn create_bucket(&self, bucket: &Value) -> Result<(), ApiError> {
        call_unit(&self.retry, self.timeout, "create bucket", || {
            Ok(self.request(Method::POST, "storage/v1/bucket")?.json(bucket))
        })
        .await
    }

    async fn upload_object(
        &self,
        bucket: &str,
        path: &str,
        content_type: Option<&str>,
        body: Vec<u8>,
    ) -> Result<(), ApiError> {
        let endpoint = self.object_url(&[], bucket, path)?;
        let content_type = content_type.unwrap_or("application/octet-stream").to_string();
        call_unit(&self.retry, self.timeout, "upload object", || {
            Ok(self
                .request_url(Method::POST, endpoint.clone())
                .header("Content-Type", content_type.as_str())
                .header("x-upsert", "true")
                .body(body.clone()))
        })
        .await
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, ApiError> {
        let parsed = Url::parse(url).map_err(|e| bad_url("download", e))?;
        let timeout = self.timeout;
        with_retry(&self.retry, "download", || {
            let req = self.http.get(parsed.clone());
            async move {
                let response = send(req, timeout, "download").await?;
                let bytes = response.bytes().await.map_err(ApiError::from_reqwest)?;
                Ok(bytes.to_vec())
            }
        })
        .await
        .map_err(|err| {
            warn!(%err, "object download failed");
            err
        })
    }
}
