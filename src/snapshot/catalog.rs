//! Structural objects captured from a database.
//!
//! The same object can arrive from several discovery methods with different
//! field names, so fields accept the common aliases and lenient scalar forms
//! (`"YES"` for booleans, numeric strings for integers).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// An object that can be merged across discovery methods.
pub trait CatalogObject: DeserializeOwned + Serialize + Clone + Send + Sync + 'static {
    /// Stable identity used to deduplicate discoveries, e.g. `public.users`.
    fn natural_key(&self) -> String;

    /// Fill fields this object lacks from another discovery of the same object.
    fn supplement(&mut self, _other: Self) {}

    /// Derive fields that some methods only provide indirectly.
    fn normalize(&mut self) {}
}

trait Fill {
    fn fill(&mut self, other: Self);
}

impl<T> Fill for Option<T> {
    fn fill(&mut self, other: Self) {
        if self.is_none() {
            *self = other;
        }
    }
}

impl<T> Fill for Vec<T> {
    fn fill(&mut self, other: Self) {
        if self.is_empty() {
            *self = other;
        }
    }
}

macro_rules! fill_fields {
    ($this:ident, $other:ident; $($field:ident),+ $(,)?) => {
        $( Fill::fill(&mut $this.$field, $other.$field); )+
    };
}

pub fn public() -> String {
    "public".to_string()
}

pub(crate) fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Bool(b)) => Some(b),
        Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" | "t" | "y" | "1" => Some(true),
            "no" | "false" | "f" | "n" | "0" => Some(false),
            _ => None,
        },
        Some(Value::Number(n)) => n.as_i64().map(|v| v != 0),
        _ => None,
    })
}

pub(crate) fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Accepts `["a", "b"]`, `"a, b"` or `"{a,b}"`.
pub(crate) fn string_or_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                Value::Null => None,
                // pg-meta nests key columns as objects with a `name`.
                Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(s)) => s
            .trim_matches(|c| c == '{' || c == '}')
            .split(',')
            .map(|p| p.trim().trim_matches('"').to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RlsStatus {
    Enabled,
    Disabled,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default = "public", alias = "table_schema", alias = "schemaname")]
    pub schema: String,
    #[serde(alias = "table_name", alias = "tablename")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub rls_enabled: Option<bool>,
    #[serde(default)]
    pub rls_status: RlsStatus,
    /// `explicit` when reported by metadata, `inferred` when derived from policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rls_detection: Option<String>,
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub primary_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_i64")]
    pub live_rows_estimate: Option<i64>,
}

impl Table {
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    pub fn has_foreign_keys(&self) -> bool {
        self.columns.iter().any(|c| c.references.is_some())
    }
}

impl CatalogObject for Table {
    fn natural_key(&self) -> String {
        self.qualified()
    }

    fn supplement(&mut self, other: Self) {
        for col in other.columns {
            match self.columns.iter_mut().find(|c| c.name == col.name) {
                Some(existing) => existing.supplement(col),
                None => self.columns.push(col),
            }
        }
        fill_fields!(self, other; rls_enabled, rls_detection, primary_keys, comment, live_rows_estimate);
    }

    fn normalize(&mut self) {
        // Some methods report primary keys only as a per-column flag.
        if self.primary_keys.is_empty() {
            self.primary_keys = self
                .columns
                .iter()
                .filter(|c| c.is_primary_key == Some(true))
                .map(|c| c.name.clone())
                .collect();
        }
        for c in &mut self.columns {
            if self.primary_keys.contains(&c.name) {
                c.is_primary_key = Some(true);
            }
        }
        self.columns
            .sort_by_key(|c| c.ordinal_position.unwrap_or(i64::MAX));
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    #[serde(alias = "column_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Underlying type name, e.g. `int8` or the enum name for `USER-DEFINED`.
    #[serde(default, alias = "udt_name", skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub is_nullable: Option<bool>,
    #[serde(default, alias = "column_default", skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub ordinal_position: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub is_primary_key: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub is_identity: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_generation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ColumnRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Column {
    pub(crate) fn supplement(&mut self, other: Column) {
        fill_fields!(self, other; data_type, format, is_nullable, default_value,
            ordinal_position, is_primary_key, is_identity, identity_generation, references, comment);
    }

    /// Declared SQL type for DDL.
    pub fn sql_type(&self) -> String {
        let data_type = self.data_type.as_deref().unwrap_or("text");
        match (data_type, self.format.as_deref()) {
            ("USER-DEFINED", Some(udt)) => udt.to_string(),
            ("ARRAY", Some(udt)) => match udt.strip_prefix('_') {
                Some(elem) => format!("{elem}[]"),
                None => format!("{udt}[]"),
            },
            _ => data_type.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    #[serde(default = "public")]
    pub schema: String,
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    #[serde(default = "public")]
    pub schema: String,
    #[serde(alias = "table")]
    pub table_name: String,
    /// Column name.
    #[serde(alias = "column_name")]
    pub name: String,
}

impl CatalogObject for PrimaryKey {
    fn natural_key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table_name, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    #[serde(alias = "name")]
    pub constraint_name: String,
    #[serde(default = "public")]
    pub source_schema: String,
    pub source_table_name: String,
    pub source_column_name: String,
    #[serde(default = "public")]
    pub target_table_schema: String,
    pub target_table_name: String,
    pub target_column_name: String,
}

impl CatalogObject for ForeignKey {
    fn natural_key(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.source_schema, self.source_table_name, self.constraint_name, self.source_column_name
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "public", alias = "schemaname")]
    pub schema: String,
    #[serde(alias = "tablename", alias = "table_name")]
    pub table: String,
    #[serde(alias = "policyname", alias = "policy_name")]
    pub name: String,
    /// `PERMISSIVE` or `RESTRICTIVE`.
    #[serde(default, alias = "permissive", skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub roles: Vec<String>,
    #[serde(default, alias = "cmd", skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, alias = "qual", skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, alias = "with_check", skip_serializing_if = "Option::is_none")]
    pub check: Option<String>,
}

impl CatalogObject for Policy {
    fn natural_key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; action, roles, command, definition, check);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFunction {
    #[serde(default = "public", alias = "schema_name")]
    pub schema: String,
    #[serde(alias = "function_name", alias = "proname")]
    pub name: String,
    /// Full `CREATE FUNCTION` statement when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete_statement: Option<String>,
    /// Function body, or the full statement for sources that only return that.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument_types: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub is_trigger: Option<bool>,
}

impl StoredFunction {
    pub fn returns_trigger(&self) -> bool {
        self.is_trigger == Some(true)
            || self
                .return_type
                .as_deref()
                .is_some_and(|t| t.eq_ignore_ascii_case("trigger"))
    }
}

impl CatalogObject for StoredFunction {
    fn natural_key(&self) -> String {
        format!(
            "{}.{}({})",
            self.schema,
            self.name,
            self.argument_types.as_deref().unwrap_or("")
        )
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; complete_statement, definition, return_type, language, is_trigger);
    }

    fn normalize(&mut self) {
        if self.is_trigger.is_none() {
            self.is_trigger = Some(self.returns_trigger());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    #[serde(default = "public", alias = "trigger_schema")]
    pub schema: String,
    #[serde(alias = "table_name", alias = "event_object_table")]
    pub table: String,
    #[serde(alias = "trigger_name", alias = "tgname")]
    pub name: String,
    /// Full `CREATE TRIGGER` statement.
    #[serde(default, alias = "trigger_definition", skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// `BEFORE`, `AFTER` or `INSTEAD OF`.
    #[serde(default, alias = "activation", alias = "action_timing", skip_serializing_if = "Option::is_none")]
    pub timing: Option<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub events: Vec<String>,
    #[serde(default, alias = "action_orientation", skip_serializing_if = "Option::is_none")]
    pub orientation: Option<String>,
    #[serde(default, alias = "action_condition", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl CatalogObject for Trigger {
    fn natural_key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; definition, function_schema, function_name, timing, events,
            orientation, condition);
    }

    fn normalize(&mut self) {
        if self.function_name.is_none() {
            if let Some((schema, name)) = self.definition.as_deref().and_then(trigger_function) {
                self.function_schema.fill(schema);
                self.function_name = Some(name);
            }
        }
    }
}

static TRIGGER_FUNCTION: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
    regex::Regex::new(r#"(?i)EXECUTE\s+(?:FUNCTION|PROCEDURE)\s+(?:"?(\w+)"?\.)?"?(\w+)"?"#)
        .expect("valid trigger regex")
});

/// Function called by a trigger definition, as `(schema, name)`.
pub fn trigger_function(definition: &str) -> Option<(Option<String>, String)> {
    let caps = TRIGGER_FUNCTION.captures(definition)?;
    Some((
        caps.get(1).map(|m| m.as_str().to_string()),
        caps.get(2)?.as_str().to_string(),
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomType {
    #[serde(default = "public")]
    pub schema: String,
    #[serde(alias = "typname", alias = "type_name")]
    pub name: String,
    #[serde(default, alias = "values", deserialize_with = "string_or_list")]
    pub enums: Vec<String>,
}

impl CatalogObject for CustomType {
    fn natural_key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; enums);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Extension {
    #[serde(alias = "extname")]
    pub name: String,
    #[serde(default, alias = "extschema", skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, alias = "extversion", alias = "version", skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CatalogObject for Extension {
    fn natural_key(&self) -> String {
        self.name.clone()
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; schema, installed_version, comment);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    #[serde(default = "public", alias = "schemaname")]
    pub schema: String,
    #[serde(default, alias = "tablename", alias = "table_name")]
    pub table: String,
    #[serde(default, alias = "indexname", alias = "index_name")]
    pub name: String,
    #[serde(default, alias = "indexdef", alias = "index_definition", skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub is_unique: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub is_primary: Option<bool>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub columns: Vec<String>,
}

static INDEX_HEAD: once_cell::sync::Lazy<regex::Regex> = once_cell::sync::Lazy::new(|| {
    regex::Regex::new(
        r#"(?i)CREATE\s+(?:UNIQUE\s+)?INDEX\s+(?:CONCURRENTLY\s+)?(?:IF\s+NOT\s+EXISTS\s+)?"?(\w+)"?\s+ON\s+(?:ONLY\s+)?(?:"?(\w+)"?\.)?"?(\w+)"?"#,
    )
    .expect("valid index regex")
});

impl CatalogObject for Index {
    fn natural_key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; definition, is_unique, is_primary, columns);
    }

    fn normalize(&mut self) {
        let Some(def) = self.definition.as_deref() else {
            return;
        };
        if let Some(caps) = INDEX_HEAD.captures(def) {
            if self.name.is_empty() {
                self.name = caps[1].to_string();
            }
            if self.table.is_empty() {
                self.table = caps[3].to_string();
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    #[serde(default = "public", alias = "schemaname")]
    pub schema: String,
    #[serde(alias = "viewname", alias = "matviewname")]
    pub name: String,
    #[serde(default, alias = "view_definition", skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl CatalogObject for View {
    fn natural_key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; definition, comment);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(default = "public", alias = "schemaname", alias = "sequence_schema")]
    pub schema: String,
    #[serde(alias = "sequencename", alias = "sequence_name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub start_value: Option<i64>,
    #[serde(default, alias = "minimum_value", deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub min_value: Option<i64>,
    #[serde(default, alias = "maximum_value", deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub max_value: Option<i64>,
    #[serde(default, alias = "increment", deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub increment_by: Option<i64>,
    #[serde(default, alias = "cycle_option", deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub cycle: Option<bool>,
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub cache_size: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub last_value: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub is_called: Option<bool>,
}

impl CatalogObject for Sequence {
    fn natural_key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; data_type, start_value, min_value, max_value, increment_by,
            cycle, cache_size, last_value, is_called);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckConstraint {
    #[serde(default = "public", alias = "table_schema")]
    pub schema: String,
    #[serde(alias = "table_name")]
    pub table: String,
    #[serde(alias = "constraint_name", alias = "conname")]
    pub name: String,
    /// `CHECK (...)` text or the bare check clause.
    #[serde(default, alias = "check_clause", alias = "constraint_definition", skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
}

impl CatalogObject for CheckConstraint {
    fn natural_key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; definition);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UniqueConstraint {
    #[serde(default = "public", alias = "table_schema")]
    pub schema: String,
    #[serde(alias = "table_name")]
    pub table: String,
    #[serde(alias = "constraint_name", alias = "conname")]
    pub name: String,
    #[serde(default, alias = "column_names", deserialize_with = "string_or_list")]
    pub columns: Vec<String>,
}

impl CatalogObject for UniqueConstraint {
    fn natural_key(&self) -> String {
        format!("{}.{}.{}", self.schema, self.table, self.name)
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; columns);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimePublication {
    #[serde(alias = "pubname")]
    pub name: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub tables: Vec<String>,
}

impl CatalogObject for RealtimePublication {
    fn natural_key(&self) -> String {
        self.name.clone()
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; tables);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRole {
    #[serde(alias = "rolname")]
    pub name: String,
    #[serde(default, alias = "rolcanlogin", deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub can_login: Option<bool>,
    #[serde(default, alias = "rolinherit", deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub inherit: Option<bool>,
}

impl CatalogObject for CustomRole {
    fn natural_key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomGrant {
    pub grantee: String,
    #[serde(default = "public", alias = "table_schema")]
    pub schema: String,
    #[serde(alias = "table_name")]
    pub table: String,
    #[serde(alias = "privilege_type")]
    pub privilege: String,
}

impl CatalogObject for CustomGrant {
    fn natural_key(&self) -> String {
        format!("{}.{}.{}.{}", self.schema, self.table, self.grantee, self.privilege)
    }
}

/// Objects found per schema; more than one non-system schema means partial capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaUsage {
    #[serde(alias = "schema_name", alias = "nspname")]
    pub schema: String,
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub object_count: Option<i64>,
}

impl CatalogObject for SchemaUsage {
    fn natural_key(&self) -> String {
        self.schema.clone()
    }

    fn supplement(&mut self, other: Self) {
        fill_fields!(self, other; object_count);
    }
}

/// Deployable function metadata. Code is never captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeFunction {
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64", skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
    #[serde(default, deserialize_with = "lenient_bool", skip_serializing_if = "Option::is_none")]
    pub verify_jwt: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_aliases_and_lenient_fields() {
        let t: Table = serde_json::from_value(json!({
            "table_name": "users",
            "rls_enabled": "YES",
            "columns": [
                {"column_name": "id", "data_type": "bigint", "is_nullable": "NO", "ordinal_position": "1"},
                {"name": "email", "data_type": "text", "is_nullable": true, "ordinal_position": 2}
            ],
            "primary_keys": "{id}"
        }))
        .unwrap();
        assert_eq!(t.qualified(), "public.users");
        assert_eq!(t.rls_enabled, Some(true));
        assert_eq!(t.columns[0].is_nullable, Some(false));
        assert_eq!(t.columns[0].ordinal_position, Some(1));
        assert_eq!(t.primary_keys, vec!["id".to_string()]);
    }

    #[test]
    fn table_supplement_adds_missing_columns() {
        let mut from_rest: Table = serde_json::from_value(json!({"name": "orders"})).unwrap();
        let from_meta: Table = serde_json::from_value(json!({
            "name": "orders",
            "rls_enabled": false,
            "columns": [{"name": "id", "data_type": "uuid", "is_primary_key": true}]
        }))
        .unwrap();
        from_rest.supplement(from_meta);
        from_rest.normalize();
        assert_eq!(from_rest.columns.len(), 1);
        assert_eq!(from_rest.rls_enabled, Some(false));
        assert_eq!(from_rest.primary_keys, vec!["id".to_string()]);
    }

    #[test]
    fn column_sql_types() {
        let col = |dt: &str, fmt: Option<&str>| Column {
            name: "c".into(),
            data_type: Some(dt.into()),
            format: fmt.map(str::to_string),
            is_nullable: None,
            default_value: None,
            ordinal_position: None,
            is_primary_key: None,
            is_identity: None,
            identity_generation: None,
            references: None,
            comment: None,
        };
        assert_eq!(col("USER-DEFINED", Some("mood")).sql_type(), "mood");
        assert_eq!(col("ARRAY", Some("_text")).sql_type(), "text[]");
        assert_eq!(col("integer", Some("int4")).sql_type(), "integer");
    }

    #[test]
    fn trigger_function_from_definition() {
        assert_eq!(
            trigger_function("CREATE TRIGGER t BEFORE UPDATE ON public.x FOR EACH ROW EXECUTE FUNCTION touch_updated_at()"),
            Some((None, "touch_updated_at".to_string()))
        );
        assert_eq!(
            trigger_function("... EXECUTE PROCEDURE audit.log_change()"),
            Some((Some("audit".to_string()), "log_change".to_string()))
        );
        assert_eq!(trigger_function("CREATE TRIGGER t"), None);

        let mut trg: Trigger = serde_json::from_value(json!({
            "table": "x", "name": "t",
            "definition": "CREATE TRIGGER t AFTER INSERT ON x FOR EACH ROW EXECUTE FUNCTION notify()"
        }))
        .unwrap();
        trg.normalize();
        assert_eq!(trg.function_name.as_deref(), Some("notify"));
    }

    #[test]
    fn index_name_from_definition() {
        let mut idx: Index = serde_json::from_value(json!({
            "index_definition": "CREATE UNIQUE INDEX users_email_idx ON public.users USING btree (email)"
        }))
        .unwrap();
        idx.normalize();
        assert_eq!(idx.name, "users_email_idx");
        assert_eq!(idx.table, "users");
    }

    #[test]
    fn functions_flag_triggers() {
        let mut f: StoredFunction = serde_json::from_value(json!({
            "function_name": "touch", "return_type": "trigger"
        }))
        .unwrap();
        f.normalize();
        assert_eq!(f.is_trigger, Some(true));
    }
}
