//! DDL text for captured objects.

use crate::platform::{quote_ident, quote_literal};
use crate::snapshot::{
    CheckConstraint, Column, CustomType, Extension, Index, Policy, Sequence, StoredFunction, Table, Trigger,
    UniqueConstraint, View,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Default expressions that are valid SQL as written.
const KNOWN_CONSTANTS: &[&str] = &[
    "now()",
    "current_timestamp",
    "current_date",
    "current_time",
    "localtimestamp",
    "gen_random_uuid()",
    "uuid_generate_v4()",
    "true",
    "false",
    "null",
];

static NUMERIC: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?$").expect("numeric regex"));
static FUNCTION_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_]*(\.[a-z_][a-z0-9_]*)?\(.*\)$").expect("call regex"));
static NEXTVAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"nextval\('([^']+)'").expect("nextval regex"));

pub fn qualified(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

/// Render a captured column default as a SQL expression.
pub fn sanitize_default(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(sanitize_default_text(s.trim())),
        other => Some(quote_literal(&other.to_string())),
    }
}

/// Pass through expressions, quote anything that would parse as an identifier.
pub fn sanitize_default_text(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    let passes = KNOWN_CONSTANTS.contains(&lower.as_str())
        || lower.starts_with("nextval(")
        || raw.contains("::")
        || (raw.starts_with("'{") && raw.ends_with("}'"))
        || lower.starts_with("array[")
        || (raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\''))
        || NUMERIC.is_match(raw)
        || FUNCTION_CALL.is_match(raw);
    if passes {
        raw.to_string()
    } else {
        quote_literal(raw)
    }
}

pub fn create_extension(ext: &Extension) -> String {
    let mut sql = format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(&ext.name));
    if let Some(schema) = &ext.schema {
        sql.push_str(&format!(" WITH SCHEMA {}", quote_ident(schema)));
    }
    if let Some(version) = &ext.installed_version {
        sql.push_str(&format!(" VERSION {}", quote_literal(version)));
    }
    sql.push(';');
    sql
}

/// Enum type, skipped when a type of that name already exists.
pub fn create_enum(ty: &CustomType) -> String {
    let labels = ty.enums.iter().map(|l| quote_literal(l)).collect::<Vec<_>>().join(", ");
    format!(
        "DO $$ BEGIN
  IF NOT EXISTS (SELECT 1 FROM pg_type t JOIN pg_namespace n ON n.oid = t.typnamespace
                 WHERE n.nspname = {} AND t.typname = {}) THEN
    CREATE TYPE {} AS ENUM ({labels});
  END IF;
END $$;",
        quote_literal(&ty.schema),
        quote_literal(&ty.name),
        qualified(&ty.schema, &ty.name)
    )
}

fn column_def(col: &Column) -> String {
    let mut def = format!("{} {}", quote_ident(&col.name), col.sql_type());
    if col.is_nullable == Some(false) {
        def.push_str(" NOT NULL");
    }
    if col.is_identity == Some(true) {
        let generation = col
            .identity_generation
            .as_deref()
            .map(str::to_ascii_uppercase)
            .filter(|g| g == "ALWAYS")
            .unwrap_or_else(|| "BY DEFAULT".to_string());
        def.push_str(&format!(" GENERATED {generation} AS IDENTITY"));
    } else if let Some(default) = col.default_value.as_ref().and_then(sanitize_default) {
        def.push_str(&format!(" DEFAULT {default}"));
    }
    def
}

/// `CREATE TABLE` with columns and primary key only, or `None` when no column is usable.
///
/// Sequences referenced by `nextval` defaults are created first so the
/// statement does not depend on the later sequences phase.
pub fn create_table(table: &Table) -> Option<String> {
    let columns: Vec<&Column> = table.columns.iter().filter(|c| !c.name.trim().is_empty()).collect();
    if columns.is_empty() {
        return None;
    }
    let mut sql = String::new();
    for col in &columns {
        if col.is_identity == Some(true) {
            continue;
        }
        if let Some(Value::String(default)) = &col.default_value {
            if let Some(caps) = NEXTVAL.captures(default) {
                sql.push_str(&format!("CREATE SEQUENCE IF NOT EXISTS {};\n", &caps[1]));
            }
        }
    }
    let mut defs: Vec<String> = columns.iter().map(|c| column_def(c)).collect();
    let pk: Vec<String> = table
        .primary_keys
        .iter()
        .filter(|k| columns.iter().any(|c| &c.name == *k))
        .map(|k| quote_ident(k))
        .collect();
    if !pk.is_empty() {
        defs.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    }
    sql.push_str(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\n  {}\n);",
        qualified(&table.schema, &table.name),
        defs.join(",\n  ")
    ));
    Some(sql)
}

/// Create the sequence, then position it so the next value follows the source.
pub fn restore_sequence(seq: &Sequence) -> String {
    let name = qualified(&seq.schema, &seq.name);
    let mut sql = format!(
        "CREATE SEQUENCE IF NOT EXISTS {name} AS {} INCREMENT BY {} MINVALUE {} MAXVALUE {} START WITH {} {} CACHE {};",
        seq.data_type.as_deref().unwrap_or("bigint"),
        seq.increment_by.unwrap_or(1),
        seq.min_value.unwrap_or(1),
        seq.max_value.unwrap_or(i64::MAX),
        seq.start_value.unwrap_or(1),
        if seq.cycle == Some(true) { "CYCLE" } else { "NO CYCLE" },
        seq.cache_size.unwrap_or(1).max(1),
    );
    if let Some(last) = seq.last_value {
        sql.push_str(&format!(
            "\nSELECT setval({}, {last}, {});",
            quote_literal(&name),
            seq.is_called != Some(false)
        ));
    }
    sql
}

pub fn add_check_constraint(c: &CheckConstraint) -> Option<String> {
    let def = c.definition.as_deref()?.trim();
    let clause = if def.to_ascii_uppercase().starts_with("CHECK") {
        def.to_string()
    } else {
        format!("CHECK ({def})")
    };
    Some(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} {clause};",
        qualified(&c.schema, &c.table),
        quote_ident(&c.name)
    ))
}

pub fn add_unique_constraint(c: &UniqueConstraint) -> Option<String> {
    if c.columns.is_empty() {
        return None;
    }
    let cols = c.columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ");
    Some(format!(
        "ALTER TABLE {} ADD CONSTRAINT {} UNIQUE ({cols});",
        qualified(&c.schema, &c.table),
        quote_ident(&c.name)
    ))
}

/// Indexes that back a primary key or a unique constraint come with those.
pub fn is_constraint_index(index: &Index, unique_names: &[&str]) -> bool {
    index.is_primary == Some(true)
        || index.name.ends_with("_pkey")
        || index.name.ends_with("_key")
        || unique_names.contains(&index.name.as_str())
}

pub fn create_index(index: &Index) -> Option<String> {
    let def = index.definition.as_deref()?.trim().trim_end_matches(';');
    static HEAD: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)^CREATE\s+(UNIQUE\s+)?INDEX\s+(IF\s+NOT\s+EXISTS\s+)?").expect("index head regex"));
    let caps = HEAD.captures(def)?;
    let unique = if caps.get(1).is_some() { "UNIQUE " } else { "" };
    let rest = &def[caps.get(0)?.end()..];
    Some(format!("CREATE {unique}INDEX IF NOT EXISTS {rest};"))
}

pub fn enable_rls(schema: &str, table: &str) -> String {
    format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY;", qualified(schema, table))
}

pub fn create_policy(p: &Policy) -> String {
    let roles = if p.roles.is_empty() {
        "public".to_string()
    } else {
        p.roles
            .iter()
            .map(|r| if r == "public" { r.clone() } else { quote_ident(r) })
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut sql = format!(
        "DROP POLICY IF EXISTS {name} ON {table};\nCREATE POLICY {name} ON {table} AS {} FOR {} TO {roles}",
        p.action.as_deref().unwrap_or("PERMISSIVE"),
        p.command.as_deref().unwrap_or("ALL"),
        name = quote_ident(&p.name),
        table = qualified(&p.schema, &p.table),
    );
    if let Some(using) = &p.definition {
        sql.push_str(&format!(" USING ({using})"));
    }
    if let Some(check) = &p.check {
        sql.push_str(&format!(" WITH CHECK ({check})"));
    }
    sql.push(';');
    sql
}

/// Full function statement, made idempotent.
pub fn create_function(f: &StoredFunction) -> Option<String> {
    let stmt = f.complete_statement.as_deref().or(f.definition.as_deref())?.trim();
    if !stmt.to_ascii_uppercase().starts_with("CREATE") {
        return None;
    }
    static HEAD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^CREATE\s+(OR\s+REPLACE\s+)?").expect("function head regex"));
    let body = HEAD.replace(stmt, "CREATE OR REPLACE ");
    let mut sql = body.trim_end().to_string();
    if !sql.ends_with(';') {
        sql.push(';');
    }
    Some(sql)
}

pub fn create_view(v: &View) -> Option<String> {
    let def = v.definition.as_deref()?.trim().trim_end_matches(';');
    let name = qualified(&v.schema, &v.name);
    let mut sql = format!("CREATE OR REPLACE VIEW {name} AS {def};");
    if let Some(comment) = &v.comment {
        sql.push_str(&format!("\nCOMMENT ON VIEW {name} IS {};", quote_literal(comment)));
    }
    Some(sql)
}

/// Created, then refreshed once so it holds data.
pub fn create_materialized_view(v: &View) -> Option<String> {
    let def = v.definition.as_deref()?.trim().trim_end_matches(';');
    let name = qualified(&v.schema, &v.name);
    let mut sql = format!("CREATE MATERIALIZED VIEW IF NOT EXISTS {name} AS {def};\nREFRESH MATERIALIZED VIEW {name};");
    if let Some(comment) = &v.comment {
        sql.push_str(&format!("\nCOMMENT ON MATERIALIZED VIEW {name} IS {};", quote_literal(comment)));
    }
    Some(sql)
}

pub fn create_trigger(t: &Trigger) -> Option<String> {
    let def = t.definition.as_deref()?.trim().trim_end_matches(';');
    Some(format!(
        "DROP TRIGGER IF EXISTS {} ON {};\n{def};",
        quote_ident(&t.name),
        qualified(&t.schema, &t.table)
    ))
}

pub fn add_foreign_key(table: &Table, col: &Column) -> Option<String> {
    let target = col.references.as_ref()?;
    let name = target
        .constraint
        .clone()
        .unwrap_or_else(|| format!("{}_{}_fkey", table.name, col.name));
    let table_name = qualified(&table.schema, &table.name);
    Some(format!(
        "ALTER TABLE {table_name} DROP CONSTRAINT IF EXISTS {name};\nALTER TABLE {table_name} ADD CONSTRAINT {name} FOREIGN KEY ({}) REFERENCES {} ({});",
        quote_ident(&col.name),
        qualified(&target.schema, &target.table),
        quote_ident(&target.column),
        name = quote_ident(&name),
    ))
}

/// Probe for a function's existence on the target.
pub fn function_exists_query(schema: Option<&str>, name: &str) -> String {
    let mut sql = format!(
        "SELECT 1 AS found FROM pg_proc p JOIN pg_namespace n ON n.oid = p.pronamespace WHERE p.proname = {}",
        quote_literal(name)
    );
    if let Some(schema) = schema {
        sql.push_str(&format!(" AND n.nspname = {}", quote_literal(schema)));
    }
    sql.push_str(" LIMIT 1");
    sql
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_pass_through_or_get_quoted() {
        for raw in ["now()", "42", "true", "-1.5", "nextval('users_id_seq'::regclass)", "'draft'::text", "ARRAY[]::text[]", "'{}'", "gen_random_uuid()", "timezone('utc'::text, now())"] {
            assert_eq!(sanitize_default_text(raw), raw, "{raw}");
        }
        assert_eq!(sanitize_default_text("#FF00FF"), "'#FF00FF'");
        assert_eq!(sanitize_default_text("Hello"), "'Hello'");
        assert_eq!(sanitize_default_text("ACTIVE"), "'ACTIVE'");
        assert_eq!(sanitize_default_text("it's"), "'it''s'");
        assert_eq!(sanitize_default(&json!(7)), Some("7".to_string()));
        assert_eq!(sanitize_default(&json!(null)), None);
    }

    fn table() -> Table {
        serde_json::from_value(json!({
            "schema": "public", "name": "orders",
            "primary_keys": ["id"],
            "columns": [
                {"name": "id", "data_type": "bigint", "is_nullable": false,
                 "default_value": "nextval('orders_id_seq'::regclass)", "ordinal_position": 1},
                {"name": "status", "data_type": "USER-DEFINED", "format": "order_status",
                 "default_value": "pending", "ordinal_position": 2},
                {"name": "n", "data_type": "integer", "is_identity": true, "identity_generation": "ALWAYS"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn table_ddl() {
        let sql = create_table(&table()).unwrap();
        assert!(sql.starts_with("CREATE SEQUENCE IF NOT EXISTS orders_id_seq;\n"));
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS \"public\".\"orders\""));
        assert!(sql.contains("\"id\" bigint NOT NULL DEFAULT nextval('orders_id_seq'::regclass)"));
        assert!(sql.contains("\"status\" order_status DEFAULT 'pending'"));
        assert!(sql.contains("\"n\" integer GENERATED ALWAYS AS IDENTITY"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));

        let empty: Table = serde_json::from_value(json!({"name": "ghost"})).unwrap();
        assert_eq!(create_table(&empty), None);
    }

    #[test]
    fn sequence_keeps_called_flag() {
        let seq: Sequence = serde_json::from_value(json!({
            "schema": "public", "name": "invoice_no", "last_value": 41, "is_called": true
        }))
        .unwrap();
        let sql = restore_sequence(&seq);
        assert!(sql.contains("SELECT setval('\"public\".\"invoice_no\"', 41, true);"));
    }

    #[test]
    fn constraint_backed_indexes_are_skipped() {
        let idx = |name: &str| Index {
            schema: "public".into(),
            table: "t".into(),
            name: name.into(),
            definition: Some(format!("CREATE INDEX {name} ON public.t USING btree (a)")),
            is_unique: None,
            is_primary: None,
            columns: Vec::new(),
        };
        assert!(is_constraint_index(&idx("t_pkey"), &[]));
        assert!(is_constraint_index(&idx("t_email_key"), &[]));
        assert!(is_constraint_index(&idx("uniq_a"), &["uniq_a"]));
        assert!(!is_constraint_index(&idx("t_a_idx"), &["uniq_a"]));
        assert!(!is_constraint_index(&idx("api_keys_user_id_idx"), &[]));
        assert!(!is_constraint_index(&idx("users_keyword_idx"), &[]));
        assert_eq!(
            create_index(&idx("t_a_idx")).unwrap(),
            "CREATE INDEX IF NOT EXISTS t_a_idx ON public.t USING btree (a);"
        );
    }

    #[test]
    fn policy_and_trigger_ddl() {
        let p: Policy = serde_json::from_value(json!({
            "schema": "public", "table": "notes", "name": "owner reads",
            "command": "SELECT", "roles": ["authenticated"], "definition": "(auth.uid() = owner)"
        }))
        .unwrap();
        let sql = create_policy(&p);
        assert!(sql.contains("CREATE POLICY \"owner reads\" ON \"public\".\"notes\" AS PERMISSIVE FOR SELECT TO \"authenticated\" USING ((auth.uid() = owner));"));

        let t: Trigger = serde_json::from_value(json!({
            "table": "notes", "name": "touch",
            "definition": "CREATE TRIGGER touch BEFORE UPDATE ON public.notes FOR EACH ROW EXECUTE FUNCTION touch()"
        }))
        .unwrap();
        let sql = create_trigger(&t).unwrap();
        assert!(sql.starts_with("DROP TRIGGER IF EXISTS \"touch\" ON \"public\".\"notes\";"));
        assert!(sql.ends_with("EXECUTE FUNCTION touch();"));
    }

    #[test]
    fn functions_become_create_or_replace() {
        let f: StoredFunction = serde_json::from_value(json!({
            "name": "add", "complete_statement": "CREATE FUNCTION public.add(a int, b int) RETURNS int LANGUAGE sql AS $$ select a + b $$"
        }))
        .unwrap();
        assert!(create_function(&f).unwrap().starts_with("CREATE OR REPLACE FUNCTION public.add"));
    }
}
