//! Discovery methods per object class, in priority order.

use crate::platform::quote_literal;

/// One way of listing objects of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// Structured metadata service endpoint.
    Meta(String),
    /// Array field nested in each row of a metadata endpoint.
    MetaNested { endpoint: String, field: &'static str },
    /// System-catalog query through the SQL RPC.
    Catalog(String),
    /// Named stored procedure.
    Rpc(&'static str),
    /// Resource paths of the REST surface's OpenAPI document.
    OpenApi,
}

impl Source {
    pub fn label(&self) -> String {
        match self {
            Source::Meta(_) | Source::MetaNested { .. } => "pg-meta".to_string(),
            Source::Catalog(_) => "catalog".to_string(),
            Source::Rpc(name) => format!("rpc:{name}"),
            Source::OpenApi => "openapi".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectClass {
    Tables,
    Columns,
    PrimaryKeys,
    ForeignKeys,
    Policies,
    Functions,
    Triggers,
    CustomTypes,
    Extensions,
    Indexes,
    Views,
    MaterializedViews,
    Sequences,
    CheckConstraints,
    UniqueConstraints,
    RealtimePublications,
    CustomRoles,
    CustomGrants,
    SchemaUsage,
}

impl ObjectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Tables => "tables",
            ObjectClass::Columns => "columns",
            ObjectClass::PrimaryKeys => "primary_keys",
            ObjectClass::ForeignKeys => "foreign_keys",
            ObjectClass::Policies => "policies",
            ObjectClass::Functions => "functions",
            ObjectClass::Triggers => "triggers",
            ObjectClass::CustomTypes => "custom_types",
            ObjectClass::Extensions => "extensions",
            ObjectClass::Indexes => "indexes",
            ObjectClass::Views => "views",
            ObjectClass::MaterializedViews => "materialized_views",
            ObjectClass::Sequences => "sequences",
            ObjectClass::CheckConstraints => "check_constraints",
            ObjectClass::UniqueConstraints => "unique_constraints",
            ObjectClass::RealtimePublications => "realtime_publications",
            ObjectClass::CustomRoles => "custom_roles",
            ObjectClass::CustomGrants => "custom_grants",
            ObjectClass::SchemaUsage => "schema_usage",
        }
    }

    /// Discovery methods for this class in priority order.
    pub fn sources(&self, schema: &str) -> Vec<Source> {
        let s = quote_literal(schema);
        let included = format!("included_schemas={schema}");
        match self {
            ObjectClass::Tables => vec![
                Source::Meta(format!("tables?{included}&include_columns=false")),
                Source::Rpc("get_tables_info"),
                Source::Catalog(format!(
                    "SELECT t.table_schema AS schema, t.table_name AS name, c.relrowsecurity AS rls_enabled
                     FROM information_schema.tables t
                     JOIN pg_namespace n ON n.nspname = t.table_schema
                     JOIN pg_class c ON c.relnamespace = n.oid AND c.relname = t.table_name
                     WHERE t.table_schema = {s} AND t.table_type = 'BASE TABLE'
                     ORDER BY t.table_name"
                )),
                Source::OpenApi,
            ],
            ObjectClass::Columns => vec![
                Source::Meta(format!("columns?{included}")),
                Source::Catalog(format!(
                    "SELECT table_schema, table_name, column_name, data_type, udt_name, is_nullable,
                            column_default, ordinal_position, is_identity, identity_generation
                     FROM information_schema.columns
                     WHERE table_schema = {s}
                     ORDER BY table_name, ordinal_position"
                )),
            ],
            ObjectClass::PrimaryKeys => vec![
                Source::MetaNested {
                    endpoint: format!("tables?{included}&include_columns=false"),
                    field: "primary_keys",
                },
                Source::Catalog(format!(
                    "SELECT tc.table_schema AS schema, tc.table_name, kcu.column_name AS name
                     FROM information_schema.table_constraints tc
                     JOIN information_schema.key_column_usage kcu
                       ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema
                     WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = {s}
                     ORDER BY tc.table_name, kcu.ordinal_position"
                )),
            ],
            ObjectClass::ForeignKeys => vec![
                Source::MetaNested {
                    endpoint: format!("tables?{included}&include_columns=false"),
                    field: "relationships",
                },
                Source::Catalog(format!(
                    "SELECT con.conname AS constraint_name,
                            src_ns.nspname AS source_schema, src.relname AS source_table_name,
                            src_att.attname AS source_column_name,
                            tgt_ns.nspname AS target_table_schema, tgt.relname AS target_table_name,
                            tgt_att.attname AS target_column_name
                     FROM pg_constraint con
                     JOIN pg_class src ON src.oid = con.conrelid
                     JOIN pg_namespace src_ns ON src_ns.oid = src.relnamespace
                     JOIN pg_class tgt ON tgt.oid = con.confrelid
                     JOIN pg_namespace tgt_ns ON tgt_ns.oid = tgt.relnamespace
                     CROSS JOIN LATERAL unnest(con.conkey, con.confkey) AS k(src_attnum, tgt_attnum)
                     JOIN pg_attribute src_att ON src_att.attrelid = con.conrelid AND src_att.attnum = k.src_attnum
                     JOIN pg_attribute tgt_att ON tgt_att.attrelid = con.confrelid AND tgt_att.attnum = k.tgt_attnum
                     WHERE con.contype = 'f' AND src_ns.nspname = {s}"
                )),
            ],
            ObjectClass::Policies => vec![
                Source::Meta(format!("policies?{included}")),
                Source::Rpc("get_policies_info"),
                Source::Catalog(format!(
                    "SELECT schemaname, tablename, policyname, permissive, roles, cmd, qual, with_check
                     FROM pg_policies WHERE schemaname = {s}"
                )),
            ],
            ObjectClass::Functions => vec![
                Source::Meta(format!("functions?{included}")),
                Source::Rpc("get_functions_info"),
                Source::Catalog(format!(
                    "SELECT n.nspname AS schema, p.proname AS name,
                            pg_get_functiondef(p.oid) AS complete_statement,
                            pg_get_function_identity_arguments(p.oid) AS argument_types,
                            pg_get_function_result(p.oid) AS return_type,
                            l.lanname AS language
                     FROM pg_proc p
                     JOIN pg_namespace n ON n.oid = p.pronamespace
                     JOIN pg_language l ON l.oid = p.prolang
                     LEFT JOIN pg_depend d ON d.objid = p.oid AND d.deptype = 'e'
                     WHERE n.nspname = {s} AND p.prokind = 'f' AND d.objid IS NULL"
                )),
            ],
            ObjectClass::Triggers => vec![
                Source::Catalog(format!(
                    "SELECT n.nspname AS schema, c.relname AS \"table\", t.tgname AS name,
                            pg_get_triggerdef(t.oid) AS definition,
                            pn.nspname AS function_schema, p.proname AS function_name
                     FROM pg_trigger t
                     JOIN pg_class c ON c.oid = t.tgrelid
                     JOIN pg_namespace n ON n.oid = c.relnamespace
                     JOIN pg_proc p ON p.oid = t.tgfoid
                     JOIN pg_namespace pn ON pn.oid = p.pronamespace
                     WHERE NOT t.tgisinternal AND n.nspname = {s}"
                )),
                Source::Meta(format!("triggers?{included}")),
                Source::Rpc("get_triggers_info"),
            ],
            ObjectClass::CustomTypes => vec![
                Source::Meta(format!("types?{included}")),
                Source::Catalog(format!(
                    "SELECT n.nspname AS schema, t.typname AS name,
                            array_agg(e.enumlabel ORDER BY e.enumsortorder) AS enums
                     FROM pg_type t
                     JOIN pg_enum e ON e.enumtypid = t.oid
                     JOIN pg_namespace n ON n.oid = t.typnamespace
                     WHERE n.nspname = {s}
                     GROUP BY n.nspname, t.typname"
                )),
            ],
            ObjectClass::Extensions => vec![
                Source::Meta("extensions".to_string()),
                Source::Catalog(
                    "SELECT e.extname, n.nspname AS extschema, e.extversion
                     FROM pg_extension e JOIN pg_namespace n ON n.oid = e.extnamespace"
                        .to_string(),
                ),
            ],
            ObjectClass::Indexes => vec![
                Source::Meta(format!("indexes?{included}")),
                Source::Catalog(format!(
                    "SELECT schemaname, tablename, indexname, indexdef
                     FROM pg_indexes WHERE schemaname = {s}"
                )),
            ],
            ObjectClass::Views => vec![
                Source::Meta(format!("views?{included}")),
                Source::Catalog(format!(
                    "SELECT schemaname, viewname, definition FROM pg_views WHERE schemaname = {s}"
                )),
            ],
            ObjectClass::MaterializedViews => vec![
                Source::Meta(format!("materialized-views?{included}")),
                Source::Catalog(format!(
                    "SELECT schemaname, matviewname, definition FROM pg_matviews WHERE schemaname = {s}"
                )),
            ],
            ObjectClass::Sequences => vec![
                Source::Catalog(format!(
                    "SELECT schemaname, sequencename, data_type, start_value, min_value, max_value,
                            increment_by, cycle, cache_size, last_value,
                            (last_value IS NOT NULL) AS is_called
                     FROM pg_sequences WHERE schemaname = {s}"
                )),
                Source::Meta(format!("sequences?{included}")),
            ],
            ObjectClass::CheckConstraints => vec![
                Source::Catalog(format!(
                    "SELECT n.nspname AS table_schema, c.relname AS table_name, con.conname,
                            pg_get_constraintdef(con.oid) AS constraint_definition
                     FROM pg_constraint con
                     JOIN pg_class c ON c.oid = con.conrelid
                     JOIN pg_namespace n ON n.oid = c.relnamespace
                     WHERE con.contype = 'c' AND n.nspname = {s}"
                )),
                Source::Rpc("get_check_constraints"),
            ],
            ObjectClass::UniqueConstraints => vec![
                Source::Catalog(format!(
                    "SELECT n.nspname AS table_schema, c.relname AS table_name, con.conname,
                            array_agg(a.attname ORDER BY k.ord) AS column_names
                     FROM pg_constraint con
                     JOIN pg_class c ON c.oid = con.conrelid
                     JOIN pg_namespace n ON n.oid = c.relnamespace
                     CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
                     JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
                     WHERE con.contype = 'u' AND n.nspname = {s}
                     GROUP BY n.nspname, c.relname, con.conname"
                )),
                Source::Rpc("get_unique_constraints"),
            ],
            ObjectClass::RealtimePublications => vec![Source::Catalog(
                "SELECT pubname, array_agg(schemaname || '.' || tablename) AS tables
                 FROM pg_publication_tables WHERE pubname = 'supabase_realtime'
                 GROUP BY pubname"
                    .to_string(),
            )],
            ObjectClass::CustomRoles => vec![Source::Catalog(format!(
                "SELECT rolname, rolcanlogin, rolinherit FROM pg_roles
                 WHERE rolname NOT LIKE 'pg\\_%' AND rolname NOT IN ({})",
                system_roles_sql()
            ))],
            ObjectClass::CustomGrants => vec![Source::Catalog(format!(
                "SELECT grantee, table_schema, table_name, privilege_type
                 FROM information_schema.table_privileges
                 WHERE table_schema = {s} AND grantee NOT LIKE 'pg\\_%' AND grantee NOT IN ({})",
                system_roles_sql()
            ))],
            ObjectClass::SchemaUsage => vec![Source::Catalog(
                "SELECT n.nspname AS schema, count(c.oid) AS object_count
                 FROM pg_namespace n LEFT JOIN pg_class c ON c.relnamespace = n.oid
                 WHERE n.nspname NOT LIKE 'pg\\_%' AND n.nspname NOT IN ('information_schema')
                 GROUP BY n.nspname"
                    .to_string(),
            )],
        }
    }
}

/// Roles managed by the platform itself.
pub const SYSTEM_ROLES: &[&str] = &[
    "postgres",
    "anon",
    "authenticated",
    "service_role",
    "authenticator",
    "dashboard_user",
    "supabase_admin",
    "supabase_auth_admin",
    "supabase_storage_admin",
    "supabase_functions_admin",
    "supabase_realtime_admin",
    "supabase_replication_admin",
    "supabase_read_only_user",
    "supabase_etl_admin",
    "pgbouncer",
    "pgsodium_keyholder",
    "pgsodium_keyiduser",
    "pgsodium_keymaker",
    "PUBLIC",
];

/// Schemas managed by the platform; objects there are not user data.
pub const SYSTEM_SCHEMAS: &[&str] = &[
    "auth",
    "storage",
    "extensions",
    "graphql",
    "graphql_public",
    "realtime",
    "supabase_functions",
    "supabase_migrations",
    "vault",
    "pgsodium",
    "pgsodium_masks",
    "net",
    "cron",
    "pgbouncer",
    "_realtime",
    "_analytics",
];

fn system_roles_sql() -> String {
    SYSTEM_ROLES
        .iter()
        .map(|r| quote_literal(r))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Storage access policies live on `storage.objects`.
pub fn storage_policies_sql() -> &'static str {
    "SELECT schemaname, tablename, policyname, permissive, roles, cmd, qual, with_check
     FROM pg_policies WHERE schemaname = 'storage'"
}
