use super::phase::{Phase, PhaseReport};
use serde::Serialize;
use std::collections::BTreeMap;

/// Counters persisted on a completed restore.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FinalSummary {
    pub success: bool,
    pub target_project_id: String,
    pub tables_created: usize,
    pub tables_restored: usize,
    pub total_rows: u64,
    pub types_created: usize,
    pub extensions_created: usize,
    pub sequences_restored: usize,
    pub check_constraints_created: usize,
    pub unique_constraints_created: usize,
    pub indexes_created: usize,
    pub rls_policies_created: usize,
    pub db_functions_created: usize,
    pub views_created: usize,
    pub materialized_views_created: usize,
    pub triggers_created: usize,
    pub foreign_keys_created: usize,
    pub storage_buckets_created: usize,
    pub storage_policies_created: u64,
    pub storage_objects_copied: u64,
    pub edge_functions_created: usize,
    pub auth_config_applied: bool,
    pub project_config_applied: bool,
    pub schema_errors: usize,
    pub data_errors: usize,
    pub type_errors: usize,
    pub extension_errors: usize,
    pub sequence_errors: usize,
    pub check_constraint_errors: usize,
    pub unique_constraint_errors: usize,
    pub index_errors: usize,
    pub rls_errors: usize,
    pub function_errors: usize,
    pub view_errors: usize,
    pub materialized_view_errors: usize,
    pub trigger_errors: usize,
    pub foreign_key_errors: usize,
    pub storage_errors: usize,
    pub edge_function_errors: usize,
    pub config_errors: usize,
    pub warnings: Vec<String>,
    pub phases: BTreeMap<String, PhaseReport>,
}

impl FinalSummary {
    pub fn build(target: &str, reports: &BTreeMap<Phase, PhaseReport>, warnings: Vec<String>) -> Self {
        let empty = PhaseReport::default();
        let r = |p: Phase| reports.get(&p).unwrap_or(&empty);
        let created = |p: Phase| r(p).created;
        let failed = |p: Phase| r(p).failed();

        Self {
            success: true,
            target_project_id: target.to_string(),
            tables_created: created(Phase::Tables),
            tables_restored: created(Phase::Data),
            total_rows: r(Phase::Data).counter("rows"),
            types_created: created(Phase::CustomTypes),
            extensions_created: created(Phase::Extensions),
            sequences_restored: created(Phase::Sequences),
            check_constraints_created: created(Phase::CheckConstraints),
            unique_constraints_created: created(Phase::UniqueConstraints),
            indexes_created: created(Phase::Indexes),
            rls_policies_created: created(Phase::Policies),
            db_functions_created: created(Phase::Functions),
            views_created: created(Phase::Views),
            materialized_views_created: created(Phase::MaterializedViews),
            triggers_created: created(Phase::Triggers),
            foreign_keys_created: created(Phase::ForeignKeys),
            storage_buckets_created: created(Phase::Storage),
            storage_policies_created: r(Phase::Storage).counter("policies"),
            storage_objects_copied: r(Phase::Storage).counter("objects"),
            edge_functions_created: created(Phase::EdgeFunctions),
            auth_config_applied: created(Phase::AuthConfig) > 0,
            project_config_applied: created(Phase::ProjectConfig) > 0,
            schema_errors: failed(Phase::Tables),
            data_errors: failed(Phase::Data),
            type_errors: failed(Phase::CustomTypes),
            extension_errors: failed(Phase::Extensions),
            sequence_errors: failed(Phase::Sequences),
            check_constraint_errors: failed(Phase::CheckConstraints),
            unique_constraint_errors: failed(Phase::UniqueConstraints),
            index_errors: failed(Phase::Indexes),
            rls_errors: failed(Phase::Policies),
            function_errors: failed(Phase::Functions),
            view_errors: failed(Phase::Views),
            materialized_view_errors: failed(Phase::MaterializedViews),
            trigger_errors: failed(Phase::Triggers),
            foreign_key_errors: failed(Phase::ForeignKeys),
            storage_errors: failed(Phase::Storage),
            edge_function_errors: failed(Phase::EdgeFunctions),
            config_errors: failed(Phase::AuthConfig) + failed(Phase::ProjectConfig),
            warnings,
            phases: reports
                .iter()
                .map(|(phase, report)| (phase.as_str().to_string(), report.clone()))
                .collect(),
        }
    }

    /// Human-readable lines for the operation log.
    pub fn log_lines(&self) -> Vec<String> {
        vec![
            format!(
                "Tables: {} created, {} restored with {} rows",
                self.tables_created, self.tables_restored, self.total_rows
            ),
            format!(
                "Schema objects: {} types, {} sequences, {} indexes, {} policies, {} functions, {} views, {} triggers",
                self.types_created,
                self.sequences_restored,
                self.indexes_created,
                self.rls_policies_created,
                self.db_functions_created,
                self.views_created + self.materialized_views_created,
                self.triggers_created
            ),
            format!(
                "Storage: {} buckets, {} objects copied; {} edge functions registered",
                self.storage_buckets_created, self.storage_objects_copied, self.edge_functions_created
            ),
            format!("Warnings: {}", self.warnings.len()),
        ]
    }
}
