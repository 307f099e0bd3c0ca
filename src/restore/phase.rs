//! Restore phases and their per-phase outcome.

use crate::config::{BatchPolicy, Batches};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Restore phases in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extensions,
    CustomTypes,
    Tables,
    Sequences,
    CheckConstraints,
    UniqueConstraints,
    Indexes,
    Policies,
    Functions,
    Views,
    MaterializedViews,
    Triggers,
    Data,
    ForeignKeys,
    Storage,
    EdgeFunctions,
    AuthConfig,
    ProjectConfig,
}

impl Phase {
    pub const ALL: [Phase; 18] = [
        Phase::Extensions,
        Phase::CustomTypes,
        Phase::Tables,
        Phase::Sequences,
        Phase::CheckConstraints,
        Phase::UniqueConstraints,
        Phase::Indexes,
        Phase::Policies,
        Phase::Functions,
        Phase::Views,
        Phase::MaterializedViews,
        Phase::Triggers,
        Phase::Data,
        Phase::ForeignKeys,
        Phase::Storage,
        Phase::EdgeFunctions,
        Phase::AuthConfig,
        Phase::ProjectConfig,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extensions => "extensions",
            Phase::CustomTypes => "custom_types",
            Phase::Tables => "tables",
            Phase::Sequences => "sequences",
            Phase::CheckConstraints => "check_constraints",
            Phase::UniqueConstraints => "unique_constraints",
            Phase::Indexes => "indexes",
            Phase::Policies => "policies",
            Phase::Functions => "functions",
            Phase::Views => "views",
            Phase::MaterializedViews => "materialized_views",
            Phase::Triggers => "triggers",
            Phase::Data => "data",
            Phase::ForeignKeys => "foreign_keys",
            Phase::Storage => "storage",
            Phase::EdgeFunctions => "edge_functions",
            Phase::AuthConfig => "auth_config",
            Phase::ProjectConfig => "project_config",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Phase::ALL.into_iter().find(|p| p.as_str() == s)
    }

    /// Progress floor and ceiling while this phase runs.
    pub fn progress(&self) -> (i64, i64) {
        match self {
            Phase::Extensions => (10, 12),
            Phase::CustomTypes => (12, 14),
            Phase::Tables => (14, 24),
            Phase::Sequences => (24, 26),
            Phase::CheckConstraints => (26, 28),
            Phase::UniqueConstraints => (28, 30),
            Phase::Indexes => (30, 33),
            Phase::Policies => (33, 36),
            Phase::Functions => (36, 40),
            Phase::Views => (40, 42),
            Phase::MaterializedViews => (42, 44),
            Phase::Triggers => (44, 47),
            Phase::Data => (47, 80),
            Phase::ForeignKeys => (80, 83),
            Phase::Storage => (83, 90),
            Phase::EdgeFunctions => (90, 92),
            Phase::AuthConfig => (92, 94),
            Phase::ProjectConfig => (94, 96),
        }
    }

    /// Batch policy for phases that submit migrations.
    pub fn batch_policy(&self, batches: &Batches) -> BatchPolicy {
        match self {
            Phase::Extensions => batches.extensions,
            Phase::CustomTypes => batches.custom_types,
            Phase::Tables => batches.tables,
            Phase::Sequences => batches.sequences,
            Phase::CheckConstraints => batches.check_constraints,
            Phase::UniqueConstraints => batches.unique_constraints,
            Phase::Indexes => batches.indexes,
            Phase::Policies => batches.policies,
            Phase::Functions => batches.functions,
            Phase::Views => batches.views,
            Phase::MaterializedViews => batches.materialized_views,
            Phase::Triggers => batches.triggers,
            Phase::ForeignKeys => batches.foreign_keys,
            Phase::Storage => batches.storage_policies,
            Phase::Data | Phase::EdgeFunctions | Phase::AuthConfig | Phase::ProjectConfig => BatchPolicy::new(1, 0),
        }
    }

    /// A hard dependency fails the restore when it creates nothing from non-empty input.
    pub fn is_hard_dependency(&self) -> bool {
        matches!(self, Phase::Tables | Phase::Data)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One object a phase could not restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseError {
    pub item: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub attempted: usize,
    pub created: usize,
    pub skipped: usize,
    #[serde(default)]
    pub errors: Vec<PhaseError>,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Secondary counts, e.g. rows inserted or storage objects copied.
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
    /// Why the whole phase did nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

impl PhaseReport {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            skipped_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn error(&mut self, item: impl Into<String>, error: impl fmt::Display) {
        self.errors.push(PhaseError {
            item: item.into(),
            error: error.to_string(),
        });
    }

    pub fn add(&mut self, counter: &str, n: u64) {
        *self.counters.entry(counter.to_string()).or_default() += n;
    }

    pub fn counter(&self, counter: &str) -> u64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_and_names() {
        assert_eq!(Phase::ALL.first(), Some(&Phase::Extensions));
        assert_eq!(Phase::ALL.last(), Some(&Phase::ProjectConfig));
        let data = Phase::ALL.iter().position(|p| *p == Phase::Data).unwrap();
        let fks = Phase::ALL.iter().position(|p| *p == Phase::ForeignKeys).unwrap();
        assert_eq!(fks, data + 1);
        for phase in Phase::ALL {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::MaterializedViews.to_string(), "materialized_views");
    }

    #[test]
    fn progress_is_monotonic() {
        let mut last = 0;
        for phase in Phase::ALL {
            let (lo, hi) = phase.progress();
            assert!(lo >= last && hi > lo, "{phase}");
            last = hi;
        }
    }

    #[test]
    fn default_batch_sizes() {
        let batches = Batches::default();
        assert_eq!(Phase::CustomTypes.batch_policy(&batches).size, 5);
        assert_eq!(Phase::Tables.batch_policy(&batches).size, 10);
        assert_eq!(Phase::Policies.batch_policy(&batches).size, 15);
        assert_eq!(Phase::Functions.batch_policy(&batches).size, 50);
    }
}
