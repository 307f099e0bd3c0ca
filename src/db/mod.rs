//! Operation ledger: entity models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed ledger entities returned by repositories.
//! - `repo`: SQL-only functions that map rows into entities.
//!
//! External modules import from `snapshot_relay::db`; the repository API and
//! the commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{
    AuditEntry, Checkpoint, ErrorRecord, ExpiredBackup, NewOperation, NewSchedule, Operation,
    Schedule,
};
