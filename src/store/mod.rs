//! Persistence layer: libSQL-backed storage for users, entities, cases,
//! emails, and notifications.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CaseStamp, CaseStep, CaseTransitionPlan, CommitOutcome, Database};
