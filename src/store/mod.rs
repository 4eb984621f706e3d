//! Persistence layer: libSQL-backed storage for work tracking, claims and telemetry.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CommitOutcome, Database, Mutation};
