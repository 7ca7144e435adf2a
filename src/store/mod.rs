//! Persistence layer: libSQL-backed storage for jobs and settings.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ConfigStore, JobStore, JobUpdate, UpdateGuard};
