//! Error types for queuectl.

use std::time::Duration;

/// Top-level error type for the queue engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Execution error: {0}")]
    Exec(#[from] ExecError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to persist configuration {key}: {reason}")]
    WriteFailed { key: String, reason: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Invalid job: {0}")]
    InvalidInput(String),

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("Job {id} not found in dead letter queue")]
    NotInDeadLetter { id: String },
}

/// Command execution failures. The `Display` output is what lands in a
/// job's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    #[error("{message}")]
    Failed { code: i32, message: String },

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("Simulated job failure for testing retries/DLQ")]
    Simulated,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_error_display_is_job_error_text() {
        let err = ExecError::Failed {
            code: 2,
            message: "ls: cannot access 'nope'".to_string(),
        };
        assert_eq!(err.to_string(), "ls: cannot access 'nope'");
        assert_eq!(
            ExecError::Timeout(Duration::from_millis(250)).to_string(),
            "Command timed out after 250ms"
        );
    }

    #[test]
    fn nested_errors_convert() {
        let err: Error = JobError::NotFound { id: "job_1".into() }.into();
        assert_eq!(err.to_string(), "Job error: Job job_1 not found");

        let err: Error = DatabaseError::Query("boom".into()).into();
        assert!(matches!(err, Error::Database(DatabaseError::Query(_))));
    }
}
