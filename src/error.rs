// ABOUTME: Distinguishable job failure conditions
// ABOUTME: Everything else travels as anyhow::Error with context

use thiserror::Error;

/// Conditions callers need to tell apart from ordinary I/O failures.
///
/// The dispatcher returns `anyhow::Result`, so callers recover these with
/// `err.downcast_ref::<JobError>()`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Malformed or contradictory job configuration. The job never starts.
    #[error("Invalid job configuration: {0}")]
    Config(String),

    /// Post-condition failure: fewer rows were processed than required.
    #[error("Too few rows processed for {table}: minimum {min_rows}, actual {processed}")]
    TooFewRows {
        table: String,
        min_rows: u64,
        processed: u64,
    },

    /// The source reported more rows than the job allows.
    #[error("Too many rows in {table}: expected {expected}, maximum {max_rows}")]
    TooManyRows {
        table: String,
        max_rows: u64,
        expected: u64,
    },

    /// A record lacked a field the writer depends on.
    #[error("Record {key} from {table} is missing field {field}")]
    MissingField {
        table: String,
        key: String,
        field: String,
    },

    /// A partition worker was cancelled before it reported a result.
    #[error("A partition worker for {table} was interrupted")]
    PartitionInterrupted { table: String },
}

impl JobError {
    pub fn config(message: impl Into<String>) -> Self {
        JobError::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_too_few_rows_message_names_table_and_counts() {
        let err = JobError::TooFewRows {
            table: "incident".to_string(),
            min_rows: 10,
            processed: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("incident"));
        assert!(msg.contains("10"));
        assert!(msg.contains('5'));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = JobError::config("missing target").into();
        let err = err.context("job failed");
        assert_eq!(
            err.downcast_ref::<JobError>(),
            Some(&JobError::Config("missing target".to_string()))
        );
    }
}
