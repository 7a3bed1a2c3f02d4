// ABOUTME: Library root for record-replicator
// ABOUTME: Replicates paginated REST table records into PostgreSQL tables

pub mod config;
pub mod daemon;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod record;
pub mod runner;
pub mod source;
pub mod state;
pub mod sync;
pub mod target;
pub mod utils;
pub mod writer;

pub use config::{Action, JobConfig, ReplicatorConfig};
pub use error::JobError;
pub use metrics::{ReaderMetrics, WriterMetrics};
pub use runner::JobRunner;
