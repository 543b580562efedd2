// Account Import - Core Library
// Chunked batch import of bank statement files into the account table

pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod execution;
pub mod import;
pub mod job;
pub mod logging;
pub mod mapper;
pub mod record;
pub mod repository;
pub mod sink;
pub mod source;
pub mod step;
pub mod transform;

// Re-export commonly used types
pub use chunk::{ChunkAccumulator, ChunkStatus, DEFAULT_CHUNK_SIZE};
pub use config::ImportConfig;
pub use db::{get_all_accounts, setup_database, verify_count, DataSource, ACCOUNT_INSERT_SQL};
pub use error::{ImportError, Result};
pub use execution::{parameters_hash, BatchStatus, JobExecution, RunId, StepState};
pub use import::AccountImporter;
pub use job::{
    CompletionNotifier, JobDefinition, JobExecutor, LoggingNotifier, RunIdGenerator,
    SequenceRunIds, UuidRunIds,
};
pub use logging::{init_logging, LogConfig, LogFormat, LogLevel};
pub use mapper::{FieldMapper, FieldMapping};
pub use record::{AccountField, AccountRecord, RawLine};
pub use repository::{InMemoryJobRepository, JobRepository, SqliteJobRepository};
pub use sink::{CommitHook, RecordSink, SqliteAccountSink, WriteResult};
pub use source::{DelimitedSource, FileSource, InlineSource, RecordSource, SourceOptions, SourceProvider};
pub use step::{ChunkStep, ChunkStepBuilder, StepListener};
pub use transform::{CompositeTransformer, IdentityTransformer, RecordTransformer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
