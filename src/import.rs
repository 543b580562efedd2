// 🏦 Account Import - statement file → account table, as one job
//
// ACCOUNT-IMPORT-JOB has a single chunk step ("step1"):
//   FileSource → FieldMapper → (identity) → SqliteAccountSink
// Execution state lives in the same database, so a failed run can be
// restarted by a later process.

use crate::config::ImportConfig;
use crate::db::{setup_database, verify_count, DataSource};
use crate::execution::{JobExecution, RunId};
use crate::job::{JobDefinition, JobExecutor, SequenceRunIds};
use crate::mapper::FieldMapper;
use crate::repository::SqliteJobRepository;
use crate::sink::SqliteAccountSink;
use crate::source::SourceProvider;
use crate::step::ChunkStep;
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub struct AccountImporter {
    config: ImportConfig,
    data_source: DataSource,
    executor: JobExecutor,
}

impl AccountImporter {
    /// Validate the config and prepare the account + repository tables
    pub fn new(config: ImportConfig, data_source: DataSource) -> Result<Self> {
        config.validate()?;
        data_source.with_connection(|conn| setup_database(conn))??;

        let repository = SqliteJobRepository::new(data_source.clone())?;
        let executor = JobExecutor::new(Arc::new(repository));

        Ok(AccountImporter {
            config,
            data_source,
            executor,
        })
    }

    /// Run with a differently configured executor (notifier, repository)
    pub fn with_executor(mut self, executor: JobExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn executor(&self) -> &JobExecutor {
        &self.executor
    }

    /// The account job reading from `source`
    pub fn build_job(&self, source: impl SourceProvider + 'static) -> Result<JobDefinition> {
        let config = &self.config;

        let mapper = FieldMapper::new(config.field_mapping()?)
            .with_date_formats(config.date_formats.iter().cloned());
        let sink = SqliteAccountSink::with_template(self.data_source.clone(), &config.insert_sql)?;

        let mut step = ChunkStep::builder(&config.step_name)
            .source(source)
            .mapper(mapper)
            .sink(sink)
            .chunk_size(config.chunk_size);
        if let Some(limit) = config.skip_limit {
            step = step.skip_limit(limit);
        }

        Ok(JobDefinition::new(&config.job_name)
            .step(step.build()?)
            .parameter("lines_to_skip", config.lines_to_skip.to_string())
            .parameter("delimiter", config.delimiter.to_string()))
    }

    /// Launch a new run. Without an explicit id the next number in sequence is used.
    pub fn import(&self, source: impl SourceProvider + 'static, run_id: Option<RunId>) -> Result<JobExecution> {
        let mut job = self.build_job(source)?;

        let execution = match run_id {
            Some(run_id) => self.executor.run(&mut job, run_id)?,
            None => self.executor.launch(&mut job, &mut SequenceRunIds)?,
        };

        info!(run_id = %execution.run_id, status = %execution.status, "Import finished");
        Ok(execution)
    }

    /// Continue a FAILED run; the source must describe the same input
    pub fn restart(&self, source: impl SourceProvider + 'static, run_id: RunId) -> Result<JobExecution> {
        let mut job = self.build_job(source)?;
        let execution = self.executor.restart(&mut job, run_id)?;

        info!(
            run_id = %execution.run_id,
            attempt = execution.attempt,
            status = %execution.status,
            "Restart finished"
        );
        Ok(execution)
    }

    /// Mark a run left STARTING/STARTED by a dead process as FAILED
    pub fn abandon(&self, run_id: &RunId) -> Result<JobExecution> {
        Ok(self.executor.abandon(&self.config.job_name, run_id)?)
    }

    pub fn account_count(&self) -> Result<i64> {
        self.data_source.with_connection(|conn| verify_count(conn))?
    }
}
