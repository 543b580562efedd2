// 🏃 Job Executor - runs the steps of a job in order under one run id
//
// A run id is registered once; launching it again is rejected. A FAILED run
// can be restarted: COMPLETED steps are kept, the failed step resumes after
// its last committed chunk. A run left STARTING/STARTED by a dead process
// has to be abandoned (marked FAILED) first.

use crate::db::DataSource;
use crate::error::{ImportError, Result};
use crate::execution::{parameters_hash, BatchStatus, JobExecution, RunId, StepState};
use crate::repository::JobRepository;
use crate::step::{ChunkStep, StepListener};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashSet};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use tracing::{info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// JOB DEFINITION
// ============================================================================

pub struct JobDefinition {
    name: String,
    steps: Vec<ChunkStep>,
    parameters: BTreeMap<String, String>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        JobDefinition {
            name: name.into(),
            steps: Vec::new(),
            parameters: BTreeMap::new(),
        }
    }

    /// Append a step; its identifying parameters join the job's
    pub fn step(mut self, step: ChunkStep) -> Self {
        self.parameters.extend(step.parameters());
        self.steps.push(step);
        self
    }

    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameters_hash(&self) -> String {
        parameters_hash(&self.parameters)
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(ImportError::InvalidConfig(format!(
                "job '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name()) {
                return Err(ImportError::InvalidConfig(format!(
                    "job '{}' has two steps named '{}'",
                    self.name,
                    step.name()
                )));
            }
        }

        Ok(())
    }
}

// ============================================================================
// RUN ID GENERATORS
// ============================================================================

pub trait RunIdGenerator {
    fn next_run_id(&mut self, job_name: &str, repository: &dyn JobRepository) -> Result<RunId>;
}

/// 1, 2, 3, ... continuing after the highest numeric id already stored
#[derive(Debug, Default)]
pub struct SequenceRunIds;

impl RunIdGenerator for SequenceRunIds {
    fn next_run_id(&mut self, job_name: &str, repository: &dyn JobRepository) -> Result<RunId> {
        let last = repository.last_run_number(job_name)?.unwrap_or(0);
        Ok(RunId::from(last + 1))
    }
}

/// Random v4 UUIDs; needs no repository lookup
#[derive(Debug, Default)]
pub struct UuidRunIds;

impl RunIdGenerator for UuidRunIds {
    fn next_run_id(&mut self, _job_name: &str, _repository: &dyn JobRepository) -> Result<RunId> {
        Ok(RunId::new(Uuid::new_v4().to_string()))
    }
}

// ============================================================================
// COMPLETION NOTIFIERS
// ============================================================================

/// Told once per run, with the final snapshot, after it was stored
pub trait CompletionNotifier {
    fn job_completed(&self, execution: &JobExecution);
}

impl<F> CompletionNotifier for F
where
    F: Fn(&JobExecution),
{
    fn job_completed(&self, execution: &JobExecution) {
        self(execution)
    }
}

impl CompletionNotifier for Sender<JobExecution> {
    fn job_completed(&self, execution: &JobExecution) {
        if self.send(execution.clone()).is_err() {
            warn!(run_id = %execution.run_id, "Completion receiver dropped");
        }
    }
}

/// Logs the final summary
#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl CompletionNotifier for LoggingNotifier {
    fn job_completed(&self, execution: &JobExecution) {
        match execution.status {
            BatchStatus::Completed => info!(
                job = %execution.job_name,
                run_id = %execution.run_id,
                read = execution.total_read(),
                written = execution.total_written(),
                skipped = execution.total_skipped(),
                "Job finished: {}",
                execution.summary()
            ),
            _ => warn!(
                job = %execution.job_name,
                run_id = %execution.run_id,
                exit_message = execution.exit_message.as_deref().unwrap_or(""),
                "Job finished: {}",
                execution.summary()
            ),
        }
    }
}

// ============================================================================
// JOB EXECUTOR
// ============================================================================

pub struct JobExecutor {
    repository: Arc<dyn JobRepository>,
    notifier: Box<dyn CompletionNotifier>,
}

impl JobExecutor {
    pub fn new(repository: Arc<dyn JobRepository>) -> Self {
        JobExecutor {
            repository,
            notifier: Box::new(LoggingNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: impl CompletionNotifier + 'static) -> Self {
        self.notifier = Box::new(notifier);
        self
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// Execute under a caller-chosen run id. Fails with `DuplicateRun` if
    /// the id was used before.
    pub fn run(&self, job: &mut JobDefinition, run_id: RunId) -> Result<JobExecution> {
        job.validate()?;

        let execution = JobExecution::new(job.name(), run_id, job.parameters_hash());
        self.repository.create_job_execution(&execution)?;

        info!(job = %job.name(), run_id = %execution.run_id, "Job launched");
        self.execute(job, execution)
    }

    /// Execute under the next id of `generator`
    pub fn launch(&self, job: &mut JobDefinition, generator: &mut dyn RunIdGenerator) -> Result<JobExecution> {
        let run_id = generator.next_run_id(job.name(), self.repository.as_ref())?;
        self.run(job, run_id)
    }

    /// Mark a run that is still STARTING/STARTED as FAILED, so it can be
    /// restarted. Only safe once the process that ran it is gone. A FAILED
    /// run is returned unchanged.
    pub fn abandon(&self, job_name: &str, run_id: &RunId) -> Result<JobExecution> {
        let mut execution = self
            .repository
            .find_job_execution(job_name, run_id)?
            .ok_or_else(|| ImportError::UnknownRun {
                job_name: job_name.to_string(),
                run_id: run_id.to_string(),
            })?;

        match execution.status {
            BatchStatus::Failed => return Ok(execution),
            BatchStatus::Completed => {
                return Err(ImportError::NotRestartable {
                    job_name: job_name.to_string(),
                    run_id: run_id.to_string(),
                    status: execution.status.to_string(),
                })
            }
            BatchStatus::Starting | BatchStatus::Started => {}
        }

        let now = Utc::now();
        for step in execution.steps.iter_mut().filter(|s| !s.status.is_terminal()) {
            step.status = BatchStatus::Failed;
            step.end_time = Some(now);
            step.exit_message = Some("abandoned".to_string());
        }
        execution.status = BatchStatus::Failed;
        execution.end_time = Some(now);
        execution.exit_message = Some("abandoned".to_string());
        self.repository.update_job_execution(&execution)?;

        warn!(job = %job_name, run_id = %run_id, "Run abandoned");
        Ok(execution)
    }

    /// Continue a FAILED run with the same parameters
    pub fn restart(&self, job: &mut JobDefinition, run_id: RunId) -> Result<JobExecution> {
        job.validate()?;

        let previous = self
            .repository
            .find_job_execution(job.name(), &run_id)?
            .ok_or_else(|| ImportError::UnknownRun {
                job_name: job.name().to_string(),
                run_id: run_id.to_string(),
            })?;

        match previous.status {
            BatchStatus::Failed => {}
            BatchStatus::Completed => {
                return Err(ImportError::NotRestartable {
                    job_name: job.name().to_string(),
                    run_id: run_id.to_string(),
                    status: previous.status.to_string(),
                })
            }
            BatchStatus::Starting | BatchStatus::Started => {
                return Err(ImportError::AlreadyRunning {
                    job_name: job.name().to_string(),
                    run_id: run_id.to_string(),
                    status: previous.status.to_string(),
                })
            }
        }

        if previous.parameters_hash != job.parameters_hash() {
            return Err(ImportError::ParametersChanged {
                job_name: job.name().to_string(),
                run_id: run_id.to_string(),
            });
        }

        let mut execution = previous;
        execution.attempt += 1;
        execution.status = BatchStatus::Starting;
        execution.start_time = Utc::now();
        execution.end_time = None;
        execution.exit_message = None;
        self.repository.update_job_execution(&execution)?;

        info!(
            job = %job.name(),
            run_id = %execution.run_id,
            attempt = execution.attempt,
            "Job restarted"
        );
        self.execute(job, execution)
    }

    fn execute(&self, job: &mut JobDefinition, mut execution: JobExecution) -> Result<JobExecution> {
        let span = info_span!("job", job = %execution.job_name, run_id = %execution.run_id);
        let _enter = span.enter();

        // First repository failure; reported after the notifier has run
        let mut repository_error: Option<ImportError> = None;

        execution.status = BatchStatus::Started;
        if let Err(e) = self.repository.update_job_execution(&execution) {
            repository_error.get_or_insert(e);
        }

        for step in job.steps.iter_mut() {
            let previous = execution.step(step.name()).cloned();

            if let Some(done) = previous.as_ref().filter(|p| p.status == BatchStatus::Completed) {
                info!(step = %done.step_name, "Step already completed, not re-run");
                continue;
            }

            let mut progress = RepositoryProgress {
                repository: self.repository.as_ref(),
                job_name: &execution.job_name,
                run_id: &execution.run_id,
                error: None,
            };
            let state = step.execute_with(previous.as_ref(), &mut progress);
            if let Some(e) = progress.error {
                repository_error.get_or_insert(e);
            }

            let failed = state.status == BatchStatus::Failed;
            let message = state.exit_message.clone();
            execution.upsert_step(state);

            if failed {
                execution.status = BatchStatus::Failed;
                execution.exit_message = Some(format!(
                    "step '{}' failed: {}",
                    step.name(),
                    message.unwrap_or_default()
                ));
                break;
            }
        }

        if execution.status != BatchStatus::Failed {
            execution.status = BatchStatus::Completed;
        }
        execution.end_time = Some(Utc::now());

        if let Err(e) = self.repository.update_job_execution(&execution) {
            repository_error.get_or_insert(e);
        }

        self.notifier.job_completed(&execution);

        match repository_error {
            Some(e) => Err(e),
            None => Ok(execution),
        }
    }
}

/// Saves step progress to the job repository while a step runs
struct RepositoryProgress<'a> {
    repository: &'a dyn JobRepository,
    job_name: &'a str,
    run_id: &'a RunId,
    error: Option<ImportError>,
}

impl StepListener for RepositoryProgress<'_> {
    fn on_progress(&mut self, state: &StepState) {
        if let Err(e) = self.repository.save_step_state(self.job_name, self.run_id, state) {
            warn!(step = %state.step_name, error = %e, "Failed to save step progress");
            self.error.get_or_insert(e);
        }
    }

    fn checkpoint(&mut self, store: &DataSource, conn: &Connection, state: &StepState) -> Result<bool> {
        self.repository
            .save_step_state_in(store, conn, self.job_name, self.run_id, state)
    }
}
