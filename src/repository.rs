// 📚 Job Repository - persisted execution state for duplicate detection + restart
//
// Narrow interface: the job executor creates one JobExecution per run id,
// overwrites it as steps progress, and looks it up again on restart.

use crate::db::DataSource;
use crate::error::{ImportError, Result};
use crate::execution::{BatchStatus, JobExecution, RunId, StepState};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;

pub trait JobRepository: Send + Sync {
    /// Register a new run. Fails with `DuplicateRun` if the run id is taken.
    fn create_job_execution(&self, execution: &JobExecution) -> Result<()>;

    /// Replace the stored snapshot of an existing run (status, steps, attempt)
    fn update_job_execution(&self, execution: &JobExecution) -> Result<()>;

    /// Store progress of one step after a commit or status change
    fn save_step_state(&self, job_name: &str, run_id: &RunId, state: &StepState) -> Result<()>;

    /// Store step progress through `conn`, an open transaction on `store`,
    /// so it commits together with the chunk. Returns false when this
    /// repository does not live in `store`.
    fn save_step_state_in(
        &self,
        store: &DataSource,
        conn: &Connection,
        job_name: &str,
        run_id: &RunId,
        state: &StepState,
    ) -> Result<bool> {
        let _ = (store, conn, job_name, run_id, state);
        Ok(false)
    }

    fn find_job_execution(&self, job_name: &str, run_id: &RunId) -> Result<Option<JobExecution>>;

    /// Highest numeric run id recorded for the job
    fn last_run_number(&self, job_name: &str) -> Result<Option<u64>>;
}

// ============================================================================
// IN-MEMORY REPOSITORY
// ============================================================================

/// Process-local repository; state is lost on exit
#[derive(Default)]
pub struct InMemoryJobRepository {
    executions: Mutex<HashMap<(String, RunId), JobExecution>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, RunId), JobExecution>>> {
        self.executions
            .lock()
            .map_err(|_| ImportError::Repository("repository lock poisoned".to_string()))
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create_job_execution(&self, execution: &JobExecution) -> Result<()> {
        let mut executions = self.lock()?;
        let key = (execution.job_name.clone(), execution.run_id.clone());

        if executions.contains_key(&key) {
            return Err(ImportError::DuplicateRun {
                job_name: execution.job_name.clone(),
                run_id: execution.run_id.to_string(),
            });
        }

        executions.insert(key, execution.clone());
        Ok(())
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<()> {
        let mut executions = self.lock()?;
        let key = (execution.job_name.clone(), execution.run_id.clone());

        match executions.get_mut(&key) {
            Some(stored) => {
                *stored = execution.clone();
                Ok(())
            }
            None => Err(ImportError::UnknownRun {
                job_name: execution.job_name.clone(),
                run_id: execution.run_id.to_string(),
            }),
        }
    }

    fn save_step_state(&self, job_name: &str, run_id: &RunId, state: &StepState) -> Result<()> {
        let mut executions = self.lock()?;

        match executions.get_mut(&(job_name.to_string(), run_id.clone())) {
            Some(stored) => {
                stored.upsert_step(state.clone());
                Ok(())
            }
            None => Err(ImportError::UnknownRun {
                job_name: job_name.to_string(),
                run_id: run_id.to_string(),
            }),
        }
    }

    fn find_job_execution(&self, job_name: &str, run_id: &RunId) -> Result<Option<JobExecution>> {
        let executions = self.lock()?;
        Ok(executions.get(&(job_name.to_string(), run_id.clone())).cloned())
    }

    fn last_run_number(&self, job_name: &str) -> Result<Option<u64>> {
        let executions = self.lock()?;
        Ok(executions
            .keys()
            .filter(|(name, _)| name == job_name)
            .filter_map(|(_, run_id)| run_id.as_number())
            .max())
    }
}

// ============================================================================
// SQLITE REPOSITORY
// ============================================================================

/// Repository stored next to the imported data, so a crashed or failed run
/// can be restarted from a later process
pub struct SqliteJobRepository {
    data_source: DataSource,
}

impl SqliteJobRepository {
    pub fn new(data_source: DataSource) -> Result<Self> {
        data_source.with_connection(|conn| setup_repository(conn))??;
        Ok(SqliteJobRepository { data_source })
    }
}

pub fn setup_repository(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_job_execution (
            job_name TEXT NOT NULL,
            run_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            status TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            parameters_hash TEXT NOT NULL,
            exit_message TEXT,
            PRIMARY KEY (job_name, run_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS batch_step_execution (
            job_name TEXT NOT NULL,
            run_id TEXT NOT NULL,
            step_name TEXT NOT NULL,
            position INTEGER NOT NULL,
            status TEXT NOT NULL,
            read_count INTEGER NOT NULL,
            write_count INTEGER NOT NULL,
            skip_count INTEGER NOT NULL,
            filter_count INTEGER NOT NULL,
            commit_count INTEGER NOT NULL,
            rollback_count INTEGER NOT NULL,
            restart_offset INTEGER NOT NULL,
            committed_skip_count INTEGER NOT NULL,
            committed_filter_count INTEGER NOT NULL,
            start_time TEXT,
            end_time TEXT,
            exit_message TEXT,
            PRIMARY KEY (job_name, run_id, step_name)
        )",
        [],
    )?;

    Ok(())
}

fn upsert_step(conn: &Connection, job_name: &str, run_id: &RunId, state: &StepState) -> rusqlite::Result<()> {
    // Keep the launch order of a step on update, append otherwise
    let position: i64 = conn.query_row(
        "SELECT COALESCE(
            (SELECT position FROM batch_step_execution WHERE job_name = ?1 AND run_id = ?2 AND step_name = ?3),
            (SELECT COUNT(*) FROM batch_step_execution WHERE job_name = ?1 AND run_id = ?2)
         )",
        params![job_name, run_id.as_str(), state.step_name],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO batch_step_execution (
            job_name, run_id, step_name, position, status,
            read_count, write_count, skip_count, filter_count, commit_count, rollback_count,
            restart_offset, committed_skip_count, committed_filter_count,
            start_time, end_time, exit_message
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            job_name,
            run_id.as_str(),
            state.step_name,
            position,
            state.status.as_str(),
            state.read_count as i64,
            state.write_count as i64,
            state.skip_count as i64,
            state.filter_count as i64,
            state.commit_count as i64,
            state.rollback_count as i64,
            state.restart_offset as i64,
            state.committed_skip_count as i64,
            state.committed_filter_count as i64,
            state.start_time.map(|t| t.to_rfc3339()),
            state.end_time.map(|t| t.to_rfc3339()),
            state.exit_message,
        ],
    )?;

    Ok(())
}

fn write_job_row(conn: &Connection, execution: &JobExecution, replace: bool) -> rusqlite::Result<usize> {
    let verb = if replace { "INSERT OR REPLACE" } else { "INSERT" };
    conn.execute(
        &format!(
            "{} INTO batch_job_execution (
                job_name, run_id, attempt, status, start_time, end_time, parameters_hash, exit_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            verb
        ),
        params![
            execution.job_name,
            execution.run_id.as_str(),
            execution.attempt,
            execution.status.as_str(),
            execution.start_time.to_rfc3339(),
            execution.end_time.map(|t| t.to_rfc3339()),
            execution.parameters_hash,
            execution.exit_message,
        ],
    )
}

fn parse_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_status(value: &str) -> rusqlite::Result<BatchStatus> {
    BatchStatus::parse(value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown batch status '{}'", value).into(),
        )
    })
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

impl JobRepository for SqliteJobRepository {
    fn create_job_execution(&self, execution: &JobExecution) -> Result<()> {
        self.data_source.with_connection(|conn| -> Result<()> {
            let tx = conn.transaction()?;
            match write_job_row(&tx, execution, false) {
                Ok(_) => {}
                Err(e) if is_constraint_violation(&e) => {
                    return Err(ImportError::DuplicateRun {
                        job_name: execution.job_name.clone(),
                        run_id: execution.run_id.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
            for step in &execution.steps {
                upsert_step(&tx, &execution.job_name, &execution.run_id, step)?;
            }
            tx.commit()?;
            Ok(())
        })?
    }

    fn update_job_execution(&self, execution: &JobExecution) -> Result<()> {
        self.data_source.with_connection(|conn| -> Result<()> {
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM batch_job_execution WHERE job_name = ?1 AND run_id = ?2",
                    params![execution.job_name, execution.run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(ImportError::UnknownRun {
                    job_name: execution.job_name.clone(),
                    run_id: execution.run_id.to_string(),
                });
            }

            write_job_row(&tx, execution, true)?;
            for step in &execution.steps {
                upsert_step(&tx, &execution.job_name, &execution.run_id, step)?;
            }
            tx.commit()?;
            Ok(())
        })?
    }

    fn save_step_state(&self, job_name: &str, run_id: &RunId, state: &StepState) -> Result<()> {
        self.data_source
            .with_connection(|conn| upsert_step(conn, job_name, run_id, state))?
            .map_err(ImportError::from)
    }

    fn save_step_state_in(
        &self,
        store: &DataSource,
        conn: &Connection,
        job_name: &str,
        run_id: &RunId,
        state: &StepState,
    ) -> Result<bool> {
        if !self.data_source.same_store(store) {
            return Ok(false);
        }
        upsert_step(conn, job_name, run_id, state)?;
        Ok(true)
    }

    fn find_job_execution(&self, job_name: &str, run_id: &RunId) -> Result<Option<JobExecution>> {
        self.data_source.with_connection(|conn| -> Result<Option<JobExecution>> {
            let execution = conn
                .query_row(
                    "SELECT attempt, status, start_time, end_time, parameters_hash, exit_message
                     FROM batch_job_execution
                     WHERE job_name = ?1 AND run_id = ?2",
                    params![job_name, run_id.as_str()],
                    |row| {
                        let status: String = row.get(1)?;
                        let start_time: String = row.get(2)?;
                        Ok(JobExecution {
                            run_id: run_id.clone(),
                            job_name: job_name.to_string(),
                            attempt: row.get(0)?,
                            status: parse_status(&status)?,
                            start_time: parse_time(Some(start_time)).unwrap_or_else(Utc::now),
                            end_time: parse_time(row.get(3)?),
                            parameters_hash: row.get(4)?,
                            steps: Vec::new(),
                            exit_message: row.get(5)?,
                        })
                    },
                )
                .optional()?;

            let Some(mut execution) = execution else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT step_name, status, read_count, write_count, skip_count, filter_count,
                        commit_count, rollback_count, restart_offset,
                        committed_skip_count, committed_filter_count,
                        start_time, end_time, exit_message
                 FROM batch_step_execution
                 WHERE job_name = ?1 AND run_id = ?2
                 ORDER BY position",
            )?;

            execution.steps = stmt
                .query_map(params![job_name, run_id.as_str()], |row| {
                    let status: String = row.get(1)?;
                    Ok(StepState {
                        step_name: row.get(0)?,
                        status: parse_status(&status)?,
                        read_count: row.get::<_, i64>(2)? as u64,
                        write_count: row.get::<_, i64>(3)? as u64,
                        skip_count: row.get::<_, i64>(4)? as u64,
                        filter_count: row.get::<_, i64>(5)? as u64,
                        commit_count: row.get::<_, i64>(6)? as u64,
                        rollback_count: row.get::<_, i64>(7)? as u64,
                        restart_offset: row.get::<_, i64>(8)? as u64,
                        committed_skip_count: row.get::<_, i64>(9)? as u64,
                        committed_filter_count: row.get::<_, i64>(10)? as u64,
                        start_time: parse_time(row.get(11)?),
                        end_time: parse_time(row.get(12)?),
                        exit_message: row.get(13)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(Some(execution))
        })?
    }

    fn last_run_number(&self, job_name: &str) -> Result<Option<u64>> {
        self.data_source.with_connection(|conn| -> Result<Option<u64>> {
            let mut stmt = conn.prepare("SELECT run_id FROM batch_job_execution WHERE job_name = ?1")?;
            let run_ids = stmt
                .query_map(params![job_name], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(run_ids
                .into_iter()
                .filter_map(|id| RunId::from(id).as_number())
                .max())
        })?
    }
}
