// ⏱️ Execution state - StepState and JobExecution snapshots
//
// StepState is mutated only by the step executor. JobExecution is created at
// launch and finalized once the terminal status is known.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Starting,
    Started,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<BatchStatus> {
        match value {
            "STARTING" => Some(BatchStatus::Starting),
            "STARTED" => Some(BatchStatus::Started),
            "COMPLETED" => Some(BatchStatus::Completed),
            "FAILED" => Some(BatchStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// STEP STATE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub step_name: String,
    pub status: BatchStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub skip_count: u64,
    /// Records dropped by the transformer
    pub filter_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    /// Data lines consumed when the last chunk committed
    pub restart_offset: u64,
    pub committed_skip_count: u64,
    pub committed_filter_count: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_message: Option<String>,
}

impl StepState {
    pub fn new(step_name: impl Into<String>) -> Self {
        StepState {
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            read_count: 0,
            write_count: 0,
            skip_count: 0,
            filter_count: 0,
            commit_count: 0,
            rollback_count: 0,
            restart_offset: 0,
            committed_skip_count: 0,
            committed_filter_count: 0,
            start_time: None,
            end_time: None,
            exit_message: None,
        }
    }

    /// Fresh state that continues from the last commit of `previous`.
    /// Counts of the rolled-back chunk are dropped; those lines are read again.
    pub fn resume_from(previous: &StepState) -> Self {
        let mut state = StepState::new(previous.step_name.clone());
        state.restart_offset = previous.restart_offset;
        state.read_count = previous.restart_offset;
        state.write_count = previous.write_count;
        state.skip_count = previous.committed_skip_count;
        state.filter_count = previous.committed_filter_count;
        state.committed_skip_count = previous.committed_skip_count;
        state.committed_filter_count = previous.committed_filter_count;
        state.commit_count = previous.commit_count;
        state
    }

    /// Record a successful flush as the new restart point
    pub fn mark_committed(&mut self) {
        self.commit_count += 1;
        self.restart_offset = self.read_count;
        self.committed_skip_count = self.skip_count;
        self.committed_filter_count = self.filter_count;
    }

    /// read == write + skip + filter (holds once no chunk is in flight)
    pub fn is_balanced(&self) -> bool {
        self.read_count == self.write_count + self.skip_count + self.filter_count
    }

    pub fn summary(&self) -> String {
        format!(
            "{} [{}]: read={}, written={}, skipped={}, filtered={}, commits={}, rollbacks={}",
            self.step_name,
            self.status,
            self.read_count,
            self.write_count,
            self.skip_count,
            self.filter_count,
            self.commit_count,
            self.rollback_count
        )
    }
}

// ============================================================================
// RUN ID
// ============================================================================

/// Identity of one job invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        RunId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric value for sequence-generated ids
    pub fn as_number(&self) -> Option<u64> {
        self.0.parse().ok()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for RunId {
    fn from(value: u64) -> Self {
        RunId(value.to_string())
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        RunId(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        RunId(value)
    }
}

// ============================================================================
// JOB EXECUTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobExecution {
    pub run_id: RunId,
    pub job_name: String,
    /// 1 for the first launch, +1 per restart
    pub attempt: u32,
    pub status: BatchStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// SHA-256 over the job parameters; a restart must match it
    pub parameters_hash: String,
    pub steps: Vec<StepState>,
    pub exit_message: Option<String>,
}

impl JobExecution {
    pub fn new(job_name: impl Into<String>, run_id: RunId, parameters_hash: String) -> Self {
        JobExecution {
            run_id,
            job_name: job_name.into(),
            attempt: 1,
            status: BatchStatus::Starting,
            start_time: Utc::now(),
            end_time: None,
            parameters_hash,
            steps: Vec::new(),
            exit_message: None,
        }
    }

    pub fn step(&self, step_name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.step_name == step_name)
    }

    /// Insert or replace the state of one step, keeping launch order
    pub fn upsert_step(&mut self, state: StepState) {
        match self.steps.iter_mut().find(|s| s.step_name == state.step_name) {
            Some(existing) => *existing = state,
            None => self.steps.push(state),
        }
    }

    pub fn total_read(&self) -> u64 {
        self.steps.iter().map(|s| s.read_count).sum()
    }

    pub fn total_written(&self) -> u64 {
        self.steps.iter().map(|s| s.write_count).sum()
    }

    pub fn total_skipped(&self) -> u64 {
        self.steps.iter().map(|s| s.skip_count).sum()
    }

    pub fn total_filtered(&self) -> u64 {
        self.steps.iter().map(|s| s.filter_count).sum()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} run {} (attempt {}) {}: read={}, written={}, skipped={}, filtered={}",
            self.job_name,
            self.run_id,
            self.attempt,
            self.status,
            self.total_read(),
            self.total_written(),
            self.total_skipped(),
            self.total_filtered()
        )
    }
}

/// Stable fingerprint of job parameters (sorted `key=value` lines)
pub fn parameters_hash(parameters: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in parameters {
        hasher.update(format!("{}={}\n", key, value));
    }
    format!("{:x}", hasher.finalize())
}
