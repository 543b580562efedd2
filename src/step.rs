// ⚙️ Step Executor - chunk-oriented read → map → transform → accumulate → flush
//
// STARTING → STARTED → {COMPLETED, FAILED}
//
// Policy:
// - MalformedRecord / InvalidEncoding / FieldCoercionError: skip the line, count it, continue
// - SinkWriteError: the chunk's transaction is rolled back, step FAILED, no retry
// - SourceUnavailable: FAILED while STARTING, no chunk is ever opened
// - InputTruncated: a resumed input ends before the restart offset, FAILED
//
// Progress a chunk commits with is checkpointed inside the chunk's own
// transaction when the listener can join it.

use crate::chunk::{ChunkAccumulator, ChunkStatus, DEFAULT_CHUNK_SIZE};
use crate::db::DataSource;
use crate::error::{ImportError, Result};
use crate::execution::{BatchStatus, StepState};
use crate::mapper::FieldMapper;
use crate::record::RawLine;
use crate::sink::RecordSink;
use crate::source::SourceProvider;
use crate::transform::{IdentityTransformer, RecordTransformer};
use chrono::Utc;
use rusqlite::Connection;
use std::collections::BTreeMap;
use tracing::{debug, error, info, info_span, warn};

// ============================================================================
// STEP LISTENER
// ============================================================================

/// Receives the state of a running step
pub trait StepListener {
    /// State after STARTED, after every commit and once more with the
    /// terminal status
    fn on_progress(&mut self, state: &StepState);

    /// Store `state`, the progress a chunk commits with, through `conn`:
    /// the chunk's open transaction on `store`. Returns false if the
    /// listener keeps its state elsewhere.
    fn checkpoint(&mut self, store: &DataSource, conn: &Connection, state: &StepState) -> Result<bool> {
        let _ = (store, conn, state);
        Ok(false)
    }
}

impl<F: FnMut(&StepState)> StepListener for F {
    fn on_progress(&mut self, state: &StepState) {
        self(state)
    }
}

// ============================================================================
// CHUNK STEP
// ============================================================================

pub struct ChunkStep {
    name: String,
    source: Box<dyn SourceProvider>,
    mapper: FieldMapper,
    transformer: Box<dyn RecordTransformer>,
    sink: Box<dyn RecordSink>,
    chunk_size: usize,
    skip_limit: Option<u64>,
}

impl ChunkStep {
    pub fn builder(name: impl Into<String>) -> ChunkStepBuilder {
        ChunkStepBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Identifying parameters, prefixed with the step name
    pub fn parameters(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert(format!("{}.input", self.name), self.source.describe());
        params.insert(format!("{}.chunk_size", self.name), self.chunk_size.to_string());
        params
    }

    /// Run the step to a terminal status.
    ///
    /// `resume` continues a previous FAILED attempt from its last committed
    /// chunk. `on_progress` sees the state after STARTED, after every commit
    /// and once more with the terminal status.
    pub fn execute(
        &mut self,
        resume: Option<&StepState>,
        mut on_progress: &mut dyn FnMut(&StepState),
    ) -> StepState {
        self.execute_with(resume, &mut on_progress)
    }

    /// Same as `execute`, reporting to a listener that may checkpoint
    /// progress inside each chunk transaction
    pub fn execute_with(&mut self, resume: Option<&StepState>, listener: &mut dyn StepListener) -> StepState {
        let mut state = match resume {
            Some(previous) => StepState::resume_from(previous),
            None => StepState::new(self.name.clone()),
        };
        state.start_time = Some(Utc::now());

        let span = info_span!("step", step = %self.name);
        let _enter = span.enter();

        match self.run_chunks(&mut state, listener) {
            Ok(()) => {
                state.status = BatchStatus::Completed;
                info!(
                    read = state.read_count,
                    written = state.write_count,
                    skipped = state.skip_count,
                    filtered = state.filter_count,
                    commits = state.commit_count,
                    "Step completed"
                );
            }
            Err(e) => {
                state.status = BatchStatus::Failed;
                state.exit_message = Some(e.to_string());
                error!(
                    error = %e,
                    read = state.read_count,
                    written = state.write_count,
                    restart_offset = state.restart_offset,
                    "Step failed"
                );
            }
        }

        state.end_time = Some(Utc::now());
        listener.on_progress(&state);
        state
    }

    fn run_chunks(&mut self, state: &mut StepState, listener: &mut dyn StepListener) -> Result<()> {
        let mut source = self.source.open()?;
        let mut accumulator = ChunkAccumulator::new(self.chunk_size)?;

        if state.restart_offset > 0 {
            let skipped = source.skip_records(state.restart_offset)?;
            if skipped < state.restart_offset {
                return Err(ImportError::InputTruncated {
                    restart_offset: state.restart_offset,
                    available: skipped,
                });
            }
            info!(
                restart_offset = state.restart_offset,
                skipped, "Resuming after last committed chunk"
            );
        }

        state.status = BatchStatus::Started;
        listener.on_progress(state);

        loop {
            let line = match source.next_line() {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) if e.is_skippable() => {
                    state.read_count += 1;
                    self.skip(state, &e, None)?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            state.read_count += 1;
            let line_number = line.line_number;

            let record = match self.mapper.map(&line) {
                Ok(record) => record,
                Err(e) if e.is_skippable() => {
                    self.skip(state, &e, Some(&line))?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(record) = self.transformer.transform(record) else {
                state.filter_count += 1;
                debug!(line = line_number, "Record filtered");
                continue;
            };

            if accumulator.add(record)? == ChunkStatus::ChunkFull {
                flush(self.sink.as_mut(), &mut accumulator, state, listener)?;
            }
        }

        if !accumulator.is_empty() {
            flush(self.sink.as_mut(), &mut accumulator, state, listener)?;
        }

        Ok(())
    }

    /// Count a skipped line; fails once the skip limit is exceeded
    fn skip(&self, state: &mut StepState, error: &ImportError, line: Option<&RawLine>) -> Result<()> {
        state.skip_count += 1;
        let line_number = error.line_number().unwrap_or_default();
        warn!(line = line_number, tokens = ?line.map(|l| &l.tokens), error = %error, "Skipping record");

        match self.skip_limit {
            Some(limit) if state.skip_count > limit => {
                Err(ImportError::SkipLimitExceeded { limit, line_number })
            }
            _ => Ok(()),
        }
    }
}

/// Write the buffered chunk in one transaction. On failure the chunk is
/// dropped; nothing of it was persisted.
fn flush(
    sink: &mut dyn RecordSink,
    accumulator: &mut ChunkAccumulator,
    state: &mut StepState,
    listener: &mut dyn StepListener,
) -> Result<()> {
    let chunk = accumulator.flush();

    let mut committed = state.clone();
    committed.write_count += chunk.len() as u64;
    committed.mark_committed();

    let store = sink.data_source().cloned();
    let mut checkpointed = false;
    let mut before_commit = |conn: &Connection| -> Result<()> {
        if let Some(store) = &store {
            checkpointed = listener.checkpoint(store, conn, &committed)?;
        }
        Ok(())
    };

    match sink.write_with(&chunk, &mut before_commit) {
        Ok(result) => {
            *state = committed;
            info!(
                chunk = state.commit_count,
                size = result.written,
                read = state.read_count,
                written = state.write_count,
                skipped = state.skip_count,
                checkpointed,
                "Chunk committed"
            );
            listener.on_progress(state);
            Ok(())
        }
        Err(e) => {
            state.rollback_count += 1;
            error!(chunk = state.commit_count + 1, size = chunk.len(), error = %e, "Chunk rolled back");
            Err(e)
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

pub struct ChunkStepBuilder {
    name: String,
    source: Option<Box<dyn SourceProvider>>,
    mapper: FieldMapper,
    transformer: Box<dyn RecordTransformer>,
    sink: Option<Box<dyn RecordSink>>,
    chunk_size: usize,
    skip_limit: Option<u64>,
}

impl ChunkStepBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        ChunkStepBuilder {
            name: name.into(),
            source: None,
            mapper: FieldMapper::default(),
            transformer: Box::new(IdentityTransformer),
            sink: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            skip_limit: None,
        }
    }

    pub fn source(mut self, source: impl SourceProvider + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn mapper(mut self, mapper: FieldMapper) -> Self {
        self.mapper = mapper;
        self
    }

    pub fn transformer(mut self, transformer: impl RecordTransformer + 'static) -> Self {
        self.transformer = Box::new(transformer);
        self
    }

    pub fn sink(mut self, sink: impl RecordSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Fail the step once more than `limit` lines were skipped
    pub fn skip_limit(mut self, limit: u64) -> Self {
        self.skip_limit = Some(limit);
        self
    }

    pub fn build(self) -> Result<ChunkStep> {
        if self.chunk_size == 0 {
            return Err(ImportError::InvalidConfig(format!(
                "step '{}': chunk size must be at least 1",
                self.name
            )));
        }

        let source = self.source.ok_or_else(|| {
            ImportError::InvalidConfig(format!("step '{}' has no source", self.name))
        })?;
        let sink = self
            .sink
            .ok_or_else(|| ImportError::InvalidConfig(format!("step '{}' has no sink", self.name)))?;

        Ok(ChunkStep {
            name: self.name,
            source,
            mapper: self.mapper,
            transformer: self.transformer,
            sink,
            chunk_size: self.chunk_size,
            skip_limit: self.skip_limit,
        })
    }
}
