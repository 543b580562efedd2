// 📦 Chunk Accumulator - bounded buffer between transform and sink

use crate::error::{ImportError, Result};
use crate::record::AccountRecord;

/// Default records per chunk (one transaction per chunk)
pub const DEFAULT_CHUNK_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Accepted,
    /// The buffer reached its bound; flush before adding more
    ChunkFull,
}

/// One accumulator per executing step, never shared across threads
#[derive(Debug)]
pub struct ChunkAccumulator {
    bound: usize,
    buffer: Vec<AccountRecord>,
}

impl ChunkAccumulator {
    pub fn new(bound: usize) -> Result<Self> {
        if bound == 0 {
            return Err(ImportError::InvalidConfig(
                "chunk size must be at least 1".to_string(),
            ));
        }

        Ok(ChunkAccumulator {
            bound,
            buffer: Vec::with_capacity(bound),
        })
    }

    pub fn add(&mut self, record: AccountRecord) -> Result<ChunkStatus> {
        if self.buffer.len() >= self.bound {
            return Err(ImportError::ChunkOverflow { bound: self.bound });
        }

        self.buffer.push(record);

        if self.buffer.len() == self.bound {
            Ok(ChunkStatus::ChunkFull)
        } else {
            Ok(ChunkStatus::Accepted)
        }
    }

    /// Hand over the buffered records and start a fresh chunk
    pub fn flush(&mut self) -> Vec<AccountRecord> {
        std::mem::replace(&mut self.buffer, Vec::with_capacity(self.bound))
    }

    pub fn bound(&self) -> usize {
        self.bound
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
