// 🔁 Record Transformer - pure AccountRecord -> Option<AccountRecord>
//
// Returning None filters the record out of the chunk. Filtered records are
// neither written nor skipped; the step counts them separately.

use crate::record::AccountRecord;

pub trait RecordTransformer {
    fn transform(&self, record: AccountRecord) -> Option<AccountRecord>;
}

/// Pass-through (the default for account imports)
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl RecordTransformer for IdentityTransformer {
    fn transform(&self, record: AccountRecord) -> Option<AccountRecord> {
        Some(record)
    }
}

impl<F> RecordTransformer for F
where
    F: Fn(AccountRecord) -> Option<AccountRecord>,
{
    fn transform(&self, record: AccountRecord) -> Option<AccountRecord> {
        self(record)
    }
}

/// Runs transformers in order; the first `None` stops the chain
#[derive(Default)]
pub struct CompositeTransformer {
    stages: Vec<Box<dyn RecordTransformer + Send>>,
}

impl CompositeTransformer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(mut self, stage: impl RecordTransformer + Send + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }
}

impl RecordTransformer for CompositeTransformer {
    fn transform(&self, record: AccountRecord) -> Option<AccountRecord> {
        self.stages
            .iter()
            .try_fold(record, |record, stage| stage.transform(record))
    }
}
