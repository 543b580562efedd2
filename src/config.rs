// ⚙️ Import configuration
//
// Layered: defaults → JSON file → ACCOUNT_IMPORT_* environment → CLI flags.

use crate::chunk::DEFAULT_CHUNK_SIZE;
use crate::db::ACCOUNT_INSERT_SQL;
use crate::error::ImportError;
use crate::mapper::{FieldMapping, DEFAULT_DATE_FORMATS};
use crate::source::SourceOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_JOB_NAME: &str = "ACCOUNT-IMPORT-JOB";
pub const DEFAULT_STEP_NAME: &str = "step1";

/// Header names of the bank statement export, in column order
pub const DEFAULT_FIELD_NAMES: [&str; 5] = ["Date", "Description", "Deposits", "Withdrawls", "Balance"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub job_name: String,
    pub step_name: String,
    pub chunk_size: usize,
    pub lines_to_skip: u64,
    pub delimiter: char,
    /// Fail the step after this many skipped lines (unlimited if absent)
    pub skip_limit: Option<u64>,
    pub field_names: Vec<String>,
    pub included_indices: Vec<usize>,
    pub date_formats: Vec<String>,
    pub insert_sql: String,
}

impl Default for ImportConfig {
    fn default() -> Self {
        ImportConfig {
            job_name: DEFAULT_JOB_NAME.to_string(),
            step_name: DEFAULT_STEP_NAME.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            lines_to_skip: 1,
            delimiter: ',',
            skip_limit: None,
            field_names: DEFAULT_FIELD_NAMES.iter().map(|s| s.to_string()).collect(),
            included_indices: (0..DEFAULT_FIELD_NAMES.len()).collect(),
            date_formats: DEFAULT_DATE_FORMATS.iter().map(|s| s.to_string()).collect(),
            insert_sql: ACCOUNT_INSERT_SQL.to_string(),
        }
    }
}

impl ImportConfig {
    /// Load a JSON config file; missing keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `ACCOUNT_IMPORT_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("ACCOUNT_IMPORT_CHUNK_SIZE") {
            self.chunk_size = v
                .parse()
                .with_context(|| format!("ACCOUNT_IMPORT_CHUNK_SIZE is not a number: {}", v))?;
        }
        if let Some(v) = lookup("ACCOUNT_IMPORT_LINES_TO_SKIP") {
            self.lines_to_skip = v
                .parse()
                .with_context(|| format!("ACCOUNT_IMPORT_LINES_TO_SKIP is not a number: {}", v))?;
        }
        if let Some(v) = lookup("ACCOUNT_IMPORT_SKIP_LIMIT") {
            self.skip_limit = Some(
                v.parse()
                    .with_context(|| format!("ACCOUNT_IMPORT_SKIP_LIMIT is not a number: {}", v))?,
            );
        }
        if let Some(v) = lookup("ACCOUNT_IMPORT_DELIMITER") {
            let mut chars = v.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => self.delimiter = c,
                _ => anyhow::bail!("ACCOUNT_IMPORT_DELIMITER must be a single character, got {:?}", v),
            }
        }
        if let Some(v) = lookup("ACCOUNT_IMPORT_JOB_NAME") {
            self.job_name = v;
        }

        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), ImportError> {
        if self.chunk_size == 0 {
            return Err(ImportError::InvalidConfig(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if !self.delimiter.is_ascii() || matches!(self.delimiter, '"' | '\n' | '\r') {
            return Err(ImportError::InvalidConfig(format!(
                "delimiter {:?} must be a single ASCII character other than a quote or newline",
                self.delimiter
            )));
        }
        if self.job_name.trim().is_empty() || self.step_name.trim().is_empty() {
            return Err(ImportError::InvalidConfig(
                "job_name and step_name must not be empty".to_string(),
            ));
        }
        if self.date_formats.is_empty() {
            return Err(ImportError::InvalidConfig(
                "at least one date format is required".to_string(),
            ));
        }

        self.field_mapping()?;
        Ok(())
    }

    pub fn field_mapping(&self) -> std::result::Result<FieldMapping, ImportError> {
        FieldMapping::new(self.field_names.as_slice(), &self.included_indices)
    }

    pub fn source_options(&self) -> SourceOptions {
        SourceOptions {
            lines_to_skip: self.lines_to_skip,
            delimiter: self.delimiter as u8,
        }
    }
}
