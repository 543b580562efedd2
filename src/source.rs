// 📂 Record Source - lazy reader of delimited lines
//
// Wraps a csv::Reader without header handling: leading lines are discarded
// by count, every other line surfaces as a RawLine.

use crate::error::{ImportError, Result};
use crate::record::RawLine;
use csv::{ByteRecord, ReaderBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

// ============================================================================
// OPTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceOptions {
    /// Lines discarded before the first record (header rows)
    pub lines_to_skip: u64,
    pub delimiter: u8,
}

impl Default for SourceOptions {
    fn default() -> Self {
        SourceOptions {
            lines_to_skip: 1,
            delimiter: b',',
        }
    }
}

// ============================================================================
// RECORD SOURCE TRAIT
// ============================================================================

/// Produces raw lines one at a time until end of input
pub trait RecordSource {
    /// Next line, or `None` at end of input
    fn next_line(&mut self) -> Result<Option<RawLine>>;

    /// Discard up to `count` data lines; returns how many were discarded.
    /// Used to resume after the last committed chunk. Lines that fail
    /// with a skippable error still count as discarded.
    fn skip_records(&mut self, count: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < count {
            match self.next_line() {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) if e.is_skippable() => {}
                Err(e) => return Err(e),
            }
            skipped += 1;
        }
        Ok(skipped)
    }
}

// ============================================================================
// DELIMITED SOURCE
// ============================================================================

pub struct DelimitedSource<R: Read> {
    reader: csv::Reader<R>,
    record: ByteRecord,
    options: SourceOptions,
    header_skipped: bool,
}

impl DelimitedSource<File> {
    /// Open a delimited file. Fails with `SourceUnavailable` if it cannot be opened.
    pub fn open(path: &Path, options: SourceOptions) -> Result<Self> {
        let file = File::open(path).map_err(|e| ImportError::SourceUnavailable {
            path: path.to_path_buf(),
            cause: e.to_string(),
        })?;

        debug!(path = %path.display(), lines_to_skip = options.lines_to_skip, "Opened source file");
        Ok(Self::from_reader(file, options))
    }
}

impl<R: Read> DelimitedSource<R> {
    pub fn from_reader(reader: R, options: SourceOptions) -> Self {
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(options.delimiter)
            .from_reader(reader);

        DelimitedSource {
            reader,
            record: ByteRecord::new(),
            options,
            header_skipped: false,
        }
    }

    /// Advance to the next record; false at end of input
    fn read_record(&mut self) -> Result<bool> {
        self.reader.read_byte_record(&mut self.record).map_err(|e| {
            ImportError::SourceRead {
                line_number: self.reader.position().line(),
                cause: e.to_string(),
            }
        })
    }

    /// Decode the current record. A field that is not valid UTF-8 fails
    /// the line with `InvalidEncoding`; the reader is already past it.
    fn decode(&self) -> Result<RawLine> {
        let line_number = self
            .record
            .position()
            .map(|p| p.line())
            .unwrap_or_else(|| self.reader.position().line());

        let tokens = self
            .record
            .iter()
            .enumerate()
            .map(|(field_index, field)| {
                std::str::from_utf8(field)
                    .map(str::to_string)
                    .map_err(|_| ImportError::InvalidEncoding {
                        line_number,
                        field_index,
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(RawLine::new(tokens, line_number))
    }
}

impl<R: Read> RecordSource for DelimitedSource<R> {
    fn next_line(&mut self) -> Result<Option<RawLine>> {
        if !self.header_skipped {
            self.header_skipped = true;
            for _ in 0..self.options.lines_to_skip {
                if !self.read_record()? {
                    return Ok(None);
                }
            }
        }

        if !self.read_record()? {
            return Ok(None);
        }
        self.decode().map(Some)
    }
}

// ============================================================================
// SOURCE PROVIDERS
// ============================================================================

/// Opens a fresh source each time a step executes
pub trait SourceProvider {
    fn open(&self) -> Result<Box<dyn RecordSource>>;

    /// Identifies the input in job parameters and logs
    fn describe(&self) -> String;
}

/// Delimited file on disk
#[derive(Debug, Clone)]
pub struct FileSource {
    pub path: PathBuf,
    pub options: SourceOptions,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, options: SourceOptions) -> Self {
        FileSource {
            path: path.into(),
            options,
        }
    }
}

impl SourceProvider for FileSource {
    fn open(&self) -> Result<Box<dyn RecordSource>> {
        Ok(Box::new(DelimitedSource::open(&self.path, self.options.clone())?))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Delimited bytes held in memory (piped input, fixtures)
#[derive(Debug, Clone)]
pub struct InlineSource {
    pub data: Vec<u8>,
    pub options: SourceOptions,
}

impl InlineSource {
    pub fn new(data: impl Into<Vec<u8>>, options: SourceOptions) -> Self {
        InlineSource {
            data: data.into(),
            options,
        }
    }
}

impl SourceProvider for InlineSource {
    fn open(&self) -> Result<Box<dyn RecordSource>> {
        let reader = Cursor::new(self.data.clone());
        Ok(Box::new(DelimitedSource::from_reader(reader, self.options.clone())))
    }

    fn describe(&self) -> String {
        format!("inline:{}b", self.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATEMENT: &str = "\
Date,Description,Deposits,Withdrawls,Balance
2024-01-02,Opening deposit,1000.00,,1000.00
2024-01-03,\"Coffee, large\",,4.50,995.50
2024-01-04,Rent,,800.00,195.50
";

    fn source(options: SourceOptions) -> DelimitedSource<&'static [u8]> {
        DelimitedSource::from_reader(STATEMENT.as_bytes(), options)
    }

    #[test]
    fn test_skips_header_line() {
        let mut src = source(SourceOptions::default());

        let first = src.next_line().unwrap().unwrap();
        assert_eq!(first.tokens[0], "2024-01-02");
        assert_eq!(first.line_number, 2);

        let second = src.next_line().unwrap().unwrap();
        assert_eq!(second.tokens[1], "Coffee, large");
        assert_eq!(second.line_number, 3);
    }

    #[test]
    fn test_end_of_input() {
        let mut src = source(SourceOptions::default());
        let mut count = 0;
        while let Some(_) = src.next_line().unwrap() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(src.next_line().unwrap().is_none());
    }

    #[test]
    fn test_zero_lines_to_skip_surfaces_header() {
        let mut src = source(SourceOptions {
            lines_to_skip: 0,
            ..SourceOptions::default()
        });

        let header = src.next_line().unwrap().unwrap();
        assert_eq!(header.tokens[0], "Date");
        assert_eq!(header.line_number, 1);
    }

    #[test]
    fn test_skip_more_lines_than_file_has() {
        let mut src = source(SourceOptions {
            lines_to_skip: 10,
            ..SourceOptions::default()
        });
        assert!(src.next_line().unwrap().is_none());
    }

    #[test]
    fn test_skip_records_resumes_after_offset() {
        let mut src = source(SourceOptions::default());

        assert_eq!(src.skip_records(2).unwrap(), 2);
        let next = src.next_line().unwrap().unwrap();
        assert_eq!(next.tokens[1], "Rent");
        assert_eq!(next.line_number, 4);

        assert_eq!(src.skip_records(5).unwrap(), 0);
    }

    #[test]
    fn test_short_lines_are_surfaced_not_rejected() {
        let data = "h\n2024-01-02,only two\n";
        let mut src = DelimitedSource::from_reader(data.as_bytes(), SourceOptions::default());

        let line = src.next_line().unwrap().unwrap();
        assert_eq!(line.len(), 2);
    }

    #[test]
    fn test_invalid_utf8_fails_only_its_line() {
        let data: &[u8] = b"h\n2024-01-02,Caf\xFF\xFE,1,0,1\n2024-01-03,Tea,2,0,3\n";
        let mut src = DelimitedSource::from_reader(data, SourceOptions::default());

        match src.next_line() {
            Err(ImportError::InvalidEncoding {
                line_number,
                field_index,
            }) => {
                assert_eq!(line_number, 2);
                assert_eq!(field_index, 1);
            }
            other => panic!("expected InvalidEncoding, got {:?}", other),
        }

        let next = src.next_line().unwrap().unwrap();
        assert_eq!(next.tokens[1], "Tea");
        assert_eq!(next.line_number, 3);
        assert!(src.next_line().unwrap().is_none());
    }

    #[test]
    fn test_skip_records_counts_undecodable_lines() {
        let data: &[u8] = b"h\n2024-01-02,\xFF,1,0,1\n2024-01-03,Tea,2,0,3\n2024-01-04,Jam,3,0,6\n";
        let mut src = DelimitedSource::from_reader(data, SourceOptions::default());

        assert_eq!(src.skip_records(2).unwrap(), 2);
        assert_eq!(src.next_line().unwrap().unwrap().tokens[1], "Jam");
    }

    #[test]
    fn test_undecodable_header_is_still_discarded() {
        let data: &[u8] = b"D\xE4tum,Beschreibung\n2024-01-03,Tea,2,0,3\n";
        let mut src = DelimitedSource::from_reader(data, SourceOptions::default());

        assert_eq!(src.next_line().unwrap().unwrap().line_number, 2);
    }

    #[test]
    fn test_custom_delimiter() {
        let data = "h\n2024-01-02;Salary;2000;0;2000\n";
        let mut src = DelimitedSource::from_reader(
            data.as_bytes(),
            SourceOptions {
                lines_to_skip: 1,
                delimiter: b';',
            },
        );

        let line = src.next_line().unwrap().unwrap();
        assert_eq!(line.len(), 5);
        assert_eq!(line.tokens[1], "Salary");
    }

    #[test]
    fn test_providers_open_fresh_sources() {
        let provider = InlineSource::new(STATEMENT, SourceOptions::default());

        let mut first = provider.open().unwrap();
        first.next_line().unwrap();
        let mut second = provider.open().unwrap();
        assert_eq!(second.next_line().unwrap().unwrap().line_number, 2);

        let missing = FileSource::new("/definitely/not/here.csv", SourceOptions::default());
        assert!(matches!(missing.open(), Err(ImportError::SourceUnavailable { .. })));
        assert_eq!(missing.describe(), "/definitely/not/here.csv");
    }

    #[test]
    fn test_open_missing_file_is_source_unavailable() {
        let result = DelimitedSource::open(
            Path::new("/definitely/not/here.csv"),
            SourceOptions::default(),
        );

        match result {
            Err(ImportError::SourceUnavailable { path, .. }) => {
                assert!(path.ends_with("here.csv"));
            }
            other => panic!("expected SourceUnavailable, got {:?}", other.err()),
        }
    }
}
