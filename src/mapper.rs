// 🗺️ Field Mapper - binds RawLine tokens to AccountRecord fields
//
// The column → field table is built and validated once, before the step
// reads anything. A bad table fails the launch instead of every line.

use crate::error::{ImportError, Result};
use crate::record::{AccountField, AccountRecord, RawLine};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;

/// Date layouts tried in order; first match wins
pub const DEFAULT_DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%m/%d/%Y", "%d-%b-%Y", "%d %b %Y"];

// ============================================================================
// FIELD MAPPING
// ============================================================================

/// Validated `{column index -> field}` table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    columns: Vec<(usize, AccountField)>,
}

impl FieldMapping {
    /// Build from parallel lists of field names and column indices.
    ///
    /// Every account field must be bound exactly once and no column may be
    /// used twice.
    pub fn new<S: AsRef<str>>(field_names: &[S], included_indices: &[usize]) -> Result<Self> {
        if field_names.len() != included_indices.len() {
            return Err(ImportError::InvalidMapping(format!(
                "{} field names but {} column indices",
                field_names.len(),
                included_indices.len()
            )));
        }

        let mut seen_fields = HashSet::new();
        let mut seen_columns = HashSet::new();
        let mut columns = Vec::with_capacity(field_names.len());

        for (name, &index) in field_names.iter().zip(included_indices) {
            let name = name.as_ref();
            let field = AccountField::from_name(name)
                .ok_or_else(|| ImportError::InvalidMapping(format!("unknown field '{}'", name)))?;

            if !seen_fields.insert(field) {
                return Err(ImportError::InvalidMapping(format!(
                    "field '{}' mapped more than once",
                    field
                )));
            }
            if !seen_columns.insert(index) {
                return Err(ImportError::InvalidMapping(format!(
                    "column {} mapped more than once",
                    index
                )));
            }

            columns.push((index, field));
        }

        if let Some(missing) = AccountField::ALL.iter().find(|f| !seen_fields.contains(*f)) {
            return Err(ImportError::InvalidMapping(format!(
                "field '{}' is not mapped",
                missing
            )));
        }

        Ok(FieldMapping { columns })
    }

    /// Columns 0..5 in schema order
    pub fn positional() -> Self {
        FieldMapping {
            columns: AccountField::ALL.iter().copied().enumerate().collect(),
        }
    }

    /// Minimum token count a line needs
    pub fn required_tokens(&self) -> usize {
        self.columns.iter().map(|(i, _)| i + 1).max().unwrap_or(0)
    }

    fn column_of(&self, field: AccountField) -> usize {
        self.columns
            .iter()
            .find(|(_, f)| *f == field)
            .map(|(i, _)| *i)
            // FieldMapping::new guarantees every field is present
            .unwrap_or(usize::MAX)
    }
}

impl Default for FieldMapping {
    fn default() -> Self {
        Self::positional()
    }
}

// ============================================================================
// FIELD MAPPER
// ============================================================================

#[derive(Debug, Clone)]
pub struct FieldMapper {
    mapping: FieldMapping,
    date_formats: Vec<String>,
}

impl FieldMapper {
    pub fn new(mapping: FieldMapping) -> Self {
        FieldMapper {
            mapping,
            date_formats: DEFAULT_DATE_FORMATS.iter().map(|f| f.to_string()).collect(),
        }
    }

    /// Replace the accepted date layouts (chrono strftime syntax)
    pub fn with_date_formats<S: Into<String>>(mut self, formats: impl IntoIterator<Item = S>) -> Self {
        self.date_formats = formats.into_iter().map(Into::into).collect();
        self
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    /// Map one line to a typed record
    pub fn map(&self, line: &RawLine) -> Result<AccountRecord> {
        let expected = self.mapping.required_tokens();
        if line.len() < expected {
            return Err(ImportError::MalformedRecord {
                line_number: line.line_number,
                expected_fields: expected,
                actual_fields: line.len(),
            });
        }

        let token = |field: AccountField| line.get(self.mapping.column_of(field)).unwrap_or("").trim();

        Ok(AccountRecord {
            date: self.parse_date(token(AccountField::Date), line.line_number)?,
            description: token(AccountField::Description).to_string(),
            deposits: parse_decimal(token(AccountField::Deposits), AccountField::Deposits, line.line_number)?,
            withdrawals: parse_decimal(
                token(AccountField::Withdrawals),
                AccountField::Withdrawals,
                line.line_number,
            )?,
            balance: parse_decimal(token(AccountField::Balance), AccountField::Balance, line.line_number)?,
        })
    }

    fn parse_date(&self, raw: &str, line_number: u64) -> Result<NaiveDate> {
        self.date_formats
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
            .ok_or_else(|| coercion_error(AccountField::Date, raw, line_number))
    }
}

impl Default for FieldMapper {
    fn default() -> Self {
        Self::new(FieldMapping::default())
    }
}

/// Empty means zero. One leading sign, then `$`, and thousands separators
/// are accepted; a second sign is not.
fn parse_decimal(raw: &str, field: AccountField, line_number: u64) -> Result<Decimal> {
    if raw.is_empty() {
        return Ok(Decimal::ZERO);
    }

    let (negative, unsigned) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw.strip_prefix('+').unwrap_or(raw)),
    };
    let cleaned: String = unsigned
        .strip_prefix('$')
        .unwrap_or(unsigned)
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.starts_with(['-', '+']) {
        return Err(coercion_error(field, raw, line_number));
    }

    let value = Decimal::from_str(&cleaned).map_err(|_| coercion_error(field, raw, line_number))?;
    Ok(if negative { -value } else { value })
}

fn coercion_error(field: AccountField, raw: &str, line_number: u64) -> ImportError {
    ImportError::FieldCoercionError {
        line_number,
        field_name: field.name().to_string(),
        raw_value: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(tokens: &[&str], line_number: u64) -> RawLine {
        RawLine::new(tokens.iter().map(|t| t.to_string()).collect(), line_number)
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_mapping_from_header_names() {
        let mapping = FieldMapping::new(
            &["Date", "Description", "Deposits", "Withdrawls", "Balance"],
            &[0, 1, 2, 3, 4],
        )
        .unwrap();

        assert_eq!(mapping, FieldMapping::positional());
        assert_eq!(mapping.required_tokens(), 5);
    }

    #[test]
    fn test_mapping_rejects_length_mismatch() {
        let err = FieldMapping::new(&["date", "description"], &[0]).unwrap_err();
        assert!(matches!(err, ImportError::InvalidMapping(_)));
    }

    #[test]
    fn test_mapping_rejects_unknown_and_duplicate_fields() {
        let unknown = FieldMapping::new(
            &["date", "description", "deposits", "withdrawals", "amount"],
            &[0, 1, 2, 3, 4],
        );
        assert!(matches!(unknown, Err(ImportError::InvalidMapping(_))));

        let duplicate = FieldMapping::new(
            &["date", "date", "deposits", "withdrawals", "balance"],
            &[0, 1, 2, 3, 4],
        );
        assert!(matches!(duplicate, Err(ImportError::InvalidMapping(_))));

        let reused_column = FieldMapping::new(
            &["date", "description", "deposits", "withdrawals", "balance"],
            &[0, 1, 2, 3, 3],
        );
        assert!(matches!(reused_column, Err(ImportError::InvalidMapping(_))));
    }

    #[test]
    fn test_mapping_rejects_missing_field() {
        let err = FieldMapping::new(&["date", "description", "deposits", "withdrawals"], &[0, 1, 2, 3])
            .unwrap_err();
        assert!(err.to_string().contains("balance"));
    }

    #[test]
    fn test_map_well_formed_line() {
        let mapper = FieldMapper::default();
        let record = mapper
            .map(&line(&["2024-01-02", "Salary", "2,000.00", "", "$2,150.75"], 2))
            .unwrap();

        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(record.description, "Salary");
        assert_eq!(record.deposits, dec("2000.00"));
        assert_eq!(record.withdrawals, Decimal::ZERO);
        assert_eq!(record.balance, dec("2150.75"));
    }

    #[test]
    fn test_map_reordered_columns() {
        let mapping = FieldMapping::new(
            &["balance", "date", "description", "withdrawals", "deposits"],
            &[0, 1, 2, 3, 4],
        )
        .unwrap();
        let mapper = FieldMapper::new(mapping);

        let record = mapper.map(&line(&["10", "12/31/2024", "Fee", "2.5", "0"], 5)).unwrap();
        assert_eq!(record.balance, dec("10"));
        assert_eq!(record.withdrawals, dec("2.5"));
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
    }

    #[test]
    fn test_map_too_few_tokens_is_malformed() {
        let mapper = FieldMapper::default();
        let err = mapper.map(&line(&["2024-01-02", "Salary", "1"], 17)).unwrap_err();

        match err {
            ImportError::MalformedRecord {
                line_number,
                expected_fields,
                actual_fields,
            } => {
                assert_eq!(line_number, 17);
                assert_eq!(expected_fields, 5);
                assert_eq!(actual_fields, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_map_non_numeric_deposit_is_coercion_error() {
        let mapper = FieldMapper::default();
        let err = mapper
            .map(&line(&["2024-01-02", "Salary", "lots", "0", "10"], 9))
            .unwrap_err();

        match err {
            ImportError::FieldCoercionError {
                line_number,
                field_name,
                raw_value,
            } => {
                assert_eq!(line_number, 9);
                assert_eq!(field_name, "deposits");
                assert_eq!(raw_value, "lots");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(mapper
            .map(&line(&["2024-01-02", "Salary", "1", "0", "10"], 9))
            .is_ok());
    }

    #[test]
    fn test_map_bad_date_is_coercion_error() {
        let mapper = FieldMapper::default();
        let err = mapper
            .map(&line(&["2024-13-45", "Salary", "1", "0", "10"], 4))
            .unwrap_err();
        assert!(matches!(err, ImportError::FieldCoercionError { ref field_name, .. } if field_name == "date"));
    }

    #[test]
    fn test_custom_date_formats() {
        let mapper = FieldMapper::default().with_date_formats(["%d.%m.%Y"]);
        let record = mapper.map(&line(&["31.12.2024", "x", "0", "0", "0"], 2)).unwrap();
        assert_eq!(record.date, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());

        assert!(mapper.map(&line(&["2024-12-31", "x", "0", "0", "0"], 3)).is_err());
    }

    #[test]
    fn test_negative_amounts() {
        let mapper = FieldMapper::default();
        let record = mapper.map(&line(&["2024-01-02", "Overdraft", "0", "0", "-$1,250.10"], 2)).unwrap();
        assert_eq!(record.balance, dec("-1250.10"));
    }

    #[test]
    fn test_repeated_sign_is_coercion_error() {
        let mapper = FieldMapper::default();

        assert_eq!(
            mapper.map(&line(&["2024-01-02", "Sign", "+5", "0", "0"], 4)).unwrap().deposits,
            dec("5")
        );

        for raw in ["--5", "-+5", "+-5", "-$-5", "$+5"] {
            let err = mapper
                .map(&line(&["2024-01-02", "Sign", raw, "0", "0"], 4))
                .unwrap_err();
            match err {
                ImportError::FieldCoercionError { field_name, raw_value, .. } => {
                    assert_eq!(field_name, "deposits");
                    assert_eq!(raw_value, raw);
                }
                other => panic!("{} should not coerce: {}", raw, other),
            }
        }
    }

    #[test]
    fn test_round_trip_through_delimited_text() {
        let mapper = FieldMapper::default();
        let original = line(&["2024-03-15", "Transfer, savings", "250.00", "", "1,500.5"], 8);

        let record = mapper.map(&original).unwrap();
        let text = record.to_delimited(',');
        assert_eq!(text, "2024-03-15,\"Transfer, savings\",250.00,0,1500.5");

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(text.as_bytes());
        let tokens: Vec<String> = reader
            .records()
            .next()
            .unwrap()
            .unwrap()
            .iter()
            .map(str::to_string)
            .collect();
        let reparsed = mapper.map(&RawLine::new(tokens, 8)).unwrap();

        assert_eq!(reparsed, record);
    }
}
