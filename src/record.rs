// 🧾 Record types - RawLine (tokens off the wire) and AccountRecord (typed row)

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// RAW LINE
// ============================================================================

/// Delimited tokens of one input line plus its 1-based line number in the file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub tokens: Vec<String>,
    pub line_number: u64,
}

impl RawLine {
    pub fn new(tokens: Vec<String>, line_number: u64) -> Self {
        RawLine {
            tokens,
            line_number,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.tokens.get(index).map(String::as_str)
    }
}

// ============================================================================
// ACCOUNT FIELDS
// ============================================================================

/// The five columns of the `account` table, in schema order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountField {
    Date,
    Description,
    Deposits,
    Withdrawals,
    Balance,
}

impl AccountField {
    pub const ALL: [AccountField; 5] = [
        AccountField::Date,
        AccountField::Description,
        AccountField::Deposits,
        AccountField::Withdrawals,
        AccountField::Balance,
    ];

    /// Column / named-parameter name
    pub fn name(&self) -> &'static str {
        match self {
            AccountField::Date => "date",
            AccountField::Description => "description",
            AccountField::Deposits => "deposits",
            AccountField::Withdrawals => "withdrawals",
            AccountField::Balance => "balance",
        }
    }

    /// Resolve a header / field name. Case-insensitive; the legacy
    /// "Withdrawls" spelling found in older exports is accepted.
    pub fn from_name(name: &str) -> Option<AccountField> {
        match name.trim().to_lowercase().as_str() {
            "date" => Some(AccountField::Date),
            "description" => Some(AccountField::Description),
            "deposits" => Some(AccountField::Deposits),
            "withdrawals" | "withdrawls" => Some(AccountField::Withdrawals),
            "balance" => Some(AccountField::Balance),
            _ => None,
        }
    }
}

impl fmt::Display for AccountField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// ACCOUNT RECORD
// ============================================================================

/// One typed row of a bank statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub date: NaiveDate,
    pub description: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub deposits: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub withdrawals: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub balance: Decimal,
}

impl AccountRecord {
    pub fn new(
        date: NaiveDate,
        description: impl Into<String>,
        deposits: Decimal,
        withdrawals: Decimal,
        balance: Decimal,
    ) -> Self {
        AccountRecord {
            date,
            description: description.into(),
            deposits,
            withdrawals,
            balance,
        }
    }

    /// Net movement of this line (deposits - withdrawals)
    pub fn net_amount(&self) -> Decimal {
        self.deposits - self.withdrawals
    }

    /// Format back to delimited text in schema order.
    /// Dates come out as ISO-8601, decimals in their parsed scale.
    pub fn to_delimited(&self, delimiter: char) -> String {
        let fields = [
            self.date.format("%Y-%m-%d").to_string(),
            self.description.clone(),
            self.deposits.to_string(),
            self.withdrawals.to_string(),
            self.balance.to_string(),
        ];

        fields
            .iter()
            .map(|f| quote_field(f, delimiter))
            .collect::<Vec<_>>()
            .join(&delimiter.to_string())
    }
}

impl fmt::Display for AccountRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_delimited(','))
    }
}

fn quote_field(value: &str, delimiter: char) -> String {
    if value.contains(delimiter) || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
