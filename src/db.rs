// 🗄️ Database - shared connection handle + account table schema
//
// One SQLite connection per job, shared by every step. Each chunk flush
// opens its own transaction on it, so two flushes never share one.

use crate::error::{ImportError, Result as ImportResult};
use crate::record::AccountRecord;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rusqlite::types::Type;
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Insert template bound by name to AccountRecord fields
pub const ACCOUNT_INSERT_SQL: &str = "INSERT INTO account (date, description, deposits, withdrawals, balance) \
     VALUES (:date, :description, :deposits, :withdrawals, :balance)";

/// Lock wait before SQLite reports SQLITE_BUSY
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// DATA SOURCE
// ============================================================================

/// Cloneable handle to the destination store
#[derive(Clone)]
pub struct DataSource {
    conn: Arc<Mutex<Connection>>,
}

impl DataSource {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        DataSource {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    /// Run `f` with exclusive access to the connection
    pub fn with_connection<T>(&self, f: impl FnOnce(&mut Connection) -> T) -> ImportResult<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| ImportError::Repository("database connection lock poisoned".to_string()))?;
        Ok(f(&mut conn))
    }

    /// True when both handles share one connection
    pub fn same_store(&self, other: &DataSource) -> bool {
        Arc::ptr_eq(&self.conn, &other.conn)
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (no-op for in-memory databases)
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // Amounts are stored as decimal text so no precision is lost
    conn.execute(
        "CREATE TABLE IF NOT EXISTS account (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            date TEXT NOT NULL,
            description TEXT NOT NULL,
            deposits TEXT NOT NULL,
            withdrawals TEXT NOT NULL,
            balance TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_account_date ON account(date)", [])?;

    Ok(())
}

pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM account", [], |row| row.get(0))?;

    Ok(count)
}

/// All imported rows in insertion order
pub fn get_all_accounts(conn: &Connection) -> Result<Vec<AccountRecord>> {
    let mut stmt = conn.prepare(
        "SELECT date, description, deposits, withdrawals, balance
         FROM account
         ORDER BY id",
    )?;

    let accounts = stmt
        .query_map([], |row| {
            let date: String = row.get(0)?;
            let deposits: String = row.get(2)?;
            let withdrawals: String = row.get(3)?;
            let balance: String = row.get(4)?;

            Ok(AccountRecord {
                date: NaiveDate::parse_from_str(&date, "%Y-%m-%d")
                    .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?,
                description: row.get(1)?,
                deposits: decimal_column(&deposits, 2)?,
                withdrawals: decimal_column(&withdrawals, 3)?,
                balance: decimal_column(&balance, 4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(accounts)
}

fn decimal_column(value: &str, index: usize) -> rusqlite::Result<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}
