// 💾 Record Sink - one transaction per chunk
//
// SqliteAccountSink prepares the insert template once per chunk and runs it
// for every record inside a single transaction. Either the whole chunk
// commits or the transaction is dropped and SQLite rolls it back. A commit
// hook runs on the same transaction, so step progress stored there commits
// or rolls back together with the rows.

use crate::db::{DataSource, ACCOUNT_INSERT_SQL};
use crate::error::{ImportError, Result};
use crate::record::{AccountField, AccountRecord};
use rusqlite::{named_params, Connection};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub written: usize,
}

/// Runs on a chunk's open transaction right before it commits
pub type CommitHook<'a> = dyn FnMut(&Connection) -> Result<()> + 'a;

pub trait RecordSink {
    /// Persist the whole chunk atomically, or nothing of it
    fn write(&mut self, chunk: &[AccountRecord]) -> Result<WriteResult>;

    /// Like `write`. A sink backed by `data_source()` runs `before_commit`
    /// inside the chunk's transaction; a hook error rolls the chunk back.
    fn write_with(
        &mut self,
        chunk: &[AccountRecord],
        before_commit: &mut CommitHook<'_>,
    ) -> Result<WriteResult> {
        let _ = before_commit;
        self.write(chunk)
    }

    /// Database the chunk transactions run on, if any
    fn data_source(&self) -> Option<&DataSource> {
        None
    }
}

// ============================================================================
// SQLITE SINK
// ============================================================================

pub struct SqliteAccountSink {
    data_source: DataSource,
    template: String,
}

impl SqliteAccountSink {
    /// Sink using the stock `account` insert
    pub fn new(data_source: DataSource) -> Result<Self> {
        Self::with_template(data_source, ACCOUNT_INSERT_SQL)
    }

    /// The template must bind every account field by name
    /// (`:date`, `:description`, `:deposits`, `:withdrawals`, `:balance`)
    /// and nothing else. It is prepared once here to catch mistakes early.
    pub fn with_template(data_source: DataSource, template: &str) -> Result<Self> {
        data_source.with_connection(|conn| check_template(conn, template))??;

        Ok(SqliteAccountSink {
            data_source,
            template: template.to_string(),
        })
    }
}

fn check_template(conn: &rusqlite::Connection, template: &str) -> Result<()> {
    let stmt = conn
        .prepare(template)
        .map_err(|e| ImportError::InvalidTemplate(e.to_string()))?;

    if stmt.parameter_count() != AccountField::ALL.len() {
        return Err(ImportError::InvalidTemplate(format!(
            "expected {} parameters, found {}",
            AccountField::ALL.len(),
            stmt.parameter_count()
        )));
    }

    for field in AccountField::ALL {
        let name = format!(":{}", field.name());
        let bound = stmt
            .parameter_index(&name)
            .map_err(|e| ImportError::InvalidTemplate(e.to_string()))?;
        if bound.is_none() {
            return Err(ImportError::InvalidTemplate(format!(
                "parameter {} is not bound",
                name
            )));
        }
    }

    Ok(())
}

impl RecordSink for SqliteAccountSink {
    fn write(&mut self, chunk: &[AccountRecord]) -> Result<WriteResult> {
        self.write_with(chunk, &mut |_| Ok(()))
    }

    fn write_with(
        &mut self,
        chunk: &[AccountRecord],
        before_commit: &mut CommitHook<'_>,
    ) -> Result<WriteResult> {
        let started = Instant::now();
        let chunk_size = chunk.len();
        let template = self.template.as_str();

        let outcome = self.data_source.with_connection(|conn| -> std::result::Result<usize, String> {
            let tx = conn.transaction().map_err(|e| e.to_string())?;
            {
                let mut stmt = tx.prepare_cached(template).map_err(|e| e.to_string())?;
                for record in chunk {
                    stmt.execute(named_params! {
                        ":date": record.date.format("%Y-%m-%d").to_string(),
                        ":description": record.description,
                        ":deposits": record.deposits.to_string(),
                        ":withdrawals": record.withdrawals.to_string(),
                        ":balance": record.balance.to_string(),
                    })
                    .map_err(|e| e.to_string())?;
                }
            }
            before_commit(&*tx).map_err(|e| e.to_string())?;
            tx.commit().map_err(|e| e.to_string())?;
            Ok(chunk_size)
        });

        let outcome = outcome.map_err(|e| e.to_string()).and_then(|inner| inner);

        match outcome {
            Ok(written) => {
                debug!(written, elapsed_ms = started.elapsed().as_millis() as u64, "Chunk committed");
                Ok(WriteResult { written })
            }
            Err(cause) => Err(ImportError::SinkWriteError { cause, chunk_size }),
        }
    }

    fn data_source(&self) -> Option<&DataSource> {
        Some(&self.data_source)
    }
}
