// End-to-end runs of the account job against SQLite files on disk

use account_import::{
    get_all_accounts, setup_database, AccountImporter, AccountRecord, BatchStatus, ChunkStep,
    DataSource, FieldMapper, FileSource, ImportConfig, ImportError, InMemoryJobRepository,
    JobDefinition, JobExecution, JobExecutor, JobRepository, RecordSink, RunId, SourceOptions,
    SqliteAccountSink, SqliteJobRepository, StepState, WriteResult,
};
use rusqlite::Connection;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const HEADER: &str = "Date,Description,Deposits,Withdrawls,Balance";

fn statement_rows(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            format!(
                "2024-{:02}-{:02},Payment {},{}.50,,{}.50",
                i % 12 + 1,
                i % 28 + 1,
                i,
                i,
                i
            )
        })
        .collect()
}

fn write_statement(dir: &TempDir, rows: &[String]) -> PathBuf {
    let path = dir.path().join("statement.csv");
    let mut text = String::from(HEADER);
    text.push('\n');
    for row in rows {
        text.push_str(row);
        text.push('\n');
    }
    fs::write(&path, text).unwrap();
    path
}

fn open_importer(db_path: &Path, config: ImportConfig) -> AccountImporter {
    AccountImporter::new(config, DataSource::open(db_path).unwrap()).unwrap()
}

fn config(chunk_size: usize) -> ImportConfig {
    ImportConfig {
        chunk_size,
        ..ImportConfig::default()
    }
}

fn source(path: &Path) -> FileSource {
    FileSource::new(path, SourceOptions::default())
}

/// Delegates to the SQLite sink and remembers each chunk size
struct SizeRecordingSink {
    inner: SqliteAccountSink,
    sizes: Arc<Mutex<Vec<usize>>>,
}

impl RecordSink for SizeRecordingSink {
    fn write(&mut self, chunk: &[AccountRecord]) -> account_import::Result<WriteResult> {
        self.sizes.lock().unwrap().push(chunk.len());
        self.inner.write(chunk)
    }
}

#[test]
fn test_large_file_flushes_in_bounded_chunks() {
    let dir = TempDir::new().unwrap();
    let input = write_statement(&dir, &statement_rows(25_000));
    let data_source = DataSource::open(&dir.path().join("accounts.db")).unwrap();
    data_source.with_connection(|conn| setup_database(conn)).unwrap().unwrap();

    let sizes = Arc::new(Mutex::new(Vec::new()));
    let step = ChunkStep::builder("step1")
        .source(source(&input))
        .mapper(FieldMapper::default())
        .sink(SizeRecordingSink {
            inner: SqliteAccountSink::new(data_source.clone()).unwrap(),
            sizes: sizes.clone(),
        })
        .chunk_size(10_000)
        .build()
        .unwrap();
    let mut job = JobDefinition::new("ACCOUNT-IMPORT-JOB").step(step);

    let executor = JobExecutor::new(Arc::new(InMemoryJobRepository::new()));
    let execution = executor.run(&mut job, RunId::from(1)).unwrap();

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(*sizes.lock().unwrap(), vec![10_000, 10_000, 5_000]);

    let step = &execution.steps[0];
    assert_eq!(step.read_count, 25_000);
    assert_eq!(step.write_count, 25_000);
    assert_eq!(step.commit_count, 3);
    assert!(step.is_balanced());

    let rows = data_source
        .with_connection(|conn| get_all_accounts(conn))
        .unwrap()
        .unwrap();
    assert_eq!(rows.len(), 25_000);
    assert_eq!(rows[0].description, "Payment 0");
    assert_eq!(rows[24_999].description, "Payment 24999");
}

#[test]
fn test_bad_deposit_is_skipped() {
    let dir = TempDir::new().unwrap();
    let mut rows = statement_rows(50);
    rows[17] = "2024-05-05,Mystery,abc,,10.00".to_string();
    let input = write_statement(&dir, &rows);
    let importer = open_importer(&dir.path().join("accounts.db"), config(20));

    let execution = importer.import(source(&input), None).unwrap();

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.total_read(), 50);
    assert_eq!(execution.total_skipped(), 1);
    assert_eq!(execution.total_written(), 49);
    assert_eq!(importer.account_count().unwrap(), 49);
}

#[test]
fn test_failing_chunk_rolls_back_and_restart_finishes() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("accounts.db");
    let mut rows = statement_rows(25);
    // Second chunk (lines 10..20) repeats a description from inside itself
    rows[15] = rows[12].clone();
    let input = write_statement(&dir, &rows);

    {
        let data_source = DataSource::open(&db_path).unwrap();
        data_source
            .with_connection(|conn| {
                setup_database(conn).unwrap();
                conn.execute("CREATE UNIQUE INDEX uq_description ON account(description)", [])
                    .unwrap();
            })
            .unwrap();
    }

    let failed = {
        let importer = open_importer(&db_path, config(10));
        let execution = importer.import(source(&input), Some(RunId::from(1))).unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        let step = &execution.steps[0];
        assert_eq!(step.commit_count, 1);
        assert_eq!(step.rollback_count, 1);
        assert_eq!(step.write_count, 10);
        // Chunk 3 was never read
        assert_eq!(step.read_count, 20);
        assert_eq!(importer.account_count().unwrap(), 10);
        execution
    };
    assert!(failed.exit_message.unwrap().contains("UNIQUE"));

    // Once the constraint is gone, a new process resumes after chunk 1
    {
        let data_source = DataSource::open(&db_path).unwrap();
        data_source
            .with_connection(|conn| conn.execute("DROP INDEX uq_description", []))
            .unwrap()
            .unwrap();
    }

    let importer = open_importer(&db_path, config(10));
    let execution = importer.restart(source(&input), RunId::from(1)).unwrap();

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.attempt, 2);
    assert_eq!(execution.total_written(), 25);
    assert_eq!(importer.account_count().unwrap(), 25);

    let err = importer.restart(source(&input), RunId::from(1)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ImportError>(),
        Some(ImportError::NotRestartable { .. })
    ));
}

#[test]
fn test_run_id_reuse_rejected_across_processes() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("accounts.db");
    let input = write_statement(&dir, &statement_rows(5));

    open_importer(&db_path, config(10))
        .import(source(&input), Some(RunId::from("2024-03")))
        .unwrap();

    let importer = open_importer(&db_path, config(10));
    let err = importer
        .import(source(&input), Some(RunId::from("2024-03")))
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<ImportError>(),
        Some(ImportError::DuplicateRun { .. })
    ));
    assert_eq!(importer.account_count().unwrap(), 5);
}

#[test]
fn test_restart_with_different_chunk_size_rejected() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("accounts.db");
    let missing = dir.path().join("not-there.csv");

    let execution = open_importer(&db_path, config(10))
        .import(source(&missing), None)
        .unwrap();
    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(execution.steps[0].read_count, 0);

    let err = open_importer(&db_path, config(20))
        .restart(source(&missing), execution.run_id.clone())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ImportError>(),
        Some(ImportError::ParametersChanged { .. })
    ));
}

#[test]
fn test_stored_rows_reproduce_input_fields() {
    let dir = TempDir::new().unwrap();
    let rows = vec![
        "2024-01-02,\"Coffee, large\",,4.50,995.50".to_string(),
        "01/03/2024,Salary,\"$2,000.00\",,2995.50".to_string(),
        "2024-01-04,Rent,,800,2195.50".to_string(),
    ];
    let input = write_statement(&dir, &rows);
    let importer = open_importer(&dir.path().join("accounts.db"), config(2));

    importer.import(source(&input), None).unwrap();

    let data_source = DataSource::open(&dir.path().join("accounts.db")).unwrap();
    let stored = data_source
        .with_connection(|conn| get_all_accounts(conn))
        .unwrap()
        .unwrap();

    let lines: Vec<String> = stored.iter().map(|r| r.to_delimited(',')).collect();
    assert_eq!(
        lines,
        vec![
            "2024-01-02,\"Coffee, large\",0,4.50,995.50",
            "2024-01-03,Salary,2000.00,0,2995.50",
            "2024-01-04,Rent,0,800,2195.50",
        ]
    );
}

#[test]
fn test_undecodable_line_is_skipped() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("statement.csv");
    let mut bytes = format!("{}\n2024-01-02,Rent,,800,200\n", HEADER).into_bytes();
    bytes.extend_from_slice(b"2024-01-03,Caf\xE9 Latte,,4.50,195.50\n");
    bytes.extend_from_slice(b"2024-01-04,Salary,1000,,1195.50\n");
    fs::write(&path, bytes).unwrap();

    let importer = open_importer(&dir.path().join("accounts.db"), config(10));
    let execution = importer.import(source(&path), None).unwrap();

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.total_read(), 3);
    assert_eq!(execution.total_skipped(), 1);
    assert_eq!(importer.account_count().unwrap(), 2);
}

/// SQLite repository whose process dies right after the first chunk commits
struct DyingRepository {
    inner: SqliteJobRepository,
}

impl JobRepository for DyingRepository {
    fn create_job_execution(&self, execution: &JobExecution) -> account_import::Result<()> {
        self.inner.create_job_execution(execution)
    }

    fn update_job_execution(&self, execution: &JobExecution) -> account_import::Result<()> {
        self.inner.update_job_execution(execution)
    }

    fn save_step_state(&self, job_name: &str, run_id: &RunId, state: &StepState) -> account_import::Result<()> {
        if state.commit_count == 1 && !state.status.is_terminal() {
            panic!("process killed after the first commit");
        }
        self.inner.save_step_state(job_name, run_id, state)
    }

    fn save_step_state_in(
        &self,
        store: &DataSource,
        conn: &Connection,
        job_name: &str,
        run_id: &RunId,
        state: &StepState,
    ) -> account_import::Result<bool> {
        self.inner.save_step_state_in(store, conn, job_name, run_id, state)
    }

    fn find_job_execution(&self, job_name: &str, run_id: &RunId) -> account_import::Result<Option<JobExecution>> {
        self.inner.find_job_execution(job_name, run_id)
    }

    fn last_run_number(&self, job_name: &str) -> account_import::Result<Option<u64>> {
        self.inner.last_run_number(job_name)
    }
}

#[test]
fn test_crash_after_commit_resumes_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("accounts.db");
    let input = write_statement(&dir, &statement_rows(25));

    {
        let data_source = DataSource::open(&db_path).unwrap();
        let repository = DyingRepository {
            inner: SqliteJobRepository::new(data_source.clone()).unwrap(),
        };
        let importer = AccountImporter::new(config(10), data_source)
            .unwrap()
            .with_executor(JobExecutor::new(Arc::new(repository)));

        let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
            importer.import(source(&input), Some(RunId::from(1)))
        }));
        assert!(crashed.is_err());
        assert_eq!(importer.account_count().unwrap(), 10);
    }

    // The run still looks alive until someone abandons it
    let importer = open_importer(&db_path, config(10));
    let err = importer.restart(source(&input), RunId::from(1)).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ImportError>(),
        Some(ImportError::AlreadyRunning { .. })
    ));

    let abandoned = importer.abandon(&RunId::from(1)).unwrap();
    assert_eq!(abandoned.steps[0].restart_offset, 10);

    let execution = importer.restart(source(&input), RunId::from(1)).unwrap();
    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.total_written(), 25);
    assert_eq!(importer.account_count().unwrap(), 25);

    let data_source = DataSource::open(&db_path).unwrap();
    let stored = data_source
        .with_connection(|conn| get_all_accounts(conn))
        .unwrap()
        .unwrap();
    assert_eq!(stored[10].description, "Payment 10");
}
