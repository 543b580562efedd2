use account_import::{
    get_all_accounts, init_logging, AccountImporter, BatchStatus, DataSource, FileSource,
    ImportConfig, JobExecution, LogConfig, RunId,
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "account-import", version, about = "Chunked import of bank statement files into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Import a statement file as a new run
    Import {
        #[command(flatten)]
        job: JobArgs,

        /// Run id (defaults to the next number in sequence)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Restart a FAILED run from its last committed chunk
    Restart {
        #[command(flatten)]
        job: JobArgs,

        #[arg(long)]
        run_id: String,

        /// Mark the run FAILED first if it is still recorded as running.
        /// Only use this when the process that ran it is gone.
        #[arg(long)]
        abandon: bool,
    },

    /// Print the number of imported account rows
    Count {
        #[arg(short, long, env = "ACCOUNT_IMPORT_DATABASE")]
        database: PathBuf,

        /// Also print every row
        #[arg(long)]
        list: bool,
    },
}

#[derive(Args, Debug)]
struct JobArgs {
    /// Delimited statement file (header line + date,description,deposits,withdrawals,balance)
    #[arg(short, long)]
    input: PathBuf,

    /// SQLite database holding the account table and run history
    #[arg(short, long, env = "ACCOUNT_IMPORT_DATABASE")]
    database: PathBuf,

    /// JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    lines_to_skip: Option<u64>,

    /// Fail once more than this many lines were skipped
    #[arg(long)]
    skip_limit: Option<u64>,

    /// Print the final run as JSON instead of the summary
    #[arg(long)]
    json: bool,
}

impl JobArgs {
    /// Defaults → config file → environment → flags
    fn load_config(&self) -> Result<ImportConfig> {
        let mut config = match &self.config {
            Some(path) => ImportConfig::from_file(path)?,
            None => ImportConfig::default(),
        };
        config.apply_env()?;

        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(lines_to_skip) = self.lines_to_skip {
            config.lines_to_skip = lines_to_skip;
        }
        if let Some(skip_limit) = self.skip_limit {
            config.skip_limit = Some(skip_limit);
        }

        Ok(config)
    }

    fn importer(&self) -> Result<(AccountImporter, FileSource)> {
        let config = self.load_config()?;
        let source = FileSource::new(&self.input, config.source_options());
        let data_source = open_database(&self.database)?;

        Ok((AccountImporter::new(config, data_source)?, source))
    }
}

fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::from_env_or_default(|e| {
        eprintln!("⚠️  Ignoring logging environment: {:#}", e);
    });
    if let Err(e) = init_logging(&log_config) {
        eprintln!("⚠️  Logging disabled: {}", e);
    }

    match run(cli) {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("❌ {:#}", e);
            process::exit(2);
        }
    }
}

/// Ok(false) when the job ran but did not complete
fn run(cli: Cli) -> Result<bool> {
    match cli.command {
        Commands::Import { job, run_id } => {
            let (importer, source) = job.importer()?;
            if !job.json {
                println!("🗄️  Account Import - CSV → SQLite");
                println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                println!("\n📂 Input: {}", job.input.display());
                println!(
                    "🔧 Chunk size: {}, lines to skip: {}",
                    importer.config().chunk_size,
                    importer.config().lines_to_skip
                );
            }

            let execution = importer.import(source, run_id.map(RunId::from))?;
            finish(&job, &execution, &importer)
        }

        Commands::Restart { job, run_id, abandon } => {
            let (importer, source) = job.importer()?;
            if !job.json {
                println!("🔁 Account Import - restart run {}", run_id);
                println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            }

            let run_id = RunId::from(run_id);
            if abandon {
                let abandoned = importer.abandon(&run_id)?;
                info!(run_id = %abandoned.run_id, status = %abandoned.status, "Abandoned before restart");
            }

            let execution = importer.restart(source, run_id)?;
            finish(&job, &execution, &importer)
        }

        Commands::Count { database, list } => {
            let data_source = open_database(&database)?;
            let accounts = data_source
                .with_connection(|conn| -> Result<_> {
                    account_import::setup_database(conn)?;
                    get_all_accounts(conn)
                })??;

            println!("✓ Database contains {} account rows", accounts.len());
            if list {
                for account in &accounts {
                    println!("  {}", account);
                }
            }
            Ok(true)
        }
    }
}

fn open_database(path: &Path) -> Result<DataSource> {
    DataSource::open(path).with_context(|| format!("Cannot open database {}", path.display()))
}

fn finish(job: &JobArgs, execution: &JobExecution, importer: &AccountImporter) -> Result<bool> {
    if job.json {
        let json = serde_json::to_string_pretty(execution).context("Cannot serialize run")?;
        println!("{}", json);
        return Ok(execution.status == BatchStatus::Completed);
    }
    Ok(report(execution, importer.account_count()?))
}

fn report(execution: &JobExecution, total_rows: i64) -> bool {
    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Run {} (attempt {})", execution.run_id, execution.attempt);

    for step in &execution.steps {
        println!("  {}", step.summary());
    }

    println!("✓ Database contains {} account rows", total_rows);

    if execution.status == BatchStatus::Completed {
        println!("🎉 {} COMPLETED", execution.job_name);
        true
    } else {
        println!("❌ {} {}", execution.job_name, execution.status);
        if let Some(message) = &execution.exit_message {
            println!("   {}", message);
        }
        println!("   Restart with: account-import restart --run-id {} ...", execution.run_id);
        false
    }
}
