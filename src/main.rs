use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tollgantry::application::orchestrator::{Collaborators, TollWorkflow};
use tollgantry::application::plate_pattern::PlatePatternProvider;
use tollgantry::application::poller::ActivityPoller;
use tollgantry::config::Config;
use tollgantry::domain::ledger::Charge;
use tollgantry::domain::ports::{
    LedgerStore, LedgerStoreHandle, WorkflowStore, WorkflowStoreHandle,
};
use tollgantry::domain::workflow::{ResumeInput, TaskToken};
use tollgantry::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryWorkflowStore};
use tollgantry::infrastructure::local::{
    FileSecretStore, LocalObjectStorage, OutboxMailer, SidecarTextDetector,
};
#[cfg(feature = "storage-rocksdb")]
use tollgantry::infrastructure::rocksdb::RocksDBStore;
use tollgantry::interfaces::csv::event_reader::EventReader;
use tollgantry::interfaces::csv::ledger_reader::LedgerReader;
use tollgantry::interfaces::csv::writer::{LedgerWriter, PollWriter, RunWriter};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Directory holding one subdirectory per image bucket.
    #[arg(long, global = true, default_value = ".")]
    data_dir: PathBuf,

    /// JSON file with the secret property bags [default: <data-dir>/secrets.json]
    #[arg(long, global = true)]
    secrets: Option<PathBuf>,

    /// Directory outgoing emails are written to [default: <data-dir>/outbox]
    #[arg(long, global = true)]
    outbox: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Upsert ledger records from a CSV file
    Seed { input: PathBuf },
    /// Bill every image listed in an events CSV file, then notify
    Process {
        input: PathBuf,
        /// Ledger CSV to upsert before processing
        #[arg(long)]
        ledger: Option<PathBuf>,
    },
    /// Hand pending human tasks to the notification handlers
    Poll {
        /// Run a single poll cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Resume a suspended run with its task token
    Resume {
        token: String,
        /// Number plate read by the reviewer
        #[arg(long, required_unless_present = "topped_up", conflicts_with = "topped_up")]
        plate: Option<String>,
        /// Charge to bill instead of the proposed one
        #[arg(long, requires = "plate")]
        charge: Option<u64>,
        /// The owner has topped up their credit
        #[arg(long)]
        topped_up: bool,
    },
    /// Print all workflow runs
    Runs,
    /// Print ledger balances
    Ledger,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tollgantry=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().into_diagnostic()?;
    let (ledger, runs) = open_stores(cli.db_path.as_deref(), &config)?;

    let collaborators = Collaborators {
        storage: Arc::new(LocalObjectStorage::new(&cli.data_dir)),
        detector: Arc::new(SidecarTextDetector::new(&cli.data_dir)),
        ledger,
        runs,
        mailer: Arc::new(OutboxMailer::new(
            cli.outbox.clone().unwrap_or_else(|| cli.data_dir.join("outbox")),
        )),
    };
    let secrets = cli
        .secrets
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("secrets.json"));

    match cli.command {
        Command::Seed { input } => {
            let seeded = seed(&collaborators.ledger, &input).await?;
            info!(records = seeded, "Ledger seeded");
        }
        Command::Process { input, ledger } => {
            if let Some(path) = ledger {
                seed(&collaborators.ledger, &path).await?;
            }
            let workflow = build_workflow(&collaborators, &config, &secrets).await?;
            let mut finished = workflow.recover().await.into_diagnostic()?;

            let file = File::open(input).into_diagnostic()?;
            for request in EventReader::new(file, config.default_charge).requests() {
                match request {
                    Ok(request) => match workflow.start(request).await {
                        Ok(run) => finished.push(run),
                        Err(e) => error!(error = %e, "Error processing event"),
                    },
                    Err(e) => error!(error = %e, "Error reading event"),
                }
            }

            let report = ActivityPoller::from_config(&collaborators, &config)
                .poll_cycle()
                .await;
            for e in report.errors() {
                warn!(error = %e, "Notification pending retry");
            }

            let stdout = io::stdout();
            RunWriter::new(stdout.lock())
                .write_runs(&finished)
                .into_diagnostic()?;
        }
        Command::Poll { once } => {
            let poller = Arc::new(ActivityPoller::from_config(&collaborators, &config));
            if once {
                let report = poller.poll_cycle().await;
                let stdout = io::stdout();
                PollWriter::new(stdout.lock())
                    .write_report(&report)
                    .into_diagnostic()?;
            } else if let Some(handle) = poller.start(config.poll_interval).await {
                tokio::signal::ctrl_c().await.into_diagnostic()?;
                info!("Shutdown requested");
                poller.stop().await;
                handle.abort();
            }
        }
        Command::Resume {
            token,
            plate,
            charge,
            topped_up,
        } => {
            let input = match (plate, topped_up) {
                (Some(plate), false) => ResumeInput::PlateReviewed {
                    plate,
                    charge: charge.map(Charge::new).transpose().into_diagnostic()?,
                },
                _ => ResumeInput::CreditToppedUp,
            };
            let workflow = build_workflow(&collaborators, &config, &secrets).await?;
            let run = workflow
                .resume(&TaskToken::from(token), input)
                .await
                .into_diagnostic()?;

            let stdout = io::stdout();
            RunWriter::new(stdout.lock())
                .write_runs([&run])
                .into_diagnostic()?;
        }
        Command::Runs => {
            let runs = collaborators.runs.list_runs().await.into_diagnostic()?;
            let stdout = io::stdout();
            RunWriter::new(stdout.lock())
                .write_runs(&runs)
                .into_diagnostic()?;
        }
        Command::Ledger => {
            let records = collaborators.ledger.all_records().await.into_diagnostic()?;
            let stdout = io::stdout();
            LedgerWriter::new(stdout.lock())
                .write_records(records)
                .into_diagnostic()?;
        }
    }

    Ok(())
}

fn open_stores(
    db_path: Option<&Path>,
    config: &Config,
) -> Result<(LedgerStoreHandle, WorkflowStoreHandle)> {
    if let Some(path) = db_path {
        #[cfg(feature = "storage-rocksdb")]
        {
            let store = RocksDBStore::open(path, &config.ledger_table).into_diagnostic()?;
            let ledger: LedgerStoreHandle = Arc::new(store.clone());
            let runs: WorkflowStoreHandle = Arc::new(store);
            return Ok((ledger, runs));
        }

        #[cfg(not(feature = "storage-rocksdb"))]
        {
            let _ = (path, config);
            eprintln!(
                "WARNING: Persistent storage requested via --db-path, but 'storage-rocksdb' feature is not enabled. Falling back to In-Memory storage."
            );
        }
    }

    let ledger: LedgerStoreHandle = Arc::new(InMemoryLedgerStore::new());
    let runs: WorkflowStoreHandle = Arc::new(InMemoryWorkflowStore::new());
    Ok((ledger, runs))
}

async fn seed(ledger: &LedgerStoreHandle, path: &Path) -> Result<usize> {
    let file = File::open(path).into_diagnostic()?;
    let mut seeded = 0;
    for record in LedgerReader::new(file).records() {
        match record {
            Ok(record) => {
                ledger.upsert(record).await.into_diagnostic()?;
                seeded += 1;
            }
            Err(e) => error!(error = %e, "Error reading ledger record"),
        }
    }
    Ok(seeded)
}

async fn build_workflow(
    collaborators: &Collaborators,
    config: &Config,
    secrets: &Path,
) -> Result<TollWorkflow> {
    let patterns = PlatePatternProvider::load(
        Arc::new(FileSecretStore::new(secrets)),
        config.secret_id.clone(),
        config.pattern_refresh_runs,
    )
    .await
    .into_diagnostic()?;
    Ok(TollWorkflow::new(collaborators, Arc::new(patterns), config))
}
