//! # Veritor CLI (`veritor`)
//!
//! The `veritor` binary is the primary interface for the batch
//! content-verification pipeline. It provides commands for database
//! initialization, batch submission and polling, running the worker pool,
//! the fleet health monitor, and the HTTP API.
//!
//! ## Usage
//!
//! ```bash
//! veritor --config ./config/veritor.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `veritor init` | Create the SQLite database and run schema migrations |
//! | `veritor submit <files...>` | Submit a batch of documents for analysis |
//! | `veritor status <batch-id>` | Poll a batch's progress |
//! | `veritor report <batch-id>` | Print a finalized batch's report |
//! | `veritor cancel <batch-id>` | Cancel a pending or processing batch |
//! | `veritor work` | Run the worker pool (Ctrl-C to stop) |
//! | `veritor monitor` | Run the fleet health monitor |
//! | `veritor stats` | Print a pipeline overview |
//! | `veritor serve api` | Start the JSON HTTP API |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use veritor::batches::{self, DocumentSubmission, ReportFetch};
use veritor::config;
use veritor::db;
use veritor::migrate;
use veritor::monitor::{self, ConsoleAlertSink, TracingAlertSink};
use veritor::server;
use veritor::stats;
use veritor::store::FsContentStore;
use veritor::worker;

/// Veritor CLI — a batch content-verification pipeline for AI-generated
/// text.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/veritor.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "veritor",
    about = "Veritor — a batch content-verification pipeline for AI-generated text",
    version,
    long_about = "Veritor analyzes batches of documents for factual accuracy and \
    hallucination risk: each document is dispatched to an independent worker, failures \
    are classified and retried under a central policy, and completed batches produce a \
    durable aggregate report. A fleet health monitor watches worker and cache metrics \
    independently of batch activity."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/veritor.toml`. All database, storage, analyzer,
    /// worker, monitor, and server settings are read from this file.
    #[arg(long, global = true, default_value = "./config/veritor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (batches,
    /// tasks, dispatches, results, completions, error_records, metrics).
    /// This command is idempotent — running it multiple times is safe.
    Init,

    /// Submit a batch of documents for analysis.
    ///
    /// Reads each file, stores its content, creates one task per document,
    /// and enqueues the initial dispatches. Prints the batch id; run
    /// `veritor work` to process it and `veritor status` to poll progress.
    Submit {
        /// Document files to analyze together as one batch.
        files: Vec<PathBuf>,

        /// Owner recorded on the batch.
        #[arg(long, default_value = "cli")]
        owner: String,
    },

    /// Poll a batch's progress.
    ///
    /// Prints status, per-outcome counts, and — once finalized — the
    /// aggregate summary.
    Status {
        /// Batch UUID returned by `submit`.
        batch_id: String,
    },

    /// Print a finalized batch's report as JSON.
    ///
    /// The report is available once the batch reaches `completed` or
    /// `failed`; until then this prints the current status instead.
    Report {
        /// Batch UUID returned by `submit`.
        batch_id: String,
    },

    /// Cancel a pending or processing batch.
    ///
    /// In-flight workers are not interrupted; their late completions are
    /// ignored once the batch is cancelled.
    Cancel {
        /// Batch UUID returned by `submit`.
        batch_id: String,
    },

    /// Run the document worker pool.
    ///
    /// Claims dispatches from the queue and processes them until Ctrl-C.
    /// Multiple `work` processes can share one database.
    Work {
        /// Process until the queue is idle, then exit.
        #[arg(long)]
        drain: bool,
    },

    /// Run the fleet health monitor.
    ///
    /// Evaluates worker and cache metrics against fixed thresholds on the
    /// configured interval, printing alerts and scaling recommendations.
    Monitor {
        /// Run a single evaluation cycle and exit.
        #[arg(long)]
        once: bool,
    },

    /// Print a pipeline overview.
    ///
    /// Batch counts by status, document and result totals, unresolved
    /// errors by category, and metric sample counts.
    Stats,

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

/// Server subcommands.
#[derive(Subcommand)]
enum ServeService {
    /// Start the JSON HTTP API.
    ///
    /// Binds to the address configured in `[server].bind` and serves batch
    /// submission, status, and report endpoints.
    Api,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("veritor=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            veritor::store::ensure_root(&config.storage)?;
            println!("initialized {}", config.db.path.display());
        }

        Commands::Submit { files, owner } => {
            if files.is_empty() {
                anyhow::bail!("no files given; usage: veritor submit <files...>");
            }

            let mut documents = Vec::with_capacity(files.len());
            for path in &files {
                let content = std::fs::read(path)?;
                let filename = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string());
                documents.push(DocumentSubmission { filename, content });
            }

            let pool = db::connect(&config).await?;
            let store = FsContentStore::new(&config.storage);
            let batch_id =
                batches::submit_batch(&pool, &store, &config.storage, &owner, documents).await?;

            println!("submitted batch {}", batch_id);
            println!("  documents: {}", files.len());
            println!("  poll with: veritor status {}", batch_id);
            pool.close().await;
        }

        Commands::Status { batch_id } => {
            let pool = db::connect(&config).await?;
            let view = batches::get_batch_status(&pool, &batch_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no batch with id: {}", batch_id))?;

            println!("batch {}", view.batch_id);
            println!("  status:     {}", view.status.as_str());
            println!(
                "  progress:   {} processed, {} failed of {}",
                view.processed_count, view.failed_count, view.total_documents
            );
            if view.intervene_count > 0 {
                println!(
                    "  stuck:      {} document(s) awaiting manual intervention",
                    view.intervene_count
                );
            }
            if let Some(summary) = &view.summary {
                println!("  accuracy:   {:.1} average", summary.average_accuracy);
                println!(
                    "  risk:       {} low, {} medium, {} high, {} critical",
                    summary.risk_histogram.low,
                    summary.risk_histogram.medium,
                    summary.risk_histogram.high,
                    summary.risk_histogram.critical
                );
                println!("  flags:      {}", summary.total_flags);
            }
            pool.close().await;
        }

        Commands::Report { batch_id } => {
            let pool = db::connect(&config).await?;
            let store = FsContentStore::new(&config.storage);

            match batches::get_batch_report(&pool, &store, &batch_id).await? {
                ReportFetch::Ready(report) => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                ReportFetch::NotReady { status } => {
                    println!(
                        "batch is {}; report is not available yet",
                        status.as_str()
                    );
                }
                ReportFetch::NotFound => anyhow::bail!("no batch with id: {}", batch_id),
            }
            pool.close().await;
        }

        Commands::Cancel { batch_id } => {
            let pool = db::connect(&config).await?;
            if batches::cancel_batch(&pool, &batch_id).await? {
                println!("cancelled batch {}", batch_id);
            } else {
                println!("batch {} is not cancellable (already terminal?)", batch_id);
            }
            pool.close().await;
        }

        Commands::Work { drain } => {
            let pool = db::connect(&config).await?;
            let store = Arc::new(FsContentStore::new(&config.storage));

            if drain {
                let handled = worker::drain(&config, &pool, store.as_ref()).await?;
                println!("drained queue: {} dispatch(es) handled", handled);
            } else {
                worker::run_worker_pool(&config, &pool, store).await?;
            }
            pool.close().await;
        }

        Commands::Monitor { once } => {
            let pool = db::connect(&config).await?;

            if once {
                let sink = ConsoleAlertSink;
                let report = monitor::run_cycle(&pool, &config, &sink).await?;
                if report.alerts.is_empty() {
                    println!("no alerts");
                }
                for rec in &report.recommendations {
                    println!(
                        "recommendation [{}]: {} ({}applied) — {}",
                        rec.resource_id,
                        rec.action.as_str(),
                        if rec.applied { "" } else { "not " },
                        rec.reason
                    );
                }
            } else {
                let sink = TracingAlertSink;
                monitor::run_monitor(&pool, &config, &sink).await?;
            }
            pool.close().await;
        }

        Commands::Stats => {
            stats::run_stats(&config).await?;
        }

        Commands::Serve {
            service: ServeService::Api,
        } => {
            let pool = db::connect(&config).await?;
            let store = Arc::new(FsContentStore::new(&config.storage));
            server::run_server(&config, pool, store).await?;
        }
    }

    Ok(())
}
