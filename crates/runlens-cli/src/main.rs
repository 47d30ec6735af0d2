use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use runlens_classify::{classify_all_runs, classify_run, CleanPassClassifier};
use runlens_ingest::ingest_reports;
use runlens_server::{serve, ServerConfig};
use runlens_storage::RunStore;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "runlens")]
#[command(about = "Orchestrator run analysis dashboard", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dashboard API server (auto-ingests pending reports first)
    Serve {
        #[arg(long, default_value_t = false)]
        dev: bool,
        #[arg(long, default_value = "127.0.0.1:8000")]
        addr: String,
        #[arg(long, default_value = "runlens.db")]
        db: PathBuf,
        #[arg(long, default_value = "reports")]
        reports_dir: PathBuf,
    },
    /// Ingest new report files from the reports directory
    Ingest {
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value = "runlens.db")]
        db: PathBuf,
        #[arg(long, default_value = "reports")]
        reports_dir: PathBuf,
    },
    /// Classify steps; without a run id, every stored run is processed
    Classify {
        run_id: Option<String>,
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value = "runlens.db")]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let dev = matches!(&cli.command, Commands::Serve { dev: true, .. });
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if dev { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve {
            dev,
            addr,
            db,
            reports_dir,
        } => {
            info!(event = "serve_start", addr = %addr, db = %db.display());
            serve(ServerConfig {
                addr,
                db_path: db,
                reports_dir,
                dev,
            })
            .await
            .context("server exited with an error")?;
        }
        Commands::Ingest {
            force,
            db,
            reports_dir,
        } => {
            let mut store = RunStore::open(&db)
                .with_context(|| format!("failed to open store at {}", db.display()))?;
            let outcome = ingest_reports(&mut store, &reports_dir, force);
            println!(
                "Done: {} ingested, {} skipped, {} errors",
                outcome.ingested, outcome.skipped, outcome.errors
            );
        }
        Commands::Classify { run_id, force, db } => {
            let mut store = RunStore::open(&db)
                .with_context(|| format!("failed to open store at {}", db.display()))?;
            let classifier = CleanPassClassifier;
            match run_id {
                Some(run_id) => {
                    let outcome = classify_run(&mut store, &classifier, &run_id, force)
                        .with_context(|| format!("failed to classify run {run_id}"))?;
                    println!(
                        "Done: {} classified, {} skipped, {} errors",
                        outcome.classified, outcome.skipped, outcome.errors
                    );
                }
                None => {
                    let totals = classify_all_runs(&mut store, &classifier)
                        .context("failed to classify runs")?;
                    println!(
                        "Runs processed: {}/{}",
                        totals.runs_classified, totals.total_runs
                    );
                    println!("Steps classified: {}", totals.total_steps_classified);
                    println!("Errors: {}", totals.total_errors);
                }
            }
        }
    }

    Ok(())
}
