use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use cbl_core::Batch;
use cbl_ingest::{credit_claims, report_recent_markdown, IngestConfig, IngestRun, PolicyRegistry};
use cbl_warehouse::{
    LoadMode, MemoryWarehouse, PgWarehouse, StagingTables, UpdateExecutor, Warehouse,
};
use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "cbl")]
#[command(about = "Carrier billing ledger command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest a JSON batch file into the warehouse.
    Ingest {
        batch_file: PathBuf,
        /// Run against the in-memory collaborator instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Mark refund claims from a JSON batch file as credited.
    Credit {
        claims_file: PathBuf,
        /// Run against the in-memory collaborator instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Load a JSON batch file into a TTL-scoped staging table.
    Stage {
        batch_file: PathBuf,
        /// Staging table name under the configured namespace.
        #[arg(long)]
        name: String,
        /// One of replace, append, fail-if-exists.
        #[arg(long, default_value = "replace")]
        mode: String,
        /// Run against the in-memory collaborator instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the registered per-table dedup policies.
    Policies,
    /// Summarize recent ingestion runs.
    Report {
        #[arg(long, default_value_t = 3)]
        runs: usize,
    },
    /// Drop staging tables whose retention window has passed.
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Report { runs: 3 }) {
        Commands::Ingest {
            batch_file,
            dry_run,
        } => {
            let text = std::fs::read_to_string(&batch_file)
                .with_context(|| format!("reading {}", batch_file.display()))?;
            let batches: Vec<Batch> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", batch_file.display()))?;
            let registry = PolicyRegistry::load(&config.tables_file)?;

            let warehouse: Arc<dyn Warehouse> = if dry_run || config.dry_run {
                Arc::new(MemoryWarehouse::new())
            } else {
                Arc::new(PgWarehouse::connect(&config.database_url).await?)
            };
            let run = IngestRun::new(warehouse, registry, config.reports_dir.clone());
            let summary = run.execute(batches).await?;
            println!(
                "ingest complete: run_id={} batches={} inserted={} duplicates_removed={}",
                summary.run_id, summary.batches, summary.inserted, summary.duplicates_removed
            );
            for outcome in &summary.outcomes {
                if let Some(error) = &outcome.report.error {
                    eprintln!("{}: {error}", outcome.table);
                }
            }
        }
        Commands::Credit {
            claims_file,
            dry_run,
        } => {
            let text = std::fs::read_to_string(&claims_file)
                .with_context(|| format!("reading {}", claims_file.display()))?;
            let batch: Batch = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", claims_file.display()))?;

            let warehouse: Arc<dyn Warehouse> = if dry_run || config.dry_run {
                Arc::new(MemoryWarehouse::new())
            } else {
                Arc::new(PgWarehouse::connect(&config.database_url).await?)
            };
            let executor = UpdateExecutor::new(warehouse);
            let claims = batch.len();
            let affected = credit_claims(&executor, &batch, Utc::now()).await?;
            println!(
                "credit complete: table={} claims={claims} rows_affected={affected}",
                batch.table
            );
        }
        Commands::Stage {
            batch_file,
            name,
            mode,
            dry_run,
        } => {
            let text = std::fs::read_to_string(&batch_file)
                .with_context(|| format!("reading {}", batch_file.display()))?;
            let batch: Batch = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", batch_file.display()))?;
            let mode = match mode.as_str() {
                "replace" => LoadMode::Replace,
                "append" => LoadMode::Append,
                "fail-if-exists" => LoadMode::FailIfExists,
                other => anyhow::bail!("unknown load mode {other}"),
            };

            let warehouse: Arc<dyn Warehouse> = if dry_run || config.dry_run {
                Arc::new(MemoryWarehouse::new())
            } else {
                Arc::new(PgWarehouse::connect(&config.database_url).await?)
            };
            let staging = StagingTables::new(warehouse, config.staging_namespace.clone());
            let staged = staging.stage(&name, &batch.rows, mode, Utc::now()).await?;
            println!(
                "staged {} rows into {} until {}",
                batch.len(),
                staged.table,
                staged.expires_at
            );
        }
        Commands::Policies => {
            let registry = PolicyRegistry::load(&config.tables_file)?;
            for policy in &registry.tables {
                println!(
                    "{} [{:?}] keys={}",
                    policy.table,
                    policy.kind,
                    policy.grouping_fields.join(", ")
                );
            }
        }
        Commands::Report { runs } => {
            println!("{}", report_recent_markdown(&config.reports_dir, runs)?);
        }
        Commands::Sweep => {
            let warehouse = PgWarehouse::connect(&config.database_url).await?;
            let dropped = warehouse.drop_expired(Utc::now()).await?;
            println!("dropped {dropped} expired staging tables");
        }
    }

    Ok(())
}
