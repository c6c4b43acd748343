//! Audit Ledger Administration CLI
//!
//! Operator tasks against the configured ledger store: schema migration,
//! staging and backfilling pre-ledger history, exports and queries.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

use audit_ledger::config::AppConfig;
use audit_ledger::ledger::export::verify_export_with;
use audit_ledger::logging::init_tracing;
use audit_ledger::{AuditQuery, Database, Ledger, LedgerStore, NewAuditEvent, TenantKey};

#[derive(Parser)]
#[command(name = "ledger-admin")]
#[command(about = "Administer the audit ledger")]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured database URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply migrations and check immutability enforcement
    Migrate,
    /// Stage unchained history (JSONL of events) for a later backfill
    StageLegacy {
        /// JSONL file, one event per line
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Chain staged history and seed heads of orphaned partitions
    Backfill,
    /// Export one tenant's chain as JSONL with a checksum file
    Export {
        #[arg(short, long)]
        tenant_id: Option<String>,

        /// Output directory (defaults to the configured export_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Re-verify an export file offline
    VerifyExport {
        path: PathBuf,

        /// Chain head the export must end on, recorded outside the export
        #[arg(long)]
        expected_head: Option<String>,
    },
    /// Query one tenant's events, newest first
    Query {
        #[arg(short, long)]
        tenant_id: Option<String>,

        #[arg(long)]
        action: Option<String>,

        #[arg(long)]
        actor_id: Option<String>,

        #[arg(long)]
        resource_type: Option<String>,

        #[arg(long)]
        resource_id: Option<String>,

        /// Inclusive lower bound (RFC 3339)
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Inclusive upper bound (RFC 3339)
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        #[arg(short, long)]
        limit: Option<u32>,

        #[arg(long)]
        offset: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("audit_ledger=info");
    let cli = Cli::parse();

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(2)
        }
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load_from(cli.config.as_deref())?;
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    Ok(config)
}

fn tenant(raw: Option<&str>) -> Result<TenantKey> {
    Ok(TenantKey::resolve(raw)?)
}

/// Runs the command; `Ok(false)` means it ran but found a problem.
async fn run(cli: Cli) -> Result<bool> {
    let config = load_config(&cli)?;

    match cli.command {
        Commands::Migrate => {
            Ledger::open(&config).await?;
            println!("migrations applied, immutability enforcement active");
        }
        Commands::StageLegacy { file } => {
            let ledger = Ledger::open(&config).await?;
            let staged = stage_legacy(&ledger, &file).await?;
            println!("staged {} legacy events", staged);
        }
        Commands::Backfill => {
            let ledger = Ledger::open(&config).await?;
            let summary = ledger.backfill().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Export { tenant_id, out } => {
            let partition = tenant(tenant_id.as_deref())?;
            let dir = out.unwrap_or_else(|| PathBuf::from(&config.export_dir));
            let ledger = Ledger::open(&config).await?;
            let manifest = ledger.export_partition(&partition, &dir).await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Commands::VerifyExport { path, expected_head } => {
            let verification = verify_export_with(&path, expected_head.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&verification)?);
            return Ok(verification.ok());
        }
        Commands::Query {
            tenant_id,
            action,
            actor_id,
            resource_type,
            resource_id,
            start,
            end,
            limit,
            offset,
        } => {
            let partition = tenant(tenant_id.as_deref())?;
            let query = AuditQuery {
                action,
                actor_id,
                resource_type,
                resource_id,
                start,
                end,
                limit,
                offset,
            };
            let ledger = Ledger::open(&config).await?;
            let page = ledger.query(&partition, &query).await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
    }

    Ok(true)
}

async fn stage_legacy(ledger: &Ledger<Database>, path: &Path) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;

    let mut by_partition: BTreeMap<TenantKey, Vec<NewAuditEvent>> = BTreeMap::new();
    for (line_num, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: NewAuditEvent = serde_json::from_str(&line)
            .map_err(|e| anyhow!("line {}: {}", line_num + 1, e))?;
        event
            .validate()
            .map_err(|e| anyhow!("line {}: {}", line_num + 1, e))?;
        let partition = TenantKey::resolve(event.tenant_id.as_deref())?;
        by_partition.entry(partition).or_default().push(event);
    }

    let mut staged = 0;
    for (partition, events) in &by_partition {
        ledger.store().stage_legacy(partition, events).await?;
        info!(tenant_key = %partition, events = events.len(), "legacy history staged");
        staged += events.len();
    }
    Ok(staged)
}
