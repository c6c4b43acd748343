use anyhow::Result;
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

use audit_ledger::config::AppConfig;
use audit_ledger::logging::init_tracing;
use audit_ledger::{Ledger, TenantKey, VerificationReport};

const EXIT_OK: u8 = 0;
const EXIT_DIVERGENCE: u8 = 1;
const EXIT_INFRASTRUCTURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing("audit_ledger=warn");

    let matches = Command::new("verify-audit-chain")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Verify the audit ledger's hash chains")
        .arg(
            Arg::new("tenant-id")
                .short('t')
                .long("tenant-id")
                .value_name("UUID")
                .help("Verify only this tenant's partition (all partitions when omitted)"),
        )
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .value_parser(["json", "text"])
                .default_value("json")
                .help("Report format"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .value_parser(clap::value_parser!(PathBuf))
                .help("Configuration file"),
        )
        .arg(
            Arg::new("database-url")
                .long("database-url")
                .value_name("URL")
                .help("Override the configured database URL"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .action(ArgAction::SetTrue)
                .help("Print nothing; report through the exit status only"),
        )
        .get_matches();

    let tenant_id = matches.get_one::<String>("tenant-id").cloned();
    let format = matches
        .get_one::<String>("format")
        .cloned()
        .unwrap_or_else(|| "json".to_string());
    let config_path = matches.get_one::<PathBuf>("config").cloned();
    let database_url = matches.get_one::<String>("database-url").cloned();
    let quiet = matches.get_flag("quiet");

    let outcome = run(config_path, database_url, tenant_id).await;
    match &outcome {
        Ok(report) if !quiet => {
            if let Err(e) = print_report(report, &format) {
                eprintln!("error: {:#}", e);
                return ExitCode::from(EXIT_INFRASTRUCTURE);
            }
        }
        Ok(_) => {}
        Err(e) => {
            error!("Verification could not run: {:#}", e);
            if !quiet {
                eprintln!("error: {:#}", e);
            }
        }
    }

    ExitCode::from(exit_status(&outcome))
}

/// 0 when every partition verified, 1 on any divergence, 2 when the
/// verification itself could not run.
fn exit_status(outcome: &Result<VerificationReport>) -> u8 {
    match outcome {
        Ok(report) if report.ok => EXIT_OK,
        Ok(_) => EXIT_DIVERGENCE,
        Err(_) => EXIT_INFRASTRUCTURE,
    }
}

async fn run(
    config_path: Option<PathBuf>,
    database_url: Option<String>,
    tenant_id: Option<String>,
) -> Result<VerificationReport> {
    let mut config = AppConfig::load_from(config_path.as_deref())?;
    if let Some(url) = database_url {
        config.database_url = url;
    }

    let partition = tenant_id
        .as_deref()
        .map(|raw| TenantKey::resolve(Some(raw)))
        .transpose()?;

    let ledger = Ledger::open(&config).await?;
    Ok(ledger.verify(partition.as_ref()).await?)
}

fn print_report(report: &VerificationReport, format: &str) -> Result<()> {
    match format {
        "text" => {
            for partition in &report.partitions {
                println!("{}", partition.summary());
            }
            let failures = report.failures().count();
            if report.ok {
                println!("OK: {} partitions verified", report.partitions.len());
            } else {
                println!(
                    "DIVERGENCE: {} of {} partitions failed",
                    failures,
                    report.partitions.len()
                );
            }
        }
        _ => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}
