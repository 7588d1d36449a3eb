use std::path::PathBuf;

use anyhow::Result;
use basemae_pipeline::StageReport;
use basemae_storage::{RemoteConfig, SheetsClient};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "basemae")]
#[command(about = "Base Mae complaint report pipeline")]
struct Cli {
    /// Folder holding the source drop folders and pipeline artifacts.
    #[arg(long, global = true, default_value = ".")]
    base_path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Consolidate each source's raw exports into its artifact.
    Consolidate,
    /// Rebuild the raw base workbook from the consolidated artifacts.
    RawBase,
    /// Generate the canonical master base from the raw base.
    MasterBase,
    /// Append new master base records to the remote tab.
    Sync,
    /// Run all four stages in order.
    RunAll,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let base = cli.base_path;

    match cli.command {
        Commands::Consolidate => {
            print_report(&basemae_pipeline::consolidate_sources(&base).await?);
        }
        Commands::RawBase => {
            print_report(&basemae_pipeline::build_raw_base(&base).await?);
        }
        Commands::MasterBase => {
            print_report(&basemae_pipeline::generate_master_base(&base).await?);
        }
        Commands::Sync => {
            let remote = sheets_client()?;
            print_report(&basemae_pipeline::sync_to_remote(&base, &remote).await?);
        }
        Commands::RunAll => {
            let remote = sheets_client()?;
            for report in basemae_pipeline::run_all(&base, &remote).await? {
                print_report(&report);
            }
        }
    }

    Ok(())
}

fn sheets_client() -> Result<SheetsClient> {
    let config = RemoteConfig::from_env()?;
    Ok(SheetsClient::new(config)?)
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_report(report: &StageReport) {
    println!(
        "{}: {} records, {} warnings, {} artifacts",
        report.stage,
        report.records_processed,
        report.warnings.len(),
        report.artifacts.len()
    );
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    for artifact in &report.artifacts {
        println!("  wrote {} ({} bytes)", artifact.path.display(), artifact.bytes);
    }
}
