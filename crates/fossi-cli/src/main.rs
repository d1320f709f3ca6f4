use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "fossi-cli")]
#[command(about = "Build the FOSSI HDL repository dataset")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch repositories, classify languages and write data/data.json.
    Sync,
    /// Fetch repositories into resp.json only.
    Fetch,
    /// Rebuild data/data.json from resp.json.
    Merge,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("fossi=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = fossi_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} records={} fetched_languages={} output={}",
                summary.run_id, summary.output_records, summary.fetched_languages, summary.output_path
            );
        }
        Commands::Fetch => {
            let summary = fossi_sync::run_fetch_once_from_env().await?;
            println!(
                "fetch complete: run_id={} records={} snapshot={}",
                summary.run_id, summary.records, summary.snapshot_path
            );
        }
        Commands::Merge => {
            let summary = fossi_sync::run_merge_once_from_env().await?;
            println!(
                "merge complete: run_id={} records={} fetched_languages={} output={}",
                summary.run_id, summary.output_records, summary.fetched_languages, summary.output_path
            );
        }
    }

    Ok(())
}
