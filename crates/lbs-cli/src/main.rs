use anyhow::Result;
use clap::{Parser, Subcommand};
use lbs_recon::{Reconciler, SyncConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "lbs-cli")]
#[command(about = "Lease balance sheet sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print the summary.
    Sync,
    /// Serve the HTTP trigger endpoints.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let reconciler = Reconciler::from_config(&config)?;
            let summary = reconciler.run_once().await?;
            println!(
                "{} run_id={} seen={} skipped: enrichment={} integrity={}",
                summary.message(),
                summary.run_id,
                summary.records_seen,
                summary.enrichment_skipped,
                summary.integrity_skipped
            );
        }
        Commands::Serve { port } => {
            let reconciler = Reconciler::from_config(&config)?;
            lbs_web::serve(reconciler, port).await?;
        }
    }

    Ok(())
}
