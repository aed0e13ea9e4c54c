#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use deeplink_attribution_service::attribution::types::DeferDeepLinkRequest;
use deeplink_attribution_service::client::AttributionClient;

#[derive(Parser)]
#[command(name = "deeplink-attribution-ops")]
#[command(about = "Record or inspect pending deferred deep links on a running service")]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    base_url: String,
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a visit for a device key (overwrites any pending attribution).
    Record(RecordArgs),
    /// Show the pending attribution for a device key.
    Resolve(ResolveArgs),
}

#[derive(Args)]
struct RecordArgs {
    device_key: String,
    #[arg(long)]
    pill: Option<String>,
    #[arg(long)]
    target: Option<String>,
    #[arg(long)]
    device_type: Option<String>,
}

#[derive(Args)]
struct ResolveArgs {
    device_key: String,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = AttributionClient::new(&cli.base_url, Duration::from_millis(cli.timeout_ms))?;
    match cli.command {
        Commands::Record(args) => {
            if args.pill.is_none() && args.target.is_none() {
                anyhow::bail!("one of --pill or --target is required");
            }
            let response = client
                .record_visit(&DeferDeepLinkRequest {
                    device_id: args.device_key,
                    pill: args.pill,
                    target: args.target,
                    device_type: args.device_type,
                })
                .await
                .context("record visit")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Resolve(args) => {
            let response = client
                .resolve_visit(&args.device_key)
                .await
                .context("resolve visit")?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
