use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use banwarden::bootstrap::Service;
use banwarden::config::Config;
use banwarden::telemetry::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(name = "banwarden")]
#[command(author, version, about = "Ban networks that keep failing to authenticate")]
struct Args {
    /// Path to config file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Validate config and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration first (to get log settings)
    let config = Config::load(&args.config)?;

    init_tracing(&TracingConfig::from(&config.telemetry))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "starting banwarden"
    );

    info!(
        selectors = config.selectors.len(),
        firewall = ?config.firewall.backend,
        dry_run = config.bans.dry_run,
        "configuration loaded"
    );

    // Validate only mode
    if args.validate {
        info!("configuration is valid");
        return Ok(());
    }

    let service = Service::new(config)?;
    service.run().await?;

    Ok(())
}
