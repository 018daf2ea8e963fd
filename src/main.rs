//! lorawan-coord - unified CLI entrypoint.
//!
//! Usage:
//!   lorawan-coord db migrate --namespace ns
//!   lorawan-coord db cleanup --namespace as --authoritative ids.txt --dry-run
//!   lorawan-coord db prune
//!   lorawan-coord config validate --config config/lorawan-coord.toml
//!   lorawan-coord start

use anyhow::Result;
use clap::Parser;
use lorawan_coord::cli::commands::{run_config, run_db, run_start};
use lorawan_coord::cli::{init_tracing, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config.telemetry.log_level);

    match cli.command {
        Commands::Db(args) => run_db(args, &config).await,
        Commands::Config(args) => run_config(args, &config),
        Commands::Start(args) => run_start(args, &config).await,
    }
}
