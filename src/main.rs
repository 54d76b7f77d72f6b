//! chainban - keeps iptables block chains in sync with ban lists.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use chainban::cli::{Cli, Commands};
use chainban::config::Config;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // `debug: true` in the config only matters when no flag was given
    let config_debug = !cli.quiet
        && !cli.verbose
        && Config::load_or_default(&cli.config)
            .map(|config| config.debug)
            .unwrap_or(false);

    let log_level = if cli.verbose || config_debug {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run => chainban::commands::run::run(&cli.config).await,
        Commands::Init => chainban::commands::init::run(&cli.config).await,
        Commands::SyncToxic => chainban::commands::sync_toxic::run(&cli.config).await,
        Commands::Status => chainban::commands::status::run(&cli.config).await,
        Commands::Check { ip } => chainban::commands::check::run(&ip, &cli.config).await,
        Commands::Complain {
            ip,
            severity,
            count,
        } => chainban::commands::complain::run(&ip, &severity, count, &cli.config).await,
        Commands::Config { init, force } => {
            chainban::commands::config::run(init, force, &cli.config).await
        }
        Commands::Version => {
            println!("chainban {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
