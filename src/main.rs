// ABOUTME: Entry point for the larder binary.
// ABOUTME: Loads .env and configuration, initializes tracing, and dispatches the CLI subcommand.

mod commands;
mod config;

use clap::Parser;

/// Local-first record storage with autosave and backups.
#[derive(Debug, Parser)]
#[command(name = "larder", version, about)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("larder=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::LarderConfig::from_env()?;
    tracing::debug!(home = %config.home.display(), backend = ?config.backend, "larder starting up");

    commands::run(cli.command, &config).await
}
