mod cli;
mod commands;
mod logging;

use clap::Parser;
use cli::{Cli, Command};
use rally_sync::SyncConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env first so clap's env fallbacks see it.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config())?;

    let cfg = cli.remote.apply(SyncConfig::from_env());
    match cli.command {
        Command::Watch(args) => commands::watch(&cfg, args).await,
        Command::Queue(command) => commands::queue(&cfg, command).await,
        Command::Enqueue(args) => commands::enqueue(&cfg, args).await,
        Command::ClosePeriod(args) => commands::close_period(&cfg, args).await,
        Command::Pin(args) => commands::pin(&cfg, args).await,
        Command::Matches => commands::matches(&cfg).await,
    }
}
