mod cli;
mod commands;
mod config;
mod diagnostics;
mod error;
mod events;
mod machine;
mod manager;
mod network;
mod notice;
mod provider;
mod restore;
mod retry;
mod session;
mod switcher;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = commands::run(cli.wallet, cli.command).await {
        tracing::error!(error = %e, "command failed");
        eprintln!("gmlink: {e}");
        std::process::exit(1);
    }
}
