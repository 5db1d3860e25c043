//! CLI commands.
//!
//! Each one-shot command builds a manager, silently restores the
//! previous session where the command needs a wallet, does its one
//! thing, prints the result and exits. `watch` keeps the manager alive
//! until SIGINT or SIGTERM.

mod format;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::cli::{Command, WalletArgs};
use crate::config::ManagerConfig;
use crate::error::ConnectError;
use crate::manager::ConnectionManager;
use crate::network::{self, NETWORKS, NetworkDescriptor};
use crate::notice::ConsoleNotices;
use crate::provider::registry::{InjectedSource, ProviderRegistry, RemoteSource};
use crate::restore::SessionRestorer;
use crate::retry::Backoff;
use crate::session::{FileSessionStore, StoreError};
use crate::switcher::NetworkSwitcher;

const INJECTION_POLL: Duration = Duration::from_millis(200);

/// CLI error type.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("$XDG_RUNTIME_DIR is not set; pass --wallet-socket and --bridge-socket")]
    NoRuntimeDir,
    #[error("unknown network: {0} (see `gmlink networks`)")]
    UnknownNetwork(String),
    #[error("{0}")]
    Connect(#[from] ConnectError),
    #[error("could not switch to {0}")]
    SwitchFailed(&'static str),
    #[error("could not add {0}")]
    AddFailed(&'static str),
    #[error("session store: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run one CLI command.
pub async fn run(args: WalletArgs, command: Command) -> Result<(), CliError> {
    if let Command::Networks = command {
        format::print_networks(&NETWORKS);
        return Ok(());
    }

    let manager = build_manager(&args)?;
    let restorer = SessionRestorer::new(manager.clone());

    match command {
        Command::Networks => {}
        Command::Status => {
            restorer.restore().await;
            format::print_snapshot(&manager.snapshot());
        }
        Command::Connect => {
            let provenance = manager.connect().await?;
            format::print_connected(provenance, &manager);
        }
        Command::Disconnect => {
            restorer.restore().await;
            manager.disconnect().await;
            println!("Disconnected");
        }
        Command::Switch { network } => {
            let target = lookup(&network)?;
            restorer.restore().await;
            if !NetworkSwitcher::new(manager.clone()).switch_to(target).await {
                return Err(CliError::SwitchFailed(target.name));
            }
            println!("Switched to {}", target.name);
        }
        Command::AddNetwork { network } => {
            let target = lookup(&network)?;
            restorer.restore().await;
            if !NetworkSwitcher::new(manager.clone()).add_network(target).await {
                return Err(CliError::AddFailed(target.name));
            }
            println!("Added {}", target.name);
        }
        Command::Watch => watch(&manager, &restorer).await?,
    }

    Ok(())
}

/// Restore, then follow the connection until SIGINT or SIGTERM.
/// SIGUSR1 means focus came back: restore again.
async fn watch(manager: &ConnectionManager, restorer: &SessionRestorer) -> Result<(), CliError> {
    let restored = restorer.restore().await;
    tracing::info!(restored, state = ?manager.state(), "watching connection");

    let cancel = CancellationToken::new();
    let monitor = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move { manager.run_monitor(cancel).await }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    loop {
        tokio::select! {
            _ = sigusr1.recv() => {
                let connected = restorer.on_focus_regained().await;
                tracing::info!(connected, "focus regained");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
        }
    }

    cancel.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!(error = %e, "health monitor task failed");
    }
    format::print_snapshot(&manager.snapshot());
    Ok(())
}

fn build_manager(args: &WalletArgs) -> Result<ConnectionManager, CliError> {
    let config = manager_config(args);
    let wallet = socket_path(args.wallet_socket.as_ref(), "wallet.sock")?;
    let bridge = socket_path(args.bridge_socket.as_ref(), "bridge.sock")?;
    let store = match &args.state_dir {
        Some(dir) => FileSessionStore::in_dir(dir),
        None => FileSessionStore::open_default()?,
    };
    tracing::debug!(
        wallet = %wallet.display(),
        bridge = %bridge.display(),
        store = %store.path().display(),
        "wallet locations"
    );

    let registry = ProviderRegistry::new(vec![
        Arc::new(InjectedSource::new(wallet, config.injected_wait)),
        Arc::new(RemoteSource::new(bridge, args.relay_host.clone())),
    ]);
    Ok(ConnectionManager::new(
        config,
        registry,
        Arc::new(store),
        Arc::new(ConsoleNotices),
    ))
}

fn manager_config(args: &WalletArgs) -> ManagerConfig {
    let wait = Duration::from_secs(args.injection_wait);
    let polls = (wait.as_millis() / INJECTION_POLL.as_millis()).max(1);
    ManagerConfig {
        health_interval: Duration::from_secs(args.health_interval.max(1)),
        injected_wait: Backoff::fixed(u32::try_from(polls).unwrap_or(u32::MAX), INJECTION_POLL),
        ..ManagerConfig::default()
    }
}

/// `explicit`, or `$XDG_RUNTIME_DIR/gmlink/<name>`.
fn socket_path(explicit: Option<&PathBuf>, name: &str) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        return Ok(path.clone());
    }
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| CliError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir).join("gmlink").join(name))
}

fn lookup(query: &str) -> Result<&'static NetworkDescriptor, CliError> {
    network::find(query).ok_or_else(|| CliError::UnknownNetwork(query.to_string()))
}
