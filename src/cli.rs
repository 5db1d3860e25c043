use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "gmlink", about = "Wallet connection manager")]
pub struct Cli {
    #[command(flatten)]
    pub wallet: WalletArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Where wallets live and how hard to try.
#[derive(Args, Debug, Clone)]
pub struct WalletArgs {
    /// Local wallet IPC socket [default: $XDG_RUNTIME_DIR/gmlink/wallet.sock]
    #[arg(long, global = true)]
    pub wallet_socket: Option<PathBuf>,

    /// Remote wallet bridge socket [default: $XDG_RUNTIME_DIR/gmlink/bridge.sock]
    #[arg(long, global = true)]
    pub bridge_socket: Option<PathBuf>,

    /// Relay host checked before using the remote wallet
    #[arg(long, global = true, default_value = "relay.walletconnect.com")]
    pub relay_host: String,

    /// Session state directory [default: $XDG_STATE_HOME/gmlink]
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Seconds between health checks in `watch`
    #[arg(long, global = true, default_value_t = 15)]
    pub health_interval: u64,

    /// Seconds to wait for the local wallet socket to appear
    #[arg(long, global = true, default_value_t = 3)]
    pub injection_wait: u64,
}

#[derive(Subcommand)]
pub enum Command {
    /// List supported networks
    Networks,

    /// Restore the previous session if possible and print diagnostics
    Status,

    /// Connect to a wallet, prompting if needed
    Connect,

    /// Disconnect and stop restoring the session automatically
    Disconnect,

    /// Switch the wallet to a network
    Switch {
        /// Network slug, name, or chain id
        network: String,
    },

    /// Register a network with the wallet without switching
    AddNetwork {
        /// Network slug, name, or chain id
        network: String,
    },

    /// Stay connected: restore, monitor health, follow wallet events.
    /// SIGUSR1 re-runs restore.
    Watch,
}
