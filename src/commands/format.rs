//! Output formatting for CLI commands.
//!
//! Human-readable tables for listings; diagnostics go to stdout as
//! pretty JSON so they can be piped into `jq`.

use crate::diagnostics::Snapshot;
use crate::manager::ConnectionManager;
use crate::network::NetworkDescriptor;
use crate::provider::Provenance;

/// Print the network table to stdout.
pub fn print_networks(networks: &[NetworkDescriptor]) {
    println!("{:<18} {:<18} {:>10} CONTRACT", "NETWORK", "NAME", "CHAIN_ID");
    println!("{}", "-".repeat(92));
    for n in networks {
        println!(
            "{:<18} {:<18} {:>10} {}",
            n.slug,
            n.name,
            n.chain_id_hex(),
            n.contract
        );
    }
}

pub fn print_snapshot(snapshot: &Snapshot) {
    println!("{}", snapshot.to_json_pretty());
}

/// Print a one-line connect summary.
pub fn print_connected(provenance: Provenance, manager: &ConnectionManager) {
    let account = match manager.signer() {
        Ok(signer) => format!("{} (handle {})", signer.address, signer.handle.id()),
        Err(_) => "no account".into(),
    };
    let snapshot = manager.snapshot();
    let network = snapshot
        .network
        .map(str::to_string)
        .or_else(|| snapshot.chain_id.map(|id| format!("{id:#x}")))
        .unwrap_or_else(|| "unknown chain".into());
    println!("Connected ({provenance}) {account} on {network}");
}
