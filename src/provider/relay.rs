//! Relay reachability check.
//!
//! Run before a remote wallet attempt so an unreachable relay is
//! reported as such rather than as a generic connection failure. The
//! check resolves the relay host; it never talks to the relay itself.

use std::time::Duration;

use crate::error::ConnectError;

/// Port used for the lookup. Only resolution matters, not the port.
const RELAY_PORT: u16 = 443;

/// Resolve `host` within `timeout`.
///
/// Returns `Err(RelayUnreachable)` if resolution fails, yields no
/// addresses, or takes too long.
pub async fn check(host: &str, timeout: Duration) -> Result<(), ConnectError> {
    let unreachable = |reason: String| ConnectError::RelayUnreachable {
        host: host.to_string(),
        reason,
    };

    let lookup = tokio::net::lookup_host((host, RELAY_PORT));
    match tokio::time::timeout(timeout, lookup).await {
        Err(_) => Err(unreachable(format!("no answer within {timeout:?}"))),
        Ok(Err(e)) => Err(unreachable(e.to_string())),
        Ok(Ok(mut addrs)) => {
            if addrs.next().is_some() {
                tracing::debug!(host, "relay resolved");
                Ok(())
            } else {
                Err(unreachable("no addresses".into()))
            }
        }
    }
}
