//! Connection manager configuration.

use std::time::Duration;

use crate::events::ChainGateConfig;
use crate::provider::probe::ProbeConfig;
use crate::retry::{Backoff, RetryConfig};

/// Everything tunable about the connection manager.
///
/// Defaults are suitable for interactive use; the CLI overrides a few.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub retry: RetryConfig,
    pub probe: ProbeConfig,
    pub chain_gate: ChainGateConfig,
    /// Interval between background health probes of the active handle.
    pub health_interval: Duration,
    /// Budget for the relay reachability lookup.
    pub relay_timeout: Duration,
    /// How long to wait for the user to answer an account prompt.
    pub prompt_timeout: Duration,
    /// Polling schedule while waiting for a local wallet to appear.
    pub injected_wait: Backoff,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            probe: ProbeConfig::default(),
            chain_gate: ChainGateConfig::default(),
            health_interval: Duration::from_secs(15),
            relay_timeout: Duration::from_secs(3),
            prompt_timeout: Duration::from_secs(120),
            injected_wait: Backoff::fixed(15, Duration::from_millis(200)),
        }
    }
}
