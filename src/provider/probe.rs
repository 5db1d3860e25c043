//! Provider probe: is a handle usable, or merely present?
//!
//! A probe issues the read-only `eth_accounts` call. Any answer,
//! including an empty account list, means the transport works. A
//! "not initialized" class of error is retried on a short fixed
//! schedule; anything else is a verdict of [`ProbeVerdict::Unusable`],
//! and so is running out of retries (with `ProviderNotReady` as the
//! cause).
//!
//! Probing never touches connection state. Callers decide what a
//! verdict means.

use std::time::Duration;

use alloy_primitives::Address;
use tokio_util::sync::CancellationToken;

use super::{Provenance, ProviderHandle};
use crate::error::{ConnectError, ErrorClass};
use crate::retry::{self, Backoff, Step};

/// Probe timeouts and the not-ready retry schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Per-call timeout for local wallets.
    pub injected_timeout: Duration,
    /// Per-call timeout for remote wallets, which may need to wake a
    /// phone and re-establish a relay session.
    pub remote_timeout: Duration,
    pub not_ready: Backoff,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            injected_timeout: Duration::from_secs(2),
            remote_timeout: Duration::from_secs(8),
            not_ready: Backoff::fixed(3, Duration::from_millis(500)),
        }
    }
}

impl ProbeConfig {
    pub fn timeout_for(&self, provenance: Provenance) -> Duration {
        match provenance {
            Provenance::Injected => self.injected_timeout,
            Provenance::Remote => self.remote_timeout,
        }
    }
}

/// Result of probing a handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeVerdict {
    /// The transport answers. `accounts` may be empty.
    Usable { accounts: Vec<Address> },
    /// The provider cannot be used; `cause` says why.
    Unusable(ConnectError),
}

/// Outcome of one `eth_accounts` call.
#[derive(Debug)]
enum Attempt {
    Settled(ProbeVerdict),
    /// The provider exists but is still initializing.
    NotReady(String),
}

/// Probes handles with a bounded not-ready retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProviderProbe {
    config: ProbeConfig,
}

impl ProviderProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    /// Probe with the timeout tuned for the handle's provenance.
    pub async fn probe_default(&self, handle: &ProviderHandle) -> ProbeVerdict {
        self.probe(handle, self.config.timeout_for(handle.provenance()))
            .await
    }

    /// Probe `handle`, retrying while it reports not-ready. Exhausting
    /// the retries yields `Unusable(ProviderNotReady)`.
    pub async fn probe(&self, handle: &ProviderHandle, timeout: Duration) -> ProbeVerdict {
        let cancel = CancellationToken::new();
        let last = retry::run(&self.config.not_ready, &cancel, |attempt| async move {
            match probe_once(handle, timeout).await {
                Attempt::NotReady(reason) => {
                    tracing::debug!(handle = %handle.id(), attempt, %reason, "provider not ready");
                    Step::Retry(Attempt::NotReady(reason))
                }
                settled => Step::Done(settled),
            }
        })
        .await;

        match last {
            Some(Attempt::Settled(verdict)) => verdict,
            Some(Attempt::NotReady(reason)) => {
                ProbeVerdict::Unusable(ConnectError::ProviderNotReady(reason))
            }
            None => ProbeVerdict::Unusable(ConnectError::ProviderNotReady("probe cancelled".into())),
        }
    }
}

/// A single `eth_accounts` call, bounded by `timeout`.
async fn probe_once(handle: &ProviderHandle, timeout: Duration) -> Attempt {
    match tokio::time::timeout(timeout, handle.accounts()).await {
        Err(_) => Attempt::Settled(ProbeVerdict::Unusable(ConnectError::Timeout(timeout))),
        Ok(Ok(accounts)) => Attempt::Settled(ProbeVerdict::Usable { accounts }),
        Ok(Err(err)) => match err.class() {
            ErrorClass::NotReady => Attempt::NotReady(err.message),
            _ => Attempt::Settled(ProbeVerdict::Unusable(err.into())),
        },
    }
}
