//! Provider registry: where wallets can be found, in probe order.
//!
//! A [`ProviderSource`] knows how to locate one kind of wallet without
//! prompting the user. The registry keeps the sources ordered so that
//! local (injected) wallets are always tried before remote ones: they
//! need no relay round trip and no redirect to another app.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::ipc::IpcProvider;
use super::{Eip1193, Provenance};
use crate::retry::{self, Backoff, Step};

/// One place a wallet provider may come from.
pub trait ProviderSource: Send + Sync {
    /// Short name for logs and diagnostics.
    fn name(&self) -> &str;

    fn provenance(&self) -> Provenance;

    /// Relay host to check for reachability before using this source.
    fn relay_host(&self) -> Option<&str> {
        None
    }

    /// Locate the provider without prompting. `None` if it is absent.
    fn locate(&self) -> BoxFuture<'_, Option<Arc<dyn Eip1193>>>;

    /// Drop any in-memory session state, so the next `locate` starts a
    /// fresh session.
    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// A wallet listening on a local IPC socket.
///
/// If the socket is not there yet the source polls for it on the
/// `wait` schedule; wallets that start alongside the application may
/// take a moment to appear.
#[derive(Debug)]
pub struct InjectedSource {
    path: PathBuf,
    wait: Backoff,
}

impl InjectedSource {
    pub fn new(path: impl Into<PathBuf>, wait: Backoff) -> Self {
        Self {
            path: path.into(),
            wait,
        }
    }
}

impl ProviderSource for InjectedSource {
    fn name(&self) -> &str {
        "injected"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Injected
    }

    fn locate(&self) -> BoxFuture<'_, Option<Arc<dyn Eip1193>>> {
        Box::pin(async move {
            let cancel = CancellationToken::new();
            let path = self.path.as_path();
            let provider = retry::run(&self.wait, &cancel, |_| async move {
                if !path.exists() {
                    return Step::Retry(None);
                }
                match IpcProvider::connect(path).await {
                    Ok(provider) => Step::Done(Some(provider)),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "injected wallet not accepting");
                        Step::Retry(None)
                    }
                }
            })
            .await
            .flatten()?;
            Some(Arc::new(provider) as Arc<dyn Eip1193>)
        })
    }
}

/// A remote wallet reached through a local bridge that holds the relay
/// session.
///
/// The bridge connection is cached: while it stays open, `locate`
/// returns the same provider, so an established session is reused
/// instead of re-paired.
#[derive(Debug)]
pub struct RemoteSource {
    bridge: PathBuf,
    relay_host: String,
    session: Mutex<Option<Arc<IpcProvider>>>,
}

impl RemoteSource {
    pub fn new(bridge: impl Into<PathBuf>, relay_host: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            relay_host: relay_host.into(),
            session: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<Arc<IpcProvider>> {
        let guard = self.session.lock().ok()?;
        guard.as_ref().filter(|p| p.is_open()).cloned()
    }
}

impl ProviderSource for RemoteSource {
    fn name(&self) -> &str {
        "remote"
    }

    fn provenance(&self) -> Provenance {
        Provenance::Remote
    }

    fn relay_host(&self) -> Option<&str> {
        Some(&self.relay_host)
    }

    fn locate(&self) -> BoxFuture<'_, Option<Arc<dyn Eip1193>>> {
        Box::pin(async move {
            if let Some(provider) = self.cached() {
                return Some(provider as Arc<dyn Eip1193>);
            }
            let provider = match IpcProvider::connect(&self.bridge).await {
                Ok(p) => Arc::new(p.with_session_tracking()),
                Err(e) => {
                    tracing::debug!(path = %self.bridge.display(), error = %e, "wallet bridge unavailable");
                    return None;
                }
            };
            if let Ok(mut guard) = self.session.lock() {
                *guard = Some(Arc::clone(&provider));
            }
            Some(provider as Arc<dyn Eip1193>)
        })
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let stale = self.session.lock().ok().and_then(|mut g| g.take());
            if let Some(provider) = stale {
                let _ = provider.close().await;
                tracing::debug!(path = %self.bridge.display(), "remote session state cleared");
            }
        })
    }
}

/// Ordered set of provider sources.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    sources: Vec<Arc<dyn ProviderSource>>,
}

impl ProviderRegistry {
    /// Build a registry. Injected sources are moved ahead of remote
    /// ones; order within each group is preserved.
    pub fn new(mut sources: Vec<Arc<dyn ProviderSource>>) -> Self {
        sources.sort_by_key(|s| match s.provenance() {
            Provenance::Injected => 0,
            Provenance::Remote => 1,
        });
        Self { sources }
    }

    /// Sources in probe order. Locating happens lazily, when the caller
    /// asks each source in turn.
    pub fn list_candidates(&self) -> impl Iterator<Item = &Arc<dyn ProviderSource>> {
        self.sources.iter()
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.sources.iter().map(|s| s.name()))
            .finish()
    }
}
