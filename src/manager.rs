//! Connection manager: the async shell around the state machine.
//!
//! [`ConnectionManager`] owns the one [`ConnectionStateMachine`] and
//! drives it from connect and disconnect requests, background health
//! probes, and provider events. Slow work (locating, probing, prompting)
//! runs without holding the machine; results are committed through the
//! machine's ticket and handle checks, so a late result for an attempt
//! or handle that is no longer current is discarded.
//!
//! Provider events arrive through the [`EventBridge`] and are handled by
//! a pump task that holds only a weak reference, so dropping the last
//! manager clone shuts everything down.

use std::sync::{Arc, Mutex, PoisonError, Weak};

use alloy_primitives::Address;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::diagnostics::Snapshot;
use crate::error::{ConnectError, ErrorClass};
use crate::events::{BridgedEvent, EventBridge};
use crate::machine::{ConnectionState, ConnectionStateMachine, Effect, Refusal, Stale};
use crate::notice::{Notice, NoticeSink};
use crate::provider::probe::{ProbeVerdict, ProviderProbe};
use crate::provider::registry::ProviderRegistry;
use crate::provider::{HandleId, Provenance, ProviderEvent, ProviderHandle, relay};
use crate::session::{PersistedState, SessionRecord, SessionStore};

/// Who asked for a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// An explicit user action. Bypasses the cooldown, may prompt, and
    /// reports failures.
    User,
    /// Silent session restore. Respects the cooldown, never prompts.
    Restore,
}

/// Account selected for signing on the active provider.
#[derive(Debug, Clone)]
pub struct Signer {
    pub handle: ProviderHandle,
    pub address: Address,
}

/// Why every candidate failed.
#[derive(Debug)]
struct AttemptFailure {
    cause: ConnectError,
    /// Feeds the circuit breaker.
    counts: bool,
    session_expired: bool,
}

struct Inner {
    machine: Mutex<ConnectionStateMachine>,
    registry: ProviderRegistry,
    probe: ProviderProbe,
    store: Arc<dyn SessionStore>,
    notices: Arc<dyn NoticeSink>,
    bridge: EventBridge,
    config: ManagerConfig,
}

/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Build a manager and start its event pump. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: ManagerConfig,
        registry: ProviderRegistry,
        store: Arc<dyn SessionStore>,
        notices: Arc<dyn NoticeSink>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            machine: Mutex::new(ConnectionStateMachine::new(config.retry)),
            registry,
            probe: ProviderProbe::new(config.probe),
            store,
            notices,
            bridge: EventBridge::new(tx, config.chain_gate),
            config,
        });
        tokio::spawn(pump(Arc::downgrade(&inner), rx));
        Self { inner }
    }

    pub fn notices(&self) -> &dyn NoticeSink {
        &*self.inner.notices
    }

    pub fn state(&self) -> ConnectionState {
        self.with_machine(|m| {
            m.tick(Instant::now());
            m.state()
        })
    }

    /// The active provider, for callers that issue their own requests.
    pub fn provider(&self) -> Option<ProviderHandle> {
        self.with_machine(|m| m.active_handle().cloned())
    }

    /// The active provider and its first account.
    pub fn signer(&self) -> Result<Signer, ConnectError> {
        self.with_machine(|m| {
            let active = m.active().ok_or(ConnectError::NotConnected)?;
            let address = *active.accounts.first().ok_or(ConnectError::NotConnected)?;
            Ok(Signer {
                handle: active.handle.clone(),
                address,
            })
        })
    }

    /// Persisted state. A store that cannot be read counts as empty.
    pub fn persisted(&self) -> PersistedState {
        self.inner.store.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to load session state");
            PersistedState::default()
        })
    }

    pub fn snapshot(&self) -> Snapshot {
        let persisted = self.persisted();
        let listeners = self.inner.bridge.attached();
        self.with_machine(|m| {
            let now = Instant::now();
            m.tick(now);
            Snapshot::capture(m, &persisted, listeners, now)
        })
    }

    /// User-initiated connect.
    ///
    /// A no-op success while a usable connection exists. Otherwise
    /// tries each candidate in registry order and connects to the first
    /// usable one. Failures are reported to the user.
    pub async fn connect(&self) -> Result<Provenance, ConnectError> {
        self.attempt(Origin::User).await
    }

    pub(crate) async fn attempt(&self, origin: Origin) -> Result<Provenance, ConnectError> {
        let user = origin == Origin::User;

        if let Some(handle) = self.provider() {
            match self.inner.probe.probe_default(&handle).await {
                ProbeVerdict::Usable { accounts } if accounts.is_empty() && user => {
                    return self.reauthorize(&handle).await;
                }
                ProbeVerdict::Usable { accounts } => {
                    if !accounts.is_empty() {
                        let _ = self.with_machine(|m| m.mark_healthy(handle.id(), accounts));
                    }
                    return Ok(handle.provenance());
                }
                verdict @ ProbeVerdict::Unusable(_) => {
                    tracing::info!(handle = %handle.id(), ?verdict, "active provider unusable, reconnecting");
                    let released = self.with_machine(|m| m.drop_active(handle.id(), None, Instant::now()));
                    if let Ok(effects) = released {
                        self.apply(effects);
                    }
                }
            }
        }

        let ticket = match self.with_machine(|m| m.begin_connect(Instant::now(), user)) {
            Ok(ticket) => ticket,
            Err(Refusal::AlreadyConnected(_)) => return self.current_provenance(),
            Err(Refusal::CircuitOpen { remaining }) => {
                return Err(ConnectError::CircuitOpen { remaining });
            }
        };

        tracing::info!(?origin, "connecting");
        match self.resolve(user).await {
            Ok((handle, accounts)) => {
                let provenance = handle.provenance();
                let id = handle.id();
                let committed = self.with_machine(|m| {
                    m.complete_connect(ticket, handle.clone(), accounts, Instant::now())
                });
                match committed {
                    Ok(effects) => {
                        self.apply(effects);
                        self.refresh_chain(&handle).await;
                        Ok(provenance)
                    }
                    Err(Stale) => {
                        tracing::debug!(handle = %id, "connect superseded, discarding provider");
                        self.current_provenance()
                    }
                }
            }
            Err(failure) => {
                let committed = self.with_machine(|m| {
                    m.fail_connect(ticket, failure.cause.clone(), failure.counts, Instant::now())
                });
                let Ok(effects) = committed else {
                    return Err(failure.cause);
                };
                self.apply(effects);
                if failure.session_expired {
                    self.forget_session();
                }
                if user {
                    self.inner.notices.notify(failure_notice(&failure.cause));
                } else if failure.session_expired {
                    self.inner.notices.notify(Notice::SessionExpired);
                }
                Err(failure.cause)
            }
        }
    }

    /// Try each candidate in order; the first usable one wins.
    async fn resolve(&self, user: bool) -> Result<(ProviderHandle, Vec<Address>), AttemptFailure> {
        let mut last: Option<ConnectError> = None;
        let mut session_expired = false;

        for source in self.inner.registry.list_candidates() {
            if let Some(host) = source.relay_host() {
                if let Err(e) = relay::check(host, self.inner.config.relay_timeout).await {
                    tracing::warn!(source = source.name(), error = %e, "skipping source");
                    last = Some(e);
                    continue;
                }
            }
            let Some(provider) = source.locate().await else {
                tracing::debug!(source = source.name(), "no provider present");
                continue;
            };
            let handle = ProviderHandle::new(source.provenance(), provider);
            let cause = match self.inner.probe.probe_default(&handle).await {
                ProbeVerdict::Usable { accounts } if accounts.is_empty() && user => {
                    match self.prompt_accounts(&handle).await {
                        Ok(accounts) => return Ok((handle, accounts)),
                        Err(ConnectError::UserRejected) => {
                            return Err(AttemptFailure {
                                cause: ConnectError::UserRejected,
                                counts: false,
                                session_expired,
                            });
                        }
                        Err(e) => e,
                    }
                }
                ProbeVerdict::Usable { accounts } => return Ok((handle, accounts)),
                ProbeVerdict::Unusable(cause) => cause,
            };
            tracing::info!(source = source.name(), handle = %handle.id(), error = %cause, "candidate unusable");
            if cause == ConnectError::SessionExpired {
                session_expired = true;
                source.reset().await;
            }
            last = Some(cause);
        }

        let counts = last.is_some();
        Err(AttemptFailure {
            cause: last.unwrap_or(ConnectError::NoProvider),
            counts,
            session_expired,
        })
    }

    /// The active wallet answers but grants no accounts: ask again.
    /// A refusal keeps the handle and is reported.
    async fn reauthorize(&self, handle: &ProviderHandle) -> Result<Provenance, ConnectError> {
        match self.prompt_accounts(handle).await {
            Ok(accounts) => {
                if !accounts.is_empty() {
                    let _ = self.with_machine(|m| m.mark_healthy(handle.id(), accounts));
                }
                Ok(handle.provenance())
            }
            Err(cause) => {
                tracing::info!(handle = %handle.id(), error = %cause, "account access not granted");
                self.inner.notices.notify(failure_notice(&cause));
                Err(cause)
            }
        }
    }

    async fn prompt_accounts(&self, handle: &ProviderHandle) -> Result<Vec<Address>, ConnectError> {
        let timeout = self.inner.config.prompt_timeout;
        tracing::info!(handle = %handle.id(), "requesting account access");
        match tokio::time::timeout(timeout, handle.request_accounts()).await {
            Err(_) => Err(ConnectError::Timeout(timeout)),
            Ok(result) => result.map_err(ConnectError::from),
        }
    }

    /// Explicit user disconnect. Blocks silent restore until the next
    /// successful connect.
    pub async fn disconnect(&self) {
        let effects = self.with_machine(|m| m.user_disconnect(Instant::now()));
        let released: Vec<ProviderHandle> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Release(handle) => Some(handle.clone()),
                _ => None,
            })
            .collect();
        self.apply(effects);
        for handle in released {
            if let Err(e) = handle.provider().close().await {
                tracing::warn!(handle = %handle.id(), error = %e, "failed to close provider");
            }
        }
        self.save(&PersistedState {
            explicitly_disconnected: true,
            session: None,
        });
    }

    /// Probe the active handle once and apply the verdict. Returns the
    /// resulting state.
    pub async fn health_check(&self) -> ConnectionState {
        let Some(handle) = self.provider() else {
            return self.state();
        };
        let id = handle.id();
        let cause = match self.inner.probe.probe_default(&handle).await {
            ProbeVerdict::Usable { accounts } if accounts.is_empty() => {
                let _ = self.with_machine(|m| m.accounts_withdrawn(id, Instant::now()));
                return self.state();
            }
            ProbeVerdict::Usable { accounts } => {
                let _ = self.with_machine(|m| m.mark_healthy(id, accounts));
                self.refresh_chain(&handle).await;
                return self.state();
            }
            ProbeVerdict::Unusable(cause) => cause,
        };

        let session = handle.provider().session_alive();
        let expired = cause == ConnectError::SessionExpired || session == Some(false);
        let keep = !expired && session == Some(true);
        let now = Instant::now();
        let released = self.with_machine(|m| {
            if keep && m.state() == ConnectionState::Connected {
                m.mark_degraded(id, Some(cause.clone()), now).map(|()| Vec::new())
            } else {
                m.drop_active(id, Some(cause.clone()), now)
            }
        });
        if let Ok(effects) = released {
            let dropped = effects.iter().any(|e| matches!(e, Effect::Release(_)));
            self.apply(effects);
            if dropped && expired {
                self.session_expired().await;
            }
        }
        self.state()
    }

    /// Run health checks every `health_interval` until `cancel` fires.
    pub async fn run_monitor(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let state = self.health_check().await;
                    tracing::trace!(?state, "health check");
                }
            }
        }
        tracing::debug!("health monitor stopped");
    }

    /// Apply one provider event from the bridge.
    pub(crate) async fn handle_event(&self, bridged: BridgedEvent) {
        let BridgedEvent { handle: id, event } = bridged;
        let now = Instant::now();
        let outcome = match event {
            ProviderEvent::AccountsChanged(accounts) => {
                tracing::info!(handle = %id, count = accounts.len(), "accounts changed");
                self.with_machine(|m| m.accounts_changed(id, accounts, now))
                    .map(|effects| self.apply(effects))
            }
            ProviderEvent::ChainChanged(chain_id) => self
                .with_machine(|m| m.chain_changed(id, chain_id)),
            ProviderEvent::Disconnect(err) => {
                tracing::info!(handle = %id, error = %err, "provider disconnected");
                let released = self.with_machine(|m| m.drop_active(id, None, now));
                match released {
                    Ok(effects) => {
                        self.apply(effects);
                        if err.class() == ErrorClass::SessionExpired {
                            self.session_expired().await;
                        }
                        Ok(())
                    }
                    Err(stale) => Err(stale),
                }
            }
        };
        if outcome.is_err() {
            tracing::debug!(handle = %id, "ignoring event for inactive handle");
        }
    }

    /// Record the chain the active handle is on.
    pub(crate) fn note_chain(&self, id: HandleId, chain_id: u64) {
        let _ = self.with_machine(|m| m.chain_changed(id, chain_id));
    }

    async fn refresh_chain(&self, handle: &ProviderHandle) {
        match handle.chain_id().await {
            Ok(chain_id) => self.note_chain(handle.id(), chain_id),
            Err(e) => tracing::debug!(handle = %handle.id(), error = %e, "chain id unavailable"),
        }
    }

    /// The remote session is gone for good: clear the record, drop the
    /// cached remote session, and tell the user once.
    async fn session_expired(&self) {
        self.forget_session();
        for source in self.inner.registry.list_candidates() {
            if source.provenance() == Provenance::Remote {
                source.reset().await;
            }
        }
        self.inner.notices.notify(Notice::SessionExpired);
    }

    fn forget_session(&self) {
        let mut state = self.persisted();
        if state.session.take().is_some() {
            tracing::info!("session record cleared");
            self.save(&state);
        }
    }

    fn apply(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Attach(handle) => {
                    self.inner.bridge.attach(&handle);
                    self.save(&PersistedState {
                        explicitly_disconnected: false,
                        session: Some(SessionRecord::new(handle.provenance())),
                    });
                }
                Effect::Release(handle) => self.inner.bridge.detach(handle.id()),
                Effect::Locked { remaining } => {
                    self.inner.notices.notify(Notice::CooldownLocked { remaining });
                }
            }
        }
    }

    fn save(&self, state: &PersistedState) {
        if let Err(e) = self.inner.store.save(state) {
            tracing::warn!(error = %e, "failed to save session state");
        }
    }

    fn current_provenance(&self) -> Result<Provenance, ConnectError> {
        self.provider()
            .map(|h| h.provenance())
            .ok_or(ConnectError::NotConnected)
    }

    fn with_machine<R>(&self, f: impl FnOnce(&mut ConnectionStateMachine) -> R) -> R {
        let mut machine = self
            .inner
            .machine
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut machine)
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("registry", &self.inner.registry)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn failure_notice(cause: &ConnectError) -> Notice {
    match cause {
        ConnectError::UserRejected => Notice::UserRejected,
        ConnectError::SessionExpired => Notice::SessionExpired,
        ConnectError::NoProvider => Notice::NoProvider,
        ConnectError::RelayUnreachable { host, .. } => Notice::RelayUnreachable { host: host.clone() },
        other => Notice::ConnectFailed {
            reason: other.to_string(),
        },
    }
}

/// Feed bridged events to the manager until it is dropped.
async fn pump(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<BridgedEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ConnectionManager { inner }.handle_event(event).await;
    }
    tracing::debug!("event pump stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ProviderRpcError;
    use crate::notice::RecordingNotices;
    use crate::provider::mock::{MockProvider, MockSource, account};
    use crate::provider::registry::ProviderSource;
    use crate::session::MemorySessionStore;
    use serde_json::json;
    use std::time::Duration;

    pub(crate) struct Fixture {
        pub manager: ConnectionManager,
        pub store: Arc<MemorySessionStore>,
        pub notices: Arc<RecordingNotices>,
    }

    pub(crate) fn fixture(sources: Vec<Arc<MockSource>>, persisted: PersistedState) -> Fixture {
        let store = Arc::new(MemorySessionStore::new(persisted));
        let notices = Arc::new(RecordingNotices::default());
        let sources = sources
            .into_iter()
            .map(|s| s as Arc<dyn ProviderSource>)
            .collect();
        let manager = ConnectionManager::new(
            ManagerConfig::default(),
            ProviderRegistry::new(sources),
            store.clone(),
            notices.clone(),
        );
        Fixture {
            manager,
            store,
            notices,
        }
    }

    fn injected(provider: &Arc<MockProvider>) -> Arc<MockSource> {
        MockSource::new("injected", Provenance::Injected, Some(provider.clone()))
    }

    fn remote(provider: &Arc<MockProvider>) -> Arc<MockSource> {
        MockSource::new("remote", Provenance::Remote, Some(provider.clone()))
    }

    fn failing() -> Arc<MockProvider> {
        let mock = MockProvider::new();
        mock.set(
            "eth_accounts",
            Err(ProviderRpcError::disconnected("transport closed")),
        );
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_connect_prefers_injected() {
        let local = MockProvider::healthy(&[account(1)]);
        let phone = MockProvider::healthy(&[account(2)]);
        let phone_source = remote(&phone);
        let f = fixture(
            vec![phone_source.clone(), injected(&local)],
            PersistedState::default(),
        );

        assert_eq!(f.manager.connect().await, Ok(Provenance::Injected));
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(phone_source.locates(), 0);

        let snap = f.manager.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.accounts, vec![account(1)]);
        assert_eq!(snap.chain_id, Some(0xaa36a7));
        assert_eq!(snap.event_listeners, 1);

        let persisted = f.store.load().unwrap();
        assert!(!persisted.explicitly_disconnected);
        assert_eq!(persisted.session.unwrap().provenance, Provenance::Injected);
        assert!(f.notices.take().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let local = MockProvider::healthy(&[account(1)]);
        let source = injected(&local);
        let f = fixture(vec![source.clone()], PersistedState::default());

        f.manager.connect().await.unwrap();
        let first = f.manager.provider().unwrap().id();
        assert_eq!(f.manager.connect().await, Ok(Provenance::Injected));
        assert_eq!(f.manager.provider().unwrap().id(), first);
        assert_eq!(source.locates(), 1);
        assert_eq!(f.manager.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_remote_counts_one_failure() {
        let phone = MockProvider::new();
        for _ in 0..3 {
            phone.push(
                "eth_accounts",
                Err(ProviderRpcError::new(-32000, "provider not initialized")),
            );
        }
        let f = fixture(vec![remote(&phone)], PersistedState::default());

        let started = Instant::now();
        let err = f.manager.connect().await.unwrap_err();
        assert!(matches!(err, ConnectError::ProviderNotReady(_)));
        assert_eq!(started.elapsed(), Duration::from_secs(1));
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert_eq!(f.manager.snapshot().consecutive_failures, 1);
        assert_eq!(phone.calls("eth_accounts"), 3);

        let notices = f.notices.take();
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], Notice::ConnectFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_accounts_prompts_on_user_connect() {
        let local = MockProvider::new();
        local.set("eth_accounts", Ok(json!([])));
        local.set("eth_requestAccounts", Ok(json!([account(4)])));
        let f = fixture(vec![injected(&local)], PersistedState::default());

        f.manager.connect().await.unwrap();
        assert_eq!(local.calls("eth_requestAccounts"), 1);
        assert_eq!(f.manager.signer().unwrap().address, account(4));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_prompt_is_reported_and_not_counted() {
        let local = MockProvider::new();
        local.set("eth_accounts", Ok(json!([])));
        local.set(
            "eth_requestAccounts",
            Err(ProviderRpcError::new(4001, "User rejected the request.")),
        );
        let f = fixture(vec![injected(&local)], PersistedState::default());

        assert_eq!(f.manager.connect().await, Err(ConnectError::UserRejected));
        assert_eq!(f.notices.take(), vec![Notice::UserRejected]);
        assert_eq!(f.manager.snapshot().consecutive_failures, 0);
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn no_provider_is_reported_and_not_counted() {
        let source = MockSource::new("injected", Provenance::Injected, None);
        let f = fixture(vec![source], PersistedState::default());

        assert_eq!(f.manager.connect().await, Err(ConnectError::NoProvider));
        assert_eq!(f.notices.take(), vec![Notice::NoProvider]);
        assert_eq!(f.manager.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_lock_out_automatic_attempts() {
        let source = injected(&failing());
        let f = fixture(vec![source.clone()], PersistedState::default());

        for _ in 0..3 {
            assert!(f.manager.connect().await.is_err());
        }
        assert_eq!(f.manager.state(), ConnectionState::CooldownLocked);
        let notices = f.notices.take();
        assert!(notices.iter().any(|n| matches!(n, Notice::CooldownLocked { .. })));

        let err = f.manager.attempt(Origin::Restore).await.unwrap_err();
        assert!(matches!(err, ConnectError::CircuitOpen { .. }));
        assert_eq!(source.locates(), 3);

        // A manual attempt overrides the lockout.
        source.replace(Some(MockProvider::healthy(&[account(1)])));
        assert!(f.manager.connect().await.is_ok());
        assert_eq!(source.locates(), 4);
        assert_eq!(f.manager.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_override_keeps_lockout() {
        let source = injected(&failing());
        let f = fixture(vec![source.clone()], PersistedState::default());
        for _ in 0..3 {
            assert!(f.manager.connect().await.is_err());
        }
        assert_eq!(f.manager.state(), ConnectionState::CooldownLocked);
        f.notices.take();

        let locked = MockProvider::new();
        locked.set("eth_accounts", Ok(json!([])));
        locked.set(
            "eth_requestAccounts",
            Err(ProviderRpcError::new(4001, "User rejected the request.")),
        );
        source.replace(Some(locked));
        assert_eq!(f.manager.connect().await, Err(ConnectError::UserRejected));
        assert_eq!(f.notices.take(), vec![Notice::UserRejected]);

        assert_eq!(f.manager.state(), ConnectionState::CooldownLocked);
        let snap = f.manager.snapshot();
        assert_eq!(snap.consecutive_failures, 3);
        assert!(snap.cooldown_remaining_ms.is_some());
        let err = f.manager.attempt(Origin::Restore).await.unwrap_err();
        assert!(matches!(err, ConnectError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_relay_skips_remote_after_injected() {
        let local = MockSource::new("injected", Provenance::Injected, None);
        let phone = MockProvider::healthy(&[account(2)]);
        let bridge = MockSource::remote(Some(phone.clone()), "relay.invalid");
        let f = fixture(vec![bridge.clone(), local.clone()], PersistedState::default());

        let err = f.manager.connect().await.unwrap_err();
        assert!(matches!(&err, ConnectError::RelayUnreachable { host, .. } if host == "relay.invalid"));
        assert_eq!(local.locates(), 1);
        assert_eq!(bridge.locates(), 0);
        assert!(phone.methods().is_empty());
        assert_eq!(
            f.notices.take(),
            vec![Notice::RelayUnreachable {
                host: "relay.invalid".into()
            }]
        );
        assert_eq!(f.manager.snapshot().consecutive_failures, 1);
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_releases_and_opts_out() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        f.manager.disconnect().await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert!(f.manager.provider().is_none());
        assert!(local.is_closed());
        assert_eq!(f.manager.snapshot().event_listeners, 0);
        assert_eq!(
            f.store.load().unwrap(),
            PersistedState {
                explicitly_disconnected: true,
                session: None
            }
        );
        assert!(matches!(f.manager.signer(), Err(ConnectError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_connect_discards_late_result() {
        let local = MockProvider::healthy(&[account(1)]);
        local.set_delay(Duration::from_secs(1));
        let f = fixture(vec![injected(&local)], PersistedState::default());

        let manager = f.manager.clone();
        let pending = tokio::spawn(async move { manager.connect().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.manager.state(), ConnectionState::Connecting);

        f.manager.disconnect().await;
        assert_eq!(pending.await.unwrap(), Err(ConnectError::NotConnected));
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert!(f.manager.provider().is_none());
        assert!(f.store.load().unwrap().explicitly_disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_accounts_event_disconnects() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        local.emit(ProviderEvent::AccountsChanged(vec![]));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        // A wallet lock is not an explicit opt-out.
        let persisted = f.store.load().unwrap();
        assert!(!persisted.explicitly_disconnected);
        assert!(persisted.session.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn chain_event_updates_active_chain() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        local.emit(ProviderEvent::ChainChanged(0xaa37dc));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.manager.snapshot().network, Some("base-sepolia"));
    }

    #[tokio::test(start_paused = true)]
    async fn chain_burst_settles_on_latest_chain() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        local.emit(ProviderEvent::ChainChanged(0xaa37dc));
        local.emit(ProviderEvent::ChainChanged(0xaa37dd));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.manager.snapshot().chain_id, Some(0xaa37dc));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.manager.snapshot().chain_id, Some(0xaa37dd));
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_released_handles_are_ignored() {
        let first = MockProvider::healthy(&[account(1)]);
        let source = injected(&first);
        let f = fixture(vec![source.clone()], PersistedState::default());
        f.manager.connect().await.unwrap();
        let old = f.manager.provider().unwrap().id();
        f.manager.disconnect().await;

        source.replace(Some(MockProvider::healthy(&[account(2)])));
        f.manager.connect().await.unwrap();
        f.manager
            .handle_event(BridgedEvent {
                handle: old,
                event: ProviderEvent::AccountsChanged(vec![]),
            })
            .await;
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.manager.signer().unwrap().address, account(2));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_session_expiry_event_clears_record() {
        let phone = MockProvider::healthy(&[account(1)]);
        let source = remote(&phone);
        let f = fixture(vec![source.clone()], PersistedState::default());
        f.manager.connect().await.unwrap();
        assert!(f.store.load().unwrap().session.is_some());

        phone.emit(ProviderEvent::Disconnect(ProviderRpcError::new(
            -32000,
            "Session topic doesn't exist",
        )));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.manager.state(), ConnectionState::Disconnected);
        assert!(f.store.load().unwrap().session.is_none());
        assert_eq!(source.resets(), 1);
        assert_eq!(f.notices.take(), vec![Notice::SessionExpired]);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_degrades_then_disconnects_remote() {
        let phone = MockProvider::healthy(&[account(1)]);
        phone.set_session(Some(true));
        let f = fixture(vec![remote(&phone)], PersistedState::default());
        f.manager.connect().await.unwrap();

        phone.set(
            "eth_accounts",
            Err(ProviderRpcError::disconnected("relay hiccup")),
        );
        assert_eq!(f.manager.health_check().await, ConnectionState::Degraded);
        assert!(f.manager.provider().is_some());
        assert_eq!(f.manager.health_check().await, ConnectionState::Disconnected);
        assert!(f.manager.provider().is_none());
        assert_eq!(f.manager.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_recovers_degraded() {
        let phone = MockProvider::healthy(&[account(1)]);
        phone.set_session(Some(true));
        let f = fixture(vec![remote(&phone)], PersistedState::default());
        f.manager.connect().await.unwrap();

        phone.push(
            "eth_accounts",
            Err(ProviderRpcError::disconnected("relay hiccup")),
        );
        assert_eq!(f.manager.health_check().await, ConnectionState::Degraded);
        assert_eq!(f.manager.health_check().await, ConnectionState::Connected);
        assert_eq!(f.manager.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn injected_failure_disconnects_immediately() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        local.set("eth_accounts", Err(ProviderRpcError::disconnected("gone")));
        assert_eq!(f.manager.health_check().await, ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_accounts_while_connected_is_degraded() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        local.set("eth_accounts", Ok(json!([])));
        assert_eq!(f.manager.health_check().await, ConnectionState::Degraded);
        assert!(f.manager.provider().is_some());
        assert!(matches!(f.manager.signer(), Err(ConnectError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn connect_while_degraded_prompts_for_accounts() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();
        let held = f.manager.provider().unwrap().id();

        local.set("eth_accounts", Ok(json!([])));
        assert_eq!(f.manager.health_check().await, ConnectionState::Degraded);

        local.set("eth_requestAccounts", Ok(json!([account(5)])));
        assert_eq!(f.manager.connect().await, Ok(Provenance::Injected));
        assert_eq!(local.calls("eth_requestAccounts"), 1);
        assert_eq!(f.manager.state(), ConnectionState::Connected);
        assert_eq!(f.manager.provider().unwrap().id(), held);
        assert_eq!(f.manager.signer().unwrap().address, account(5));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_reauthorization_keeps_degraded_handle() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        local.set("eth_accounts", Ok(json!([])));
        f.manager.health_check().await;
        local.set(
            "eth_requestAccounts",
            Err(ProviderRpcError::new(4001, "User rejected the request.")),
        );
        assert_eq!(f.manager.connect().await, Err(ConnectError::UserRejected));
        assert_eq!(f.notices.take(), vec![Notice::UserRejected]);
        assert_eq!(f.manager.state(), ConnectionState::Degraded);
        assert!(f.manager.provider().is_some());
        assert_eq!(f.manager.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_origin_never_prompts_on_held_handle() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();

        local.set("eth_accounts", Ok(json!([])));
        f.manager.health_check().await;
        assert_eq!(f.manager.attempt(Origin::Restore).await, Ok(Provenance::Injected));
        assert_eq!(local.calls("eth_requestAccounts"), 0);
        assert_eq!(f.manager.state(), ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_runs_until_cancelled() {
        let local = MockProvider::healthy(&[account(1)]);
        let f = fixture(vec![injected(&local)], PersistedState::default());
        f.manager.connect().await.unwrap();
        let before = local.calls("eth_accounts");

        let cancel = CancellationToken::new();
        let manager = f.manager.clone();
        let monitor = tokio::spawn({
            let cancel = cancel.clone();
            async move { manager.run_monitor(cancel).await }
        });
        tokio::time::sleep(Duration::from_secs(31)).await;
        cancel.cancel();
        monitor.await.unwrap();
        assert_eq!(local.calls("eth_accounts") - before, 2);
    }
}
