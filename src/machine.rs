//! Connection state machine: the single source of truth for "are we
//! connected, and to what".
//!
//! All methods are pure state transitions with no I/O. Transitions that
//! need side effects (persisting the session record, attaching event
//! listeners, telling the user about a lockout) return [`Effect`]s for
//! the caller to carry out after the transition is committed.
//!
//! Concurrency is optimistic: an async operation snapshots what it
//! needs, does its slow work without holding the machine, and then
//! commits with a [`ConnectTicket`] or the [`HandleId`] it worked on.
//! If the machine moved on in the meantime the commit is refused with
//! [`Stale`] and the late result is discarded.
//!
//! Invariant: the state is `Connected` or `Degraded` exactly when an
//! active handle is held.

use std::time::Duration;

use alloy_primitives::Address;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::ConnectError;
use crate::provider::{HandleId, ProviderHandle};
use crate::retry::{CircuitBreaker, Cooldown, RetryConfig};

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the provider is failing health checks. The handle
    /// is kept so a transient blip can heal.
    Degraded,
    /// Extended cooldown engaged; automatic attempts are refused.
    CooldownLocked,
}

/// The connection currently held.
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    pub handle: ProviderHandle,
    pub accounts: Vec<Address>,
    pub chain_id: Option<u64>,
    pub since: Instant,
}

/// Permission to complete one connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectTicket {
    generation: u64,
    pub user_initiated: bool,
}

/// Why a connect attempt may not start.
#[derive(Debug, Clone, PartialEq)]
pub enum Refusal {
    AlreadyConnected(HandleId),
    CircuitOpen { remaining: Duration },
}

/// A commit arrived for an attempt or handle that is no longer current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stale;

/// The most recent failure, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub cause: ConnectError,
    pub at: Instant,
}

/// Side effects produced by a transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Entered `Connected` with this handle: persist the session record
    /// and attach event listeners.
    Attach(ProviderHandle),
    /// The handle is no longer active: detach listeners and drop it.
    Release(ProviderHandle),
    /// Entered `CooldownLocked`.
    Locked { remaining: Duration },
}

#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    active: Option<ActiveConnection>,
    /// Bumped by every transition that invalidates in-flight attempts.
    generation: u64,
    breaker: CircuitBreaker,
    last_failure: Option<FailureRecord>,
}

impl ConnectionStateMachine {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            active: None,
            generation: 0,
            breaker: CircuitBreaker::new(retry),
            last_failure: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn active(&self) -> Option<&ActiveConnection> {
        self.active.as_ref()
    }

    pub fn active_handle(&self) -> Option<&ProviderHandle> {
        self.active.as_ref().map(|a| &a.handle)
    }

    pub fn is_active(&self, id: HandleId) -> bool {
        self.active_handle().is_some_and(|h| h.id() == id)
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn last_failure(&self) -> Option<&FailureRecord> {
        self.last_failure.as_ref()
    }

    /// Leave `CooldownLocked` once the cooldown has elapsed.
    pub fn tick(&mut self, now: Instant) {
        if self.state == ConnectionState::CooldownLocked && !self.breaker.is_locked(now) {
            tracing::info!("cooldown elapsed");
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Start a connect attempt, subject to the circuit breaker.
    ///
    /// A newer attempt supersedes an older one still in flight: the
    /// older ticket becomes stale.
    pub fn begin_connect(
        &mut self,
        now: Instant,
        user_initiated: bool,
    ) -> Result<ConnectTicket, Refusal> {
        self.tick(now);
        if let Some(handle) = self.active_handle() {
            return Err(Refusal::AlreadyConnected(handle.id()));
        }
        if !self.breaker.should_attempt(now, user_initiated) {
            let remaining = self.breaker.remaining(now).unwrap_or_default();
            tracing::debug!(remaining_secs = remaining.as_secs(), "automatic attempt refused");
            return Err(Refusal::CircuitOpen { remaining });
        }
        if user_initiated && self.state == ConnectionState::CooldownLocked {
            tracing::info!("manual override of cooldown");
        }
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        Ok(ConnectTicket {
            generation: self.generation,
            user_initiated,
        })
    }

    /// Commit a successful attempt.
    pub fn complete_connect(
        &mut self,
        ticket: ConnectTicket,
        handle: ProviderHandle,
        accounts: Vec<Address>,
        now: Instant,
    ) -> Result<Vec<Effect>, Stale> {
        self.check_ticket(ticket)?;
        let mut effects = Vec::new();
        if let Some(old) = self.active.take() {
            effects.push(Effect::Release(old.handle));
        }
        tracing::info!(
            handle = %handle.id(),
            provenance = %handle.provenance(),
            accounts = accounts.len(),
            "connected"
        );
        self.breaker.record_success();
        self.generation += 1;
        self.state = ConnectionState::Connected;
        self.active = Some(ActiveConnection {
            handle: handle.clone(),
            accounts,
            chain_id: None,
            since: now,
        });
        effects.push(Effect::Attach(handle));
        self.debug_check();
        Ok(effects)
    }

    /// Commit a failed attempt. `counts` says whether the failure feeds
    /// the circuit breaker (an unusable provider was detected).
    pub fn fail_connect(
        &mut self,
        ticket: ConnectTicket,
        cause: ConnectError,
        counts: bool,
        now: Instant,
    ) -> Result<Vec<Effect>, Stale> {
        self.check_ticket(ticket)?;
        tracing::info!(cause = %cause, counts, "connect attempt failed");
        self.generation += 1;
        self.state = self.idle_state(now);
        Ok(self.record_failure(cause, counts, now))
    }

    /// The active handle stopped being usable, the wallet disconnected,
    /// or it reported no accounts. `cause` is `Some` for a failed health
    /// probe, which feeds the circuit breaker.
    pub fn drop_active(
        &mut self,
        id: HandleId,
        cause: Option<ConnectError>,
        now: Instant,
    ) -> Result<Vec<Effect>, Stale> {
        if !self.is_active(id) {
            return Err(Stale);
        }
        let mut effects = Vec::new();
        if let Some(old) = self.active.take() {
            effects.push(Effect::Release(old.handle));
        }
        tracing::info!(handle = %id, cause = ?cause.as_ref().map(ConnectError::kind), "disconnected");
        self.generation += 1;
        self.state = self.idle_state(now);
        if let Some(cause) = cause {
            effects.extend(self.record_failure(cause, true, now));
        }
        self.debug_check();
        Ok(effects)
    }

    /// Explicit user disconnect. Releases the active handle if any and
    /// makes any in-flight attempt stale.
    pub fn user_disconnect(&mut self, now: Instant) -> Vec<Effect> {
        let effects: Vec<Effect> = self
            .active
            .take()
            .map(|a| Effect::Release(a.handle))
            .into_iter()
            .collect();
        self.generation += 1;
        self.state = self.idle_state(now);
        tracing::info!(released = !effects.is_empty(), "user disconnected");
        self.debug_check();
        effects
    }

    /// `Connected` → `Degraded`. The handle is kept.
    pub fn mark_degraded(&mut self, id: HandleId, cause: Option<ConnectError>, now: Instant) -> Result<(), Stale> {
        if !self.is_active(id) {
            return Err(Stale);
        }
        if self.state == ConnectionState::Connected {
            tracing::warn!(handle = %id, cause = ?cause.as_ref().map(ConnectError::kind), "connection degraded");
            self.state = ConnectionState::Degraded;
        }
        if let Some(cause) = cause {
            self.last_failure = Some(FailureRecord { cause, at: now });
        }
        Ok(())
    }

    /// A health probe answered with no accounts: the wallet is locked or
    /// withdrew access. The handle is kept, its accounts are not.
    pub fn accounts_withdrawn(&mut self, id: HandleId, now: Instant) -> Result<(), Stale> {
        self.mark_degraded(id, None, now)?;
        self.active_mut(id)?.accounts.clear();
        Ok(())
    }

    /// A health probe answered with accounts: `Degraded` → `Connected`.
    pub fn mark_healthy(&mut self, id: HandleId, accounts: Vec<Address>) -> Result<(), Stale> {
        let active = self.active_mut(id)?;
        active.accounts = accounts;
        if self.state == ConnectionState::Degraded {
            tracing::info!(handle = %id, "connection recovered");
            self.state = ConnectionState::Connected;
        }
        Ok(())
    }

    /// Wallet reported a new account set. An empty set disconnects.
    pub fn accounts_changed(
        &mut self,
        id: HandleId,
        accounts: Vec<Address>,
        now: Instant,
    ) -> Result<Vec<Effect>, Stale> {
        if accounts.is_empty() {
            return self.drop_active(id, None, now);
        }
        self.mark_healthy(id, accounts)?;
        Ok(Vec::new())
    }

    pub fn chain_changed(&mut self, id: HandleId, chain_id: u64) -> Result<(), Stale> {
        let active = self.active_mut(id)?;
        if active.chain_id != Some(chain_id) {
            tracing::info!(handle = %id, chain_id = %format!("{chain_id:#x}"), "chain changed");
            active.chain_id = Some(chain_id);
        }
        Ok(())
    }

    fn active_mut(&mut self, id: HandleId) -> Result<&mut ActiveConnection, Stale> {
        self.active
            .as_mut()
            .filter(|a| a.handle.id() == id)
            .ok_or(Stale)
    }

    /// State to settle in when no handle is held. The extended lockout
    /// outlasts any attempt made under a manual override.
    fn idle_state(&self, now: Instant) -> ConnectionState {
        if self.breaker.is_extended(now) {
            ConnectionState::CooldownLocked
        } else {
            ConnectionState::Disconnected
        }
    }

    fn check_ticket(&self, ticket: ConnectTicket) -> Result<(), Stale> {
        if ticket.generation == self.generation && self.state == ConnectionState::Connecting {
            Ok(())
        } else {
            tracing::debug!(
                ticket = ticket.generation,
                current = self.generation,
                state = ?self.state,
                "discarding stale attempt"
            );
            Err(Stale)
        }
    }

    fn record_failure(&mut self, cause: ConnectError, counts: bool, now: Instant) -> Vec<Effect> {
        self.last_failure = Some(FailureRecord { cause, at: now });
        if !counts {
            return Vec::new();
        }
        match self.breaker.record_failure(now) {
            Some(Cooldown::Extended) if self.active.is_none() => {
                let remaining = self.breaker.remaining(now).unwrap_or_default();
                tracing::warn!(
                    consecutive = self.breaker.counter().consecutive,
                    remaining_secs = remaining.as_secs(),
                    "cooldown locked"
                );
                self.state = ConnectionState::CooldownLocked;
                vec![Effect::Locked { remaining }]
            }
            _ => Vec::new(),
        }
    }

    fn debug_check(&self) {
        debug_assert_eq!(
            matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Degraded
            ),
            self.active.is_some(),
            "state {:?} inconsistent with active handle",
            self.state
        );
    }
}
