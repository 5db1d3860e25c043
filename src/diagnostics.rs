//! Diagnostics snapshot.
//!
//! Read-only view for support and debugging. Nothing reads a snapshot
//! back into control flow.

use alloy_primitives::Address;
use serde::Serialize;
use tokio::time::Instant;

use crate::machine::{ConnectionState, ConnectionStateMachine};
use crate::network;
use crate::provider::{HandleId, Provenance};
use crate::session::{PersistedState, SessionRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub provenance: Option<Provenance>,
    pub handle: Option<HandleId>,
    pub accounts: Vec<Address>,
    pub chain_id: Option<u64>,
    /// Slug of the known network matching `chain_id`, if any.
    pub network: Option<&'static str>,
    pub connected_for_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_failure: Option<FailureSnapshot>,
    pub cooldown_remaining_ms: Option<u64>,
    pub explicitly_disconnected: bool,
    pub session: Option<SessionRecord>,
    pub event_listeners: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSnapshot {
    pub kind: &'static str,
    pub message: String,
    pub ago_ms: u64,
}

impl Snapshot {
    pub fn capture(
        machine: &ConnectionStateMachine,
        persisted: &PersistedState,
        event_listeners: usize,
        now: Instant,
    ) -> Self {
        let active = machine.active();
        let chain_id = active.and_then(|a| a.chain_id);
        Self {
            state: machine.state(),
            provenance: active.map(|a| a.handle.provenance()),
            handle: active.map(|a| a.handle.id()),
            accounts: active.map(|a| a.accounts.clone()).unwrap_or_default(),
            chain_id,
            network: chain_id.and_then(network::by_chain_id).map(|n| n.slug),
            connected_for_ms: active.map(|a| millis(now.duration_since(a.since))),
            consecutive_failures: machine.breaker().counter().consecutive,
            last_failure: machine.last_failure().map(|f| FailureSnapshot {
                kind: f.cause.kind(),
                message: f.cause.to_string(),
                ago_ms: millis(now.duration_since(f.at)),
            }),
            cooldown_remaining_ms: machine.breaker().remaining(now).map(millis),
            explicitly_disconnected: persisted.explicitly_disconnected,
            session: persisted.session.clone(),
            event_listeners,
        }
    }

    pub fn to_json_pretty(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\":\"{e}\"}}"))
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
