//! Event bridge: provider lifecycle events into the state machine.
//!
//! For each attached handle a listener task drains the provider's event
//! subscription and forwards account, chain and disconnect events,
//! tagged with the handle id, to the manager's event channel. The
//! manager decides whether the handle is still the active one.
//!
//! Chain-change events pass through a [`ChainGate`]: switching networks
//! can make a wallet re-announce the chain, and reacting to that can
//! trigger another switch. The gate enforces a minimum interval between
//! processed chain changes and a hard cap per rolling window. Events it
//! refuses are not queued: only the newest refused chain id is held and
//! delivered once the gate reopens, so a burst settles on the chain the
//! wallet ended on.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::provider::{HandleId, ProviderEvent, ProviderHandle};

/// Chain-change rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainGateConfig {
    /// Minimum spacing between processed chain changes.
    pub min_interval: Duration,
    pub window: Duration,
    /// Maximum processed chain changes per `window`.
    pub cap: usize,
}

impl Default for ChainGateConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            window: Duration::from_secs(10),
            cap: 5,
        }
    }
}

/// Debounce plus sliding-window cap.
#[derive(Debug)]
pub struct ChainGate {
    config: ChainGateConfig,
    /// Admission times within the current window, oldest first.
    admitted: VecDeque<Instant>,
}

impl ChainGate {
    pub fn new(config: ChainGateConfig) -> Self {
        Self {
            config,
            admitted: VecDeque::with_capacity(config.cap),
        }
    }

    /// Whether an event arriving at `now` may be processed.
    pub fn admit(&mut self, now: Instant) -> bool {
        while self
            .admitted
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.config.window)
        {
            self.admitted.pop_front();
        }
        if let Some(last) = self.admitted.back() {
            if now.duration_since(*last) < self.config.min_interval {
                return false;
            }
        }
        if self.admitted.len() >= self.config.cap {
            return false;
        }
        self.admitted.push_back(now);
        true
    }

    /// Earliest instant at or after `now` when [`admit`](Self::admit)
    /// can succeed.
    pub fn next_admission(&self, now: Instant) -> Instant {
        let mut at = now;
        if let Some(last) = self.admitted.back() {
            at = at.max(*last + self.config.min_interval);
        }
        if self.admitted.len() >= self.config.cap {
            if let Some(first) = self.admitted.front() {
                at = at.max(*first + self.config.window);
            }
        }
        at
    }
}

/// An event from a specific handle.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgedEvent {
    pub handle: HandleId,
    pub event: ProviderEvent,
}

/// Owns one listener task per attached handle.
#[derive(Debug)]
pub struct EventBridge {
    tx: mpsc::UnboundedSender<BridgedEvent>,
    gate: ChainGateConfig,
    listeners: Mutex<HashMap<HandleId, JoinHandle<()>>>,
}

impl EventBridge {
    pub fn new(tx: mpsc::UnboundedSender<BridgedEvent>, gate: ChainGateConfig) -> Self {
        Self {
            tx,
            gate,
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Start forwarding events from `handle`. Re-attaching a handle
    /// replaces its listener.
    pub fn attach(&self, handle: &ProviderHandle) {
        let id = handle.id();
        let Some(rx) = handle.provider().subscribe() else {
            tracing::debug!(handle = %id, "provider emits no events");
            return;
        };
        let task = tokio::spawn(listen(id, rx, self.tx.clone(), ChainGate::new(self.gate)));
        let previous = self
            .listeners
            .lock()
            .ok()
            .and_then(|mut map| map.insert(id, task));
        if let Some(previous) = previous {
            previous.abort();
        }
        tracing::debug!(handle = %id, "event listener attached");
    }

    /// Stop forwarding events from the handle.
    pub fn detach(&self, id: HandleId) {
        let task = self.listeners.lock().ok().and_then(|mut map| map.remove(&id));
        if let Some(task) = task {
            task.abort();
            tracing::debug!(handle = %id, "event listener detached");
        }
    }

    /// Number of live listeners.
    pub fn attached(&self) -> usize {
        self.listeners
            .lock()
            .map(|mut map| {
                map.retain(|_, task| !task.is_finished());
                map.len()
            })
            .unwrap_or(0)
    }
}

impl Drop for EventBridge {
    fn drop(&mut self) {
        if let Ok(map) = self.listeners.get_mut() {
            for (_, task) in map.drain() {
                task.abort();
            }
        }
    }
}

async fn listen(
    id: HandleId,
    mut rx: broadcast::Receiver<ProviderEvent>,
    tx: mpsc::UnboundedSender<BridgedEvent>,
    mut gate: ChainGate,
) {
    let forward = |event: ProviderEvent| tx.send(BridgedEvent { handle: id, event }).is_ok();
    // Newest chain id the gate refused, awaiting the next admission.
    let mut held: Option<u64> = None;

    loop {
        let reopens = held.map(|_| gate.next_admission(Instant::now()));
        let event = tokio::select! {
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(handle = %id, skipped, "event listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            () = tokio::time::sleep_until(reopens.unwrap_or_else(Instant::now)), if reopens.is_some() => {
                if let Some(chain_id) = held.take() {
                    if !gate.admit(Instant::now()) {
                        held = Some(chain_id);
                    } else if !forward(ProviderEvent::ChainChanged(chain_id)) {
                        break;
                    }
                }
                continue;
            }
        };
        if let ProviderEvent::ChainChanged(chain_id) = event {
            if !gate.admit(Instant::now()) {
                tracing::debug!(handle = %id, chain_id, "chain change deferred by rate limit");
                held = Some(chain_id);
                continue;
            }
            held = None;
        }
        if !forward(event) {
            break;
        }
    }
    tracing::debug!(handle = %id, "event listener finished");
}
