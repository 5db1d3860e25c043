//! Scripted in-memory provider and source for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::Address;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio::sync::broadcast;

use super::registry::ProviderSource;
use super::{Eip1193, Provenance, ProviderEvent, RequestArguments};
use crate::error::ProviderRpcError;

pub type Reply = Result<Value, ProviderRpcError>;

pub fn account(n: u8) -> Address {
    Address::with_last_byte(n)
}

/// A provider whose answers are scripted per method.
///
/// Queued one-shot replies (`push`) are consumed first; after that the
/// per-method default (`set`) applies. Unscripted methods answer with
/// `4200 unsupported method`.
pub struct MockProvider {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<RequestArguments>>,
    events: broadcast::Sender<ProviderEvent>,
    session: Mutex<Option<bool>>,
    delay: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            queued: Mutex::new(HashMap::new()),
            defaults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            events,
            session: Mutex::new(None),
            delay: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// A wallet that answers account and chain queries.
    pub fn healthy(accounts: &[Address]) -> Arc<Self> {
        let mock = Self::new();
        mock.set("eth_accounts", Ok(json!(accounts)));
        mock.set("eth_requestAccounts", Ok(json!(accounts)));
        mock.set("eth_chainId", Ok(json!("0xaa36a7")));
        mock
    }

    pub fn set(&self, method: &str, reply: Reply) {
        self.defaults
            .lock()
            .unwrap()
            .insert(method.to_string(), reply);
    }

    pub fn push(&self, method: &str, reply: Reply) {
        self.queued
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn set_session(&self, alive: Option<bool>) {
        *self.session.lock().unwrap() = alive;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn emit(&self, event: ProviderEvent) {
        let _ = self.events.send(event);
    }

    pub fn receivers(&self) -> usize {
        self.events.receiver_count()
    }

    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.method == method)
            .count()
    }

    pub fn methods(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.method.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn next_reply(&self, method: &str) -> Reply {
        if let Some(reply) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(VecDeque::pop_front)
        {
            return reply;
        }
        self.defaults
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_else(|| Err(ProviderRpcError::new(4200, "unsupported method")))
    }
}

impl Eip1193 for MockProvider {
    fn request(&self, args: RequestArguments) -> BoxFuture<'_, Result<Value, ProviderRpcError>> {
        Box::pin(async move {
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self.next_reply(&args.method);
            self.calls.lock().unwrap().push(args);
            reply
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        Some(self.events.subscribe())
    }

    fn session_alive(&self) -> Option<bool> {
        *self.session.lock().unwrap()
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ProviderRpcError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// A source that hands out a fixed provider, or nothing.
pub struct MockSource {
    name: &'static str,
    provenance: Provenance,
    provider: Mutex<Option<Arc<MockProvider>>>,
    relay: Option<String>,
    locates: AtomicUsize,
    resets: AtomicUsize,
}

impl MockSource {
    pub fn new(
        name: &'static str,
        provenance: Provenance,
        provider: Option<Arc<MockProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            provenance,
            provider: Mutex::new(provider),
            relay: None,
            locates: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        })
    }

    /// A remote source whose relay host is checked before use.
    pub fn remote(provider: Option<Arc<MockProvider>>, relay: &str) -> Arc<Self> {
        Arc::new(Self {
            name: "remote",
            provenance: Provenance::Remote,
            provider: Mutex::new(provider),
            relay: Some(relay.to_string()),
            locates: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
        })
    }

    pub fn replace(&self, provider: Option<Arc<MockProvider>>) {
        *self.provider.lock().unwrap() = provider;
    }

    pub fn locates(&self) -> usize {
        self.locates.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

impl ProviderSource for MockSource {
    fn name(&self) -> &str {
        self.name
    }

    fn provenance(&self) -> Provenance {
        self.provenance
    }

    fn relay_host(&self) -> Option<&str> {
        self.relay.as_deref()
    }

    fn locate(&self) -> BoxFuture<'_, Option<Arc<dyn Eip1193>>> {
        Box::pin(async move {
            self.locates.fetch_add(1, Ordering::SeqCst);
            let provider = self.provider.lock().unwrap().clone();
            provider.map(|p| p as Arc<dyn Eip1193>)
        })
    }

    fn reset(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.resets.fetch_add(1, Ordering::SeqCst);
        })
    }
}
