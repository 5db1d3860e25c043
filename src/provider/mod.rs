//! Provider abstraction: the EIP-1193 capability surface.
//!
//! Every concrete wallet source (a local IPC wallet, a remote wallet
//! bridge, a test double) is adapted once, at discovery time, into an
//! [`Eip1193`] trait object. The rest of the crate only sees the trait
//! and the [`ProviderHandle`] that wraps it.

pub mod codec;
pub mod ipc;
#[cfg(test)]
pub mod mock;
pub mod probe;
pub mod registry;
pub mod relay;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use alloy_primitives::Address;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;

use crate::error::ProviderRpcError;
use crate::network;

/// Arguments of an EIP-1193 `request` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestArguments {
    pub method: String,
    pub params: Value,
}

impl RequestArguments {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    /// A request without params.
    pub fn bare(method: impl Into<String>) -> Self {
        Self::new(method, json!([]))
    }
}

/// Lifecycle events a provider may emit.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
    Disconnect(ProviderRpcError),
}

impl ProviderEvent {
    /// Map an event notification (`method` + `params`) into an event.
    ///
    /// Unknown methods and unparsable params yield `None`.
    pub fn from_notification(method: &str, params: &Value) -> Option<Self> {
        let first = match params {
            Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
            other => other.clone(),
        };
        match method {
            "accountsChanged" => serde_json::from_value(first).ok().map(Self::AccountsChanged),
            "chainChanged" => first
                .as_str()
                .and_then(network::parse_chain_id)
                .or_else(|| first.as_u64())
                .map(Self::ChainChanged),
            "disconnect" => {
                let err = serde_json::from_value(first)
                    .unwrap_or_else(|_| ProviderRpcError::disconnected("provider disconnected"));
                Some(Self::Disconnect(err))
            }
            _ => None,
        }
    }
}

/// The EIP-1193 surface every provider source is adapted into.
pub trait Eip1193: Send + Sync {
    /// Submit a JSON-RPC request to the wallet.
    fn request(&self, args: RequestArguments) -> BoxFuture<'_, Result<Value, ProviderRpcError>>;

    /// Subscribe to lifecycle events. Providers that never emit events
    /// return `None`.
    fn subscribe(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        None
    }

    /// Whether a remote session object still exists. `None` for
    /// providers without a session concept (injected wallets).
    fn session_alive(&self) -> Option<bool> {
        None
    }

    /// Tear down the provider's session, if it has one.
    fn close(&self) -> BoxFuture<'_, Result<(), ProviderRpcError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Where a provider came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// A wallet available locally, with no relay in between.
    Injected,
    /// A wallet reached through a pairing relay.
    Remote,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Injected => f.write_str("injected"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Unique identifier for a provider handle.
///
/// Monotonically increasing. Used to recognise stale completions and
/// events from providers that are no longer the active one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct HandleId(u64);

impl HandleId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A provider plus its provenance. Cheap to clone; clones share the
/// underlying provider and the id.
#[derive(Clone)]
pub struct ProviderHandle {
    id: HandleId,
    provenance: Provenance,
    provider: Arc<dyn Eip1193>,
}

impl ProviderHandle {
    pub fn new(provenance: Provenance, provider: Arc<dyn Eip1193>) -> Self {
        Self {
            id: HandleId::new(),
            provenance,
            provider,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn provenance(&self) -> Provenance {
        self.provenance
    }

    pub fn provider(&self) -> &dyn Eip1193 {
        &*self.provider
    }

    pub async fn request(&self, args: RequestArguments) -> Result<Value, ProviderRpcError> {
        self.provider.request(args).await
    }

    /// Read-only account listing (`eth_accounts`). Never prompts.
    pub async fn accounts(&self) -> Result<Vec<Address>, ProviderRpcError> {
        let value = self.request(RequestArguments::bare("eth_accounts")).await?;
        parse_accounts(value)
    }

    /// Prompting account request (`eth_requestAccounts`).
    pub async fn request_accounts(&self) -> Result<Vec<Address>, ProviderRpcError> {
        let value = self
            .request(RequestArguments::bare("eth_requestAccounts"))
            .await?;
        parse_accounts(value)
    }

    pub async fn chain_id(&self) -> Result<u64, ProviderRpcError> {
        let value = self.request(RequestArguments::bare("eth_chainId")).await?;
        value
            .as_str()
            .and_then(network::parse_chain_id)
            .or_else(|| value.as_u64())
            .ok_or_else(|| {
                ProviderRpcError::new(
                    crate::error::codes::INTERNAL,
                    format!("invalid eth_chainId result: {value}"),
                )
            })
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("provenance", &self.provenance)
            .finish_non_exhaustive()
    }
}

fn parse_accounts(value: Value) -> Result<Vec<Address>, ProviderRpcError> {
    serde_json::from_value(value).map_err(|e| {
        ProviderRpcError::new(
            crate::error::codes::INTERNAL,
            format!("invalid account list: {e}"),
        )
    })
}
