//! Error taxonomy.
//!
//! Raw provider failures arrive as [`ProviderRpcError`] (the EIP-1193
//! `{code, message, data}` shape). They are classified exactly once, at
//! the boundary where they are first observed, into an [`ErrorClass`]
//! and from there into a typed [`ConnectError`]. Nothing past the
//! boundary looks at message text again.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// EIP-1193 / EIP-1474 error codes the connection manager reacts to.
pub mod codes {
    pub const USER_REJECTED: i64 = 4001;
    pub const DISCONNECTED: i64 = 4900;
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    pub const UNRECOGNIZED_CHAIN: i64 = 4902;
    pub const INTERNAL: i64 = -32603;
}

/// An error returned by a provider's `request`, or synthesized by a
/// transport on its behalf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProviderRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// The transport to the wallet is gone.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(codes::DISCONNECTED, message)
    }

    /// Classify this error. Codes win over message text; message text is
    /// only consulted for the two classes wallets report without a code.
    pub fn class(&self) -> ErrorClass {
        match self.code {
            codes::USER_REJECTED => return ErrorClass::UserRejected,
            codes::UNRECOGNIZED_CHAIN => return ErrorClass::ChainUnknown,
            codes::DISCONNECTED | codes::CHAIN_DISCONNECTED => return ErrorClass::Disconnected,
            _ => {}
        }
        if SESSION_EXPIRED.is_match(&self.message) {
            ErrorClass::SessionExpired
        } else if NOT_READY.is_match(&self.message) {
            ErrorClass::NotReady
        } else {
            ErrorClass::Other
        }
    }
}

static NOT_READY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)not (yet )?initiali[sz]ed|provider (is )?not ready|no provider|still loading")
        .expect("static regex")
});

static SESSION_EXPIRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)session (topic )?(doesn't|does not) exist|session (has )?expired|no matching key|record was recently deleted",
    )
    .expect("static regex")
});

/// Coarse classification of a [`ProviderRpcError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    UserRejected,
    /// Provider object exists but has not finished initializing.
    NotReady,
    /// Remote session topic is no longer valid.
    SessionExpired,
    ChainUnknown,
    Disconnected,
    Other,
}

/// Typed failures surfaced by the connection manager.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectError {
    #[error("request rejected in wallet")]
    UserRejected,
    #[error("provider not ready: {0}")]
    ProviderNotReady(String),
    #[error("remote wallet session expired")]
    SessionExpired,
    #[error("relay {host} unreachable: {reason}")]
    RelayUnreachable { host: String, reason: String },
    #[error("chain {chain_id:#x} unknown to wallet")]
    ChainUnknown { chain_id: u64 },
    #[error("too many failed attempts, retry in {}s", remaining.as_secs())]
    CircuitOpen { remaining: Duration },
    #[error("no wallet provider found")]
    NoProvider,
    #[error("no wallet connected")]
    NotConnected,
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("provider error {code}: {message}")]
    Provider { code: i64, message: String },
}

impl ConnectError {
    /// Stable machine-readable name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserRejected => "user_rejected",
            Self::ProviderNotReady(_) => "provider_not_ready",
            Self::SessionExpired => "session_expired",
            Self::RelayUnreachable { .. } => "relay_unreachable",
            Self::ChainUnknown { .. } => "chain_unknown",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoProvider => "no_provider",
            Self::NotConnected => "not_connected",
            Self::Timeout(_) => "timeout",
            Self::Provider { .. } => "provider",
        }
    }
}

impl From<ProviderRpcError> for ConnectError {
    fn from(err: ProviderRpcError) -> Self {
        match err.class() {
            ErrorClass::UserRejected => Self::UserRejected,
            ErrorClass::NotReady => Self::ProviderNotReady(err.message),
            ErrorClass::SessionExpired => Self::SessionExpired,
            ErrorClass::ChainUnknown | ErrorClass::Disconnected | ErrorClass::Other => {
                Self::Provider {
                    code: err.code,
                    message: err.message,
                }
            }
        }
    }
}
