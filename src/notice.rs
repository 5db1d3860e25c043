//! User-facing notices.
//!
//! Anything that affects the shared connection state is surfaced to the
//! user exactly once, as a [`Notice`] delivered to the [`NoticeSink`].
//! The sink decides how to render it.

use std::time::Duration;

use crate::network::NetworkDescriptor;

/// Something the user should be told, with the action they can take.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// An action needs a wallet and none is connected.
    PleaseConnect,
    /// No wallet could be located at all.
    NoProvider,
    /// The user declined a wallet prompt.
    UserRejected,
    /// The remote wallet session is gone; offer an explicit reconnect.
    SessionExpired,
    /// The relay could not be reached; offer the local wallet or a retry.
    RelayUnreachable { host: String },
    /// Automatic attempts are paused; a manual reconnect still works.
    CooldownLocked { remaining: Duration },
    /// A connect attempt failed for another reason.
    ConnectFailed { reason: String },
    /// Switching to a network failed.
    SwitchFailed {
        network: &'static str,
        reason: String,
    },
}

impl Notice {
    pub fn switch_failed(network: &NetworkDescriptor, reason: impl Into<String>) -> Self {
        Self::SwitchFailed {
            network: network.name,
            reason: reason.into(),
        }
    }

    /// Human-readable text.
    pub fn message(&self) -> String {
        match self {
            Self::PleaseConnect => "Connect a wallet first.".into(),
            Self::NoProvider => {
                "No wallet found. Start a local wallet or pair a remote one.".into()
            }
            Self::UserRejected => "The request was rejected in the wallet.".into(),
            Self::SessionExpired => {
                "The remote wallet session expired. Reconnect to pair again.".into()
            }
            Self::RelayUnreachable { host } => format!(
                "Relay {host} is unreachable. Use the local wallet instead, or retry."
            ),
            Self::CooldownLocked { remaining } => format!(
                "Too many failed attempts. Automatic reconnect paused for {}s; reconnect manually to override.",
                remaining.as_secs()
            ),
            Self::ConnectFailed { reason } => format!("Wallet connection failed: {reason}"),
            Self::SwitchFailed { network, reason } => {
                format!("Could not switch to {network}: {reason}")
            }
        }
    }
}

/// Receives notices for display.
pub trait NoticeSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Logs notices and prints them to stderr.
#[derive(Debug, Default)]
pub struct ConsoleNotices;

impl NoticeSink for ConsoleNotices {
    fn notify(&self, notice: Notice) {
        tracing::info!(?notice, "notice");
        eprintln!("gmlink: {}", notice.message());
    }
}

/// Collects notices, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingNotices {
    notices: std::sync::Mutex<Vec<Notice>>,
}

#[cfg(test)]
impl RecordingNotices {
    pub fn take(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock().unwrap())
    }
}

#[cfg(test)]
impl NoticeSink for RecordingNotices {
    fn notify(&self, notice: Notice) {
        self.notices.lock().unwrap().push(notice);
    }
}
